pub mod config;
pub mod error;
pub mod model;
pub mod store;

pub use config::ClickHouseConfig;
pub use error::StoreError;
pub use model::{Arg, CustomMetricType, Direction, Period, Platform, WeekMode};
pub use store::{placeholder_offsets, scan, select, select_one, QueryContext, Row, Store};
