//! ClickHouse storage adapter.

mod client;
pub mod params;
pub mod schema;

pub use client::ClickHouseStore;
pub use params::{bind, BoundQuery};
