//! Compiles analytics filters into parameterized ClickHouse queries.
//!
//! A [`Filter`] describes the question, a [`QuerySpec`] the shape of the
//! answer; [`Compiler::compile`] turns both into a [`Fragment`] holding the
//! query text and its positional arguments.

pub mod catalog;
pub mod compiler;
pub mod error;
pub mod filter;
pub mod fragment;
pub mod funnel;
mod lower;
pub mod options;
mod plan;
mod predicates;
pub mod table;

pub use catalog::{Catalog, Field, FieldId, RenderContext, Source};
pub use compiler::{Compiler, QuerySpec};
pub use error::CompileError;
pub use filter::{Filter, ImportedWindow, PlatformFilter, Search, Sort};
pub use fragment::Fragment;
pub use funnel::FunnelStep;
pub use options::{compile_options, FilterOption};
pub use table::{decide_base_table, Table};
