//! Storage engine seam.
//!
//! The engine is reached only through "run this statement" and "run this
//! query and hand back rows". Rows come back as positional JSON values and are
//! scanned into caller-declared tuples or structs in column order.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::model::Arg;

/// One result row, columns in select-list order.
pub type Row = Vec<Value>;

/// Per-call execution context: an optional deadline plus a cancellation token.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    /// Runs a statement that returns no rows.
    async fn execute(&self, ctx: &QueryContext, query: &str, args: &[Arg]) -> Result<(), StoreError>;

    /// Runs a query and returns every row.
    async fn query(&self, ctx: &QueryContext, query: &str, args: &[Arg])
        -> Result<Vec<Row>, StoreError>;
}

/// Byte offsets of the positional `?` placeholders in `query`.
///
/// Question marks inside single-quoted literals, double-quoted or
/// backtick-quoted identifiers are not placeholders.
pub fn placeholder_offsets(query: &str) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut quote: Option<u8> = None;
    let mut escaped = false;
    for (i, b) in query.bytes().enumerate() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' | b'`' => quote = Some(b),
                b'?' => offsets.push(i),
                _ => {}
            },
        }
    }
    offsets
}

/// Decodes one row into `T`, matching columns to fields by position.
pub fn scan<T: DeserializeOwned>(row: Row) -> Result<T, StoreError> {
    Ok(serde_json::from_value(Value::Array(row))?)
}

/// Runs `query` and scans every row into `T`.
pub async fn select<T: DeserializeOwned>(
    store: &dyn Store,
    ctx: &QueryContext,
    query: &str,
    args: &[Arg],
) -> Result<Vec<T>, StoreError> {
    store.query(ctx, query, args).await?.into_iter().map(scan).collect()
}

/// Runs `query` and scans the first row, if any.
pub async fn select_one<T: DeserializeOwned>(
    store: &dyn Store,
    ctx: &QueryContext,
    query: &str,
    args: &[Arg],
) -> Result<Option<T>, StoreError> {
    match store.query(ctx, query, args).await?.into_iter().next() {
        Some(row) => scan(row).map(Some),
        None => Ok(None),
    }
}
