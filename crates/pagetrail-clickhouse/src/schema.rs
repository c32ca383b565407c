//! Table layout the compiled queries read from.
//!
//! Sessions use a collapsing engine: a changed session is written as a `-1`
//! row cancelling the previous state plus a `+1` row with the new one.
//! Every statement is idempotent.

use pagetrail_core::{QueryContext, Store, StoreError};
use tracing::info;

const DIMENSIONS: &str = "
    hostname String,
    language LowCardinality(String),
    country_code LowCardinality(FixedString(2)),
    region LowCardinality(String),
    city LowCardinality(String),
    referrer String,
    referrer_name String,
    referrer_icon String,
    channel LowCardinality(String),
    os LowCardinality(String),
    os_version LowCardinality(String),
    browser LowCardinality(String),
    browser_version LowCardinality(String),
    desktop Int8,
    mobile Int8,
    screen_class LowCardinality(String),
    utm_source String,
    utm_medium String,
    utm_campaign String,
    utm_content String,
    utm_term String";

fn session_table() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS session (
            sign Int8,
            version UInt16,
            client_id Int64,
            visitor_id UInt64,
            session_id UInt32,
            time DateTime64(3, 'UTC'),
            start DateTime64(3, 'UTC'),
            duration_seconds UInt32,
            entry_path String,
            entry_title String,
            exit_path String,
            exit_title String,
            page_views UInt16,
            is_bounce Int8,
            {DIMENSIONS}
        ) ENGINE = VersionedCollapsingMergeTree(sign, version)
        PARTITION BY toYYYYMM(time)
        ORDER BY (client_id, toDate(time), visitor_id, session_id)
        SAMPLE BY visitor_id"
    )
}

fn page_view_table() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS page_view (
            client_id Int64,
            visitor_id UInt64,
            session_id UInt32,
            time DateTime64(3, 'UTC'),
            duration_seconds UInt32,
            path String,
            title String,
            {DIMENSIONS},
            tag_keys Array(String),
            tag_values Array(String)
        ) ENGINE = MergeTree
        PARTITION BY toYYYYMM(time)
        ORDER BY (client_id, toDate(time), visitor_id, session_id)
        SAMPLE BY visitor_id"
    )
}

fn event_table() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS event (
            client_id Int64,
            visitor_id UInt64,
            session_id UInt32,
            time DateTime64(3, 'UTC'),
            event_name String,
            event_meta_keys Array(String),
            event_meta_values Array(String),
            duration_seconds UInt32,
            path String,
            title String,
            {DIMENSIONS}
        ) ENGINE = MergeTree
        PARTITION BY toYYYYMM(time)
        ORDER BY (client_id, toDate(time), visitor_id, session_id)
        SAMPLE BY visitor_id"
    )
}

/// Pre-aggregated statistics keyed by `column`, one table per dimension.
fn imported_table(name: &str, column: Option<&str>) -> String {
    let key = column
        .map(|column| format!("{column} String,"))
        .unwrap_or_default();
    format!(
        "CREATE TABLE IF NOT EXISTS {name} (
            client_id Int64,
            date Date,
            {key}
            visitors UInt32,
            sessions UInt32,
            views UInt32,
            bounces UInt32,
            session_duration UInt32
        ) ENGINE = MergeTree
        ORDER BY (client_id, date)"
    )
}

pub fn statements() -> Vec<String> {
    vec![
        session_table(),
        page_view_table(),
        event_table(),
        imported_table("imported_visitors", None),
        imported_table("imported_page", Some("path")),
        imported_table("imported_entry_page", Some("entry_path")),
        imported_table("imported_exit_page", Some("exit_path")),
        imported_table("imported_language", Some("language")),
        imported_table("imported_country", Some("country_code")),
        imported_table("imported_city", Some("city")),
        imported_table("imported_referrer", Some("referrer")),
        imported_table("imported_device", Some("category")),
        imported_table("imported_browser", Some("browser")),
        imported_table("imported_os", Some("os")),
    ]
}

pub async fn migrate(store: &dyn Store, ctx: &QueryContext) -> Result<(), StoreError> {
    info!("Running ClickHouse schema migration");
    for statement in statements() {
        store.execute(ctx, &statement, &[]).await?;
    }
    info!("ClickHouse schema migration complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use pagetrail_core::placeholder_offsets;

    use super::*;

    #[test]
    fn statements_are_idempotent_and_unparameterized() {
        for statement in statements() {
            assert!(statement.starts_with("CREATE TABLE IF NOT EXISTS "));
            assert!(placeholder_offsets(&statement).is_empty());
        }
    }

    #[test]
    fn live_tables_support_sampling() {
        let statements = statements();
        for statement in &statements[..3] {
            assert!(statement.contains("SAMPLE BY visitor_id"));
        }
    }
}
