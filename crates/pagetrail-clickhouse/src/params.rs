//! Positional `?` placeholders to ClickHouse query parameters.
//!
//! Every placeholder becomes `{pN:Type}` and its value travels separately as
//! `param_pN`, so argument text never becomes part of the query.

use pagetrail_core::{placeholder_offsets, Arg, StoreError};

/// A query rewritten for the HTTP interface plus its `(name, value)` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundQuery {
    pub sql: String,
    pub params: Vec<(String, String)>,
}

fn type_name(arg: &Arg) -> &'static str {
    match arg {
        Arg::Int(_) => "Int64",
        Arg::UInt(_) => "UInt64",
        Arg::Str(_) => "String",
        Arg::Date(_) => "Date",
        Arg::DateTime(_) => "DateTime('UTC')",
    }
}

/// Parameter values are parsed in the escaped text format.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out
}

fn value(arg: &Arg) -> String {
    match arg {
        Arg::Int(v) => v.to_string(),
        Arg::UInt(v) => v.to_string(),
        Arg::Str(v) => escape(v),
        Arg::Date(v) => v.format("%Y-%m-%d").to_string(),
        Arg::DateTime(v) => v.format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

pub fn bind(query: &str, args: &[Arg]) -> Result<BoundQuery, StoreError> {
    let offsets = placeholder_offsets(query);
    if offsets.len() != args.len() {
        return Err(StoreError::Bind(format!(
            "{} placeholders but {} arguments",
            offsets.len(),
            args.len()
        )));
    }

    let mut sql = String::with_capacity(query.len() + args.len() * 16);
    let mut params = Vec::with_capacity(args.len());
    let mut last = 0;
    for (i, (offset, arg)) in offsets.into_iter().zip(args).enumerate() {
        let name = format!("p{}", i + 1);
        sql.push_str(&query[last..offset]);
        sql.push_str(&format!("{{{name}:{}}}", type_name(arg)));
        params.push((name, value(arg)));
        last = offset + 1;
    }
    sql.push_str(&query[last..]);
    Ok(BoundQuery { sql, params })
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::*;

    #[test]
    fn placeholders_become_typed_parameters() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).expect("date");
        let at = Utc
            .with_ymd_and_hms(2024, 3, 1, 13, 5, 9)
            .single()
            .expect("timestamp");
        let bound = bind(
            "SELECT 1 WHERE client_id = ? AND toDate(time) >= toDate(?) AND time <= toDateTime(?, 'UTC') AND visitor_id = ? AND path = ?",
            &[
                Arg::Int(-3),
                Arg::Date(day),
                Arg::DateTime(at),
                Arg::UInt(u64::MAX),
                Arg::from("/a?b"),
            ],
        )
        .expect("bind");
        assert_eq!(
            bound.sql,
            "SELECT 1 WHERE client_id = {p1:Int64} AND toDate(time) >= toDate({p2:Date}) AND time <= toDateTime({p3:DateTime('UTC')}, 'UTC') AND visitor_id = {p4:UInt64} AND path = {p5:String}"
        );
        assert_eq!(bound.params[0], ("p1".to_string(), "-3".to_string()));
        assert_eq!(bound.params[2].1, "2024-03-01 13:05:09");
        assert_eq!(bound.params[3].1, "18446744073709551615");
        assert_eq!(bound.params[4].1, "/a?b");
    }

    #[test]
    fn quoted_question_marks_are_left_alone() {
        let bound = bind("SELECT '?' a, \"b?\" FROM t WHERE x = ?", &[Arg::from("v")])
            .expect("bind");
        assert_eq!(bound.sql, "SELECT '?' a, \"b?\" FROM t WHERE x = {p1:String}");
    }

    #[test]
    fn control_characters_are_escaped() {
        let bound = bind("SELECT ?", &[Arg::from("a\\b\tc\nd")]).expect("bind");
        assert_eq!(bound.params[0].1, "a\\\\b\\tc\\nd");
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let err = bind("SELECT ?, ?", &[Arg::Int(1)]).expect_err("should fail");
        assert!(matches!(err, StoreError::Bind(_)));
    }
}
