//! Shared query vocabulary: periods, directions, metric types and bound arguments.

use std::fmt;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Bucket granularity for time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Hour,
    #[default]
    Day,
    Week,
    Month,
    Year,
}

impl Period {
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw.unwrap_or("day") {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            other => Err(anyhow!(
                "invalid period '{other}': expected hour, day, week, month or year"
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(anyhow!("invalid direction '{other}': expected asc or desc")),
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// First day of the week used by week buckets.
///
/// The discriminant is the `toStartOfWeek` mode understood by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekMode {
    #[default]
    Sunday = 0,
    Monday = 1,
}

impl WeekMode {
    pub fn mode(&self) -> u8 {
        *self as u8
    }
}

/// Numeric interpretation of a custom metric stored as an event metadata string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomMetricType {
    Integer,
    Float,
}

impl CustomMetricType {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "integer" => Ok(Self::Integer),
            "float" => Ok(Self::Float),
            other => Err(anyhow!(
                "invalid custom metric type '{other}': expected integer or float"
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
        }
    }

    /// Store function casting a metadata string to the metric's number type.
    pub fn cast_function(&self) -> &'static str {
        match self {
            Self::Integer => "toInt64OrZero",
            Self::Float => "toFloat64OrZero",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Desktop,
    Mobile,
    Unknown,
}

impl Platform {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "desktop" => Ok(Self::Desktop),
            "mobile" => Ok(Self::Mobile),
            "unknown" => Ok(Self::Unknown),
            other => Err(anyhow!(
                "invalid platform '{other}': expected desktop, mobile or unknown"
            )),
        }
    }
}

/// A positional value bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Arg {
    Int(i64),
    UInt(u64),
    Str(String),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for Arg {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<NaiveDate> for Arg {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<DateTime<Utc>> for Arg {
    fn from(value: DateTime<Utc>) -> Self {
        Self::DateTime(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_parse_defaults_to_day() {
        assert_eq!(Period::parse(None).expect("default"), Period::Day);
        assert_eq!(Period::parse(Some("month")).expect("month"), Period::Month);
        assert!(Period::parse(Some("fortnight")).is_err());
    }

    #[test]
    fn direction_parse_is_case_insensitive() {
        assert_eq!(Direction::parse("DESC").expect("desc"), Direction::Desc);
        assert_eq!(Direction::Asc.as_sql(), "ASC");
    }

    #[test]
    fn custom_metric_type_rejects_unknown_names() {
        assert_eq!(
            CustomMetricType::parse("integer")
                .expect("integer")
                .cast_function(),
            "toInt64OrZero"
        );
        assert_eq!(
            CustomMetricType::parse("float").expect("float"),
            CustomMetricType::Float
        );
        assert!(CustomMetricType::parse("decimal").is_err());
    }

    #[test]
    fn week_mode_matches_store_modes() {
        assert_eq!(WeekMode::default().mode(), 0);
        assert_eq!(WeekMode::Monday.mode(), 1);
    }

    #[test]
    fn args_serialize_untagged() {
        let args = vec![
            Arg::from(7_i64),
            Arg::from("/"),
            Arg::from(NaiveDate::from_ymd_opt(2024, 3, 1).expect("date")),
        ];
        let json = serde_json::to_string(&args).expect("serialize");
        assert_eq!(json, r#"[7,"/","2024-03-01"]"#);
    }
}
