//! The declarative description of a question and its normalization.
//!
//! A [`Filter`] is what callers fill in: tenant, time window, facet lists,
//! search and sort terms. [`Filter::normalize`] turns it into the canonical
//! form the compiler relies on; normalizing twice is a no-op.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use pagetrail_core::{CustomMetricType, Direction, Period, Platform, WeekMode};

use crate::catalog::{Catalog, FieldId};
use crate::compiler::{Compiler, QuerySpec};
use crate::error::CompileError;
use crate::fragment::Fragment;
use crate::predicates;

/// A platform facet, optionally negated (`!mobile`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformFilter {
    pub platform: Platform,
    pub negated: bool,
}

impl PlatformFilter {
    /// Parses `desktop`, `mobile`, `unknown` with an optional `!` prefix.
    pub fn parse(raw: &str) -> Option<Self> {
        let (negated, name) = match raw.strip_prefix('!') {
            Some(name) => (true, name),
            None => (false, raw),
        };
        Platform::parse(name)
            .ok()
            .map(|platform| Self { platform, negated })
    }
}

/// A case-insensitive substring search on one field; a leading `!` negates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    pub field: FieldId,
    pub input: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort {
    pub field: FieldId,
    pub direction: Direction,
}

/// The part of the time window served by the imported tables.
///
/// Only normalization fills it in; callers leave it at its default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportedWindow {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl ImportedWindow {
    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    /// Inclusive last day.
    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// Facet values use a small prefix grammar: `!v` excludes, `~v` contains,
/// `^v` does not contain, and the literal `null` matches the empty value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub client_id: i64,
    /// Defaults to UTC during normalization.
    pub timezone: Option<Tz>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Days before this date are read from the imported tables.
    pub imported_until: Option<NaiveDate>,
    pub period: Period,
    pub week_mode: WeekMode,

    pub hostname: Vec<String>,
    pub path: Vec<String>,
    /// Plain set membership, no prefix grammar.
    pub any_path: Vec<String>,
    pub entry_path: Vec<String>,
    pub exit_path: Vec<String>,
    /// Regular expressions; dropped when `path` is set.
    pub path_pattern: Vec<String>,
    pub language: Vec<String>,
    pub country: Vec<String>,
    pub region: Vec<String>,
    pub city: Vec<String>,
    pub referrer: Vec<String>,
    pub referrer_name: Vec<String>,
    pub channel: Vec<String>,
    pub os: Vec<String>,
    pub os_version: Vec<String>,
    pub browser: Vec<String>,
    pub browser_version: Vec<String>,
    pub screen_class: Vec<String>,
    pub utm_source: Vec<String>,
    pub utm_medium: Vec<String>,
    pub utm_campaign: Vec<String>,
    pub utm_content: Vec<String>,
    pub utm_term: Vec<String>,
    /// Tag keys that must (or with `!`, must not) be present.
    pub tag: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub event_name: Vec<String>,
    pub event_meta_key: Vec<String>,
    pub event_meta: BTreeMap<String, String>,
    pub platform: Option<PlatformFilter>,

    /// Restricts to one session; ignored unless both ids are set.
    pub visitor_id: u64,
    pub session_id: u32,

    pub search: Vec<Search>,
    pub sort: Vec<Sort>,
    pub offset: i64,
    pub limit: i64,

    pub custom_metric_key: String,
    /// `integer` or `float`; anything else is cleared by normalization.
    pub custom_metric_type: String,

    pub include_time: bool,
    pub include_title: bool,
    /// `SAMPLE` size; zero reads every row.
    pub sample: u32,

    /// Set by [`Filter::normalize`] when `imported_until` splits the window.
    pub imported: ImportedWindow,
}

impl Filter {
    pub fn new(client_id: i64) -> Self {
        Self {
            client_id,
            ..Self::default()
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone.unwrap_or(Tz::UTC)
    }

    pub fn custom_metric(&self) -> Option<CustomMetricType> {
        CustomMetricType::parse(&self.custom_metric_type).ok()
    }

    pub fn normalize(&self) -> Filter {
        self.normalize_at(Utc::now().date_naive())
    }

    /// Normalizes relative to `today` instead of the clock.
    pub fn normalize_at(&self, today: NaiveDate) -> Filter {
        let mut f = self.clone();
        f.timezone = Some(f.timezone());

        if !f.include_time {
            f.from = f.from.map(start_of_day);
            f.to = f.to.map(start_of_day);
        }

        if let (Some(from), Some(to)) = (f.from, f.to) {
            if to < from {
                f.from = Some(to);
                f.to = Some(from);
            }
        }

        let tomorrow = midnight(today + Duration::days(1));
        if f.to.is_some_and(|to| to > tomorrow) {
            f.to = Some(tomorrow);
        }
        if let (Some(from), Some(to)) = (f.from, f.to) {
            if from > to {
                f.from = Some(to);
            }
        }

        if let Some(until) = f.imported_until {
            let until = midnight(until);
            if f.from.map_or(true, |from| from < until) {
                f.imported.start = f.from;
                match f.to {
                    Some(to) if to >= until => {
                        f.from = Some(until);
                        f.imported.end = Some(until - Duration::days(1));
                    }
                    to => f.imported.end = to,
                }
            }
        }

        if !f.path.is_empty() {
            f.path_pattern.clear();
        }
        for search in &mut f.search {
            search.input = search.input.trim().to_string();
        }
        f.search.retain(|search| !search.input.is_empty());
        f.offset = f.offset.max(0);
        f.limit = f.limit.max(0);
        if f.custom_metric().is_none() {
            f.custom_metric_type.clear();
        }

        for values in f.facets_mut() {
            dedupe(values);
        }
        f.country
            .retain(|c| c.len() == 2 || (c.len() == 3 && c.starts_with('!')));
        f
    }

    /// An "active visitors" window: everything since `now - lookback`, with
    /// time-of-day precision and no upper bound.
    pub fn with_lookback(&self, now: DateTime<Utc>, lookback: Duration) -> Filter {
        Filter {
            from: Some(now - lookback),
            to: None,
            include_time: true,
            ..self.clone()
        }
    }

    /// Compiles `query` against this filter, which should already be normalized.
    pub fn build_query(
        &self,
        catalog: &Catalog,
        query: &QuerySpec,
    ) -> Result<Fragment, CompileError> {
        Compiler::new(catalog).compile(self, query)
    }

    /// `WHERE` clause carrying only the tenant and time window.
    pub fn build_time_query(&self) -> Fragment {
        let mut out = Fragment::new("WHERE ");
        out.append(predicates::time_window(self, "time", self.from, self.to));
        out
    }

    pub(crate) fn search_contains(&self, id: FieldId) -> bool {
        self.search.iter().any(|s| s.field == id)
    }

    pub(crate) fn negates_event_name(&self) -> bool {
        self.event_name.iter().any(|name| name.starts_with('!'))
    }

    fn facets_mut(&mut self) -> [&mut Vec<String>; 26] {
        [
            &mut self.hostname,
            &mut self.path,
            &mut self.any_path,
            &mut self.entry_path,
            &mut self.exit_path,
            &mut self.path_pattern,
            &mut self.language,
            &mut self.country,
            &mut self.region,
            &mut self.city,
            &mut self.referrer,
            &mut self.referrer_name,
            &mut self.channel,
            &mut self.os,
            &mut self.os_version,
            &mut self.browser,
            &mut self.browser_version,
            &mut self.screen_class,
            &mut self.utm_source,
            &mut self.utm_medium,
            &mut self.utm_campaign,
            &mut self.utm_content,
            &mut self.utm_term,
            &mut self.tag,
            &mut self.event_name,
            &mut self.event_meta_key,
        ]
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn start_of_day(time: DateTime<Utc>) -> DateTime<Utc> {
    midnight(time.date_naive())
}

fn dedupe(values: &mut Vec<String>) {
    let mut seen = HashSet::new();
    values.retain(|v| seen.insert(v.clone()));
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 30, 0).single().expect("time")
    }

    fn today() -> NaiveDate {
        day(2024, 6, 15)
    }

    #[test]
    fn normalize_defaults_and_truncates() {
        let filter = Filter {
            from: Some(at(2024, 6, 1, 13)),
            to: Some(at(2024, 6, 3, 8)),
            ..Filter::new(1)
        }
        .normalize_at(today());
        assert_eq!(filter.timezone, Some(Tz::UTC));
        assert_eq!(filter.from, Some(midnight(day(2024, 6, 1))));
        assert_eq!(filter.to, Some(midnight(day(2024, 6, 3))));
    }

    #[test]
    fn normalize_keeps_time_of_day_when_asked() {
        let filter = Filter {
            from: Some(at(2024, 6, 1, 13)),
            include_time: true,
            ..Filter::new(1)
        }
        .normalize_at(today());
        assert_eq!(filter.from, Some(at(2024, 6, 1, 13)));
    }

    #[test]
    fn normalize_swaps_and_clamps() {
        let filter = Filter {
            from: Some(midnight(day(2024, 6, 10))),
            to: Some(midnight(day(2024, 6, 2))),
            ..Filter::new(1)
        }
        .normalize_at(today());
        assert_eq!(filter.from, Some(midnight(day(2024, 6, 2))));
        assert_eq!(filter.to, Some(midnight(day(2024, 6, 10))));

        let future = Filter {
            from: Some(midnight(day(2024, 7, 1))),
            to: Some(midnight(day(2024, 8, 1))),
            ..Filter::new(1)
        }
        .normalize_at(today());
        assert_eq!(future.to, Some(midnight(day(2024, 6, 16))));
        assert_eq!(future.from, future.to);
    }

    #[test]
    fn normalize_splits_imported_window() {
        let filter = Filter {
            from: Some(midnight(day(2024, 5, 1))),
            to: Some(midnight(day(2024, 6, 10))),
            imported_until: Some(day(2024, 6, 1)),
            ..Filter::new(1)
        }
        .normalize_at(today());
        assert_eq!(filter.from, Some(midnight(day(2024, 6, 1))));
        assert_eq!(filter.imported.start(), Some(midnight(day(2024, 5, 1))));
        assert_eq!(filter.imported.end(), Some(midnight(day(2024, 5, 31))));

        let before = Filter {
            from: Some(midnight(day(2024, 5, 1))),
            to: Some(midnight(day(2024, 5, 20))),
            imported_until: Some(day(2024, 6, 1)),
            ..Filter::new(1)
        }
        .normalize_at(today());
        assert_eq!(before.from, Some(midnight(day(2024, 5, 1))));
        assert_eq!(before.imported.end(), Some(midnight(day(2024, 5, 20))));

        let after = Filter {
            from: Some(midnight(day(2024, 6, 2))),
            imported_until: Some(day(2024, 6, 1)),
            ..Filter::new(1)
        }
        .normalize_at(today());
        assert_eq!(after.imported, ImportedWindow::default());
    }

    #[test]
    fn normalize_cleans_facets() {
        let filter = Filter {
            path: vec!["/".into(), "/a".into(), "/".into()],
            path_pattern: vec!["^/blog".into()],
            country: vec!["de".into(), "deu".into(), "!gb".into(), "!".into()],
            search: vec![
                Search {
                    field: FieldId::Path,
                    input: "  blog ".into(),
                },
                Search {
                    field: FieldId::Referrer,
                    input: "   ".into(),
                },
            ],
            offset: -5,
            limit: -1,
            custom_metric_type: "decimal".into(),
            ..Filter::new(1)
        }
        .normalize_at(today());
        assert_eq!(filter.path, vec!["/", "/a"]);
        assert!(filter.path_pattern.is_empty());
        assert_eq!(filter.country, vec!["de", "!gb"]);
        assert_eq!(filter.search.len(), 1);
        assert_eq!(filter.search[0].input, "blog");
        assert_eq!((filter.offset, filter.limit), (0, 0));
        assert!(filter.custom_metric_type.is_empty());
    }

    #[test]
    fn normalize_is_idempotent() {
        let filters = [
            Filter {
                from: Some(at(2024, 6, 20, 4)),
                to: Some(at(2024, 5, 1, 9)),
                imported_until: Some(day(2024, 5, 10)),
                event_name: vec!["signup".into(), "signup".into()],
                ..Filter::new(7)
            },
            Filter {
                from: Some(at(2024, 8, 1, 0)),
                to: Some(at(2024, 9, 1, 0)),
                imported_until: Some(day(2024, 12, 1)),
                ..Filter::new(7)
            },
            Filter::new(7).with_lookback(at(2024, 6, 15, 12), Duration::minutes(15)),
        ];
        for filter in filters {
            let once = filter.normalize_at(today());
            assert_eq!(once.normalize_at(today()), once);
        }
    }

    #[test]
    fn lookback_window_is_open_ended() {
        let now = at(2024, 6, 15, 12);
        let filter = Filter {
            to: Some(now),
            ..Filter::new(1)
        }
        .with_lookback(now, Duration::minutes(15));
        assert_eq!(filter.from, Some(now - Duration::minutes(15)));
        assert_eq!(filter.to, None);
        assert!(filter.include_time);
    }

    #[test]
    fn platform_filter_parses_negation() {
        assert_eq!(
            PlatformFilter::parse("!mobile"),
            Some(PlatformFilter {
                platform: Platform::Mobile,
                negated: true,
            })
        );
        assert_eq!(PlatformFilter::parse("tv"), None);
    }
}
