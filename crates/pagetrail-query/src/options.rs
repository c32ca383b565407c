//! Distinct values a facet can be filtered on, for building filter pickers.

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::filter::Filter;
use crate::fragment::Fragment;
use crate::predicates::{live_groups, write_groups, Scope};
use crate::table::Table;

pub const MAX_OPTIONS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOption {
    Hostname,
    /// Also serves entry and exit paths.
    Path,
    Referrer,
    ReferrerName,
    UtmSource,
    UtmMedium,
    UtmCampaign,
    UtmContent,
    UtmTerm,
    Channel,
    EventName,
    Country,
    Region,
    City,
    Language,
    TagKeys,
    /// Values of the single tag key set on the filter.
    TagValues,
    /// Metadata values of the events named on the filter.
    EventMetadataValues,
}

impl FilterOption {
    /// Column and table of the plain distinct-column listings.
    fn column(self) -> Option<(&'static str, &'static str)> {
        Some(match self {
            Self::Hostname => ("hostname", "session"),
            Self::Path => ("path", "page_view"),
            Self::Referrer => ("referrer", "session"),
            Self::ReferrerName => ("referrer_name", "session"),
            Self::UtmSource => ("utm_source", "session"),
            Self::UtmMedium => ("utm_medium", "session"),
            Self::UtmCampaign => ("utm_campaign", "session"),
            Self::UtmContent => ("utm_content", "session"),
            Self::UtmTerm => ("utm_term", "session"),
            Self::Channel => ("channel", "session"),
            Self::EventName => ("event_name", "event"),
            Self::Country => ("country_code", "session"),
            Self::Region => ("region", "session"),
            Self::City => ("city", "session"),
            Self::Language => ("language", "session"),
            Self::TagKeys | Self::TagValues | Self::EventMetadataValues => return None,
        })
    }
}

fn push_search(column: &str, search: &str, out: &mut Fragment) {
    if !search.is_empty() {
        out.push_sql(&format!(" AND {column} ILIKE ?"));
        out.bind(format!("%{search}%"));
    }
}

/// Compiles the listing for `option` under a normalized `filter`.
///
/// Returns `None` when the option cannot have any values: tag values without
/// exactly one tag key, or metadata values without an event name.
pub fn compile_options(filter: &Filter, option: FilterOption, search: &str) -> Option<Fragment> {
    let search = search.trim();
    let limit = format!(" LIMIT {MAX_OPTIONS}");

    if let Some((column, table)) = option.column() {
        let mut out = Fragment::new(format!("SELECT DISTINCT {column} FROM {table} "));
        out.append(filter.build_time_query());
        push_search(column, search, &mut out);
        out.push_sql(&format!(" ORDER BY {column} ASC{limit}"));
        return Some(out);
    }

    match option {
        FilterOption::TagKeys => {
            let mut out =
                Fragment::new("SELECT DISTINCT arrayJoin(tag_keys) AS \"values\" FROM page_view ");
            out.append(filter.build_time_query());
            push_search("\"values\"", search, &mut out);
            out.push_sql(" AND length(tag_values) > 0 ORDER BY \"values\" ASC");
            out.push_sql(&limit);
            Some(out)
        }
        FilterOption::TagValues => {
            let [tag] = filter.tag.as_slice() else {
                return None;
            };
            let mut out = Fragment::bound(
                "SELECT DISTINCT tag_values[indexOf(tag_keys, ?)] AS \"keys\" FROM page_view ",
                tag.as_str(),
            );
            out.append(filter.build_time_query());
            out.push_sql(" AND length(tag_values) > 0 AND has(tag_keys, ?)");
            out.bind(tag.as_str());
            push_search("\"keys\"", search, &mut out);
            out.push_sql(" ORDER BY \"keys\" ASC");
            out.push_sql(&limit);
            Some(out)
        }
        FilterOption::EventMetadataValues => {
            if filter.event_name.is_empty() {
                return None;
            }
            let mut out = Fragment::new(
                "SELECT DISTINCT arrayJoin(event_meta_values) AS \"values\" FROM event ",
            );
            out.append(filter.build_time_query());
            out.push_sql(" AND length(event_meta_values) > 0");
            let names = Filter {
                event_name: filter.event_name.clone(),
                ..Filter::new(filter.client_id)
            };
            let scope = Scope {
                filter: &names,
                table: Table::Events,
                include_event_filter: false,
                preset: None,
            };
            write_groups(live_groups(Catalog::shared(), &scope), &mut out);
            push_search("\"values\"", search, &mut out);
            out.push_sql(" ORDER BY \"values\" ASC");
            out.push_sql(&limit);
            Some(out)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use pagetrail_core::Arg;

    use super::*;

    fn march() -> Filter {
        Filter {
            from: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).single().expect("timestamp")),
            to: Some(Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).single().expect("timestamp")),
            ..Filter::new(5)
        }
    }

    #[test]
    fn dimension_listing_searches_and_limits() {
        let out = compile_options(&march(), FilterOption::Path, "  blog ").expect("options");
        assert!(out.sql.starts_with("SELECT DISTINCT path FROM page_view WHERE client_id = ?"));
        assert!(out.sql.ends_with(" AND path ILIKE ? ORDER BY path ASC LIMIT 200"));
        assert_eq!(out.args.last(), Some(&Arg::Str("%blog%".into())));
        assert_eq!(out.placeholders(), out.args.len());
    }

    #[test]
    fn tag_values_need_exactly_one_key() {
        assert!(compile_options(&march(), FilterOption::TagValues, "").is_none());
        let filter = Filter {
            tag: vec!["author".into()],
            ..march()
        };
        let out = compile_options(&filter, FilterOption::TagValues, "").expect("options");
        assert_eq!(out.args.first(), Some(&Arg::Str("author".into())));
        assert_eq!(out.args.last(), Some(&Arg::Str("author".into())));
        assert_eq!(out.placeholders(), out.args.len());
    }

    #[test]
    fn metadata_values_filter_by_event_name() {
        assert!(compile_options(&march(), FilterOption::EventMetadataValues, "").is_none());
        let filter = Filter {
            event_name: vec!["purchase".into()],
            ..march()
        };
        let out =
            compile_options(&filter, FilterOption::EventMetadataValues, "").expect("options");
        assert!(out.sql.contains(" AND event_name = ?"));
        assert_eq!(out.args.last(), Some(&Arg::Str("purchase".into())));
    }
}
