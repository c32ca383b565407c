//! `WHERE` clause construction.
//!
//! Each facet becomes one [`Group`]: positive values are OR-ed together,
//! exclusions are AND-ed, and every group is AND-ed with the time window.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pagetrail_core::Platform;

use crate::catalog::{Catalog, FieldId};
use crate::filter::{Filter, PlatformFilter};
use crate::fragment::Fragment;
use crate::table::Table;

#[derive(Debug, Default)]
pub(crate) struct Group {
    any: Vec<Fragment>,
    all: Vec<Fragment>,
}

impl Group {
    fn any(predicate: Fragment) -> Self {
        Self {
            any: vec![predicate],
            all: Vec::new(),
        }
    }

    fn all<I: IntoIterator<Item = Fragment>>(predicates: I) -> Self {
        Self {
            any: Vec::new(),
            all: predicates.into_iter().collect(),
        }
    }

    fn is_empty(&self) -> bool {
        self.any.is_empty() && self.all.is_empty()
    }
}

enum Match<'a> {
    Eq(&'a str),
    NotEq(&'a str),
    Contains(&'a str),
    NotContains(&'a str),
}

/// `!v` and `^v` are exclusions and land in the AND-ed half of a group, so
/// `^a` together with `^b` means neither substring occurs. `v` and `~v` are
/// alternatives and land in the OR-ed half.
fn classify(raw: &str) -> Match<'_> {
    if let Some(v) = raw.strip_prefix('!') {
        Match::NotEq(v)
    } else if let Some(v) = raw.strip_prefix('~') {
        Match::Contains(v)
    } else if let Some(v) = raw.strip_prefix('^') {
        Match::NotContains(v)
    } else {
        Match::Eq(raw)
    }
}

fn null_value(value: &str) -> &str {
    if value.eq_ignore_ascii_case("null") {
        ""
    } else {
        value
    }
}

fn like(value: &str) -> String {
    format!("%{value}%")
}

/// Columns holding a single code that a comma separated list is matched against.
fn is_code_column(column: &str) -> bool {
    matches!(column, "language" | "country_code")
}

/// Tenant and time window over `column`.
pub(crate) fn time_window(
    filter: &Filter,
    column: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Fragment {
    let tz = filter.timezone().name();
    let mut out = Fragment::bound("client_id = ?", filter.client_id);
    if let (Some(from), Some(to)) = (from, to) {
        if from == to {
            out.push_sql(&format!(" AND toDate({column}, '{tz}') = toDate(?)"));
            out.bind(from.date_naive());
            return out;
        }
    }
    for (op, bound) in [(">=", from), ("<=", to)] {
        let Some(bound) = bound else { continue };
        if filter.include_time {
            out.push_sql(&format!(
                " AND toDateTime({column}, '{tz}') {op} toDateTime(?, '{tz}')"
            ));
            out.bind(bound);
        } else {
            out.push_sql(&format!(" AND toDate({column}, '{tz}') {op} toDate(?)"));
            out.bind(bound.date_naive());
        }
    }
    out
}

fn facet(column: &str, values: &[String]) -> Option<Group> {
    if values.is_empty() {
        return None;
    }
    let key_array = matches!(column, "tag_keys" | "event_meta_keys");
    let mut group = Group::default();
    for raw in values {
        if key_array {
            match raw.strip_prefix('!') {
                Some(key) => group
                    .all
                    .push(Fragment::bound(format!("has({column}, ?) = 0"), key)),
                None => group
                    .any
                    .push(Fragment::bound(format!("has({column}, ?) = 1"), raw.as_str())),
            }
            continue;
        }
        match classify(raw) {
            Match::Eq(v) => group
                .any
                .push(Fragment::bound(format!("{column} = ?"), null_value(v))),
            Match::NotEq(v) => group
                .all
                .push(Fragment::bound(format!("{column} != ?"), null_value(v))),
            Match::Contains(v) => group.any.push(contains(column, v, true)),
            Match::NotContains(v) => group.all.push(contains(column, v, false)),
        }
    }
    Some(group)
}

fn contains(column: &str, value: &str, positive: bool) -> Fragment {
    let expected = u8::from(positive);
    if is_code_column(column) {
        Fragment::bound(
            format!("has(splitByChar(',', ?), {column}) = {expected}"),
            null_value(value),
        )
    } else {
        Fragment::bound(format!("ilike({column}, ?) = {expected}"), like(value))
    }
}

/// Key/value pairs stored as parallel arrays; every pair must hold.
fn key_values(values_col: &str, keys_col: &str, pairs: &BTreeMap<String, String>) -> Option<Group> {
    if pairs.is_empty() {
        return None;
    }
    let lookup = format!("{values_col}[indexOf({keys_col}, ?)]");
    let predicates = pairs.iter().map(|(key, raw)| {
        let (sql, value) = match classify(raw) {
            Match::Eq(v) => (format!("{lookup} = ?"), null_value(v).to_string()),
            Match::NotEq(v) => (format!("{lookup} != ?"), null_value(v).to_string()),
            Match::Contains(v) => (format!("ilike({lookup}, ?) = 1"), like(v)),
            Match::NotContains(v) => (format!("ilike({lookup}, ?) = 0"), like(v)),
        };
        let mut predicate = Fragment::bound(sql, key.as_str());
        predicate.bind(value);
        predicate
    });
    Some(Group::all(predicates))
}

/// Event names checked against a left-joined event row. An exclusion must
/// hold for every event of the session, so it becomes an anti-join on the
/// session identity instead of a per-row inequality.
fn joined_event_names(filter: &Filter) -> Option<Group> {
    let (excluded, kept): (Vec<String>, Vec<String>) = filter
        .event_name
        .iter()
        .cloned()
        .partition(|raw| raw.starts_with('!'));
    let mut group = facet("event_name", &kept).unwrap_or_default();
    for raw in &excluded {
        group.all.push(without_event(filter, &raw[1..]));
    }
    (!group.is_empty()).then_some(group)
}

fn without_event(filter: &Filter, name: &str) -> Fragment {
    let mut out = Fragment::new(
        r#"(t.visitor_id, t.session_id) NOT IN (SELECT visitor_id, session_id FROM "event" WHERE "#,
    );
    out.append(time_window(filter, "time", filter.from, filter.to));
    out.push_sql(" AND event_name = ?)");
    out.bind(null_value(name));
    out
}

fn platform(filter: &PlatformFilter) -> Group {
    let sql = match (filter.platform, filter.negated) {
        (Platform::Desktop, false) => "desktop = 1",
        (Platform::Mobile, false) => "mobile = 1",
        (Platform::Unknown, false) => "desktop = 0 AND mobile = 0",
        (Platform::Desktop, true) => "desktop != 1",
        (Platform::Mobile, true) => "mobile != 1",
        (Platform::Unknown, true) => "(desktop = 1 OR mobile = 1)",
    };
    if filter.negated {
        Group::all([Fragment::new(sql)])
    } else {
        Group::any(Fragment::new(sql))
    }
}

/// The platform facet over the imported device `category` column.
fn platform_category(filter: &PlatformFilter) -> Group {
    let predicates: &[&str] = match (filter.platform, filter.negated) {
        (Platform::Desktop, false) => {
            &["(lower(category) = 'desktop' OR lower(category) = 'laptop')"]
        }
        (Platform::Mobile, false) => &[
            "(lower(category) = 'mobile' OR lower(category) = 'phone' OR lower(category) = 'tablet')",
        ],
        (Platform::Unknown, false) => &["category = ''"],
        (Platform::Desktop, true) => &["lower(category) != 'desktop'", "lower(category) != 'laptop'"],
        (Platform::Mobile, true) => &[
            "lower(category) != 'mobile'",
            "lower(category) != 'phone'",
            "lower(category) != 'tablet'",
        ],
        (Platform::Unknown, true) => &["category != ''"],
    };
    Group::all(predicates.iter().map(|sql| Fragment::new(*sql)))
}

fn path_pattern(patterns: &[String]) -> Option<Group> {
    if patterns.is_empty() {
        return None;
    }
    let mut group = Group::default();
    for raw in patterns {
        match raw.strip_prefix('!') {
            Some(pattern) => group
                .all
                .push(Fragment::bound(r#"match("path", ?) = 0"#, pattern)),
            None => group
                .any
                .push(Fragment::bound(r#"match("path", ?) = 1"#, raw.as_str())),
        }
    }
    Some(group)
}

fn any_path(paths: &[String]) -> Option<Group> {
    if paths.is_empty() {
        return None;
    }
    let holes = vec!["?"; paths.len()].join(", ");
    let mut predicate = Fragment::new(format!("path IN ({holes})"));
    for path in paths {
        predicate.bind(path.as_str());
    }
    Some(Group::any(predicate))
}

fn search(column: &str, input: &str) -> Option<Group> {
    if input.is_empty() {
        return None;
    }
    let (positive, value) = match input.strip_prefix('!') {
        Some(value) => (false, value),
        None => (true, input),
    };
    Some(Group::any(contains(column, value, positive)))
}

fn dimensions(filter: &Filter) -> [(&'static str, &[String]); 18] {
    [
        ("hostname", &filter.hostname),
        ("language", &filter.language),
        ("country_code", &filter.country),
        ("region", &filter.region),
        ("city", &filter.city),
        ("referrer", &filter.referrer),
        ("referrer_name", &filter.referrer_name),
        ("channel", &filter.channel),
        ("os", &filter.os),
        ("os_version", &filter.os_version),
        ("browser", &filter.browser),
        ("browser_version", &filter.browser_version),
        ("screen_class", &filter.screen_class),
        ("utm_source", &filter.utm_source),
        ("utm_medium", &filter.utm_medium),
        ("utm_campaign", &filter.utm_campaign),
        ("utm_content", &filter.utm_content),
        ("utm_term", &filter.utm_term),
    ]
}

/// Where the facet predicates of one select apply.
pub(crate) struct Scope<'a> {
    pub filter: &'a Filter,
    pub table: Table,
    /// Event facets apply to a left-joined event row.
    pub include_event_filter: bool,
    /// Fixed predicates, AND-ed ahead of the facets.
    pub preset: Option<&'static [&'static str]>,
}

/// Facet predicate groups of a live select, in emission order.
pub(crate) fn live_groups(catalog: &Catalog, scope: &Scope<'_>) -> Vec<Group> {
    let f = scope.filter;
    let mut groups = Vec::new();
    if let Some(preset) = scope.preset {
        groups.push(Group::all(preset.iter().map(|sql| Fragment::new(*sql))));
    }

    let (tag_keys, tag_values) = match scope.table {
        Table::Events => ("event_meta_keys", "event_meta_values"),
        _ => ("tag_keys", "tag_values"),
    };
    if scope.table == Table::Sessions {
        groups.extend(facet("entry_path", &f.entry_path));
        groups.extend(facet("exit_path", &f.exit_path));
    } else {
        groups.extend(facet("path", &f.path));
        groups.extend(facet(tag_keys, &f.tag));
        groups.extend(path_pattern(&f.path_pattern));
        groups.extend(any_path(&f.any_path));
        groups.extend(key_values(tag_values, tag_keys, &f.tags));
    }

    if scope.include_event_filter {
        groups.extend(joined_event_names(f));
    } else if scope.table == Table::Events {
        groups.extend(facet("event_name", &f.event_name));
    }
    if scope.table == Table::Events || scope.include_event_filter {
        groups.extend(facet("event_meta_keys", &f.event_meta_key));
        groups.extend(key_values("event_meta_values", "event_meta_keys", &f.event_meta));
    }

    for (column, values) in dimensions(f) {
        groups.extend(facet(column, values));
    }
    groups.extend(f.platform.as_ref().map(platform));
    if f.visitor_id != 0 && f.session_id != 0 {
        groups.push(Group::any(Fragment::bound("t.visitor_id = ?", f.visitor_id)));
        groups.push(Group::any(Fragment::bound(
            "t.session_id = ?",
            u64::from(f.session_id),
        )));
    }
    for s in &f.search {
        groups.extend(search(catalog.get(s.field).name, &s.input));
    }
    groups
}

/// Facets applied inside the imported sub-select: only those matching the
/// join field, since imported tables hold one dimension each.
pub(crate) fn imported_groups(catalog: &Catalog, filter: &Filter, join: FieldId) -> Vec<Group> {
    let join_name = catalog.get(join).name;
    let candidates: [(&str, &[String]); 17] = [
        ("hostname", &filter.hostname),
        ("entry_path", &filter.entry_path),
        ("exit_path", &filter.exit_path),
        ("path", &filter.path),
        ("language", &filter.language),
        ("country_code", &filter.country),
        ("region", &filter.region),
        ("city", &filter.city),
        ("referrer", &filter.referrer),
        ("referrer_name", &filter.referrer),
        ("referrer", &filter.referrer_name),
        ("referrer_name", &filter.referrer_name),
        ("os", &filter.os),
        ("browser", &filter.browser),
        ("utm_source", &filter.utm_source),
        ("utm_medium", &filter.utm_medium),
        ("utm_campaign", &filter.utm_campaign),
    ];
    let mut groups: Vec<Group> = candidates
        .into_iter()
        .filter(|(column, _)| *column == join_name)
        .filter_map(|(column, values)| facet(column, values))
        .collect();

    if join.is_platform() {
        groups.extend(filter.platform.as_ref().map(platform_category));
    }
    if join == FieldId::Path {
        groups.extend(path_pattern(&filter.path_pattern));
    }
    let referrers = [FieldId::Referrer, FieldId::ReferrerName];
    if let Some(s) = filter.search.iter().find(|s| {
        s.field == join || (referrers.contains(&s.field) && referrers.contains(&join))
    }) {
        groups.extend(search(join_name, &s.input));
    }
    groups
}

/// Appends `groups` as ` AND ...` terms.
pub(crate) fn write_groups(groups: Vec<Group>, out: &mut Fragment) {
    for group in groups.into_iter().filter(|g| !g.is_empty()) {
        let Group { any, all } = group;
        match any.len() {
            0 => {}
            1 => {
                out.push_sql(" AND ");
                out.append_joined(any, "");
            }
            _ => {
                out.push_sql(" AND (");
                out.append_joined(any, " OR ");
                out.push_sql(")");
            }
        }
        if !all.is_empty() {
            out.push_sql(" AND ");
            out.append_joined(all, " AND ");
        }
    }
}
