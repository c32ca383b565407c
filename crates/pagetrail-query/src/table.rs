//! Base table selection.
//!
//! The decision is an ordered list of rules over a handful of boolean signals
//! derived from the filter and the requested fields. The first rule that
//! answers wins; the order matters.

use crate::catalog::{FieldId, Source};
use crate::filter::Filter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Sessions,
    PageViews,
    Events,
}

impl Table {
    /// Table reference with the `t` alias every query uses.
    pub fn sql(self) -> &'static str {
        match self {
            Self::Sessions => "\"session\" t",
            Self::PageViews => "\"page_view\" t",
            Self::Events => "\"event\" t",
        }
    }

    pub fn source(self) -> Source {
        match self {
            Self::Sessions => Source::Sessions,
            Self::PageViews => Source::PageViews,
            Self::Events => Source::Events,
        }
    }
}

/// What the request touches, as far as table choice is concerned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableSignals {
    /// Path, tag or per-page data is filtered on or selected.
    pub page_view_data: bool,
    pub tag_fields: bool,
    /// Both a custom metric key and type are set.
    pub custom_metric: bool,
    /// The full session shape is selected.
    pub all_sessions: bool,
    pub entry_exit_fields: bool,
    pub event_data: bool,
}

impl TableSignals {
    pub fn collect(filter: &Filter, fields: &[FieldId]) -> Self {
        let has = |id| fields.contains(&id);
        let tag_fields = has(FieldId::TagKey) || has(FieldId::TagValue);
        let page_view_data = !filter.path.is_empty()
            || !filter.any_path.is_empty()
            || !filter.path_pattern.is_empty()
            || !filter.tags.is_empty()
            || !filter.tag.is_empty()
            || filter.search_contains(FieldId::Path)
            || tag_fields
            || [
                FieldId::PageViewsAll,
                FieldId::Path,
                FieldId::Entries,
                FieldId::Exits,
                FieldId::Hour,
                FieldId::Minute,
                FieldId::TagKeysRaw,
                FieldId::TagValuesRaw,
            ]
            .into_iter()
            .any(has);
        let custom_metric =
            !filter.custom_metric_key.is_empty() && !filter.custom_metric_type.is_empty();
        Self {
            page_view_data,
            tag_fields,
            custom_metric,
            all_sessions: has(FieldId::SessionsAll),
            entry_exit_fields: has(FieldId::EntryPath) || has(FieldId::ExitPath),
            event_data: !filter.event_name.is_empty()
                || has(FieldId::EventName)
                || has(FieldId::EventsAll)
                || custom_metric,
        }
    }
}

type Rule = (&'static str, fn(&TableSignals) -> Option<Table>);

const RULES: &[Rule] = &[
    ("page view data", page_view_rule),
    ("entry or exit path", entry_exit_rule),
    ("event data", event_rule),
    ("default", |_| Some(Table::Sessions)),
];

fn page_view_rule(s: &TableSignals) -> Option<Table> {
    (s.page_view_data && (!s.custom_metric || s.tag_fields) && !s.all_sessions)
        .then_some(Table::PageViews)
}

fn entry_exit_rule(s: &TableSignals) -> Option<Table> {
    s.entry_exit_fields.then_some(Table::Sessions)
}

fn event_rule(s: &TableSignals) -> Option<Table> {
    (s.event_data && !s.all_sessions).then_some(Table::Events)
}

pub fn decide(signals: &TableSignals) -> Table {
    RULES
        .iter()
        .find_map(|(name, rule)| {
            let table = rule(signals)?;
            tracing::trace!(rule = name, ?table, "base table chosen");
            Some(table)
        })
        .unwrap_or(Table::Sessions)
}

pub fn decide_base_table(filter: &Filter, fields: &[FieldId]) -> Table {
    decide(&TableSignals::collect(filter, fields))
}
