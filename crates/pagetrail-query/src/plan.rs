//! The query tree.
//!
//! Building decides the base table, which sub-selects get joined in and
//! whether historical rows are merged; lowering then walks the tree once.

use crate::catalog::{Catalog, FieldId};
use crate::compiler::QuerySpec;
use crate::error::CompileError;
use crate::filter::{Filter, Sort};
use crate::lower::bucket_alias;
use crate::table::{decide_base_table, Table};

#[derive(Debug, Clone)]
pub(crate) enum Column {
    Field(FieldId),
    /// A scalar sub-select counting visitors, used for platform counts off
    /// the session table.
    Correlated { field: FieldId, select: Box<Select> },
}

#[derive(Debug, Clone)]
pub(crate) enum Join {
    /// Restricts rows to sessions present in the sub-select.
    Inner { alias: &'static str, select: Select },
    /// Keeps rows without a matching event.
    Left(Select),
    /// Per-bucket visitor totals, joined on the bucket column.
    Bucket { select: Select, key: &'static str },
}

impl Join {
    fn is_bucket(&self) -> bool {
        matches!(self, Self::Bucket { .. })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Select {
    pub filter: Filter,
    pub table: Table,
    pub columns: Vec<Column>,
    pub group_by: Vec<FieldId>,
    pub order_by: Vec<FieldId>,
    pub joins: Vec<Join>,
    pub include_event_filter: bool,
    pub final_sessions: bool,
    /// Joined under another select.
    pub nested: bool,
    pub funnel_step: usize,
    pub preset: Option<&'static [&'static str]>,
    pub limit: i64,
    pub offset: i64,
}

impl Select {
    fn new(filter: Filter, table: Table, fields: &[FieldId]) -> Self {
        Self {
            filter,
            table,
            columns: fields.iter().copied().map(Column::Field).collect(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            joins: Vec::new(),
            include_event_filter: false,
            final_sessions: false,
            nested: false,
            funnel_step: 0,
            preset: None,
            limit: 0,
            offset: 0,
        }
    }

    /// A select of the given fields, also grouped by them.
    fn grouped(filter: Filter, table: Table, fields: Vec<FieldId>) -> Self {
        let mut select = Self::new(filter, table, &fields);
        select.group_by = fields;
        select
    }

    /// Only scalar sub-selects, so no `FROM` of its own.
    pub fn is_scalar(&self) -> bool {
        self.columns
            .iter()
            .any(|c| matches!(c, Column::Correlated { .. }))
    }

    pub fn fields(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.columns.iter().map(|c| match c {
            Column::Field(id) => *id,
            Column::Correlated { field, .. } => *field,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Merge {
    /// The live query, without ordering or limits.
    pub live: Select,
    pub table: String,
    /// Imported side columns; the first is the join key.
    pub fields: Vec<FieldId>,
    pub group_by: Vec<FieldId>,
    pub order_by: Vec<FieldId>,
    /// Caller sort terms, moved off the live filter.
    pub sort: Vec<Sort>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Base(Select),
    FullOuterMerge(Merge),
}

pub(crate) fn build(
    catalog: &Catalog,
    filter: &Filter,
    query: &QuerySpec,
    funnel_step: usize,
) -> Result<Node, CompileError> {
    let fields = query.fields.as_slice();
    let has = |id| fields.contains(&id);
    let table = decide_base_table(filter, fields);
    let returns_event_name = has(FieldId::EventName);
    let custom_metric =
        !filter.custom_metric_key.is_empty() || !filter.custom_metric_type.is_empty();

    let mut select;
    if table == Table::Events && !returns_event_name && !custom_metric && !has(FieldId::EventsAll)
    {
        let kept: Vec<FieldId> = fields
            .iter()
            .copied()
            .filter(|&id| id != FieldId::Path)
            .collect();
        select = Select::new(filter.clone(), Table::Sessions, &kept);
        select.include_event_filter = true;
        select.joins.push(Join::Left(left_join_events(filter, fields)));
    } else if table == Table::PageViews || returns_event_name || custom_metric {
        select = Select::new(filter.clone(), table, fields);
        if table != Table::Sessions {
            if let Some(sessions) = join_sessions(filter, table, fields) {
                select.joins.push(Join::Inner {
                    alias: "j",
                    select: sessions,
                });
            }
        }
        if table != Table::Events {
            join_or_left_join_events(&mut select, filter, fields);
        }
    } else {
        select = Select::new(filter.clone(), table, fields);
        if let Some(page_views) = join_page_views(filter, fields) {
            select.joins.push(Join::Inner {
                alias: "j",
                select: page_views,
            });
        }
        join_or_left_join_events(&mut select, filter, fields);
    }

    if let Some(bucket) = join_unique_visitors_by_period(filter, fields, &query.group_by)? {
        select.joins.push(bucket);
    }
    select.group_by = query.group_by.clone();
    select.order_by = query.order_by.clone();
    select.final_sessions = has(FieldId::SessionsAll);
    select.funnel_step = funnel_step;
    select.limit = filter.limit;
    select.offset = filter.offset;

    if select.table != Table::Sessions {
        correlate_platform_counts(catalog, &mut select);
    }

    match &query.imported_table {
        Some(imported)
            if filter.imported_until.is_some()
                && !filter.imported.is_empty()
                && !query.imported_fields.is_empty()
                && !select.is_scalar() =>
        {
            let mut live = select;
            let order_by = std::mem::take(&mut live.order_by);
            let sort = std::mem::take(&mut live.filter.sort);
            let (limit, offset) = (live.limit, live.offset);
            live.limit = 0;
            live.offset = 0;
            Ok(Node::FullOuterMerge(Merge {
                group_by: live.group_by.clone(),
                live,
                table: imported.clone(),
                fields: query.imported_fields.clone(),
                order_by,
                sort,
                limit,
                offset,
            }))
        }
        _ => Ok(Node::Base(select)),
    }
}

/// Platform counts off the session table are answered by one scalar
/// sub-select per platform, carrying the same joins and facets.
fn correlate_platform_counts(catalog: &Catalog, select: &mut Select) {
    let template = select.clone();
    for column in &mut select.columns {
        let Column::Field(id) = *column else {
            continue;
        };
        let Some(preset) = catalog.get(id).platform else {
            continue;
        };
        let mut sub = Select::new(
            without_sort(&template.filter),
            template.table,
            &[FieldId::Visitors],
        );
        sub.joins = template
            .joins
            .iter()
            .filter(|join| !join.is_bucket())
            .cloned()
            .collect();
        sub.include_event_filter = template.include_event_filter;
        sub.preset = Some(preset);
        *column = Column::Correlated {
            field: id,
            select: Box::new(sub),
        };
    }
}

fn join_sessions(filter: &Filter, table: Table, fields: &[FieldId]) -> Option<Select> {
    let has = |id| fields.contains(&id);
    let needed = !filter.entry_path.is_empty()
        || !filter.exit_path.is_empty()
        || has(FieldId::Bounces)
        || (table == Table::Events && has(FieldId::Views))
        || has(FieldId::EntryPath)
        || has(FieldId::ExitPath);
    if !needed {
        return None;
    }

    let mut keys = vec![FieldId::VisitorId, FieldId::SessionId];
    if !filter.entry_path.is_empty()
        || has(FieldId::EntryPath)
        || filter.search_contains(FieldId::EntryPath)
    {
        keys.push(FieldId::EntryPath);
        if filter.include_title {
            keys.push(FieldId::EntryTitle);
        }
    }
    if !filter.exit_path.is_empty()
        || has(FieldId::ExitPath)
        || filter.search_contains(FieldId::ExitPath)
    {
        keys.push(FieldId::ExitPath);
        if filter.include_title {
            keys.push(FieldId::ExitTitle);
        }
    }

    let mut columns = keys.clone();
    columns.extend(
        [FieldId::Bounces, FieldId::Views]
            .into_iter()
            .filter(|&id| has(id)),
    );
    let mut select = Select::new(without_sort(filter), Table::Sessions, &columns);
    select.group_by = keys;
    select.nested = true;
    select.final_sessions = has(FieldId::SessionsAll);
    Some(select)
}

fn join_page_views(filter: &Filter, fields: &[FieldId]) -> Option<Select> {
    let has = |id| fields.contains(&id);
    let path_filtered = !filter.path.is_empty()
        || !filter.path_pattern.is_empty()
        || !filter.any_path.is_empty()
        || filter.search_contains(FieldId::Path);
    let needed = path_filtered
        || !filter.tag.is_empty()
        || !filter.tags.is_empty()
        || has(FieldId::TagKey)
        || has(FieldId::TagValue)
        || has(FieldId::TagKeysRaw)
        || has(FieldId::TagValuesRaw);
    if !needed {
        return None;
    }

    let mut columns = vec![FieldId::VisitorId, FieldId::SessionId];
    if path_filtered || has(FieldId::Path) {
        columns.push(FieldId::Path);
    }
    if has(FieldId::TagKey) || has(FieldId::TagKeysRaw) {
        columns.push(FieldId::TagKeysRaw);
    }
    if has(FieldId::TagValue) || has(FieldId::TagValuesRaw) {
        columns.push(FieldId::TagValuesRaw);
    }
    Some(Select::grouped(without_sort(filter), Table::PageViews, columns))
}

fn join_or_left_join_events(select: &mut Select, filter: &Filter, fields: &[FieldId]) {
    if filter.negates_event_name() {
        select.include_event_filter = true;
        select.joins.push(Join::Left(left_join_events(filter, fields)));
    } else if let Some(events) = join_events(filter, fields) {
        select.joins.push(Join::Inner {
            alias: "k",
            select: events,
        });
    }
}

fn join_events(filter: &Filter, fields: &[FieldId]) -> Option<Select> {
    let has = |id| fields.contains(&id);
    if filter.event_name.is_empty() && !has(FieldId::EventName) {
        return None;
    }

    let mut columns = vec![FieldId::VisitorId, FieldId::SessionId];
    columns.extend(
        [
            FieldId::Hour,
            FieldId::Minute,
            FieldId::EventName,
            FieldId::EventPath,
            FieldId::EventTitle,
        ]
        .into_iter()
        .filter(|&id| has(id)),
    );
    if !filter.custom_metric_key.is_empty() && !filter.custom_metric_type.is_empty() {
        columns.extend([FieldId::EventMetaKeysRaw, FieldId::EventMetaValuesRaw]);
    } else {
        if [
            FieldId::EventMetaKeysRaw,
            FieldId::EventMetaKeys,
            FieldId::EventMeta,
            FieldId::EventMetaValues,
        ]
        .into_iter()
        .any(has)
        {
            columns.push(FieldId::EventMetaKeysRaw);
        }
        if [
            FieldId::EventMetaValuesRaw,
            FieldId::EventMetaValues,
            FieldId::EventMeta,
        ]
        .into_iter()
        .any(has)
        {
            columns.push(FieldId::EventMetaValuesRaw);
        }
    }

    let mut events_filter = without_sort(filter);
    events_filter.path.clear();
    events_filter.any_path.clear();
    Some(Select::grouped(events_filter, Table::Events, columns))
}

fn left_join_events(filter: &Filter, fields: &[FieldId]) -> Select {
    let has = |id| fields.contains(&id);
    let mut columns = vec![FieldId::VisitorId, FieldId::SessionId, FieldId::EventName];
    if !filter.event_meta.is_empty() || has(FieldId::EventMeta) || has(FieldId::EventMetaValues) {
        columns.extend([FieldId::EventMetaKeysRaw, FieldId::EventMetaValuesRaw]);
    } else if !filter.event_meta_key.is_empty() || has(FieldId::EventMetaKeys) {
        columns.push(FieldId::EventMetaKeysRaw);
    }
    columns.extend(
        [FieldId::EventPath, FieldId::EventTitle]
            .into_iter()
            .filter(|&id| has(id)),
    );

    let mut events_filter = without_sort(filter);
    events_filter.event_name.clear();
    events_filter.event_meta_key.clear();
    events_filter.event_meta.clear();
    Select::grouped(events_filter, Table::Events, columns)
}

/// Visitors per bucket over the whole window, the denominator of a
/// per-period conversion rate.
fn join_unique_visitors_by_period(
    filter: &Filter,
    fields: &[FieldId],
    group_by: &[FieldId],
) -> Result<Option<Join>, CompileError> {
    if !fields.contains(&FieldId::CrPeriod) {
        return Ok(None);
    }
    let bucket = if fields.contains(&FieldId::Day) {
        FieldId::Day
    } else if fields.contains(&FieldId::Minute) {
        FieldId::Minute
    } else {
        FieldId::Hour
    };
    let key = if group_by.contains(&FieldId::Hour) {
        "hour"
    } else if group_by.contains(&FieldId::Minute) {
        "minute"
    } else {
        bucket_alias(filter.period)?
    };

    let totals = Filter {
        client_id: filter.client_id,
        timezone: filter.timezone,
        from: filter.from,
        to: filter.to,
        period: filter.period,
        week_mode: filter.week_mode,
        include_time: filter.include_time,
        sample: filter.sample,
        ..Filter::default()
    };
    let mut select = Select::new(totals, Table::Sessions, &[bucket, FieldId::VisitorsRaw]);
    select.group_by = vec![bucket];
    Ok(Some(Join::Bucket { select, key }))
}

fn without_sort(filter: &Filter) -> Filter {
    Filter {
        sort: Vec::new(),
        ..filter.clone()
    }
}
