//! Lowers a [`Node`] tree to SQL text and its positional arguments.

use pagetrail_core::{Direction, Period};

use crate::catalog::{Catalog, FieldId, RenderContext, Source};
use crate::error::CompileError;
use crate::filter::{Filter, Sort};
use crate::fragment::Fragment;
use crate::plan::{Column, Join, Merge, Node, Select};
use crate::predicates::{imported_groups, live_groups, time_window, write_groups, Scope};
use crate::table::Table;

/// Output alias of the day field bucketed by `period`.
pub(crate) fn bucket_alias(period: Period) -> Result<&'static str, CompileError> {
    match period {
        Period::Day => Ok("day"),
        Period::Week => Ok("week"),
        Period::Month => Ok("month"),
        Period::Year => Ok("year"),
        Period::Hour => Err(CompileError::UnsupportedPeriod(period)),
    }
}

/// Truncates a date expression to the start of its period, aliased.
fn bucket_start(filter: &Filter, date: Fragment) -> Result<Fragment, CompileError> {
    let alias = bucket_alias(filter.period)?;
    let Fragment { sql, args } = date;
    let sql = match filter.period {
        Period::Week => format!("toStartOfWeek({sql}, {})", filter.week_mode.mode()),
        Period::Month => format!("toStartOfMonth({sql})"),
        Period::Year => format!("toStartOfYear({sql})"),
        Period::Day | Period::Hour => sql,
    };
    Ok(Fragment {
        sql: format!("{sql} {alias}"),
        args,
    })
}

/// `WITH FILL` over the (possibly imported-extended) window.
fn with_fill(filter: &Filter) -> Result<Option<Fragment>, CompileError> {
    let from = filter
        .from
        .map(|from| filter.imported.start().map_or(from, |imported| imported.min(from)));
    let (Some(from), Some(to)) = (from, filter.to) else {
        return Ok(None);
    };
    let sql = match filter.period {
        Period::Day => "WITH FILL FROM toDate(?) TO toDate(?)+1 STEP INTERVAL 1 DAY".to_string(),
        Period::Week => format!(
            "WITH FILL FROM toStartOfWeek(toDate(?), {}) TO toDate(?)+1 STEP INTERVAL 1 WEEK",
            filter.week_mode.mode()
        ),
        Period::Month => {
            "WITH FILL FROM toStartOfMonth(toDate(?)) TO toDate(?)+1 STEP INTERVAL 1 MONTH"
                .to_string()
        }
        Period::Year => {
            "WITH FILL FROM toStartOfYear(toDate(?)) TO toDate(?)+1 STEP INTERVAL 1 YEAR"
                .to_string()
        }
        Period::Hour => return Err(CompileError::UnsupportedPeriod(Period::Hour)),
    };
    let mut fill = Fragment::bound(sql, from.date_naive());
    fill.bind(to.date_naive());
    Ok(Some(fill))
}

fn render_context(filter: &Filter, source: Source) -> RenderContext<'_> {
    RenderContext {
        sample: filter.sample,
        custom_metric: filter.custom_metric(),
        meta_key: filter.event_meta_key.first().map(String::as_str),
        tag_key: filter.tag.first().map(String::as_str),
        custom_metric_key: Some(filter.custom_metric_key.as_str())
            .filter(|key| !key.is_empty()),
        ..RenderContext::new(source, filter.timezone())
    }
}

fn aliased(mut expr: Fragment, name: &str) -> Fragment {
    if !name.is_empty() && expr.sql != name {
        expr.push_sql(" ");
        expr.push_sql(name);
    }
    expr
}

fn write_limit(limit: i64, offset: i64, out: &mut Fragment) {
    if limit > 0 {
        out.push_sql(&format!(" LIMIT {limit}"));
        if offset > 0 {
            out.push_sql(&format!(" OFFSET {offset}"));
        }
    }
}

pub(crate) struct Lowering<'c> {
    catalog: &'c Catalog,
}

impl<'c> Lowering<'c> {
    pub fn new(catalog: &'c Catalog) -> Self {
        Self { catalog }
    }

    pub fn node(&self, node: &Node) -> Result<Fragment, CompileError> {
        match node {
            Node::Base(select) => self.select(select),
            Node::FullOuterMerge(merge) => self.merge(merge),
        }
    }

    fn select(&self, select: &Select) -> Result<Fragment, CompileError> {
        let filter = &select.filter;
        let time = time_window(filter, "time", filter.from, filter.to);
        let ctx = RenderContext {
            time: Some(&time),
            ..render_context(filter, select.table.source())
        };

        let mut out = Fragment::new("SELECT ");
        out.append_joined(self.columns(select, &ctx)?, ", ");
        if select.is_scalar() {
            return Ok(out);
        }

        out.push_sql(" FROM ");
        out.push_sql(select.table.sql());
        if select.final_sessions && select.table == Table::Sessions {
            out.push_sql(" FINAL");
        }
        if filter.sample > 0 {
            out.push_sql(&format!(" SAMPLE {}", filter.sample));
        }
        for join in &select.joins {
            self.join(join, &mut out)?;
        }
        if select.funnel_step > 1 {
            out.push_sql(&format!(
                " JOIN step{} s ON t.visitor_id = s.visitor_id AND t.session_id = s.session_id",
                select.funnel_step - 1
            ));
        }

        out.push_sql(" WHERE ");
        out.append(time.clone());
        let scope = Scope {
            filter,
            table: select.table,
            include_event_filter: select.include_event_filter,
            preset: select.preset,
        };
        write_groups(live_groups(self.catalog, &scope), &mut out);

        let groups = self.group_terms(filter, &select.group_by, select.nested)?;
        if !groups.is_empty() {
            out.push_sql(" GROUP BY ");
            out.push_sql(&groups.join(", "));
        }
        // Retracted sessions cancel out once their signs are summed.
        if select.table == Table::Sessions && select.funnel_step == 0 {
            out.push_sql(" HAVING sum(sign) > 0");
        }
        self.order_by(filter, &filter.sort, &select.order_by, &mut out)?;
        write_limit(select.limit, select.offset, &mut out);
        Ok(out)
    }

    fn columns(
        &self,
        select: &Select,
        ctx: &RenderContext<'_>,
    ) -> Result<Vec<Fragment>, CompileError> {
        let mut columns = Vec::with_capacity(select.columns.len());
        for column in &select.columns {
            match column {
                Column::Field(id) => {
                    let Some(expr) = self.catalog.render(*id, ctx)? else {
                        continue;
                    };
                    let field = self.catalog.get(*id);
                    let nested_title =
                        select.nested && matches!(id, FieldId::EntryTitle | FieldId::ExitTitle);
                    if *id == FieldId::Day && select.filter.period != Period::Day {
                        columns.push(bucket_start(&select.filter, expr)?);
                    } else if nested_title {
                        columns.push(expr);
                    } else {
                        columns.push(aliased(expr, field.name));
                    }
                }
                Column::Correlated { field, select: sub } => {
                    let mut expr = Fragment::new("toInt64OrDefault((");
                    expr.append(self.select(sub)?);
                    expr.push_sql(&format!(")) {}", self.catalog.get(*field).name));
                    columns.push(expr);
                }
            }
        }
        if columns.is_empty() {
            return Err(CompileError::NoColumns);
        }
        Ok(columns)
    }

    fn join(&self, join: &Join, out: &mut Fragment) -> Result<(), CompileError> {
        match join {
            Join::Inner { alias, select } => {
                out.push_sql(" JOIN (");
                out.append(self.select(select)?);
                out.push_sql(&format!(
                    ") {alias} ON {alias}.visitor_id = t.visitor_id AND {alias}.session_id = t.session_id"
                ));
                if select.group_by.contains(&FieldId::Hour) {
                    out.push_sql(&format!(" AND {alias}.hour = hour"));
                } else if select.group_by.contains(&FieldId::Minute) {
                    out.push_sql(&format!(" AND {alias}.minute = minute"));
                }
            }
            Join::Left(select) => {
                out.push_sql(" LEFT JOIN (");
                out.append(self.select(select)?);
                out.push_sql(") l ON l.visitor_id = t.visitor_id AND l.session_id = t.session_id");
            }
            Join::Bucket { select, key } => {
                out.push_sql(" JOIN (");
                out.append(self.select(select)?);
                out.push_sql(&format!(") uvd ON {key} = uvd.{key}"));
            }
        }
        Ok(())
    }

    fn group_terms(
        &self,
        filter: &Filter,
        group_by: &[FieldId],
        nested: bool,
    ) -> Result<Vec<String>, CompileError> {
        group_by
            .iter()
            .map(|&id| {
                let field = self.catalog.get(id);
                Ok(match id {
                    FieldId::Day if filter.period != Period::Day => {
                        bucket_alias(filter.period)?.to_string()
                    }
                    FieldId::EntryTitle | FieldId::ExitTitle if nested => {
                        field.sessions.to_string()
                    }
                    FieldId::VisitorId | FieldId::SessionId => format!("t.{}", field.name),
                    _ => field.name.to_string(),
                })
            })
            .collect()
    }

    /// Caller sort terms replace the default ordering entirely.
    fn order_by(
        &self,
        filter: &Filter,
        sort: &[Sort],
        defaults: &[FieldId],
        out: &mut Fragment,
    ) -> Result<(), CompileError> {
        let terms: Vec<(FieldId, Option<Direction>)> = if sort.is_empty() {
            defaults
                .iter()
                .map(|&id| (id, self.catalog.get(id).direction))
                .collect()
        } else {
            sort.iter().map(|s| (s.field, Some(s.direction))).collect()
        };
        if terms.is_empty() {
            return Ok(());
        }

        let mut parts = Vec::with_capacity(terms.len());
        for (id, direction) in terms {
            let field = self.catalog.get(id);
            let dir = direction
                .map(|d| format!(" {}", d.as_sql()))
                .unwrap_or_default();
            let term = if let Some(fill) = field.fixed_fill {
                Fragment::new(format!("{}{dir} {fill}", field.name))
            } else if field.gap_fill {
                let name = match id {
                    FieldId::Day => bucket_alias(filter.period)?,
                    _ => field.name,
                };
                let mut term = Fragment::new(format!("{name}{dir}"));
                if let Some(fill) = with_fill(filter)? {
                    term.push_sql(" ");
                    term.append(fill);
                }
                term
            } else if id == FieldId::City {
                Fragment::new(format!("normalizeUTF8NFKD({}){dir}", field.name))
            } else {
                Fragment::new(format!("{}{dir}", field.name))
            };
            parts.push(term);
        }
        out.push_sql(" ORDER BY ");
        out.append_joined(parts, ", ");
        Ok(())
    }

    fn merge(&self, merge: &Merge) -> Result<Fragment, CompileError> {
        let live = &merge.live;
        let filter = &live.filter;
        let Some(&key) = merge.fields.first() else {
            return self.select(live);
        };
        let key_field = self.catalog.get(key);
        let live_time = time_window(filter, "time", filter.from, filter.to);
        let imported_time = time_window(
            filter,
            "date",
            filter.imported.start(),
            filter.imported.end(),
        );

        let merged = RenderContext {
            time: Some(&live_time),
            imported_table: Some(merge.table.as_str()),
            imported_time: Some(&imported_time),
            ..render_context(filter, Source::Merged)
        };
        let mut columns = Vec::new();
        for id in live.fields() {
            if id == FieldId::Day {
                let alias = bucket_alias(filter.period)?;
                columns.push(Fragment::new(format!(
                    "greatest(t.{alias}, imp.{alias}) {alias}"
                )));
                continue;
            }
            if let Some(expr) = self.catalog.render(id, &merged)? {
                columns.push(aliased(expr, self.catalog.get(id).name));
            }
        }

        if columns.is_empty() {
            return Err(CompileError::NoColumns);
        }
        let mut out = Fragment::new("SELECT ");
        out.append_joined(columns, ", ");
        out.push_sql(" FROM (");
        out.append(self.select(live)?);
        // Keeps one live row to join against when live data is empty.
        if key_field.additive {
            let zeros: Vec<String> = live
                .fields()
                .map(|id| {
                    let name = match id {
                        FieldId::Day => bucket_alias(filter.period)?,
                        _ => self.catalog.get(id).name,
                    };
                    Ok(format!("0 {name}"))
                })
                .collect::<Result<_, CompileError>>()?;
            out.push_sql(" UNION ALL (SELECT ");
            out.push_sql(&zeros.join(", "));
            out.push_sql(")");
        }

        let imported = render_context(filter, Source::Imported);
        let mut imported_columns = Vec::with_capacity(merge.fields.len());
        for &id in &merge.fields {
            let Some(expr) = self.catalog.render(id, &imported)? else {
                continue;
            };
            if id == FieldId::Day {
                imported_columns.push(bucket_start(filter, expr)?);
            } else {
                imported_columns.push(aliased(expr, self.catalog.get(id).name));
            }
        }
        if imported_columns.is_empty() {
            return Err(CompileError::NoColumns);
        }
        out.push_sql(") t FULL JOIN (SELECT ");
        out.append_joined(imported_columns, ", ");
        out.push_sql(&format!(" FROM \"{}\" WHERE ", merge.table));
        out.append(imported_time.clone());
        write_groups(imported_groups(self.catalog, filter, key), &mut out);
        if !key_field.additive && !key.is_platform() {
            let terms = self.group_terms(filter, &[key], false)?;
            out.push_sql(" GROUP BY ");
            out.push_sql(&terms.join(", "));
        }
        let join_key = match key {
            FieldId::Day => bucket_alias(filter.period)?,
            _ => key_field.name,
        };
        out.push_sql(&format!(") imp ON t.{join_key} = imp.{join_key}"));

        let groups = self.group_terms(filter, &merge.group_by, false)?;
        if !groups.is_empty() {
            out.push_sql(" GROUP BY ");
            out.push_sql(&groups.join(", "));
        }
        self.order_by(filter, &merge.sort, &merge.order_by, &mut out)?;
        write_limit(merge.limit, merge.offset, &mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};
    use pagetrail_core::{Arg, WeekMode};

    use super::*;
    use crate::compiler::QuerySpec;
    use crate::plan;

    fn lower(filter: &Filter, query: &QuerySpec) -> Fragment {
        let catalog = Catalog::shared();
        let node = plan::build(catalog, filter, query, 0).expect("plan");
        Lowering::new(catalog).node(&node).expect("lower")
    }

    fn window() -> Filter {
        Filter {
            from: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).single().expect("timestamp")),
            to: Some(Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).single().expect("timestamp")),
            ..Filter::new(7)
        }
    }

    #[test]
    fn session_queries_drop_retracted_rows() {
        let sql = lower(&window(), &QuerySpec::select(&[FieldId::Visitors])).sql;
        assert!(sql.starts_with("SELECT uniq(t.visitor_id) visitors FROM \"session\" t WHERE"));
        assert!(sql.ends_with(" HAVING sum(sign) > 0"));
    }

    #[test]
    fn weekly_series_buckets_and_fills() {
        let filter = Filter {
            period: Period::Week,
            week_mode: WeekMode::Monday,
            ..window()
        };
        let query = QuerySpec::select(&[FieldId::Day, FieldId::Visitors])
            .group_by(&[FieldId::Day])
            .order_by(&[FieldId::Day]);
        let fragment = lower(&filter, &query);
        assert!(fragment
            .sql
            .starts_with("SELECT toStartOfWeek(toDate(time, 'UTC'), 1) week,"));
        assert!(fragment.sql.contains(" GROUP BY week HAVING sum(sign) > 0 ORDER BY week ASC WITH FILL FROM toStartOfWeek(toDate(?), 1) TO toDate(?)+1 STEP INTERVAL 1 WEEK"));
        let march = |d| Arg::Date(NaiveDate::from_ymd_opt(2024, 3, d).expect("date"));
        assert_eq!(&fragment.args[fragment.args.len() - 2..], &[march(1), march(31)]);
        assert_eq!(fragment.placeholders(), fragment.args.len());
    }

    #[test]
    fn caller_sort_overrides_defaults() {
        let filter = Filter {
            sort: vec![Sort {
                field: FieldId::Visitors,
                direction: Direction::Asc,
            }],
            ..window()
        };
        let query = QuerySpec::select(&[FieldId::City, FieldId::Visitors])
            .group_by(&[FieldId::City])
            .order_by(&[FieldId::City]);
        let sql = lower(&filter, &query).sql;
        assert!(sql.ends_with(" ORDER BY visitors ASC"));

        let sql = lower(&window(), &query).sql;
        assert!(sql.ends_with(" ORDER BY normalizeUTF8NFKD(city) ASC"));
    }

    #[test]
    fn sampling_marks_table_and_scales_counts() {
        let filter = Filter {
            sample: 10_000,
            ..window()
        };
        let sql = lower(&filter, &QuerySpec::select(&[FieldId::Visitors])).sql;
        assert!(sql.contains("toUInt64(greatest(uniq(t.visitor_id)*any(_sample_factor), 0)) visitors"));
        assert!(sql.contains(" FROM \"session\" t SAMPLE 10000 WHERE"));
    }

    #[test]
    fn hourly_grouping_uses_fixed_fill_and_limit() {
        let filter = Filter {
            limit: 10,
            offset: 20,
            ..window()
        };
        let query = QuerySpec::select(&[FieldId::Hour, FieldId::Visitors])
            .group_by(&[FieldId::Hour])
            .order_by(&[FieldId::Hour]);
        let sql = lower(&filter, &query).sql;
        assert!(sql.contains("FROM \"page_view\" t"));
        assert!(sql.ends_with(" GROUP BY hour ORDER BY hour ASC WITH FILL FROM 0 TO 24 LIMIT 10 OFFSET 20"));
    }

    #[test]
    fn day_buckets_reject_hour_period() {
        let filter = Filter {
            period: Period::Hour,
            ..window()
        };
        let query = QuerySpec::select(&[FieldId::Day, FieldId::Visitors]).group_by(&[FieldId::Day]);
        let catalog = Catalog::shared();
        let node = plan::build(catalog, &filter, &query, 0).expect("plan");
        assert_eq!(
            Lowering::new(catalog).node(&node).expect_err("hour bucket"),
            CompileError::UnsupportedPeriod(Period::Hour)
        );
    }
}
