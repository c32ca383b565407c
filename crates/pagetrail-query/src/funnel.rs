//! Funnels: a chain of step filters, each narrowing the sessions of the one
//! before it.

use serde::Serialize;

use crate::catalog::FieldId;
use crate::compiler::{Compiler, QuerySpec};
use crate::error::CompileError;
use crate::filter::Filter;
use crate::fragment::Fragment;

pub const MIN_FUNNEL_STEPS: usize = 2;
pub const MAX_FUNNEL_STEPS: usize = 8;

const STEP_FIELDS: &[FieldId] = &[
    FieldId::ClientId,
    FieldId::VisitorId,
    FieldId::SessionId,
    FieldId::Time,
];

impl Compiler<'_> {
    /// One `stepN` CTE per filter; the query returns `(step, visitors)` rows
    /// ordered by step.
    pub fn compile_funnel(&self, steps: &[Filter]) -> Result<Fragment, CompileError> {
        if !(MIN_FUNNEL_STEPS..=MAX_FUNNEL_STEPS).contains(&steps.len()) {
            return Err(CompileError::FunnelSteps(steps.len()));
        }

        let query = QuerySpec::select(STEP_FIELDS);
        let mut ctes = Vec::with_capacity(steps.len());
        for (i, filter) in steps.iter().enumerate() {
            let mut cte = Fragment::new(format!("step{} AS (", i + 1));
            cte.append(self.compile_step(filter, &query, i + 1)?);
            cte.push_sql(")");
            ctes.push(cte);
        }

        let mut out = Fragment::new("WITH ");
        out.append_joined(ctes, ", ");
        let counts: Vec<String> = (1..=steps.len())
            .map(|n| format!("SELECT {n} step, uniq(visitor_id) visitors FROM step{n}"))
            .collect();
        out.push_sql(" SELECT * FROM (");
        out.push_sql(&counts.join(" UNION ALL "));
        out.push_sql(") ORDER BY step");
        Ok(out)
    }
}

/// One funnel step with its conversion figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelStep {
    pub step: u32,
    pub visitors: u64,
    /// Share of the first step's visitors.
    pub relative_visitors: f64,
    pub previous_visitors: u64,
    pub relative_previous_visitors: f64,
    pub dropped: u64,
    pub drop_off: f64,
}

impl FunnelStep {
    /// Derives the conversion figures from `(step, visitors)` rows in step order.
    pub fn from_counts(counts: &[(u32, u64)]) -> Vec<FunnelStep> {
        let first = counts.first().map_or(0, |&(_, visitors)| visitors);
        let mut steps: Vec<FunnelStep> = Vec::with_capacity(counts.len());
        for &(step, visitors) in counts {
            let relative_visitors = if first > 0 {
                visitors as f64 / first as f64
            } else {
                0.0
            };
            let (previous_visitors, relative_previous_visitors) = match steps.last() {
                Some(prev) => (prev.visitors, prev.relative_visitors),
                None => (0, 0.0),
            };
            let (dropped, drop_off) = if steps.is_empty() {
                (0, 0.0)
            } else if previous_visitors > 0 {
                (
                    previous_visitors.saturating_sub(visitors),
                    1.0 - visitors as f64 / previous_visitors as f64,
                )
            } else {
                (0, 0.0)
            };
            steps.push(FunnelStep {
                step,
                visitors,
                relative_visitors,
                previous_visitors,
                relative_previous_visitors,
                dropped,
                drop_off,
            });
        }
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(path: &str) -> Filter {
        Filter {
            path: vec![path.into()],
            ..Filter::new(1)
        }
        .normalize()
    }

    #[test]
    fn step_count_is_bounded() {
        let compiler = Compiler::default();
        assert_eq!(
            compiler.compile_funnel(&[step("/")]).expect_err("too few"),
            CompileError::FunnelSteps(1)
        );
        let nine: Vec<Filter> = (0..9).map(|_| step("/")).collect();
        assert_eq!(
            compiler.compile_funnel(&nine).expect_err("too many"),
            CompileError::FunnelSteps(9)
        );
    }

    #[test]
    fn later_steps_join_their_predecessor() {
        let fragment = Compiler::default()
            .compile_funnel(&[step("/"), step("/pricing"), step("/signup")])
            .expect("funnel");
        let sql = &fragment.sql;
        assert!(sql.starts_with("WITH step1 AS (SELECT t.client_id client_id,"));
        assert!(!sql.contains("JOIN step0"));
        assert!(sql.contains("JOIN step1 s ON t.visitor_id = s.visitor_id"));
        assert!(sql.contains("JOIN step2 s ON t.visitor_id = s.visitor_id"));
        assert!(sql.ends_with(
            "SELECT 3 step, uniq(visitor_id) visitors FROM step3) ORDER BY step"
        ));
        assert!(!sql.contains("HAVING"));
        assert_eq!(fragment.placeholders(), fragment.args.len());
    }

    #[test]
    fn conversion_figures_follow_previous_step() {
        let steps = FunnelStep::from_counts(&[(1, 200), (2, 50), (3, 0)]);
        assert_eq!(steps[0].relative_visitors, 1.0);
        assert_eq!(steps[0].dropped, 0);
        assert_eq!(steps[1].previous_visitors, 200);
        assert_eq!(steps[1].dropped, 150);
        assert_eq!(steps[1].drop_off, 0.75);
        assert_eq!(steps[1].relative_visitors, 0.25);
        assert_eq!(steps[2].relative_previous_visitors, 0.25);
        assert_eq!(steps[2].drop_off, 1.0);
    }
}
