use pagetrail_core::Period;
use thiserror::Error;

use crate::catalog::{FieldId, Source};

#[derive(Debug, Error, PartialEq)]
pub enum CompileError {
    /// The period cannot bucket the day field, gap-fill or key a per-bucket join.
    #[error("period '{0}' is not supported here")]
    UnsupportedPeriod(Period),
    #[error("field {field:?} has no {target} expression")]
    MissingExpression { field: FieldId, target: Source },
    /// Every requested field needs a key or metric type the filter lacks.
    #[error("no requested field can be rendered")]
    NoColumns,
    #[error("a funnel needs between 2 and 8 steps, got {0}")]
    FunnelSteps(usize),
}
