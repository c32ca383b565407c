use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, FieldId};
use crate::error::CompileError;
use crate::filter::Filter;
use crate::fragment::Fragment;
use crate::lower::Lowering;
use crate::plan;

/// What a query returns: the select list, its grouping and default order,
/// and optionally the imported table and columns to merge in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub fields: Vec<FieldId>,
    #[serde(default)]
    pub group_by: Vec<FieldId>,
    #[serde(default)]
    pub order_by: Vec<FieldId>,
    /// Imported side columns; the first one is the join key.
    #[serde(default)]
    pub imported_fields: Vec<FieldId>,
    #[serde(default)]
    pub imported_table: Option<String>,
}

impl QuerySpec {
    pub fn select(fields: &[FieldId]) -> Self {
        Self {
            fields: fields.to_vec(),
            ..Self::default()
        }
    }

    pub fn group_by(mut self, fields: &[FieldId]) -> Self {
        self.group_by = fields.to_vec();
        self
    }

    pub fn order_by(mut self, fields: &[FieldId]) -> Self {
        self.order_by = fields.to_vec();
        self
    }

    pub fn imported(mut self, table: impl Into<String>, fields: &[FieldId]) -> Self {
        self.imported_table = Some(table.into());
        self.imported_fields = fields.to_vec();
        self
    }
}

/// Compiles filters into store queries.
///
/// Holds no state besides the catalog, so one compiler can serve any number
/// of concurrent callers.
#[derive(Clone, Copy)]
pub struct Compiler<'c> {
    catalog: &'c Catalog,
}

impl<'c> Compiler<'c> {
    pub fn new(catalog: &'c Catalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &'c Catalog {
        self.catalog
    }

    /// Compiles `query` under `filter`, which should already be normalized.
    ///
    /// The returned fragment has exactly one argument per placeholder, in
    /// textual order.
    pub fn compile(&self, filter: &Filter, query: &QuerySpec) -> Result<Fragment, CompileError> {
        self.compile_step(filter, query, 0)
    }

    pub(crate) fn compile_step(
        &self,
        filter: &Filter,
        query: &QuerySpec,
        funnel_step: usize,
    ) -> Result<Fragment, CompileError> {
        let node = plan::build(self.catalog, filter, query, funnel_step)?;
        let fragment = Lowering::new(self.catalog).node(&node)?;
        tracing::debug!(
            client_id = filter.client_id,
            fields = query.fields.len(),
            args = fragment.args.len(),
            merged = matches!(node, plan::Node::FullOuterMerge(_)),
            "query compiled"
        );
        Ok(fragment)
    }
}

impl Default for Compiler<'static> {
    fn default() -> Self {
        Self::new(Catalog::shared())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_shape_reads_snake_case_fields() {
        let shape: QuerySpec =
            serde_json::from_str(r#"{"fields":["visitors","bounce_rate"],"group_by":[]}"#)
                .expect("parse");
        assert_eq!(shape, QuerySpec::select(&[FieldId::Visitors, FieldId::BounceRate]));
    }

    #[test]
    fn compiling_twice_is_identical() {
        let filter = Filter::new(3).normalize();
        let query = QuerySpec::select(&[FieldId::Path, FieldId::Visitors])
            .group_by(&[FieldId::Path])
            .order_by(&[FieldId::Visitors, FieldId::Path]);
        let compiler = Compiler::default();
        let first = compiler.compile(&filter, &query).expect("compile");
        let second = compiler.compile(&filter, &query).expect("compile");
        assert_eq!(first, second);
        assert_eq!(first.placeholders(), first.args.len());
    }
}
