use cirrus_connectors::sources::d1::{D1TableProvider, SortKey};
use datafusion::common::tree_node::{Transformed, TreeNode};
use datafusion::datasource::{provider_as_source, source_as_provider, TableProvider};
use datafusion::error::Result;
use datafusion::logical_expr::{Expr, FetchType, Limit, LogicalPlan, SkipType, Sort, TableScan};
use datafusion::optimizer::optimizer::{OptimizerConfig, OptimizerRule};
use std::sync::Arc;

/// Pushes constant row caps into remote D1 scans.
///
/// A `LIMIT n` (no OFFSET) sitting on a remote scan, possibly through
/// projections and subquery aliases, becomes the scan's fetch and the Limit
/// node is removed. A Sort with a fetch stays in the plan; when every sort key
/// is a plain column of the remote table, the keys and the cap are both sent
/// remotely so the capped rows are the right ones. Filter nodes are never
/// looked through: a cap above a filter the remote did not take is not pushed.
///
/// Placeholder or computed limits are left alone. Applying the rule to its
/// own output changes nothing.
#[derive(Default, Debug)]
pub struct RemoteLimitPushdown {}

impl RemoteLimitPushdown {
    pub fn new() -> Self {
        Self {}
    }
}

impl OptimizerRule for RemoteLimitPushdown {
    fn rewrite(
        &self,
        plan: LogicalPlan,
        _config: &dyn OptimizerConfig,
    ) -> Result<Transformed<LogicalPlan>> {
        plan.transform_down(|node| match node {
            LogicalPlan::Limit(limit) => push_limit(limit),
            LogicalPlan::Sort(sort) => push_top_n(sort),
            other => Ok(Transformed::no(other)),
        })
    }

    fn name(&self) -> &str {
        "remote_limit_pushdown"
    }
}

fn push_limit(limit: Limit) -> Result<Transformed<LogicalPlan>> {
    let no_offset = matches!(limit.get_skip_type()?, SkipType::Literal(0));
    let fetch = match limit.get_fetch_type()? {
        FetchType::Literal(Some(n)) if no_offset => n,
        _ => return Ok(Transformed::no(LogicalPlan::Limit(limit))),
    };
    if !reaches_remote_scan(&limit.input) {
        return Ok(Transformed::no(LogicalPlan::Limit(limit)));
    }

    tracing::debug!(fetch, "Pushing limit into remote scan");
    let input = Arc::unwrap_or_clone(limit.input);
    let rewritten = cap_chain(input, fetch, None)?;
    Ok(Transformed::yes(rewritten.data))
}

fn push_top_n(sort: Sort) -> Result<Transformed<LogicalPlan>> {
    let (Some(fetch), Some(keys)) = (sort.fetch, remote_sort_keys(&sort)) else {
        return Ok(Transformed::no(LogicalPlan::Sort(sort)));
    };

    let Sort {
        expr,
        input,
        fetch: sort_fetch,
    } = sort;
    let rewritten = cap_chain(Arc::unwrap_or_clone(input), fetch, Some(&keys))?;
    if rewritten.transformed {
        tracing::debug!(fetch, keys = keys.len(), "Pushing top-n into remote scan");
    }
    Ok(rewritten.update_data(|input| {
        LogicalPlan::Sort(Sort {
            expr,
            input: Arc::new(input),
            fetch: sort_fetch,
        })
    }))
}

fn remote_provider(scan: &TableScan) -> Option<Arc<dyn TableProvider>> {
    let provider = source_as_provider(&scan.source).ok()?;
    provider
        .as_any()
        .is::<D1TableProvider>()
        .then_some(provider)
}

fn reaches_remote_scan(plan: &LogicalPlan) -> bool {
    match plan {
        LogicalPlan::TableScan(scan) => remote_provider(scan).is_some(),
        LogicalPlan::Projection(projection) => reaches_remote_scan(&projection.input),
        LogicalPlan::SubqueryAlias(alias) => reaches_remote_scan(&alias.input),
        _ => false,
    }
}

fn remote_sort_keys(sort: &Sort) -> Option<Vec<SortKey>> {
    let keys = sort
        .expr
        .iter()
        .map(|s| match &s.expr {
            Expr::Column(column) => Some(SortKey {
                column: column.name.clone(),
                descending: !s.asc,
                nulls_first: s.nulls_first,
            }),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    keys_pass_through(&sort.input, &keys).then_some(keys)
}

/// Every key must reach the scan as the same unaliased column, and SQLite must
/// order that column the way DataFusion does.
fn keys_pass_through(plan: &LogicalPlan, keys: &[SortKey]) -> bool {
    match plan {
        LogicalPlan::TableScan(scan) => remote_provider(scan).is_some_and(|provider| {
            provider
                .as_any()
                .downcast_ref::<D1TableProvider>()
                .is_some_and(|d1| keys.iter().all(|k| d1.compares_like_remote(&k.column)))
        }),
        LogicalPlan::Projection(projection) => {
            keys.iter().all(|k| {
                projection
                    .expr
                    .iter()
                    .any(|e| matches!(e, Expr::Column(c) if c.name == k.column))
            }) && keys_pass_through(&projection.input, keys)
        }
        LogicalPlan::SubqueryAlias(alias) => keys_pass_through(&alias.input, keys),
        _ => false,
    }
}

fn cap_chain(
    plan: LogicalPlan,
    fetch: usize,
    ordering: Option<&[SortKey]>,
) -> Result<Transformed<LogicalPlan>> {
    match plan {
        LogicalPlan::TableScan(scan) => Ok(cap_scan(scan, fetch, ordering)),
        LogicalPlan::Projection(_) | LogicalPlan::SubqueryAlias(_) => {
            plan.map_children(|child| cap_chain(child, fetch, ordering))
        }
        other => Ok(Transformed::no(other)),
    }
}

fn cap_scan(
    mut scan: TableScan,
    fetch: usize,
    ordering: Option<&[SortKey]>,
) -> Transformed<LogicalPlan> {
    let Some(provider) = remote_provider(&scan) else {
        return Transformed::no(LogicalPlan::TableScan(scan));
    };
    let Some(d1) = provider.as_any().downcast_ref::<D1TableProvider>() else {
        return Transformed::no(LogicalPlan::TableScan(scan));
    };

    let capped = scan.fetch.map_or(fetch, |f| f.min(fetch));
    let reorder = ordering.filter(|keys| d1.ordering() != *keys);
    if scan.fetch == Some(capped) && reorder.is_none() {
        return Transformed::no(LogicalPlan::TableScan(scan));
    }

    if let Some(keys) = reorder {
        scan.source = provider_as_source(Arc::new(d1.with_ordering(keys.to_vec())));
    }
    scan.fetch = Some(capped);
    Transformed::yes(LogicalPlan::TableScan(scan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_common::credentials::EndpointIdentity;
    use cirrus_connectors::sources::d1::{map_type, ColumnDescriptor, D1Client};
    use cirrus_connectors::sources::HttpTransport;
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use datafusion::datasource::empty::EmptyTable;
    use datafusion::logical_expr::expr_fn::placeholder;
    use datafusion::logical_expr::LogicalPlanBuilder;
    use datafusion::optimizer::OptimizerContext;
    use datafusion::prelude::{col, lit};
    use std::time::Duration;

    fn users() -> Arc<D1TableProvider> {
        let column = |position: usize, name: &str, declared: &str| ColumnDescriptor {
            position,
            name: name.to_string(),
            declared_type: declared.to_string(),
            data_type: map_type(declared),
            not_null: false,
            default_value: None,
            primary_key: position == 0,
        };
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let client = D1Client::new(Arc::new(transport), "http://127.0.0.1:1", 100).unwrap();
        Arc::new(D1TableProvider::with_columns(
            Arc::new(client),
            EndpointIdentity::new("acct", "tok").with_target("db-1"),
            "users",
            vec![
                column(0, "id", "INTEGER"),
                column(1, "name", "TEXT"),
                column(2, "price", "NUMERIC"),
            ],
            1024,
        ))
    }

    fn scan_users() -> LogicalPlanBuilder {
        LogicalPlanBuilder::scan("users", provider_as_source(users()), None).unwrap()
    }

    fn optimize(plan: LogicalPlan) -> Transformed<LogicalPlan> {
        RemoteLimitPushdown::new()
            .rewrite(plan, &OptimizerContext::new())
            .unwrap()
    }

    fn scan_of(plan: &LogicalPlan) -> TableScan {
        match plan {
            LogicalPlan::TableScan(scan) => scan.clone(),
            other => scan_of(other.inputs()[0]),
        }
    }

    fn ordering_of(scan: &TableScan) -> Vec<SortKey> {
        let provider = source_as_provider(&scan.source).unwrap();
        provider
            .as_any()
            .downcast_ref::<D1TableProvider>()
            .unwrap()
            .ordering()
            .to_vec()
    }

    #[test]
    fn test_limit_is_pushed_through_projection_and_removed() {
        let plan = scan_users()
            .project(vec![col("name")])
            .unwrap()
            .limit(0, Some(5))
            .unwrap()
            .build()
            .unwrap();

        let result = optimize(plan);
        assert!(result.transformed);
        assert!(matches!(result.data, LogicalPlan::Projection(_)));
        assert_eq!(scan_of(&result.data).fetch, Some(5));
    }

    #[test]
    fn test_tighter_existing_fetch_is_kept() {
        let plan = scan_users().limit(0, Some(2)).unwrap().build().unwrap();
        let once = optimize(plan).data;
        let plan = LogicalPlanBuilder::from(once).limit(0, Some(10)).unwrap().build().unwrap();
        assert_eq!(scan_of(&optimize(plan).data).fetch, Some(2));
    }

    #[test]
    fn test_rule_is_idempotent() {
        let plan = scan_users()
            .project(vec![col("id")])
            .unwrap()
            .limit(0, Some(3))
            .unwrap()
            .build()
            .unwrap();
        let once = optimize(plan).data;
        let twice = optimize(once.clone());
        assert!(!twice.transformed);
        assert_eq!(
            once.display_indent().to_string(),
            twice.data.display_indent().to_string()
        );
    }

    #[test]
    fn test_offset_and_placeholder_limits_are_left_alone() {
        let with_offset = scan_users().limit(2, Some(5)).unwrap().build().unwrap();
        let result = optimize(with_offset);
        assert!(!result.transformed);
        assert!(matches!(result.data, LogicalPlan::Limit(_)));

        let parameterized = scan_users()
            .limit_by_expr(None, Some(placeholder("$1")))
            .unwrap()
            .build()
            .unwrap();
        let result = optimize(parameterized);
        assert!(!result.transformed);
        assert_eq!(scan_of(&result.data).fetch, None);
    }

    #[test]
    fn test_limit_above_filter_is_not_pushed() {
        let plan = scan_users()
            .filter(col("name").like(lit("B%")))
            .unwrap()
            .limit(0, Some(1))
            .unwrap()
            .build()
            .unwrap();
        let result = optimize(plan);
        assert!(!result.transformed);
        assert_eq!(scan_of(&result.data).fetch, None);
    }

    #[test]
    fn test_top_n_keeps_sort_and_pushes_cap_with_ordering() {
        let plan = scan_users()
            .sort_with_limit(vec![col("id").sort(false, true)], Some(3))
            .unwrap()
            .build()
            .unwrap();

        let result = optimize(plan);
        assert!(result.transformed);
        let LogicalPlan::Sort(sort) = &result.data else {
            panic!("sort should stay in the plan");
        };
        assert_eq!(sort.fetch, Some(3));
        let scan = scan_of(&result.data);
        assert_eq!(scan.fetch, Some(3));
        assert_eq!(
            ordering_of(&scan),
            vec![SortKey {
                column: "id".to_string(),
                descending: true,
                nulls_first: true,
            }]
        );
        assert!(!optimize(result.data).transformed);
    }

    #[test]
    fn test_top_n_on_computed_key_is_not_pushed() {
        let plan = scan_users()
            .sort_with_limit(vec![(col("id") + lit(1)).sort(true, false)], Some(3))
            .unwrap()
            .build()
            .unwrap();
        let result = optimize(plan);
        assert!(!result.transformed);
        assert_eq!(scan_of(&result.data).fetch, None);
    }

    #[test]
    fn test_top_n_on_numeric_affinity_text_is_not_pushed() {
        let plan = scan_users()
            .sort_with_limit(vec![col("price").sort(true, false)], Some(3))
            .unwrap()
            .build()
            .unwrap();
        let result = optimize(plan);
        assert!(!result.transformed);
        let scan = scan_of(&result.data);
        assert_eq!(scan.fetch, None);
        assert!(ordering_of(&scan).is_empty());
    }

    #[test]
    fn test_local_tables_are_ignored() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        let local = Arc::new(EmptyTable::new(schema));
        let plan = LogicalPlanBuilder::scan("local", provider_as_source(local), None)
            .unwrap()
            .limit(0, Some(5))
            .unwrap()
            .build()
            .unwrap();
        let result = optimize(plan);
        assert!(!result.transformed);
        assert!(matches!(result.data, LogicalPlan::Limit(_)));
    }
}
