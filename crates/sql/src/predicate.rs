//! Filter pushdown for remote scans.
//!
//! Only filters the remote evaluates identically to DataFusion are translated:
//! a bare column compared with a literal using `= != < > <= >=` (either operand
//! order), or an AND of such comparisons. Anything else stays with DataFusion.

use datafusion::logical_expr::utils::split_conjunction;
use datafusion::logical_expr::{BinaryExpr, Expr, Operator};
use datafusion::scalar::ScalarValue;

use crate::quote::{quote_identifier, quote_literal};

/// Translates a filter into remote WHERE-clause text, or `None` when the
/// filter has to be evaluated locally.
pub fn translate(expr: &Expr) -> Option<String> {
    match expr {
        Expr::BinaryExpr(BinaryExpr {
            op: Operator::And, ..
        }) => {
            let parts = split_conjunction(expr)
                .into_iter()
                .map(translate_comparison)
                .collect::<Option<Vec<_>>>()?;
            Some(format!("({})", parts.join(" AND ")))
        }
        _ => translate_comparison(expr),
    }
}

/// Like [`translate`], but only when `comparable` accepts every column the
/// filter reads.
pub fn translate_with<F>(expr: &Expr, comparable: F) -> Option<String>
where
    F: Fn(&str) -> bool,
{
    if !expr.column_refs().iter().all(|c| comparable(&c.name)) {
        return None;
    }
    translate(expr)
}

/// Moves every translatable filter out of `filters` and appends its text to
/// `where_clauses`. Returns the residual filters DataFusion must still apply.
pub fn push_down_filters(filters: Vec<Expr>, where_clauses: &mut Vec<String>) -> Vec<Expr> {
    let mut residual = Vec::new();
    for filter in filters {
        match translate(&filter) {
            Some(sql) => {
                tracing::debug!(filter = %filter, pushed = %sql, "Filter pushed to remote");
                where_clauses.push(sql);
            }
            None => residual.push(filter),
        }
    }
    residual
}

/// Joins accumulated WHERE fragments with AND. `None` when nothing was pushed.
pub fn join_conjuncts(clauses: &[String]) -> Option<String> {
    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

fn translate_comparison(expr: &Expr) -> Option<String> {
    let Expr::BinaryExpr(BinaryExpr { left, op, right }) = expr else {
        return None;
    };
    let (column, op, value) = match (left.as_ref(), right.as_ref()) {
        (Expr::Column(c), Expr::Literal(v, _)) => (c, *op, v),
        (Expr::Literal(v, _), Expr::Column(c)) => (c, mirror(*op)?, v),
        _ => return None,
    };
    Some(format!(
        "{} {} {}",
        quote_identifier(&column.name),
        comparison_symbol(op)?,
        render_literal(value)?
    ))
}

/// The operator that keeps `lit op col` meaning the same as `col op' lit`.
fn mirror(op: Operator) -> Option<Operator> {
    match op {
        Operator::Eq | Operator::NotEq => Some(op),
        Operator::Lt => Some(Operator::Gt),
        Operator::Gt => Some(Operator::Lt),
        Operator::LtEq => Some(Operator::GtEq),
        Operator::GtEq => Some(Operator::LtEq),
        _ => None,
    }
}

fn comparison_symbol(op: Operator) -> Option<&'static str> {
    match op {
        Operator::Eq => Some("="),
        Operator::NotEq => Some("!="),
        Operator::Lt => Some("<"),
        Operator::Gt => Some(">"),
        Operator::LtEq => Some("<="),
        Operator::GtEq => Some(">="),
        _ => None,
    }
}

/// Literal text in SQLite syntax. Kinds whose text form SQLite would read
/// differently (dates, decimals, binary, non-finite floats) are not rendered.
/// Float zeros are not rendered either: DataFusion orders `-0.0` below `0.0`
/// while SQLite treats them as equal.
fn render_literal(value: &ScalarValue) -> Option<String> {
    if value.is_null() {
        return Some("NULL".to_string());
    }
    match value {
        ScalarValue::Utf8(Some(s))
        | ScalarValue::LargeUtf8(Some(s))
        | ScalarValue::Utf8View(Some(s)) => Some(quote_literal(s)),
        ScalarValue::Boolean(Some(b)) => Some(if *b { "1" } else { "0" }.to_string()),
        ScalarValue::Int8(Some(v)) => Some(v.to_string()),
        ScalarValue::Int16(Some(v)) => Some(v.to_string()),
        ScalarValue::Int32(Some(v)) => Some(v.to_string()),
        ScalarValue::Int64(Some(v)) => Some(v.to_string()),
        ScalarValue::UInt8(Some(v)) => Some(v.to_string()),
        ScalarValue::UInt16(Some(v)) => Some(v.to_string()),
        ScalarValue::UInt32(Some(v)) => Some(v.to_string()),
        ScalarValue::UInt64(Some(v)) => Some(v.to_string()),
        ScalarValue::Float32(Some(v)) if v.is_finite() && *v != 0.0 => Some(v.to_string()),
        ScalarValue::Float64(Some(v)) if v.is_finite() && *v != 0.0 => Some(v.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::common::Column;
    use datafusion::prelude::{col, lit};

    #[test]
    fn test_column_literal_comparisons() {
        assert_eq!(translate(&col("id").eq(lit(2i64))), Some("id = 2".into()));
        assert_eq!(translate(&col("id").not_eq(lit(2i64))), Some("id != 2".into()));
        assert_eq!(translate(&col("id").lt_eq(lit(7i32))), Some("id <= 7".into()));
        assert_eq!(
            translate(&col("name").eq(lit("Bo"))),
            Some("name = 'Bo'".into())
        );
    }

    #[test]
    fn test_reversed_operands_mirror_the_operator() {
        assert_eq!(translate(&lit(5i64).lt(col("age"))), Some("age > 5".into()));
        assert_eq!(translate(&lit(5i64).gt_eq(col("age"))), Some("age <= 5".into()));
        assert_eq!(translate(&lit(5i64).eq(col("age"))), Some("age = 5".into()));
    }

    #[test]
    fn test_literal_rendering() {
        assert_eq!(
            translate(&col("name").eq(lit("O'Brien"))),
            Some("name = 'O''Brien'".into())
        );
        assert_eq!(translate(&col("active").eq(lit(true))), Some("active = 1".into()));
        assert_eq!(translate(&col("active").eq(lit(false))), Some("active = 0".into()));
        assert_eq!(
            translate(&col("score").gt(lit(ScalarValue::Float64(None)))),
            Some("score > NULL".into())
        );
        assert_eq!(translate(&col("score").gt(lit(2.5f64))), Some("score > 2.5".into()));
        assert_eq!(translate(&col("score").gt(lit(f64::NAN))), None);
        assert_eq!(translate(&col("score").eq(lit(0.0f64))), None);
        assert_eq!(translate(&col("score").eq(lit(-0.0f64))), None);
    }

    #[test]
    fn test_awkward_column_names_are_quoted() {
        assert_eq!(
            translate(&Expr::Column(Column::from_name("order")).eq(lit(1i64))),
            Some("\"order\" = 1".into())
        );
    }

    #[test]
    fn test_conjunction_requires_every_child() {
        let both = col("id").gt(lit(1i64)).and(col("name").eq(lit("Bo")));
        assert_eq!(translate(&both), Some("(id > 1 AND name = 'Bo')".into()));

        let three = col("a")
            .eq(lit(1i64))
            .and(col("b").eq(lit(2i64)))
            .and(col("c").eq(lit(3i64)));
        assert_eq!(translate(&three), Some("(a = 1 AND b = 2 AND c = 3)".into()));

        let partial = col("id").gt(lit(1i64)).and(col("name").like(lit("B%")));
        assert_eq!(translate(&partial), None);
    }

    #[test]
    fn test_unsupported_shapes_stay_local() {
        assert_eq!(translate(&col("a").eq(col("b"))), None);
        assert_eq!(translate(&lit(1i64).eq(lit(1i64))), None);
        assert_eq!(translate(&col("id").gt(lit(1i64)).or(col("id").lt(lit(0i64)))), None);
        assert_eq!(translate(&(col("id") + lit(1i64)).eq(lit(3i64))), None);
        assert_eq!(translate(&col("name").is_null()), None);
    }

    #[test]
    fn test_translate_with_checks_every_column() {
        let numeric_free = |name: &str| name != "amount";
        assert_eq!(
            translate_with(&col("id").eq(lit(1i64)), numeric_free),
            Some("id = 1".into())
        );
        assert_eq!(translate_with(&col("amount").lt(lit("10")), numeric_free), None);
        let mixed = col("id").eq(lit(1i64)).and(col("amount").eq(lit("9")));
        assert_eq!(translate_with(&mixed, numeric_free), None);
    }

    #[test]
    fn test_push_down_filters_splits_residual() {
        let filters = vec![
            col("id").eq(lit(2i64)),
            col("name").like(lit("B%")),
            col("age").gt(lit(30i64)),
        ];
        let mut clauses = vec![];
        let residual = push_down_filters(filters, &mut clauses);

        assert_eq!(clauses, vec!["id = 2".to_string(), "age > 30".to_string()]);
        assert_eq!(residual, vec![col("name").like(lit("B%"))]);
        assert_eq!(join_conjuncts(&clauses), Some("id = 2 AND age > 30".into()));
        assert_eq!(join_conjuncts(&[]), None);
    }
}
