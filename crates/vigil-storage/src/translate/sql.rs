//! SQL rendering of predicates and bounded queries.
//!
//! Produces a parameterized clause with `?` placeholders plus the ordered
//! parameter list. Operators whose spelling differs between SQL dialects are
//! looked up in an [`OperatorTable`] so each backend can substitute its own
//! native form without touching the translator.
//!
//! # SQL generated
//!
//! ```sql
//! "state" = ?                                   -- simple comparison
//! (CASE "severity" WHEN 'low' THEN 1 ... END) >= ?   -- severity by rank
//! "evaluate_timestamp" IS NULL                  -- = null
//! "type" NOT IN (?, ?)                          -- not in
//! instr("name", ?) > 0                          -- contains (default)
//! vigil_regexp(?, "name")                       -- regex (default)
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use vigil_common::types::Severity;

use super::{CompareOp, Predicate};
use crate::filter::SimpleOp;
use crate::pagination::BoundedQuery;
use crate::schema::{FieldDef, FieldKind, FieldValue};

/// Name of the portable regex function SQL backends must provide.
pub const REGEXP_FUNCTION: &str = "vigil_regexp";

/// A WHERE clause (without the keyword) and its parameters in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlClause {
    pub clause: String,
    pub params: Vec<SqlParam>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl SqlParam {
    /// Parameter for comparing against [`column_expr`]; severities become ranks.
    pub fn compared(value: &FieldValue) -> Self {
        match value {
            FieldValue::Severity(s) => SqlParam::Int(s.rank()),
            other => Self::stored(other),
        }
    }

    /// Parameter for writing `value` into its column.
    pub fn stored(value: &FieldValue) -> Self {
        match value {
            FieldValue::Null => SqlParam::Null,
            FieldValue::Bool(b) => SqlParam::Bool(*b),
            FieldValue::Text(s) => SqlParam::Text(s.clone()),
            FieldValue::Severity(s) => SqlParam::Text(s.as_str().to_string()),
            FieldValue::Timestamp(ts) => SqlParam::Text(timestamp_text(*ts)),
            FieldValue::Json(v) => SqlParam::Text(v.to_string()),
        }
    }
}

/// Fixed-width UTC text form; sorts lexically in time order.
pub fn timestamp_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn quote(column: &str) -> String {
    format!("\"{column}\"")
}

/// Expression used wherever `field` is compared or sorted.
pub fn column_expr(field: &FieldDef) -> String {
    match field.kind {
        FieldKind::Severity => {
            let arms: String = Severity::ALL
                .iter()
                .map(|s| format!(" WHEN '{}' THEN {}", s.as_str(), s.rank()))
                .collect();
            format!("(CASE {}{arms} END)", quote(field.name))
        }
        _ => quote(field.name),
    }
}

/// Dialect-specific templates for the pattern operators.
///
/// A template contains `{column}` for the column expression and exactly one
/// `?` for the operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorTable {
    templates: BTreeMap<SimpleOp, String>,
}

impl Default for OperatorTable {
    fn default() -> Self {
        let mut templates = BTreeMap::new();
        templates.insert(SimpleOp::Contains, "instr({column}, ?) > 0".to_string());
        templates.insert(SimpleOp::Regex, format!("{REGEXP_FUNCTION}(?, {{column}})"));
        Self { templates }
    }
}

impl OperatorTable {
    /// Replaces the template for `op`.
    pub fn with(mut self, op: SimpleOp, template: impl Into<String>) -> Self {
        self.templates.insert(op, template.into());
        self
    }

    fn apply(&self, op: SimpleOp, column: &str) -> String {
        match self.templates.get(&op) {
            Some(template) => template.replace("{column}", column),
            None => format!("{column} {} ?", op.symbol()),
        }
    }
}

/// Renders `predicate` into a parameterized clause.
pub fn render(predicate: &Predicate, operators: &OperatorTable) -> SqlClause {
    let mut params = Vec::new();
    let clause = render_node(predicate, operators, &mut params);
    SqlClause { clause, params }
}

fn render_node(node: &Predicate, operators: &OperatorTable, params: &mut Vec<SqlParam>) -> String {
    match node {
        Predicate::Const(true) => "1 = 1".to_string(),
        Predicate::Const(false) => "1 = 0".to_string(),
        Predicate::Compare { field, op, value } => {
            params.push(SqlParam::compared(value));
            format!("{} {} ?", column_expr(field), op.symbol())
        }
        Predicate::IsNull { field, negated } => {
            let not = if *negated { " NOT" } else { "" };
            format!("{} IS{not} NULL", quote(field.name))
        }
        Predicate::In {
            field,
            values,
            negated,
        } => {
            params.extend(values.iter().map(SqlParam::compared));
            let placeholders = vec!["?"; values.len()].join(", ");
            let not = if *negated { " NOT" } else { "" };
            format!("{}{not} IN ({placeholders})", column_expr(field))
        }
        Predicate::Contains { field, needle } => {
            params.push(SqlParam::Text(needle.clone()));
            operators.apply(SimpleOp::Contains, &quote(field.name))
        }
        Predicate::Regex { field, regex } => {
            params.push(SqlParam::Text(regex.as_str().to_string()));
            operators.apply(SimpleOp::Regex, &quote(field.name))
        }
        Predicate::And(parts) => join(parts, " AND ", operators, params),
        Predicate::Or(parts) => join(parts, " OR ", operators, params),
        Predicate::Not(inner) => format!("NOT ({})", render_node(inner, operators, params)),
    }
}

fn join(parts: &[Predicate], sep: &str, operators: &OperatorTable, params: &mut Vec<SqlParam>) -> String {
    let rendered: Vec<String> = parts
        .iter()
        .map(|p| render_node(p, operators, params))
        .collect();
    if rendered.is_empty() {
        // empty AND is true, empty OR is false
        let identity = if sep == " AND " { "1 = 1" } else { "1 = 0" };
        identity.to_string()
    } else if rendered.len() == 1 {
        rendered.concat()
    } else {
        format!("({})", rendered.join(sep))
    }
}

/// Full `SELECT` for a bounded query: every schema column, filtered,
/// ordered and capped.
pub fn select(query: &BoundedQuery, operators: &OperatorTable) -> SqlClause {
    let columns: Vec<String> = query.entity.fields().iter().map(|f| quote(f.name)).collect();
    let filter = render(&query.predicate, operators);
    let order: Vec<String> = query
        .ordering
        .keys()
        .iter()
        .map(|(field, direction)| format!("{} {}", column_expr(field), direction.sql()))
        .collect();

    let mut sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY {}",
        columns.join(", "),
        query.entity.table(),
        filter.clause,
        order.join(", ")
    );
    let mut params = filter.params;
    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ?");
        params.push(SqlParam::Int(i64::try_from(limit).unwrap_or(i64::MAX)));
    }
    SqlClause { clause: sql, params }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterExpr;
    use crate::ordering::SortKey;
    use crate::pagination::{paginate, PagePlan, PaginationRequest};
    use crate::schema::Entity;
    use crate::translate::translate;
    use serde_json::json;
    use vigil_common::types::Alarm;

    fn sql_for(value: serde_json::Value) -> SqlClause {
        let expr = FilterExpr::from_json(&value).unwrap();
        render(&translate(&expr, Entity::Alarm).unwrap(), &OperatorTable::default())
    }

    #[test]
    fn simple_equality() {
        let sql = sql_for(json!({"=": {"state": "alarm"}}));
        assert_eq!(sql.clause, "\"state\" = ?");
        assert_eq!(sql.params, vec![SqlParam::Text("alarm".to_string())]);
    }

    #[test]
    fn severity_compares_by_rank() {
        let sql = sql_for(json!({">=": {"severity": "moderate"}}));
        assert_eq!(
            sql.clause,
            "(CASE \"severity\" WHEN 'low' THEN 1 WHEN 'moderate' THEN 2 WHEN 'critical' THEN 3 END) >= ?"
        );
        assert_eq!(sql.params, vec![SqlParam::Int(2)]);
    }

    #[test]
    fn nested_boolean_tree() {
        let sql = sql_for(json!({"and": [
            {"in": {"type": ["threshold", "event"]}},
            {"or": [{"=": {"enabled": true}}, {"not": {"=": {"evaluate_timestamp": null}}}]}
        ]}));
        assert_eq!(
            sql.clause,
            "(\"type\" IN (?, ?) AND (\"enabled\" = ? OR NOT (\"evaluate_timestamp\" IS NULL)))"
        );
        assert_eq!(
            sql.params,
            vec![
                SqlParam::Text("threshold".to_string()),
                SqlParam::Text("event".to_string()),
                SqlParam::Bool(true),
            ]
        );
    }

    #[test]
    fn pattern_operators_use_default_templates() {
        let sql = sql_for(json!({"or": [{"contains": {"name": "cpu"}}, {"=~": {"name": "^db-[0-9]+$"}}]}));
        assert_eq!(sql.clause, "(instr(\"name\", ?) > 0 OR vigil_regexp(?, \"name\"))");
        assert_eq!(
            sql.params,
            vec![SqlParam::Text("cpu".to_string()), SqlParam::Text("^db-[0-9]+$".to_string())]
        );
    }

    #[test]
    fn backend_can_substitute_native_regex() {
        let operators = OperatorTable::default().with(SimpleOp::Regex, "{column} REGEXP ?");
        let expr = FilterExpr::simple(SimpleOp::Regex, "name", "^db");
        let sql = render(&translate(&expr, Entity::Alarm).unwrap(), &operators);
        assert_eq!(sql.clause, "\"name\" REGEXP ?");
    }

    #[test]
    fn select_orders_and_limits() {
        let request = PaginationRequest::new(vec![SortKey::desc("severity")]).with_limit(5);
        let plan = paginate::<Alarm, _>(super::Predicate::Const(true), &request, |_| Ok(None)).unwrap();
        let PagePlan::Bounded(query) = plan else {
            panic!("expected a bounded plan");
        };
        let sql = select(&query, &OperatorTable::default());
        assert!(sql.clause.starts_with("SELECT \"alarm_id\", \"enabled\""));
        assert!(sql.clause.contains(" FROM alarms WHERE 1 = 1 ORDER BY (CASE \"severity\""));
        assert!(sql.clause.ends_with("END) DESC, \"alarm_id\" ASC LIMIT ?"));
        assert_eq!(sql.params, vec![SqlParam::Int(5)]);
    }

    #[test]
    fn timestamps_sort_as_text() {
        let early = "2024-01-01T00:00:00.5Z".parse::<DateTime<Utc>>().unwrap();
        let late = "2024-01-01T00:00:01Z".parse::<DateTime<Utc>>().unwrap();
        assert!(timestamp_text(early) < timestamp_text(late));
        assert_eq!(timestamp_text(late), "2024-01-01T00:00:01.000000000Z");
    }
}
