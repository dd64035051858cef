//! Translation of [`FilterExpr`] trees into executable predicates.
//!
//! [`translate`] resolves every field against the entity schema, coerces
//! operands to the field's kind and checks tree arity. The resulting
//! [`Predicate`] is backend-neutral: the memory backend evaluates it directly
//! with [`Predicate::matches`], SQL backends render it with [`sql::render`].
//!
//! Evaluation follows SQL three-valued logic so both paths agree on null
//! fields: a comparison against null is unknown, `NOT unknown` is still
//! unknown, and only a definite `true` selects a record.

pub mod sql;

use std::cmp::Ordering;

use regex::Regex;

use crate::error::{Result, StorageError};
use crate::filter::{FilterExpr, LogicalOp, SimpleOp};
use crate::schema::{Entity, FieldDef, FieldKind, FieldValue, Record};

/// Maximum compiled regex size (10 MiB) to prevent regex denial-of-service.
const REGEX_SIZE_LIMIT: usize = 10 * (1 << 20);

/// Maximum regex nesting depth to prevent stack overflow.
const REGEX_NEST_LIMIT: u32 = 200;

/// Compiles a user-supplied pattern with size and nesting limits.
pub(crate) fn compile_pattern(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    regex::RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .nest_limit(REGEX_NEST_LIMIT)
        .build()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn from_simple(op: SimpleOp) -> Option<Self> {
        match op {
            SimpleOp::Eq => Some(CompareOp::Eq),
            SimpleOp::Ne => Some(CompareOp::Ne),
            SimpleOp::Lt => Some(CompareOp::Lt),
            SimpleOp::Le => Some(CompareOp::Le),
            SimpleOp::Gt => Some(CompareOp::Gt),
            SimpleOp::Ge => Some(CompareOp::Ge),
            SimpleOp::In | SimpleOp::NotIn | SimpleOp::Contains | SimpleOp::Regex => None,
        }
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A schema-checked, typed predicate.
#[derive(Debug, Clone)]
pub enum Predicate {
    Const(bool),
    Compare {
        field: &'static FieldDef,
        op: CompareOp,
        value: FieldValue,
    },
    IsNull {
        field: &'static FieldDef,
        negated: bool,
    },
    In {
        field: &'static FieldDef,
        values: Vec<FieldValue>,
        negated: bool,
    },
    Contains {
        field: &'static FieldDef,
        needle: String,
    },
    Regex {
        field: &'static FieldDef,
        regex: Regex,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(field: &'static FieldDef, op: CompareOp, value: FieldValue) -> Self {
        Predicate::Compare { field, op, value }
    }

    /// Conjunction of `parts`, flattening nested ANDs. Empty means always true.
    pub fn all(parts: impl IntoIterator<Item = Predicate>) -> Self {
        let mut flat = Vec::new();
        for part in parts {
            match part {
                Predicate::And(inner) => flat.extend(inner),
                Predicate::Const(true) => {}
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Predicate::Const(true),
            1 => flat.remove(0),
            _ => Predicate::And(flat),
        }
    }

    /// Whether `record` is selected. Unknown counts as not selected.
    pub fn matches<R: Record>(&self, record: &R) -> bool {
        self.eval(record) == Some(true)
    }

    fn eval<R: Record>(&self, record: &R) -> Option<bool> {
        match self {
            Predicate::Const(b) => Some(*b),
            Predicate::Compare { field, op, value } => record
                .value(field.name)
                .compare(value)
                .map(|ord| op.holds(ord)),
            Predicate::IsNull { field, negated } => {
                Some(record.value(field.name).is_null() != *negated)
            }
            Predicate::In {
                field,
                values,
                negated,
            } => {
                let actual = record.value(field.name);
                if actual.is_null() {
                    return None;
                }
                let found = values
                    .iter()
                    .any(|v| actual.compare(v) == Some(Ordering::Equal));
                Some(found != *negated)
            }
            Predicate::Contains { field, needle } => match record.value(field.name) {
                FieldValue::Text(s) => Some(s.contains(needle.as_str())),
                _ => None,
            },
            Predicate::Regex { field, regex } => match record.value(field.name) {
                FieldValue::Text(s) => Some(regex.is_match(&s)),
                _ => None,
            },
            Predicate::And(parts) => {
                let mut result = Some(true);
                for part in parts {
                    match part.eval(record) {
                        Some(false) => return Some(false),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                result
            }
            Predicate::Or(parts) => {
                let mut result = Some(false);
                for part in parts {
                    match part.eval(record) {
                        Some(true) => return Some(true),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                result
            }
            Predicate::Not(inner) => inner.eval(record).map(|b| !b),
        }
    }
}

/// Translates a filter tree into a predicate over `entity`.
///
/// Fails with [`StorageError::UnknownField`] for any field not on the entity,
/// [`StorageError::MalformedFilter`] for a `not` without exactly one child or an
/// empty `and`/`or`, and [`StorageError::InvalidFilterValue`] when an operand
/// does not fit the field.
pub fn translate(expr: &FilterExpr, entity: Entity) -> Result<Predicate> {
    match expr {
        FilterExpr::Simple { op, field, value } => translate_simple(*op, entity.field(field)?, value),
        FilterExpr::Complex { op, children } => {
            let parts = children
                .iter()
                .map(|child| translate(child, entity))
                .collect::<Result<Vec<_>>>()?;
            match op {
                LogicalOp::Not => {
                    let mut parts = parts;
                    match (parts.pop(), parts.is_empty()) {
                        (Some(only), true) => Ok(Predicate::Not(Box::new(only))),
                        _ => Err(StorageError::MalformedFilter(format!(
                            "'not' takes exactly one filter, got {}",
                            children.len()
                        ))),
                    }
                }
                LogicalOp::And | LogicalOp::Or if parts.is_empty() => Err(StorageError::MalformedFilter(
                    format!("'{}' needs at least one filter", op.symbol()),
                )),
                LogicalOp::And => Ok(Predicate::And(parts)),
                LogicalOp::Or => Ok(Predicate::Or(parts)),
            }
        }
    }
}

fn translate_simple(op: SimpleOp, field: &'static FieldDef, value: &serde_json::Value) -> Result<Predicate> {
    let invalid = |reason: &str| StorageError::InvalidFilterValue {
        field: field.name.to_string(),
        reason: reason.to_string(),
    };

    if field.kind == FieldKind::Json {
        return Err(invalid("structured fields cannot be filtered"));
    }

    match op {
        SimpleOp::Eq | SimpleOp::Ne if value.is_null() => Ok(Predicate::IsNull {
            field,
            negated: op == SimpleOp::Ne,
        }),
        SimpleOp::Eq | SimpleOp::Ne | SimpleOp::Lt | SimpleOp::Le | SimpleOp::Gt | SimpleOp::Ge => {
            if value.is_null() {
                return Err(invalid("null can only be compared with = or !="));
            }
            let cmp = CompareOp::from_simple(op).ok_or_else(|| invalid("not a comparison"))?;
            Ok(Predicate::compare(field, cmp, FieldValue::coerce(field, value)?))
        }
        SimpleOp::In | SimpleOp::NotIn => {
            let items = value
                .as_array()
                .ok_or_else(|| invalid("'in' expects a list of values"))?;
            let negated = op == SimpleOp::NotIn;
            if items.is_empty() {
                return Ok(Predicate::Const(negated));
            }
            let values = items
                .iter()
                .map(|item| {
                    if item.is_null() {
                        Err(invalid("'in' lists cannot contain null"))
                    } else {
                        FieldValue::coerce(field, item)
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Predicate::In {
                field,
                values,
                negated,
            })
        }
        SimpleOp::Contains => {
            let needle = text_operand(field, value).map_err(|reason| invalid(reason))?;
            Ok(Predicate::Contains {
                field,
                needle: needle.to_string(),
            })
        }
        SimpleOp::Regex => {
            let pattern = text_operand(field, value).map_err(|reason| invalid(reason))?;
            let regex = compile_pattern(pattern).map_err(|e| StorageError::InvalidFilterValue {
                field: field.name.to_string(),
                reason: format!("invalid regex pattern '{pattern}': {e}"),
            })?;
            Ok(Predicate::Regex { field, regex })
        }
    }
}

fn text_operand<'a>(field: &FieldDef, value: &'a serde_json::Value) -> std::result::Result<&'a str, &'static str> {
    if !matches!(field.kind, FieldKind::Text | FieldKind::State | FieldKind::ChangeType) {
        return Err("pattern matching applies to text fields only");
    }
    value.as_str().ok_or("pattern must be a string")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use vigil_common::types::{Alarm, AlarmState, Severity};

    fn alarm(name: &str, state: AlarmState, severity: Severity) -> Alarm {
        let mut a = Alarm::new(name, name, "threshold", "u-1", "p-1");
        a.state = state;
        a.severity = severity;
        a
    }

    fn parse(value: serde_json::Value) -> FilterExpr {
        FilterExpr::from_json(&value).unwrap()
    }

    #[test]
    fn simple_comparison_matches() {
        let pred = translate(&parse(json!({"=": {"state": "alarm"}})), Entity::Alarm).unwrap();
        assert!(pred.matches(&alarm("a", AlarmState::Alarm, Severity::Low)));
        assert!(!pred.matches(&alarm("b", AlarmState::Ok, Severity::Low)));
    }

    #[test]
    fn severity_range_uses_rank() {
        let pred = translate(&parse(json!({">=": {"severity": "moderate"}})), Entity::Alarm).unwrap();
        assert!(pred.matches(&alarm("a", AlarmState::Ok, Severity::Critical)));
        assert!(pred.matches(&alarm("b", AlarmState::Ok, Severity::Moderate)));
        // "low" > "moderate" as strings; rank order must win
        assert!(!pred.matches(&alarm("c", AlarmState::Ok, Severity::Low)));
    }

    #[test]
    fn complex_tree() {
        let pred = translate(
            &parse(json!({"and": [
                {"in": {"state": ["alarm", "insufficient data"]}},
                {"not": {"=~": {"name": "^db-"}}}
            ]})),
            Entity::Alarm,
        )
        .unwrap();
        assert!(pred.matches(&alarm("web-1", AlarmState::Alarm, Severity::Low)));
        assert!(!pred.matches(&alarm("db-1", AlarmState::Alarm, Severity::Low)));
        assert!(!pred.matches(&alarm("web-2", AlarmState::Ok, Severity::Low)));
    }

    #[test]
    fn unknown_field_anywhere_in_tree_fails() {
        let expr = parse(json!({"or": [{"=": {"state": "ok"}}, {"=": {"colour": "red"}}]}));
        let err = translate(&expr, Entity::Alarm).unwrap_err();
        assert!(matches!(err, StorageError::UnknownField { ref field, .. } if field == "colour"));
        // same field exists on one entity but not the other
        let expr = parse(json!({"=": {"on_behalf_of": "p-1"}}));
        assert!(translate(&expr, Entity::AlarmChange).is_ok());
        assert!(translate(&expr, Entity::Alarm).is_err());
    }

    #[test]
    fn arity_is_checked() {
        let two = FilterExpr::Complex {
            op: LogicalOp::Not,
            children: vec![FilterExpr::eq("state", "ok"), FilterExpr::eq("state", "alarm")],
        };
        assert!(matches!(translate(&two, Entity::Alarm), Err(StorageError::MalformedFilter(_))));
        assert!(matches!(
            translate(&FilterExpr::and(vec![]), Entity::Alarm),
            Err(StorageError::MalformedFilter(_))
        ));
    }

    #[test]
    fn operand_checks() {
        let bad = [
            json!({"=~": {"name": "(unclosed"}}),
            json!({"contains": {"severity": "low"}}),
            json!({"in": {"state": "ok"}}),
            json!({"<": {"timestamp": null}}),
            json!({"=": {"rule": {}}}),
            json!({"=": {"severity": "urgent"}}),
        ];
        for case in bad {
            let err = translate(&parse(case.clone()), Entity::Alarm).unwrap_err();
            assert!(matches!(err, StorageError::InvalidFilterValue { .. }), "accepted {case}");
        }
    }

    #[test]
    fn null_semantics_follow_sql() {
        let mut evaluated = alarm("a", AlarmState::Ok, Severity::Low);
        evaluated.evaluate_timestamp = Some(Utc::now());
        let never = alarm("b", AlarmState::Ok, Severity::Low);

        let is_null = translate(&parse(json!({"=": {"evaluate_timestamp": null}})), Entity::Alarm).unwrap();
        assert!(is_null.matches(&never));
        assert!(!is_null.matches(&evaluated));

        let cutoff = (Utc::now() - Duration::hours(1)).to_rfc3339();
        let recent = parse(json!({">": {"evaluate_timestamp": cutoff}}));
        let not_recent = translate(&FilterExpr::negate(recent), Entity::Alarm).unwrap();
        // NOT (NULL > x) is unknown, so the unevaluated alarm is excluded too
        assert!(!not_recent.matches(&never));
        assert!(!not_recent.matches(&evaluated));
    }

    #[test]
    fn empty_in_lists() {
        let none = translate(&parse(json!({"in": {"state": []}})), Entity::Alarm).unwrap();
        let all = translate(&parse(json!({"not in": {"state": []}})), Entity::Alarm).unwrap();
        let a = alarm("a", AlarmState::Ok, Severity::Low);
        assert!(!none.matches(&a));
        assert!(all.matches(&a));
    }
}
