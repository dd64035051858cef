//! Multi-key ordering.
//!
//! A request names `(field, direction)` pairs; [`ResolvedOrdering`] checks them
//! against the schema and appends the entity identity as a final ascending
//! key, so two distinct records never compare equal. Keyset pagination
//! depends on that.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::schema::{Entity, FieldDef, FieldKind, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[serde(alias = "ascending")]
    Asc,
    #[serde(alias = "descending")]
    Desc,
}

impl Direction {
    pub fn sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// One sort key. On the wire: `["severity", "desc"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, Direction)", into = "(String, Direction)")]
pub struct SortKey {
    pub field: String,
    pub direction: Direction,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

impl From<(String, Direction)> for SortKey {
    fn from((field, direction): (String, Direction)) -> Self {
        Self { field, direction }
    }
}

impl From<SortKey> for (String, Direction) {
    fn from(key: SortKey) -> Self {
        (key.field, key.direction)
    }
}

/// Ordering used when a request does not name one: newest first.
pub fn default_ordering(entity: Entity) -> Vec<SortKey> {
    match entity {
        Entity::Alarm | Entity::AlarmChange => vec![SortKey::desc("timestamp")],
    }
}

/// A schema-checked ordering, always ending in the entity identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOrdering {
    keys: Vec<(&'static FieldDef, Direction)>,
}

impl ResolvedOrdering {
    /// Resolves `sort` for `entity`; an empty list means the default ordering.
    ///
    /// Repeated fields keep their first position.
    pub fn resolve(sort: &[SortKey], entity: Entity) -> Result<Self> {
        let defaults;
        let sort = if sort.is_empty() {
            defaults = default_ordering(entity);
            defaults.as_slice()
        } else {
            sort
        };

        let mut keys: Vec<(&'static FieldDef, Direction)> = Vec::with_capacity(sort.len() + 1);
        for key in sort {
            let field = entity.field(&key.field)?;
            if field.kind == FieldKind::Json {
                return Err(StorageError::InvalidFilterValue {
                    field: field.name.to_string(),
                    reason: "structured fields cannot be sorted".to_string(),
                });
            }
            if !keys.iter().any(|(f, _)| f.name == field.name) {
                keys.push((field, key.direction));
            }
        }

        let identity = entity.identity();
        if !keys.iter().any(|(f, _)| f.name == identity.name) {
            keys.push((identity, Direction::Asc));
        }
        Ok(Self { keys })
    }

    pub fn keys(&self) -> &[(&'static FieldDef, Direction)] {
        &self.keys
    }

    /// Compares two records in result order. Null sorts lowest ascending,
    /// highest descending.
    pub fn compare<R: Record>(&self, a: &R, b: &R) -> Ordering {
        for (field, direction) in &self.keys {
            let ord = a.value(field.name).sort_cmp(&b.value(field.name));
            let ord = match direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    pub fn sort<R: Record>(&self, records: &mut [R]) {
        records.sort_by(|a, b| self.compare(a, b));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_common::types::{Alarm, Severity};

    fn alarm(id: &str, severity: Severity) -> Alarm {
        let mut a = Alarm::new(id, id, "threshold", "u", "p");
        a.severity = severity;
        a
    }

    fn ids(alarms: &[Alarm]) -> Vec<&str> {
        alarms.iter().map(|a| a.alarm_id.as_str()).collect()
    }

    #[test]
    fn severity_descending_uses_rank() {
        let ordering = ResolvedOrdering::resolve(&[SortKey::desc("severity")], Entity::Alarm).unwrap();
        let mut alarms = vec![
            alarm("c", Severity::Critical),
            alarm("l", Severity::Low),
            alarm("m", Severity::Moderate),
        ];
        ordering.sort(&mut alarms);
        assert_eq!(ids(&alarms), vec!["c", "m", "l"]);
    }

    #[test]
    fn identity_breaks_ties() {
        let ordering = ResolvedOrdering::resolve(&[SortKey::asc("severity")], Entity::Alarm).unwrap();
        assert_eq!(ordering.keys().len(), 2);
        assert_eq!(ordering.keys()[1].0.name, "alarm_id");

        let mut alarms = vec![alarm("b", Severity::Low), alarm("a", Severity::Low)];
        ordering.sort(&mut alarms);
        assert_eq!(ids(&alarms), vec!["a", "b"]);
    }

    #[test]
    fn empty_sort_uses_default() {
        let ordering = ResolvedOrdering::resolve(&[], Entity::AlarmChange).unwrap();
        let names: Vec<_> = ordering.keys().iter().map(|(f, d)| (f.name, *d)).collect();
        assert_eq!(names, vec![("timestamp", Direction::Desc), ("event_id", Direction::Asc)]);
    }

    #[test]
    fn rejects_unknown_and_structured_fields() {
        assert!(matches!(
            ResolvedOrdering::resolve(&[SortKey::asc("colour")], Entity::Alarm),
            Err(StorageError::UnknownField { .. })
        ));
        assert!(matches!(
            ResolvedOrdering::resolve(&[SortKey::asc("rule")], Entity::Alarm),
            Err(StorageError::InvalidFilterValue { .. })
        ));
    }

    #[test]
    fn sort_key_wire_form() {
        let key: SortKey = serde_json::from_str(r#"["name", "ascending"]"#).unwrap();
        assert_eq!(key, SortKey::asc("name"));
        assert_eq!(serde_json::to_string(&SortKey::desc("timestamp")).unwrap(), r#"["timestamp","desc"]"#);
    }
}
