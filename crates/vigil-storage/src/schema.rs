//! Field schemas of the queryable entities and the typed values read from them.
//!
//! Every filter, ordering key and conditional-update assignment is resolved
//! against these tables before anything reaches a backend, so an unknown
//! field is always rejected up front with [`StorageError::UnknownField`].

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDateTime, Utc};
use vigil_common::types::{Alarm, AlarmChange, AlarmChangeType, AlarmState, Severity};

use crate::error::{Result, StorageError};

/// An entity that can be filtered, sorted and paginated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Alarm,
    AlarmChange,
}

impl Entity {
    pub fn name(self) -> &'static str {
        match self {
            Entity::Alarm => "alarm",
            Entity::AlarmChange => "alarm change",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Entity::Alarm => "alarms",
            Entity::AlarmChange => "alarm_history",
        }
    }

    pub fn fields(self) -> &'static [FieldDef] {
        match self {
            Entity::Alarm => ALARM_FIELDS,
            Entity::AlarmChange => ALARM_CHANGE_FIELDS,
        }
    }

    /// Looks up a field by name.
    pub fn field(self, name: &str) -> Result<&'static FieldDef> {
        self.fields()
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| StorageError::UnknownField {
                entity: self.name(),
                field: name.to_string(),
            })
    }

    /// The field holding the record's unique identity.
    pub fn identity(self) -> &'static FieldDef {
        match self {
            Entity::Alarm => &ALARM_FIELDS[0],
            Entity::AlarmChange => &ALARM_CHANGE_FIELDS[0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Bool,
    /// Stored by name, compared and sorted by [`Severity::rank`].
    Severity,
    Timestamp,
    /// Text holding an [`AlarmState`] name; input aliases are normalized.
    State,
    /// Text holding an [`AlarmChangeType`] name.
    ChangeType,
    /// Opaque structured payload: assignable, never filterable or sortable.
    Json,
}

#[derive(Debug, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
    pub nullable: bool,
}

impl FieldDef {
    const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            nullable: false,
        }
    }

    const fn nullable(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            nullable: true,
        }
    }
}

// Identity must stay first in both tables.
static ALARM_FIELDS: &[FieldDef] = &[
    FieldDef::new("alarm_id", FieldKind::Text),
    FieldDef::new("enabled", FieldKind::Bool),
    FieldDef::new("name", FieldKind::Text),
    FieldDef::new("type", FieldKind::Text),
    FieldDef::new("description", FieldKind::Text),
    FieldDef::new("severity", FieldKind::Severity),
    FieldDef::new("state", FieldKind::State),
    FieldDef::new("state_reason", FieldKind::Text),
    FieldDef::new("state_timestamp", FieldKind::Timestamp),
    FieldDef::new("rule", FieldKind::Json),
    FieldDef::new("ok_actions", FieldKind::Json),
    FieldDef::new("alarm_actions", FieldKind::Json),
    FieldDef::new("insufficient_data_actions", FieldKind::Json),
    FieldDef::new("time_constraints", FieldKind::Json),
    FieldDef::new("repeat_actions", FieldKind::Bool),
    FieldDef::nullable("evaluate_timestamp", FieldKind::Timestamp),
    FieldDef::new("user_id", FieldKind::Text),
    FieldDef::new("project_id", FieldKind::Text),
    FieldDef::new("timestamp", FieldKind::Timestamp),
];

static ALARM_CHANGE_FIELDS: &[FieldDef] = &[
    FieldDef::new("event_id", FieldKind::Text),
    FieldDef::new("alarm_id", FieldKind::Text),
    FieldDef::new("type", FieldKind::ChangeType),
    FieldDef::new("detail", FieldKind::Text),
    FieldDef::new("severity", FieldKind::Severity),
    FieldDef::new("on_behalf_of", FieldKind::Text),
    FieldDef::new("user_id", FieldKind::Text),
    FieldDef::new("project_id", FieldKind::Text),
    FieldDef::new("timestamp", FieldKind::Timestamp),
];

/// A typed field value, as read from a record or coerced from a request.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Text(String),
    Severity(Severity),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl FieldValue {
    /// Comparison with SQL semantics: `None` when either side is null, the
    /// variants differ, or the values are opaque JSON.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Bool(a), FieldValue::Bool(b)) => Some(a.cmp(b)),
            (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
            (FieldValue::Severity(a), FieldValue::Severity(b)) => Some(a.rank().cmp(&b.rank())),
            (FieldValue::Timestamp(a), FieldValue::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total order used for sorting: null sorts below every other value.
    pub fn sort_cmp(&self, other: &FieldValue) -> Ordering {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => Ordering::Equal,
            (FieldValue::Null, _) => Ordering::Less,
            (_, FieldValue::Null) => Ordering::Greater,
            _ => self.compare(other).unwrap_or(Ordering::Equal),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Coerces a wire value into the kind `field` holds.
    pub fn coerce(field: &FieldDef, value: &serde_json::Value) -> Result<FieldValue> {
        use serde_json::Value;

        let invalid = |reason: String| StorageError::InvalidFilterValue {
            field: field.name.to_string(),
            reason,
        };

        if value.is_null() {
            return if field.nullable {
                Ok(FieldValue::Null)
            } else {
                Err(invalid("field is not nullable".to_string()))
            };
        }

        match field.kind {
            FieldKind::Text => match value {
                Value::String(s) => Ok(FieldValue::Text(s.clone())),
                Value::Number(n) => Ok(FieldValue::Text(n.to_string())),
                Value::Bool(b) => Ok(FieldValue::Text(b.to_string())),
                other => Err(invalid(format!("expected a string, got {other}"))),
            },
            FieldKind::Bool => match value {
                Value::Bool(b) => Ok(FieldValue::Bool(*b)),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(FieldValue::Bool(true)),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(FieldValue::Bool(false)),
                other => Err(invalid(format!("expected a boolean, got {other}"))),
            },
            FieldKind::Severity => match value {
                Value::String(s) => s.parse().map(FieldValue::Severity).map_err(invalid),
                other => Err(invalid(format!("expected a severity name, got {other}"))),
            },
            FieldKind::Timestamp => match value {
                Value::String(s) => parse_timestamp(s).map(FieldValue::Timestamp).ok_or_else(|| {
                    invalid(format!("'{s}' is not an ISO-8601 timestamp"))
                }),
                other => Err(invalid(format!("expected a timestamp string, got {other}"))),
            },
            FieldKind::State => match value {
                Value::String(s) => s
                    .parse::<AlarmState>()
                    .map(|state| FieldValue::Text(state.as_str().to_string()))
                    .map_err(invalid),
                other => Err(invalid(format!("expected an alarm state, got {other}"))),
            },
            FieldKind::ChangeType => match value {
                Value::String(s) => s
                    .parse::<AlarmChangeType>()
                    .map(|kind| FieldValue::Text(kind.as_str().to_string()))
                    .map_err(invalid),
                other => Err(invalid(format!("expected a change type, got {other}"))),
            },
            FieldKind::Json => Ok(FieldValue::Json(value.clone())),
        }
    }
}

/// Parses RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// A stored record whose fields can be read by schema name.
pub trait Record: Clone + Send + 'static {
    const ENTITY: Entity;

    /// Value of the named field; [`FieldValue::Null`] for names outside the schema.
    fn value(&self, field: &str) -> FieldValue;

    fn identity(&self) -> &str;
}

fn json_of<T: serde::Serialize>(value: &T) -> FieldValue {
    FieldValue::Json(serde_json::to_value(value).unwrap_or_default())
}

impl Record for Alarm {
    const ENTITY: Entity = Entity::Alarm;

    fn value(&self, field: &str) -> FieldValue {
        match field {
            "alarm_id" => FieldValue::Text(self.alarm_id.clone()),
            "enabled" => FieldValue::Bool(self.enabled),
            "name" => FieldValue::Text(self.name.clone()),
            "type" => FieldValue::Text(self.alarm_type.clone()),
            "description" => FieldValue::Text(self.description.clone()),
            "severity" => FieldValue::Severity(self.severity),
            "state" => FieldValue::Text(self.state.as_str().to_string()),
            "state_reason" => FieldValue::Text(self.state_reason.clone()),
            "state_timestamp" => FieldValue::Timestamp(self.state_timestamp),
            "rule" => FieldValue::Json(self.rule.clone()),
            "ok_actions" => json_of(&self.ok_actions),
            "alarm_actions" => json_of(&self.alarm_actions),
            "insufficient_data_actions" => json_of(&self.insufficient_data_actions),
            "time_constraints" => json_of(&self.time_constraints),
            "repeat_actions" => FieldValue::Bool(self.repeat_actions),
            "evaluate_timestamp" => self
                .evaluate_timestamp
                .map_or(FieldValue::Null, FieldValue::Timestamp),
            "user_id" => FieldValue::Text(self.user_id.clone()),
            "project_id" => FieldValue::Text(self.project_id.clone()),
            "timestamp" => FieldValue::Timestamp(self.timestamp),
            _ => FieldValue::Null,
        }
    }

    fn identity(&self) -> &str {
        &self.alarm_id
    }
}

impl Record for AlarmChange {
    const ENTITY: Entity = Entity::AlarmChange;

    fn value(&self, field: &str) -> FieldValue {
        match field {
            "event_id" => FieldValue::Text(self.event_id.clone()),
            "alarm_id" => FieldValue::Text(self.alarm_id.clone()),
            "type" => FieldValue::Text(self.change_type.as_str().to_string()),
            "detail" => FieldValue::Text(self.detail.clone()),
            "severity" => FieldValue::Severity(self.severity),
            "on_behalf_of" => FieldValue::Text(self.on_behalf_of.clone()),
            "user_id" => FieldValue::Text(self.user_id.clone()),
            "project_id" => FieldValue::Text(self.project_id.clone()),
            "timestamp" => FieldValue::Timestamp(self.timestamp),
            _ => FieldValue::Null,
        }
    }

    fn identity(&self) -> &str {
        &self.event_id
    }
}
