//! Compare-and-swap updates of a single alarm.
//!
//! A [`ConditionalUpdate`] names the alarm, the fields to write and the values
//! the alarm must currently hold. Backends run [`ConditionalUpdate::plan`] and
//! apply the assignments in one statement (or under one lock) guarded by the
//! plan's predicate, reporting whether a row changed. A guard that no longer
//! holds is a normal `false` result; nothing is retried here.
//!
//! ```rust
//! use vigil_storage::update::ConditionalUpdate;
//!
//! let cas = ConditionalUpdate::new("a-1")
//!     .set("state", "alarm")
//!     .set("state_reason", "cpu above 90% for 3 periods")
//!     .expect("state", "ok");
//! let plan = cas.plan().unwrap();
//! assert_eq!(plan.assignments.len(), 2);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vigil_common::types::{Alarm, AlarmState, TimeConstraint};

use crate::error::{Result, StorageError};
use crate::filter::{FilterExpr, SimpleOp};
use crate::schema::{Entity, FieldDef, FieldValue, Record};
use crate::translate::{translate, Predicate};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionalUpdate {
    pub alarm_id: String,
    /// Fields to write.
    pub values: BTreeMap<String, Value>,
    /// Fields that must currently equal the given values.
    #[serde(default)]
    pub expected: BTreeMap<String, Value>,
    /// Extra guards: a list value means "one of", null means "unset".
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
}

/// Validated form of a [`ConditionalUpdate`].
#[derive(Debug, Clone)]
pub struct UpdatePlan {
    /// Normalized values in schema order.
    pub assignments: Vec<(&'static FieldDef, FieldValue)>,
    pub guard: Predicate,
}

impl ConditionalUpdate {
    pub fn new(alarm_id: impl Into<String>) -> Self {
        Self {
            alarm_id: alarm_id.into(),
            ..Self::default()
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    pub fn expect(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.expected.insert(field.into(), value.into());
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    /// Checks every field and value and builds the guard predicate.
    pub fn plan(&self) -> Result<UpdatePlan> {
        if self.values.is_empty() {
            return Err(StorageError::Other(format!(
                "conditional update of alarm {} sets no fields",
                self.alarm_id
            )));
        }

        let identity = Entity::Alarm.identity();
        // Assign onto a scratch alarm so values are checked and normalized
        // exactly as they will be stored.
        let mut scratch = Alarm::new(&self.alarm_id, "", "", "", "");
        let mut fields = Vec::with_capacity(self.values.len());
        for (name, raw) in &self.values {
            let field = Entity::Alarm.field(name)?;
            if field.name == identity.name {
                return Err(StorageError::InvalidFilterValue {
                    field: field.name.to_string(),
                    reason: "alarm identity cannot be changed".to_string(),
                });
            }
            assign(&mut scratch, field, &FieldValue::coerce(field, raw)?)?;
            fields.push(field);
        }
        fields.sort_by_key(|f| Entity::Alarm.fields().iter().position(|d| d.name == f.name));
        let assignments = fields
            .into_iter()
            .map(|field| (field, scratch.value(field.name)))
            .collect();

        let mut parts = vec![translate(&FilterExpr::eq(identity.name, self.alarm_id.as_str()), Entity::Alarm)?];
        for (name, value) in &self.expected {
            parts.push(translate(&FilterExpr::eq(name.as_str(), value.clone()), Entity::Alarm)?);
        }
        for (name, value) in &self.filters {
            let op = if value.is_array() { SimpleOp::In } else { SimpleOp::Eq };
            parts.push(translate(&FilterExpr::simple(op, name.as_str(), value.clone()), Entity::Alarm)?);
        }

        Ok(UpdatePlan {
            assignments,
            guard: Predicate::all(parts),
        })
    }
}

impl UpdatePlan {
    /// Applies the assignments to `alarm` in place.
    pub fn apply(&self, alarm: &mut Alarm) -> Result<()> {
        for (field, value) in &self.assignments {
            assign(alarm, field, value)?;
        }
        Ok(())
    }
}

/// Writes one typed value into the matching `Alarm` field.
pub fn assign(alarm: &mut Alarm, field: &FieldDef, value: &FieldValue) -> Result<()> {
    let mismatch = || StorageError::InvalidFilterValue {
        field: field.name.to_string(),
        reason: format!("{value:?} does not fit a {:?} field", field.kind),
    };

    match (field.name, value) {
        ("alarm_id", FieldValue::Text(v)) => alarm.alarm_id = v.clone(),
        ("enabled", FieldValue::Bool(v)) => alarm.enabled = *v,
        ("name", FieldValue::Text(v)) => alarm.name = v.clone(),
        ("type", FieldValue::Text(v)) => alarm.alarm_type = v.clone(),
        ("description", FieldValue::Text(v)) => alarm.description = v.clone(),
        ("severity", FieldValue::Severity(v)) => alarm.severity = *v,
        ("state", FieldValue::Text(v)) => {
            alarm.state = v.parse::<AlarmState>().map_err(|reason| StorageError::InvalidFilterValue {
                field: field.name.to_string(),
                reason,
            })?;
        }
        ("state_reason", FieldValue::Text(v)) => alarm.state_reason = v.clone(),
        ("state_timestamp", FieldValue::Timestamp(v)) => alarm.state_timestamp = *v,
        ("rule", FieldValue::Json(v)) => alarm.rule = v.clone(),
        ("ok_actions", FieldValue::Json(v)) => alarm.ok_actions = structured(field, v)?,
        ("alarm_actions", FieldValue::Json(v)) => alarm.alarm_actions = structured(field, v)?,
        ("insufficient_data_actions", FieldValue::Json(v)) => {
            alarm.insufficient_data_actions = structured(field, v)?;
        }
        ("time_constraints", FieldValue::Json(v)) => {
            alarm.time_constraints = structured::<Vec<TimeConstraint>>(field, v)?;
        }
        ("repeat_actions", FieldValue::Bool(v)) => alarm.repeat_actions = *v,
        ("evaluate_timestamp", FieldValue::Null) => alarm.evaluate_timestamp = None,
        ("evaluate_timestamp", FieldValue::Timestamp(v)) => alarm.evaluate_timestamp = Some(*v),
        ("user_id", FieldValue::Text(v)) => alarm.user_id = v.clone(),
        ("project_id", FieldValue::Text(v)) => alarm.project_id = v.clone(),
        ("timestamp", FieldValue::Timestamp(v)) => alarm.timestamp = *v,
        _ => return Err(mismatch()),
    }
    Ok(())
}

fn structured<T: serde::de::DeserializeOwned>(field: &FieldDef, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(|e| StorageError::InvalidFilterValue {
        field: field.name.to_string(),
        reason: e.to_string(),
    })
}
