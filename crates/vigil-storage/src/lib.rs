//! Generic alarm storage with a backend-neutral query engine.
//!
//! Callers describe what they want as a [`filter::FilterExpr`] plus a
//! [`pagination::PaginationRequest`]; the engine checks it against the
//! entity schema, turns it into a [`translate::Predicate`] and hands a bounded
//! plan to the backend. State transitions go through
//! [`update::ConditionalUpdate`], history housekeeping through
//! [`AlarmStorage::prune_history`].
//!
//! Two backends ship with the crate: [`engine::SqliteAlarmStorage`] for
//! production use and [`memory::MemoryAlarmStorage`] for tests and local runs.

pub mod capabilities;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod memory;
pub mod ordering;
pub mod pagination;
pub mod retention;
pub mod schema;
pub mod translate;
pub mod update;


use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vigil_common::types::{Alarm, AlarmChange, AlarmChangeType, AlarmState, Quota, Severity};

use crate::capabilities::{require_query, CapabilityMap};
use crate::error::{Result, StorageError};
use crate::filter::{FilterExpr, SimpleOp};
use crate::ordering::SortKey;
use crate::pagination::PaginationRequest;
use crate::schema::Entity;
use crate::translate::{translate, Predicate};
use crate::update::ConditionalUpdate;

/// Equality filters for [`AlarmStorage::get_alarms`]. Unset fields match
/// everything.
///
/// # Examples
///
/// ```
/// use vigil_common::types::AlarmState;
/// use vigil_storage::AlarmFilter;
///
/// let filter = AlarmFilter {
///     project_id: Some("proj-1".into()),
///     exclude_state: Some(AlarmState::Ok),
///     ..AlarmFilter::default()
/// };
/// assert!(filter.to_expr().is_some());
/// assert!(AlarmFilter::default().to_expr().is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlarmFilter {
    pub alarm_id: Option<String>,
    pub name: Option<String>,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub state: Option<AlarmState>,
    pub enabled: Option<bool>,
    #[serde(rename = "type")]
    pub alarm_type: Option<String>,
    pub severity: Option<Severity>,
    /// Alarms currently in this state are left out.
    pub exclude_state: Option<AlarmState>,
    #[serde(default)]
    pub pagination: PaginationRequest,
}

impl AlarmFilter {
    /// The filter as an AND of simple nodes, or `None` when nothing is set.
    pub fn to_expr(&self) -> Option<FilterExpr> {
        let mut nodes = Vec::new();
        let mut eq = |field: &str, value: Option<Value>| {
            if let Some(value) = value {
                nodes.push(FilterExpr::eq(field, value));
            }
        };
        eq("alarm_id", self.alarm_id.clone().map(Value::from));
        eq("name", self.name.clone().map(Value::from));
        eq("user_id", self.user_id.clone().map(Value::from));
        eq("project_id", self.project_id.clone().map(Value::from));
        eq("state", self.state.map(|s| Value::from(s.as_str())));
        eq("enabled", self.enabled.map(Value::from));
        eq("type", self.alarm_type.clone().map(Value::from));
        eq("severity", self.severity.map(|s| Value::from(s.as_str())));
        if let Some(state) = self.exclude_state {
            nodes.push(FilterExpr::simple(SimpleOp::Ne, "state", state.as_str()));
        }
        conjunction(nodes)
    }
}

/// Lower bound comparison for [`AlarmChangeFilter::start_timestamp`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOp {
    Gt,
    #[default]
    Ge,
}

/// Upper bound comparison for [`AlarmChangeFilter::end_timestamp`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndOp {
    Lt,
    #[default]
    Le,
}

impl From<StartOp> for SimpleOp {
    fn from(op: StartOp) -> Self {
        match op {
            StartOp::Gt => SimpleOp::Gt,
            StartOp::Ge => SimpleOp::Ge,
        }
    }
}

impl From<EndOp> for SimpleOp {
    fn from(op: EndOp) -> Self {
        match op {
            EndOp::Lt => SimpleOp::Lt,
            EndOp::Le => SimpleOp::Le,
        }
    }
}

/// Filters for [`AlarmStorage::get_alarm_changes`]: one alarm's history,
/// newest first unless the pagination request names another order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlarmChangeFilter {
    pub alarm_id: String,
    pub on_behalf_of: Option<String>,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    #[serde(rename = "type")]
    pub change_type: Option<AlarmChangeType>,
    pub severity: Option<Severity>,
    pub start_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_op: StartOp,
    pub end_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_op: EndOp,
    #[serde(default)]
    pub pagination: PaginationRequest,
}

impl AlarmChangeFilter {
    pub fn new(alarm_id: impl Into<String>) -> Self {
        Self {
            alarm_id: alarm_id.into(),
            ..Self::default()
        }
    }

    pub fn to_expr(&self) -> FilterExpr {
        let mut nodes = vec![FilterExpr::eq("alarm_id", self.alarm_id.as_str())];
        let optional = [
            ("on_behalf_of", self.on_behalf_of.clone()),
            ("user_id", self.user_id.clone()),
            ("project_id", self.project_id.clone()),
            ("type", self.change_type.map(|t| t.as_str().to_string())),
            ("severity", self.severity.map(|s| s.as_str().to_string())),
        ];
        for (field, value) in optional {
            if let Some(value) = value {
                nodes.push(FilterExpr::eq(field, value));
            }
        }
        if let Some(start) = self.start_timestamp {
            nodes.push(FilterExpr::simple(self.start_op.into(), "timestamp", start.to_rfc3339()));
        }
        if let Some(end) = self.end_timestamp {
            nodes.push(FilterExpr::simple(self.end_op.into(), "timestamp", end.to_rfc3339()));
        }
        FilterExpr::and(nodes)
    }
}

fn conjunction(mut nodes: Vec<FilterExpr>) -> Option<FilterExpr> {
    match nodes.len() {
        0 => None,
        1 => nodes.pop(),
        _ => Some(FilterExpr::and(nodes)),
    }
}

/// Checks quota limits and stamps them with `project_id`.
///
/// A limit of `-1` means unlimited; anything lower is rejected.
pub fn normalize_quotas(project_id: &str, quotas: &[Quota]) -> Result<Vec<Quota>> {
    let mut merged: BTreeMap<&str, i64> = BTreeMap::new();
    for quota in quotas {
        if quota.limit < -1 {
            return Err(StorageError::InvalidQuota {
                resource: quota.resource.clone(),
                limit: quota.limit,
            });
        }
        merged.insert(quota.resource.as_str(), quota.limit);
    }
    Ok(merged
        .into_iter()
        .map(|(resource, limit)| Quota {
            project_id: project_id.to_string(),
            resource: resource.to_string(),
            limit,
        })
        .collect())
}

/// Storage connection contract implemented by every backend.
///
/// Implementations must be safe to share across threads (`Send + Sync`):
/// the alarm evaluator and the API layer call into the same instance
/// concurrently. Every method is one backend transaction.
pub trait AlarmStorage: Send + Sync {
    /// One page of alarms matching `filter`.
    fn select_alarms(&self, filter: Predicate, page: &PaginationRequest) -> Result<Vec<Alarm>>;

    /// One page of history records matching `filter`.
    fn select_alarm_changes(&self, filter: Predicate, page: &PaginationRequest) -> Result<Vec<AlarmChange>>;

    /// Stores a new alarm. Fails with [`StorageError::AlarmExists`] if the
    /// identity is taken.
    fn create_alarm(&self, alarm: &Alarm) -> Result<Alarm>;

    /// Replaces a stored alarm as a whole. Fails with
    /// [`StorageError::AlarmNotFound`] if it does not exist.
    fn update_alarm(&self, alarm: &Alarm) -> Result<Alarm>;

    /// Deletes an alarm together with its history.
    fn delete_alarm(&self, alarm_id: &str) -> Result<()>;

    /// Appends a history record. The referenced alarm must exist.
    fn record_alarm_change(&self, change: &AlarmChange) -> Result<()>;

    /// Deletes up to `max_count` history records older than `ttl_secs`,
    /// oldest first. Returns how many were deleted.
    fn prune_history(&self, ttl_secs: u64, max_count: Option<u64>) -> Result<u64>;

    /// Applies `update` only if its guard holds. `Ok(false)` means the alarm
    /// is missing or no longer matches.
    fn conditional_update(&self, update: &ConditionalUpdate) -> Result<bool>;

    fn get_quotas(&self, project_id: &str) -> Result<Vec<Quota>>;

    /// Creates or replaces the given quotas and returns the project's full set.
    fn set_quotas(&self, project_id: &str, quotas: &[Quota]) -> Result<Vec<Quota>>;

    fn delete_quotas(&self, project_id: &str) -> Result<()>;

    fn capabilities(&self) -> CapabilityMap;

    fn storage_capabilities(&self) -> CapabilityMap;

    fn get_alarms(&self, filter: &AlarmFilter) -> Result<Vec<Alarm>> {
        let base = match filter.to_expr() {
            Some(expr) => translate(&expr, Entity::Alarm)?,
            None => Predicate::Const(true),
        };
        self.select_alarms(base, &filter.pagination)
    }

    /// Runs a filter tree against alarms. Complex trees need the backend's
    /// `alarms.query.complex` capability.
    fn query_alarms(&self, filter: Option<&FilterExpr>, ordering: &[SortKey], limit: Option<u64>) -> Result<Vec<Alarm>> {
        require_query(&self.capabilities(), "alarms", filter)?;
        let base = translate_optional(filter, Entity::Alarm)?;
        self.select_alarms(base, &page_of(ordering, limit))
    }

    /// Runs a filter tree against history. Complex trees need
    /// `alarms.history.query.complex`.
    fn query_alarm_history(
        &self,
        filter: Option<&FilterExpr>,
        ordering: &[SortKey],
        limit: Option<u64>,
    ) -> Result<Vec<AlarmChange>> {
        require_query(&self.capabilities(), "alarms.history", filter)?;
        let base = translate_optional(filter, Entity::AlarmChange)?;
        self.select_alarm_changes(base, &page_of(ordering, limit))
    }

    fn get_alarm_changes(&self, filter: &AlarmChangeFilter) -> Result<Vec<AlarmChange>> {
        let base = translate(&filter.to_expr(), Entity::AlarmChange)?;
        self.select_alarm_changes(base, &filter.pagination)
    }

    /// Moves `alarm` to `state` if its stored state is still `alarm.state`,
    /// then records the transition in history.
    ///
    /// Returns `Ok(false)` without recording anything when another writer got
    /// there first; re-read the alarm before trying again.
    fn transition_state(&self, alarm: &Alarm, state: AlarmState, reason: &str, on_behalf_of: &str) -> Result<bool> {
        let now = Utc::now();
        let update = ConditionalUpdate::new(alarm.alarm_id.as_str())
            .set("state", state.as_str())
            .set("state_reason", reason)
            .set("state_timestamp", now.to_rfc3339())
            .expect("state", alarm.state.as_str());
        if !self.conditional_update(&update)? {
            return Ok(false);
        }

        let detail = serde_json::json!({"state": state.as_str(), "transition_reason": reason});
        let mut change =
            AlarmChange::for_alarm(alarm, AlarmChangeType::StateTransition, detail.to_string(), on_behalf_of);
        change.timestamp = now;
        self.record_alarm_change(&change)?;
        tracing::debug!(alarm_id = %alarm.alarm_id, from = %alarm.state, to = %state, "Alarm state changed");
        Ok(true)
    }
}

fn translate_optional(filter: Option<&FilterExpr>, entity: Entity) -> Result<Predicate> {
    filter.map_or(Ok(Predicate::Const(true)), |expr| translate(expr, entity))
}

fn page_of(ordering: &[SortKey], limit: Option<u64>) -> PaginationRequest {
    PaginationRequest {
        sort: ordering.to_vec(),
        marker: None,
        limit,
    }
}
