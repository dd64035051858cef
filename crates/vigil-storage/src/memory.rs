use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use vigil_common::types::{Alarm, AlarmChange, Quota};

use crate::capabilities::{base_capabilities, base_storage_capabilities, complex_query_override, merge, CapabilityMap};
use crate::error::{Result, StorageError};
use crate::pagination::{paginate, BoundedQuery, PagePlan, PaginationRequest};
use crate::retention;
use crate::schema::Record;
use crate::translate::Predicate;
use crate::update::ConditionalUpdate;
use crate::{normalize_quotas, AlarmStorage};

#[derive(Default)]
struct Tables {
    alarms: BTreeMap<String, Alarm>,
    history: BTreeMap<String, AlarmChange>,
    quotas: BTreeMap<(String, String), i64>,
}

/// In-process backend. Evaluates predicates directly against the stored
/// records; a read-write lock gives readers shared access and makes every
/// write atomic.
#[derive(Default)]
pub struct MemoryAlarmStorage {
    tables: RwLock<Tables>,
}

impl MemoryAlarmStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs a bounded query over an in-memory table.
pub fn execute<'a, R: Record>(rows: impl IntoIterator<Item = &'a R>, query: &BoundedQuery) -> Vec<R> {
    let mut selected: Vec<R> = rows
        .into_iter()
        .filter(|row| query.predicate.matches(*row))
        .cloned()
        .collect();
    query.ordering.sort(&mut selected);
    if let Some(limit) = query.limit {
        selected.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    }
    selected
}

fn select<R: Record>(table: &BTreeMap<String, R>, filter: Predicate, page: &PaginationRequest) -> Result<Vec<R>> {
    let plan = paginate::<R, _>(filter, page, |marker| Ok(table.get(marker).cloned()))?;
    Ok(match plan {
        PagePlan::Empty => Vec::new(),
        PagePlan::Bounded(query) => execute(table.values(), &query),
    })
}

fn quotas_of(tables: &Tables, project_id: &str) -> Vec<Quota> {
    tables
        .quotas
        .iter()
        .filter(|((project, _), _)| project == project_id)
        .map(|((project, resource), limit)| Quota {
            project_id: project.clone(),
            resource: resource.clone(),
            limit: *limit,
        })
        .collect()
}

impl AlarmStorage for MemoryAlarmStorage {
    fn select_alarms(&self, filter: Predicate, page: &PaginationRequest) -> Result<Vec<Alarm>> {
        if page.limit == Some(0) {
            return Ok(Vec::new());
        }
        select(&self.read().alarms, filter, page)
    }

    fn select_alarm_changes(&self, filter: Predicate, page: &PaginationRequest) -> Result<Vec<AlarmChange>> {
        if page.limit == Some(0) {
            return Ok(Vec::new());
        }
        select(&self.read().history, filter, page)
    }

    fn create_alarm(&self, alarm: &Alarm) -> Result<Alarm> {
        let mut tables = self.write();
        if tables.alarms.contains_key(&alarm.alarm_id) {
            return Err(StorageError::AlarmExists(alarm.alarm_id.clone()));
        }
        tables.alarms.insert(alarm.alarm_id.clone(), alarm.clone());
        Ok(alarm.clone())
    }

    fn update_alarm(&self, alarm: &Alarm) -> Result<Alarm> {
        let mut tables = self.write();
        let stored = tables
            .alarms
            .get_mut(&alarm.alarm_id)
            .ok_or_else(|| StorageError::AlarmNotFound(alarm.alarm_id.clone()))?;
        *stored = alarm.clone();
        Ok(alarm.clone())
    }

    fn delete_alarm(&self, alarm_id: &str) -> Result<()> {
        let mut tables = self.write();
        tables.alarms.remove(alarm_id);
        tables.history.retain(|_, change| change.alarm_id != alarm_id);
        Ok(())
    }

    fn record_alarm_change(&self, change: &AlarmChange) -> Result<()> {
        let mut tables = self.write();
        if !tables.alarms.contains_key(&change.alarm_id) {
            return Err(StorageError::AlarmNotFound(change.alarm_id.clone()));
        }
        tables.history.insert(change.event_id.clone(), change.clone());
        Ok(())
    }

    fn prune_history(&self, ttl_secs: u64, max_count: Option<u64>) -> Result<u64> {
        let cutoff = retention::cutoff(Utc::now(), ttl_secs);
        let mut tables = self.write();
        let expired = retention::select_expired(tables.history.values(), cutoff, max_count);
        for event_id in &expired {
            tables.history.remove(event_id);
        }
        Ok(expired.len() as u64)
    }

    fn conditional_update(&self, update: &ConditionalUpdate) -> Result<bool> {
        let plan = update.plan()?;
        let mut tables = self.write();
        let Some(stored) = tables.alarms.get_mut(&update.alarm_id) else {
            return Ok(false);
        };
        if !plan.guard.matches(&*stored) {
            tracing::debug!(alarm_id = %update.alarm_id, "Conditional update did not match");
            return Ok(false);
        }
        let mut next = stored.clone();
        plan.apply(&mut next)?;
        *stored = next;
        Ok(true)
    }

    fn get_quotas(&self, project_id: &str) -> Result<Vec<Quota>> {
        Ok(quotas_of(&self.read(), project_id))
    }

    fn set_quotas(&self, project_id: &str, quotas: &[Quota]) -> Result<Vec<Quota>> {
        let quotas = normalize_quotas(project_id, quotas)?;
        let mut tables = self.write();
        for quota in quotas {
            tables.quotas.insert((quota.project_id, quota.resource), quota.limit);
        }
        Ok(quotas_of(&tables, project_id))
    }

    fn delete_quotas(&self, project_id: &str) -> Result<()> {
        self.write().quotas.retain(|(project, _), _| project != project_id);
        Ok(())
    }

    fn capabilities(&self) -> CapabilityMap {
        merge(&base_capabilities(), &complex_query_override())
    }

    fn storage_capabilities(&self) -> CapabilityMap {
        base_storage_capabilities()
    }
}
