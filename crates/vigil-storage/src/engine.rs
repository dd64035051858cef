use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, Row, ToSql};
use serde::de::DeserializeOwned;
use vigil_common::types::{Alarm, AlarmChange, Quota};

use crate::capabilities::{
    base_capabilities, base_storage_capabilities, complex_query_override, merge, CapabilityMap,
};
use crate::error::{Result, StorageError};
use crate::ordering::ResolvedOrdering;
use crate::pagination::{paginate, BoundedQuery, PagePlan, PaginationRequest};
use crate::retention;
use crate::schema::{parse_timestamp, Entity, FieldValue, Record};
use crate::translate::sql::{self, quote, timestamp_text, OperatorTable, SqlClause, SqlParam, REGEXP_FUNCTION};
use crate::translate::{compile_pattern, CompareOp, Predicate};
use crate::update::ConditionalUpdate;
use crate::{normalize_quotas, AlarmStorage};

const ALARMS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS alarms (
    alarm_id TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL,
    name TEXT NOT NULL,
    \"type\" TEXT NOT NULL,
    description TEXT NOT NULL,
    severity TEXT NOT NULL,
    state TEXT NOT NULL,
    state_reason TEXT NOT NULL,
    state_timestamp TEXT NOT NULL,
    rule TEXT NOT NULL,
    ok_actions TEXT NOT NULL,
    alarm_actions TEXT NOT NULL,
    insufficient_data_actions TEXT NOT NULL,
    time_constraints TEXT NOT NULL,
    repeat_actions INTEGER NOT NULL,
    evaluate_timestamp TEXT,
    user_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    \"timestamp\" TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alarms_project ON alarms(project_id);
CREATE INDEX IF NOT EXISTS idx_alarms_user ON alarms(user_id);
CREATE INDEX IF NOT EXISTS idx_alarms_time ON alarms(\"timestamp\");
";

const ALARM_HISTORY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS alarm_history (
    event_id TEXT PRIMARY KEY,
    alarm_id TEXT NOT NULL REFERENCES alarms(alarm_id) ON DELETE CASCADE,
    \"type\" TEXT NOT NULL,
    detail TEXT NOT NULL,
    severity TEXT NOT NULL,
    on_behalf_of TEXT NOT NULL,
    user_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    \"timestamp\" TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_alarm ON alarm_history(alarm_id);
CREATE INDEX IF NOT EXISTS idx_history_time ON alarm_history(\"timestamp\", event_id);
";

const QUOTAS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS quotas (
    project_id TEXT NOT NULL,
    resource TEXT NOT NULL,
    \"limit\" INTEGER NOT NULL,
    PRIMARY KEY (project_id, resource)
);
";

const PRUNE_HISTORY: &str = "
DELETE FROM alarm_history WHERE event_id IN (
    SELECT event_id FROM alarm_history
    WHERE \"timestamp\" < ?1
    ORDER BY \"timestamp\" ASC, event_id ASC
    LIMIT ?2
)";

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_CONNECTIONS: usize = 4;

/// SQLite backend.
///
/// Writes go through a single connection; file databases also open a set of
/// read-only connections so WAL readers proceed in parallel with each other
/// and with the writer.
pub struct SqliteAlarmStorage {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    operators: OperatorTable,
}

impl SqliteAlarmStorage {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, DEFAULT_BUSY_TIMEOUT, DEFAULT_READ_CONNECTIONS)
    }

    pub fn open_with(path: &Path, busy_timeout: Duration, read_connections: usize) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let writer = Connection::open(path)?;
        prepare_connection(&writer, busy_timeout)?;
        writer.execute_batch("PRAGMA journal_mode=WAL;")?;
        writer.execute_batch(ALARMS_SCHEMA)?;
        writer.execute_batch(ALARM_HISTORY_SCHEMA)?;
        writer.execute_batch(QUOTAS_SCHEMA)?;

        let mut readers = Vec::with_capacity(read_connections);
        for _ in 0..read_connections {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
            )?;
            prepare_connection(&conn, busy_timeout)?;
            readers.push(Mutex::new(conn));
        }

        tracing::info!(path = %path.display(), readers = read_connections, "Opened SQLite alarm storage");
        Ok(Self::from_parts(writer, readers))
    }

    /// Private in-memory database on a single connection.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        prepare_connection(&conn, DEFAULT_BUSY_TIMEOUT)?;
        conn.execute_batch(ALARMS_SCHEMA)?;
        conn.execute_batch(ALARM_HISTORY_SCHEMA)?;
        conn.execute_batch(QUOTAS_SCHEMA)?;
        Ok(Self::from_parts(conn, Vec::new()))
    }

    fn from_parts(writer: Connection, readers: Vec<Mutex<Connection>>) -> Self {
        Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            operators: OperatorTable::default(),
        }
    }

    /// Replaces the pattern-operator templates used when rendering filters.
    pub fn with_operators(mut self, operators: OperatorTable) -> Self {
        self.operators = operators;
        self
    }

    /// Lock the write connection, recovering from a poisoned Mutex if necessary.
    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Any idle reader, else wait on the next one in turn.
    fn reader(&self) -> MutexGuard<'_, Connection> {
        if self.readers.is_empty() {
            return self.writer();
        }
        for conn in &self.readers {
            match conn.try_lock() {
                Ok(guard) => return guard,
                Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {}
            }
        }
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        self.readers[idx].lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn select_page<R: StoredRecord>(&self, filter: Predicate, page: &PaginationRequest) -> Result<Vec<R>> {
        // Zero-row pages never take a connection.
        if page.limit == Some(0) {
            return Ok(Vec::new());
        }
        let conn = self.reader();
        let tx = conn.unchecked_transaction()?;
        let plan = paginate::<R, _>(filter, page, |marker| find::<R>(&tx, marker, &self.operators))?;
        let rows = match plan {
            PagePlan::Empty => Vec::new(),
            PagePlan::Bounded(query) => {
                let clause = sql::select(&query, &self.operators);
                tracing::debug!(sql = %clause.clause, params = clause.params.len(), "Selecting {}", R::ENTITY.name());
                fetch::<R>(&tx, &clause)?
            }
        };
        tx.commit()?;
        Ok(rows)
    }
}

fn prepare_connection(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    register_regexp(conn)?;
    Ok(())
}

/// Registers `vigil_regexp(pattern, value)`: NULL for non-text values,
/// otherwise whether `pattern` matches anywhere in `value`.
fn register_regexp(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        REGEXP_FUNCTION,
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let regex: Arc<Regex> = ctx.get_or_create_aux(0, |pattern| -> std::result::Result<Regex, BoxError> {
                Ok(compile_pattern(pattern.as_str()?)?)
            })?;
            match ctx.get_raw(1) {
                ValueRef::Text(bytes) => {
                    let text = std::str::from_utf8(bytes).map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
                    Ok(Some(regex.is_match(text)))
                }
                _ => Ok(None),
            }
        },
    )?;
    Ok(())
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            SqlParam::Null => Ok(ToSqlOutput::Owned(rusqlite::types::Value::Null)),
            SqlParam::Bool(b) => b.to_sql(),
            SqlParam::Int(i) => i.to_sql(),
            SqlParam::Text(s) => s.to_sql(),
        }
    }
}

/// A record that can be read back from its table.
trait StoredRecord: Record + Sized {
    fn from_row(row: &Row<'_>) -> Result<Self>;
}

impl StoredRecord for Alarm {
    fn from_row(row: &Row<'_>) -> Result<Self> {
        let evaluate: Option<String> = row.get("evaluate_timestamp")?;
        Ok(Alarm {
            alarm_id: row.get("alarm_id")?,
            enabled: row.get("enabled")?,
            name: row.get("name")?,
            alarm_type: row.get("type")?,
            description: row.get("description")?,
            severity: decode_enum("severity", &row.get::<_, String>("severity")?)?,
            state: decode_enum("state", &row.get::<_, String>("state")?)?,
            state_reason: row.get("state_reason")?,
            state_timestamp: decode_timestamp("state_timestamp", &row.get::<_, String>("state_timestamp")?)?,
            rule: decode_json("rule", &row.get::<_, String>("rule")?)?,
            ok_actions: decode_json("ok_actions", &row.get::<_, String>("ok_actions")?)?,
            alarm_actions: decode_json("alarm_actions", &row.get::<_, String>("alarm_actions")?)?,
            insufficient_data_actions: decode_json(
                "insufficient_data_actions",
                &row.get::<_, String>("insufficient_data_actions")?,
            )?,
            time_constraints: decode_json("time_constraints", &row.get::<_, String>("time_constraints")?)?,
            repeat_actions: row.get("repeat_actions")?,
            evaluate_timestamp: evaluate
                .map(|raw| decode_timestamp("evaluate_timestamp", &raw))
                .transpose()?,
            user_id: row.get("user_id")?,
            project_id: row.get("project_id")?,
            timestamp: decode_timestamp("timestamp", &row.get::<_, String>("timestamp")?)?,
        })
    }
}

impl StoredRecord for AlarmChange {
    fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(AlarmChange {
            event_id: row.get("event_id")?,
            alarm_id: row.get("alarm_id")?,
            change_type: decode_enum("type", &row.get::<_, String>("type")?)?,
            detail: row.get("detail")?,
            severity: decode_enum("severity", &row.get::<_, String>("severity")?)?,
            on_behalf_of: row.get("on_behalf_of")?,
            user_id: row.get("user_id")?,
            project_id: row.get("project_id")?,
            timestamp: decode_timestamp("timestamp", &row.get::<_, String>("timestamp")?)?,
        })
    }
}

fn decode_timestamp(column: &'static str, raw: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(raw).ok_or_else(|| StorageError::Corrupt {
        column,
        reason: format!("'{raw}' is not a timestamp"),
    })
}

fn decode_enum<T: FromStr<Err = String>>(column: &'static str, raw: &str) -> Result<T> {
    raw.parse().map_err(|reason| StorageError::Corrupt { column, reason })
}

fn decode_json<T: DeserializeOwned>(column: &'static str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| StorageError::Corrupt {
        column,
        reason: e.to_string(),
    })
}

fn fetch<R: StoredRecord>(conn: &Connection, clause: &SqlClause) -> Result<Vec<R>> {
    let mut stmt = conn.prepare(&clause.clause)?;
    let mut rows = stmt.query(params_from_iter(clause.params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(R::from_row(row)?);
    }
    Ok(out)
}

fn find<R: StoredRecord>(conn: &Connection, id: &str, operators: &OperatorTable) -> Result<Option<R>> {
    let entity = R::ENTITY;
    let query = BoundedQuery {
        entity,
        predicate: Predicate::compare(entity.identity(), CompareOp::Eq, FieldValue::Text(id.to_string())),
        ordering: ResolvedOrdering::resolve(&[], entity)?,
        limit: Some(1),
    };
    Ok(fetch::<R>(conn, &sql::select(&query, operators))?.pop())
}

fn insert<R: Record>(conn: &Connection, record: &R) -> Result<()> {
    let fields = R::ENTITY.fields();
    let columns: Vec<String> = fields.iter().map(|f| quote(f.name)).collect();
    let placeholders = vec!["?"; fields.len()].join(", ");
    let params: Vec<SqlParam> = fields.iter().map(|f| SqlParam::stored(&record.value(f.name))).collect();
    conn.execute(
        &format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            R::ENTITY.table(),
            columns.join(", ")
        ),
        params_from_iter(params.iter()),
    )?;
    Ok(())
}

fn alarm_exists(conn: &Connection, alarm_id: &str) -> Result<bool> {
    let found: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM alarms WHERE alarm_id = ?1",
        [alarm_id],
        |row| row.get(0),
    )?;
    Ok(found)
}

fn load_quotas(conn: &Connection, project_id: &str) -> Result<Vec<Quota>> {
    let mut stmt = conn.prepare_cached(
        "SELECT project_id, resource, \"limit\" FROM quotas WHERE project_id = ?1 ORDER BY resource",
    )?;
    let rows = stmt.query_map([project_id], |row| {
        Ok(Quota {
            project_id: row.get(0)?,
            resource: row.get(1)?,
            limit: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

impl AlarmStorage for SqliteAlarmStorage {
    fn select_alarms(&self, filter: Predicate, page: &PaginationRequest) -> Result<Vec<Alarm>> {
        self.select_page(filter, page)
    }

    fn select_alarm_changes(&self, filter: Predicate, page: &PaginationRequest) -> Result<Vec<AlarmChange>> {
        self.select_page(filter, page)
    }

    fn create_alarm(&self, alarm: &Alarm) -> Result<Alarm> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        if alarm_exists(&tx, &alarm.alarm_id)? {
            return Err(StorageError::AlarmExists(alarm.alarm_id.clone()));
        }
        insert(&tx, alarm)?;
        tx.commit()?;
        tracing::debug!(alarm_id = %alarm.alarm_id, "Created alarm");
        Ok(alarm.clone())
    }

    fn update_alarm(&self, alarm: &Alarm) -> Result<Alarm> {
        let fields = &Entity::Alarm.fields()[1..];
        let assignments: Vec<String> = fields.iter().map(|f| format!("{} = ?", quote(f.name))).collect();
        let mut params: Vec<SqlParam> = fields.iter().map(|f| SqlParam::stored(&alarm.value(f.name))).collect();
        params.push(SqlParam::Text(alarm.alarm_id.clone()));

        let mut conn = self.writer();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            &format!("UPDATE alarms SET {} WHERE alarm_id = ?", assignments.join(", ")),
            params_from_iter(params.iter()),
        )?;
        if changed == 0 {
            return Err(StorageError::AlarmNotFound(alarm.alarm_id.clone()));
        }
        tx.commit()?;
        Ok(alarm.clone())
    }

    fn delete_alarm(&self, alarm_id: &str) -> Result<()> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        let history = tx.execute("DELETE FROM alarm_history WHERE alarm_id = ?1", [alarm_id])?;
        let alarms = tx.execute("DELETE FROM alarms WHERE alarm_id = ?1", [alarm_id])?;
        tx.commit()?;
        tracing::debug!(alarm_id, alarms, history, "Deleted alarm");
        Ok(())
    }

    fn record_alarm_change(&self, change: &AlarmChange) -> Result<()> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        if !alarm_exists(&tx, &change.alarm_id)? {
            return Err(StorageError::AlarmNotFound(change.alarm_id.clone()));
        }
        insert(&tx, change)?;
        tx.commit()?;
        Ok(())
    }

    fn prune_history(&self, ttl_secs: u64, max_count: Option<u64>) -> Result<u64> {
        if max_count == Some(0) {
            return Ok(0);
        }
        let cutoff = retention::cutoff(Utc::now(), ttl_secs);
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            PRUNE_HISTORY,
            rusqlite::params![timestamp_text(cutoff), retention::sql_limit(max_count)],
        )?;
        tx.commit()?;
        tracing::info!(deleted, cutoff = %cutoff, "Pruned alarm history");
        Ok(deleted as u64)
    }

    fn conditional_update(&self, update: &ConditionalUpdate) -> Result<bool> {
        let plan = update.plan()?;
        let guard = sql::render(&plan.guard, &self.operators);
        let assignments: Vec<String> = plan
            .assignments
            .iter()
            .map(|(field, _)| format!("{} = ?", quote(field.name)))
            .collect();
        let mut params: Vec<SqlParam> = plan
            .assignments
            .iter()
            .map(|(_, value)| SqlParam::stored(value))
            .collect();
        params.extend(guard.params);

        let mut conn = self.writer();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            &format!("UPDATE alarms SET {} WHERE {}", assignments.join(", "), guard.clause),
            params_from_iter(params.iter()),
        )?;
        tx.commit()?;
        if changed == 0 {
            tracing::debug!(alarm_id = %update.alarm_id, "Conditional update did not match");
        }
        Ok(changed > 0)
    }

    fn get_quotas(&self, project_id: &str) -> Result<Vec<Quota>> {
        let conn = self.reader();
        load_quotas(&conn, project_id)
    }

    fn set_quotas(&self, project_id: &str, quotas: &[Quota]) -> Result<Vec<Quota>> {
        let quotas = normalize_quotas(project_id, quotas)?;
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO quotas (project_id, resource, \"limit\") VALUES (?1, ?2, ?3)
                 ON CONFLICT(project_id, resource) DO UPDATE SET \"limit\" = excluded.\"limit\"",
            )?;
            for quota in &quotas {
                stmt.execute(rusqlite::params![&quota.project_id, &quota.resource, quota.limit])?;
            }
        }
        let stored = load_quotas(&tx, project_id)?;
        tx.commit()?;
        Ok(stored)
    }

    fn delete_quotas(&self, project_id: &str) -> Result<()> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM quotas WHERE project_id = ?1", [project_id])?;
        tx.commit()?;
        Ok(())
    }

    fn capabilities(&self) -> CapabilityMap {
        merge(&base_capabilities(), &complex_query_override())
    }

    fn storage_capabilities(&self) -> CapabilityMap {
        let production = CapabilityMap::nested([(
            "storage",
            CapabilityMap::nested([("production_ready", CapabilityMap::Flag(true))]),
        )]);
        merge(&base_storage_capabilities(), &production)
    }
}
