#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use patlab_kernel_contracts::participant::ParticipantId;
use patlab_kernel_contracts::submission::SubmissionPayload;
use patlab_kernel_contracts::{non_empty_trimmed, ContractViolation, Validate};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

pub const EXPERIMENT_TABLE: &str = "experiment_data";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("contract violation: {0}")]
    ContractViolation(ContractViolation),
    #[error("table '{table}' does not exist")]
    MissingTable { table: String },
    #[error("table '{table}' already exists")]
    TableExists { table: String },
    #[error("database error: {0}")]
    Database(String),
}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

/// Which optional columns the live table carries.
///
/// The original deployment created the table without `prolific_id`/`debrief_data`; the
/// rebuild adds them. Inserts are shaped from this profile instead of probing with a
/// statement and reacting to an "unknown column" failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchemaProfile {
    pub has_prolific_id: bool,
    pub has_debrief_data: bool,
}

impl SchemaProfile {
    pub const LEGACY: Self = Self {
        has_prolific_id: false,
        has_debrief_data: false,
    };
    pub const EXTENDED: Self = Self {
        has_prolific_id: true,
        has_debrief_data: true,
    };

    pub fn is_extended(self) -> bool {
        self == Self::EXTENDED
    }

    fn from_columns(columns: &[String]) -> Self {
        Self {
            has_prolific_id: columns.iter().any(|c| c == "prolific_id"),
            has_debrief_data: columns.iter().any(|c| c == "debrief_data"),
        }
    }
}

/// DDL for the current table shape. Index names carry the table name because SQLite
/// index names are schema-global and the shadow table coexists with the live one.
pub fn extended_table_ddl(table: &str) -> String {
    let mut ddl = format!(
        r#"
        CREATE TABLE {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            participant_id TEXT NOT NULL,
            prolific_id TEXT NULL,
            "condition" TEXT NOT NULL,
            submission_time TEXT DEFAULT CURRENT_TIMESTAMP,
            task_data TEXT NULL CHECK (task_data IS NULL OR json_valid(task_data)),
            freeplay_data TEXT NULL CHECK (freeplay_data IS NULL OR json_valid(freeplay_data)),
            debrief_data TEXT NULL CHECK (debrief_data IS NULL OR json_valid(debrief_data)),
            user_agent TEXT NULL,
            screen_resolution TEXT NULL
        );
        "#
    );
    ddl.push_str(&extended_index_ddl(table));
    ddl
}

/// Indexes of the extended table, named after `table`.
pub fn extended_index_ddl(table: &str) -> String {
    format!(
        r#"
        CREATE INDEX idx_{table}_participant ON {table}(participant_id);
        CREATE INDEX idx_{table}_prolific ON {table}(prolific_id);
        CREATE INDEX idx_{table}_condition ON {table}("condition");
        CREATE INDEX idx_{table}_time ON {table}(submission_time);
        "#
    )
}

/// Names of the explicitly created indexes on `table`.
pub fn table_index_names(conn: &Connection, table: &str) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL \
         ORDER BY name",
    )?;
    let names = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// DDL of the first deployment: no recruitment id, no debrief column, nullable keys.
pub fn legacy_table_ddl(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            participant_id TEXT,
            "condition" TEXT,
            submission_time TEXT DEFAULT CURRENT_TIMESTAMP,
            task_data TEXT,
            freeplay_data TEXT,
            user_agent TEXT,
            screen_resolution TEXT
        );
        CREATE INDEX idx_{table}_participant ON {table}(participant_id);
        CREATE INDEX idx_{table}_condition ON {table}("condition");
        CREATE INDEX idx_{table}_time ON {table}(submission_time);
        "#
    )
}

/// `~/.patlab/experiment.db`, or a relative `.patlab/experiment.db` without a home directory.
pub fn default_db_path(home: Option<String>) -> PathBuf {
    match home.filter(|h| !h.trim().is_empty()) {
        Some(home) => PathBuf::from(home).join(".patlab").join("experiment.db"),
        None => PathBuf::from(".patlab").join("experiment.db"),
    }
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, StorageError> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Shape of `table`, or `None` when it does not exist.
pub fn detect_schema(conn: &Connection, table: &str) -> Result<Option<SchemaProfile>, StorageError> {
    let columns = table_columns(conn, table)?;
    if columns.is_empty() {
        return Ok(None);
    }
    Ok(Some(SchemaProfile::from_columns(&columns)))
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<u64, StorageError> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(n.max(0) as u64)
}

/// Creates the live table with the extended schema unless some version of it exists.
/// Returns whether a table was created.
pub fn ensure_experiment_table(conn: &Connection) -> Result<bool, StorageError> {
    if table_exists(conn, EXPERIMENT_TABLE)? {
        return Ok(false);
    }
    conn.execute_batch(&extended_table_ddl(EXPERIMENT_TABLE))?;
    info!(table = EXPERIMENT_TABLE, "created experiment table");
    Ok(true)
}

/// One submission as handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRowInput {
    pub participant_id: ParticipantId,
    pub prolific_id: Option<String>,
    pub condition: String,
    pub task_data: Option<Value>,
    pub freeplay_data: Option<Value>,
    pub debrief_data: Option<Value>,
    pub user_agent: Option<String>,
    pub screen_resolution: Option<String>,
}

impl SubmissionRowInput {
    /// `fallback_user_agent` fills in when the body carried none (the request header).
    pub fn from_payload(payload: SubmissionPayload, fallback_user_agent: Option<String>) -> Self {
        Self {
            participant_id: payload.participant_id,
            prolific_id: payload.prolific_id,
            condition: payload.condition,
            task_data: payload.task_data,
            freeplay_data: payload.freeplay_data,
            debrief_data: payload.debrief_data,
            user_agent: payload.user_agent.or(fallback_user_agent),
            screen_resolution: payload.screen_resolution,
        }
    }
}

impl Validate for SubmissionRowInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.participant_id.validate()?;
        if self.condition.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "submission_row.condition",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionRecord {
    pub id: i64,
    pub participant_id: String,
    pub prolific_id: Option<String>,
    pub condition: String,
    pub submission_time: Option<String>,
    pub task_data: Option<Value>,
    pub freeplay_data: Option<Value>,
    pub debrief_data: Option<Value>,
    pub user_agent: Option<String>,
    pub screen_resolution: Option<String>,
}

fn json_text(value: &Option<Value>) -> Option<String> {
    value.as_ref().map(Value::to_string)
}

fn parse_json_text(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

/// Loose text read used for rows written by older tools that may hold non-text values.
pub(crate) fn sql_value_to_text(value: SqlValue) -> Option<String> {
    match value {
        SqlValue::Null => None,
        SqlValue::Integer(i) => Some(i.to_string()),
        SqlValue::Real(f) => Some(f.to_string()),
        SqlValue::Text(s) => Some(s),
        SqlValue::Blob(b) => Some(String::from_utf8_lossy(&b).into_owned()),
    }
}

pub struct SubmissionStore {
    conn: Connection,
    schema: SchemaProfile,
}

impl SubmissionStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    StorageError::Database(format!(
                        "failed to create database directory '{}': {err}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Creates the table when absent, then records the live table's shape.
    pub fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        ensure_experiment_table(&conn)?;
        let mut store = Self {
            conn,
            schema: SchemaProfile::default(),
        };
        store.refresh_schema()?;
        Ok(store)
    }

    pub fn schema(&self) -> SchemaProfile {
        self.schema
    }

    /// Re-reads the table shape, e.g. after a migration swapped tables underneath.
    pub fn refresh_schema(&mut self) -> Result<SchemaProfile, StorageError> {
        let columns = table_columns(&self.conn, EXPERIMENT_TABLE)?;
        if columns.is_empty() {
            return Err(StorageError::MissingTable {
                table: EXPERIMENT_TABLE.to_string(),
            });
        }
        self.schema = SchemaProfile::from_columns(&columns);
        debug!(schema = ?self.schema, "experiment table schema detected");
        Ok(self.schema)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// The table shape is re-read on every insert so a migration run from another
    /// connection is picked up without a restart.
    pub fn insert_submission(&mut self, input: SubmissionRowInput) -> Result<i64, StorageError> {
        input.validate()?;
        self.refresh_schema()?;

        let mut columns = vec!["participant_id", "\"condition\""];
        let mut values: Vec<SqlValue> = vec![
            SqlValue::Text(input.participant_id.as_str().to_string()),
            SqlValue::Text(input.condition.clone()),
        ];
        if self.schema.has_prolific_id {
            columns.push("prolific_id");
            values.push(opt_text(input.prolific_id.clone()));
        }
        columns.push("task_data");
        values.push(opt_text(json_text(&input.task_data)));
        columns.push("freeplay_data");
        values.push(opt_text(json_text(&input.freeplay_data)));
        if self.schema.has_debrief_data {
            columns.push("debrief_data");
            values.push(opt_text(json_text(&input.debrief_data)));
        }
        columns.push("user_agent");
        values.push(opt_text(input.user_agent.clone()));
        columns.push("screen_resolution");
        values.push(opt_text(input.screen_resolution.clone()));

        let placeholders = (1..=values.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {EXPERIMENT_TABLE} ({}) VALUES ({placeholders})",
            columns.join(", ")
        );
        self.conn
            .execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn submission_rows(&self) -> Result<Vec<SubmissionRecord>, StorageError> {
        let sql = format!("{} ORDER BY id ASC", self.select_sql()?);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], read_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn submission_row(&self, id: i64) -> Result<Option<SubmissionRecord>, StorageError> {
        let sql = format!("{} WHERE id = ?1", self.select_sql()?);
        let row = self
            .conn
            .query_row(&sql, params![id], read_record)
            .optional()?;
        Ok(row)
    }

    pub fn row_count(&self) -> Result<u64, StorageError> {
        count_rows(&self.conn, EXPERIMENT_TABLE)
    }

    fn select_sql(&self) -> Result<String, StorageError> {
        let schema = detect_schema(&self.conn, EXPERIMENT_TABLE)?.ok_or_else(|| {
            StorageError::MissingTable {
                table: EXPERIMENT_TABLE.to_string(),
            }
        })?;
        let prolific = if schema.has_prolific_id {
            "prolific_id"
        } else {
            "NULL AS prolific_id"
        };
        let debrief = if schema.has_debrief_data {
            "debrief_data"
        } else {
            "NULL AS debrief_data"
        };
        Ok(format!(
            "SELECT id, participant_id, {prolific}, \"condition\", submission_time, task_data, \
             freeplay_data, {debrief}, user_agent, screen_resolution FROM {EXPERIMENT_TABLE}"
        ))
    }
}

fn opt_text(v: Option<String>) -> SqlValue {
    match v {
        Some(s) => SqlValue::Text(s),
        None => SqlValue::Null,
    }
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubmissionRecord> {
    Ok(SubmissionRecord {
        id: row.get(0)?,
        participant_id: sql_value_to_text(row.get(1)?).unwrap_or_default(),
        prolific_id: non_empty_trimmed(sql_value_to_text(row.get(2)?).as_deref()),
        condition: sql_value_to_text(row.get(3)?).unwrap_or_default(),
        submission_time: sql_value_to_text(row.get(4)?),
        task_data: parse_json_text(sql_value_to_text(row.get(5)?)),
        freeplay_data: parse_json_text(sql_value_to_text(row.get(6)?)),
        debrief_data: parse_json_text(sql_value_to_text(row.get(7)?)),
        user_agent: sql_value_to_text(row.get(8)?),
        screen_resolution: sql_value_to_text(row.get(9)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(pid: &str) -> SubmissionRowInput {
        SubmissionRowInput {
            participant_id: ParticipantId::new(pid).unwrap(),
            prolific_id: Some("PRO_1".to_string()),
            condition: "puzzleFirst".to_string(),
            task_data: Some(json!([{"metadata": {"totalTasks": 25}}])),
            freeplay_data: None,
            debrief_data: Some(json!({"strategy": "x"})),
            user_agent: Some("agent".to_string()),
            screen_resolution: Some("1920x1080".to_string()),
        }
    }

    #[test]
    fn at_store_01_fresh_store_uses_extended_schema() {
        let store = SubmissionStore::open_in_memory().unwrap();
        assert!(store.schema().is_extended());
    }

    #[test]
    fn at_store_02_legacy_table_is_detected_and_insert_skips_new_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&legacy_table_ddl(EXPERIMENT_TABLE)).unwrap();
        let mut store = SubmissionStore::from_connection(conn).unwrap();
        assert_eq!(store.schema(), SchemaProfile::LEGACY);

        let id = store.insert_submission(input("P_1_a")).unwrap();
        let row = store.submission_row(id).unwrap().unwrap();
        assert_eq!(row.prolific_id, None);
        assert_eq!(row.debrief_data, None);
        assert_eq!(row.task_data, Some(json!([{"metadata": {"totalTasks": 25}}])));
    }

    #[test]
    fn at_store_03_ids_are_positive_and_increasing() {
        let mut store = SubmissionStore::open_in_memory().unwrap();
        let a = store.insert_submission(input("P_1_a")).unwrap();
        let b = store.insert_submission(input("P_1_a")).unwrap();
        assert!(a > 0);
        assert!(b > a);
        assert_eq!(store.row_count().unwrap(), 2);
    }

    #[test]
    fn at_store_04_absent_json_is_stored_as_null() {
        let mut store = SubmissionStore::open_in_memory().unwrap();
        let id = store.insert_submission(input("P_1_a")).unwrap();
        let raw: Option<String> = store
            .connection()
            .query_row(
                "SELECT freeplay_data FROM experiment_data WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(raw, None);
    }

    #[test]
    fn at_store_05_blank_condition_is_rejected() {
        let mut store = SubmissionStore::open_in_memory().unwrap();
        let mut bad = input("P_1_a");
        bad.condition = "  ".to_string();
        assert!(matches!(
            store.insert_submission(bad),
            Err(StorageError::ContractViolation(_))
        ));
    }
}
