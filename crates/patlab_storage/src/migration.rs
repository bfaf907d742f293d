#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use patlab_kernel_contracts::condition::UNKNOWN_CONDITION;
use patlab_kernel_contracts::phase::DEBRIEF_ATTACH_KEY;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{info, warn};

use crate::submissions::{
    count_rows, extended_index_ddl, extended_table_ddl, sql_value_to_text, table_exists,
    table_index_names, StorageError, EXPERIMENT_TABLE,
};

pub const SHADOW_TABLE: &str = "experiment_data_new";
pub const BACKUP_TABLE_PREFIX: &str = "experiment_data_backup_";

const PROLIFIC_JSON_KEY: &str = "prolificId";

/// One row of the live table, column name to loosely-typed text.
pub type SourceRow = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ShadowRow {
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Swapped { backup_table: String },
    /// Shadow table is kept for inspection; nothing was renamed.
    CountMismatch { source_rows: u64, shadow_rows: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub source_rows: u64,
    pub migrated_rows: u64,
    pub skipped_rows: u64,
    pub outcome: MigrationOutcome,
}

impl MigrationReport {
    pub fn swapped(&self) -> bool {
        matches!(self.outcome, MigrationOutcome::Swapped { .. })
    }
}

fn parse_json_text(raw: Option<&str>) -> Option<Value> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn first_non_empty<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

fn column<'a>(row: &'a SourceRow, name: &str) -> Option<&'a str> {
    row.get(name).and_then(|v| v.as_deref())
}

/// Maps one legacy row onto the extended shape. `None` means the row is skipped.
pub fn reshape_row(row: &SourceRow) -> Option<ShadowRow> {
    let participant_id = column(row, "participant_id")
        .map(str::trim)
        .filter(|v| !v.is_empty())?
        .to_string();
    let condition = column(row, "condition")
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(UNKNOWN_CONDITION)
        .to_string();

    let task = parse_json_text(column(row, "task_data"));
    let freeplay = parse_json_text(column(row, "freeplay_data"));

    let debrief = task
        .as_ref()
        .and_then(|t| t.get(DEBRIEF_ATTACH_KEY))
        .filter(|v| !v.is_null())
        .or_else(|| {
            freeplay
                .as_ref()
                .and_then(|f| f.get(DEBRIEF_ATTACH_KEY))
                .filter(|v| !v.is_null())
        })
        .filter(|v| v.is_object() || v.is_array())
        .cloned();

    let prolific_id = first_non_empty([
        column(row, "prolific_id"),
        task.as_ref()
            .and_then(|t| t.get(PROLIFIC_JSON_KEY))
            .and_then(Value::as_str),
        freeplay
            .as_ref()
            .and_then(|f| f.get(PROLIFIC_JSON_KEY))
            .and_then(Value::as_str),
        debrief
            .as_ref()
            .and_then(|d| d.get(PROLIFIC_JSON_KEY))
            .and_then(Value::as_str),
    ]);

    Some(ShadowRow {
        participant_id,
        prolific_id,
        condition,
        submission_time: column(row, "submission_time").map(str::to_string),
        task_data: task,
        freeplay_data: freeplay,
        debrief_data: debrief,
        user_agent: column(row, "user_agent").map(str::to_string),
        screen_resolution: column(row, "screen_resolution").map(str::to_string),
    })
}

fn read_source_rows(conn: &Connection) -> Result<Vec<SourceRow>, StorageError> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {EXPERIMENT_TABLE} ORDER BY id ASC"))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut source = SourceRow::new();
        for (idx, name) in names.iter().enumerate() {
            let value: SqlValue = row.get(idx)?;
            source.insert(name.clone(), sql_value_to_text(value));
        }
        out.push(source);
    }
    Ok(out)
}

/// Rebuilds the live table into the extended schema, stamping the backup with the
/// database clock.
pub fn migrate_experiment_table(conn: &mut Connection) -> Result<MigrationReport, StorageError> {
    let suffix: String =
        conn.query_row("SELECT strftime('%Y%m%d_%H%M%S', 'now')", [], |row| row.get(0))?;
    migrate_experiment_table_at(conn, &suffix)
}

pub fn migrate_experiment_table_at(
    conn: &mut Connection,
    backup_suffix: &str,
) -> Result<MigrationReport, StorageError> {
    if !table_exists(conn, EXPERIMENT_TABLE)? {
        return Err(StorageError::MissingTable {
            table: EXPERIMENT_TABLE.to_string(),
        });
    }
    if table_exists(conn, SHADOW_TABLE)? {
        return Err(StorageError::TableExists {
            table: SHADOW_TABLE.to_string(),
        });
    }
    let backup_table = format!("{BACKUP_TABLE_PREFIX}{backup_suffix}");
    if table_exists(conn, &backup_table)? {
        return Err(StorageError::TableExists {
            table: backup_table,
        });
    }

    let source = read_source_rows(conn)?;
    info!(rows = source.len(), "read experiment rows for migration");

    let mut migrated_rows = 0u64;
    let mut skipped_rows = 0u64;
    {
        let tx = conn.transaction()?;
        tx.execute_batch(&extended_table_ddl(SHADOW_TABLE))?;
        {
            let mut insert = tx.prepare(&format!(
                "INSERT INTO {SHADOW_TABLE} \
                 (participant_id, prolific_id, \"condition\", submission_time, task_data, \
                  freeplay_data, debrief_data, user_agent, screen_resolution) \
                 VALUES (?1, ?2, ?3, COALESCE(?4, CURRENT_TIMESTAMP), ?5, ?6, ?7, ?8, ?9)"
            ))?;
            for row in &source {
                let Some(shadow) = reshape_row(row) else {
                    skipped_rows += 1;
                    continue;
                };
                insert.execute(params![
                    shadow.participant_id,
                    shadow.prolific_id,
                    shadow.condition,
                    shadow.submission_time,
                    shadow.task_data.as_ref().map(Value::to_string),
                    shadow.freeplay_data.as_ref().map(Value::to_string),
                    shadow.debrief_data.as_ref().map(Value::to_string),
                    shadow.user_agent,
                    shadow.screen_resolution,
                ])?;
                migrated_rows += 1;
            }
        }
        tx.commit()?;
    }
    info!(migrated_rows, skipped_rows, "copied rows into {SHADOW_TABLE}");

    let source_rows = count_rows(conn, EXPERIMENT_TABLE)?;
    let shadow_rows = count_rows(conn, SHADOW_TABLE)?;
    if source_rows != shadow_rows {
        warn!(
            source_rows,
            shadow_rows, "row counts differ; leaving {SHADOW_TABLE} in place without swapping"
        );
        return Ok(MigrationReport {
            source_rows,
            migrated_rows,
            skipped_rows,
            outcome: MigrationOutcome::CountMismatch {
                source_rows,
                shadow_rows,
            },
        });
    }

    let tx = conn.transaction()?;
    tx.execute_batch(&format!(
        "ALTER TABLE {EXPERIMENT_TABLE} RENAME TO {backup_table};\n\
         ALTER TABLE {SHADOW_TABLE} RENAME TO {EXPERIMENT_TABLE};"
    ))?;
    // Renames keep index names. The backup gives up its indexes and the live table gets
    // a fresh set named after it, so a later rebuild can create the shadow's again.
    let mut stale = table_index_names(&tx, &backup_table)?;
    stale.extend(table_index_names(&tx, EXPERIMENT_TABLE)?);
    for name in &stale {
        tx.execute_batch(&format!("DROP INDEX \"{name}\";"))?;
    }
    tx.execute_batch(&extended_index_ddl(EXPERIMENT_TABLE))?;
    tx.commit()?;
    info!(backup_table = %backup_table, "swapped experiment tables");

    Ok(MigrationReport {
        source_rows,
        migrated_rows,
        skipped_rows,
        outcome: MigrationOutcome::Swapped { backup_table },
    })
}
