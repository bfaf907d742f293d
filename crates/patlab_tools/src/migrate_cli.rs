#![forbid(unsafe_code)]

use std::path::Path;

use patlab_storage::migration::{migrate_experiment_table, MigrationOutcome, MigrationReport};
use patlab_storage::submissions::{
    detect_schema, ensure_experiment_table, legacy_table_ddl, table_exists, SubmissionStore,
    EXPERIMENT_TABLE,
};
use rusqlite::Connection;

/// Exit code the operator sees when the rebuild refused to swap tables.
pub const EXIT_COUNT_MISMATCH: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    pub exit_code: i32,
}

impl CommandOutput {
    fn ok(text: String) -> Self {
        Self { text, exit_code: 0 }
    }
}

pub fn open_connection(path: &Path) -> Result<Connection, String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create '{}': {e}", parent.display()))?;
        }
    }
    Connection::open(path).map_err(|e| format!("failed to open '{}': {e}", path.display()))
}

fn schema_label(conn: &Connection) -> Result<&'static str, String> {
    let profile = detect_schema(conn, EXPERIMENT_TABLE)
        .map_err(|e| format!("failed to inspect table: {e}"))?;
    Ok(match profile {
        Some(p) if p.is_extended() => "extended",
        Some(_) => "legacy",
        None => "missing",
    })
}

/// Creates the experiment table unless it exists. `legacy` creates the first-deployment layout.
pub fn execute_setup_command(conn: &Connection, legacy: bool) -> Result<CommandOutput, String> {
    let exists = table_exists(conn, EXPERIMENT_TABLE)
        .map_err(|e| format!("failed to inspect database: {e}"))?;
    if exists {
        return Ok(CommandOutput::ok(format!(
            "{EXPERIMENT_TABLE} already exists (schema: {})",
            schema_label(conn)?
        )));
    }
    if legacy {
        conn.execute_batch(&legacy_table_ddl(EXPERIMENT_TABLE))
            .map_err(|e| format!("failed to create table: {e}"))?;
    } else {
        ensure_experiment_table(conn).map_err(|e| format!("failed to create table: {e}"))?;
    }
    Ok(CommandOutput::ok(format!(
        "created {EXPERIMENT_TABLE} (schema: {})",
        schema_label(conn)?
    )))
}

pub fn render_migration_report(report: &MigrationReport) -> CommandOutput {
    let mut lines = vec![
        format!("rows read: {}", report.source_rows),
        format!("rows migrated: {}", report.migrated_rows),
        format!("rows skipped (blank participant id): {}", report.skipped_rows),
    ];
    match &report.outcome {
        MigrationOutcome::Swapped { backup_table } => {
            lines.push(format!("swap complete; previous table kept as {backup_table}"));
            lines.push(format!("delete {backup_table} only after verifying the new table"));
            CommandOutput {
                text: lines.join("\n"),
                exit_code: 0,
            }
        }
        MigrationOutcome::CountMismatch {
            source_rows,
            shadow_rows,
        } => {
            lines.push(format!(
                "row counts differ: old={source_rows} new={shadow_rows}; tables were NOT swapped"
            ));
            lines.push(
                "inspect experiment_data_new, drop it, fix the source rows and rerun".to_string(),
            );
            CommandOutput {
                text: lines.join("\n"),
                exit_code: EXIT_COUNT_MISMATCH,
            }
        }
    }
}

pub fn execute_migrate_command(conn: &mut Connection) -> Result<CommandOutput, String> {
    let report = migrate_experiment_table(conn).map_err(|e| format!("migration failed: {e}"))?;
    Ok(render_migration_report(&report))
}

/// One JSON object per row, oldest first.
pub fn execute_export_command(conn: Connection) -> Result<CommandOutput, String> {
    let exists = table_exists(&conn, EXPERIMENT_TABLE)
        .map_err(|e| format!("failed to inspect database: {e}"))?;
    if !exists {
        return Err(format!(
            "table '{EXPERIMENT_TABLE}' does not exist; run `patlab setup` first"
        ));
    }
    let store =
        SubmissionStore::from_connection(conn).map_err(|e| format!("failed to open store: {e}"))?;
    let rows = store
        .submission_rows()
        .map_err(|e| format!("failed to read rows: {e}"))?;
    let mut lines = Vec::with_capacity(rows.len());
    for row in &rows {
        let line = serde_json::to_string(row).map_err(|e| format!("failed to encode row: {e}"))?;
        lines.push(line);
    }
    Ok(CommandOutput::ok(lines.join("\n")))
}
