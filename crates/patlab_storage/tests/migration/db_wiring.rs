#![forbid(unsafe_code)]

use patlab_storage::migration::{
    migrate_experiment_table_at, MigrationOutcome, BACKUP_TABLE_PREFIX, SHADOW_TABLE,
};
use patlab_storage::repo::{ExperimentMigrationRepo, SubmissionRepo};
use patlab_storage::submissions::{
    count_rows, legacy_table_ddl, table_columns, table_exists, table_index_names, SchemaProfile,
    StorageError, SubmissionStore, EXPERIMENT_TABLE,
};
use rusqlite::{params, Connection};
use serde_json::json;

fn legacy_db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(&legacy_table_ddl(EXPERIMENT_TABLE))
        .unwrap();
    conn
}

fn insert_legacy(
    conn: &Connection,
    participant: Option<&str>,
    condition: Option<&str>,
    task: Option<&str>,
    freeplay: Option<&str>,
) {
    conn.execute(
        "INSERT INTO experiment_data (participant_id, \"condition\", submission_time, task_data, freeplay_data, user_agent, screen_resolution) \
         VALUES (?1, ?2, '2025-03-01 10:00:00', ?3, ?4, 'ua', '800x600')",
        params![participant, condition, task, freeplay],
    )
    .unwrap();
}

#[test]
fn at_migration_db_01_rebuild_swaps_and_backs_up() {
    let mut conn = legacy_db();
    insert_legacy(
        &conn,
        Some("P_1_a"),
        Some("puzzleFirst"),
        Some(r#"{"trials":[1],"prolificId":"PRO_TASK","debrief":{"q1":"fun"}}"#),
        None,
    );
    insert_legacy(
        &conn,
        Some("P_2_b"),
        Some(""),
        None,
        Some(r#"{"events":[],"debrief":{"q1":"ok","prolificId":"PRO_DEB"}}"#),
    );

    let report = migrate_experiment_table_at(&mut conn, "20250301_120000").unwrap();
    let backup = format!("{BACKUP_TABLE_PREFIX}20250301_120000");
    assert_eq!(
        report.outcome,
        MigrationOutcome::Swapped {
            backup_table: backup.clone()
        }
    );
    assert_eq!(report.source_rows, 2);
    assert_eq!(report.migrated_rows, 2);
    assert_eq!(report.skipped_rows, 0);

    assert!(table_exists(&conn, &backup).unwrap());
    assert!(!table_exists(&conn, SHADOW_TABLE).unwrap());
    assert_eq!(count_rows(&conn, &backup).unwrap(), 2);
    let columns = table_columns(&conn, EXPERIMENT_TABLE).unwrap();
    assert!(columns.iter().any(|c| c == "prolific_id"));
    assert!(columns.iter().any(|c| c == "debrief_data"));

    let store = SubmissionStore::from_connection(conn).unwrap();
    assert_eq!(store.schema(), SchemaProfile::EXTENDED);
    let rows = store.submission_rows().unwrap();
    assert_eq!(rows.len(), 2);

    assert_eq!(rows[0].prolific_id.as_deref(), Some("PRO_TASK"));
    assert_eq!(rows[0].debrief_data, Some(json!({"q1": "fun"})));
    assert_eq!(rows[0].submission_time.as_deref(), Some("2025-03-01 10:00:00"));
    assert_eq!(rows[0].user_agent.as_deref(), Some("ua"));

    assert_eq!(rows[1].condition, "unknown");
    assert_eq!(rows[1].prolific_id.as_deref(), Some("PRO_DEB"));
    assert_eq!(
        rows[1].debrief_data,
        Some(json!({"q1": "ok", "prolificId": "PRO_DEB"}))
    );
}

#[test]
fn at_migration_db_02_count_mismatch_leaves_tables_in_place() {
    let mut conn = legacy_db();
    insert_legacy(&conn, Some("P_1_a"), Some("puzzleFirst"), None, None);
    insert_legacy(&conn, Some("   "), Some("puzzleFirst"), None, None);

    let report = migrate_experiment_table_at(&mut conn, "20250301_120000").unwrap();
    assert_eq!(
        report.outcome,
        MigrationOutcome::CountMismatch {
            source_rows: 2,
            shadow_rows: 1
        }
    );
    assert_eq!(report.skipped_rows, 1);
    assert!(!report.swapped());

    assert!(table_exists(&conn, SHADOW_TABLE).unwrap());
    assert!(!table_exists(&conn, &format!("{BACKUP_TABLE_PREFIX}20250301_120000")).unwrap());
    let columns = table_columns(&conn, EXPERIMENT_TABLE).unwrap();
    assert!(!columns.iter().any(|c| c == "prolific_id"));
    assert_eq!(count_rows(&conn, EXPERIMENT_TABLE).unwrap(), 2);
}

#[test]
fn at_migration_db_03_existing_shadow_table_is_refused() {
    let mut conn = legacy_db();
    insert_legacy(&conn, Some("P_1_a"), Some("puzzleFirst"), None, None);
    conn.execute_batch("CREATE TABLE experiment_data_new (id INTEGER)")
        .unwrap();

    let err = migrate_experiment_table_at(&mut conn, "20250301_120000").unwrap_err();
    assert_eq!(
        err,
        StorageError::TableExists {
            table: SHADOW_TABLE.to_string()
        }
    );
    assert_eq!(count_rows(&conn, EXPERIMENT_TABLE).unwrap(), 1);
}

#[test]
fn at_migration_db_04_missing_source_table_is_refused() {
    let mut conn = Connection::open_in_memory().unwrap();
    let err = migrate_experiment_table_at(&mut conn, "20250301_120000").unwrap_err();
    assert_eq!(
        err,
        StorageError::MissingTable {
            table: EXPERIMENT_TABLE.to_string()
        }
    );
}

#[test]
fn at_migration_db_05_store_migration_refreshes_schema() {
    let conn = legacy_db();
    insert_legacy(
        &conn,
        Some("P_1_a"),
        Some("freeplayFirst"),
        Some(r#"{"prolificId":"  PRO_X  "}"#),
        None,
    );
    let mut store = SubmissionStore::from_connection(conn).unwrap();
    assert_eq!(store.schema(), SchemaProfile::LEGACY);

    let report = store.migrate_experiment_rows().unwrap();
    assert!(report.swapped());
    assert_eq!(store.schema(), SchemaProfile::EXTENDED);
    assert_eq!(store.submission_row_count().unwrap(), 1);
    let rows = store.submission_rows().unwrap();
    assert_eq!(rows[0].prolific_id.as_deref(), Some("PRO_X"));
}

#[test]
fn at_migration_db_06_indexes_follow_the_live_table_so_rebuilds_repeat() {
    let mut conn = legacy_db();
    insert_legacy(&conn, Some("P_1_a"), Some("puzzleFirst"), None, None);

    let first = migrate_experiment_table_at(&mut conn, "20250301_120000").unwrap();
    assert!(first.swapped());
    let expected = vec![
        "idx_experiment_data_condition".to_string(),
        "idx_experiment_data_participant".to_string(),
        "idx_experiment_data_prolific".to_string(),
        "idx_experiment_data_time".to_string(),
    ];
    assert_eq!(table_index_names(&conn, EXPERIMENT_TABLE).unwrap(), expected);
    let first_backup = format!("{BACKUP_TABLE_PREFIX}20250301_120000");
    assert!(table_index_names(&conn, &first_backup).unwrap().is_empty());

    let second = migrate_experiment_table_at(&mut conn, "20250302_120000").unwrap();
    assert!(second.swapped());
    assert_eq!(table_index_names(&conn, EXPERIMENT_TABLE).unwrap(), expected);
    assert_eq!(count_rows(&conn, EXPERIMENT_TABLE).unwrap(), 1);
}
