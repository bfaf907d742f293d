#![forbid(unsafe_code)]

use std::path::PathBuf;

use patlab_kernel_contracts::participant::ParticipantId;
use patlab_kernel_contracts::submission::SubmissionPayload;
use patlab_storage::migration::migrate_experiment_table_at;
use patlab_storage::repo::SubmissionRepo;
use patlab_storage::submissions::{
    legacy_table_ddl, SchemaProfile, SubmissionRowInput, SubmissionStore, EXPERIMENT_TABLE,
};
use rusqlite::Connection;
use serde_json::json;

fn payload(participant: &str) -> SubmissionPayload {
    SubmissionPayload::from_wire(&json!({
        "participantId": participant,
        "condition": "puzzleFirst",
        "taskData": {"trials": [{"score": 3}], "debrief": {"q1": "yes"}},
        "freeplayData": null,
        "prolificId": " PRO_77 ",
        "debriefData": {"q1": "yes"},
        "screenResolution": "1440x900",
        "submissionTime": "2026-01-01T00:00:00.000Z"
    }))
    .unwrap()
}

#[test]
fn at_submissions_db_01_extended_insert_round_trips_json_columns() {
    let mut store = SubmissionStore::open_in_memory().unwrap();
    let id = store
        .insert_submission_row(SubmissionRowInput::from_payload(
            payload("P_1700000000000_abcdefghi"),
            Some("header-agent".to_string()),
        ))
        .unwrap();

    let rows = store.submission_rows().unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.id, id);
    assert_eq!(row.participant_id, "P_1700000000000_abcdefghi");
    assert_eq!(row.prolific_id.as_deref(), Some("PRO_77"));
    assert_eq!(row.condition, "puzzleFirst");
    assert_eq!(
        row.task_data,
        Some(json!({"trials": [{"score": 3}], "debrief": {"q1": "yes"}}))
    );
    assert_eq!(row.freeplay_data, None);
    assert_eq!(row.debrief_data, Some(json!({"q1": "yes"})));
    assert_eq!(row.user_agent.as_deref(), Some("header-agent"));
    assert_eq!(row.screen_resolution.as_deref(), Some("1440x900"));
    assert!(row.submission_time.is_some());
}

#[test]
fn at_submissions_db_02_body_user_agent_wins_over_header() {
    let mut p = payload("P_1_a");
    p.user_agent = Some("body-agent".to_string());
    let input = SubmissionRowInput::from_payload(p, Some("header-agent".to_string()));
    assert_eq!(input.user_agent.as_deref(), Some("body-agent"));
}

#[test]
fn at_submissions_db_03_legacy_table_accepts_submissions() {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(&legacy_table_ddl(EXPERIMENT_TABLE))
        .unwrap();
    let mut store = SubmissionStore::from_connection(conn).unwrap();
    assert_eq!(store.schema(), SchemaProfile::LEGACY);

    store
        .insert_submission_row(SubmissionRowInput::from_payload(payload("P_1_a"), None))
        .unwrap();
    store
        .insert_submission_row(SubmissionRowInput::from_payload(payload("P_2_b"), None))
        .unwrap();
    assert_eq!(store.submission_row_count().unwrap(), 2);

    let rows = store.submission_rows().unwrap();
    assert!(rows.iter().all(|r| r.prolific_id.is_none()));
    assert!(rows.iter().all(|r| r.debrief_data.is_none()));
}

#[test]
fn at_submissions_db_04_file_store_persists_across_reopen() {
    let dir = std::env::temp_dir().join(format!(
        "patlab_storage_test_{}_{}",
        std::process::id(),
        ParticipantId::new("P_reopen").unwrap().as_str()
    ));
    let path = dir.join("nested").join("experiment.db");
    let _ = std::fs::remove_dir_all(&dir);

    {
        let mut store = SubmissionStore::open(&path).unwrap();
        store
            .insert_submission_row(SubmissionRowInput::from_payload(payload("P_1_a"), None))
            .unwrap();
    }
    let store = SubmissionStore::open(&path).unwrap();
    assert!(store.schema().is_extended());
    assert_eq!(store.submission_row_count().unwrap(), 1);

    let _ = std::fs::remove_dir_all(&dir);
}

fn scratch_db(tag: &str) -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join(format!(
        "patlab_storage_test_{}_{tag}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("experiment.db");
    (dir, path)
}

#[test]
fn at_submissions_db_05_insert_follows_migration_from_another_connection() {
    let (dir, path) = scratch_db("live_migrate");
    Connection::open(&path)
        .unwrap()
        .execute_batch(&legacy_table_ddl(EXPERIMENT_TABLE))
        .unwrap();

    let mut store = SubmissionStore::open(&path).unwrap();
    assert_eq!(store.schema(), SchemaProfile::LEGACY);
    store
        .insert_submission_row(SubmissionRowInput::from_payload(payload("P_1_a"), None))
        .unwrap();

    let mut operator = Connection::open(&path).unwrap();
    let report = migrate_experiment_table_at(&mut operator, "20260101_000000").unwrap();
    assert!(report.swapped());
    drop(operator);

    let id = store
        .insert_submission_row(SubmissionRowInput::from_payload(payload("P_2_b"), None))
        .unwrap();
    assert_eq!(store.schema(), SchemaProfile::EXTENDED);
    let row = store.submission_row(id).unwrap().unwrap();
    assert_eq!(row.participant_id, "P_2_b");
    assert_eq!(row.prolific_id.as_deref(), Some("PRO_77"));
    assert_eq!(row.debrief_data, Some(json!({"q1": "yes"})));
    assert_eq!(store.submission_row_count().unwrap(), 2);

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn at_submissions_db_06_insert_follows_table_replaced_with_legacy_layout() {
    let (dir, path) = scratch_db("live_downgrade");
    let mut store = SubmissionStore::open(&path).unwrap();
    assert_eq!(store.schema(), SchemaProfile::EXTENDED);

    let operator = Connection::open(&path).unwrap();
    operator
        .execute_batch(&format!("DROP TABLE {EXPERIMENT_TABLE};"))
        .unwrap();
    operator
        .execute_batch(&legacy_table_ddl(EXPERIMENT_TABLE))
        .unwrap();
    drop(operator);

    let id = store
        .insert_submission_row(SubmissionRowInput::from_payload(payload("P_1_a"), None))
        .unwrap();
    assert_eq!(store.schema(), SchemaProfile::LEGACY);
    let row = store.submission_row(id).unwrap().unwrap();
    assert_eq!(row.prolific_id, None);
    assert_eq!(row.debrief_data, None);

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}
