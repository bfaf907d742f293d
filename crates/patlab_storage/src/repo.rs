#![forbid(unsafe_code)]

use rusqlite::Connection;

use crate::migration::{migrate_experiment_table, MigrationReport};
use crate::submissions::{
    StorageError, SubmissionRecord, SubmissionRowInput, SubmissionStore,
};

/// Typed repository interface for submission persistence wiring.
pub trait SubmissionRepo {
    fn insert_submission_row(&mut self, input: SubmissionRowInput) -> Result<i64, StorageError>;
    fn submission_rows(&self) -> Result<Vec<SubmissionRecord>, StorageError>;
    fn submission_row_count(&self) -> Result<u64, StorageError>;
}

/// Typed repository interface for the one-time table rebuild.
pub trait ExperimentMigrationRepo {
    fn migrate_experiment_rows(&mut self) -> Result<MigrationReport, StorageError>;
}

impl SubmissionRepo for SubmissionStore {
    fn insert_submission_row(&mut self, input: SubmissionRowInput) -> Result<i64, StorageError> {
        self.insert_submission(input)
    }

    fn submission_rows(&self) -> Result<Vec<SubmissionRecord>, StorageError> {
        SubmissionStore::submission_rows(self)
    }

    fn submission_row_count(&self) -> Result<u64, StorageError> {
        self.row_count()
    }
}

impl ExperimentMigrationRepo for Connection {
    fn migrate_experiment_rows(&mut self) -> Result<MigrationReport, StorageError> {
        migrate_experiment_table(self)
    }
}

impl ExperimentMigrationRepo for SubmissionStore {
    /// Runs the rebuild on the store's own connection and re-detects the schema after.
    fn migrate_experiment_rows(&mut self) -> Result<MigrationReport, StorageError> {
        let report = migrate_experiment_table(self.connection_mut())?;
        self.refresh_schema()?;
        Ok(report)
    }
}
