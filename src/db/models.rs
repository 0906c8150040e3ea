// src/db/models.rs

//! Data models for the install history ledger
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading and updating records.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;

/// Install run status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Applied,
    Failed,
    RolledBack,
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Applied => "applied",
            RunStatus::Failed => "failed",
            RunStatus::RolledBack => "rolled_back",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "applied" => Ok(RunStatus::Applied),
            "failed" => Ok(RunStatus::Failed),
            "rolled_back" => Ok(RunStatus::RolledBack),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// One invocation of `statpkg install` against a library
#[derive(Debug, Clone)]
pub struct InstallRun {
    pub id: Option<i64>,
    pub description: String,
    pub library: String,
    pub status: RunStatus,
    pub created_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
}

impl InstallRun {
    /// Create a new pending run
    pub fn new(description: String, library: String) -> Self {
        Self {
            id: None,
            description,
            library,
            status: RunStatus::Pending,
            created_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Insert this run into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO install_runs (description, library, status) VALUES (?1, ?2, ?3)",
            params![&self.description, &self.library, self.status.as_str()],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a run by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, library, status, created_at, finished_at, error
             FROM install_runs WHERE id = ?1",
        )?;

        let run = stmt.query_row([id], Self::from_row).optional()?;

        Ok(run)
    }

    /// List all runs, newest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, library, status, created_at, finished_at, error
             FROM install_runs ORDER BY id DESC",
        )?;

        let runs = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(runs)
    }

    /// Move the run to its final status
    pub fn update_status(
        &mut self,
        conn: &Connection,
        new_status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InitError("Cannot update run without ID".to_string()))?;

        if new_status == RunStatus::Pending {
            conn.execute(
                "UPDATE install_runs SET status = ?1 WHERE id = ?2",
                params![new_status.as_str(), id],
            )?;
        } else {
            conn.execute(
                "UPDATE install_runs SET status = ?1, error = ?2, finished_at = CURRENT_TIMESTAMP
                 WHERE id = ?3",
                params![new_status.as_str(), error, id],
            )?;
        }

        self.status = new_status;
        self.error = error.map(str::to_string);
        Ok(())
    }

    /// Convert a database row to an InstallRun
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_str: String = row.get(3)?;
        let status = status_str
            .parse::<RunStatus>()
            .map_err(|e| conversion_error(3, e))?;

        Ok(Self {
            id: Some(row.get(0)?),
            description: row.get(1)?,
            library: row.get(2)?,
            status,
            created_at: row.get(4)?,
            finished_at: row.get(5)?,
            error: row.get(6)?,
        })
    }
}

/// What became of a package within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageOutcome {
    Succeeded,
    Skipped,
    Failed,
    /// Not reached because the run stopped first
    NotAttempted,
    /// Installed, then undone by rollback
    RolledBack,
}

impl PackageOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            PackageOutcome::Succeeded => "succeeded",
            PackageOutcome::Skipped => "skipped",
            PackageOutcome::Failed => "failed",
            PackageOutcome::NotAttempted => "not_attempted",
            PackageOutcome::RolledBack => "rolled_back",
        }
    }
}

impl FromStr for PackageOutcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(PackageOutcome::Succeeded),
            "skipped" => Ok(PackageOutcome::Skipped),
            "failed" => Ok(PackageOutcome::Failed),
            "not_attempted" => Ok(PackageOutcome::NotAttempted),
            "rolled_back" => Ok(PackageOutcome::RolledBack),
            _ => Err(format!("Invalid package outcome: {}", s)),
        }
    }
}

/// A package row belonging to an install run
#[derive(Debug, Clone)]
pub struct RunPackage {
    pub id: Option<i64>,
    pub run_id: i64,
    pub name: String,
    pub version: String,
    pub action: String,
    pub repository: String,
    pub variant: String,
    pub outcome: PackageOutcome,
}

impl RunPackage {
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO run_packages (run_id, name, version, action, repository, variant, outcome)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.run_id,
                &self.name,
                &self.version,
                &self.action,
                &self.repository,
                &self.variant,
                self.outcome.as_str(),
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// All packages of a run, by name
    pub fn find_by_run(conn: &Connection, run_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, run_id, name, version, action, repository, variant, outcome
             FROM run_packages WHERE run_id = ?1 ORDER BY name",
        )?;

        let packages = stmt
            .query_map([run_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let outcome_str: String = row.get(7)?;
        let outcome = outcome_str
            .parse::<PackageOutcome>()
            .map_err(|e| conversion_error(7, e))?;

        Ok(Self {
            id: Some(row.get(0)?),
            run_id: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            action: row.get(4)?,
            repository: row.get(5)?,
            variant: row.get(6)?,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    fn package(run_id: i64, name: &str, outcome: PackageOutcome) -> RunPackage {
        RunPackage {
            id: None,
            run_id,
            name: name.to_string(),
            version: "1.0.0".to_string(),
            action: "install".to_string(),
            repository: "CRAN".to_string(),
            variant: "source".to_string(),
            outcome,
        }
    }

    #[test]
    fn test_install_run_crud() {
        let (_temp, conn) = create_test_db();

        // Create a run
        let mut run = InstallRun::new("Install dplyr".to_string(), "/tmp/lib".to_string());
        let id = run.insert(&conn).unwrap();
        assert!(id > 0);
        assert_eq!(run.status, RunStatus::Pending);

        // Find by ID
        let found = InstallRun::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(found.description, "Install dplyr");
        assert_eq!(found.library, "/tmp/lib");
        assert!(found.finished_at.is_none());

        // Update status
        run.update_status(&conn, RunStatus::Applied, None).unwrap();
        let updated = InstallRun::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(updated.status, RunStatus::Applied);
        assert!(updated.finished_at.is_some());
        assert!(updated.error.is_none());

        // List all
        let all = InstallRun::list_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_failed_run_keeps_error() {
        let (_temp, conn) = create_test_db();

        let mut run = InstallRun::new("Install glue".to_string(), "/tmp/lib".to_string());
        let id = run.insert(&conn).unwrap();
        run.update_status(&conn, RunStatus::RolledBack, Some("glue (exit status 1)"))
            .unwrap();

        let found = InstallRun::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(found.status, RunStatus::RolledBack);
        assert_eq!(found.error.as_deref(), Some("glue (exit status 1)"));
    }

    #[test]
    fn test_list_all_newest_first() {
        let (_temp, conn) = create_test_db();

        for description in ["first", "second", "third"] {
            InstallRun::new(description.to_string(), "/lib".to_string())
                .insert(&conn)
                .unwrap();
        }

        let all = InstallRun::list_all(&conn).unwrap();
        let names: Vec<&str> = all.iter().map(|r| r.description.as_str()).collect();
        assert_eq!(names, vec!["third", "second", "first"]);
    }

    #[test]
    fn test_run_packages() {
        let (_temp, conn) = create_test_db();

        let mut run = InstallRun::new("Install".to_string(), "/lib".to_string());
        let run_id = run.insert(&conn).unwrap();

        package(run_id, "vctrs", PackageOutcome::Failed)
            .insert(&conn)
            .unwrap();
        package(run_id, "rlang", PackageOutcome::Succeeded)
            .insert(&conn)
            .unwrap();

        let rows = RunPackage::find_by_run(&conn, run_id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "rlang");
        assert_eq!(rows[0].outcome, PackageOutcome::Succeeded);
        assert_eq!(rows[1].outcome, PackageOutcome::Failed);

        // One row per package per run
        assert!(
            package(run_id, "rlang", PackageOutcome::Skipped)
                .insert(&conn)
                .is_err()
        );
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Applied,
            RunStatus::Failed,
            RunStatus::RolledBack,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("done".parse::<RunStatus>().is_err());
    }
}
