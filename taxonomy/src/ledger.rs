//! Classification ledger
//!
//! SQLite-backed audit trail of classification runs.
//!
//! ## Tables
//!
//! - `classification_runs`: one row per run (fingerprint, status, stats)
//! - `classification_changes`: every attributed field write
//! - `classification_errors`: per-record predicate failures
//!
//! ## Usage
//!
//! ```rust,ignore
//! let store = SqliteStore::open(&config)?;
//! let ledger = store.ledger();
//!
//! let run_pk = ledger.start_run("CLS-20261019-1a2b3c4d", taxonomy.fingerprint(), false)?;
//! ledger.log_changes(run_pk, &classification.changes)?;
//! ledger.complete_run(run_pk, &stats_json)?;
//! ```

use crate::engine::FieldChange;
use crate::errors::{RecordError, Result, TaxonomyError};
use crate::record::{Field, ProductId};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

/// Status of a classification run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A recorded run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub run_id: String,
    pub fingerprint: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stats_json: Option<String>,
    pub status: RunStatus,
}

/// A recorded field write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: i64,
    pub run_pk: i64,
    pub product_id: ProductId,
    pub pass: String,
    pub field: Field,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub rule_id: String,
    pub created_at: DateTime<Utc>,
}

/// Ledger operations over a borrowed connection
pub struct ClassificationLedger<'a> {
    conn: &'a Connection,
}

const RUN_COLUMNS: &str =
    "id, run_id, fingerprint, dry_run, started_at, finished_at, stats_json, status";

const CHANGE_COLUMNS: &str =
    "id, run_pk, product_id, pass, field, old_value, new_value, rule_id, created_at";

impl<'a> ClassificationLedger<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Run operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a run and return its database ID
    pub fn start_run(&self, run_id: &str, fingerprint: &str, dry_run: bool) -> Result<i64> {
        let now = now_rfc3339();

        self.conn
            .execute(
                r#"
                INSERT INTO classification_runs (run_id, fingerprint, dry_run, started_at, status)
                VALUES (?1, ?2, ?3, ?4, 'running')
                "#,
                params![run_id, fingerprint, dry_run, now],
            )
            .map_err(|e| TaxonomyError::store_with_source("failed to start classification run", e))?;

        let run_pk = self.conn.last_insert_rowid();

        tracing::info!(run_id, run_pk, dry_run, "Started classification run");

        Ok(run_pk)
    }

    /// Complete a run with summary statistics
    pub fn complete_run(&self, run_pk: i64, stats_json: &str) -> Result<()> {
        self.finish(run_pk, stats_json, RunStatus::Completed)?;
        tracing::info!(run_pk, "Completed classification run");
        Ok(())
    }

    /// Mark a run as failed
    pub fn fail_run(&self, run_pk: i64, error: &str) -> Result<()> {
        let error_json = serde_json::json!({ "error": error }).to_string();
        self.finish(run_pk, &error_json, RunStatus::Failed)?;
        tracing::warn!(run_pk, error, "Classification run failed");
        Ok(())
    }

    fn finish(&self, run_pk: i64, stats_json: &str, status: RunStatus) -> Result<()> {
        let now = now_rfc3339();
        let updated = self
            .conn
            .execute(
                r#"
                UPDATE classification_runs
                SET finished_at = ?2,
                    stats_json = ?3,
                    status = ?4
                WHERE id = ?1
                "#,
                params![run_pk, now, stats_json, status.as_str()],
            )
            .map_err(|e| TaxonomyError::store_with_source("failed to finish classification run", e))?;
        if updated == 0 {
            return Err(TaxonomyError::store(format!("no classification run with id {run_pk}")));
        }
        Ok(())
    }

    /// Get a run by its run_id
    pub fn get_run_by_run_id(&self, run_id: &str) -> Result<Option<RunRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM classification_runs WHERE run_id = ?1"),
                params![run_id],
                read_run,
            )
            .optional()
            .map_err(|e| TaxonomyError::store_with_source("failed to get run", e))
    }

    /// List recent runs, newest first
    pub fn list_recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM classification_runs ORDER BY started_at DESC, id DESC LIMIT ?1"
            ))
            .map_err(|e| TaxonomyError::store_with_source("failed to prepare query", e))?;

        let rows = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], read_run)
            .map_err(|e| TaxonomyError::store_with_source("failed to query runs", e))?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.map_err(|e| TaxonomyError::store_with_source("failed to read run", e))?);
        }
        Ok(runs)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Change and error operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Log field changes in one transaction
    pub fn log_changes(&self, run_pk: i64, changes: &[FieldChange]) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| TaxonomyError::store_with_source("failed to begin change log", e))?;
        ClassificationLedger::new(&tx).insert_changes(run_pk, changes)?;
        tx.commit()
            .map_err(|e| TaxonomyError::store_with_source("failed to commit change log", e))?;
        Ok(changes.len())
    }

    /// Log per-record errors in one transaction
    pub fn log_errors(&self, run_pk: i64, errors: &[RecordError]) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| TaxonomyError::store_with_source("failed to begin error log", e))?;
        ClassificationLedger::new(&tx).insert_errors(run_pk, errors)?;
        tx.commit()
            .map_err(|e| TaxonomyError::store_with_source("failed to commit error log", e))?;
        Ok(errors.len())
    }

    /// Insert change rows inside the caller's transaction
    pub(crate) fn insert_changes(&self, run_pk: i64, changes: &[FieldChange]) -> Result<()> {
        let now = now_rfc3339();
        let mut stmt = self
            .conn
            .prepare(
                r#"
                INSERT INTO classification_changes
                    (run_pk, product_id, pass, field, old_value, new_value, rule_id, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .map_err(|e| TaxonomyError::store_with_source("failed to prepare insert", e))?;
        for change in changes {
            stmt.execute(params![
                run_pk,
                change.product_id,
                change.pass,
                change.field.as_str(),
                change.old_value,
                change.new_value,
                change.rule_id,
                now,
            ])
            .map_err(|e| TaxonomyError::store_with_source("failed to log change", e))?;
        }
        Ok(())
    }

    /// Insert error rows inside the caller's transaction
    pub(crate) fn insert_errors(&self, run_pk: i64, errors: &[RecordError]) -> Result<()> {
        let now = now_rfc3339();
        let mut stmt = self
            .conn
            .prepare(
                r#"
                INSERT INTO classification_errors
                    (run_pk, product_id, pass, rule_id, message, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .map_err(|e| TaxonomyError::store_with_source("failed to prepare insert", e))?;
        for error in errors {
            stmt.execute(params![
                run_pk,
                error.product_id,
                error.pass,
                error.rule_id,
                error.message,
                now,
            ])
            .map_err(|e| TaxonomyError::store_with_source("failed to log record error", e))?;
        }
        Ok(())
    }

    /// Changes recorded by one run, in write order
    pub fn changes_for_run(&self, run_pk: i64) -> Result<Vec<ChangeRecord>> {
        self.query_changes(
            &format!("SELECT {CHANGE_COLUMNS} FROM classification_changes WHERE run_pk = ?1 ORDER BY id"),
            run_pk,
        )
    }

    /// Label history of one product across all runs
    pub fn changes_for_product(&self, product_id: ProductId) -> Result<Vec<ChangeRecord>> {
        self.query_changes(
            &format!(
                "SELECT {CHANGE_COLUMNS} FROM classification_changes WHERE product_id = ?1 ORDER BY id"
            ),
            product_id,
        )
    }

    fn query_changes(&self, sql: &str, key: i64) -> Result<Vec<ChangeRecord>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| TaxonomyError::store_with_source("failed to prepare query", e))?;

        let rows = stmt
            .query_map(params![key], |row| {
                Ok(ChangeRecord {
                    id: row.get(0)?,
                    run_pk: row.get(1)?,
                    product_id: row.get(2)?,
                    pass: row.get(3)?,
                    field: parse_column(row, 4, Field::parse, "field")?,
                    old_value: row.get(5)?,
                    new_value: row.get(6)?,
                    rule_id: row.get(7)?,
                    created_at: parse_datetime(row.get::<_, String>(8)?),
                })
            })
            .map_err(|e| TaxonomyError::store_with_source("failed to query changes", e))?;

        let mut changes = Vec::new();
        for row in rows {
            changes.push(
                row.map_err(|e| TaxonomyError::store_with_source("failed to read change", e))?,
            );
        }
        Ok(changes)
    }

    /// Errors recorded by one run
    pub fn errors_for_run(&self, run_pk: i64) -> Result<Vec<RecordError>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT product_id, pass, rule_id, message
                FROM classification_errors
                WHERE run_pk = ?1
                ORDER BY id
                "#,
            )
            .map_err(|e| TaxonomyError::store_with_source("failed to prepare query", e))?;

        let rows = stmt
            .query_map(params![run_pk], |row| {
                Ok(RecordError {
                    product_id: row.get(0)?,
                    pass: row.get(1)?,
                    rule_id: row.get(2)?,
                    message: row.get(3)?,
                })
            })
            .map_err(|e| TaxonomyError::store_with_source("failed to query errors", e))?;

        let mut errors = Vec::new();
        for row in rows {
            errors.push(
                row.map_err(|e| TaxonomyError::store_with_source("failed to read error", e))?,
            );
        }
        Ok(errors)
    }
}

fn read_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        fingerprint: row.get(2)?,
        dry_run: row.get(3)?,
        started_at: parse_datetime(row.get::<_, String>(4)?),
        finished_at: row.get::<_, Option<String>>(5)?.map(parse_datetime),
        stats_json: row.get(6)?,
        status: parse_column(row, 7, RunStatus::parse, "status")?,
    })
}

/// Decode an enum column; unknown values surface as a conversion error
/// instead of being guessed.
fn parse_column<T>(
    row: &Row<'_>,
    index: usize,
    parse: impl Fn(&str) -> Option<T>,
    column: &str,
) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            Type::Text,
            Box::new(TaxonomyError::store(format!("unknown {column} `{raw}` in ledger row"))),
        )
    })
}

/// Fixed-width timestamps so `ORDER BY started_at` sorts chronologically
fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
