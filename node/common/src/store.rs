//! Document store for candidates, run results and verification results.
//!
//! Three logical collections: `generations` (written once by the external
//! generator), `run_results` (one record per generation and backend) and
//! `verification_results`. The `is_handled`, `logged_to_file`, `enqueued`
//! and `crash_logged` flags are one-way latches: every transition is a
//! conditional single-row `UPDATE ... WHERE flag = 0`, so when several
//! processes race for the same latch exactly one of them observes
//! `rows_affected() == 1`.

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::StoreError;
use crate::types::{CompilerCrash, GenerationRecord, MonitorSnapshot, RunResult, VerificationResult};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new candidate. Fails with `StoreError::Duplicate` if the id exists.
    async fn insert_generation(&self, record: &GenerationRecord) -> Result<(), StoreError>;

    async fn load_generation(&self, id: &str) -> Result<Option<GenerationRecord>, StoreError>;

    /// Ids of candidates not yet published to the job queues, oldest first
    async fn unqueued_generations(&self, limit: u32) -> Result<Vec<String>, StoreError>;

    /// Latch the enqueued flag. Returns `true` only for the caller that flipped it.
    async fn mark_enqueued(&self, id: &str) -> Result<bool, StoreError>;

    /// Insert or replace the result keyed by `(generation_id, backend)`.
    ///
    /// A result that was already handled by the verifier is left untouched,
    /// so a redelivered job can never reopen a verified generation.
    async fn upsert_run_result(&self, result: &RunResult) -> Result<(), StoreError>;

    async fn load_run_results(&self, generation_id: &str) -> Result<Vec<RunResult>, StoreError>;

    /// Generations with unhandled results from every one of `backends`
    async fn pending_generations(
        &self,
        backends: &[String],
        limit: u32,
    ) -> Result<Vec<String>, StoreError>;

    /// Flip `is_handled` for the generation and store its verification result
    /// in one transaction. Returns `false`, writing nothing, if the generation
    /// was already handled.
    async fn record_verification(&self, result: &VerificationResult) -> Result<bool, StoreError>;

    async fn load_verification(
        &self,
        generation_id: &str,
    ) -> Result<Option<VerificationResult>, StoreError>;

    async fn counters(&self, backends: &[String]) -> Result<MonitorSnapshot, StoreError>;

    /// Compile errors containing any of `markers` that were not yet written to an evidence file
    async fn unlogged_compiler_crashes(
        &self,
        markers: &[String],
    ) -> Result<Vec<CompilerCrash>, StoreError>;

    async fn mark_crash_logged(&self, generation_id: &str) -> Result<bool, StoreError>;

    /// Verification results with at least one discrepancy and `logged_to_file = false`
    async fn unlogged_discrepancies(&self) -> Result<Vec<VerificationResult>, StoreError>;

    async fn mark_discrepancy_logged(&self, generation_id: &str) -> Result<bool, StoreError>;

    /// Ids of every generation that has a verification result
    async fn verified_generations(&self) -> Result<Vec<String>, StoreError>;
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS generations (
        id TEXT PRIMARY KEY,
        body TEXT NOT NULL,
        compile_error TEXT,
        enqueued INTEGER NOT NULL DEFAULT 0,
        crash_logged INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS run_results (
        generation_id TEXT NOT NULL,
        backend TEXT NOT NULL,
        body TEXT NOT NULL,
        is_handled INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (generation_id, backend)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS run_results_unhandled ON run_results (is_handled, generation_id)",
    r#"
    CREATE TABLE IF NOT EXISTS verification_results (
        generation_id TEXT PRIMARY KEY,
        body TEXT NOT NULL,
        has_discrepancy INTEGER NOT NULL,
        logged_to_file INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    "#,
];

/// SQLite-based store implementation.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the collections if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Fresh private database, for tests and local experiments
    pub async fn in_memory() -> Result<Self, StoreError> {
        let store = Self::new(crate::context::memory_pool().await?);
        store.migrate().await?;
        Ok(store)
    }
}

fn decode<T: DeserializeOwned>(id: &str, body: &str) -> Result<T, StoreError> {
    serde_json::from_str(body).map_err(|source| StoreError::Malformed {
        id: id.to_string(),
        source,
    })
}

fn run_result_from_row(row: &SqliteRow) -> Result<RunResult, StoreError> {
    let generation_id: String = row.try_get("generation_id")?;
    let body: String = row.try_get("body")?;
    let mut result: RunResult = decode(&generation_id, &body)?;
    result.is_handled = row.try_get::<bool, _>("is_handled")?;
    Ok(result)
}

fn verification_from_row(row: &SqliteRow) -> Result<VerificationResult, StoreError> {
    let generation_id: String = row.try_get("generation_id")?;
    let body: String = row.try_get("body")?;
    let mut result: VerificationResult = decode(&generation_id, &body)?;
    result.logged_to_file = row.try_get::<bool, _>("logged_to_file")?;
    Ok(result)
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert_generation(&self, record: &GenerationRecord) -> Result<(), StoreError> {
        let body = serde_json::to_string(record)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO generations (id, body, compile_error, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(body)
        .bind(&record.compile_error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::Duplicate(record.id.clone()));
        }
        Ok(())
    }

    async fn load_generation(&self, id: &str) -> Result<Option<GenerationRecord>, StoreError> {
        let body: Option<String> = sqlx::query_scalar("SELECT body FROM generations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        body.map(|body| decode(id, &body)).transpose()
    }

    async fn unqueued_generations(&self, limit: u32) -> Result<Vec<String>, StoreError> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM generations WHERE enqueued = 0 ORDER BY created_at, id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn mark_enqueued(&self, id: &str) -> Result<bool, StoreError> {
        let flipped = sqlx::query("UPDATE generations SET enqueued = 1 WHERE id = ? AND enqueued = 0")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(flipped == 1)
    }

    async fn upsert_run_result(&self, result: &RunResult) -> Result<(), StoreError> {
        let body = serde_json::to_string(result)?;

        sqlx::query(
            r#"
            INSERT INTO run_results (generation_id, backend, body, is_handled, updated_at)
            VALUES (?, ?, ?, 0, ?)
            ON CONFLICT(generation_id, backend) DO UPDATE
            SET body = excluded.body, updated_at = excluded.updated_at
            WHERE run_results.is_handled = 0
            "#,
        )
        .bind(&result.generation_id)
        .bind(&result.backend)
        .bind(body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_run_results(&self, generation_id: &str) -> Result<Vec<RunResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT generation_id, backend, body, is_handled
            FROM run_results
            WHERE generation_id = ?
            ORDER BY backend
            "#,
        )
        .bind(generation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(run_result_from_row).collect()
    }

    async fn pending_generations(
        &self,
        backends: &[String],
        limit: u32,
    ) -> Result<Vec<String>, StoreError> {
        if backends.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT generation_id
            FROM run_results
            WHERE is_handled = 0 AND backend IN ({})
            GROUP BY generation_id
            HAVING COUNT(DISTINCT backend) = ?
            ORDER BY MAX(updated_at), generation_id
            LIMIT ?
            "#,
            placeholders(backends.len())
        );

        let mut query = sqlx::query_scalar(&sql);
        for backend in backends {
            query = query.bind(backend);
        }
        let ids = query
            .bind(backends.len() as i64)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }

    async fn record_verification(&self, result: &VerificationResult) -> Result<bool, StoreError> {
        let body = serde_json::to_string(result)?;
        let mut tx = self.pool.begin().await?;

        let flipped = sqlx::query(
            "UPDATE run_results SET is_handled = 1 WHERE generation_id = ? AND is_handled = 0",
        )
        .bind(&result.generation_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if flipped == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO verification_results (generation_id, body, has_discrepancy, logged_to_file, created_at)
            VALUES (?, ?, ?, 0, ?)
            ON CONFLICT(generation_id) DO NOTHING
            "#,
        )
        .bind(&result.generation_id)
        .bind(body)
        .bind(result.has_discrepancy())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn load_verification(
        &self,
        generation_id: &str,
    ) -> Result<Option<VerificationResult>, StoreError> {
        let row = sqlx::query(
            "SELECT generation_id, body, logged_to_file FROM verification_results WHERE generation_id = ?",
        )
        .bind(generation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(verification_from_row).transpose()
    }

    async fn counters(&self, backends: &[String]) -> Result<MonitorSnapshot, StoreError> {
        let (generated, compiler_errors): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(compile_error) FROM generations",
        )
        .fetch_one(&self.pool)
        .await?;

        let per_backend: Vec<(String, i64)> =
            sqlx::query_as("SELECT backend, COUNT(*) FROM run_results GROUP BY backend")
                .fetch_all(&self.pool)
                .await?;

        let verified: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM verification_results")
            .fetch_one(&self.pool)
            .await?;

        let mut runs: std::collections::BTreeMap<String, u64> =
            backends.iter().map(|backend| (backend.clone(), 0)).collect();
        for (backend, count) in per_backend {
            if let Some(slot) = runs.get_mut(&backend) {
                *slot = count as u64;
            }
        }

        Ok(MonitorSnapshot {
            generated: generated as u64,
            compiler_errors: compiler_errors as u64,
            runs,
            verified: verified as u64,
        })
    }

    async fn unlogged_compiler_crashes(
        &self,
        markers: &[String],
    ) -> Result<Vec<CompilerCrash>, StoreError> {
        if markers.is_empty() {
            return Ok(Vec::new());
        }

        let conditions = vec!["instr(compile_error, ?) > 0"; markers.len()].join(" OR ");
        let sql = format!(
            r#"
            SELECT id, compile_error
            FROM generations
            WHERE compile_error IS NOT NULL AND crash_logged = 0 AND ({conditions})
            ORDER BY created_at, id
            "#
        );

        let mut query = sqlx::query_as::<_, (String, String)>(&sql);
        for marker in markers {
            query = query.bind(marker);
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|(generation_id, message)| CompilerCrash { generation_id, message })
            .collect())
    }

    async fn mark_crash_logged(&self, generation_id: &str) -> Result<bool, StoreError> {
        let flipped =
            sqlx::query("UPDATE generations SET crash_logged = 1 WHERE id = ? AND crash_logged = 0")
                .bind(generation_id)
                .execute(&self.pool)
                .await?
                .rows_affected();

        Ok(flipped == 1)
    }

    async fn unlogged_discrepancies(&self) -> Result<Vec<VerificationResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT generation_id, body, logged_to_file
            FROM verification_results
            WHERE has_discrepancy = 1 AND logged_to_file = 0
            ORDER BY created_at, generation_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(verification_from_row).collect()
    }

    async fn mark_discrepancy_logged(&self, generation_id: &str) -> Result<bool, StoreError> {
        let flipped = sqlx::query(
            "UPDATE verification_results SET logged_to_file = 1 WHERE generation_id = ? AND logged_to_file = 0",
        )
        .bind(generation_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(flipped == 1)
    }

    async fn verified_generations(&self) -> Result<Vec<String>, StoreError> {
        let ids = sqlx::query_scalar(
            "SELECT generation_id FROM verification_results ORDER BY created_at, generation_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}
