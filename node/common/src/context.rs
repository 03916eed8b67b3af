use anyhow::{Context as _, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::PipelineArgs;
use crate::error::is_transient_sqlx;
use crate::queue::{JobQueue, SqliteQueue};
use crate::reliability::{retry_with_backoff, RetryPolicy, Transient};
use crate::store::{DocumentStore, SqliteStore};

/// Process-wide clients, built once at start-up and handed to each component
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn DocumentStore>,
    pub queue: Arc<dyn JobQueue>,
    pub backends: Vec<String>,
    pub retry: RetryPolicy,
}

struct ConnectError(sqlx::Error);

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Transient for ConnectError {
    fn is_transient(&self) -> bool {
        is_transient_sqlx(&self.0)
    }
}

impl PipelineContext {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        queue: Arc<dyn JobQueue>,
        backends: Vec<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            backends,
            retry,
        }
    }

    /// Open the shared database, retrying on a fixed delay; exhaustion is fatal to the caller
    pub async fn connect(args: &PipelineArgs) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&args.database)
            .with_context(|| format!("invalid database url: {}", args.database))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let retry = args.retry_policy();
        let pool = retry_with_backoff("connect", &retry, || {
            let options = options.clone();
            async move {
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(options)
                    .await
                    .map_err(ConnectError)
            }
        })
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

        info!(database = %args.database, "connected to document store");

        let store = SqliteStore::new(pool.clone());
        store.migrate().await.context("failed to create collections")?;
        let queue = SqliteQueue::new(pool, args.lease());
        queue.migrate().await.context("failed to create job queue")?;

        Ok(Self::new(
            Arc::new(store),
            Arc::new(queue),
            args.backends.clone(),
            retry,
        ))
    }

    /// Store and queue over one private in-memory database
    pub async fn ephemeral(backends: &[&str], lease: Duration) -> Result<Self> {
        let (store, queue) = ephemeral_backing(lease).await?;

        Ok(Self::new(
            Arc::new(store),
            Arc::new(queue),
            backends.iter().map(|b| b.to_string()).collect(),
            RetryPolicy::fixed(3, Duration::from_millis(10)),
        ))
    }
}

/// Concrete store and queue sharing one in-memory database
pub async fn ephemeral_backing(lease: Duration) -> Result<(SqliteStore, SqliteQueue)> {
    let pool = memory_pool().await?;

    let store = SqliteStore::new(pool.clone());
    store.migrate().await?;
    let queue = SqliteQueue::new(pool, lease);
    queue.migrate().await?;

    Ok((store, queue))
}

/// Single-connection pool; every connection to `sqlite::memory:` is a separate database
pub(crate) async fn memory_pool() -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
}
