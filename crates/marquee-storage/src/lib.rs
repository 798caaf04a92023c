//! Postgres bootstrap, retry policy and store implementations for Marquee.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::migrate::MigrateDatabase;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool, Postgres};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub mod affinity;
pub mod catalog;

pub use affinity::{affinities_for, AffinityStore, PgAffinityStore};
pub use catalog::{CatalogStore, PgCatalogStore, StoreError};

pub const CRATE_NAME: &str = "marquee-storage";

/// Idempotent DDL for every table the importer owns.
pub const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Postgres SQLSTATEs seen while a fresh database container is still starting.
const RETRYABLE_SQLSTATES: &[&str] = &[
    "3D000", // invalid_catalog_name: database not created yet
    "57P03", // cannot_connect_now: server starting up
    "53300", // too_many_connections
    "08006", // connection_failure
    "08001", // unable to establish connection
];

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Protocol(_) => RetryDisposition::Retryable,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code();
            if code
                .as_deref()
                .is_some_and(|code| RETRYABLE_SQLSTATES.contains(&code))
            {
                RetryDisposition::Retryable
            } else {
                RetryDisposition::NonRetryable
            }
        }
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_attempt_error(err: &AttemptError) -> RetryDisposition {
    match err {
        AttemptError::Sqlx(inner) => classify_sqlx_error(inner),
        AttemptError::NotReady => RetryDisposition::Retryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(10, Duration::from_secs(3))
    }
}

impl BackoffPolicy {
    /// Same delay between every attempt.
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Last failure of a retry loop that ran out of attempts or hit a fatal error.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub attempts: usize,
    pub disposition: RetryDisposition,
    pub error: E,
}

/// Run `op` until it succeeds, returns a non-retryable error, or the policy is exhausted.
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &BackoffPolicy,
    classify: impl Fn(&E) -> RetryDisposition,
    mut op: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let disposition = classify(&err);
                if disposition == RetryDisposition::Retryable && attempt < policy.max_retries {
                    let delay = policy.delay;
                    warn!(attempt = attempt + 1, ?delay, error = %err, "store not ready; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(RetryFailure {
                    attempts: attempt + 1,
                    disposition,
                    error: err,
                });
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("database reachable but no tables are visible yet")]
    NotReady,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("database not ready after {attempts} attempts: {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: AttemptError,
    },
    #[error("non-retryable connection failure: {0}")]
    Fatal(#[source] AttemptError),
}

impl From<RetryFailure<AttemptError>> for ConnectionError {
    fn from(failure: RetryFailure<AttemptError>) -> Self {
        match failure.disposition {
            RetryDisposition::Retryable => ConnectionError::Exhausted {
                attempts: failure.attempts,
                source: failure.error,
            },
            RetryDisposition::NonRetryable => ConnectionError::Fatal(failure.error),
        }
    }
}

/// Decides whether a freshly connected database has finished initializing.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self, conn: &mut PgConnection) -> Result<bool, sqlx::Error>;
}

/// Ready once at least one base table is visible in `schema`.
#[derive(Debug, Clone)]
pub struct TablesVisible {
    pub schema: String,
}

impl Default for TablesVisible {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for TablesVisible {
    async fn is_ready(&self, conn: &mut PgConnection) -> Result<bool, sqlx::Error> {
        let visible: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM information_schema.tables
             WHERE table_schema = $1
               AND table_type = 'BASE TABLE'
            "#,
        )
        .bind(&self.schema)
        .fetch_one(conn)
        .await?;
        Ok(visible > 0)
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub database_url: String,
    pub backoff: BackoffPolicy,
    pub max_connections: u32,
    pub apply_schema: bool,
}

impl BootstrapConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            backoff: BackoffPolicy::default(),
            max_connections: 4,
            apply_schema: true,
        }
    }
}

/// Acquires store connections once the target database exists and is initialized.
pub struct Bootstrapper {
    config: BootstrapConfig,
    probe: Box<dyn ReadinessProbe>,
}

impl Bootstrapper {
    pub fn new(config: BootstrapConfig) -> Self {
        Self {
            config,
            probe: Box::<TablesVisible>::default(),
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// Pool for the sequential import pipeline.
    pub async fn acquire(&self) -> Result<PgPool, ConnectionError> {
        let target = describe_target(&self.config.database_url)?;
        let span = info_span!("bootstrap", db = %target);
        retry_with_policy(&self.config.backoff, classify_attempt_error, |_attempt| {
            self.attempt_pool()
        })
        .instrument(span)
        .await
        .map_err(ConnectionError::from)
    }

    /// Dedicated connection, one per concurrently running aggregate task.
    pub async fn acquire_connection(&self) -> Result<PgConnection, ConnectionError> {
        let target = describe_target(&self.config.database_url)?;
        let span = info_span!("bootstrap_connection", db = %target);
        retry_with_policy(&self.config.backoff, classify_attempt_error, |_attempt| {
            self.attempt_connection()
        })
        .instrument(span)
        .await
        .map_err(ConnectionError::from)
    }

    async fn attempt_pool(&self) -> Result<PgPool, AttemptError> {
        self.ensure_database().await?;
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(&self.config.database_url)
            .await?;

        if self.config.apply_schema {
            apply_schema(&pool).await?;
        }

        let mut conn = pool.acquire().await?;
        if !self.probe.is_ready(&mut *conn).await? {
            return Err(AttemptError::NotReady);
        }
        drop(conn);

        info!("store ready");
        Ok(pool)
    }

    async fn attempt_connection(&self) -> Result<PgConnection, AttemptError> {
        self.ensure_database().await?;
        let mut conn = PgConnection::connect(&self.config.database_url).await?;
        if !self.probe.is_ready(&mut conn).await? {
            return Err(AttemptError::NotReady);
        }
        Ok(conn)
    }

    async fn ensure_database(&self) -> Result<(), sqlx::Error> {
        if !Postgres::database_exists(&self.config.database_url).await? {
            info!("target database missing; creating it");
            Postgres::create_database(&self.config.database_url).await?;
        }
        Ok(())
    }
}

/// Apply the embedded DDL. Safe to run against an initialized database.
pub async fn apply_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

/// `host:port/db` for logs; never the raw DSN since it may carry credentials.
fn describe_target(database_url: &str) -> Result<String, ConnectionError> {
    let options = PgConnectOptions::from_str(database_url)
        .map_err(|err| ConnectionError::Fatal(AttemptError::Sqlx(err)))?;
    Ok(format!(
        "{}:{}/{}",
        options.get_host(),
        options.get_port(),
        options.get_database().unwrap_or("<default>")
    ))
}
