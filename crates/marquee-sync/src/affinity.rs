//! Genre-affinity aggregate engine and the concurrent runner for both variants.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressDrawTarget};
use marquee_core::{AffinityVariant, UserId};
use marquee_storage::{AffinityStore, Bootstrapper, PgAffinityStore, StoreError};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use crate::progress::{spawn_reporter, AggregateProgress, AggregateState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateOptions {
    /// Recompute even when the summary table already has rows.
    pub force: bool,
    /// Users aggregated per statement; also the progress granularity.
    pub window: usize,
    pub min_support: i64,
    pub show_progress: bool,
    pub poll_interval: Duration,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            force: false,
            window: 250,
            min_support: AffinityVariant::MIN_SUPPORT,
            show_progress: true,
            poll_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AggregateOutcome {
    /// Entry guard hit: the summary table was already populated.
    Skipped { existing_rows: i64 },
    Completed {
        staged_seeds: u64,
        users: usize,
        summary_rows: u64,
    },
}

/// Drives one variant through idle, staging, truncating, aggregating and done.
pub struct AffinityEngine<S> {
    store: S,
    variant: AffinityVariant,
    options: AggregateOptions,
    progress: Arc<AggregateProgress>,
}

impl<S: AffinityStore> AffinityEngine<S> {
    pub fn new(store: S, variant: AffinityVariant, options: AggregateOptions) -> Self {
        Self {
            store,
            variant,
            options,
            progress: Arc::new(AggregateProgress::new(variant)),
        }
    }

    pub fn with_progress(mut self, progress: Arc<AggregateProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> Arc<AggregateProgress> {
        self.progress.clone()
    }

    pub async fn run(&mut self) -> Result<AggregateOutcome, StoreError> {
        self.progress.reset();
        match self.run_stages().await {
            Ok(outcome) => {
                self.progress.finish();
                Ok(outcome)
            }
            Err(err) => {
                self.progress.abort();
                Err(err)
            }
        }
    }

    async fn run_stages(&mut self) -> Result<AggregateOutcome, StoreError> {
        let variant = self.variant;

        let existing_rows = self.store.summary_rows(variant).await?;
        if existing_rows > 0 && !self.options.force {
            info!(
                table = %variant.summary_table(),
                existing_rows,
                "summary already exists. Skipping aggregation."
            );
            return Ok(AggregateOutcome::Skipped { existing_rows });
        }

        self.progress.set_state(AggregateState::StagingTempTable);
        let staged_seeds = self.store.stage_seeds(variant).await?;
        info!(table = %variant.staging_table(), staged_seeds, "seed ratings staged");

        self.store.begin_rebuild(variant).await?;
        let (total, summary_rows) = match self.rebuild_summary(variant).await {
            Ok(counts) => counts,
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback_rebuild(variant).await {
                    warn!(error = %rollback_err, "summary rollback failed");
                }
                return Err(err);
            }
        };
        self.store.commit_rebuild(variant).await?;

        info!(
            table = %variant.summary_table(),
            users = total,
            summary_rows,
            "summary rebuilt"
        );
        Ok(AggregateOutcome::Completed {
            staged_seeds,
            users: total,
            summary_rows,
        })
    }

    /// Truncate and refill the summary one window of users at a time.
    async fn rebuild_summary(&mut self, variant: AffinityVariant) -> Result<(usize, u64), StoreError> {
        self.progress.set_state(AggregateState::TruncatingSummary);
        self.store.truncate_summary(variant).await?;

        self.progress.set_state(AggregateState::Aggregating);
        let users: Vec<UserId> = self.store.staged_users(variant).await?;
        let total = users.len();
        let mut done = 0usize;
        let mut summary_rows = 0u64;
        for window in users.chunks(self.options.window.max(1)) {
            summary_rows += self
                .store
                .aggregate_users(variant, window, self.options.min_support)
                .await?;
            done += window.len();
            self.progress.advance_to((done * 100 / total) as u64);
        }
        Ok((total, summary_rows))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantReport {
    pub variant: AffinityVariant,
    pub outcome: Option<AggregateOutcome>,
    pub error: Option<String>,
    pub elapsed_ms: u128,
}

impl VariantReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Run each variant as its own task with a store from `open_store`.
///
/// A failure in one variant is logged and reported; the others keep running.
pub async fn run_variants<F, Fut, S>(
    variants: &[AffinityVariant],
    options: AggregateOptions,
    open_store: F,
) -> Vec<VariantReport>
where
    F: Fn(AffinityVariant) -> Fut,
    Fut: Future<Output = Result<S, anyhow::Error>> + Send + 'static,
    S: AffinityStore + 'static,
{
    let bars = if options.show_progress {
        MultiProgress::new()
    } else {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    };

    let mut tasks = Vec::with_capacity(variants.len());
    for &variant in variants {
        let progress = Arc::new(AggregateProgress::new(variant));
        let reporter = spawn_reporter(progress.clone(), &bars, options.poll_interval);
        let store = open_store(variant);
        let span = info_span!("aggregate", %variant);

        let task = tokio::spawn(
            async move {
                let started = Instant::now();
                let result = async {
                    let store = store.await?;
                    let mut engine =
                        AffinityEngine::new(store, variant, options).with_progress(progress.clone());
                    let outcome = engine.run().await?;
                    Ok::<_, anyhow::Error>(outcome)
                }
                .await;
                if result.is_err() {
                    // Also covers a store that never opened.
                    progress.abort();
                }
                (result, started.elapsed())
            }
            .instrument(span),
        );
        tasks.push((variant, task, reporter));
    }

    let mut reports = Vec::with_capacity(tasks.len());
    for (variant, task, reporter) in tasks {
        let report = match task.await {
            Ok((Ok(outcome), elapsed)) => VariantReport {
                variant,
                outcome: Some(outcome),
                error: None,
                elapsed_ms: elapsed.as_millis(),
            },
            Ok((Err(err), elapsed)) => {
                let message = format!("{err:#}");
                error!(%variant, error = %message, "aggregate variant aborted");
                VariantReport {
                    variant,
                    outcome: None,
                    error: Some(message),
                    elapsed_ms: elapsed.as_millis(),
                }
            }
            Err(join_err) => {
                error!(%variant, error = %join_err, "aggregate task panicked");
                reporter.abort();
                VariantReport {
                    variant,
                    outcome: None,
                    error: Some(join_err.to_string()),
                    elapsed_ms: 0,
                }
            }
        };
        let _ = reporter.await;
        reports.push(report);
    }
    reports
}

/// Both variants against Postgres, each on a dedicated connection.
pub async fn run_pg_variants(
    bootstrapper: Arc<Bootstrapper>,
    variants: &[AffinityVariant],
    options: AggregateOptions,
) -> Vec<VariantReport> {
    run_variants(variants, options, move |_variant| {
        let bootstrapper = bootstrapper.clone();
        async move {
            let conn = bootstrapper.acquire_connection().await?;
            Ok::<_, anyhow::Error>(PgAffinityStore::new(conn))
        }
    })
    .await
}
