//! Shared progress counters for the affinity variants and the task that renders them.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use marquee_core::AffinityVariant;
use serde::Serialize;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AggregateState {
    Idle = 0,
    StagingTempTable = 1,
    TruncatingSummary = 2,
    Aggregating = 3,
    Done = 4,
    Aborted = 5,
}

impl AggregateState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => AggregateState::StagingTempTable,
            2 => AggregateState::TruncatingSummary,
            3 => AggregateState::Aggregating,
            4 => AggregateState::Done,
            5 => AggregateState::Aborted,
            _ => AggregateState::Idle,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AggregateState::Done | AggregateState::Aborted)
    }

    pub fn label(self) -> &'static str {
        match self {
            AggregateState::Idle => "idle",
            AggregateState::StagingTempTable => "staging seeds",
            AggregateState::TruncatingSummary => "truncating summary",
            AggregateState::Aggregating => "aggregating",
            AggregateState::Done => "done",
            AggregateState::Aborted => "aborted",
        }
    }
}

/// Percent complete plus engine state for one variant.
///
/// Written only by the engine, read by the reporter. Plain atomics: a stale read
/// shows an old percentage and nothing else.
#[derive(Debug)]
pub struct AggregateProgress {
    variant: AffinityVariant,
    percent: AtomicU64,
    state: AtomicU8,
}

impl AggregateProgress {
    pub fn new(variant: AffinityVariant) -> Self {
        Self {
            variant,
            percent: AtomicU64::new(0),
            state: AtomicU8::new(AggregateState::Idle as u8),
        }
    }

    pub fn variant(&self) -> AffinityVariant {
        self.variant
    }

    pub fn reset(&self) {
        self.percent.store(0, Ordering::Relaxed);
        self.state.store(AggregateState::Idle as u8, Ordering::Release);
    }

    pub fn set_state(&self, state: AggregateState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Never moves backwards within a run.
    pub fn advance_to(&self, percent: u64) {
        self.percent.fetch_max(percent.min(100), Ordering::Relaxed);
    }

    pub fn finish(&self) {
        self.percent.store(100, Ordering::Relaxed);
        self.set_state(AggregateState::Done);
    }

    /// Freezes the percentage where it stopped.
    pub fn abort(&self) {
        self.set_state(AggregateState::Aborted);
    }

    pub fn percent(&self) -> u64 {
        self.percent.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> AggregateState {
        AggregateState::from_u8(self.state.load(Ordering::Acquire))
    }
}

const BAR_TEMPLATE: &str = "{prefix:>6} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}% {msg}";

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

/// Poll `progress` every `every` and mirror it onto a bar until the variant is terminal.
pub fn spawn_reporter(
    progress: Arc<AggregateProgress>,
    bars: &MultiProgress,
    every: Duration,
) -> JoinHandle<()> {
    let bar = bars.add(ProgressBar::new(100));
    bar.set_style(bar_style());
    bar.set_prefix(progress.variant().to_string());

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let state = progress.state();
            bar.set_position(progress.percent());
            match state {
                AggregateState::Done => {
                    bar.finish_with_message(state.label());
                    break;
                }
                AggregateState::Aborted => {
                    bar.abandon_with_message(state.label());
                    break;
                }
                _ => bar.set_message(state.label()),
            }
        }
    })
}
