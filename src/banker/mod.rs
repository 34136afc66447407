//! Asynchronous committer of winning-bid spend to the master banker.
//!
//! The matcher fires and forgets: `commit_win` pushes onto a bounded queue
//! and returns immediately. A worker task drains the queue into the selected
//! [`ApplicationLayer`], retrying transient faults with exponential backoff
//! and escalating permanent ones to the diagnostics stream. When the queue
//! hits its high-water mark new commits are rejected with a retryable error.

pub mod layer;

pub use layer::{ApplicationLayer, BusCommit, BusLayer, CommitRequest, HttpLayer, LayerError};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::{BidId, Diagnostic, DiagnosticKind, UsdCpm};
use crate::pipes::Diagnostics;

/// Banker client tuning.
#[derive(Debug, Clone)]
pub struct BankerConfig {
    /// High-water mark of the outbound commit queue.
    pub queue_capacity: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for BankerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// The outbound queue is at its high-water mark; retry on the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitQueueFull;

impl fmt::Display for CommitQueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("banker commit queue full")
    }
}

impl std::error::Error for CommitQueueFull {}

#[derive(Debug, Default)]
pub struct BankerStats {
    pub committed: AtomicU64,
    pub retried: AtomicU64,
    pub abandoned: AtomicU64,
    pub escalated: AtomicU64,
    pub rejected: AtomicU64,
}

#[derive(Debug)]
struct QueuedCommit {
    request: CommitRequest,
    deadline: DateTime<Utc>,
}

/// Handle used by the matcher to enqueue spend commits.
#[derive(Clone)]
pub struct BankerClient {
    tx: mpsc::Sender<QueuedCommit>,
    stats: Arc<BankerStats>,
}

impl BankerClient {
    /// Start the worker draining into `layer`; the returned handle completes
    /// once every clone of the client is dropped and the queue has drained.
    pub fn spawn(
        config: BankerConfig,
        layer: ApplicationLayer,
        diagnostics: Diagnostics,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<QueuedCommit>(config.queue_capacity);
        let stats = Arc::new(BankerStats::default());

        let worker_stats = Arc::clone(&stats);
        let handle = tokio::spawn(async move {
            while let Some(commit) = rx.recv().await {
                deliver_with_retry(&layer, commit, &config, &diagnostics, &worker_stats).await;
            }
            debug!("banker queue drained, worker exiting");
        });

        (Self { tx, stats }, handle)
    }

    /// Fire-and-forget commit of a winning bid, idempotent server-side on
    /// (bid id, account).
    pub fn commit_win(
        &self,
        bid_id: BidId,
        account: String,
        amount: UsdCpm,
        deadline: DateTime<Utc>,
    ) -> Result<(), CommitQueueFull> {
        let commit = QueuedCommit {
            request: CommitRequest {
                bid_id,
                account,
                amount: amount.micros(),
                timestamp: Utc::now(),
            },
            deadline,
        };
        self.tx.try_send(commit).map_err(|_| {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            CommitQueueFull
        })
    }

    pub fn stats(&self) -> &BankerStats {
        &self.stats
    }
}

async fn deliver_with_retry(
    layer: &ApplicationLayer,
    commit: QueuedCommit,
    config: &BankerConfig,
    diagnostics: &Diagnostics,
    stats: &BankerStats,
) {
    let mut backoff = config.initial_backoff;

    loop {
        if Utc::now() >= commit.deadline {
            stats.abandoned.fetch_add(1, Ordering::Relaxed);
            diagnostics.emit(
                Diagnostic::new(
                    DiagnosticKind::Transient,
                    format!(
                        "banker commit abandoned past deadline: bid {} account {}",
                        commit.request.bid_id, commit.request.account
                    ),
                )
                .with_payload(serde_json::to_value(&commit.request).unwrap_or_default()),
            );
            return;
        }

        match layer.commit(&commit.request).await {
            Ok(()) => {
                stats.committed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(LayerError::Permanent(msg)) => {
                stats.escalated.fetch_add(1, Ordering::Relaxed);
                warn!(
                    bid_id = %commit.request.bid_id,
                    account = %commit.request.account,
                    "banker rejected commit: {}", msg
                );
                diagnostics.emit(
                    Diagnostic::new(
                        DiagnosticKind::Protocol,
                        format!("banker rejected commit: {}", msg),
                    )
                    .with_payload(serde_json::to_value(&commit.request).unwrap_or_default()),
                );
                return;
            }
            Err(LayerError::Transient(msg)) => {
                stats.retried.fetch_add(1, Ordering::Relaxed);
                debug!(
                    bid_id = %commit.request.bid_id,
                    "transient banker failure, retrying in {:?}: {}", backoff, msg
                );
                tokio::time::sleep(jittered(backoff)).await;
                backoff = (backoff * 2).min(config.max_backoff);
            }
        }
    }
}

fn jittered(backoff: Duration) -> Duration {
    let quarter = (backoff.as_millis() / 4).max(1) as u64;
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..quarter))
}
