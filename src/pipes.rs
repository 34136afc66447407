//! Typed ingress and egress ports of the post-auction loop.
//!
//! Three inbound queues (auctions from the router, win/loss from the
//! exchange, campaign events from the ad server) feed the matcher; one
//! outbound sink carries matched results. Each inbound pipe tracks when it
//! last flowed so the runner can raise a liveness diagnostic when an
//! upstream producer goes quiet. The timeout watches the producer, not any
//! individual message.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::trace;

use crate::models::{Diagnostic, MatchedResult};

/// Producer half of a typed ingress pipe. Cloned by external I/O threads.
pub struct PipeSender<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
}

impl<T> Clone for PipeSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<T> PipeSender<T> {
    pub async fn send(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        self.tx.send(item).await
    }

    pub fn try_send(&self, item: T) -> Result<(), mpsc::error::TrySendError<T>> {
        self.tx.try_send(item)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Consumer half, owned by the shard's matcher task.
pub struct PipeReceiver<T> {
    name: &'static str,
    rx: mpsc::Receiver<T>,
    last_flow: Arc<Mutex<Instant>>,
}

impl<T> PipeReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await;
        if item.is_some() {
            *self.last_flow.lock() = Instant::now();
        }
        item
    }

    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Time since anything last flowed through this pipe.
    pub fn idle_for(&self) -> Duration {
        self.last_flow.lock().elapsed()
    }

    /// Liveness check against the configured pipe timeout.
    pub fn stalled(&self, timeout: Duration) -> bool {
        self.idle_for() >= timeout
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Build a named ingress pipe of the given capacity.
pub fn pipe<T>(name: &'static str, capacity: usize) -> (PipeSender<T>, PipeReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let last_flow = Arc::new(Mutex::new(Instant::now()));
    (
        PipeSender { name, tx },
        PipeReceiver {
            name,
            rx,
            last_flow,
        },
    )
}

/// Outbound matched-results sink (post-auction -> external persistence).
pub type MatchedSender = mpsc::UnboundedSender<MatchedResult>;
pub type MatchedReceiver = mpsc::UnboundedReceiver<MatchedResult>;

pub fn matched_results() -> (MatchedSender, MatchedReceiver) {
    mpsc::unbounded_channel()
}

/// Per-event diagnostics channel (`trace`).
///
/// Broadcast so any number of observers can tap it; slow subscribers lose
/// entries rather than stalling ingress.
#[derive(Clone)]
pub struct Diagnostics {
    tx: broadcast::Sender<Diagnostic>,
}

impl Diagnostics {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, diagnostic: Diagnostic) {
        trace!(
            kind = ?diagnostic.kind,
            message = %diagnostic.message,
            "diagnostic"
        );
        let _ = self.tx.send(diagnostic);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
        self.tx.subscribe()
    }
}
