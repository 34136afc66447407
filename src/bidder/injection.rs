//! Bid re-injection queue between the bidder I/O task and the router thread.
//!
//! The router's per-agent in-flight tracker is single-threaded, so the
//! interface must never call into it directly from an I/O callback. Each
//! decision is pushed onto a bounded lock-free single-producer/single-consumer
//! queue and the router's main loop is woken to drain it. A full queue is an
//! overload error surfaced to the caller; the push never blocks.

use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use tokio::sync::Notify;

use crate::models::{BidId, UsdCpm, WinCostModel};

/// One bid decision for a single impression.
///
/// A default-constructed bid is a no-bid; the router counts both bids and
/// no-bids against the agent's in-flight total so the auction can expire.
#[derive(Debug, Clone, PartialEq)]
pub struct Bid {
    pub creative_index: Option<usize>,
    pub spot_index: Option<usize>,
    pub price: UsdCpm,
    pub priority: f64,
}

impl Bid {
    pub fn no_bid() -> Self {
        Self {
            creative_index: None,
            spot_index: None,
            price: UsdCpm::ZERO,
            priority: 0.0,
        }
    }

    #[inline]
    pub fn is_no_bid(&self) -> bool {
        self.creative_index.is_none()
    }
}

impl Default for Bid {
    fn default() -> Self {
        Self::no_bid()
    }
}

/// One agent's full bid vector for an auction, ready for the router.
#[derive(Debug, Clone)]
pub struct BidInjection {
    pub agent: String,
    pub auction_id: BidId,
    pub bids: Vec<Bid>,
    pub win_cost_model: WinCostModel,
}

/// Raised when the router thread cannot keep up with the bidder interface.
#[derive(Debug)]
pub struct InjectionOverload {
    pub dropped: BidInjection,
}

impl std::fmt::Display for InjectionOverload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "router injection queue full, dropped bids for agent {} auction {}",
            self.dropped.agent, self.dropped.auction_id
        )
    }
}

impl std::error::Error for InjectionOverload {}

/// Producer half, owned by the bidder interface I/O task.
#[derive(Clone)]
pub struct BidInjector {
    queue: Arc<ArrayQueue<BidInjection>>,
    wakeup: Arc<Notify>,
}

impl BidInjector {
    /// Push one injection and signal the router main loop.
    pub fn try_inject(&self, injection: BidInjection) -> Result<(), InjectionOverload> {
        self.queue
            .push(injection)
            .map_err(|dropped| InjectionOverload { dropped })?;
        self.wakeup.notify_one();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Consumer half, drained from the router thread.
pub struct InjectionPort {
    queue: Arc<ArrayQueue<BidInjection>>,
    wakeup: Arc<Notify>,
}

impl InjectionPort {
    /// Pop everything currently queued, in injection order.
    pub fn drain(&self) -> Vec<BidInjection> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(injection) = self.queue.pop() {
            out.push(injection);
        }
        out
    }

    /// Wait until the producer signals new injections.
    pub async fn wait(&self) {
        self.wakeup.notified().await;
    }
}

/// Build a connected (producer, consumer) pair with the given capacity.
pub fn injection_channel(capacity: usize) -> (BidInjector, InjectionPort) {
    let queue = Arc::new(ArrayQueue::new(capacity));
    let wakeup = Arc::new(Notify::new());
    (
        BidInjector {
            queue: Arc::clone(&queue),
            wakeup: Arc::clone(&wakeup),
        },
        InjectionPort { queue, wakeup },
    )
}
