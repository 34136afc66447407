//! Indexed, TTL'd store of pending post-auction state, keyed by bid id.
//!
//! One `EventIndex` exists per shard and is only ever touched from that
//! shard's matcher task, so the hot path carries no locks. Two timer-ordered
//! secondary indices track the auction and winloss deadlines; every bucket
//! keeps at least one live deadline until it is removed, which bounds the
//! index size by ingress rate x max deadline.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::{
    AgentConfig, BidId, RawCampaignEvent, RawWinLossEvent, SubmittedAuction, UserIds,
};

/// Lifecycle of a pending bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    /// Events queued, submitted auction not seen yet.
    AwaitingAuction,
    /// Auction stored, win/loss outcome unresolved.
    AwaitingWinLoss,
    /// Outcome resolved; lingers for a grace interval to absorb stragglers.
    Settled,
    /// Auction never arrived; bucket is being torn down.
    Expired,
}

/// Which secondary index fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    Auction,
    WinLoss,
}

/// Outcome snapshot kept on a settled bucket so late campaign events can
/// still be joined.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub agent: String,
    pub config: Arc<AgentConfig>,
    pub user_ids: UserIds,
    pub won: bool,
}

/// Per-bid-id soft state (invariant: at most one per bid id).
#[derive(Debug)]
pub struct PendingBucket {
    pub bid_id: BidId,
    pub state: BucketState,
    pub auction: Option<SubmittedAuction>,
    /// Win/loss that arrived before its auction.
    pub early_win_loss: Option<RawWinLossEvent>,
    /// Campaign events queued until the outcome resolves.
    pub queued_campaign: Vec<RawCampaignEvent>,
    pub auction_deadline: Option<DateTime<Utc>>,
    pub winloss_deadline: Option<DateTime<Utc>>,
    /// Latch: a matched win was emitted for this bid id.
    pub win_emitted: bool,
    pub resolution: Option<Resolution>,
}

impl PendingBucket {
    fn new(bid_id: BidId) -> Self {
        Self {
            bid_id,
            state: BucketState::AwaitingAuction,
            auction: None,
            early_win_loss: None,
            queued_campaign: Vec::new(),
            auction_deadline: None,
            winloss_deadline: None,
            win_emitted: false,
            resolution: None,
        }
    }
}

/// Mapping from bid id to pending bucket plus deadline-ordered indices.
#[derive(Default)]
pub struct EventIndex {
    buckets: HashMap<BidId, PendingBucket>,
    auction_timers: BTreeMap<(DateTime<Utc>, BidId), ()>,
    winloss_timers: BTreeMap<(DateTime<Utc>, BidId), ()>,
}

impl EventIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn get(&self, id: &BidId) -> Option<&PendingBucket> {
        self.buckets.get(id)
    }

    /// Fetch or create the bucket for `id` and apply `f` to it, keeping the
    /// timer indices in sync with any deadline the mutation changed.
    pub fn upsert<R>(&mut self, id: &BidId, f: impl FnOnce(&mut PendingBucket) -> R) -> R {
        let bucket = self
            .buckets
            .entry(id.clone())
            .or_insert_with(|| PendingBucket::new(id.clone()));

        let before_auction = bucket.auction_deadline;
        let before_winloss = bucket.winloss_deadline;

        let result = f(bucket);

        let after_auction = bucket.auction_deadline;
        let after_winloss = bucket.winloss_deadline;

        Self::resync_timer(&mut self.auction_timers, id, before_auction, after_auction);
        Self::resync_timer(&mut self.winloss_timers, id, before_winloss, after_winloss);

        result
    }

    fn resync_timer(
        timers: &mut BTreeMap<(DateTime<Utc>, BidId), ()>,
        id: &BidId,
        before: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
    ) {
        if before == after {
            return;
        }
        if let Some(old) = before {
            timers.remove(&(old, id.clone()));
        }
        if let Some(new) = after {
            timers.insert((new, id.clone()), ());
        }
    }

    /// Yield every bucket whose deadline has passed, in deadline order, each
    /// crossing exactly once. The fired deadline is cleared on the bucket;
    /// re-arming requires an explicit `upsert`.
    pub fn advance_timers_to(&mut self, now: DateTime<Utc>) -> Vec<(BidId, DeadlineKind)> {
        let mut fired: Vec<(DateTime<Utc>, BidId, DeadlineKind)> = Vec::new();

        Self::pop_expired(&mut self.auction_timers, now, DeadlineKind::Auction, &mut fired);
        Self::pop_expired(&mut self.winloss_timers, now, DeadlineKind::WinLoss, &mut fired);
        fired.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let mut out = Vec::with_capacity(fired.len());
        for (_, id, kind) in fired {
            if let Some(bucket) = self.buckets.get_mut(&id) {
                match kind {
                    DeadlineKind::Auction => bucket.auction_deadline = None,
                    DeadlineKind::WinLoss => bucket.winloss_deadline = None,
                }
                out.push((id, kind));
            }
        }
        out
    }

    fn pop_expired(
        timers: &mut BTreeMap<(DateTime<Utc>, BidId), ()>,
        now: DateTime<Utc>,
        kind: DeadlineKind,
        fired: &mut Vec<(DateTime<Utc>, BidId, DeadlineKind)>,
    ) {
        while let Some(((at, _), ())) = timers.first_key_value() {
            if *at > now {
                break;
            }
            let ((at, id), ()) = timers.pop_first().unwrap();
            fired.push((at, id, kind));
        }
    }

    /// Drop a bucket unconditionally, unregistering any remaining deadlines.
    pub fn remove(&mut self, id: &BidId) -> Option<PendingBucket> {
        let bucket = self.buckets.remove(id)?;
        if let Some(at) = bucket.auction_deadline {
            self.auction_timers.remove(&(at, id.clone()));
        }
        if let Some(at) = bucket.winloss_deadline {
            self.winloss_timers.remove(&(at, id.clone()));
        }
        Some(bucket)
    }

    /// Drop a bucket only once it has settled (end of the grace interval).
    pub fn remove_if_settled(&mut self, id: &BidId) -> bool {
        match self.buckets.get(id) {
            Some(bucket) if bucket.state == BucketState::Settled => {
                self.remove(id);
                true
            }
            _ => false,
        }
    }
}
