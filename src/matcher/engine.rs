//! Post-auction event matcher.
//!
//! Joins the three asynchronous streams (submitted auctions from the router,
//! win/loss from the exchange, campaign events from the ad server) on bid id
//! and drives the per-bucket state machine:
//!
//! ```text
//! (new) --auction--> AwaitingWinLoss --win/loss--> Settled --grace--> gone
//! (new) --event----> AwaitingAuction --deadline--> Expired (queued events
//!                        |                                  reported unmatched)
//!                        +--auction--> AwaitingWinLoss
//! ```
//!
//! All handlers are synchronous and return the outputs to route; the service
//! layer owns the channels. Timers advance only through
//! [`EventMatcher::advance_timers_to`], so tests drive explicit instants.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::matcher::index::{
    BucketState, DeadlineKind, EventIndex, PendingBucket, Resolution,
};
use crate::models::{
    BidId, MatchedCampaignEvent, MatchedLoss, MatchedResult, MatchedWin, RawCampaignEvent,
    RawWinLossEvent, SubmittedAuction, UnmatchedEvent, UnmatchedReason, UsdCpm, UserIds,
    WinLossType,
};

/// Matcher tuning knobs, all settable from the command line.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// How long queued-early events wait for their submitted auction.
    pub auction_timeout: Duration,
    /// How long an unresolved auction waits for its win/loss.
    pub win_timeout: Duration,
    /// How long a settled bucket lingers to absorb late duplicates.
    /// `None` means reuse `win_timeout`.
    pub settled_grace: Option<Duration>,
    /// Gate campaign events on a won auction instead of passing them through.
    pub campaign_events_require_win: bool,
}

pub const DEFAULT_AUCTION_TIMEOUT_SECS: i64 = 900;
pub const DEFAULT_WIN_TIMEOUT_SECS: i64 = 3600;

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            auction_timeout: Duration::seconds(DEFAULT_AUCTION_TIMEOUT_SECS),
            win_timeout: Duration::seconds(DEFAULT_WIN_TIMEOUT_SECS),
            settled_grace: None,
            campaign_events_require_win: false,
        }
    }
}

impl MatcherConfig {
    fn grace(&self) -> Duration {
        self.settled_grace.unwrap_or(self.win_timeout)
    }
}

/// What the matcher asks the service layer to do.
#[derive(Debug, Clone)]
pub enum MatcherOutput {
    /// Deliver on the egress port (and to the ad server for wins/events).
    Matched(MatchedResult),
    /// Commit the chargeable amount to the banker, idempotent on
    /// (bid id, agent).
    CommitWin {
        bid_id: BidId,
        agent: String,
        amount: UsdCpm,
    },
    /// Report on the diagnostics stream.
    Unmatched(UnmatchedEvent),
}

/// The per-shard matcher. Single logical thread of mutation over its index.
pub struct EventMatcher {
    index: EventIndex,
    config: MatcherConfig,
}

impl EventMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self {
            index: EventIndex::new(),
            config,
        }
    }

    /// Number of live pending buckets. Every bucket has a removal path, so
    /// this stays bounded by ingress rate times the longest deadline.
    pub fn pending(&self) -> usize {
        self.index.len()
    }

    /// A submitted auction arrived from the router.
    pub fn handle_auction(
        &mut self,
        auction: SubmittedAuction,
        now: DateTime<Utc>,
    ) -> Vec<MatcherOutput> {
        let config = self.config.clone();
        let id = auction.bid_id.clone();

        self.index.upsert(&id, |bucket| {
            let mut out = Vec::new();

            if bucket.auction.is_some() {
                debug!(bid_id = %id, "duplicate submitted auction dropped");
                return out;
            }

            bucket.auction = Some(auction);
            bucket.state = BucketState::AwaitingWinLoss;
            bucket.auction_deadline = None;
            bucket.winloss_deadline = Some(now + config.win_timeout);

            // Drain anything that arrived before the auction, win/loss first
            // so campaign events keep their causal order. Resolution flushes
            // the queued campaign events itself.
            if let Some(ev) = bucket.early_win_loss.take() {
                Self::resolve_win_loss(&config, bucket, ev, now, &mut out);
            }
            out
        })
    }

    /// A raw win/loss arrived from the exchange.
    pub fn handle_win_loss(
        &mut self,
        event: RawWinLossEvent,
        now: DateTime<Utc>,
    ) -> Vec<MatcherOutput> {
        let config = self.config.clone();
        let id = event.bid_id.clone();

        self.index.upsert(&id, |bucket| {
            let mut out = Vec::new();
            match bucket.state {
                BucketState::AwaitingAuction => {
                    Self::queue_early_win_loss(bucket, event, now, &config);
                }
                BucketState::AwaitingWinLoss | BucketState::Settled => {
                    Self::resolve_win_loss(&config, bucket, event, now, &mut out);
                }
                BucketState::Expired => {
                    out.push(unmatched(UnmatchedReason::LateWin, &id, now, &event));
                }
            }
            out
        })
    }

    /// A raw campaign event arrived from the ad server.
    pub fn handle_campaign_event(
        &mut self,
        event: RawCampaignEvent,
        now: DateTime<Utc>,
    ) -> Vec<MatcherOutput> {
        let config = self.config.clone();
        let id = event.bid_id.clone();

        self.index.upsert(&id, |bucket| {
            let mut out = Vec::new();
            match bucket.state {
                BucketState::AwaitingAuction => {
                    if bucket.auction_deadline.is_none() {
                        bucket.auction_deadline = Some(now + config.auction_timeout);
                    }
                    bucket.queued_campaign.push(event);
                }
                // Held until the outcome resolves so matched results stay in
                // causal order: auction <= win/loss <= campaign events.
                BucketState::AwaitingWinLoss => bucket.queued_campaign.push(event),
                BucketState::Settled => {
                    Self::emit_campaign(&config, bucket, event, &mut out);
                }
                BucketState::Expired => {
                    out.push(unmatched(UnmatchedReason::LateCampaign, &id, now, &event));
                }
            }
            out
        })
    }

    /// Fire every deadline at or before `now`, in deadline order.
    pub fn advance_timers_to(&mut self, now: DateTime<Utc>) -> Vec<MatcherOutput> {
        let mut out = Vec::new();
        for (id, kind) in self.index.advance_timers_to(now) {
            match kind {
                DeadlineKind::Auction => self.expire_awaiting_auction(&id, now, &mut out),
                DeadlineKind::WinLoss => self.fire_winloss_deadline(&id, now, &mut out),
            }
        }
        out
    }

    // -------------------------------------------------------------------------
    // transitions
    // -------------------------------------------------------------------------

    fn queue_early_win_loss(
        bucket: &mut PendingBucket,
        event: RawWinLossEvent,
        now: DateTime<Utc>,
        config: &MatcherConfig,
    ) {
        if bucket.auction_deadline.is_none() {
            bucket.auction_deadline = Some(now + config.auction_timeout);
        }
        match &bucket.early_win_loss {
            None => bucket.early_win_loss = Some(event),
            // A queued loss is superseded by a win; anything else is a dup.
            Some(existing) if existing.kind == WinLossType::Loss
                && event.kind == WinLossType::Win =>
            {
                bucket.early_win_loss = Some(event)
            }
            Some(_) => debug!(bid_id = %bucket.bid_id, "duplicate early win/loss dropped"),
        }
    }

    /// Resolve a win/loss against a bucket that holds its auction.
    fn resolve_win_loss(
        config: &MatcherConfig,
        bucket: &mut PendingBucket,
        event: RawWinLossEvent,
        now: DateTime<Utc>,
        out: &mut Vec<MatcherOutput>,
    ) {
        if bucket.state == BucketState::Settled {
            // At most one matched win per bid id, ever.
            let reason = match event.kind {
                WinLossType::Win => UnmatchedReason::DuplicateWin,
                WinLossType::Loss => UnmatchedReason::LateWin,
            };
            out.push(unmatched(reason, &bucket.bid_id, now, &event));
            return;
        }

        let auction = bucket
            .auction
            .as_ref()
            .expect("resolve_win_loss requires a stored auction");

        match event.kind {
            WinLossType::Win => {
                let Some(winner) = auction.resolve_winner(&event.imp_id, event.price) else {
                    out.push(unmatched(
                        UnmatchedReason::UnknownWinner,
                        &bucket.bid_id,
                        now,
                        &event,
                    ));
                    return;
                };

                // The exchange-reported price is accepted verbatim; the
                // chargeable amount is recomputed through the agent's model.
                let win_price = event.price;
                let amount = winner.win_cost_model.charge(winner.price, win_price);

                let matched = MatchedWin {
                    bid_id: bucket.bid_id.clone(),
                    imp_id: event.imp_id.clone(),
                    agent: winner.agent.clone(),
                    config: winner.config.clone(),
                    timestamp: event.timestamp,
                    win_price,
                    bid_price: winner.price,
                    win_cost_model: winner.win_cost_model,
                    user_ids: event.user_ids.clone(),
                };
                let resolution = Resolution {
                    agent: winner.agent.clone(),
                    config: winner.config.clone(),
                    user_ids: event.user_ids.clone(),
                    won: true,
                };

                out.push(MatcherOutput::Matched(MatchedResult::Win(matched)));
                out.push(MatcherOutput::CommitWin {
                    bid_id: bucket.bid_id.clone(),
                    agent: resolution.agent.clone(),
                    amount,
                });

                bucket.win_emitted = true;
                Self::settle(config, bucket, resolution, now);
                Self::flush_queued_campaign(config, bucket, out);
            }
            WinLossType::Loss => {
                let loser = auction
                    .resolve_winner(&event.imp_id, event.price)
                    .or_else(|| auction.bidders.first());
                let Some(loser) = loser else {
                    out.push(unmatched(
                        UnmatchedReason::UnknownWinner,
                        &bucket.bid_id,
                        now,
                        &event,
                    ));
                    return;
                };

                let matched = MatchedLoss {
                    bid_id: bucket.bid_id.clone(),
                    imp_id: event.imp_id.clone(),
                    agent: loser.agent.clone(),
                    config: loser.config.clone(),
                    timestamp: event.timestamp,
                    user_ids: event.user_ids.clone(),
                };
                let resolution = Resolution {
                    agent: loser.agent.clone(),
                    config: loser.config.clone(),
                    user_ids: event.user_ids.clone(),
                    won: false,
                };

                out.push(MatcherOutput::Matched(MatchedResult::Loss(matched)));
                Self::settle(config, bucket, resolution, now);
                Self::flush_queued_campaign(config, bucket, out);
            }
        }
    }

    fn settle(
        config: &MatcherConfig,
        bucket: &mut PendingBucket,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) {
        bucket.state = BucketState::Settled;
        bucket.resolution = Some(resolution);
        // Linger for the grace interval, then the winloss timer reclaims.
        bucket.winloss_deadline = Some(now + config.grace());
    }

    fn flush_queued_campaign(
        config: &MatcherConfig,
        bucket: &mut PendingBucket,
        out: &mut Vec<MatcherOutput>,
    ) {
        let queued = std::mem::take(&mut bucket.queued_campaign);
        for event in queued {
            Self::emit_campaign(config, bucket, event, out);
        }
    }

    fn emit_campaign(
        config: &MatcherConfig,
        bucket: &mut PendingBucket,
        event: RawCampaignEvent,
        out: &mut Vec<MatcherOutput>,
    ) {
        let Some(resolution) = bucket.resolution.as_ref() else {
            out.push(unmatched(
                UnmatchedReason::NoAuction,
                &bucket.bid_id,
                event.timestamp,
                &event,
            ));
            return;
        };

        if config.campaign_events_require_win && !resolution.won {
            out.push(unmatched(
                UnmatchedReason::RequiresWin,
                &bucket.bid_id,
                event.timestamp,
                &event,
            ));
            return;
        }

        out.push(MatcherOutput::Matched(MatchedResult::CampaignEvent(
            MatchedCampaignEvent {
                bid_id: bucket.bid_id.clone(),
                imp_id: event.imp_id.clone(),
                agent: resolution.agent.clone(),
                label: event.label,
                timestamp: event.timestamp,
                user_ids: resolution.user_ids.clone(),
            },
        )));
    }

    /// Auction deadline fired while still awaiting the auction: report every
    /// queued event as unmatched and drop the bucket.
    fn expire_awaiting_auction(
        &mut self,
        id: &BidId,
        now: DateTime<Utc>,
        out: &mut Vec<MatcherOutput>,
    ) {
        let Some(bucket) = self.index.get(id) else { return };
        if bucket.state != BucketState::AwaitingAuction {
            return;
        }
        let Some(mut bucket) = self.index.remove(id) else { return };
        bucket.state = BucketState::Expired;

        if let Some(ev) = bucket.early_win_loss.take() {
            out.push(unmatched(UnmatchedReason::NoAuction, id, now, &ev));
        }
        for ev in bucket.queued_campaign.drain(..) {
            out.push(unmatched(UnmatchedReason::NoAuction, id, now, &ev));
        }
    }

    /// WinLoss deadline fired: either the grace interval of a settled bucket
    /// ended, or an unresolved auction gets its synthetic loss.
    fn fire_winloss_deadline(
        &mut self,
        id: &BidId,
        now: DateTime<Utc>,
        out: &mut Vec<MatcherOutput>,
    ) {
        let state = match self.index.get(id) {
            Some(bucket) => bucket.state,
            None => return,
        };

        match state {
            BucketState::Settled => {
                self.index.remove_if_settled(id);
            }
            BucketState::AwaitingWinLoss => {
                let config = self.config.clone();
                let mut produced = self.index.upsert(id, |bucket| {
                    let mut produced = Vec::new();
                    let auction = bucket
                        .auction
                        .as_ref()
                        .expect("AwaitingWinLoss bucket holds its auction");
                    let Some(bidder) = auction.bidders.first() else {
                        bucket.state = BucketState::Expired;
                        return produced;
                    };

                    let matched = MatchedLoss {
                        bid_id: bucket.bid_id.clone(),
                        imp_id: auction.imp_id.clone(),
                        agent: bidder.agent.clone(),
                        config: bidder.config.clone(),
                        timestamp: now,
                        user_ids: UserIds::default(),
                    };
                    let resolution = Resolution {
                        agent: bidder.agent.clone(),
                        config: bidder.config.clone(),
                        user_ids: UserIds::default(),
                        won: false,
                    };
                    produced.push(MatcherOutput::Matched(MatchedResult::Loss(matched)));

                    // Anything still queued missed its window.
                    for ev in std::mem::take(&mut bucket.queued_campaign) {
                        produced.push(unmatched(
                            UnmatchedReason::LateCampaign,
                            &bucket.bid_id,
                            now,
                            &ev,
                        ));
                    }

                    Self::settle(&config, bucket, resolution, now);
                    produced
                });
                if self
                    .index
                    .get(id)
                    .map(|b| b.state == BucketState::Expired)
                    .unwrap_or(false)
                {
                    self.index.remove(id);
                }
                out.append(&mut produced);
            }
            _ => {}
        }
    }
}

fn unmatched<T: serde::Serialize>(
    reason: UnmatchedReason,
    bid_id: &BidId,
    timestamp: DateTime<Utc>,
    payload: &T,
) -> MatcherOutput {
    MatcherOutput::Unmatched(UnmatchedEvent {
        reason,
        bid_id: bid_id.clone(),
        timestamp,
        payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bidder::openrtb::BidRequest;
    use crate::models::{AgentConfig, BidderEntry, CampaignLabel, WinCostModel};
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn secs(s: f64) -> Duration {
        Duration::milliseconds((s * 1000.0) as i64)
    }

    fn test_config() -> MatcherConfig {
        MatcherConfig {
            auction_timeout: secs(1.0),
            win_timeout: secs(2.0),
            settled_grace: None,
            campaign_events_require_win: false,
        }
    }

    fn agent_config(name: &str, external_id: u64) -> Arc<AgentConfig> {
        Arc::new(AgentConfig {
            account: name.to_string(),
            external_id,
            creatives: vec![],
            win_cost_model: WinCostModel::SecondPrice,
        })
    }

    fn auction(bid_id: &str, agent: &str, cpm: f64) -> SubmittedAuction {
        let config = agent_config(agent, 1);
        SubmittedAuction {
            bid_id: BidId::from(bid_id),
            imp_id: "i0".into(),
            close_time: t0(),
            expiry: t0() + secs(0.1),
            bidders: vec![BidderEntry {
                agent: agent.to_string(),
                config,
                price: UsdCpm::from_cpm(cpm),
                creative_index: 0,
                win_cost_model: WinCostModel::SecondPrice,
            }],
            request: BidRequest::default(),
            winner: None,
        }
    }

    fn win(bid_id: &str, cpm: f64, at: DateTime<Utc>) -> RawWinLossEvent {
        RawWinLossEvent {
            kind: WinLossType::Win,
            bid_id: BidId::from(bid_id),
            imp_id: "i0".into(),
            timestamp: at,
            price: UsdCpm::from_cpm(cpm),
            user_ids: UserIds::default(),
            meta: serde_json::Value::Null,
        }
    }

    fn loss(bid_id: &str, cpm: f64, at: DateTime<Utc>) -> RawWinLossEvent {
        RawWinLossEvent {
            kind: WinLossType::Loss,
            ..win(bid_id, cpm, at)
        }
    }

    fn campaign(bid_id: &str, label: CampaignLabel, at: DateTime<Utc>) -> RawCampaignEvent {
        RawCampaignEvent {
            bid_id: BidId::from(bid_id),
            imp_id: "i0".into(),
            timestamp: at,
            label,
            payload: serde_json::Value::Null,
        }
    }

    fn wins(out: &[MatcherOutput]) -> usize {
        out.iter()
            .filter(|o| matches!(o, MatcherOutput::Matched(MatchedResult::Win(_))))
            .count()
    }

    #[test]
    fn test_happy_path_win_commits_banker() {
        let mut matcher = EventMatcher::new(test_config());

        assert!(matcher.handle_auction(auction("A", "x", 1.50), t0()).is_empty());
        let out = matcher.handle_win_loss(win("A", 1.50, t0() + secs(0.5)), t0() + secs(0.5));

        assert_eq!(out.len(), 2);
        let MatcherOutput::Matched(MatchedResult::Win(matched)) = &out[0] else {
            panic!("expected matched win, got {:?}", out[0]);
        };
        assert_eq!(matched.agent, "x");
        assert_eq!(matched.win_price, UsdCpm::from_cpm(1.50));
        let MatcherOutput::CommitWin { agent, amount, .. } = &out[1] else {
            panic!("expected banker commit, got {:?}", out[1]);
        };
        assert_eq!(agent, "x");
        assert_eq!(*amount, UsdCpm::from_cpm(1.50));
    }

    #[test]
    fn test_win_after_deadline_is_unmatched_late() {
        let mut matcher = EventMatcher::new(test_config());
        matcher.handle_auction(auction("A", "x", 1.50), t0());

        // winloss deadline fires at t0+2s: synthetic loss.
        let out = matcher.advance_timers_to(t0() + secs(2.0));
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            MatcherOutput::Matched(MatchedResult::Loss(l)) if l.agent == "x"
        ));

        // Late win at t0+2.5s: diagnostic only, never a second emission.
        let out = matcher.handle_win_loss(win("A", 1.50, t0() + secs(2.5)), t0() + secs(2.5));
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            MatcherOutput::Unmatched(u) if u.reason == UnmatchedReason::DuplicateWin
        ));
        assert_eq!(wins(&out), 0);
    }

    #[test]
    fn test_early_campaign_event_emits_after_win() {
        let mut matcher = EventMatcher::new(test_config());

        let out = matcher.handle_campaign_event(campaign("A", CampaignLabel::Impression, t0()), t0());
        assert!(out.is_empty());

        let out = matcher.handle_auction(auction("A", "x", 1.50), t0() + secs(0.3));
        assert!(out.is_empty());

        let out = matcher.handle_win_loss(win("A", 1.50, t0() + secs(0.5)), t0() + secs(0.5));
        // Causal order: win, commit, then the queued impression.
        assert!(matches!(&out[0], MatcherOutput::Matched(MatchedResult::Win(_))));
        assert!(matches!(&out[1], MatcherOutput::CommitWin { .. }));
        assert!(matches!(
            &out[2],
            MatcherOutput::Matched(MatchedResult::CampaignEvent(e))
                if e.label == CampaignLabel::Impression && e.agent == "x"
        ));
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_orphan_event_expires_unmatched_once() {
        let mut matcher = EventMatcher::new(test_config());

        matcher.handle_campaign_event(campaign("B", CampaignLabel::Click, t0()), t0());
        assert_eq!(matcher.pending(), 1);

        let out = matcher.advance_timers_to(t0() + secs(1.0));
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            MatcherOutput::Unmatched(u)
                if u.reason == UnmatchedReason::NoAuction && u.bid_id.as_str() == "B"
        ));
        assert_eq!(matcher.pending(), 0);

        // Deadline never fires twice.
        assert!(matcher.advance_timers_to(t0() + secs(5.0)).is_empty());
    }

    #[test]
    fn test_early_win_matches_when_auction_arrives() {
        let mut matcher = EventMatcher::new(test_config());

        assert!(matcher
            .handle_win_loss(win("A", 2.00, t0()), t0())
            .is_empty());
        let out = matcher.handle_auction(auction("A", "x", 2.00), t0() + secs(0.4));

        assert_eq!(wins(&out), 1);
        assert!(matches!(&out[1], MatcherOutput::CommitWin { .. }));
    }

    #[test]
    fn test_duplicate_win_is_dropped() {
        let mut matcher = EventMatcher::new(test_config());
        matcher.handle_auction(auction("A", "x", 1.0), t0());
        matcher.handle_win_loss(win("A", 1.0, t0()), t0());

        let out = matcher.handle_win_loss(win("A", 1.0, t0() + secs(0.1)), t0() + secs(0.1));
        assert_eq!(wins(&out), 0);
        assert!(matches!(
            &out[0],
            MatcherOutput::Unmatched(u) if u.reason == UnmatchedReason::DuplicateWin
        ));
    }

    #[test]
    fn test_campaign_event_after_loss_still_matches() {
        let mut matcher = EventMatcher::new(test_config());
        matcher.handle_auction(auction("A", "x", 1.0), t0());
        matcher.handle_win_loss(loss("A", 1.0, t0()), t0());

        let out = matcher.handle_campaign_event(
            campaign("A", CampaignLabel::Conversion, t0() + secs(0.2)),
            t0() + secs(0.2),
        );
        assert!(matches!(
            &out[0],
            MatcherOutput::Matched(MatchedResult::CampaignEvent(e))
                if e.label == CampaignLabel::Conversion
        ));
    }

    #[test]
    fn test_require_win_policy_gates_lost_auctions() {
        let mut config = test_config();
        config.campaign_events_require_win = true;
        let mut matcher = EventMatcher::new(config);

        matcher.handle_auction(auction("A", "x", 1.0), t0());
        matcher.handle_win_loss(loss("A", 1.0, t0()), t0());

        let out = matcher.handle_campaign_event(
            campaign("A", CampaignLabel::Click, t0() + secs(0.1)),
            t0() + secs(0.1),
        );
        assert!(matches!(
            &out[0],
            MatcherOutput::Unmatched(u) if u.reason == UnmatchedReason::RequiresWin
        ));
    }

    #[test]
    fn test_winloss_deadline_flushes_queued_campaign_as_late() {
        let mut matcher = EventMatcher::new(test_config());
        matcher.handle_auction(auction("A", "x", 1.0), t0());
        matcher.handle_campaign_event(campaign("A", CampaignLabel::Impression, t0()), t0());

        let out = matcher.advance_timers_to(t0() + secs(2.0));
        assert!(matches!(&out[0], MatcherOutput::Matched(MatchedResult::Loss(_))));
        assert!(matches!(
            &out[1],
            MatcherOutput::Unmatched(u) if u.reason == UnmatchedReason::LateCampaign
        ));
    }

    #[test]
    fn test_settled_bucket_reclaimed_after_grace() {
        let mut matcher = EventMatcher::new(test_config());
        matcher.handle_auction(auction("A", "x", 1.0), t0());
        matcher.handle_win_loss(win("A", 1.0, t0() + secs(0.1)), t0() + secs(0.1));
        assert_eq!(matcher.pending(), 1);

        // Grace defaults to win_timeout (2s) from settlement.
        assert!(matcher.advance_timers_to(t0() + secs(2.0)).is_empty());
        assert_eq!(matcher.pending(), 1);

        matcher.advance_timers_to(t0() + secs(2.2));
        assert_eq!(matcher.pending(), 0);
    }

    #[test]
    fn test_second_price_charge_uses_reported_price() {
        use crate::models::InlineWinner;

        let mut matcher = EventMatcher::new(test_config());

        // The exchange discloses the winner inline and later reports a
        // clearing price below the bid; the reported price is accepted
        // verbatim and charged under the second-price model.
        let mut submitted = auction("A", "x", 2.00);
        submitted.winner = Some(InlineWinner {
            agent: "x".into(),
            price: UsdCpm::from_cpm(2.00),
        });
        matcher.handle_auction(submitted, t0());

        let out = matcher.handle_win_loss(win("A", 1.25, t0()), t0());
        let MatcherOutput::Matched(MatchedResult::Win(matched)) = &out[0] else {
            panic!("expected matched win");
        };
        assert_eq!(matched.win_price, UsdCpm::from_cpm(1.25));
        assert_eq!(matched.bid_price, UsdCpm::from_cpm(2.00));
        let MatcherOutput::CommitWin { amount, .. } = &out[1] else {
            panic!("expected commit");
        };
        assert_eq!(*amount, UsdCpm::from_cpm(1.25));
    }

    #[test]
    fn test_win_with_unknown_price_is_protocol_error() {
        let mut matcher = EventMatcher::new(test_config());
        matcher.handle_auction(auction("A", "x", 1.0), t0());

        let out = matcher.handle_win_loss(win("A", 9.99, t0()), t0());
        assert_eq!(wins(&out), 0);
        assert!(matches!(
            &out[0],
            MatcherOutput::Unmatched(u) if u.reason == UnmatchedReason::UnknownWinner
        ));
    }

    #[test]
    fn test_memory_reclaimed_for_every_path() {
        let mut matcher = EventMatcher::new(test_config());

        // Path 1: orphan event -> expired.
        matcher.handle_campaign_event(campaign("orphan", CampaignLabel::Click, t0()), t0());
        // Path 2: auction without winloss -> synthetic loss -> grace.
        matcher.handle_auction(auction("timeout", "x", 1.0), t0());
        // Path 3: full win -> grace.
        matcher.handle_auction(auction("won", "x", 1.0), t0());
        matcher.handle_win_loss(win("won", 1.0, t0()), t0());

        assert_eq!(matcher.pending(), 3);
        // t+2s: orphan expired, synthetic loss emitted, won bucket's grace up.
        matcher.advance_timers_to(t0() + secs(2.0));
        // t+4s: the synthetic loss's grace interval ends.
        matcher.advance_timers_to(t0() + secs(4.0));
        assert_eq!(matcher.pending(), 0);
    }
}
