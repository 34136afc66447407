//! Sharded post-auction service runner.
//!
//! One shard = one logical thread of mutation: a single task fans in the
//! three ingress pipes plus a timer tick and drives the event matcher, so
//! the index never needs a lock. Matched results go to the egress sink and
//! (for wins and campaign events) to the ad server through the bidder
//! interface; win commits go to the banker. Foreign bid ids are dropped
//! with a diagnostic when more than one shard is configured.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::banker::BankerClient;
use crate::bidder::BidderInterface;
use crate::matcher::{EventMatcher, MatcherConfig, MatcherOutput};
use crate::models::{
    BidId, Diagnostic, DiagnosticKind, MatchedResult, RawCampaignEvent, RawWinLossEvent,
    SubmittedAuction, UsdCpm,
};
use crate::pipes::{pipe, Diagnostics, MatchedSender, PipeReceiver, PipeSender};

pub const DEFAULT_WINLOSS_PIPE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CAMPAIGN_PIPE_TIMEOUT_SECS: u64 = 60;

/// Runner configuration, assembled from the command line.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// 0-based shard index owned by this loop.
    pub shard: usize,
    /// Total shard count; 1 disables ownership filtering.
    pub shard_count: usize,
    pub matcher: MatcherConfig,
    /// Liveness timeout on the winloss ingress pipe.
    pub winloss_pipe_timeout: Duration,
    /// Liveness timeout on the campaign-event ingress pipe.
    pub campaign_pipe_timeout: Duration,
    pub tick_interval: Duration,
    pub pipe_capacity: usize,
    /// Bounded drain window on shutdown.
    pub shutdown_drain: Duration,
    /// Lifetime of a banker commit before it is abandoned.
    pub commit_ttl: chrono::Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shard: 0,
            shard_count: 1,
            matcher: MatcherConfig::default(),
            winloss_pipe_timeout: Duration::from_secs(DEFAULT_WINLOSS_PIPE_TIMEOUT_SECS),
            campaign_pipe_timeout: Duration::from_secs(DEFAULT_CAMPAIGN_PIPE_TIMEOUT_SECS),
            tick_interval: Duration::from_millis(100),
            pipe_capacity: 8192,
            shutdown_drain: Duration::from_secs(5),
            commit_ttl: chrono::Duration::seconds(60),
        }
    }
}

/// Shard owning a bid id, by hash of its printable form.
pub fn shard_of(bid_id: &BidId, shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    bid_id.as_str().hash(&mut hasher);
    (hasher.finish() % shard_count.max(1) as u64) as usize
}

/// Service counters, reported periodically by the runner binary.
#[derive(Debug, Default)]
pub struct Stats {
    pub auctions: AtomicU64,
    pub events: AtomicU64,
    pub matched_wins: AtomicU64,
    pub matched_losses: AtomicU64,
    pub matched_campaign_events: AtomicU64,
    pub unmatched_events: AtomicU64,
    pub errors: AtomicU64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            auctions: self.auctions.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            matched_wins: self.matched_wins.load(Ordering::Relaxed),
            matched_losses: self.matched_losses.load(Ordering::Relaxed),
            matched_campaign_events: self.matched_campaign_events.load(Ordering::Relaxed),
            unmatched_events: self.unmatched_events.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatsSnapshot {
    pub auctions: u64,
    pub events: u64,
    pub matched_wins: u64,
    pub matched_losses: u64,
    pub matched_campaign_events: u64,
    pub unmatched_events: u64,
    pub errors: u64,
}

impl StatsSnapshot {
    /// Counter movement since `last`, for throughput reporting.
    pub fn delta(&self, last: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            auctions: self.auctions - last.auctions,
            events: self.events - last.events,
            matched_wins: self.matched_wins - last.matched_wins,
            matched_losses: self.matched_losses - last.matched_losses,
            matched_campaign_events: self.matched_campaign_events
                - last.matched_campaign_events,
            unmatched_events: self.unmatched_events - last.unmatched_events,
            errors: self.errors - last.errors,
        }
    }
}

struct PendingCommit {
    bid_id: BidId,
    agent: String,
    amount: UsdCpm,
    deadline: DateTime<Utc>,
}

/// The running post-auction loop for one shard.
pub struct PostAuctionService {
    auctions: PipeSender<SubmittedAuction>,
    winloss: PipeSender<RawWinLossEvent>,
    campaign: PipeSender<RawCampaignEvent>,
    stats: Arc<Stats>,
    diagnostics: Diagnostics,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: JoinHandle<()>,
    banker_handle: JoinHandle<()>,
    shutdown_drain: Duration,
}

impl PostAuctionService {
    /// Start the shard worker. `banker_handle` is the worker spawned by
    /// [`BankerClient::spawn`]; the service takes over flushing it.
    pub fn spawn(
        config: ServiceConfig,
        bidder: Arc<dyn BidderInterface>,
        banker: BankerClient,
        banker_handle: JoinHandle<()>,
        diagnostics: Diagnostics,
        matched: MatchedSender,
    ) -> Self {
        let (auctions_tx, auctions_rx) = pipe("auctions", config.pipe_capacity);
        let (winloss_tx, winloss_rx) = pipe("winlossEvents", config.pipe_capacity);
        let (campaign_tx, campaign_rx) = pipe("campaignEvents", config.pipe_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let stats = Arc::new(Stats::default());
        let shutdown_drain = config.shutdown_drain;

        let worker = ShardWorker {
            matcher: EventMatcher::new(config.matcher.clone()),
            config,
            bidder,
            banker,
            diagnostics: diagnostics.clone(),
            stats: Arc::clone(&stats),
            matched,
            pending_commits: VecDeque::new(),
        };
        let loop_handle =
            tokio::spawn(worker.run(auctions_rx, winloss_rx, campaign_rx, shutdown_rx));

        Self {
            auctions: auctions_tx,
            winloss: winloss_tx,
            campaign: campaign_tx,
            stats,
            diagnostics,
            shutdown_tx,
            loop_handle,
            banker_handle,
            shutdown_drain,
        }
    }

    pub fn auction_sender(&self) -> PipeSender<SubmittedAuction> {
        self.auctions.clone()
    }

    pub fn win_loss_sender(&self) -> PipeSender<RawWinLossEvent> {
        self.winloss.clone()
    }

    pub fn campaign_event_sender(&self) -> PipeSender<RawCampaignEvent> {
        self.campaign.clone()
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.clone()
    }

    /// Drain ingress up to the configured deadline, flush pending banker
    /// commits up to theirs, then stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if self.loop_handle.await.is_err() {
            warn!("shard worker aborted during shutdown");
        }

        // The worker dropped its banker handle; give the queue its window.
        match timeout(self.shutdown_drain, self.banker_handle).await {
            Ok(_) => info!("banker queue flushed"),
            Err(_) => {
                self.diagnostics.emit(Diagnostic::new(
                    DiagnosticKind::Transient,
                    "banker commits abandoned at shutdown",
                ));
                warn!("banker flush exceeded shutdown window, abandoning");
            }
        }
    }
}

struct ShardWorker {
    config: ServiceConfig,
    matcher: EventMatcher,
    bidder: Arc<dyn BidderInterface>,
    banker: BankerClient,
    diagnostics: Diagnostics,
    stats: Arc<Stats>,
    matched: MatchedSender,
    pending_commits: VecDeque<PendingCommit>,
}

impl ShardWorker {
    async fn run(
        mut self,
        mut auctions_rx: PipeReceiver<SubmittedAuction>,
        mut winloss_rx: PipeReceiver<RawWinLossEvent>,
        mut campaign_rx: PipeReceiver<RawCampaignEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(
            shard = self.config.shard,
            shard_count = self.config.shard_count,
            "post-auction shard started"
        );

        let mut tick = interval(self.config.tick_interval);
        let mut winloss_alert = Instant::now();
        let mut campaign_alert = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                maybe = auctions_rx.recv() => match maybe {
                    Some(auction) => self.on_auction(auction),
                    None => break,
                },
                maybe = winloss_rx.recv() => match maybe {
                    Some(event) => self.on_win_loss(event),
                    None => break,
                },
                maybe = campaign_rx.recv() => match maybe {
                    Some(event) => self.on_campaign_event(event),
                    None => break,
                },
                _ = tick.tick() => {
                    self.retry_pending_commits();
                    self.check_liveness(&winloss_rx, &campaign_rx,
                                        &mut winloss_alert, &mut campaign_alert);
                }
            }

            // Timers are checked on every ingress turn, not only on ticks.
            let outputs = self.matcher.advance_timers_to(Utc::now());
            self.route(outputs);
        }

        let shard = self.config.shard;
        self.drain(auctions_rx, winloss_rx, campaign_rx).await;
        info!(shard, "post-auction shard stopped");
    }

    fn owns(&self, bid_id: &BidId) -> bool {
        if self.config.shard_count <= 1 {
            return true;
        }
        let owner = shard_of(bid_id, self.config.shard_count);
        if owner != self.config.shard {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            self.diagnostics.emit(Diagnostic::new(
                DiagnosticKind::Protocol,
                format!(
                    "bid id {} belongs to shard {}, not {}",
                    bid_id, owner, self.config.shard
                ),
            ));
            return false;
        }
        true
    }

    fn on_auction(&mut self, auction: SubmittedAuction) {
        if !self.owns(&auction.bid_id) {
            return;
        }
        self.stats.auctions.fetch_add(1, Ordering::Relaxed);
        let outputs = self.matcher.handle_auction(auction, Utc::now());
        self.route(outputs);
    }

    fn on_win_loss(&mut self, event: RawWinLossEvent) {
        if !self.owns(&event.bid_id) {
            return;
        }
        self.stats.events.fetch_add(1, Ordering::Relaxed);
        let outputs = self.matcher.handle_win_loss(event, Utc::now());
        self.route(outputs);
    }

    fn on_campaign_event(&mut self, event: RawCampaignEvent) {
        if !self.owns(&event.bid_id) {
            return;
        }
        self.stats.events.fetch_add(1, Ordering::Relaxed);
        let outputs = self.matcher.handle_campaign_event(event, Utc::now());
        self.route(outputs);
    }

    fn route(&mut self, outputs: Vec<MatcherOutput>) {
        for output in outputs {
            match output {
                MatcherOutput::Matched(result) => {
                    match &result {
                        MatchedResult::Win(win) => {
                            self.stats.matched_wins.fetch_add(1, Ordering::Relaxed);
                            self.bidder.send_win_message(win);
                        }
                        MatchedResult::Loss(_) => {
                            // Loss delivery to the ad server stays a no-op.
                            self.stats.matched_losses.fetch_add(1, Ordering::Relaxed);
                        }
                        MatchedResult::CampaignEvent(event) => {
                            self.stats
                                .matched_campaign_events
                                .fetch_add(1, Ordering::Relaxed);
                            self.bidder.send_campaign_event_message(event);
                        }
                    }
                    if self.matched.send(result).is_err() {
                        debug!("matched results sink closed");
                    }
                }
                MatcherOutput::CommitWin {
                    bid_id,
                    agent,
                    amount,
                } => self.commit(bid_id, agent, amount),
                MatcherOutput::Unmatched(unmatched) => {
                    self.stats.unmatched_events.fetch_add(1, Ordering::Relaxed);
                    self.diagnostics.emit(
                        Diagnostic::new(
                            DiagnosticKind::Unmatched,
                            format!(
                                "unmatched event for bid id {} ({:?})",
                                unmatched.bid_id, unmatched.reason
                            ),
                        )
                        .with_payload(
                            serde_json::to_value(&unmatched).unwrap_or_default(),
                        ),
                    );
                }
            }
        }
    }

    fn commit(&mut self, bid_id: BidId, agent: String, amount: UsdCpm) {
        let deadline = Utc::now() + self.config.commit_ttl;
        if self
            .banker
            .commit_win(bid_id.clone(), agent.clone(), amount, deadline)
            .is_err()
        {
            // Treated as a transient fault: parked and retried on the tick.
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            self.diagnostics.emit(Diagnostic::new(
                DiagnosticKind::Overload,
                format!("banker queue full, parking commit for {}", bid_id),
            ));
            self.pending_commits.push_back(PendingCommit {
                bid_id,
                agent,
                amount,
                deadline,
            });
        }
    }

    fn retry_pending_commits(&mut self) {
        let now = Utc::now();
        while let Some(front) = self.pending_commits.front() {
            if front.deadline <= now {
                self.diagnostics.emit(Diagnostic::new(
                    DiagnosticKind::Transient,
                    format!("parked commit for {} expired unsent", front.bid_id),
                ));
                self.pending_commits.pop_front();
                continue;
            }
            let ok = self
                .banker
                .commit_win(
                    front.bid_id.clone(),
                    front.agent.clone(),
                    front.amount,
                    front.deadline,
                )
                .is_ok();
            if !ok {
                break;
            }
            self.pending_commits.pop_front();
        }
    }

    fn check_liveness(
        &self,
        winloss_rx: &PipeReceiver<RawWinLossEvent>,
        campaign_rx: &PipeReceiver<RawCampaignEvent>,
        winloss_alert: &mut Instant,
        campaign_alert: &mut Instant,
    ) {
        let winloss_timeout = self.config.winloss_pipe_timeout;
        if winloss_rx.stalled(winloss_timeout) && winloss_alert.elapsed() >= winloss_timeout {
            *winloss_alert = Instant::now();
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            self.diagnostics.emit(Diagnostic::new(
                DiagnosticKind::Liveness,
                format!(
                    "no traffic on {} pipe for {:?}",
                    winloss_rx.name(),
                    winloss_rx.idle_for()
                ),
            ));
        }

        let campaign_timeout = self.config.campaign_pipe_timeout;
        if campaign_rx.stalled(campaign_timeout) && campaign_alert.elapsed() >= campaign_timeout {
            *campaign_alert = Instant::now();
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            self.diagnostics.emit(Diagnostic::new(
                DiagnosticKind::Liveness,
                format!(
                    "no traffic on {} pipe for {:?}",
                    campaign_rx.name(),
                    campaign_rx.idle_for()
                ),
            ));
        }
    }

    /// Bounded drain of whatever is still queued, then release buckets.
    async fn drain(
        mut self,
        mut auctions_rx: PipeReceiver<SubmittedAuction>,
        mut winloss_rx: PipeReceiver<RawWinLossEvent>,
        mut campaign_rx: PipeReceiver<RawCampaignEvent>,
    ) {
        auctions_rx.close();
        winloss_rx.close();
        campaign_rx.close();

        let deadline = Instant::now() + self.config.shutdown_drain;

        while let Ok(Some(auction)) = timeout_at(deadline, auctions_rx.recv()).await {
            self.on_auction(auction);
        }
        while let Ok(Some(event)) = timeout_at(deadline, winloss_rx.recv()).await {
            self.on_win_loss(event);
        }
        while let Ok(Some(event)) = timeout_at(deadline, campaign_rx.recv()).await {
            self.on_campaign_event(event);
        }

        self.retry_pending_commits();
        let pending = self.matcher.pending();
        if pending > 0 {
            debug!(pending, "releasing pending buckets at shutdown");
        }
    }
}
