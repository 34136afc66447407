//! Post Auction Runner
//!
//! Standalone entry point for one shard of the post-auction loop: loads the
//! bidder-interface configuration, wires the banker transport selected on
//! the command line, starts the matcher service and prints throughput stats
//! every ten seconds until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tracing::{debug, info};

use postauction_backend::banker::{
    layer::spawn_loopback_session, ApplicationLayer, BankerClient, BankerConfig, BusLayer,
    HttpLayer,
};
use postauction_backend::bidder::{self, injection_channel, BidderContext};
use postauction_backend::config::load_bidder_config;
use postauction_backend::matcher::{
    MatcherConfig, DEFAULT_AUCTION_TIMEOUT_SECS, DEFAULT_WIN_TIMEOUT_SECS,
};
use postauction_backend::pipes::{matched_results, Diagnostics};
use postauction_backend::service::{
    PostAuctionService, ServiceConfig, StatsSnapshot, DEFAULT_CAMPAIGN_PIPE_TIMEOUT_SECS,
    DEFAULT_WINLOSS_PIPE_TIMEOUT_SECS,
};

const REPORT_INTERVAL_SECS: u64 = 10;

#[derive(Parser, Debug)]
#[command(name = "post_auction_runner")]
#[command(about = "Post-auction event matching loop")]
struct Args {
    /// Shard index starting at 0 for this post auction loop
    #[arg(short = 's', long, default_value_t = 0)]
    shard: usize,

    /// Total number of post auction shards
    #[arg(long = "shard-count", default_value_t = 1)]
    shard_count: usize,

    /// Configuration file with bidder interface data
    #[arg(short = 'b', long, default_value = "bidder-config.json")]
    bidder: PathBuf,

    /// Communicate with the master banker over HTTP
    #[arg(long = "use-http-banker")]
    use_http_banker: bool,

    /// Base URI of the master banker (required with --use-http-banker)
    #[arg(long = "banker-uri")]
    banker_uri: Option<String>,

    /// Timeout for storing win auction
    #[arg(long = "win-seconds", default_value_t = DEFAULT_WIN_TIMEOUT_SECS as f64)]
    win_seconds: f64,

    /// Timeout to get late win auction
    #[arg(long = "auction-seconds", default_value_t = DEFAULT_AUCTION_TIMEOUT_SECS as f64)]
    auction_seconds: f64,

    /// Timeout before sending error on WinLoss pipe
    #[arg(long = "winlossPipe-seconds", default_value_t = DEFAULT_WINLOSS_PIPE_TIMEOUT_SECS)]
    winloss_pipe_seconds: u64,

    /// Timeout before sending error on CampaignEvent pipe
    #[arg(long = "campaignEventPipe-seconds", default_value_t = DEFAULT_CAMPAIGN_PIPE_TIMEOUT_SECS)]
    campaign_event_pipe_seconds: u64,
}

fn parse_args() -> Args {
    match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.kind() == ErrorKind::DisplayHelp => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    }
}

fn seconds(value: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((value * 1000.0) as i64)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "post_auction_runner=info,postauction_backend=info".into()),
        )
        .init();

    let args = parse_args();

    // An invalid bidder configuration is fatal.
    let bidder_config =
        load_bidder_config(&args.bidder).context("bidder configuration file is invalid")?;

    info!("win timeout is {}s", args.win_seconds);
    info!("auction timeout is {}s", args.auction_seconds);
    info!("winLoss pipe timeout is {}s", args.winloss_pipe_seconds);
    info!(
        "campaignEvent pipe timeout is {}s",
        args.campaign_event_pipe_seconds
    );

    let diagnostics = Diagnostics::new(1024);

    let layer = if args.use_http_banker {
        let uri = args
            .banker_uri
            .clone()
            .context("--banker-uri must be set with --use-http-banker")?;
        info!("using http interface for the master banker");
        ApplicationLayer::Http(HttpLayer::new(uri)?)
    } else {
        info!("using bus interface for the master banker");
        ApplicationLayer::Bus(BusLayer::new(spawn_loopback_session(1024)))
    };
    let (banker, banker_handle) =
        BankerClient::spawn(BankerConfig::default(), layer, diagnostics.clone());

    // The router side of the injection queue. Running standalone, a drain
    // task stands in for the router's main loop wakeup.
    let (injector, injection_port) = injection_channel(4096);
    tokio::spawn(async move {
        loop {
            injection_port.wait().await;
            for injection in injection_port.drain() {
                debug!(
                    agent = %injection.agent,
                    auction = %injection.auction_id,
                    bids = injection.bids.len(),
                    "bids re-injected"
                );
            }
        }
    });

    let context = BidderContext {
        injector,
        diagnostics: diagnostics.clone(),
    };
    let bidder_interface = bidder::create(&bidder_config, &context)
        .context("failed to initialize bidder interface")?;

    // Egress: matched results stream to external persistence.
    let (matched_tx, mut matched_rx) = matched_results();
    tokio::spawn(async move {
        while let Some(result) = matched_rx.recv().await {
            debug!(bid_id = %result.bid_id(), "matched result");
        }
    });

    let service_config = ServiceConfig {
        shard: args.shard,
        shard_count: args.shard_count,
        matcher: MatcherConfig {
            auction_timeout: seconds(args.auction_seconds),
            win_timeout: seconds(args.win_seconds),
            settled_grace: None,
            campaign_events_require_win: false,
        },
        winloss_pipe_timeout: Duration::from_secs(args.winloss_pipe_seconds),
        campaign_pipe_timeout: Duration::from_secs(args.campaign_event_pipe_seconds),
        ..Default::default()
    };
    let service = PostAuctionService::spawn(
        service_config,
        Arc::clone(&bidder_interface),
        banker,
        banker_handle,
        diagnostics,
        matched_tx,
    );

    info!(shard = args.shard, "post auction loop up");

    let stats = service.stats();
    let mut last = stats.snapshot();
    let mut report_timer = tokio::time::interval(Duration::from_secs(REPORT_INTERVAL_SECS));
    report_timer.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report_timer.tick() => {
                let current = stats.snapshot();
                report(&current, &last, REPORT_INTERVAL_SECS as f64);
                last = current;
            }
        }
    }

    info!("shutting down");
    service.shutdown().await;
    Ok(())
}

fn report(current: &StatsSnapshot, last: &StatsSnapshot, delta_secs: f64) {
    let diff = current.delta(last);
    info!(
        "\n{:>10.1} bids/sec\n{:>10.1} events/sec\n{:>10.1} wins/sec\n{:>10.1} loss/sec\n{:>10} unmatched\n{:>10} errors",
        diff.auctions as f64 / delta_secs,
        diff.events as f64 / delta_secs,
        diff.matched_wins as f64 / delta_secs,
        diff.matched_losses as f64 / delta_secs,
        current.unmatched_events,
        current.errors,
    );
}
