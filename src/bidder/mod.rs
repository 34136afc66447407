//! Bidder interfaces: the bridge between the router and external bidders.
//!
//! The router drives [`BidderInterface::send_auction_message`] for outbound
//! bid opportunities; the event matcher drives the win / campaign-event
//! sends. Implementations are registered under a short tag (`"http"`) and
//! resolved from the bidder configuration file at startup.

pub mod http;
pub mod injection;
pub mod openrtb;

pub use http::HttpBidderInterface;
pub use injection::{injection_channel, Bid, BidInjection, BidInjector, InjectionPort};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::adserver::AdServerClient;
use crate::config::BidderInterfaceConfig;
use crate::models::{AgentConfig, BidId, MatchedCampaignEvent, MatchedWin};
use crate::pipes::Diagnostics;

/// An auction the router hands off for outbound bidding.
#[derive(Debug, Clone)]
pub struct OutboundAuction {
    pub id: BidId,
    /// Original bid-request envelope; the interface only tags and times it.
    pub request: openrtb::BidRequest,
    pub expiry: DateTime<Utc>,
}

/// One eligible bidder for an outbound auction.
#[derive(Debug, Clone)]
pub struct BidInfo {
    pub config: Arc<AgentConfig>,
    /// Impression indices this agent is allowed to bid on.
    pub imp_indices: Vec<usize>,
}

/// Eligible bidders keyed by agent name (ordered for determinism).
pub type BidderSet = BTreeMap<String, BidInfo>;

/// The capability set every bidder interface implements.
///
/// Sends are fire-and-forget from the caller's thread: implementations do
/// their I/O on their own tasks and report failures on the diagnostics
/// stream. The messages with empty default bodies are deliberate no-ops.
pub trait BidderInterface: Send + Sync {
    /// Forward an auction to the external bidder and eventually re-inject
    /// one bid vector per eligible agent into the router.
    fn send_auction_message(&self, auction: Arc<OutboundAuction>, bidders: Arc<BidderSet>);

    /// Notify the ad server of a matched win.
    fn send_win_message(&self, win: &MatchedWin);

    /// Notify the ad server of a matched campaign event.
    fn send_campaign_event_message(&self, event: &MatchedCampaignEvent);

    fn send_loss_message(&self, _agent: &str, _bid_id: &BidId) {}
    fn send_bid_lost_message(&self, _agent: &str, _bid_id: &BidId) {}
    fn send_bid_dropped_message(&self, _agent: &str, _bid_id: &BidId) {}
    fn send_bid_invalid_message(&self, _agent: &str, _reason: &str, _bid_id: &BidId) {}
    fn send_no_budget_message(&self, _agent: &str, _bid_id: &BidId) {}
    fn send_too_late_message(&self, _agent: &str, _bid_id: &BidId) {}
    fn send_error_message(&self, _agent: &str, _error: &str) {}
}

/// Everything a factory needs besides the parsed configuration.
#[derive(Clone)]
pub struct BidderContext {
    pub injector: BidInjector,
    pub diagnostics: Diagnostics,
}

type Factory =
    fn(&BidderInterfaceConfig, &BidderContext) -> Result<Arc<dyn BidderInterface>>;

fn registry() -> &'static RwLock<HashMap<&'static str, Factory>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, Factory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut factories: HashMap<&'static str, Factory> = HashMap::new();
        factories.insert("http", |config, context| {
            let adserver = AdServerClient::new(&config.adserver)?;
            Ok(Arc::new(HttpBidderInterface::new(
                config.bidder.url(),
                adserver,
                context.injector.clone(),
                context.diagnostics.clone(),
            )?))
        });
        RwLock::new(factories)
    })
}

/// Register an interface factory under a short tag.
pub fn register_factory(tag: &'static str, factory: Factory) {
    registry().write().insert(tag, factory);
}

/// Resolve the configured interface tag. Unknown tags are a configuration
/// error and fatal at startup.
pub fn create(
    config: &BidderInterfaceConfig,
    context: &BidderContext,
) -> Result<Arc<dyn BidderInterface>> {
    let factories = registry().read();
    let Some(factory) = factories.get(config.interface.as_str()) else {
        bail!("unknown bidder interface type: {:?}", config.interface);
    };
    factory(config, context)
}

/// Find an agent by its OpenRTB external id within the current bidder set.
pub fn find_agent_by_external_id<'a>(
    bidders: &'a BidderSet,
    external_id: u64,
) -> Option<(&'a str, &'a BidInfo)> {
    bidders
        .iter()
        .find(|(_, info)| info.config.external_id == external_id)
        .map(|(name, info)| (name.as_str(), info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WinCostModel;

    fn agent(external_id: u64) -> BidInfo {
        BidInfo {
            config: Arc::new(AgentConfig {
                account: format!("agent-{external_id}"),
                external_id,
                creatives: vec![],
                win_cost_model: WinCostModel::SecondPrice,
            }),
            imp_indices: vec![0],
        }
    }

    #[test]
    fn test_find_agent_by_external_id() {
        let mut bidders = BidderSet::new();
        bidders.insert("a".into(), agent(7));
        bidders.insert("b".into(), agent(21));

        let (name, info) = find_agent_by_external_id(&bidders, 21).unwrap();
        assert_eq!(name, "b");
        assert_eq!(info.config.external_id, 21);
        assert!(find_agent_by_external_id(&bidders, 99).is_none());
    }

    #[tokio::test]
    async fn test_unknown_interface_tag_is_fatal() {
        let config: BidderInterfaceConfig = serde_json::from_str(
            r#"{
                "type": "zmq",
                "bidder": { "host": "h", "port": 1, "path": "/p" },
                "adserver": { "host": "h", "winPort": 1, "eventPort": 2 }
            }"#,
        )
        .unwrap();
        let (injector, _port) = injection_channel(4);
        let context = BidderContext {
            injector,
            diagnostics: Diagnostics::new(4),
        };

        assert!(create(&config, &context).is_err());
    }

    #[tokio::test]
    async fn test_http_factory_registered_by_default() {
        let config: BidderInterfaceConfig = serde_json::from_str(
            r#"{
                "type": "http",
                "bidder": { "host": "127.0.0.1", "port": 12339, "path": "/auctions" },
                "adserver": { "host": "127.0.0.1", "winPort": 12340, "eventPort": 12341 }
            }"#,
        )
        .unwrap();
        let (injector, _port) = injection_channel(4);
        let context = BidderContext {
            injector,
            diagnostics: Diagnostics::new(4),
        };

        assert!(create(&config, &context).is_ok());
    }
}
