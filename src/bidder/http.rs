//! HTTP bidder interface (OpenRTB 2.1).
//!
//! Outbound: tag the auction's bid request with eligible agent external ids,
//! budget it with `tmax`, POST it to the configured endpoint. Inbound: parse
//! the bid response, validate each bid, pad every agent's vector to the
//! impression count and re-inject through the SPSC queue so the router's
//! in-flight tracking terminates for every agent, bid or no-bid.
//!
//! A malformed bid never aborts the response: it is escalated as a protocol
//! diagnostic and skipped, and the remaining bids still flow.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::debug;

use crate::adserver::AdServerClient;
use crate::bidder::injection::{Bid, BidInjection, BidInjector};
use crate::bidder::openrtb::{BidRequest, BidResponse};
use crate::bidder::{find_agent_by_external_id, BidderInterface, BidderSet, OutboundAuction};
use crate::models::{
    BidId, Diagnostic, DiagnosticKind, MatchedCampaignEvent, MatchedWin, UsdCpm,
};
use crate::pipes::Diagnostics;

const OPENRTB_VERSION_HEADER: &str = "x-openrtb-version";
const OPENRTB_VERSION: &str = "2.1";

pub struct HttpBidderInterface {
    client: Client,
    endpoint: String,
    adserver: AdServerClient,
    injector: BidInjector,
    diagnostics: Diagnostics,
}

impl HttpBidderInterface {
    pub fn new(
        endpoint: String,
        adserver: AdServerClient,
        injector: BidInjector,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("Failed to build bidder HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            adserver,
            injector,
            diagnostics,
        })
    }

    fn inject(injector: &BidInjector, diagnostics: &Diagnostics, submissions: Vec<BidInjection>) {
        for submission in submissions {
            if let Err(overload) = injector.try_inject(submission) {
                diagnostics.emit(Diagnostic::new(
                    DiagnosticKind::Overload,
                    overload.to_string(),
                ));
            }
        }
    }
}

/// Tag the request for the eligible bidders and budget it with `tmax`.
///
/// Returns `None` when the auction already expired; no outbound call is made
/// and the router's own expiry reclaims the in-flight state.
pub fn prepare_request(
    auction: &OutboundAuction,
    bidders: &BidderSet,
    now: DateTime<Utc>,
    diagnostics: &Diagnostics,
) -> Option<BidRequest> {
    let mut request = auction.request.clone();

    for (agent, info) in bidders {
        for &index in &info.imp_indices {
            match request.imp.get_mut(index) {
                Some(imp) => imp.tag_external_id(info.config.external_id),
                None => diagnostics.emit(Diagnostic::new(
                    DiagnosticKind::Protocol,
                    format!(
                        "impression index {} out of range for agent {} in auction {}",
                        index, agent, auction.id
                    ),
                )),
            }
        }
    }

    let remaining_ms = (auction.expiry - now).num_milliseconds();
    if remaining_ms <= 0 {
        return None;
    }
    request.tmax = Some(remaining_ms);
    Some(request)
}

/// Validate every bid in a response and group the survivors by agent.
pub fn collect_bids(
    response: &BidResponse,
    request: &BidRequest,
    bidders: &BidderSet,
    diagnostics: &Diagnostics,
) -> BTreeMap<String, Vec<Bid>> {
    let mut collected: BTreeMap<String, Vec<Bid>> = BTreeMap::new();

    let mut protocol_error = |message: String| {
        diagnostics.emit(Diagnostic::new(DiagnosticKind::Protocol, message));
    };

    for seatbid in &response.seatbid {
        for bid in &seatbid.bid {
            let Some(external_id) = bid.ext_external_id() else {
                protocol_error("missing external-id ext field in BidResponse".to_string());
                continue;
            };
            let Some(priority) = bid.ext_priority() else {
                protocol_error("missing priority ext field in BidResponse".to_string());
                continue;
            };
            let Some((agent, info)) = find_agent_by_external_id(bidders, external_id) else {
                protocol_error(format!("no config for external id {}", external_id));
                continue;
            };
            let Some(crid) = bid.crid.as_deref().and_then(|c| c.parse::<i64>().ok()) else {
                protocol_error(format!("malformed crid {:?}", bid.crid));
                continue;
            };
            let Some(creative_index) = info.config.creative_index(crid) else {
                protocol_error(format!("unknown creative id {} for agent {}", crid, agent));
                continue;
            };
            let Some(spot_index) = request.imp.iter().position(|imp| imp.id == bid.impid) else {
                protocol_error(format!("unknown impression id {:?}", bid.impid));
                continue;
            };

            collected.entry(agent.to_string()).or_default().push(Bid {
                creative_index: Some(creative_index),
                spot_index: Some(spot_index),
                price: UsdCpm::from_cpm(bid.price),
                priority,
            });
        }
    }

    collected
}

/// Build one injection per eligible agent, padding short vectors with
/// no-bids so the router sees exactly `imp_count` decisions per agent.
pub fn build_submissions(
    auction_id: &BidId,
    bidders: &BidderSet,
    mut collected: BTreeMap<String, Vec<Bid>>,
    imp_count: usize,
) -> Vec<BidInjection> {
    bidders
        .iter()
        .map(|(agent, info)| {
            let mut bids = collected.remove(agent).unwrap_or_default();
            while bids.len() < imp_count {
                bids.push(Bid::no_bid());
            }
            BidInjection {
                agent: agent.clone(),
                auction_id: auction_id.clone(),
                bids,
                win_cost_model: info.config.win_cost_model,
            }
        })
        .collect()
}

impl BidderInterface for HttpBidderInterface {
    fn send_auction_message(&self, auction: Arc<OutboundAuction>, bidders: Arc<BidderSet>) {
        let Some(request) = prepare_request(&auction, &bidders, Utc::now(), &self.diagnostics)
        else {
            debug!(auction = %auction.id, "auction expired before send, skipping");
            return;
        };

        let body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(e) => {
                self.diagnostics.emit(Diagnostic::new(
                    DiagnosticKind::Protocol,
                    format!("failed to serialize bid request: {}", e),
                ));
                return;
            }
        };

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let injector = self.injector.clone();
        let diagnostics = self.diagnostics.clone();
        let imp_count = request.imp.len();
        let auction_id = auction.id.clone();

        tokio::spawn(async move {
            let response = client
                .post(&endpoint)
                .header(CONTENT_TYPE, "application/json")
                .header(OPENRTB_VERSION_HEADER, OPENRTB_VERSION)
                .body(body)
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    // No injection: the router's own expiry cleans up.
                    diagnostics.emit(Diagnostic::new(
                        DiagnosticKind::Transient,
                        format!("error requesting {}: {}", endpoint, e),
                    ));
                    return;
                }
            };

            match response.status().as_u16() {
                // No-bid: still re-inject so the in-flight tracker expires.
                204 => {
                    let submissions =
                        build_submissions(&auction_id, &bidders, BTreeMap::new(), imp_count);
                    Self::inject(&injector, &diagnostics, submissions);
                }
                200 => {
                    let body = match response.text().await {
                        Ok(body) => body,
                        Err(e) => {
                            diagnostics.emit(Diagnostic::new(
                                DiagnosticKind::Transient,
                                format!("failed reading bidder response: {}", e),
                            ));
                            return;
                        }
                    };
                    let parsed: BidResponse = match serde_json::from_str(&body) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            diagnostics.emit(Diagnostic::new(
                                DiagnosticKind::Protocol,
                                format!("malformed BidResponse payload: {}", e),
                            ));
                            return;
                        }
                    };

                    let collected = collect_bids(&parsed, &request, &bidders, &diagnostics);
                    let submissions =
                        build_submissions(&auction_id, &bidders, collected, imp_count);
                    Self::inject(&injector, &diagnostics, submissions);
                }
                status => {
                    diagnostics.emit(Diagnostic::new(
                        DiagnosticKind::Protocol,
                        format!("unexpected bidder response status {}", status),
                    ));
                }
            }
        });
    }

    fn send_win_message(&self, win: &MatchedWin) {
        let adserver = self.adserver.clone();
        let diagnostics = self.diagnostics.clone();
        let win = win.clone();
        tokio::spawn(async move {
            if let Err(e) = adserver.send_win(&win).await {
                diagnostics.emit(Diagnostic::new(
                    DiagnosticKind::Transient,
                    format!("win delivery failed for {}: {}", win.bid_id, e),
                ));
            }
        });
    }

    fn send_campaign_event_message(&self, event: &MatchedCampaignEvent) {
        let adserver = self.adserver.clone();
        let diagnostics = self.diagnostics.clone();
        let event = event.clone();
        tokio::spawn(async move {
            if let Err(e) = adserver.send_campaign_event(&event).await {
                diagnostics.emit(Diagnostic::new(
                    DiagnosticKind::Transient,
                    format!("campaign event delivery failed for {}: {}", event.bid_id, e),
                ));
            }
        });
    }
}
