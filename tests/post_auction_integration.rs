//! End-to-end scenarios for the post-auction loop.
//!
//! Drives the matcher and the bidder interface through the library API with
//! explicit timestamps, covering the full lifecycle: happy-path wins, late
//! wins, early campaign events, orphan events, no-bid padding and malformed
//! bid handling.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use postauction_backend::bidder::http::{build_submissions, collect_bids, prepare_request};
use postauction_backend::bidder::openrtb::{BidRequest, BidResponse, Impression};
use postauction_backend::bidder::{Bid, BidInfo, BidderSet, OutboundAuction};
use postauction_backend::matcher::{EventMatcher, MatcherConfig, MatcherOutput};
use postauction_backend::models::{
    AgentConfig, BidId, BidderEntry, CampaignLabel, Creative, DiagnosticKind, MatchedResult,
    RawCampaignEvent, RawWinLossEvent, SubmittedAuction, UnmatchedReason, UsdCpm, UserIds,
    WinCostModel, WinLossType,
};
use postauction_backend::pipes::Diagnostics;

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn secs(s: f64) -> Duration {
    Duration::milliseconds((s * 1000.0) as i64)
}

fn matcher() -> EventMatcher {
    EventMatcher::new(MatcherConfig {
        auction_timeout: secs(1.0),
        win_timeout: secs(2.0),
        settled_grace: None,
        campaign_events_require_win: false,
    })
}

fn agent_config(name: &str, external_id: u64, creatives: Vec<i64>) -> Arc<AgentConfig> {
    Arc::new(AgentConfig {
        account: name.to_string(),
        external_id,
        creatives: creatives
            .into_iter()
            .map(|id| Creative {
                id,
                width: 300,
                height: 250,
            })
            .collect(),
        win_cost_model: WinCostModel::SecondPrice,
    })
}

fn submitted(bid_id: &str, agent: &str, cpm: f64) -> SubmittedAuction {
    SubmittedAuction {
        bid_id: BidId::from(bid_id),
        imp_id: "i0".into(),
        close_time: t0(),
        expiry: t0() + secs(0.1),
        bidders: vec![BidderEntry {
            agent: agent.to_string(),
            config: agent_config(agent, 1, vec![]),
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

fn campaign(bid_id: &str, label: &str, at: DateTime<Utc>) -> RawCampaignEvent {
    RawCampaignEvent {
        bid_id: BidId::from(bid_id),
        imp_id: "i0".into(),
        timestamp: at,
        label: CampaignLabel::from(label),
        payload: serde_json::Value::Null,
    }
}

fn matched_wins(outputs: &[MatcherOutput]) -> Vec<&MatcherOutput> {
    outputs
        .iter()
        .filter(|o| matches!(o, MatcherOutput::Matched(MatchedResult::Win(_))))
        .collect()
}

#[test]
fn scenario_happy_path_win() {
    let mut matcher = matcher();

    assert!(matcher.handle_auction(submitted("A", "x", 1.50), t0()).is_empty());
    let outputs = matcher.handle_win_loss(win("A", 1.50, t0() + secs(0.5)), t0() + secs(0.5));

    // Exactly one matched win with the right agent and price, plus the
    // banker commit of the chargeable amount.
    assert_eq!(matched_wins(&outputs).len(), 1);
    let MatcherOutput::Matched(MatchedResult::Win(matched)) = &outputs[0] else {
        unreachable!()
    };
    assert_eq!(matched.agent, "x");
    assert_eq!(matched.win_price, UsdCpm::from_cpm(1.50));

    let MatcherOutput::CommitWin { amount, agent, .. } = &outputs[1] else {
        panic!("expected a banker commit, got {:?}", outputs[1]);
    };
    assert_eq!(agent, "x");
    assert_eq!(*amount, UsdCpm::from_cpm(1.50));
}

#[test]
fn scenario_late_win_becomes_unmatched() {
    let mut matcher = matcher();
    matcher.handle_auction(submitted("A", "x", 1.50), t0());

    // The winloss deadline (2s) elapses first: exactly one synthetic loss.
    let outputs = matcher.advance_timers_to(t0() + secs(2.0));
    let losses: Vec<_> = outputs
        .iter()
        .filter(|o| matches!(o, MatcherOutput::Matched(MatchedResult::Loss(_))))
        .collect();
    assert_eq!(losses.len(), 1);

    // The win shows up at 2.5s: logged unmatched, no duplicate matched win.
    let outputs = matcher.handle_win_loss(win("A", 1.50, t0() + secs(2.5)), t0() + secs(2.5));
    assert!(matched_wins(&outputs).is_empty());
    assert!(matches!(
        &outputs[0],
        MatcherOutput::Unmatched(u) if u.reason == UnmatchedReason::DuplicateWin
    ));
}

#[test]
fn scenario_early_impression_event_ordered_after_win() {
    let mut matcher = matcher();

    matcher.handle_campaign_event(campaign("A", "IMPRESSION", t0()), t0());
    matcher.handle_auction(submitted("A", "x", 1.50), t0() + secs(0.3));
    let outputs = matcher.handle_win_loss(win("A", 1.50, t0() + secs(0.5)), t0() + secs(0.5));

    // MatchedWin first, MatchedCampaignEvent after, per causal ordering.
    let kinds: Vec<&str> = outputs
        .iter()
        .filter_map(|o| match o {
            MatcherOutput::Matched(MatchedResult::Win(_)) => Some("win"),
            MatcherOutput::Matched(MatchedResult::CampaignEvent(_)) => Some("event"),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec!["win", "event"]);
}

#[test]
fn scenario_orphan_event_reported_once() {
    let mut matcher = matcher();

    matcher.handle_campaign_event(campaign("B", "CLICK", t0()), t0());

    let outputs = matcher.advance_timers_to(t0() + secs(1.0));
    let unmatched: Vec<_> = outputs
        .iter()
        .filter(|o| {
            matches!(o, MatcherOutput::Unmatched(u)
                if u.reason == UnmatchedReason::NoAuction && u.bid_id.as_str() == "B")
        })
        .collect();
    assert_eq!(unmatched.len(), 1);
    assert_eq!(matcher.pending(), 0);

    // Nothing fires again later.
    assert!(matcher.advance_timers_to(t0() + secs(10.0)).is_empty());
}

#[test]
fn scenario_bidder_no_bid_pads_every_agent() {
    // Three eligible agents, four impressions, HTTP 204 from the bidder:
    // each agent gets exactly four no-bids injected.
    let mut bidders = BidderSet::new();
    for id in [1u64, 2, 3] {
        bidders.insert(
            format!("agent-{id}"),
            BidInfo {
                config: agent_config(&format!("agent-{id}"), id, vec![]),
                imp_indices: vec![0, 1, 2, 3],
            },
        );
    }

    let submissions = build_submissions(&BidId::from("A"), &bidders, BTreeMap::new(), 4);

    assert_eq!(submissions.len(), 3);
    for submission in &submissions {
        assert_eq!(submission.bids.len(), 4);
        assert!(submission.bids.iter().all(Bid::is_no_bid));
    }
}

#[test]
fn scenario_malformed_bid_skipped_rest_injected() {
    let diagnostics = Diagnostics::new(32);
    let mut trace = diagnostics.subscribe();

    let auction = OutboundAuction {
        id: BidId::from("A"),
        request: BidRequest {
            id: "req".into(),
            imp: (0..2)
                .map(|i| Impression {
                    id: i.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        },
        expiry: t0() + secs(0.1),
    };

    let mut bidders = BidderSet::new();
    bidders.insert(
        "a".into(),
        BidInfo {
            config: agent_config("a", 7, vec![9000]),
            imp_indices: vec![0, 1],
        },
    );
    bidders.insert(
        "b".into(),
        BidInfo {
            config: agent_config("b", 8, vec![9001]),
            imp_indices: vec![0, 1],
        },
    );

    let request = prepare_request(&auction, &bidders, t0(), &diagnostics).unwrap();
    assert_eq!(request.tmax, Some(100));

    // One bid missing ext.priority, one valid.
    let response: BidResponse = serde_json::from_str(
        r#"{
            "seatbid": [{ "bid": [
                { "impid": "0", "price": 1.0, "crid": "9000",
                  "ext": { "external-id": 7 } },
                { "impid": "1", "price": 2.0, "crid": "9001",
                  "ext": { "external-id": 8, "priority": 1.5 } }
            ]}]
        }"#,
    )
    .unwrap();

    let collected = collect_bids(&response, &request, &bidders, &diagnostics);
    let submissions = build_submissions(&auction.id, &bidders, collected, 2);

    // Protocol diagnostic for the malformed bid.
    let diag = trace.try_recv().unwrap();
    assert_eq!(diag.kind, DiagnosticKind::Protocol);

    // Agent "b" keeps its valid bid; agent "a" is padded to two no-bids.
    let a = submissions.iter().find(|s| s.agent == "a").unwrap();
    assert!(a.bids.iter().all(Bid::is_no_bid));
    assert_eq!(a.bids.len(), 2);

    let b = submissions.iter().find(|s| s.agent == "b").unwrap();
    assert_eq!(b.bids.len(), 2);
    let real: Vec<_> = b.bids.iter().filter(|bid| !bid.is_no_bid()).collect();
    assert_eq!(real.len(), 1);
    assert_eq!(real[0].spot_index, Some(1));
    assert_eq!(real[0].price, UsdCpm::from_cpm(2.0));
}

#[test]
fn campaign_event_for_lost_auction_still_matches() {
    let mut matcher = matcher();
    matcher.handle_auction(submitted("A", "x", 1.0), t0());

    let loss = RawWinLossEvent {
        kind: WinLossType::Loss,
        ..win("A", 1.0, t0() + secs(0.2))
    };
    matcher.handle_win_loss(loss, t0() + secs(0.2));

    let outputs =
        matcher.handle_campaign_event(campaign("A", "VISIT", t0() + secs(0.4)), t0() + secs(0.4));
    assert!(matches!(
        &outputs[0],
        MatcherOutput::Matched(MatchedResult::CampaignEvent(e))
            if e.label == CampaignLabel::Visit
    ));
}

#[test]
fn bucket_memory_is_reclaimed_within_bounds() {
    let mut matcher = matcher();

    for i in 0..100 {
        matcher.handle_auction(submitted(&format!("A{i}"), "x", 1.0), t0());
    }
    for i in 0..50 {
        matcher.handle_win_loss(win(&format!("A{i}"), 1.0, t0() + secs(0.1)), t0() + secs(0.1));
    }
    assert_eq!(matcher.pending(), 100);

    // Winloss deadlines fire by t+2s (synthetic losses for the unresolved
    // half), and every grace interval has ended by t+4s.
    matcher.advance_timers_to(t0() + secs(2.0));
    matcher.advance_timers_to(t0() + secs(4.0));
    assert_eq!(matcher.pending(), 0);
}
