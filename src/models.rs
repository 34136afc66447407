//! Core data model for the post-auction loop.
//!
//! Everything that crosses a component boundary lives here: auction records,
//! raw exchange / ad-server events, matched results and the money types used
//! to account for them. Events are joined on [`BidId`]; the submitted auction
//! is authoritative for which agent bid what.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bidder::openrtb;

// =============================================================================
// IDENTIFIERS & MONEY
// =============================================================================

/// Opaque auction identifier assigned by the router at auction close.
///
/// Unique per auction and used as the join key across all three event streams.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BidId(pub String);

impl BidId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BidId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Fixed-point USD CPM amount in micro-units (1 CPM = 1_000_000).
///
/// Wire bodies carry plain doubles; all internal accounting stays integral so
/// that banker commits survive repeated serialization without drift.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct UsdCpm(pub i64);

pub const MICROS_PER_CPM: i64 = 1_000_000;

impl UsdCpm {
    pub const ZERO: UsdCpm = UsdCpm(0);

    /// Build from a CPM price expressed as a double (e.g. OpenRTB `bid.price`).
    #[inline]
    pub fn from_cpm(cpm: f64) -> Self {
        Self((cpm * MICROS_PER_CPM as f64).round() as i64)
    }

    #[inline]
    pub fn as_cpm(self) -> f64 {
        self.0 as f64 / MICROS_PER_CPM as f64
    }

    #[inline]
    pub fn micros(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn min(self, other: UsdCpm) -> UsdCpm {
        UsdCpm(self.0.min(other.0))
    }
}

impl fmt::Display for UsdCpm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}USD/1M", self.as_cpm())
    }
}

/// Per-agent policy mapping the submitted bid price and the exchange-reported
/// win price to the chargeable amount.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "kebab-case")]
pub enum WinCostModel {
    /// Charge the full submitted bid price.
    FirstPrice,
    /// Charge the reported clearing price, never more than the bid.
    SecondPrice,
    /// Charge the reported clearing price scaled by a ratio, capped at the bid.
    Ratio { ratio: f64 },
}

impl WinCostModel {
    /// Chargeable amount for a win.
    pub fn charge(&self, bid_price: UsdCpm, win_price: UsdCpm) -> UsdCpm {
        match *self {
            WinCostModel::FirstPrice => bid_price,
            WinCostModel::SecondPrice => win_price.min(bid_price),
            WinCostModel::Ratio { ratio } => {
                UsdCpm((win_price.0 as f64 * ratio).round() as i64).min(bid_price)
            }
        }
    }
}

impl Default for WinCostModel {
    fn default() -> Self {
        WinCostModel::SecondPrice
    }
}

// =============================================================================
// AGENTS & USER IDS
// =============================================================================

/// A creative registered by an agent, referenced by `crid` in bid responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creative {
    pub id: i64,
    pub width: u32,
    pub height: u32,
}

/// Immutable snapshot of an agent's configuration.
///
/// The matcher stamps matched wins with the snapshot captured at auction
/// close, never a later lookup, so campaign accounting stays consistent even
/// if the agent reconfigures mid-flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub account: String,
    pub external_id: u64,
    #[serde(default)]
    pub creatives: Vec<Creative>,
    #[serde(default)]
    pub win_cost_model: WinCostModel,
}

impl AgentConfig {
    /// Index of a creative by its public id, if this agent registered it.
    pub fn creative_index(&self, crid: i64) -> Option<usize> {
        self.creatives.iter().position(|c| c.id == crid)
    }
}

/// User identifiers attached to exchange events, keyed by id domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserIds(pub BTreeMap<String, String>);

impl UserIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, domain: impl Into<String>, id: impl Into<String>) {
        self.0.insert(domain.into(), id.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// =============================================================================
// SUBMITTED AUCTIONS
// =============================================================================

/// One bidder's standing in a submitted auction.
#[derive(Debug, Clone)]
pub struct BidderEntry {
    pub agent: String,
    /// Config snapshot at auction time.
    pub config: Arc<AgentConfig>,
    pub price: UsdCpm,
    pub creative_index: usize,
    pub win_cost_model: WinCostModel,
}

/// Winner reference disclosed inline by the exchange, when available.
#[derive(Debug, Clone)]
pub struct InlineWinner {
    pub agent: String,
    pub price: UsdCpm,
}

/// Immutable record of one auction as observed when the router closed it.
#[derive(Debug, Clone)]
pub struct SubmittedAuction {
    pub bid_id: BidId,
    pub imp_id: String,
    pub close_time: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    /// Bidders in submission order; the order is authoritative for ties.
    pub bidders: Vec<BidderEntry>,
    /// Original bid-request envelope, retained verbatim for downstream
    /// correlation and logging.
    pub request: openrtb::BidRequest,
    pub winner: Option<InlineWinner>,
}

impl SubmittedAuction {
    /// Resolve the winning bidder for a reported (impression, price) pair.
    ///
    /// The exchange's accounting is not trusted directly: the winner must be
    /// one of the submitted bidders. Ties resolve to the first submitted.
    pub fn resolve_winner(&self, imp_id: &str, price: UsdCpm) -> Option<&BidderEntry> {
        if imp_id != self.imp_id {
            return None;
        }
        self.bidders
            .iter()
            .find(|b| b.price == price)
            .or_else(|| match &self.winner {
                Some(w) => self.bidders.iter().find(|b| b.agent == w.agent),
                None => None,
            })
    }
}

// =============================================================================
// RAW EVENTS
// =============================================================================

/// Win or loss, as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WinLossType {
    Win,
    Loss,
}

/// Raw win/loss notification from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawWinLossEvent {
    #[serde(rename = "type")]
    pub kind: WinLossType,
    pub bid_id: BidId,
    pub imp_id: String,
    pub timestamp: DateTime<Utc>,
    /// Clearing price reported by the exchange, accepted verbatim.
    pub price: UsdCpm,
    #[serde(default)]
    pub user_ids: UserIds,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// Downstream campaign event label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CampaignLabel {
    Impression,
    Click,
    Conversion,
    Visit,
    Custom(String),
}

impl CampaignLabel {
    pub fn as_str(&self) -> &str {
        match self {
            CampaignLabel::Impression => "IMPRESSION",
            CampaignLabel::Click => "CLICK",
            CampaignLabel::Conversion => "CONVERSION",
            CampaignLabel::Visit => "VISIT",
            CampaignLabel::Custom(s) => s.as_str(),
        }
    }
}

impl From<&str> for CampaignLabel {
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "IMPRESSION" => CampaignLabel::Impression,
            "CLICK" => CampaignLabel::Click,
            "CONVERSION" => CampaignLabel::Conversion,
            "VISIT" => CampaignLabel::Visit,
            _ => CampaignLabel::Custom(s.to_string()),
        }
    }
}

impl fmt::Display for CampaignLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CampaignLabel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CampaignLabel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(CampaignLabel::from(s.as_str()))
    }
}

/// Raw campaign event from the ad server (impression, click, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCampaignEvent {
    pub bid_id: BidId,
    pub imp_id: String,
    pub timestamp: DateTime<Utc>,
    pub label: CampaignLabel,
    #[serde(default)]
    pub payload: serde_json::Value,
}

// =============================================================================
// MATCHED RESULTS
// =============================================================================

/// A win joined against its submitted auction.
#[derive(Debug, Clone)]
pub struct MatchedWin {
    pub bid_id: BidId,
    pub imp_id: String,
    pub agent: String,
    pub config: Arc<AgentConfig>,
    pub timestamp: DateTime<Utc>,
    pub win_price: UsdCpm,
    pub bid_price: UsdCpm,
    pub win_cost_model: WinCostModel,
    pub user_ids: UserIds,
}

/// A loss joined against its submitted auction (real or synthesized on the
/// winloss deadline).
#[derive(Debug, Clone)]
pub struct MatchedLoss {
    pub bid_id: BidId,
    pub imp_id: String,
    pub agent: String,
    pub config: Arc<AgentConfig>,
    pub timestamp: DateTime<Utc>,
    pub user_ids: UserIds,
}

/// A campaign event joined against its submitted auction.
#[derive(Debug, Clone)]
pub struct MatchedCampaignEvent {
    pub bid_id: BidId,
    pub imp_id: String,
    pub agent: String,
    pub label: CampaignLabel,
    pub timestamp: DateTime<Utc>,
    pub user_ids: UserIds,
}

/// Output of the event matcher on the egress port.
#[derive(Debug, Clone)]
pub enum MatchedResult {
    Win(MatchedWin),
    Loss(MatchedLoss),
    CampaignEvent(MatchedCampaignEvent),
}

impl MatchedResult {
    pub fn bid_id(&self) -> &BidId {
        match self {
            MatchedResult::Win(w) => &w.bid_id,
            MatchedResult::Loss(l) => &l.bid_id,
            MatchedResult::CampaignEvent(e) => &e.bid_id,
        }
    }
}

// =============================================================================
// DIAGNOSTICS
// =============================================================================

/// Why an event could not be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    /// No submitted auction arrived within the auction deadline.
    NoAuction,
    /// A win arrived after the bucket was already resolved or removed.
    LateWin,
    /// A campaign event arrived after bucket removal.
    LateCampaign,
    /// A second win for a bid id that already produced a matched win.
    DuplicateWin,
    /// A win whose (impression, price) pair matches no submitted bidder.
    UnknownWinner,
    /// A campaign event gated out by the require-win policy.
    RequiresWin,
}

/// An event reported on the diagnostics stream together with its raw payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmatchedEvent {
    pub reason: UnmatchedReason,
    pub bid_id: BidId,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Classification of a per-event diagnostic. None of these are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Malformed upstream payload (missing ext fields, unknown ids).
    Protocol,
    /// Transport fault that will be retried.
    Transient,
    /// A bounded queue rejected work.
    Overload,
    /// An ingress pipe has been silent past its timeout.
    Liveness,
    /// An event that could not be joined to an auction.
    Unmatched,
}

/// One entry on the `trace` diagnostics channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            message: message.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
