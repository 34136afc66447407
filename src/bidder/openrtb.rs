//! OpenRTB 2.1 request/response subset.
//!
//! Only the fields the bidder interface reads or writes are typed; everything
//! else rides along in the `ext` maps so a request survives a
//! serialize/parse round trip unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level OpenRTB 2.1 bid request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BidRequest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imp: Vec<Impression>,
    /// Maximum time in ms the exchange allows for bids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmax: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cur: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub ext: Map<String, Value>,
}

/// One ad slot within a bid request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Impression {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<Banner>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bidfloor: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub ext: Map<String, Value>,
}

impl Impression {
    /// Append an eligible agent external id to `ext["external-ids"]`.
    pub fn tag_external_id(&mut self, external_id: u64) {
        let ids = self
            .ext
            .entry("external-ids".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(arr) = ids {
            arr.push(Value::from(external_id));
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Banner {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<u32>,
}

/// Top-level OpenRTB 2.1 bid response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BidResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seatbid: Vec<SeatBid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cur: Option<String>,
}

/// One bidder's grouping of bids within a response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeatBid {
    #[serde(default)]
    pub bid: Vec<Bid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seat: Option<String>,
}

/// One bid within a seatbid.
///
/// `ext` must carry `external-id` (u64) and `priority` (double); both are
/// validated by the interface before the bid is accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub impid: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crid: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub ext: Map<String, Value>,
}

impl Bid {
    pub fn ext_external_id(&self) -> Option<u64> {
        self.ext.get("external-id").and_then(Value::as_u64)
    }

    pub fn ext_priority(&self) -> Option<f64> {
        self.ext.get("priority").and_then(Value::as_f64)
    }
}
