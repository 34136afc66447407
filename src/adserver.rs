//! Outbound delivery of matched wins and campaign events to the ad server.
//!
//! Two plain HTTP POST endpoints, one per event class. Only wins and
//! campaign events are delivered; losses stay internal.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::AdServerEndpoint;
use crate::models::{MatchedCampaignEvent, MatchedWin};

fn epoch_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1e6
}

/// Win notification body.
pub fn win_body(win: &MatchedWin) -> Value {
    json!({
        "timestamp": epoch_seconds(win.timestamp),
        "bidRequestId": win.bid_id.as_str(),
        "impid": win.imp_id,
        "userIds": win.user_ids.to_json(),
        // Micro-CPM carried as a plain double.
        "price": win.win_price.micros() as f64,
    })
}

/// Campaign event notification body.
pub fn campaign_event_body(event: &MatchedCampaignEvent) -> Value {
    json!({
        "timestamp": epoch_seconds(event.timestamp),
        "bidRequestId": event.bid_id.as_str(),
        "impid": event.imp_id,
        "type": event.label.as_str(),
    })
}

/// HTTP client for the ad server's win and event ports.
#[derive(Clone)]
pub struct AdServerClient {
    client: Client,
    win_url: String,
    event_url: String,
}

impl AdServerClient {
    pub fn new(endpoint: &AdServerEndpoint) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("Failed to build ad server client")?;

        Ok(Self {
            client,
            win_url: endpoint.win_url(),
            event_url: endpoint.event_url(),
        })
    }

    pub async fn send_win(&self, win: &MatchedWin) -> Result<()> {
        let response = self
            .client
            .post(&self.win_url)
            .json(&win_body(win))
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.win_url))?;

        if !response.status().is_success() {
            anyhow::bail!("ad server win port returned {}", response.status());
        }
        Ok(())
    }

    pub async fn send_campaign_event(&self, event: &MatchedCampaignEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.event_url)
            .json(&campaign_event_body(event))
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.event_url))?;

        if !response.status().is_success() {
            anyhow::bail!("ad server event port returned {}", response.status());
        }
        Ok(())
    }
}
