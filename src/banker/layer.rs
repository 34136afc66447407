//! Pluggable application layers for talking to the master banker.
//!
//! Both transports expose the same commit contract; which one runs is a
//! single boolean at startup (`--use-http-banker`). Commits are idempotent
//! on the banker side, keyed by (bid id, account), so retries are safe.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::models::BidId;

/// Reply deadline for a single bus request.
const BUS_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// One spend commit, as sent over either transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub bid_id: BidId,
    pub account: String,
    /// Chargeable amount in micro-USD-CPM.
    pub amount: i64,
    pub timestamp: DateTime<Utc>,
}

/// Transport outcome for a single commit attempt.
#[derive(Debug)]
pub enum LayerError {
    /// Worth retrying with backoff (timeouts, 5xx, broken sessions).
    Transient(String),
    /// Escalated to diagnostics and dropped (4xx, rejected commits).
    Permanent(String),
}

impl fmt::Display for LayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerError::Transient(msg) => write!(f, "transient banker failure: {}", msg),
            LayerError::Permanent(msg) => write!(f, "permanent banker failure: {}", msg),
        }
    }
}

impl std::error::Error for LayerError {}

/// HTTP request/reply layer against the master banker's REST surface.
pub struct HttpLayer {
    client: Client,
    base_url: String,
}

impl HttpLayer {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("Failed to build banker HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn commit(&self, request: &CommitRequest) -> Result<(), LayerError> {
        let url = format!("{}/v1/accounts/{}/commit", self.base_url, request.account);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| LayerError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(LayerError::Permanent(format!("{} {}", status, body)))
        } else {
            Err(LayerError::Transient(format!("{} {}", status, body)))
        }
    }
}

/// One in-flight request on the message bus session.
#[derive(Debug)]
pub struct BusCommit {
    pub request: CommitRequest,
    pub reply: oneshot::Sender<Result<(), String>>,
}

/// Message-bus layer: request/reply over a session owned by an external
/// bus connector. The connection itself is not this crate's concern.
pub struct BusLayer {
    session: mpsc::Sender<BusCommit>,
}

impl BusLayer {
    pub fn new(session: mpsc::Sender<BusCommit>) -> Self {
        Self { session }
    }

    async fn commit(&self, request: &CommitRequest) -> Result<(), LayerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.session
            .send(BusCommit {
                request: request.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| LayerError::Transient("bus session closed".to_string()))?;

        match tokio::time::timeout(BUS_REPLY_TIMEOUT, reply_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(msg))) => Err(LayerError::Permanent(msg)),
            Ok(Err(_)) => Err(LayerError::Transient("bus reply dropped".to_string())),
            Err(_) => Err(LayerError::Transient("bus reply timed out".to_string())),
        }
    }
}

/// The transport actually selected at startup.
pub enum ApplicationLayer {
    Http(HttpLayer),
    Bus(BusLayer),
}

impl ApplicationLayer {
    pub async fn commit(&self, request: &CommitRequest) -> Result<(), LayerError> {
        match self {
            ApplicationLayer::Http(layer) => layer.commit(request).await,
            ApplicationLayer::Bus(layer) => layer.commit(request).await,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ApplicationLayer::Http(_) => "http",
            ApplicationLayer::Bus(_) => "bus",
        }
    }
}

/// Spawn a loopback bus session that acknowledges every commit and logs it.
///
/// Stand-in for deployments that have not attached a real bus connector;
/// embedders pass their own session sender to [`BusLayer::new`] instead.
pub fn spawn_loopback_session(capacity: usize) -> mpsc::Sender<BusCommit> {
    let (tx, mut rx) = mpsc::channel::<BusCommit>(capacity);
    tokio::spawn(async move {
        while let Some(commit) = rx.recv().await {
            tracing::info!(
                bid_id = %commit.request.bid_id,
                account = %commit.request.account,
                amount = commit.request.amount,
                "banker commit (loopback session)"
            );
            let _ = commit.reply.send(Ok(()));
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_layer_round_trip() {
        let (tx, mut rx) = mpsc::channel::<BusCommit>(4);
        let layer = ApplicationLayer::Bus(BusLayer::new(tx));

        let server = tokio::spawn(async move {
            let commit = rx.recv().await.unwrap();
            assert_eq!(commit.request.account, "agent-x");
            commit.reply.send(Ok(())).unwrap();
        });

        let request = CommitRequest {
            bid_id: BidId::from("a1"),
            account: "agent-x".into(),
            amount: 1_500_000,
            timestamp: Utc::now(),
        };
        layer.commit(&request).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_bus_layer_rejection_is_permanent() {
        let (tx, mut rx) = mpsc::channel::<BusCommit>(4);
        let layer = BusLayer::new(tx);

        tokio::spawn(async move {
            let commit = rx.recv().await.unwrap();
            commit.reply.send(Err("no such account".into())).unwrap();
        });

        let request = CommitRequest {
            bid_id: BidId::from("a1"),
            account: "nobody".into(),
            amount: 1,
            timestamp: Utc::now(),
        };
        match layer.commit(&request).await {
            Err(LayerError::Permanent(msg)) => assert!(msg.contains("no such account")),
            other => panic!("expected permanent failure, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_bus_layer_closed_session_is_transient() {
        let (tx, rx) = mpsc::channel::<BusCommit>(1);
        drop(rx);
        let layer = BusLayer::new(tx);

        let request = CommitRequest {
            bid_id: BidId::from("a1"),
            account: "agent-x".into(),
            amount: 1,
            timestamp: Utc::now(),
        };
        assert!(matches!(
            layer.commit(&request).await,
            Err(LayerError::Transient(_))
        ));
    }
}
