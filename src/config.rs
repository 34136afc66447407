//! Bidder-interface configuration file.
//!
//! Loaded once at startup; an invalid file is fatal. The file names the
//! external bidder endpoint and the ad server's win/event ports:
//!
//! ```json
//! {
//!     "type": "http",
//!     "bidder": { "host": "bidder.example.com", "port": 12339, "path": "/auctions" },
//!     "adserver": { "host": "adserver.example.com", "winPort": 12340, "eventPort": 12341 }
//! }
//! ```

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// External bidder endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidderEndpoint {
    pub host: String,
    pub port: u16,
    /// Resource path the OpenRTB request is posted to.
    pub path: String,
}

impl BidderEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Ad server delivery endpoints for win and campaign-event notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdServerEndpoint {
    pub host: String,
    #[serde(rename = "winPort")]
    pub win_port: u16,
    #[serde(rename = "eventPort")]
    pub event_port: u16,
}

impl AdServerEndpoint {
    pub fn win_url(&self) -> String {
        format!("http://{}:{}/", self.host, self.win_port)
    }

    pub fn event_url(&self) -> String {
        format!("http://{}:{}/", self.host, self.event_port)
    }
}

/// Parsed bidder-interface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidderInterfaceConfig {
    /// Interface tag resolved through the factory registry.
    #[serde(rename = "type", default = "default_interface_tag")]
    pub interface: String,
    pub bidder: BidderEndpoint,
    pub adserver: AdServerEndpoint,
}

fn default_interface_tag() -> String {
    "http".to_string()
}

impl BidderInterfaceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bidder.host.is_empty() {
            bail!("bidder.host must not be empty");
        }
        if !self.bidder.path.starts_with('/') {
            bail!("bidder.path must start with '/': {:?}", self.bidder.path);
        }
        if self.adserver.host.is_empty() {
            bail!("adserver.host must not be empty");
        }
        Ok(())
    }
}

/// Load and validate the bidder-interface configuration file.
pub fn load_bidder_config(path: impl AsRef<Path>) -> Result<BidderInterfaceConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read bidder config {}", path.display()))?;
    let config: BidderInterfaceConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid bidder config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
