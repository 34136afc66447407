//! Post-Auction Backend Library
//!
//! Exposes the post-auction loop's components for the runner binary,
//! integration tests and embedders: the event matcher, the banker client,
//! the bidder interfaces and the typed ingress/egress ports.

pub mod adserver;
pub mod banker;
pub mod bidder;
pub mod config;
pub mod matcher;
pub mod models;
pub mod pipes;
pub mod service;
