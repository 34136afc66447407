//! Post-auction event matching: the index (soft state) and the engine
//! (state machine) that joins auctions, win/loss and campaign events.

pub mod engine;
pub mod index;

pub use engine::{
    EventMatcher, MatcherConfig, MatcherOutput, DEFAULT_AUCTION_TIMEOUT_SECS,
    DEFAULT_WIN_TIMEOUT_SECS,
};
pub use index::{BucketState, DeadlineKind, EventIndex, PendingBucket, Resolution};
