//! Warbler - a SIP softphone session engine built with Rust
//!
//! Warbler drives the signaling transport, registration lifecycle and
//! call/transfer/conference/messaging sessions of a SIP user agent.
//! Message encoding and media handling live behind the `SignalingChannel`
//! and `MediaProvider` traits.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::SoftphoneClient;
pub use domain::shared::error::ClientError;
pub use domain::shared::result::Result;
