//! Application layer - the client facade consumed by UI code

pub mod client;

pub use client::SoftphoneClient;
