//! Infrastructure layer - transport and persistence adapters

pub mod persistence;
pub mod transport;
