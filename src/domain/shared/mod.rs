//! Shared kernel - common types used across all session managers

pub mod error;
pub mod events;
pub mod result;
pub mod value_objects;

pub use error::ClientError;
pub use events::{EventBus, SessionEvent, SubscriptionId};
pub use result::Result;
pub use value_objects::*;
