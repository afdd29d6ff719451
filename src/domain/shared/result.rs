//! Engine result type

use super::error::ClientError;

/// Standard result type for engine operations
pub type Result<T> = std::result::Result<T, ClientError>;
