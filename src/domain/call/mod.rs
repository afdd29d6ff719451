//! Call sessions: per-call state machine, DTMF sequencing and the
//! engine coordinating them.

pub mod dtmf;
pub mod engine;
pub mod session;

pub use dtmf::{DtmfOptions, DtmfTone};
pub use engine::CallSessionEngine;
pub use session::{CallDirection, CallSession, CallState, CallStats};
