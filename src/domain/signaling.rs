//! Signaling channel port
//!
//! The SIP engine proper (message encoding, SDP negotiation,
//! transactions) lives behind [`SignalingChannel`]. The engine core only
//! issues semantic operations and consumes [`SignalingEvent`]s.

use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ConferenceId, MessageId, SipUri};
use async_trait::async_trait;
use std::time::Duration;

/// What the registrar granted for a successful REGISTER.
///
/// Servers may shorten the requested interval, so the granted value is
/// what refresh scheduling must be based on.
#[derive(Debug, Clone, Copy)]
pub struct RegistrationGrant {
    pub expires: u32,
}

/// Delivery state carried by an outbound message disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionKind {
    Delivered,
    Read,
}

/// Operations the engine requires from the underlying SIP engine.
///
/// Every method is a single network round-trip from the engine's point
/// of view; progress beyond that arrives as [`SignalingEvent`]s.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn register(&self, aor: &SipUri, expires: u32) -> Result<RegistrationGrant>;
    async fn unregister(&self, aor: &SipUri) -> Result<()>;

    async fn invite(&self, call_id: CallId, target: &SipUri, audio: bool, video: bool)
        -> Result<()>;
    async fn answer(&self, call_id: CallId) -> Result<()>;
    async fn reject(&self, call_id: CallId, status: u16) -> Result<()>;
    async fn cancel(&self, call_id: CallId) -> Result<()>;
    async fn bye(&self, call_id: CallId) -> Result<()>;
    async fn set_hold(&self, call_id: CallId, on_hold: bool) -> Result<()>;
    async fn send_dtmf_tone(&self, call_id: CallId, tone: char, duration: Duration) -> Result<()>;

    /// Blind transfer: REFER the remote party of `call_id` to `target`.
    async fn refer(&self, call_id: CallId, target: &SipUri) -> Result<()>;
    /// Attended transfer: REFER with a Replaces reference to the
    /// consultation dialog.
    async fn refer_with_replaces(&self, call_id: CallId, replacement: CallId) -> Result<()>;

    /// Ask the conference focus to mute or unmute a remote participant.
    async fn moderator_mute(
        &self,
        conference_id: ConferenceId,
        participant: &SipUri,
        muted: bool,
    ) -> Result<()>;
    async fn set_recording(&self, conference_id: ConferenceId, recording: bool) -> Result<()>;

    async fn send_message(
        &self,
        message_id: MessageId,
        to: &SipUri,
        content: &str,
        content_type: &str,
    ) -> Result<()>;
    async fn send_disposition(
        &self,
        message_id: MessageId,
        to: &SipUri,
        kind: DispositionKind,
    ) -> Result<()>;
    async fn send_composing(&self, to: &SipUri, active: bool) -> Result<()>;

    /// Protocol-level keep-alive (OPTIONS).
    async fn options_ping(&self) -> Result<()>;
}

/// Inbound signaling notifications, delivered through an mpsc channel
/// owned by the client facade.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    IncomingCall {
        call_id: CallId,
        from: SipUri,
        display_name: Option<String>,
    },
    /// Provisional response (18x) for an outgoing call.
    CallProgress {
        call_id: CallId,
    },
    /// Remote party accepted (200 OK / ACK exchange finished).
    CallAccepted {
        call_id: CallId,
    },
    /// Remote BYE or normal teardown confirmation.
    CallTerminated {
        call_id: CallId,
        cause: Option<String>,
    },
    /// Final failure response for a call.
    CallFailed {
        call_id: CallId,
        status: u16,
        reason: String,
    },
    MessageReceived {
        message_id: MessageId,
        from: SipUri,
        content: String,
        content_type: String,
    },
    DeliveryReceipt {
        message_id: MessageId,
    },
    ReadReceipt {
        message_id: MessageId,
    },
    ComposingIndication {
        from: SipUri,
        active: bool,
    },
}
