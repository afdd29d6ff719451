//! Call session entity and state machine

use crate::domain::media::MediaSessionHandle;
use crate::domain::shared::error::ClientError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, SipUri};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Session created, nothing sent yet
    Idle,
    /// INVITE sent, no provisional response yet
    Calling,
    /// Ringing: 18x received (outgoing) or INVITE received (incoming)
    Ringing,
    /// Local answer in progress
    Answering,
    /// Call established
    Active,
    /// Hold re-INVITE in flight
    Holding,
    /// Call on hold
    Held,
    /// BYE/CANCEL sent or received
    Terminating,
    /// Call ended
    Terminated,
    /// Call failed
    Failed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Answering => "answering",
            CallState::Active => "active",
            CallState::Holding => "holding",
            CallState::Held => "held",
            CallState::Terminating => "terminating",
            CallState::Terminated => "terminated",
            CallState::Failed => "failed",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Terminated | CallState::Failed)
    }

    /// Established means media is (nominally) flowing: active or one of
    /// the hold sub-states.
    pub fn is_established(&self) -> bool {
        matches!(self, CallState::Active | CallState::Holding | CallState::Held)
    }

    fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Idle, Calling) | (Idle, Ringing) | (Idle, Failed) => true,
            (Calling, Ringing) | (Calling, Active) | (Calling, Terminating) | (Calling, Failed) => {
                true
            }
            (Ringing, Answering) | (Ringing, Active) | (Ringing, Terminating) | (Ringing, Failed) => {
                true
            }
            (Answering, Active) | (Answering, Terminating) | (Answering, Failed) => true,
            (Active, Holding) | (Active, Terminating) | (Active, Failed) => true,
            (Holding, Held) | (Holding, Active) | (Holding, Terminating) | (Holding, Failed) => {
                true
            }
            (Held, Holding) | (Held, Active) | (Held, Terminating) | (Held, Failed) => true,
            (Terminating, Terminated) | (Terminating, Failed) => true,
            _ => false,
        }
    }
}

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// One call leg owned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub id: CallId,
    pub direction: CallDirection,
    pub local_uri: SipUri,
    pub remote_uri: SipUri,
    pub local_display_name: Option<String>,
    pub remote_display_name: Option<String>,
    pub state: CallState,
    pub is_on_hold: bool,
    pub is_muted: bool,
    pub media: Option<MediaSessionHandle>,
    pub invited_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub termination_cause: Option<String>,
    pub provisional_count: u32,
}

impl CallSession {
    pub fn new_outgoing(
        id: CallId,
        local_uri: SipUri,
        local_display_name: Option<String>,
        remote_uri: SipUri,
    ) -> Self {
        Self {
            id,
            direction: CallDirection::Outgoing,
            local_uri,
            remote_uri,
            local_display_name,
            remote_display_name: None,
            state: CallState::Idle,
            is_on_hold: false,
            is_muted: false,
            media: None,
            invited_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            termination_cause: None,
            provisional_count: 0,
        }
    }

    pub fn new_incoming(
        id: CallId,
        local_uri: SipUri,
        remote_uri: SipUri,
        remote_display_name: Option<String>,
    ) -> Self {
        Self {
            id,
            direction: CallDirection::Incoming,
            local_uri,
            remote_uri,
            local_display_name: None,
            remote_display_name,
            state: CallState::Idle,
            is_on_hold: false,
            is_muted: false,
            media: None,
            invited_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            termination_cause: None,
            provisional_count: 0,
        }
    }

    /// Move the session along the state graph. Duration bookkeeping is
    /// stamped here so it can neither double-start nor be skipped.
    pub fn transition(&mut self, next: CallState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ClientError::State(format!(
                "Invalid call state transition: {} -> {}",
                self.state.as_str(),
                next.as_str()
            )));
        }

        self.state = next;
        match next {
            CallState::Active => {
                if self.answered_at.is_none() {
                    self.answered_at = Some(Utc::now());
                }
            }
            CallState::Terminated | CallState::Failed => {
                if self.ended_at.is_none() {
                    self.ended_at = Some(Utc::now());
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn is_established(&self) -> bool {
        self.state.is_established()
    }

    pub fn stats(&self) -> CallStats {
        let setup_time_ms = self
            .answered_at
            .map(|answered| (answered - self.invited_at).num_milliseconds());
        let talk_time_ms = self.answered_at.map(|answered| {
            let end = self.ended_at.unwrap_or_else(Utc::now);
            (end - answered).num_milliseconds()
        });
        let total_time_ms = {
            let end = self.ended_at.unwrap_or_else(Utc::now);
            (end - self.invited_at).num_milliseconds()
        };

        CallStats {
            call_id: self.id,
            state: self.state,
            direction: self.direction,
            is_muted: self.is_muted,
            is_on_hold: self.is_on_hold,
            provisional_count: self.provisional_count,
            setup_time_ms,
            talk_time_ms,
            total_time_ms,
            termination_cause: self.termination_cause.clone(),
        }
    }
}

/// Snapshot of call statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CallStats {
    pub call_id: CallId,
    pub state: CallState,
    pub direction: CallDirection,
    pub is_muted: bool,
    pub is_on_hold: bool,
    pub provisional_count: u32,
    /// Invite to answer
    pub setup_time_ms: Option<i64>,
    /// Answer to end (or now, while the call is up)
    pub talk_time_ms: Option<i64>,
    /// Invite to end (or now)
    pub total_time_ms: i64,
    pub termination_cause: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> CallSession {
        CallSession::new_outgoing(
            CallId::new(),
            SipUri::parse("sip:alice@example.com").unwrap(),
            Some("Alice".to_string()),
            SipUri::parse("sip:bob@example.com").unwrap(),
        )
    }

    #[test]
    fn test_outgoing_happy_path() {
        let mut session = outgoing();
        assert_eq!(session.state, CallState::Idle);

        session.transition(CallState::Calling).unwrap();
        session.transition(CallState::Ringing).unwrap();
        session.transition(CallState::Active).unwrap();
        assert!(session.answered_at.is_some());
        assert!(session.is_established());

        session.transition(CallState::Terminating).unwrap();
        session.transition(CallState::Terminated).unwrap();
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn test_fast_answer_without_provisional() {
        let mut session = outgoing();
        session.transition(CallState::Calling).unwrap();
        session.transition(CallState::Active).unwrap();
        assert_eq!(session.state, CallState::Active);
    }

    #[test]
    fn test_hold_cycle() {
        let mut session = outgoing();
        session.transition(CallState::Calling).unwrap();
        session.transition(CallState::Active).unwrap();

        session.transition(CallState::Holding).unwrap();
        session.transition(CallState::Held).unwrap();
        assert!(session.is_established());

        session.transition(CallState::Holding).unwrap();
        session.transition(CallState::Active).unwrap();
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut session = outgoing();
        assert!(session.transition(CallState::Active).is_err());

        session.transition(CallState::Calling).unwrap();
        assert!(session.transition(CallState::Held).is_err());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut session = outgoing();
        session.transition(CallState::Calling).unwrap();
        session.transition(CallState::Failed).unwrap();

        for next in [
            CallState::Calling,
            CallState::Active,
            CallState::Terminating,
            CallState::Terminated,
        ] {
            assert!(session.transition(next).is_err());
        }
    }

    #[test]
    fn test_answered_at_never_double_stamps() {
        let mut session = outgoing();
        session.transition(CallState::Calling).unwrap();
        session.transition(CallState::Active).unwrap();
        let first = session.answered_at.unwrap();

        session.transition(CallState::Holding).unwrap();
        session.transition(CallState::Active).unwrap();
        assert_eq!(session.answered_at.unwrap(), first);
    }

    #[test]
    fn test_stats_before_answer() {
        let mut session = outgoing();
        session.transition(CallState::Calling).unwrap();

        let stats = session.stats();
        assert_eq!(stats.state, CallState::Calling);
        assert!(stats.setup_time_ms.is_none());
        assert!(stats.talk_time_ms.is_none());
        assert!(stats.total_time_ms >= 0);
    }
}
