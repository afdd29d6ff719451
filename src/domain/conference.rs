//! Conference domain model

use crate::domain::shared::error::ClientError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ConferenceId, ParticipantId, SipUri};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Participant state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantState {
    Connecting,
    Connected,
    Disconnected,
}

/// Conference participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub uri: SipUri,
    pub display_name: Option<String>,
    pub state: ParticipantState,
    pub is_muted: bool,
    pub is_on_hold: bool,
    pub is_moderator: bool,
    pub is_self: bool,
    pub joined_at: DateTime<Utc>,
    /// Last sampled audio level, 0.0 - 1.0
    pub audio_level: f32,
    /// The call leg carrying this participant, when dialed by us
    pub call_id: Option<CallId>,
}

impl Participant {
    pub fn new(uri: SipUri, display_name: Option<String>) -> Self {
        Self {
            id: ParticipantId::new(),
            uri,
            display_name,
            state: ParticipantState::Connecting,
            is_muted: false,
            is_on_hold: false,
            is_moderator: false,
            is_self: false,
            joined_at: Utc::now(),
            audio_level: 0.0,
            call_id: None,
        }
    }

    /// The local participant of a conference we created: moderator,
    /// already connected.
    pub fn local_moderator(uri: SipUri, display_name: Option<String>) -> Self {
        Self {
            state: ParticipantState::Connected,
            is_moderator: true,
            is_self: true,
            ..Self::new(uri, display_name)
        }
    }

    /// The local participant of a conference we joined; no moderator
    /// privileges are implied.
    pub fn local_member(uri: SipUri, display_name: Option<String>) -> Self {
        Self {
            is_self: true,
            ..Self::new(uri, display_name)
        }
    }
}

/// Conference state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConferenceState {
    Idle,
    Creating,
    Active,
    Ending,
    Ended,
    Failed,
}

impl ConferenceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConferenceState::Ended | ConferenceState::Failed)
    }
}

/// Multi-party session. Remote participants live in the map; the local
/// participant is a separate reference and does not count against
/// `max_participants`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conference {
    pub id: ConferenceId,
    pub state: ConferenceState,
    pub participants: HashMap<ParticipantId, Participant>,
    pub local_participant: Option<Participant>,
    pub is_locked: bool,
    pub is_recording: bool,
    pub max_participants: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Conference {
    pub fn new(max_participants: usize) -> Self {
        Self {
            id: ConferenceId::new(),
            state: ConferenceState::Creating,
            participants: HashMap::new(),
            local_participant: None,
            is_locked: false,
            is_recording: false,
            max_participants,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_full(&self) -> bool {
        self.participant_count() >= self.max_participants
    }

    /// Add a remote participant.
    pub fn add_participant(&mut self, participant: Participant) -> Result<()> {
        if self.state.is_terminal() {
            return Err(ClientError::State("Conference has ended".to_string()));
        }
        if self.is_locked {
            return Err(ClientError::State("Conference is locked".to_string()));
        }
        if self.is_full() {
            return Err(ClientError::State("Conference is full".to_string()));
        }

        self.participants.insert(participant.id, participant);
        Ok(())
    }

    pub fn remove_participant(&mut self, participant_id: ParticipantId) -> Result<Participant> {
        self.participants
            .remove(&participant_id)
            .ok_or_else(|| ClientError::NotFound("Participant not found".to_string()))
    }

    /// Look up any participant, the local one included.
    pub fn participant(&self, participant_id: ParticipantId) -> Option<&Participant> {
        if let Some(local) = &self.local_participant {
            if local.id == participant_id {
                return Some(local);
            }
        }
        self.participants.get(&participant_id)
    }

    pub fn participant_mut(&mut self, participant_id: ParticipantId) -> Option<&mut Participant> {
        if let Some(local) = self.local_participant.as_mut() {
            if local.id == participant_id {
                return Some(local);
            }
        }
        self.participants.get_mut(&participant_id)
    }

    pub fn participant_by_call(&self, call_id: CallId) -> Option<&Participant> {
        if let Some(local) = &self.local_participant {
            if local.call_id == Some(call_id) {
                return Some(local);
            }
        }
        self.participants
            .values()
            .find(|p| p.call_id == Some(call_id))
    }

    /// Everyone, local participant first.
    pub fn all_participants(&self) -> Vec<Participant> {
        let mut all: Vec<Participant> = self.local_participant.iter().cloned().collect();
        all.extend(self.participants.values().cloned());
        all
    }

    /// Returns whether the flag actually changed.
    pub fn lock(&mut self) -> bool {
        !std::mem::replace(&mut self.is_locked, true)
    }

    pub fn unlock(&mut self) -> bool {
        std::mem::replace(&mut self.is_locked, false)
    }

    pub fn start_recording(&mut self) -> bool {
        !std::mem::replace(&mut self.is_recording, true)
    }

    pub fn stop_recording(&mut self) -> bool {
        std::mem::replace(&mut self.is_recording, false)
    }

    pub fn activate(&mut self) {
        self.state = ConferenceState::Active;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn end(&mut self) {
        self.state = ConferenceState::Ended;
        self.ended_at = Some(Utc::now());
        self.is_recording = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> SipUri {
        SipUri::parse(s).unwrap()
    }

    fn remote(n: u32) -> Participant {
        Participant::new(uri(&format!("sip:user{}@example.com", n)), None)
    }

    #[test]
    fn test_capacity_excludes_local_participant() {
        let mut conference = Conference::new(1);
        conference.local_participant =
            Some(Participant::local_moderator(uri("sip:me@example.com"), None));
        conference.activate();

        conference.add_participant(remote(1)).unwrap();

        let err = conference.add_participant(remote(2)).unwrap_err();
        assert_eq!(err.to_string(), "Invalid state: Conference is full");
    }

    #[test]
    fn test_locked_conference_rejects_new_participants() {
        let mut conference = Conference::new(10);
        conference.activate();
        assert!(conference.lock());

        let err = conference.add_participant(remote(1)).unwrap_err();
        assert_eq!(err.to_string(), "Invalid state: Conference is locked");

        assert!(conference.unlock());
        conference.add_participant(remote(1)).unwrap();
    }

    #[test]
    fn test_lock_and_recording_report_changes() {
        let mut conference = Conference::new(10);
        conference.activate();

        assert!(conference.lock());
        assert!(!conference.lock());
        assert!(conference.unlock());
        assert!(!conference.unlock());

        assert!(conference.start_recording());
        assert!(!conference.start_recording());
        assert!(conference.stop_recording());
        assert!(!conference.stop_recording());
    }

    #[test]
    fn test_end_stops_recording() {
        let mut conference = Conference::new(10);
        conference.activate();
        conference.start_recording();

        conference.end();
        assert_eq!(conference.state, ConferenceState::Ended);
        assert!(!conference.is_recording);
        assert!(conference.ended_at.is_some());

        let err = conference.add_participant(remote(1)).unwrap_err();
        assert_eq!(err.to_string(), "Invalid state: Conference has ended");
    }

    #[test]
    fn test_participant_lookup_covers_local() {
        let mut conference = Conference::new(10);
        let local = Participant::local_moderator(uri("sip:me@example.com"), None);
        let local_id = local.id;
        conference.local_participant = Some(local);
        conference.activate();

        let participant = remote(1);
        let remote_id = participant.id;
        conference.add_participant(participant).unwrap();

        assert!(conference.participant(local_id).unwrap().is_self);
        assert!(!conference.participant(remote_id).unwrap().is_self);
        assert_eq!(conference.all_participants().len(), 2);
        assert_eq!(conference.participant_count(), 1);
    }
}
