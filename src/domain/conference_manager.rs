//! Conference lifecycle management
//!
//! Creates or joins one conference at a time, dials participants
//! through the call engine, and fans periodic audio levels out to
//! observers.

use crate::config::ConferenceConfig;
use crate::domain::call::engine::CallSessionEngine;
use crate::domain::conference::{Conference, ConferenceState, Participant, ParticipantState};
use crate::domain::media::{MediaDirections, MediaProvider};
use crate::domain::shared::error::ClientError;
use crate::domain::shared::events::{AudioLevel, EventBus, SessionEvent};
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ConferenceId, ParticipantId, SipUri};
use crate::domain::signaling::SignalingChannel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ended conferences stay visible this long so observers can react to
/// the terminal state before the object disappears.
const CLEAR_DELAY: Duration = Duration::from_secs(2);

const MAX_PARTICIPANTS_LIMIT: usize = 1000;

/// Options for creating or joining a conference.
#[derive(Debug, Clone, Default)]
pub struct ConferenceOptions {
    pub max_participants: Option<usize>,
}

struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the (single) in-memory conference.
pub struct ConferenceManager {
    local_uri: SipUri,
    local_display_name: Option<String>,
    config: ConferenceConfig,
    engine: Arc<CallSessionEngine>,
    signaling: Arc<dyn SignalingChannel>,
    media: Arc<dyn MediaProvider>,
    bus: Arc<EventBus>,
    conference: RwLock<Option<Conference>>,
    in_flight: AtomicBool,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    clear_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
    weak_self: Weak<ConferenceManager>,
}

impl ConferenceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_uri: SipUri,
        local_display_name: Option<String>,
        config: ConferenceConfig,
        engine: Arc<CallSessionEngine>,
        signaling: Arc<dyn SignalingChannel>,
        media: Arc<dyn MediaProvider>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            local_uri,
            local_display_name,
            config,
            engine,
            signaling,
            media,
            bus,
            conference: RwLock::new(None),
            in_flight: AtomicBool::new(false),
            poll_task: Mutex::new(None),
            clear_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    pub fn conference(&self) -> Option<Conference> {
        self.conference.read().unwrap().clone()
    }

    fn has_running_conference(&self) -> bool {
        self.conference
            .read()
            .unwrap()
            .as_ref()
            .map(|c| !c.state.is_terminal())
            .unwrap_or(false)
    }

    /// Create a conference with the local party as moderator.
    pub async fn create_conference(&self, options: ConferenceOptions) -> Result<ConferenceId> {
        let _guard = self.begin()?;
        if self.has_running_conference() {
            return Err(ClientError::State(
                "Conference already active".to_string(),
            ));
        }

        let max_participants = options
            .max_participants
            .unwrap_or(self.config.default_max_participants);
        if max_participants < 1 || max_participants > MAX_PARTICIPANTS_LIMIT {
            return Err(ClientError::Configuration(format!(
                "maxParticipants must be between 1 and {}",
                MAX_PARTICIPANTS_LIMIT
            )));
        }

        let mut conference = Conference::new(max_participants);
        let conference_id = conference.id;
        let local = Participant::local_moderator(
            self.local_uri.clone(),
            self.local_display_name.clone(),
        );
        let local_id = local.id;
        let local_uri = local.uri.clone();
        conference.local_participant = Some(local);
        conference.activate();
        *self.conference.write().unwrap() = Some(conference);

        self.bus
            .publish(&SessionEvent::ConferenceCreated { conference_id });
        self.bus.publish(&SessionEvent::ParticipantJoined {
            conference_id,
            participant_id: local_id,
            uri: local_uri,
        });
        self.start_polling();

        info!("Conference {} created (max {})", conference_id, max_participants);
        Ok(conference_id)
    }

    /// Join a remote conference by URI. No moderator role is assumed.
    pub async fn join_conference(
        &self,
        uri: &str,
        options: ConferenceOptions,
    ) -> Result<ConferenceId> {
        let _guard = self.begin()?;
        if self.has_running_conference() {
            return Err(ClientError::State(
                "Conference already active".to_string(),
            ));
        }

        let focus_uri = SipUri::parse(uri)?;
        let max_participants = options
            .max_participants
            .unwrap_or(self.config.default_max_participants);
        if max_participants < 1 || max_participants > MAX_PARTICIPANTS_LIMIT {
            return Err(ClientError::Configuration(format!(
                "maxParticipants must be between 1 and {}",
                MAX_PARTICIPANTS_LIMIT
            )));
        }

        let mut conference = Conference::new(max_participants);
        let conference_id = conference.id;
        conference.local_participant = Some(Participant::local_member(
            self.local_uri.clone(),
            self.local_display_name.clone(),
        ));
        *self.conference.write().unwrap() = Some(conference);

        let call_id = match self
            .engine
            .make_call(
                focus_uri.as_str(),
                MediaDirections::audio_only(),
                CancellationToken::new(),
            )
            .await
        {
            Ok(call_id) => call_id,
            Err(e) => {
                self.with_conference(|c| c.state = ConferenceState::Failed);
                self.bus.publish(&SessionEvent::ConferenceFailed {
                    conference_id,
                    error: e.to_string(),
                });
                self.schedule_clear();
                return Err(e);
            }
        };

        self.with_conference(|c| {
            if let Some(local) = c.local_participant.as_mut() {
                local.call_id = Some(call_id);
            }
            c.activate();
        });
        self.bus.publish(&SessionEvent::ConferenceJoined {
            conference_id,
            uri: focus_uri.clone(),
        });
        self.start_polling();

        info!("Joined conference {} at {}", conference_id, focus_uri);
        Ok(conference_id)
    }

    /// Dial a new participant into the conference.
    pub async fn add_participant(
        &self,
        uri: &str,
        display_name: Option<String>,
    ) -> Result<ParticipantId> {
        let _guard = self.begin()?;
        let uri = SipUri::parse(uri)?;

        let participant = Participant::new(uri.clone(), display_name);
        let participant_id = participant.id;
        let conference_id = {
            let mut guard = self.conference.write().unwrap();
            let conference = guard
                .as_mut()
                .filter(|c| !c.state.is_terminal())
                .ok_or_else(|| ClientError::NotFound("No active conference".to_string()))?;

            // The entity re-checks locked/full before mutating.
            conference.add_participant(participant)?;
            conference.id
        };
        self.bus.publish(&SessionEvent::ParticipantJoined {
            conference_id,
            participant_id,
            uri: uri.clone(),
        });

        match self
            .engine
            .make_call(
                uri.as_str(),
                MediaDirections::audio_only(),
                CancellationToken::new(),
            )
            .await
        {
            Ok(call_id) => {
                self.with_conference(|c| {
                    if let Some(p) = c.participant_mut(participant_id) {
                        p.call_id = Some(call_id);
                    }
                });
                info!("Participant {} dialing via call {}", participant_id, call_id);
                Ok(participant_id)
            }
            Err(e) => {
                // Roll the locally-added participant back.
                self.with_conference(|c| {
                    let _ = c.remove_participant(participant_id);
                });
                self.bus.publish(&SessionEvent::ParticipantLeft {
                    conference_id,
                    participant_id,
                });
                warn!("Participant invite failed, rolled back: {}", e);
                Err(e)
            }
        }
    }

    /// Remove a remote participant. Removing yourself is not allowed;
    /// use `end_conference`.
    pub async fn remove_participant(&self, participant_id: ParticipantId) -> Result<()> {
        let _guard = self.begin()?;

        let (conference_id, call_id) = {
            let guard = self.conference.read().unwrap();
            let conference = guard
                .as_ref()
                .filter(|c| !c.state.is_terminal())
                .ok_or_else(|| ClientError::NotFound("No active conference".to_string()))?;
            let participant = conference
                .participant(participant_id)
                .ok_or_else(|| ClientError::NotFound("Participant not found".to_string()))?;
            if participant.is_self {
                return Err(ClientError::State("Cannot remove yourself".to_string()));
            }
            (conference.id, participant.call_id)
        };

        if let Some(call_id) = call_id {
            if let Err(e) = self.engine.hangup(call_id).await {
                warn!("Could not hang up participant call: {}", e);
            }
        }

        self.with_conference(|c| {
            let _ = c.remove_participant(participant_id);
        });
        self.bus.publish(&SessionEvent::ParticipantLeft {
            conference_id,
            participant_id,
        });
        Ok(())
    }

    pub async fn mute_participant(&self, participant_id: ParticipantId) -> Result<()> {
        self.set_participant_muted(participant_id, true).await
    }

    pub async fn unmute_participant(&self, participant_id: ParticipantId) -> Result<()> {
        self.set_participant_muted(participant_id, false).await
    }

    /// Idempotent mute toggle. The local participant is muted through
    /// the media path; remote participants through a moderator command.
    pub async fn set_participant_muted(
        &self,
        participant_id: ParticipantId,
        muted: bool,
    ) -> Result<()> {
        let _guard = self.begin()?;
        let (conference_id, participant) = {
            let guard = self.conference.read().unwrap();
            let conference = guard
                .as_ref()
                .filter(|c| !c.state.is_terminal())
                .ok_or_else(|| ClientError::NotFound("No active conference".to_string()))?;
            let participant = conference
                .participant(participant_id)
                .ok_or_else(|| ClientError::NotFound("Participant not found".to_string()))?
                .clone();
            (conference.id, participant)
        };

        if participant.is_muted == muted {
            return Ok(());
        }

        if participant.is_self {
            match participant.call_id {
                Some(call_id) => self.engine.set_muted(call_id, muted)?,
                // A created conference has no local call leg; the flag
                // is all there is to flip.
                None => debug!("Local mute toggled without a call leg"),
            }
        } else {
            self.signaling
                .moderator_mute(conference_id, &participant.uri, muted)
                .await?;
        }

        self.with_conference(|c| {
            if let Some(p) = c.participant_mut(participant_id) {
                p.is_muted = muted;
            }
        });
        self.bus.publish(&SessionEvent::ParticipantUpdated {
            conference_id,
            participant_id,
            field: "is_muted".to_string(),
        });
        Ok(())
    }

    /// Lock the conference against new participants. Idempotent.
    pub fn lock_conference(&self) -> Result<()> {
        let changed = self.toggle(|c| c.lock())?;
        if changed.1 {
            self.bus.publish(&SessionEvent::ConferenceLocked {
                conference_id: changed.0,
            });
        }
        Ok(())
    }

    pub fn unlock_conference(&self) -> Result<()> {
        let changed = self.toggle(|c| c.unlock())?;
        if changed.1 {
            self.bus.publish(&SessionEvent::ConferenceUnlocked {
                conference_id: changed.0,
            });
        }
        Ok(())
    }

    /// Start recording. Failures propagate without touching local
    /// state.
    pub async fn start_recording(&self) -> Result<()> {
        let _guard = self.begin()?;
        let conference_id = self.require_conference_id()?;
        if self.conference().map(|c| c.is_recording).unwrap_or(false) {
            return Ok(());
        }

        self.signaling.set_recording(conference_id, true).await?;
        self.with_conference(|c| {
            c.start_recording();
        });
        self.bus
            .publish(&SessionEvent::RecordingStarted { conference_id });
        Ok(())
    }

    pub async fn stop_recording(&self) -> Result<()> {
        let _guard = self.begin()?;
        let conference_id = self.require_conference_id()?;
        if !self.conference().map(|c| c.is_recording).unwrap_or(false) {
            return Ok(());
        }

        self.signaling.set_recording(conference_id, false).await?;
        self.with_conference(|c| {
            c.stop_recording();
        });
        self.bus
            .publish(&SessionEvent::RecordingStopped { conference_id });
        Ok(())
    }

    /// Tear the conference down: hang up every participant call, stop
    /// polling, and clear the object after a short grace period.
    pub async fn end_conference(&self) -> Result<()> {
        let _guard = self.begin()?;

        let (conference_id, call_ids) = {
            let mut guard = self.conference.write().unwrap();
            let conference = guard
                .as_mut()
                .filter(|c| !c.state.is_terminal())
                .ok_or_else(|| ClientError::NotFound("No active conference".to_string()))?;
            conference.state = ConferenceState::Ending;
            let call_ids: Vec<CallId> = conference
                .all_participants()
                .iter()
                .filter_map(|p| p.call_id)
                .collect();
            (conference.id, call_ids)
        };
        self.bus
            .publish(&SessionEvent::ConferenceEnding { conference_id });

        self.stop_polling();
        for call_id in call_ids {
            if let Err(e) = self.engine.hangup(call_id).await {
                warn!("Could not hang up conference call {}: {}", call_id, e);
            }
        }

        self.with_conference(|c| c.end());
        self.bus
            .publish(&SessionEvent::ConferenceEnded { conference_id });
        self.schedule_clear();

        info!("Conference {} ended", conference_id);
        Ok(())
    }

    /// A dialed participant call was answered.
    pub fn on_participant_call_established(&self, call_id: CallId) {
        let update = {
            let mut guard = self.conference.write().unwrap();
            guard.as_mut().and_then(|conference| {
                let id = conference.id;
                let participant = conference
                    .participants
                    .values_mut()
                    .find(|p| p.call_id == Some(call_id))?;
                participant.state = ParticipantState::Connected;
                Some((id, participant.id))
            })
        };

        if let Some((conference_id, participant_id)) = update {
            self.bus.publish(&SessionEvent::ParticipantUpdated {
                conference_id,
                participant_id,
                field: "state".to_string(),
            });
        }
    }

    /// A participant call ended. Remote participants leave the roster;
    /// losing the local leg ends the conference.
    pub async fn on_participant_call_ended(&self, call_id: CallId) {
        let local_leg = {
            let guard = self.conference.read().unwrap();
            match guard.as_ref().and_then(|c| c.participant_by_call(call_id)) {
                Some(p) => p.is_self,
                None => return,
            }
        };

        if local_leg {
            debug!("Local conference leg ended");
            if let Err(e) = self.end_conference().await {
                warn!("Could not end conference after local leg loss: {}", e);
            }
            return;
        }

        let removed = {
            let mut guard = self.conference.write().unwrap();
            guard.as_mut().and_then(|conference| {
                let id = conference.id;
                let participant_id = conference.participant_by_call(call_id).map(|p| p.id)?;
                let _ = conference.remove_participant(participant_id);
                Some((id, participant_id))
            })
        };

        if let Some((conference_id, participant_id)) = removed {
            self.bus.publish(&SessionEvent::ParticipantLeft {
                conference_id,
                participant_id,
            });
        }
    }

    /// Idempotent teardown.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_polling();
        if let Some(task) = self.clear_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn begin(&self) -> Result<FlagGuard<'_>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ClientError::State(
                "Conference manager has been disposed".to_string(),
            ));
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Concurrency(
                "Conference operation already in progress".to_string(),
            ));
        }
        Ok(FlagGuard(&self.in_flight))
    }

    fn require_conference_id(&self) -> Result<ConferenceId> {
        self.conference
            .read()
            .unwrap()
            .as_ref()
            .filter(|c| !c.state.is_terminal())
            .map(|c| c.id)
            .ok_or_else(|| ClientError::NotFound("No active conference".to_string()))
    }

    fn with_conference<F: FnOnce(&mut Conference)>(&self, f: F) {
        if let Some(conference) = self.conference.write().unwrap().as_mut() {
            f(conference);
        }
    }

    fn toggle<F: FnOnce(&mut Conference) -> bool>(&self, f: F) -> Result<(ConferenceId, bool)> {
        let mut guard = self.conference.write().unwrap();
        let conference = guard
            .as_mut()
            .filter(|c| !c.state.is_terminal())
            .ok_or_else(|| ClientError::NotFound("No active conference".to_string()))?;
        let id = conference.id;
        Ok((id, f(conference)))
    }

    fn start_polling(&self) {
        self.stop_polling();

        let weak = self.weak_self.clone();
        let interval = Duration::from_millis(self.config.audio_poll_interval_ms);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };

                let roster: Option<(ConferenceId, Vec<(ParticipantId, SipUri)>)> = {
                    let guard = manager.conference.read().unwrap();
                    guard
                        .as_ref()
                        .filter(|c| c.state == ConferenceState::Active)
                        .map(|c| {
                            (
                                c.id,
                                c.all_participants()
                                    .iter()
                                    .map(|p| (p.id, p.uri.clone()))
                                    .collect(),
                            )
                        })
                };
                let Some((conference_id, roster)) = roster else { break };

                let levels: Vec<AudioLevel> = roster
                    .iter()
                    .filter_map(|(participant_id, uri)| {
                        manager.media.audio_level(uri).map(|level| AudioLevel {
                            participant_id: *participant_id,
                            level,
                        })
                    })
                    .collect();

                // No meter data at all: stay silent rather than
                // reporting silence.
                if levels.is_empty() {
                    continue;
                }

                {
                    let mut guard = manager.conference.write().unwrap();
                    if let Some(conference) = guard.as_mut() {
                        for sample in &levels {
                            if let Some(p) = conference.participant_mut(sample.participant_id) {
                                p.audio_level = sample.level;
                            }
                        }
                    }
                }
                manager.bus.publish(&SessionEvent::AudioLevels {
                    conference_id,
                    levels,
                });
            }
        });

        if let Some(old) = self.poll_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    fn stop_polling(&self) {
        if let Some(task) = self.poll_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn schedule_clear(&self) {
        let weak = self.weak_self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(CLEAR_DELAY).await;
            let Some(manager) = weak.upgrade() else { return };
            let mut guard = manager.conference.write().unwrap();
            if guard.as_ref().map(|c| c.state.is_terminal()).unwrap_or(false) {
                *guard = None;
            }
        });
        if let Some(old) = self.clear_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }
}
