//! Scripted collaborator fakes shared by the manager unit tests.

use crate::domain::media::{MediaDirections, MediaProvider, MediaSessionHandle};
use crate::domain::shared::error::ClientError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ConferenceId, MessageId, SipUri};
use crate::domain::signaling::{
    DispositionKind, RegistrationGrant, SignalingChannel, SignalingEvent,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Records every signaling operation and can be scripted to fail.
pub struct FakeSignaling {
    registers: Mutex<Vec<Instant>>,
    register_failures_left: AtomicU32,
    register_delay_ms: AtomicU64,
    granted_expires: AtomicU32,
    fail_unregister: AtomicBool,

    pub invites: Mutex<Vec<(CallId, SipUri)>>,
    invite_failures_left: AtomicU32,
    pub answers: Mutex<Vec<CallId>>,
    pub rejects: Mutex<Vec<(CallId, u16)>>,
    pub cancels: Mutex<Vec<CallId>>,
    pub byes: Mutex<Vec<CallId>>,
    pub holds: Mutex<Vec<(CallId, bool)>>,
    fail_hold: AtomicBool,
    pub dtmf_tones: Mutex<Vec<(CallId, char, Instant)>>,
    pub refers: Mutex<Vec<(CallId, SipUri)>>,
    fail_refer: AtomicBool,
    pub refer_replaces: Mutex<Vec<(CallId, CallId)>>,
    pub moderator_mutes: Mutex<Vec<(SipUri, bool)>>,
    pub recordings: Mutex<Vec<bool>>,
    fail_recording: AtomicBool,
    pub sent_messages: Mutex<Vec<(MessageId, SipUri, String)>>,
    fail_message: AtomicBool,
    pub dispositions: Mutex<Vec<(MessageId, DispositionKind)>>,
    pub composings: Mutex<Vec<(SipUri, bool)>>,
    fail_composing: AtomicBool,
    pub options_pings: AtomicUsize,

    events: Mutex<Option<mpsc::UnboundedSender<SignalingEvent>>>,
}

impl FakeSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registers: Mutex::new(Vec::new()),
            register_failures_left: AtomicU32::new(0),
            register_delay_ms: AtomicU64::new(0),
            granted_expires: AtomicU32::new(0),
            fail_unregister: AtomicBool::new(false),
            invites: Mutex::new(Vec::new()),
            invite_failures_left: AtomicU32::new(0),
            answers: Mutex::new(Vec::new()),
            rejects: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            byes: Mutex::new(Vec::new()),
            holds: Mutex::new(Vec::new()),
            fail_hold: AtomicBool::new(false),
            dtmf_tones: Mutex::new(Vec::new()),
            refers: Mutex::new(Vec::new()),
            fail_refer: AtomicBool::new(false),
            refer_replaces: Mutex::new(Vec::new()),
            moderator_mutes: Mutex::new(Vec::new()),
            recordings: Mutex::new(Vec::new()),
            fail_recording: AtomicBool::new(false),
            sent_messages: Mutex::new(Vec::new()),
            fail_message: AtomicBool::new(false),
            dispositions: Mutex::new(Vec::new()),
            composings: Mutex::new(Vec::new()),
            fail_composing: AtomicBool::new(false),
            options_pings: AtomicUsize::new(0),
            events: Mutex::new(None),
        })
    }

    pub fn fail_registers(&self, count: u32) {
        self.register_failures_left.store(count, Ordering::SeqCst);
    }

    pub fn set_register_delay(&self, delay: Duration) {
        self.register_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_granted_expires(&self, expires: u32) {
        self.granted_expires.store(expires, Ordering::SeqCst);
    }

    pub fn fail_unregister(&self, fail: bool) {
        self.fail_unregister.store(fail, Ordering::SeqCst);
    }

    pub fn fail_invites(&self, count: u32) {
        self.invite_failures_left.store(count, Ordering::SeqCst);
    }

    pub fn fail_hold(&self, fail: bool) {
        self.fail_hold.store(fail, Ordering::SeqCst);
    }

    pub fn fail_refer(&self, fail: bool) {
        self.fail_refer.store(fail, Ordering::SeqCst);
    }

    pub fn fail_recording(&self, fail: bool) {
        self.fail_recording.store(fail, Ordering::SeqCst);
    }

    pub fn fail_message(&self, fail: bool) {
        self.fail_message.store(fail, Ordering::SeqCst);
    }

    pub fn fail_composing(&self, fail: bool) {
        self.fail_composing.store(fail, Ordering::SeqCst);
    }

    pub fn register_calls(&self) -> usize {
        self.registers.lock().unwrap().len()
    }

    pub fn register_gaps(&self) -> Vec<Duration> {
        let registers = self.registers.lock().unwrap();
        registers.windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn dtmf_sequence(&self) -> String {
        self.dtmf_tones
            .lock()
            .unwrap()
            .iter()
            .map(|(_, tone, _)| *tone)
            .collect()
    }

    pub fn dtmf_gaps(&self) -> Vec<Duration> {
        let tones = self.dtmf_tones.lock().unwrap();
        tones.windows(2).map(|w| w[1].2 - w[0].2).collect()
    }

    /// Wire up an event channel, as the facade does.
    pub fn event_channel(&self) -> mpsc::UnboundedReceiver<SignalingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(tx);
        rx
    }

    pub fn push_event(&self, event: SignalingEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn register(&self, _aor: &SipUri, expires: u32) -> Result<RegistrationGrant> {
        self.registers.lock().unwrap().push(Instant::now());

        let delay = self.register_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let failures = self.register_failures_left.load(Ordering::SeqCst);
        if failures > 0 {
            if failures != u32::MAX {
                self.register_failures_left
                    .store(failures - 1, Ordering::SeqCst);
            }
            return Err(ClientError::RemoteRejection(
                "403 Forbidden".to_string(),
            ));
        }

        let granted = self.granted_expires.load(Ordering::SeqCst);
        Ok(RegistrationGrant {
            expires: if granted > 0 { granted } else { expires },
        })
    }

    async fn unregister(&self, _aor: &SipUri) -> Result<()> {
        if self.fail_unregister.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("send failed".to_string()));
        }
        Ok(())
    }

    async fn invite(
        &self,
        call_id: CallId,
        target: &SipUri,
        _audio: bool,
        _video: bool,
    ) -> Result<()> {
        self.invites.lock().unwrap().push((call_id, target.clone()));

        let failures = self.invite_failures_left.load(Ordering::SeqCst);
        if failures > 0 {
            self.invite_failures_left
                .store(failures - 1, Ordering::SeqCst);
            return Err(ClientError::RemoteRejection("486 Busy Here".to_string()));
        }
        Ok(())
    }

    async fn answer(&self, call_id: CallId) -> Result<()> {
        self.answers.lock().unwrap().push(call_id);
        Ok(())
    }

    async fn reject(&self, call_id: CallId, status: u16) -> Result<()> {
        self.rejects.lock().unwrap().push((call_id, status));
        Ok(())
    }

    async fn cancel(&self, call_id: CallId) -> Result<()> {
        self.cancels.lock().unwrap().push(call_id);
        Ok(())
    }

    async fn bye(&self, call_id: CallId) -> Result<()> {
        self.byes.lock().unwrap().push(call_id);
        Ok(())
    }

    async fn set_hold(&self, call_id: CallId, on_hold: bool) -> Result<()> {
        if self.fail_hold.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("send failed".to_string()));
        }
        self.holds.lock().unwrap().push((call_id, on_hold));
        Ok(())
    }

    async fn send_dtmf_tone(&self, call_id: CallId, tone: char, _duration: Duration) -> Result<()> {
        self.dtmf_tones
            .lock()
            .unwrap()
            .push((call_id, tone, Instant::now()));
        Ok(())
    }

    async fn refer(&self, call_id: CallId, target: &SipUri) -> Result<()> {
        if self.fail_refer.load(Ordering::SeqCst) {
            return Err(ClientError::RemoteRejection("603 Decline".to_string()));
        }
        self.refers.lock().unwrap().push((call_id, target.clone()));
        Ok(())
    }

    async fn refer_with_replaces(&self, call_id: CallId, replacement: CallId) -> Result<()> {
        if self.fail_refer.load(Ordering::SeqCst) {
            return Err(ClientError::RemoteRejection("603 Decline".to_string()));
        }
        self.refer_replaces
            .lock()
            .unwrap()
            .push((call_id, replacement));
        Ok(())
    }

    async fn moderator_mute(
        &self,
        _conference_id: ConferenceId,
        participant: &SipUri,
        muted: bool,
    ) -> Result<()> {
        self.moderator_mutes
            .lock()
            .unwrap()
            .push((participant.clone(), muted));
        Ok(())
    }

    async fn set_recording(&self, _conference_id: ConferenceId, recording: bool) -> Result<()> {
        if self.fail_recording.load(Ordering::SeqCst) {
            return Err(ClientError::RemoteRejection(
                "488 Not Acceptable".to_string(),
            ));
        }
        self.recordings.lock().unwrap().push(recording);
        Ok(())
    }

    async fn send_message(
        &self,
        message_id: MessageId,
        to: &SipUri,
        content: &str,
        _content_type: &str,
    ) -> Result<()> {
        if self.fail_message.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("send failed".to_string()));
        }
        self.sent_messages
            .lock()
            .unwrap()
            .push((message_id, to.clone(), content.to_string()));
        Ok(())
    }

    async fn send_disposition(
        &self,
        message_id: MessageId,
        _to: &SipUri,
        kind: DispositionKind,
    ) -> Result<()> {
        self.dispositions.lock().unwrap().push((message_id, kind));
        Ok(())
    }

    async fn send_composing(&self, to: &SipUri, active: bool) -> Result<()> {
        if self.fail_composing.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("send failed".to_string()));
        }
        self.composings.lock().unwrap().push((to.clone(), active));
        Ok(())
    }

    async fn options_ping(&self) -> Result<()> {
        self.options_pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Media provider fake with settable audio levels.
pub struct FakeMedia {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    fail_acquire: AtomicBool,
    pub mutes: Mutex<Vec<(Uuid, bool)>>,
    levels: Mutex<HashMap<String, f32>>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            fail_acquire: AtomicBool::new(false),
            mutes: Mutex::new(Vec::new()),
            levels: Mutex::new(HashMap::new()),
        })
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn set_level(&self, uri: &str, level: f32) {
        self.levels
            .lock()
            .unwrap()
            .insert(uri.to_string(), level);
    }

    pub fn clear_levels(&self) {
        self.levels.lock().unwrap().clear();
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProvider for FakeMedia {
    async fn acquire(&self, directions: MediaDirections) -> Result<MediaSessionHandle> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(ClientError::Media(
                "Capture device unavailable".to_string(),
            ));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MediaSessionHandle {
            id: Uuid::new_v4(),
            directions,
        })
    }

    async fn release(&self, _handle: MediaSessionHandle) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn set_muted(&self, handle: &MediaSessionHandle, muted: bool) {
        self.mutes.lock().unwrap().push((handle.id, muted));
    }

    fn audio_level(&self, participant: &SipUri) -> Option<f32> {
        self.levels
            .lock()
            .unwrap()
            .get(participant.as_str())
            .copied()
    }
}
