//! Scripted collaborators for facade-level tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;
use warbler::domain::media::{MediaDirections, MediaProvider, MediaSessionHandle};
use warbler::domain::shared::value_objects::{CallId, ConferenceId, MessageId, SipUri};
use warbler::domain::signaling::{
    DispositionKind, RegistrationGrant, SignalingChannel, SignalingEvent,
};
use warbler::{ClientError, Result};

/// Signaling fake that accepts everything and records the interesting
/// bits.
#[derive(Default)]
pub struct StubSignaling {
    pub invites: Mutex<Vec<(CallId, SipUri)>>,
    pub byes: Mutex<Vec<CallId>>,
    pub holds: Mutex<Vec<(CallId, bool)>>,
    pub refers: Mutex<Vec<(CallId, SipUri)>>,
    pub dtmf: Mutex<Vec<char>>,
    pub messages: Mutex<Vec<(MessageId, String)>>,
    events: Mutex<Option<mpsc::UnboundedSender<SignalingEvent>>>,
}

impl StubSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

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
impl SignalingChannel for StubSignaling {
    async fn register(&self, _aor: &SipUri, expires: u32) -> Result<RegistrationGrant> {
        Ok(RegistrationGrant { expires })
    }

    async fn unregister(&self, _aor: &SipUri) -> Result<()> {
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
        Ok(())
    }

    async fn answer(&self, _call_id: CallId) -> Result<()> {
        Ok(())
    }

    async fn reject(&self, _call_id: CallId, _status: u16) -> Result<()> {
        Ok(())
    }

    async fn cancel(&self, _call_id: CallId) -> Result<()> {
        Ok(())
    }

    async fn bye(&self, call_id: CallId) -> Result<()> {
        self.byes.lock().unwrap().push(call_id);
        Ok(())
    }

    async fn set_hold(&self, call_id: CallId, on_hold: bool) -> Result<()> {
        self.holds.lock().unwrap().push((call_id, on_hold));
        Ok(())
    }

    async fn send_dtmf_tone(&self, _call_id: CallId, tone: char, _duration: Duration) -> Result<()> {
        self.dtmf.lock().unwrap().push(tone);
        Ok(())
    }

    async fn refer(&self, call_id: CallId, target: &SipUri) -> Result<()> {
        self.refers.lock().unwrap().push((call_id, target.clone()));
        Ok(())
    }

    async fn refer_with_replaces(&self, _call_id: CallId, _replacement: CallId) -> Result<()> {
        Ok(())
    }

    async fn moderator_mute(
        &self,
        _conference_id: ConferenceId,
        _participant: &SipUri,
        _muted: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn set_recording(&self, _conference_id: ConferenceId, _recording: bool) -> Result<()> {
        Ok(())
    }

    async fn send_message(
        &self,
        message_id: MessageId,
        _to: &SipUri,
        content: &str,
        _content_type: &str,
    ) -> Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((message_id, content.to_string()));
        Ok(())
    }

    async fn send_disposition(
        &self,
        _message_id: MessageId,
        _to: &SipUri,
        _kind: DispositionKind,
    ) -> Result<()> {
        Ok(())
    }

    async fn send_composing(&self, _to: &SipUri, _active: bool) -> Result<()> {
        Ok(())
    }

    async fn options_ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Media fake counting acquisitions and releases.
#[derive(Default)]
pub struct StubMedia {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub fail_acquire: std::sync::atomic::AtomicBool,
}

impl StubMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MediaProvider for StubMedia {
    async fn acquire(&self, directions: MediaDirections) -> Result<MediaSessionHandle> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(ClientError::Media("Capture device unavailable".to_string()));
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

    fn set_muted(&self, _handle: &MediaSessionHandle, _muted: bool) {}

    fn audio_level(&self, _participant: &SipUri) -> Option<f32> {
        None
    }
}
