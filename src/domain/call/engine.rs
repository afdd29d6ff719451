//! Call session engine
//!
//! Owns every [`CallSession`] and drives it through the state machine:
//! dial/answer/reject, hold, mute, DTMF and hangup. Media is acquired
//! before the INVITE goes out and always released when a call ends,
//! fails or is canceled.

use crate::config::CallConfig;
use crate::domain::call::dtmf::{self, DtmfOptions};
use crate::domain::call::session::{CallDirection, CallSession, CallState, CallStats};
use crate::domain::media::{MediaDirections, MediaProvider, MediaSessionHandle};
use crate::domain::shared::error::ClientError;
use crate::domain::shared::events::{EventBus, SessionEvent};
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, SipUri};
use crate::domain::signaling::SignalingChannel;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tokio_util::sync::CancellationToken;

const DEFAULT_REJECT_STATUS: u16 = 486;
const DECLINE_STATUS: u16 = 603;

/// Releases the per-call operation flag when an operation finishes,
/// whatever the outcome.
struct OpGuard<'a> {
    engine: &'a CallSessionEngine,
    call_id: CallId,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.engine.busy.lock().unwrap().remove(&self.call_id);
    }
}

/// Per-call state machine driver.
pub struct CallSessionEngine {
    local_uri: SipUri,
    local_display_name: Option<String>,
    config: CallConfig,
    signaling: Arc<dyn SignalingChannel>,
    media: Arc<dyn MediaProvider>,
    bus: Arc<EventBus>,
    sessions: RwLock<HashMap<CallId, CallSession>>,
    busy: Mutex<HashSet<CallId>>,
    dtmf_tasks: Mutex<HashMap<CallId, JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl CallSessionEngine {
    pub fn new(
        local_uri: SipUri,
        local_display_name: Option<String>,
        config: CallConfig,
        signaling: Arc<dyn SignalingChannel>,
        media: Arc<dyn MediaProvider>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_uri,
            local_display_name,
            config,
            signaling,
            media,
            bus,
            sessions: RwLock::new(HashMap::new()),
            busy: Mutex::new(HashSet::new()),
            dtmf_tasks: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn get_call(&self, call_id: CallId) -> Option<CallSession> {
        self.sessions.read().unwrap().get(&call_id).cloned()
    }

    pub fn list_calls(&self) -> Vec<CallSession> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    /// The established call, if there is exactly one candidate. Used by
    /// transfer and conference coordination.
    pub fn established_call(&self) -> Option<CallSession> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .find(|s| s.is_established())
            .cloned()
    }

    pub fn get_stats(&self, call_id: CallId) -> Result<CallStats> {
        self.sessions
            .read()
            .unwrap()
            .get(&call_id)
            .map(|s| s.stats())
            .ok_or_else(|| ClientError::NotFound(format!("Unknown call: {}", call_id)))
    }

    /// Start an outgoing call. Media is acquired first and rolled back
    /// if the setup fails or `cancel` fires before confirmation.
    pub async fn make_call(
        &self,
        target: &str,
        directions: MediaDirections,
        cancel: CancellationToken,
    ) -> Result<CallId> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ClientError::State("Call engine has been disposed".to_string()));
        }
        let target = SipUri::parse(target)?;

        let call_id = CallId::new();
        let session = CallSession::new_outgoing(
            call_id,
            self.local_uri.clone(),
            self.local_display_name.clone(),
            target.clone(),
        );
        self.sessions.write().unwrap().insert(call_id, session);
        let _guard = self.begin_op(call_id)?;

        let handle = match self.media.acquire(directions).await {
            Ok(handle) => handle,
            Err(e) => {
                self.sessions.write().unwrap().remove(&call_id);
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            debug!("Call setup canceled before INVITE, releasing media");
            self.media.release(handle).await;
            self.sessions.write().unwrap().remove(&call_id);
            return Err(ClientError::Canceled("Call setup canceled".to_string()));
        }

        {
            let mut sessions = self.sessions.write().unwrap();
            let session = sessions.get_mut(&call_id).expect("session just inserted");
            session.media = Some(handle);
            session.transition(CallState::Calling)?;
        }
        self.bus.publish(&SessionEvent::CallInitiated {
            call_id,
            target: target.clone(),
        });

        if let Err(e) = self
            .signaling
            .invite(call_id, &target, directions.audio, directions.video)
            .await
        {
            self.fail_session(call_id, e.to_string()).await;
            return Err(e);
        }

        if cancel.is_cancelled() {
            debug!("Call setup canceled after INVITE, sending CANCEL");
            let _ = self.signaling.cancel(call_id).await;
            self.finalize_session(call_id, Some("canceled".to_string()))
                .await;
            return Err(ClientError::Canceled("Call setup canceled".to_string()));
        }

        info!("Outgoing call {} to {}", call_id, target);
        Ok(call_id)
    }

    /// Answer an incoming ringing call.
    pub async fn answer(&self, call_id: CallId, directions: MediaDirections) -> Result<()> {
        let _guard = self.begin_op(call_id)?;

        {
            let sessions = self.sessions.read().unwrap();
            let session = sessions
                .get(&call_id)
                .ok_or_else(|| ClientError::NotFound(format!("Unknown call: {}", call_id)))?;
            if session.direction != CallDirection::Incoming
                || session.state != CallState::Ringing
            {
                return Err(ClientError::State(format!(
                    "Call cannot be answered in state {}",
                    session.state.as_str()
                )));
            }
        }
        self.apply_transition(call_id, CallState::Answering)?;

        let handle = match self.media.acquire(directions).await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_session(call_id, e.to_string()).await;
                return Err(e);
            }
        };
        if let Some(session) = self.sessions.write().unwrap().get_mut(&call_id) {
            session.media = Some(handle);
        }

        if let Err(e) = self.signaling.answer(call_id).await {
            self.fail_session(call_id, e.to_string()).await;
            return Err(e);
        }

        self.apply_transition(call_id, CallState::Active)?;
        self.bus.publish(&SessionEvent::CallAnswered { call_id });
        info!("Answered call {}", call_id);
        Ok(())
    }

    /// Reject an incoming ringing call.
    pub async fn reject(&self, call_id: CallId, status: Option<u16>) -> Result<()> {
        let _guard = self.begin_op(call_id)?;

        {
            let sessions = self.sessions.read().unwrap();
            let session = sessions
                .get(&call_id)
                .ok_or_else(|| ClientError::NotFound(format!("Unknown call: {}", call_id)))?;
            if session.direction != CallDirection::Incoming
                || session.state != CallState::Ringing
            {
                return Err(ClientError::State(format!(
                    "Call cannot be rejected in state {}",
                    session.state.as_str()
                )));
            }
        }

        let status = status.unwrap_or(DEFAULT_REJECT_STATUS);
        let result = self.signaling.reject(call_id, status).await;
        self.finalize_session(call_id, Some(format!("rejected ({})", status)))
            .await;
        result
    }

    /// Hang up a call in any non-terminal state. The session always
    /// reaches a terminal state, even when the network send fails.
    pub async fn hangup(&self, call_id: CallId) -> Result<()> {
        let _guard = self.begin_op(call_id)?;

        let (state, direction) = {
            let sessions = self.sessions.read().unwrap();
            let session = sessions
                .get(&call_id)
                .ok_or_else(|| ClientError::NotFound(format!("Unknown call: {}", call_id)))?;
            (session.state, session.direction)
        };
        if state.is_terminal() {
            return Ok(());
        }

        let result = match (state, direction) {
            (CallState::Calling | CallState::Ringing, CallDirection::Outgoing) => {
                self.signaling.cancel(call_id).await
            }
            (CallState::Ringing, CallDirection::Incoming) => {
                self.signaling.reject(call_id, DECLINE_STATUS).await
            }
            _ => self.signaling.bye(call_id).await,
        };

        self.finalize_session(call_id, Some("hangup".to_string()))
            .await;
        result
    }

    /// Place the call on hold. A no-op when already held.
    pub async fn hold(&self, call_id: CallId) -> Result<()> {
        let _guard = self.begin_op(call_id)?;

        {
            let sessions = self.sessions.read().unwrap();
            let session = sessions
                .get(&call_id)
                .ok_or_else(|| ClientError::NotFound(format!("Unknown call: {}", call_id)))?;
            if session.is_on_hold {
                return Ok(());
            }
            if session.state != CallState::Active {
                return Err(ClientError::State(format!(
                    "Call cannot be held in state {}",
                    session.state.as_str()
                )));
            }
        }

        self.apply_transition(call_id, CallState::Holding)?;
        match self.signaling.set_hold(call_id, true).await {
            Ok(()) => {
                {
                    let mut sessions = self.sessions.write().unwrap();
                    if let Some(session) = sessions.get_mut(&call_id) {
                        session.transition(CallState::Held)?;
                        session.is_on_hold = true;
                    }
                }
                self.bus.publish(&SessionEvent::CallHeld { call_id });
                Ok(())
            }
            Err(e) => {
                // Roll the re-INVITE back; the call stays active.
                let _ = self.apply_transition(call_id, CallState::Active);
                Err(e)
            }
        }
    }

    /// Resume a held call. A no-op when not on hold.
    pub async fn unhold(&self, call_id: CallId) -> Result<()> {
        let _guard = self.begin_op(call_id)?;

        {
            let sessions = self.sessions.read().unwrap();
            let session = sessions
                .get(&call_id)
                .ok_or_else(|| ClientError::NotFound(format!("Unknown call: {}", call_id)))?;
            if !session.is_on_hold {
                return Ok(());
            }
            if session.state != CallState::Held {
                return Err(ClientError::State(format!(
                    "Call cannot be resumed in state {}",
                    session.state.as_str()
                )));
            }
        }

        self.apply_transition(call_id, CallState::Holding)?;
        match self.signaling.set_hold(call_id, false).await {
            Ok(()) => {
                {
                    let mut sessions = self.sessions.write().unwrap();
                    if let Some(session) = sessions.get_mut(&call_id) {
                        session.transition(CallState::Active)?;
                        session.is_on_hold = false;
                    }
                }
                self.bus.publish(&SessionEvent::CallResumed { call_id });
                Ok(())
            }
            Err(e) => {
                let _ = self.apply_transition(call_id, CallState::Held);
                Err(e)
            }
        }
    }

    pub fn mute(&self, call_id: CallId) -> Result<()> {
        self.set_muted(call_id, true)
    }

    pub fn unmute(&self, call_id: CallId) -> Result<()> {
        self.set_muted(call_id, false)
    }

    /// Local-only mute toggle; no network round-trip, idempotent.
    pub fn set_muted(&self, call_id: CallId, muted: bool) -> Result<()> {
        let handle = {
            let mut sessions = self.sessions.write().unwrap();
            let session = sessions
                .get_mut(&call_id)
                .ok_or_else(|| ClientError::NotFound(format!("Unknown call: {}", call_id)))?;
            if session.is_muted == muted {
                return Ok(());
            }
            session.is_muted = muted;
            session.media.clone()
        };

        if let Some(handle) = handle {
            self.media.set_muted(&handle, muted);
        }
        self.bus.publish(&SessionEvent::CallMuted { call_id, muted });
        Ok(())
    }

    /// Send a DTMF tone sequence. Tones go out one at a time with the
    /// configured gap in between; `stop_dtmf` discards whatever is left.
    pub fn send_dtmf(
        &self,
        call_id: CallId,
        tones: &str,
        options: Option<DtmfOptions>,
    ) -> Result<()> {
        let tones = dtmf::parse_sequence(tones)?;

        {
            let sessions = self.sessions.read().unwrap();
            let session = sessions
                .get(&call_id)
                .ok_or_else(|| ClientError::NotFound(format!("Unknown call: {}", call_id)))?;
            if !session.is_established() {
                return Err(ClientError::State(
                    "DTMF requires an established call".to_string(),
                ));
            }
        }

        let mut tasks = self.dtmf_tasks.lock().unwrap();
        if let Some(existing) = tasks.get(&call_id) {
            if !existing.is_finished() {
                return Err(ClientError::Concurrency(
                    "DTMF sequence already in progress".to_string(),
                ));
            }
        }

        let options = options.unwrap_or_else(|| DtmfOptions::from_config(&self.config));
        let signaling = Arc::clone(&self.signaling);
        let bus = Arc::clone(&self.bus);

        let task = tokio::spawn(async move {
            for (index, tone) in tones.into_iter().enumerate() {
                if index > 0 {
                    tokio::time::sleep(options.inter_tone_gap).await;
                }
                match signaling
                    .send_dtmf_tone(call_id, tone.to_char(), options.tone_duration)
                    .await
                {
                    Ok(()) => bus.publish(&SessionEvent::CallDtmfSent {
                        call_id,
                        tone: tone.to_char(),
                    }),
                    Err(e) => {
                        warn!("DTMF tone '{}' failed: {}", tone.to_char(), e);
                        break;
                    }
                }
            }
        });
        tasks.insert(call_id, task);
        Ok(())
    }

    /// Cancel an in-flight DTMF sequence; remaining tones are dropped.
    pub fn stop_dtmf(&self, call_id: CallId) {
        if let Some(task) = self.dtmf_tasks.lock().unwrap().remove(&call_id) {
            task.abort();
            debug!("Stopped DTMF sequence for call {}", call_id);
        }
    }

    /// New remote INVITE.
    pub fn on_incoming_call(
        &self,
        call_id: CallId,
        from: SipUri,
        display_name: Option<String>,
    ) {
        {
            let mut sessions = self.sessions.write().unwrap();
            if sessions.contains_key(&call_id) {
                warn!("Duplicate incoming call id {}", call_id);
                return;
            }
            let mut session = CallSession::new_incoming(
                call_id,
                self.local_uri.clone(),
                from.clone(),
                display_name.clone(),
            );
            let _ = session.transition(CallState::Ringing);
            sessions.insert(call_id, session);
        }
        info!("Incoming call {} from {}", call_id, from);
        self.bus.publish(&SessionEvent::CallIncoming {
            call_id,
            from,
            display_name,
        });
    }

    /// Provisional response for an outgoing call.
    pub fn on_provisional(&self, call_id: CallId) {
        let ringing = {
            let mut sessions = self.sessions.write().unwrap();
            match sessions.get_mut(&call_id) {
                Some(session) => {
                    session.provisional_count += 1;
                    session.state == CallState::Calling
                        && session.transition(CallState::Ringing).is_ok()
                }
                None => false,
            }
        };
        if ringing {
            self.bus.publish(&SessionEvent::CallRinging { call_id });
        }
    }

    /// Remote party accepted an outgoing call.
    pub fn on_accepted(&self, call_id: CallId) {
        let answered = {
            let mut sessions = self.sessions.write().unwrap();
            match sessions.get_mut(&call_id) {
                Some(session) => session.transition(CallState::Active).is_ok(),
                None => false,
            }
        };
        if answered {
            self.bus.publish(&SessionEvent::CallAnswered { call_id });
        } else {
            warn!("Unexpected acceptance for call {}", call_id);
        }
    }

    /// Remote BYE / teardown confirmation.
    pub async fn on_remote_terminated(&self, call_id: CallId, cause: Option<String>) {
        if self.get_call(call_id).is_none() {
            return;
        }
        self.finalize_session(call_id, cause.or_else(|| Some("remote hangup".to_string())))
            .await;
    }

    /// Final failure response.
    pub async fn on_remote_failure(&self, call_id: CallId, status: u16, reason: String) {
        if self.get_call(call_id).is_none() {
            return;
        }
        self.fail_session(call_id, format!("{} {}", status, reason))
            .await;
    }

    /// Idempotent teardown: cancels DTMF tasks and releases all media.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (_, task) in self.dtmf_tasks.lock().unwrap().drain() {
            task.abort();
        }

        let handles: Vec<MediaSessionHandle> = {
            let mut sessions = self.sessions.write().unwrap();
            sessions.values_mut().filter_map(|s| s.media.take()).collect()
        };
        for handle in handles {
            self.media.release(handle).await;
        }
    }

    fn begin_op(&self, call_id: CallId) -> Result<OpGuard<'_>> {
        let mut busy = self.busy.lock().unwrap();
        if !busy.insert(call_id) {
            return Err(ClientError::Concurrency(format!(
                "Operation already in progress for call {}",
                call_id
            )));
        }
        Ok(OpGuard {
            engine: self,
            call_id,
        })
    }

    fn apply_transition(&self, call_id: CallId, next: CallState) -> Result<()> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .get_mut(&call_id)
            .ok_or_else(|| ClientError::NotFound(format!("Unknown call: {}", call_id)))?;
        session.transition(next)
    }

    fn take_media(&self, call_id: CallId) -> Option<MediaSessionHandle> {
        self.sessions
            .write()
            .unwrap()
            .get_mut(&call_id)
            .and_then(|s| s.media.take())
    }

    async fn finalize_session(&self, call_id: CallId, cause: Option<String>) {
        self.stop_dtmf(call_id);
        if let Some(handle) = self.take_media(call_id) {
            self.media.release(handle).await;
        }

        let terminated = {
            let mut sessions = self.sessions.write().unwrap();
            match sessions.get_mut(&call_id) {
                Some(session) if !session.state.is_terminal() => {
                    if session.state != CallState::Terminating {
                        let _ = session.transition(CallState::Terminating);
                    }
                    let _ = session.transition(CallState::Terminated);
                    session.termination_cause = cause.clone();
                    true
                }
                _ => false,
            }
        };

        if terminated {
            info!("Call {} terminated ({:?})", call_id, cause);
            self.bus
                .publish(&SessionEvent::CallTerminated { call_id, cause });
        }
    }

    async fn fail_session(&self, call_id: CallId, error: String) {
        self.stop_dtmf(call_id);
        if let Some(handle) = self.take_media(call_id) {
            self.media.release(handle).await;
        }

        let failed = {
            let mut sessions = self.sessions.write().unwrap();
            match sessions.get_mut(&call_id) {
                Some(session) if !session.state.is_terminal() => {
                    let _ = session.transition(CallState::Failed);
                    session.termination_cause = Some(error.clone());
                    true
                }
                _ => false,
            }
        };

        if failed {
            warn!("Call {} failed: {}", call_id, error);
            self.bus.publish(&SessionEvent::CallFailed { call_id, error });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::test_support::{FakeMedia, FakeSignaling};
    use std::time::Duration;

    struct Fixture {
        engine: Arc<CallSessionEngine>,
        signaling: Arc<FakeSignaling>,
        media: Arc<FakeMedia>,
        bus: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let signaling = FakeSignaling::new();
        let media = FakeMedia::new();
        let bus = Arc::new(EventBus::new());
        let engine = CallSessionEngine::new(
            SipUri::parse("sip:alice@example.com").unwrap(),
            Some("Alice".to_string()),
            CallConfig::default(),
            signaling.clone(),
            media.clone(),
            bus.clone(),
        );
        Fixture {
            engine,
            signaling,
            media,
            bus,
        }
    }

    fn topic_collector(bus: &EventBus, pattern: &str) -> Arc<Mutex<Vec<&'static str>>> {
        let topics = Arc::new(Mutex::new(Vec::new()));
        let sink = topics.clone();
        bus.subscribe(pattern, move |event| {
            sink.lock().unwrap().push(event.topic());
        });
        topics
    }

    async fn established_call(f: &Fixture) -> CallId {
        let call_id = f
            .engine
            .make_call(
                "sip:bob@example.com",
                MediaDirections::audio_only(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        f.engine.on_accepted(call_id);
        call_id
    }

    #[tokio::test]
    async fn test_outgoing_call_lifecycle() {
        let f = fixture();
        let topics = topic_collector(&f.bus, "call:*");

        let call_id = f
            .engine
            .make_call(
                "sip:bob@example.com",
                MediaDirections::audio_only(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(f.engine.get_call(call_id).unwrap().state, CallState::Calling);
        assert_eq!(f.media.acquired_count(), 1);

        f.engine.on_provisional(call_id);
        assert_eq!(f.engine.get_call(call_id).unwrap().state, CallState::Ringing);

        f.engine.on_accepted(call_id);
        let session = f.engine.get_call(call_id).unwrap();
        assert_eq!(session.state, CallState::Active);
        assert!(session.answered_at.is_some());

        f.engine.hangup(call_id).await.unwrap();
        let session = f.engine.get_call(call_id).unwrap();
        assert_eq!(session.state, CallState::Terminated);
        assert_eq!(f.media.released_count(), 1);
        assert_eq!(*f.signaling.byes.lock().unwrap(), vec![call_id]);

        assert_eq!(
            *topics.lock().unwrap(),
            vec![
                "call:initiated",
                "call:ringing",
                "call:answered",
                "call:terminated"
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_target_rejected_before_any_side_effect() {
        let f = fixture();
        let result = f
            .engine
            .make_call("", MediaDirections::audio_only(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ClientError::Configuration(_))));
        assert_eq!(f.media.acquired_count(), 0);
        assert!(f.signaling.invites.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_media_failure_rolls_back_session() {
        let f = fixture();
        f.media.fail_acquire(true);

        let result = f
            .engine
            .make_call(
                "sip:bob@example.com",
                MediaDirections::audio_only(),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ClientError::Media(_))));
        assert!(f.engine.list_calls().is_empty());
        assert!(f.signaling.invites.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invite_rejection_fails_call_and_releases_media() {
        let f = fixture();
        f.signaling.fail_invites(1);

        let result = f
            .engine
            .make_call(
                "sip:bob@example.com",
                MediaDirections::audio_only(),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ClientError::RemoteRejection(_))));

        let session = &f.engine.list_calls()[0];
        assert_eq!(session.state, CallState::Failed);
        assert_eq!(f.media.released_count(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_releases_media_without_failure() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = f
            .engine
            .make_call("sip:bob@example.com", MediaDirections::audio_only(), cancel)
            .await;
        assert!(matches!(result, Err(ClientError::Canceled(_))));
        assert!(f.engine.list_calls().is_empty());
        assert_eq!(f.media.acquired_count(), 1);
        assert_eq!(f.media.released_count(), 1);
    }

    #[tokio::test]
    async fn test_incoming_answer_flow() {
        let f = fixture();
        let call_id = CallId::new();
        f.engine.on_incoming_call(
            call_id,
            SipUri::parse("sip:bob@example.com").unwrap(),
            Some("Bob".to_string()),
        );
        assert_eq!(f.engine.get_call(call_id).unwrap().state, CallState::Ringing);

        f.engine
            .answer(call_id, MediaDirections::audio_only())
            .await
            .unwrap();
        let session = f.engine.get_call(call_id).unwrap();
        assert_eq!(session.state, CallState::Active);
        assert_eq!(session.direction, CallDirection::Incoming);
        assert_eq!(*f.signaling.answers.lock().unwrap(), vec![call_id]);
    }

    #[tokio::test]
    async fn test_answer_outgoing_call_is_a_state_error() {
        let f = fixture();
        let call_id = established_call(&f).await;

        let result = f.engine.answer(call_id, MediaDirections::audio_only()).await;
        assert!(matches!(result, Err(ClientError::State(_))));
    }

    #[tokio::test]
    async fn test_reject_incoming_call() {
        let f = fixture();
        let call_id = CallId::new();
        f.engine
            .on_incoming_call(call_id, SipUri::parse("sip:bob@example.com").unwrap(), None);

        f.engine.reject(call_id, None).await.unwrap();
        assert_eq!(
            f.engine.get_call(call_id).unwrap().state,
            CallState::Terminated
        );
        assert_eq!(*f.signaling.rejects.lock().unwrap(), vec![(call_id, 486)]);
    }

    #[tokio::test]
    async fn test_hold_unhold_cycle_and_idempotence() {
        let f = fixture();
        let call_id = established_call(&f).await;
        let topics = topic_collector(&f.bus, "call:held");

        f.engine.hold(call_id).await.unwrap();
        assert_eq!(f.engine.get_call(call_id).unwrap().state, CallState::Held);
        assert!(f.engine.get_call(call_id).unwrap().is_on_hold);

        // Second hold is a silent no-op.
        f.engine.hold(call_id).await.unwrap();
        assert_eq!(f.signaling.holds.lock().unwrap().len(), 1);
        assert_eq!(topics.lock().unwrap().len(), 1);

        f.engine.unhold(call_id).await.unwrap();
        let session = f.engine.get_call(call_id).unwrap();
        assert_eq!(session.state, CallState::Active);
        assert!(!session.is_on_hold);
    }

    #[tokio::test]
    async fn test_hold_failure_rolls_back_to_active() {
        let f = fixture();
        let call_id = established_call(&f).await;
        f.signaling.fail_hold(true);

        assert!(f.engine.hold(call_id).await.is_err());
        let session = f.engine.get_call(call_id).unwrap();
        assert_eq!(session.state, CallState::Active);
        assert!(!session.is_on_hold);
    }

    #[tokio::test]
    async fn test_mute_is_local_and_idempotent() {
        let f = fixture();
        let call_id = established_call(&f).await;
        let topics = topic_collector(&f.bus, "call:muted");

        f.engine.mute(call_id).unwrap();
        f.engine.mute(call_id).unwrap();
        assert!(f.engine.get_call(call_id).unwrap().is_muted);
        assert_eq!(topics.lock().unwrap().len(), 1);
        assert_eq!(f.media.mutes.lock().unwrap().len(), 1);

        f.engine.unmute(call_id).unwrap();
        assert!(!f.engine.get_call(call_id).unwrap().is_muted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dtmf_sequence_order_and_gaps() {
        let f = fixture();
        let call_id = established_call(&f).await;
        let topics = topic_collector(&f.bus, "call:dtmf");

        f.engine.send_dtmf(call_id, "1A*#", None).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(f.signaling.dtmf_sequence(), "1A*#");
        let gaps = f.signaling.dtmf_gaps();
        assert_eq!(gaps.len(), 3);
        assert!(gaps.iter().all(|g| *g == Duration::from_millis(70)));
        assert_eq!(topics.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dtmf_stop_discards_remaining_tones() {
        let f = fixture();
        let call_id = established_call(&f).await;

        let options = DtmfOptions {
            tone_duration: Duration::from_millis(100),
            inter_tone_gap: Duration::from_millis(500),
        };
        f.engine.send_dtmf(call_id, "123456", Some(options)).unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        f.engine.stop_dtmf(call_id);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(f.signaling.dtmf_sequence(), "12");
    }

    #[tokio::test]
    async fn test_dtmf_validation_and_concurrency() {
        let f = fixture();
        let call_id = established_call(&f).await;

        assert!(matches!(
            f.engine.send_dtmf(call_id, "12E", None),
            Err(ClientError::Configuration(_))
        ));

        let options = DtmfOptions {
            tone_duration: Duration::from_millis(100),
            inter_tone_gap: Duration::from_secs(5),
        };
        f.engine.send_dtmf(call_id, "11111", Some(options)).unwrap();
        assert!(matches!(
            f.engine.send_dtmf(call_id, "2", None),
            Err(ClientError::Concurrency(_))
        ));
    }

    #[tokio::test]
    async fn test_operations_after_termination_fail() {
        let f = fixture();
        let call_id = established_call(&f).await;
        f.engine.hangup(call_id).await.unwrap();

        assert!(matches!(
            f.engine.hold(call_id).await,
            Err(ClientError::State(_))
        ));
        assert!(matches!(
            f.engine.send_dtmf(call_id, "1", None),
            Err(ClientError::State(_))
        ));
        // Hanging up again stays quiet.
        f.engine.hangup(call_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_bye_finalizes_session() {
        let f = fixture();
        let call_id = established_call(&f).await;

        f.engine
            .on_remote_terminated(call_id, Some("BYE".to_string()))
            .await;
        let session = f.engine.get_call(call_id).unwrap();
        assert_eq!(session.state, CallState::Terminated);
        assert_eq!(session.termination_cause.as_deref(), Some("BYE"));
        assert_eq!(f.media.released_count(), 1);
    }

    #[tokio::test]
    async fn test_get_stats() {
        let f = fixture();
        let call_id = established_call(&f).await;
        f.engine.hangup(call_id).await.unwrap();

        let stats = f.engine.get_stats(call_id).unwrap();
        assert_eq!(stats.state, CallState::Terminated);
        assert!(stats.setup_time_ms.is_some());
        assert!(stats.talk_time_ms.is_some());

        assert!(f.engine.get_stats(CallId::new()).is_err());
    }

    #[tokio::test]
    async fn test_dispose_releases_all_media() {
        let f = fixture();
        let _first = established_call(&f).await;
        let _second = established_call(&f).await;

        f.engine.dispose().await;
        assert_eq!(f.media.released_count(), 2);

        let result = f
            .engine
            .make_call(
                "sip:bob@example.com",
                MediaDirections::audio_only(),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ClientError::State(_))));
    }
}
