//! Call transfer coordination
//!
//! Blind transfer REFERs the remote party straight to the target.
//! Attended transfer holds the original call, dials a consultation call
//! and finally replaces the original dialog with the consultation one.
//! Only one transfer may be active across the engine at a time.

use crate::domain::call::engine::CallSessionEngine;
use crate::domain::media::MediaDirections;
use crate::domain::shared::error::ClientError;
use crate::domain::shared::events::{EventBus, SessionEvent};
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, SipUri, TransferId};
use crate::domain::signaling::SignalingChannel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Completed/failed transfers stay visible this long before the record
/// is cleared. Purely a grace period for observers.
const CLEAR_DELAY: Duration = Duration::from_secs(2);

/// Transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    Initiated,
    InProgress,
    Accepted,
    Completed,
    Failed,
    Canceled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Canceled
        )
    }
}

/// Transfer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Blind,
    Attended,
}

/// A single transfer operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub kind: TransferKind,
    pub state: TransferState,
    pub target: SipUri,
    pub call_id: CallId,
    pub consultation_call_id: Option<CallId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Transfer {
    fn new(kind: TransferKind, target: SipUri, call_id: CallId) -> Self {
        Self {
            id: TransferId::new(),
            kind,
            state: TransferState::Initiated,
            target,
            call_id,
            consultation_call_id: None,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }
}

/// Orchestrates blind and attended transfers on top of the call engine.
pub struct TransferCoordinator {
    engine: Arc<CallSessionEngine>,
    signaling: Arc<dyn SignalingChannel>,
    bus: Arc<EventBus>,
    active: RwLock<Option<Transfer>>,
    in_flight: AtomicBool,
    clear_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
    weak_self: Weak<TransferCoordinator>,
}

struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl TransferCoordinator {
    pub fn new(
        engine: Arc<CallSessionEngine>,
        signaling: Arc<dyn SignalingChannel>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            engine,
            signaling,
            bus,
            active: RwLock::new(None),
            in_flight: AtomicBool::new(false),
            clear_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    pub fn active_transfer(&self) -> Option<Transfer> {
        self.active.read().unwrap().clone()
    }

    fn has_running_transfer(&self) -> bool {
        self.active
            .read()
            .unwrap()
            .as_ref()
            .map(|t| !t.state.is_terminal())
            .unwrap_or(false)
    }

    /// Transfer the remote party of `call_id` to `target` without
    /// consultation.
    pub async fn blind_transfer(&self, call_id: CallId, target: &str) -> Result<TransferId> {
        let _guard = self.begin()?;
        if self.has_running_transfer() {
            return Err(ClientError::Concurrency(
                "Another transfer is already in progress".to_string(),
            ));
        }

        let target = SipUri::parse(target)?;
        let session = self
            .engine
            .get_call(call_id)
            .ok_or_else(|| ClientError::NotFound(format!("Unknown call: {}", call_id)))?;
        if !session.is_established() {
            return Err(ClientError::State(
                "Transfer requires an established call".to_string(),
            ));
        }

        let transfer = Transfer::new(TransferKind::Blind, target.clone(), call_id);
        let transfer_id = transfer.id;
        *self.active.write().unwrap() = Some(transfer);
        self.bus.publish(&SessionEvent::TransferInitiated {
            transfer_id,
            kind: TransferKind::Blind,
            target: target.clone(),
        });

        if let Err(e) = self.signaling.refer(call_id, &target).await {
            self.mark_failed(e.to_string());
            return Err(e);
        }

        info!("Blind transfer of {} to {} completed", call_id, target);
        self.mark_completed();
        Ok(transfer_id)
    }

    /// Hold the original call and dial a consultation call to `target`.
    pub async fn initiate_attended(&self, call_id: CallId, target: &str) -> Result<TransferId> {
        let _guard = self.begin()?;
        if self.has_running_transfer() {
            return Err(ClientError::Concurrency(
                "Another transfer is already in progress".to_string(),
            ));
        }

        let target = SipUri::parse(target)?;
        let session = self
            .engine
            .get_call(call_id)
            .ok_or_else(|| ClientError::NotFound(format!("Unknown call: {}", call_id)))?;
        if !session.is_established() {
            return Err(ClientError::State(
                "Transfer requires an established call".to_string(),
            ));
        }

        let transfer = Transfer::new(TransferKind::Attended, target.clone(), call_id);
        let transfer_id = transfer.id;
        *self.active.write().unwrap() = Some(transfer);
        self.bus.publish(&SessionEvent::TransferInitiated {
            transfer_id,
            kind: TransferKind::Attended,
            target: target.clone(),
        });

        if let Err(e) = self.engine.hold(call_id).await {
            self.mark_failed(format!("Failed to hold original call: {}", e));
            return Err(e);
        }

        let consultation = match self
            .engine
            .make_call(
                target.as_str(),
                MediaDirections::audio_only(),
                CancellationToken::new(),
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                if let Err(unhold_err) = self.engine.unhold(call_id).await {
                    warn!("Could not resume original call: {}", unhold_err);
                }
                self.mark_failed(format!("Consultation call failed: {}", e));
                return Err(e);
            }
        };

        self.update(|t| {
            t.consultation_call_id = Some(consultation);
            t.state = TransferState::InProgress;
        });
        self.bus.publish(&SessionEvent::TransferProgress {
            transfer_id,
            state: TransferState::InProgress,
        });

        info!(
            "Attended transfer {} consulting {} (call {})",
            transfer_id, target, consultation
        );
        Ok(transfer_id)
    }

    /// Replace the original call with the established consultation call.
    pub async fn complete_attended(&self) -> Result<()> {
        let _guard = self.begin()?;

        let transfer = self
            .active_transfer()
            .filter(|t| t.kind == TransferKind::Attended && t.state == TransferState::InProgress)
            .ok_or_else(|| {
                ClientError::State("No attended transfer in progress".to_string())
            })?;
        let consultation = transfer.consultation_call_id.ok_or_else(|| {
            ClientError::State("No consultation call to complete with".to_string())
        })?;

        let consultation_session = self
            .engine
            .get_call(consultation)
            .ok_or_else(|| ClientError::NotFound(format!("Unknown call: {}", consultation)))?;
        if !consultation_session.is_established() {
            return Err(ClientError::State(
                "No established consultation call".to_string(),
            ));
        }
        if self.engine.get_call(transfer.call_id).is_none() {
            return Err(ClientError::NotFound(format!(
                "Unknown call: {}",
                transfer.call_id
            )));
        }

        if let Err(e) = self
            .signaling
            .refer_with_replaces(transfer.call_id, consultation)
            .await
        {
            self.mark_failed(e.to_string());
            return Err(e);
        }

        self.update(|t| t.state = TransferState::Accepted);
        self.bus.publish(&SessionEvent::TransferProgress {
            transfer_id: transfer.id,
            state: TransferState::Accepted,
        });

        // Both local legs drop out once the far ends are connected.
        if let Err(e) = self.engine.hangup(consultation).await {
            warn!("Could not hang up consultation call: {}", e);
        }
        if let Err(e) = self.engine.hangup(transfer.call_id).await {
            warn!("Could not hang up original call: {}", e);
        }

        info!("Attended transfer {} completed", transfer.id);
        self.mark_completed();
        Ok(())
    }

    /// Abort an attended transfer: drop the consultation call and
    /// resume the original one.
    pub async fn cancel_transfer(&self) -> Result<()> {
        let _guard = self.begin()?;

        let transfer = self
            .active_transfer()
            .filter(|t| !t.state.is_terminal())
            .ok_or_else(|| ClientError::State("No transfer in progress".to_string()))?;

        if let Some(consultation) = transfer.consultation_call_id {
            if let Err(e) = self.engine.hangup(consultation).await {
                warn!("Could not hang up consultation call: {}", e);
            }
        }
        if transfer.kind == TransferKind::Attended {
            if let Err(e) = self.engine.unhold(transfer.call_id).await {
                warn!("Could not resume original call: {}", e);
            }
        }

        self.update(|t| {
            t.state = TransferState::Canceled;
            t.completed_at = Some(Utc::now());
        });
        self.bus.publish(&SessionEvent::TransferCanceled {
            transfer_id: transfer.id,
        });
        self.schedule_clear();
        info!("Transfer {} canceled", transfer.id);
        Ok(())
    }

    /// Idempotent teardown.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.clear_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn begin(&self) -> Result<FlagGuard<'_>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ClientError::State(
                "Transfer coordinator has been disposed".to_string(),
            ));
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Concurrency(
                "Transfer operation already in progress".to_string(),
            ));
        }
        Ok(FlagGuard(&self.in_flight))
    }

    fn update<F: FnOnce(&mut Transfer)>(&self, f: F) {
        if let Some(transfer) = self.active.write().unwrap().as_mut() {
            f(transfer);
        }
    }

    fn mark_completed(&self) {
        let transfer_id = {
            let mut active = self.active.write().unwrap();
            match active.as_mut() {
                Some(transfer) => {
                    transfer.state = TransferState::Completed;
                    transfer.completed_at = Some(Utc::now());
                    transfer.id
                }
                None => return,
            }
        };
        self.bus
            .publish(&SessionEvent::TransferCompleted { transfer_id });
        self.schedule_clear();
    }

    fn mark_failed(&self, error: String) {
        let transfer_id = {
            let mut active = self.active.write().unwrap();
            match active.as_mut() {
                Some(transfer) => {
                    transfer.state = TransferState::Failed;
                    transfer.completed_at = Some(Utc::now());
                    transfer.error = Some(error.clone());
                    transfer.id
                }
                None => return,
            }
        };
        warn!("Transfer {} failed: {}", transfer_id, error);
        self.bus
            .publish(&SessionEvent::TransferFailed { transfer_id, error });
    }

    fn schedule_clear(&self) {
        let weak = self.weak_self.clone();
        let task = tokio::spawn(async move {
            sleep(CLEAR_DELAY).await;
            let Some(coordinator) = weak.upgrade() else { return };
            let mut active = coordinator.active.write().unwrap();
            if active.as_ref().map(|t| t.state.is_terminal()).unwrap_or(false) {
                *active = None;
            }
        });
        if let Some(old) = self.clear_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallConfig;
    use crate::domain::call::session::CallState;
    use crate::domain::test_support::{FakeMedia, FakeSignaling};

    struct Fixture {
        engine: Arc<CallSessionEngine>,
        coordinator: Arc<TransferCoordinator>,
        signaling: Arc<FakeSignaling>,
    }

    fn fixture() -> Fixture {
        let signaling = FakeSignaling::new();
        let media = FakeMedia::new();
        let bus = Arc::new(EventBus::new());
        let engine = CallSessionEngine::new(
            SipUri::parse("sip:alice@example.com").unwrap(),
            None,
            CallConfig::default(),
            signaling.clone(),
            media,
            bus.clone(),
        );
        let coordinator = TransferCoordinator::new(engine.clone(), signaling.clone(), bus);
        Fixture {
            engine,
            coordinator,
            signaling,
        }
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

    #[tokio::test(start_paused = true)]
    async fn test_blind_transfer_completes_and_clears() {
        let f = fixture();
        let call_id = established_call(&f).await;

        f.coordinator
            .blind_transfer(call_id, "sip:carol@example.com")
            .await
            .unwrap();

        let transfer = f.coordinator.active_transfer().unwrap();
        assert_eq!(transfer.state, TransferState::Completed);
        assert_eq!(transfer.kind, TransferKind::Blind);
        assert_eq!(f.signaling.refers.lock().unwrap().len(), 1);

        // The record clears after the display grace period.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(f.coordinator.active_transfer().is_none());
    }

    #[tokio::test]
    async fn test_blind_transfer_requires_established_call() {
        let f = fixture();
        let result = f
            .coordinator
            .blind_transfer(CallId::new(), "sip:carol@example.com")
            .await;
        assert!(matches!(result, Err(ClientError::NotFound(_))));

        let call_id = f
            .engine
            .make_call(
                "sip:bob@example.com",
                MediaDirections::audio_only(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        // Still ringing, not established.
        let result = f
            .coordinator
            .blind_transfer(call_id, "sip:carol@example.com")
            .await;
        assert!(matches!(result, Err(ClientError::State(_))));
    }

    #[tokio::test]
    async fn test_blind_transfer_invalid_target() {
        let f = fixture();
        let call_id = established_call(&f).await;
        let result = f.coordinator.blind_transfer(call_id, "").await;
        assert!(matches!(result, Err(ClientError::Configuration(_))));
        assert!(f.coordinator.active_transfer().is_none());
    }

    #[tokio::test]
    async fn test_refer_failure_marks_transfer_failed() {
        let f = fixture();
        let call_id = established_call(&f).await;
        f.signaling.fail_refer(true);

        let result = f
            .coordinator
            .blind_transfer(call_id, "sip:carol@example.com")
            .await;
        assert!(result.is_err());

        let transfer = f.coordinator.active_transfer().unwrap();
        assert_eq!(transfer.state, TransferState::Failed);
        assert!(transfer.error.is_some());

        // A failed record does not block the next attempt.
        f.signaling.fail_refer(false);
        f.coordinator
            .blind_transfer(call_id, "sip:carol@example.com")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_attended_transfer_full_flow() {
        let f = fixture();
        let call_id = established_call(&f).await;

        let transfer_id = f
            .coordinator
            .initiate_attended(call_id, "sip:carol@example.com")
            .await
            .unwrap();

        // Original call held, consultation dialing.
        assert_eq!(f.engine.get_call(call_id).unwrap().state, CallState::Held);
        let transfer = f.coordinator.active_transfer().unwrap();
        assert_eq!(transfer.id, transfer_id);
        assert_eq!(transfer.state, TransferState::InProgress);
        let consultation = transfer.consultation_call_id.unwrap();

        // Completing before the consultation is answered must fail.
        let early = f.coordinator.complete_attended().await;
        assert!(matches!(early, Err(ClientError::State(_))));

        f.engine.on_accepted(consultation);
        f.coordinator.complete_attended().await.unwrap();

        assert_eq!(
            *f.signaling.refer_replaces.lock().unwrap(),
            vec![(call_id, consultation)]
        );
        let transfer = f.coordinator.active_transfer().unwrap();
        assert_eq!(transfer.state, TransferState::Completed);

        // Both legs were hung up locally.
        assert_eq!(
            f.engine.get_call(call_id).unwrap().state,
            CallState::Terminated
        );
        assert_eq!(
            f.engine.get_call(consultation).unwrap().state,
            CallState::Terminated
        );
    }

    #[tokio::test]
    async fn test_cancel_attended_transfer_restores_original() {
        let f = fixture();
        let call_id = established_call(&f).await;

        f.coordinator
            .initiate_attended(call_id, "sip:carol@example.com")
            .await
            .unwrap();
        let consultation = f
            .coordinator
            .active_transfer()
            .unwrap()
            .consultation_call_id
            .unwrap();
        f.engine.on_accepted(consultation);

        f.coordinator.cancel_transfer().await.unwrap();

        assert_eq!(
            f.coordinator.active_transfer().unwrap().state,
            TransferState::Canceled
        );
        assert_eq!(
            f.engine.get_call(consultation).unwrap().state,
            CallState::Terminated
        );
        let original = f.engine.get_call(call_id).unwrap();
        assert_eq!(original.state, CallState::Active);
        assert!(!original.is_on_hold);
    }

    #[tokio::test]
    async fn test_single_transfer_engine_wide() {
        let f = fixture();
        let call_id = established_call(&f).await;

        f.coordinator
            .initiate_attended(call_id, "sip:carol@example.com")
            .await
            .unwrap();

        let result = f
            .coordinator
            .blind_transfer(call_id, "sip:dave@example.com")
            .await;
        assert!(matches!(result, Err(ClientError::Concurrency(_))));
    }

    #[tokio::test]
    async fn test_consultation_failure_rolls_back_hold() {
        let f = fixture();
        let call_id = established_call(&f).await;
        f.signaling.fail_invites(1);

        let result = f
            .coordinator
            .initiate_attended(call_id, "sip:carol@example.com")
            .await;
        assert!(result.is_err());

        assert_eq!(
            f.coordinator.active_transfer().unwrap().state,
            TransferState::Failed
        );
        let original = f.engine.get_call(call_id).unwrap();
        assert_eq!(original.state, CallState::Active);
        assert!(!original.is_on_hold);
    }
}
