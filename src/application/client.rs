//! Softphone client facade
//!
//! Wires the transport, registration, call, transfer, conference and
//! messaging managers over one shared event bus, and pumps inbound
//! signaling events to their owners. This is the surface a UI layer
//! talks to; everything it causes is observable via the [`EventBus`].

use crate::config::EngineConfig;
use crate::domain::call::dtmf::DtmfOptions;
use crate::domain::call::engine::CallSessionEngine;
use crate::domain::call::session::CallStats;
use crate::domain::conference_manager::{ConferenceManager, ConferenceOptions};
use crate::domain::media::{MediaDirections, MediaProvider};
use crate::domain::messaging::MessagingManager;
use crate::domain::registration::{RegisterOptions, RegistrationManager};
use crate::domain::shared::events::{EventBus, SubscriptionId};
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ConferenceId, MessageId, ParticipantId, SipUri, TransferId};
use crate::domain::signaling::{SignalingChannel, SignalingEvent};
use crate::domain::transfer::TransferCoordinator;
use crate::infrastructure::persistence::PreferenceStore;
use crate::infrastructure::transport::socket::{SocketConnector, WsConnector};
use crate::infrastructure::transport::{KeepAliveKind, TransportManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Top-level handle owning all session managers.
pub struct SoftphoneClient {
    bus: Arc<EventBus>,
    transport: Arc<TransportManager>,
    registration: Arc<RegistrationManager>,
    calls: Arc<CallSessionEngine>,
    transfers: Arc<TransferCoordinator>,
    conferences: Arc<ConferenceManager>,
    messaging: Arc<MessagingManager>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    keepalive_subscription: Mutex<Option<SubscriptionId>>,
    disposed: AtomicBool,
}

impl SoftphoneClient {
    /// Build a client dialing real WebSocket endpoints.
    pub fn new(
        config: EngineConfig,
        signaling: Arc<dyn SignalingChannel>,
        media: Arc<dyn MediaProvider>,
        store: Option<Arc<dyn PreferenceStore>>,
    ) -> Result<Arc<Self>> {
        Self::with_connector(config, signaling, media, store, Arc::new(WsConnector))
    }

    /// Build a client with a custom socket connector.
    pub fn with_connector(
        config: EngineConfig,
        signaling: Arc<dyn SignalingChannel>,
        media: Arc<dyn MediaProvider>,
        store: Option<Arc<dyn PreferenceStore>>,
        connector: Arc<dyn SocketConnector>,
    ) -> Result<Arc<Self>> {
        let local_uri = SipUri::parse(&config.user.uri)?;
        let display_name = config.user.display_name.clone();
        let bus = Arc::new(EventBus::new());

        let transport =
            TransportManager::new(config.transport.clone(), connector, bus.clone());
        let registration = RegistrationManager::new(
            local_uri.clone(),
            config.registration.clone(),
            signaling.clone(),
            store,
            bus.clone(),
        );
        let calls = CallSessionEngine::new(
            local_uri.clone(),
            display_name.clone(),
            config.call.clone(),
            signaling.clone(),
            media.clone(),
            bus.clone(),
        );
        let transfers =
            TransferCoordinator::new(calls.clone(), signaling.clone(), bus.clone());
        let conferences = ConferenceManager::new(
            local_uri.clone(),
            display_name,
            config.conference.clone(),
            calls.clone(),
            signaling.clone(),
            media,
            bus.clone(),
        );
        let messaging = MessagingManager::new(
            local_uri,
            config.messaging.clone(),
            signaling.clone(),
            bus.clone(),
        );

        let client = Arc::new(Self {
            bus: bus.clone(),
            transport,
            registration,
            calls,
            transfers,
            conferences,
            messaging,
            pump_task: Mutex::new(None),
            keepalive_subscription: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        // OPTIONS keep-alives are issued by the signaling engine, not
        // the raw socket.
        if config.transport.keep_alive == KeepAliveKind::Options {
            let signaling = signaling.clone();
            let subscription = bus.subscribe("connection:keepalive", move |_| {
                let signaling = signaling.clone();
                tokio::spawn(async move {
                    if let Err(e) = signaling.options_ping().await {
                        warn!("OPTIONS keep-alive failed: {}", e);
                    }
                });
            });
            *client.keepalive_subscription.lock().unwrap() = Some(subscription);
        }

        Ok(client)
    }

    /// Route inbound signaling events to their owning managers.
    pub fn attach_signaling_events(&self, mut events: mpsc::UnboundedReceiver<SignalingEvent>) {
        let calls = self.calls.clone();
        let conferences = self.conferences.clone();
        let messaging = self.messaging.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!("Signaling event: {:?}", event);
                match event {
                    SignalingEvent::IncomingCall {
                        call_id,
                        from,
                        display_name,
                    } => calls.on_incoming_call(call_id, from, display_name),
                    SignalingEvent::CallProgress { call_id } => calls.on_provisional(call_id),
                    SignalingEvent::CallAccepted { call_id } => {
                        calls.on_accepted(call_id);
                        conferences.on_participant_call_established(call_id);
                    }
                    SignalingEvent::CallTerminated { call_id, cause } => {
                        calls.on_remote_terminated(call_id, cause).await;
                        conferences.on_participant_call_ended(call_id).await;
                    }
                    SignalingEvent::CallFailed {
                        call_id,
                        status,
                        reason,
                    } => {
                        calls.on_remote_failure(call_id, status, reason).await;
                        conferences.on_participant_call_ended(call_id).await;
                    }
                    SignalingEvent::MessageReceived {
                        message_id,
                        from,
                        content,
                        content_type,
                    } => messaging.on_incoming_message(message_id, from, content, content_type),
                    SignalingEvent::DeliveryReceipt { message_id } => {
                        messaging.on_delivery_receipt(message_id)
                    }
                    SignalingEvent::ReadReceipt { message_id } => {
                        messaging.on_read_receipt(message_id)
                    }
                    SignalingEvent::ComposingIndication { from, active } => {
                        messaging.on_composing_indication(from, active)
                    }
                }
            }
        });
        if let Some(old) = self.pump_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    // Transport

    pub async fn connect(&self) -> Result<()> {
        self.transport.connect().await
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await
    }

    pub fn transport(&self) -> &TransportManager {
        &self.transport
    }

    // Registration

    pub async fn register(&self, options: Option<RegisterOptions>) -> Result<()> {
        match options {
            Some(options) => self.registration.register(options).await,
            None => self.registration.register_default().await,
        }
    }

    pub async fn unregister(&self) -> Result<()> {
        self.registration.unregister().await
    }

    pub fn registration(&self) -> &RegistrationManager {
        &self.registration
    }

    // Calls

    pub async fn make_call(&self, target: &str, directions: MediaDirections) -> Result<CallId> {
        self.calls
            .make_call(target, directions, CancellationToken::new())
            .await
    }

    pub async fn make_call_cancellable(
        &self,
        target: &str,
        directions: MediaDirections,
        cancel: CancellationToken,
    ) -> Result<CallId> {
        self.calls.make_call(target, directions, cancel).await
    }

    pub async fn answer(&self, call_id: CallId, directions: MediaDirections) -> Result<()> {
        self.calls.answer(call_id, directions).await
    }

    pub async fn reject(&self, call_id: CallId, status: Option<u16>) -> Result<()> {
        self.calls.reject(call_id, status).await
    }

    pub async fn hold(&self, call_id: CallId) -> Result<()> {
        self.calls.hold(call_id).await
    }

    pub async fn unhold(&self, call_id: CallId) -> Result<()> {
        self.calls.unhold(call_id).await
    }

    pub fn mute(&self, call_id: CallId) -> Result<()> {
        self.calls.mute(call_id)
    }

    pub fn unmute(&self, call_id: CallId) -> Result<()> {
        self.calls.unmute(call_id)
    }

    pub fn send_dtmf(
        &self,
        call_id: CallId,
        tones: &str,
        options: Option<DtmfOptions>,
    ) -> Result<()> {
        self.calls.send_dtmf(call_id, tones, options)
    }

    pub fn stop_dtmf(&self, call_id: CallId) {
        self.calls.stop_dtmf(call_id)
    }

    pub async fn hangup(&self, call_id: CallId) -> Result<()> {
        self.calls.hangup(call_id).await
    }

    pub fn get_stats(&self, call_id: CallId) -> Result<CallStats> {
        self.calls.get_stats(call_id)
    }

    pub fn calls(&self) -> &CallSessionEngine {
        &self.calls
    }

    // Transfers

    pub async fn blind_transfer(&self, call_id: CallId, target: &str) -> Result<TransferId> {
        self.transfers.blind_transfer(call_id, target).await
    }

    pub async fn initiate_attended_transfer(
        &self,
        call_id: CallId,
        target: &str,
    ) -> Result<TransferId> {
        self.transfers.initiate_attended(call_id, target).await
    }

    pub async fn complete_attended_transfer(&self) -> Result<()> {
        self.transfers.complete_attended().await
    }

    pub async fn cancel_transfer(&self) -> Result<()> {
        self.transfers.cancel_transfer().await
    }

    pub fn transfers(&self) -> &TransferCoordinator {
        &self.transfers
    }

    // Conferences

    pub async fn create_conference(&self, options: ConferenceOptions) -> Result<ConferenceId> {
        self.conferences.create_conference(options).await
    }

    pub async fn join_conference(
        &self,
        uri: &str,
        options: ConferenceOptions,
    ) -> Result<ConferenceId> {
        self.conferences.join_conference(uri, options).await
    }

    pub async fn add_participant(
        &self,
        uri: &str,
        display_name: Option<String>,
    ) -> Result<ParticipantId> {
        self.conferences.add_participant(uri, display_name).await
    }

    pub async fn remove_participant(&self, participant_id: ParticipantId) -> Result<()> {
        self.conferences.remove_participant(participant_id).await
    }

    pub async fn mute_participant(&self, participant_id: ParticipantId) -> Result<()> {
        self.conferences.mute_participant(participant_id).await
    }

    pub async fn unmute_participant(&self, participant_id: ParticipantId) -> Result<()> {
        self.conferences.unmute_participant(participant_id).await
    }

    pub fn lock_conference(&self) -> Result<()> {
        self.conferences.lock_conference()
    }

    pub fn unlock_conference(&self) -> Result<()> {
        self.conferences.unlock_conference()
    }

    pub async fn start_recording(&self) -> Result<()> {
        self.conferences.start_recording().await
    }

    pub async fn stop_recording(&self) -> Result<()> {
        self.conferences.stop_recording().await
    }

    pub async fn end_conference(&self) -> Result<()> {
        self.conferences.end_conference().await
    }

    pub fn conferences(&self) -> &ConferenceManager {
        &self.conferences
    }

    // Messaging

    pub async fn send_message(
        &self,
        to: &str,
        content: &str,
        content_type: Option<&str>,
    ) -> Result<MessageId> {
        self.messaging.send_message(to, content, content_type).await
    }

    pub async fn mark_as_read(&self, message_id: MessageId) -> Result<()> {
        self.messaging.mark_as_read(message_id).await
    }

    pub async fn send_composing_indicator(&self, to: &str, active: bool) -> Result<()> {
        self.messaging.send_composing_indicator(to, active).await
    }

    pub fn messaging(&self) -> &MessagingManager {
        &self.messaging
    }

    /// Tear everything down: the event pump, every manager's timers,
    /// acquired media and the transport socket. Safe to call twice.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.pump_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(subscription) = self.keepalive_subscription.lock().unwrap().take() {
            self.bus.unsubscribe(subscription);
        }

        self.registration.dispose();
        self.transfers.dispose();
        self.conferences.dispose();
        self.messaging.dispose();
        self.calls.dispose().await;
        self.transport.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::session::CallState;
    use crate::domain::messaging::MessageStatus;
    use crate::domain::test_support::{FakeMedia, FakeSignaling};
    use crate::domain::shared::value_objects::MessageId;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.user.uri = "sip:alice@example.com".to_string();
        config.user.display_name = Some("Alice".to_string());
        config
    }

    fn client_with(signaling: Arc<FakeSignaling>) -> Arc<SoftphoneClient> {
        SoftphoneClient::new(config(), signaling, FakeMedia::new(), None).unwrap()
    }

    #[tokio::test]
    async fn test_signaling_events_reach_managers() {
        let signaling = FakeSignaling::new();
        let client = client_with(signaling.clone());
        client.attach_signaling_events(signaling.event_channel());

        let call_id = CallId::new();
        signaling.push_event(SignalingEvent::IncomingCall {
            call_id,
            from: SipUri::parse("sip:bob@example.com").unwrap(),
            display_name: Some("Bob".to_string()),
        });
        tokio::task::yield_now().await;

        let session = client.calls().get_call(call_id).unwrap();
        assert_eq!(session.state, CallState::Ringing);

        let message_id = MessageId::new();
        signaling.push_event(SignalingEvent::MessageReceived {
            message_id,
            from: SipUri::parse("sip:bob@example.com").unwrap(),
            content: "hi".to_string(),
            content_type: "text/plain".to_string(),
        });
        tokio::task::yield_now().await;

        assert_eq!(
            client.messaging().get_message(message_id).unwrap().status,
            MessageStatus::Delivered
        );
    }

    #[tokio::test]
    async fn test_outgoing_call_accept_via_event_pump() {
        let signaling = FakeSignaling::new();
        let client = client_with(signaling.clone());
        client.attach_signaling_events(signaling.event_channel());

        let call_id = client
            .make_call("sip:bob@example.com", MediaDirections::audio_only())
            .await
            .unwrap();

        signaling.push_event(SignalingEvent::CallProgress { call_id });
        signaling.push_event(SignalingEvent::CallAccepted { call_id });
        tokio::task::yield_now().await;

        assert_eq!(
            client.calls().get_call(call_id).unwrap().state,
            CallState::Active
        );
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let signaling = FakeSignaling::new();
        let client = client_with(signaling.clone());
        client.attach_signaling_events(signaling.event_channel());

        client.dispose().await;
        client.dispose().await;

        assert!(client
            .make_call("sip:bob@example.com", MediaDirections::audio_only())
            .await
            .is_err());
    }
}
