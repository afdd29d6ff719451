//! Instant messaging
//!
//! SIP MESSAGE sending with optimistic records, delivery/read tracking
//! by message id, and composing indicators with an idle timeout.

use crate::config::MessagingConfig;
use crate::domain::shared::error::ClientError;
use crate::domain::shared::events::{EventBus, SessionEvent};
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{MessageId, SipUri};
use crate::domain::signaling::{DispositionKind, SignalingChannel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Message direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

/// Message delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

/// Instant message record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub direction: MessageDirection,
    pub from: SipUri,
    pub to: SipUri,
    pub content: String,
    pub content_type: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    fn new_outgoing(from: SipUri, to: SipUri, content: String, content_type: String) -> Self {
        Self {
            id: MessageId::new(),
            direction: MessageDirection::Outgoing,
            from,
            to,
            content,
            content_type,
            status: MessageStatus::Sending,
            created_at: Utc::now(),
            sent_at: None,
            delivered_at: None,
            read_at: None,
        }
    }

    fn new_incoming(
        id: MessageId,
        from: SipUri,
        to: SipUri,
        content: String,
        content_type: String,
    ) -> Self {
        Self {
            id,
            direction: MessageDirection::Incoming,
            from,
            to,
            content,
            content_type,
            status: MessageStatus::Delivered,
            created_at: Utc::now(),
            sent_at: None,
            delivered_at: Some(Utc::now()),
            read_at: None,
        }
    }
}

struct ComposingPeer {
    active: bool,
    timer: Option<JoinHandle<()>>,
}

/// Sends, receives and tracks instant messages.
pub struct MessagingManager {
    local_uri: SipUri,
    config: MessagingConfig,
    signaling: Arc<dyn SignalingChannel>,
    bus: Arc<EventBus>,
    messages: RwLock<HashMap<MessageId, Message>>,
    composing: Mutex<HashMap<String, ComposingPeer>>,
    disposed: AtomicBool,
    weak_self: Weak<MessagingManager>,
}

impl MessagingManager {
    pub fn new(
        local_uri: SipUri,
        config: MessagingConfig,
        signaling: Arc<dyn SignalingChannel>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            local_uri,
            config,
            signaling,
            bus,
            messages: RwLock::new(HashMap::new()),
            composing: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    pub fn get_message(&self, id: MessageId) -> Option<Message> {
        self.messages.read().unwrap().get(&id).cloned()
    }

    /// All messages, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        let mut all: Vec<Message> = self.messages.read().unwrap().values().cloned().collect();
        all.sort_by_key(|m| m.created_at);
        all
    }

    pub fn is_composing(&self, uri: &str) -> bool {
        self.composing
            .lock()
            .unwrap()
            .get(uri)
            .map(|peer| peer.active)
            .unwrap_or(false)
    }

    /// Send a message. The record is created optimistically in
    /// `sending` and settles to `sent` or `failed`.
    pub async fn send_message(
        &self,
        to: &str,
        content: &str,
        content_type: Option<&str>,
    ) -> Result<MessageId> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ClientError::State(
                "Messaging manager has been disposed".to_string(),
            ));
        }
        let to = SipUri::parse(to)?;
        let content_type = content_type.unwrap_or(DEFAULT_CONTENT_TYPE).to_string();

        let message = Message::new_outgoing(
            self.local_uri.clone(),
            to.clone(),
            content.to_string(),
            content_type.clone(),
        );
        let message_id = message.id;
        self.messages.write().unwrap().insert(message_id, message);

        match self
            .signaling
            .send_message(message_id, &to, content, &content_type)
            .await
        {
            Ok(()) => {
                self.update_message(message_id, |m| {
                    m.status = MessageStatus::Sent;
                    m.sent_at = Some(Utc::now());
                });
                self.bus.publish(&SessionEvent::MessageSent { message_id });
                Ok(message_id)
            }
            Err(e) => {
                self.update_message(message_id, |m| m.status = MessageStatus::Failed);
                self.bus.publish(&SessionEvent::MessageFailed {
                    message_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Mark an incoming message as read and notify the sender. The
    /// disposition send is non-critical: a failure logs and is not
    /// propagated.
    pub async fn mark_as_read(&self, message_id: MessageId) -> Result<()> {
        let peer = {
            let mut messages = self.messages.write().unwrap();
            let message = messages
                .get_mut(&message_id)
                .ok_or_else(|| ClientError::NotFound(format!("Unknown message: {}", message_id)))?;
            if message.direction != MessageDirection::Incoming {
                return Err(ClientError::State(
                    "Only incoming messages can be marked as read".to_string(),
                ));
            }
            if message.status == MessageStatus::Read {
                return Ok(());
            }
            message.status = MessageStatus::Read;
            message.read_at = Some(Utc::now());
            message.from.clone()
        };

        self.bus.publish(&SessionEvent::MessageRead { message_id });

        if let Err(e) = self
            .signaling
            .send_disposition(message_id, &peer, DispositionKind::Read)
            .await
        {
            warn!("Read disposition for {} failed: {}", message_id, e);
        }
        Ok(())
    }

    /// Composing indicator sends are fire-and-forget; failures log
    /// without propagating.
    pub async fn send_composing_indicator(&self, to: &str, active: bool) -> Result<()> {
        let to = SipUri::parse(to)?;
        if let Err(e) = self.signaling.send_composing(&to, active).await {
            warn!("Composing indicator to {} failed: {}", to, e);
        }
        Ok(())
    }

    /// Remote delivery receipt: updates the matching record in place.
    pub fn on_delivery_receipt(&self, message_id: MessageId) {
        let known = self.update_message(message_id, |m| {
            if m.status == MessageStatus::Sent {
                m.status = MessageStatus::Delivered;
            }
            if m.delivered_at.is_none() {
                m.delivered_at = Some(Utc::now());
            }
        });
        if known {
            self.bus
                .publish(&SessionEvent::MessageDelivered { message_id });
        } else {
            debug!("Delivery receipt for unknown message {}", message_id);
        }
    }

    /// Remote read receipt.
    pub fn on_read_receipt(&self, message_id: MessageId) {
        let known = self.update_message(message_id, |m| {
            if matches!(m.status, MessageStatus::Sent | MessageStatus::Delivered) {
                m.status = MessageStatus::Read;
            }
            if m.read_at.is_none() {
                m.read_at = Some(Utc::now());
            }
        });
        if known {
            self.bus.publish(&SessionEvent::MessageRead { message_id });
        } else {
            debug!("Read receipt for unknown message {}", message_id);
        }
    }

    /// Inbound MESSAGE.
    pub fn on_incoming_message(
        &self,
        message_id: MessageId,
        from: SipUri,
        content: String,
        content_type: String,
    ) {
        {
            let mut messages = self.messages.write().unwrap();
            if messages.contains_key(&message_id) {
                warn!("Duplicate incoming message id {}", message_id);
                return;
            }
            messages.insert(
                message_id,
                Message::new_incoming(
                    message_id,
                    from.clone(),
                    self.local_uri.clone(),
                    content.clone(),
                    content_type,
                ),
            );
        }
        self.bus.publish(&SessionEvent::MessageReceived {
            message_id,
            from,
            content,
        });
    }

    /// Inbound composing indicator. An active indicator arms (or
    /// re-arms) an idle timeout that clears the flag on its own.
    pub fn on_composing_indication(&self, from: SipUri, active: bool) {
        let key = from.as_str().to_string();
        let changed = {
            let mut composing = self.composing.lock().unwrap();
            let peer = composing.entry(key.clone()).or_insert(ComposingPeer {
                active: false,
                timer: None,
            });
            if let Some(timer) = peer.timer.take() {
                timer.abort();
            }

            let changed = peer.active != active;
            peer.active = active;

            if active {
                let weak = self.weak_self.clone();
                let timeout = Duration::from_secs(self.config.composing_idle_timeout_secs);
                let peer_uri = from.clone();
                peer.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let Some(manager) = weak.upgrade() else { return };
                    let cleared = {
                        let mut composing = manager.composing.lock().unwrap();
                        match composing.get_mut(peer_uri.as_str()) {
                            Some(peer) if peer.active => {
                                peer.active = false;
                                peer.timer = None;
                                true
                            }
                            _ => false,
                        }
                    };
                    if cleared {
                        debug!("Composing indicator from {} timed out", peer_uri);
                        manager.bus.publish(&SessionEvent::ComposingChanged {
                            from: peer_uri,
                            is_composing: false,
                        });
                    }
                }));
            }
            changed
        };

        if changed {
            self.bus.publish(&SessionEvent::ComposingChanged {
                from,
                is_composing: active,
            });
        }
    }

    /// Idempotent teardown; all composing timers are cancelled.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut composing = self.composing.lock().unwrap();
        for peer in composing.values_mut() {
            if let Some(timer) = peer.timer.take() {
                timer.abort();
            }
        }
    }

    /// Returns false when the id is unknown.
    fn update_message<F: FnOnce(&mut Message)>(&self, message_id: MessageId, f: F) -> bool {
        let mut messages = self.messages.write().unwrap();
        match messages.get_mut(&message_id) {
            Some(message) => {
                f(message);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::test_support::FakeSignaling;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        manager: Arc<MessagingManager>,
        signaling: Arc<FakeSignaling>,
        bus: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let signaling = FakeSignaling::new();
        let bus = Arc::new(EventBus::new());
        let manager = MessagingManager::new(
            SipUri::parse("sip:alice@example.com").unwrap(),
            MessagingConfig::default(),
            signaling.clone(),
            bus.clone(),
        );
        Fixture {
            manager,
            signaling,
            bus,
        }
    }

    fn event_counter(bus: &EventBus, pattern: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        bus.subscribe(pattern, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[tokio::test]
    async fn test_message_status_roundtrip_without_duplicates() {
        let f = fixture();

        let message_id = f
            .manager
            .send_message("sip:bob@example.com", "hello", None)
            .await
            .unwrap();
        assert_eq!(
            f.manager.get_message(message_id).unwrap().status,
            MessageStatus::Sent
        );

        f.manager.on_delivery_receipt(message_id);
        assert_eq!(
            f.manager.get_message(message_id).unwrap().status,
            MessageStatus::Delivered
        );

        f.manager.on_read_receipt(message_id);
        let message = f.manager.get_message(message_id).unwrap();
        assert_eq!(message.status, MessageStatus::Read);
        assert!(message.read_at.is_some());

        assert_eq!(f.manager.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_marks_record_failed() {
        let f = fixture();
        f.signaling.fail_message(true);
        let failures = event_counter(&f.bus, "message:failed");

        let result = f
            .manager
            .send_message("sip:bob@example.com", "hello", None)
            .await;
        assert!(result.is_err());
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        let messages = f.manager.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn test_invalid_recipient_creates_no_record() {
        let f = fixture();
        let result = f.manager.send_message("", "hello", None).await;
        assert!(matches!(result, Err(ClientError::Configuration(_))));
        assert!(f.manager.messages().is_empty());
    }

    #[tokio::test]
    async fn test_incoming_message_and_mark_as_read() {
        let f = fixture();
        let message_id = MessageId::new();
        f.manager.on_incoming_message(
            message_id,
            SipUri::parse("sip:bob@example.com").unwrap(),
            "hi".to_string(),
            "text/plain".to_string(),
        );

        let message = f.manager.get_message(message_id).unwrap();
        assert_eq!(message.direction, MessageDirection::Incoming);
        assert_eq!(message.status, MessageStatus::Delivered);

        f.manager.mark_as_read(message_id).await.unwrap();
        assert_eq!(
            f.manager.get_message(message_id).unwrap().status,
            MessageStatus::Read
        );
        assert_eq!(f.signaling.dispositions.lock().unwrap().len(), 1);

        // Marking again is a quiet no-op.
        f.manager.mark_as_read(message_id).await.unwrap();
        assert_eq!(f.signaling.dispositions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_outgoing_as_read_is_rejected() {
        let f = fixture();
        let message_id = f
            .manager
            .send_message("sip:bob@example.com", "hello", None)
            .await
            .unwrap();

        let result = f.manager.mark_as_read(message_id).await;
        assert!(matches!(result, Err(ClientError::State(_))));
    }

    #[tokio::test]
    async fn test_duplicate_incoming_id_is_ignored() {
        let f = fixture();
        let message_id = MessageId::new();
        let from = SipUri::parse("sip:bob@example.com").unwrap();

        f.manager
            .on_incoming_message(message_id, from.clone(), "one".to_string(), "text/plain".to_string());
        f.manager
            .on_incoming_message(message_id, from, "two".to_string(), "text/plain".to_string());

        assert_eq!(f.manager.messages().len(), 1);
        assert_eq!(f.manager.get_message(message_id).unwrap().content, "one");
    }

    #[tokio::test(start_paused = true)]
    async fn test_composing_indicator_times_out() {
        let f = fixture();
        let from = SipUri::parse("sip:bob@example.com").unwrap();
        let events = event_counter(&f.bus, "message:composing");

        f.manager.on_composing_indication(from.clone(), true);
        assert!(f.manager.is_composing("sip:bob@example.com"));
        assert_eq!(events.load(Ordering::SeqCst), 1);

        // A fresh indicator just before the timeout re-arms it.
        tokio::time::sleep(Duration::from_secs(9)).await;
        f.manager.on_composing_indication(from.clone(), true);
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(f.manager.is_composing("sip:bob@example.com"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!f.manager.is_composing("sip:bob@example.com"));
        // One for the initial true, one for the timeout-driven false.
        assert_eq!(events.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_explicit_composing_stop() {
        let f = fixture();
        let from = SipUri::parse("sip:bob@example.com").unwrap();

        f.manager.on_composing_indication(from.clone(), true);
        f.manager.on_composing_indication(from, false);
        assert!(!f.manager.is_composing("sip:bob@example.com"));
    }

    #[tokio::test]
    async fn test_composing_send_failure_does_not_propagate() {
        let f = fixture();
        f.signaling.fail_composing(true);

        f.manager
            .send_composing_indicator("sip:bob@example.com", true)
            .await
            .unwrap();
    }
}
