//! Session event hub
//!
//! All managers publish through a shared [`EventBus`]; consumers
//! subscribe by topic pattern (`"call:*"`). Dispatch is synchronous and
//! priority ordered, and a panicking handler never prevents the
//! remaining handlers from running.

use crate::domain::registration::RegistrationState;
use crate::domain::shared::value_objects::{
    CallId, ConferenceId, MessageId, ParticipantId, SipUri, TransferId,
};
use crate::domain::transfer::{TransferKind, TransferState};
use crate::infrastructure::transport::{ConnectionState, KeepAliveKind};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{error, trace};

/// Audio level sample for one conference participant (0.0 - 1.0)
#[derive(Debug, Clone, Serialize)]
pub struct AudioLevel {
    pub participant_id: ParticipantId,
    pub level: f32,
}

/// Everything the engine reports to its observers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionStateChanged {
        state: ConnectionState,
    },
    KeepAliveDue {
        kind: KeepAliveKind,
    },
    RegistrationStateChanged {
        state: RegistrationState,
        uri: Option<SipUri>,
        error: Option<String>,
    },
    CallIncoming {
        call_id: CallId,
        from: SipUri,
        display_name: Option<String>,
    },
    CallInitiated {
        call_id: CallId,
        target: SipUri,
    },
    CallRinging {
        call_id: CallId,
    },
    CallAnswered {
        call_id: CallId,
    },
    CallHeld {
        call_id: CallId,
    },
    CallResumed {
        call_id: CallId,
    },
    CallMuted {
        call_id: CallId,
        muted: bool,
    },
    CallDtmfSent {
        call_id: CallId,
        tone: char,
    },
    CallTerminated {
        call_id: CallId,
        cause: Option<String>,
    },
    CallFailed {
        call_id: CallId,
        error: String,
    },
    TransferInitiated {
        transfer_id: TransferId,
        kind: TransferKind,
        target: SipUri,
    },
    TransferProgress {
        transfer_id: TransferId,
        state: TransferState,
    },
    TransferCompleted {
        transfer_id: TransferId,
    },
    TransferFailed {
        transfer_id: TransferId,
        error: String,
    },
    TransferCanceled {
        transfer_id: TransferId,
    },
    ConferenceCreated {
        conference_id: ConferenceId,
    },
    ConferenceJoined {
        conference_id: ConferenceId,
        uri: SipUri,
    },
    ConferenceEnding {
        conference_id: ConferenceId,
    },
    ConferenceEnded {
        conference_id: ConferenceId,
    },
    ConferenceFailed {
        conference_id: ConferenceId,
        error: String,
    },
    ParticipantJoined {
        conference_id: ConferenceId,
        participant_id: ParticipantId,
        uri: SipUri,
    },
    ParticipantLeft {
        conference_id: ConferenceId,
        participant_id: ParticipantId,
    },
    ParticipantUpdated {
        conference_id: ConferenceId,
        participant_id: ParticipantId,
        field: String,
    },
    AudioLevels {
        conference_id: ConferenceId,
        levels: Vec<AudioLevel>,
    },
    ConferenceLocked {
        conference_id: ConferenceId,
    },
    ConferenceUnlocked {
        conference_id: ConferenceId,
    },
    RecordingStarted {
        conference_id: ConferenceId,
    },
    RecordingStopped {
        conference_id: ConferenceId,
    },
    MessageSent {
        message_id: MessageId,
    },
    MessageFailed {
        message_id: MessageId,
        error: String,
    },
    MessageDelivered {
        message_id: MessageId,
    },
    MessageRead {
        message_id: MessageId,
    },
    MessageReceived {
        message_id: MessageId,
        from: SipUri,
        content: String,
    },
    ComposingChanged {
        from: SipUri,
        is_composing: bool,
    },
}

impl SessionEvent {
    /// Canonical topic string, used for subscription matching.
    pub fn topic(&self) -> &'static str {
        match self {
            SessionEvent::ConnectionStateChanged { state } => match state {
                ConnectionState::Disconnected => "connection:disconnected",
                ConnectionState::Connecting => "connection:connecting",
                ConnectionState::Connected => "connection:connected",
                ConnectionState::Reconnecting => "connection:reconnecting",
                ConnectionState::Error => "connection:error",
                ConnectionState::ConnectionFailed => "connection:failed",
            },
            SessionEvent::KeepAliveDue { .. } => "connection:keepalive",
            SessionEvent::RegistrationStateChanged { state, .. } => match state {
                RegistrationState::Unregistered => "registration:unregistered",
                RegistrationState::Registering => "registration:registering",
                RegistrationState::Registered => "registration:registered",
                RegistrationState::Unregistering => "registration:unregistering",
                RegistrationState::RegistrationFailed => "registration:failed",
            },
            SessionEvent::CallIncoming { .. } => "call:incoming",
            SessionEvent::CallInitiated { .. } => "call:initiated",
            SessionEvent::CallRinging { .. } => "call:ringing",
            SessionEvent::CallAnswered { .. } => "call:answered",
            SessionEvent::CallHeld { .. } => "call:held",
            SessionEvent::CallResumed { .. } => "call:resumed",
            SessionEvent::CallMuted { .. } => "call:muted",
            SessionEvent::CallDtmfSent { .. } => "call:dtmf",
            SessionEvent::CallTerminated { .. } => "call:terminated",
            SessionEvent::CallFailed { .. } => "call:failed",
            SessionEvent::TransferInitiated { .. } => "transfer:initiated",
            SessionEvent::TransferProgress { .. } => "transfer:progress",
            SessionEvent::TransferCompleted { .. } => "transfer:completed",
            SessionEvent::TransferFailed { .. } => "transfer:failed",
            SessionEvent::TransferCanceled { .. } => "transfer:canceled",
            SessionEvent::ConferenceCreated { .. } => "conference:created",
            SessionEvent::ConferenceJoined { .. } => "conference:joined",
            SessionEvent::ConferenceEnding { .. } => "conference:ending",
            SessionEvent::ConferenceEnded { .. } => "conference:ended",
            SessionEvent::ConferenceFailed { .. } => "conference:failed",
            SessionEvent::ParticipantJoined { .. } => "conference:participant:joined",
            SessionEvent::ParticipantLeft { .. } => "conference:participant:left",
            SessionEvent::ParticipantUpdated { .. } => "conference:participant:updated",
            SessionEvent::AudioLevels { .. } => "conference:audio:level",
            SessionEvent::ConferenceLocked { .. } => "conference:locked",
            SessionEvent::ConferenceUnlocked { .. } => "conference:unlocked",
            SessionEvent::RecordingStarted { .. } => "conference:recording:started",
            SessionEvent::RecordingStopped { .. } => "conference:recording:stopped",
            SessionEvent::MessageSent { .. } => "message:sent",
            SessionEvent::MessageFailed { .. } => "message:failed",
            SessionEvent::MessageDelivered { .. } => "message:delivered",
            SessionEvent::MessageRead { .. } => "message:read",
            SessionEvent::MessageReceived { .. } => "message:received",
            SessionEvent::ComposingChanged { .. } => "message:composing",
        }
    }
}

impl SessionEvent {
    /// JSON rendering for UI bridges and structured log sinks.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Topic subscription pattern: exact topic or trailing-`*` prefix
#[derive(Debug, Clone, PartialEq, Eq)]
enum TopicPattern {
    Exact(String),
    Prefix(String),
}

impl TopicPattern {
    fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => TopicPattern::Prefix(prefix.to_string()),
            None => TopicPattern::Exact(pattern.to_string()),
        }
    }

    fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::Exact(t) => t == topic,
            TopicPattern::Prefix(p) => topic.starts_with(p.as_str()),
        }
    }
}

/// Subscription handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Subscription {
    id: u64,
    pattern: TopicPattern,
    priority: i32,
    handler: EventHandler,
}

/// Typed publish/subscribe hub
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe with default priority (0).
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.subscribe_with_priority(pattern, 0, handler)
    }

    /// Subscribe with an explicit priority. Higher priorities run first;
    /// equal priorities run in registration order.
    pub fn subscribe_with_priority<F>(
        &self,
        pattern: &str,
        priority: i32,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Subscription {
            id,
            pattern: TopicPattern::parse(pattern),
            priority,
            handler: Arc::new(handler),
        };

        let mut subs = self.subscriptions.write().unwrap();
        // Keep the list sorted so publish never has to.
        let position = subs
            .iter()
            .position(|s| s.priority < priority)
            .unwrap_or(subs.len());
        subs.insert(position, subscription);

        SubscriptionId(id)
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscriptions.write().unwrap();
        subs.retain(|s| s.id != id.0);
    }

    /// Dispatch an event synchronously to all matching handlers.
    pub fn publish(&self, event: &SessionEvent) {
        let topic = event.topic();

        let handlers: Vec<EventHandler> = {
            let subs = self.subscriptions.read().unwrap();
            subs.iter()
                .filter(|s| s.pattern.matches(topic))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        trace!("Dispatching {} to {} handler(s)", topic, handlers.len());

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!("Event handler panicked while handling {}", topic);
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().unwrap().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn test_event() -> SessionEvent {
        SessionEvent::CallRinging {
            call_id: CallId::new(),
        }
    }

    #[test]
    fn test_exact_topic_match() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        let counter = hits.clone();
        bus.subscribe("call:ringing", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&test_event());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wildcard_topic_match() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        let counter = hits.clone();
        bus.subscribe("call:*", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = hits.clone();
        bus.subscribe("*", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.subscribe("message:*", |_| panic!("wrong topic"));

        bus.publish(&test_event());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_nested_wildcard_match() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        let counter = hits.clone();
        bus.subscribe("conference:*", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&SessionEvent::ParticipantJoined {
            conference_id: ConferenceId::new(),
            participant_id: ParticipantId::new(),
            uri: SipUri::parse("sip:alice@example.com").unwrap(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_priority_ordering() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let log = order.clone();
        bus.subscribe_with_priority("call:*", 0, move |_| log.lock().unwrap().push("low"));
        let log = order.clone();
        bus.subscribe_with_priority("call:*", 10, move |_| log.lock().unwrap().push("high"));
        let log = order.clone();
        bus.subscribe_with_priority("call:*", 0, move |_| log.lock().unwrap().push("low2"));

        bus.publish(&test_event());
        assert_eq!(*order.lock().unwrap(), vec!["high", "low", "low2"]);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        bus.subscribe_with_priority("call:*", 10, |_| panic!("boom"));
        let counter = hits.clone();
        bus.subscribe("call:*", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&test_event());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_json_rendering() {
        let event = SessionEvent::CallMuted {
            call_id: CallId::new(),
            muted: true,
        };
        let json = event.to_json();
        assert_eq!(json["type"], "call_muted");
        assert_eq!(json["muted"], true);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        let counter = hits.clone();
        let id = bus.subscribe("call:*", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&test_event());
        bus.unsubscribe(id);
        bus.publish(&test_event());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscription_count(), 0);
    }
}
