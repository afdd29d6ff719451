//! Registration lifecycle
//!
//! Drives REGISTER through the signaling channel: auto-refresh before
//! expiry, retry with capped exponential backoff on failure.

use crate::config::RegistrationConfig;
use crate::domain::shared::error::ClientError;
use crate::domain::shared::events::{EventBus, SessionEvent};
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::SipUri;
use crate::domain::signaling::SignalingChannel;
use crate::infrastructure::persistence::PreferenceStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const PREF_REGISTRATION_URI: &str = "registration.uri";
const PREF_REGISTRATION_EXPIRES: &str = "registration.expires";

/// Registration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Unregistering,
    RegistrationFailed,
}

/// Details of the currently active registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveRegistration {
    pub uri: SipUri,
    /// Granted interval in seconds
    pub expires: u32,
    pub expiry_time: DateTime<Utc>,
}

impl ActiveRegistration {
    pub fn remaining(&self) -> ChronoDuration {
        self.expiry_time - Utc::now()
    }

    pub fn is_expiring_soon(&self) -> bool {
        self.remaining() < ChronoDuration::seconds(30)
    }

    pub fn has_expired(&self) -> bool {
        self.remaining() <= ChronoDuration::zero()
    }
}

/// Per-request registration parameters.
#[derive(Debug, Clone, Copy)]
pub struct RegisterOptions {
    pub expires: u32,
    pub max_retries: u32,
}

impl RegisterOptions {
    pub fn from_config(config: &RegistrationConfig) -> Self {
        Self {
            expires: config.expires,
            max_retries: config.max_retries,
        }
    }
}

/// Drives the SIP REGISTER lifecycle.
pub struct RegistrationManager {
    aor: SipUri,
    config: RegistrationConfig,
    signaling: Arc<dyn SignalingChannel>,
    store: Option<Arc<dyn PreferenceStore>>,
    bus: Arc<EventBus>,
    state: RwLock<RegistrationState>,
    registration: RwLock<Option<ActiveRegistration>>,
    last_options: RwLock<RegisterOptions>,
    in_flight: AtomicBool,
    retry_attempt: AtomicU32,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
    weak_self: Weak<RegistrationManager>,
}

impl RegistrationManager {
    pub fn new(
        aor: SipUri,
        config: RegistrationConfig,
        signaling: Arc<dyn SignalingChannel>,
        store: Option<Arc<dyn PreferenceStore>>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let defaults = RegisterOptions::from_config(&config);
        Arc::new_cyclic(|weak| Self {
            aor,
            config,
            signaling,
            store,
            bus,
            state: RwLock::new(RegistrationState::Unregistered),
            registration: RwLock::new(None),
            last_options: RwLock::new(defaults),
            in_flight: AtomicBool::new(false),
            retry_attempt: AtomicU32::new(0),
            refresh_task: Mutex::new(None),
            retry_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.read().unwrap()
    }

    pub fn registration(&self) -> Option<ActiveRegistration> {
        self.registration.read().unwrap().clone()
    }

    pub fn is_registered(&self) -> bool {
        self.state() == RegistrationState::Registered
    }

    pub fn is_expiring_soon(&self) -> bool {
        self.registration()
            .map(|r| r.is_expiring_soon())
            .unwrap_or(false)
    }

    pub fn has_expired(&self) -> bool {
        self.registration().map(|r| r.has_expired()).unwrap_or(true)
    }

    /// The refresh point: 90% of the granted interval.
    pub fn refresh_delay(expires: u32) -> Duration {
        Duration::from_millis(u64::from(expires) * 900)
    }

    /// Register with the configured defaults.
    pub async fn register_default(&self) -> Result<()> {
        self.register(RegisterOptions::from_config(&self.config))
            .await
    }

    pub async fn register(&self, options: RegisterOptions) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ClientError::State(
                "Registration manager has been disposed".to_string(),
            ));
        }
        if self.state() == RegistrationState::Registering
            || self.in_flight.swap(true, Ordering::SeqCst)
        {
            return Err(ClientError::Concurrency(
                "Registration already in progress".to_string(),
            ));
        }

        self.cancel_retry();
        *self.last_options.write().unwrap() = options;
        self.set_state(RegistrationState::Registering, None, None);

        let result = self.signaling.register(&self.aor, options.expires).await;
        self.in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(grant) => {
                let effective = if grant.expires > 0 {
                    grant.expires
                } else {
                    options.expires
                };
                let active = ActiveRegistration {
                    uri: self.aor.clone(),
                    expires: effective,
                    expiry_time: Utc::now() + ChronoDuration::seconds(i64::from(effective)),
                };
                *self.registration.write().unwrap() = Some(active);
                self.retry_attempt.store(0, Ordering::SeqCst);
                self.set_state(RegistrationState::Registered, Some(self.aor.clone()), None);
                info!("Registered {} for {}s", self.aor, effective);

                self.persist().await;
                self.schedule_refresh(effective);
                Ok(())
            }
            Err(e) => {
                warn!("Registration of {} failed: {}", self.aor, e);
                self.set_state(
                    RegistrationState::RegistrationFailed,
                    None,
                    Some(e.to_string()),
                );
                self.schedule_retry();
                Err(e)
            }
        }
    }

    /// Re-register with the parameters of the last request.
    pub async fn refresh(&self) -> Result<()> {
        let options = *self.last_options.read().unwrap();
        self.register(options).await
    }

    /// Remove the binding. The local transition to `Unregistered` is
    /// issued regardless of the remote outcome; a failure still
    /// surfaces to the caller.
    pub async fn unregister(&self) -> Result<()> {
        if self.state() == RegistrationState::Unregistered {
            return Ok(());
        }

        self.cancel_refresh();
        self.cancel_retry();
        self.set_state(RegistrationState::Unregistering, None, None);
        *self.registration.write().unwrap() = None;

        let result = self.signaling.unregister(&self.aor).await;

        self.set_state(RegistrationState::Unregistered, None, None);
        if let Some(store) = &self.store {
            store.remove(PREF_REGISTRATION_URI).await;
            store.remove(PREF_REGISTRATION_EXPIRES).await;
        }

        if let Err(e) = &result {
            warn!("Unregister of {} failed: {}", self.aor, e);
        }
        result
    }

    pub fn reset_retries(&self) {
        self.retry_attempt.store(0, Ordering::SeqCst);
    }

    /// Idempotent teardown; pending retry and refresh timers are
    /// abandoned.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_refresh();
        self.cancel_retry();
    }

    async fn persist(&self) {
        let Some(store) = &self.store else { return };
        let Some(active) = self.registration() else { return };
        store
            .set(PREF_REGISTRATION_URI, active.uri.to_string())
            .await;
        store
            .set(PREF_REGISTRATION_EXPIRES, active.expires.to_string())
            .await;
    }

    fn set_state(&self, next: RegistrationState, uri: Option<SipUri>, error: Option<String>) {
        {
            let mut state = self.state.write().unwrap();
            if *state == next {
                return;
            }
            *state = next;
        }
        self.bus.publish(&SessionEvent::RegistrationStateChanged {
            state: next,
            uri,
            error,
        });
    }

    fn schedule_refresh(&self, expires: u32) {
        self.cancel_refresh();

        let delay = Self::refresh_delay(expires);
        if delay.is_zero() {
            return;
        }
        debug!("Registration refresh in {:?}", delay);

        let weak = self.weak_self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else { return };
            if manager.disposed.load(Ordering::SeqCst)
                || manager.state() != RegistrationState::Registered
            {
                return;
            }
            // Detach our own handle so the re-arm inside refresh()
            // cannot abort the running task.
            drop(manager.refresh_task.lock().unwrap().take());
            info!("Refreshing registration for {}", manager.aor);
            if let Err(e) = manager.refresh().await {
                warn!("Registration refresh failed: {}", e);
            }
        });

        if let Some(old) = self.refresh_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    fn schedule_retry(&self) {
        let options = *self.last_options.read().unwrap();
        let attempt = self.retry_attempt.fetch_add(1, Ordering::SeqCst);
        if attempt >= options.max_retries {
            warn!(
                "Giving up on registration after {} retries",
                options.max_retries
            );
            return;
        }

        let delay_ms = self
            .config
            .retry_base_delay_ms
            .saturating_mul(1u64 << attempt.min(31));
        let delay = Duration::from_millis(delay_ms.min(self.config.max_retry_delay_ms));
        info!(
            "Retrying registration in {:?} (attempt {}/{})",
            delay,
            attempt + 1,
            options.max_retries
        );

        let weak = self.weak_self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else { return };
            if manager.disposed.load(Ordering::SeqCst) {
                return;
            }
            // Detach our own handle so cancel_retry() inside register()
            // cannot abort the running task.
            drop(manager.retry_task.lock().unwrap().take());
            if let Err(e) = manager.register(options).await {
                warn!("Registration retry failed: {}", e);
            }
        });

        if let Some(old) = self.retry_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    fn cancel_refresh(&self) {
        if let Some(task) = self.refresh_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn cancel_retry(&self) {
        if let Some(task) = self.retry_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
