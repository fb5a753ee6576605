// ── Device session manager ──
//
// Owns every local device session. `authenticate` negotiates with the
// device and records the outcome; the remaining operations read or evict
// that record. The negotiated `IsapiClient` is kept with its session so
// health checks and logout reuse the cached challenge.

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use gatewatch_api::{Credentials, IsapiClient};
use rand::RngCore;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::{DeviceConfig, DeviceConfigSource, SecretDecryptor};
use crate::error::CoreError;
use crate::model::{AuthOutcome, DeviceHealth, DeviceSession};

/// Default session lifetime in hours.
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

struct SessionEntry {
    session: DeviceSession,
    client: Arc<IsapiClient>,
}

/// Authenticates devices and tracks one local session per device.
pub struct DeviceSessionManager {
    sessions: DashMap<String, SessionEntry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    config_source: Arc<dyn DeviceConfigSource>,
    decryptor: Arc<dyn SecretDecryptor>,
    ttl: ChronoDuration,
}

impl DeviceSessionManager {
    pub fn new(
        config_source: Arc<dyn DeviceConfigSource>,
        decryptor: Arc<dyn SecretDecryptor>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            locks: DashMap::new(),
            config_source,
            decryptor,
            ttl: ChronoDuration::hours(DEFAULT_SESSION_TTL_HOURS),
        }
    }

    /// Override the session lifetime.
    pub fn with_ttl(mut self, ttl: ChronoDuration) -> Self {
        self.ttl = ttl;
        self
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Negotiate with the device and store a fresh session, replacing any
    /// previous one. Calls for the same device run one at a time.
    #[instrument(skip_all, fields(device_id = %config.device_id))]
    pub async fn authenticate(&self, config: &DeviceConfig) -> Result<AuthOutcome, CoreError> {
        let lock = self.device_lock(&config.device_id);
        let _guard = lock.lock().await;

        self.negotiate(config)
            .await
            .map_err(|e| CoreError::operation(&config.device_id, "authenticate", e))
    }

    async fn negotiate(&self, config: &DeviceConfig) -> Result<AuthOutcome, CoreError> {
        let password = self.decryptor.decrypt(&config.encrypted_secret).map_err(|e| {
            CoreError::Decrypt {
                device_id: config.device_id.clone(),
                message: e.to_string(),
            }
        })?;
        let client = IsapiClient::new(
            config.base_url()?,
            Credentials {
                username: config.username.clone(),
                password,
            },
            &config.transport_config(),
        )?;

        let caps = client.capabilities().await?;

        let now = Utc::now();
        let session = DeviceSession {
            device_id: config.device_id.clone(),
            auth_token: caps.vendor_token,
            session_token: generate_session_token(),
            created_at: now,
            expires_at: now + self.ttl,
            is_active: true,
            device_info: caps.device_info,
        };
        let outcome = AuthOutcome {
            device_id: session.device_id.clone(),
            session_token: session.session_token.clone(),
            auth_token: session.auth_token.clone(),
            expires_at: session.expires_at,
            device_info: session.device_info.clone(),
        };

        let replaced = self
            .sessions
            .insert(
                config.device_id.clone(),
                SessionEntry {
                    session,
                    client: Arc::new(client),
                },
            )
            .is_some();

        info!(
            scheme = ?caps.scheme,
            model = outcome.device_info.model.as_deref().unwrap_or("unknown"),
            replaced,
            "device authenticated"
        );
        Ok(outcome)
    }

    /// True iff the device has an active, unexpired session with this token.
    ///
    /// An expired session is evicted on the way out.
    pub fn validate_session(&self, device_id: &str, token: &str) -> bool {
        let now = Utc::now();
        {
            let Some(entry) = self.sessions.get(device_id) else {
                return false;
            };
            if !entry.session.is_expired(now) {
                return entry.session.is_active && entry.session.session_token == token;
            }
        }

        if self
            .sessions
            .remove_if(device_id, |_, entry| entry.session.is_expired(now))
            .is_some()
        {
            debug!(device_id, "evicted expired session");
        }
        false
    }

    /// Re-authenticate a device that already has a session.
    #[instrument(skip(self))]
    pub async fn refresh_token(&self, device_id: &str) -> Result<AuthOutcome, CoreError> {
        let config = self.config_source.device_config(device_id).ok_or_else(|| {
            CoreError::ConfigNotFound {
                device_id: device_id.to_owned(),
            }
        })?;
        if !self.sessions.contains_key(device_id) {
            return Err(CoreError::SessionNotFound {
                device_id: device_id.to_owned(),
            });
        }
        self.authenticate(&config).await
    }

    /// End the device-side session if possible, then drop the local one.
    ///
    /// Vendor failures are logged, never returned.
    #[instrument(skip(self))]
    pub async fn logout(&self, device_id: &str) {
        let lock = self.device_lock(device_id);
        {
            let _guard = lock.lock().await;

            let client = self
                .sessions
                .get(device_id)
                .map(|entry| Arc::clone(&entry.client));

            if let Some(client) = client {
                if let Err(e) = client.logout().await {
                    warn!(error = %e, "vendor logout failed");
                }
            }

            if self.sessions.remove(device_id).is_some() {
                info!("session closed");
            }
        }
        self.release_lock(device_id, lock);
    }

    /// Probe `/ISAPI/System/status` over the session's client.
    ///
    /// Without a usable session nothing is sent.
    pub async fn device_health(&self, device_id: &str) -> DeviceHealth {
        let now = Utc::now();
        let client = match self.sessions.get(device_id) {
            Some(entry) if entry.session.is_valid(now) => Arc::clone(&entry.client),
            _ => return DeviceHealth::offline(device_id),
        };

        let started = Instant::now();
        let result = client.status().await;
        let latency = started.elapsed();

        match result {
            Ok(()) => DeviceHealth {
                device_id: device_id.to_owned(),
                connected: true,
                auth_valid: true,
                latency: Some(latency),
                error: None,
            },
            Err(e) => {
                warn!(device_id, error = %e, "health probe failed");
                let answered = matches!(e, gatewatch_api::Error::Isapi { .. }) || e.is_auth();
                DeviceHealth {
                    device_id: device_id.to_owned(),
                    connected: answered,
                    auth_valid: !e.is_auth(),
                    latency: answered.then_some(latency),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    /// Snapshot of the stored session, expired or not.
    pub fn session(&self, device_id: &str) -> Option<DeviceSession> {
        self.sessions
            .get(device_id)
            .map(|entry| entry.session.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(device_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Drop the device's lock entry unless another caller still holds it.
    fn release_lock(&self, device_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(device_id, |_, held| Arc::strong_count(held) == 1);
    }
}

/// 32 random bytes as lowercase hex.
fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::SecretString;

    use super::*;

    fn manager() -> DeviceSessionManager {
        let source: Arc<dyn DeviceConfigSource> =
            Arc::new(HashMap::<String, DeviceConfig>::new());
        let decryptor: Arc<dyn SecretDecryptor> =
            Arc::new(|raw: &str| Ok::<_, CoreError>(SecretString::from(raw.to_owned())));
        DeviceSessionManager::new(source, decryptor)
    }

    #[tokio::test]
    async fn logout_releases_device_lock() {
        let sessions = manager();
        sessions.logout("lobby").await;
        sessions.logout("garage").await;
        assert!(sessions.locks.is_empty());
    }

    #[tokio::test]
    async fn held_lock_survives_release() {
        let sessions = manager();
        let held = sessions.device_lock("lobby");
        sessions.logout("lobby").await;
        assert!(sessions.locks.contains_key("lobby"));

        drop(held);
        sessions.logout("lobby").await;
        assert!(sessions.locks.is_empty());
    }

    #[test]
    fn session_tokens_are_64_hex_and_unique() {
        let a = generate_session_token();
        let b = generate_session_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
