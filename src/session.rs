/* src/session.rs */

use crate::{gateway::SessionIdentity, observer::SessionObserver, storage::KeyValueStore};
use fancy_log::{LogLevel, log};
use parking_lot::RwLock;
use std::sync::Arc;

pub const DOMAIN_KEY: &str = "domain";
pub const CORRELATION_ID_KEY: &str = "correlation_id";
pub const TOKEN_KEY: &str = "token";

/// Owns the current session identity and its persisted copy.
pub struct SessionManager {
    current: RwLock<Option<SessionIdentity>>,
    store: Arc<dyn KeyValueStore>,
    observer: Arc<dyn SessionObserver>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn KeyValueStore>, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            current: RwLock::new(None),
            store,
            observer,
        }
    }

    pub fn current(&self) -> Option<SessionIdentity> {
        self.current.read().clone()
    }

    /// Loads the persisted identity into memory. Any missing, empty or
    /// unreadable field means there is no identity at all.
    pub async fn restore(&self) -> Option<SessionIdentity> {
        let domain = self.read_key(DOMAIN_KEY).await?;
        let correlation_id = self.read_key(CORRELATION_ID_KEY).await?;
        let token = self.read_key(TOKEN_KEY).await?;

        let identity = SessionIdentity {
            domain,
            correlation_id,
            token,
        };
        *self.current.write() = Some(identity.clone());
        log(
            LogLevel::Debug,
            &format!("Restored session for '{}'", identity.domain),
        );
        Some(identity)
    }

    async fn read_key(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(Some(value)) if !value.trim().is_empty() => Some(value.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                log(
                    LogLevel::Warn,
                    &format!("Ignoring unreadable session key '{}': {}", key, e),
                );
                None
            }
        }
    }

    /// Swaps in a new identity. Memory is updated before anything awaits,
    /// so pollers see the new token at once.
    pub async fn replace(&self, identity: SessionIdentity) {
        *self.current.write() = Some(identity.clone());

        for (key, value) in [
            (DOMAIN_KEY, &identity.domain),
            (CORRELATION_ID_KEY, &identity.correlation_id),
            (TOKEN_KEY, &identity.token),
        ] {
            if let Err(e) = self.store.set(key, value).await {
                log(
                    LogLevel::Error,
                    &format!("Failed to persist session key '{}': {}", key, e),
                );
            }
        }

        self.observer.on_identity_changed(&identity);
    }

    /// Forgets the in-memory identity. Persisted values are left for the
    /// next registration to overwrite.
    pub fn clear(&self) {
        *self.current.write() = None;
    }
}
