/* src/failover.rs */

use crate::{
    gateway::{Gateway, SessionIdentity},
    observer::SessionObserver,
    session::SessionManager,
};
use fancy_log::{LogLevel, log};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::{sync::Mutex, time};

/// Where the current registration cycle stands.
#[derive(Clone, Debug, PartialEq)]
pub enum FailoverState {
    Idle,
    Attempting(String),
    Succeeded(SessionIdentity),
    Exhausted,
}

#[derive(Error, Debug, PartialEq)]
pub enum FailoverError {
    #[error("all {attempts} collector servers failed")]
    Exhausted { attempts: usize },
}

/// Walks the candidate collector hosts until one hands out a session.
pub struct FailoverController {
    candidates: Vec<String>,
    active: RwLock<String>,
    tried: RwLock<HashSet<String>>,
    state: RwLock<FailoverState>,
    retry_delay: Duration,
    gateway: Arc<dyn Gateway>,
    session: Arc<SessionManager>,
    observer: Arc<dyn SessionObserver>,
    // One cycle at a time.
    cycle: Mutex<()>,
}

impl FailoverController {
    pub fn new(
        candidates: Vec<String>,
        preferred: String,
        retry_delay: Duration,
        gateway: Arc<dyn Gateway>,
        session: Arc<SessionManager>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            candidates,
            active: RwLock::new(preferred),
            tried: RwLock::new(HashSet::new()),
            state: RwLock::new(FailoverState::Idle),
            retry_delay,
            gateway,
            session,
            observer,
            cycle: Mutex::new(()),
        }
    }

    pub fn state(&self) -> FailoverState {
        self.state.read().clone()
    }

    /// The host that most recently handed out a session.
    pub fn active_host(&self) -> String {
        self.active.read().clone()
    }

    #[cfg(test)]
    pub fn tried(&self) -> HashSet<String> {
        self.tried.read().clone()
    }

    /// Candidates in attempt order: the active host first, then the rest of
    /// the configured list after it, wrapping around.
    fn attempt_order(&self) -> Vec<String> {
        let active = self.active_host();
        let mut order = Vec::with_capacity(self.candidates.len() + 1);
        match self.candidates.iter().position(|h| *h == active) {
            Some(start) => {
                let (head, tail) = self.candidates.split_at(start);
                order.extend(tail.iter().chain(head.iter()).cloned());
            }
            None => {
                if !active.is_empty() {
                    order.push(active);
                }
                order.extend(self.candidates.iter().cloned());
            }
        }
        let mut seen = HashSet::new();
        order.retain(|h| seen.insert(h.clone()));
        order
    }

    /// Runs one registration cycle. Per-host failures are retried against
    /// the next untried host; only running out of hosts is reported.
    pub async fn generate(&self) -> Result<SessionIdentity, FailoverError> {
        let _cycle = self.cycle.lock().await;
        self.tried.write().clear();

        let order = self.attempt_order();
        for (attempt, host) in order.iter().enumerate() {
            if self.tried.read().contains(host) {
                continue;
            }
            if attempt > 0 {
                log(
                    LogLevel::Warn,
                    &format!("Trying alternative collector server: {}", host),
                );
                time::sleep(self.retry_delay).await;
            }

            *self.state.write() = FailoverState::Attempting(host.clone());
            log(
                LogLevel::Debug,
                &format!("Registering with collector '{}'", host),
            );

            match self.gateway.register(host).await {
                Ok(identity) => {
                    self.session.replace(identity.clone()).await;
                    *self.active.write() = host.clone();
                    self.tried.write().clear();
                    *self.state.write() = FailoverState::Succeeded(identity.clone());
                    log(
                        LogLevel::Info,
                        &format!("Registered '{}' via '{}'", identity.domain, host),
                    );
                    self.observer
                        .on_notify("New domain generated successfully", false);
                    return Ok(identity);
                }
                Err(e) => {
                    log(
                        LogLevel::Warn,
                        &format!("Registration with '{}' failed: {}", host, e),
                    );
                    self.tried.write().insert(host.clone());
                }
            }
        }

        let attempts = self.tried.read().len();
        self.tried.write().clear();
        self.session.clear();
        *self.state.write() = FailoverState::Exhausted;
        self.observer.on_notify("All collector servers failed", true);
        Err(FailoverError::Exhausted { attempts })
    }
}
