/* src/tasks.rs */

use crate::{event_log::EventLog, gateway::Gateway, session::SessionManager, state::AppState};
use fancy_log::{LogLevel, log};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

struct Poller {
    gateway: Arc<dyn Gateway>,
    session: Arc<SessionManager>,
    events: Arc<EventLog>,
}

impl Poller {
    async fn poll_once(&self) {
        let Some(identity) = self.session.current() else {
            return;
        };

        match self.gateway.poll(&identity.token).await {
            Ok(records) if records.is_empty() => {}
            Ok(records) => {
                let still_current = self
                    .session
                    .current()
                    .is_some_and(|now| now.token == identity.token);
                if !still_current {
                    log(
                        LogLevel::Debug,
                        &format!(
                            "Dropping {} interactions for replaced domain '{}'",
                            records.len(),
                            identity.domain
                        ),
                    );
                    return;
                }
                // Runs on its own task so a stop() mid-write cannot leave the
                // snapshot behind memory or skip the observer.
                let events = self.events.clone();
                let applied = tokio::spawn(async move { events.append(&records).await });
                if let Err(e) = applied.await {
                    log(
                        LogLevel::Error,
                        &format!("Failed to record interactions: {}", e),
                    );
                }
            }
            Err(e) => log(
                LogLevel::Warn,
                &format!("Error polling for interactions: {}", e),
            ),
        }
    }
}

/// Periodically polls the collector for the current session. At most one
/// ticker is ever alive.
pub struct PollingScheduler {
    poller: Arc<Poller>,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
    polling: AtomicBool,
}

impl PollingScheduler {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        session: Arc<SessionManager>,
        events: Arc<EventLog>,
        interval: Duration,
    ) -> Self {
        Self {
            poller: Arc::new(Poller {
                gateway,
                session,
                events,
            }),
            interval,
            handle: Mutex::new(None),
            polling: AtomicBool::new(false),
        }
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    /// (Re)starts the ticker. The first poll happens right away.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if let Some(previous) = handle.take() {
            previous.abort();
        }

        let poller = self.poller.clone();
        let period = self.interval;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                poller.poll_once().await;
            }
        }));
        self.polling.store(true, Ordering::SeqCst);
        log(
            LogLevel::Debug,
            &format!("Polling every {:?}", self.interval),
        );
    }

    /// Cancels the ticker. A request still in flight is dropped with it; a
    /// batch that already arrived is still written out.
    pub fn stop(&self) {
        if let Some(previous) = self.handle.lock().take() {
            previous.abort();
        }
        self.polling.store(false, Ordering::SeqCst);
    }

    /// Returns the new polling state.
    pub fn toggle(&self) -> bool {
        if self.is_polling() {
            self.stop();
        } else {
            self.start();
        }
        self.is_polling()
    }

    /// One poll outside the ticker.
    #[cfg(test)]
    pub async fn poll_once(&self) {
        self.poller.poll_once().await;
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// Restores the previous session and log, then starts polling. A fresh
/// domain is only requested when nothing could be restored.
pub fn spawn_startup_task(app_state: AppState) {
    tokio::spawn(async move {
        let restored_logs = app_state.events.restore().await;
        log(
            LogLevel::Info,
            &format!("Restored {} log entries.", restored_logs),
        );

        match app_state.session.restore().await {
            Some(identity) => {
                log(
                    LogLevel::Info,
                    &format!("Resuming session for '{}'", identity.domain),
                );
                app_state.scheduler.start();
            }
            None => {
                log(
                    LogLevel::Info,
                    "No previous session found. Generating a new domain...",
                );
                app_state.generate_new_domain().await;
            }
        }
    });
}
