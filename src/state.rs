/* src/state.rs */

use crate::{
    config::{self, AppConfig, CollectorConfig},
    event_log::EventLog,
    failover::FailoverController,
    gateway::{Gateway, RelayClient, SessionIdentity},
    observer::SessionObserver,
    relay::Relay,
    session::SessionManager,
    storage::KeyValueStore,
    tasks::PollingScheduler,
};
use fancy_log::{LogLevel, log};
use std::sync::Arc;

/// Everything the daemon shares between its server and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub collector: Arc<CollectorConfig>,
    pub session: Arc<SessionManager>,
    pub failover: Arc<FailoverController>,
    pub scheduler: Arc<PollingScheduler>,
    pub events: Arc<EventLog>,
    pub relay: Arc<Relay>,
    pub observer: Arc<dyn SessionObserver>,
    gateway: Arc<dyn Gateway>,
}

impl AppState {
    /// Wires the components together around a relay client built from config.
    pub fn new(
        config: AppConfig,
        collector: CollectorConfig,
        store: Arc<dyn KeyValueStore>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let gateway = RelayClient::new(
            &config.relay_base,
            collector.port,
            collector.tls,
            config.request_timeout,
        )?;
        Self::with_gateway(config, collector, Arc::new(gateway), store, observer)
    }

    pub fn with_gateway(
        config: AppConfig,
        collector: CollectorConfig,
        gateway: Arc<dyn Gateway>,
        store: Arc<dyn KeyValueStore>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let session = Arc::new(SessionManager::new(store.clone(), observer.clone()));
        let events = Arc::new(EventLog::new(
            config.max_logs,
            store.clone(),
            observer.clone(),
        ));
        let failover = Arc::new(FailoverController::new(
            collector.servers.clone(),
            collector.preferred_host(),
            config.retry_delay,
            gateway.clone(),
            session.clone(),
            observer.clone(),
        ));
        let scheduler = Arc::new(PollingScheduler::new(
            gateway.clone(),
            session.clone(),
            events.clone(),
            config.polling_interval,
        ));
        let relay = Arc::new(Relay::new(store, config.request_timeout)?);

        Ok(Self {
            config: Arc::new(config),
            collector: Arc::new(collector),
            session,
            failover,
            scheduler,
            events,
            relay,
            observer,
            gateway,
        })
    }

    /// Runs a registration cycle, restarts polling on the new identity and
    /// releases the one it replaced. Returns whether a domain was obtained.
    pub async fn generate_new_domain(&self) -> bool {
        let previous = self.session.current();
        match self.failover.generate().await {
            Ok(identity) => {
                self.events
                    .annotate(&format!("New domain generated: {}", identity.domain))
                    .await;
                self.scheduler.start();
                self.remember_active_host().await;
                if let Some(previous) = previous.filter(|p| p.token != identity.token) {
                    self.release(&previous).await;
                }
                true
            }
            Err(e) => {
                log(
                    LogLevel::Error,
                    &format!(
                        "Failed to generate domain: {}. Check your network connection or try again later.",
                        e
                    ),
                );
                false
            }
        }
    }

    async fn release(&self, identity: &SessionIdentity) {
        match self.gateway.deregister(&identity.token).await {
            Ok(()) => log(
                LogLevel::Debug,
                &format!("Released previous domain '{}'", identity.domain),
            ),
            Err(e) => log(
                LogLevel::Warn,
                &format!("Failed to release previous domain '{}': {}", identity.domain, e),
            ),
        }
    }

    async fn remember_active_host(&self) {
        let host = self.failover.active_host();
        let path = self.config.config_toml_path();
        if let Err(e) = config::save_preferred_server(&path, &host).await {
            log(
                LogLevel::Warn,
                &format!("Failed to persist preferred server to config.toml: {}", e),
            );
        }
    }

    /// Flips polling and notes the change in the log.
    pub async fn toggle_polling(&self) -> bool {
        let polling = self.scheduler.toggle();
        let message = if polling {
            "Polling started"
        } else {
            "Polling stopped"
        };
        self.events.annotate(message).await;
        self.observer.on_notify(message, false);
        polling
    }

    pub fn shutdown(&self) {
        self.scheduler.stop();
    }
}
