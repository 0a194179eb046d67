/* src/observer.rs */

use crate::{event_log::LogEntry, gateway::SessionIdentity};
use fancy_log::{LogLevel, log};

/// Hooks for whatever front end displays the session. The core calls these
/// synchronously right after each state change.
pub trait SessionObserver: Send + Sync {
    fn on_identity_changed(&self, _identity: &SessionIdentity) {}

    /// `entries` are the newly inserted entries, newest first.
    fn on_log_appended(&self, _entries: &[LogEntry]) {}

    fn on_notify(&self, _message: &str, _is_error: bool) {}
}

/// Writes every hook invocation to the daemon log.
pub struct LogObserver;

impl SessionObserver for LogObserver {
    fn on_identity_changed(&self, identity: &SessionIdentity) {
        log(
            LogLevel::Info,
            &format!("Interaction domain is now '{}'", identity.domain),
        );
    }

    fn on_log_appended(&self, entries: &[LogEntry]) {
        for entry in entries.iter().rev() {
            log(LogLevel::Info, &entry.headline);
            if let Some(detail) = &entry.detail {
                log(LogLevel::Debug, detail);
            }
        }
    }

    fn on_notify(&self, message: &str, is_error: bool) {
        let level = if is_error {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        log(level, message);
    }
}
