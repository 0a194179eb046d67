/* src/event_log.rs */

use crate::{
    gateway::InteractionRecord,
    observer::SessionObserver,
    storage::{KeyValueStore, StorageError},
};
use chrono::{DateTime, Utc};
use fancy_log::{LogLevel, log};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const LOGS_KEY: &str = "logs";

/// A rendered line in the interaction log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub headline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LogEntry {
    pub fn from_interaction(record: &InteractionRecord) -> Self {
        let when = record
            .timestamp
            .map(format_timestamp)
            .unwrap_or_else(|| "unknown time".to_string());
        let headline = format!(
            "[{}] {} from {}",
            when,
            record.protocol,
            record.remote_address.as_deref().unwrap_or("Unknown")
        );
        let detail = serde_json::to_string_pretty(&record.raw).ok();
        Self {
            // Undated records sort as received.
            timestamp: record.timestamp.unwrap_or_else(|| Utc::now().timestamp()),
            headline,
            detail,
        }
    }

    pub fn status(message: &str) -> Self {
        let now = Utc::now().timestamp();
        Self {
            timestamp: now,
            headline: format!("[{}] {}", format_timestamp(now), message),
            detail: None,
        }
    }

    pub fn render(&self) -> String {
        match &self.detail {
            Some(detail) => format!("{}\n{}", self.headline, detail),
            None => self.headline.clone(),
        }
    }
}

fn format_timestamp(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Newest-first, size-bounded interaction log with a persisted snapshot.
pub struct EventLog {
    entries: RwLock<VecDeque<LogEntry>>,
    max_logs: usize,
    store: Arc<dyn KeyValueStore>,
    observer: Arc<dyn SessionObserver>,
    // Held across mutate + write so snapshots land in mutation order.
    persist_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(
        max_logs: usize,
        store: Arc<dyn KeyValueStore>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            max_logs: max_logs.max(1),
            store,
            observer,
            persist_lock: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[cfg(test)]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.read().iter().cloned().collect()
    }

    /// Inserts one entry per record, in the order given, each at the front.
    pub async fn append(&self, records: &[InteractionRecord]) {
        if records.is_empty() {
            return;
        }
        let new_entries: Vec<LogEntry> = records.iter().map(LogEntry::from_interaction).collect();
        self.insert(new_entries).await;
    }

    /// Adds a locally generated status line.
    pub async fn annotate(&self, message: &str) {
        self.insert(vec![LogEntry::status(message)]).await;
    }

    async fn insert(&self, new_entries: Vec<LogEntry>) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = {
            let mut entries = self.entries.write();
            for entry in &new_entries {
                entries.push_front(entry.clone());
                if entries.len() > self.max_logs {
                    entries.pop_back();
                }
            }
            entries.iter().cloned().collect::<Vec<_>>()
        };
        self.persist(&snapshot).await;

        let mut newest_first = new_entries;
        newest_first.reverse();
        self.observer.on_log_appended(&newest_first);
    }

    pub async fn clear(&self) {
        let _guard = self.persist_lock.lock().await;
        self.entries.write().clear();
        self.persist(&[]).await;
    }

    /// Plain text of every entry, newest first.
    pub fn export(&self) -> String {
        self.entries
            .read()
            .iter()
            .map(LogEntry::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Loads the last snapshot, keeping at most `max_logs` of its newest
    /// entries. A broken snapshot reads as empty.
    pub async fn restore(&self) -> usize {
        let mut restored = match self.load_snapshot().await {
            Ok(entries) => entries,
            Err(e) => {
                log(
                    LogLevel::Warn,
                    &format!("Discarding unreadable log snapshot: {}", e),
                );
                Vec::new()
            }
        };
        if restored.len() > self.max_logs {
            log(
                LogLevel::Debug,
                &format!(
                    "Trimming restored log from {} to {} entries.",
                    restored.len(),
                    self.max_logs
                ),
            );
            restored.truncate(self.max_logs);
        }
        let count = restored.len();
        *self.entries.write() = restored.into();
        count
    }

    async fn load_snapshot(&self) -> Result<Vec<LogEntry>, StorageError> {
        match self.store.get(LOGS_KEY).await? {
            Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
            _ => Ok(Vec::new()),
        }
    }

    async fn persist(&self, snapshot: &[LogEntry]) {
        let result = match serde_json::to_string(snapshot) {
            Ok(json) => self.store.set(LOGS_KEY, &json).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            log(
                LogLevel::Error,
                &format!("Failed to persist log snapshot: {}", e),
            );
        }
    }
}
