//! Log service
//!
//! Logs go to the console via `tracing` and to the database via the
//! async write queue. Entries logged before a database is attached are
//! kept in a bounded ring buffer and flushed on attach, so early startup
//! logs are not lost.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::models::LogRow;
use crate::Store;

/// Entries buffered before the database is attached
const RING_CAPACITY: usize = 1000;

/// Severity of a persisted log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

struct LogServiceInner {
    store: Option<Store>,
    ring: VecDeque<LogRow>,
    min_level: LogLevel,
}

/// Console + database logger. Cheap to clone.
#[derive(Clone)]
pub struct LogService {
    inner: Arc<Mutex<LogServiceInner>>,
}

impl LogService {
    /// A service with no database attached yet; entries buffer in the
    /// ring until `attach` is called.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogServiceInner {
                store: None,
                ring: VecDeque::with_capacity(RING_CAPACITY),
                min_level: LogLevel::Info,
            })),
        }
    }

    pub fn with_store(store: Store) -> Self {
        let service = Self::new();
        service.attach(store);
        service
    }

    /// Attach the database and flush everything buffered so far
    pub fn attach(&self, store: Store) {
        let mut inner = self.inner.lock().unwrap();
        let buffered = inner.ring.len();

        for row in inner.ring.drain(..) {
            store.enqueue_write(Box::new(move |conn| row.insert(conn)));
        }
        inner.store = Some(store);

        if buffered > 0 {
            info!(count = buffered, "flushed buffered logs to database");
        }
    }

    /// Minimum level persisted to the database (console logging is
    /// filtered by the tracing subscriber, not here)
    pub fn set_level(&self, level: LogLevel) {
        self.inner.lock().unwrap().min_level = level;
    }

    pub fn debug(&self, msg: &str, entity_id: Option<&str>) {
        debug!(entity_id = entity_id.unwrap_or(""), "{msg}");
        self.record(LogLevel::Debug, msg, entity_id);
    }

    pub fn info(&self, msg: &str, entity_id: Option<&str>) {
        info!(entity_id = entity_id.unwrap_or(""), "{msg}");
        self.record(LogLevel::Info, msg, entity_id);
    }

    pub fn warn(&self, msg: &str, entity_id: Option<&str>) {
        warn!(entity_id = entity_id.unwrap_or(""), "{msg}");
        self.record(LogLevel::Warn, msg, entity_id);
    }

    pub fn error(&self, msg: &str, entity_id: Option<&str>) {
        error!(entity_id = entity_id.unwrap_or(""), "{msg}");
        self.record(LogLevel::Error, msg, entity_id);
    }

    fn record(&self, level: LogLevel, msg: &str, entity_id: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        if level < inner.min_level {
            return;
        }

        let row = LogRow {
            timestamp: Utc::now(),
            entity_id: entity_id.map(str::to_string),
            log_text: msg.to_string(),
            level: level.as_str().to_string(),
        };

        if let Some(store) = inner.store.clone() {
            store.enqueue_write(Box::new(move |conn| row.insert(conn)));
        } else {
            if inner.ring.len() == RING_CAPACITY {
                inner.ring.pop_front();
            }
            inner.ring.push_back(row);
        }
    }
}

impl Default for LogService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attach_flushes_buffered_entries() {
        let service = LogService::new();
        service.info("starting up", None);
        service.warn("still no database", Some("light.kitchen"));

        let store = Store::in_memory().unwrap();
        service.attach(store.clone());
        store.wait_for_writes().await;

        assert_eq!(store.log_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn ring_buffer_drops_oldest_beyond_capacity() {
        let service = LogService::new();
        for i in 0..(RING_CAPACITY + 10) {
            service.info(&format!("entry {i}"), None);
        }

        assert_eq!(service.inner.lock().unwrap().ring.len(), RING_CAPACITY);
        assert_eq!(
            service.inner.lock().unwrap().ring.front().unwrap().log_text,
            "entry 10"
        );
    }

    #[tokio::test]
    async fn level_filter_applies_to_database_only() {
        let store = Store::in_memory().unwrap();
        let service = LogService::with_store(store.clone());
        service.set_level(LogLevel::Warn);

        service.debug("quiet", None);
        service.info("quiet", None);
        service.warn("loud", None);
        service.error("loud", None);
        store.wait_for_writes().await;

        assert_eq!(store.log_count().unwrap(), 2);
    }
}
