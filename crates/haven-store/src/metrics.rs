//! Metrics recorder
//!
//! Two operations, one row layout: counters record value 1, timers
//! record elapsed nanoseconds. Each call queues exactly one insert on
//! the async write queue; there is no in-process aggregation.

use std::time::Duration;

use chrono::Utc;

use crate::models::MetricRow;
use crate::Store;

#[derive(Clone)]
pub struct MetricsRecorder {
    store: Store,
    enabled: bool,
}

impl MetricsRecorder {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            enabled: true,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record a counter data point (value = 1)
    pub fn record_counter(&self, metric_type: &str, entity_id: &str, automation_name: &str) {
        self.record(metric_type, 1, entity_id, automation_name);
    }

    /// Record a timer data point (value = elapsed nanoseconds)
    pub fn record_timer(
        &self,
        metric_type: &str,
        elapsed: Duration,
        entity_id: &str,
        automation_name: &str,
    ) {
        self.record(
            metric_type,
            elapsed.as_nanos() as i64,
            entity_id,
            automation_name,
        );
    }

    fn record(&self, metric_type: &str, value: i64, entity_id: &str, automation_name: &str) {
        if !self.enabled {
            return;
        }

        let row = MetricRow {
            timestamp: Utc::now(),
            metric_type: metric_type.to_string(),
            value,
            entity_id: entity_id.to_string(),
            automation_name: automation_name.to_string(),
        };
        self.store.enqueue_write(Box::new(move |conn| row.insert(conn)));
    }
}
