//! Row types for the persisted tables

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

/// One mirrored entity, upserted on every state change
#[derive(Debug, Clone)]
pub struct EntityRow {
    pub id: String,
    /// Entity kind, the domain prefix of the id (e.g. "light")
    pub kind: String,
    /// Last seen state snapshot, as JSON
    pub state: Option<serde_json::Value>,
}

impl EntityRow {
    /// Insert the row, or update every column if the id already exists
    pub fn upsert(&self, conn: &Connection) -> rusqlite::Result<()> {
        let state = self
            .state
            .as_ref()
            .map(|s| s.to_string());

        conn.execute(
            "INSERT INTO entities (id, kind, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 kind = excluded.kind,
                 state = excluded.state,
                 updated_at = excluded.updated_at",
            params![self.id, self.kind, state, Utc::now()],
        )?;
        Ok(())
    }
}

/// One metric data point
///
/// Counters carry value 1; timers carry elapsed nanoseconds. Same row
/// layout either way.
#[derive(Debug, Clone)]
pub struct MetricRow {
    pub timestamp: DateTime<Utc>,
    pub metric_type: String,
    pub value: i64,
    pub entity_id: String,
    pub automation_name: String,
}

impl MetricRow {
    pub fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO metrics (timestamp, metric_type, value, entity_id, automation_name)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.timestamp,
                self.metric_type,
                self.value,
                self.entity_id,
                self.automation_name
            ],
        )?;
        Ok(())
    }
}

/// One persisted log line
#[derive(Debug, Clone)]
pub struct LogRow {
    pub timestamp: DateTime<Utc>,
    pub entity_id: Option<String>,
    pub log_text: String,
    pub level: String,
}

impl LogRow {
    pub fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO logs (timestamp, entity_id, log_text, level)
             VALUES (?1, ?2, ?3, ?4)",
            params![self.timestamp, self.entity_id, self.log_text, self.level],
        )?;
        Ok(())
    }
}
