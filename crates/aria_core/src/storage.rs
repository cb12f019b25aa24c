//! Durable storage for the core's records.
//!
//! Single SQLite connection behind a mutex; all access happens on the
//! blocking pool. Every public call carries a deadline — a timeout is a
//! recoverable failure for that one operation, never fatal.

use crate::error::{CoreError, Result};
use crate::types::{
    Automation, AutomationRule, Device, Interaction, InteractionKind, Prediction, PredictionKind,
    Reading, ScheduleEntry,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Database location based on execution mode.
#[derive(Debug, Clone)]
pub enum StoreLocation {
    /// $XDG_DATA_HOME/aria/core.db or ~/.local/share/aria/core.db
    User,
    /// Custom path for testing.
    Custom(PathBuf),
}

impl StoreLocation {
    pub fn path(&self) -> Result<PathBuf> {
        match self {
            StoreLocation::User => {
                let base_dir = if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
                    PathBuf::from(xdg_data)
                } else if let Ok(home) = std::env::var("HOME") {
                    PathBuf::from(home).join(".local/share")
                } else {
                    return Err(CoreError::Persistence(
                        "Could not determine user data directory".to_string(),
                    ));
                };
                Ok(base_dir.join("aria").join("core.db"))
            }
            StoreLocation::Custom(path) => Ok(path.clone()),
        }
    }
}

/// SQLite-backed store (single connection with mutex).
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    timeout: Duration,
}

impl Store {
    /// Open or create the database at the specified location.
    pub async fn open(location: StoreLocation, timeout_ms: u64) -> Result<Self> {
        let db_path = location.path()?;

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Opening core database at: {}", db_path.display());

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&db_path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(conn)
        })
        .await??;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            timeout: Duration::from_millis(timeout_ms),
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// Run `f` on the blocking pool under the store's deadline.
    async fn call<F, R>(&self, operation: &'static str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let task = tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => Err(CoreError::UpstreamTimeout {
                operation: operation.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    async fn initialize_schema(&self) -> Result<()> {
        self.call("initialize_schema", |conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS interactions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    content TEXT NOT NULL,
                    metadata TEXT,
                    timestamp TEXT NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_interactions_user_ts
                 ON interactions(user_id, timestamp DESC)",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS preferences (
                    user_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (user_id, key)
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS readings (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    temperature_c REAL NOT NULL,
                    condition TEXT NOT NULL,
                    timestamp TEXT NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_readings_user_ts
                 ON readings(user_id, timestamp DESC)",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS schedule_entries (
                    id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    starts_at TEXT NOT NULL,
                    ends_at TEXT,
                    PRIMARY KEY (id, user_id)
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS devices (
                    id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    PRIMARY KEY (id, user_id)
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS automations (
                    id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    PRIMARY KEY (id, user_id)
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS automation_rules (
                    id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    PRIMARY KEY (id, user_id)
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS emotional_state (
                    user_id TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS predictions (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    confidence REAL NOT NULL,
                    data TEXT NOT NULL,
                    timestamp TEXT NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_predictions_user_kind
                 ON predictions(user_id, kind, timestamp DESC)",
                [],
            )?;

            debug!("Database schema initialized");
            Ok(())
        })
        .await
    }

    // ---- Interactions -----------------------------------------------------

    pub async fn insert_interaction(&self, user: &str, interaction: &Interaction) -> Result<()> {
        let user = user.to_string();
        let kind = interaction.kind.as_str();
        let content = serde_json::to_string(&interaction.content)?;
        let metadata = serde_json::to_string(&interaction.metadata)?;
        let timestamp = interaction.timestamp.to_rfc3339();

        self.call("insert_interaction", move |conn| {
            conn.execute(
                "INSERT INTO interactions (user_id, kind, content, metadata, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user, kind, content, metadata, timestamp],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn recent_interactions(&self, user: &str, limit: usize) -> Result<Vec<Interaction>> {
        let user = user.to_string();
        self.call("recent_interactions", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT kind, content, metadata, timestamp FROM interactions
                 WHERE user_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (kind, content, metadata, ts) = row?;
                let Some(kind) = InteractionKind::parse(&kind) else {
                    warn!("Skipping interaction with unknown kind: {kind}");
                    continue;
                };
                out.push(Interaction {
                    kind,
                    content: serde_json::from_str(&content)?,
                    metadata: metadata
                        .map(|m| serde_json::from_str(&m))
                        .transpose()?
                        .unwrap_or_default(),
                    timestamp: parse_ts(&ts)?,
                });
            }
            Ok(out)
        })
        .await
    }

    // ---- Preferences ------------------------------------------------------

    pub async fn upsert_preference(
        &self,
        user: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let user = user.to_string();
        let key = key.to_string();
        let value = serde_json::to_string(value)?;
        let now = Utc::now().to_rfc3339();

        self.call("upsert_preference", move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO preferences (user_id, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user, key, value, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn load_preferences(&self, user: &str) -> Result<HashMap<String, serde_json::Value>> {
        let user = user.to_string();
        self.call("load_preferences", move |conn| {
            let mut stmt =
                conn.prepare("SELECT key, value FROM preferences WHERE user_id = ?1")?;
            let rows = stmt.query_map(params![user], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut out = HashMap::new();
            for row in rows {
                let (key, value) = row?;
                out.insert(key, serde_json::from_str(&value)?);
            }
            Ok(out)
        })
        .await
    }

    // ---- Environmental readings -------------------------------------------

    pub async fn insert_reading(&self, user: &str, reading: &Reading) -> Result<()> {
        let user = user.to_string();
        let temperature = reading.temperature_c;
        let condition = reading.condition.clone();
        let timestamp = reading.timestamp.to_rfc3339();

        self.call("insert_reading", move |conn| {
            conn.execute(
                "INSERT INTO readings (user_id, temperature_c, condition, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user, temperature, condition, timestamp],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn recent_readings(&self, user: &str, limit: usize) -> Result<Vec<Reading>> {
        let user = user.to_string();
        self.call("recent_readings", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT temperature_c, condition, timestamp FROM readings
                 WHERE user_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user, limit as i64], |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (temperature_c, condition, ts) = row?;
                out.push(Reading {
                    temperature_c,
                    condition,
                    timestamp: parse_ts(&ts)?,
                });
            }
            Ok(out)
        })
        .await
    }

    // ---- Schedule ---------------------------------------------------------

    pub async fn replace_schedule(&self, user: &str, entries: &[ScheduleEntry]) -> Result<()> {
        let user = user.to_string();
        let entries: Vec<(String, String, String, Option<String>)> = entries
            .iter()
            .map(|e| {
                (
                    e.id.clone(),
                    e.title.clone(),
                    e.starts_at.to_rfc3339(),
                    e.ends_at.map(|t| t.to_rfc3339()),
                )
            })
            .collect();

        self.call("replace_schedule", move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM schedule_entries WHERE user_id = ?1", params![user])?;
            for (id, title, starts_at, ends_at) in &entries {
                tx.execute(
                    "INSERT INTO schedule_entries (id, user_id, title, starts_at, ends_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, user, title, starts_at, ends_at],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn load_schedule(&self, user: &str) -> Result<Vec<ScheduleEntry>> {
        let user = user.to_string();
        self.call("load_schedule", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, starts_at, ends_at FROM schedule_entries
                 WHERE user_id = ?1 ORDER BY starts_at ASC",
            )?;
            let rows = stmt.query_map(params![user], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, title, starts_at, ends_at) = row?;
                out.push(ScheduleEntry {
                    id,
                    title,
                    starts_at: parse_ts(&starts_at)?,
                    ends_at: ends_at.as_deref().map(parse_ts).transpose()?,
                });
            }
            Ok(out)
        })
        .await
    }

    // ---- Devices ----------------------------------------------------------

    pub async fn upsert_device(&self, user: &str, device: &Device) -> Result<()> {
        let user = user.to_string();
        let id = device.id.clone();
        let payload = serde_json::to_string(device)?;

        self.call("upsert_device", move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO devices (id, user_id, payload) VALUES (?1, ?2, ?3)",
                params![id, user, payload],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn load_devices(&self, user: &str) -> Result<Vec<Device>> {
        let user = user.to_string();
        self.call("load_devices", move |conn| {
            let mut stmt = conn.prepare("SELECT payload FROM devices WHERE user_id = ?1")?;
            let rows = stmt.query_map(params![user], |row| row.get::<_, String>(0))?;

            let mut out = Vec::new();
            for row in rows {
                out.push(serde_json::from_str(&row?)?);
            }
            Ok(out)
        })
        .await
    }

    // ---- Automations ------------------------------------------------------

    pub async fn upsert_automation(&self, user: &str, automation: &Automation) -> Result<()> {
        let user = user.to_string();
        let id = automation.id.clone();
        let payload = serde_json::to_string(automation)?;

        self.call("upsert_automation", move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO automations (id, user_id, payload) VALUES (?1, ?2, ?3)",
                params![id, user, payload],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn load_automations(&self, user: &str) -> Result<Vec<Automation>> {
        let user = user.to_string();
        self.call("load_automations", move |conn| {
            let mut stmt = conn.prepare("SELECT payload FROM automations WHERE user_id = ?1")?;
            let rows = stmt.query_map(params![user], |row| row.get::<_, String>(0))?;

            let mut out = Vec::new();
            for row in rows {
                out.push(serde_json::from_str(&row?)?);
            }
            Ok(out)
        })
        .await
    }

    // ---- Emotional state --------------------------------------------------

    /// The persisted payload carries the state and its derived theme mood as
    /// one value, so they can never disagree on disk.
    pub async fn save_emotional_state(
        &self,
        user: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let user = user.to_string();
        let payload = serde_json::to_string(payload)?;
        let now = Utc::now().to_rfc3339();

        self.call("save_emotional_state", move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO emotional_state (user_id, payload, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![user, payload, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn load_emotional_state(&self, user: &str) -> Result<Option<serde_json::Value>> {
        let user = user.to_string();
        self.call("load_emotional_state", move |conn| {
            let mut stmt =
                conn.prepare("SELECT payload FROM emotional_state WHERE user_id = ?1")?;
            let mut rows = stmt.query_map(params![user], |row| row.get::<_, String>(0))?;
            match rows.next() {
                Some(row) => Ok(Some(serde_json::from_str(&row?)?)),
                None => Ok(None),
            }
        })
        .await
    }

    // ---- Scheduler rules --------------------------------------------------

    pub async fn replace_rules(&self, user: &str, rules: &[AutomationRule]) -> Result<()> {
        let user = user.to_string();
        let rules: Vec<(String, String)> = rules
            .iter()
            .map(|r| Ok((r.id.clone(), serde_json::to_string(r)?)))
            .collect::<Result<_>>()?;

        self.call("replace_rules", move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM automation_rules WHERE user_id = ?1", params![user])?;
            for (id, payload) in &rules {
                tx.execute(
                    "INSERT INTO automation_rules (id, user_id, payload) VALUES (?1, ?2, ?3)",
                    params![id, user, payload],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn load_rules(&self, user: &str) -> Result<Vec<AutomationRule>> {
        let user = user.to_string();
        self.call("load_rules", move |conn| {
            let mut stmt =
                conn.prepare("SELECT payload FROM automation_rules WHERE user_id = ?1")?;
            let rows = stmt.query_map(params![user], |row| row.get::<_, String>(0))?;

            let mut out = Vec::new();
            for row in rows {
                out.push(serde_json::from_str(&row?)?);
            }
            Ok(out)
        })
        .await
    }

    // ---- Predictions ------------------------------------------------------

    pub async fn insert_predictions(&self, user: &str, predictions: &[Prediction]) -> Result<()> {
        let user = user.to_string();
        let rows: Vec<(String, &'static str, f64, String, String)> = predictions
            .iter()
            .map(|p| {
                Ok((
                    p.id.clone(),
                    p.kind.as_str(),
                    p.confidence,
                    serde_json::to_string(&p.data)?,
                    p.timestamp.to_rfc3339(),
                ))
            })
            .collect::<Result<_>>()?;

        self.call("insert_predictions", move |conn| {
            let tx = conn.transaction()?;
            for (id, kind, confidence, data, timestamp) in &rows {
                tx.execute(
                    "INSERT INTO predictions (id, user_id, kind, confidence, data, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![id, user, kind, confidence, data, timestamp],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn load_predictions(
        &self,
        user: &str,
        kind: Option<PredictionKind>,
    ) -> Result<Vec<Prediction>> {
        let user = user.to_string();
        self.call("load_predictions", move |conn| {
            let mut out = Vec::new();
            let mut push_row = |id: String,
                                kind_text: String,
                                confidence: f64,
                                data: String,
                                ts: String|
             -> Result<()> {
                let Some(kind) = PredictionKind::parse(&kind_text) else {
                    warn!("Skipping prediction with unknown kind: {kind_text}");
                    return Ok(());
                };
                out.push(Prediction {
                    id,
                    kind,
                    confidence,
                    data: serde_json::from_str(&data)?,
                    timestamp: parse_ts(&ts)?,
                });
                Ok(())
            };

            match kind {
                Some(kind) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, kind, confidence, data, timestamp FROM predictions
                         WHERE user_id = ?1 AND kind = ?2 ORDER BY timestamp DESC",
                    )?;
                    let rows = stmt.query_map(params![user, kind.as_str()], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })?;
                    for row in rows {
                        let (id, kind_text, confidence, data, ts) = row?;
                        push_row(id, kind_text, confidence, data, ts)?;
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, kind, confidence, data, timestamp FROM predictions
                         WHERE user_id = ?1 ORDER BY timestamp DESC",
                    )?;
                    let rows = stmt.query_map(params![user], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })?;
                    for row in rows {
                        let (id, kind_text, confidence, data, ts) = row?;
                        push_row(id, kind_text, confidence, data, ts)?;
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    /// Retention is an explicit housekeeping operation, never implicit.
    pub async fn delete_predictions_before(
        &self,
        user: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let user = user.to_string();
        let cutoff = cutoff.to_rfc3339();
        self.call("delete_predictions_before", move |conn| {
            let deleted = conn.execute(
                "DELETE FROM predictions WHERE user_id = ?1 AND timestamp < ?2",
                params![user, cutoff],
            )?;
            Ok(deleted)
        })
        .await
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::Persistence(format!("bad timestamp {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceKind, DeviceStatus, RuleAction, Trigger};
    use serde_json::json;
    use tempfile::tempdir;

    async fn open_store(dir: &tempfile::TempDir) -> Store {
        let path = dir.path().join("test.db");
        Store::open(StoreLocation::Custom(path), 5_000).await.unwrap()
    }

    #[tokio::test]
    async fn test_interaction_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let interaction = Interaction::new(
            InteractionKind::CommandExecution,
            json!({ "command": "turn_on_lights" }),
        );
        store.insert_interaction("u1", &interaction).await.unwrap();

        let loaded = store.recent_interactions("u1", 10).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].kind, InteractionKind::CommandExecution);
        assert_eq!(loaded[0].content["command"], "turn_on_lights");

        // Interactions are per user.
        assert!(store.recent_interactions("u2", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preference_upsert_is_last_writer_wins() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        store.upsert_preference("u1", "theme", &json!("dark")).await.unwrap();
        store.upsert_preference("u1", "theme", &json!("light")).await.unwrap();

        let prefs = store.load_preferences("u1").await.unwrap();
        assert_eq!(prefs.get("theme"), Some(&json!("light")));
    }

    #[tokio::test]
    async fn test_device_and_automation_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let device = Device {
            id: "thermostat-1".to_string(),
            name: "Thermostat".to_string(),
            kind: DeviceKind::Thermostat,
            status: DeviceStatus::Online,
            state: HashMap::from([("temperature".to_string(), json!(20))]),
            location: "living room".to_string(),
        };
        store.upsert_device("u1", &device).await.unwrap();

        let devices = store.load_devices("u1").await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "thermostat-1");
        assert_eq!(devices[0].state["temperature"], json!(20));

        let automation = Automation {
            id: "a1".to_string(),
            name: "cool down".to_string(),
            trigger: Trigger::Device {
                device_id: "thermostat-1".to_string(),
                metric: "temperature".to_string(),
                op: crate::types::CompareOp::Gt,
                threshold: 25.0,
            },
            actions: vec![],
            enabled: true,
        };
        store.upsert_automation("u1", &automation).await.unwrap();
        let automations = store.load_automations("u1").await.unwrap();
        assert_eq!(automations.len(), 1);
        assert_eq!(automations[0].trigger, automation.trigger);
    }

    #[tokio::test]
    async fn test_rules_replace_and_load() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let rules = vec![AutomationRule {
            id: "morning-summary".to_string(),
            name: "Morning Summary".to_string(),
            trigger: Trigger::Time { hour: 8, minute: 0 },
            action: RuleAction::MorningSummary,
            enabled: true,
        }];
        store.replace_rules("u1", &rules).await.unwrap();

        let loaded = store.load_rules("u1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "morning-summary");
    }

    #[tokio::test]
    async fn test_prediction_persistence_and_pruning() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let predictions = vec![
            Prediction::new(PredictionKind::Behavior, 0.9, json!({ "next": "lights" })),
            Prediction::new(PredictionKind::Preference, 0.6, json!({ "temperature": 22 })),
        ];
        store.insert_predictions("u1", &predictions).await.unwrap();

        let behavior = store
            .load_predictions("u1", Some(PredictionKind::Behavior))
            .await
            .unwrap();
        assert_eq!(behavior.len(), 1);
        assert_eq!(behavior[0].kind, PredictionKind::Behavior);

        let all = store.load_predictions("u1", None).await.unwrap();
        assert_eq!(all.len(), 2);

        let deleted = store
            .delete_predictions_before("u1", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
    }
}
