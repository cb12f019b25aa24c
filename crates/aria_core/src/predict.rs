//! Prediction generation and the prediction cache.
//!
//! Generation is a pure function of a pattern set. The cache is additive and
//! append-only: predictions are never mutated, supersession means a newer
//! record, and retention is an explicit housekeeping call.

use crate::error::{CoreError, Result};
use crate::patterns::{Observation, PatternSet};
use crate::storage::Store;
use crate::types::{Prediction, PredictionKind};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Combined confidence of a set of observations: the arithmetic mean. More
/// confident inputs never lower the output.
fn mean_confidence(observations: &[&Observation]) -> f64 {
    if observations.is_empty() {
        return 0.0;
    }
    observations.iter().map(|o| o.confidence).sum::<f64>() / observations.len() as f64
}

/// Derive predictions of one kind from the current pattern set. Pure; no
/// access to storage or clocks beyond the prediction timestamp.
pub fn generate_predictions(kind: PredictionKind, patterns: &PatternSet) -> Vec<Prediction> {
    match kind {
        PredictionKind::Behavior => {
            let contributing: Vec<&Observation> = patterns.interaction.iter().collect();
            let Some(top) = contributing.first() else {
                return Vec::new();
            };
            let candidates: Vec<&serde_json::Value> =
                contributing.iter().map(|o| &o.data).collect();
            vec![Prediction::new(
                kind,
                mean_confidence(&contributing),
                json!({ "next_action": top.data["name"], "candidates": candidates }),
            )]
        }
        PredictionKind::Schedule => {
            let contributing: Vec<&Observation> = patterns.time.iter().collect();
            if contributing.is_empty() {
                return Vec::new();
            }
            let active = contributing.iter().find(|o| o.label == "active_hours");
            let routines: Vec<&serde_json::Value> = contributing
                .iter()
                .filter(|o| o.label.starts_with("routine_hour_"))
                .map(|o| &o.data)
                .collect();
            vec![Prediction::new(
                kind,
                mean_confidence(&contributing),
                json!({
                    "active_hours": active.map(|o| &o.data),
                    "routines": routines,
                }),
            )]
        }
        PredictionKind::Preference => {
            let contributing: Vec<&Observation> = patterns
                .preference
                .iter()
                .filter(|o| o.label.starts_with("preference:"))
                .collect();
            if contributing.is_empty() {
                return Vec::new();
            }
            let values: HashMap<&str, &serde_json::Value> = contributing
                .iter()
                .filter_map(|o| {
                    o.data
                        .get("key")
                        .and_then(|k| k.as_str())
                        .map(|k| (k, &o.data["value"]))
                })
                .collect();
            vec![Prediction::new(
                kind,
                mean_confidence(&contributing),
                json!({ "preferences": values }),
            )]
        }
        PredictionKind::Environment => {
            let contributing: Vec<&Observation> = patterns
                .preference
                .iter()
                .filter(|o| o.label == "comfort_temperature")
                .collect();
            let Some(comfort) = contributing.first() else {
                return Vec::new();
            };
            vec![Prediction::new(
                kind,
                mean_confidence(&contributing),
                json!({ "target_temperature_c": comfort.data["mean_temperature_c"] }),
            )]
        }
    }
}

/// Owns the in-memory prediction cache; the sole writer to it.
pub struct Predictor {
    store: Arc<Store>,
    user: RwLock<Option<String>>,
    cache: RwLock<HashMap<String, Prediction>>,
}

impl Predictor {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            user: RwLock::new(None),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Bind to a user and warm the cache from storage.
    pub async fn initialize(&self, user_id: &str) -> Result<()> {
        {
            let mut user = self.user.write().await;
            *user = Some(user_id.to_string());
        }

        let persisted = self.store.load_predictions(user_id, None).await?;
        let mut cache = self.cache.write().await;
        for prediction in persisted {
            cache.insert(prediction.id.clone(), prediction);
        }
        info!("Prediction cache warmed: {} entries", cache.len());
        Ok(())
    }

    async fn user(&self) -> Result<String> {
        self.user
            .read()
            .await
            .clone()
            .ok_or(CoreError::NotInitialized)
    }

    /// Persist predictions, then add them to the cache. A storage failure
    /// leaves the cache untouched.
    pub async fn save_predictions(&self, predictions: &[Prediction]) -> Result<()> {
        if predictions.is_empty() {
            return Ok(());
        }
        let user = self.user().await?;
        self.store.insert_predictions(&user, predictions).await?;

        let mut cache = self.cache.write().await;
        for prediction in predictions {
            cache.insert(prediction.id.clone(), prediction.clone());
        }
        debug!("Saved {} predictions", predictions.len());
        Ok(())
    }

    /// Read-only cache query, most recent first.
    pub async fn get_predictions(&self, kind: Option<PredictionKind>) -> Result<Vec<Prediction>> {
        let _ = self.user().await?;
        let cache = self.cache.read().await;
        let mut out: Vec<Prediction> = cache
            .values()
            .filter(|p| kind.map_or(true, |k| p.kind == k))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(out)
    }

    /// Drop predictions older than the cutoff from storage and cache.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let user = self.user().await?;
        let deleted = self.store.delete_predictions_before(&user, cutoff).await?;

        let mut cache = self.cache.write().await;
        cache.retain(|_, p| p.timestamp >= cutoff);
        Ok(deleted)
    }
}
