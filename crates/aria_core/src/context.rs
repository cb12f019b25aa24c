//! Rolling context of user behavior, environment, and schedule signals.
//!
//! The context store owns the in-memory snapshot exclusively. Writes are
//! persisted before they are visible in memory, so a restart never reveals
//! state that was only ever in RAM.

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::providers::{fetch_with_deadline, Providers};
use crate::storage::Store;
use crate::types::{ContextSnapshot, Interaction, InteractionKind, Reading};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub struct ContextStore {
    store: Arc<Store>,
    providers: Providers,
    config: CoreConfig,
    user: RwLock<Option<String>>,
    snapshot: RwLock<ContextSnapshot>,
    /// Serializes read-modify-write preference updates for the bound user.
    pref_lock: Mutex<()>,
}

impl ContextStore {
    pub fn new(store: Arc<Store>, providers: Providers, config: CoreConfig) -> Self {
        Self {
            store,
            providers,
            config,
            user: RwLock::new(None),
            snapshot: RwLock::new(ContextSnapshot::default()),
            pref_lock: Mutex::new(()),
        }
    }

    /// Bind the store to a user and load their context from storage.
    pub async fn bind_user(&self, user_id: &str) -> Result<()> {
        {
            let mut user = self.user.write().await;
            *user = Some(user_id.to_string());
        }
        info!("Context bound to user: {user_id}");
        self.load_context().await
    }

    pub async fn user(&self) -> Result<String> {
        self.user
            .read()
            .await
            .clone()
            .ok_or(CoreError::NotInitialized)
    }

    /// Record a user interaction: persist first, then append to the window.
    pub async fn record_interaction(
        &self,
        kind: InteractionKind,
        content: serde_json::Value,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let user = self.user().await?;
        let interaction = Interaction::new(kind, content).with_metadata(metadata);

        self.store.insert_interaction(&user, &interaction).await?;

        let mut snapshot = self.snapshot.write().await;
        snapshot.push_interaction(interaction, self.config.interaction_capacity);
        debug!("Recorded {} interaction for {user}", kind.as_str());
        Ok(())
    }

    /// Record an environmental reading: persist first, then append.
    pub async fn record_reading(&self, reading: Reading) -> Result<()> {
        let user = self.user().await?;
        self.store.insert_reading(&user, &reading).await?;

        let mut snapshot = self.snapshot.write().await;
        snapshot.push_reading(reading, self.config.reading_capacity);
        Ok(())
    }

    /// Refresh every context section. Sections refresh independently: a failed
    /// fetch logs a warning and the previous in-memory values stay.
    pub async fn load_context(&self) -> Result<()> {
        let user = self.user().await?;

        // Provider pulls land in storage first so the section fetches below
        // pick them up along with everything already persisted.
        if let Some(weather) = &self.providers.weather {
            if let Some(reading) = fetch_with_deadline(
                "weather.current",
                self.config.provider_timeout_ms,
                weather.current(),
            )
            .await
            {
                if let Err(e) = self.store.insert_reading(&user, &reading).await {
                    warn!("Failed to persist weather reading: {e}");
                }
            }
        }
        if let Some(calendar) = &self.providers.calendar {
            if let Some(entries) = fetch_with_deadline(
                "calendar.upcoming",
                self.config.provider_timeout_ms,
                calendar.upcoming(),
            )
            .await
            {
                if let Err(e) = self.store.replace_schedule(&user, &entries).await {
                    warn!("Failed to persist schedule entries: {e}");
                }
            }
        }

        // Now-playing is ephemeral; it lives in the snapshot only. A failed
        // fetch keeps the previous value, a successful empty fetch clears it.
        let mut now_playing = None;
        if let Some(music) = &self.providers.music {
            now_playing = fetch_with_deadline(
                "music.now_playing",
                self.config.provider_timeout_ms,
                music.now_playing(),
            )
            .await;
        }

        let preferences = self.store.load_preferences(&user).await;
        let interactions = self
            .store
            .recent_interactions(&user, self.config.interaction_capacity)
            .await;
        let readings = self
            .store
            .recent_readings(&user, self.config.reading_capacity)
            .await;
        let schedule = self.store.load_schedule(&user).await;

        let mut snapshot = self.snapshot.write().await;
        match preferences {
            Ok(preferences) => snapshot.preferences = preferences,
            Err(e) => warn!("Keeping previous preferences, refresh failed: {e}"),
        }
        match interactions {
            Ok(interactions) => snapshot.interactions = interactions.into(),
            Err(e) => warn!("Keeping previous interactions, refresh failed: {e}"),
        }
        match readings {
            Ok(readings) => snapshot.readings = readings.into(),
            Err(e) => warn!("Keeping previous readings, refresh failed: {e}"),
        }
        match schedule {
            Ok(schedule) => snapshot.schedule = schedule,
            Err(e) => warn!("Keeping previous schedule, refresh failed: {e}"),
        }
        if let Some(track) = now_playing {
            snapshot.now_playing = track;
        }

        debug!(
            "Context refreshed for {user}: {} interactions, {} readings, {} schedule entries",
            snapshot.interactions.len(),
            snapshot.readings.len(),
            snapshot.schedule.len()
        );
        Ok(())
    }

    /// Update a single preference, last writer wins. Concurrent updates for
    /// the bound user are serialized; the durable write precedes the
    /// in-memory commit.
    pub async fn update_preference(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let user = self.user().await?;
        let _guard = self.pref_lock.lock().await;

        self.store.upsert_preference(&user, key, &value).await?;

        let mut snapshot = self.snapshot.write().await;
        snapshot.preferences.insert(key.to_string(), value);
        Ok(())
    }

    pub async fn preference(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let _ = self.user().await?;
        Ok(self.snapshot.read().await.preferences.get(key).cloned())
    }

    /// Clone of the current snapshot for analysis.
    pub async fn snapshot(&self) -> Result<ContextSnapshot> {
        let _ = self.user().await?;
        Ok(self.snapshot.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreLocation;
    use serde_json::json;
    use tempfile::tempdir;

    async fn bound_store(dir: &tempfile::TempDir) -> ContextStore {
        let store = Store::open(
            StoreLocation::Custom(dir.path().join("ctx.db")),
            5_000,
        )
        .await
        .unwrap();
        let ctx = ContextStore::new(Arc::new(store), Providers::default(), CoreConfig::default());
        ctx.bind_user("u1").await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_operations_before_binding_fail() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            StoreLocation::Custom(dir.path().join("ctx.db")),
            5_000,
        )
        .await
        .unwrap();
        let ctx = ContextStore::new(Arc::new(store), Providers::default(), CoreConfig::default());

        let err = ctx
            .record_interaction(InteractionKind::ChatMessage, json!("hi"), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotInitialized));
    }

    #[tokio::test]
    async fn test_preference_round_trip_through_reload() {
        let dir = tempdir().unwrap();
        let ctx = bound_store(&dir).await;

        ctx.update_preference("temperature", json!(22)).await.unwrap();
        ctx.load_context().await.unwrap();

        assert_eq!(ctx.preference("temperature").await.unwrap(), Some(json!(22)));
    }

    #[tokio::test]
    async fn test_interaction_window_is_bounded() {
        let dir = tempdir().unwrap();
        let ctx = bound_store(&dir).await;

        for i in 0..60 {
            ctx.record_interaction(
                InteractionKind::CommandExecution,
                json!({ "seq": i }),
                HashMap::new(),
            )
            .await
            .unwrap();
        }

        let snapshot = ctx.snapshot().await.unwrap();
        assert_eq!(snapshot.interactions.len(), 50);
        assert_eq!(snapshot.interactions.front().unwrap().content["seq"], 59);
    }

    #[tokio::test]
    async fn test_music_provider_fills_now_playing() {
        use crate::providers::MusicProvider;
        use crate::types::Track;

        // Reports a track on the first poll, silence afterwards.
        struct FadingTrack {
            played: std::sync::atomic::AtomicBool,
        }

        #[async_trait::async_trait]
        impl MusicProvider for FadingTrack {
            async fn now_playing(&self) -> anyhow::Result<Option<Track>> {
                if self.played.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    Ok(None)
                } else {
                    Ok(Some(Track {
                        title: "Weightless".to_string(),
                        artist: "Marconi Union".to_string(),
                    }))
                }
            }
        }

        let dir = tempdir().unwrap();
        let store = Arc::new(
            Store::open(
                StoreLocation::Custom(dir.path().join("ctx.db")),
                5_000,
            )
            .await
            .unwrap(),
        );

        let providers = Providers {
            music: Some(Arc::new(FadingTrack {
                played: std::sync::atomic::AtomicBool::new(false),
            })),
            ..Providers::default()
        };
        let ctx = ContextStore::new(store, providers, CoreConfig::default());
        ctx.bind_user("u1").await.unwrap();
        let track = ctx.snapshot().await.unwrap().now_playing.unwrap();
        assert_eq!(track.title, "Weightless");

        // Playback stopped: the next refresh clears it.
        ctx.load_context().await.unwrap();
        assert_eq!(ctx.snapshot().await.unwrap().now_playing, None);
    }

    #[tokio::test]
    async fn test_reload_survives_restartlike_rebind() {
        let dir = tempdir().unwrap();
        {
            let ctx = bound_store(&dir).await;
            ctx.record_interaction(InteractionKind::ChatMessage, json!("hello"), HashMap::new())
                .await
                .unwrap();
            ctx.update_preference("theme", json!("dark")).await.unwrap();
        }

        // New store over the same database sees the persisted context.
        let ctx = bound_store(&dir).await;
        let snapshot = ctx.snapshot().await.unwrap();
        assert_eq!(snapshot.interactions.len(), 1);
        assert_eq!(snapshot.preferences.get("theme"), Some(&json!("dark")));
    }
}
