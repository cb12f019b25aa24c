//! Emotional state tracking and lightweight text mood analysis.
//!
//! One current state per user. Updates persist the state together with its
//! derived theme mood before the in-memory commit.

use crate::error::{CoreError, Result};
use crate::storage::Store;
use crate::types::{EmotionalState, Mood, ThemeMood};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Partial update applied to the current state. `None` keeps the field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateUpdate {
    pub mood: Option<Mood>,
    pub energy: Option<u8>,
    pub stress: Option<u8>,
    pub context: Option<String>,
}

/// Result of analyzing a piece of user text.
#[derive(Debug, Clone)]
pub struct MoodAnalysis {
    pub detected: Option<Mood>,
    pub response: String,
    pub suggestions: Vec<String>,
}

pub struct EmotionalTracker {
    store: Arc<Store>,
    user: RwLock<Option<String>>,
    state: RwLock<EmotionalState>,
}

impl EmotionalTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            user: RwLock::new(None),
            state: RwLock::new(EmotionalState::default()),
        }
    }

    /// Bind to a user and restore the persisted state, if any.
    pub async fn initialize(&self, user_id: &str) -> Result<()> {
        {
            let mut user = self.user.write().await;
            *user = Some(user_id.to_string());
        }

        if let Some(payload) = self.store.load_emotional_state(user_id).await? {
            if let Some(state) = payload.get("state") {
                let restored: EmotionalState = serde_json::from_value(state.clone())?;
                *self.state.write().await = restored;
                info!("Restored emotional state for {user_id}");
            }
        }
        Ok(())
    }

    async fn user(&self) -> Result<String> {
        self.user
            .read()
            .await
            .clone()
            .ok_or(CoreError::NotInitialized)
    }

    pub async fn current_state(&self) -> Result<EmotionalState> {
        let _ = self.user().await?;
        Ok(self.state.read().await.clone())
    }

    pub async fn theme_mood(&self) -> Result<ThemeMood> {
        Ok(self.current_state().await?.theme_mood())
    }

    /// Merge a partial update into the current state, persist it with the
    /// derived theme mood, then commit in memory. Returns the new state.
    pub async fn update_state(&self, update: StateUpdate) -> Result<EmotionalState> {
        let user = self.user().await?;

        let mut next = self.state.read().await.clone();
        if let Some(mood) = update.mood {
            next.mood = mood;
        }
        if let Some(energy) = update.energy {
            next.energy = energy.min(100);
        }
        if let Some(stress) = update.stress {
            next.stress = stress.min(100);
        }
        if update.context.is_some() {
            next.context = update.context;
        }
        next.timestamp = Some(Utc::now());

        let payload = json!({
            "state": next,
            "theme_mood": next.theme_mood(),
        });
        self.store.save_emotional_state(&user, &payload).await?;

        *self.state.write().await = next.clone();
        debug!(
            "Emotional state updated: mood={:?} energy={} stress={}",
            next.mood, next.energy, next.stress
        );
        Ok(next)
    }

    /// Keyword-level mood detection over user text. A detected mood updates
    /// the state; the returned response and suggestions fit the mood.
    pub async fn analyze_text(&self, text: &str) -> Result<MoodAnalysis> {
        let _ = self.user().await?;
        let lowered = text.to_lowercase();

        let detected = detect_mood(&lowered);
        let (response, suggestions) = match detected {
            Some(Mood::Tired) => (
                "You sound tired. Maybe it's time to wind down a little.",
                vec![
                    "Take a short break".to_string(),
                    "Dim the lights".to_string(),
                ],
            ),
            Some(Mood::Happy) => (
                "Love the energy! Anything you'd like to get done while it lasts?",
                vec!["Queue up your favorite playlist".to_string()],
            ),
            Some(Mood::Angry) => (
                "That sounds frustrating. Want me to put on something calming?",
                vec![
                    "Play calming music".to_string(),
                    "Step away for five minutes".to_string(),
                ],
            ),
            Some(Mood::Sad) => (
                "I'm sorry to hear that. I'm here if you need anything.",
                vec!["Warm up the lighting".to_string()],
            ),
            Some(Mood::Focused) => (
                "Sounds like you're in the zone. I'll keep interruptions down.",
                vec!["Enable do-not-disturb".to_string()],
            ),
            Some(Mood::Calm) | None => ("Noted. I'm keeping an eye on things.", Vec::new()),
        };

        if let Some(mood) = detected {
            let update = match mood {
                Mood::Tired => StateUpdate {
                    mood: Some(mood),
                    energy: Some(25),
                    ..Default::default()
                },
                Mood::Happy => StateUpdate {
                    mood: Some(mood),
                    stress: Some(20),
                    ..Default::default()
                },
                Mood::Angry => StateUpdate {
                    mood: Some(mood),
                    stress: Some(75),
                    ..Default::default()
                },
                _ => StateUpdate {
                    mood: Some(mood),
                    ..Default::default()
                },
            };
            self.update_state(update).await?;
        }

        Ok(MoodAnalysis {
            detected,
            response: response.to_string(),
            suggestions,
        })
    }
}

fn detect_mood(lowered: &str) -> Option<Mood> {
    const KEYWORDS: [(&[&str], Mood); 6] = [
        (&["tired", "exhausted", "sleepy"], Mood::Tired),
        (&["happy", "great", "awesome", "excited"], Mood::Happy),
        (&["angry", "frustrated", "annoyed"], Mood::Angry),
        (&["sad", "down", "upset"], Mood::Sad),
        (&["focused", "productive", "in the zone"], Mood::Focused),
        (&["calm", "relaxed"], Mood::Calm),
    ];

    for (words, mood) in KEYWORDS {
        if words.iter().any(|w| lowered.contains(w)) {
            return Some(mood);
        }
    }
    None
}
