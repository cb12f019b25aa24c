//! Personality adapter: styles outgoing messages by trait configuration and
//! the user's current emotional state. Never touches device or automation
//! state.

use crate::error::{CoreError, Result};
use crate::storage::Store;
use crate::types::{EmotionalState, Mood, Styled, Tone};
use chrono::Weekday;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Personality trait levels, 0-100 each.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaTraits {
    pub humor: u8,
    pub formality: u8,
    pub sarcasm: u8,
    pub empathy: u8,
}

impl Default for PersonaTraits {
    fn default() -> Self {
        Self {
            humor: 70,
            formality: 40,
            sarcasm: 60,
            empathy: 80,
        }
    }
}

impl PersonaTraits {
    fn clamped(self) -> Self {
        Self {
            humor: self.humor.min(100),
            formality: self.formality.min(100),
            sarcasm: self.sarcasm.min(100),
            empathy: self.empathy.min(100),
        }
    }
}

const TRAITS_KEY: &str = "persona_traits";

pub struct Persona {
    store: Arc<Store>,
    user: RwLock<Option<String>>,
    traits: RwLock<PersonaTraits>,
    /// Seedable so tone rolls are deterministic under test.
    rng: std::sync::Mutex<StdRng>,
}

impl Persona {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_seed(store, rand::thread_rng().gen())
    }

    pub fn with_seed(store: Arc<Store>, seed: u64) -> Self {
        Self {
            store,
            user: RwLock::new(None),
            traits: RwLock::new(PersonaTraits::default()),
            rng: std::sync::Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Bind to a user and restore persisted traits, if any.
    pub async fn initialize(&self, user_id: &str) -> Result<()> {
        {
            let mut user = self.user.write().await;
            *user = Some(user_id.to_string());
        }

        let preferences = self.store.load_preferences(user_id).await?;
        if let Some(value) = preferences.get(TRAITS_KEY) {
            let restored: PersonaTraits = serde_json::from_value(value.clone())?;
            *self.traits.write().await = restored.clamped();
            info!("Restored persona traits for {user_id}");
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

    pub async fn traits(&self) -> PersonaTraits {
        *self.traits.read().await
    }

    /// Replace the trait configuration; persists before the in-memory commit.
    pub async fn set_traits(&self, traits: PersonaTraits) -> Result<()> {
        let user = self.user().await?;
        let traits = traits.clamped();
        self.store
            .upsert_preference(&user, TRAITS_KEY, &serde_json::to_value(traits)?)
            .await?;
        *self.traits.write().await = traits;
        Ok(())
    }

    /// Style a message for delivery: greeting by time of day, tone from the
    /// trait thresholds and the user's state, emoji to match.
    pub async fn compose(
        &self,
        message: &str,
        state: &EmotionalState,
        hour: u32,
        weekday: Weekday,
    ) -> Styled {
        let traits = self.traits().await;
        let flip = self
            .rng
            .lock()
            .map(|mut rng| rng.gen_bool(0.5))
            .unwrap_or(false);

        let mut tone = if traits.formality > 70 {
            Tone::Formal
        } else if traits.sarcasm > 70 && flip {
            Tone::Sarcastic
        } else if traits.empathy > 70 && state.stress > 50 {
            Tone::Empathetic
        } else {
            Tone::Casual
        };

        // Strong signals sharpen the tone.
        if tone == Tone::Empathetic && state.stress > 80 {
            tone = Tone::Concerned;
        } else if tone == Tone::Casual && state.mood == Mood::Happy && traits.humor > 60 {
            tone = Tone::Excited;
        }

        let greeting = match hour {
            5..=11 => "Good morning",
            12..=17 => "Good afternoon",
            _ => "Good evening",
        };
        let message = match tone {
            Tone::Formal => format!("{greeting}. {message}"),
            _ => format!("{greeting}! {message}"),
        };

        let weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
        let emoji = match tone {
            Tone::Formal => None,
            _ if weekend => Some("🎉".to_string()),
            Tone::Casual => Some("😊".to_string()),
            Tone::Sarcastic => Some("😏".to_string()),
            Tone::Empathetic => Some("💙".to_string()),
            Tone::Concerned => Some("😟".to_string()),
            Tone::Excited => Some("🎉".to_string()),
        };

        Styled {
            message,
            tone,
            emoji,
        }
    }

    /// The user-facing shape of an internal failure. Always apologetic and
    /// generic; internal details go to the log, not the user.
    pub async fn apologize(&self) -> Styled {
        let traits = self.traits().await;
        let tone = if traits.empathy > 70 {
            Tone::Empathetic
        } else {
            Tone::Casual
        };
        Styled {
            message: "Sorry, something went wrong on my end. Give me a moment and try again."
                .to_string(),
            tone,
            emoji: None,
        }
    }
}
