//! Core data model: interactions, context snapshots, predictions, devices,
//! automations, rules, and emotional state.
//!
//! Trigger and action kinds are closed sum types so rule dispatch is
//! exhaustive at compile time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Kind of a recorded user interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    ChatMessage,
    CommandExecution,
    VoiceCommand,
    PreferenceUpdate,
    FeatureUsage,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::ChatMessage => "chat_message",
            InteractionKind::CommandExecution => "command_execution",
            InteractionKind::VoiceCommand => "voice_command",
            InteractionKind::PreferenceUpdate => "preference_update",
            InteractionKind::FeatureUsage => "feature_usage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat_message" => Some(InteractionKind::ChatMessage),
            "command_execution" => Some(InteractionKind::CommandExecution),
            "voice_command" => Some(InteractionKind::VoiceCommand),
            "preference_update" => Some(InteractionKind::PreferenceUpdate),
            "feature_usage" => Some(InteractionKind::FeatureUsage),
            _ => None,
        }
    }
}

/// A single user interaction. Immutable once recorded; append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub kind: InteractionKind,
    /// Opaque payload; shape depends on the interaction kind.
    pub content: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Interaction {
    pub fn new(kind: InteractionKind, content: serde_json::Value) -> Self {
        Self {
            kind,
            content,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An environmental reading (temperature + condition label).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub temperature_c: f64,
    pub condition: String,
    pub timestamp: DateTime<Utc>,
}

/// A calendar/schedule entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

/// The track currently playing, as reported by a music provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub title: String,
    pub artist: String,
}

/// The rolling window of signals used for analysis. Owned exclusively by the
/// context store; interaction and reading lists are bounded, most-recent-first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub preferences: HashMap<String, serde_json::Value>,
    pub interactions: VecDeque<Interaction>,
    pub readings: VecDeque<Reading>,
    pub schedule: Vec<ScheduleEntry>,
    /// What the user is listening to right now, if a music provider is wired.
    pub now_playing: Option<Track>,
}

impl ContextSnapshot {
    /// Push an interaction at the front, evicting the oldest past `capacity`.
    pub fn push_interaction(&mut self, interaction: Interaction, capacity: usize) {
        self.interactions.push_front(interaction);
        self.interactions.truncate(capacity);
    }

    /// Push a reading at the front, evicting the oldest past `capacity`.
    pub fn push_reading(&mut self, reading: Reading, capacity: usize) {
        self.readings.push_front(reading);
        self.readings.truncate(capacity);
    }
}

/// Kind of a generated prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionKind {
    Behavior,
    Preference,
    Schedule,
    Environment,
}

impl PredictionKind {
    pub const ALL: [PredictionKind; 4] = [
        PredictionKind::Behavior,
        PredictionKind::Preference,
        PredictionKind::Schedule,
        PredictionKind::Environment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionKind::Behavior => "behavior",
            PredictionKind::Preference => "preference",
            PredictionKind::Schedule => "schedule",
            PredictionKind::Environment => "environment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "behavior" => Some(PredictionKind::Behavior),
            "preference" => Some(PredictionKind::Preference),
            "schedule" => Some(PredictionKind::Schedule),
            "environment" => Some(PredictionKind::Environment),
            _ => None,
        }
    }
}

/// A typed prediction with confidence. Never mutated after creation;
/// superseded predictions are new records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub kind: PredictionKind,
    /// Always within [0, 1]; clamped at construction.
    pub confidence: f64,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Prediction {
    pub fn new(kind: PredictionKind, confidence: f64, data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            confidence: confidence.clamp(0.0, 1.0),
            data,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Light,
    Switch,
    Sensor,
    Camera,
    Thermostat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// A registered device. State is mutated only through the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub status: DeviceStatus,
    pub state: HashMap<String, serde_json::Value>,
    pub location: String,
}

/// Numeric comparison used by device and condition triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Lt,
    Eq,
}

impl CompareOp {
    pub fn matches(&self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Gt => value > threshold,
            CompareOp::Lt => value < threshold,
            CompareOp::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

/// Metric a condition trigger compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Stress,
    Energy,
}

/// Trigger variants for automations and rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires when the wall clock matches hour/minute exactly.
    Time { hour: u32, minute: u32 },
    /// Fires when a device state commit satisfies the predicate.
    Device {
        device_id: String,
        metric: String,
        op: CompareOp,
        threshold: f64,
    },
    /// Fires on the transition of a live metric into trigger range.
    Condition {
        metric: MetricKind,
        op: CompareOp,
        threshold: f64,
    },
}

/// One device-directed action of an automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAction {
    pub device_id: String,
    pub action: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

/// A user- or prediction-created automation against registered devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub actions: Vec<DeviceAction>,
    pub enabled: bool,
}

/// Built-in action kinds for scheduler rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    MorningSummary,
    EveningCheck,
    SuggestBreak,
}

/// A built-in scheduler rule: single trigger, single action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub action: RuleAction,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Happy,
    Sad,
    Angry,
    Tired,
    Focused,
    Calm,
}

/// Theme signal derived from the emotional state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThemeMood {
    Happy,
    Calm,
    Energetic,
    Focused,
}

/// Current emotional state of the user. Single current value per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionalState {
    pub mood: Mood,
    /// 0-100
    pub energy: u8,
    /// 0-100
    pub stress: u8,
    pub timestamp: Option<DateTime<Utc>>,
    pub context: Option<String>,
}

impl Default for EmotionalState {
    fn default() -> Self {
        Self {
            mood: Mood::Calm,
            energy: 70,
            stress: 30,
            timestamp: None,
            context: None,
        }
    }
}

impl EmotionalState {
    /// Derive the theme signal from mood, energy and stress.
    pub fn theme_mood(&self) -> ThemeMood {
        if self.mood == Mood::Happy || (self.energy > 70 && self.stress < 30) {
            ThemeMood::Happy
        } else if self.mood == Mood::Tired || self.energy < 30 {
            ThemeMood::Calm
        } else if self.mood == Mood::Focused || (self.energy > 50 && self.stress < 50) {
            ThemeMood::Focused
        } else {
            ThemeMood::Energetic
        }
    }

    pub fn metric(&self, metric: MetricKind) -> f64 {
        match metric {
            MetricKind::Stress => self.stress as f64,
            MetricKind::Energy => self.energy as f64,
        }
    }
}

/// Tone of a composed user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Casual,
    Formal,
    Sarcastic,
    Empathetic,
    Concerned,
    Excited,
}

/// A persona-composed message ready for the front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Styled {
    pub message: String,
    pub tone: Tone,
    pub emoji: Option<String>,
}
