//! Pattern analysis over a context snapshot.
//!
//! Every analysis is a pure function of the snapshot it is given: no hidden
//! state, no storage access. Missing data yields empty pattern sets.

use crate::config::CoreConfig;
use crate::types::{ContextSnapshot, InteractionKind};
use chrono::Timelike;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

/// One confidence-scored observation about the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub label: String,
    /// Always within [0, 1].
    pub confidence: f64,
    pub data: serde_json::Value,
}

impl Observation {
    fn new(label: impl Into<String>, confidence: f64, data: serde_json::Value) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            data,
        }
    }
}

/// The full analysis output, replaced wholesale each cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternSet {
    pub time: Vec<Observation>,
    pub interaction: Vec<Observation>,
    pub preference: Vec<Observation>,
}

impl PatternSet {
    pub fn is_empty(&self) -> bool {
        self.time.is_empty() && self.interaction.is_empty() && self.preference.is_empty()
    }
}

/// Run all analyses over the snapshot.
pub fn analyze(snapshot: &ContextSnapshot, config: &CoreConfig) -> PatternSet {
    PatternSet {
        time: analyze_time_patterns(snapshot, config),
        interaction: analyze_interaction_patterns(snapshot, config),
        preference: analyze_preference_patterns(snapshot, config),
    }
}

/// Cap confidences derived from thin evidence. With fewer samples than
/// `min_samples` the score never exceeds the sparse cap.
fn cap_sparse(confidence: f64, samples: usize, config: &CoreConfig) -> f64 {
    if samples < config.min_samples {
        confidence.min(config.sparse_confidence_cap)
    } else {
        confidence
    }
}

/// Hour-bucket histogram over interaction timestamps: active window, routine
/// markers for the busiest hours, and low-activity break windows inside the
/// active range.
pub fn analyze_time_patterns(snapshot: &ContextSnapshot, config: &CoreConfig) -> Vec<Observation> {
    let total = snapshot.interactions.len();
    if total == 0 {
        return Vec::new();
    }

    let mut histogram = [0usize; 24];
    for interaction in &snapshot.interactions {
        histogram[interaction.timestamp.hour() as usize] += 1;
    }

    let first_active = histogram.iter().position(|&c| c > 0).unwrap_or(0);
    let last_active = histogram.iter().rposition(|&c| c > 0).unwrap_or(0);
    let span = last_active - first_active + 1;
    let busy_hours = histogram.iter().filter(|&&c| c > 0).count();

    let mut out = Vec::new();
    out.push(Observation::new(
        "active_hours",
        cap_sparse(busy_hours as f64 / span as f64, total, config),
        json!({ "start_hour": first_active, "end_hour": last_active }),
    ));

    // Routine markers: the three busiest hours.
    let mut ranked: Vec<(usize, usize)> = histogram
        .iter()
        .enumerate()
        .filter(|(_, &c)| c > 0)
        .map(|(h, &c)| (h, c))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    for (hour, count) in ranked.into_iter().take(3) {
        out.push(Observation::new(
            format!("routine_hour_{hour:02}"),
            cap_sparse(count as f64 / total as f64, total, config),
            json!({ "hour": hour, "count": count }),
        ));
    }

    // Break windows: contiguous idle gaps inside the active window.
    let mut gap_start: Option<usize> = None;
    for hour in first_active..=last_active {
        if histogram[hour] == 0 {
            gap_start.get_or_insert(hour);
        } else if let Some(start) = gap_start.take() {
            let len = hour - start;
            out.push(Observation::new(
                format!("break_window_{start:02}"),
                cap_sparse(len as f64 / span as f64, total, config),
                json!({ "start_hour": start, "end_hour": hour - 1 }),
            ));
        }
    }

    out
}

/// Frequency-ranked commands and features, ties broken by recency.
pub fn analyze_interaction_patterns(
    snapshot: &ContextSnapshot,
    config: &CoreConfig,
) -> Vec<Observation> {
    let total = snapshot.interactions.len();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    // Interactions are most-recent-first, so the first occurrence of a name
    // is also its most recent use.
    let mut recency: HashMap<&str, usize> = HashMap::new();

    for (position, interaction) in snapshot.interactions.iter().enumerate() {
        let name = match interaction.kind {
            InteractionKind::CommandExecution | InteractionKind::VoiceCommand => {
                interaction.content.get("command").and_then(|v| v.as_str())
            }
            InteractionKind::FeatureUsage => {
                interaction.content.get("feature").and_then(|v| v.as_str())
            }
            _ => None,
        };
        if let Some(name) = name {
            *counts.entry(name).or_default() += 1;
            recency.entry(name).or_insert(position);
        }
    }

    if counts.is_empty() {
        return Vec::new();
    }

    let used: usize = counts.values().sum();
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(recency[a.0].cmp(&recency[b.0])));

    ranked
        .into_iter()
        .take(5)
        .map(|(name, count)| {
            Observation::new(
                format!("frequent_use:{name}"),
                cap_sparse(count as f64 / used as f64, total, config),
                json!({ "name": name, "count": count }),
            )
        })
        .collect()
}

/// Aggregate stored preferences and environmental readings: numeric means for
/// temperature-like signals, latest value for everything else.
pub fn analyze_preference_patterns(
    snapshot: &ContextSnapshot,
    config: &CoreConfig,
) -> Vec<Observation> {
    let mut out = Vec::new();

    for (key, value) in &snapshot.preferences {
        let confidence = cap_sparse(0.8, snapshot.interactions.len(), config);
        out.push(Observation::new(
            format!("preference:{key}"),
            confidence,
            json!({ "key": key, "value": value }),
        ));
    }
    out.sort_by(|a, b| a.label.cmp(&b.label));

    if !snapshot.readings.is_empty() {
        let n = snapshot.readings.len();
        let mean = snapshot
            .readings
            .iter()
            .map(|r| r.temperature_c)
            .sum::<f64>()
            / n as f64;
        out.push(Observation::new(
            "comfort_temperature",
            cap_sparse(n as f64 / config.reading_capacity as f64, n, config),
            json!({ "mean_temperature_c": mean, "samples": n }),
        ));
    }

    out
}
