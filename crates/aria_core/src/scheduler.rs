//! Rule evaluation loops.
//!
//! Time rules are checked every `tick_secs` and fire on an exact hour/minute
//! match, at most once per wall-clock minute. Condition rules are checked
//! every `condition_tick_secs` and are edge-triggered: they fire on the
//! transition into range, not while the condition stays true.

use crate::config::CoreConfig;
use crate::context::ContextStore;
use crate::emotional::EmotionalTracker;
use crate::error::Result;
use crate::persona::Persona;
use crate::registry::Registry;
use crate::types::{AutomationRule, InteractionKind, RuleAction, Styled, Trigger};
use chrono::{DateTime, Datelike, Local, Timelike};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Scheduler {
    registry: Arc<Registry>,
    context: Arc<ContextStore>,
    emotional: Arc<EmotionalTracker>,
    persona: Arc<Persona>,
    config: CoreConfig,
    outbox: mpsc::UnboundedSender<Styled>,
    /// Per-rule stamp of the last minute a time rule fired in.
    last_fired: Mutex<HashMap<String, String>>,
    /// Per-rule previous pass/fail for condition rules.
    condition_state: Mutex<HashMap<String, bool>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        context: Arc<ContextStore>,
        emotional: Arc<EmotionalTracker>,
        persona: Arc<Persona>,
        config: CoreConfig,
        outbox: mpsc::UnboundedSender<Styled>,
    ) -> Self {
        Self {
            registry,
            context,
            emotional,
            persona,
            config,
            outbox,
            last_fired: Mutex::new(HashMap::new()),
            condition_state: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the two evaluation loops. They stop when `shutdown` flips true.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let scheduler = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut tick =
                    tokio::time::interval(std::time::Duration::from_secs(scheduler.config.tick_secs));
                info!("Time rule loop started ({}s tick)", scheduler.config.tick_secs);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = scheduler.run_time_pass(Local::now()).await {
                                warn!("Time rule pass failed: {e}");
                            }
                        }
                        _ = shutdown.changed() => {
                            info!("Time rule loop stopping");
                            break;
                        }
                    }
                }
            }));
        }

        {
            let scheduler = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(std::time::Duration::from_secs(
                    scheduler.config.condition_tick_secs,
                ));
                info!(
                    "Condition rule loop started ({}s tick)",
                    scheduler.config.condition_tick_secs
                );
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = scheduler.run_condition_pass().await {
                                warn!("Condition rule pass failed: {e}");
                            }
                        }
                        _ = shutdown.changed() => {
                            info!("Condition rule loop stopping");
                            break;
                        }
                    }
                }
            }));
        }

        handles
    }

    /// One time-rule evaluation pass at the given wall-clock instant.
    /// Returns how many rules fired.
    pub async fn run_time_pass(&self, now: DateTime<Local>) -> Result<usize> {
        let stamp = format!(
            "{}-{:02}-{:02}T{:02}:{:02}",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute()
        );

        let rules = self.registry.rules().await?;
        {
            // Drop stamps for rules that no longer exist.
            let mut last_fired = self.last_fired.lock().await;
            last_fired.retain(|id, _| rules.iter().any(|r| r.id == *id));
        }

        let mut fired = 0;
        for rule in rules {
            if !rule.enabled {
                continue;
            }
            let &Trigger::Time { hour, minute } = &rule.trigger else {
                continue;
            };
            if now.hour() != hour || now.minute() != minute {
                continue;
            }

            {
                let mut last_fired = self.last_fired.lock().await;
                if last_fired.get(&rule.id) == Some(&stamp) {
                    continue;
                }
                last_fired.insert(rule.id.clone(), stamp.clone());
            }

            self.execute_rule(&rule, now).await;
            fired += 1;
        }
        Ok(fired)
    }

    /// One condition-rule evaluation pass. Fires only on the false-to-true
    /// transition of each rule's predicate.
    pub async fn run_condition_pass(&self) -> Result<usize> {
        let state = self.emotional.current_state().await?;
        let now = Local::now();

        let rules = self.registry.rules().await?;
        {
            let mut condition_state = self.condition_state.lock().await;
            condition_state.retain(|id, _| rules.iter().any(|r| r.id == *id));
        }

        let mut fired = 0;
        for rule in rules {
            if !rule.enabled {
                continue;
            }
            let &Trigger::Condition {
                metric,
                op,
                threshold,
            } = &rule.trigger
            else {
                continue;
            };

            let passes = op.matches(state.metric(metric), threshold);
            let previous = {
                let mut condition_state = self.condition_state.lock().await;
                condition_state.insert(rule.id.clone(), passes).unwrap_or(false)
            };

            if passes && !previous {
                self.execute_rule(&rule, now).await;
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// Execute one rule's action. Failures are logged; they never stop the
    /// pass or the loop.
    async fn execute_rule(&self, rule: &AutomationRule, now: DateTime<Local>) {
        info!("Rule fired: {} ({})", rule.name, rule.id);

        if let Err(e) = self.perform_action(rule, now).await {
            warn!("Rule {} action failed: {e}", rule.id);
            return;
        }

        // Audit trail: every execution lands in the interaction window.
        if let Err(e) = self
            .context
            .record_interaction(
                InteractionKind::FeatureUsage,
                json!({ "feature": format!("rule:{}", rule.id) }),
                HashMap::new(),
            )
            .await
        {
            warn!("Failed to record rule execution for {}: {e}", rule.id);
        }
    }

    async fn perform_action(&self, rule: &AutomationRule, now: DateTime<Local>) -> Result<()> {
        let state = self.emotional.current_state().await?;
        let message = match rule.action {
            RuleAction::MorningSummary => {
                let snapshot = self.context.snapshot().await?;
                let events = snapshot.schedule.len();
                let weather = snapshot
                    .readings
                    .front()
                    .map(|r| format!(" It's {:.0}°C and {} outside.", r.temperature_c, r.condition))
                    .unwrap_or_default();
                format!("Here's your day: {events} scheduled events.{weather}")
            }
            RuleAction::EveningCheck => {
                "That's a wrap for today. Want me to dim things down for the evening?".to_string()
            }
            RuleAction::SuggestBreak => {
                "Your stress has been climbing. A short break might help.".to_string()
            }
        };

        let styled = self
            .persona
            .compose(&message, &state, now.hour(), now.weekday())
            .await;
        if self.outbox.send(styled).is_err() {
            debug!("No outbox receiver; dropping message for rule {}", rule.id);
        }
        Ok(())
    }
}
