//! Composition root: wires storage, context, predictions, the registry, the
//! emotional tracker, the persona, and the scheduler together.
//!
//! Every component is constructed once and injected explicitly; nothing in
//! the crate reaches for a global.

use crate::config::CoreConfig;
use crate::context::ContextStore;
use crate::emotional::EmotionalTracker;
use crate::error::{CoreError, Result};
use crate::patterns;
use crate::persona::Persona;
use crate::predict::{generate_predictions, Predictor};
use crate::providers::Providers;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::storage::Store;
use crate::types::{
    Automation, CompareOp, DeviceAction, DeviceKind, InteractionKind, Prediction, PredictionKind,
    Styled, Trigger,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Core {
    config: CoreConfig,
    pub context: Arc<ContextStore>,
    pub predictor: Arc<Predictor>,
    pub registry: Arc<Registry>,
    pub emotional: Arc<EmotionalTracker>,
    pub persona: Arc<Persona>,
    scheduler: Arc<Scheduler>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Styled>>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    analysis_permits: Arc<Semaphore>,
    initialized: AtomicBool,
}

impl Core {
    pub fn new(store: Arc<Store>, providers: Providers, config: CoreConfig) -> Self {
        let context = Arc::new(ContextStore::new(
            Arc::clone(&store),
            providers,
            config.clone(),
        ));
        let predictor = Arc::new(Predictor::new(Arc::clone(&store)));
        let registry = Arc::new(Registry::new(Arc::clone(&store)));
        let emotional = Arc::new(EmotionalTracker::new(Arc::clone(&store)));
        let persona = Arc::new(Persona::new(Arc::clone(&store)));

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&registry),
            Arc::clone(&context),
            Arc::clone(&emotional),
            Arc::clone(&persona),
            config.clone(),
            outbox_tx,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            analysis_permits: Arc::new(Semaphore::new(config.max_concurrent_analysis)),
            config,
            context,
            predictor,
            registry,
            emotional,
            persona,
            scheduler,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Take the channel that receives persona-composed messages from fired
    /// rules. Available once.
    pub async fn outbox(&self) -> Option<mpsc::UnboundedReceiver<Styled>> {
        self.outbox_rx.lock().await.take()
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CoreError::NotInitialized)
        }
    }

    /// Bind every component to the user and load persisted state.
    pub async fn initialize(&self, user_id: &str) -> Result<()> {
        info!("Initializing core for user: {user_id}");
        self.context.bind_user(user_id).await?;
        self.registry.initialize(user_id).await?;
        self.registry.set_audit(Arc::clone(&self.context)).await;
        self.predictor.initialize(user_id).await?;
        self.emotional.initialize(user_id).await?;
        self.persona.initialize(user_id).await?;
        self.initialized.store(true, Ordering::Release);
        info!("Core initialized");
        Ok(())
    }

    /// Spawn the scheduler loops and the periodic analysis loop.
    pub async fn start(&self) -> Result<()> {
        self.ensure_initialized()?;
        let shutdown = self.shutdown_tx.subscribe();

        let mut handles = self.handles.lock().await;
        handles.extend(self.scheduler.spawn(shutdown.clone()));

        let context = Arc::clone(&self.context);
        let predictor = Arc::clone(&self.predictor);
        let registry = Arc::clone(&self.registry);
        let permits = Arc::clone(&self.analysis_permits);
        let config = self.config.clone();
        let mut shutdown = shutdown;
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(
                config.analysis_interval_secs,
            ));
            info!(
                "Analysis loop started ({}s interval)",
                config.analysis_interval_secs
            );
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        // A slow cycle never delays the tick; excess cycles
                        // are skipped, not queued.
                        let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                            debug!("Analysis cycle skipped, previous cycles still running");
                            continue;
                        };
                        let context = Arc::clone(&context);
                        let predictor = Arc::clone(&predictor);
                        let registry = Arc::clone(&registry);
                        let config = config.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(e) =
                                Core::analysis_cycle(&context, &predictor, &registry, &config).await
                            {
                                warn!("Analysis cycle failed: {e}");
                            }
                        });
                    }
                    _ = shutdown.changed() => {
                        info!("Analysis loop stopping");
                        break;
                    }
                }
            }
        }));

        info!("Core started");
        Ok(())
    }

    /// One full predictive cycle: refresh context, analyze, generate and save
    /// predictions, then derive automations from the qualifying ones.
    pub async fn analysis_cycle(
        context: &ContextStore,
        predictor: &Predictor,
        registry: &Registry,
        config: &CoreConfig,
    ) -> Result<()> {
        context.load_context().await?;
        let snapshot = context.snapshot().await?;
        let pattern_set = patterns::analyze(&snapshot, config);
        if pattern_set.is_empty() {
            debug!("No patterns this cycle");
            return Ok(());
        }

        let mut generated = Vec::new();
        for kind in PredictionKind::ALL {
            generated.extend(generate_predictions(kind, &pattern_set));
        }
        predictor.save_predictions(&generated).await?;
        debug!("Analysis cycle produced {} predictions", generated.len());

        // Only high-confidence predictions may shape automations.
        for prediction in &generated {
            if prediction.confidence < config.automation_confidence_threshold {
                continue;
            }
            for automation in Self::automations_from(prediction, registry).await? {
                registry.upsert_automation(automation).await?;
            }
        }
        Ok(())
    }

    /// Map one qualifying prediction to concrete automations. Environment
    /// predictions become per-thermostat climate automations that refresh in
    /// place; the other kinds stay advisory.
    async fn automations_from(
        prediction: &Prediction,
        registry: &Registry,
    ) -> Result<Vec<Automation>> {
        if prediction.kind != PredictionKind::Environment {
            return Ok(Vec::new());
        }
        let Some(target) = prediction
            .data
            .get("target_temperature_c")
            .and_then(|v| v.as_f64())
        else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for device in registry.devices().await? {
            if device.kind != DeviceKind::Thermostat {
                continue;
            }
            out.push(Automation {
                id: format!("predicted-climate-{}", device.id),
                name: format!("Keep {} near {target:.1}°C", device.name),
                trigger: Trigger::Device {
                    device_id: device.id.clone(),
                    metric: "temperature".to_string(),
                    op: CompareOp::Gt,
                    threshold: target + 2.0,
                },
                actions: vec![DeviceAction {
                    device_id: device.id.clone(),
                    action: "set_temperature".to_string(),
                    params: HashMap::from([("target".to_string(), json!(target))]),
                }],
                enabled: true,
            });
        }
        Ok(out)
    }

    /// Front-end entry point: record the message, run mood analysis, reply in
    /// persona. Internal failures reach the user only as an apology.
    pub async fn handle_message(&self, text: &str) -> Result<Styled> {
        self.ensure_initialized()?;

        let result: Result<Styled> = async {
            self.context
                .record_interaction(
                    InteractionKind::ChatMessage,
                    json!({ "text": text }),
                    HashMap::new(),
                )
                .await?;

            let analysis = self.emotional.analyze_text(text).await?;
            let state = self.emotional.current_state().await?;

            let mut reply = analysis.response;
            if !analysis.suggestions.is_empty() {
                reply = format!("{reply} You could: {}.", analysis.suggestions.join(", "));
            }

            let now = chrono::Local::now();
            use chrono::{Datelike, Timelike};
            Ok(self
                .persona
                .compose(&reply, &state, now.hour(), now.weekday())
                .await)
        }
        .await;

        match result {
            Ok(styled) => Ok(styled),
            Err(e) => {
                warn!("handle_message failed internally: {e}");
                Ok(self.persona.apologize().await)
            }
        }
    }

    /// Stop the loops, giving in-flight work a bounded grace period.
    pub async fn shutdown(&self) {
        info!("Core shutting down");
        let _ = self.shutdown_tx.send(true);

        let mut handles = self.handles.lock().await;
        let grace = std::time::Duration::from_millis(self.config.shutdown_grace_ms);
        for handle in handles.drain(..) {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("Task did not stop within grace period");
            }
        }
        info!("Core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::PatternSet;
    use crate::storage::StoreLocation;
    use crate::types::{Device, DeviceStatus};
    use tempfile::tempdir;

    async fn ready_core(dir: &tempfile::TempDir) -> Core {
        let store = Arc::new(
            Store::open(
                StoreLocation::Custom(dir.path().join("core.db")),
                5_000,
            )
            .await
            .unwrap(),
        );
        let core = Core::new(store, Providers::default(), CoreConfig::default());
        core.initialize("u1").await.unwrap();
        core
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            Store::open(
                StoreLocation::Custom(dir.path().join("core.db")),
                5_000,
            )
            .await
            .unwrap(),
        );
        let core = Core::new(store, Providers::default(), CoreConfig::default());

        assert!(matches!(
            core.handle_message("hi").await.unwrap_err(),
            CoreError::NotInitialized
        ));
        assert!(matches!(
            core.start().await.unwrap_err(),
            CoreError::NotInitialized
        ));
    }

    #[tokio::test]
    async fn test_handle_message_replies_in_persona() {
        let dir = tempdir().unwrap();
        let core = ready_core(&dir).await;

        let styled = core.handle_message("I'm exhausted today").await.unwrap();
        assert!(styled.message.contains("tired") || styled.message.contains("wind down"));

        // The message landed in the interaction window.
        let snapshot = core.context.snapshot().await.unwrap();
        assert!(snapshot
            .interactions
            .iter()
            .any(|i| i.kind == InteractionKind::ChatMessage));
    }

    #[tokio::test]
    async fn test_low_confidence_predictions_never_make_automations() {
        let dir = tempdir().unwrap();
        let core = ready_core(&dir).await;

        core.registry
            .add_device(Device {
                id: "thermostat-1".to_string(),
                name: "Thermostat".to_string(),
                kind: DeviceKind::Thermostat,
                status: DeviceStatus::Online,
                state: HashMap::new(),
                location: "office".to_string(),
            })
            .await
            .unwrap();

        // Two readings: sparse data caps the environment confidence at 0.5,
        // below the 0.7 automation threshold.
        for t in [20.0, 22.0] {
            core.context
                .record_reading(crate::types::Reading {
                    temperature_c: t,
                    condition: "clear".to_string(),
                    timestamp: chrono::Utc::now(),
                })
                .await
                .unwrap();
        }

        Core::analysis_cycle(
            &core.context,
            &core.predictor,
            &core.registry,
            &CoreConfig::default(),
        )
        .await
        .unwrap();

        assert!(core.registry.automations().await.unwrap().is_empty());
        // The prediction itself was still saved.
        let predictions = core
            .predictor
            .get_predictions(Some(PredictionKind::Environment))
            .await
            .unwrap();
        assert_eq!(predictions.len(), 1);
        assert!(predictions[0].confidence <= 0.5);
    }

    #[tokio::test]
    async fn test_high_confidence_environment_prediction_creates_automation() {
        let dir = tempdir().unwrap();
        let core = ready_core(&dir).await;

        core.registry
            .add_device(Device {
                id: "thermostat-1".to_string(),
                name: "Thermostat".to_string(),
                kind: DeviceKind::Thermostat,
                status: DeviceStatus::Online,
                state: HashMap::new(),
                location: "office".to_string(),
            })
            .await
            .unwrap();

        // A full day of readings pushes the confidence to 1.0.
        for _ in 0..24 {
            core.context
                .record_reading(crate::types::Reading {
                    temperature_c: 22.0,
                    condition: "clear".to_string(),
                    timestamp: chrono::Utc::now(),
                })
                .await
                .unwrap();
        }

        Core::analysis_cycle(
            &core.context,
            &core.predictor,
            &core.registry,
            &CoreConfig::default(),
        )
        .await
        .unwrap();

        let automations = core.registry.automations().await.unwrap();
        assert_eq!(automations.len(), 1);
        assert_eq!(automations[0].id, "predicted-climate-thermostat-1");

        // A second cycle refreshes in place instead of duplicating.
        Core::analysis_cycle(
            &core.context,
            &core.predictor,
            &core.registry,
            &CoreConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(core.registry.automations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempdir().unwrap();
        let core = ready_core(&dir).await;
        core.start().await.unwrap();
        core.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_snapshot_produces_no_predictions() {
        let dir = tempdir().unwrap();
        let core = ready_core(&dir).await;

        Core::analysis_cycle(
            &core.context,
            &core.predictor,
            &core.registry,
            &CoreConfig::default(),
        )
        .await
        .unwrap();
        assert!(core.predictor.get_predictions(None).await.unwrap().is_empty());

        let set = PatternSet::default();
        assert!(set.is_empty());
    }
}
