//! Device and automation registry: the single source of truth for device
//! state, automations, and scheduler rules.
//!
//! Device state changes flow through `update_device_state` only. Updates for
//! the same device are serialized, persisted before the in-memory commit, and
//! followed by a synchronous evaluation of device-trigger automations.

use crate::context::ContextStore;
use crate::error::{CoreError, Result};
use crate::storage::Store;
use crate::types::{
    Automation, AutomationRule, CompareOp, Device, DeviceAction, InteractionKind, MetricKind,
    RuleAction, Trigger,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub struct Registry {
    store: Arc<Store>,
    user: RwLock<Option<String>>,
    devices: RwLock<HashMap<String, Device>>,
    automations: RwLock<HashMap<String, Automation>>,
    rules: RwLock<Vec<AutomationRule>>,
    /// One in-flight state update per device id.
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Where fired automations are recorded for audit, when wired.
    audit: RwLock<Option<Arc<ContextStore>>>,
}

/// The built-in rules seeded when storage holds none.
pub fn default_rules() -> Vec<AutomationRule> {
    vec![
        AutomationRule {
            id: "morning-summary".to_string(),
            name: "Morning Summary".to_string(),
            trigger: Trigger::Time { hour: 8, minute: 0 },
            action: RuleAction::MorningSummary,
            enabled: true,
        },
        AutomationRule {
            id: "evening-check".to_string(),
            name: "Evening Check-in".to_string(),
            trigger: Trigger::Time {
                hour: 22,
                minute: 0,
            },
            action: RuleAction::EveningCheck,
            enabled: true,
        },
        AutomationRule {
            id: "stress-alert".to_string(),
            name: "Stress Alert".to_string(),
            trigger: Trigger::Condition {
                metric: MetricKind::Stress,
                op: CompareOp::Gt,
                threshold: 70.0,
            },
            action: RuleAction::SuggestBreak,
            enabled: true,
        },
    ]
}

impl Registry {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            user: RwLock::new(None),
            devices: RwLock::new(HashMap::new()),
            automations: RwLock::new(HashMap::new()),
            rules: RwLock::new(Vec::new()),
            device_locks: Mutex::new(HashMap::new()),
            audit: RwLock::new(None),
        }
    }

    /// Wire the context store that receives an audit interaction for every
    /// automation fired from a device state commit.
    pub async fn set_audit(&self, context: Arc<ContextStore>) {
        *self.audit.write().await = Some(context);
    }

    /// Bind to a user, load persisted devices/automations/rules, and seed the
    /// default rules when none exist yet.
    pub async fn initialize(&self, user_id: &str) -> Result<()> {
        {
            let mut user = self.user.write().await;
            *user = Some(user_id.to_string());
        }

        let devices = self.store.load_devices(user_id).await?;
        let automations = self.store.load_automations(user_id).await?;
        let mut rules = self.store.load_rules(user_id).await?;

        if rules.is_empty() {
            rules = default_rules();
            self.store.replace_rules(user_id, &rules).await?;
            info!("Seeded {} default automation rules", rules.len());
        }

        info!(
            "Registry loaded: {} devices, {} automations, {} rules",
            devices.len(),
            automations.len(),
            rules.len()
        );

        *self.devices.write().await = devices.into_iter().map(|d| (d.id.clone(), d)).collect();
        *self.automations.write().await =
            automations.into_iter().map(|a| (a.id.clone(), a)).collect();
        *self.rules.write().await = rules;
        Ok(())
    }

    async fn user(&self) -> Result<String> {
        self.user
            .read()
            .await
            .clone()
            .ok_or(CoreError::NotInitialized)
    }

    async fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.device_locks.lock().await;
        Arc::clone(
            locks
                .entry(device_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    // ---- Devices ----------------------------------------------------------

    pub async fn add_device(&self, device: Device) -> Result<()> {
        let user = self.user().await?;
        if device.id.trim().is_empty() || device.name.trim().is_empty() {
            return Err(CoreError::Validation(
                "Device id and name must be non-empty".to_string(),
            ));
        }

        self.store.upsert_device(&user, &device).await?;
        self.devices
            .write()
            .await
            .insert(device.id.clone(), device);
        Ok(())
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Device> {
        let _ = self.user().await?;
        self.devices
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("device {device_id}")))
    }

    pub async fn devices(&self) -> Result<Vec<Device>> {
        let _ = self.user().await?;
        let mut out: Vec<Device> = self.devices.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Apply a partial state update to one device. The durable write precedes
    /// the in-memory commit; on success, enabled device-trigger automations
    /// are evaluated against the new state and each match fires exactly once.
    /// Returns the automations that fired.
    pub async fn update_device_state(
        &self,
        device_id: &str,
        state: HashMap<String, serde_json::Value>,
    ) -> Result<Vec<Automation>> {
        let user = self.user().await?;
        let lock = self.device_lock(device_id).await;
        let guard = lock.lock().await;

        let mut device = self.get_device(device_id).await?;
        device.state.extend(state);
        self.store.upsert_device(&user, &device).await?;

        let new_state = device.state.clone();
        self.devices
            .write()
            .await
            .insert(device_id.to_string(), device);
        drop(guard);

        // Evaluate enabled device-trigger automations against the committed
        // state, once per commit.
        let fired: Vec<Automation> = {
            let automations = self.automations.read().await;
            automations
                .values()
                .filter(|a| a.enabled)
                .filter(|a| match &a.trigger {
                    Trigger::Device {
                        device_id: target,
                        metric,
                        op,
                        threshold,
                    } => {
                        target == device_id
                            && new_state
                                .get(metric)
                                .and_then(|v| v.as_f64())
                                .map(|v| op.matches(v, *threshold))
                                .unwrap_or(false)
                    }
                    _ => false,
                })
                .cloned()
                .collect()
        };

        for automation in &fired {
            info!(
                "Automation '{}' triggered by {device_id} state change",
                automation.name
            );
            for action in &automation.actions {
                if let Err(e) = self.apply_action(action).await {
                    warn!(
                        "Action {} on {} failed: {e}",
                        action.action, action.device_id
                    );
                }
            }
        }

        // Fired automations land in the interaction window like rule
        // executions do.
        if !fired.is_empty() {
            if let Some(context) = self.audit.read().await.clone() {
                for automation in &fired {
                    if let Err(e) = context
                        .record_interaction(
                            InteractionKind::FeatureUsage,
                            serde_json::json!({
                                "feature": format!("automation:{}", automation.id),
                                "device_id": device_id,
                            }),
                            HashMap::new(),
                        )
                        .await
                    {
                        warn!("Failed to record firing of {}: {e}", automation.id);
                    }
                }
            }
        }

        Ok(fired)
    }

    /// Apply one automation action to its target device. This path never
    /// re-evaluates triggers, so automations cannot cascade into each other.
    async fn apply_action(&self, action: &DeviceAction) -> Result<()> {
        let user = self.user().await?;
        let lock = self.device_lock(&action.device_id).await;
        let _guard = lock.lock().await;

        let mut device = self.get_device(&action.device_id).await?;
        device
            .state
            .insert("last_action".to_string(), serde_json::json!(action.action));
        for (key, value) in &action.params {
            device.state.insert(key.clone(), value.clone());
        }
        self.store.upsert_device(&user, &device).await?;

        debug!("Applied action {} to {}", action.action, action.device_id);
        self.devices
            .write()
            .await
            .insert(device.id.clone(), device);
        Ok(())
    }

    // ---- Automations ------------------------------------------------------

    pub async fn create_automation(
        &self,
        name: &str,
        trigger: Trigger,
        actions: Vec<DeviceAction>,
    ) -> Result<Automation> {
        let user = self.user().await?;
        if name.trim().is_empty() {
            return Err(CoreError::Validation(
                "Automation name must be non-empty".to_string(),
            ));
        }
        if actions.is_empty() {
            return Err(CoreError::Validation(
                "Automation must have at least one action".to_string(),
            ));
        }

        let automation = Automation {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            trigger,
            actions,
            enabled: true,
        };
        self.store.upsert_automation(&user, &automation).await?;
        self.automations
            .write()
            .await
            .insert(automation.id.clone(), automation.clone());
        Ok(automation)
    }

    /// Insert or replace an automation with a caller-chosen id. Used for
    /// prediction-derived automations that refresh in place.
    pub async fn upsert_automation(&self, automation: Automation) -> Result<()> {
        let user = self.user().await?;
        if automation.name.trim().is_empty() || automation.actions.is_empty() {
            return Err(CoreError::Validation(
                "Automation needs a name and at least one action".to_string(),
            ));
        }
        self.store.upsert_automation(&user, &automation).await?;
        self.automations
            .write()
            .await
            .insert(automation.id.clone(), automation);
        Ok(())
    }

    pub async fn toggle_automation(&self, automation_id: &str, enabled: bool) -> Result<()> {
        let user = self.user().await?;
        let updated = {
            let automations = self.automations.read().await;
            let mut automation = automations
                .get(automation_id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("automation {automation_id}")))?;
            automation.enabled = enabled;
            automation
        };

        self.store.upsert_automation(&user, &updated).await?;
        self.automations
            .write()
            .await
            .insert(automation_id.to_string(), updated);
        Ok(())
    }

    pub async fn automations(&self) -> Result<Vec<Automation>> {
        let _ = self.user().await?;
        let mut out: Vec<Automation> = self.automations.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    // ---- Scheduler rules --------------------------------------------------

    // Rule mutations build the new list aside, persist it, and only then
    // swap it in. A storage failure leaves the in-memory list untouched.

    pub async fn add_rule(&self, rule: AutomationRule) -> Result<()> {
        let user = self.user().await?;
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(CoreError::Validation(format!(
                "Rule id already exists: {}",
                rule.id
            )));
        }
        let mut next = rules.clone();
        next.push(rule);
        self.store.replace_rules(&user, &next).await?;
        *rules = next;
        Ok(())
    }

    pub async fn update_rule(&self, rule: AutomationRule) -> Result<()> {
        let user = self.user().await?;
        let mut rules = self.rules.write().await;
        let mut next = rules.clone();
        let slot = next
            .iter_mut()
            .find(|r| r.id == rule.id)
            .ok_or_else(|| CoreError::NotFound(format!("rule {}", rule.id)))?;
        *slot = rule;
        self.store.replace_rules(&user, &next).await?;
        *rules = next;
        Ok(())
    }

    pub async fn remove_rule(&self, rule_id: &str) -> Result<()> {
        let user = self.user().await?;
        let mut rules = self.rules.write().await;
        let mut next = rules.clone();
        next.retain(|r| r.id != rule_id);
        if next.len() == rules.len() {
            return Err(CoreError::NotFound(format!("rule {rule_id}")));
        }
        self.store.replace_rules(&user, &next).await?;
        *rules = next;
        Ok(())
    }

    pub async fn rules(&self) -> Result<Vec<AutomationRule>> {
        let _ = self.user().await?;
        Ok(self.rules.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreLocation;
    use crate::types::{DeviceKind, DeviceStatus};
    use serde_json::json;
    use tempfile::tempdir;

    async fn ready_registry(dir: &tempfile::TempDir) -> Registry {
        let store = Store::open(
            StoreLocation::Custom(dir.path().join("reg.db")),
            5_000,
        )
        .await
        .unwrap();
        let registry = Registry::new(Arc::new(store));
        registry.initialize("u1").await.unwrap();
        registry
    }

    fn thermostat() -> Device {
        Device {
            id: "thermostat-1".to_string(),
            name: "Thermostat".to_string(),
            kind: DeviceKind::Thermostat,
            status: DeviceStatus::Online,
            state: HashMap::from([("temperature".to_string(), json!(20.0))]),
            location: "living room".to_string(),
        }
    }

    #[tokio::test]
    async fn test_uninitialized_registry_rejects_mutations() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            StoreLocation::Custom(dir.path().join("reg.db")),
            5_000,
        )
        .await
        .unwrap();
        let registry = Registry::new(Arc::new(store));

        assert!(matches!(
            registry.add_device(thermostat()).await.unwrap_err(),
            CoreError::NotInitialized
        ));
    }

    #[tokio::test]
    async fn test_default_rules_seeded_once() {
        let dir = tempdir().unwrap();
        let registry = ready_registry(&dir).await;

        let rules = registry.rules().await.unwrap();
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().any(|r| r.id == "morning-summary"));
        assert!(rules.iter().any(|r| r.id == "stress-alert"));

        // Re-initializing over the same storage does not duplicate them.
        registry.initialize("u1").await.unwrap();
        assert_eq!(registry.rules().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_device_trigger_fires_exactly_once_per_commit() {
        let dir = tempdir().unwrap();
        let registry = ready_registry(&dir).await;
        registry.add_device(thermostat()).await.unwrap();

        let automation = registry
            .create_automation(
                "cool down",
                Trigger::Device {
                    device_id: "thermostat-1".to_string(),
                    metric: "temperature".to_string(),
                    op: CompareOp::Gt,
                    threshold: 25.0,
                },
                vec![DeviceAction {
                    device_id: "thermostat-1".to_string(),
                    action: "set_cooling".to_string(),
                    params: HashMap::from([("cooling".to_string(), json!(true))]),
                }],
            )
            .await
            .unwrap();

        // Below threshold: nothing fires.
        let fired = registry
            .update_device_state(
                "thermostat-1",
                HashMap::from([("temperature".to_string(), json!(24.0))]),
            )
            .await
            .unwrap();
        assert!(fired.is_empty());

        // Crossing the threshold fires the automation once.
        let fired = registry
            .update_device_state(
                "thermostat-1",
                HashMap::from([("temperature".to_string(), json!(26.0))]),
            )
            .await
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, automation.id);

        // The action landed on the device without re-triggering anything.
        let device = registry.get_device("thermostat-1").await.unwrap();
        assert_eq!(device.state.get("cooling"), Some(&json!(true)));
        assert_eq!(device.state.get("last_action"), Some(&json!("set_cooling")));
    }

    #[tokio::test]
    async fn test_disabled_automation_never_fires() {
        let dir = tempdir().unwrap();
        let registry = ready_registry(&dir).await;
        registry.add_device(thermostat()).await.unwrap();

        let automation = registry
            .create_automation(
                "cool down",
                Trigger::Device {
                    device_id: "thermostat-1".to_string(),
                    metric: "temperature".to_string(),
                    op: CompareOp::Gt,
                    threshold: 25.0,
                },
                vec![DeviceAction {
                    device_id: "thermostat-1".to_string(),
                    action: "set_cooling".to_string(),
                    params: HashMap::new(),
                }],
            )
            .await
            .unwrap();
        registry
            .toggle_automation(&automation.id, false)
            .await
            .unwrap();

        let fired = registry
            .update_device_state(
                "thermostat-1",
                HashMap::from([("temperature".to_string(), json!(30.0))]),
            )
            .await
            .unwrap();
        assert!(fired.is_empty());
    }

    #[tokio::test]
    async fn test_toggle_unknown_automation_is_not_found() {
        let dir = tempdir().unwrap();
        let registry = ready_registry(&dir).await;

        let err = registry
            .toggle_automation("no-such-automation", true)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_automation_validation() {
        let dir = tempdir().unwrap();
        let registry = ready_registry(&dir).await;

        let err = registry
            .create_automation("", Trigger::Time { hour: 8, minute: 0 }, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let err = registry
            .create_automation("no actions", Trigger::Time { hour: 8, minute: 0 }, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_device_trigger_firing_is_audited() {
        use crate::config::CoreConfig;
        use crate::providers::Providers;

        let dir = tempdir().unwrap();
        let store = Arc::new(
            Store::open(
                StoreLocation::Custom(dir.path().join("reg.db")),
                5_000,
            )
            .await
            .unwrap(),
        );
        let registry = Registry::new(Arc::clone(&store));
        registry.initialize("u1").await.unwrap();
        let context = Arc::new(ContextStore::new(
            store,
            Providers::default(),
            CoreConfig::default(),
        ));
        context.bind_user("u1").await.unwrap();
        registry.set_audit(Arc::clone(&context)).await;

        registry.add_device(thermostat()).await.unwrap();
        let automation = registry
            .create_automation(
                "cool down",
                Trigger::Device {
                    device_id: "thermostat-1".to_string(),
                    metric: "temperature".to_string(),
                    op: CompareOp::Gt,
                    threshold: 25.0,
                },
                vec![DeviceAction {
                    device_id: "thermostat-1".to_string(),
                    action: "set_cooling".to_string(),
                    params: HashMap::new(),
                }],
            )
            .await
            .unwrap();

        registry
            .update_device_state(
                "thermostat-1",
                HashMap::from([("temperature".to_string(), json!(28.0))]),
            )
            .await
            .unwrap();

        let snapshot = context.snapshot().await.unwrap();
        let audit = snapshot
            .interactions
            .iter()
            .find(|i| i.kind == InteractionKind::FeatureUsage)
            .unwrap();
        assert_eq!(
            audit.content["feature"],
            format!("automation:{}", automation.id)
        );
        assert_eq!(audit.content["device_id"], "thermostat-1");

        // No fire, no audit entry.
        registry
            .update_device_state(
                "thermostat-1",
                HashMap::from([("temperature".to_string(), json!(20.0))]),
            )
            .await
            .unwrap();
        let snapshot = context.snapshot().await.unwrap();
        assert_eq!(
            snapshot
                .interactions
                .iter()
                .filter(|i| i.kind == InteractionKind::FeatureUsage)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_rule_mutation_aborts_on_persistence_failure() {
        let dir = tempdir().unwrap();
        let registry = ready_registry(&dir).await;

        // Break the rules table behind the store's back.
        let conn = rusqlite::Connection::open(dir.path().join("reg.db")).unwrap();
        conn.execute("DROP TABLE automation_rules", []).unwrap();

        let rule = AutomationRule {
            id: "night-mode".to_string(),
            name: "Night Mode".to_string(),
            trigger: Trigger::Time {
                hour: 23,
                minute: 30,
            },
            action: RuleAction::EveningCheck,
            enabled: true,
        };
        let err = registry.add_rule(rule).await.unwrap_err();
        assert!(matches!(err, CoreError::Persistence(_)));
        // The in-memory list still matches the last durable state.
        assert_eq!(registry.rules().await.unwrap().len(), 3);

        let err = registry.remove_rule("morning-summary").await.unwrap_err();
        assert!(matches!(err, CoreError::Persistence(_)));
        assert_eq!(registry.rules().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rule_ids_are_unique() {
        let dir = tempdir().unwrap();
        let registry = ready_registry(&dir).await;

        let duplicate = default_rules().remove(0);
        let err = registry.add_rule(duplicate).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        registry.remove_rule("evening-check").await.unwrap();
        assert_eq!(registry.rules().await.unwrap().len(), 2);
        assert!(matches!(
            registry.remove_rule("evening-check").await.unwrap_err(),
            CoreError::NotFound(_)
        ));
    }
}
