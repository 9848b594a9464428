//! Plan execution engine.
//!
//! Walks a plan's steps in order. Control-plane steps run inline; remote steps
//! are dispatched once and then awaited through the persisted plan. Every
//! status change goes through [`Engine::update_step`].
//!
//! The engine's view of a running plan is an immutable `Arc<Plan>` snapshot
//! published on a watch channel. Snapshots are only published while the
//! update lock is held, so a monitor refresh can never overwrite a newer write
//! with an older read.

mod handlers;
mod wait;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{UpgradeError, find_upgrade_error};
use crate::metrics::Metrics;
use crate::notify::{self, SlackNotifier};
use crate::plan::{Plan, StepOutput, StepStatus};
use crate::store::Store;
use crate::upgrader::AppUpgrader;

/// Timing knobs for plan execution.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// How often the monitor re-reads the plan from the store.
    pub monitor_interval: Duration,
    /// Poll interval while waiting for a remote step.
    pub step_poll_interval: Duration,
    /// How long a remote cluster or extension step may take.
    pub remote_step_timeout: Duration,
    /// How long to wait for an EC manager to reconnect at its new version.
    pub manager_upgrade_timeout: Duration,
    pub manager_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(2),
            step_poll_interval: Duration::from_secs(2),
            remote_step_timeout: Duration::from_secs(3600),
            manager_upgrade_timeout: Duration::from_secs(300),
            manager_poll_interval: Duration::from_secs(5),
        }
    }
}

/// A status report for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    pub status: StepStatus,
    pub description: String,
    /// Raw output, parsed against the step's type.
    pub output: Option<Value>,
    pub owner_host: Option<String>,
}

impl StepUpdate {
    pub const fn new(status: StepStatus) -> Self {
        Self {
            status,
            description: String::new(),
            output: None,
            owner_host: None,
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    #[must_use]
    pub fn owner_host(mut self, host: impl Into<String>) -> Self {
        self.owner_host = Some(host.into());
        self
    }
}

/// (app id, version label)
type PlanKey = (String, String);

type Snapshot = watch::Receiver<Arc<Plan>>;

pub struct Engine {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    upgrader: Arc<dyn AppUpgrader>,
    config: EngineConfig,
    /// Serializes read-modify-write cycles against the store.
    update_lock: tokio::sync::Mutex<()>,
    /// Snapshot publishers for plans currently executing.
    running: Mutex<HashMap<PlanKey, Arc<watch::Sender<Arc<Plan>>>>>,
    metrics: Option<Arc<Metrics>>,
    notifier: Option<Arc<SlackNotifier>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<Dispatcher>,
        upgrader: Arc<dyn AppUpgrader>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            upgrader,
            config,
            update_lock: tokio::sync::Mutex::new(()),
            running: Mutex::new(HashMap::new()),
            metrics: None,
            notifier: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<SlackNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub const fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn running(&self) -> MutexGuard<'_, HashMap<PlanKey, Arc<watch::Sender<Arc<Plan>>>>> {
        self.running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Whether a plan for this app and version is executing in this process.
    pub fn is_running(&self, app_id: &str, version_label: &str) -> bool {
        self.running()
            .contains_key(&(app_id.to_string(), version_label.to_string()))
    }

    /// Must be called with the update lock held.
    fn publish(&self, plan: &Plan) {
        let key = (plan.app_id.clone(), plan.version_label.clone());
        if let Some(tx) = self.running().get(&key) {
            tx.send_replace(Arc::new(plan.clone()));
        }
    }

    /// Apply a status report to one step and persist the whole plan.
    ///
    /// This is the only write path for plan state. Local handlers and remote
    /// reporters both funnel through it.
    pub async fn update_step(
        &self,
        app_slug: &str,
        version_label: &str,
        step_id: &str,
        update: StepUpdate,
    ) -> Result<Plan> {
        let _guard = self.update_lock.lock().await;

        let app = self
            .store
            .get_app_by_slug(app_slug)
            .await
            .context("Failed to load app")?
            .ok_or_else(|| UpgradeError::AppNotFound(app_slug.to_string()))?;
        let mut plan = self
            .store
            .get_plan(&app.id, version_label)
            .await
            .context("Failed to load plan")?
            .ok_or_else(|| UpgradeError::PlanNotFound {
                app: app_slug.to_string(),
                version_label: version_label.to_string(),
            })?;

        let step = plan
            .step_mut(step_id)
            .ok_or_else(|| UpgradeError::StepNotFound(step_id.to_string()))?;
        if !step.status.can_transition_to(update.status) {
            return Err(UpgradeError::InvalidTransition {
                step_id: step_id.to_string(),
                from: step.status.to_string(),
                to: update.status.to_string(),
            }
            .into());
        }

        let step_type = step.step_type();
        let previous = step.status;
        if let Some(value) = update.output.filter(|v| !v.is_null()) {
            let output = StepOutput::parse(step_type, value)
                .with_context(|| format!("Invalid output for {step_type} step {step_id}"))?;
            step.output = Some(output);
        }
        step.status = update.status;
        step.status_description = update.description;
        if let Some(host) = update.owner_host {
            step.owner_host = Some(host);
        }

        self.store
            .upsert_plan(&plan)
            .await
            .context("Failed to save plan")?;

        if previous != update.status {
            if let Some(metrics) = &self.metrics {
                metrics.record_step_transition(step_type, update.status);
            }
            info!(
                app = app_slug,
                version_label = version_label,
                step = step_id,
                step_type = %step_type,
                from = %previous,
                to = %update.status,
                "Step status changed"
            );
        }

        self.publish(&plan);
        Ok(plan)
    }

    /// Re-read a running plan from the store and publish it.
    async fn refresh(&self, app_id: &str, version_label: &str) -> Result<()> {
        let _guard = self.update_lock.lock().await;
        if let Some(plan) = self
            .store
            .get_plan(app_id, version_label)
            .await
            .context("Failed to refresh plan")?
        {
            self.publish(&plan);
        }
        Ok(())
    }

    /// Run a plan to completion or to its first failure.
    ///
    /// Complete steps are skipped, so calling this again on a partially
    /// executed plan picks up where it stopped. A failed step ends the run.
    pub async fn execute(self: Arc<Self>, plan: Plan) -> Result<()> {
        let key = (plan.app_id.clone(), plan.version_label.clone());
        let (tx, mut rx) = watch::channel(Arc::new(plan));
        {
            let mut running = self.running();
            if running.contains_key(&key) {
                return Err(UpgradeError::PlanInProgress {
                    app: key.0,
                    version_label: key.1,
                }
                .into());
            }
            running.insert(key.clone(), Arc::new(tx));
        }

        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(monitor_loop(
            Arc::clone(&self),
            key.clone(),
            cancel.clone(),
        ));

        let result = self.run_steps(&mut rx).await;

        cancel.cancel();
        if let Err(e) = monitor.await {
            warn!(error = %e, "Plan monitor task failed");
        }
        self.running().remove(&key);

        let plan = rx.borrow().clone();
        let now = chrono::Utc::now();
        match &result {
            Ok(()) => {
                info!(app = %plan.app_slug, version_label = %plan.version_label, plan = %plan.id, "Plan completed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_plan_finished(true);
                }
                if let Some(notifier) = &self.notifier {
                    notifier
                        .send(&plan.id, &notify::build_completed_message(&plan, now))
                        .await;
                }
            }
            Err(e) => {
                let reason = format!("{e:#}");
                error!(app = %plan.app_slug, version_label = %plan.version_label, plan = %plan.id, error = %reason, "Plan failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_plan_finished(false);
                }
                if let Some(notifier) = &self.notifier {
                    notifier
                        .send(&plan.id, &notify::build_failed_message(&plan, &reason, now))
                        .await;
                }
            }
        }
        result
    }

    async fn run_steps(&self, rx: &mut Snapshot) -> Result<()> {
        let step_ids: Vec<String> = rx.borrow().steps.iter().map(|s| s.id.clone()).collect();

        for step_id in step_ids {
            let plan = rx.borrow_and_update().clone();
            let step = plan.require_step(&step_id)?.clone();

            match step.status {
                StepStatus::Complete => {
                    debug!(step = %step.name, "Step already complete, skipping");
                    continue;
                }
                StepStatus::Failed => {
                    return Err(UpgradeError::StepFailed {
                        step_id: step.id,
                        description: step.status_description,
                    }
                    .into());
                }
                StepStatus::Pending | StepStatus::Starting | StepStatus::Running => {}
            }

            info!(
                app = %plan.app_slug,
                step = %step.name,
                step_type = %step.step_type(),
                status = %step.status,
                "Executing step"
            );
            if let Err(e) = self.execute_step(&plan, &step, rx).await {
                let e = e.context(format!("{} step {}", step.step_type(), step.name));
                self.record_failure(&plan, &step.id, &e).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Mark the step failed with the error text. A failure reported by the
    /// agent is already recorded.
    async fn record_failure(&self, plan: &Plan, step_id: &str, err: &anyhow::Error) {
        if matches!(find_upgrade_error(err), Some(UpgradeError::StepFailed { .. })) {
            return;
        }
        let update = StepUpdate::new(StepStatus::Failed).description(format!("{err:#}"));
        if let Err(e) = self
            .update_step(&plan.app_slug, &plan.version_label, step_id, update)
            .await
        {
            warn!(step = step_id, error = %e, "Failed to record step failure");
        }
    }

    /// Start `execute` in the background. Errors are logged by `execute`.
    pub fn spawn(self: &Arc<Self>, plan: Plan) -> JoinHandle<Result<()>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.execute(plan).await })
    }

    /// Resume an interrupted plan after a restart.
    ///
    /// Only acts when exactly one app is installed and its current plan has
    /// not ended.
    pub async fn resume(self: &Arc<Self>) -> Result<Option<JoinHandle<Result<()>>>> {
        let apps = self
            .store
            .list_installed_apps()
            .await
            .context("Failed to list installed apps")?;
        let [app] = apps.as_slice() else {
            debug!(apps = apps.len(), "Not resuming, expected exactly one installed app");
            return Ok(None);
        };

        let Some(plan) = self
            .store
            .get_current_plan(&app.id)
            .await
            .context("Failed to load current plan")?
        else {
            return Ok(None);
        };
        if plan.has_ended() {
            debug!(app = %app.slug, plan = %plan.id, "Current plan has ended, nothing to resume");
            return Ok(None);
        }

        info!(
            app = %app.slug,
            version_label = %plan.version_label,
            plan = %plan.id,
            "Resuming upgrade plan"
        );
        Ok(Some(self.spawn(plan)))
    }
}

/// Refresh the running plan from the store until cancelled.
async fn monitor_loop(engine: Arc<Engine>, key: PlanKey, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(engine.config.monitor_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = engine.refresh(&key.0, &key.1).await {
            warn!(app_id = %key.0, version_label = %key.1, error = %e, "Failed to refresh plan");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeUpgrader;
    use super::*;
    use crate::plan::{
        AppUpgradeInput, AppUpgradeServiceInput, ClusterUpgradeInput, ManagerUpgradeInput, Step,
        StepSpec,
    };
    use crate::registry::testing::RecordingSink;
    use crate::registry::{ProbeConfig, Registry};
    use crate::store::{InstalledApp, License, MemoryStore};
    use serde_json::json;

    fn app() -> InstalledApp {
        InstalledApp {
            id: "app-1".to_string(),
            slug: "my-app".to_string(),
            name: "My App".to_string(),
            is_airgap: false,
            license: Some(License {
                id: "lic".to_string(),
                endpoint: "https://replicated.app".to_string(),
                is_disaster_recovery_supported: false,
            }),
        }
    }

    fn service_step() -> Step {
        Step::new(
            "Prepare my-app 1.2.0",
            StepSpec::AppUpgradeService(AppUpgradeServiceInput {
                app_id: "app-1".to_string(),
                app_slug: "my-app".to_string(),
                version_label: "1.2.0".to_string(),
                update_cursor: "42".to_string(),
                channel_id: "stable".to_string(),
                is_airgap: false,
                ec_version: "2.1.0".to_string(),
            }),
        )
    }

    fn app_step(service_step_id: &str) -> Step {
        Step::new(
            "Upgrade my-app to 1.2.0",
            StepSpec::AppUpgrade(AppUpgradeInput {
                app_id: "app-1".to_string(),
                app_slug: "my-app".to_string(),
                version_label: "1.2.0".to_string(),
                service_step_id: service_step_id.to_string(),
            }),
        )
    }

    fn cluster_step() -> Step {
        Step::new(
            "Upgrade embedded cluster to 2.1.0",
            StepSpec::EmbeddedClusterUpgrade(ClusterUpgradeInput {
                current_installation: json!({ "spec": { "config": { "version": "2.0.0" } } }),
                new_config_spec: json!({ "version": "2.1.0" }),
                is_disaster_recovery_supported: false,
                new_ec_version: "2.1.0".to_string(),
            }),
        )
    }

    fn manager_step(node: &str) -> Step {
        Step::new(
            format!("Upgrade EC manager on {node}"),
            StepSpec::EcManagerUpgrade(ManagerUpgradeInput {
                node_name: node.to_string(),
                target_version: "2.1.0".to_string(),
                license_id: "lic".to_string(),
                license_endpoint: "https://replicated.app".to_string(),
            }),
        )
    }

    fn extension_add_step() -> Step {
        Step::new(
            "Add extension redis",
            StepSpec::ExtensionAdd(crate::plan::ExtensionInput {
                repos: Vec::new(),
                chart: crate::plan::HelmChart {
                    name: "redis".to_string(),
                    chart_name: "bitnami/redis".to_string(),
                    version: "18.0.0".to_string(),
                    values: String::new(),
                    namespace: String::new(),
                    extra: std::collections::BTreeMap::new(),
                },
            }),
        )
    }

    /// Agent that reports `Running` before `send_text` returns, so the report
    /// lands ahead of the engine recording the dispatch.
    #[derive(Default)]
    struct EagerAgentSink {
        engine: std::sync::OnceLock<Arc<Engine>>,
        texts: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl crate::registry::AgentSink for EagerAgentSink {
        async fn send_text(&self, text: String) -> Result<()> {
            let message: crate::dispatch::Message = serde_json::from_str(&text)?;
            self.texts.lock().unwrap().push(text);
            if let Some(engine) = self.engine.get() {
                engine
                    .update_step(
                        &message.step.app_slug,
                        &message.step.version_label,
                        &message.step.step_id,
                        StepUpdate::new(StepStatus::Running).description("installing chart"),
                    )
                    .await?;
            }
            Ok(())
        }

        async fn send_ping(&self, _payload: Vec<u8>) -> Result<()> {
            Ok(())
        }

        async fn send_pong(&self, _payload: Vec<u8>) -> Result<()> {
            Ok(())
        }

        async fn close(&self) {}
    }

    fn plan_with(steps: Vec<Step>) -> Plan {
        Plan {
            id: "plan-1".to_string(),
            app_id: "app-1".to_string(),
            app_slug: "my-app".to_string(),
            version_label: "1.2.0".to_string(),
            update_cursor: "42".to_string(),
            channel_id: "stable".to_string(),
            current_ec_version: "2.0.0".to_string(),
            new_ec_version: "2.1.0".to_string(),
            created_at: chrono::Utc::now(),
            steps,
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        registry: Arc<Registry>,
        upgrader: Arc<FakeUpgrader>,
        engine: Arc<Engine>,
    }

    fn harness(upgrader: FakeUpgrader) -> Harness {
        let store = Arc::new(MemoryStore::with_apps([app()]));
        let registry = Arc::new(Registry::new(ProbeConfig::default()));
        let upgrader = Arc::new(upgrader);
        let engine = Arc::new(Engine::new(
            store.clone(),
            Arc::new(Dispatcher::new(registry.clone())),
            upgrader.clone(),
            EngineConfig::default(),
        ));
        Harness {
            store,
            registry,
            upgrader,
            engine,
        }
    }

    async fn stored(store: &MemoryStore) -> Plan {
        store.get_plan("app-1", "1.2.0").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_local_steps_run_in_order() {
        let h = harness(FakeUpgrader::default());
        let service = service_step();
        let plan = plan_with(vec![service.clone(), app_step(&service.id)]);
        h.store.upsert_plan(&plan).await.unwrap();

        h.engine.clone().execute(plan).await.unwrap();

        assert_eq!(
            h.upgrader.calls(),
            vec!["prepare", "upgrade /tmp/my-app-1.2.0"]
        );
        let done = stored(&h.store).await;
        assert!(done.has_ended());
        assert!(!done.has_failed());
        assert_eq!(
            done.steps[1].output.as_ref().map(StepOutput::to_value),
            Some(json!({ "sequence": 8 }))
        );
        assert!(!h.engine.is_running("app-1", "1.2.0"));
    }

    #[tokio::test]
    async fn test_resume_skips_complete_steps() {
        let h = harness(FakeUpgrader::default());
        let mut service = service_step();
        service.status = StepStatus::Complete;
        service.output = Some(StepOutput::AppUpgradeService(crate::plan::AppUpgradeServiceOutput {
            archive_path: "/tmp/prepared-before-restart".to_string(),
            base_sequence: 2,
            app_id: "app-1".to_string(),
            channel_id: "stable".to_string(),
            update_cursor: "42".to_string(),
        }));
        let plan = plan_with(vec![service.clone(), app_step(&service.id)]);
        h.store.upsert_plan(&plan).await.unwrap();

        let handle = h.engine.resume().await.unwrap().expect("plan resumed");
        handle.await.unwrap().unwrap();

        assert_eq!(
            h.upgrader.calls(),
            vec!["upgrade /tmp/prepared-before-restart"]
        );
    }

    #[tokio::test]
    async fn test_resume_ignores_ended_plan() {
        let h = harness(FakeUpgrader::default());
        let mut step = service_step();
        step.status = StepStatus::Complete;
        h.store.upsert_plan(&plan_with(vec![step])).await.unwrap();
        assert!(h.engine.resume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_step_halts_plan() {
        let h = harness(FakeUpgrader::default());
        let mut s1 = service_step();
        s1.status = StepStatus::Complete;
        let mut s2 = cluster_step();
        s2.status = StepStatus::Failed;
        s2.status_description = "k0s upgrade failed".to_string();
        let s3 = app_step(&s1.id);
        let s2_id = s2.id.clone();
        let plan = plan_with(vec![s1, s2, s3]);
        h.store.upsert_plan(&plan).await.unwrap();

        let err = h.engine.clone().execute(plan).await.unwrap_err();
        assert!(err.to_string().contains(&s2_id));
        assert!(matches!(
            find_upgrade_error(&err),
            Some(UpgradeError::StepFailed { step_id, .. }) if *step_id == s2_id
        ));
        assert!(h.upgrader.calls().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_marks_step_failed() {
        let h = harness(FakeUpgrader {
            fail_prepare: true,
            ..FakeUpgrader::default()
        });
        let service = service_step();
        let plan = plan_with(vec![service.clone(), app_step(&service.id)]);
        h.store.upsert_plan(&plan).await.unwrap();

        let err = h.engine.clone().execute(plan).await.unwrap_err();
        assert!(format!("{err:#}").contains("registry unreachable"));

        let saved = stored(&h.store).await;
        assert_eq!(saved.steps[0].status, StepStatus::Failed);
        assert!(saved.steps[0].status_description.contains("registry unreachable"));
        assert_eq!(saved.steps[1].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_dispatch_error_becomes_step_failure() {
        let h = harness(FakeUpgrader::default());
        let plan = plan_with(vec![cluster_step()]);
        h.store.upsert_plan(&plan).await.unwrap();

        let err = h.engine.clone().execute(plan).await.unwrap_err();
        assert!(matches!(
            find_upgrade_error(&err),
            Some(UpgradeError::NoConnectedAgent)
        ));
        let saved = stored(&h.store).await;
        assert_eq!(saved.steps[0].status, StepStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_step_completes_via_status_report() {
        let h = harness(FakeUpgrader::default());
        let sink = Arc::new(RecordingSink::default());
        h.registry.register("node-1", "2.0.0", sink.clone()).await;

        let step = cluster_step();
        let step_id = step.id.clone();
        let plan = plan_with(vec![step]);
        h.store.upsert_plan(&plan).await.unwrap();

        let handle = h.engine.spawn(plan);

        // Wait until the command is out, then report completion as the agent would.
        while sink.texts().is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let running = stored(&h.store).await;
        assert_eq!(running.steps[0].status, StepStatus::Starting);
        assert_eq!(running.steps[0].owner_host.as_deref(), Some("node-1"));

        h.engine
            .update_step(
                "my-app",
                "1.2.0",
                &step_id,
                StepUpdate::new(StepStatus::Complete).description("cluster upgraded"),
            )
            .await
            .unwrap();

        handle.await.unwrap().unwrap();
        let message: crate::dispatch::Message = serde_json::from_str(&sink.texts()[0]).unwrap();
        assert_eq!(message.command, crate::dispatch::Command::UpgradeCluster);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_before_dispatch_record_keeps_plan_going() {
        let h = harness(FakeUpgrader::default());
        let sink = Arc::new(EagerAgentSink::default());
        assert!(sink.engine.set(h.engine.clone()).is_ok());
        h.registry.register("node-1", "2.0.0", sink.clone()).await;

        let step = extension_add_step();
        let step_id = step.id.clone();
        let plan = plan_with(vec![step]);
        h.store.upsert_plan(&plan).await.unwrap();

        let handle = h.engine.spawn(plan);

        while sink.texts.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // Let the engine attempt to record the dispatch after the agent's report.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let running = stored(&h.store).await;
        assert_eq!(running.steps[0].status, StepStatus::Running);
        assert_eq!(running.steps[0].status_description, "installing chart");
        assert!(h.engine.is_running("app-1", "1.2.0"));

        h.engine
            .update_step(
                "my-app",
                "1.2.0",
                &step_id,
                StepUpdate::new(StepStatus::Complete).description("chart installed"),
            )
            .await
            .unwrap();
        handle.await.unwrap().unwrap();

        let done = stored(&h.store).await;
        assert_eq!(done.steps[0].status, StepStatus::Complete);
        assert!(!done.has_failed());

        let texts = sink.texts.lock().unwrap().clone();
        assert_eq!(texts.len(), 1);
        let message: crate::dispatch::Message = serde_json::from_str(&texts[0]).unwrap();
        assert_eq!(message.command, crate::dispatch::Command::AddExtension);
        let data: crate::dispatch::ExtensionData = serde_json::from_str(&message.data).unwrap();
        assert_eq!(data.chart.name, "redis");
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_step_already_current_completes() {
        let h = harness(FakeUpgrader::default());
        let sink = Arc::new(RecordingSink::default());
        h.registry.register("node-1", "2.1.0", sink.clone()).await;

        let plan = plan_with(vec![manager_step("node-1")]);
        h.store.upsert_plan(&plan).await.unwrap();
        h.engine.clone().execute(plan).await.unwrap();

        assert!(sink.texts().is_empty());
        let saved = stored(&h.store).await;
        assert_eq!(saved.steps[0].status, StepStatus::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_step_times_out_without_reconnect() {
        let h = harness(FakeUpgrader::default());
        h.registry
            .register("node-1", "2.0.0", Arc::new(RecordingSink::default()))
            .await;

        let plan = plan_with(vec![manager_step("node-1")]);
        h.store.upsert_plan(&plan).await.unwrap();

        let err = h.engine.clone().execute(plan).await.unwrap_err();
        let found = find_upgrade_error(&err).unwrap();
        assert!(found.is_timeout());
        assert_eq!(stored(&h.store).await.steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_update_step_rejects_backwards_transition() {
        let h = harness(FakeUpgrader::default());
        let mut step = cluster_step();
        step.status = StepStatus::Running;
        let step_id = step.id.clone();
        h.store.upsert_plan(&plan_with(vec![step])).await.unwrap();

        let err = h
            .engine
            .update_step(
                "my-app",
                "1.2.0",
                &step_id,
                StepUpdate::new(StepStatus::Pending),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            find_upgrade_error(&err),
            Some(UpgradeError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_step_parses_output_by_type() {
        let h = harness(FakeUpgrader::default());
        let step = service_step();
        let step_id = step.id.clone();
        h.store.upsert_plan(&plan_with(vec![step])).await.unwrap();

        let err = h
            .engine
            .update_step(
                "my-app",
                "1.2.0",
                &step_id,
                StepUpdate::new(StepStatus::Complete).output(json!({ "unexpected": 1 })),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid output"));
        assert_eq!(stored(&h.store).await.steps[0].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_update_step_unknown_targets() {
        let h = harness(FakeUpgrader::default());
        h.store
            .upsert_plan(&plan_with(vec![service_step()]))
            .await
            .unwrap();

        let missing_app = h
            .engine
            .update_step("other", "1.2.0", "s", StepUpdate::new(StepStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(
            find_upgrade_error(&missing_app),
            Some(UpgradeError::AppNotFound(_))
        ));

        let missing_step = h
            .engine
            .update_step("my-app", "1.2.0", "nope", StepUpdate::new(StepStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(
            find_upgrade_error(&missing_step),
            Some(UpgradeError::StepNotFound(_))
        ));
    }
}
