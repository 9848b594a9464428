//! Plan builder.
//!
//! Reads app, cluster and release facts and returns a fully formed plan that
//! has not started. `plan_upgrade` writes nothing. `create_plan` also persists
//! the plan, and at most one `create_plan` runs at a time so two requests
//! cannot both pass the active-plan check.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use crate::cluster::{self, ClusterInspector, ReleaseResolver, TargetRelease};
use crate::error::UpgradeError;
use crate::plan::{
    AppUpgradeInput, AppUpgradeServiceInput, ClusterUpgradeInput, ExtensionInput, HelmExtensions,
    HelmRepository, ManagerUpgradeInput, Plan, Step, StepSpec, diff_extensions,
};
use crate::registry::Registry;
use crate::store::{InstalledApp, License, Store};

/// Facts about the running embedded cluster, gathered once per plan.
struct ClusterFacts {
    installation: Value,
    current_version: String,
    nodes: Vec<String>,
}

pub struct PlanBuilder {
    store: Arc<dyn Store>,
    resolver: Arc<dyn ReleaseResolver>,
    cluster: Option<Arc<dyn ClusterInspector>>,
    registry: Arc<Registry>,
    /// Held from the active-plan check until the new plan is saved.
    planning: tokio::sync::Mutex<()>,
}

impl PlanBuilder {
    /// `cluster` is `None` when the app does not run on an embedded cluster.
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<dyn ReleaseResolver>,
        cluster: Option<Arc<dyn ClusterInspector>>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            store,
            resolver,
            cluster,
            registry,
            planning: tokio::sync::Mutex::new(()),
        }
    }

    /// Build a plan and save it as the app's current plan.
    pub async fn create_plan(
        &self,
        app: &InstalledApp,
        version_label: &str,
        update_cursor: &str,
        channel_id: &str,
    ) -> Result<Plan> {
        let _guard = self.planning.lock().await;
        let plan = self
            .plan_upgrade(app, version_label, update_cursor, channel_id)
            .await?;
        self.store
            .upsert_plan(&plan)
            .await
            .context("Failed to save plan")?;
        Ok(plan)
    }

    /// Compute the steps needed to move `app` to `version_label`.
    pub async fn plan_upgrade(
        &self,
        app: &InstalledApp,
        version_label: &str,
        update_cursor: &str,
        channel_id: &str,
    ) -> Result<Plan> {
        if let Some(current) = self
            .store
            .get_current_plan(&app.id)
            .await
            .context("Failed to load current plan")?
            && !current.has_ended()
        {
            return Err(UpgradeError::PlanInProgress {
                app: app.slug.clone(),
                version_label: current.version_label,
            }
            .into());
        }

        let license = app
            .license
            .as_ref()
            .ok_or_else(|| UpgradeError::MissingLicense(app.slug.clone()))?;

        let facts = match &self.cluster {
            Some(inspector) => Some(gather_cluster_facts(inspector.as_ref()).await?),
            None => None,
        };

        let release = match &facts {
            Some(_) => Some(
                self.resolver
                    .resolve(app, version_label, update_cursor, channel_id)
                    .await
                    .context("Failed to resolve target release")?,
            ),
            None => None,
        };

        let current_ec_version = facts
            .as_ref()
            .map(|f| f.current_version.clone())
            .unwrap_or_default();
        let new_ec_version = release
            .as_ref()
            .map_or_else(|| current_ec_version.clone(), |r| r.ec_version.clone());

        let mut steps = Vec::new();

        let service_step = Step::new(
            format!("Prepare {} {version_label}", app.slug),
            StepSpec::AppUpgradeService(AppUpgradeServiceInput {
                app_id: app.id.clone(),
                app_slug: app.slug.clone(),
                version_label: version_label.to_string(),
                update_cursor: update_cursor.to_string(),
                channel_id: channel_id.to_string(),
                is_airgap: app.is_airgap,
                ec_version: new_ec_version.clone(),
            }),
        );
        let service_step_id = service_step.id.clone();
        steps.push(service_step);

        if let (Some(facts), Some(release)) = (&facts, &release) {
            let new_config_spec = new_config_spec(facts, release);
            let current_extensions = HelmExtensions::from_object(&facts.installation)
                .map_err(|e| UpgradeError::invalid_extensions("current installation", e))?;
            let new_extensions = HelmExtensions::from_config_spec(&new_config_spec)
                .map_err(|e| UpgradeError::invalid_extensions("target release config", e))?;

            if release.ec_version != facts.current_version {
                steps.extend(self.plan_ec_managers_upgrade(
                    &facts.nodes,
                    &release.ec_version,
                    license,
                ));
                steps.push(Step::new(
                    format!("Upgrade embedded cluster to {}", release.ec_version),
                    StepSpec::EmbeddedClusterUpgrade(ClusterUpgradeInput {
                        current_installation: facts.installation.clone(),
                        new_config_spec: new_config_spec.clone(),
                        is_disaster_recovery_supported: license.is_disaster_recovery_supported,
                        new_ec_version: release.ec_version.clone(),
                    }),
                ));
            }

            steps.extend(plan_extension_steps(&current_extensions, &new_extensions));
        }

        steps.push(Step::new(
            format!("Upgrade {} to {version_label}", app.slug),
            StepSpec::AppUpgrade(AppUpgradeInput {
                app_id: app.id.clone(),
                app_slug: app.slug.clone(),
                version_label: version_label.to_string(),
                service_step_id,
            }),
        ));

        let plan = Plan {
            id: uuid::Uuid::new_v4().to_string(),
            app_id: app.id.clone(),
            app_slug: app.slug.clone(),
            version_label: version_label.to_string(),
            update_cursor: update_cursor.to_string(),
            channel_id: channel_id.to_string(),
            current_ec_version,
            new_ec_version,
            created_at: Utc::now(),
            steps,
        };

        info!(
            app = %plan.app_slug,
            version_label = %plan.version_label,
            steps = plan.steps.len(),
            cluster_upgrade = plan.needs_cluster_upgrade(),
            "Built upgrade plan"
        );
        Ok(plan)
    }

    /// One `ec-manager-upgrade` step per node whose manager is not at `target_version`.
    ///
    /// Nodes with no connected manager are treated as behind; their steps fail at
    /// dispatch time unless the manager connects first.
    pub fn plan_ec_managers_upgrade(
        &self,
        nodes: &[String],
        target_version: &str,
        license: &License,
    ) -> Vec<Step> {
        nodes
            .iter()
            .filter(|node| {
                let current = self.registry.node_version(node);
                if current.as_deref() == Some(target_version) {
                    debug!(node = %node, version = target_version, "EC manager already at target");
                    return false;
                }
                true
            })
            .map(|node| {
                Step::new(
                    format!("Upgrade EC manager on {node}"),
                    StepSpec::EcManagerUpgrade(ManagerUpgradeInput {
                        node_name: node.clone(),
                        target_version: target_version.to_string(),
                        license_id: license.id.clone(),
                        license_endpoint: license.endpoint.clone(),
                    }),
                )
            })
            .collect()
    }
}

async fn gather_cluster_facts(inspector: &dyn ClusterInspector) -> Result<ClusterFacts> {
    let installation = inspector
        .current_installation()
        .await
        .context("Failed to read current installation")?;
    let current_version = cluster::installation_version(&installation).ok_or_else(|| {
        UpgradeError::VersionResolution("current installation has no version".to_string())
    })?;
    let nodes = inspector
        .node_names()
        .await
        .context("Failed to list cluster nodes")?;
    Ok(ClusterFacts {
        installation,
        current_version,
        nodes,
    })
}

/// Config spec the cluster should run after the upgrade.
///
/// Falls back to the current config when the release ships none. The version
/// field always carries the target version.
fn new_config_spec(facts: &ClusterFacts, release: &TargetRelease) -> Value {
    let mut spec = release
        .cluster_config
        .clone()
        .unwrap_or_else(|| cluster::installation_config(&facts.installation));
    if let Value::Object(map) = &mut spec {
        map.insert(
            "version".to_string(),
            Value::String(release.ec_version.clone()),
        );
    }
    spec
}

/// One step per added, modified and removed chart, in that order.
fn plan_extension_steps(current: &HelmExtensions, new: &HelmExtensions) -> Vec<Step> {
    let diff = diff_extensions(&current.charts, &new.charts);
    let with_repos = |repos: &[HelmRepository], chart| ExtensionInput {
        repos: repos.to_vec(),
        chart,
    };

    let mut steps = Vec::new();
    for chart in diff.added {
        steps.push(Step::new(
            format!("Add extension {}", chart.name),
            StepSpec::ExtensionAdd(with_repos(&new.repositories, chart)),
        ));
    }
    for chart in diff.modified {
        steps.push(Step::new(
            format!("Upgrade extension {}", chart.name),
            StepSpec::ExtensionUpgrade(with_repos(&new.repositories, chart)),
        ));
    }
    for chart in diff.removed {
        steps.push(Step::new(
            format!("Remove extension {}", chart.name),
            StepSpec::ExtensionRemove(with_repos(&current.repositories, chart)),
        ));
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::find_upgrade_error;
    use crate::plan::{StepOwner, StepStatus, StepType};
    use crate::registry::ProbeConfig;
    use crate::registry::testing::RecordingSink;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct FixedRelease(TargetRelease);

    /// Resolver that takes a while, so concurrent plan requests overlap.
    struct SlowRelease(TargetRelease);

    #[async_trait]
    impl ReleaseResolver for SlowRelease {
        async fn resolve(
            &self,
            _app: &InstalledApp,
            _version_label: &str,
            _update_cursor: &str,
            _channel_id: &str,
        ) -> Result<TargetRelease> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(self.0.clone())
        }
    }

    #[async_trait]
    impl ReleaseResolver for FixedRelease {
        async fn resolve(
            &self,
            _app: &InstalledApp,
            _version_label: &str,
            _update_cursor: &str,
            _channel_id: &str,
        ) -> Result<TargetRelease> {
            Ok(self.0.clone())
        }
    }

    struct FakeCluster {
        installation: Value,
        nodes: Vec<String>,
    }

    #[async_trait]
    impl ClusterInspector for FakeCluster {
        async fn current_installation(&self) -> Result<Value> {
            Ok(self.installation.clone())
        }

        async fn node_names(&self) -> Result<Vec<String>> {
            Ok(self.nodes.clone())
        }
    }

    fn license() -> License {
        License {
            id: "lic-1".to_string(),
            endpoint: "https://replicated.app".to_string(),
            is_disaster_recovery_supported: true,
        }
    }

    fn app() -> InstalledApp {
        InstalledApp {
            id: "app-1".to_string(),
            slug: "my-app".to_string(),
            name: "My App".to_string(),
            is_airgap: false,
            license: Some(license()),
        }
    }

    fn installation(version: &str, charts: Value) -> Value {
        json!({
            "metadata": { "name": "20260101000000" },
            "spec": {
                "config": {
                    "version": version,
                    "extensions": { "helm": { "repositories": [], "charts": charts } }
                }
            }
        })
    }

    fn builder(
        store: Arc<MemoryStore>,
        registry: Arc<Registry>,
        installation: Value,
        release: TargetRelease,
    ) -> PlanBuilder {
        PlanBuilder::new(
            store,
            Arc::new(FixedRelease(release)),
            Some(Arc::new(FakeCluster {
                installation,
                nodes: vec!["node-1".to_string(), "node-2".to_string()],
            })),
            registry,
        )
    }

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new(ProbeConfig::default()))
    }

    fn types(plan: &Plan) -> Vec<StepType> {
        plan.steps.iter().map(Step::step_type).collect()
    }

    #[tokio::test]
    async fn test_plan_with_cluster_upgrade() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry();
        registry
            .register("node-1", "2.0.0", Arc::new(RecordingSink::default()))
            .await;
        registry
            .register("node-2", "2.1.0", Arc::new(RecordingSink::default()))
            .await;

        let release = TargetRelease {
            ec_version: "2.1.0".to_string(),
            cluster_config: None,
        };
        let plan = builder(store, registry, installation("2.0.0", json!([])), release)
            .plan_upgrade(&app(), "1.2.0", "42", "stable")
            .await
            .unwrap();

        assert_eq!(
            types(&plan),
            vec![
                StepType::AppUpgradeService,
                StepType::EcManagerUpgrade,
                StepType::EmbeddedClusterUpgrade,
                StepType::AppUpgrade,
            ]
        );
        assert_eq!(plan.current_ec_version, "2.0.0");
        assert_eq!(plan.new_ec_version, "2.1.0");
        assert!(plan.steps.iter().all(|s| s.status == StepStatus::Pending));

        match &plan.steps[1].spec {
            StepSpec::EcManagerUpgrade(input) => assert_eq!(input.node_name, "node-1"),
            other => panic!("unexpected spec: {other:?}"),
        }
        match &plan.steps[2].spec {
            StepSpec::EmbeddedClusterUpgrade(input) => {
                assert!(input.is_disaster_recovery_supported);
                assert_eq!(input.new_config_spec["version"], "2.1.0");
                assert_eq!(input.current_installation["spec"]["config"]["version"], "2.0.0");
            }
            other => panic!("unexpected spec: {other:?}"),
        }
        match &plan.steps[3].spec {
            StepSpec::AppUpgrade(input) => assert_eq!(input.service_step_id, plan.steps[0].id),
            other => panic!("unexpected spec: {other:?}"),
        }
        assert_eq!(plan.steps[3].owner, StepOwner::ControlPlane);
    }

    #[tokio::test]
    async fn test_same_ec_version_plans_app_only() {
        let store = Arc::new(MemoryStore::new());
        let release = TargetRelease {
            ec_version: "2.0.0".to_string(),
            cluster_config: None,
        };
        let plan = builder(store, registry(), installation("2.0.0", json!([])), release)
            .plan_upgrade(&app(), "1.2.0", "42", "stable")
            .await
            .unwrap();
        assert_eq!(
            types(&plan),
            vec![StepType::AppUpgradeService, StepType::AppUpgrade]
        );
        assert!(!plan.needs_cluster_upgrade());
    }

    #[tokio::test]
    async fn test_extension_steps_follow_diff() {
        let store = Arc::new(MemoryStore::new());
        let current = json!([
            { "name": "A", "chartname": "repo/a", "version": "1" },
            { "name": "B", "chartname": "repo/b", "version": "1" },
            { "name": "C", "chartname": "repo/c", "version": "1" }
        ]);
        let release = TargetRelease {
            ec_version: "2.1.0".to_string(),
            cluster_config: Some(json!({
                "extensions": { "helm": { "charts": [
                    { "name": "A", "chartname": "repo/a", "version": "1" },
                    { "name": "B", "chartname": "repo/b", "version": "2" },
                    { "name": "D", "chartname": "repo/d", "version": "1" }
                ] } }
            })),
        };
        let registry = registry();
        for node in ["node-1", "node-2"] {
            registry
                .register(node, "2.1.0", Arc::new(RecordingSink::default()))
                .await;
        }
        let plan = builder(store, registry, installation("2.0.0", current), release)
            .plan_upgrade(&app(), "1.2.0", "42", "stable")
            .await
            .unwrap();

        assert_eq!(
            types(&plan),
            vec![
                StepType::AppUpgradeService,
                StepType::EmbeddedClusterUpgrade,
                StepType::ExtensionAdd,
                StepType::ExtensionUpgrade,
                StepType::ExtensionRemove,
                StepType::AppUpgrade,
            ]
        );
        let names: Vec<&str> = plan.steps[2..5].iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Add extension D", "Upgrade extension B", "Remove extension C"]
        );
    }

    #[tokio::test]
    async fn test_unquoted_version_only_upgrades_that_chart() {
        let current = json!([
            { "name": "A", "chartname": "repo/a", "version": "1" },
            { "name": "B", "chartname": "repo/b", "version": "1" }
        ]);
        let release = TargetRelease {
            ec_version: "2.0.0".to_string(),
            cluster_config: Some(json!({
                "extensions": { "helm": { "charts": [
                    { "name": "A", "chartname": "repo/a", "version": "1" },
                    { "name": "B", "chartname": "repo/b", "version": 2 }
                ] } }
            })),
        };
        let plan = builder(
            Arc::new(MemoryStore::new()),
            registry(),
            installation("2.0.0", current),
            release,
        )
        .plan_upgrade(&app(), "1.2.0", "42", "stable")
        .await
        .unwrap();

        assert_eq!(
            types(&plan),
            vec![
                StepType::AppUpgradeService,
                StepType::ExtensionUpgrade,
                StepType::AppUpgrade,
            ]
        );
        match &plan.steps[1].spec {
            StepSpec::ExtensionUpgrade(input) => {
                assert_eq!(input.chart.name, "B");
                assert_eq!(input.chart.version, "2");
            }
            other => panic!("unexpected spec: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_extensions_fail_the_plan() {
        let current = json!([{ "name": "A", "chartname": "repo/a", "version": "1" }]);
        let release = TargetRelease {
            ec_version: "2.0.0".to_string(),
            cluster_config: Some(json!({
                "extensions": { "helm": { "charts": { "name": "A" } } }
            })),
        };
        let err = builder(
            Arc::new(MemoryStore::new()),
            registry(),
            installation("2.0.0", current),
            release,
        )
        .plan_upgrade(&app(), "1.2.0", "42", "stable")
        .await
        .unwrap_err();
        assert!(matches!(
            find_upgrade_error(&err),
            Some(UpgradeError::InvalidExtensions { origin, .. }) if origin == "target release config"
        ));

        let broken_installation = json!({
            "spec": { "config": { "version": "2.0.0", "extensions": { "helm": { "charts": [{ "version": "1" }] } } } }
        });
        let release = TargetRelease {
            ec_version: "2.0.0".to_string(),
            cluster_config: None,
        };
        let err = builder(
            Arc::new(MemoryStore::new()),
            registry(),
            broken_installation,
            release,
        )
        .plan_upgrade(&app(), "1.2.0", "42", "stable")
        .await
        .unwrap_err();
        assert!(matches!(
            find_upgrade_error(&err),
            Some(UpgradeError::InvalidExtensions { origin, .. }) if origin == "current installation"
        ));
    }

    #[tokio::test]
    async fn test_skip_if_current() {
        let registry = registry();
        registry
            .register("node-1", "2.1.0", Arc::new(RecordingSink::default()))
            .await;
        registry
            .register("node-2", "2.0.0", Arc::new(RecordingSink::default()))
            .await;
        let builder = PlanBuilder::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FixedRelease(TargetRelease {
                ec_version: "2.1.0".to_string(),
                cluster_config: None,
            })),
            None,
            registry,
        );

        let nodes = vec![
            "node-1".to_string(),
            "node-2".to_string(),
            "node-3".to_string(),
        ];
        let steps = builder.plan_ec_managers_upgrade(&nodes, "2.1.0", &license());
        let planned: Vec<String> = steps
            .iter()
            .map(|s| match &s.spec {
                StepSpec::EcManagerUpgrade(input) => input.node_name.clone(),
                other => panic!("unexpected spec: {other:?}"),
            })
            .collect();
        assert_eq!(planned, vec!["node-2", "node-3"]);

        let all_current = builder.plan_ec_managers_upgrade(&nodes[..1], "2.1.0", &license());
        assert!(all_current.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_active_plan() {
        let store = Arc::new(MemoryStore::new());
        let release = TargetRelease {
            ec_version: "2.0.0".to_string(),
            cluster_config: None,
        };
        let builder = builder(
            store.clone(),
            registry(),
            installation("2.0.0", json!([])),
            release,
        );
        let first = builder
            .plan_upgrade(&app(), "1.2.0", "42", "stable")
            .await
            .unwrap();
        store.upsert_plan(&first).await.unwrap();

        let err = builder
            .plan_upgrade(&app(), "1.3.0", "43", "stable")
            .await
            .unwrap_err();
        assert!(matches!(
            find_upgrade_error(&err),
            Some(UpgradeError::PlanInProgress { version_label, .. }) if version_label == "1.2.0"
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_create_plan_admits_one() {
        let store = Arc::new(MemoryStore::new());
        let builder = Arc::new(PlanBuilder::new(
            store.clone(),
            Arc::new(SlowRelease(TargetRelease {
                ec_version: "2.0.0".to_string(),
                cluster_config: None,
            })),
            Some(Arc::new(FakeCluster {
                installation: installation("2.0.0", json!([])),
                nodes: vec!["node-1".to_string()],
            })),
            registry(),
        ));

        let first = tokio::spawn({
            let builder = builder.clone();
            async move { builder.create_plan(&app(), "1.2.0", "42", "stable").await }
        });
        let second = tokio::spawn({
            let builder = builder.clone();
            async move { builder.create_plan(&app(), "1.3.0", "43", "stable").await }
        });
        let (first, second) = tokio::join!(first, second);
        let results = [first.unwrap(), second.unwrap()];

        let created: Vec<&Plan> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(created.len(), 1);
        let rejected = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(matches!(
            find_upgrade_error(rejected),
            Some(UpgradeError::PlanInProgress { .. })
        ));

        let current = store.get_current_plan("app-1").await.unwrap().unwrap();
        assert_eq!(current.id, created[0].id);
    }

    #[tokio::test]
    async fn test_rejects_missing_license() {
        let builder = PlanBuilder::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FixedRelease(TargetRelease {
                ec_version: "2.0.0".to_string(),
                cluster_config: None,
            })),
            None,
            registry(),
        );
        let mut unlicensed = app();
        unlicensed.license = None;
        let err = builder
            .plan_upgrade(&unlicensed, "1.2.0", "42", "stable")
            .await
            .unwrap_err();
        assert!(matches!(
            find_upgrade_error(&err),
            Some(UpgradeError::MissingLicense(_))
        ));
    }

    #[test]
    fn test_new_config_spec_falls_back_to_current() {
        let facts = ClusterFacts {
            installation: installation("2.0.0", json!([{ "name": "A", "chartname": "repo/a" }])),
            current_version: "2.0.0".to_string(),
            nodes: Vec::new(),
        };
        let release = TargetRelease {
            ec_version: "2.1.0".to_string(),
            cluster_config: None,
        };
        let spec = new_config_spec(&facts, &release);
        assert_eq!(spec["version"], "2.1.0");
        assert_eq!(spec["extensions"]["helm"]["charts"][0]["name"], "A");
    }
}
