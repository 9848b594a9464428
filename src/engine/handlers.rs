//! Per-type step handlers.

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use super::{Engine, Snapshot, StepUpdate};
use crate::cluster;
use crate::dispatch::{Command, ManagerDispatch, StepRef};
use crate::error::{UpgradeError, find_upgrade_error};
use crate::plan::{
    AppUpgradeInput, AppUpgradeServiceInput, ClusterUpgradeInput, ExtensionInput,
    ManagerUpgradeInput, ManagerUpgradeOutput, Plan, Step, StepSpec, StepStatus,
};

impl Engine {
    pub(super) async fn execute_step(
        &self,
        plan: &Plan,
        step: &Step,
        rx: &mut Snapshot,
    ) -> Result<()> {
        match &step.spec {
            StepSpec::AppUpgradeService(input) => {
                self.run_app_upgrade_service(plan, step, input).await
            }
            StepSpec::AppUpgrade(input) => self.run_app_upgrade(plan, step, input).await,
            StepSpec::EcManagerUpgrade(input) => {
                self.run_manager_upgrade(plan, step, input, rx).await
            }
            StepSpec::EmbeddedClusterUpgrade(input) => {
                self.run_cluster_upgrade(plan, step, input, rx).await
            }
            StepSpec::ExtensionAdd(input) => {
                self.run_extension(plan, step, Command::AddExtension, input, rx)
                    .await
            }
            StepSpec::ExtensionUpgrade(input) => {
                self.run_extension(plan, step, Command::UpgradeExtension, input, rx)
                    .await
            }
            StepSpec::ExtensionRemove(input) => {
                self.run_extension(plan, step, Command::RemoveExtension, input, rx)
                    .await
            }
        }
    }

    async fn set_step(&self, plan: &Plan, step: &Step, update: StepUpdate) -> Result<Plan> {
        self.update_step(&plan.app_slug, &plan.version_label, &step.id, update)
            .await
    }

    /// Record that a command went out. The agent may already have reported
    /// progress past `Starting`, in which case its report stands.
    async fn mark_dispatched(
        &self,
        plan: &Plan,
        step: &Step,
        command: Command,
        node: &str,
    ) -> Result<()> {
        let update = StepUpdate::new(StepStatus::Starting)
            .description(format!("{command} sent to {node}"))
            .owner_host(node);
        match self.set_step(plan, step, update).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(find_upgrade_error(&e), Some(UpgradeError::InvalidTransition { .. })) => {
                debug!(step = %step.name, node, "Agent reported before dispatch was recorded");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_app_upgrade_service(
        &self,
        plan: &Plan,
        step: &Step,
        input: &AppUpgradeServiceInput,
    ) -> Result<()> {
        self.set_step(
            plan,
            step,
            StepUpdate::new(StepStatus::Running).description("Preparing application archive"),
        )
        .await?;

        let output = self
            .upgrader
            .prepare(input)
            .await
            .context("Failed to prepare application archive")?;

        let update = StepUpdate::new(StepStatus::Complete)
            .description(format!("Archive ready at {}", output.archive_path))
            .output(serde_json::to_value(&output)?);
        self.set_step(plan, step, update).await?;
        Ok(())
    }

    async fn run_app_upgrade(&self, plan: &Plan, step: &Step, input: &AppUpgradeInput) -> Result<()> {
        let prepared = plan
            .require_step(&input.service_step_id)?
            .output
            .as_ref()
            .and_then(|o| o.as_service_output())
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "step {} has no prepared archive",
                    input.service_step_id
                )
            })?;

        self.set_step(
            plan,
            step,
            StepUpdate::new(StepStatus::Running)
                .description(format!("Deploying {}", input.version_label)),
        )
        .await?;

        let output = self
            .upgrader
            .upgrade(input, &prepared)
            .await
            .context("Failed to deploy application")?;

        let update = StepUpdate::new(StepStatus::Complete)
            .description(format!("{} deployed", input.version_label))
            .output(serde_json::to_value(&output)?);
        self.set_step(plan, step, update).await?;
        Ok(())
    }

    async fn run_manager_upgrade(
        &self,
        plan: &Plan,
        step: &Step,
        input: &ManagerUpgradeInput,
        rx: &mut Snapshot,
    ) -> Result<()> {
        if step.status == StepStatus::Pending {
            let step_ref = StepRef::new(&plan.app_slug, &plan.version_label, &step.id);
            let dispatched = self
                .dispatcher
                .upgrade_manager(
                    &step_ref,
                    &input.node_name,
                    &input.license_id,
                    &input.license_endpoint,
                    &input.target_version,
                )
                .await
                .context("Failed to dispatch upgradeManager")?;

            if dispatched == ManagerDispatch::Sent {
                self.mark_dispatched(plan, step, Command::UpgradeManager, &input.node_name)
                    .await?;
            }
        }

        self.wait_for_ec_manager_to_connect(rx, &step.id, &input.node_name, &input.target_version)
            .await?;

        let output = ManagerUpgradeOutput {
            version: input.target_version.clone(),
        };
        let update = StepUpdate::new(StepStatus::Complete)
            .description(format!(
                "EC manager on {} running {}",
                input.node_name, input.target_version
            ))
            .owner_host(&input.node_name)
            .output(serde_json::to_value(&output)?);
        self.set_step(plan, step, update).await?;
        Ok(())
    }

    async fn run_cluster_upgrade(
        &self,
        plan: &Plan,
        step: &Step,
        input: &ClusterUpgradeInput,
        rx: &mut Snapshot,
    ) -> Result<()> {
        if step.status == StepStatus::Pending {
            let step_ref = StepRef::new(&plan.app_slug, &plan.version_label, &step.id);
            let installation = cluster::next_installation(
                &input.current_installation,
                &input.new_config_spec,
                chrono::Utc::now(),
            );
            let node = self
                .dispatcher
                .upgrade_cluster(&step_ref, &installation)
                .await
                .context("Failed to dispatch upgradeCluster")?;
            self.mark_dispatched(plan, step, Command::UpgradeCluster, &node)
                .await?;
        }

        self.wait_for_step(rx, &step.id, self.config.remote_step_timeout)
            .await
    }

    async fn run_extension(
        &self,
        plan: &Plan,
        step: &Step,
        command: Command,
        input: &ExtensionInput,
        rx: &mut Snapshot,
    ) -> Result<()> {
        if step.status == StepStatus::Pending {
            let step_ref = StepRef::new(&plan.app_slug, &plan.version_label, &step.id);
            let node = self
                .dispatcher
                .extension(&step_ref, command, &input.repos, &input.chart)
                .await
                .with_context(|| format!("Failed to dispatch {command}"))?;
            self.mark_dispatched(plan, step, command, &node).await?;
        }

        self.wait_for_step(rx, &step.id, self.config.remote_step_timeout)
            .await
    }
}
