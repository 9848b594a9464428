//! Command dispatch to EC managers.
//!
//! Commands are fire-and-forget: a successful write only means the agent was
//! told. Completion is observed through the plan store.

pub mod message;

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::UpgradeError;
use crate::metrics::Metrics;
use crate::plan::{HelmChart, HelmRepository};
use crate::registry::{ConnectionEntry, Registry};

pub use message::{
    Command, ExtensionData, Message, StepRef, UpgradeClusterData, UpgradeManagerData,
};

/// Result of an `upgradeManager` dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerDispatch {
    /// The node already reports the target version; nothing was sent.
    AlreadyCurrent,
    Sent,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    metrics: Option<Arc<Metrics>>,
}

impl Dispatcher {
    pub const fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    async fn send(
        &self,
        node_name: &str,
        entry: &ConnectionEntry,
        message: &Message,
    ) -> Result<(), UpgradeError> {
        let text = serde_json::to_string(message)
            .map_err(|e| UpgradeError::write_failed(node_name, e))?;

        let result = entry
            .sink
            .send_text(text)
            .await
            .map_err(|e| UpgradeError::write_failed(node_name, e));

        if let Some(metrics) = &self.metrics {
            metrics.record_command(message.command, result.is_ok());
        }

        match &result {
            Ok(()) => info!(
                node = node_name,
                command = %message.command,
                step = %message.step.step_id,
                "Sent command to EC manager"
            ),
            Err(e) => warn!(
                node = node_name,
                command = %message.command,
                error = %e,
                "Failed to send command to EC manager"
            ),
        }
        result
    }

    fn encode<T: serde::Serialize>(
        node_name: &str,
        step: &StepRef,
        command: Command,
        data: &T,
    ) -> Result<Message, UpgradeError> {
        Message::new(step, command, data).map_err(|e| UpgradeError::write_failed(node_name, e))
    }

    /// Tell the manager on `node_name` to upgrade itself.
    ///
    /// Sends nothing when the node already reports `target_version`.
    pub async fn upgrade_manager(
        &self,
        step: &StepRef,
        node_name: &str,
        license_id: &str,
        license_endpoint: &str,
        target_version: &str,
    ) -> Result<ManagerDispatch, UpgradeError> {
        let entry = self.registry.client_for_node(node_name)?;
        if entry.version == target_version {
            info!(
                node = node_name,
                version = target_version,
                "EC manager already at target version"
            );
            return Ok(ManagerDispatch::AlreadyCurrent);
        }

        let data = UpgradeManagerData {
            license_id: license_id.to_string(),
            license_endpoint: license_endpoint.to_string(),
        };
        let message = Self::encode(node_name, step, Command::UpgradeManager, &data)?;
        self.send(node_name, &entry, &message).await?;
        Ok(ManagerDispatch::Sent)
    }

    /// Ask any connected manager to upgrade the cluster. Returns the node that was told.
    pub async fn upgrade_cluster(
        &self,
        step: &StepRef,
        installation: &Value,
    ) -> Result<String, UpgradeError> {
        let (node_name, entry) = self.registry.first_active_client()?;
        let data = UpgradeClusterData {
            installation: installation.clone(),
        };
        let message = Self::encode(&node_name, step, Command::UpgradeCluster, &data)?;
        self.send(&node_name, &entry, &message).await?;
        Ok(node_name)
    }

    /// Send one extension command for one chart. Returns the node that was told.
    pub async fn extension(
        &self,
        step: &StepRef,
        command: Command,
        repos: &[HelmRepository],
        chart: &HelmChart,
    ) -> Result<String, UpgradeError> {
        let (node_name, entry) = self.registry.first_active_client()?;
        let data = ExtensionData {
            repos: repos.to_vec(),
            chart: chart.clone(),
        };
        let message = Self::encode(&node_name, step, command, &data)?;
        self.send(&node_name, &entry, &message).await?;
        Ok(node_name)
    }
}
