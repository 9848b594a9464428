//! Command envelope sent from the control plane to EC managers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::{HelmChart, HelmRepository};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    UpgradeManager,
    UpgradeCluster,
    AddExtension,
    UpgradeExtension,
    RemoveExtension,
}

impl Command {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UpgradeManager => "upgradeManager",
            Self::UpgradeCluster => "upgradeCluster",
            Self::AddExtension => "addExtension",
            Self::UpgradeExtension => "upgradeExtension",
            Self::RemoveExtension => "removeExtension",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the plan step a command belongs to.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StepRef {
    pub app_slug: String,
    pub version_label: String,
    #[serde(rename = "stepID")]
    pub step_id: String,
}

impl StepRef {
    pub fn new(
        app_slug: impl Into<String>,
        version_label: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            app_slug: app_slug.into(),
            version_label: version_label.into(),
            step_id: step_id.into(),
        }
    }
}

/// Envelope written to the agent. `data` is the JSON-encoded command payload.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(flatten)]
    pub step: StepRef,
    pub command: Command,
    pub data: String,
}

impl Message {
    pub fn new<T: Serialize>(step: &StepRef, command: Command, data: &T) -> serde_json::Result<Self> {
        Ok(Self {
            step: step.clone(),
            command,
            data: serde_json::to_string(data)?,
        })
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeManagerData {
    #[serde(rename = "licenseID")]
    pub license_id: String,
    pub license_endpoint: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct UpgradeClusterData {
    pub installation: Value,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ExtensionData {
    pub repos: Vec<HelmRepository>,
    pub chart: HelmChart,
}
