//! Type-specific step inputs and outputs.
//!
//! Inputs are fixed when the plan is built. Outputs are produced when a step
//! completes and are parsed against the type of the step they belong to.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::extensions::{HelmChart, HelmRepository};
use super::types::{StepOwner, StepType};

/// Parameters for the version-pinned upgrade service helper.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppUpgradeServiceInput {
    #[serde(rename = "appID")]
    pub app_id: String,
    pub app_slug: String,
    pub version_label: String,
    pub update_cursor: String,
    #[serde(rename = "channelID")]
    pub channel_id: String,
    #[serde(default)]
    pub is_airgap: bool,
    /// Version of the embedded cluster the helper must be pinned to.
    #[serde(default)]
    pub ec_version: String,
}

/// Results exposed by the upgrade service once the target archive is prepared.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppUpgradeServiceOutput {
    pub archive_path: String,
    pub base_sequence: i64,
    #[serde(rename = "appID")]
    pub app_id: String,
    #[serde(rename = "channelID")]
    pub channel_id: String,
    #[serde(default)]
    pub update_cursor: String,
}

/// Snapshot taken for the cluster upgrade command.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterUpgradeInput {
    /// Current cluster Installation object (opaque).
    pub current_installation: Value,
    /// New cluster config spec from the target release (opaque).
    pub new_config_spec: Value,
    pub is_disaster_recovery_supported: bool,
    pub new_ec_version: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManagerUpgradeInput {
    pub node_name: String,
    pub target_version: String,
    #[serde(rename = "licenseID")]
    pub license_id: String,
    pub license_endpoint: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppUpgradeInput {
    #[serde(rename = "appID")]
    pub app_id: String,
    pub app_slug: String,
    pub version_label: String,
    /// Step whose output carries the prepared archive.
    #[serde(rename = "serviceStepID")]
    pub service_step_id: String,
}

/// Input shared by the three extension step types.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionInput {
    #[serde(default)]
    pub repos: Vec<HelmRepository>,
    pub chart: HelmChart,
}

/// Step input keyed by step type.
#[derive(Clone, Debug, PartialEq)]
pub enum StepSpec {
    AppUpgradeService(AppUpgradeServiceInput),
    EmbeddedClusterUpgrade(ClusterUpgradeInput),
    EcManagerUpgrade(ManagerUpgradeInput),
    AppUpgrade(AppUpgradeInput),
    ExtensionAdd(ExtensionInput),
    ExtensionUpgrade(ExtensionInput),
    ExtensionRemove(ExtensionInput),
}

impl StepSpec {
    pub const fn step_type(&self) -> StepType {
        match self {
            Self::AppUpgradeService(_) => StepType::AppUpgradeService,
            Self::EmbeddedClusterUpgrade(_) => StepType::EmbeddedClusterUpgrade,
            Self::EcManagerUpgrade(_) => StepType::EcManagerUpgrade,
            Self::AppUpgrade(_) => StepType::AppUpgrade,
            Self::ExtensionAdd(_) => StepType::ExtensionAdd,
            Self::ExtensionUpgrade(_) => StepType::ExtensionUpgrade,
            Self::ExtensionRemove(_) => StepType::ExtensionRemove,
        }
    }

    pub const fn default_owner(&self) -> StepOwner {
        match self {
            Self::AppUpgradeService(_) | Self::AppUpgrade(_) => StepOwner::ControlPlane,
            _ => StepOwner::EcManager,
        }
    }

    /// Deserialize an input value against the shape expected for `step_type`.
    pub fn from_parts(step_type: StepType, input: Value) -> Result<Self, serde_json::Error> {
        Ok(match step_type {
            StepType::AppUpgradeService => Self::AppUpgradeService(serde_json::from_value(input)?),
            StepType::EmbeddedClusterUpgrade => {
                Self::EmbeddedClusterUpgrade(serde_json::from_value(input)?)
            }
            StepType::EcManagerUpgrade => Self::EcManagerUpgrade(serde_json::from_value(input)?),
            StepType::AppUpgrade => Self::AppUpgrade(serde_json::from_value(input)?),
            StepType::ExtensionAdd => Self::ExtensionAdd(serde_json::from_value(input)?),
            StepType::ExtensionUpgrade => Self::ExtensionUpgrade(serde_json::from_value(input)?),
            StepType::ExtensionRemove => Self::ExtensionRemove(serde_json::from_value(input)?),
        })
    }

    pub fn input_value(&self) -> Value {
        let value = match self {
            Self::AppUpgradeService(i) => serde_json::to_value(i),
            Self::EmbeddedClusterUpgrade(i) => serde_json::to_value(i),
            Self::EcManagerUpgrade(i) => serde_json::to_value(i),
            Self::AppUpgrade(i) => serde_json::to_value(i),
            Self::ExtensionAdd(i) | Self::ExtensionUpgrade(i) | Self::ExtensionRemove(i) => {
                serde_json::to_value(i)
            }
        };
        // Plain derived structs with string keys always serialize.
        value.unwrap_or(Value::Null)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManagerUpgradeOutput {
    pub version: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppUpgradeOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
}

/// Step output keyed by step type.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutput {
    AppUpgradeService(AppUpgradeServiceOutput),
    EcManagerUpgrade(ManagerUpgradeOutput),
    AppUpgrade(AppUpgradeOutput),
    /// Whatever a remote agent reported for a cluster or extension step.
    Remote(Value),
}

impl StepOutput {
    /// Parse an output value against the shape expected for `step_type`.
    pub fn parse(step_type: StepType, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match step_type {
            StepType::AppUpgradeService => Self::AppUpgradeService(serde_json::from_value(value)?),
            StepType::EcManagerUpgrade => Self::EcManagerUpgrade(serde_json::from_value(value)?),
            StepType::AppUpgrade => Self::AppUpgrade(serde_json::from_value(value)?),
            StepType::EmbeddedClusterUpgrade
            | StepType::ExtensionAdd
            | StepType::ExtensionUpgrade
            | StepType::ExtensionRemove => Self::Remote(value),
        })
    }

    pub fn to_value(&self) -> Value {
        let value = match self {
            Self::AppUpgradeService(o) => serde_json::to_value(o),
            Self::EcManagerUpgrade(o) => serde_json::to_value(o),
            Self::AppUpgrade(o) => serde_json::to_value(o),
            Self::Remote(v) => return v.clone(),
        };
        value.unwrap_or(Value::Null)
    }

    pub const fn as_service_output(&self) -> Option<&AppUpgradeServiceOutput> {
        match self {
            Self::AppUpgradeService(o) => Some(o),
            _ => None,
        }
    }
}
