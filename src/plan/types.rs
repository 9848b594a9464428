//! Plan and step types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::step::{StepOutput, StepSpec};
use crate::error::UpgradeError;

/// Type of a plan step.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    AppUpgradeService,
    EmbeddedClusterUpgrade,
    EcManagerUpgrade,
    AppUpgrade,
    ExtensionAdd,
    ExtensionUpgrade,
    ExtensionRemove,
}

impl StepType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AppUpgradeService => "app-upgrade-service",
            Self::EmbeddedClusterUpgrade => "embedded-cluster-upgrade",
            Self::EcManagerUpgrade => "ec-manager-upgrade",
            Self::AppUpgrade => "app-upgrade",
            Self::ExtensionAdd => "extension-add",
            Self::ExtensionUpgrade => "extension-upgrade",
            Self::ExtensionRemove => "extension-remove",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a plan step.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Starting,
    Running,
    Complete,
    Failed,
}

impl StepStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Complete | Self::Failed => 3,
        }
    }

    /// Status only moves forward. Re-reporting the current status is allowed.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || next.rank() > self.rank()
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Actor responsible for executing a step.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StepOwner {
    ControlPlane,
    EcManager,
}

/// One unit of work within a plan.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub struct Step {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    pub status_description: String,
    pub owner: StepOwner,
    /// Node that was told to execute a remote step.
    pub owner_host: Option<String>,
    pub spec: StepSpec,
    pub output: Option<StepOutput>,
}

impl Step {
    /// Create a pending step with a fresh ID. The owner follows the step type.
    pub fn new(name: impl Into<String>, spec: StepSpec) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            status: StepStatus::Pending,
            status_description: String::new(),
            owner: spec.default_owner(),
            owner_host: None,
            spec,
            output: None,
        }
    }

    pub const fn step_type(&self) -> StepType {
        self.spec.step_type()
    }
}

/// Wire shape of a step: `type` selects how `input` and `output` are parsed.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    id: String,
    name: String,
    #[serde(rename = "type")]
    step_type: StepType,
    status: StepStatus,
    #[serde(default)]
    status_description: String,
    owner: StepOwner,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner_host: Option<String>,
    #[serde(default)]
    input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<serde_json::Value>,
}

impl TryFrom<RawStep> for Step {
    type Error = serde_json::Error;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let spec = StepSpec::from_parts(raw.step_type, raw.input)?;
        let output = raw
            .output
            .filter(|v| !v.is_null())
            .map(|v| StepOutput::parse(raw.step_type, v))
            .transpose()?;
        Ok(Self {
            id: raw.id,
            name: raw.name,
            status: raw.status,
            status_description: raw.status_description,
            owner: raw.owner,
            owner_host: raw.owner_host,
            spec,
            output,
        })
    }
}

impl From<Step> for RawStep {
    fn from(step: Step) -> Self {
        Self {
            id: step.id,
            name: step.name,
            step_type: step.spec.step_type(),
            status: step.status,
            status_description: step.status_description,
            owner: step.owner,
            owner_host: step.owner_host,
            input: step.spec.input_value(),
            output: step.output.map(|o| o.to_value()),
        }
    }
}

/// One upgrade attempt for one application version.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub app_id: String,
    pub app_slug: String,
    pub version_label: String,
    pub update_cursor: String,
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub current_ec_version: String,
    pub new_ec_version: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Plan {
    /// A plan has ended once every step completed or any step failed.
    pub fn has_ended(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Complete)
            || self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    pub fn has_failed(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// The first step that is not complete, if any.
    pub fn active_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.status != StepStatus::Complete)
    }

    pub fn needs_cluster_upgrade(&self) -> bool {
        self.current_ec_version != self.new_ec_version
    }

    /// Look up a step or fail with [`UpgradeError::StepNotFound`].
    pub fn require_step(&self, id: &str) -> Result<&Step, UpgradeError> {
        self.step(id)
            .ok_or_else(|| UpgradeError::StepNotFound(id.to_string()))
    }
}
