//! Custom error types for ecup.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while planning, dispatching or executing an upgrade.
#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("No EC manager is connected")]
    NoConnectedAgent,

    #[error("Node {0} is not connected")]
    NodeNotConnected(String),

    #[error("[{node}] failed to write to connection: {reason}")]
    WriteFailed { node: String, reason: String },

    #[error("Timed out after {}s waiting for {what}", .after.as_secs())]
    Timeout { what: String, after: Duration },

    #[error("Step {step_id} failed: {description}")]
    StepFailed {
        step_id: String,
        description: String,
    },

    #[error("Plan not found for app {app} version {version_label}")]
    PlanNotFound { app: String, version_label: String },

    #[error("Step {0} not found in plan")]
    StepNotFound(String),

    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("Step {step_id} cannot move from {from} to {to}")]
    InvalidTransition {
        step_id: String,
        from: String,
        to: String,
    },

    #[error("App {app} already has an active plan for version {version_label}")]
    PlanInProgress { app: String, version_label: String },

    #[error("App {0} has no license")]
    MissingLicense(String),

    #[error("Failed to resolve embedded cluster version: {0}")]
    VersionResolution(String),

    #[error("Invalid helm extensions in {origin}: {reason}")]
    InvalidExtensions { origin: String, reason: String },
}

impl UpgradeError {
    /// Create a timeout error for the given wait target.
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Create a write error from any displayable transport error.
    pub fn write_failed<E: std::fmt::Display>(node: &str, err: E) -> Self {
        Self::WriteFailed {
            node: node.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn invalid_extensions<E: std::fmt::Display>(origin: &str, err: E) -> Self {
        Self::InvalidExtensions {
            origin: origin.to_string(),
            reason: err.to_string(),
        }
    }

    /// Returns true if the agent never answered, as opposed to answering with an error.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if this error is a dispatch failure that a fresh plan may get past
    /// once an agent reconnects.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoConnectedAgent
                | Self::NodeNotConnected(_)
                | Self::WriteFailed { .. }
        )
    }
}

/// Find the first [`UpgradeError`] in an `anyhow` error chain.
pub fn find_upgrade_error(err: &anyhow::Error) -> Option<&UpgradeError> {
    err.chain().find_map(|e| e.downcast_ref::<UpgradeError>())
}
