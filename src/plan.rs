//! Upgrade plan model.

pub mod extensions;
pub mod step;
pub mod types;

pub use extensions::{ExtensionDiff, HelmChart, HelmExtensions, HelmRepository, diff_extensions};
pub use step::{
    AppUpgradeInput, AppUpgradeOutput, AppUpgradeServiceInput, AppUpgradeServiceOutput,
    ClusterUpgradeInput, ExtensionInput, ManagerUpgradeInput, ManagerUpgradeOutput, StepOutput,
    StepSpec,
};
pub use types::{Plan, Step, StepOwner, StepStatus, StepType};
