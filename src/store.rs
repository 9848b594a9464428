//! Plan and app state store.
//!
//! The store is the single source of truth for plan state. Every reader sees
//! whole plans: there are no partial-field updates.

pub mod file;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::plan::Plan;

pub use file::FileStore;
pub use memory::MemoryStore;

/// License facts needed to plan and dispatch an upgrade.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct License {
    #[serde(rename = "licenseID")]
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub is_disaster_recovery_supported: bool,
}

/// An application installed on this control plane.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstalledApp {
    pub id: String,
    pub slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_airgap: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<License>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Plan for (app, version label), if one was ever created.
    async fn get_plan(&self, app_id: &str, version_label: &str) -> Result<Option<Plan>>;

    /// Insert or replace the plan keyed by (app, version label).
    async fn upsert_plan(&self, plan: &Plan) -> Result<()>;

    /// Most recently created plan for the app.
    async fn get_current_plan(&self, app_id: &str) -> Result<Option<Plan>>;

    async fn list_installed_apps(&self) -> Result<Vec<InstalledApp>>;

    async fn get_app_by_slug(&self, slug: &str) -> Result<Option<InstalledApp>>;

    async fn upsert_app(&self, app: &InstalledApp) -> Result<()>;
}

/// Pick the most recently created plan, ties broken by version label.
pub(crate) fn latest_plan<'a>(plans: impl Iterator<Item = &'a Plan>) -> Option<&'a Plan> {
    plans.max_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.version_label.cmp(&b.version_label))
    })
}
