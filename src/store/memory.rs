//! In-memory store.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{InstalledApp, Store, latest_plan};
use crate::plan::Plan;

type PlanKey = (String, String);

#[derive(Default)]
pub struct MemoryStore {
    plans: RwLock<HashMap<PlanKey, Plan>>,
    apps: RwLock<HashMap<String, InstalledApp>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with installed apps.
    pub fn with_apps(apps: impl IntoIterator<Item = InstalledApp>) -> Self {
        let apps = apps.into_iter().map(|a| (a.id.clone(), a)).collect();
        Self {
            plans: RwLock::default(),
            apps: RwLock::new(apps),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_plan(&self, app_id: &str, version_label: &str) -> Result<Option<Plan>> {
        let key = (app_id.to_string(), version_label.to_string());
        Ok(self.plans.read().await.get(&key).cloned())
    }

    async fn upsert_plan(&self, plan: &Plan) -> Result<()> {
        let key = (plan.app_id.clone(), plan.version_label.clone());
        self.plans.write().await.insert(key, plan.clone());
        Ok(())
    }

    async fn get_current_plan(&self, app_id: &str) -> Result<Option<Plan>> {
        let plans = self.plans.read().await;
        Ok(latest_plan(plans.values().filter(|p| p.app_id == app_id)).cloned())
    }

    async fn list_installed_apps(&self) -> Result<Vec<InstalledApp>> {
        let mut apps: Vec<InstalledApp> = self.apps.read().await.values().cloned().collect();
        apps.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(apps)
    }

    async fn get_app_by_slug(&self, slug: &str) -> Result<Option<InstalledApp>> {
        Ok(self
            .apps
            .read()
            .await
            .values()
            .find(|a| a.slug == slug)
            .cloned())
    }

    async fn upsert_app(&self, app: &InstalledApp) -> Result<()> {
        self.apps.write().await.insert(app.id.clone(), app.clone());
        Ok(())
    }
}
