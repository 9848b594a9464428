//! JSON document store under a data directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{InstalledApp, Store, latest_plan};
use crate::plan::Plan;

const STATE_FILE: &str = "state.json";

#[derive(Deserialize, Serialize, Default)]
struct State {
    #[serde(default)]
    apps: Vec<InstalledApp>,
    #[serde(default)]
    plans: Vec<Plan>,
}

/// Store persisting all apps and plans in a single `state.json`.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Open (or create) the store under `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
        Ok(Self {
            path: dir.join(STATE_FILE),
            lock: Mutex::new(()),
        })
    }

    async fn load(&self) -> Result<State> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(State::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    async fn save(&self, state: &State) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), "State saved");
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get_plan(&self, app_id: &str, version_label: &str) -> Result<Option<Plan>> {
        let _guard = self.lock.lock().await;
        let state = self.load().await?;
        Ok(state
            .plans
            .into_iter()
            .find(|p| p.app_id == app_id && p.version_label == version_label))
    }

    async fn upsert_plan(&self, plan: &Plan) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await?;
        match state
            .plans
            .iter_mut()
            .find(|p| p.app_id == plan.app_id && p.version_label == plan.version_label)
        {
            Some(existing) => *existing = plan.clone(),
            None => state.plans.push(plan.clone()),
        }
        self.save(&state).await
    }

    async fn get_current_plan(&self, app_id: &str) -> Result<Option<Plan>> {
        let _guard = self.lock.lock().await;
        let state = self.load().await?;
        Ok(latest_plan(state.plans.iter().filter(|p| p.app_id == app_id)).cloned())
    }

    async fn list_installed_apps(&self) -> Result<Vec<InstalledApp>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.apps)
    }

    async fn get_app_by_slug(&self, slug: &str) -> Result<Option<InstalledApp>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.apps.into_iter().find(|a| a.slug == slug))
    }

    async fn upsert_app(&self, app: &InstalledApp) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await?;
        match state.apps.iter_mut().find(|a| a.id == app.id) {
            Some(existing) => *existing = app.clone(),
            None => state.apps.push(app.clone()),
        }
        self.save(&state).await
    }
}
