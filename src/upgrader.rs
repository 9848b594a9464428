//! Control-plane side of the application upgrade.
//!
//! The `app-upgrade-service` step prepares the target archive with a helper
//! pinned to the target embedded cluster version. The `app-upgrade` step
//! deploys it.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::plan::{
    AppUpgradeInput, AppUpgradeOutput, AppUpgradeServiceInput, AppUpgradeServiceOutput,
};

#[async_trait]
pub trait AppUpgrader: Send + Sync {
    /// Pull and prepare the target application archive.
    async fn prepare(&self, input: &AppUpgradeServiceInput) -> Result<AppUpgradeServiceOutput>;

    /// Deploy the archive produced by [`AppUpgrader::prepare`].
    async fn upgrade(
        &self,
        input: &AppUpgradeInput,
        prepared: &AppUpgradeServiceOutput,
    ) -> Result<AppUpgradeOutput>;
}

/// Runs the upgrade helper binary. Each subcommand receives its input as JSON
/// on stdin and prints a JSON result on stdout.
pub struct CommandAppUpgrader {
    helper: PathBuf,
}

impl CommandAppUpgrader {
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
        }
    }

    async fn run<T: DeserializeOwned>(&self, subcommand: &str, input: String) -> Result<T> {
        debug!(helper = %self.helper.display(), subcommand = subcommand, "Running upgrade helper");

        let mut child = Command::new(&self.helper)
            .arg(subcommand)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.helper.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .context("Failed to write helper input")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for upgrade helper")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "upgrade helper {subcommand} exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Failed to parse upgrade helper {subcommand} output"))
    }
}

#[async_trait]
impl AppUpgrader for CommandAppUpgrader {
    async fn prepare(&self, input: &AppUpgradeServiceInput) -> Result<AppUpgradeServiceOutput> {
        let body = serde_json::to_string(input)?;
        let output: AppUpgradeServiceOutput = self.run("prepare", body).await?;
        info!(
            app = %input.app_slug,
            version_label = %input.version_label,
            archive = %output.archive_path,
            "Prepared application archive"
        );
        Ok(output)
    }

    async fn upgrade(
        &self,
        input: &AppUpgradeInput,
        prepared: &AppUpgradeServiceOutput,
    ) -> Result<AppUpgradeOutput> {
        let body = serde_json::to_string(&serde_json::json!({
            "input": input,
            "prepared": prepared,
        }))?;
        let output: AppUpgradeOutput = self.run("upgrade", body).await?;
        info!(
            app = %input.app_slug,
            version_label = %input.version_label,
            sequence = ?output.sequence,
            "Deployed application version"
        );
        Ok(output)
    }
}
