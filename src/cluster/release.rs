//! Target release resolution: online through the license endpoint, airgap
//! through the uploaded bundle metadata.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{ReleaseResolver, TargetRelease};
use crate::error::UpgradeError;
use crate::store::{InstalledApp, License};

const AIRGAP_METADATA_FILE: &str = "airgap.yaml";

#[derive(Deserialize)]
struct VersionResponse {
    #[serde(default)]
    version: String,
    #[serde(default)]
    config: Option<Value>,
}

/// Asks the license endpoint which installer version a channel release requires.
pub struct HttpReleaseResolver {
    client: reqwest::Client,
}

impl HttpReleaseResolver {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn version_url(license: &License) -> String {
        format!(
            "{}/clusterconfig/version/Installer",
            license.endpoint.trim_end_matches('/')
        )
    }
}

impl Default for HttpReleaseResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReleaseResolver for HttpReleaseResolver {
    async fn resolve(
        &self,
        app: &InstalledApp,
        version_label: &str,
        update_cursor: &str,
        channel_id: &str,
    ) -> Result<TargetRelease> {
        let license = app
            .license
            .as_ref()
            .ok_or_else(|| UpgradeError::MissingLicense(app.slug.clone()))?;

        let url = Self::version_url(license);
        debug!(url = %url, version_label = version_label, "Resolving embedded cluster version");

        let response = self
            .client
            .get(&url)
            .basic_auth(&license.id, Some(&license.id))
            .query(&[("channelSequence", update_cursor), ("channelId", channel_id)])
            .send()
            .await
            .with_context(|| format!("Failed to query {url}"))?;

        if !response.status().is_success() {
            return Err(UpgradeError::VersionResolution(format!(
                "{url} returned {}",
                response.status()
            ))
            .into());
        }

        let body: VersionResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to decode response from {url}"))?;
        if body.version.is_empty() {
            return Err(UpgradeError::VersionResolution(format!(
                "no installer version for {} {version_label}",
                app.slug
            ))
            .into());
        }

        info!(app = %app.slug, version = %body.version, "Resolved embedded cluster version");
        Ok(TargetRelease {
            ec_version: body.version,
            cluster_config: body.config,
        })
    }
}

#[derive(Deserialize)]
struct AirgapMetadata {
    spec: AirgapSpec,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AirgapSpec {
    #[serde(default)]
    version_label: String,
    #[serde(default)]
    embedded_cluster_version: String,
    #[serde(default)]
    embedded_cluster_config: Option<Value>,
}

/// Reads `<bundle_dir>/<app slug>/airgap.yaml` from an uploaded airgap bundle.
pub struct AirgapReleaseResolver {
    bundle_dir: PathBuf,
}

impl AirgapReleaseResolver {
    pub fn new(bundle_dir: impl Into<PathBuf>) -> Self {
        Self {
            bundle_dir: bundle_dir.into(),
        }
    }
}

#[async_trait]
impl ReleaseResolver for AirgapReleaseResolver {
    async fn resolve(
        &self,
        app: &InstalledApp,
        version_label: &str,
        _update_cursor: &str,
        _channel_id: &str,
    ) -> Result<TargetRelease> {
        let path = self.bundle_dir.join(&app.slug).join(AIRGAP_METADATA_FILE);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read airgap metadata {}", path.display()))?;
        let metadata: AirgapMetadata = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        if !metadata.spec.version_label.is_empty() && metadata.spec.version_label != version_label
        {
            return Err(UpgradeError::VersionResolution(format!(
                "airgap bundle is for version {}, not {version_label}",
                metadata.spec.version_label
            ))
            .into());
        }
        if metadata.spec.embedded_cluster_version.is_empty() {
            return Err(UpgradeError::VersionResolution(format!(
                "airgap bundle for {} has no embedded cluster version",
                app.slug
            ))
            .into());
        }

        Ok(TargetRelease {
            ec_version: metadata.spec.embedded_cluster_version,
            cluster_config: metadata.spec.embedded_cluster_config,
        })
    }
}

/// Picks the airgap or online resolver based on how the app was installed.
pub struct LicenseReleaseResolver {
    online: HttpReleaseResolver,
    airgap: Option<AirgapReleaseResolver>,
}

impl LicenseReleaseResolver {
    pub fn new(airgap_bundle_dir: Option<PathBuf>) -> Self {
        Self {
            online: HttpReleaseResolver::new(),
            airgap: airgap_bundle_dir.map(AirgapReleaseResolver::new),
        }
    }
}

#[async_trait]
impl ReleaseResolver for LicenseReleaseResolver {
    async fn resolve(
        &self,
        app: &InstalledApp,
        version_label: &str,
        update_cursor: &str,
        channel_id: &str,
    ) -> Result<TargetRelease> {
        if app.is_airgap {
            let airgap = self.airgap.as_ref().ok_or_else(|| {
                UpgradeError::VersionResolution(format!(
                    "{} is an airgap install but no bundle directory is configured",
                    app.slug
                ))
            })?;
            return airgap
                .resolve(app, version_label, update_cursor, channel_id)
                .await;
        }
        self.online
            .resolve(app, version_label, update_cursor, channel_id)
            .await
    }
}
