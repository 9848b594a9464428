//! Cluster and release facts consumed by the plan builder.
//!
//! Kubernetes objects are carried as opaque JSON.

pub mod kubernetes;
pub mod release;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::store::InstalledApp;

pub use kubernetes::KubeClusterInspector;
pub use release::{AirgapReleaseResolver, HttpReleaseResolver, LicenseReleaseResolver};

/// Read-only view of the running embedded cluster.
#[async_trait]
pub trait ClusterInspector: Send + Sync {
    /// Most recent Installation object.
    async fn current_installation(&self) -> Result<Value>;

    /// Names of all cluster nodes.
    async fn node_names(&self) -> Result<Vec<String>>;
}

/// Facts about the target release.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRelease {
    pub ec_version: String,
    /// Cluster config spec shipped with the release, when the source provides one.
    pub cluster_config: Option<Value>,
}

/// Resolves the embedded cluster version a target app version requires.
#[async_trait]
pub trait ReleaseResolver: Send + Sync {
    async fn resolve(
        &self,
        app: &InstalledApp,
        version_label: &str,
        update_cursor: &str,
        channel_id: &str,
    ) -> Result<TargetRelease>;
}

/// Embedded cluster version recorded in an Installation object.
pub fn installation_version(installation: &Value) -> Option<String> {
    installation
        .pointer("/spec/config/version")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Cluster config spec of an Installation object.
pub fn installation_config(installation: &Value) -> Value {
    installation
        .pointer("/spec/config")
        .cloned()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
}

/// Installation object the cluster upgrade should converge to.
///
/// Copies the current object under a new timestamp name with the new config
/// spec. Server-assigned metadata is dropped.
pub fn next_installation(current: &Value, new_config_spec: &Value, now: DateTime<Utc>) -> Value {
    let mut next = current.clone();
    if let Value::Object(root) = &mut next {
        root.insert(
            "metadata".to_string(),
            serde_json::json!({ "name": now.format("%Y%m%d%H%M%S").to_string() }),
        );
        let spec = root
            .entry("spec")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(spec) = spec {
            spec.insert("config".to_string(), new_config_spec.clone());
        }
        root.remove("status");
    }
    next
}
