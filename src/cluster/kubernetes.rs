//! Cluster inspection through the Kubernetes API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::Api;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, ListParams};
use serde_json::Value;
use tracing::debug;

use super::ClusterInspector;

const INSTALLATION_GROUP: &str = "embeddedcluster.replicated.com";
const INSTALLATION_VERSION: &str = "v1beta1";
const INSTALLATION_KIND: &str = "Installation";
const INSTALLATION_PLURAL: &str = "installations";

/// Reads Installation objects and nodes from the cluster the control plane runs in.
pub struct KubeClusterInspector {
    client: kube::Client,
}

impl KubeClusterInspector {
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn installations(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(INSTALLATION_GROUP, INSTALLATION_VERSION, INSTALLATION_KIND);
        let resource = ApiResource::from_gvk_with_plural(&gvk, INSTALLATION_PLURAL);
        Api::all_with(self.client.clone(), &resource)
    }
}

/// Installation names are timestamps, so the greatest name is the most recent.
fn latest_installation(mut items: Vec<DynamicObject>) -> Option<DynamicObject> {
    items.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    items.pop()
}

#[async_trait]
impl ClusterInspector for KubeClusterInspector {
    async fn current_installation(&self) -> Result<Value> {
        let list = self
            .installations()
            .list(&ListParams::default())
            .await
            .context("Failed to list installations")?;
        debug!(count = list.items.len(), "Listed installations");

        let latest = latest_installation(list.items)
            .ok_or_else(|| anyhow::anyhow!("No installation found in cluster"))?;
        serde_json::to_value(&latest).context("Failed to encode installation")
    }

    async fn node_names(&self) -> Result<Vec<String>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .context("Failed to list nodes")?;
        let mut names: Vec<String> = list
            .items
            .into_iter()
            .filter_map(|n| n.metadata.name)
            .collect();
        names.sort();
        Ok(names)
    }
}
