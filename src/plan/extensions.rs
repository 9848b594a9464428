//! Helm extension definitions and the diff that drives extension steps.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Helm chart installed alongside the application.
///
/// Only `name` is interpreted; the remaining fields are compared as-is.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmChart {
    pub name: String,
    #[serde(rename = "chartname", default)]
    pub chart_name: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub values: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepository {
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Helm extension set of a cluster config.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmExtensions {
    #[serde(default)]
    pub repositories: Vec<HelmRepository>,
    #[serde(default)]
    pub charts: Vec<HelmChart>,
}

/// YAML configs often leave chart versions unquoted, so `2` and `"2"` are the same version.
fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected a scalar chart version, found {other}"
        ))),
    }
}

impl HelmExtensions {
    /// Extract `spec.extensions.helm` from an opaque cluster config or Installation object.
    ///
    /// Installation objects nest the config under `spec.config`. A missing
    /// section is an empty set; a malformed one is an error.
    pub fn from_object(object: &Value) -> Result<Self, serde_json::Error> {
        let helm = object
            .pointer("/spec/extensions/helm")
            .or_else(|| object.pointer("/spec/config/extensions/helm"));
        Self::parse(helm)
    }

    /// Extract `extensions.helm` from a bare cluster config spec.
    pub fn from_config_spec(spec: &Value) -> Result<Self, serde_json::Error> {
        Self::parse(spec.pointer("/extensions/helm"))
    }

    fn parse(helm: Option<&Value>) -> Result<Self, serde_json::Error> {
        match helm {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(v) => serde_json::from_value(v.clone()),
        }
    }
}

/// Charts to add, remove and upgrade. The three sets are disjoint.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExtensionDiff {
    pub added: Vec<HelmChart>,
    pub removed: Vec<HelmChart>,
    pub modified: Vec<HelmChart>,
}

/// Compare the current and new chart sets by name.
///
/// Modified charts carry the new definition; removed charts carry the current one.
pub fn diff_extensions(current: &[HelmChart], new: &[HelmChart]) -> ExtensionDiff {
    let current_by_name: HashMap<&str, &HelmChart> =
        current.iter().map(|c| (c.name.as_str(), c)).collect();
    let new_by_name: HashMap<&str, &HelmChart> = new.iter().map(|c| (c.name.as_str(), c)).collect();

    let mut diff = ExtensionDiff::default();

    for chart in new {
        match current_by_name.get(chart.name.as_str()) {
            None => diff.added.push(chart.clone()),
            Some(existing) if *existing != chart => diff.modified.push(chart.clone()),
            Some(_) => {}
        }
    }

    for chart in current {
        if !new_by_name.contains_key(chart.name.as_str()) {
            diff.removed.push(chart.clone());
        }
    }

    diff.added.sort_by(|a, b| a.name.cmp(&b.name));
    diff.removed.sort_by(|a, b| a.name.cmp(&b.name));
    diff.modified.sort_by(|a, b| a.name.cmp(&b.name));
    diff
}
