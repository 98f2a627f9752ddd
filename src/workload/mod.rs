//! Checker workloads
//!
//! This module builds the short-lived pods scenarios schedule onto the cluster:
//! - [`WorkloadBuilder`]: fluent pod construction with validation
//! - [`WorkloadFactory`]: the two canonical checker variants
//! - [`apply`] / [`delete`]: idempotent submission and removal
//! - [`poll`]: phase polling with bounded waits
//! - [`classify`]: deciding whether a node is a Kuack node
//! - [`assertions`]: log and placement checks on finished workloads

pub mod assertions;
pub mod classify;
pub mod poll;

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, ResourceRequirements, Toleration as K8sToleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::names;
use crate::session::ClusterApi;
use crate::{Error, Result};

pub use assertions::{
    assert_checker_result, assert_logs_contain, assert_ran_in_cluster, assert_ran_on_target,
};
pub use classify::{NodeClassifier, NodeHint};
pub use poll::{wait_for_phase, PhaseWait};

/// Label every harness-created pod carries
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "kuack-e2e";
/// Selector matching every harness-created pod
pub const MANAGED_BY_SELECTOR: &str = "app.kubernetes.io/managed-by=kuack-e2e";
/// Node label identifying Kuack virtual nodes
pub const NODE_TYPE_LABEL: &str = "kuack.io/node-type";
/// Value of [`NODE_TYPE_LABEL`] on Kuack nodes
pub const NODE_TYPE_VALUE: &str = "kuack-node";
/// Taint key Kuack nodes carry
pub const PROVIDER_TAINT_KEY: &str = "kuack.io/provider";
/// Value of the provider taint
pub const PROVIDER_TAINT_VALUE: &str = "kuack";
/// Well-known hostname label used to pin a pod to one node
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

const DEFAULT_CONTAINER: &str = "main";

// =============================================================================
// Pod phase
// =============================================================================

/// Observed lifecycle phase of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodPhase {
    /// Accepted, not all containers running yet
    Pending,
    /// Bound to a node, at least one container running
    Running,
    /// All containers exited successfully
    Succeeded,
    /// All containers exited, at least one failed
    Failed,
    /// Not reported or unrecognized
    Unknown,
}

impl PodPhase {
    /// Parse the API's phase string
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Phase reported in a pod's status
    pub fn of(pod: &Pod) -> Self {
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(Self::parse)
            .unwrap_or(Self::Unknown)
    }

    /// Whether the pod can no longer change phase
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// API spelling of the phase
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tolerations
// =============================================================================

/// Pod restart policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Restart on any exit (API default)
    Always,
    /// Restart on non-zero exit
    OnFailure,
    /// Never restart
    Never,
}

impl RestartPolicy {
    fn as_str(self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::OnFailure => "OnFailure",
            Self::Never => "Never",
        }
    }
}

/// A single pod toleration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toleration {
    /// Taint key
    pub key: String,
    /// `Equal` or `Exists`
    pub operator: String,
    /// Taint value, only meaningful with `Equal`
    pub value: Option<String>,
    /// NoSchedule, PreferNoSchedule or NoExecute
    pub effect: Option<String>,
    /// How long a NoExecute taint is tolerated
    pub seconds: Option<i64>,
}

impl Toleration {
    /// `key=value` with the `Equal` operator and no effect
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: "Equal".to_string(),
            value: Some(value.into()),
            effect: None,
            seconds: None,
        }
    }

    /// Tolerate any value of `key`
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: "Exists".to_string(),
            value: None,
            effect: None,
            seconds: None,
        }
    }

    /// Set the tolerated effect
    pub fn with_effect(mut self, effect: impl Into<String>) -> Self {
        self.effect = Some(effect.into());
        self
    }

    /// Set the toleration period
    pub fn with_seconds(mut self, seconds: i64) -> Self {
        self.seconds = Some(seconds);
        self
    }

    /// Parse the map-shaped shorthand.
    ///
    /// `effect`, `operator` and `tolerationSeconds` are properties; the first
    /// other pair becomes the toleration's key and value, e.g.
    /// `[("kuack.io/provider", "kuack"), ("effect", "NoSchedule")]`.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Result<Self> {
        let mut key = None;
        let mut value = None;
        let mut effect = None;
        let mut operator = "Equal".to_string();
        let mut seconds = None;

        for (k, v) in pairs {
            match *k {
                "effect" => effect = Some(v.to_string()),
                "operator" => operator = v.to_string(),
                "tolerationSeconds" => {
                    seconds = Some(v.parse::<i64>().map_err(|e| {
                        Error::validation("toleration", format!("invalid tolerationSeconds '{}': {}", v, e))
                    })?)
                }
                _ if key.is_none() => {
                    key = Some(k.to_string());
                    value = Some(v.to_string());
                }
                _ => {}
            }
        }

        let key = key.ok_or_else(|| {
            Error::validation("toleration", "shorthand must contain at least one non-property key")
        })?;
        if operator != "Equal" {
            value = None;
        }

        Ok(Self {
            key,
            operator,
            value,
            effect,
            seconds,
        })
    }

    fn to_k8s(&self) -> K8sToleration {
        K8sToleration {
            key: Some(self.key.clone()),
            operator: Some(self.operator.clone()),
            value: self.value.clone(),
            effect: self.effect.clone(),
            toleration_seconds: self.seconds,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Fluent pod builder.
///
/// Container-level settings apply to the most recently added container,
/// which starts out as a container named `main` without an image.
#[derive(Debug, Clone)]
pub struct WorkloadBuilder {
    name: String,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    node_selector: BTreeMap<String, String>,
    tolerations: Vec<Toleration>,
    restart_policy: Option<RestartPolicy>,
    containers: Vec<Container>,
}

impl WorkloadBuilder {
    /// Start a pod named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            node_selector: BTreeMap::new(),
            tolerations: Vec::new(),
            restart_policy: None,
            containers: vec![Container {
                name: DEFAULT_CONTAINER.to_string(),
                ..Default::default()
            }],
        }
    }

    fn current(&mut self) -> &mut Container {
        let last = self.containers.len() - 1;
        &mut self.containers[last]
    }

    /// Set the current container's image
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.current().image = Some(image.into());
        self
    }

    /// Rename the current container
    pub fn container_name(mut self, name: impl Into<String>) -> Self {
        self.current().name = name.into();
        self
    }

    /// Add a container; subsequent container settings apply to it
    pub fn add_container(mut self, name: impl Into<String>, image: impl Into<String>) -> Self {
        self.containers.push(Container {
            name: name.into(),
            image: Some(image.into()),
            ..Default::default()
        });
        self
    }

    /// Set the current container's command
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.current().command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    /// Set the current container's arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.current().args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// Add an environment variable to the current container
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.current().env.get_or_insert_with(Vec::new).push(EnvVar {
            name: name.into(),
            value: Some(value.into()),
            ..Default::default()
        });
        self
    }

    fn resources(&mut self) -> &mut ResourceRequirements {
        self.current()
            .resources
            .get_or_insert_with(ResourceRequirements::default)
    }

    /// Request `quantity` of `resource` (e.g. `cpu`, `500m`)
    pub fn request(mut self, resource: impl Into<String>, quantity: impl Into<String>) -> Self {
        self.resources()
            .requests
            .get_or_insert_with(BTreeMap::new)
            .insert(resource.into(), Quantity(quantity.into()));
        self
    }

    /// Limit `resource` to `quantity`
    pub fn limit(mut self, resource: impl Into<String>, quantity: impl Into<String>) -> Self {
        self.resources()
            .limits
            .get_or_insert_with(BTreeMap::new)
            .insert(resource.into(), Quantity(quantity.into()));
        self
    }

    /// Add a node selector entry
    pub fn node_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.node_selector.insert(key.into(), value.into());
        self
    }

    /// Add a toleration
    pub fn toleration(mut self, toleration: Toleration) -> Self {
        self.tolerations.push(toleration);
        self
    }

    /// Add a pod label
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a pod annotation
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Set the restart policy
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = Some(policy);
        self
    }

    /// Validate and produce the pod definition
    pub fn build(self) -> Result<Pod> {
        if self.name.is_empty() {
            return Err(Error::validation("pod", "name must not be empty"));
        }
        for container in &self.containers {
            if container.image.as_deref().map_or(true, str::is_empty) {
                return Err(Error::validation(
                    format!("pod {}", self.name),
                    format!("container '{}' has no image", container.name),
                ));
            }
        }

        let non_empty = |m: BTreeMap<String, String>| (!m.is_empty()).then_some(m);

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(self.name),
                labels: non_empty(self.labels),
                annotations: non_empty(self.annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: self.containers,
                node_selector: non_empty(self.node_selector),
                tolerations: (!self.tolerations.is_empty())
                    .then(|| self.tolerations.iter().map(Toleration::to_k8s).collect()),
                restart_policy: self.restart_policy.map(|p| p.as_str().to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Builds the canonical checker workloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadFactory {
    image: String,
    target_url: String,
}

impl WorkloadFactory {
    /// Factory for a given checker image and probe URL
    pub fn new(image: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            target_url: target_url.into(),
        }
    }

    /// Factory using the configured checker image and URL
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(&config.checker_image, &config.checker_url)
    }

    /// URL the checker probes
    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    fn checker(&self, name: &str) -> WorkloadBuilder {
        WorkloadBuilder::new(name)
            .image(&self.image)
            .env("TARGET_URL", &self.target_url)
            .label(MANAGED_BY_LABEL, MANAGED_BY_VALUE)
    }

    /// Checker pinned to Kuack node `node`
    pub fn targeted(&self, name: &str, node: &str) -> Result<Pod> {
        self.checker(name)
            .node_selector(NODE_TYPE_LABEL, NODE_TYPE_VALUE)
            .node_selector(HOSTNAME_LABEL, node)
            .toleration(Toleration::from_pairs(&[
                (PROVIDER_TAINT_KEY, PROVIDER_TAINT_VALUE),
                ("effect", "NoSchedule"),
            ])?)
            .build()
    }

    /// Checker left to the default scheduler; runs once
    pub fn ambient(&self, name: &str) -> Result<Pod> {
        // Finished non-Job pods would otherwise be restarted forever
        self.checker(name)
            .restart_policy(RestartPolicy::Never)
            .build()
    }
}

/// Name for a checker targeting `node`
pub fn targeted_name(node: &str) -> String {
    names::sanitize(&format!("checker-{}", node))
}

/// Fresh name for an ambient checker
pub fn ambient_name() -> String {
    format!("checker-cluster-{}", names::random_suffix(6))
}

// =============================================================================
// Apply / delete
// =============================================================================

fn pod_name(pod: &Pod) -> Result<&str> {
    pod.metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::validation("pod", "metadata.name is required"))
}

/// Create the pod, or replace it when it already exists
pub async fn apply(cluster: &dyn ClusterApi, pod: &Pod) -> Result<Pod> {
    let name = pod_name(pod)?;
    match cluster.create_pod(pod).await {
        Ok(created) => {
            info!(pod = %name, "Pod created");
            Ok(created)
        }
        Err(e) if e.is_already_exists() => {
            debug!(pod = %name, "Pod exists, replacing");
            let replaced = cluster.replace_pod(name, pod).await?;
            info!(pod = %name, "Pod replaced");
            Ok(replaced)
        }
        Err(e) => Err(e),
    }
}

/// Delete a pod; `false` when it was already gone
pub async fn delete(cluster: &dyn ClusterApi, name: &str) -> Result<bool> {
    let existed = cluster.delete_pod(name).await?;
    if existed {
        info!(pod = %name, "Pod deleted");
    } else {
        debug!(pod = %name, "Pod already absent");
    }
    Ok(existed)
}
