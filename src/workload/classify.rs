//! Deciding whether a node is a Kuack virtual node

use k8s_openapi::api::core::v1::Node;
use tracing::debug;

use super::{NODE_TYPE_LABEL, NODE_TYPE_VALUE};
use crate::session::ClusterApi;
use crate::{Error, Result};

/// One signal that a node is a Kuack node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeHint {
    /// Node name contains the substring (no API call needed)
    NameContains(String),
    /// Node carries the label with the given value
    Label {
        /// Label key
        key: String,
        /// Expected value
        value: String,
    },
    /// Reported `nodeInfo.architecture`
    Architecture(String),
    /// Reported `nodeInfo.operatingSystem`
    OperatingSystem(String),
}

impl NodeHint {
    fn needs_node(&self) -> bool {
        !matches!(self, Self::NameContains(_))
    }

    fn matches(&self, name: &str, node: Option<&Node>) -> bool {
        match self {
            Self::NameContains(needle) => name.contains(needle.as_str()),
            Self::Label { key, value } => node
                .and_then(|n| n.metadata.labels.as_ref())
                .and_then(|l| l.get(key))
                .is_some_and(|v| v == value),
            Self::Architecture(arch) => node
                .and_then(|n| n.status.as_ref())
                .and_then(|s| s.node_info.as_ref())
                .is_some_and(|i| &i.architecture == arch),
            Self::OperatingSystem(os) => node
                .and_then(|n| n.status.as_ref())
                .and_then(|s| s.node_info.as_ref())
                .is_some_and(|i| &i.operating_system == os),
        }
    }
}

/// Ordered list of hints; the first match wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeClassifier {
    hints: Vec<NodeHint>,
}

impl Default for NodeClassifier {
    fn default() -> Self {
        Self::new(vec![
            NodeHint::NameContains("kuack".to_string()),
            NodeHint::Label {
                key: NODE_TYPE_LABEL.to_string(),
                value: NODE_TYPE_VALUE.to_string(),
            },
            NodeHint::Architecture("wasm32".to_string()),
            NodeHint::OperatingSystem("browser".to_string()),
        ])
    }
}

impl NodeClassifier {
    /// Classifier evaluating `hints` in order
    pub fn new(hints: Vec<NodeHint>) -> Self {
        Self { hints }
    }

    /// Hints in evaluation order
    pub fn hints(&self) -> &[NodeHint] {
        &self.hints
    }

    /// Whether `name` is a Kuack node.
    ///
    /// The node object is fetched at most once, and only when a name-only
    /// hint has not already matched.
    pub async fn is_target_node(&self, cluster: &dyn ClusterApi, name: &str) -> Result<bool> {
        let mut node: Option<Node> = None;

        for hint in &self.hints {
            if hint.needs_node() && node.is_none() {
                node = Some(
                    cluster
                        .get_node(name)
                        .await?
                        .ok_or_else(|| Error::not_found("Node", name))?,
                );
            }
            if hint.matches(name, node.as_ref()) {
                debug!(node = %name, hint = ?hint, "Node classified as Kuack node");
                return Ok(true);
            }
        }

        debug!(node = %name, "Node classified as cluster node");
        Ok(false)
    }
}
