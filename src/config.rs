//! Environment-derived harness configuration
//!
//! Every value has a default so a bare `cargo test` against a developer
//! cluster works. CI overrides them per run.
//!
//! # Environment Variables
//!
//! ```bash
//! HELM_CHART=oci://ghcr.io/kuack-io/charts/kuack
//! HELM_CHART_VERSION=latest        # "latest" omits --version
//! HELM_BIN=helm
//! RELEASE_PREFIX=kuack-node
//! AGENT_RELEASE=kuack-agent
//! SHARD_INDEX=0                    # falls back to CUCUMBER_WORKER_ID
//! CHECKER_IMAGE=ghcr.io/kuack-io/checker:latest
//! CHECKER_URL=https://kuack.io
//! TEST_ID=                         # optional run label
//! NODE_URL=                        # use an existing node, skip install
//! AGENT_URL=                       # use an existing agent, skip install
//! ```

use crate::{Error, Result};

/// Default chart reference for node and agent releases
pub const DEFAULT_CHART: &str = "oci://ghcr.io/kuack-io/charts/kuack";
/// Sentinel version meaning "whatever the chart reference resolves to"
pub const LATEST_VERSION: &str = "latest";
/// Default prefix for per-scenario node releases
pub const DEFAULT_RELEASE_PREFIX: &str = "kuack-node";
/// Default name for the per-worker agent release
pub const DEFAULT_AGENT_RELEASE: &str = "kuack-agent";
/// Default checker workload image
pub const DEFAULT_CHECKER_IMAGE: &str = "ghcr.io/kuack-io/checker:latest";
/// Default URL the checker workload probes
pub const DEFAULT_CHECKER_URL: &str = "https://kuack.io";

/// Harness configuration shared by every scenario in a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Chart reference passed to `helm install`
    pub chart_ref: String,
    /// Chart version, `latest` to omit the flag
    pub chart_version: String,
    /// Package-manager binary
    pub helm_binary: String,
    /// Prefix for node release names
    pub release_prefix: String,
    /// Base name of the agent release
    pub agent_release: String,
    /// Index of this parallel worker, isolates resource names
    pub shard_index: u32,
    /// Image used by checker workloads
    pub checker_image: String,
    /// URL the checker workload probes
    pub checker_url: String,
    /// Optional run identifier attached as a label
    pub test_id: Option<String>,
    /// Existing node endpoint; when set no node release is created
    pub external_node_url: Option<String>,
    /// Existing agent endpoint; when set no agent release is created
    pub external_agent_url: Option<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            chart_ref: DEFAULT_CHART.to_string(),
            chart_version: LATEST_VERSION.to_string(),
            helm_binary: "helm".to_string(),
            release_prefix: DEFAULT_RELEASE_PREFIX.to_string(),
            agent_release: DEFAULT_AGENT_RELEASE.to_string(),
            shard_index: 0,
            checker_image: DEFAULT_CHECKER_IMAGE.to_string(),
            checker_url: DEFAULT_CHECKER_URL.to_string(),
            test_id: None,
            external_node_url: None,
            external_agent_url: None,
        }
    }
}

impl HarnessConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup (used by tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty strings are treated as unset, matching how CI passes blanks
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let shard_index = match get("SHARD_INDEX").or_else(|| get("CUCUMBER_WORKER_ID")) {
            Some(raw) => raw.trim().parse::<u32>().map_err(|e| {
                Error::config(format!("invalid shard index '{}': {}", raw, e))
            })?,
            None => defaults.shard_index,
        };

        Ok(Self {
            chart_ref: get("HELM_CHART").unwrap_or(defaults.chart_ref),
            chart_version: get("HELM_CHART_VERSION").unwrap_or(defaults.chart_version),
            helm_binary: get("HELM_BIN").unwrap_or(defaults.helm_binary),
            release_prefix: get("RELEASE_PREFIX").unwrap_or(defaults.release_prefix),
            agent_release: get("AGENT_RELEASE").unwrap_or(defaults.agent_release),
            shard_index,
            checker_image: get("CHECKER_IMAGE").unwrap_or(defaults.checker_image),
            checker_url: get("CHECKER_URL").unwrap_or(defaults.checker_url),
            test_id: get("TEST_ID"),
            external_node_url: get("NODE_URL"),
            external_agent_url: get("AGENT_URL"),
        })
    }

    /// Agent release name for this worker's shard
    pub fn agent_release_name(&self) -> String {
        format!("{}-{}", self.agent_release, self.shard_index)
    }

    /// Node release name prefix for this worker's shard
    pub fn node_release_prefix(&self) -> String {
        format!("{}-{}", self.release_prefix, self.shard_index)
    }

    /// Default regex matching every release this harness creates
    pub fn release_sweep_pattern(&self) -> String {
        format!(
            "^({}|{})-[0-9]+(-[a-z0-9]+)?$",
            regex::escape(&self.release_prefix),
            regex::escape(&self.agent_release)
        )
    }
}
