//! Checks on finished workloads: log content and node placement

use tracing::info;

use super::classify::NodeClassifier;
use crate::session::ClusterApi;
use crate::{Error, Result};

/// How much of the log is quoted in a failed log assertion
const LOG_EXCERPT_CHARS: usize = 500;

/// Fail unless the pod's log contains `needle`
pub async fn assert_logs_contain(cluster: &dyn ClusterApi, pod: &str, needle: &str) -> Result<()> {
    let logs = cluster.pod_logs(pod).await?;
    if logs.contains(needle) {
        return Ok(());
    }
    let excerpt: String = logs.chars().take(LOG_EXCERPT_CHARS).collect();
    Err(Error::assertion(
        format!("pod {}", pod),
        format!("logs do not contain \"{}\"; log starts with: {}", needle, excerpt),
    ))
}

/// Fail unless the pod's log holds a successful checker report for `url`
pub async fn assert_checker_result(cluster: &dyn ClusterApi, pod: &str, url: &str) -> Result<()> {
    for needle in [
        format!("\"url\": \"{}\"", url),
        "\"total_time_ms\"".to_string(),
        "\"success\": true".to_string(),
    ] {
        assert_logs_contain(cluster, pod, &needle).await?;
    }
    Ok(())
}

async fn scheduled_node(cluster: &dyn ClusterApi, pod: &str) -> Result<String> {
    cluster
        .get_pod(pod)
        .await?
        .ok_or_else(|| Error::not_found("Pod", pod))?
        .spec
        .and_then(|s| s.node_name)
        .ok_or_else(|| Error::assertion(format!("pod {}", pod), "has not been scheduled yet"))
}

/// Fail unless the pod was scheduled onto a Kuack node; returns the node
pub async fn assert_ran_on_target(
    cluster: &dyn ClusterApi,
    classifier: &NodeClassifier,
    pod: &str,
) -> Result<String> {
    let node = scheduled_node(cluster, pod).await?;
    if !classifier.is_target_node(cluster, &node).await? {
        return Err(Error::assertion(
            format!("pod {}", pod),
            format!("scheduled on cluster node '{}', not on a Kuack node", node),
        ));
    }
    info!(pod, node = %node, "Pod ran on Kuack node");
    Ok(node)
}

/// Fail unless the pod was scheduled onto a regular cluster node; returns the node
pub async fn assert_ran_in_cluster(
    cluster: &dyn ClusterApi,
    classifier: &NodeClassifier,
    pod: &str,
) -> Result<String> {
    let node = scheduled_node(cluster, pod).await?;
    if classifier.is_target_node(cluster, &node).await? {
        return Err(Error::assertion(
            format!("pod {}", pod),
            format!("scheduled on Kuack node '{}', not in the cluster", node),
        ));
    }
    info!(pod, node = %node, "Pod ran in cluster");
    Ok(node)
}
