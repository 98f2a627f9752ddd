//! Pod phase polling
//!
//! Phases are only ever observed, never inferred: a pod reported `Running`
//! is `Running` even if its containers are about to exit.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::PodPhase;
use crate::session::ClusterApi;
use crate::{Error, Result};

/// Default interval between phase observations
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default time a checker gets to reach its target phase
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(60);

/// A bounded wait for a pod phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseWait {
    /// Give up after this long
    pub timeout: Duration,
    /// Delay between observations
    pub interval: Duration,
}

impl Default for PhaseWait {
    fn default() -> Self {
        Self::new(DEFAULT_PHASE_TIMEOUT)
    }
}

impl PhaseWait {
    /// Wait up to `timeout` at the default interval
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the polling interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll `name` until it reports `target`.
    ///
    /// Fails immediately if the pod reaches a different terminal phase,
    /// otherwise with [`Error::Timeout`] carrying the last observation.
    /// API errors during the wait count as transient.
    pub async fn wait(&self, cluster: &dyn ClusterApi, name: &str, target: PodPhase) -> Result<Pod> {
        let start = Instant::now();
        let mut last = String::from("no observation");

        loop {
            match cluster.get_pod(name).await {
                Ok(Some(pod)) => {
                    let phase = PodPhase::of(&pod);
                    if phase == target {
                        debug!(pod = %name, phase = %phase, elapsed = ?start.elapsed(), "Pod reached phase");
                        return Ok(pod);
                    }
                    if phase.is_terminal() {
                        return Err(Error::assertion(
                            format!("pod {}", name),
                            format!("ended in {} while waiting for {}", describe(&pod), target),
                        ));
                    }
                    trace!(pod = %name, phase = %phase, "Waiting for phase");
                    last = describe(&pod);
                }
                Ok(None) => {
                    last = "pod absent".to_string();
                }
                Err(e) => {
                    trace!(pod = %name, error = %e, "Phase poll failed (retrying)");
                    last = format!("api error: {}", e);
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(Error::timeout(
                    format!("pod {} phase {}", name, target),
                    self.timeout,
                    last,
                ));
            }
            tokio::time::sleep(self.interval.min(self.timeout - elapsed)).await;
        }
    }
}

/// Poll at the default interval until `name` reports `target`
pub async fn wait_for_phase(
    cluster: &dyn ClusterApi,
    name: &str,
    target: PodPhase,
    timeout: Duration,
) -> Result<Pod> {
    PhaseWait::new(timeout).wait(cluster, name, target).await
}

fn describe(pod: &Pod) -> String {
    let status = pod.status.as_ref();
    let reason = status.and_then(|s| s.reason.as_deref()).unwrap_or("none");
    let message = status.and_then(|s| s.message.as_deref()).unwrap_or("none");
    format!(
        "phase {} (reason: {}, message: {})",
        PodPhase::of(pod),
        reason,
        message
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MockClusterApi;
    use k8s_openapi::api::core::v1::PodStatus;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn pod_in(phase: &str, reason: Option<&str>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                reason: reason.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn scripted(phases: Vec<&'static str>) -> MockClusterApi {
        let script = Mutex::new(phases.into_iter().collect::<VecDeque<_>>());
        let mut mock = MockClusterApi::new();
        mock.expect_get_pod().returning(move |_| {
            let mut script = script.lock().unwrap();
            let phase = if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script[0]
            };
            Ok(Some(pod_in(phase, None)))
        });
        mock
    }

    fn fast(timeout_ms: u64) -> PhaseWait {
        PhaseWait::new(Duration::from_millis(timeout_ms)).with_interval(Duration::from_millis(5))
    }

    // ==========================================================================
    // Story: Waiting for a checker to finish
    // ==========================================================================

    #[tokio::test]
    async fn story_pending_running_succeeded() {
        let mock = scripted(vec!["Pending", "Running", "Succeeded"]);
        let pod = fast(1_000)
            .wait(&mock, "checker", PodPhase::Succeeded)
            .await
            .unwrap();
        assert_eq!(PodPhase::of(&pod), PodPhase::Succeeded);
    }

    #[tokio::test]
    async fn story_timeout_names_last_phase_and_reason() {
        let mut mock = MockClusterApi::new();
        mock.expect_get_pod()
            .returning(|_| Ok(Some(pod_in("Pending", Some("Unschedulable")))));

        let err = fast(50)
            .wait(&mock, "checker-edge-7", PodPhase::Succeeded)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        let msg = err.to_string();
        assert!(msg.contains("checker-edge-7"));
        assert!(msg.contains("Pending"));
        assert!(msg.contains("Unschedulable"));
    }

    #[tokio::test]
    async fn story_wrong_terminal_phase_fails_fast() {
        let mock = scripted(vec!["Running", "Failed"]);
        let started = Instant::now();
        let err = fast(10_000)
            .wait(&mock, "checker", PodPhase::Succeeded)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Assertion { .. }));
        assert!(err.to_string().contains("Failed"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn story_transient_api_errors_are_retried() {
        let calls = Mutex::new(0u32);
        let mut mock = MockClusterApi::new();
        mock.expect_get_pod().returning(move |_| {
            let mut n = calls.lock().unwrap();
            *n += 1;
            match *n {
                1 => Err(Error::config("connection reset")),
                2 => Ok(None),
                _ => Ok(Some(pod_in("Running", None))),
            }
        });

        fast(1_000)
            .wait(&mock, "checker", PodPhase::Running)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_absent_pod_times_out_as_absent() {
        let mut mock = MockClusterApi::new();
        mock.expect_get_pod().returning(|_| Ok(None));

        let err = fast(30)
            .wait(&mock, "ghost", PodPhase::Running)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pod absent"));
    }
}
