//! Per-worker context
//!
//! Each parallel worker process bootstraps one [`WorkerContext`]: the cluster
//! session, the tunnel registry, the log capture hub and the agent release
//! shared by every scenario the worker runs. Scenarios are created from it
//! and torn down individually; the worker tears down what is left at exit.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::cleanup::{CleanupOutcome, CleanupReport};
use crate::config::HarnessConfig;
use crate::logs::{self, CaptureHub, LogCapture};
use crate::portforward::PortForwardManager;
use crate::release::{CommandRunner, ProcessRunner, ReleaseManager, ReleaseSpec};
use crate::scenario::{ScenarioEnv, ScenarioRegistry};
use crate::session::{ClusterApi, ClusterSession};
use crate::tunnel::{net, TunnelRegistry};
use crate::workload::MANAGED_BY_SELECTOR;
use crate::{Error, Result, AGENT_HTTP_PORT};

/// Worker-scoped state shared by every scenario of one process
pub struct WorkerContext {
    env: ScenarioEnv,
    tunnels: TunnelRegistry,
    capture: CaptureHub,
    agent_release: Option<String>,
    agent_endpoint: Option<String>,
}

impl WorkerContext {
    /// Resolve configuration and the cluster session, then start the agent
    pub async fn bootstrap() -> Result<Self> {
        let capture = logs::install_global_hooks();
        let config = HarnessConfig::from_env()?;
        let session = ClusterSession::init().await?;
        info!(
            namespace = %session.namespace(),
            in_cluster = session.is_in_cluster(),
            shard = config.shard_index,
            "Worker bootstrapping"
        );

        Self::from_parts(
            Arc::new(session.clone()),
            session.namespace(),
            session.is_in_cluster(),
            Arc::new(ProcessRunner),
            config,
            capture,
        )
        .start()
        .await
    }

    /// Start the agent, tearing down whatever it left behind on failure
    pub async fn start(mut self) -> Result<Self> {
        match self.start_agent().await {
            Ok(()) => Ok(self),
            Err(e) => {
                warn!(error = %e, "Agent start failed, tearing down worker");
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Assemble a context from explicit collaborators
    pub fn from_parts(
        cluster: Arc<dyn ClusterApi>,
        namespace: &str,
        in_cluster: bool,
        runner: Arc<dyn CommandRunner>,
        config: HarnessConfig,
        capture: CaptureHub,
    ) -> Self {
        let tunnels = TunnelRegistry::new();
        let env = ScenarioEnv {
            cluster: cluster.clone(),
            namespace: namespace.to_string(),
            in_cluster,
            releases: ReleaseManager::new(runner, namespace, &config.helm_binary),
            forwards: PortForwardManager::new(cluster, tunnels.clone(), in_cluster),
            config: Arc::new(config),
        };
        Self {
            env,
            tunnels,
            capture,
            agent_release: None,
            agent_endpoint: None,
        }
    }

    /// Install this worker's agent release, or adopt the external agent
    pub async fn start_agent(&mut self) -> Result<()> {
        let config = self.env.config.clone();
        if let Some(url) = &config.external_agent_url {
            info!(url = %url, "Using external agent, skipping release");
            self.agent_endpoint = Some(url.clone());
            return Ok(());
        }

        let name = config.agent_release_name();
        let spec = ReleaseSpec::new(&name, &config.chart_ref)
            .version(&config.chart_version)
            .set("node.enabled", "false")
            .set("fullnameOverride", &name);

        self.agent_release = Some(name.clone());
        self.env.releases.install(&spec).await?;

        let endpoint = if self.env.in_cluster {
            format!(
                "http://{}.{}.svc.cluster.local:{}/",
                name, self.env.namespace, AGENT_HTTP_PORT
            )
        } else {
            let port = net::find_free_port().await?;
            self.env.forwards.open(&name, AGENT_HTTP_PORT, port).await?;
            format!("http://localhost:{}/", port)
        };
        info!(release = %name, endpoint = %endpoint, "Agent ready");
        self.agent_endpoint = Some(endpoint);
        Ok(())
    }

    /// URL the agent UI is served at
    pub fn agent_endpoint(&self) -> Result<&str> {
        self.agent_endpoint
            .as_deref()
            .ok_or_else(|| Error::not_initialized("agent"))
    }

    /// Harness configuration
    pub fn config(&self) -> &HarnessConfig {
        &self.env.config
    }

    /// Tunnels opened by this worker
    pub fn tunnels(&self) -> &TunnelRegistry {
        &self.tunnels
    }

    /// A fresh, inactive capture bound to this worker's hub
    pub fn log_capture(&self) -> LogCapture {
        LogCapture::new(&self.capture)
    }

    /// A fresh scenario registry
    pub fn scenario(&self) -> ScenarioRegistry {
        ScenarioRegistry::new(self.env.clone())
    }

    /// Crash-recovery sweep using the configured release pattern
    pub async fn sweep(&self) -> Result<CleanupReport> {
        sweep(
            self.env.cluster.as_ref(),
            &self.env.releases,
            &self.env.config.release_sweep_pattern(),
        )
        .await
    }

    /// Stop every tunnel and delete the agent release. Never fails.
    pub async fn teardown(&mut self) -> CleanupReport {
        let mut report = self.tunnels.stop_all().await;
        if let Some(name) = self.agent_release.take() {
            let outcome = self.env.releases.delete(&name).await;
            report.record(format!("release/{}", name), outcome);
        }
        self.agent_endpoint = None;
        report.log_failures("worker teardown");
        report
    }
}

/// Delete every release matching `pattern` and every harness-labelled pod.
///
/// Used to recover from crashed runs; individual failures are reported, not
/// raised.
pub async fn sweep(
    cluster: &dyn ClusterApi,
    releases: &ReleaseManager,
    pattern: &str,
) -> Result<CleanupReport> {
    let mut report = releases.cleanup(pattern).await?;

    let pods = cluster.list_pods(MANAGED_BY_SELECTOR).await?;
    let names: Vec<String> = pods.into_iter().filter_map(|p| p.metadata.name).collect();
    info!(count = names.len(), "Sweeping harness pods");

    let results = join_all(names.iter().map(|n| cluster.delete_pod(n))).await;
    for (name, result) in names.iter().zip(results) {
        let outcome = match result {
            Ok(true) => CleanupOutcome::Removed,
            Ok(false) => CleanupOutcome::AlreadyAbsent,
            Err(e) => {
                warn!(pod = %name, error = %e, "Failed to delete pod");
                CleanupOutcome::Failed(e.to_string())
            }
        };
        report.record(format!("pod/{}", name), outcome);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::{CommandOutput, MockCommandRunner};
    use crate::session::MockClusterApi;
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;
    use std::sync::Mutex;

    fn ok() -> Result<CommandOutput> {
        Ok(CommandOutput {
            code: Some(0),
            ..Default::default()
        })
    }

    fn worker(
        cluster: MockClusterApi,
        runner: MockCommandRunner,
        config: HarnessConfig,
    ) -> WorkerContext {
        WorkerContext::from_parts(
            Arc::new(cluster),
            "kuack-e2e",
            true,
            Arc::new(runner),
            config,
            CaptureHub::new(),
        )
    }

    fn named(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    // ==========================================================================
    // Story: Each worker runs its own agent
    // ==========================================================================

    #[tokio::test]
    async fn story_agent_release_is_per_shard() {
        let commands = Arc::new(Mutex::new(Vec::<Vec<String>>::new()));
        let log = commands.clone();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(move |_, args| {
            log.lock().unwrap().push(args.to_vec());
            ok()
        });

        let config = HarnessConfig {
            shard_index: 3,
            ..Default::default()
        };
        let mut worker = worker(MockClusterApi::new(), runner, config);
        assert!(worker.agent_endpoint().is_err());

        worker.start_agent().await.unwrap();
        assert_eq!(
            worker.agent_endpoint().unwrap(),
            "http://kuack-agent-3.kuack-e2e.svc.cluster.local:8080/"
        );

        let report = worker.teardown().await;
        assert_eq!(
            report.outcome("release/kuack-agent-3"),
            Some(&CleanupOutcome::Removed)
        );

        let commands = commands.lock().unwrap();
        let install = commands[0].join(" ");
        assert!(install.starts_with("install kuack-agent-3 "));
        assert!(install.contains("--set node.enabled=false"));
        assert_eq!(commands[1][0], "uninstall");
    }

    #[tokio::test]
    async fn story_failed_agent_install_is_rolled_back() {
        let commands = Arc::new(Mutex::new(Vec::<Vec<String>>::new()));
        let log = commands.clone();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(move |_, args| {
            log.lock().unwrap().push(args.to_vec());
            match args[0].as_str() {
                "install" => Ok(CommandOutput {
                    code: Some(1),
                    stdout: String::new(),
                    stderr: "Error: INSTALLATION FAILED: context deadline exceeded".to_string(),
                }),
                _ => ok(),
            }
        });

        let err = worker(MockClusterApi::new(), runner, HarnessConfig::default())
            .start()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Command { .. }));

        let commands = commands.lock().unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1][0], "uninstall");
        assert_eq!(commands[1][1], "kuack-agent-0");
    }

    #[tokio::test]
    async fn story_external_agent_is_adopted() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();
        let config = HarnessConfig {
            external_agent_url: Some("http://agent.dev.local/".to_string()),
            ..Default::default()
        };
        let mut worker = worker(MockClusterApi::new(), runner, config);

        worker.start_agent().await.unwrap();
        assert_eq!(worker.agent_endpoint().unwrap(), "http://agent.dev.local/");
        assert!(worker.teardown().await.is_empty());
    }

    #[tokio::test]
    async fn story_scenarios_share_the_worker_config() {
        let worker = worker(
            MockClusterApi::new(),
            MockCommandRunner::new(),
            HarnessConfig::default(),
        );
        let scenario = worker.scenario();
        assert!(scenario.release_endpoint().is_err());
        assert!(!worker.log_capture().is_active());
    }

    // ==========================================================================
    // Story: Crash-recovery sweep
    // ==========================================================================

    #[tokio::test]
    async fn story_sweep_removes_releases_and_labelled_pods() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, args| match args[0].as_str() {
            "list" => Ok(CommandOutput {
                code: Some(0),
                stdout: "kuack-node-0-abcdefghij\nkuack-agent-0\ngrafana\n".to_string(),
                stderr: String::new(),
            }),
            _ => ok(),
        });

        let mut cluster = MockClusterApi::new();
        cluster.expect_list_pods().returning(|selector| {
            assert_eq!(selector, MANAGED_BY_SELECTOR);
            Ok(vec![named("checker-cluster-abc123"), named("checker-gone")])
        });
        cluster
            .expect_delete_pod()
            .returning(|name| Ok(name != "checker-gone"));

        let worker = worker(cluster, runner, HarnessConfig::default());
        let report = worker.sweep().await.unwrap();

        assert_eq!(report.len(), 4);
        assert!(report.is_clean());
        assert!(report.outcome("release/grafana").is_none());
        assert_eq!(
            report.outcome("pod/checker-gone"),
            Some(&CleanupOutcome::AlreadyAbsent)
        );
    }
}
