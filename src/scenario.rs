//! Per-scenario resource registry
//!
//! A [`ScenarioRegistry`] is the unit of isolation: it owns the node release
//! under test, the workloads deployed against it, the tunnel that exposes it
//! and any driver sessions pointed at it. Teardown is staged and best-effort:
//!
//! ```text
//! drivers (concurrent) -> tunnel -> workloads (concurrent) -> release
//! ```
//!
//! Every stage runs even if an earlier one failed, and nothing propagates;
//! the [`CleanupReport`] says what was left behind.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupOutcome, CleanupReport};
use crate::config::HarnessConfig;
use crate::driver::{DriverSession, Evidence};
use crate::names;
use crate::portforward::PortForwardManager;
use crate::release::{ReleaseManager, ReleaseSpec};
use crate::session::ClusterApi;
use crate::tunnel::net;
use crate::workload::{self, NodeClassifier, PhaseWait, PodPhase, WorkloadFactory};
use crate::{Error, Result, NODE_HTTP_PORT};

/// Selector for node pods when an external node is used
const EXTERNAL_NODE_SELECTOR: &str = "app.kubernetes.io/name=kuack-node";

/// Lifecycle of a scenario registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioState {
    /// Created, `init` not called
    Uninitialized,
    /// `init` in progress
    Initializing,
    /// Release installed and reachable
    Ready,
    /// `init` failed; only `destroy` is meaningful
    Failed,
    /// `destroy` in progress
    TearingDown,
    /// Every resource released (or reported)
    Destroyed,
}

/// Shared collaborators a scenario is built from
#[derive(Clone)]
pub struct ScenarioEnv {
    /// Typed cluster access
    pub cluster: Arc<dyn ClusterApi>,
    /// Namespace releases and workloads live in
    pub namespace: String,
    /// Whether the harness runs inside the cluster
    pub in_cluster: bool,
    /// Release install/delete
    pub releases: ReleaseManager,
    /// Service tunnels
    pub forwards: PortForwardManager,
    /// Harness configuration
    pub config: Arc<HarnessConfig>,
}

/// Resources acquired by one scenario
pub struct ScenarioRegistry {
    env: ScenarioEnv,
    state: ScenarioState,
    factory: WorkloadFactory,
    classifier: NodeClassifier,
    release_name: Option<String>,
    // Set before install so a half-created release is still deleted
    installed_release: Option<String>,
    endpoint: Option<String>,
    local_port: Option<u16>,
    workloads: Vec<(String, Pod)>,
    drivers: Vec<(String, Arc<dyn DriverSession>)>,
}

impl ScenarioRegistry {
    /// New, uninitialized registry
    pub fn new(env: ScenarioEnv) -> Self {
        let factory = WorkloadFactory::from_config(&env.config);
        Self {
            env,
            state: ScenarioState::Uninitialized,
            factory,
            classifier: NodeClassifier::default(),
            release_name: None,
            installed_release: None,
            endpoint: None,
            local_port: None,
            workloads: Vec::new(),
            drivers: Vec::new(),
        }
    }

    /// Replace the node classifier used by placement checks
    pub fn with_classifier(mut self, classifier: NodeClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> ScenarioState {
        self.state
    }

    /// Cluster access shared with the worker
    pub fn cluster(&self) -> &dyn ClusterApi {
        self.env.cluster.as_ref()
    }

    /// Classifier used for placement checks
    pub fn classifier(&self) -> &NodeClassifier {
        &self.classifier
    }

    /// Checker factory for this scenario
    pub fn factory(&self) -> &WorkloadFactory {
        &self.factory
    }

    /// Install the node release and make it reachable.
    ///
    /// On failure the registry moves to `Failed`; `destroy` still rolls back
    /// whatever was created.
    pub async fn init(&mut self, feature: &str, scenario: &str) -> Result<()> {
        if self.state != ScenarioState::Uninitialized {
            return Err(Error::validation(
                "scenario",
                format!("init called in state {:?}", self.state),
            ));
        }
        self.state = ScenarioState::Initializing;

        match self.init_release(feature, scenario).await {
            Ok(()) => {
                self.state = ScenarioState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!(feature, scenario, error = %e, "Scenario init failed");
                self.state = ScenarioState::Failed;
                Err(e)
            }
        }
    }

    async fn init_release(&mut self, feature: &str, scenario: &str) -> Result<()> {
        let config = self.env.config.clone();
        let name = format!("{}-{}", config.node_release_prefix(), names::random_suffix(10));
        self.release_name = Some(name.clone());

        if let Some(url) = &config.external_node_url {
            info!(url = %url, "Using external node, skipping release");
            self.endpoint = Some(url.clone());
            return Ok(());
        }

        // Escaped dot keeps "kuack.io/..." a single key segment
        let mut spec = ReleaseSpec::new(&name, &config.chart_ref)
            .version(&config.chart_version)
            .set("agent.enabled", "false")
            .set("fullnameOverride", &name)
            .set(r"global.labels.kuack\.io/feature", names::sanitize(feature))
            .set(r"global.labels.kuack\.io/scenario", names::sanitize(scenario));
        if let Some(test_id) = &config.test_id {
            spec = spec.set(r"global.labels.kuack\.io/test-id", names::sanitize(test_id));
        }

        self.installed_release = Some(name.clone());
        self.env.releases.install(&spec).await?;

        let endpoint = if self.env.in_cluster {
            format!(
                "http://{}.{}.svc.cluster.local:{}/",
                name, self.env.namespace, NODE_HTTP_PORT
            )
        } else {
            let port = net::find_free_port().await?;
            self.local_port = Some(port);
            self.env.forwards.open(&name, NODE_HTTP_PORT, port).await?;
            format!("http://localhost:{}/", port)
        };

        info!(release = %name, endpoint = %endpoint, "Node release ready");
        self.endpoint = Some(endpoint);
        Ok(())
    }

    fn require_ready(&self, what: &str) -> Result<()> {
        if self.state == ScenarioState::Ready {
            Ok(())
        } else {
            Err(Error::not_initialized(what))
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// URL the node under test is reachable at
    pub fn release_endpoint(&self) -> Result<&str> {
        self.endpoint
            .as_deref()
            .ok_or_else(|| Error::not_initialized("node release"))
    }

    /// Name of the node release (also the node's registered name)
    pub fn release_name(&self) -> Result<&str> {
        self.release_name
            .as_deref()
            .ok_or_else(|| Error::not_initialized("node release"))
    }

    /// A tracked workload by name
    pub fn workload(&self, name: &str) -> Result<&Pod> {
        self.workloads
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
            .ok_or_else(|| Error::not_found("workload", name))
    }

    /// Every tracked workload, in deployment order
    pub fn workloads(&self) -> Vec<&Pod> {
        self.workloads.iter().map(|(_, p)| p).collect()
    }

    /// Names of tracked workloads, in deployment order
    pub fn workload_names(&self) -> Vec<&str> {
        self.workloads.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// The only tracked workload; fails unless exactly one exists
    pub fn single_workload(&self) -> Result<&Pod> {
        match self.workloads.as_slice() {
            [(_, pod)] => Ok(pod),
            other => Err(Error::assertion(
                "scenario workloads",
                format!("expected exactly one workload, found {}", other.len()),
            )),
        }
    }

    /// A registered driver session by name
    pub fn driver(&self, name: &str) -> Result<Arc<dyn DriverSession>> {
        self.drivers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| Error::not_found("driver session", name))
    }

    /// Names of registered driver sessions
    pub fn driver_names(&self) -> Vec<&str> {
        self.drivers.iter().map(|(n, _)| n.as_str()).collect()
    }

    // =========================================================================
    // Drivers
    // =========================================================================

    /// Track a driver session so teardown closes it
    pub fn add_driver(&mut self, name: impl Into<String>, session: Arc<dyn DriverSession>) {
        let name = name.into();
        debug!(driver = %name, "Driver session registered");
        self.drivers.push((name, session));
    }

    /// Register a session and point it at the node endpoint
    pub async fn attach_driver(
        &mut self,
        name: impl Into<String>,
        session: Arc<dyn DriverSession>,
    ) -> Result<()> {
        let endpoint = self.release_endpoint()?.to_string();
        // Registered first so a failed open is still closed on teardown
        self.add_driver(name, session.clone());
        session.open(&endpoint).await
    }

    /// Screenshots from every driver that can take one.
    ///
    /// Used when a scenario fails; individual failures are logged and skipped.
    pub async fn capture_evidence(&self) -> Vec<Evidence> {
        let shots = join_all(self.drivers.iter().map(|(_, d)| d.screenshot())).await;
        self.drivers
            .iter()
            .zip(shots)
            .filter_map(|((name, _), shot)| match shot {
                Ok(Some(png)) => Some(Evidence {
                    session: name.clone(),
                    png,
                }),
                Ok(None) => None,
                Err(e) => {
                    warn!(driver = %name, error = %e, "Screenshot failed");
                    None
                }
            })
            .collect()
    }

    // =========================================================================
    // Workloads
    // =========================================================================

    /// Track and apply a workload built elsewhere; returns its name
    pub async fn deploy(&mut self, pod: Pod) -> Result<String> {
        self.require_ready("scenario")?;
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation("pod", "metadata.name is required"))?;

        // Tracked before apply so a failed create is still swept on teardown
        if let Some(slot) = self.workloads.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = pod.clone();
        } else {
            self.workloads.push((name.clone(), pod.clone()));
        }
        workload::apply(self.env.cluster.as_ref(), &pod).await?;
        Ok(name)
    }

    /// Deploy a checker pinned to Kuack node `node`
    pub async fn deploy_targeted_workload(&mut self, node: &str) -> Result<String> {
        let name = workload::targeted_name(node);
        let pod = self.factory.targeted(&name, node)?;
        info!(pod = %name, node, "Deploying targeted checker");
        self.deploy(pod).await
    }

    /// Deploy a checker left to the default scheduler
    pub async fn deploy_ambient_workload(&mut self) -> Result<String> {
        let name = workload::ambient_name();
        let pod = self.factory.ambient(&name)?;
        info!(pod = %name, "Deploying ambient checker");
        self.deploy(pod).await
    }

    /// Wait for a tracked workload to reach `phase`
    pub async fn wait_for_workload(
        &self,
        name: &str,
        phase: PodPhase,
        timeout: Duration,
    ) -> Result<Pod> {
        self.workload(name)?;
        PhaseWait::new(timeout)
            .wait(self.env.cluster.as_ref(), name, phase)
            .await
    }

    /// Logs of every pod backing the node under test
    pub async fn node_logs(&self) -> Result<String> {
        let selector = if self.env.config.external_node_url.is_some() {
            EXTERNAL_NODE_SELECTOR.to_string()
        } else {
            format!("app.kubernetes.io/instance={}", self.release_name()?)
        };

        let pods = self.env.cluster.list_pods(&selector).await?;
        if pods.is_empty() {
            return Err(Error::not_found("node pod", selector));
        }

        let mut logs = String::new();
        for pod in &pods {
            if let Some(name) = pod.metadata.name.as_deref() {
                logs.push_str(&self.env.cluster.pod_logs(name).await?);
            }
        }
        Ok(logs)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Release everything this scenario acquired. Never fails; calling it
    /// again is a no-op.
    pub async fn destroy(&mut self) -> CleanupReport {
        let mut report = CleanupReport::new();
        if self.state == ScenarioState::Destroyed {
            return report;
        }
        self.state = ScenarioState::TearingDown;

        report.merge(self.close_drivers().await);

        if let Some(port) = self.local_port.take() {
            report.record(format!("tunnel/{}", port), self.env.forwards.close(port).await);
        }

        report.merge(self.delete_workloads().await);

        if let Some(release) = self.installed_release.take() {
            let outcome = self.env.releases.delete(&release).await;
            report.record(format!("release/{}", release), outcome);
        }

        self.endpoint = None;
        self.release_name = None;
        self.state = ScenarioState::Destroyed;
        report.log_failures("scenario teardown");
        info!(
            resources = report.len(),
            clean = report.is_clean(),
            "Scenario torn down"
        );
        report
    }

    async fn close_drivers(&mut self) -> CleanupReport {
        let drivers = std::mem::take(&mut self.drivers);
        let results = join_all(drivers.iter().map(|(_, d)| d.close())).await;

        let mut report = CleanupReport::new();
        for ((name, _), result) in drivers.iter().zip(results) {
            match result {
                Ok(()) => report.removed(format!("driver/{}", name)),
                Err(e) => report.failed(format!("driver/{}", name), e),
            }
        }
        report
    }

    async fn delete_workloads(&mut self) -> CleanupReport {
        let workloads = std::mem::take(&mut self.workloads);
        let cluster = self.env.cluster.clone();
        let results = join_all(
            workloads
                .iter()
                .map(|(name, _)| workload::delete(cluster.as_ref(), name)),
        )
        .await;

        let mut report = CleanupReport::new();
        for ((name, _), result) in workloads.iter().zip(results) {
            let outcome = match result {
                Ok(true) => CleanupOutcome::Removed,
                Ok(false) => CleanupOutcome::AlreadyAbsent,
                Err(e) => CleanupOutcome::Failed(e.to_string()),
            };
            report.record(format!("pod/{}", name), outcome);
        }
        report
    }
}
