//! Cluster session: execution-mode detection, credentials and namespace
//!
//! A session is resolved once per worker process. Inside a pod the
//! service-account mount decides everything; outside, the developer's
//! kubeconfig current context must name a namespace.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Default service-account mount inside a pod
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Filesystem locations consulted to detect in-cluster execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    /// Directory holding `token` and `namespace`
    pub service_account_dir: PathBuf,
}

impl Default for SessionPaths {
    fn default() -> Self {
        Self {
            service_account_dir: PathBuf::from(SERVICE_ACCOUNT_DIR),
        }
    }
}

impl SessionPaths {
    /// Paths rooted at a custom service-account directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            service_account_dir: dir.into(),
        }
    }

    /// Token file whose presence marks in-cluster execution
    pub fn token_path(&self) -> PathBuf {
        self.service_account_dir.join("token")
    }

    /// File holding the pod's namespace
    pub fn namespace_path(&self) -> PathBuf {
        self.service_account_dir.join("namespace")
    }
}

/// Namespace of the current pod, or `None` when not running in a cluster.
///
/// Fails when the token marker exists but the namespace file is missing or
/// empty.
pub fn in_cluster_namespace(paths: &SessionPaths) -> Result<Option<String>> {
    if !paths.token_path().exists() {
        return Ok(None);
    }
    let ns_path = paths.namespace_path();
    let namespace = read_trimmed(&ns_path)?;
    if namespace.is_empty() {
        return Err(Error::config(format!(
            "service account namespace file {} is empty",
            ns_path.display()
        )));
    }
    Ok(Some(namespace))
}

fn read_trimmed(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))
}

/// Namespace of the kubeconfig's current context
pub fn resolve_local_namespace(kubeconfig: &Kubeconfig) -> Result<String> {
    let current = kubeconfig
        .current_context
        .as_deref()
        .ok_or_else(|| Error::config("kubeconfig has no current context"))?;

    kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == current)
        .and_then(|c| c.context.as_ref())
        .and_then(|c| c.namespace.clone())
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| {
            Error::config(format!(
                "kubeconfig context '{}' does not set a namespace",
                current
            ))
        })
}

/// Established connection to the test cluster, immutable after init
#[derive(Clone)]
pub struct ClusterSession {
    client: Client,
    namespace: String,
    in_cluster: bool,
}

impl ClusterSession {
    /// Resolve a session using the default service-account location
    pub async fn init() -> Result<Self> {
        Self::init_with(&SessionPaths::default()).await
    }

    /// Resolve a session, consulting `paths` for in-cluster detection
    pub async fn init_with(paths: &SessionPaths) -> Result<Self> {
        if let Some(namespace) = in_cluster_namespace(paths)? {
            let config = Config::incluster()
                .map_err(|e| Error::config(format!("in-cluster config: {}", e)))?;
            let client = Client::try_from(config)?;
            info!(namespace = %namespace, "Using in-cluster credentials");
            return Ok(Self::new(client, namespace, true));
        }

        let kubeconfig = Kubeconfig::read()
            .map_err(|e| Error::config(format!("failed to read kubeconfig: {}", e)))?;
        let namespace = resolve_local_namespace(&kubeconfig)?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::config(format!("invalid kubeconfig: {}", e)))?;
        let client = Client::try_from(config)?;
        info!(namespace = %namespace, "Using local kubeconfig");
        Ok(Self::new(client, namespace, false))
    }

    /// Wrap an already-built client
    pub fn new(client: Client, namespace: impl Into<String>, in_cluster: bool) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            in_cluster,
        }
    }

    /// Namespace every harness resource lives in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether the harness itself runs inside the cluster
    pub fn is_in_cluster(&self) -> bool {
        self.in_cluster
    }

    /// Underlying kube client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Byte stream carried over a port-forward
pub trait ForwardIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardIo for T {}

/// Owned port-forward stream
pub type ForwardStream = Box<dyn ForwardIo>;

/// Typed cluster operations the harness needs.
///
/// No retries happen at this layer. Reads of absent objects return `None`;
/// create conflicts surface as [`Error::AlreadyExists`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Read a pod, `None` if absent
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>>;

    /// List pods matching a label selector
    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>>;

    /// Create a pod
    async fn create_pod(&self, pod: &Pod) -> Result<Pod>;

    /// Replace an existing pod definition
    async fn replace_pod(&self, name: &str, pod: &Pod) -> Result<Pod>;

    /// Delete a pod. Returns `false` when it did not exist.
    async fn delete_pod(&self, name: &str) -> Result<bool>;

    /// Read a service, `None` if absent
    async fn get_service(&self, name: &str) -> Result<Option<Service>>;

    /// Read a node, `None` if absent
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Full log of a pod's default container
    async fn pod_logs(&self, name: &str) -> Result<String>;

    /// Open a byte stream to `port` on a pod
    async fn port_forward(&self, pod: &str, port: u16) -> Result<ForwardStream>;
}

#[async_trait]
impl ClusterApi for ClusterSession {
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods().get_opt(name).await?)
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .pods()
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        match self.pods().create(&PostParams::default(), pod).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::already_exists("Pod", name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_pod(&self, name: &str, pod: &Pod) -> Result<Pod> {
        Ok(self
            .pods()
            .replace(name, &PostParams::default(), pod)
            .await?)
    }

    async fn delete_pod(&self, name: &str) -> Result<bool> {
        match self.pods().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_service(&self, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn pod_logs(&self, name: &str) -> Result<String> {
        Ok(self.pods().logs(name, &LogParams::default()).await?)
    }

    async fn port_forward(&self, pod: &str, port: u16) -> Result<ForwardStream> {
        let mut forwarder = self.pods().portforward(pod, &[port]).await?;
        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| Error::tunnel(port, format!("no stream for pod {} port {}", pod, port)))?;

        // The forwarder task ends once the stream is closed
        let pod = pod.to_string();
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                debug!(pod = %pod, port, error = %e, "Port-forward ended with error");
            }
        });

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_account(namespace: Option<&str>) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "eyJhbGciOi...").unwrap();
        if let Some(ns) = namespace {
            std::fs::write(dir.path().join("namespace"), ns).unwrap();
        }
        dir
    }

    // ==========================================================================
    // Story: Inside a pod, the service-account mount decides the namespace
    // ==========================================================================

    #[test]
    fn story_token_marker_selects_in_cluster_mode() {
        let dir = service_account(Some("kuack-e2e\n"));
        let ns = in_cluster_namespace(&SessionPaths::new(dir.path())).unwrap();
        assert_eq!(ns.as_deref(), Some("kuack-e2e"));
    }

    #[test]
    fn story_missing_token_means_local_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("namespace"), "ignored").unwrap();
        let ns = in_cluster_namespace(&SessionPaths::new(dir.path())).unwrap();
        assert!(ns.is_none());
    }

    #[test]
    fn story_token_without_namespace_file_is_a_config_error() {
        let dir = service_account(None);
        let err = in_cluster_namespace(&SessionPaths::new(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        let empty = service_account(Some("  "));
        let err = in_cluster_namespace(&SessionPaths::new(empty.path())).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn default_paths_point_at_the_standard_mount() {
        let paths = SessionPaths::default();
        assert_eq!(
            paths.token_path(),
            PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
        );
    }

    // ==========================================================================
    // Story: Locally, the current kubeconfig context must name a namespace
    // ==========================================================================

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
- name: kind
  cluster:
    server: https://127.0.0.1:6443
users:
- name: admin
  user:
    token: abc
contexts:
- name: dev
  context:
    cluster: kind
    user: admin
    namespace: kuack-dev
- name: bare
  context:
    cluster: kind
    user: admin
"#;

    #[test]
    fn story_namespace_comes_from_current_context() {
        let config = Kubeconfig::from_yaml(KUBECONFIG).unwrap();
        assert_eq!(resolve_local_namespace(&config).unwrap(), "kuack-dev");
    }

    #[test]
    fn story_context_without_namespace_fails_instead_of_defaulting() {
        let mut config = Kubeconfig::from_yaml(KUBECONFIG).unwrap();
        config.current_context = Some("bare".to_string());
        let err = resolve_local_namespace(&config).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("bare"));

        config.current_context = None;
        assert!(resolve_local_namespace(&config).is_err());
    }
}
