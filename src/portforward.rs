//! Service port-forwarding for out-of-cluster runs
//!
//! A Service cannot be streamed to directly, so `open` resolves it to one
//! Running backing pod and registers a tunnel whose connections are piped
//! through a pod port-forward. Inside the cluster every call is a no-op;
//! callers use cluster DNS instead.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::cleanup::CleanupOutcome;
use crate::session::ClusterApi;
use crate::tunnel::{net, ConnectionHandler, TunnelRegistry, TunnelTarget};
use crate::{Error, Result};

/// How long `open` waits for the local end to accept connections
pub const READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Pipes each local connection into a fresh port-forward stream
struct PodForwarder {
    cluster: Arc<dyn ClusterApi>,
    pod: String,
    port: u16,
}

#[async_trait]
impl ConnectionHandler for PodForwarder {
    async fn handle(&self, mut socket: TcpStream) -> Result<()> {
        let mut upstream = self.cluster.port_forward(&self.pod, self.port).await?;
        let (sent, received) = tokio::io::copy_bidirectional(&mut socket, &mut upstream).await?;
        debug!(pod = %self.pod, port = self.port, sent, received, "Forwarded connection closed");
        Ok(())
    }
}

/// Label selector and numeric pod port a service port routes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRoute {
    /// `k=v,k2=v2` selector of the backing pods
    pub selector: String,
    /// Container port traffic is delivered to
    pub target_port: u16,
}

/// Resolve the backing-pod selector and target port of `service_port`
pub fn resolve_route(service: &Service, service_port: u16) -> Result<ServiceRoute> {
    let name = service.metadata.name.clone().unwrap_or_default();
    let spec = service
        .spec
        .as_ref()
        .ok_or_else(|| Error::validation(format!("Service {}", name), "missing spec"))?;

    let selector = spec
        .selector
        .as_ref()
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",")
        })
        .ok_or_else(|| Error::unsupported(format!("service {} has no pod selector", name)))?;

    let port = spec
        .ports
        .as_ref()
        .and_then(|ports| ports.iter().find(|p| p.port == i32::from(service_port)))
        .ok_or_else(|| Error::not_found("service port", format!("{}:{}", name, service_port)))?;

    let target_port = match &port.target_port {
        None => service_port,
        Some(IntOrString::Int(p)) => u16::try_from(*p).map_err(|_| {
            Error::validation(format!("Service {}", name), format!("invalid targetPort {}", p))
        })?,
        Some(IntOrString::String(named)) => {
            return Err(Error::unsupported(format!(
                "service {} port {} uses named targetPort '{}'",
                name, service_port, named
            )))
        }
    };

    Ok(ServiceRoute {
        selector,
        target_port,
    })
}

fn phase_of(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

/// Opens and closes service tunnels on local ports
#[derive(Clone)]
pub struct PortForwardManager {
    cluster: Arc<dyn ClusterApi>,
    tunnels: TunnelRegistry,
    in_cluster: bool,
    ready_timeout: Duration,
}

impl PortForwardManager {
    /// Create a manager sharing the worker's tunnel registry
    pub fn new(cluster: Arc<dyn ClusterApi>, tunnels: TunnelRegistry, in_cluster: bool) -> Self {
        Self {
            cluster,
            tunnels,
            in_cluster,
            ready_timeout: READY_TIMEOUT,
        }
    }

    /// Override how long `open` waits for readiness
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Tunnel `127.0.0.1:local_port` to `service:service_port`.
    ///
    /// Returns once a loopback connection succeeds. A leftover tunnel on the
    /// same local port is replaced.
    pub async fn open(&self, service: &str, service_port: u16, local_port: u16) -> Result<()> {
        if self.in_cluster {
            debug!(service, "In-cluster run, skipping port-forward");
            return Ok(());
        }

        self.tunnels.stop(local_port).await;
        net::assert_local_port_free(local_port)?;

        let svc = self
            .cluster
            .get_service(service)
            .await?
            .ok_or_else(|| Error::not_found("Service", service))?;
        let route = resolve_route(&svc, service_port)?;

        let pods = self.cluster.list_pods(&route.selector).await?;
        let pod = pods
            .iter()
            .find(|p| phase_of(p) == "Running" && p.metadata.deletion_timestamp.is_none())
            .and_then(|p| p.metadata.name.clone())
            .ok_or_else(|| {
                let phases: Vec<String> = pods
                    .iter()
                    .map(|p| {
                        format!(
                            "{}={}",
                            p.metadata.name.as_deref().unwrap_or("?"),
                            phase_of(p)
                        )
                    })
                    .collect();
                Error::tunnel(
                    local_port,
                    format!(
                        "no Running pod behind service {} (selector {}, observed [{}])",
                        service,
                        route.selector,
                        phases.join(", ")
                    ),
                )
            })?;

        info!(
            service,
            pod = %pod,
            service_port,
            target_port = route.target_port,
            local_port,
            "Opening port-forward"
        );

        let handler = Arc::new(PodForwarder {
            cluster: self.cluster.clone(),
            pod: pod.clone(),
            port: route.target_port,
        });
        self.tunnels
            .start(
                local_port,
                Ipv4Addr::LOCALHOST,
                TunnelTarget::new(format!("svc/{}", service), service_port),
                handler,
            )
            .await?;

        if let Err(e) = net::wait_until_connectable(local_port, self.ready_timeout).await {
            warn!(service, local_port, error = %e, "Port-forward never became ready");
            self.tunnels.stop(local_port).await;
            return Err(e);
        }
        self.tunnels.mark_ready(local_port)?;
        info!(service, local_port, "Port-forward ready");
        Ok(())
    }

    /// Stop the tunnel on `local_port`; safe if `open` never succeeded
    pub async fn close(&self, local_port: u16) -> CleanupOutcome {
        self.tunnels.stop(local_port).await
    }
}
