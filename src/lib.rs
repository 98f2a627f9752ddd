//! Kuack E2E - environment lifecycle for Kuack end-to-end scenarios
//!
//! Scenarios run against a live Kubernetes cluster, either from a developer
//! machine (reached through port-forward tunnels) or from a pod inside the
//! cluster (reached over service DNS). Each parallel worker owns an agent
//! release; each scenario owns a node release, its workloads and its driver
//! sessions, and tears all of them down when it finishes.
//!
//! # Modules
//!
//! - [`config`] - Environment-derived harness configuration
//! - [`session`] - Cluster connection and the [`session::ClusterApi`] seam
//! - [`tunnel`] - Local TCP listeners forwarding into the cluster
//! - [`portforward`] - Service port-forwards built on tunnels
//! - [`release`] - Helm release install, delete and sweep
//! - [`workload`] - Checker pods, phase polling and placement assertions
//! - [`scenario`] - Per-scenario resource registry and teardown
//! - [`worker`] - Per-worker context and crash-recovery sweep
//! - [`logs`] - Console logging and per-step log capture
//! - [`driver`] - External UI driver sessions
//! - [`cleanup`] - Best-effort teardown reporting
//! - [`error`] - Error types for the harness

#![deny(missing_docs)]

pub mod cleanup;
pub mod config;
pub mod driver;
pub mod error;
pub mod logs;
pub mod names;
pub mod portforward;
pub mod release;
pub mod scenario;
pub mod session;
pub mod tunnel;
pub mod worker;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// HTTP port the node service listens on
pub const NODE_HTTP_PORT: u16 = 8080;

/// HTTP port the agent service listens on
pub const AGENT_HTTP_PORT: u16 = 8080;
