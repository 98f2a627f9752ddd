//! Error types for the e2e harness
//!
//! Errors carry the identifier of the resource involved (pod, release, port)
//! and, for waits, the last state that was observed before giving up.

use std::time::Duration;

use thiserror::Error;

/// Main error type for harness operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Local I/O error (sockets, service-account files)
    #[error("io error: {source}")]
    Io {
        /// The underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Session or harness configuration could not be resolved
    #[error("configuration error: {message}")]
    Config {
        /// What could not be resolved
        message: String,
    },

    /// A resource definition failed validation before it reached the cluster
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource being built
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// An external command exited unsuccessfully
    #[error("command failed ({}): {command}\n{output}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Command {
        /// The printable command line
        command: String,
        /// Exit code, `None` when terminated by a signal
        code: Option<i32>,
        /// stderr, or stdout when stderr was empty
        output: String,
    },

    /// Local tunnel could not be started or verified
    #[error("tunnel error on local port {port}: {message}")]
    Tunnel {
        /// Local port of the tunnel
        port: u16,
        /// Description of what failed
        message: String,
    },

    /// A bounded wait expired
    #[error("timed out after {waited:?} waiting for {resource}: last observed {last_state}")]
    Timeout {
        /// Resource being waited on
        resource: String,
        /// How long the wait lasted
        waited: Duration,
        /// Last state observed before the deadline
        last_state: String,
    },

    /// A feature of the target resource is not supported by the harness
    #[error("unsupported: {message}")]
    Unsupported {
        /// What is unsupported
        message: String,
    },

    /// An accessor was called before the owning component was initialized
    #[error("{what} has not been initialized")]
    NotInitialized {
        /// The uninitialized component
        what: String,
    },

    /// A tracked or remote resource does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (Pod, Service, driver session, ...)
        kind: String,
        /// Resource name
        name: String,
    },

    /// An observed cluster state contradicts what a scenario expects
    #[error("assertion failed for {subject}: {message}")]
    Assertion {
        /// Resource the assertion is about
        subject: String,
        /// What was expected and what was observed
        message: String,
    },

    /// Create was rejected because the resource already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error for a named resource
    pub fn validation(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a tunnel error for a local port
    pub fn tunnel(port: u16, msg: impl Into<String>) -> Self {
        Self::Tunnel {
            port,
            message: msg.into(),
        }
    }

    /// Create a timeout error carrying the last observed state
    pub fn timeout(
        resource: impl Into<String>,
        waited: Duration,
        last_state: impl Into<String>,
    ) -> Self {
        Self::Timeout {
            resource: resource.into(),
            waited,
            last_state: last_state.into(),
        }
    }

    /// Create an unsupported-feature error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
        }
    }

    /// Create a not-initialized error
    pub fn not_initialized(what: impl Into<String>) -> Self {
        Self::NotInitialized { what: what.into() }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an assertion failure about a resource
    pub fn assertion(subject: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Assertion {
            subject: subject.into(),
            message: msg.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Whether this error is a create conflict
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Diagnostics Always Name The Resource
    // ==========================================================================

    /// A phase timeout reports what it last saw, not a bare "timed out"
    #[test]
    fn story_timeouts_carry_last_observed_state() {
        let err = Error::timeout(
            "pod checker-abc phase Succeeded",
            Duration::from_secs(60),
            "phase Pending (reason: Unschedulable)",
        );
        let msg = err.to_string();
        assert!(msg.contains("checker-abc"));
        assert!(msg.contains("Pending"));
        assert!(msg.contains("Unschedulable"));
    }

    /// Command failures show the command line and its stderr
    #[test]
    fn story_command_failures_show_command_and_output() {
        let err = Error::Command {
            command: "helm install kuack-node-x chart".to_string(),
            code: Some(1),
            output: "Error: INSTALLATION FAILED".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("(1)"));
        assert!(msg.contains("helm install kuack-node-x"));
        assert!(msg.contains("INSTALLATION FAILED"));

        let killed = Error::Command {
            command: "helm list".to_string(),
            code: None,
            output: String::new(),
        };
        assert!(killed.to_string().contains("signal"));
    }

    #[test]
    fn accessor_errors_name_the_missing_thing() {
        assert_eq!(
            Error::not_initialized("node release").to_string(),
            "node release has not been initialized"
        );
        assert_eq!(
            Error::not_found("workload", "checker-1").to_string(),
            "workload checker-1 not found"
        );
    }

    #[test]
    fn conflict_is_detectable() {
        assert!(Error::already_exists("Pod", "p").is_already_exists());
        assert!(!Error::not_found("Pod", "p").is_already_exists());
        assert!(Error::tunnel(8080, "in use").to_string().contains("8080"));
    }
}
