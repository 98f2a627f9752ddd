//! Helm release lifecycle
//!
//! Releases are installed with `--wait` so install returning means the chart's
//! workloads are up. Deletion is best-effort and reports instead of raising;
//! a release that is already gone is not a failure.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::cleanup::{CleanupOutcome, CleanupReport};
use crate::config::LATEST_VERSION;
use crate::{Error, Result};

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stderr, falling back to stdout when stderr is empty
    pub fn diagnostics(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// Runs external programs to completion
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and capture its output
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(program).args(args).output().await?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// A release to install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseSpec {
    /// Release name, unique per scenario
    pub name: String,
    /// Chart reference (OCI, repo/chart or path)
    pub chart_ref: String,
    /// Chart version; `latest` omits the flag
    pub version: String,
    /// Ordered `--set` overrides
    pub values: Vec<(String, String)>,
}

impl ReleaseSpec {
    /// New spec tracking the latest chart version
    pub fn new(name: impl Into<String>, chart_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chart_ref: chart_ref.into(),
            version: LATEST_VERSION.to_string(),
            values: Vec::new(),
        }
    }

    /// Pin a chart version
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Add a `--set key=value` override
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.push((key.into(), value.into()));
        self
    }

    /// Arguments for `helm install` into `namespace`
    pub fn install_args(&self, namespace: &str) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            self.name.clone(),
            self.chart_ref.clone(),
        ];
        if self.version != LATEST_VERSION {
            args.push("--version".to_string());
            args.push(self.version.clone());
        }
        args.extend([
            "--namespace".to_string(),
            namespace.to_string(),
            "--wait".to_string(),
        ]);
        for (key, value) in &self.values {
            args.push("--set".to_string());
            args.push(format!("{}={}", key, value));
        }
        args
    }
}

/// Installs and removes releases in one namespace
#[derive(Clone)]
pub struct ReleaseManager {
    runner: Arc<dyn CommandRunner>,
    namespace: String,
    binary: String,
}

impl ReleaseManager {
    /// Create a manager for `namespace` using `binary` (usually `helm`)
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        namespace: impl Into<String>,
        binary: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            namespace: namespace.into(),
            binary: binary.into(),
        }
    }

    /// Namespace releases are installed into
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn helm(&self, args: Vec<String>) -> Result<CommandOutput> {
        debug!(binary = %self.binary, args = ?args, "Running helm");
        self.runner.run(&self.binary, &args).await
    }

    fn command_line(&self, args: &[String]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    /// Install a release and wait for its resources
    pub async fn install(&self, spec: &ReleaseSpec) -> Result<()> {
        info!(
            release = %spec.name,
            chart = %spec.chart_ref,
            version = %spec.version,
            namespace = %self.namespace,
            "Installing release"
        );
        let args = spec.install_args(&self.namespace);
        let output = self.helm(args.clone()).await?;
        if !output.success() {
            return Err(Error::Command {
                command: self.command_line(&args),
                code: output.code,
                output: output.diagnostics().to_string(),
            });
        }
        info!(release = %spec.name, "Release installed");
        Ok(())
    }

    /// Uninstall a release. Never raises.
    pub async fn delete(&self, name: &str) -> CleanupOutcome {
        let args = vec![
            "uninstall".to_string(),
            name.to_string(),
            "--namespace".to_string(),
            self.namespace.clone(),
            "--wait".to_string(),
        ];

        let output = match self.helm(args).await {
            Ok(output) => output,
            Err(e) => {
                warn!(release = %name, error = %e, "Failed to run uninstall");
                return CleanupOutcome::Failed(e.to_string());
            }
        };

        if output.success() {
            info!(release = %name, "Release deleted");
            CleanupOutcome::Removed
        } else if output.stderr.contains("not found") {
            debug!(release = %name, "Release already absent");
            CleanupOutcome::AlreadyAbsent
        } else {
            let reason = output.diagnostics().to_string();
            warn!(release = %name, code = ?output.code, reason = %reason, "Release deletion failed");
            CleanupOutcome::Failed(reason)
        }
    }

    /// Names of every release in the namespace, including failed ones
    pub async fn list(&self) -> Result<Vec<String>> {
        let args = vec![
            "list".to_string(),
            "--namespace".to_string(),
            self.namespace.clone(),
            "--all".to_string(),
            "--short".to_string(),
        ];
        let output = self.helm(args.clone()).await?;
        if !output.success() {
            return Err(Error::Command {
                command: self.command_line(&args),
                code: output.code,
                output: output.diagnostics().to_string(),
            });
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Delete every release whose name matches `pattern`, concurrently.
    ///
    /// Fails only when the pattern is invalid or listing fails; individual
    /// deletion failures are recorded in the report.
    pub async fn cleanup(&self, pattern: &str) -> Result<CleanupReport> {
        let re = Regex::new(pattern)
            .map_err(|e| Error::config(format!("invalid release pattern '{}': {}", pattern, e)))?;

        let matching: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .filter(|name| re.is_match(name))
            .collect();

        info!(count = matching.len(), pattern, "Sweeping releases");
        let outcomes = join_all(matching.iter().map(|name| self.delete(name))).await;

        let mut report = CleanupReport::new();
        for (name, outcome) in matching.into_iter().zip(outcomes) {
            report.record(format!("release/{}", name), outcome);
        }
        report.log_failures("release sweep");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(stdout: &str) -> Result<CommandOutput> {
        Ok(CommandOutput {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    fn failed(stderr: &str) -> Result<CommandOutput> {
        Ok(CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    fn manager(runner: MockCommandRunner) -> ReleaseManager {
        ReleaseManager::new(Arc::new(runner), "kuack-e2e", "helm")
    }

    // ==========================================================================
    // Story: Install command line
    // ==========================================================================

    #[test]
    fn story_latest_version_omits_flag() {
        let spec = ReleaseSpec::new("kuack-node-0-abc", "oci://ghcr.io/kuack-io/charts/kuack")
            .set("agent.enabled", "false")
            .set("fullnameOverride", "kuack-node-0-abc");
        assert_eq!(
            spec.install_args("e2e"),
            vec![
                "install",
                "kuack-node-0-abc",
                "oci://ghcr.io/kuack-io/charts/kuack",
                "--namespace",
                "e2e",
                "--wait",
                "--set",
                "agent.enabled=false",
                "--set",
                "fullnameOverride=kuack-node-0-abc",
            ]
        );
    }

    #[test]
    fn story_pinned_version_is_passed() {
        let spec = ReleaseSpec::new("r", "chart").version("0.4.2");
        let args = spec.install_args("ns");
        let idx = args.iter().position(|a| a == "--version").unwrap();
        assert_eq!(args[idx + 1], "0.4.2");
    }

    // ==========================================================================
    // Story: Install failures surface the tool's diagnostics
    // ==========================================================================

    #[tokio::test]
    async fn story_install_runs_helm_with_wait() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|program, args| {
            assert_eq!(program, "helm");
            assert_eq!(args[0], "install");
            assert!(args.contains(&"--wait".to_string()));
            ok("")
        });

        manager(runner)
            .install(&ReleaseSpec::new("kuack-node-0-abc", "chart"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_install_failure_carries_stderr() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _| failed("Error: INSTALLATION FAILED: chart not reachable"));

        let err = manager(runner)
            .install(&ReleaseSpec::new("kuack-node-0-abc", "chart"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Command { code: Some(1), .. }));
        let msg = err.to_string();
        assert!(msg.contains("chart not reachable"));
        assert!(msg.contains("helm install kuack-node-0-abc"));
    }

    // ==========================================================================
    // Story: Deleting is idempotent and never raises
    // ==========================================================================

    #[tokio::test]
    async fn story_delete_twice_is_removed_then_absent() {
        let mut runner = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| ok("release \"kuack-node-0-abc\" uninstalled"));
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| failed("Error: uninstall: Release not loaded: kuack-node-0-abc: release: not found"));

        let releases = manager(runner);
        assert_eq!(releases.delete("kuack-node-0-abc").await, CleanupOutcome::Removed);
        assert_eq!(
            releases.delete("kuack-node-0-abc").await,
            CleanupOutcome::AlreadyAbsent
        );
    }

    #[tokio::test]
    async fn story_other_delete_failures_are_reported_not_raised() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _| failed("Error: Kubernetes cluster unreachable"));

        let outcome = manager(runner).delete("kuack-node-0-abc").await;
        assert!(matches!(outcome, CleanupOutcome::Failed(ref r) if r.contains("unreachable")));
    }

    #[tokio::test]
    async fn story_spawn_failure_is_reported_not_raised() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _| {
            Err(Error::from(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "helm: not on PATH",
            )))
        });

        let outcome = manager(runner).delete("x").await;
        assert!(!outcome.is_clean());
    }

    // ==========================================================================
    // Story: Crash-recovery sweep by name pattern
    // ==========================================================================

    #[tokio::test]
    async fn story_sweep_deletes_only_matching_releases() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, args| match args[0].as_str() {
            "list" => ok("kuack-node-0-abc\nprometheus\nkuack-agent-1\n\n"),
            "uninstall" if args[1] == "kuack-agent-1" => failed("Error: timed out waiting"),
            "uninstall" => {
                assert_ne!(args[1], "prometheus");
                ok("")
            }
            other => panic!("unexpected helm command {}", other),
        });

        let report = manager(runner)
            .cleanup(r"^kuack-(node|agent)-[0-9]+")
            .await
            .unwrap();

        assert_eq!(report.len(), 2);
        assert_eq!(
            report.outcome("release/kuack-node-0-abc"),
            Some(&CleanupOutcome::Removed)
        );
        assert!(!report.outcome("release/kuack-agent-1").unwrap().is_clean());
        assert!(report.outcome("release/prometheus").is_none());
    }

    #[tokio::test]
    async fn story_invalid_sweep_pattern_is_a_config_error() {
        let runner = MockCommandRunner::new();
        let err = manager(runner).cleanup("(unclosed").await.unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
