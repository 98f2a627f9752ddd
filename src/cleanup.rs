//! Best-effort cleanup results
//!
//! Teardown never raises. Instead each stage records what happened to every
//! resource it touched, so callers (and tests) can inspect leftovers without
//! scraping logs.

use std::fmt;

use serde::Serialize;
use tracing::warn;

/// What happened to a single resource during teardown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum CleanupOutcome {
    /// The resource existed and was removed
    Removed,
    /// The resource was already gone (benign)
    AlreadyAbsent,
    /// Removal failed for a reason other than absence
    Failed(String),
}

impl CleanupOutcome {
    /// Whether the resource is gone after the attempt
    pub fn is_clean(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for CleanupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Removed => write!(f, "removed"),
            Self::AlreadyAbsent => write!(f, "already absent"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// A resource identifier paired with its cleanup outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupEntry {
    /// Resource identifier, e.g. `release/kuack-node-0-x1y2` or `tunnel/54321`
    pub resource: String,
    /// What happened to it
    #[serde(flatten)]
    pub outcome: CleanupOutcome,
}

/// Ordered record of every cleanup attempt in a teardown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    entries: Vec<CleanupEntry>,
}

impl CleanupReport {
    /// Create an empty report
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome for a resource
    pub fn record(&mut self, resource: impl Into<String>, outcome: CleanupOutcome) {
        self.entries.push(CleanupEntry {
            resource: resource.into(),
            outcome,
        });
    }

    /// Record a successful removal
    pub fn removed(&mut self, resource: impl Into<String>) {
        self.record(resource, CleanupOutcome::Removed);
    }

    /// Record a failed removal
    pub fn failed(&mut self, resource: impl Into<String>, reason: impl fmt::Display) {
        self.record(resource, CleanupOutcome::Failed(reason.to_string()));
    }

    /// Append every entry of another report
    pub fn merge(&mut self, other: CleanupReport) {
        self.entries.extend(other.entries);
    }

    /// All entries in the order they were recorded
    pub fn entries(&self) -> &[CleanupEntry] {
        &self.entries
    }

    /// Outcome for a given resource, if it was touched
    pub fn outcome(&self, resource: &str) -> Option<&CleanupOutcome> {
        self.entries
            .iter()
            .find(|e| e.resource == resource)
            .map(|e| &e.outcome)
    }

    /// Entries whose removal failed
    pub fn failures(&self) -> impl Iterator<Item = &CleanupEntry> {
        self.entries.iter().filter(|e| !e.outcome.is_clean())
    }

    /// True when no entry failed
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Number of recorded entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Log every failed entry at warn level
    pub fn log_failures(&self, context: &str) {
        for entry in self.failures() {
            warn!(
                context,
                resource = %entry.resource,
                outcome = %entry.outcome,
                "Cleanup left a resource behind"
            );
        }
    }
}
