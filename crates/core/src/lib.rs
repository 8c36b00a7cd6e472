//! kube-census core types: resource descriptors, normalized records and run summaries.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod tables;

pub use tables::{table_for, CUSTOM_RESOURCE_TABLE};

pub mod prelude {
    pub use super::{
        NormalizedRecord, RecordMetadata, ResourceTypeDescriptor, RunStatus, RunSummary, StopReason, TaskResult,
        TypeResult,
    };
    pub use super::tables::table_for;
}

/// A fully resolved, listable resource type (group/version/resource plus kind and scope).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceTypeDescriptor {
    pub group: String,
    pub version: String,
    /// Plural resource name as served, e.g. `deployments`.
    pub resource: String,
    pub kind: String,
    pub namespaced: bool,
}

impl ResourceTypeDescriptor {
    /// `v1` for the core group, `group/version` otherwise.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Identifier used in logs and failure lists: `pods`, `deployments.apps`.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        }
    }
}

impl fmt::Display for ResourceTypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.resource)
    }
}

/// Labels and annotations, attached to a record only on request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordMetadata {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// One enumerated object, reduced to the fields every kind shares.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedRecord {
    /// Lower-cased kind, e.g. `pod`.
    pub kind: String,
    pub object_name: String,
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    pub uid: String,
    /// RFC3339; empty when the server did not report one.
    pub creation_timestamp: String,
    pub resource_version: String,
    pub api_version: String,
    /// Never empty; see [`tables::table_for`].
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RecordMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
}

/// Why a run (or one of its operations) stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The wall-clock budget for the whole run elapsed.
    HardDeadline,
    /// No page completed within the idle window.
    IdleTimeout { window_secs: u64 },
    /// An OS termination signal arrived.
    Signal { name: &'static str },
    /// The caller cancelled the run.
    Cancelled,
    /// The consumer of streamed records went away.
    SinkClosed,
}

impl StopReason {
    pub fn idle(window: Duration) -> Self {
        Self::IdleTimeout { window_secs: window.as_secs() }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HardDeadline => f.write_str("hard deadline exceeded"),
            Self::IdleTimeout { window_secs } => write!(f, "idle timeout: no progress for {}s", window_secs),
            Self::Signal { name } => write!(f, "received {}", name),
            Self::Cancelled => f.write_str("cancelled by caller"),
            Self::SinkClosed => f.write_str("record sink closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    PartialFailure,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::PartialFailure => "partial_failure",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome for one resource type attempted during a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeResult {
    /// Descriptor key, e.g. `deployments.apps`.
    pub resource: String,
    pub table: String,
    pub item_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final verdict of a run. Built once, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub status: RunStatus,
    pub total_items: u64,
    pub per_table_counts: BTreeMap<String, u64>,
    pub failed_type_names: Vec<String>,
    /// Human-readable cause; empty for completed runs.
    pub reason: String,
    pub resource_results: Vec<TypeResult>,
    /// Group/versions the server could not describe during discovery.
    pub degraded_groups: Vec<String>,
    pub elapsed_ms: u64,
}

impl RunSummary {
    /// Summary for a run that could not enumerate anything.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            total_items: 0,
            per_table_counts: BTreeMap::new(),
            failed_type_names: Vec::new(),
            reason: reason.into(),
            resource_results: Vec::new(),
            degraded_groups: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Per-resource slot of a [`TaskResult`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceTaskResult {
    pub item_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Shape used by the worker that invokes the engine: integration -> resource type -> outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskResult {
    pub integrations: BTreeMap<String, BTreeMap<String, ResourceTaskResult>>,
}

impl TaskResult {
    /// Fold a run summary under `integration`. Repeated resources add up.
    pub fn from_summary(integration: &str, summary: &RunSummary) -> Self {
        let mut out = Self::default();
        out.merge(integration, summary);
        out
    }

    pub fn merge(&mut self, integration: &str, summary: &RunSummary) {
        let slot = self.integrations.entry(integration.to_string()).or_default();
        for r in &summary.resource_results {
            let entry = slot.entry(r.resource.clone()).or_default();
            entry.item_count += r.item_count;
            if r.error.is_some() {
                entry.error = r.error.clone();
            }
        }
    }

    pub fn total_items(&self) -> u64 {
        self.integrations.values().flat_map(|m| m.values()).map(|r| r.item_count).sum()
    }
}
