//! kube-census kubehub: the cluster-facing half of the enumeration engine.
//!
//! Everything that talks to the API server goes through [`ClusterApi`], so the
//! engine runs the same against a live cluster ([`KubeCluster`]) and a scripted
//! one ([`mock::MockCluster`]).

#![forbid(unsafe_code)]

use census_core::ResourceTypeDescriptor;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;
use kube::core::{DynamicObject, ObjectList};
use serde::{Deserialize, Serialize};

pub mod cluster;
pub mod context;
pub mod discovery;
pub mod error;
pub mod lister;
pub mod mock;
pub mod resolve;
pub mod retry;
pub mod throttle;

pub use cluster::KubeCluster;
pub use context::RunContext;
pub use discovery::{DiscoveredType, DiscoveryCache, DiscoveryMap};
pub use error::{CallError, EnumerateError};
pub use lister::{ListOptions, Lister, Listing};
pub use resolve::Resolver;
pub use retry::{RetryExecutor, RetryPolicy};
pub use throttle::Throttle;

/// Resources served for one group/version, as reported by the server.
#[derive(Debug, Clone)]
pub struct GroupResources {
    /// `v1` or `group/version`.
    pub group_version: String,
    pub resources: Vec<APIResource>,
}

/// A group/version the server failed to describe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupFailure {
    pub group_version: String,
    pub error: String,
}

/// Preferred resources per group/version, in server order (core first).
/// Groups that could not be described are reported alongside.
#[derive(Debug, Clone, Default)]
pub struct ServerResources {
    pub groups: Vec<GroupResources>,
    pub failures: Vec<GroupFailure>,
}

/// One list request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// `None` asks for everything in one response.
    pub limit: Option<u32>,
    pub continue_token: Option<String>,
    /// Restrict namespaced resources to one namespace.
    pub namespace: Option<String>,
}

/// The calls the engine needs from a cluster. Discovery is split per
/// group/version so one slow group is retried and timed out on its own.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// Served group/versions to discover, core first: `v1`, then each group's preferred version.
    async fn server_groups(&self) -> Result<Vec<String>, kube::Error>;

    /// Resources served under one group/version.
    async fn group_resources(&self, group_version: &str) -> Result<Vec<APIResource>, kube::Error>;

    /// Fetch one page of `resource`.
    async fn list_page(
        &self,
        resource: &ResourceTypeDescriptor,
        request: &PageRequest,
    ) -> Result<ObjectList<DynamicObject>, kube::Error>;
}
