//! Discovery cache: the server's preferred resource list, indexed by kind and by name.
//!
//! Built at most once per [`DiscoveryCache`]; concurrent callers await the same
//! initialization. There is no invalidation; a new run builds a new cache.

use std::collections::HashMap;
use std::time::Instant;

use census_core::ResourceTypeDescriptor;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::context::RunContext;
use crate::error::EnumerateError;
use crate::retry::RetryExecutor;
use crate::{ClusterApi, GroupFailure, GroupResources, ServerResources};

/// A served resource type plus the discovery details resolution needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredType {
    pub descriptor: ResourceTypeDescriptor,
    pub singular: String,
    pub short_names: Vec<String>,
    pub verbs: Vec<String>,
}

impl DiscoveredType {
    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }

    pub fn listable(&self) -> bool {
        self.supports("list")
    }
}

fn split_group_version(gv: &str) -> (String, String) {
    match gv.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), gv.to_string()),
    }
}

fn discovered_from(group_version: &str, r: &APIResource) -> DiscoveredType {
    let (mut group, mut version) = split_group_version(group_version);
    if let Some(g) = r.group.as_deref().filter(|g| !g.is_empty()) {
        group = g.to_string();
    }
    if let Some(v) = r.version.as_deref().filter(|v| !v.is_empty()) {
        version = v.to_string();
    }
    DiscoveredType {
        descriptor: ResourceTypeDescriptor {
            group,
            version,
            resource: r.name.clone(),
            kind: r.kind.clone(),
            namespaced: r.namespaced,
        },
        singular: r.singular_name.clone(),
        short_names: r.short_names.clone().unwrap_or_default(),
        verbs: r.verbs.clone(),
    }
}

/// Read-only index over one discovery snapshot.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryMap {
    types: Vec<DiscoveredType>,
    /// lower(kind) -> first type serving it
    by_kind: HashMap<String, usize>,
    /// (group, lower(kind)) -> type
    by_group_kind: HashMap<(String, String), usize>,
    /// lower(plural | singular | short name | plural.group) -> type
    by_name: HashMap<String, usize>,
    degraded: Vec<GroupFailure>,
}

impl DiscoveryMap {
    /// Index `server` in discovery order. Subresources (`pods/log`) are skipped.
    pub fn build(server: ServerResources) -> Self {
        let mut map = Self { degraded: server.failures, ..Self::default() };
        for group in &server.groups {
            for r in &group.resources {
                if r.name.contains('/') {
                    continue;
                }
                map.insert(discovered_from(&group.group_version, r));
            }
        }
        map
    }

    fn insert(&mut self, t: DiscoveredType) {
        let idx = self.types.len();
        let kind = t.descriptor.kind.to_ascii_lowercase();
        self.by_kind.entry(kind.clone()).or_insert(idx);
        self.by_group_kind.entry((t.descriptor.group.clone(), kind)).or_insert(idx);

        let mut names = vec![t.descriptor.resource.to_ascii_lowercase(), t.descriptor.key().to_ascii_lowercase()];
        if !t.singular.is_empty() {
            names.push(t.singular.to_ascii_lowercase());
        }
        names.extend(t.short_names.iter().map(|s| s.to_ascii_lowercase()));
        for name in names {
            self.by_name.entry(name).or_insert(idx);
        }
        self.types.push(t);
    }

    /// All served types, in discovery order.
    pub fn types(&self) -> &[DiscoveredType] {
        &self.types
    }

    pub fn listable(&self) -> impl Iterator<Item = &DiscoveredType> {
        self.types.iter().filter(|t| t.listable())
    }

    /// Case-insensitive kind lookup; core and earlier groups win.
    pub fn kind(&self, kind: &str) -> Option<&DiscoveredType> {
        self.by_kind.get(&kind.to_ascii_lowercase()).map(|&i| &self.types[i])
    }

    pub fn group_kind(&self, group: &str, kind: &str) -> Option<&DiscoveredType> {
        self.by_group_kind
            .get(&(group.to_string(), kind.to_ascii_lowercase()))
            .map(|&i| &self.types[i])
    }

    /// `(group, kind)` for a plural, singular, short or `plural.group` resource name.
    pub fn kind_for_resource(&self, name: &str) -> Option<(&str, &str)> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .map(|&i| (self.types[i].descriptor.group.as_str(), self.types[i].descriptor.kind.as_str()))
    }

    /// Group/versions the server failed to describe.
    pub fn degraded(&self) -> &[GroupFailure] {
        &self.degraded
    }
}

#[derive(Debug, Default)]
pub struct DiscoveryCache {
    cell: OnceCell<DiscoveryMap>,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the map on first call; later calls return the same map without I/O.
    pub async fn init(
        &self,
        ctx: &RunContext,
        cluster: &dyn ClusterApi,
        retry: &RetryExecutor,
    ) -> Result<&DiscoveryMap, EnumerateError> {
        self.cell
            .get_or_try_init(|| async {
                let t0 = Instant::now();
                let group_versions = retry.execute(ctx, "discovery", || cluster.server_groups()).await?;
                ctx.touch();

                let mut server = ServerResources::default();
                let mut last_error = None;
                for gv in group_versions {
                    let operation = format!("discover {}", gv);
                    let res = retry.execute(ctx, &operation, || cluster.group_resources(&gv)).await;
                    match res {
                        Ok(resources) => server.groups.push(GroupResources { group_version: gv, resources }),
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            warn!(group_version = %gv, error = %e, "discovery failed for group; continuing with reduced coverage");
                            server.failures.push(GroupFailure { group_version: gv, error: e.to_string() });
                            last_error = Some(e);
                        }
                    }
                    ctx.touch();
                }
                if server.groups.is_empty() {
                    if let Some(e) = last_error {
                        return Err(e);
                    }
                }

                let map = DiscoveryMap::build(server);
                ctx.touch();
                metrics::histogram!("census_discovery_ms", t0.elapsed().as_secs_f64() * 1000.0);
                info!(
                    types = map.types().len(),
                    listable = map.listable().count(),
                    degraded = map.degraded().len(),
                    took_ms = %t0.elapsed().as_millis(),
                    "discovery complete"
                );
                Ok::<_, EnumerateError>(map)
            })
            .await
    }

    /// The map, if [`DiscoveryCache::init`] already succeeded.
    pub fn get(&self) -> Option<&DiscoveryMap> {
        self.cell.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::mock::{api_error, api_resource, MockCluster};
    use crate::retry::RetryPolicy;

    fn server() -> ServerResources {
        MockCluster::new()
            .with_group(
                "v1",
                vec![
                    api_resource("Pod", "pods", true, &["get", "list", "watch"]),
                    api_resource("Pod", "pods/log", true, &["get"]),
                    api_resource("Event", "events", true, &["list"]),
                    api_resource("Binding", "bindings", true, &["create"]),
                ],
            )
            .with_group("events.k8s.io/v1", vec![api_resource("Event", "events", true, &["list"])])
            .with_group("apps/v1", vec![api_resource("Deployment", "deployments", true, &["list"])])
            .discovery()
    }

    #[test]
    fn build_skips_subresources_and_keeps_order() {
        let map = DiscoveryMap::build(server());
        let keys: Vec<String> = map.types().iter().map(|t| t.descriptor.key()).collect();
        assert_eq!(keys, vec!["pods", "events", "bindings", "events.events.k8s.io", "deployments.apps"]);
        let listable: Vec<String> = map.listable().map(|t| t.descriptor.key()).collect();
        assert!(!listable.contains(&"bindings".to_string()));
    }

    #[test]
    fn kind_lookup_prefers_core_group() {
        let map = DiscoveryMap::build(server());
        let ev = map.kind("EVENT").expect("event");
        assert_eq!(ev.descriptor.group, "");
        let ev2 = map.group_kind("events.k8s.io", "event").expect("group event");
        assert_eq!(ev2.descriptor.api_version(), "events.k8s.io/v1");
        assert_eq!(map.kind_for_resource("events.events.k8s.io"), Some(("events.k8s.io", "Event")));
        assert_eq!(map.kind_for_resource("pod"), Some(("", "Pod")));
    }

    #[tokio::test]
    async fn init_runs_discovery_once() {
        let cluster = Arc::new(MockCluster::new().with_group("v1", vec![api_resource("Pod", "pods", true, &["list"])]));
        let cache = Arc::new(DiscoveryCache::new());
        let ctx = RunContext::new(None, Duration::from_secs(60));
        let retry = RetryExecutor::default();
        assert!(cache.get().is_none());

        let (a, b) = tokio::join!(
            cache.init(&ctx, cluster.as_ref(), &retry),
            cache.init(&ctx, cluster.as_ref(), &retry)
        );
        assert!(a.is_ok() && b.is_ok());
        cache.init(&ctx, cluster.as_ref(), &retry).await.expect("cached");
        assert_eq!(cluster.discover_calls(), 1);
        assert!(cache.is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn init_failure_leaves_cache_empty() {
        let cluster = MockCluster::new();
        cluster.fail_discovery(api_error(401, "Unauthorized"));
        let cache = DiscoveryCache::new();
        let ctx = RunContext::new(None, Duration::from_secs(60));
        let err = cache.init(&ctx, &cluster, &RetryExecutor::default()).await.expect_err("unauthorized");
        assert_eq!(err.status_code(), Some(401));
        assert!(!cache.is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_group_times_out_alone() {
        let cluster = MockCluster::new()
            .with_group("v1", vec![api_resource("Pod", "pods", true, &["list"])])
            .with_hung_group("metrics.k8s.io/v1beta1")
            .with_group("apps/v1", vec![api_resource("Deployment", "deployments", true, &["list"])]);
        let cache = DiscoveryCache::new();
        let ctx = RunContext::new(Some(Duration::from_secs(3600)), Duration::from_secs(600));
        let retry = RetryExecutor::new(RetryPolicy { steps: 2, call_timeout: Duration::from_secs(5), ..RetryPolicy::default() });

        let map = cache.init(&ctx, &cluster, &retry).await.expect("partial discovery");
        let keys: Vec<String> = map.types().iter().map(|t| t.descriptor.key()).collect();
        assert_eq!(keys, vec!["pods", "deployments.apps"]);
        assert_eq!(map.degraded().len(), 1);
        assert_eq!(map.degraded()[0].group_version, "metrics.k8s.io/v1beta1");
        assert!(ctx.stop_reason().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn every_group_failing_fails_discovery() {
        let cluster = MockCluster::new()
            .with_degraded_group("v1", "unavailable")
            .with_degraded_group("apps/v1", "unavailable");
        let cache = DiscoveryCache::new();
        let ctx = RunContext::new(None, Duration::from_secs(600));
        let err = cache.init(&ctx, &cluster, &RetryExecutor::default()).await.expect_err("nothing discovered");
        assert_eq!(err.status_code(), Some(503));
        assert!(!cache.is_initialized());
    }
}
