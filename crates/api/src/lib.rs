//! kube-census run orchestrator.
//!
//! [`Enumerator`] drives one run: either a single named resource type or every
//! listable type the server advertises. It aggregates per-table counts, keeps
//! going past per-type failures and stops at once when the run context fires.
//! The caller always gets a [`RunSummary`] with a definite status.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use census_core::{NormalizedRecord, ResourceTypeDescriptor, RunStatus, RunSummary, TypeResult};
use census_kubehub::{
    ClusterApi, DiscoveredType, DiscoveryCache, EnumerateError, KubeCluster, ListOptions, Lister, Listing,
    Resolver, RetryExecutor, RunContext,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub mod config;
pub mod signals;

pub use config::EngineConfig;
pub use signals::spawn_signal_listener;

/// Everything a run produced. `records` is empty in streaming mode.
#[derive(Debug)]
pub struct RunReport {
    pub records: Vec<NormalizedRecord>,
    pub summary: RunSummary,
}

impl RunReport {
    fn failed(reason: impl Into<String>) -> Self {
        Self { records: Vec::new(), summary: RunSummary::failed(reason) }
    }
}

/// Build a kube-backed cluster from `config` and run it. Client construction
/// failures come back as a `failed` summary.
pub async fn enumerate(
    config: EngineConfig,
    ctx: &RunContext,
    sink: Option<mpsc::Sender<NormalizedRecord>>,
) -> RunReport {
    match Enumerator::connect(config).await {
        Ok(enumerator) => enumerator.run(ctx, sink).await,
        Err(e) => {
            warn!(error = %e, "run: cannot build cluster client");
            RunReport::failed(e.to_string())
        }
    }
}

pub struct Enumerator {
    cluster: Arc<dyn ClusterApi>,
    cache: Arc<DiscoveryCache>,
    retry: RetryExecutor,
    config: EngineConfig,
}

impl Enumerator {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: EngineConfig) -> Self {
        Self {
            cluster,
            cache: Arc::new(DiscoveryCache::new()),
            retry: RetryExecutor::new(config.retry_policy()),
            config,
        }
    }

    /// An enumerator over the cluster `config` points at (kubeconfig context or in-cluster).
    pub async fn connect(config: EngineConfig) -> Result<Self, EnumerateError> {
        let cluster =
            KubeCluster::connect(config.context.as_deref(), config.call_timeout(), config.qps, config.burst).await?;
        Ok(Self::new(Arc::new(cluster), config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> Resolver {
        Resolver::new(self.cache.clone())
    }

    /// Listable types in discovery order, after the namespace filter.
    pub async fn discover(&self, ctx: &RunContext) -> Result<Vec<DiscoveredType>, EnumerateError> {
        let map = self.cache.init(ctx, self.cluster.as_ref(), &self.retry).await?;
        let scoped = self.config.namespace.is_some();
        Ok(map.listable().filter(|t| !scoped || t.descriptor.namespaced).cloned().collect())
    }

    /// Resolve `name`, initializing discovery if needed.
    pub async fn resolve(&self, ctx: &RunContext, name: &str) -> Result<ResourceTypeDescriptor, EnumerateError> {
        self.cache.init(ctx, self.cluster.as_ref(), &self.retry).await?;
        self.resolver().resolve(ctx, name)
    }

    /// Run once. With a `sink`, records are streamed there instead of returned.
    pub async fn run(&self, ctx: &RunContext, sink: Option<mpsc::Sender<NormalizedRecord>>) -> RunReport {
        let t0 = Instant::now();
        let opts = ListOptions { sink, ..self.config.list_options() };
        let single = self.config.resource_type.clone();
        info!(
            mode = if single.is_some() { "single" } else { "discover-all" },
            resource_type = single.as_deref().unwrap_or("-"),
            page_size = opts.page_size,
            streaming = opts.sink.is_some(),
            ns = %opts.namespace.as_deref().unwrap_or("(all)"),
            "run: start"
        );

        let mut tally = Tally::default();
        let result = match single.as_deref() {
            Some(name) => self.run_single(ctx, name, &opts, &mut tally).await,
            None => self.run_all(ctx, &opts, &mut tally).await,
        };
        let summary = tally.summarize(result, single.is_some(), t0.elapsed().as_millis() as u64);

        metrics::histogram!("census_run_ms", t0.elapsed().as_secs_f64() * 1000.0, "status" => summary.status.as_str());
        info!(
            status = %summary.status,
            items = summary.total_items,
            types = summary.resource_results.len(),
            failed = summary.failed_type_names.len(),
            took_ms = summary.elapsed_ms,
            reason = %summary.reason,
            "run: done"
        );
        RunReport { records: tally.records, summary }
    }

    async fn run_single(
        &self,
        ctx: &RunContext,
        name: &str,
        opts: &ListOptions,
        tally: &mut Tally,
    ) -> Result<(), EnumerateError> {
        let map = self.cache.init(ctx, self.cluster.as_ref(), &self.retry).await?;
        tally.note_degraded(map);
        let rt = self.resolver().resolve(ctx, name)?;
        match self.list_one(ctx, &rt, opts, tally).await {
            ControlFlow::Break(e) => Err(e),
            ControlFlow::Continue(()) => Ok(()),
        }
    }

    async fn run_all(&self, ctx: &RunContext, opts: &ListOptions, tally: &mut Tally) -> Result<(), EnumerateError> {
        let map = self.cache.init(ctx, self.cluster.as_ref(), &self.retry).await?;
        tally.note_degraded(map);
        let scoped = opts.namespace.is_some();
        let types: Vec<&DiscoveredType> = map.listable().filter(|t| !scoped || t.descriptor.namespaced).collect();
        info!(types = types.len(), "run: listing discovered types");
        for t in types {
            if let ControlFlow::Break(e) = self.list_one(ctx, &t.descriptor, opts, tally).await {
                return Err(e);
            }
        }
        Ok(())
    }

    /// List one type into `tally`. Breaks only when the whole run has to stop.
    async fn list_one(
        &self,
        ctx: &RunContext,
        rt: &ResourceTypeDescriptor,
        opts: &ListOptions,
        tally: &mut Tally,
    ) -> ControlFlow<EnumerateError> {
        let listing = Lister::new(self.cluster.as_ref(), &self.retry).list(ctx, rt, opts).await;
        match tally.absorb(rt, listing) {
            Some(e) if e.is_fatal() => ControlFlow::Break(e),
            Some(e) => {
                metrics::counter!("census_type_failures_total", 1u64, "resource" => rt.key());
                warn!(resource = %rt, error = %e, "run: resource type failed; continuing");
                ControlFlow::Continue(())
            }
            None => ControlFlow::Continue(()),
        }
    }
}

/// Accumulates per-type outcomes for the summary. Owned by a single run.
#[derive(Debug, Default)]
struct Tally {
    records: Vec<NormalizedRecord>,
    per_table: BTreeMap<String, u64>,
    results: Vec<TypeResult>,
    failed: Vec<String>,
    first_failure: Option<String>,
    succeeded: usize,
    degraded: Vec<String>,
}

impl Tally {
    fn note_degraded(&mut self, map: &census_kubehub::DiscoveryMap) {
        self.degraded = map.degraded().iter().map(|f| f.group_version.clone()).collect();
    }

    /// Fold one listing in; returns its error, if any.
    fn absorb(&mut self, rt: &ResourceTypeDescriptor, listing: Listing) -> Option<EnumerateError> {
        let table = census_core::table_for(if rt.kind.is_empty() { &rt.resource } else { &rt.kind }).to_string();
        for (t, n) in &listing.tables {
            *self.per_table.entry(t.clone()).or_default() += n;
        }
        self.records.extend(listing.records);

        let error = listing.error;
        match &error {
            None => self.succeeded += 1,
            Some(e) if e.is_fatal() => {}
            Some(e) => {
                self.failed.push(rt.key());
                self.first_failure.get_or_insert_with(|| e.to_string());
            }
        }
        self.results.push(TypeResult {
            resource: rt.key(),
            table,
            item_count: listing.count,
            error: error.as_ref().map(|e| e.to_string()),
        });
        error
    }

    fn summarize(&mut self, result: Result<(), EnumerateError>, single: bool, elapsed_ms: u64) -> RunSummary {
        let (status, reason) = match result {
            Err(e) if e.is_fatal() => (RunStatus::Interrupted, e.to_string()),
            Err(e) => (RunStatus::Failed, e.to_string()),
            Ok(()) if self.failed.is_empty() => (RunStatus::Completed, String::new()),
            Ok(()) => {
                let first = self.first_failure.clone().unwrap_or_default();
                if single || self.succeeded == 0 {
                    (RunStatus::Failed, first)
                } else {
                    let reason = format!("{} of {} resource types failed; first: {}", self.failed.len(), self.results.len(), first);
                    (RunStatus::PartialFailure, reason)
                }
            }
        };
        RunSummary {
            status,
            total_items: self.results.iter().map(|r| r.item_count).sum(),
            per_table_counts: self.per_table.clone(),
            failed_type_names: self.failed.clone(),
            reason,
            resource_results: self.results.clone(),
            degraded_groups: self.degraded.clone(),
            elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use census_core::StopReason;
    use census_kubehub::mock::{api_error, api_resource, object, pods, MockCluster, Scripted};

    use super::*;

    fn cluster() -> MockCluster {
        MockCluster::new()
            .with_group(
                "v1",
                vec![
                    api_resource("Pod", "pods", true, &["list"]),
                    api_resource("Pod", "pods/log", true, &["get"]),
                    api_resource("Secret", "secrets", true, &["list"]),
                    api_resource("Node", "nodes", false, &["list"]),
                ],
            )
            .with_group("example.com/v1", vec![api_resource("Widget", "widgets", true, &["list"])])
    }

    fn ctx() -> RunContext {
        RunContext::new(Some(Duration::from_secs(3600)), Duration::from_secs(180))
    }

    #[tokio::test]
    async fn completed_run_counts_per_table() {
        let c = cluster();
        c.script_pages("pods", vec![pods("p", 2, "default"), pods("q", 1, "default")]);
        c.script_pages("widgets.example.com", vec![vec![object("example.com/v1", "Widget", "w", Some("default"))]]);
        let e = Enumerator::new(Arc::new(c), EngineConfig { limit: 2, ..EngineConfig::default() });
        let report = e.run(&ctx(), None).await;
        let s = &report.summary;
        assert_eq!(s.status, RunStatus::Completed);
        assert_eq!(s.total_items, 4);
        assert_eq!(s.per_table_counts.get("k8s_pods"), Some(&3));
        assert_eq!(s.per_table_counts.get(census_core::CUSTOM_RESOURCE_TABLE), Some(&1));
        assert_eq!(report.records.len(), 4);
        let keys: Vec<&str> = s.resource_results.iter().map(|r| r.resource.as_str()).collect();
        assert_eq!(keys, vec!["pods", "secrets", "nodes", "widgets.example.com"]);
        assert!(s.reason.is_empty());
    }

    #[tokio::test]
    async fn single_type_failure_is_failed() {
        let c = cluster();
        c.script("secrets", Scripted::Fail(api_error(403, "Forbidden")));
        let config = EngineConfig { resource_type: Some("Secret".into()), ..EngineConfig::default() };
        let report = Enumerator::new(Arc::new(c), config).run(&ctx(), None).await;
        assert_eq!(report.summary.status, RunStatus::Failed);
        assert_eq!(report.summary.failed_type_names, vec!["secrets"]);
        assert!(report.summary.reason.contains("Forbidden") || report.summary.reason.contains("403"));
    }

    #[tokio::test]
    async fn unknown_single_type_is_failed() {
        let config = EngineConfig { resource_type: Some("gizmo".into()), ..EngineConfig::default() };
        let report = Enumerator::new(Arc::new(cluster()), config).run(&ctx(), None).await;
        assert_eq!(report.summary.status, RunStatus::Failed);
        assert!(report.summary.reason.contains("gizmo"));
        assert!(report.summary.resource_results.is_empty());
    }

    #[tokio::test]
    async fn every_type_failing_is_failed() {
        let c = MockCluster::new().with_group("v1", vec![api_resource("Secret", "secrets", true, &["list"])]);
        c.script("secrets", Scripted::Fail(api_error(403, "Forbidden")));
        let report = Enumerator::new(Arc::new(c), EngineConfig::default()).run(&ctx(), None).await;
        assert_eq!(report.summary.status, RunStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_unavailable_is_failed() {
        let c = cluster();
        c.fail_discovery(api_error(401, "Unauthorized"));
        let report = Enumerator::new(Arc::new(c), EngineConfig::default()).run(&ctx(), None).await;
        assert_eq!(report.summary.status, RunStatus::Failed);
        assert!(report.summary.reason.contains("discovery"));
    }

    #[tokio::test]
    async fn unknown_context_fails_connect_and_run() {
        let config = EngineConfig { context: Some("census-no-such-context".into()), ..EngineConfig::default() };
        let err = Enumerator::connect(config.clone()).await.err().expect("no such context");
        assert!(matches!(err, EnumerateError::Client(_)), "{}", err);

        let report = enumerate(config, &ctx(), None).await;
        assert_eq!(report.summary.status, RunStatus::Failed);
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn namespace_skips_cluster_scoped_types() {
        let c = Arc::new(cluster());
        let config = EngineConfig { namespace: Some("default".into()), ..EngineConfig::default() };
        let e = Enumerator::new(c.clone(), config);
        let listed: Vec<String> = e.discover(&ctx()).await.expect("discover").into_iter().map(|t| t.descriptor.key()).collect();
        assert_eq!(listed, vec!["pods", "secrets", "widgets.example.com"]);
        let report = e.run(&ctx(), None).await;
        assert_eq!(report.summary.status, RunStatus::Completed);
        assert!(c.list_calls().iter().all(|call| call.resource != "nodes"));
    }

    #[tokio::test]
    async fn streaming_counts_without_buffering() {
        let c = cluster();
        c.script_pages("pods", vec![pods("p", 3, "default")]);
        let config = EngineConfig { resource_type: Some("pods".into()), ..EngineConfig::default() };
        let (tx, mut rx) = mpsc::channel(8);
        let report = Enumerator::new(Arc::new(c), config).run(&ctx(), Some(tx)).await;
        assert!(report.records.is_empty());
        assert_eq!(report.summary.total_items, 3);
        assert_eq!(report.summary.per_table_counts.get("k8s_pods"), Some(&3));
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn cancelled_before_start_is_interrupted() {
        let ctx = ctx();
        ctx.cancel(StopReason::Signal { name: "SIGINT" });
        let report = Enumerator::new(Arc::new(cluster()), EngineConfig::default()).run(&ctx, None).await;
        assert_eq!(report.summary.status, RunStatus::Interrupted);
        assert!(report.summary.reason.contains("SIGINT"));
    }
}
