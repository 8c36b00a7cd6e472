//! Paginated lister: walks one resource type page by page through the retry
//! executor, normalizing each item and either streaming or buffering it.

use std::collections::BTreeMap;
use std::time::Instant;

use census_core::{table_for, NormalizedRecord, RecordMetadata, ResourceTypeDescriptor, StopReason};
use chrono::SecondsFormat;
use kube::core::DynamicObject;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::context::RunContext;
use crate::error::EnumerateError;
use crate::retry::RetryExecutor;
use crate::{ClusterApi, PageRequest};

/// Default page size.
pub const DEFAULT_PAGE_SIZE: i64 = 5000;

#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Items per page; `<= 0` fetches everything in one unbounded request.
    pub page_size: i64,
    pub include_metadata: bool,
    pub include_status: bool,
    /// Restrict namespaced types to one namespace.
    pub namespace: Option<String>,
    /// Stream records here instead of buffering them.
    pub sink: Option<mpsc::Sender<NormalizedRecord>>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self { page_size: DEFAULT_PAGE_SIZE, include_metadata: false, include_status: false, namespace: None, sink: None }
    }
}

/// Outcome of listing one type. Records gathered before `error` are kept.
#[derive(Debug, Default)]
pub struct Listing {
    /// Empty when streaming.
    pub records: Vec<NormalizedRecord>,
    /// Records produced, streamed or buffered.
    pub count: u64,
    /// Records produced per table.
    pub tables: BTreeMap<String, u64>,
    pub pages: u32,
    pub error: Option<EnumerateError>,
}

/// Cursor state for one type; starts empty for every type.
#[derive(Debug, Default)]
struct PageState {
    continue_token: Option<String>,
    items_seen: u64,
    last_progress: Option<Instant>,
}

pub struct Lister<'a> {
    cluster: &'a dyn ClusterApi,
    retry: &'a RetryExecutor,
}

impl<'a> Lister<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, retry: &'a RetryExecutor) -> Self {
        Self { cluster, retry }
    }

    pub async fn list(&self, ctx: &RunContext, rt: &ResourceTypeDescriptor, opts: &ListOptions) -> Listing {
        let started = Instant::now();
        let key = rt.key();
        let operation = format!("list {}", key);
        let limit = (opts.page_size > 0).then(|| opts.page_size.min(i64::from(u32::MAX)) as u32);
        let namespace = if rt.namespaced { opts.namespace.clone() } else { None };

        let mut out = Listing::default();
        let mut state = PageState::default();
        'pages: loop {
            if let Some(reason) = ctx.stop_reason() {
                out.error = Some(EnumerateError::interrupted(&operation, reason));
                break;
            }
            let request = PageRequest { limit, continue_token: state.continue_token.clone(), namespace: namespace.clone() };
            let t0 = Instant::now();
            let page = match self.retry.execute(ctx, &operation, || self.cluster.list_page(rt, &request)).await {
                Ok(page) => page,
                Err(e) => {
                    out.error = Some(e);
                    break;
                }
            };
            let fetch_ms = t0.elapsed().as_secs_f64() * 1000.0;
            ctx.touch();
            out.pages += 1;
            metrics::counter!("census_pages_total", 1u64, "resource" => key.clone());
            metrics::histogram!("census_page_fetch_ms", fetch_ms, "resource" => key.clone());

            let n = page.items.len() as u64;
            for obj in &page.items {
                let rec = normalize(obj, rt, opts.include_metadata, opts.include_status);
                let table = rec.table.clone();
                match &opts.sink {
                    Some(tx) => {
                        tokio::select! {
                            biased;
                            sent = tx.send(rec) => {
                                if sent.is_err() {
                                    ctx.cancel(StopReason::SinkClosed);
                                    out.error = Some(EnumerateError::interrupted(&operation, StopReason::SinkClosed));
                                    break 'pages;
                                }
                            }
                            reason = ctx.done() => {
                                out.error = Some(EnumerateError::interrupted(&operation, reason));
                                break 'pages;
                            }
                        }
                    }
                    None => out.records.push(rec),
                }
                out.count += 1;
                *out.tables.entry(table).or_default() += 1;
            }
            metrics::counter!("census_items_total", n, "resource" => key.clone());

            state.items_seen += n;
            state.last_progress = Some(Instant::now());
            state.continue_token = page.metadata.continue_.filter(|t| !t.is_empty());
            debug!(resource = %rt, page = out.pages, items = n, total = state.items_seen, fetch_ms = fetch_ms as u64, more = state.continue_token.is_some(), "page listed");

            if limit.is_none() || state.continue_token.is_none() {
                break;
            }
        }

        match &out.error {
            None => info!(resource = %rt, pages = out.pages, items = out.count, took_ms = %started.elapsed().as_millis(), "listed resource type"),
            Some(e) => debug!(
                resource = %rt,
                pages = out.pages,
                items = out.count,
                since_progress_ms = state.last_progress.map(|t| t.elapsed().as_millis() as u64),
                error = %e,
                "listing stopped early"
            ),
        }
        out
    }
}

/// Project a listed object onto the shared record shape.
///
/// Kind comes from the item, then the descriptor, then the resource name.
pub fn normalize(
    obj: &DynamicObject,
    rt: &ResourceTypeDescriptor,
    include_metadata: bool,
    include_status: bool,
) -> NormalizedRecord {
    let item_kind = obj.types.as_ref().map(|t| t.kind.as_str()).filter(|k| !k.is_empty());
    let kind = item_kind
        .or_else(|| Some(rt.kind.as_str()).filter(|k| !k.is_empty()))
        .unwrap_or(rt.resource.as_str())
        .to_ascii_lowercase();
    let api_version = obj
        .types
        .as_ref()
        .map(|t| t.api_version.clone())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| rt.api_version());
    let meta = &obj.metadata;

    NormalizedRecord {
        table: table_for(&kind).to_string(),
        kind,
        object_name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        creation_timestamp: meta
            .creation_timestamp
            .as_ref()
            .map(|t| t.0.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default(),
        resource_version: meta.resource_version.clone().unwrap_or_default(),
        api_version,
        metadata: include_metadata.then(|| RecordMetadata {
            labels: meta.labels.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
        }),
        status: if include_status { obj.data.get("status").filter(|s| s.is_object()).cloned() } else { None },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use census_core::CUSTOM_RESOURCE_TABLE;

    use super::*;
    use crate::mock::{api_error, object, pods, MockCluster, Scripted};

    fn pods_rt() -> ResourceTypeDescriptor {
        ResourceTypeDescriptor {
            group: String::new(),
            version: "v1".into(),
            resource: "pods".into(),
            kind: "Pod".into(),
            namespaced: true,
        }
    }

    fn ctx() -> RunContext {
        RunContext::new(Some(Duration::from_secs(3600)), Duration::from_secs(180))
    }

    fn names(records: &[NormalizedRecord]) -> Vec<String> {
        records.iter().map(|r| r.object_name.clone()).collect()
    }

    fn three_pages(cluster: &MockCluster) {
        cluster.script_pages("pods", vec![pods("a", 2, "default"), pods("b", 3, "default"), pods("c", 1, "kube-system")]);
    }

    #[tokio::test]
    async fn buffered_and_streamed_runs_see_the_same_items() {
        let retry = RetryExecutor::default();
        let opts = ListOptions { page_size: 3, ..ListOptions::default() };

        let cluster = MockCluster::new();
        three_pages(&cluster);
        let buffered = Lister::new(&cluster, &retry).list(&ctx(), &pods_rt(), &opts).await;
        assert!(buffered.error.is_none());
        assert_eq!(buffered.pages, 3);
        assert_eq!(buffered.count, 6);
        assert_eq!(names(&buffered.records), vec!["a-0", "a-1", "b-0", "b-1", "b-2", "c-0"]);

        let tokens: Vec<Option<String>> = cluster.list_calls().into_iter().map(|c| c.continue_token).collect();
        assert_eq!(tokens, vec![None, Some("pods-1".to_string()), Some("pods-2".to_string())]);
        assert!(cluster.list_calls().iter().all(|c| c.limit == Some(3)));

        let cluster = MockCluster::new();
        three_pages(&cluster);
        let (tx, mut rx) = mpsc::channel(16);
        let streamed = Lister::new(&cluster, &retry)
            .list(&ctx(), &pods_rt(), &ListOptions { sink: Some(tx), ..opts.clone() })
            .await;
        assert!(streamed.error.is_none());
        assert!(streamed.records.is_empty());
        assert_eq!(streamed.count, 6);
        assert_eq!(streamed.tables, buffered.tables);
        assert_eq!(streamed.tables.get("k8s_pods"), Some(&6));
        let mut got = Vec::new();
        while let Ok(rec) = rx.try_recv() {
            got.push(rec);
        }
        assert_eq!(got, buffered.records);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_keeps_earlier_pages() {
        let cluster = MockCluster::new();
        cluster.script("pods", Scripted::Page { items: pods("a", 2, "default"), continue_token: Some("next".into()) });
        cluster.script("pods", Scripted::Hang);
        let retry = RetryExecutor::default();
        let ctx = ctx();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel(StopReason::Cancelled);
        });
        let listing = Lister::new(&cluster, &retry).list(&ctx, &pods_rt(), &ListOptions::default()).await;

        assert_eq!(names(&listing.records), vec!["a-0", "a-1"]);
        let err = listing.error.expect("interrupted");
        assert!(err.is_fatal());
        assert_eq!(err.stop_reason(), Some(StopReason::Cancelled));
        assert!(ctx.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_page_keeps_earlier_items() {
        let cluster = MockCluster::new();
        cluster.script("pods", Scripted::Page { items: pods("a", 1, "default"), continue_token: Some("next".into()) });
        cluster.script("pods", Scripted::Fail(api_error(403, "Forbidden")));
        let retry = RetryExecutor::default();
        let listing = Lister::new(&cluster, &retry).list(&ctx(), &pods_rt(), &ListOptions::default()).await;
        assert_eq!(listing.count, 1);
        let err = listing.error.expect("forbidden");
        assert!(!err.is_fatal());
        assert_eq!(err.status_code(), Some(403));
    }

    #[tokio::test]
    async fn non_positive_page_size_fetches_once() {
        let cluster = MockCluster::new();
        cluster.script("pods", Scripted::Page { items: pods("a", 4, "default"), continue_token: Some("ignored".into()) });
        let retry = RetryExecutor::default();
        let listing = Lister::new(&cluster, &retry)
            .list(&ctx(), &pods_rt(), &ListOptions { page_size: 0, ..ListOptions::default() })
            .await;
        assert_eq!(listing.count, 4);
        let calls = cluster.list_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].limit, None);
    }

    #[tokio::test]
    async fn closed_sink_stops_the_run() {
        let cluster = MockCluster::new();
        three_pages(&cluster);
        let retry = RetryExecutor::default();
        let ctx = ctx();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let listing = Lister::new(&cluster, &retry)
            .list(&ctx, &pods_rt(), &ListOptions { sink: Some(tx), ..ListOptions::default() })
            .await;
        assert_eq!(listing.count, 0);
        assert_eq!(listing.error.and_then(|e| e.stop_reason()), Some(StopReason::SinkClosed));
        assert_eq!(ctx.stop_reason(), Some(StopReason::SinkClosed));
    }

    #[test]
    fn kind_falls_back_to_descriptor_then_resource() {
        let mut obj = object("v1", "Pod", "p", Some("ns"));
        obj.types = None;
        let rec = normalize(&obj, &pods_rt(), false, false);
        assert_eq!(rec.kind, "pod");
        assert_eq!(rec.table, "k8s_pods");
        assert_eq!(rec.api_version, "v1");

        let rt = ResourceTypeDescriptor {
            group: "example.com".into(),
            version: "v1".into(),
            resource: "widgets".into(),
            kind: String::new(),
            namespaced: false,
        };
        let rec = normalize(&obj, &rt, false, false);
        assert_eq!(rec.kind, "widgets");
        assert_eq!(rec.table, CUSTOM_RESOURCE_TABLE);
        assert_eq!(rec.api_version, "example.com/v1");
    }

    #[test]
    fn metadata_and_status_only_on_request() {
        let mut obj = object("apps/v1", "Deployment", "web", Some("default"));
        obj.metadata.labels = Some(BTreeMap::from([("app".to_string(), "web".to_string())]));
        obj.data = serde_json::json!({"status": {"replicas": 2}, "spec": {"replicas": 2}});
        let rt = ResourceTypeDescriptor {
            group: "apps".into(),
            version: "v1".into(),
            resource: "deployments".into(),
            kind: "Deployment".into(),
            namespaced: true,
        };

        let bare = normalize(&obj, &rt, false, false);
        assert!(bare.metadata.is_none() && bare.status.is_none());
        assert_eq!(bare.kind, "deployment");
        assert_eq!(bare.uid, "uid-web");
        assert_eq!(bare.creation_timestamp, "2020-01-01T00:00:00Z");

        let full = normalize(&obj, &rt, true, true);
        assert_eq!(full.metadata.expect("metadata").labels["app"], "web");
        assert_eq!(full.status, Some(serde_json::json!({"replicas": 2})));
    }

    #[tokio::test]
    async fn namespace_applies_to_namespaced_types_only() {
        let cluster = Arc::new(MockCluster::new());
        let retry = RetryExecutor::default();
        let opts = ListOptions { namespace: Some("team-a".into()), ..ListOptions::default() };
        let lister = Lister::new(cluster.as_ref(), &retry);
        lister.list(&ctx(), &pods_rt(), &opts).await;
        let nodes = ResourceTypeDescriptor { resource: "nodes".into(), kind: "Node".into(), namespaced: false, ..pods_rt() };
        let listing = lister.list(&ctx(), &nodes, &opts).await;
        assert!(listing.error.is_none());
        let namespaces: Vec<Option<String>> = cluster.list_calls().into_iter().map(|c| c.namespace).collect();
        assert_eq!(namespaces, vec![Some("team-a".to_string()), None]);
    }
}
