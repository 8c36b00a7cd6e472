#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use census_core::CUSTOM_RESOURCE_TABLE;
use census_kubehub::mock::{api_resource, object, MockCluster};
use census_kubehub::{DiscoveryCache, ListOptions, Lister, Resolver, RetryExecutor, RunContext};

fn widgets(prefix: &str, n: usize) -> Vec<kube::core::DynamicObject> {
    (0..n).map(|i| object("example.com/v1", "Widget", &format!("{}-{}", prefix, i), Some("default"))).collect()
}

#[tokio::test]
async fn custom_resource_by_short_name_lands_in_custom_table() {
    let mut widget = api_resource("Widget", "widgets", true, &["get", "list"]);
    widget.short_names = Some(vec!["wd".to_string()]);
    let cluster = MockCluster::new()
        .with_group("v1", vec![api_resource("Pod", "pods", true, &["list"])])
        .with_group("example.com/v1", vec![widget]);
    cluster.script_pages("widgets.example.com", vec![widgets("a", 2), widgets("b", 2)]);

    let ctx = RunContext::new(Some(Duration::from_secs(600)), Duration::from_secs(60));
    let retry = RetryExecutor::default();
    let cache = Arc::new(DiscoveryCache::new());
    cache.init(&ctx, &cluster, &retry).await.expect("discovery");

    let rt = Resolver::new(cache).resolve(&ctx, "WD").expect("short name");
    assert_eq!(rt.key(), "widgets.example.com");

    let listing = Lister::new(&cluster, &retry)
        .list(&ctx, &rt, &ListOptions { page_size: 2, ..ListOptions::default() })
        .await;
    assert!(listing.error.is_none());
    assert_eq!(listing.pages, 2);
    assert!(listing.records.iter().all(|r| r.table == CUSTOM_RESOURCE_TABLE && r.kind == "widget"));
    let names: Vec<&str> = listing.records.iter().map(|r| r.object_name.as_str()).collect();
    assert_eq!(names, vec!["a-0", "a-1", "b-0", "b-1"]);
}
