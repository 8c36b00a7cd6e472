//! Scriptable in-memory cluster for tests and dry runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use census_core::ResourceTypeDescriptor;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIResource, ListMeta, ObjectMeta, Time};
use kube::core::{DynamicObject, ErrorResponse, ObjectList, TypeMeta};

use crate::{ClusterApi, GroupFailure, GroupResources, PageRequest, ServerResources};

/// One scripted response to a list call.
#[derive(Debug)]
pub enum Scripted {
    Page { items: Vec<DynamicObject>, continue_token: Option<String> },
    Fail(kube::Error),
    /// Respond after a delay.
    Delayed(Duration, Box<Scripted>),
    /// Never respond.
    Hang,
}

/// A recorded list call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListCall {
    pub resource: String,
    pub continue_token: Option<String>,
    pub limit: Option<u32>,
    pub namespace: Option<String>,
}

/// How a group/version answers discovery.
#[derive(Debug, Clone)]
enum GroupEntry {
    Served(Vec<APIResource>),
    /// Every request fails with 503 and this message.
    Degraded(String),
    /// Requests never complete.
    Hung,
}

/// Simple in-memory cluster. Responses are queued per resource key
/// (`pods`, `deployments.apps`); an exhausted queue yields an empty final page.
#[derive(Debug, Default)]
pub struct MockCluster {
    groups: Vec<(String, GroupEntry)>,
    discovery_failures: Mutex<VecDeque<kube::Error>>,
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<ListCall>>,
    discover_calls: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group_version: &str, resources: Vec<APIResource>) -> Self {
        self.groups.push((group_version.to_string(), GroupEntry::Served(resources)));
        self
    }

    /// Serve `group_version` in the group list but answer its resource list with 503.
    pub fn with_degraded_group(mut self, group_version: &str, error: &str) -> Self {
        self.groups.push((group_version.to_string(), GroupEntry::Degraded(error.to_string())));
        self
    }

    /// Serve `group_version` in the group list but never answer its resource list.
    pub fn with_hung_group(mut self, group_version: &str) -> Self {
        self.groups.push((group_version.to_string(), GroupEntry::Hung));
        self
    }

    /// The snapshot a full discovery would produce.
    pub fn discovery(&self) -> ServerResources {
        let mut server = ServerResources::default();
        for (gv, entry) in &self.groups {
            match entry {
                GroupEntry::Served(resources) => server
                    .groups
                    .push(GroupResources { group_version: gv.clone(), resources: resources.clone() }),
                GroupEntry::Degraded(error) => {
                    server.failures.push(GroupFailure { group_version: gv.clone(), error: error.clone() })
                }
                GroupEntry::Hung => server
                    .failures
                    .push(GroupFailure { group_version: gv.clone(), error: "no response".to_string() }),
            }
        }
        server
    }

    /// Queue an error for the next `server_groups()` call.
    pub fn fail_discovery(&self, err: kube::Error) {
        lock(&self.discovery_failures).push_back(err);
    }

    pub fn script(&self, resource: &str, step: Scripted) {
        lock(&self.scripts).entry(resource.to_string()).or_default().push_back(step);
    }

    /// Queue `pages` for `resource`, chaining continue tokens `<resource>-1`, `<resource>-2`, ...
    pub fn script_pages(&self, resource: &str, pages: Vec<Vec<DynamicObject>>) {
        let n = pages.len();
        for (i, items) in pages.into_iter().enumerate() {
            let continue_token = (i + 1 < n).then(|| format!("{}-{}", resource, i + 1));
            self.script(resource, Scripted::Page { items, continue_token });
        }
    }

    pub fn list_calls(&self) -> Vec<ListCall> {
        lock(&self.calls).clone()
    }

    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    fn next_step(&self, resource: &str) -> Option<Scripted> {
        lock(&self.scripts).get_mut(resource).and_then(|q| q.pop_front())
    }
}

fn page(items: Vec<DynamicObject>, continue_token: Option<String>) -> ObjectList<DynamicObject> {
    ObjectList {
        types: Default::default(),
        metadata: ListMeta { continue_: continue_token, ..ListMeta::default() },
        items,
    }
}

async fn respond(step: Scripted) -> Result<ObjectList<DynamicObject>, kube::Error> {
    let mut step = step;
    loop {
        match step {
            Scripted::Page { items, continue_token } => return Ok(page(items, continue_token)),
            Scripted::Fail(e) => return Err(e),
            Scripted::Hang => std::future::pending::<()>().await,
            Scripted::Delayed(d, next) => {
                tokio::time::sleep(d).await;
                step = *next;
            }
        }
    }
}

#[async_trait::async_trait]
impl ClusterApi for MockCluster {
    async fn server_groups(&self) -> Result<Vec<String>, kube::Error> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        let failure = lock(&self.discovery_failures).pop_front();
        match failure {
            Some(e) => Err(e),
            None => Ok(self.groups.iter().map(|(gv, _)| gv.clone()).collect()),
        }
    }

    async fn group_resources(&self, group_version: &str) -> Result<Vec<APIResource>, kube::Error> {
        let entry = self.groups.iter().find(|(gv, _)| gv == group_version).map(|(_, e)| e.clone());
        match entry {
            Some(GroupEntry::Served(resources)) => Ok(resources),
            Some(GroupEntry::Degraded(message)) => Err(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message,
                reason: "ServiceUnavailable".to_string(),
                code: 503,
            })),
            Some(GroupEntry::Hung) => std::future::pending().await,
            None => Err(api_error(404, "NotFound")),
        }
    }

    async fn list_page(
        &self,
        resource: &ResourceTypeDescriptor,
        request: &PageRequest,
    ) -> Result<ObjectList<DynamicObject>, kube::Error> {
        let key = resource.key();
        lock(&self.calls).push(ListCall {
            resource: key.clone(),
            continue_token: request.continue_token.clone(),
            limit: request.limit,
            namespace: request.namespace.clone(),
        });
        match self.next_step(&key) {
            Some(step) => respond(step).await,
            None => Ok(page(Vec::new(), None)),
        }
    }
}

/// Discovery entry with `singular_name` derived from the kind.
pub fn api_resource(kind: &str, plural: &str, namespaced: bool, verbs: &[&str]) -> APIResource {
    APIResource {
        kind: kind.to_string(),
        name: plural.to_string(),
        singular_name: kind.to_ascii_lowercase(),
        namespaced,
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..APIResource::default()
    }
}

/// An API error as the server would report it.
pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("scripted {} {}", code, reason),
        reason: reason.to_string(),
        code,
    })
}

/// A listed object of `kind` with a uid derived from its name.
pub fn object(api_version: &str, kind: &str, name: &str, namespace: Option<&str>) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta { api_version: api_version.to_string(), kind: kind.to_string() }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(|s| s.to_string()),
            uid: Some(format!("uid-{}", name)),
            resource_version: Some("1".to_string()),
            creation_timestamp: Some(Time(chrono::DateTime::from_timestamp(1_577_836_800, 0).unwrap_or_default())),
            ..ObjectMeta::default()
        },
        data: serde_json::json!({}),
    }
}

/// `count` pods named `<prefix>-<i>` in `namespace`.
pub fn pods(prefix: &str, count: usize, namespace: &str) -> Vec<DynamicObject> {
    (0..count).map(|i| object("v1", "Pod", &format!("{}-{}", prefix, i), Some(namespace))).collect()
}
