//! [`ClusterApi`] backed by a live API server.

use std::time::Duration;

use census_core::ResourceTypeDescriptor;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject, ObjectList};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::error::EnumerateError;
use crate::throttle::Throttle;
use crate::{ClusterApi, PageRequest};

pub struct KubeCluster {
    client: Client,
    throttle: Throttle,
}

impl KubeCluster {
    pub fn new(client: Client, throttle: Throttle) -> Self {
        Self { client, throttle }
    }

    /// Build a client from kubeconfig (optionally a named context) or the in-cluster environment.
    /// Reads time out after `call_timeout`.
    pub async fn connect(
        context: Option<&str>,
        call_timeout: Duration,
        qps: f32,
        burst: u32,
    ) -> Result<Self, EnumerateError> {
        let mut config = match context {
            Some(name) => {
                let options = KubeConfigOptions { context: Some(name.to_string()), ..KubeConfigOptions::default() };
                let kubeconfig = Kubeconfig::read().map_err(|e| EnumerateError::Client(e.to_string()))?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| EnumerateError::Client(format!("context {:?}: {}", name, e)))?
            }
            None => Config::infer().await.map_err(|e| EnumerateError::Client(e.to_string()))?,
        };
        config.read_timeout = Some(call_timeout);
        let cluster_url = config.cluster_url.to_string();
        let client = Client::try_from(config).map_err(|e| EnumerateError::Client(e.to_string()))?;
        info!(cluster = %cluster_url, context = context.unwrap_or("<default>"), qps, burst, "cluster client ready");
        Ok(Self::new(client, Throttle::new(qps, burst)))
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn server_groups(&self) -> Result<Vec<String>, kube::Error> {
        self.throttle.acquire().await;
        let core = self.client.list_core_api_versions().await?;
        self.throttle.acquire().await;
        let groups = self.client.list_api_groups().await?;

        let mut out = core.versions;
        for group in &groups.groups {
            match group.preferred_version.as_ref().or_else(|| group.versions.first()) {
                Some(preferred) => out.push(preferred.group_version.clone()),
                None => debug!(group = %group.name, "group advertises no versions; skipped"),
            }
        }
        debug!(group_versions = out.len(), "server groups fetched");
        Ok(out)
    }

    async fn group_resources(&self, group_version: &str) -> Result<Vec<APIResource>, kube::Error> {
        self.throttle.acquire().await;
        let list = if group_version.contains('/') {
            self.client.list_api_group_resources(group_version).await?
        } else {
            self.client.list_core_api_resources(group_version).await?
        };
        Ok(list.resources)
    }

    async fn list_page(
        &self,
        resource: &ResourceTypeDescriptor,
        request: &PageRequest,
    ) -> Result<ObjectList<DynamicObject>, kube::Error> {
        let ar = ApiResource {
            group: resource.group.clone(),
            version: resource.version.clone(),
            api_version: resource.api_version(),
            kind: resource.kind.clone(),
            plural: resource.resource.clone(),
        };
        let api: Api<DynamicObject> = match request.namespace.as_deref() {
            Some(ns) if resource.namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        let mut lp = ListParams::default();
        if let Some(limit) = request.limit {
            lp = lp.limit(limit);
        }
        if let Some(token) = request.continue_token.as_deref() {
            lp = lp.continue_token(token);
        }
        self.throttle.acquire().await;
        api.list(&lp).await
    }
}
