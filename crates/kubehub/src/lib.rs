//! kubediff kubehub: one kube client per kubeconfig context and typed list
//! calls for the supported workload kinds.

#![forbid(unsafe_code)]

mod schema;

pub use schema::{check_paths, KindSchema};

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config, Resource, ResourceExt,
};
use kubediff_aggregate::{FetchError, NamedRecord, Source, SourceFetcher};
use kubediff_core::ResourceKind;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

/// `$KUBECONFIG`, else `$HOME/.kube/config`.
pub fn default_kubeconfig() -> Option<PathBuf> {
    if let Some(p) = std::env::var_os("KUBECONFIG").filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(p));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".kube").join("config"))
}

/// Build a client for `context` from the kubeconfig at `kubeconfig`.
pub async fn connect(kubeconfig: &Path, context: &str) -> Result<Client> {
    let kc = Kubeconfig::read_from(kubeconfig)
        .with_context(|| format!("reading kubeconfig {}", kubeconfig.display()))?;
    let opts = KubeConfigOptions { context: Some(context.to_string()), ..Default::default() };
    let config = Config::from_custom_kubeconfig(kc, &opts)
        .await
        .with_context(|| format!("failed to create client config for context {}", context))?;
    let client = Client::try_from(config).with_context(|| format!("failed to create client for context {}", context))?;
    debug!(context, "kube client ready");
    Ok(client)
}

/// Lists objects from one kube context.
#[derive(Clone)]
pub struct KubeSource {
    context: String,
    client: Client,
    request_timeout: Option<Duration>,
}

impl Debug for KubeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSource")
            .field("context", &self.context)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl KubeSource {
    pub fn new(context: impl Into<String>, client: Client) -> Self {
        Self { context: context.into(), client, request_timeout: None }
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn into_source(self) -> Source {
        let id = self.context.clone();
        Source::new(id, std::sync::Arc::new(self))
    }

    async fn list_typed<K>(&self, namespace: &str, params: &ListParams) -> Result<Vec<NamedRecord>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + DeserializeOwned + Serialize,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        };
        let plural = K::plural(&Default::default()).to_string();
        let list = api
            .list(params)
            .await
            .with_context(|| format!("failed to list {} in context {}", plural, self.context))?;
        list.items.iter().map(to_record).collect()
    }
}

#[async_trait::async_trait]
impl SourceFetcher for KubeSource {
    async fn list(&self, kind: ResourceKind, namespace: &str, labels: &[String]) -> Result<Vec<NamedRecord>, FetchError> {
        let params = list_params(labels);
        let call = async {
            match kind {
                ResourceKind::Deployment => self.list_typed::<Deployment>(namespace, &params).await,
                ResourceKind::DaemonSet => self.list_typed::<DaemonSet>(namespace, &params).await,
                ResourceKind::StatefulSet => self.list_typed::<StatefulSet>(namespace, &params).await,
                ResourceKind::ConfigMap => self.list_typed::<ConfigMap>(namespace, &params).await,
            }
        };
        let records = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| FetchError::Timeout(limit))??,
            None => call.await?,
        };
        debug!(context = %self.context, %kind, ns = %namespace, count = records.len(), "listed");
        Ok(records)
    }
}

/// Connect to every context concurrently, preserving the given order.
pub async fn connect_all(kubeconfig: &Path, contexts: &[String], request_timeout: Option<Duration>) -> Result<Vec<KubeSource>> {
    let clients = futures::future::try_join_all(contexts.iter().map(|ctx| connect(kubeconfig, ctx)))
        .await
        .context("failed to create kubernetes clients")?;
    info!(contexts = contexts.len(), kubeconfig = %kubeconfig.display(), "connected");
    Ok(contexts
        .iter()
        .zip(clients)
        .map(|(ctx, client)| KubeSource::new(ctx.clone(), client).with_request_timeout(request_timeout))
        .collect())
}

fn list_params(labels: &[String]) -> ListParams {
    let selector = join_labels(labels);
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(&selector)
    }
}

fn join_labels(labels: &[String]) -> String {
    labels.iter().map(|l| l.trim()).filter(|l| !l.is_empty()).collect::<Vec<_>>().join(",")
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_record<K: Resource + Serialize>(obj: &K) -> Result<NamedRecord> {
    let name = obj.name_any();
    if name.is_empty() {
        return Err(anyhow!("object missing metadata.name"));
    }
    let mut raw = serde_json::to_value(obj).with_context(|| format!("serializing {}", name))?;
    strip_managed_fields(&mut raw);
    Ok((name, raw))
}
