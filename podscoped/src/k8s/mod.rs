use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use log::warn;
use serde::Serialize;

use crate::cache::BoundedTtlCache;
use crate::event::Event;
use crate::metrics::Metrics;

pub mod api;
pub mod index;

pub use index::{spawn_watchers, ClusterIndex};

pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

#[derive(Debug, Clone, Default, Serialize)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub namespace: String,
    pub port: u16,
}

/// The tracer's own pod identity, resolved once at startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceIdentity {
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

impl SourceIdentity {
    /// In-cluster detection: the serviceaccount namespace file, with
    /// `POD_NAMESPACE` as the override used by the manifests.
    pub fn detect() -> Self {
        let namespace = std::env::var("POD_NAMESPACE").ok().or_else(|| {
            std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
                .ok()
                .map(|s| s.trim().to_string())
        });
        Self {
            namespace: namespace.unwrap_or_default(),
            labels: BTreeMap::new(),
        }
    }
}

/// Kubernetes identity attached to an enriched event. Target and service
/// fields stay empty when nothing resolves; `is_external` marks globally
/// routable targets that matched neither.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KubernetesContext {
    pub source_namespace: String,
    pub source_labels: BTreeMap<String, String>,
    pub target_pod: String,
    pub target_namespace: String,
    pub target_labels: BTreeMap<String, String>,
    pub service_name: String,
    pub service_namespace: String,
    pub service_port: u16,
    pub is_external: bool,
}

impl KubernetesContext {
    fn from_source(source: &SourceIdentity) -> Self {
        Self {
            source_namespace: source.namespace.clone(),
            source_labels: source.labels.clone(),
            ..Default::default()
        }
    }

    pub fn has_target(&self) -> bool {
        !self.target_pod.is_empty() || !self.service_name.is_empty()
    }

    fn fill_pod(&mut self, pod: &PodInfo) {
        self.target_pod = pod.name.clone();
        self.target_namespace = pod.namespace.clone();
        self.target_labels = pod.labels.clone();
    }

    fn fill_service(&mut self, svc: &ServiceInfo) {
        self.service_name = svc.name.clone();
        self.service_namespace = svc.namespace.clone();
        self.service_port = svc.port;
    }
}

/// Optional enrichment capability. The runtime checks presence once at
/// construction and dispatches through this trait; there is no per-call
/// null checking anywhere in the pipeline.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, event: &Event) -> KubernetesContext;
}

/// Stands in when no cluster is reachable: source identity plus the pure
/// external-address classification, nothing else.
pub struct NoopEnricher {
    source: SourceIdentity,
}

impl NoopEnricher {
    pub fn new(source: SourceIdentity) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Enricher for NoopEnricher {
    async fn enrich(&self, event: &Event) -> KubernetesContext {
        let mut ctx = KubernetesContext::from_source(&self.source);
        if event.is_network() {
            if let Some((ip, _port)) = event.ip_port() {
                ctx.is_external = is_public(&ip);
            }
        }
        ctx
    }
}

/// Maps network targets to pod and service identity: informer index first,
/// then the TTL caches, then a bounded on-demand API call, and finally the
/// external classification. Never blocks the event path longer than the API
/// timeout.
pub struct K8sEnricher {
    source: SourceIdentity,
    index: Arc<ClusterIndex>,
    /// None runs index-and-cache only (no API fallback), e.g. when the
    /// credentials allow watching but direct lists are undesired.
    client: Option<Client>,
    svc_cache: BoundedTtlCache<(IpAddr, u16), Option<ServiceInfo>>,
    pod_cache: BoundedTtlCache<IpAddr, Option<PodInfo>>,
    api_timeout: Duration,
    metrics: Arc<Metrics>,
}

pub struct K8sEnricherOptions {
    pub api_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_size: usize,
    pub eviction_ratio: f64,
}

impl K8sEnricher {
    pub fn new(
        source: SourceIdentity,
        index: Arc<ClusterIndex>,
        client: Option<Client>,
        opts: K8sEnricherOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            index,
            client,
            svc_cache: BoundedTtlCache::new(opts.cache_size, opts.eviction_ratio, opts.cache_ttl),
            pod_cache: BoundedTtlCache::new(opts.cache_size, opts.eviction_ratio, opts.cache_ttl),
            api_timeout: opts.api_timeout,
            metrics,
        }
    }

    async fn resolve(&self, ctx: &mut KubernetesContext, ip: IpAddr, port: u16) {
        let mut service = self.index.service_for(ip, port);
        let mut pod = self.index.pod_for(ip);

        // The TTL caches store negative answers too, so an uncached key is
        // the only thing that justifies an API round trip.
        let mut need_service = false;
        let mut need_pod = false;
        if service.is_none() {
            match self.svc_cache.get(&(ip, port)) {
                Some(cached) => service = cached,
                None => need_service = true,
            }
        }
        if pod.is_none() {
            match self.pod_cache.get(&ip) {
                Some(cached) => pod = cached,
                None => need_pod = true,
            }
        }
        if let Some(client) = self.client.as_ref().filter(|_| need_service || need_pod) {
            let lookup = async {
                let svc = if need_service {
                    api::service_for_addr(client, ip, port).await
                } else {
                    None
                };
                let p = if need_pod {
                    api::pod_for_ip(client, ip).await
                } else {
                    None
                };
                (svc, p)
            };
            match tokio::time::timeout(self.api_timeout, lookup).await {
                Ok((svc, p)) => {
                    if need_service {
                        self.svc_cache.insert((ip, port), svc.clone());
                        service = svc;
                    }
                    if need_pod {
                        self.pod_cache.insert(ip, p.clone());
                        pod = p;
                    }
                }
                Err(_elapsed) => {
                    self.metrics.record_enrich_timeout();
                }
            }
        }

        if let Some(svc) = &service {
            ctx.fill_service(svc);
        }
        if let Some(p) = &pod {
            ctx.fill_pod(p);
        }
        if service.is_none() && pod.is_none() {
            ctx.is_external = is_public(&ip);
        }
    }
}

#[async_trait]
impl Enricher for K8sEnricher {
    async fn enrich(&self, event: &Event) -> KubernetesContext {
        let mut ctx = KubernetesContext::from_source(&self.source);
        if !event.is_network() {
            return ctx;
        }
        let Some((ip, port)) = event.ip_port() else {
            return ctx;
        };
        self.resolve(&mut ctx, ip, port).await;
        ctx
    }
}

/// Globally routable check: loopback, link-local, RFC1918 (and the v6
/// unique-local range) are all cluster-internal for our purposes.
pub fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_link_local()
                || v4.is_private()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || (seg0 & 0xffc0) == 0xfe80
                || (seg0 & 0xfe00) == 0xfc00)
        }
    }
}

/// Connects to the cluster and starts the informer watchers, waiting up to
/// `sync_timeout` for the initial listings. Failure to sync is non-fatal:
/// the enricher falls through to on-demand lookups.
pub async fn connect_enricher(
    source: SourceIdentity,
    opts: K8sEnricherOptions,
    sync_timeout: Duration,
    metrics: Arc<Metrics>,
) -> anyhow::Result<K8sEnricher> {
    let client = Client::try_default().await?;
    let index = Arc::new(ClusterIndex::new());
    spawn_watchers(client.clone(), Arc::clone(&index));
    if tokio::time::timeout(sync_timeout, index.wait_synced())
        .await
        .is_err()
    {
        warn!("[k8s] informer sync timed out; continuing in on-demand mode");
    }
    Ok(K8sEnricher::new(source, index, Some(client), opts, metrics))
}
