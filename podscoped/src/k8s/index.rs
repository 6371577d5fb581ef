use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::watcher;
use kube::{Api, Client};
use log::warn;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{PodInfo, ServiceInfo, SERVICE_NAME_LABEL};

/// Client-side index maintained from the Pod and EndpointSlice watch
/// streams: pods by IP, services by endpoint address and address:port.
/// Lookups are read-lock only; the watcher tasks own all writes.
pub struct ClusterIndex {
    pods_by_ip: RwLock<HashMap<IpAddr, Arc<PodInfo>>>,
    svc_by_addr_port: RwLock<HashMap<(IpAddr, u16), Arc<ServiceInfo>>>,
    svc_by_addr: RwLock<HashMap<IpAddr, Arc<ServiceInfo>>>,
    /// pod "ns/name" -> indexed IPs, so deletes can unindex.
    pod_keys: RwLock<HashMap<String, Vec<IpAddr>>>,
    /// slice "ns/name" -> indexed (addr, port) pairs.
    slice_keys: RwLock<HashMap<String, Vec<(IpAddr, u16)>>>,
    pods_synced: watch::Sender<bool>,
    slices_synced: watch::Sender<bool>,
}

impl ClusterIndex {
    pub fn new() -> Self {
        let (pods_synced, _) = watch::channel(false);
        let (slices_synced, _) = watch::channel(false);
        Self {
            pods_by_ip: RwLock::new(HashMap::new()),
            svc_by_addr_port: RwLock::new(HashMap::new()),
            svc_by_addr: RwLock::new(HashMap::new()),
            pod_keys: RwLock::new(HashMap::new()),
            slice_keys: RwLock::new(HashMap::new()),
            pods_synced,
            slices_synced,
        }
    }

    pub fn pod_for(&self, ip: IpAddr) -> Option<PodInfo> {
        self.pods_by_ip
            .read()
            .unwrap()
            .get(&ip)
            .map(|p| (**p).clone())
    }

    /// Service lookup by (address, port), falling back to address alone for
    /// a nonzero port that missed.
    pub fn service_for(&self, ip: IpAddr, port: u16) -> Option<ServiceInfo> {
        if let Some(svc) = self.svc_by_addr_port.read().unwrap().get(&(ip, port)) {
            return Some((**svc).clone());
        }
        if port > 0 {
            if let Some(svc) = self.svc_by_addr.read().unwrap().get(&ip) {
                return Some((**svc).clone());
            }
        }
        None
    }

    /// Resolves once both watch streams have delivered their initial
    /// listing. Callers bound this with a timeout; sync failure is not
    /// fatal.
    pub async fn wait_synced(&self) {
        let mut pods = self.pods_synced.subscribe();
        let mut slices = self.slices_synced.subscribe();
        while !*pods.borrow() {
            if pods.changed().await.is_err() {
                break;
            }
        }
        while !*slices.borrow() {
            if slices.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_synced(&self) -> bool {
        *self.pods_synced.subscribe().borrow() && *self.slices_synced.subscribe().borrow()
    }

    pub fn apply_pod(&self, pod: &Pod) {
        let Some(key) = object_key(&pod.metadata) else {
            return;
        };
        self.delete_pod_key(&key);
        let Some(info) = pod_info(pod) else {
            return;
        };
        let Some(ip) = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .and_then(|raw| raw.parse::<IpAddr>().ok())
        else {
            return;
        };
        let info = Arc::new(info);
        self.pods_by_ip.write().unwrap().insert(ip, info);
        self.pod_keys.write().unwrap().insert(key, vec![ip]);
    }

    pub fn delete_pod(&self, pod: &Pod) {
        if let Some(key) = object_key(&pod.metadata) {
            self.delete_pod_key(&key);
        }
    }

    fn delete_pod_key(&self, key: &str) {
        if let Some(ips) = self.pod_keys.write().unwrap().remove(key) {
            let mut by_ip = self.pods_by_ip.write().unwrap();
            for ip in ips {
                by_ip.remove(&ip);
            }
        }
    }

    pub fn replace_pods(&self, pods: &[Pod]) {
        self.pods_by_ip.write().unwrap().clear();
        self.pod_keys.write().unwrap().clear();
        for pod in pods {
            self.apply_pod(pod);
        }
        self.pods_synced.send_replace(true);
    }

    pub fn apply_slice(&self, slice: &EndpointSlice) {
        let Some(key) = object_key(&slice.metadata) else {
            return;
        };
        self.delete_slice_key(&key);

        let Some(service_name) = slice
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(SERVICE_NAME_LABEL))
            .cloned()
        else {
            return;
        };
        let namespace = slice.metadata.namespace.clone().unwrap_or_default();

        let ports: Vec<u16> = slice
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|p| p.port)
            .filter_map(|p| u16::try_from(p).ok())
            .collect();

        let mut indexed: Vec<(IpAddr, u16)> = Vec::new();
        {
            let mut by_addr_port = self.svc_by_addr_port.write().unwrap();
            let mut by_addr = self.svc_by_addr.write().unwrap();
            for endpoint in &slice.endpoints {
                for addr in &endpoint.addresses {
                    let Ok(ip) = addr.parse::<IpAddr>() else {
                        continue;
                    };
                    by_addr.insert(
                        ip,
                        Arc::new(ServiceInfo {
                            name: service_name.clone(),
                            namespace: namespace.clone(),
                            port: ports.first().copied().unwrap_or(0),
                        }),
                    );
                    if ports.is_empty() {
                        indexed.push((ip, 0));
                        continue;
                    }
                    for port in &ports {
                        by_addr_port.insert(
                            (ip, *port),
                            Arc::new(ServiceInfo {
                                name: service_name.clone(),
                                namespace: namespace.clone(),
                                port: *port,
                            }),
                        );
                        indexed.push((ip, *port));
                    }
                }
            }
        }
        self.slice_keys.write().unwrap().insert(key, indexed);
    }

    pub fn delete_slice(&self, slice: &EndpointSlice) {
        if let Some(key) = object_key(&slice.metadata) {
            self.delete_slice_key(&key);
        }
    }

    fn delete_slice_key(&self, key: &str) {
        if let Some(pairs) = self.slice_keys.write().unwrap().remove(key) {
            let mut by_addr_port = self.svc_by_addr_port.write().unwrap();
            let mut by_addr = self.svc_by_addr.write().unwrap();
            for (ip, port) in pairs {
                by_addr_port.remove(&(ip, port));
                by_addr.remove(&ip);
            }
        }
    }

    pub fn replace_slices(&self, slices: &[EndpointSlice]) {
        self.svc_by_addr_port.write().unwrap().clear();
        self.svc_by_addr.write().unwrap().clear();
        self.slice_keys.write().unwrap().clear();
        for slice in slices {
            self.apply_slice(slice);
        }
        self.slices_synced.send_replace(true);
    }
}

impl Default for ClusterIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn object_key(meta: &kube::core::ObjectMeta) -> Option<String> {
    let name = meta.name.as_deref()?;
    let namespace = meta.namespace.as_deref().unwrap_or_default();
    Some(format!("{namespace}/{name}"))
}

pub fn pod_info(pod: &Pod) -> Option<PodInfo> {
    let name = pod.metadata.name.clone()?;
    Some(PodInfo {
        name,
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        labels: pod.metadata.labels.clone().unwrap_or_default(),
    })
}

/// Starts the cluster-wide Pod and EndpointSlice watchers feeding the
/// index. The watch streams reconnect internally; stream-level errors are
/// logged and retried.
pub fn spawn_watchers(client: Client, index: Arc<ClusterIndex>) -> Vec<JoinHandle<()>> {
    let pods: Api<Pod> = Api::all(client.clone());
    let slices: Api<EndpointSlice> = Api::all(client);

    let pod_index = Arc::clone(&index);
    let pod_task = tokio::spawn(async move {
        let mut stream = watcher(pods, watcher::Config::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Applied(pod)) => pod_index.apply_pod(&pod),
                Ok(watcher::Event::Deleted(pod)) => pod_index.delete_pod(&pod),
                Ok(watcher::Event::Restarted(pods)) => pod_index.replace_pods(&pods),
                Err(err) => {
                    warn!("[k8s] pod watch error: {err}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let slice_task = tokio::spawn(async move {
        let mut stream = watcher(slices, watcher::Config::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Applied(slice)) => index.apply_slice(&slice),
                Ok(watcher::Event::Deleted(slice)) => index.delete_slice(&slice),
                Ok(watcher::Event::Restarted(slices)) => index.replace_slices(&slices),
                Err(err) => {
                    warn!("[k8s] endpointslice watch error: {err}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    vec![pod_task, slice_task]
}
