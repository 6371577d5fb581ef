use std::net::IpAddr;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::ListParams;
use kube::{Api, Client};
use log::debug;

use super::index::pod_info;
use super::{PodInfo, ServiceInfo, SERVICE_NAME_LABEL};

/// On-demand pod lookup: cluster-wide field-selector list on `status.podIP`.
/// Callers bound this with the API timeout; a miss or API error is just
/// None.
pub async fn pod_for_ip(client: &Client, ip: IpAddr) -> Option<PodInfo> {
    let pods: Api<Pod> = Api::all(client.clone());
    let params = ListParams::default().fields(&format!("status.podIP={ip}"));
    match pods.list(&params).await {
        Ok(list) => list.items.iter().find_map(pod_info),
        Err(err) => {
            debug!("[k8s] on-demand pod lookup for {ip} failed: {err}");
            None
        }
    }
}

/// On-demand service lookup: cluster-wide EndpointSlice scan for the
/// address, preferring an exact port match.
pub async fn service_for_addr(client: &Client, ip: IpAddr, port: u16) -> Option<ServiceInfo> {
    let slices: Api<EndpointSlice> = Api::all(client.clone());
    let list = match slices.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(err) => {
            debug!("[k8s] on-demand endpointslice scan for {ip}:{port} failed: {err}");
            return None;
        }
    };

    let addr = ip.to_string();
    let mut addr_only: Option<ServiceInfo> = None;
    for slice in &list.items {
        let Some(service_name) = slice
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(SERVICE_NAME_LABEL))
        else {
            continue;
        };
        let holds_addr = slice
            .endpoints
            .iter()
            .any(|e| e.addresses.iter().any(|a| a == &addr));
        if !holds_addr {
            continue;
        }
        let namespace = slice.metadata.namespace.clone().unwrap_or_default();
        let ports: Vec<u16> = slice
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|p| p.port)
            .filter_map(|p| u16::try_from(p).ok())
            .collect();
        if port > 0 && ports.contains(&port) {
            return Some(ServiceInfo {
                name: service_name.clone(),
                namespace,
                port,
            });
        }
        if addr_only.is_none() {
            addr_only = Some(ServiceInfo {
                name: service_name.clone(),
                namespace,
                port: ports.first().copied().unwrap_or(0),
            });
        }
    }
    addr_only
}
