//! Creation, replacement and teardown of per-port proxy instances.
//!
//! Every function here runs with the proxier's service-table lock held and
//! receives the locked state explicitly.

use pkg_types::endpoint::join_host_port;
use pkg_types::names::ServicePortName;
use pkg_types::service::{Protocol, Service, ServicePort};
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{Aggregate, ProxyError};
use crate::proxier::{Proxier, ProxierState};
use crate::service_info::{Portal, ServiceInfo, ServiceState};

impl Proxier {
    /// Bring every port of `service` in line with its spec. Unchanged ports
    /// are left alone; changed ones are torn down and recreated.
    ///
    /// Returns the port names still declared, for the following unmerge.
    pub(crate) async fn merge_service(
        &self,
        state: &mut ProxierState,
        service: Option<&Service>,
    ) -> HashSet<String> {
        let mut existing_ports = HashSet::new();
        let Some(service) = service else {
            return existing_ports;
        };
        if service.should_skip_proxy() {
            debug!("Skipping service {}: not proxied", service.namespaced_name());
            return existing_ports;
        }
        let cluster_ip = match service.cluster_ip.as_deref().map(str::parse::<IpAddr>) {
            Some(Ok(ip)) => ip,
            _ => {
                warn!(
                    "Skipping service {}: invalid cluster IP {:?}",
                    service.namespaced_name(),
                    service.cluster_ip
                );
                return existing_ports;
            }
        };

        let svc_name = service.namespaced_name();
        for port in &service.spec.ports {
            let name = ServicePortName::new(svc_name.clone(), &port.name);
            existing_ports.insert(port.name.clone());

            if let Some(info) = state.service_map.get(&name).cloned() {
                if info.same_config(service, port) {
                    continue;
                }
                debug!("Something changed for service {}: stopping it", name);
                if let Err(e) = self.cleanup_portal_and_proxy(state, &name, &info).await {
                    error!("Failed to clean up portal and proxy for {}: {}", name, e);
                }
                info.state.set_finished();
            }

            let allocated = self.port_allocator.allocate_next().map_err(ProxyError::Allocate);
            let proxy_port = match allocated {
                Ok(p) => p,
                Err(e) => {
                    error!("Skipping service {}: {}", name, e);
                    continue;
                }
            };
            info!(
                "Adding new service {} at {}/{}",
                name,
                join_host_port(&cluster_ip.to_string(), port.port),
                port.protocol
            );
            let info = match self
                .add_service_on_port(state, &name, service, port, cluster_ip, proxy_port)
                .await
            {
                Ok(info) => info,
                Err(e) => {
                    error!("Failed to start proxy for {}: {}", name, e);
                    self.port_allocator.release(proxy_port);
                    continue;
                }
            };
            debug!("Record service info {:?}", info);

            if let Err(e) = self.portals.open_portal(&name, &info, &state.local_addrs).await {
                error!("Failed to open portal for {}: {}", name, e);
            }
            self.load_balancer
                .new_service(&name, info.session_affinity, info.sticky_max_age_seconds);
            info.state.set_started();
        }
        existing_ports
    }

    /// Tear down every port of the stale `service` that is not in
    /// `existing_ports`, then flush conntrack for UDP cluster IPs that no
    /// longer have any instance.
    pub(crate) async fn unmerge_service(
        &self,
        state: &mut ProxierState,
        service: Option<&Service>,
        existing_ports: &HashSet<String>,
    ) {
        let Some(service) = service else {
            return;
        };
        if service.should_skip_proxy() {
            return;
        }

        let svc_name = service.namespaced_name();
        let mut stale_udp_ips: BTreeSet<IpAddr> = BTreeSet::new();
        for port in &service.spec.ports {
            if existing_ports.contains(&port.name) {
                continue;
            }
            let name = ServicePortName::new(svc_name.clone(), &port.name);
            info!("Stopping service {}", name);
            let Some(info) = state.service_map.get(&name).cloned() else {
                error!("Service {} is being removed but doesn't exist", name);
                continue;
            };
            if info.protocol == Protocol::Udp {
                stale_udp_ips.insert(info.portal.ip);
            }
            if let Err(e) = self.cleanup_portal_and_proxy(state, &name, &info).await {
                error!("Failed to clean up portal and proxy for {}: {}", name, e);
            }
            self.load_balancer.delete_service(&name);
            info.state.set_finished();
        }

        stale_udp_ips.retain(|ip| {
            !state
                .service_map
                .values()
                .any(|i| i.protocol == Protocol::Udp && i.portal.ip == *ip)
        });
        for ip in stale_udp_ips {
            if let Err(e) = self
                .conntrack
                .clear_entries_for_ip(&ip.to_string(), Protocol::Udp)
                .await
            {
                error!("Failed to delete stale service IP {} connections: {}", ip, e);
            }
        }
    }

    /// Open the proxy socket for one service port, record the instance and
    /// start its serving loop.
    async fn add_service_on_port(
        &self,
        state: &mut ProxierState,
        name: &ServicePortName,
        service: &Service,
        port: &ServicePort,
        cluster_ip: IpAddr,
        proxy_port: u16,
    ) -> Result<ServiceInfo, ProxyError> {
        let socket = self
            .socket_factory
            .make(port.protocol, self.listen_ip, proxy_port)
            .await
            .map_err(|source| ProxyError::Socket {
                service: name.clone(),
                source,
            })?;
        let info = ServiceInfo {
            portal: Portal {
                ip: cluster_ip,
                port: port.port,
                is_external: false,
            },
            protocol: port.protocol,
            proxy_port: socket.listen_port(),
            socket: socket.clone(),
            node_port: port.node_port,
            load_balancer_status: service.status.load_balancer.clone(),
            session_affinity: service.spec.session_affinity,
            sticky_max_age_seconds: service.sticky_max_age_seconds(),
            external_ips: service.spec.external_ips.clone(),
            state: Arc::new(ServiceState::new(self.udp_idle_timeout)),
        };
        state.service_map.insert(name.clone(), info.clone());
        info!(
            "Proxying for service {} ({}) on port {}",
            name, info.protocol, info.proxy_port
        );

        let service_name = name.clone();
        let service_state = info.state.clone();
        let load_balancer = self.load_balancer.clone();
        tokio::spawn(async move {
            socket
                .proxy_loop(service_name, service_state, load_balancer)
                .await;
        });
        Ok(info)
    }

    /// Forget the instance, close its socket and hand its port back.
    pub(crate) fn stop_proxy(
        &self,
        state: &mut ProxierState,
        name: &ServicePortName,
        info: &ServiceInfo,
    ) -> Result<(), ProxyError> {
        state.service_map.remove(name);
        info.state.set_alive(false);
        let closed = info.socket.close();
        self.port_allocator.release(info.socket.listen_port());
        closed.map_err(|source| ProxyError::Socket {
            service: name.clone(),
            source,
        })
    }

    /// Close the portal, then stop the proxy even if closing failed so the
    /// socket and port are never leaked.
    pub(crate) async fn cleanup_portal_and_proxy(
        &self,
        state: &mut ProxierState,
        name: &ServicePortName,
        info: &ServiceInfo,
    ) -> Result<(), ProxyError> {
        let mut el = Aggregate::new();
        match self.portals.close_portal(name, info, &state.local_addrs).await {
            Ok(()) => {}
            Err(ProxyError::Aggregate(errs)) => el.extend(errs),
            Err(e) => el.push(e),
        }
        if let Err(e) = self.stop_proxy(state, name, info) {
            el.push(e);
        }
        el.into_result()
    }
}
