use pkg_types::service::{LoadBalancerStatus, Protocol, Service, ServicePort, SessionAffinity};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::socket::ProxySocket;

/// One reachable, proxied address of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Portal {
    pub ip: IpAddr,
    pub port: u16,
    pub is_external: bool,
}

/// Flags shared with the serving loop, which reads them without the
/// proxier's service-table lock.
#[derive(Debug)]
pub struct ServiceState {
    alive: AtomicBool,
    started: AtomicBool,
    finished: AtomicBool,
    /// Idle timeout of proxied UDP client flows.
    pub udp_idle_timeout: Duration,
}

impl ServiceState {
    pub fn new(udp_idle_timeout: Duration) -> Self {
        Self {
            alive: AtomicBool::new(true),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            udp_idle_timeout,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    /// Set once the portal is open and the load balancer knows the service.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn set_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Set once the instance has been torn down.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

/// Live record of one proxied service port.
///
/// Never mutated in place: a configuration change tears the instance down
/// and creates a new one, because the socket and the portal rules are keyed
/// to `proxy_port`.
#[derive(Clone)]
pub struct ServiceInfo {
    pub portal: Portal,
    pub protocol: Protocol,
    pub proxy_port: u16,
    pub socket: Arc<dyn ProxySocket>,
    pub node_port: Option<u16>,
    pub load_balancer_status: LoadBalancerStatus,
    pub session_affinity: SessionAffinity,
    pub sticky_max_age_seconds: u32,
    pub external_ips: Vec<String>,
    pub state: Arc<ServiceState>,
}

impl ServiceInfo {
    /// True when nothing externally observable differs from `port` of `service`.
    pub fn same_config(&self, service: &Service, port: &ServicePort) -> bool {
        if self.protocol != port.protocol
            || self.portal.port != port.port
            || self.node_port != port.node_port
        {
            return false;
        }
        let cluster_ip = service.cluster_ip.as_deref().and_then(|ip| ip.parse::<IpAddr>().ok());
        if cluster_ip != Some(self.portal.ip) {
            return false;
        }
        self.external_ips == service.spec.external_ips
            && self.load_balancer_status == service.status.load_balancer
            && self.session_affinity == service.spec.session_affinity
            && self.sticky_max_age_seconds == service.sticky_max_age_seconds()
    }

    /// The cluster portal, then one per external IP, then one per
    /// load-balancer ingress IP. Unparseable addresses are skipped.
    pub fn portals(&self) -> Vec<Portal> {
        let mut portals = vec![self.portal];
        for ip in &self.external_ips {
            if let Some(ip) = parse_portal_ip(ip) {
                portals.push(Portal {
                    ip,
                    port: self.portal.port,
                    is_external: true,
                });
            }
        }
        for ip in self.load_balancer_status.ingress_ips() {
            if let Some(ip) = parse_portal_ip(ip) {
                portals.push(Portal {
                    ip,
                    port: self.portal.port,
                    is_external: false,
                });
            }
        }
        portals
    }
}

impl std::fmt::Debug for ServiceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInfo")
            .field("portal", &self.portal)
            .field("protocol", &self.protocol)
            .field("proxy_port", &self.proxy_port)
            .field("node_port", &self.node_port)
            .field("external_ips", &self.external_ips)
            .field("session_affinity", &self.session_affinity)
            .field("sticky_max_age_seconds", &self.sticky_max_age_seconds)
            .field("alive", &self.state.is_alive())
            .finish()
    }
}

fn parse_portal_ip(ip: &str) -> Option<IpAddr> {
    match ip.parse() {
        Ok(ip) => Some(ip),
        Err(_) => {
            warn!("Skipping portal with invalid address {:?}", ip);
            None
        }
    }
}
