use chrono::{DateTime, Utc};
use pkg_constants::network::CLUSTER_IP_NONE;
use pkg_constants::proxy::DEFAULT_CLIENT_IP_TIMEOUT_SECS;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::names::NamespacedName;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::ClusterIP => write!(f, "ClusterIP"),
            ServiceType::NodePort => write!(f, "NodePort"),
            ServiceType::LoadBalancer => write!(f, "LoadBalancer"),
            ServiceType::ExternalName => write!(f, "ExternalName"),
        }
    }
}

/// Transport protocol of a service port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    /// Lowercase form used by iptables `-p` / `-m` matches.
    pub fn as_lower(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Sctp => write!(f, "SCTP"),
        }
    }
}

/// Session affinity mode of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionAffinity {
    #[default]
    None,
    ClientIP,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    pub port: u16,
    pub target_port: u16,
    #[serde(default)]
    pub node_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub selector: HashMap<String, String>,
    pub ports: Vec<ServicePort>,
    pub service_type: ServiceType,
    /// Legacy externally reachable addresses routed to this service.
    #[serde(default)]
    pub external_ips: Vec<String>,
    #[serde(default)]
    pub session_affinity: SessionAffinity,
    /// Sticky-session lifetime when `session_affinity` is `ClientIP`.
    #[serde(default)]
    pub session_affinity_timeout_seconds: Option<u32>,
}

/// One address published by an external load balancer for this service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerIngress {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerStatus {
    #[serde(default)]
    pub ingress: Vec<LoadBalancerIngress>,
}

impl LoadBalancerStatus {
    /// Ingress entries that carry an IP (hostname-only entries are not proxied).
    pub fn ingress_ips(&self) -> impl Iterator<Item = &str> {
        self.ingress
            .iter()
            .filter_map(|i| i.ip.as_deref())
            .filter(|ip| !ip.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    #[serde(default)]
    pub load_balancer: LoadBalancerStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub spec: ServiceSpec,
    #[serde(default)]
    pub cluster_ip: Option<String>,
    #[serde(default)]
    pub status: ServiceStatus,
    pub created_at: DateTime<Utc>,
}

impl Service {
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(&self.namespace, &self.name)
    }

    /// Whether the userspace proxy must leave this service alone:
    /// headless services and services without a cluster IP have nothing to
    /// redirect, ExternalName services are resolved by DNS.
    pub fn should_skip_proxy(&self) -> bool {
        match self.cluster_ip.as_deref() {
            None | Some("") | Some(CLUSTER_IP_NONE) => return true,
            Some(_) => {}
        }
        self.spec.service_type == ServiceType::ExternalName
    }

    /// Sticky-session lifetime; zero unless ClientIP affinity is requested.
    pub fn sticky_max_age_seconds(&self) -> u32 {
        match self.spec.session_affinity {
            SessionAffinity::ClientIP => self
                .spec
                .session_affinity_timeout_seconds
                .unwrap_or(DEFAULT_CLIENT_IP_TIMEOUT_SECS),
            SessionAffinity::None => 0,
        }
    }
}
