use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::names::{NamespacedName, ServicePortName};
use crate::service::Protocol;

/// An address of a backend pod serving a Service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub ip: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub pod_id: Option<String>,
}

/// A port exposed by a backend pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointPort {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Endpoint represents the set of backend addresses for a Service.
/// Equivalent to an Endpoints object in Kubernetes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub service_id: String,
    pub service_name: String,
    pub namespace: String,
    pub addresses: Vec<EndpointAddress>,
    pub ports: Vec<EndpointPort>,
    pub created_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn service(&self) -> NamespacedName {
        NamespacedName::new(&self.namespace, &self.service_name)
    }

    /// Backend `ip:port` strings for every named port of this Endpoint.
    pub fn backends_by_port(&self) -> Vec<(ServicePortName, Vec<String>)> {
        let service = self.service();
        self.ports
            .iter()
            .map(|p| {
                let backends = self
                    .addresses
                    .iter()
                    .map(|a| join_host_port(&a.ip, p.port))
                    .collect();
                (ServicePortName::new(service.clone(), &p.name), backends)
            })
            .collect()
    }
}

/// `host:port`, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backends_by_port() {
        let ep = Endpoint {
            id: "ep-1".to_string(),
            service_id: "svc-1".to_string(),
            service_name: "web".to_string(),
            namespace: "default".to_string(),
            addresses: vec![
                EndpointAddress {
                    ip: "10.42.0.2".to_string(),
                    node_id: None,
                    pod_id: None,
                },
                EndpointAddress {
                    ip: "fd00::2".to_string(),
                    node_id: None,
                    pod_id: None,
                },
            ],
            ports: vec![EndpointPort {
                name: "http".to_string(),
                port: 8080,
                protocol: Protocol::Tcp,
            }],
            created_at: Utc::now(),
        };
        let map = ep.backends_by_port();
        assert_eq!(map.len(), 1);
        assert_eq!(map[0].0.to_string(), "default/web:http");
        assert_eq!(map[0].1, vec!["10.42.0.2:8080", "[fd00::2]:8080"]);
    }
}
