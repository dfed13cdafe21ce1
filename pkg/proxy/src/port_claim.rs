use pkg_types::endpoint::join_host_port;
use pkg_types::names::ServicePortName;
use pkg_types::service::Protocol;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ProxyError;
use crate::socket::{ProxySocket, ProxySocketFactory};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortMapKey {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

impl std::fmt::Display for PortMapKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}",
            join_host_port(&self.ip.to_string(), self.port),
            self.protocol
        )
    }
}

struct PortMapValue {
    owner: ServicePortName,
    socket: Arc<dyn ProxySocket>,
}

/// Registry of host ports held on behalf of service ports. One owner per
/// (ip, port, protocol); re-claiming with the same owner is a no-op.
///
/// Each claim keeps a bound socket open. Traffic is redirected by iptables
/// and never reaches it, but holding the port makes the claim visible to
/// `ss`/`netstat` and stops other processes from binding it.
pub struct PortClaimRegistry {
    socket_factory: Arc<dyn ProxySocketFactory>,
    ports: Mutex<HashMap<PortMapKey, PortMapValue>>,
}

impl PortClaimRegistry {
    pub fn new(socket_factory: Arc<dyn ProxySocketFactory>) -> Self {
        Self {
            socket_factory,
            ports: Mutex::new(HashMap::new()),
        }
    }

    pub async fn claim(
        &self,
        ip: IpAddr,
        port: u16,
        protocol: Protocol,
        owner: &ServicePortName,
    ) -> Result<(), ProxyError> {
        let mut ports = self.ports.lock().await;
        let key = PortMapKey { ip, port, protocol };
        if let Some(existing) = ports.get(&key) {
            if existing.owner == *owner {
                return Ok(());
            }
            return Err(ProxyError::PortConflict {
                key: key.to_string(),
                owner: owner.clone(),
                existing: existing.owner.clone(),
            });
        }

        let socket = self
            .socket_factory
            .make(protocol, ip, port)
            .await
            .map_err(|source| ProxyError::ClaimSocket {
                key: key.to_string(),
                source,
            })?;
        info!("Claimed local port {} for {}", key, owner);
        ports.insert(
            key,
            PortMapValue {
                owner: owner.clone(),
                socket,
            },
        );
        Ok(())
    }

    /// Release a claim. An unclaimed key is tolerated so teardown paths may
    /// run twice; a key held by someone else is a conflict.
    pub async fn release(
        &self,
        ip: IpAddr,
        port: u16,
        protocol: Protocol,
        owner: &ServicePortName,
    ) -> Result<(), ProxyError> {
        let mut ports = self.ports.lock().await;
        let key = PortMapKey { ip, port, protocol };
        let Some(existing) = ports.get(&key) else {
            info!("Ignoring release on unowned port {}", key);
            return Ok(());
        };
        if existing.owner != *owner {
            return Err(ProxyError::ReleaseConflict {
                key: key.to_string(),
                owner: owner.clone(),
                existing: existing.owner.clone(),
            });
        }
        if let Some(value) = ports.remove(&key) {
            close_reservation(&key, value.socket.as_ref());
        }
        Ok(())
    }

    /// Release every address `owner` holds for (port, protocol), whatever
    /// the current local-address set looks like.
    pub async fn release_owned(
        &self,
        port: u16,
        protocol: Protocol,
        owner: &ServicePortName,
    ) -> usize {
        let mut ports = self.ports.lock().await;
        let keys: Vec<PortMapKey> = ports
            .iter()
            .filter(|(k, v)| k.port == port && k.protocol == protocol && v.owner == *owner)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            if let Some(value) = ports.remove(key) {
                close_reservation(key, value.socket.as_ref());
            }
        }
        keys.len()
    }

    pub async fn keys_owned_by(&self, owner: &ServicePortName) -> Vec<PortMapKey> {
        let mut keys: Vec<PortMapKey> = self
            .ports
            .lock()
            .await
            .iter()
            .filter(|(_, v)| v.owner == *owner)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort_by_key(|k| (k.ip, k.port));
        keys
    }

    pub async fn len(&self) -> usize {
        self.ports.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ports.lock().await.is_empty()
    }
}

fn close_reservation(key: &PortMapKey, socket: &dyn ProxySocket) {
    if let Err(e) = socket.close() {
        warn!("Failed to close reservation socket for {}: {}", key, e);
    }
    info!("Released local port {}", key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSocketFactory;
    use pkg_types::names::NamespacedName;

    fn owner(name: &str) -> ServicePortName {
        ServicePortName::new(NamespacedName::new("default", name), "http")
    }

    fn ip() -> IpAddr {
        "192.168.1.10".parse().unwrap()
    }

    #[tokio::test]
    async fn test_claim_is_idempotent_for_same_owner() {
        let factory = Arc::new(FakeSocketFactory::new());
        let registry = PortClaimRegistry::new(factory.clone());
        registry.claim(ip(), 80, Protocol::Tcp, &owner("a")).await.unwrap();
        registry.claim(ip(), 80, Protocol::Tcp, &owner("a")).await.unwrap();
        assert_eq!(registry.len().await, 1);
        assert_eq!(factory.sockets().len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_claim_names_both_owners() {
        let registry = PortClaimRegistry::new(Arc::new(FakeSocketFactory::new()));
        registry.claim(ip(), 80, Protocol::Tcp, &owner("a")).await.unwrap();
        let err = registry
            .claim(ip(), 80, Protocol::Tcp, &owner("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::PortConflict { .. }));
        let msg = err.to_string();
        assert!(msg.contains("default/a:http"), "{}", msg);
        assert!(msg.contains("default/b:http"), "{}", msg);

        // Same port on another protocol is a different key.
        registry.claim(ip(), 80, Protocol::Udp, &owner("b")).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_unclaimed_is_tolerated() {
        let registry = PortClaimRegistry::new(Arc::new(FakeSocketFactory::new()));
        registry
            .release(ip(), 8080, Protocol::Tcp, &owner("a"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_release_by_other_owner_is_conflict() {
        let registry = PortClaimRegistry::new(Arc::new(FakeSocketFactory::new()));
        registry.claim(ip(), 80, Protocol::Tcp, &owner("a")).await.unwrap();
        let err = registry
            .release(ip(), 80, Protocol::Tcp, &owner("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ReleaseConflict { .. }));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_release_closes_reservation_socket() {
        let factory = Arc::new(FakeSocketFactory::new());
        let registry = PortClaimRegistry::new(factory.clone());
        registry.claim(ip(), 80, Protocol::Tcp, &owner("a")).await.unwrap();
        registry.release(ip(), 80, Protocol::Tcp, &owner("a")).await.unwrap();
        assert!(registry.is_empty().await);
        assert!(factory.sockets()[0].is_closed());
    }

    #[tokio::test]
    async fn test_failed_socket_leaves_no_claim() {
        let factory = Arc::new(FakeSocketFactory::new());
        factory.fail_port(80);
        let registry = PortClaimRegistry::new(factory);
        let err = registry
            .claim(ip(), 80, Protocol::Tcp, &owner("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ClaimSocket { .. }));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_release_owned_covers_every_address() {
        let registry = PortClaimRegistry::new(Arc::new(FakeSocketFactory::new()));
        let other: IpAddr = "10.1.0.1".parse().unwrap();
        registry.claim(ip(), 30080, Protocol::Tcp, &owner("a")).await.unwrap();
        registry.claim(other, 30080, Protocol::Tcp, &owner("a")).await.unwrap();
        registry.claim(other, 30081, Protocol::Tcp, &owner("b")).await.unwrap();
        assert_eq!(registry.release_owned(30080, Protocol::Tcp, &owner("a")).await, 2);
        assert!(registry.keys_owned_by(&owner("a")).await.is_empty());
        assert_eq!(registry.len().await, 1);
    }
}
