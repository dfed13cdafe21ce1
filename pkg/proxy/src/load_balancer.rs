use anyhow::{Result, anyhow};
use pkg_constants::proxy::DEFAULT_CLIENT_IP_TIMEOUT_SECS;
use pkg_types::endpoint::Endpoint;
use pkg_types::names::ServicePortName;
use pkg_types::service::SessionAffinity;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Endpoint selection and session affinity for proxied service ports.
pub trait LoadBalancer: Send + Sync {
    /// Pick a backend `ip:port` for a connection from `src`.
    fn next_endpoint(
        &self,
        service: &ServicePortName,
        src: SocketAddr,
        reset_affinity: bool,
    ) -> Result<String>;

    fn new_service(
        &self,
        service: &ServicePortName,
        affinity: SessionAffinity,
        sticky_max_age_seconds: u32,
    );

    fn delete_service(&self, service: &ServicePortName);

    /// Forget sticky sessions that outlived their max age.
    fn cleanup_stale_sticky_sessions(&self, service: &ServicePortName);

    fn on_endpoints_add(&self, endpoints: &Endpoint);

    fn on_endpoints_update(&self, old: &Endpoint, endpoints: &Endpoint);

    fn on_endpoints_delete(&self, endpoints: &Endpoint);

    fn on_endpoints_synced(&self);
}

#[derive(Debug)]
struct StickySession {
    endpoint: String,
    last_used: Instant,
}

#[derive(Debug)]
struct BalancerState {
    endpoints: Vec<String>,
    index: usize,
    affinity: SessionAffinity,
    ttl: Duration,
    sticky: HashMap<IpAddr, StickySession>,
}

impl BalancerState {
    fn new(affinity: SessionAffinity, ttl_seconds: u32) -> Self {
        let ttl_seconds = if ttl_seconds == 0 {
            DEFAULT_CLIENT_IP_TIMEOUT_SECS
        } else {
            ttl_seconds
        };
        Self {
            endpoints: Vec::new(),
            index: 0,
            affinity,
            ttl: Duration::from_secs(ttl_seconds as u64),
            sticky: HashMap::new(),
        }
    }

    fn set_endpoints(&mut self, endpoints: Vec<String>) {
        let keep: HashSet<&String> = endpoints.iter().collect();
        self.sticky.retain(|_, s| keep.contains(&s.endpoint));
        self.endpoints = endpoints;
        self.index = 0;
    }

    fn purge_stale(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.sticky
            .retain(|_, s| now.saturating_duration_since(s.last_used) < ttl);
    }
}

/// Round-robin load balancer with optional ClientIP affinity.
pub struct RoundRobinBalancer {
    services: Mutex<HashMap<ServicePortName, BalancerState>>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
        }
    }

    fn services(&self) -> std::sync::MutexGuard<'_, HashMap<ServicePortName, BalancerState>> {
        self.services.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current backends of a service port.
    pub fn endpoints(&self, service: &ServicePortName) -> Vec<String> {
        self.services()
            .get(service)
            .map(|s| s.endpoints.clone())
            .unwrap_or_default()
    }

    pub fn has_service(&self, service: &ServicePortName) -> bool {
        self.services().contains_key(service)
    }

    fn update_all(&self, endpoints: &Endpoint) {
        let mut services = self.services();
        for (name, backends) in endpoints.backends_by_port() {
            let state = services
                .entry(name.clone())
                .or_insert_with(|| BalancerState::new(SessionAffinity::None, 0));
            if state.endpoints != backends {
                info!("LoadBalancer: endpoints for {} set to {:?}", name, backends);
                state.set_endpoints(backends);
            }
        }
    }

    fn clear_ports(&self, endpoints: &Endpoint, keep: &HashSet<ServicePortName>) {
        let mut services = self.services();
        for (name, _) in endpoints.backends_by_port() {
            if keep.contains(&name) {
                continue;
            }
            if let Some(state) = services.get_mut(&name) {
                info!("LoadBalancer: removing endpoints for {}", name);
                state.set_endpoints(Vec::new());
            }
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn next_endpoint(
        &self,
        service: &ServicePortName,
        src: SocketAddr,
        reset_affinity: bool,
    ) -> Result<String> {
        let mut services = self.services();
        let state = services
            .get_mut(service)
            .ok_or_else(|| anyhow!("unknown service port {}", service))?;
        if state.endpoints.is_empty() {
            return Err(anyhow!("no endpoints available for {}", service));
        }

        let sticky = state.affinity == SessionAffinity::ClientIP;
        let now = Instant::now();
        if sticky && !reset_affinity {
            let ttl = state.ttl;
            if let Some(session) = state.sticky.get_mut(&src.ip())
                && now.saturating_duration_since(session.last_used) < ttl
            {
                session.last_used = now;
                debug!("LoadBalancer: {} sticks to {}", src.ip(), session.endpoint);
                return Ok(session.endpoint.clone());
            }
        }

        let endpoint = state.endpoints[state.index % state.endpoints.len()].clone();
        state.index = (state.index + 1) % state.endpoints.len();
        if sticky {
            state.sticky.insert(
                src.ip(),
                StickySession {
                    endpoint: endpoint.clone(),
                    last_used: now,
                },
            );
        }
        Ok(endpoint)
    }

    fn new_service(
        &self,
        service: &ServicePortName,
        affinity: SessionAffinity,
        sticky_max_age_seconds: u32,
    ) {
        let mut services = self.services();
        match services.get_mut(service) {
            Some(state) => {
                let endpoints = std::mem::take(&mut state.endpoints);
                *state = BalancerState::new(affinity, sticky_max_age_seconds);
                state.endpoints = endpoints;
            }
            None => {
                services.insert(
                    service.clone(),
                    BalancerState::new(affinity, sticky_max_age_seconds),
                );
            }
        }
        debug!("LoadBalancer: registered {} (affinity {:?})", service, affinity);
    }

    fn delete_service(&self, service: &ServicePortName) {
        if self.services().remove(service).is_some() {
            debug!("LoadBalancer: deleted {}", service);
        }
    }

    fn cleanup_stale_sticky_sessions(&self, service: &ServicePortName) {
        if let Some(state) = self.services().get_mut(service) {
            state.purge_stale(Instant::now());
        }
    }

    fn on_endpoints_add(&self, endpoints: &Endpoint) {
        self.update_all(endpoints);
    }

    fn on_endpoints_update(&self, old: &Endpoint, endpoints: &Endpoint) {
        let keep: HashSet<ServicePortName> = endpoints
            .backends_by_port()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        self.clear_ports(old, &keep);
        self.update_all(endpoints);
    }

    fn on_endpoints_delete(&self, endpoints: &Endpoint) {
        self.clear_ports(endpoints, &HashSet::new());
    }

    fn on_endpoints_synced(&self) {
        debug!("LoadBalancer: endpoints synced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_endpoint;
    use pkg_types::names::NamespacedName;

    fn web() -> ServicePortName {
        ServicePortName::new(NamespacedName::new("default", "web"), "http")
    }

    fn client(ip: &str) -> SocketAddr {
        format!("{}:40000", ip).parse().unwrap()
    }

    #[test]
    fn test_round_robin() {
        let lb = RoundRobinBalancer::new();
        lb.new_service(&web(), SessionAffinity::None, 0);
        lb.on_endpoints_add(&make_endpoint("web", "http", &["10.42.0.2", "10.42.0.3"], 8080));

        let a = lb.next_endpoint(&web(), client("10.1.0.1"), false).unwrap();
        let b = lb.next_endpoint(&web(), client("10.1.0.1"), false).unwrap();
        let c = lb.next_endpoint(&web(), client("10.1.0.1"), false).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_client_ip_affinity() {
        let lb = RoundRobinBalancer::new();
        lb.new_service(&web(), SessionAffinity::ClientIP, 60);
        lb.on_endpoints_add(&make_endpoint("web", "http", &["10.42.0.2", "10.42.0.3"], 8080));

        let first = lb.next_endpoint(&web(), client("10.1.0.1"), false).unwrap();
        for _ in 0..3 {
            assert_eq!(lb.next_endpoint(&web(), client("10.1.0.1"), false).unwrap(), first);
        }
        let reset = lb.next_endpoint(&web(), client("10.1.0.1"), true).unwrap();
        assert_ne!(reset, first);
    }

    #[test]
    fn test_no_endpoints_is_error() {
        let lb = RoundRobinBalancer::new();
        assert!(lb.next_endpoint(&web(), client("10.1.0.1"), false).is_err());
        lb.new_service(&web(), SessionAffinity::None, 0);
        assert!(lb.next_endpoint(&web(), client("10.1.0.1"), false).is_err());
    }

    #[test]
    fn test_endpoints_update_and_delete() {
        let lb = RoundRobinBalancer::new();
        let old = make_endpoint("web", "http", &["10.42.0.2"], 8080);
        lb.on_endpoints_add(&old);
        assert_eq!(lb.endpoints(&web()), vec!["10.42.0.2:8080"]);

        let renamed = make_endpoint("web", "web", &["10.42.0.4"], 8080);
        lb.on_endpoints_update(&old, &renamed);
        assert!(lb.endpoints(&web()).is_empty());
        let other = ServicePortName::new(NamespacedName::new("default", "web"), "web");
        assert_eq!(lb.endpoints(&other), vec!["10.42.0.4:8080"]);

        lb.on_endpoints_delete(&renamed);
        assert!(lb.endpoints(&other).is_empty());
    }

    #[test]
    fn test_new_service_keeps_endpoints() {
        let lb = RoundRobinBalancer::new();
        lb.on_endpoints_add(&make_endpoint("web", "http", &["10.42.0.2"], 8080));
        lb.new_service(&web(), SessionAffinity::ClientIP, 30);
        assert_eq!(lb.endpoints(&web()), vec!["10.42.0.2:8080"]);
        lb.delete_service(&web());
        assert!(!lb.has_service(&web()));
    }

    #[test]
    fn test_purge_stale_sticky_sessions() {
        let mut state = BalancerState::new(SessionAffinity::ClientIP, 10);
        let now = Instant::now();
        state.sticky.insert(
            "10.1.0.1".parse().unwrap(),
            StickySession {
                endpoint: "10.42.0.2:8080".to_string(),
                last_used: now,
            },
        );
        state.purge_stale(now + Duration::from_secs(5));
        assert_eq!(state.sticky.len(), 1);
        state.purge_stale(now + Duration::from_secs(11));
        assert!(state.sticky.is_empty());
    }
}
