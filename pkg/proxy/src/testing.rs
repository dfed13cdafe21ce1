//! In-memory collaborators for unit tests.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use pkg_types::endpoint::{Endpoint, EndpointAddress, EndpointPort};
use pkg_types::names::ServicePortName;
use pkg_types::service::{
    Protocol, Service, ServicePort, ServiceSpec, ServiceStatus, ServiceType, SessionAffinity,
};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::conntrack::Conntrack;
use crate::host::LocalAddrSource;
use crate::iptables::{Chain, Iptables, IptablesError, RulePosition, Table};
use crate::load_balancer::LoadBalancer;
use crate::service_info::{Portal, ServiceInfo, ServiceState};
use crate::socket::{ProxySocket, ProxySocketFactory};

pub fn make_service(
    name: &str,
    cluster_ip: &str,
    ports: &[(&str, u16, Protocol, Option<u16>)],
) -> Service {
    Service {
        id: format!("{}-id", name),
        name: name.to_string(),
        namespace: "default".to_string(),
        spec: ServiceSpec {
            selector: HashMap::new(),
            ports: ports
                .iter()
                .map(|(port_name, port, protocol, node_port)| ServicePort {
                    name: port_name.to_string(),
                    protocol: *protocol,
                    port: *port,
                    target_port: *port,
                    node_port: *node_port,
                })
                .collect(),
            service_type: if ports.iter().any(|p| p.3.is_some()) {
                ServiceType::NodePort
            } else {
                ServiceType::ClusterIP
            },
            external_ips: vec![],
            session_affinity: SessionAffinity::None,
            session_affinity_timeout_seconds: None,
        },
        cluster_ip: Some(cluster_ip.to_string()),
        status: ServiceStatus::default(),
        created_at: Utc::now(),
    }
}

pub fn make_endpoint(service: &str, port_name: &str, ips: &[&str], port: u16) -> Endpoint {
    Endpoint {
        id: format!("{}-ep", service),
        service_id: format!("{}-id", service),
        service_name: service.to_string(),
        namespace: "default".to_string(),
        addresses: ips
            .iter()
            .map(|ip| EndpointAddress {
                ip: ip.to_string(),
                node_id: None,
                pod_id: None,
            })
            .collect(),
        ports: vec![EndpointPort {
            name: port_name.to_string(),
            port,
            protocol: Protocol::Tcp,
        }],
        created_at: Utc::now(),
    }
}

pub fn make_info(ip: &str, port: u16, protocol: Protocol, proxy_port: u16) -> ServiceInfo {
    ServiceInfo {
        portal: Portal {
            ip: ip.parse().unwrap(),
            port,
            is_external: false,
        },
        protocol,
        proxy_port,
        socket: Arc::new(FakeSocket::new(SocketAddr::new(
            "0.0.0.0".parse().unwrap(),
            proxy_port,
        ))),
        node_port: None,
        load_balancer_status: Default::default(),
        session_affinity: SessionAffinity::None,
        sticky_max_age_seconds: 0,
        external_ips: vec![],
        state: Arc::new(ServiceState::new(Duration::from_millis(250))),
    }
}

// ─── iptables ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum IptablesOp {
    Ensure(Table, String, Vec<String>),
    Delete(Table, String, Vec<String>),
}

#[derive(Default)]
struct Tables {
    chains: HashMap<(Table, String), Vec<Vec<String>>>,
    log: Vec<IptablesOp>,
    failing_deletes: HashSet<String>,
    fail_chains: bool,
}

pub struct FakeIptables {
    tables: Mutex<Tables>,
}

impl FakeIptables {
    pub fn new() -> Self {
        let mut tables = Tables::default();
        for (table, chain) in [
            (Table::Nat, Chain::PREROUTING),
            (Table::Nat, Chain::OUTPUT),
            (Table::Filter, Chain::INPUT),
        ] {
            tables.chains.insert((table, chain.to_string()), Vec::new());
        }
        Self {
            tables: Mutex::new(tables),
        }
    }

    pub fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.tables
            .lock()
            .unwrap()
            .chains
            .contains_key(&(table, chain.to_string()))
    }

    pub fn rules(&self, table: Table, chain: &str) -> Vec<Vec<String>> {
        self.tables
            .lock()
            .unwrap()
            .chains
            .get(&(table, chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Rules of `chain` whose joined text contains `needle`.
    pub fn rules_matching(&self, table: Table, chain: &str, needle: &str) -> usize {
        self.rules(table, chain)
            .iter()
            .filter(|r| r.join(" ").contains(needle))
            .count()
    }

    pub fn log(&self) -> Vec<IptablesOp> {
        self.tables.lock().unwrap().log.clone()
    }

    pub fn fail_deletes_in(&self, chain: &str) {
        self.tables
            .lock()
            .unwrap()
            .failing_deletes
            .insert(chain.to_string());
    }

    pub fn fail_chain_creation(&self) {
        self.tables.lock().unwrap().fail_chains = true;
    }

    /// Drop every rule of a chain, as an external `iptables -F` would.
    pub fn wipe(&self, table: Table, chain: &str) {
        if let Some(rules) = self
            .tables
            .lock()
            .unwrap()
            .chains
            .get_mut(&(table, chain.to_string()))
        {
            rules.clear();
        }
    }
}

fn not_found(op: &str, table: Table, chain: &Chain) -> IptablesError {
    IptablesError::NotFound {
        op: op.to_string(),
        table,
        chain: chain.to_string(),
    }
}

#[async_trait]
impl Iptables for FakeIptables {
    async fn ensure_chain(&self, table: Table, chain: &Chain) -> Result<bool, IptablesError> {
        let mut tables = self.tables.lock().unwrap();
        if tables.fail_chains {
            return Err(IptablesError::Exec {
                op: "-N".to_string(),
                table,
                chain: chain.to_string(),
                code: Some(4),
                stderr: "permission denied".to_string(),
            });
        }
        let key = (table, chain.to_string());
        if tables.chains.contains_key(&key) {
            return Ok(true);
        }
        tables.chains.insert(key, Vec::new());
        Ok(false)
    }

    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: &Chain,
        args: &[String],
    ) -> Result<bool, IptablesError> {
        let mut tables = self.tables.lock().unwrap();
        let rules = tables
            .chains
            .get_mut(&(table, chain.to_string()))
            .ok_or_else(|| not_found("-A", table, chain))?;
        if rules.iter().any(|r| r.as_slice() == args) {
            return Ok(true);
        }
        match position {
            RulePosition::Prepend => rules.insert(0, args.to_vec()),
            RulePosition::Append => rules.push(args.to_vec()),
        }
        tables
            .log
            .push(IptablesOp::Ensure(table, chain.to_string(), args.to_vec()));
        Ok(false)
    }

    async fn delete_rule(
        &self,
        table: Table,
        chain: &Chain,
        args: &[String],
    ) -> Result<(), IptablesError> {
        let mut tables = self.tables.lock().unwrap();
        if tables.failing_deletes.contains(chain.as_str()) {
            return Err(IptablesError::Exec {
                op: "-D".to_string(),
                table,
                chain: chain.to_string(),
                code: Some(4),
                stderr: "resource temporarily unavailable".to_string(),
            });
        }
        let Some(rules) = tables.chains.get_mut(&(table, chain.to_string())) else {
            return Ok(());
        };
        let before = rules.len();
        rules.retain(|r| r.as_slice() != args);
        if rules.len() != before {
            tables
                .log
                .push(IptablesOp::Delete(table, chain.to_string(), args.to_vec()));
        }
        Ok(())
    }

    async fn flush_chain(&self, table: Table, chain: &Chain) -> Result<(), IptablesError> {
        let mut tables = self.tables.lock().unwrap();
        let rules = tables
            .chains
            .get_mut(&(table, chain.to_string()))
            .ok_or_else(|| not_found("-F", table, chain))?;
        rules.clear();
        Ok(())
    }

    async fn delete_chain(&self, table: Table, chain: &Chain) -> Result<(), IptablesError> {
        let mut tables = self.tables.lock().unwrap();
        let key = (table, chain.to_string());
        match tables.chains.get(&key) {
            None => Err(not_found("-X", table, chain)),
            Some(rules) if !rules.is_empty() => Err(IptablesError::Exec {
                op: "-X".to_string(),
                table,
                chain: chain.to_string(),
                code: Some(1),
                stderr: "Directory not empty".to_string(),
            }),
            Some(_) => {
                tables.chains.remove(&key);
                Ok(())
            }
        }
    }
}

// ─── sockets ──────────────────────────────────────────────────────────────

pub struct FakeSocket {
    addr: SocketAddr,
    closed: watch::Sender<bool>,
}

impl FakeSocket {
    pub fn new(addr: SocketAddr) -> Self {
        let (closed, _) = watch::channel(false);
        Self { addr, closed }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl ProxySocket for FakeSocket {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn proxy_loop(
        &self,
        _service: ServicePortName,
        _state: Arc<ServiceState>,
        _load_balancer: Arc<dyn LoadBalancer>,
    ) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;
    }

    fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}

pub struct FakeSocketFactory {
    next_port: AtomicU16,
    sockets: Mutex<Vec<Arc<FakeSocket>>>,
    failing: Mutex<HashSet<u16>>,
}

impl FakeSocketFactory {
    pub fn new() -> Self {
        Self {
            next_port: AtomicU16::new(40000),
            sockets: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn sockets(&self) -> Vec<Arc<FakeSocket>> {
        self.sockets.lock().unwrap().clone()
    }

    /// Most recent socket bound to `addr`.
    pub fn socket_at(&self, addr: &str) -> Option<Arc<FakeSocket>> {
        let addr: SocketAddr = addr.parse().unwrap();
        self.sockets()
            .into_iter()
            .rev()
            .find(|s| s.addr() == addr)
    }

    pub fn fail_port(&self, port: u16) {
        self.failing.lock().unwrap().insert(port);
    }
}

#[async_trait]
impl ProxySocketFactory for FakeSocketFactory {
    async fn make(&self, _protocol: Protocol, ip: IpAddr, port: u16) -> Result<Arc<dyn ProxySocket>> {
        if self.failing.lock().unwrap().contains(&port) {
            bail!("bind {}:{}: address already in use", ip, port);
        }
        let port = if port == 0 {
            self.next_port.fetch_add(1, Ordering::Relaxed)
        } else {
            port
        };
        let socket = Arc::new(FakeSocket::new(SocketAddr::new(ip, port)));
        self.sockets.lock().unwrap().push(socket.clone());
        Ok(socket)
    }
}

// ─── load balancer ────────────────────────────────────────────────────────

pub struct FakeLoadBalancer {
    calls: Mutex<Vec<String>>,
    services: Mutex<HashMap<ServicePortName, (SessionAffinity, u32)>>,
}

impl FakeLoadBalancer {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            services: Mutex::new(HashMap::new()),
        }
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn service(&self, name: &ServicePortName) -> Option<(SessionAffinity, u32)> {
        self.services.lock().unwrap().get(name).copied()
    }

    pub fn service_count(&self) -> usize {
        self.services.lock().unwrap().len()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl LoadBalancer for FakeLoadBalancer {
    fn next_endpoint(
        &self,
        service: &ServicePortName,
        _src: SocketAddr,
        _reset_affinity: bool,
    ) -> Result<String> {
        Err(anyhow!("no endpoints for {}", service))
    }

    fn new_service(&self, service: &ServicePortName, affinity: SessionAffinity, max_age: u32) {
        self.record(format!("new {}", service));
        self.services
            .lock()
            .unwrap()
            .insert(service.clone(), (affinity, max_age));
    }

    fn delete_service(&self, service: &ServicePortName) {
        self.record(format!("delete {}", service));
        self.services.lock().unwrap().remove(service);
    }

    fn cleanup_stale_sticky_sessions(&self, service: &ServicePortName) {
        self.record(format!("cleanup {}", service));
    }

    fn on_endpoints_add(&self, endpoints: &Endpoint) {
        self.record(format!("endpoints-add {}", endpoints.service()));
    }

    fn on_endpoints_update(&self, _old: &Endpoint, endpoints: &Endpoint) {
        self.record(format!("endpoints-update {}", endpoints.service()));
    }

    fn on_endpoints_delete(&self, endpoints: &Endpoint) {
        self.record(format!("endpoints-delete {}", endpoints.service()));
    }

    fn on_endpoints_synced(&self) {
        self.record("endpoints-synced".to_string());
    }
}

// ─── host ─────────────────────────────────────────────────────────────────

pub struct FixedLocalAddrs {
    addrs: Mutex<HashSet<IpAddr>>,
}

impl FixedLocalAddrs {
    pub fn new(addrs: &[&str]) -> Self {
        let this = Self {
            addrs: Mutex::new(HashSet::new()),
        };
        this.set(addrs);
        this
    }

    pub fn set(&self, addrs: &[&str]) {
        *self.addrs.lock().unwrap() = addrs.iter().map(|a| a.parse().unwrap()).collect();
    }
}

impl LocalAddrSource for FixedLocalAddrs {
    fn local_addrs(&self) -> Result<HashSet<IpAddr>> {
        Ok(self.addrs.lock().unwrap().clone())
    }
}

pub struct FakeConntrack {
    cleared: Mutex<Vec<String>>,
}

impl FakeConntrack {
    pub fn new() -> Self {
        Self {
            cleared: Mutex::new(Vec::new()),
        }
    }

    pub fn cleared(&self) -> Vec<String> {
        self.cleared.lock().unwrap().clone()
    }
}

#[async_trait]
impl Conntrack for FakeConntrack {
    async fn clear_entries_for_ip(&self, ip: &str, protocol: Protocol) -> Result<()> {
        self.cleared.lock().unwrap().push(format!("{}/{}", ip, protocol));
        Ok(())
    }
}
