use anyhow::Context;
use pkg_constants::network::DEFAULT_LISTEN_IP;
use pkg_constants::paths::DEFAULT_PROXY_CONFIG;
use pkg_constants::proxy::{
    DEFAULT_MIN_SYNC_PERIOD_SECS, DEFAULT_SYNC_PERIOD_SECS, DEFAULT_UDP_IDLE_TIMEOUT_MS,
    OPEN_FILE_LIMIT, SYNC_BURST,
};
use pkg_types::config::{ProxierConfigFile, load_config_file};
use pkg_types::endpoint::Endpoint;
use pkg_types::names::ServicePortName;
use pkg_types::service::Service;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::change_tracker::ChangeTracker;
use crate::conntrack::{Conntrack, ConntrackCommand};
use crate::error::ProxyError;
use crate::host::{LocalAddrSource, SystemLocalAddrs, choose_host_ip, raise_open_file_limit};
use crate::iptables::{Iptables, IptablesCommand};
use crate::load_balancer::LoadBalancer;
use crate::port_allocator::{PortAllocator, PortRange, RangePortAllocator};
use crate::port_claim::PortClaimRegistry;
use crate::portal::{ChainNames, PortalRuleManager};
use crate::runner::BoundedFrequencyRunner;
use crate::service_info::ServiceInfo;
use crate::socket::{ProxySocketFactory, TokioSocketFactory};

/// Tunables of a [`Proxier`].
#[derive(Debug, Clone)]
pub struct ProxierOptions {
    /// Address proxy sockets bind to. The wildcard address is allowed,
    /// loopback is not.
    pub listen_ip: IpAddr,
    /// Proxy ports come from here; an empty range lets the OS pick.
    pub port_range: PortRange,
    pub sync_period: Duration,
    pub min_sync_period: Duration,
    pub udp_idle_timeout: Duration,
}

impl Default for ProxierOptions {
    fn default() -> Self {
        Self {
            listen_ip: DEFAULT_LISTEN_IP
                .parse()
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port_range: PortRange::default(),
            sync_period: Duration::from_secs(DEFAULT_SYNC_PERIOD_SECS),
            min_sync_period: Duration::from_secs(DEFAULT_MIN_SYNC_PERIOD_SECS),
            udp_idle_timeout: Duration::from_millis(DEFAULT_UDP_IDLE_TIMEOUT_MS),
        }
    }
}

impl ProxierOptions {
    /// Resolve a config file, falling back to defaults for missing fields.
    pub fn from_config(config: &ProxierConfigFile) -> anyhow::Result<Self> {
        let mut opts = Self::default();
        if let Some(ip) = &config.listen_ip {
            opts.listen_ip = ip
                .parse()
                .with_context(|| format!("Invalid listen-ip: {}", ip))?;
        }
        if let Some(range) = &config.port_range {
            opts.port_range = range.parse()?;
        }
        if let Some(secs) = config.sync_period_secs {
            opts.sync_period = Duration::from_secs(secs);
        }
        if let Some(secs) = config.min_sync_period_secs {
            opts.min_sync_period = Duration::from_secs(secs);
        }
        if let Some(ms) = config.udp_idle_timeout_ms {
            opts.udp_idle_timeout = Duration::from_millis(ms);
        }
        Ok(opts)
    }

    /// Load options from a YAML file (default `/etc/k3rs/proxy-config.yaml`).
    /// A missing file yields the defaults.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let path = path.unwrap_or(DEFAULT_PROXY_CONFIG);
        let config: ProxierConfigFile = load_config_file(path)
            .with_context(|| format!("Failed to load proxy config {}", path))?;
        Self::from_config(&config)
    }
}

/// Collaborators a [`Proxier`] is built from.
pub struct ProxierDeps {
    pub load_balancer: Arc<dyn LoadBalancer>,
    pub iptables: Arc<dyn Iptables>,
    pub socket_factory: Arc<dyn ProxySocketFactory>,
    /// Defaults to a [`RangePortAllocator`] over `ProxierOptions::port_range`.
    pub port_allocator: Option<Arc<dyn PortAllocator>>,
    pub local_addrs: Arc<dyn LocalAddrSource>,
    pub conntrack: Arc<dyn Conntrack>,
    pub chains: ChainNames,
}

impl ProxierDeps {
    /// The production stack: `iptables` and `conntrack` binaries, tokio
    /// sockets and the host's interface addresses.
    pub fn system(load_balancer: Arc<dyn LoadBalancer>) -> Self {
        Self {
            load_balancer,
            iptables: Arc::new(IptablesCommand::new()),
            socket_factory: Arc::new(TokioSocketFactory),
            port_allocator: None,
            local_addrs: Arc::new(SystemLocalAddrs),
            conntrack: Arc::new(ConntrackCommand::new()),
            chains: ChainNames::default(),
        }
    }
}

/// State guarded by the service-table lock.
pub(crate) struct ProxierState {
    pub(crate) service_map: HashMap<ServicePortName, ServiceInfo>,
    /// Host addresses as of the last pass; decides which portals claim ports.
    pub(crate) local_addrs: HashSet<IpAddr>,
}

/// Userspace service proxy: keeps proxy sockets and portal rules in line
/// with the observed services.
///
/// Event handlers only record changes; all socket and firewall work runs in
/// [`Proxier::sync_proxy_rules`], driven by [`Proxier::sync_loop`].
pub struct Proxier {
    pub(crate) load_balancer: Arc<dyn LoadBalancer>,
    pub(crate) socket_factory: Arc<dyn ProxySocketFactory>,
    pub(crate) port_allocator: Arc<dyn PortAllocator>,
    pub(crate) conntrack: Arc<dyn Conntrack>,
    pub(crate) portals: PortalRuleManager,
    pub(crate) listen_ip: IpAddr,
    pub(crate) udp_idle_timeout: Duration,
    local_addr_source: Arc<dyn LocalAddrSource>,
    state: Mutex<ProxierState>,
    changes: ChangeTracker,
    runner: BoundedFrequencyRunner,
    services_synced: AtomicBool,
    endpoints_synced: AtomicBool,
    initialized: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Proxier {
    /// Validate the listen address, pick the host DNAT target, then install
    /// and flush the owned chains. Rules left by an earlier run point at
    /// proxy ports that no longer exist, hence the flush.
    pub async fn new(opts: ProxierOptions, deps: ProxierDeps) -> Result<Self, ProxyError> {
        if opts.listen_ip.is_loopback() {
            error!("Can't proxy only on localhost - iptables can't do it");
            return Err(ProxyError::ProxyOnLocalhost);
        }

        let local_addrs = deps.local_addrs.local_addrs().unwrap_or_else(|e| {
            warn!("Failed to list local addresses: {}", e);
            HashSet::new()
        });
        let host_ip = if opts.listen_ip.is_unspecified() {
            choose_host_ip(&local_addrs, opts.listen_ip.is_ipv6()).ok_or_else(|| {
                ProxyError::HostInterface(format!(
                    "no usable non-loopback address among {} local addresses",
                    local_addrs.len()
                ))
            })?
        } else {
            opts.listen_ip
        };

        if let Err(e) = raise_open_file_limit(OPEN_FILE_LIMIT) {
            warn!("Failed to set open file limit to {}: {}", OPEN_FILE_LIMIT, e);
        }

        info!(
            "Setting proxy IP to {} (listen {}) and initializing iptables",
            host_ip, opts.listen_ip
        );
        let claims = Arc::new(PortClaimRegistry::new(deps.socket_factory.clone()));
        let portals = PortalRuleManager::new(
            deps.iptables,
            deps.chains,
            opts.listen_ip,
            host_ip,
            claims,
        );
        portals.init().await.map_err(ProxyError::Init)?;
        portals.flush().await.map_err(|e| match e {
            ProxyError::Aggregate(el) => ProxyError::Flush(el),
            other => other,
        })?;

        let port_allocator = deps
            .port_allocator
            .unwrap_or_else(|| Arc::new(RangePortAllocator::new(opts.port_range)) as Arc<dyn PortAllocator>);
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            load_balancer: deps.load_balancer,
            socket_factory: deps.socket_factory,
            port_allocator,
            conntrack: deps.conntrack,
            portals,
            listen_ip: opts.listen_ip,
            udp_idle_timeout: opts.udp_idle_timeout,
            local_addr_source: deps.local_addrs,
            state: Mutex::new(ProxierState {
                service_map: HashMap::new(),
                local_addrs,
            }),
            changes: ChangeTracker::new(),
            runner: BoundedFrequencyRunner::new(
                "userspace-proxy-sync-runner",
                opts.min_sync_period,
                opts.sync_period,
                SYNC_BURST,
            ),
            services_synced: AtomicBool::new(false),
            endpoints_synced: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            stop_tx,
        })
    }

    /// Both services and endpoints have been listed at least once.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Request a reconciliation pass as soon as the rate limit allows.
    pub fn sync(&self) {
        self.runner.run();
    }

    /// Run reconciliation passes until [`Proxier::shutdown`].
    pub async fn sync_loop(&self) {
        let stop = self.stop_tx.subscribe();
        self.runner.run_loop(stop, || self.sync_proxy_rules()).await;
    }

    /// One reconciliation pass. Per-port failures are logged and retried
    /// on the next pass.
    pub async fn sync_proxy_rules(&self) {
        let start = Instant::now();
        if !self.is_initialized() {
            debug!("Not syncing userspace proxy until Services and Endpoints have been received");
            return;
        }

        if let Err(e) = self.portals.init().await {
            error!("Failed to ensure iptables: {}", e);
        }

        let changes = self.changes.take();
        let local_addrs = self.local_addr_source.local_addrs();

        let mut state = self.state.lock().await;
        match local_addrs {
            Ok(addrs) => state.local_addrs = addrs,
            Err(e) => warn!("Failed to refresh local addresses, keeping previous set: {}", e),
        }

        debug!("Processing {} service changes", changes.len());
        for (_, change) in changes {
            let existing_ports = self
                .merge_service(&mut state, change.current.as_ref())
                .await;
            self.unmerge_service(&mut state, change.previous.as_ref(), &existing_ports)
                .await;
        }

        self.ensure_portals(&state).await;
        self.cleanup_stale_sticky_sessions(&state);
        debug!("syncProxyRules complete in {:?}", start.elapsed());
    }

    /// Re-open the portal of every live instance. Rules removed behind our
    /// back come back here; rules that should not exist are not touched.
    async fn ensure_portals(&self, state: &ProxierState) {
        for (name, info) in &state.service_map {
            if let Err(e) = self
                .portals
                .open_portal(name, info, &state.local_addrs)
                .await
            {
                error!("Failed to ensure portal for {}: {}", name, e);
            }
        }
    }

    fn cleanup_stale_sticky_sessions(&self, state: &ProxierState) {
        for name in state.service_map.keys() {
            self.load_balancer.cleanup_stale_sticky_sessions(name);
        }
    }

    /// Stop every proxy and end [`Proxier::sync_loop`]. Portal rules stay
    /// in place; see [`crate::portal::cleanup_leftovers`].
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        self.cleanup_stale_sticky_sessions(&state);
        let instances: Vec<(ServicePortName, ServiceInfo)> = state
            .service_map
            .iter()
            .map(|(name, info)| (name.clone(), info.clone()))
            .collect();
        for (name, info) in instances {
            if let Err(e) = self.stop_proxy(&mut state, &name, &info) {
                warn!("Failed to stop proxy for {}: {}", name, e);
            }
        }
        self.stop_tx.send_replace(true);
        info!("Userspace proxy shut down");
    }

    // ─── Service notifications ──────────────────────────────────────────

    pub fn on_service_add(&self, service: &Service) {
        self.service_change(None, Some(service), "OnServiceAdd");
    }

    pub fn on_service_update(&self, old: &Service, service: &Service) {
        self.service_change(Some(old), Some(service), "OnServiceUpdate");
    }

    pub fn on_service_delete(&self, service: &Service) {
        self.service_change(Some(service), None, "OnServiceDelete");
    }

    pub fn on_service_synced(&self) {
        info!("Userspace OnServiceSynced");
        self.mark_synced(&self.services_synced, &self.endpoints_synced);
        self.runner.run();
    }

    fn service_change(&self, previous: Option<&Service>, current: Option<&Service>, detail: &str) {
        if let Some(name) = current.or(previous).map(Service::namespaced_name) {
            debug!("Record service change {} for {}", detail, name);
        }
        if self.changes.record(previous, current) && self.is_initialized() {
            self.runner.run();
        }
    }

    // ─── Endpoint notifications ─────────────────────────────────────────

    pub fn on_endpoints_add(&self, endpoints: &Endpoint) {
        self.load_balancer.on_endpoints_add(endpoints);
    }

    pub fn on_endpoints_update(&self, old: &Endpoint, endpoints: &Endpoint) {
        self.load_balancer.on_endpoints_update(old, endpoints);
    }

    pub fn on_endpoints_delete(&self, endpoints: &Endpoint) {
        self.load_balancer.on_endpoints_delete(endpoints);
    }

    pub fn on_endpoints_synced(&self) {
        info!("Userspace OnEndpointsSynced");
        self.load_balancer.on_endpoints_synced();
        self.mark_synced(&self.endpoints_synced, &self.services_synced);
        self.runner.run();
    }

    /// SeqCst on both flags: when the two synced callbacks race, at least
    /// one of them must observe the other's store.
    fn mark_synced(&self, own: &AtomicBool, other: &AtomicBool) {
        own.store(true, Ordering::SeqCst);
        if other.load(Ordering::SeqCst) {
            self.initialized.store(true, Ordering::SeqCst);
        }
    }

    // ─── Introspection ──────────────────────────────────────────────────

    /// Snapshot of the live instance for `name`.
    pub async fn service_info(&self, name: &ServicePortName) -> Option<ServiceInfo> {
        self.state.lock().await.service_map.get(name).cloned()
    }

    /// Names of all live instances, sorted.
    pub async fn service_names(&self) -> Vec<ServicePortName> {
        let mut names: Vec<ServicePortName> =
            self.state.lock().await.service_map.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn claims(&self) -> &Arc<PortClaimRegistry> {
        self.portals.claims()
    }

    pub fn chains(&self) -> &ChainNames {
        self.portals.chains()
    }

    /// Service diffs waiting for the next pass.
    pub fn pending_changes(&self) -> usize {
        self.changes.len()
    }
}
