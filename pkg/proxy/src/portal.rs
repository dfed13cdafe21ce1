use pkg_constants::proxy::{
    CONTAINER_NODE_PORT_CHAIN, CONTAINER_PORTAL_CHAIN, HOST_NODE_PORT_CHAIN, HOST_PORTAL_CHAIN,
    NON_LOCAL_NODE_PORT_CHAIN,
};
use pkg_types::endpoint::join_host_port;
use pkg_types::names::ServicePortName;
use pkg_types::service::Protocol;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::{Aggregate, ProxyError};
use crate::iptables::{Chain, Iptables, IptablesError, RulePosition, Table};
use crate::port_claim::PortClaimRegistry;
use crate::service_info::{Portal, ServiceInfo};

const CLUSTER_IP_JUMP_COMMENT: &str = "handle ClusterIPs; NOTE: this must be before the NodePort rules";
const NODE_PORT_JUMP_COMMENT: &str =
    "handle service NodePorts; NOTE: this must be the last rule in the chain";
const NON_LOCAL_JUMP_COMMENT: &str = "Ensure that non-local NodePort traffic can flow";

/// Names of the custom chains the proxy owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNames {
    pub container_portal: Chain,
    pub host_portal: Chain,
    pub container_node_port: Chain,
    pub host_node_port: Chain,
    pub non_local_node_port: Chain,
}

impl Default for ChainNames {
    fn default() -> Self {
        Self {
            container_portal: Chain::new(CONTAINER_PORTAL_CHAIN),
            host_portal: Chain::new(HOST_PORTAL_CHAIN),
            container_node_port: Chain::new(CONTAINER_NODE_PORT_CHAIN),
            host_node_port: Chain::new(HOST_NODE_PORT_CHAIN),
            non_local_node_port: Chain::new(NON_LOCAL_NODE_PORT_CHAIN),
        }
    }
}

impl ChainNames {
    /// Every owned chain with its table, in creation order.
    pub fn all(&self) -> [(Table, &Chain); 5] {
        [
            (Table::Nat, &self.container_portal),
            (Table::Nat, &self.host_portal),
            (Table::Nat, &self.container_node_port),
            (Table::Nat, &self.host_node_port),
            (Table::Filter, &self.non_local_node_port),
        ]
    }
}

/// A rule in a builtin chain that jumps into one of the owned chains.
struct JumpRule<'a> {
    table: Table,
    from: &'static str,
    position: RulePosition,
    to: &'a Chain,
    args: Vec<String>,
}

/// Jump rules in install order. Cluster-IP jumps are prepended and
/// node-port jumps appended: the node-port match is by address type and
/// would shadow the more specific portal rules if it came first.
fn jump_rules(chains: &ChainNames) -> Vec<JumpRule<'_>> {
    let comment = |text: &str| strings(&["-m", "comment", "--comment", text]);
    let dst_local = |text: &str| {
        strings(&["-m", "addrtype", "--dst-type", "LOCAL", "-m", "comment", "--comment", text])
    };
    vec![
        jump(
            Table::Nat,
            Chain::PREROUTING,
            RulePosition::Prepend,
            &chains.container_portal,
            comment(CLUSTER_IP_JUMP_COMMENT),
        ),
        jump(
            Table::Nat,
            Chain::OUTPUT,
            RulePosition::Prepend,
            &chains.host_portal,
            comment(CLUSTER_IP_JUMP_COMMENT),
        ),
        jump(
            Table::Nat,
            Chain::PREROUTING,
            RulePosition::Append,
            &chains.container_node_port,
            dst_local(NODE_PORT_JUMP_COMMENT),
        ),
        jump(
            Table::Nat,
            Chain::OUTPUT,
            RulePosition::Append,
            &chains.host_node_port,
            dst_local(NODE_PORT_JUMP_COMMENT),
        ),
        jump(
            Table::Filter,
            Chain::INPUT,
            RulePosition::Prepend,
            &chains.non_local_node_port,
            comment(NON_LOCAL_JUMP_COMMENT),
        ),
    ]
}

fn jump<'a>(
    table: Table,
    from: &'static str,
    position: RulePosition,
    to: &'a Chain,
    mut args: Vec<String>,
) -> JumpRule<'a> {
    args.extend(strings(&["-j", to.as_str()]));
    JumpRule {
        table,
        from,
        position,
        to,
        args,
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn to_cidr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(_) => format!("{}/32", ip),
        IpAddr::V6(_) => format!("{}/128", ip),
    }
}

/// Destination match of one portal rule.
#[derive(Debug, Clone, Copy)]
struct RuleMatch {
    dest_ip: Option<IpAddr>,
    dest_port: u16,
    /// Skip packets bridged in from a physical interface.
    not_physdev_in: bool,
    dst_local: bool,
}

impl RuleMatch {
    fn port(dest_port: u16) -> Self {
        Self {
            dest_ip: None,
            dest_port,
            not_physdev_in: false,
            dst_local: false,
        }
    }

    fn portal(portal: &Portal) -> Self {
        Self {
            dest_ip: Some(portal.ip),
            ..Self::port(portal.port)
        }
    }
}

/// The service-port facts shared by every rule of one proxied instance.
#[derive(Debug, Clone, Copy)]
struct RuleTarget<'a> {
    service: &'a ServicePortName,
    protocol: Protocol,
    proxy_port: u16,
}

/// One concrete rule in an owned chain.
#[derive(Debug)]
struct PortalRule<'a> {
    table: Table,
    chain: &'a Chain,
    args: Vec<String>,
    kind: &'static str,
}

/// Arguments shared by container and host rules. The list mirrors what
/// `iptables-save` prints (including the /32) so `-C` checks match.
fn common_args(m: &RuleMatch, t: &RuleTarget) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        t.service.to_string(),
        "-p".to_string(),
        t.protocol.as_lower().to_string(),
        "-m".to_string(),
        t.protocol.as_lower().to_string(),
        "--dport".to_string(),
        m.dest_port.to_string(),
    ];
    if let Some(ip) = m.dest_ip {
        args.extend(["-d".to_string(), to_cidr(ip)]);
    }
    if m.not_physdev_in {
        args.extend(strings(&["-m", "physdev", "!", "--physdev-is-in"]));
    }
    if m.dst_local {
        args.extend(strings(&["-m", "addrtype", "--dst-type", "LOCAL"]));
    }
    args
}

/// Translates service addressing into portal rules in the owned chains and
/// manages those chains.
pub struct PortalRuleManager {
    iptables: Arc<dyn Iptables>,
    chains: ChainNames,
    listen_ip: IpAddr,
    /// DNAT target for host-originated traffic when `listen_ip` is the
    /// wildcard address.
    host_ip: IpAddr,
    claims: Arc<PortClaimRegistry>,
}

impl PortalRuleManager {
    pub fn new(
        iptables: Arc<dyn Iptables>,
        chains: ChainNames,
        listen_ip: IpAddr,
        host_ip: IpAddr,
        claims: Arc<PortClaimRegistry>,
    ) -> Self {
        Self {
            iptables,
            chains,
            listen_ip,
            host_ip,
            claims,
        }
    }

    pub fn chains(&self) -> &ChainNames {
        &self.chains
    }

    pub fn claims(&self) -> &Arc<PortClaimRegistry> {
        &self.claims
    }

    /// Ensure the owned chains and their jump rules exist. Safe to call
    /// on every pass.
    pub async fn init(&self) -> Result<(), IptablesError> {
        for jump in jump_rules(&self.chains) {
            self.iptables.ensure_chain(jump.table, jump.to).await?;
            self.iptables
                .ensure_rule(jump.position, jump.table, &Chain::new(jump.from), &jump.args)
                .await?;
        }
        Ok(())
    }

    /// Drop every rule in the owned chains.
    pub async fn flush(&self) -> Result<(), ProxyError> {
        let mut el = Aggregate::new();
        for (table, chain) in self.chains.all() {
            if let Err(e) = self.iptables.flush_chain(table, chain).await {
                el.push(e);
            }
        }
        if !el.is_empty() {
            error!("Some errors flushing old iptables portals: {}", el);
        }
        el.into_result()
    }

    // ─── Rule builders ──────────────────────────────────────────────────

    /// Container traffic is REDIRECTed when listening on the wildcard
    /// address so replies leave through the interface they came in on;
    /// otherwise it is DNATed to the listen address.
    fn container_args(&self, m: &RuleMatch, t: &RuleTarget) -> Vec<String> {
        let mut args = common_args(m, t);
        if self.listen_ip.is_unspecified() {
            args.extend(strings(&["-j", "REDIRECT", "--to-ports"]));
            args.push(t.proxy_port.to_string());
        } else {
            args.extend(strings(&["-j", "DNAT", "--to-destination"]));
            args.push(join_host_port(&self.listen_ip.to_string(), t.proxy_port));
        }
        args
    }

    /// Host traffic is always DNATed; REDIRECT of locally generated packets
    /// lands on loopback and the replies come from the wrong address.
    fn host_args(&self, m: &RuleMatch, t: &RuleTarget) -> Vec<String> {
        let mut args = common_args(m, t);
        let target = if self.listen_ip.is_unspecified() {
            self.host_ip
        } else {
            self.listen_ip
        };
        args.extend(strings(&["-j", "DNAT", "--to-destination"]));
        args.push(join_host_port(&target.to_string(), t.proxy_port));
        args
    }

    fn non_local_args(&self, t: &RuleTarget) -> Vec<String> {
        let mut args = common_args(&RuleMatch::port(t.proxy_port), t);
        args.extend(strings(&["-m", "state", "--state", "NEW", "-j", "ACCEPT"]));
        args
    }

    fn portal_rules(&self, portal: &Portal, t: &RuleTarget) -> Vec<PortalRule<'_>> {
        let nat = |chain, args, kind| PortalRule {
            table: Table::Nat,
            chain,
            args,
            kind,
        };
        let mut m = RuleMatch::portal(portal);
        m.not_physdev_in = portal.is_external;
        let mut rules = vec![nat(
            &self.chains.container_portal,
            self.container_args(&m, t),
            "from-containers portal",
        )];

        if portal.is_external {
            let local = RuleMatch {
                dst_local: true,
                ..RuleMatch::portal(portal)
            };
            rules.push(nat(
                &self.chains.container_portal,
                self.container_args(&local, t),
                "from-containers portal for local traffic",
            ));
            rules.push(nat(
                &self.chains.host_portal,
                self.host_args(&local, t),
                "from-host portal for dst-local traffic",
            ));
        } else {
            rules.push(nat(
                &self.chains.host_portal,
                self.host_args(&RuleMatch::portal(portal), t),
                "from-host portal",
            ));
        }
        rules
    }

    fn node_port_rules(&self, node_port: u16, t: &RuleTarget) -> Vec<PortalRule<'_>> {
        let m = RuleMatch::port(node_port);
        vec![
            PortalRule {
                table: Table::Nat,
                chain: &self.chains.container_node_port,
                args: self.container_args(&m, t),
                kind: "from-containers public port",
            },
            PortalRule {
                table: Table::Nat,
                chain: &self.chains.host_node_port,
                args: self.host_args(&m, t),
                kind: "from-host public port",
            },
            PortalRule {
                table: Table::Filter,
                chain: &self.chains.non_local_node_port,
                args: self.non_local_args(t),
                kind: "from-non-local public port",
            },
        ]
    }

    // ─── Open / close ───────────────────────────────────────────────────

    /// Install the cluster portal, external-IP portals, ingress portals and
    /// node-port rules of `info`, in that order. Stops at the first error.
    pub async fn open_portal(
        &self,
        service: &ServicePortName,
        info: &ServiceInfo,
        local_addrs: &HashSet<IpAddr>,
    ) -> Result<(), ProxyError> {
        let t = RuleTarget {
            service,
            protocol: info.protocol,
            proxy_port: info.proxy_port,
        };
        for portal in info.portals() {
            self.open_one_portal(&portal, &t, local_addrs).await?;
        }
        if let Some(node_port) = info.node_port {
            self.open_node_port(node_port, &t, local_addrs).await?;
        }
        Ok(())
    }

    async fn open_one_portal(
        &self,
        portal: &Portal,
        t: &RuleTarget<'_>,
        local_addrs: &HashSet<IpAddr>,
    ) -> Result<(), ProxyError> {
        if local_addrs.contains(&portal.ip) {
            self.claims
                .claim(portal.ip, portal.port, t.protocol, t.service)
                .await?;
        }
        let address = join_host_port(&portal.ip.to_string(), portal.port);
        for rule in self.portal_rules(portal, t) {
            self.ensure(&rule, t, &address).await?;
        }
        Ok(())
    }

    /// Node ports listen on every local address, so each one is claimed.
    async fn open_node_port(
        &self,
        node_port: u16,
        t: &RuleTarget<'_>,
        local_addrs: &HashSet<IpAddr>,
    ) -> Result<(), ProxyError> {
        let mut addrs: Vec<IpAddr> = local_addrs.iter().copied().collect();
        addrs.sort();
        for ip in addrs {
            self.claims.claim(ip, node_port, t.protocol, t.service).await?;
        }
        let address = format!("*:{}", node_port);
        for rule in self.node_port_rules(node_port, t) {
            self.ensure(&rule, t, &address).await?;
        }
        Ok(())
    }

    async fn ensure(
        &self,
        rule: &PortalRule<'_>,
        t: &RuleTarget<'_>,
        address: &str,
    ) -> Result<(), ProxyError> {
        match self
            .iptables
            .ensure_rule(RulePosition::Append, rule.table, rule.chain, &rule.args)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(
                    "Opened iptables {} for {} ({} {})",
                    rule.kind, t.service, t.protocol, address
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    chain = %rule.chain,
                    args = ?rule.args,
                    "Failed to install iptables {} rule for {}: {}",
                    rule.kind,
                    t.service,
                    e
                );
                Err(e.into())
            }
        }
    }

    /// Remove everything `open_portal` installed. Keeps going past
    /// individual failures and returns them together.
    pub async fn close_portal(
        &self,
        service: &ServicePortName,
        info: &ServiceInfo,
        local_addrs: &HashSet<IpAddr>,
    ) -> Result<(), ProxyError> {
        let t = RuleTarget {
            service,
            protocol: info.protocol,
            proxy_port: info.proxy_port,
        };
        let mut el = Aggregate::new();
        for portal in info.portals() {
            el.extend(self.close_one_portal(&portal, &t, local_addrs).await);
        }
        if let Some(node_port) = info.node_port {
            el.extend(self.close_node_port(node_port, &t).await);
        }
        if el.is_empty() {
            debug!("Closed iptables portals for {}", service);
        } else {
            error!("Some errors closing iptables portals for {}: {}", service, el);
        }
        el.into_result()
    }

    async fn close_one_portal(
        &self,
        portal: &Portal,
        t: &RuleTarget<'_>,
        local_addrs: &HashSet<IpAddr>,
    ) -> Aggregate {
        let mut el = Aggregate::new();
        if local_addrs.contains(&portal.ip)
            && let Err(e) = self
                .claims
                .release(portal.ip, portal.port, t.protocol, t.service)
                .await
        {
            el.push(e);
        }
        for rule in self.portal_rules(portal, t) {
            self.delete(&rule, t, &mut el).await;
        }
        el
    }

    async fn close_node_port(&self, node_port: u16, t: &RuleTarget<'_>) -> Aggregate {
        let mut el = Aggregate::new();
        for rule in self.node_port_rules(node_port, t) {
            self.delete(&rule, t, &mut el).await;
        }
        let released = self
            .claims
            .release_owned(node_port, t.protocol, t.service)
            .await;
        debug!("Released {} node port claims for {}", released, t.service);
        el
    }

    async fn delete(&self, rule: &PortalRule<'_>, t: &RuleTarget<'_>, el: &mut Aggregate) {
        if let Err(e) = self
            .iptables
            .delete_rule(rule.table, rule.chain, &rule.args)
            .await
        {
            error!(
                chain = %rule.chain,
                "Failed to delete iptables {} rule for {}: {}",
                rule.kind,
                t.service,
                e
            );
            el.push(e);
        }
    }
}

/// Remove every jump rule and owned chain, whether or not this process
/// installed them. Missing rules and chains are fine.
///
/// Returns true if anything went wrong.
pub async fn cleanup_leftovers(iptables: &dyn Iptables, chains: &ChainNames) -> bool {
    let mut encountered_error = false;
    for jump in jump_rules(chains) {
        if let Err(e) = iptables
            .delete_rule(jump.table, &Chain::new(jump.from), &jump.args)
            .await
            && !e.is_not_found()
        {
            error!("Error removing userspace rule: {}", e);
            encountered_error = true;
        }
    }

    for (table, chain) in chains.all() {
        // A chain that failed to flush can't be deleted either.
        match iptables.flush_chain(table, chain).await {
            Err(e) if !e.is_not_found() => {
                error!("Error flushing userspace chain {}: {}", chain, e);
                encountered_error = true;
            }
            Err(_) => {}
            Ok(()) => {
                if let Err(e) = iptables.delete_chain(table, chain).await
                    && !e.is_not_found()
                {
                    error!("Error deleting userspace chain {}: {}", chain, e);
                    encountered_error = true;
                }
            }
        }
    }
    if !encountered_error {
        info!("Removed leftover userspace proxy rules");
    }
    encountered_error
}
