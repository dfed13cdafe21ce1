//! Filesystem path constants.

/// Default config file path for the service proxy.
pub const DEFAULT_PROXY_CONFIG: &str = "/etc/k3rs/proxy-config.yaml";

/// iptables binary used to manage portal rules.
pub const IPTABLES_BIN: &str = "iptables";

/// conntrack binary used to flush stale UDP flows.
pub const CONNTRACK_BIN: &str = "conntrack";
