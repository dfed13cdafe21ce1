//! Userspace service proxy constants.

// ─── iptables chains ──────────────────────────────────────────────────────

/// nat chain holding portal rules for traffic originating in containers.
pub const CONTAINER_PORTAL_CHAIN: &str = "KUBE-PORTALS-CONTAINER";

/// nat chain holding portal rules for traffic originating on the host.
pub const HOST_PORTAL_CHAIN: &str = "KUBE-PORTALS-HOST";

/// nat chain holding node-port rules for traffic originating in containers.
pub const CONTAINER_NODE_PORT_CHAIN: &str = "KUBE-NODEPORT-CONTAINER";

/// nat chain holding node-port rules for traffic originating on the host.
pub const HOST_NODE_PORT_CHAIN: &str = "KUBE-NODEPORT-HOST";

/// filter chain accepting new node-port connections from non-local sources.
pub const NON_LOCAL_NODE_PORT_CHAIN: &str = "KUBE-NODEPORT-NON-LOCAL";

// ─── Sync runner ──────────────────────────────────────────────────────────

/// Upper bound between two reconciliation passes.
pub const DEFAULT_SYNC_PERIOD_SECS: u64 = 30;

/// Lower bound between two reconciliation passes (after the burst is spent).
pub const DEFAULT_MIN_SYNC_PERIOD_SECS: u64 = 1;

/// Reconciliation passes allowed back-to-back before rate limiting kicks in.
pub const SYNC_BURST: u32 = 2;

// ─── Sockets ──────────────────────────────────────────────────────────────

/// Idle timeout for proxied UDP client flows.
pub const DEFAULT_UDP_IDLE_TIMEOUT_MS: u64 = 250;

/// Open-file limit requested at startup (one fd per proxied connection end).
pub const OPEN_FILE_LIMIT: u64 = 64_000;

/// Backoff schedule (ms) for connecting to a backend endpoint.
pub const ENDPOINT_DIAL_TIMEOUTS_MS: &[u64] = &[250, 500, 1000, 2000];

/// Receive buffer for one UDP datagram.
pub const UDP_BUFFER_SIZE: usize = 4096;

/// Sticky-session lifetime used when ClientIP affinity has no explicit timeout.
pub const DEFAULT_CLIENT_IP_TIMEOUT_SECS: u32 = 10_800;
