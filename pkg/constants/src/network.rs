//! Network-related constants.

/// Default address the proxy sockets bind to (all interfaces).
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Service cluster IP value marking a headless service.
pub const CLUSTER_IP_NONE: &str = "None";
