//! Userspace service proxy: proxy sockets plus the iptables portal rules
//! that steer service traffic into them.

pub mod change_tracker;
pub mod conntrack;
pub mod error;
pub mod host;
pub mod iptables;
mod lifecycle;
pub mod load_balancer;
pub mod port_allocator;
pub mod port_claim;
pub mod portal;
pub mod proxier;
pub mod runner;
pub mod service_info;
pub mod socket;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Aggregate, ProxyError};
pub use load_balancer::{LoadBalancer, RoundRobinBalancer};
pub use portal::{ChainNames, cleanup_leftovers};
pub use proxier::{Proxier, ProxierDeps, ProxierOptions};
