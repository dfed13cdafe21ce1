use anyhow::Result;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Source of the host's local addresses, used to decide which portals
/// and node ports need an OS-level port claim.
pub trait LocalAddrSource: Send + Sync {
    fn local_addrs(&self) -> Result<HashSet<IpAddr>>;
}

/// Reads interface addresses with `getifaddrs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLocalAddrs;

impl LocalAddrSource for SystemLocalAddrs {
    fn local_addrs(&self) -> Result<HashSet<IpAddr>> {
        let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
        // SAFETY: getifaddrs initializes `ifap` on success; released below.
        if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let mut addrs = HashSet::new();
        let mut cur = ifap;
        while !cur.is_null() {
            // SAFETY: `cur` walks the list returned by getifaddrs.
            let ifa = unsafe { &*cur };
            if !ifa.ifa_addr.is_null() {
                // SAFETY: sa_family selects the concrete sockaddr layout.
                match unsafe { (*ifa.ifa_addr).sa_family } as i32 {
                    libc::AF_INET => {
                        let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
                        addrs.insert(IpAddr::V4(Ipv4Addr::from(u32::from_be(
                            sin.sin_addr.s_addr,
                        ))));
                    }
                    libc::AF_INET6 => {
                        let sin6 = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in6) };
                        let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                        // link-local needs a scope id to bind, so it can't hold a claim
                        if !is_v6_link_local(&ip) {
                            addrs.insert(IpAddr::V6(ip));
                        }
                    }
                    _ => {}
                }
            }
            cur = ifa.ifa_next;
        }
        // SAFETY: `ifap` came from a successful getifaddrs call.
        unsafe { libc::freeifaddrs(ifap) };
        Ok(addrs)
    }
}

/// Pick the address host-originated portal traffic is DNATed to when the
/// proxy listens on the wildcard address: a global-ish address of the same
/// family as the listen address.
pub fn choose_host_ip(addrs: &HashSet<IpAddr>, ipv6: bool) -> Option<IpAddr> {
    let mut candidates: Vec<IpAddr> = addrs
        .iter()
        .copied()
        .filter(|ip| ip.is_ipv6() == ipv6)
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified() && !ip.is_multicast())
        .filter(|ip| match ip {
            IpAddr::V4(v4) => !v4.is_link_local(),
            IpAddr::V6(v6) => !is_v6_link_local(v6),
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

fn is_v6_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Raise the open-file limit; every proxied connection holds two fds.
/// Never lowers a limit that is already high enough.
pub fn raise_open_file_limit(limit: u64) -> std::io::Result<()> {
    let limit = limit as libc::rlim_t;
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the stack value.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    if rlim.rlim_cur >= limit {
        return Ok(());
    }
    rlim.rlim_cur = limit;
    rlim.rlim_max = rlim.rlim_max.max(limit);
    // SAFETY: rlim is a fully initialized rlimit that outlives the call.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ips: &[&str]) -> HashSet<IpAddr> {
        ips.iter().map(|ip| ip.parse().unwrap()).collect()
    }

    #[test]
    fn test_choose_host_ip_skips_loopback_and_link_local() {
        let addrs = set(&["127.0.0.1", "169.254.1.1", "192.168.1.10", "::1", "fe80::1", "fd00::1"]);
        assert_eq!(choose_host_ip(&addrs, false), Some("192.168.1.10".parse().unwrap()));
        assert_eq!(choose_host_ip(&addrs, true), Some("fd00::1".parse().unwrap()));
        assert_eq!(choose_host_ip(&set(&["127.0.0.1"]), false), None);
    }

    #[test]
    fn test_system_local_addrs_include_loopback() {
        let addrs = SystemLocalAddrs.local_addrs().unwrap();
        assert!(addrs.iter().any(|ip| ip.is_loopback()));
    }
}
