use anyhow::{Result, bail};
use async_trait::async_trait;
use pkg_constants::paths::CONNTRACK_BIN;
use pkg_types::service::Protocol;
use tracing::debug;

/// Flushes connection-tracking entries. UDP has no teardown signal, so
/// stale flows would keep routing to the old destination without this.
#[async_trait]
pub trait Conntrack: Send + Sync {
    async fn clear_entries_for_ip(&self, ip: &str, protocol: Protocol) -> Result<()>;
}

/// `Conntrack` backed by the `conntrack` binary.
pub struct ConntrackCommand {
    bin: String,
}

impl ConntrackCommand {
    pub fn new() -> Self {
        Self {
            bin: CONNTRACK_BIN.to_string(),
        }
    }
}

impl Default for ConntrackCommand {
    fn default() -> Self {
        Self::new()
    }
}

fn clear_args(ip: &str, protocol: Protocol) -> Vec<String> {
    let mut args = vec![
        "-D".to_string(),
        "--orig-dst".to_string(),
        ip.to_string(),
        "-p".to_string(),
        protocol.as_lower().to_string(),
    ];
    if ip.contains(':') {
        args.push("-f".to_string());
        args.push("ipv6".to_string());
    }
    args
}

#[async_trait]
impl Conntrack for ConntrackCommand {
    async fn clear_entries_for_ip(&self, ip: &str, protocol: Protocol) -> Result<()> {
        let args = clear_args(ip, protocol);
        let output = tokio::process::Command::new(&self.bin)
            .args(&args)
            .output()
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        // conntrack exits non-zero when nothing matched
        if !output.status.success() && !stderr.contains("0 flow entries have been deleted") {
            bail!("conntrack {} failed: {}", args.join(" "), stderr.trim());
        }
        debug!("Cleared conntrack entries for {} ({})", ip, protocol);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_args() {
        assert_eq!(
            clear_args("10.0.0.10", Protocol::Udp),
            vec!["-D", "--orig-dst", "10.0.0.10", "-p", "udp"]
        );
        assert_eq!(
            clear_args("fd00::a", Protocol::Udp),
            vec!["-D", "--orig-dst", "fd00::a", "-p", "udp", "-f", "ipv6"]
        );
    }
}
