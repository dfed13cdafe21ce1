use serde::{Deserialize, Serialize};

/// Service proxy configuration file (YAML).
///
/// Example `proxy-config.yaml`:
/// ```yaml
/// listen-ip: 0.0.0.0
/// port-range: 20000-20999
/// sync-period-secs: 30
/// min-sync-period-secs: 1
/// udp-idle-timeout-ms: 250
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxierConfigFile {
    #[serde(default, alias = "listen-ip")]
    pub listen_ip: Option<String>,
    /// Range proxy ports are allocated from; empty lets the OS pick.
    #[serde(default, alias = "port-range")]
    pub port_range: Option<String>,
    #[serde(default, alias = "sync-period-secs")]
    pub sync_period_secs: Option<u64>,
    #[serde(default, alias = "min-sync-period-secs")]
    pub min_sync_period_secs: Option<u64>,
    #[serde(default, alias = "udp-idle-timeout-ms")]
    pub udp_idle_timeout_ms: Option<u64>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
