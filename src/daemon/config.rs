// Daemon configuration from HYDRA_* environment variables

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::ipam::parse_ipv4_cidr;
use crate::utils::constants::{
    DEFAULT_API_SOCKET, DEFAULT_DATA_DIR, DEFAULT_DESKTOP_DOCKER_HOST, DEFAULT_PRIVILEGED_SUBNET,
    DEFAULT_RESOLV_CONF, DEFAULT_SOCKET_DIR,
};

/// Where the control API listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl ListenAddr {
    pub fn parse(value: &str) -> Result<Self, String> {
        if let Some(path) = value.strip_prefix("unix:") {
            let path = path.trim_start_matches("//");
            if path.is_empty() {
                return Err("unix listen address needs a path".to_string());
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        if value.starts_with('/') {
            return Ok(ListenAddr::Unix(PathBuf::from(value)));
        }
        value
            .parse::<SocketAddr>()
            .map(ListenAddr::Tcp)
            .map_err(|_| format!("invalid listen address {:?}: expected unix:/path or host:port", value))
    }
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
            ListenAddr::Tcp(addr) => write!(f, "{}", addr),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgerConfig {
    pub listen: ListenAddr,
    pub socket_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Runtime managing the shared desktop container
    pub desktop_docker_host: String,
    pub dns_enabled: bool,
    pub dns_port: u16,
    pub resolv_conf: PathBuf,
    /// Prepend the tenant gateway to the desktop's resolv.conf after bridging
    pub desktop_resolver_entry: bool,
    pub privileged_mode: bool,
    pub privileged_subnet: String,
    pub dockerd_timeout: Duration,
    pub stop_timeout: Duration,
    pub readiness_attempts: u32,
    pub readiness_base_delay: Duration,
    /// How often instances whose daemon died are torn down
    pub reap_interval: Duration,
}

impl Default for BridgerConfig {
    fn default() -> Self {
        Self {
            listen: ListenAddr::Unix(PathBuf::from(DEFAULT_API_SOCKET)),
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            desktop_docker_host: DEFAULT_DESKTOP_DOCKER_HOST.to_string(),
            dns_enabled: true,
            dns_port: 53,
            resolv_conf: PathBuf::from(DEFAULT_RESOLV_CONF),
            desktop_resolver_entry: true,
            privileged_mode: false,
            privileged_subnet: DEFAULT_PRIVILEGED_SUBNET.to_string(),
            dockerd_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(30),
            readiness_attempts: 10,
            readiness_base_delay: Duration::from_millis(500),
            reap_interval: Duration::from_secs(300),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("{}: expected a boolean, got {:?}", key, other)),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("{}: expected a number, got {:?}", key, value))
}

impl BridgerConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("HYDRA_LISTEN") {
            cfg.listen = ListenAddr::parse(&v)?;
        }
        if let Some(v) = lookup("HYDRA_SOCKET_DIR") {
            cfg.socket_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HYDRA_DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HYDRA_DESKTOP_DOCKER_HOST") {
            cfg.desktop_docker_host = v;
        }
        if let Some(v) = lookup("HYDRA_DNS_ENABLED") {
            cfg.dns_enabled = parse_bool("HYDRA_DNS_ENABLED", &v)?;
        }
        if let Some(v) = lookup("HYDRA_DNS_PORT") {
            cfg.dns_port = parse_num("HYDRA_DNS_PORT", &v)?;
        }
        if let Some(v) = lookup("HYDRA_RESOLV_CONF") {
            cfg.resolv_conf = PathBuf::from(v);
        }
        if let Some(v) = lookup("HYDRA_DESKTOP_RESOLVER") {
            cfg.desktop_resolver_entry = parse_bool("HYDRA_DESKTOP_RESOLVER", &v)?;
        }
        if let Some(v) = lookup("HYDRA_PRIVILEGED_MODE") {
            cfg.privileged_mode = parse_bool("HYDRA_PRIVILEGED_MODE", &v)?;
        }
        if let Some(v) = lookup("HYDRA_PRIVILEGED_SUBNET") {
            cfg.privileged_subnet = v;
        }
        if let Some(v) = lookup("HYDRA_DOCKERD_TIMEOUT_SECS") {
            cfg.dockerd_timeout = Duration::from_secs(parse_num("HYDRA_DOCKERD_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("HYDRA_STOP_TIMEOUT_SECS") {
            cfg.stop_timeout = Duration::from_secs(parse_num("HYDRA_STOP_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("HYDRA_READINESS_ATTEMPTS") {
            cfg.readiness_attempts = parse_num("HYDRA_READINESS_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("HYDRA_READINESS_BASE_DELAY_MS") {
            cfg.readiness_base_delay =
                Duration::from_millis(parse_num("HYDRA_READINESS_BASE_DELAY_MS", &v)?);
        }
        if let Some(v) = lookup("HYDRA_REAP_INTERVAL_SECS") {
            cfg.reap_interval = Duration::from_secs(parse_num("HYDRA_REAP_INTERVAL_SECS", &v)?);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.dns_enabled && self.dns_port == 0 {
            return Err("HYDRA_DNS_PORT must be non-zero when DNS is enabled".to_string());
        }
        if self.readiness_attempts == 0 {
            return Err("HYDRA_READINESS_ATTEMPTS must be at least 1".to_string());
        }
        if self.dockerd_timeout.is_zero() {
            return Err("HYDRA_DOCKERD_TIMEOUT_SECS must be at least 1".to_string());
        }
        if self.reap_interval.is_zero() {
            return Err("HYDRA_REAP_INTERVAL_SECS must be at least 1".to_string());
        }
        if self.desktop_docker_host.trim().is_empty() {
            return Err("HYDRA_DESKTOP_DOCKER_HOST must not be empty".to_string());
        }
        parse_ipv4_cidr(&self.privileged_subnet)
            .map_err(|e| format!("HYDRA_PRIVILEGED_SUBNET: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<BridgerConfig, String> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BridgerConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = from(&[]).unwrap();
        assert_eq!(cfg.listen, ListenAddr::Unix(PathBuf::from("/var/run/hydra/hydra.sock")));
        assert!(cfg.dns_enabled);
        assert!(!cfg.privileged_mode);
        assert_eq!(cfg.readiness_attempts, 10);
        assert_eq!(cfg.readiness_base_delay, Duration::from_millis(500));
        assert_eq!(cfg.reap_interval, Duration::from_secs(300));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = from(&[
            ("HYDRA_LISTEN", "127.0.0.1:8089"),
            ("HYDRA_DNS_ENABLED", "false"),
            ("HYDRA_PRIVILEGED_MODE", "1"),
            ("HYDRA_PRIVILEGED_SUBNET", "172.30.0.0/16"),
            ("HYDRA_DOCKERD_TIMEOUT_SECS", "45"),
            ("HYDRA_REAP_INTERVAL_SECS", "60"),
        ])
        .unwrap();
        assert_eq!(cfg.listen, ListenAddr::Tcp("127.0.0.1:8089".parse().unwrap()));
        assert!(!cfg.dns_enabled);
        assert!(cfg.privileged_mode);
        assert_eq!(cfg.dockerd_timeout, Duration::from_secs(45));
        assert_eq!(cfg.reap_interval, Duration::from_secs(60));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(from(&[("HYDRA_DNS_ENABLED", "maybe")]).is_err());
        assert!(from(&[("HYDRA_DNS_PORT", "70000")]).is_err());
        assert!(from(&[("HYDRA_PRIVILEGED_SUBNET", "172.17.0.0/31")]).is_err());
        assert!(from(&[("HYDRA_READINESS_ATTEMPTS", "0")]).is_err());
        assert!(from(&[("HYDRA_REAP_INTERVAL_SECS", "0")]).is_err());
        assert!(from(&[("HYDRA_LISTEN", "somewhere")]).is_err());
    }

    #[test]
    fn listen_forms() {
        assert_eq!(
            ListenAddr::parse("unix:///run/h.sock").unwrap(),
            ListenAddr::Unix(PathBuf::from("/run/h.sock"))
        );
        assert_eq!(
            ListenAddr::parse("/run/h.sock").unwrap().to_string(),
            "unix:/run/h.sock"
        );
    }
}
