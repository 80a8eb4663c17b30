use crate::error::ConfigError;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn unspecified(self) -> IpAddr {
        match self {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port shared by the UDP and TCP listeners (0 = pick an ephemeral port)
    pub port: u16,

    /// Address family used when no explicit bind IP is given
    pub address_family: AddressFamily,

    /// Explicit IP to bind to (None = unspecified address of the family)
    pub bind_ip: Option<IpAddr>,

    /// How long `stop()` waits for TCP sessions before aborting them
    pub drain_timeout: Duration,

    /// Max number of concurrent TCP sessions (0 = unlimited)
    pub max_tcp_sessions: usize,

    /// Close TCP sessions that stay silent this long (None = never)
    pub tcp_idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5353,
            address_family: AddressFamily::Ipv4,
            bind_ip: None,
            drain_timeout: Duration::from_secs(5),
            max_tcp_sessions: 1024,
            tcp_idle_timeout: None,
        }
    }
}

/// On-disk TOML representation; every field is optional and overrides the default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    port: Option<u16>,
    address_family: Option<AddressFamily>,
    bind_ip: Option<IpAddr>,
    drain_timeout_ms: Option<u64>,
    max_tcp_sessions: Option<usize>,
    tcp_idle_timeout_ms: Option<u64>,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.address_family = match ip {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        };
        self.bind_ip = Some(ip);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Address both transports bind to
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = self
            .bind_ip
            .unwrap_or_else(|| self.address_family.unspecified());
        SocketAddr::new(ip, self.port)
    }

    /// Create a ServerConfig from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Override fields from `BEES_*` environment variables
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(port) = std::env::var("BEES_PORT") {
            self.port = port
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(port))?;
        }

        if let Ok(ipv6) = std::env::var("BEES_IPV6") {
            self.address_family = if parse_bool(&ipv6, false) {
                AddressFamily::Ipv6
            } else {
                AddressFamily::Ipv4
            };
        }

        if let Ok(bind_ip) = std::env::var("BEES_BIND_IP") {
            let ip = bind_ip
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidBindAddress(bind_ip))?;
            self = self.with_bind_ip(ip);
        }

        if let Ok(drain) = std::env::var("BEES_DRAIN_TIMEOUT_MS") {
            let ms = drain
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidTimeout(drain.clone()))?;
            self.drain_timeout = Duration::from_millis(ms);
        }

        if let Ok(max) = std::env::var("BEES_MAX_TCP_SESSIONS") {
            self.max_tcp_sessions = max
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidValue {
                    name: "BEES_MAX_TCP_SESSIONS",
                    value: max.clone(),
                })?;
        }

        if let Ok(idle) = std::env::var("BEES_TCP_IDLE_TIMEOUT_MS") {
            let ms = idle
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidTimeout(idle.clone()))?;
            self.tcp_idle_timeout = (ms > 0).then_some(Duration::from_millis(ms));
        }

        self.validate()?;
        Ok(self)
    }

    /// Load a TOML config file; missing keys keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::FileParse { reason, .. } => ConfigError::FileParse {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| ConfigError::FileParse {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })?;

        let mut config = Self::default();
        if let Some(port) = file.port {
            config.port = port;
        }
        if let Some(family) = file.address_family {
            config.address_family = family;
        }
        if let Some(ip) = file.bind_ip {
            config = config.with_bind_ip(ip);
        }
        if let Some(ms) = file.drain_timeout_ms {
            config.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = file.max_tcp_sessions {
            config.max_tcp_sessions = max;
        }
        if let Some(ms) = file.tcp_idle_timeout_ms {
            config.tcp_idle_timeout = (ms > 0).then_some(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ip) = self.bind_ip {
            let family_matches = matches!(
                (ip, self.address_family),
                (IpAddr::V4(_), AddressFamily::Ipv4) | (IpAddr::V6(_), AddressFamily::Ipv6)
            );
            if !family_matches {
                return Err(ConfigError::InvalidBindAddress(format!(
                    "{} does not match address family {:?}",
                    ip, self.address_family
                )));
            }
        }

        if self.drain_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "Drain timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => default,
    }
}
