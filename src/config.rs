//! dnsproxy configuration

use crate::checkpoint::DEFAULT_RETRY_BUDGET;
use crate::demultiplexer::DemuxSettings;
use crate::handshake::HandshakeSettings;
use crate::key_exchange::{KeyExchange, DEFAULT_KEY_BITS, MAX_KEY_BITS, MIN_KEY_BITS};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Default tunnel TCP port
pub const DEFAULT_SERVER_PORT: u16 = 7373;

/// Default upstream resolver
pub const DEFAULT_DNS_PROVIDER: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

/// Which side of the tunnel this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Server,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("key_bits must be within {MIN_KEY_BITS}..={MAX_KEY_BITS}, got {0}")]
    KeyBits(usize),

    #[error("upstream_port_range {0}..{1} is empty")]
    EmptyPortRange(u16, u16),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("session_poll_timeout ({poll:?}) exceeds session_idle_timeout ({idle:?})")]
    PollExceedsIdle { poll: Duration, idle: Duration },

    #[error("client mode requires server_address")]
    MissingServerAddress,
}

/// Runtime configuration shared by client and server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Tunnel TCP port (server listens, client connects)
    pub server_port: u16,

    /// Tunnel server host name or address (client mode)
    pub server_address: Option<String>,

    /// Upstream resolver address (server mode)
    pub dns_provider_address: IpAddr,

    /// Upstream resolver port (server mode)
    pub dns_provider_port: u16,

    /// Debug-level logging
    pub verbose: bool,

    /// Local DNS listener (client mode)
    pub local_dns_bind: SocketAddr,

    /// Private exponent size for the Diffie-Hellman exchange
    pub key_bits: usize,

    /// Bound on every handshake read/write and on the TCP connect
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Consecutive transient failures tolerated per handshake step
    pub handshake_retry_budget: u32,

    /// Pause before reconnecting after a failed connect or handshake
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// Upstream session lifetime without traffic
    #[serde(with = "humantime_serde")]
    pub session_idle_timeout: Duration,

    /// Wake-up interval of the session loops
    #[serde(with = "humantime_serde")]
    pub session_poll_timeout: Duration,

    /// Local ports `[start, end)` for upstream sockets
    pub upstream_port_range: (u16, u16),

    /// Random port picks before a query is dropped
    pub upstream_bind_attempts: u32,

    /// Concurrent tunnel connections accepted by the server
    pub max_connections: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            server_address: None,
            dns_provider_address: DEFAULT_DNS_PROVIDER,
            dns_provider_port: 53,
            verbose: false,
            local_dns_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 53),
            key_bits: DEFAULT_KEY_BITS,
            handshake_timeout: Duration::from_secs(10),
            handshake_retry_budget: DEFAULT_RETRY_BUDGET,
            reconnect_delay: Duration::from_secs(1),
            session_idle_timeout: Duration::from_secs(5),
            session_poll_timeout: Duration::from_secs(2),
            upstream_port_range: (3000, 5000),
            upstream_bind_attempts: 5,
            max_connections: 50,
        }
    }
}

impl Configuration {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration for the given mode
    pub fn validate(&self, mode: Mode) -> Result<(), ConfigError> {
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&self.key_bits) {
            return Err(ConfigError::KeyBits(self.key_bits));
        }

        let (start, end) = self.upstream_port_range;
        if start >= end {
            return Err(ConfigError::EmptyPortRange(start, end));
        }

        let durations = [
            ("handshake_timeout", self.handshake_timeout),
            ("reconnect_delay", self.reconnect_delay),
            ("session_idle_timeout", self.session_idle_timeout),
            ("session_poll_timeout", self.session_poll_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroValue(name));
            }
        }

        if self.session_poll_timeout > self.session_idle_timeout {
            return Err(ConfigError::PollExceedsIdle {
                poll: self.session_poll_timeout,
                idle: self.session_idle_timeout,
            });
        }

        if self.upstream_bind_attempts == 0 {
            return Err(ConfigError::ZeroValue("upstream_bind_attempts"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroValue("max_connections"));
        }

        if mode == Mode::Client
            && self
                .server_address
                .as_deref()
                .map_or(true, |addr| addr.trim().is_empty())
        {
            return Err(ConfigError::MissingServerAddress);
        }

        Ok(())
    }

    /// Upstream resolver socket address
    pub fn resolver_addr(&self) -> SocketAddr {
        SocketAddr::new(self.dns_provider_address, self.dns_provider_port)
    }

    pub fn handshake_settings(&self) -> Result<HandshakeSettings, ConfigError> {
        let key_exchange = KeyExchange::new(self.key_bits).map_err(|_| ConfigError::KeyBits(self.key_bits))?;
        Ok(HandshakeSettings {
            key_exchange,
            timeout: self.handshake_timeout,
            retry_budget: self.handshake_retry_budget,
        })
    }

    pub fn demux_settings(&self) -> DemuxSettings {
        DemuxSettings {
            resolver: self.resolver_addr(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: self.upstream_port_range,
            bind_attempts: self.upstream_bind_attempts,
            idle_timeout: self.session_idle_timeout,
            poll_timeout: self.session_poll_timeout,
        }
    }
}
