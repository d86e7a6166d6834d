//! dnsproxy: encrypted DNS-over-TCP tunnel
//!
//! Local UDP DNS queries are multiplexed over one persistent TCP connection,
//! keyed by an ephemeral Diffie-Hellman exchange and protected by CRC-checked
//! AES-CBC frames. The server side fans queries out to an upstream resolver
//! through one UDP session per client source port and routes the answers
//! back through the same tunnel.
//!
//! ## Architecture
//!
//! ```text
//! app ──UDP:53──▶ RequestMultiplexer ──TunnelEnvelope──▶ CipherWriter ──TCP──┐
//!                                                                              │
//! resolver ◀──UDP── ResponseDemultiplexer ◀──TunnelEnvelope◀── CipherReader ◀──┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dnsproxy::{Application, Configuration, Server};
//!
//! # async fn example() -> Result<(), dnsproxy::DnsProxyError> {
//! let server = Server::new(Configuration::default())?;
//! server.start().await?;
//! // ...
//! server.stop().await;
//! server.destroy().await;
//! # Ok(())
//! # }
//! ```

pub mod buffer_pool;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod demultiplexer;
pub mod envelope;
pub mod frame;
pub mod handshake;
pub mod key_exchange;
pub mod monitor;
pub mod multiplexer;
pub mod server;

pub use buffer_pool::{PacketBufferPool, PooledBuffer};
pub use checkpoint::{CheckpointDriver, CheckpointError, CheckpointMachine, Transition};
pub use client::Client;
pub use config::{ConfigError, Configuration, Mode};
pub use demultiplexer::{DemuxSettings, ResponseDemultiplexer};
pub use envelope::{EnvelopeError, TunnelEnvelope};
pub use frame::{CipherReader, CipherWriter, FrameCipher, FrameError};
pub use handshake::{client_handshake, server_handshake, HandshakeError, HandshakeSettings, SecureChannel};
pub use key_exchange::{KeyExchange, KeyExchangeError, KeyPair, SessionKey};
pub use multiplexer::{LocalDatagram, RequestMultiplexer};
pub use server::Server;

use async_trait::async_trait;

/// Lifecycle shared by the client and server applications.
///
/// Every call is idempotent. `stop` and `destroy` return only after every
/// task the application owns has been joined.
#[async_trait]
pub trait Application: Send + Sync {
    /// Bind sockets and spawn the application's tasks
    async fn start(&self) -> Result<(), DnsProxyError>;

    /// Signal shutdown and join every owned task
    async fn stop(&self);

    /// Stop and release sockets; `start` fails afterwards
    async fn destroy(&self);
}

/// dnsproxy error types
#[derive(Debug, thiserror::Error)]
pub enum DnsProxyError {
    /// `start` after `destroy`
    #[error("Application already destroyed")]
    AlreadyDestroyed,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Tunnel TCP connect did not complete in time
    #[error("Connecting to {0} timed out")]
    ConnectTimeout(String),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Key exchange error: {0}")]
    KeyExchange(#[from] KeyExchangeError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
