//! Tunnel client
//!
//! Listens for local DNS queries and relays them over one encrypted tunnel.
//! The tunnel is only opened once a query is waiting; any connect or
//! handshake failure is retried after `reconnect_delay` with a new TCP
//! connection and fresh ephemeral keys.

use crate::buffer_pool::PacketBufferPool;
use crate::config::{Configuration, Mode};
use crate::envelope::{write_envelope, EnvelopeError, TunnelEnvelope};
use crate::frame::{CipherReader, CipherWriter};
use crate::handshake::{client_handshake, HandshakeSettings, SecureChannel};
use crate::monitor::{supervise_pair, wait_for_shutdown};
use crate::multiplexer::{LocalDatagram, RequestMultiplexer};
use crate::{Application, DnsProxyError};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

type ClientChannel = SecureChannel<OwnedReadHalf, OwnedWriteHalf>;

struct ClientContext {
    server_host: String,
    server_port: u16,
    handshake: HandshakeSettings,
    reconnect_delay: Duration,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ClientState {
    mux: Option<Arc<RequestMultiplexer>>,
    running: Option<Running>,
    destroyed: bool,
}

/// Client application
pub struct Client {
    config: Configuration,
    context: Arc<ClientContext>,
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new(config: Configuration) -> Result<Self, DnsProxyError> {
        config.validate(Mode::Client)?;
        let context = ClientContext {
            server_host: config.server_address.clone().unwrap_or_default(),
            server_port: config.server_port,
            handshake: config.handshake_settings()?,
            reconnect_delay: config.reconnect_delay,
        };
        Ok(Self {
            config,
            context: Arc::new(context),
            state: Mutex::new(ClientState::default()),
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Address of the local DNS listener while it is bound
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let state = self.state.lock().await;
        state.mux.as_ref().and_then(|mux| mux.local_addr().ok())
    }
}

#[async_trait]
impl Application for Client {
    async fn start(&self) -> Result<(), DnsProxyError> {
        let mut state = self.state.lock().await;
        if state.destroyed {
            return Err(DnsProxyError::AlreadyDestroyed);
        }
        if state.running.is_some() {
            return Ok(());
        }

        let mux = match &state.mux {
            Some(mux) => mux.clone(),
            None => {
                let mux = Arc::new(
                    RequestMultiplexer::bind(self.config.local_dns_bind, PacketBufferPool::default()).await?,
                );
                state.mux = Some(mux.clone());
                mux
            }
        };
        mux.start();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(connection_loop(self.context.clone(), mux, shutdown_rx));
        state.running = Some(Running { shutdown, task });

        info!(
            "Client started, tunnel server {}:{}",
            self.context.server_host, self.context.server_port
        );
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(running) = state.running.take() {
            running.shutdown.send_replace(true);
            if let Err(e) = running.task.await {
                warn!("Connection loop ended abnormally: {}", e);
            }
            info!("Client stopped");
        }
        if let Some(mux) = &state.mux {
            mux.stop().await;
        }
    }

    async fn destroy(&self) {
        self.stop().await;
        let mut state = self.state.lock().await;
        state.mux = None;
        state.destroyed = true;
    }
}

async fn connection_loop(
    ctx: Arc<ClientContext>,
    mux: Arc<RequestMultiplexer>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let has_request = tokio::select! {
            r = mux.wait_for_request() => r,
            _ = wait_for_shutdown(&mut shutdown) => break,
        };
        if !has_request {
            break;
        }

        let established = tokio::select! {
            r = establish(&ctx) => r,
            _ = wait_for_shutdown(&mut shutdown) => break,
        };

        match established {
            Ok(channel) => {
                info!("Tunnel to {}:{} established", ctx.server_host, ctx.server_port);
                let exit = relay(channel, mux.clone(), &mut shutdown).await;
                info!("Tunnel closed ({:?})", exit);
            }
            Err(e) => {
                warn!(
                    "Tunnel to {}:{} failed: {}; retrying in {:?}",
                    ctx.server_host, ctx.server_port, e, ctx.reconnect_delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(ctx.reconnect_delay) => {}
                    _ = wait_for_shutdown(&mut shutdown) => break,
                }
            }
        }

        if *shutdown.borrow() {
            break;
        }
    }
    debug!("Connection loop stopped");
}

async fn establish(ctx: &ClientContext) -> Result<ClientChannel, DnsProxyError> {
    let target = format!("{}:{}", ctx.server_host, ctx.server_port);
    let connect = TcpStream::connect((ctx.server_host.as_str(), ctx.server_port));
    let stream = match tokio::time::timeout(ctx.handshake.timeout, connect).await {
        Ok(stream) => stream?,
        Err(_) => return Err(DnsProxyError::ConnectTimeout(target)),
    };
    stream.set_nodelay(true)?;
    debug!("Connected to {}, starting handshake", target);

    let (reader, writer) = stream.into_split();
    Ok(client_handshake(reader, writer, &ctx.handshake).await?)
}

async fn relay(
    channel: ClientChannel,
    mux: Arc<RequestMultiplexer>,
    shutdown: &mut watch::Receiver<bool>,
) -> crate::monitor::PairExit {
    let (reader, writer) = channel.into_parts();
    let reader_task = tokio::spawn(tunnel_reader(reader, mux.clone()));
    let writer_task = tokio::spawn(tunnel_writer(writer, mux));
    supervise_pair(reader_task, writer_task, shutdown).await
}

async fn tunnel_reader(mut reader: CipherReader<OwnedReadHalf>, mux: Arc<RequestMultiplexer>) {
    loop {
        match TunnelEnvelope::read_from(&mut reader).await {
            Ok(Some(envelope)) => {
                log::trace!(
                    "Response for port {} ({} bytes)",
                    envelope.port(),
                    envelope.data().len()
                );
                mux.queue_respond_and_notify(envelope);
            }
            Ok(None) => {
                info!("Server closed the tunnel");
                break;
            }
            Err(e) => {
                warn!("Tunnel read failed: {}", e);
                break;
            }
        }
    }
}

async fn tunnel_writer(mut writer: CipherWriter<OwnedWriteHalf>, mux: Arc<RequestMultiplexer>) {
    loop {
        let first = match mux.poll_request_or_wait().await {
            Some(datagram) => datagram,
            None => break,
        };
        match write_batch(&mut writer, &mux, first).await {
            Ok(count) => log::trace!("Flushed {} queries", count),
            Err(e) => {
                warn!("Tunnel write failed: {}", e);
                break;
            }
        }
    }
}

/// Write `first` plus whatever else is already queued, then flush once
async fn write_batch(
    writer: &mut CipherWriter<OwnedWriteHalf>,
    mux: &RequestMultiplexer,
    first: LocalDatagram,
) -> Result<usize, EnvelopeError> {
    write_envelope(writer, first.port, &first.payload).await?;
    let mut count = 1;
    while let Some(next) = mux.try_poll_request().await {
        write_envelope(writer, next.port, &next.payload).await?;
        count += 1;
    }
    writer.flush().await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> Configuration {
        Configuration {
            server_address: Some("127.0.0.1".into()),
            server_port: 9,
            local_dns_bind: "127.0.0.1:0".parse().unwrap(),
            ..Configuration::default()
        }
    }

    #[test]
    fn test_new_requires_server_address() {
        let config = Configuration {
            server_address: None,
            ..local_config()
        };
        assert!(matches!(
            Client::new(config),
            Err(DnsProxyError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_is_idempotent() {
        let client = Client::new(local_config()).unwrap();
        assert!(client.local_addr().await.is_none());

        client.start().await.unwrap();
        client.start().await.unwrap();
        let addr = client.local_addr().await.unwrap();
        assert_ne!(addr.port(), 0);

        client.stop().await;
        client.stop().await;
        assert_eq!(client.local_addr().await, Some(addr));

        client.start().await.unwrap();
        client.destroy().await;
        client.destroy().await;
        assert!(client.local_addr().await.is_none());
        assert!(matches!(
            client.start().await,
            Err(DnsProxyError::AlreadyDestroyed)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_keeps_retrying() {
        let resolver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver_addr = resolver.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, from)) = resolver.recv_from(&mut buf).await {
                let _ = resolver.send_to(&buf[..n], from).await;
            }
        });

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = Configuration {
            server_port: port,
            reconnect_delay: Duration::from_millis(50),
            ..local_config()
        };
        let client = Client::new(config).unwrap();
        client.start().await.unwrap();

        let app = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        app.send_to(b"q", client.local_addr().await.unwrap()).await.unwrap();

        // Several connect attempts fail while nothing listens
        tokio::time::sleep(Duration::from_millis(300)).await;

        let server = crate::Server::new(Configuration {
            server_port: port,
            dns_provider_address: resolver_addr.ip(),
            dns_provider_port: resolver_addr.port(),
            upstream_port_range: (20000, 60000),
            ..Configuration::default()
        })
        .unwrap();
        server.start().await.unwrap();

        // The query queued during the outage goes through once a server is up
        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), app.recv_from(&mut buf))
            .await
            .expect("pending query should be answered after reconnecting")
            .unwrap();
        assert_eq!(&buf[..n], b"q");

        client.destroy().await;
        server.destroy().await;
        echo.abort();
    }
}
