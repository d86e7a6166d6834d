//! Tunnel server
//!
//! Accepts tunnel connections, runs the server handshake and bridges each
//! connection to its own [`ResponseDemultiplexer`].

use crate::config::{Configuration, Mode};
use crate::demultiplexer::{DemuxSettings, ResponseDemultiplexer};
use crate::envelope::{EnvelopeError, TunnelEnvelope};
use crate::frame::{CipherReader, CipherWriter};
use crate::handshake::{server_handshake, HandshakeSettings};
use crate::monitor::{supervise_pair, wait_for_shutdown};
use crate::{Application, DnsProxyError};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

/// Back-off after a failed accept
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

struct ServerContext {
    handshake: HandshakeSettings,
    demux: DemuxSettings,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

#[derive(Default)]
struct ServerState {
    running: Option<Running>,
    destroyed: bool,
}

/// Server application
pub struct Server {
    config: Configuration,
    context: Arc<ServerContext>,
    state: Mutex<ServerState>,
}

impl Server {
    pub fn new(config: Configuration) -> Result<Self, DnsProxyError> {
        config.validate(Mode::Server)?;
        let context = ServerContext {
            handshake: config.handshake_settings()?,
            demux: config.demux_settings(),
        };
        Ok(Self {
            config,
            context: Arc::new(context),
            state: Mutex::new(ServerState::default()),
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Bound tunnel listener address while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.running.as_ref().map(|r| r.local_addr)
    }
}

#[async_trait]
impl Application for Server {
    async fn start(&self) -> Result<(), DnsProxyError> {
        let mut state = self.state.lock().await;
        if state.destroyed {
            return Err(DnsProxyError::AlreadyDestroyed);
        }
        if state.running.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), self.config.server_port)).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Tunnel server listening on {}, upstream resolver {}",
            local_addr, self.context.demux.resolver
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let limit = Arc::new(Semaphore::new(self.config.max_connections));
        let task = tokio::spawn(accept_loop(listener, self.context.clone(), limit, shutdown_rx));
        state.running = Some(Running {
            shutdown,
            task,
            local_addr,
        });
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(running) = state.running.take() {
            running.shutdown.send_replace(true);
            if let Err(e) = running.task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
            info!("Server stopped");
        }
    }

    async fn destroy(&self) {
        self.stop().await;
        self.state.lock().await.destroyed = true;
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    limit: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        let permit = tokio::select! {
            p = limit.clone().acquire_owned() => match p {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = wait_for_shutdown(&mut shutdown) => break,
        };

        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = wait_for_shutdown(&mut shutdown) => break,
        };

        match accepted {
            Ok((stream, peer)) => {
                info!("Tunnel connection from {}", peer);
                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                connections.spawn(async move {
                    let _permit = permit;
                    serve_connection(stream, peer, ctx, shutdown).await;
                });
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }

        while connections.try_join_next().is_some() {}
    }

    if !connections.is_empty() {
        debug!("Waiting for {} tunnel connections to close", connections.len());
    }
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", peer, e);
    }
    let (reader, writer) = stream.into_split();

    let handshake = tokio::select! {
        r = server_handshake(reader, writer, &ctx.handshake) => r,
        _ = wait_for_shutdown(&mut shutdown) => return,
    };
    let channel = match handshake {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer, e);
            return;
        }
    };
    info!("Tunnel with {} established", peer);

    let (reader, writer) = channel.into_parts();
    let (demux, responses) = ResponseDemultiplexer::channel(ctx.demux.clone());
    let demux = Arc::new(demux);

    let reader_task = tokio::spawn(tunnel_reader(reader, demux.clone(), peer));
    let writer_task = tokio::spawn(tunnel_writer(writer, responses, peer));
    let exit = supervise_pair(reader_task, writer_task, &mut shutdown).await;

    demux.stop().await;
    info!("Tunnel with {} closed ({:?})", peer, exit);
}

async fn tunnel_reader(
    mut reader: CipherReader<OwnedReadHalf>,
    demux: Arc<ResponseDemultiplexer>,
    peer: SocketAddr,
) {
    loop {
        match TunnelEnvelope::read_from(&mut reader).await {
            Ok(Some(envelope)) => {
                log::trace!(
                    "Query from {} port {} ({} bytes)",
                    peer,
                    envelope.port(),
                    envelope.data().len()
                );
                demux.dispatch(envelope).await;
            }
            Ok(None) => {
                debug!("{} closed the tunnel", peer);
                break;
            }
            Err(e) => {
                warn!("Tunnel read from {} failed: {}", peer, e);
                break;
            }
        }
    }
}

async fn tunnel_writer(
    mut writer: CipherWriter<OwnedWriteHalf>,
    mut responses: mpsc::UnboundedReceiver<TunnelEnvelope>,
    peer: SocketAddr,
) {
    while let Some(first) = responses.recv().await {
        if let Err(e) = write_batch(&mut writer, &mut responses, first).await {
            warn!("Tunnel write to {} failed: {}", peer, e);
            break;
        }
    }
}

/// Write `first` plus every response already queued, then flush once
async fn write_batch(
    writer: &mut CipherWriter<OwnedWriteHalf>,
    responses: &mut mpsc::UnboundedReceiver<TunnelEnvelope>,
    first: TunnelEnvelope,
) -> Result<(), EnvelopeError> {
    first.write_to(writer).await?;
    while let Ok(next) = responses.try_recv() {
        next.write_to(writer).await?;
    }
    writer.flush().await?;
    Ok(())
}
