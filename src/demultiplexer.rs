//! Server-side response demultiplexer
//!
//! Every client source port seen on the tunnel gets its own upstream UDP
//! socket (a session) so resolver answers can be routed back to the right
//! port. Sessions run a request loop and a response loop and evict
//! themselves after a period without traffic.

use crate::buffer_pool::PacketBufferPool;
use crate::envelope::TunnelEnvelope;
use crate::monitor::{supervise_pair, PairExit};
use rand::Rng;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Upstream socket and eviction tuning
#[derive(Debug, Clone)]
pub struct DemuxSettings {
    /// Resolver every session forwards to
    pub resolver: SocketAddr,
    /// Local address upstream sockets bind on
    pub bind_ip: IpAddr,
    /// Local port range `[start, end)` for upstream sockets
    pub port_range: (u16, u16),
    pub bind_attempts: u32,
    pub idle_timeout: Duration,
    pub poll_timeout: Duration,
}

impl Default for DemuxSettings {
    fn default() -> Self {
        Self {
            resolver: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: (3000, 5000),
            bind_attempts: 5,
            idle_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(2),
        }
    }
}

/// Shared view of one session's activity
#[derive(Debug)]
struct SessionState {
    port: u16,
    started: Instant,
    last_active_ms: AtomicU64,
}

impl SessionState {
    fn new(port: u16) -> Self {
        Self {
            port,
            started: Instant::now(),
            last_active_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_active_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

struct SessionHandle {
    state: Arc<SessionState>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

impl SessionHandle {
    fn is_alive(&self) -> bool {
        !self.outbound.is_closed() && !self.supervisor.is_finished()
    }

    async fn terminate(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.supervisor.await {
            if e.is_panic() {
                log::error!("Session {} supervisor panicked: {}", self.state.port, e);
            }
        }
    }
}

type SessionMap = Arc<Mutex<HashMap<u16, SessionHandle>>>;

/// Port-keyed pool of upstream sessions for one tunnel connection
pub struct ResponseDemultiplexer {
    settings: DemuxSettings,
    sessions: SessionMap,
    responses: mpsc::UnboundedSender<TunnelEnvelope>,
    pool: PacketBufferPool,
}

impl ResponseDemultiplexer {
    /// Create a demultiplexer whose sessions push resolver answers into
    /// `responses`, the single queue drained by the tunnel writer.
    pub fn new(settings: DemuxSettings, responses: mpsc::UnboundedSender<TunnelEnvelope>) -> Self {
        Self {
            settings,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            responses,
            pool: PacketBufferPool::default(),
        }
    }

    /// Convenience constructor returning the response queue receiver
    pub fn channel(settings: DemuxSettings) -> (Self, mpsc::UnboundedReceiver<TunnelEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(settings, tx), rx)
    }

    pub fn settings(&self) -> &DemuxSettings {
        &self.settings
    }

    /// Route one request envelope to the session for its port, creating the
    /// session if needed. Idle sessions are evicted first.
    pub async fn dispatch(&self, envelope: TunnelEnvelope) {
        let port = envelope.port();
        let mut retired = Vec::new();

        {
            let mut sessions = self.sessions.lock().await;
            retired.extend(self.take_idle(&mut sessions));

            let needs_session = sessions.get(&port).map_or(true, |s| !s.is_alive());
            if needs_session {
                match self.open_session(port).await {
                    Some(session) => {
                        if let Some(old) = sessions.insert(port, session) {
                            retired.push(old);
                        }
                    }
                    None => {
                        log::warn!(
                            "No free upstream port after {} attempts, dropping query for port {}",
                            self.settings.bind_attempts,
                            port
                        );
                    }
                }
            }

            if let Some(session) = sessions.get(&port) {
                if session.outbound.send(envelope.into_data()).is_err() {
                    log::debug!("Session for port {} closed under us, query dropped", port);
                }
            }
        }

        for session in retired {
            session.terminate().await;
        }
    }

    /// Evict every session idle longer than the idle timeout; returns how
    /// many were removed.
    pub async fn sweep_idle(&self) -> usize {
        let retired = {
            let mut sessions = self.sessions.lock().await;
            self.take_idle(&mut sessions)
        };
        let count = retired.len();
        for session in retired {
            session.terminate().await;
        }
        count
    }

    fn take_idle(&self, sessions: &mut HashMap<u16, SessionHandle>) -> Vec<SessionHandle> {
        let idle_timeout = self.settings.idle_timeout;
        let stale: Vec<u16> = sessions
            .iter()
            .filter(|(_, s)| !s.is_alive() || s.state.idle_for() > idle_timeout)
            .map(|(port, _)| *port)
            .collect();

        stale
            .into_iter()
            .filter_map(|port| {
                log::debug!("Evicting idle session for port {}", port);
                sessions.remove(&port)
            })
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn has_session(&self, port: u16) -> bool {
        self.sessions.lock().await.contains_key(&port)
    }

    /// Interrupt and join every session
    pub async fn stop(&self) {
        let drained: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        if !drained.is_empty() {
            log::debug!("Stopping {} upstream sessions", drained.len());
        }
        for session in drained {
            session.terminate().await;
        }
    }

    async fn open_session(&self, port: u16) -> Option<SessionHandle> {
        let socket = match bind_upstream(&self.settings).await {
            Ok(Some(socket)) => socket,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Upstream socket setup failed for port {}: {}", port, e);
                return None;
            }
        };
        let socket = Arc::new(socket);
        log::debug!(
            "New session for port {} via {:?}",
            port,
            socket.local_addr().ok()
        );

        let state = Arc::new(SessionState::new(port));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let request_task = tokio::spawn(request_loop(
            socket.clone(),
            outbound_rx,
            state.clone(),
            self.settings.clone(),
        ));
        let response_task = tokio::spawn(response_loop(
            socket,
            self.responses.clone(),
            self.pool.clone(),
            state.clone(),
            self.settings.clone(),
        ));
        let supervisor = tokio::spawn(supervise_session(
            state.clone(),
            Arc::downgrade(&self.sessions),
            request_task,
            response_task,
            shutdown_rx,
        ));

        Some(SessionHandle {
            state,
            outbound,
            shutdown,
            supervisor,
        })
    }
}

/// Bind a connected upstream socket on a random port from the configured
/// range. `Ok(None)` when every attempt collided with a port in use.
async fn bind_upstream(settings: &DemuxSettings) -> io::Result<Option<UdpSocket>> {
    let (start, end) = settings.port_range;
    for attempt in 1..=settings.bind_attempts {
        let port = rand::thread_rng().gen_range(start..end);
        match UdpSocket::bind(SocketAddr::new(settings.bind_ip, port)).await {
            Ok(socket) => {
                socket.connect(settings.resolver).await?;
                return Ok(Some(socket));
            }
            Err(e) => {
                log::trace!("Upstream bind attempt {} on port {} failed: {}", attempt, port, e);
            }
        }
    }
    Ok(None)
}

async fn request_loop(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    state: Arc<SessionState>,
    settings: DemuxSettings,
) {
    loop {
        match timeout(settings.poll_timeout, outbound.recv()).await {
            Ok(Some(datagram)) => match socket.send(&datagram).await {
                Ok(_) => state.touch(),
                Err(e) => log::warn!("Session {}: upstream send failed: {}", state.port, e),
            },
            Ok(None) => break,
            Err(_) => {}
        }

        if state.idle_for() > settings.idle_timeout {
            log::debug!("Session {}: request loop idle, closing", state.port);
            break;
        }
    }
}

async fn response_loop(
    socket: Arc<UdpSocket>,
    responses: mpsc::UnboundedSender<TunnelEnvelope>,
    pool: PacketBufferPool,
    state: Arc<SessionState>,
    settings: DemuxSettings,
) {
    let mut buf = pool.acquire();
    loop {
        match timeout(settings.poll_timeout, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                state.touch();
                match TunnelEnvelope::new(state.port, buf[..len].to_vec()) {
                    Ok(envelope) => {
                        if responses.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Session {}: {}", state.port, e),
                }
            }
            Ok(Err(e)) => log::warn!("Session {}: upstream receive failed: {}", state.port, e),
            Err(_) => {}
        }

        if state.idle_for() > settings.idle_timeout {
            log::debug!("Session {}: response loop idle, closing", state.port);
            break;
        }
    }
}

async fn supervise_session(
    state: Arc<SessionState>,
    sessions: std::sync::Weak<Mutex<HashMap<u16, SessionHandle>>>,
    request_task: JoinHandle<()>,
    response_task: JoinHandle<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let exit = supervise_pair(request_task, response_task, &mut shutdown).await;
    if exit == PairExit::Shutdown {
        return;
    }

    // Deregister only if no replacement took the slot meanwhile
    if let Some(sessions) = sessions.upgrade() {
        let mut sessions = sessions.lock().await;
        let registered = sessions
            .get(&state.port)
            .map_or(false, |s| Arc::ptr_eq(&s.state, &state));
        if registered {
            sessions.remove(&state.port);
            log::debug!("Session {} removed itself after {:?}", state.port, state.started.elapsed());
        }
    }
}
