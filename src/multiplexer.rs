//! Client-side request multiplexer
//!
//! Owns the local DNS UDP socket. A listener task queues every local query
//! tagged with its source port; a responder task delivers tunnel responses
//! back to `127.0.0.1:<port>`. The tunnel writer drains the request queue,
//! the tunnel reader feeds the response queue.

use crate::buffer_pool::PacketBufferPool;
use crate::envelope::TunnelEnvelope;
use crate::monitor::{cancel_and_join, wait_for_shutdown};
use bytes::Bytes;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// One query received on the local DNS socket, sized to its payload
#[derive(Debug, Clone)]
pub struct LocalDatagram {
    pub port: u16,
    pub payload: Bytes,
}

struct RequestQueue {
    receiver: mpsc::UnboundedReceiver<LocalDatagram>,
    pending: Option<LocalDatagram>,
}

/// Bridges the local UDP socket and the tunnel
pub struct RequestMultiplexer {
    socket: Arc<UdpSocket>,
    pool: PacketBufferPool,
    request_tx: mpsc::UnboundedSender<LocalDatagram>,
    requests: Mutex<RequestQueue>,
    response_tx: mpsc::UnboundedSender<TunnelEnvelope>,
    responses: Arc<Mutex<mpsc::UnboundedReceiver<TunnelEnvelope>>>,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RequestMultiplexer {
    /// Bind the local listening socket. Loops start with [`start`](Self::start).
    pub async fn bind(addr: SocketAddr, pool: PacketBufferPool) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        log::info!("Listening for DNS queries on {}", socket.local_addr()?);

        let (request_tx, receiver) = mpsc::unbounded_channel();
        let (response_tx, responses) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            socket: Arc::new(socket),
            pool,
            request_tx,
            requests: Mutex::new(RequestQueue {
                receiver,
                pending: None,
            }),
            response_tx,
            responses: Arc::new(Mutex::new(responses)),
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the listener and responder loops. No-op while already running.
    pub fn start(&self) {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !tasks.is_empty() {
            return;
        }
        self.shutdown.send_replace(false);

        tasks.push(tokio::spawn(listen_loop(
            self.socket.clone(),
            self.pool.clone(),
            self.request_tx.clone(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(respond_loop(
            self.socket.clone(),
            self.responses.clone(),
            self.shutdown.subscribe(),
        )));
    }

    /// Stop both loops and wait for them to exit
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            cancel_and_join(task).await;
        }
    }

    /// Block until at least one local query is queued without consuming it.
    /// Returns `false` if the queue can never fill again.
    pub async fn wait_for_request(&self) -> bool {
        let mut queue = self.requests.lock().await;
        if queue.pending.is_some() {
            return true;
        }
        queue.pending = queue.receiver.recv().await;
        queue.pending.is_some()
    }

    /// Next local query in FIFO order, waiting if none is queued
    pub async fn poll_request_or_wait(&self) -> Option<LocalDatagram> {
        let mut queue = self.requests.lock().await;
        if let Some(datagram) = queue.pending.take() {
            return Some(datagram);
        }
        queue.receiver.recv().await
    }

    /// Next local query if one is already queued
    pub async fn try_poll_request(&self) -> Option<LocalDatagram> {
        let mut queue = self.requests.lock().await;
        if let Some(datagram) = queue.pending.take() {
            return Some(datagram);
        }
        queue.receiver.try_recv().ok()
    }

    /// Hand a tunnel response to the responder loop
    pub fn queue_respond_and_notify(&self, envelope: TunnelEnvelope) {
        if self.response_tx.send(envelope).is_err() {
            log::warn!("Response queue closed, dropping response");
        }
    }
}

async fn listen_loop(
    socket: Arc<UdpSocket>,
    pool: PacketBufferPool,
    requests: mpsc::UnboundedSender<LocalDatagram>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = pool.acquire();
    loop {
        let received = tokio::select! {
            r = socket.recv_from(&mut buf) => r,
            _ = wait_for_shutdown(&mut shutdown) => break,
        };

        match received {
            Ok((len, from)) => {
                log::trace!("Local query of {} bytes from {}", len, from);
                let datagram = LocalDatagram {
                    port: from.port(),
                    payload: Bytes::copy_from_slice(&buf[..len]),
                };
                if requests.send(datagram).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("Local DNS socket receive error: {}", e);
            }
        }
    }
    log::debug!("Local listener stopped");
}

async fn respond_loop(
    socket: Arc<UdpSocket>,
    responses: Arc<Mutex<mpsc::UnboundedReceiver<TunnelEnvelope>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut responses = responses.lock().await;
    loop {
        let envelope = tokio::select! {
            r = responses.recv() => match r {
                Some(envelope) => envelope,
                None => break,
            },
            _ = wait_for_shutdown(&mut shutdown) => break,
        };

        let target = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), envelope.port());
        match socket.send_to(envelope.data(), target).await {
            Ok(_) => log::trace!("Delivered {} byte response to {}", envelope.data().len(), target),
            Err(e) => log::warn!("Failed to deliver response to {}: {}", target, e),
        }
    }
    log::debug!("Local responder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn local_mux() -> RequestMultiplexer {
        let mux = RequestMultiplexer::bind("127.0.0.1:0".parse().unwrap(), PacketBufferPool::new(4, 2048))
            .await
            .unwrap();
        mux.start();
        mux
    }

    #[tokio::test]
    async fn test_requests_tagged_with_source_port_in_order() {
        let mux = local_mux().await;
        let target = mux.local_addr().unwrap();

        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let app_port = app.local_addr().unwrap().port();
        for i in 0..3u8 {
            app.send_to(&[i, i], target).await.unwrap();
        }

        assert!(mux.wait_for_request().await);
        for i in 0..3u8 {
            let datagram = timeout(Duration::from_secs(2), mux.poll_request_or_wait())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(datagram.port, app_port);
            assert_eq!(&datagram.payload[..], &[i, i]);
        }
        assert!(mux.try_poll_request().await.is_none());
        mux.stop().await;
    }

    #[tokio::test]
    async fn test_queued_requests_do_not_hold_pool_buffers() {
        let pool = PacketBufferPool::new(8, 2048);
        let mux = RequestMultiplexer::bind("127.0.0.1:0".parse().unwrap(), pool.clone())
            .await
            .unwrap();
        mux.start();

        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for i in 0..5u8 {
            app.send_to(&[i, 0xEE], mux.local_addr().unwrap()).await.unwrap();
        }

        let mut held = Vec::new();
        for _ in 0..5 {
            let datagram = timeout(Duration::from_secs(2), mux.poll_request_or_wait())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(datagram.payload.len(), 2);
            held.push(datagram);
        }

        // Only the listener's own receive buffer ever came from the pool
        mux.stop().await;
        assert_eq!(pool.idle(), 1);
        drop(held);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_response_delivered_to_local_port() {
        let mux = local_mux().await;
        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let app_port = app.local_addr().unwrap().port();

        mux.queue_respond_and_notify(TunnelEnvelope::new(app_port, vec![0xAB, 0xCD]).unwrap());

        let mut buf = [0u8; 16];
        let (n, from) = timeout(Duration::from_secs(2), app.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &[0xAB, 0xCD]);
        assert_eq!(from, mux.local_addr().unwrap());
        mux.stop().await;
    }

    #[tokio::test]
    async fn test_stop_and_restart() {
        let mux = local_mux().await;
        mux.stop().await;
        mux.stop().await;
        mux.start();

        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        app.send_to(b"again", mux.local_addr().unwrap()).await.unwrap();
        let datagram = timeout(Duration::from_secs(2), mux.poll_request_or_wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&datagram.payload[..], b"again");
        mux.stop().await;
    }
}
