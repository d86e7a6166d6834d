//! Full client -> tunnel -> server -> resolver round trips over real sockets

use dnsproxy::{Application, Client, Configuration, Server};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Stub resolver answering every datagram with its own payload
async fn echo_resolver() -> (SocketAddr, JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    (addr, task)
}

struct Tunnel {
    client: Client,
    server: Server,
    resolver: JoinHandle<()>,
    dns_addr: SocketAddr,
}

impl Tunnel {
    async fn start() -> Self {
        let (resolver_addr, resolver) = echo_resolver().await;

        let server = Server::new(Configuration {
            server_port: 0,
            dns_provider_address: resolver_addr.ip(),
            dns_provider_port: resolver_addr.port(),
            upstream_port_range: (20000, 60000),
            ..Configuration::default()
        })
        .unwrap();
        server.start().await.unwrap();
        let server_port = server.local_addr().await.unwrap().port();

        let client = Client::new(Configuration {
            server_address: Some("127.0.0.1".to_string()),
            server_port,
            local_dns_bind: "127.0.0.1:0".parse().unwrap(),
            reconnect_delay: Duration::from_millis(100),
            ..Configuration::default()
        })
        .unwrap();
        client.start().await.unwrap();
        let dns_addr = client.local_addr().await.unwrap();

        Self {
            client,
            server,
            resolver,
            dns_addr,
        }
    }

    async fn shutdown(self) {
        self.client.destroy().await;
        self.server.destroy().await;
        self.resolver.abort();
    }
}

async fn bind_app_socket(preferred_port: u16) -> UdpSocket {
    match UdpSocket::bind(("127.0.0.1", preferred_port)).await {
        Ok(socket) => socket,
        Err(_) => UdpSocket::bind("127.0.0.1:0").await.unwrap(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_query_round_trip_from_port_40000() {
    let tunnel = Tunnel::start().await;

    let app = bind_app_socket(40000).await;
    app.send_to(&[0x01, 0x02], tunnel.dns_addr).await.unwrap();

    let mut buf = [0u8; 512];
    let (n, from) = timeout(Duration::from_secs(10), app.recv_from(&mut buf))
        .await
        .expect("response should arrive through the tunnel")
        .unwrap();
    assert_eq!(&buf[..n], &[0x01, 0x02]);
    assert_eq!(from, tunnel.dns_addr);

    tunnel.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ports_get_their_own_answers() {
    let tunnel = Tunnel::start().await;

    let mut apps = Vec::new();
    for i in 0..8u8 {
        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        apps.push((i, app));
    }
    for (i, app) in &apps {
        app.send_to(&[0xD0, *i], tunnel.dns_addr).await.unwrap();
    }

    for (i, app) in &apps {
        let mut buf = [0u8; 64];
        let (n, _) = timeout(Duration::from_secs(10), app.recv_from(&mut buf))
            .await
            .expect("every port should get its answer")
            .unwrap();
        assert_eq!(&buf[..n], &[0xD0, *i]);
    }

    tunnel.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_reconnects_after_server_restart() {
    let tunnel = Tunnel::start().await;

    let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 64];

    app.send_to(b"first", tunnel.dns_addr).await.unwrap();
    let (n, _) = timeout(Duration::from_secs(10), app.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"first");

    // Tearing down the server closes the tunnel; a restart on the same port
    // must be picked up by the next query.
    let port = tunnel.server.local_addr().await.unwrap().port();
    tunnel.server.stop().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let restarted = Server::new(Configuration {
        server_port: port,
        ..tunnel.server.config().clone()
    })
    .unwrap();
    restarted.start().await.unwrap();

    // The first query after the drop may be lost with the old tunnel
    let mut answered = false;
    for _ in 0..20 {
        app.send_to(b"second", tunnel.dns_addr).await.unwrap();
        if let Ok(Ok((n, _))) = timeout(Duration::from_millis(500), app.recv_from(&mut buf)).await {
            assert_eq!(&buf[..n], b"second");
            answered = true;
            break;
        }
    }
    assert!(answered, "client never re-established the tunnel");

    restarted.destroy().await;
    tunnel.shutdown().await;
}
