//! Test utilities and mocks for Sockspipe integration tests

use sockspipe::config::{ServerConfig, UpstreamConfig};
use sockspipe::relay::{ConnectionTable, RelayServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// A destination that answers `ping` with `pong`, then echoes until EOF.
pub async fn spawn_ping_pong_destination() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                if stream.read_exact(&mut buf).await.is_err() {
                    return;
                }
                if &buf == b"ping" {
                    let _ = stream.write_all(b"pong").await;
                }
                let mut rest = [0u8; 4096];
                loop {
                    match stream.read(&mut rest).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&rest[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Scripted SOCKS5 upstream server.
pub struct MockSocks5 {
    /// Demand username/password sub-negotiation with these credentials
    pub require_auth: Option<(String, String)>,
    /// Reply code for the CONNECT request; non-zero closes the connection
    pub connect_reply: u8,
}

impl Default for MockSocks5 {
    fn default() -> Self {
        MockSocks5 {
            require_auth: None,
            connect_reply: 0x00,
        }
    }
}

/// Spawn the mock upstream. After a successful handshake it echoes bytes
/// back, standing in for the destination behind the proxy.
pub async fn spawn_socks5_upstream(mock: MockSocks5) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mock = Arc::new(mock);

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let mock = Arc::clone(&mock);
            tokio::spawn(async move {
                let _ = serve_socks5(stream, &mock).await;
            });
        }
    });

    addr
}

async fn serve_socks5(mut stream: TcpStream, mock: &MockSocks5) -> std::io::Result<()> {
    // Greeting
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    assert_eq!(header[0], 0x05);
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    match &mock.require_auth {
        Some((user, pass)) => {
            if !methods.contains(&0x02) {
                stream.write_all(&[0x05, 0xFF]).await?;
                return Ok(());
            }
            stream.write_all(&[0x05, 0x02]).await?;

            // RFC 1929 sub-negotiation
            let mut auth_header = [0u8; 2];
            stream.read_exact(&mut auth_header).await?;
            assert_eq!(auth_header[0], 0x01);
            let mut got_user = vec![0u8; auth_header[1] as usize];
            stream.read_exact(&mut got_user).await?;
            let plen = stream.read_u8().await? as usize;
            let mut got_pass = vec![0u8; plen];
            stream.read_exact(&mut got_pass).await?;

            if got_user != user.as_bytes() || got_pass != pass.as_bytes() {
                stream.write_all(&[0x01, 0x01]).await?;
                return Ok(());
            }
            stream.write_all(&[0x01, 0x00]).await?;
        }
        None => {
            stream.write_all(&[0x05, 0x00]).await?;
        }
    }

    // CONNECT request
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    assert_eq!(&request[..3], &[0x05, 0x01, 0x00]);
    match request[3] {
        0x01 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await?;
        }
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut rest = vec![0u8; len + 2];
            stream.read_exact(&mut rest).await?;
        }
        0x04 => {
            let mut rest = [0u8; 18];
            stream.read_exact(&mut rest).await?;
        }
        atyp => panic!("unexpected atyp {atyp}"),
    }

    stream
        .write_all(&[0x05, mock.connect_reply, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    if mock.connect_reply != 0x00 {
        return Ok(());
    }

    // Established: echo, standing in for the destination.
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return Ok(()),
            Ok(n) => stream.write_all(&buf[..n]).await?,
        }
    }
}

/// Relay server running on an ephemeral port.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub table: Arc<ConnectionTable>,
    pub shutdown_tx: broadcast::Sender<bool>,
}

/// Bind and run a relay with the given config (`bind_addr` is overridden to
/// an ephemeral loopback port).
pub async fn spawn_relay(mut config: ServerConfig) -> TestRelay {
    config.bind_addr = "127.0.0.1:0".to_string();
    let server = RelayServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let table = server.table();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = server.run(shutdown_rx).await;
    });
    TestRelay {
        addr,
        table,
        shutdown_tx,
    }
}

/// Config for a direct relay to `destination`.
pub fn direct_config(destination: SocketAddr) -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        destination: Some(destination.to_string()),
        transparent: false,
        max_connections: 64,
        stats_on_stdin: false,
        upstream: None,
    }
}

/// Config relaying to `destination` through the upstream SOCKS5 server at
/// `upstream`.
pub fn upstream_config(
    destination: SocketAddr,
    upstream: SocketAddr,
    credentials: Option<(&str, &str)>,
) -> ServerConfig {
    ServerConfig {
        upstream: Some(UpstreamConfig {
            addr: upstream.to_string(),
            username: credentials.map(|(u, _)| u.to_string()),
            password: credentials.map(|(_, p)| p.to_string()),
        }),
        ..direct_config(destination)
    }
}
