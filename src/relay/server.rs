//! Relay server: accept loop and connection lifecycle
//!
//! Accepts inbound clients, resolves where each one is really headed
//! (static destination or the kernel's transparent-redirect record), opens
//! the paired outbound socket — through the upstream SOCKS5 server when one
//! is configured — and hands the established pair to the byte pump. Each
//! pair lives in its own task; teardown always removes both table entries
//! together.

use crate::config::{Config, ServerConfig, UpstreamConfig};
use crate::error::{RelayError, Socks5Error, Socks5ReplyCode};
use crate::relay::pipe::relay;
use crate::relay::redir::original_dst;
use crate::relay::table::{ConnId, ConnState, ConnectionTable, Role};
use crate::socks::{self, send_failure_reply, TargetAddr, SOCKS5_AUTH_METHOD_PASSWORD};
use crate::stats;
use anyhow::{Context, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// The relay server: one listener plus the shared connection table.
pub struct RelayServer {
    config: ServerConfig,
    table: Arc<ConnectionTable>,
    listener: TcpListener,
}

impl RelayServer {
    /// Validate the configuration and bind the listening socket.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
        let table = Arc::new(ConnectionTable::new(config.max_connections));
        Ok(RelayServer {
            config,
            table,
            listener,
        })
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handle to the connection table.
    pub fn table(&self) -> Arc<ConnectionTable> {
        Arc::clone(&self.table)
    }

    /// Accept and relay connections until shutdown.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        info!("Listening on {}", self.listener.local_addr()?);
        match &self.config.upstream {
            Some(upstream) => info!(
                "Forwarding via upstream SOCKS5 server {} (auth: {})",
                upstream.addr,
                if upstream.has_credentials() {
                    "username/password"
                } else {
                    "none"
                }
            ),
            None => info!("Relaying directly"),
        }

        if self.config.stats_on_stdin {
            tokio::spawn(stats::stdin_stats(Arc::clone(&self.table)));
        }

        let static_dest = self.config.destination_addr()?;

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((client, peer_addr)) => {
                            self.handle_accept(client, peer_addr, static_dest.as_ref());
                        }
                        Err(e) => {
                            // Transient accept failures (EMFILE and friends)
                            // must not take the listener down.
                            warn!("Accept failed: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping relay");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Resolve the destination, reserve table entries, and spawn the
    /// per-pair task. Rejections (no redirect record, full table) only
    /// affect the new client.
    fn handle_accept(
        &self,
        client: TcpStream,
        peer_addr: SocketAddr,
        static_dest: Option<&TargetAddr>,
    ) {
        let destination = if self.config.transparent {
            match original_dst(&client) {
                Ok(addr) => TargetAddr::from(addr),
                Err(e) => match static_dest {
                    Some(dest) => {
                        warn!(
                            "No redirect record for {} ({}), using static destination",
                            peer_addr, e
                        );
                        dest.clone()
                    }
                    None => {
                        warn!("Rejecting {}: no redirect record ({})", peer_addr, e);
                        return;
                    }
                },
            }
        } else {
            // validate() guarantees a static destination in this mode
            match static_dest {
                Some(dest) => dest.clone(),
                None => return,
            }
        };

        let initial_state = if self.config.upstream.is_some() {
            ConnState::AwaitingUpstreamConnect
        } else {
            ConnState::Relaying
        };
        let (client_id, remote_id) =
            match self
                .table
                .insert_pair(peer_addr, destination.clone(), initial_state)
            {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("Rejecting {}: {}", peer_addr, e);
                    return;
                }
            };

        info!(
            "Accepted {} as {} -> {} ({})",
            peer_addr, client_id, destination, remote_id
        );

        tokio::spawn(handle_connection(
            client,
            destination,
            self.config.upstream.clone(),
            Arc::clone(&self.table),
            client_id,
            remote_id,
        ));
    }
}

/// Run a relay server from a loaded configuration until shutdown.
pub async fn run_server(config: Config, shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
    let server = RelayServer::bind(config.server).await?;
    server.run(shutdown_rx).await
}

/// One relay pair from establishment to teardown.
async fn handle_connection(
    mut client: TcpStream,
    destination: TargetAddr,
    upstream: Option<UpstreamConfig>,
    table: Arc<ConnectionTable>,
    client_id: ConnId,
    remote_id: ConnId,
) {
    let _ = client.set_nodelay(true);

    match establish(&mut client, &destination, upstream.as_ref(), &table, remote_id).await {
        Ok(remote) => {
            table.set_state(client_id, ConnState::Relaying);
            table.set_state(remote_id, ConnState::Relaying);
            debug!("Relay {} <-> {} established", client_id, remote_id);

            relay(client, remote, Arc::clone(&table), client_id, remote_id).await;
        }
        Err(e) => {
            warn!("Failed to establish {} -> {}: {}", client_id, destination, e);
        }
    }

    let removed = table.remove_pair(client_id);
    let sent = removed
        .iter()
        .find(|e| e.role == Role::Inbound)
        .map_or(0, |e| e.bytes_relayed);
    let received = removed
        .iter()
        .find(|e| e.role == Role::Outbound)
        .map_or(0, |e| e.bytes_relayed);
    info!(
        "Closed {} -> {}: {} bytes sent, {} bytes received",
        client_id, destination, sent, received
    );
}

/// Open the destination-facing socket, running the SOCKS5 handshake when an
/// upstream proxy is configured. Handshake failures (TCP connect included)
/// answer the inbound client with a best-effort SOCKS5 failure reply before
/// the pair is torn down; direct-mode failures close silently.
async fn establish(
    client: &mut TcpStream,
    destination: &TargetAddr,
    upstream: Option<&UpstreamConfig>,
    table: &ConnectionTable,
    remote_id: ConnId,
) -> Result<TcpStream, RelayError> {
    match upstream {
        None => {
            let addr = destination
                .resolve()
                .await
                .map_err(|e| RelayError::Connection(format!("{:#}", e)))?;
            let remote = TcpStream::connect(addr).await?;
            let _ = remote.set_nodelay(true);
            table.set_peer_addr(remote_id, addr);
            Ok(remote)
        }
        Some(upstream) => {
            match establish_via_upstream(destination, upstream, table, remote_id).await {
                Ok(remote) => Ok(remote),
                Err(err) => {
                    let code = reply_code_for(&err);
                    if let Err(e) = send_failure_reply(client, code).await {
                        debug!("Failure reply not delivered: {}", e);
                    }
                    Err(err)
                }
            }
        }
    }
}

/// The four handshake phases against the upstream SOCKS5 server, recording
/// each phase in the connection table as it is entered.
async fn establish_via_upstream(
    destination: &TargetAddr,
    upstream: &UpstreamConfig,
    table: &ConnectionTable,
    remote_id: ConnId,
) -> Result<TcpStream, RelayError> {
    let upstream_addr = upstream
        .addr
        .parse::<TargetAddr>()?
        .resolve()
        .await
        .map_err(|e| RelayError::Connection(format!("{:#}", e)))?;

    let mut remote = TcpStream::connect(upstream_addr).await?;
    let _ = remote.set_nodelay(true);
    table.set_peer_addr(remote_id, upstream_addr);

    let auth = upstream.auth();
    table.set_state(remote_id, ConnState::AwaitingUpstreamGreetingReply);
    let method = socks::negotiate_method(&mut remote, auth.is_some()).await?;

    if method == SOCKS5_AUTH_METHOD_PASSWORD {
        let auth = auth.as_ref().ok_or(Socks5Error::NoAcceptableMethod)?;
        table.set_state(remote_id, ConnState::AwaitingAuthReply);
        socks::authenticate(&mut remote, auth).await?;
    }

    table.set_state(remote_id, ConnState::AwaitingConnectReply);
    socks::send_connect(&mut remote, destination).await?;
    socks::read_connect_reply(&mut remote).await?;

    Ok(remote)
}

/// SOCKS5 reply code forwarded to the inbound client for a failed
/// establishment.
fn reply_code_for(err: &RelayError) -> Socks5ReplyCode {
    match err {
        RelayError::Socks5(e) => e.reply_code(),
        RelayError::Io(e) => Socks5ReplyCode::from(e),
        _ => Socks5ReplyCode::GeneralFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            destination: Some("127.0.0.1:9000".to_string()),
            transparent: false,
            max_connections: 16,
            stats_on_stdin: false,
            upstream: None,
        }
    }

    #[tokio::test]
    async fn test_bind_validates_config() {
        let config = ServerConfig {
            destination: None,
            ..base_config()
        };
        assert!(RelayServer::bind(config).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = RelayServer::bind(base_config()).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(server.table().is_empty());
    }

    #[test]
    fn test_reply_code_for_socks5_errors() {
        let err = RelayError::Socks5(Socks5Error::ReplyFailure(Socks5ReplyCode::HostUnreachable));
        assert_eq!(reply_code_for(&err), Socks5ReplyCode::HostUnreachable);

        let err = RelayError::Socks5(Socks5Error::AuthFailed);
        assert_eq!(reply_code_for(&err), Socks5ReplyCode::ConnectionNotAllowed);
    }

    #[test]
    fn test_reply_code_for_io_errors() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = RelayError::Io(io_err);
        assert_eq!(reply_code_for(&err), Socks5ReplyCode::ConnectionRefused);

        let err = RelayError::Connection("resolve failed".to_string());
        assert_eq!(reply_code_for(&err), Socks5ReplyCode::GeneralFailure);
    }
}
