//! Bidirectional byte pump
//!
//! One [`pipe`] per direction reads up to [`RELAY_BUFFER_SIZE`] bytes and
//! writes the whole chunk to the peer before reading again, so a slow peer
//! backpressures the reader with at most one chunk in flight. EOF propagates
//! as a write-side shutdown on the peer, leaving the opposite direction
//! untouched; the pair only finishes once both directions have ended.

use crate::relay::table::{ConnId, ConnectionTable};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

/// Chunk size for relayed reads.
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Forward one direction until EOF or error.
///
/// `from` is the table entry of the socket being read; its byte counter
/// grows by each fully forwarded chunk. On EOF the writer is shut down and
/// the half-close recorded in the table. Returns the total forwarded on
/// clean EOF; IO errors propagate so the caller can tear the pair down.
pub async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    table: Arc<ConnectionTable>,
    from: ConnId,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            let fully_closed = table.mark_read_closed(from);
            debug!(
                "EOF on {} after {} bytes{}",
                from,
                total,
                if fully_closed { ", pair closed" } else { "" }
            );
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        table.add_bytes(from, n as u64);
    }
}

/// Relay bytes between a client socket and its destination-facing peer.
///
/// Both directions run as independent tasks and the relay only returns when
/// both have ended, so a half-closed stream keeps draining the surviving
/// direction. An IO error in either direction counts as the pair
/// disappearing and aborts the other.
pub async fn relay(
    client: TcpStream,
    remote: TcpStream,
    table: Arc<ConnectionTable>,
    client_id: ConnId,
    remote_id: ConnId,
) {
    let (client_read, client_write) = client.into_split();
    let (remote_read, remote_write) = remote.into_split();

    let mut forward = tokio::spawn(pipe(
        client_read,
        remote_write,
        Arc::clone(&table),
        client_id,
    ));
    let mut backward = tokio::spawn(pipe(
        remote_read,
        client_write,
        Arc::clone(&table),
        remote_id,
    ));

    tokio::select! {
        res = &mut forward => {
            finish_sibling(res, client_id, &mut backward).await;
        }
        res = &mut backward => {
            finish_sibling(res, remote_id, &mut forward).await;
        }
    }
}

/// Handle the first direction to complete, then wait out (or abort) the
/// other one.
async fn finish_sibling(
    done: Result<io::Result<u64>, tokio::task::JoinError>,
    done_id: ConnId,
    sibling: &mut JoinHandle<io::Result<u64>>,
) {
    match done {
        Ok(Ok(_)) => {
            // Clean EOF: the opposite direction may still be flowing.
        }
        Ok(Err(e)) => {
            debug!("Relay direction from {} failed: {}", done_id, e);
            sibling.abort();
        }
        Err(e) => {
            debug!("Relay direction from {} aborted: {}", done_id, e);
            sibling.abort();
        }
    }
    match sibling.await {
        Ok(Ok(_)) | Err(_) => {}
        Ok(Err(e)) => debug!("Relay direction failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::table::ConnState;
    use crate::socks::TargetAddr;
    use std::net::Ipv4Addr;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn test_table() -> Arc<ConnectionTable> {
        Arc::new(ConnectionTable::new(16))
    }

    fn test_pair(table: &ConnectionTable) -> (ConnId, ConnId) {
        table
            .insert_pair(
                "127.0.0.1:40000".parse().unwrap(),
                TargetAddr::ipv4(Ipv4Addr::LOCALHOST, 9000),
                ConnState::Relaying,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_pipe_forwards_and_counts() {
        let table = test_table();
        let (id, _) = test_pair(&table);

        let (mut tx, reader) = duplex(1024);
        let (writer, mut rx) = duplex(1024);

        let pump = tokio::spawn(pipe(reader, writer, Arc::clone(&table), id));

        tx.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(tx);
        let total = pump.await.unwrap().unwrap();
        assert_eq!(total, 4);

        let entry = table.snapshot().into_iter().find(|e| e.id == id).unwrap();
        assert_eq!(entry.bytes_relayed, 4);
        assert_eq!(entry.state, ConnState::HalfClosedSend);
    }

    #[tokio::test]
    async fn test_pipe_handles_chunks_larger_than_buffer() {
        let table = test_table();
        let (id, _) = test_pair(&table);

        let (mut tx, reader) = duplex(256 * 1024);
        let (writer, mut rx) = duplex(256 * 1024);

        let pump = tokio::spawn(pipe(reader, writer, Arc::clone(&table), id));

        let payload: Vec<u8> = (0..(RELAY_BUFFER_SIZE * 3 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        let expected = payload.clone();

        let writer_task = tokio::spawn(async move {
            tx.write_all(&payload).await.unwrap();
            drop(tx);
        });

        let mut received = Vec::new();
        rx.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        writer_task.await.unwrap();
        let total = pump.await.unwrap().unwrap();
        assert_eq!(total as usize, RELAY_BUFFER_SIZE * 3 + 17);
    }

    #[tokio::test]
    async fn test_pipe_backpressure_small_peer_window() {
        // A tiny peer buffer forces many short writes inside write_all;
        // every byte must still arrive exactly once, in order.
        let table = test_table();
        let (id, _) = test_pair(&table);

        let (mut tx, reader) = duplex(64 * 1024);
        let (writer, mut rx) = duplex(16); // peer accepts 16 bytes at a time

        let pump = tokio::spawn(pipe(reader, writer, Arc::clone(&table), id));

        let payload: Vec<u8> = (0..10_000).map(|i| (i % 241) as u8).collect();
        let expected = payload.clone();
        let writer_task = tokio::spawn(async move {
            tx.write_all(&payload).await.unwrap();
            drop(tx);
        });

        let mut received = Vec::new();
        rx.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        writer_task.await.unwrap();
        assert_eq!(pump.await.unwrap().unwrap(), 10_000);
    }

    #[tokio::test]
    async fn test_relay_bidirectional_over_tcp() {
        let table = test_table();
        let (client_id, remote_id) = test_pair(&table);

        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr().unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        let mut client = TcpStream::connect(addr_a).await.unwrap();
        let (client_side, _) = listener_a.accept().await.unwrap();
        let remote_side = TcpStream::connect(addr_b).await.unwrap();
        let (mut remote, _) = listener_b.accept().await.unwrap();

        let relay_task = tokio::spawn(relay(
            client_side,
            remote_side,
            Arc::clone(&table),
            client_id,
            remote_id,
        ));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        drop(remote);
        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_half_close_keeps_reverse_direction() {
        let table = test_table();
        let (client_id, remote_id) = test_pair(&table);

        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut client = TcpStream::connect(listener_a.local_addr().unwrap())
            .await
            .unwrap();
        let (client_side, _) = listener_a.accept().await.unwrap();
        let remote_side = TcpStream::connect(listener_b.local_addr().unwrap())
            .await
            .unwrap();
        let (mut remote, _) = listener_b.accept().await.unwrap();

        let relay_task = tokio::spawn(relay(
            client_side,
            remote_side,
            Arc::clone(&table),
            client_id,
            remote_id,
        ));

        // Client finishes sending and shuts down its write half.
        client.write_all(b"request").await.unwrap();
        let (mut client_rx, mut client_tx) = client.into_split();
        client_tx.shutdown().await.unwrap();

        // The destination sees the request then EOF.
        let mut buf = [0u8; 7];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");
        let mut probe = [0u8; 1];
        assert_eq!(remote.read(&mut probe).await.unwrap(), 0);

        // The reverse direction still delivers a late response.
        remote.write_all(b"late response").await.unwrap();
        let mut response = [0u8; 13];
        client_rx.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"late response");

        // Only after the destination closes too does the relay finish.
        drop(remote);
        relay_task.await.unwrap();
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|e| e.state == ConnState::Closed));
    }
}
