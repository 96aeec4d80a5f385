//! Connection table
//!
//! An arena of per-socket connection records keyed by a stable,
//! monotonically assigned id. Each relayed client occupies two entries, one
//! for the accepted (inbound) socket and one for the destination-facing
//! (outbound) socket, linked through their `peer` fields. The table is
//! diagnostic state plus the capacity limit; the byte pump itself owns the
//! sockets.

use crate::error::RelayError;
use crate::socks::TargetAddr;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Stable identifier for one socket's table entry.
///
/// Unlike a raw fd, ids are never reused, so a stale id simply misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side of a relay pair a socket is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted client socket
    Inbound,
    /// Destination-facing socket, possibly via the upstream proxy
    Outbound,
}

/// Lifecycle state of one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Outbound TCP connect to the upstream proxy has not completed yet
    AwaitingUpstreamConnect,
    /// Greeting sent, waiting for the upstream's method selection
    AwaitingUpstreamGreetingReply,
    /// Username/password sub-negotiation sent, waiting for the status byte
    AwaitingAuthReply,
    /// CONNECT request sent, waiting for the upstream's reply
    AwaitingConnectReply,
    /// Bytes are being relayed in both directions
    Relaying,
    /// Read direction has ended; this socket can still be written to
    HalfClosedSend,
    /// Write direction has ended; this socket can still be read from
    HalfClosedRecv,
    /// Both directions have ended
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::AwaitingUpstreamConnect => "upstream-connect",
            ConnState::AwaitingUpstreamGreetingReply => "upstream-greeting",
            ConnState::AwaitingAuthReply => "upstream-auth",
            ConnState::AwaitingConnectReply => "upstream-connect-reply",
            ConnState::Relaying => "relaying",
            ConnState::HalfClosedSend => "half-closed-send",
            ConnState::HalfClosedRecv => "half-closed-recv",
            ConnState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One socket's record.
#[derive(Debug, Clone)]
pub struct ConnEntry {
    /// This entry's id
    pub id: ConnId,
    /// Inbound or outbound side of the pair
    pub role: Role,
    /// The other socket of the relay pair; symmetric while both are open
    pub peer: Option<ConnId>,
    /// Lifecycle state
    pub state: ConnState,
    /// Remote address of the socket (client address for inbound; unset for
    /// outbound until the connect completes)
    pub peer_addr: Option<SocketAddr>,
    /// Resolved relay destination
    pub destination: TargetAddr,
    /// Bytes read from this socket and forwarded to its peer
    pub bytes_relayed: u64,
}

/// Arena of connection records with a capacity limit.
///
/// All operations are O(1) except [`snapshot`](ConnectionTable::snapshot).
/// The mutex is only held for short map operations, never across awaits.
pub struct ConnectionTable {
    entries: Mutex<HashMap<ConnId, ConnEntry>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl ConnectionTable {
    /// Create a table holding at most `capacity` socket entries.
    pub fn new(capacity: usize) -> Self {
        ConnectionTable {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    fn alloc_id(&self) -> ConnId {
        ConnId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert the two linked entries for a newly accepted client.
    ///
    /// `initial_state` is [`ConnState::AwaitingUpstreamConnect`] when an
    /// upstream proxy is configured, [`ConnState::Relaying`] otherwise.
    /// Fails with [`RelayError::TableFull`] without touching the table when
    /// the pair would exceed capacity; existing connections are unaffected.
    pub fn insert_pair(
        &self,
        client_addr: SocketAddr,
        destination: TargetAddr,
        initial_state: ConnState,
    ) -> Result<(ConnId, ConnId), RelayError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() + 2 > self.capacity {
            return Err(RelayError::TableFull(entries.len()));
        }

        let inbound_id = self.alloc_id();
        let outbound_id = self.alloc_id();
        entries.insert(
            inbound_id,
            ConnEntry {
                id: inbound_id,
                role: Role::Inbound,
                peer: Some(outbound_id),
                state: initial_state,
                peer_addr: Some(client_addr),
                destination: destination.clone(),
                bytes_relayed: 0,
            },
        );
        entries.insert(
            outbound_id,
            ConnEntry {
                id: outbound_id,
                role: Role::Outbound,
                peer: Some(inbound_id),
                state: initial_state,
                peer_addr: None,
                destination,
                bytes_relayed: 0,
            },
        );
        Ok((inbound_id, outbound_id))
    }

    /// Set the state of one entry. Missing ids (already torn down) are
    /// ignored.
    pub fn set_state(&self, id: ConnId, state: ConnState) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
            entry.state = state;
        }
    }

    /// Record the outbound socket's remote address once its connect
    /// completes.
    pub fn set_peer_addr(&self, id: ConnId, addr: SocketAddr) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
            entry.peer_addr = Some(addr);
        }
    }

    /// Account bytes read from `id` and forwarded to its peer.
    pub fn add_bytes(&self, id: ConnId, n: u64) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
            entry.bytes_relayed += n;
        }
    }

    /// Record that reading from `id` hit EOF: `id` can only be written to
    /// now, and its peer (whose write side was shut down in response) can
    /// only be read from. When the opposite direction had already ended the
    /// pair becomes `Closed`; returns true in that case.
    pub fn mark_read_closed(&self, id: ConnId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let peer = match entries.get_mut(&id) {
            Some(entry) => {
                entry.state = match entry.state {
                    ConnState::HalfClosedRecv | ConnState::Closed => ConnState::Closed,
                    _ => ConnState::HalfClosedSend,
                };
                entry.peer
            }
            None => return false,
        };
        let mut fully_closed = false;
        if let Some(peer_entry) = peer.and_then(|p| entries.get_mut(&p)) {
            peer_entry.state = match peer_entry.state {
                ConnState::HalfClosedSend | ConnState::Closed => {
                    fully_closed = true;
                    ConnState::Closed
                }
                _ => ConnState::HalfClosedRecv,
            };
        }
        if fully_closed {
            if let Some(entry) = entries.get_mut(&id) {
                entry.state = ConnState::Closed;
            }
        }
        fully_closed
    }

    /// Remove an entry and its peer, returning whatever was still present.
    /// Safe to call twice; the second call removes nothing.
    pub fn remove_pair(&self, id: ConnId) -> Vec<ConnEntry> {
        let mut entries = self.entries.lock().unwrap();
        let mut removed = Vec::with_capacity(2);
        if let Some(entry) = entries.remove(&id) {
            if let Some(peer) = entry.peer.and_then(|p| entries.remove(&p)) {
                removed.push(peer);
            }
            removed.push(entry);
        }
        removed
    }

    /// Number of live socket entries (two per relay pair).
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the table has no live entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Copy of all entries for the diagnostic dump, ordered by id.
    pub fn snapshot(&self) -> Vec<ConnEntry> {
        let entries = self.entries.lock().unwrap();
        let mut snapshot: Vec<ConnEntry> = entries.values().cloned().collect();
        snapshot.sort_by_key(|e| e.id.0);
        snapshot
    }
}
