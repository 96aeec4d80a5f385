//! Relay module for Sockspipe
//!
//! Owns the connection lifecycle: the accept loop, the per-pair connection
//! table, the bidirectional byte pump, and recovery of transparently
//! redirected destinations.

mod pipe;
mod redir;
mod server;
mod table;

pub use pipe::{pipe, relay, RELAY_BUFFER_SIZE};
pub use redir::original_dst;
pub use server::{run_server, RelayServer};
pub use table::{ConnEntry, ConnId, ConnState, ConnectionTable, Role};
