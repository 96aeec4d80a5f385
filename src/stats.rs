//! Operator diagnostics
//!
//! Pressing Enter on the process's stdin logs a snapshot of the connection
//! table. Read-only: dumping never touches the connections themselves.

use crate::relay::ConnectionTable;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/// Dump the connection table for every line arriving on stdin.
///
/// Runs until stdin reaches EOF.
pub async fn stdin_stats(table: Arc<ConnectionTable>) {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Ok(Some(_)) = lines.next_line().await {
        log_snapshot(&table);
    }
}

fn log_snapshot(table: &ConnectionTable) {
    let snapshot = table.snapshot();
    info!("{} active socket(s)", snapshot.len());
    for entry in snapshot {
        info!(
            "  {} {:?} {} peer={} addr={} dest={} bytes={}",
            entry.id,
            entry.role,
            entry.state,
            entry
                .peer
                .map_or_else(|| "-".to_string(), |p| p.to_string()),
            entry
                .peer_addr
                .map_or_else(|| "-".to_string(), |a| a.to_string()),
            entry.destination,
            entry.bytes_relayed,
        );
    }
}
