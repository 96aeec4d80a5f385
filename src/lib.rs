//! # Sockspipe - TCP relay with upstream SOCKS5 forwarding
//!
//! Sockspipe accepts TCP connections and forwards them to a fixed
//! destination, either directly or by negotiating a SOCKS5 CONNECT with an
//! upstream proxy first (RFC 1928, username/password auth per RFC 1929).
//! On Linux it can also sit behind an iptables REDIRECT rule and recover
//! each connection's original destination transparently.
//!
//! ## Features
//!
//! - **Direct or proxied forwarding**: plain TCP to the destination, or via
//!   an upstream SOCKS5 server with optional username/password auth
//! - **Transparent mode**: original destinations recovered with
//!   `SO_ORIGINAL_DST`
//! - **Faithful stream semantics**: independent half-close per direction,
//!   bounded buffering with natural backpressure
//! - **Live diagnostics**: a line on stdin dumps the connection table
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sockspipe::config::load_config;
//! use sockspipe::relay::run_server;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     run_server(config, shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Client -> Sockspipe [-> upstream SOCKS5 server] -> Destination
//! ```
//!
//! Each accepted connection gets a destination-facing peer socket and a
//! dedicated task pumping bytes both ways; the shared connection table
//! tracks every socket's role, state and byte counters.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod relay;
pub mod socks;
pub mod stats;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{RelayError, Socks5Error, Socks5ReplyCode};
pub use relay::run_server;

/// Version of the Sockspipe library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
