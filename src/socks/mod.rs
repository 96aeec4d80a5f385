//! SOCKS5 module for Sockspipe
//!
//! Implements the client side of the SOCKS5 protocol (RFC 1928 / RFC 1929):
//! the handshake sockspipe runs against a configured upstream SOCKS5 server
//! on behalf of each accepted connection. Only CONNECT is spoken; BIND and
//! UDP ASSOCIATE are out of scope.

mod client;
mod consts;
mod types;

pub use client::{connect_upstream, send_failure_reply, UpstreamAuth};
pub use consts::*;
pub use types::TargetAddr;

pub(crate) use client::{authenticate, negotiate_method, read_connect_reply, send_connect};
