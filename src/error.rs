//! Error types for Sockspipe
//!
//! This module defines all custom error types used throughout the application.

use std::io;
use thiserror::Error;

/// Main error type for Sockspipe operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// SOCKS5 protocol error
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    /// Connection table is at capacity
    #[error("Connection table full ({0} connections)")]
    TableFull(usize),
}

/// SOCKS5 specific errors raised by the upstream handshake
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// Unsupported SOCKS version in a server reply
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// Server selected a method we did not offer
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Username/password sub-negotiation rejected
    #[error("Authentication failed")]
    AuthFailed,

    /// Server answered CONNECT with a non-zero reply code
    #[error("Connect rejected by upstream: {0:?}")]
    ReplyFailure(Socks5ReplyCode),

    /// Address type not supported
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// Invalid address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Username or password exceeds the 255-byte wire limit
    #[error("Credentials too long for SOCKS5 sub-negotiation")]
    CredentialsTooLong,

    /// Target domain name exceeds the 255-byte wire limit
    #[error("Domain name too long: {0}")]
    DomainTooLong(String),

    /// Reply code outside the RFC 1928 range
    #[error("Unknown SOCKS5 reply code: {0:#04x}")]
    UnknownReplyCode(u8),
}

impl Socks5Error {
    /// Nearest SOCKS5 reply code for this error, used when forwarding a
    /// failure reply to the inbound client.
    pub fn reply_code(&self) -> Socks5ReplyCode {
        match self {
            Socks5Error::ReplyFailure(code) => *code,
            Socks5Error::AuthFailed => Socks5ReplyCode::ConnectionNotAllowed,
            Socks5Error::AddressTypeNotSupported(_) => Socks5ReplyCode::AddressTypeNotSupported,
            Socks5Error::DomainTooLong(_) => Socks5ReplyCode::AddressTypeNotSupported,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for Socks5ReplyCode {
    type Error = Socks5Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Socks5ReplyCode::Succeeded),
            0x01 => Ok(Socks5ReplyCode::GeneralFailure),
            0x02 => Ok(Socks5ReplyCode::ConnectionNotAllowed),
            0x03 => Ok(Socks5ReplyCode::NetworkUnreachable),
            0x04 => Ok(Socks5ReplyCode::HostUnreachable),
            0x05 => Ok(Socks5ReplyCode::ConnectionRefused),
            0x06 => Ok(Socks5ReplyCode::TtlExpired),
            0x07 => Ok(Socks5ReplyCode::CommandNotSupported),
            0x08 => Ok(Socks5ReplyCode::AddressTypeNotSupported),
            _ => Err(Socks5Error::UnknownReplyCode(value)),
        }
    }
}

impl From<&io::Error> for Socks5ReplyCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Socks5ReplyCode::ConnectionRefused,
            io::ErrorKind::TimedOut => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::AddrNotAvailable => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::PermissionDenied => Socks5ReplyCode::ConnectionNotAllowed,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}
