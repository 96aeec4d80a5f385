//! SOCKS5 upstream client handshake
//!
//! Runs the client side of the SOCKS5 protocol against a configured upstream
//! server: method-selection greeting, optional username/password
//! sub-negotiation, CONNECT request, and reply parsing. Each phase awaits the
//! server's answer before the next request is written, mirroring the wire
//! protocol's lock-step structure.
//!
//! Anything beyond no-auth and username/password (GSSAPI included) is treated
//! as a protocol violation.

use super::consts::*;
use super::types::TargetAddr;
use crate::error::{RelayError, Socks5Error, Socks5ReplyCode};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Username/password credentials for RFC 1929 sub-negotiation
#[derive(Debug, Clone)]
pub struct UpstreamAuth {
    /// Username (at most 255 bytes)
    pub username: String,
    /// Password (at most 255 bytes)
    pub password: String,
}

/// Run the full SOCKS5 handshake on an already-connected upstream stream.
///
/// On success the stream is ready to carry relayed bytes for `dest`.
/// On failure the error carries the SOCKS5 reply code to forward to the
/// inbound client (via [`Socks5Error::reply_code`] or the `io::Error`
/// mapping).
pub async fn connect_upstream<S>(
    stream: &mut S,
    dest: &TargetAddr,
    auth: Option<&UpstreamAuth>,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = negotiate_method(stream, auth.is_some()).await?;
    debug!("Upstream selected auth method {:#04x}", method);

    if method == SOCKS5_AUTH_METHOD_PASSWORD {
        // The server may pick password auth only if we offered it, so
        // credentials are present here.
        let auth = auth.ok_or(Socks5Error::NoAcceptableMethod)?;
        authenticate(stream, auth).await?;
        debug!("Upstream authentication succeeded");
    }

    send_connect(stream, dest).await?;
    read_connect_reply(stream).await?;
    debug!("Upstream CONNECT to {} succeeded", dest);

    Ok(())
}

/// Phase 1/2: send the method-selection greeting and parse the reply.
pub(crate) async fn negotiate_method<S>(
    stream: &mut S,
    offer_password: bool,
) -> Result<u8, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if offer_password {
        &[
            SOCKS5_VERSION,
            2,
            SOCKS5_AUTH_METHOD_NONE,
            SOCKS5_AUTH_METHOD_PASSWORD,
        ]
    } else {
        &[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    };
    stream.write_all(greeting).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;

    if reply[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(reply[0]).into());
    }
    match reply[1] {
        SOCKS5_AUTH_METHOD_NONE => Ok(SOCKS5_AUTH_METHOD_NONE),
        SOCKS5_AUTH_METHOD_PASSWORD if offer_password => Ok(SOCKS5_AUTH_METHOD_PASSWORD),
        _ => Err(Socks5Error::NoAcceptableMethod.into()),
    }
}

/// Phase 3: username/password sub-negotiation (RFC 1929).
pub(crate) async fn authenticate<S>(stream: &mut S, auth: &UpstreamAuth) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = auth.username.as_bytes();
    let pass = auth.password.as_bytes();
    if user.len() > 255 || pass.len() > 255 {
        return Err(Socks5Error::CredentialsTooLong.into());
    }

    let mut request = Vec::with_capacity(3 + user.len() + pass.len());
    request.push(SOCKS5_AUTH_VERSION);
    request.push(user.len() as u8);
    request.extend_from_slice(user);
    request.push(pass.len() as u8);
    request.extend_from_slice(pass);
    stream.write_all(&request).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;

    if reply[0] != SOCKS5_AUTH_VERSION {
        return Err(Socks5Error::UnsupportedVersion(reply[0]).into());
    }
    if reply[1] != 0x00 {
        return Err(Socks5Error::AuthFailed.into());
    }
    Ok(())
}

/// Phase 4 (request): CONNECT with the target address.
pub(crate) async fn send_connect<S>(stream: &mut S, dest: &TargetAddr) -> Result<(), RelayError>
where
    S: AsyncWrite + Unpin,
{
    let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_TCP_CONNECT, SOCKS5_RESERVED];
    dest.write_to(&mut request)?;
    stream.write_all(&request).await?;
    Ok(())
}

/// Phase 4 (reply): parse the CONNECT reply, consuming the variable-length
/// bound address the server reports.
pub(crate) async fn read_connect_reply<S>(stream: &mut S) -> Result<(), RelayError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(header[0]).into());
    }

    // The bound address is read even on failure replies so a fatal code is
    // surfaced as such, not as a short-read IO error.
    match header[3] {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut bound = [0u8; 4 + 2];
            stream.read_exact(&mut bound).await?;
        }
        SOCKS5_ADDR_TYPE_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut bound = vec![0u8; len + 2];
            stream.read_exact(&mut bound).await?;
        }
        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut bound = [0u8; 16 + 2];
            stream.read_exact(&mut bound).await?;
        }
        atyp => return Err(Socks5Error::AddressTypeNotSupported(atyp).into()),
    }

    if header[1] != SOCKS5_REPLY_SUCCEEDED {
        let code =
            Socks5ReplyCode::try_from(header[1]).unwrap_or(Socks5ReplyCode::GeneralFailure);
        return Err(Socks5Error::ReplyFailure(code).into());
    }
    Ok(())
}

/// Best-effort SOCKS5 failure reply toward the inbound client.
///
/// The bound address field carries 0.0.0.0:0; failure replies carry no
/// meaningful bound address. Write errors are the caller's to ignore — the
/// pair is being torn down either way.
pub async fn send_failure_reply<S>(stream: &mut S, code: Socks5ReplyCode) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        SOCKS5_VERSION,
        code.into(),
        SOCKS5_RESERVED,
        SOCKS5_ADDR_TYPE_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    stream.flush().await
}
