//! Transparent-redirect destination recovery
//!
//! When iptables REDIRECT (or an equivalent NAT rule) delivers a connection
//! to the relay, the address the client actually dialed is only available
//! through the kernel's `SO_ORIGINAL_DST` record on the accepted socket.

use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Recover the original destination of a transparently redirected
/// connection.
#[cfg(target_os = "linux")]
pub fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let level = match stream.local_addr()? {
        SocketAddr::V4(..) => libc::SOL_IP,
        SocketAddr::V6(..) => libc::SOL_IPV6,
    };

    let ((), addr) = unsafe {
        socket2::SockAddr::try_init(|storage, len| {
            let ret = libc::getsockopt(
                fd,
                level,
                libc::SO_ORIGINAL_DST,
                storage as *mut _,
                len,
            );
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        })
    }?;

    addr.as_socket().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "original destination is not an inet address",
        )
    })
}

/// Transparent redirection is Linux-only; config validation rejects it
/// elsewhere, so this path is unreachable in a validated server.
#[cfg(not(target_os = "linux"))]
pub fn original_dst(_stream: &TcpStream) -> io::Result<SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "transparent redirection requires SO_ORIGINAL_DST (Linux only)",
    ))
}
