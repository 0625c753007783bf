//! Socket error classification.

use std::io;

use crate::error::Error;

/// Classify an I/O error into a specific quicmux error type.
pub fn classify_io_error(e: io::Error) -> Error {
    match e.raw_os_error() {
        #[cfg(unix)]
        Some(libc::ENETUNREACH) => Error::NetworkUnreachable(e),
        #[cfg(unix)]
        Some(libc::EHOSTUNREACH) => Error::HostUnreachable(e),
        #[cfg(unix)]
        Some(libc::ECONNREFUSED) => Error::ConnectionRefused,
        #[cfg(unix)]
        Some(libc::EACCES) | Some(libc::EPERM) => Error::PermissionDenied(e),
        _ => Error::Io(e),
    }
}

/// True for errors a UDP socket reports after an ICMP message; the
/// socket itself stays usable.
pub fn is_icmp_error(e: &io::Error) -> bool {
    e.raw_os_error().is_some_and(is_icmp_errno)
}

#[cfg(unix)]
fn is_icmp_errno(code: i32) -> bool {
    code == libc::ECONNREFUSED || code == libc::ENETUNREACH || code == libc::EHOSTUNREACH
}

#[cfg(not(unix))]
fn is_icmp_errno(_code: i32) -> bool {
    false
}

/// Enable IP_RECVERR on a UDP socket for immediate ICMP error delivery.
#[cfg(target_os = "linux")]
pub fn enable_error_queue(socket: &tokio::net::UdpSocket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = socket.as_raw_fd();
    let optval: libc::c_int = 1;

    let local_addr = socket.local_addr()?;
    let (level, optname) = if local_addr.is_ipv4() {
        (libc::IPPROTO_IP, libc::IP_RECVERR)
    } else {
        (libc::IPPROTO_IPV6, libc::IPV6_RECVERR)
    };

    // SAFETY: fd is a valid socket owned by `socket` and optval outlives the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            &optval as *const _ as _,
            std::mem::size_of_val(&optval) as _,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn enable_error_queue(_socket: &tokio::net::UdpSocket) -> io::Result<()> {
    Ok(())
}
