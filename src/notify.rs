//! systemd readiness notification.
//!
//! Grounded on `examples/original_source/src/qbouncer/service.py`'s
//! `_sd_notify`: a bare `sd_notify(3)` reimplementation over an
//! abstract-or-path `AF_UNIX SOCK_DGRAM` socket named by `NOTIFY_SOCKET`.
//! `std::os::unix::net` can't address abstract sockets, so the abstract case
//! goes through `libc` directly, same as it would in C.

use tracing::debug;

/// Sends a raw state string (`READY=1`, `WATCHDOG=1`, `STOPPING=1`, ...) to
/// the supervisor named in `NOTIFY_SOCKET`. A no-op when the variable is
/// unset, as when running outside systemd. Failures are logged at debug
/// level only — a supervisor without systemd integration should behave
/// identically to one whose notification socket hiccuped.
pub fn sd_notify(state: &str) {
    let Ok(notify_socket) = std::env::var("NOTIFY_SOCKET") else {
        return;
    };

    if let Err(e) = send(&notify_socket, state) {
        debug!(error = %e, "failed to notify systemd");
    }
}

#[cfg(unix)]
fn send(notify_socket: &str, state: &str) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixDatagram;

    let socket = UnixDatagram::unbound()?;

    // Abstract-namespace sockets are spelled with a leading '@' in the
    // environment variable but need a leading NUL on the wire.
    let address: Vec<u8> = if let Some(abstract_name) = notify_socket.strip_prefix('@') {
        std::iter::once(0u8)
            .chain(abstract_name.bytes())
            .collect()
    } else {
        notify_socket.bytes().collect()
    };

    if address.len() >= std::mem::size_of::<libc::sockaddr_un>() - std::mem::size_of::<libc::sa_family_t>() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "NOTIFY_SOCKET path too long",
        ));
    }

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(address.iter()) {
        *dst = *src as libc::c_char;
    }
    let len = (std::mem::size_of::<libc::sa_family_t>() + address.len()) as libc::socklen_t;

    let ret = unsafe {
        libc::connect(
            socket.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }

    socket.send(state.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn send(_notify_socket: &str, _state: &str) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_notify_socket_is_a_silent_noop() {
        std::env::remove_var("NOTIFY_SOCKET");
        sd_notify("READY=1");
    }

    #[cfg(unix)]
    #[test]
    fn path_socket_receives_message() {
        use std::os::unix::net::UnixDatagram;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        send(path.to_str().unwrap(), "READY=1").unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
    }
}
