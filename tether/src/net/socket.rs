//! TCP listening socket and readiness polling.
//!
//! Readiness is level-triggered `poll(2)` through rustix: every call builds
//! its descriptor set from scratch, so a socket that still holds unread
//! bytes keeps reporting readable until it is drained.

use std::io::{self, ErrorKind};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use rustix::event::{PollFd, PollFlags, poll};
use rustix::io::Errno;

use super::Endpoint;

/// Flags that make a descriptor worth servicing: data, hang-up or error.
///
/// Hang-up and error are included so that a broken peer surfaces as a
/// failed read instead of being silently skipped.
fn readable_flags() -> PollFlags {
    PollFlags::IN | PollFlags::HUP | PollFlags::ERR | PollFlags::NVAL
}

/// Converts an optional timeout into `poll(2)` milliseconds.
///
/// `None` blocks indefinitely. Sub-millisecond timeouts round up so a
/// non-zero wait never degenerates into a busy poll.
fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        Some(d) => {
            let ms = d.as_millis().max(1);
            i32::try_from(ms).unwrap_or(i32::MAX)
        }
    }
}

/// Polls `fds` for readability.
///
/// Returns one flag per descriptor, in order. An interrupted poll reports
/// nothing ready.
///
/// # Errors
///
/// Returns an error if the underlying `poll(2)` call fails.
pub fn poll_readable(fds: &[BorrowedFd<'_>], timeout: Option<Duration>) -> io::Result<Vec<bool>> {
    let mut poll_fds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|fd| PollFd::new(fd, readable_flags()))
        .collect();

    match poll(&mut poll_fds, timeout_millis(timeout)) {
        Ok(_) => {}
        Err(Errno::INTR) => return Ok(vec![false; fds.len()]),
        Err(e) => return Err(e.into()),
    }

    Ok(poll_fds
        .iter()
        .map(|p| p.revents().intersects(readable_flags()))
        .collect())
}

/// Waits until a single descriptor is readable or `timeout` elapses.
///
/// # Errors
///
/// Returns an error if the underlying `poll(2)` call fails.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Option<Duration>) -> io::Result<bool> {
    Ok(poll_readable(&[fd], timeout)?.first().copied().unwrap_or(false))
}

/// A non-blocking TCP listening socket.
///
/// Accepting never blocks the caller beyond the timeout it passes, which
/// lets accept loops check for abort requests between attempts.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local: Endpoint,
}

impl Listener {
    /// Binds a listener to `endpoint`. Port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in use).
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = TcpListener::bind(endpoint.as_socket_addr())?;
        inner.set_nonblocking(true)?;
        let local = Endpoint::from(inner.local_addr()?);
        Ok(Self { inner, local })
    }

    /// Returns the address this listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> Endpoint {
        self.local
    }

    /// Returns the bound port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.local.port()
    }

    /// Attempts to accept, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// The accepted stream is switched to blocking mode.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure other than `WouldBlock`.
    pub fn try_accept(&self) -> io::Result<Option<(TcpStream, Endpoint)>> {
        match self.inner.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                Ok(Some((stream, Endpoint::from(peer))))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Waits up to `timeout` for a pending connection and accepts it.
    ///
    /// # Errors
    ///
    /// Returns an error if polling or accepting fails.
    pub fn accept_timeout(&self, timeout: Duration) -> io::Result<Option<(TcpStream, Endpoint)>> {
        if !wait_readable(self.as_fd(), Some(timeout))? {
            return Ok(None);
        }
        self.try_accept()
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn listener_bind_ephemeral() {
        let listener = Listener::bind(Endpoint::localhost(0)).unwrap();
        assert_ne!(listener.port(), 0);
        assert_eq!(listener.local_addr().port(), listener.port());
    }

    #[test]
    fn try_accept_without_client_is_none() {
        let listener = Listener::bind(Endpoint::localhost(0)).unwrap();
        assert!(listener.try_accept().unwrap().is_none());
    }

    #[test]
    fn accept_timeout_returns_pending_client() {
        let listener = Listener::bind(Endpoint::localhost(0)).unwrap();
        let _client = TcpStream::connect(listener.local_addr().as_socket_addr()).unwrap();

        let (_stream, peer) = listener
            .accept_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("pending connection");
        assert_eq!(peer.ip(), Endpoint::localhost(0).ip());
    }

    #[test]
    fn poll_reports_only_sockets_with_data() {
        let listener = Listener::bind(Endpoint::localhost(0)).unwrap();
        let mut a = TcpStream::connect(listener.local_addr().as_socket_addr()).unwrap();
        let (a_peer, _) = listener
            .accept_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        let _b = TcpStream::connect(listener.local_addr().as_socket_addr()).unwrap();
        let (b_peer, _) = listener
            .accept_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap();

        a.write_all(b"x").unwrap();

        let ready = poll_readable(
            &[a_peer.as_fd(), b_peer.as_fd()],
            Some(Duration::from_secs(2)),
        )
        .unwrap();
        assert_eq!(ready, vec![true, false]);
    }

    #[test]
    fn timeout_conversion() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_secs(u64::MAX))), i32::MAX);
    }
}
