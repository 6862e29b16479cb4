//! Blocking byte-stream communicator over one TCP connection.
//!
//! The communicator owns the stream exclusively. Reads go through an
//! internal buffer, so bytes may already be waiting locally even when the
//! socket itself is not readable; [`Communicator::has_buffered_data`]
//! exposes that to event loops.
//!
//! Event loops read with [`Communicator::try_receive_frame`], which never
//! blocks: bytes of a frame that has not fully arrived are kept until the
//! rest shows up.

use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use thiserror::Error;

use super::frame::{Frame, FrameHeader, FrameKind, HEADER_SIZE};
use super::{Endpoint, socket};
use crate::trace::trace;

/// Bytes pulled from the socket per non-blocking read.
const READ_CHUNK: usize = 16 * 1024;

/// Protocol version exchanged by [`Communicator::exchange_versions`].
///
/// Bumped whenever the framing layer changes incompatibly.
pub const COMMUNICATOR_VERSION: u32 = 1;

/// Which end of a connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The end that initiated the TCP connection.
    Client,
    /// The end that accepted it.
    Server,
}

/// Errors raised by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
    /// The connection was already closed or failed earlier.
    #[error("communicator is not connected")]
    NotConnected,
    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// A frame exceeded the size limit.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    /// A frame header carried an unknown kind.
    #[error("unknown frame kind {0}")]
    UnknownFrameKind(u32),
    /// A data frame arrived for a different tag than the one awaited.
    #[error("expected data tagged {expected}, got {actual}")]
    TagMismatch { expected: u32, actual: u32 },
    /// A socket controller addresses exactly one remote process.
    #[error("no remote process with id {0}")]
    InvalidRemote(i32),
    /// Typed payload (de)serialization failed.
    #[error("payload encoding failed: {0}")]
    Encoding(#[from] postcard::Error),
}

/// Whether `buf` starts with a whole frame.
fn frame_complete(buf: &[u8]) -> bool {
    buf.first_chunk::<HEADER_SIZE>()
        .and_then(|raw| FrameHeader::decode(raw).ok())
        .is_some_and(|header| buf.len() >= HEADER_SIZE + header.len as usize)
}

/// A connected, blocking TCP communicator.
#[derive(Debug)]
pub struct Communicator {
    reader: BufReader<TcpStream>,
    /// Start of a frame read without blocking; always consumed before `reader`.
    partial: Vec<u8>,
    peer: Option<Endpoint>,
    connected: bool,
}

impl Communicator {
    /// Wraps a connected stream. The stream is switched to blocking mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket mode cannot be set.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        let peer = stream.peer_addr().ok().map(Endpoint::from);
        Ok(Self {
            reader: BufReader::new(stream),
            partial: Vec::new(),
            peer,
            connected: true,
        })
    }

    /// Returns the remote address, if known.
    #[must_use]
    pub const fn peer(&self) -> Option<Endpoint> {
        self.peer
    }

    fn fail(&mut self, err: io::Error) -> TransportError {
        self.connected = false;
        if err.kind() == ErrorKind::UnexpectedEof {
            TransportError::Closed
        } else {
            TransportError::Io(err)
        }
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    /// Writes all of `data`, blocking until done.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    pub fn send_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if let Err(e) = self.reader.get_mut().write_all(data) {
            return Err(self.fail(e));
        }
        Ok(())
    }

    /// Fills `buf` completely, blocking until done.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the peer disconnects first.
    pub fn receive_bytes(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let kept = self.partial.len().min(buf.len());
        buf[..kept].copy_from_slice(&self.partial[..kept]);
        self.partial.drain(..kept);
        if let Err(e) = self.reader.read_exact(&mut buf[kept..]) {
            return Err(self.fail(e));
        }
        Ok(())
    }

    /// Sends a big-endian `u32`.
    ///
    /// # Errors
    ///
    /// See [`Communicator::send_bytes`].
    pub fn send_u32(&mut self, value: u32) -> Result<(), TransportError> {
        self.send_bytes(&value.to_be_bytes())
    }

    /// Receives a big-endian `u32`.
    ///
    /// # Errors
    ///
    /// See [`Communicator::receive_bytes`].
    pub fn receive_u32(&mut self) -> Result<u32, TransportError> {
        let mut buf = [0u8; 4];
        self.receive_bytes(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Sends a big-endian `i32`.
    ///
    /// # Errors
    ///
    /// See [`Communicator::send_bytes`].
    pub fn send_i32(&mut self, value: i32) -> Result<(), TransportError> {
        self.send_bytes(&value.to_be_bytes())
    }

    /// Receives a big-endian `i32`.
    ///
    /// # Errors
    ///
    /// See [`Communicator::receive_bytes`].
    pub fn receive_i32(&mut self) -> Result<i32, TransportError> {
        let mut buf = [0u8; 4];
        self.receive_bytes(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Exchanges communicator protocol versions with the peer.
    ///
    /// The client speaks first; the server answers with its own version.
    /// Returns the peer's version; comparing it is up to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer disconnects mid-exchange.
    pub fn exchange_versions(&mut self, side: Side, version: u32) -> Result<u32, TransportError> {
        match side {
            Side::Client => {
                self.send_u32(version)?;
                self.receive_u32()
            }
            Side::Server => {
                let remote = self.receive_u32()?;
                self.send_u32(version)?;
                Ok(remote)
            }
        }
    }

    /// Sends one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is too large or the write fails.
    pub fn send_frame(
        &mut self,
        kind: FrameKind,
        tag: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let header = FrameHeader::for_payload(kind, tag, payload)?;
        trace!(%kind, tag, len = payload.len(), "sending frame");
        self.send_bytes(&header.encode())?;
        self.send_bytes(payload)
    }

    /// Blocks until one complete frame has been read.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer disconnects or sends a malformed header.
    /// A malformed header leaves the stream unusable and marks it closed.
    pub fn receive_frame(&mut self) -> Result<Frame, TransportError> {
        let mut raw = [0u8; HEADER_SIZE];
        self.receive_bytes(&mut raw)?;
        let header = match FrameHeader::decode(&raw) {
            Ok(header) => header,
            Err(e) => {
                self.connected = false;
                return Err(e);
            }
        };
        let mut payload = vec![0u8; header.len as usize];
        self.receive_bytes(&mut payload)?;
        trace!(kind = %header.kind, tag = header.tag, len = header.len, "received frame");
        Ok(Frame {
            kind: header.kind,
            tag: header.tag,
            payload,
        })
    }

    /// Returns the next frame if it has fully arrived, without blocking.
    ///
    /// Whatever the socket holds is read; an incomplete frame is kept and
    /// `Ok(None)` returned until the rest arrives.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the peer disconnected, or the
    /// header/socket error. Either leaves the communicator closed.
    pub fn try_receive_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        self.ensure_connected()?;
        let buffered = self.reader.buffer().len();
        if buffered > 0 {
            self.partial.extend_from_slice(self.reader.buffer());
            self.reader.consume(buffered);
        }
        if let Some(frame) = self.take_partial_frame()? {
            return Ok(Some(frame));
        }
        self.read_available()?;
        self.take_partial_frame()
    }

    /// Appends socket bytes to `partial` without blocking, stopping once a
    /// frame is complete.
    fn read_available(&mut self) -> Result<(), TransportError> {
        let stream = self.reader.get_mut();
        stream.set_nonblocking(true)?;
        let mut chunk = [0u8; READ_CHUNK];
        let result = loop {
            match stream.read(&mut chunk) {
                // A frame completed before the close is still delivered.
                Ok(0) if frame_complete(&self.partial) => break Ok(()),
                Ok(0) => break Err(io::Error::from(ErrorKind::UnexpectedEof)),
                Ok(n) => {
                    self.partial.extend_from_slice(&chunk[..n]);
                    if frame_complete(&self.partial) {
                        break Ok(());
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        let restored = stream.set_nonblocking(false);
        result.and(restored).map_err(|e| self.fail(e))
    }

    /// Splits one complete frame off the front of `partial`.
    fn take_partial_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        let Some(raw) = self.partial.first_chunk::<HEADER_SIZE>() else {
            return Ok(None);
        };
        let header = match FrameHeader::decode(raw) {
            Ok(header) => header,
            Err(e) => {
                self.connected = false;
                return Err(e);
            }
        };
        let end = HEADER_SIZE + header.len as usize;
        if self.partial.len() < end {
            trace!(have = self.partial.len(), need = end, "frame incomplete");
            return Ok(None);
        }
        let payload = self.partial[HEADER_SIZE..end].to_vec();
        self.partial.drain(..end);
        trace!(kind = %header.kind, tag = header.tag, len = header.len, "received frame");
        Ok(Some(Frame {
            kind: header.kind,
            tag: header.tag,
            payload,
        }))
    }

    /// Returns `true` if bytes are buffered locally and a read can make
    /// progress without the socket.
    ///
    /// The start of a frame still waiting for its remaining bytes does not
    /// count.
    #[must_use]
    pub fn has_buffered_data(&self) -> bool {
        !self.reader.buffer().is_empty() || frame_complete(&self.partial)
    }

    /// Returns `true` once a read would not block, waiting up to `timeout`.
    ///
    /// `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// Returns an error if polling fails.
    pub fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        if self.has_buffered_data() {
            return Ok(true);
        }
        socket::wait_readable(self.as_fd(), timeout)
    }

    /// Probes whether the connection is still usable.
    ///
    /// A peer that has shut down its side reads as disconnected even before
    /// anything tried to read from it.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        if !self.connected {
            return false;
        }
        if self.has_buffered_data() {
            return true;
        }
        let stream = self.reader.get_ref();
        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0u8; 1];
        let alive = match stream.peek(&mut probe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => e.kind() == ErrorKind::WouldBlock,
        };
        stream.set_nonblocking(false).is_ok() && alive
    }

    /// Sets the read timeout used by blocking receives.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket option cannot be set.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.reader.get_ref().set_read_timeout(timeout)
    }

    /// Shuts the connection down in both directions.
    pub fn close(&mut self) {
        if self.connected {
            let _ = self.reader.get_ref().shutdown(Shutdown::Both);
            self.connected = false;
        }
    }

    /// Pulls readable socket bytes into the read buffer.
    #[cfg(test)]
    pub(crate) fn fill_buffer(&mut self) -> io::Result<usize> {
        Ok(self.reader.fill_buf()?.len())
    }
}

impl AsFd for Communicator {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.get_ref().as_fd()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// Returns two connected communicators over loopback.
    pub(crate) fn communicator_pair() -> (Communicator, Communicator) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (
            Communicator::new(client).unwrap(),
            Communicator::new(server).unwrap(),
        )
    }

    #[test]
    fn integers_are_network_order() {
        let (mut a, mut b) = communicator_pair();
        a.send_u32(0x0a0b_0c0d).unwrap();
        let mut raw = [0u8; 4];
        b.receive_bytes(&mut raw).unwrap();
        assert_eq!(raw, [0x0a, 0x0b, 0x0c, 0x0d]);

        a.send_i32(-5).unwrap();
        assert_eq!(b.receive_i32().unwrap(), -5);
    }

    #[test]
    fn frames_cross_the_wire() {
        let (mut a, mut b) = communicator_pair();
        a.send_frame(FrameKind::Data, 42, b"pixels").unwrap();
        a.send_frame(FrameKind::Rmi, 3, &[]).unwrap();

        let first = b.receive_frame().unwrap();
        assert_eq!(first.kind, FrameKind::Data);
        assert_eq!(first.tag, 42);
        assert_eq!(first.payload, b"pixels");

        let second = b.receive_frame().unwrap();
        assert_eq!(second.kind, FrameKind::Rmi);
        assert!(second.payload.is_empty());
    }

    #[test]
    fn version_exchange_reports_peer_version() {
        let (mut client, mut server) = communicator_pair();
        let handle = thread::spawn(move || server.exchange_versions(Side::Server, 7).unwrap());
        assert_eq!(client.exchange_versions(Side::Client, 3).unwrap(), 7);
        assert_eq!(handle.join().unwrap(), 3);
    }

    #[test]
    fn peer_close_is_detected() {
        let (mut a, mut b) = communicator_pair();
        assert!(b.is_connected());
        a.close();
        assert!(b.wait_readable(Some(Duration::from_secs(2))).unwrap());
        assert!(!b.is_connected());
        assert!(matches!(b.receive_u32(), Err(TransportError::Closed)));
        assert!(matches!(b.receive_u32(), Err(TransportError::NotConnected)));
    }

    #[test]
    fn nonblocking_frame_read_keeps_partial_bytes() {
        let (mut a, mut b) = communicator_pair();
        assert!(b.try_receive_frame().unwrap().is_none());

        let header = FrameHeader::for_payload(FrameKind::Rmi, 5, b"hello").unwrap();
        a.send_bytes(&header.encode()).unwrap();
        a.send_bytes(b"he").unwrap();
        assert!(b.wait_readable(Some(Duration::from_secs(2))).unwrap());
        assert!(b.try_receive_frame().unwrap().is_none());
        assert!(!b.has_buffered_data());

        a.send_bytes(b"llo").unwrap();
        a.close();
        assert!(b.wait_readable(Some(Duration::from_secs(2))).unwrap());
        let frame = b.try_receive_frame().unwrap().unwrap();
        assert_eq!((frame.kind, frame.tag), (FrameKind::Rmi, 5));
        assert_eq!(frame.payload, b"hello");
        assert!(b.wait_readable(Some(Duration::from_secs(2))).unwrap());
        assert!(matches!(b.try_receive_frame(), Err(TransportError::Closed)));
    }

    #[test]
    fn buffered_bytes_are_visible() {
        let (mut a, mut b) = communicator_pair();
        a.send_u32(1).unwrap();
        a.send_u32(2).unwrap();
        assert!(b.wait_readable(Some(Duration::from_secs(2))).unwrap());
        assert!(b.receive_u32().unwrap() == 1);
        // The first read pulled both integers into the buffer.
        if b.has_buffered_data() {
            assert_eq!(b.receive_u32().unwrap(), 2);
        } else {
            assert!(b.fill_buffer().unwrap() > 0);
            assert_eq!(b.receive_u32().unwrap(), 2);
        }
    }
}
