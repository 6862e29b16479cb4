//! One validated connection plus RMI dispatch.

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;

use minstant::Instant;

use crate::control::types::{
    ControllerId, ObserverId, REMOTE_PROCESS_ID, RmiCall, RmiCallback, RmiStatus, RmiTag,
};
use crate::net::frame::encode_message;
use crate::net::{Communicator, Endpoint, Frame, FrameKind, TransportError, Wire};
use crate::trace::{debug, trace, warn};

struct Registration {
    id: ObserverId,
    tag: RmiTag,
    callback: RmiCallback,
}

/// Pairs a [`Communicator`] with RMI registration and dispatch.
///
/// Created once a connection has passed its handshake. A controller never
/// tears itself down: failures are reported and the owner decides.
pub struct Controller {
    comm: Communicator,
    registrations: Vec<Registration>,
    next_observer: u64,
    last_interaction: Option<Instant>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("peer", &self.comm.peer())
            .field("registrations", &self.registrations.len())
            .finish_non_exhaustive()
    }
}

impl Controller {
    #[must_use]
    pub const fn new(comm: Communicator) -> Self {
        Self {
            comm,
            registrations: Vec::new(),
            next_observer: 0,
            last_interaction: None,
        }
    }

    #[must_use]
    pub const fn communicator(&self) -> &Communicator {
        &self.comm
    }

    pub const fn communicator_mut(&mut self) -> &mut Communicator {
        &mut self.comm
    }

    #[must_use]
    pub const fn peer(&self) -> Option<Endpoint> {
        self.comm.peer()
    }

    /// Registers `callback` for RMIs tagged `tag`.
    ///
    /// Callbacks sharing a tag run in registration order.
    pub fn add_rmi_callback<F>(&mut self, tag: RmiTag, callback: F) -> ObserverId
    where
        F: Fn(&RmiCall<'_>) + Send + Sync + 'static,
    {
        self.add_shared_rmi_callback(tag, Arc::new(callback))
    }

    /// Registers an already shared callback.
    pub fn add_shared_rmi_callback(&mut self, tag: RmiTag, callback: RmiCallback) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.registrations.push(Registration { id, tag, callback });
        trace!(%id, %tag, "rmi callback registered");
        id
    }

    /// Removes one registration. Returns `false` if it was already gone.
    pub fn remove_rmi_callback(&mut self, id: ObserverId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.id != id);
        self.registrations.len() != before
    }

    /// Removes every registration under `tag` and returns how many there were.
    pub fn remove_all_rmi_callbacks(&mut self, tag: RmiTag) -> usize {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.tag != tag);
        before - self.registrations.len()
    }

    /// Number of live registrations.
    #[must_use]
    pub fn rmi_callback_count(&self) -> usize {
        self.registrations.len()
    }

    fn read_frame(&mut self) -> Result<Frame, TransportError> {
        self.last_interaction = Some(Instant::now());
        self.comm.receive_frame()
    }

    fn try_read_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        let frame = self.comm.try_receive_frame()?;
        if frame.is_some() {
            self.last_interaction = Some(Instant::now());
        }
        Ok(frame)
    }

    fn dispatch(&self, frame: &Frame) {
        let tag = RmiTag::new(frame.tag);
        let call = RmiCall {
            tag,
            remote_id: REMOTE_PROCESS_ID,
            data: &frame.payload,
        };
        let mut invoked = 0usize;
        for registration in self.registrations.iter().filter(|r| r.tag == tag) {
            (registration.callback)(&call);
            invoked += 1;
        }
        if invoked == 0 {
            debug!(%tag, "rmi with no registered callback");
        }
    }

    /// Reads and dispatches RMIs.
    ///
    /// With `blocking == false` the call returns [`RmiStatus::NoError`] as
    /// soon as no complete frame is available; a frame still arriving is
    /// kept for the next call. `count == 0` keeps going until a break or an
    /// error; otherwise at most `count` messages are handled.
    pub fn process_rmis(&mut self, blocking: bool, count: usize) -> RmiStatus {
        let mut handled = 0usize;
        loop {
            if count != 0 && handled >= count {
                return RmiStatus::NoError;
            }
            let read = if blocking {
                self.read_frame().map(Some)
            } else {
                self.try_read_frame()
            };
            let frame = match read {
                Ok(Some(frame)) => frame,
                Ok(None) => return RmiStatus::NoError,
                Err(e) => {
                    warn!(error = %e, "reading rmi failed");
                    return RmiStatus::Error;
                }
            };
            match frame.kind {
                FrameKind::Rmi if frame.tag == RmiTag::BREAK.as_u32() => {
                    debug!("break rmi received");
                    return RmiStatus::Break;
                }
                FrameKind::Rmi => self.dispatch(&frame),
                FrameKind::Data => {
                    warn!(tag = frame.tag, "data frame arrived while processing rmis");
                    return RmiStatus::Error;
                }
            }
            handled += 1;
        }
    }

    /// Sends an RMI to `remote_id`. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidRemote`] for any id other than
    /// [`REMOTE_PROCESS_ID`], or the write error.
    pub fn trigger_rmi(
        &mut self,
        remote_id: i32,
        data: &[u8],
        tag: RmiTag,
    ) -> Result<(), TransportError> {
        if remote_id != REMOTE_PROCESS_ID {
            return Err(TransportError::InvalidRemote(remote_id));
        }
        self.comm.send_frame(FrameKind::Rmi, tag.as_u32(), data)
    }

    /// Serializes `msg` and sends it as an RMI.
    ///
    /// # Errors
    ///
    /// See [`Controller::trigger_rmi`]; serialization failures too.
    pub fn trigger_rmi_message<T: Wire>(
        &mut self,
        remote_id: i32,
        msg: &T,
        tag: RmiTag,
    ) -> Result<(), TransportError> {
        let bytes = encode_message(msg)?;
        self.trigger_rmi(remote_id, &bytes, tag)
    }

    /// Makes the peer's `process_rmis` return [`RmiStatus::Break`].
    ///
    /// # Errors
    ///
    /// Returns the write error.
    pub fn trigger_break_rmis(&mut self) -> Result<(), TransportError> {
        self.trigger_rmi(REMOTE_PROCESS_ID, &[], RmiTag::BREAK)
    }

    /// Sends a tagged data frame.
    ///
    /// # Errors
    ///
    /// Returns the write error.
    pub fn send(&mut self, data: &[u8], tag: u32) -> Result<(), TransportError> {
        self.comm.send_frame(FrameKind::Data, tag, data)
    }

    /// Blocks until a data frame tagged `tag` arrives.
    ///
    /// RMIs that arrive first are dispatched on the way; break RMIs are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::TagMismatch`] if a data frame with another
    /// tag arrives, or the read error.
    pub fn receive(&mut self, tag: u32) -> Result<Vec<u8>, TransportError> {
        loop {
            let frame = self.read_frame()?;
            match frame.kind {
                FrameKind::Data if frame.tag == tag => return Ok(frame.payload),
                FrameKind::Data => {
                    return Err(TransportError::TagMismatch {
                        expected: tag,
                        actual: frame.tag,
                    });
                }
                FrameKind::Rmi if frame.tag == RmiTag::BREAK.as_u32() => {
                    debug!(tag, "dropping break rmi while receiving");
                }
                FrameKind::Rmi => self.dispatch(&frame),
            }
        }
    }

    /// When this controller last started reading an inbound frame.
    #[must_use]
    pub const fn last_interaction(&self) -> Option<Instant> {
        self.last_interaction
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.comm.is_connected()
    }

    #[must_use]
    pub fn has_buffered_data(&self) -> bool {
        self.comm.has_buffered_data()
    }

    /// Shuts the connection down.
    pub fn close(&mut self) {
        self.comm.close();
    }
}

impl AsFd for Controller {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.comm.as_fd()
    }
}

/// Owner of controllers, addressed by [`ControllerId`].
pub trait ControllerPool {
    fn controller(&self, id: ControllerId) -> Option<&Controller>;
    fn controller_mut(&mut self, id: ControllerId) -> Option<&mut Controller>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::test_support::controller_pair;
    use crate::net::frame::FrameHeader;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const TAG_A: RmiTag = RmiTag::new(10);
    const TAG_B: RmiTag = RmiTag::new(11);

    #[test]
    fn callbacks_sharing_a_tag_run_in_order() {
        let (mut client, mut server) = controller_pair();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let log = Arc::clone(&log);
            server.add_rmi_callback(TAG_A, move |call| {
                log.lock().unwrap().push((name, call.data.to_vec(), call.remote_id));
            });
        }

        client.trigger_rmi(REMOTE_PROCESS_ID, b"go", TAG_A).unwrap();
        assert_eq!(server.process_rmis(true, 1), RmiStatus::NoError);

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                ("first", b"go".to_vec(), REMOTE_PROCESS_ID),
                ("second", b"go".to_vec(), REMOTE_PROCESS_ID),
            ]
        );
    }

    #[test]
    fn removal_is_idempotent() {
        let (_client, mut server) = controller_pair();
        let a = server.add_rmi_callback(TAG_A, |_| {});
        server.add_rmi_callback(TAG_A, |_| {});
        server.add_rmi_callback(TAG_B, |_| {});

        assert!(server.remove_rmi_callback(a));
        assert!(!server.remove_rmi_callback(a));
        assert_eq!(server.remove_all_rmi_callbacks(TAG_A), 1);
        assert_eq!(server.remove_all_rmi_callbacks(TAG_A), 0);
        assert_eq!(server.rmi_callback_count(), 1);
    }

    #[test]
    fn nonblocking_returns_when_idle() {
        let (_client, mut server) = controller_pair();
        assert_eq!(server.process_rmis(false, 0), RmiStatus::NoError);
        assert!(server.last_interaction().is_none());
    }

    #[test]
    fn count_limits_dispatch() {
        let (mut client, mut server) = controller_pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        server.add_rmi_callback(TAG_A, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..3 {
            client.trigger_rmi(REMOTE_PROCESS_ID, &[], TAG_A).unwrap();
        }
        assert_eq!(server.process_rmis(true, 2), RmiStatus::NoError);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(server.process_rmis(true, 1), RmiStatus::NoError);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(server.last_interaction().is_some());
    }

    #[test]
    fn break_ends_unbounded_processing() {
        let (mut client, mut server) = controller_pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        server.add_rmi_callback(TAG_A, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.trigger_rmi(REMOTE_PROCESS_ID, &[], TAG_A).unwrap();
        client.trigger_break_rmis().unwrap();
        assert_eq!(server.process_rmis(true, 0), RmiStatus::Break);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn vanished_peer_is_an_error_not_a_panic() {
        let (mut client, mut server) = controller_pair();
        client.close();
        assert_eq!(server.process_rmis(true, 1), RmiStatus::Error);
        assert_eq!(server.process_rmis(false, 1), RmiStatus::Error);
    }

    #[test]
    fn only_the_single_peer_is_addressable() {
        let (mut client, _server) = controller_pair();
        assert!(matches!(
            client.trigger_rmi(2, &[], TAG_A),
            Err(TransportError::InvalidRemote(2))
        ));
    }

    #[test]
    fn receive_dispatches_interleaved_rmis() {
        let (mut client, mut server) = controller_pair();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        server.add_rmi_callback(TAG_B, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.trigger_rmi(REMOTE_PROCESS_ID, &[], TAG_B).unwrap();
        client.send(b"image", 77).unwrap();
        assert_eq!(server.receive(77).unwrap(), b"image");
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        client.send(b"other", 5).unwrap();
        assert!(matches!(
            server.receive(77),
            Err(TransportError::TagMismatch {
                expected: 77,
                actual: 5
            })
        ));
    }

    #[test]
    fn typed_rmi_arguments() {
        let (mut client, mut server) = controller_pair();
        let got = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&got);
        server.add_rmi_callback(TAG_A, move |call| {
            *slot.lock().unwrap() = Some(call.decode::<(u32, String)>().unwrap());
        });

        client
            .trigger_rmi_message(REMOTE_PROCESS_ID, &(3u32, "view".to_owned()), TAG_A)
            .unwrap();
        assert_eq!(server.process_rmis(true, 1), RmiStatus::NoError);
        assert_eq!(*got.lock().unwrap(), Some((3, "view".to_owned())));
    }

    #[test]
    fn frame_split_across_reads_waits_for_the_rest() {
        let (mut client, mut server) = controller_pair();
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        server.add_rmi_callback(TAG_A, move |call| {
            sink.lock().unwrap().push(call.data.to_vec());
        });

        let payload = b"0123456789";
        let header = FrameHeader::for_payload(FrameKind::Rmi, TAG_A.as_u32(), payload).unwrap();
        let wire = client.communicator_mut();
        wire.send_bytes(&header.encode()).unwrap();
        wire.send_bytes(&payload[..2]).unwrap();

        let comm = server.communicator();
        assert!(comm.wait_readable(Some(Duration::from_secs(2))).unwrap());
        assert_eq!(server.process_rmis(false, 1), RmiStatus::NoError);
        assert!(got.lock().unwrap().is_empty());
        assert!(server.last_interaction().is_none());
        assert!(!server.has_buffered_data());

        client.communicator_mut().send_bytes(&payload[2..]).unwrap();
        assert!(
            server
                .communicator()
                .wait_readable(Some(Duration::from_secs(2)))
                .unwrap()
        );
        assert_eq!(server.process_rmis(false, 1), RmiStatus::NoError);
        assert_eq!(*got.lock().unwrap(), vec![payload.to_vec()]);
        assert!(server.last_interaction().is_some());
    }

    #[test]
    fn blocking_receive_picks_up_a_partial_frame() {
        let (mut client, mut server) = controller_pair();
        let header = FrameHeader::for_payload(FrameKind::Data, 9, b"abcd").unwrap();
        client.communicator_mut().send_bytes(&header.encode()).unwrap();
        client.communicator_mut().send_bytes(b"ab").unwrap();

        assert!(
            server
                .communicator()
                .wait_readable(Some(Duration::from_secs(2)))
                .unwrap()
        );
        assert_eq!(server.process_rmis(false, 1), RmiStatus::NoError);

        client.communicator_mut().send_bytes(b"cd").unwrap();
        assert_eq!(server.receive(9).unwrap(), b"abcd");
    }
}
