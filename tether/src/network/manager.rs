//! Listening sockets, live controllers and the readiness loop tying them together.
//!
//! The manager owns every controller it creates (an arena keyed by
//! [`ControllerId`]) and every listener (keyed by port). Callers hold ids,
//! and a [`CompositeController`] borrows the manager as its
//! [`ControllerPool`].
//!
//! [`CompositeController`]: crate::control::CompositeController

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, ErrorKind};
use std::net::TcpStream;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use super::config::NetworkConfig;
use super::url::{ConnectionUrl, UrlError};
use crate::control::{Controller, ControllerId, ControllerPool, HandshakeError, RmiStatus, establish};
use crate::net::socket::poll_readable;
use crate::net::{Communicator, Endpoint, Listener, Side, TransportError};
use crate::trace::{debug, error, info, warn};

/// Result of one [`NetworkAccessManager::process_events`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EventStatus {
    /// Nothing to watch, aborted, polling failed, or the last controller closed.
    Failed = -1,
    /// Nothing became ready before the timeout.
    TimedOut = 0,
    /// One socket was serviced.
    Processed = 1,
}

impl EventStatus {
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Lifecycle notification queued by the manager.
#[derive(Debug)]
pub enum NetworkEvent {
    /// A connection passed its handshake and is now a controller.
    ConnectionCreated {
        controller: ControllerId,
        peer: Option<Endpoint>,
    },
    /// A controller was closed and dropped.
    ConnectionClosed { controller: ControllerId },
    /// A client is waiting on a listener; nothing was accepted yet.
    ConnectionPending { port: u16 },
    /// An accepted connection failed its handshake and was closed.
    HandshakeFailed { port: u16, error: HandshakeError },
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("invalid connection url: {0}")]
    Url(#[from] UrlError),
    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("connection attempt aborted")]
    Aborted,
    #[error("connection attempt timed out")]
    TimedOut,
}

/// Cloneable handle that aborts a pending connect or accept from any thread.
#[derive(Debug, Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One descriptor in a poll set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Watched {
    Listener(u16),
    Controller(ControllerId),
}

pub struct NetworkAccessManager {
    config: NetworkConfig,
    controllers: BTreeMap<ControllerId, Controller>,
    listeners: BTreeMap<u16, Listener>,
    next_controller: u64,
    abort: Arc<AtomicBool>,
    events: VecDeque<NetworkEvent>,
    cursor: usize,
}

impl Default for NetworkAccessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NetworkAccessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkAccessManager")
            .field("controllers", &self.controllers.len())
            .field("listeners", &self.listeners.keys().collect::<Vec<_>>())
            .field("pending_events", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl NetworkAccessManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(NetworkConfig::default())
    }

    #[must_use]
    pub fn with_config(config: NetworkConfig) -> Self {
        Self {
            config,
            controllers: BTreeMap::new(),
            listeners: BTreeMap::new(),
            next_controller: 0,
            abort: Arc::new(AtomicBool::new(false)),
            events: VecDeque::new(),
            cursor: 0,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Opens the connection a URL describes.
    ///
    /// `listen=true` waits for a client, anything else connects out. A
    /// malformed URL is logged and yields `None`.
    pub fn new_connection(&mut self, url: &str) -> Option<ControllerId> {
        let parsed = match url.parse::<ConnectionUrl>() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(url, error = %NetworkError::from(e), "rejecting connection url");
                return None;
            }
        };

        if parsed.listen {
            if !parsed.host.is_empty() {
                debug!(host = %parsed.host, "listeners bind all interfaces");
            }
            self.wait_for_connection(
                parsed.port,
                !parsed.multiple,
                &parsed.handshake,
                parsed.nonblocking,
            )
        } else {
            let timeout = parsed
                .timeout
                .unwrap_or(self.config.default_connect_timeout_secs);
            self.connect_to_remote(&parsed.host, parsed.port, &parsed.handshake, timeout)
        }
    }

    /// Connects to `host:port` and runs the client side of the handshake.
    ///
    /// Failed connects are retried every `connect_retry_interval`:
    /// `timeout_secs < 0` retries until aborted, `0` tries once, otherwise
    /// until that many seconds have passed. A failed handshake is never
    /// retried.
    pub fn connect_to_remote(
        &mut self,
        host: &str,
        port: u16,
        handshake: &str,
        timeout_secs: i64,
    ) -> Option<ControllerId> {
        self.abort.store(false, Ordering::SeqCst);
        let result = self.connect_inner(host, port, handshake, timeout_secs);
        self.abort.store(false, Ordering::SeqCst);
        match result {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(host, port, error = %e, "connection to remote failed");
                None
            }
        }
    }

    fn connect_inner(
        &mut self,
        host: &str,
        port: u16,
        handshake: &str,
        timeout_secs: i64,
    ) -> Result<ControllerId, NetworkError> {
        let started = Instant::now();
        let limit = u64::try_from(timeout_secs).ok().map(Duration::from_secs);

        let stream = loop {
            if self.is_aborted() {
                return Err(NetworkError::Aborted);
            }
            match Self::try_connect(host, port) {
                Ok(stream) => break stream,
                Err(e) if timeout_secs == 0 => return Err(e),
                Err(e) => {
                    debug!(host, port, error = %e, "connect attempt failed, retrying");
                    if limit.is_some_and(|limit| started.elapsed() >= limit) {
                        return Err(NetworkError::TimedOut);
                    }
                    thread::sleep(self.config.connect_retry_interval);
                }
            }
        };

        let mut comm = self.open_communicator(stream).map_err(NetworkError::Connect)?;
        if let Err(e) = establish(
            &mut comm,
            Side::Client,
            self.config.communicator_version,
            handshake,
        ) {
            warn!(host, port, error = %e, hint = e.user_message(), "handshake rejected");
            comm.close();
            return Err(e.into());
        }
        comm.set_read_timeout(None).map_err(NetworkError::Connect)?;
        Ok(self.register_controller(Controller::new(comm)))
    }

    fn try_connect(host: &str, port: u16) -> Result<TcpStream, NetworkError> {
        let endpoints = Endpoint::resolve(host, port).map_err(|source| NetworkError::Resolve {
            host: host.to_owned(),
            source,
        })?;
        let mut last = io::Error::new(ErrorKind::NotFound, "host resolved to no addresses");
        for endpoint in endpoints {
            match TcpStream::connect(endpoint.as_socket_addr()) {
                Ok(stream) => return Ok(stream),
                Err(e) => last = e,
            }
        }
        Err(NetworkError::Connect(last))
    }

    /// Wraps a fresh stream, applying socket options and the handshake timeout.
    fn open_communicator(&self, stream: TcpStream) -> io::Result<Communicator> {
        stream.set_nodelay(self.config.tcp_nodelay)?;
        let comm = Communicator::new(stream)?;
        comm.set_read_timeout(self.config.handshake_timeout)?;
        Ok(comm)
    }

    /// Accepts a client on `port` and runs the server side of the handshake.
    ///
    /// A listener is created if none exists. Blocking mode accepts in
    /// `accept_poll_interval` slices until a handshake succeeds or the wait
    /// is aborted; non-blocking mode makes a single bounded attempt. With
    /// `once` the listener is torn down after the first accepted client,
    /// whatever its handshake outcome. A failed handshake ends the wait only
    /// with `once` or `nonblocking`.
    pub fn wait_for_connection(
        &mut self,
        port: u16,
        once: bool,
        handshake: &str,
        nonblocking: bool,
    ) -> Option<ControllerId> {
        self.abort.store(false, Ordering::SeqCst);
        let port = match self.start_listening(port) {
            Ok(port) => port,
            Err(e) => {
                warn!(error = %e, "cannot wait for connection");
                self.abort.store(false, Ordering::SeqCst);
                return None;
            }
        };
        let wait = if nonblocking {
            self.config.nonblocking_accept_wait
        } else {
            self.config.accept_poll_interval
        };

        let mut accepted_any = false;
        let result = loop {
            if self.is_aborted() {
                debug!(port, "wait for connection aborted");
                break None;
            }
            let Some(listener) = self.listeners.get(&port) else {
                break None;
            };
            let (stream, peer) = match listener.accept_timeout(wait) {
                Ok(Some(accepted)) => accepted,
                Ok(None) if nonblocking => break None,
                Ok(None) => continue,
                Err(e) => {
                    warn!(port, error = %e, "accept failed");
                    break None;
                }
            };
            accepted_any = true;

            match self.accept_handshake(stream, handshake) {
                Ok(comm) => break Some(self.register_controller(Controller::new(comm))),
                Err(e) => {
                    warn!(port, %peer, error = %e, "client handshake failed");
                    self.events
                        .push_back(NetworkEvent::HandshakeFailed { port, error: e });
                    if once || nonblocking {
                        break None;
                    }
                }
            }
        };

        if once && accepted_any {
            self.remove_listener(port);
        }
        self.abort.store(false, Ordering::SeqCst);
        result
    }

    fn accept_handshake(
        &self,
        stream: TcpStream,
        handshake: &str,
    ) -> Result<Communicator, HandshakeError> {
        let dropped = |e: io::Error| HandshakeError::ConnectionDropped(TransportError::Io(e));
        let mut comm = self.open_communicator(stream).map_err(dropped)?;
        if let Err(e) = establish(
            &mut comm,
            Side::Server,
            self.config.communicator_version,
            handshake,
        ) {
            comm.close();
            return Err(e);
        }
        comm.set_read_timeout(None).map_err(dropped)?;
        Ok(comm)
    }

    /// Ensures a listener on `port` and returns the bound port.
    ///
    /// Port 0 binds an ephemeral port, registered under its real number.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Listen`] if the port cannot be bound.
    pub fn start_listening(&mut self, port: u16) -> Result<u16, NetworkError> {
        if port != 0 && self.listeners.contains_key(&port) {
            return Ok(port);
        }
        let listener = Listener::bind(Endpoint::any(port))
            .map_err(|source| NetworkError::Listen { port, source })?;
        let bound = listener.port();
        info!(port = bound, "listening");
        self.listeners.insert(bound, listener);
        Ok(bound)
    }

    fn remove_listener(&mut self, port: u16) -> bool {
        let removed = self.listeners.remove(&port).is_some();
        if removed {
            info!(port, "stopped listening");
        }
        removed
    }

    /// Closes (`true`) or reopens (`false`) the listener on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Listen`] if reopening fails.
    pub fn disable_further_connections(
        &mut self,
        port: u16,
        disable: bool,
    ) -> Result<(), NetworkError> {
        if disable {
            self.remove_listener(port);
        } else {
            self.start_listening(port)?;
        }
        Ok(())
    }

    pub fn listening_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.listeners.keys().copied()
    }

    /// Services at most one ready socket.
    ///
    /// Controllers with buffered bytes go first without polling. Otherwise
    /// every listener and controller is polled for up to `timeout` (`None`
    /// waits indefinitely) and ready descriptors are taken round-robin. A
    /// ready listener is only reported as [`NetworkEvent::ConnectionPending`];
    /// a ready controller handles one RMI and is closed if that fails. A
    /// controller whose next frame is still arriving keeps the partial bytes
    /// and is polled again later.
    ///
    /// An abort requested while no connect or accept was pending fails this
    /// call once and is then forgotten.
    pub fn process_events(&mut self, timeout: Option<Duration>) -> EventStatus {
        if self.abort.swap(false, Ordering::SeqCst) {
            debug!("abort requested, skipping event processing");
            return EventStatus::Failed;
        }
        if self.controllers.is_empty() && self.listeners.is_empty() {
            debug!("nothing to watch");
            return EventStatus::Failed;
        }

        if let Some(id) = self.buffered_controller() {
            return self.service_controller(id);
        }

        let (watched, polled) = {
            let (watched, fds) = self.poll_set();
            (watched, poll_readable(&fds, timeout))
        };
        let ready = match polled {
            Ok(ready) => ready,
            Err(e) => {
                error!(error = %e, "poll failed");
                return EventStatus::Failed;
            }
        };

        let count = watched.len();
        let start = self.cursor % count;
        let Some(pick) = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&index| ready[index])
        else {
            return EventStatus::TimedOut;
        };
        self.cursor = pick + 1;

        match watched[pick] {
            Watched::Listener(port) => {
                debug!(port, "connection pending");
                self.events
                    .push_back(NetworkEvent::ConnectionPending { port });
                EventStatus::Processed
            }
            Watched::Controller(id) => self.service_controller(id),
        }
    }

    /// Returns `true` if any watched socket is ready, without reading.
    #[must_use]
    pub fn network_events_available(&self) -> bool {
        if self.buffered_controller().is_some() {
            return true;
        }
        let (_, fds) = self.poll_set();
        if fds.is_empty() {
            return false;
        }
        poll_readable(&fds, Some(self.config.events_probe_timeout))
            .is_ok_and(|ready| ready.contains(&true))
    }

    fn buffered_controller(&self) -> Option<ControllerId> {
        self.controllers
            .iter()
            .find(|(_, c)| c.has_buffered_data())
            .map(|(id, _)| *id)
    }

    fn poll_set(&self) -> (Vec<Watched>, Vec<BorrowedFd<'_>>) {
        let listeners = self
            .listeners
            .iter()
            .map(|(port, l)| (Watched::Listener(*port), l.as_fd()));
        let controllers = self
            .controllers
            .iter()
            .map(|(id, c)| (Watched::Controller(*id), c.as_fd()));
        listeners.chain(controllers).unzip()
    }

    fn service_controller(&mut self, id: ControllerId) -> EventStatus {
        let Some(ctl) = self.controllers.get_mut(&id) else {
            return EventStatus::Failed;
        };
        match ctl.process_rmis(false, 1) {
            RmiStatus::NoError | RmiStatus::Break => EventStatus::Processed,
            RmiStatus::Error => {
                self.close_controller(id);
                if self.controllers.is_empty() {
                    EventStatus::Failed
                } else {
                    EventStatus::Processed
                }
            }
        }
    }

    /// Requests that a pending connect or accept stop at its next check.
    ///
    /// The request ends with that call; it never carries over to later ones.
    pub fn abort_pending_connection(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(Arc::clone(&self.abort))
    }

    fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Adopts a controller built elsewhere.
    pub fn register_controller(&mut self, controller: Controller) -> ControllerId {
        let id = ControllerId(self.next_controller);
        self.next_controller += 1;
        let peer = controller.peer();
        match peer {
            Some(peer) => info!(controller = %id, %peer, "connection established"),
            None => info!(controller = %id, "connection established"),
        }
        self.controllers.insert(id, controller);
        self.events
            .push_back(NetworkEvent::ConnectionCreated { controller: id, peer });
        id
    }

    /// Closes and drops a controller. Returns `false` if it was unknown.
    pub fn close_controller(&mut self, id: ControllerId) -> bool {
        let Some(mut controller) = self.controllers.remove(&id) else {
            return false;
        };
        controller.close();
        info!(controller = %id, "connection closed");
        self.events
            .push_back(NetworkEvent::ConnectionClosed { controller: id });
        true
    }

    #[must_use]
    pub fn controller(&self, id: ControllerId) -> Option<&Controller> {
        self.controllers.get(&id)
    }

    pub fn controller_mut(&mut self, id: ControllerId) -> Option<&mut Controller> {
        self.controllers.get_mut(&id)
    }

    pub fn controller_ids(&self) -> impl Iterator<Item = ControllerId> + '_ {
        self.controllers.keys().copied()
    }

    #[must_use]
    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    /// Takes all queued notifications.
    pub fn drain_events(&mut self) -> impl Iterator<Item = NetworkEvent> + '_ {
        self.events.drain(..)
    }
}

impl ControllerPool for NetworkAccessManager {
    fn controller(&self, id: ControllerId) -> Option<&Controller> {
        self.controllers.get(&id)
    }

    fn controller_mut(&mut self, id: ControllerId) -> Option<&mut Controller> {
        self.controllers.get_mut(&id)
    }
}
