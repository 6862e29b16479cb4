use std::time::Duration;

use crate::net::COMMUNICATOR_VERSION;

/// Timing and protocol knobs for a [`NetworkAccessManager`].
///
/// [`NetworkAccessManager`]: crate::network::NetworkAccessManager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Pause between outbound connect attempts.
    pub connect_retry_interval: Duration,
    /// Slice length of a blocking accept; the abort flag is checked between slices.
    pub accept_poll_interval: Duration,
    /// How long a non-blocking `wait_for_connection` waits for a client.
    pub nonblocking_accept_wait: Duration,
    /// Poll timeout of `network_events_available`.
    pub events_probe_timeout: Duration,
    /// Read timeout applied while a handshake runs. `None` blocks forever.
    pub handshake_timeout: Option<Duration>,
    /// Connect timeout used when a URL carries none.
    pub default_connect_timeout_secs: i64,
    /// Version exchanged before the payload handshake.
    pub communicator_version: u32,
    /// Disable Nagle on every connection.
    pub tcp_nodelay: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_retry_interval: Duration::from_secs(1),
            accept_poll_interval: Duration::from_secs(1),
            nonblocking_accept_wait: Duration::from_millis(10),
            events_probe_timeout: Duration::from_millis(1),
            handshake_timeout: Some(Duration::from_secs(10)),
            default_connect_timeout_secs: 60,
            communicator_version: COMMUNICATOR_VERSION,
            tcp_nodelay: true,
        }
    }
}
