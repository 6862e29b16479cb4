//! Connection handshake: communicator version check, then payload negotiation.
//!
//! ```text
//! Client                                   Server
//!   │  comm version (u32)                    │
//!   │───────────────────────────────────────>│
//!   │                    comm version (u32)  │
//!   │<───────────────────────────────────────│
//!   │  payload len (u32) + payload bytes     │
//!   │───────────────────────────────────────>│
//!   │             [compare with local payload]
//!   │                      error code (i32)  │
//!   │<───────────────────────────────────────│
//! ```
//!
//! A communicator version mismatch ends the exchange before any payload is
//! sent. Neither side retries.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::net::{Communicator, Side, TransportError};
use crate::trace::{debug, warn};

/// Largest payload a server will read; longer ones are rejected unread.
pub const MAX_HANDSHAKE_LEN: usize = 4096;

const CONNECT_ID_FIELD: &str = "connect_id.";
const BACKEND_FIELD: &str = "renderingbackend.";

/// Structured handshake payload.
///
/// Text form: `<product>-<major>.<minor>.(connect_id.<id>.)?renderingbackend.<backend>`.
/// Version and id are kept as the digit strings the peer sent, so `1.0` and
/// `1.00` are different versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandshakePayload {
    product: String,
    version: String,
    connect_id: Option<String>,
    backend: String,
}

impl HandshakePayload {
    /// Creates a payload without a connection id.
    #[must_use]
    pub fn new(product: impl Into<String>, major: u32, minor: u32, backend: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            version: format!("{major}.{minor}"),
            connect_id: None,
            backend: backend.into(),
        }
    }

    /// Sets the connection id that partitions sessions sharing one port.
    #[must_use]
    pub fn with_connect_id(mut self, id: u64) -> Self {
        self.connect_id = Some(id.to_string());
        self
    }

    #[must_use]
    pub fn product(&self) -> &str {
        &self.product
    }

    /// Returns `major.minor` as sent.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn connect_id(&self) -> Option<&str> {
        self.connect_id.as_deref()
    }

    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }
}

impl fmt::Display for HandshakePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}.", self.product, self.version)?;
        if let Some(id) = &self.connect_id {
            write!(f, "{CONNECT_ID_FIELD}{id}.")?;
        }
        write!(f, "{BACKEND_FIELD}{}", self.backend)
    }
}

/// Why a payload string failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PayloadParseError {
    #[error("payload must be ASCII without NUL bytes")]
    InvalidCharacters,
    #[error("missing product name")]
    MissingProduct,
    #[error("malformed major.minor version")]
    InvalidVersion,
    #[error("malformed connect_id field")]
    InvalidConnectId,
    #[error("missing renderingbackend field")]
    MissingBackend,
}

fn is_digits(field: &str) -> bool {
    !field.is_empty() && field.bytes().all(|b| b.is_ascii_digit())
}

/// Fields after the product separator: version, connect id, backend.
type Tail<'a> = (&'a str, Option<&'a str>, &'a str);

/// Parses everything after the product separator.
fn parse_tail(tail: &str) -> Result<Tail<'_>, PayloadParseError> {
    let (major, rest) = tail
        .split_once('.')
        .ok_or(PayloadParseError::InvalidVersion)?;
    let (minor, rest) = rest
        .split_once('.')
        .ok_or(PayloadParseError::InvalidVersion)?;
    if !is_digits(major) || !is_digits(minor) {
        return Err(PayloadParseError::InvalidVersion);
    }
    let version = &tail[..major.len() + 1 + minor.len()];

    let (connect_id, rest) = match rest.strip_prefix(CONNECT_ID_FIELD) {
        Some(field) => {
            let (digits, rest) = field
                .split_once('.')
                .ok_or(PayloadParseError::InvalidConnectId)?;
            if !is_digits(digits) {
                return Err(PayloadParseError::InvalidConnectId);
            }
            (Some(digits), rest)
        }
        None => (None, rest),
    };

    match rest.strip_prefix(BACKEND_FIELD) {
        Some(backend) if !backend.is_empty() => Ok((version, connect_id, backend)),
        _ => Err(PayloadParseError::MissingBackend),
    }
}

impl FromStr for HandshakePayload {
    type Err = PayloadParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.is_ascii() || s.contains('\0') {
            return Err(PayloadParseError::InvalidCharacters);
        }

        // Product names may contain '-', so try every separator in turn.
        let mut last_err = PayloadParseError::MissingProduct;
        for (idx, _) in s.match_indices('-') {
            if idx == 0 {
                continue;
            }
            match parse_tail(&s[idx + 1..]) {
                Ok((version, connect_id, backend)) => {
                    return Ok(Self {
                        product: s[..idx].to_owned(),
                        version: version.to_owned(),
                        connect_id: connect_id.map(str::to_owned),
                        backend: backend.to_owned(),
                    });
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

/// Handshake failure, classified so callers can explain it.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The framing layers speak different protocol versions.
    #[error("socket communicator protocol versions differ")]
    SocketCommunicatorDifferent,
    /// Product versions (major.minor) differ.
    #[error("client and server versions differ")]
    DifferentVersions,
    /// Rendering backends differ.
    #[error("client and server rendering backends differ")]
    DifferentRenderingBackends,
    /// Connection ids differ (or only one side has one).
    #[error("client and server connection ids differ")]
    DifferentConnectionIds,
    /// The peer's payload was not understood at all.
    #[error("unrecognized handshake from peer")]
    Unknown,
    /// The connection dropped before the exchange completed.
    #[error("connection dropped during handshake: {0}")]
    ConnectionDropped(#[source] TransportError),
}

impl HandshakeError {
    /// Code sent to the client, or `None` for failures never put on the wire.
    #[must_use]
    pub const fn wire_code(&self) -> Option<i32> {
        match self {
            Self::SocketCommunicatorDifferent => Some(1),
            Self::DifferentVersions => Some(2),
            Self::DifferentRenderingBackends => Some(3),
            Self::DifferentConnectionIds => Some(4),
            Self::Unknown => Some(5),
            Self::ConnectionDropped(_) => None,
        }
    }

    /// Interprets a code received from the server.
    ///
    /// # Errors
    ///
    /// Every non-zero code maps to its error; unknown codes map to
    /// [`HandshakeError::Unknown`].
    pub const fn from_wire_code(code: i32) -> Result<(), Self> {
        match code {
            0 => Ok(()),
            1 => Err(Self::SocketCommunicatorDifferent),
            2 => Err(Self::DifferentVersions),
            3 => Err(Self::DifferentRenderingBackends),
            4 => Err(Self::DifferentConnectionIds),
            _ => Err(Self::Unknown),
        }
    }

    /// A sentence suitable for showing to whoever is trying to connect.
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::SocketCommunicatorDifferent => {
                "The peer uses an incompatible transport protocol. Update both sides to the same release."
            }
            Self::DifferentVersions => {
                "Client and server versions do not match. Connect with a client built from the same release as the server."
            }
            Self::DifferentRenderingBackends => {
                "The server was started with a different rendering backend. Check the server's configuration."
            }
            Self::DifferentConnectionIds => {
                "The connection id does not match the server's. Check the session token you were given."
            }
            Self::Unknown => {
                "The peer is not a compatible server. Check the host and port."
            }
            Self::ConnectionDropped(_) => {
                "The connection was lost before the handshake finished. Try again."
            }
        }
    }
}

/// Compares a local and a remote payload string.
///
/// Identical strings always match. Otherwise both must parse, and the first
/// differing field in order version, connection id, backend decides the
/// error. Anything else (unparseable, or only the product differs) is
/// [`HandshakeError::Unknown`].
///
/// # Errors
///
/// Returns the classified mismatch.
pub fn compare_payloads(local: &str, remote: &str) -> Result<(), HandshakeError> {
    if local == remote {
        return Ok(());
    }
    let (Ok(local), Ok(remote)) = (
        local.parse::<HandshakePayload>(),
        remote.parse::<HandshakePayload>(),
    ) else {
        return Err(HandshakeError::Unknown);
    };

    if local.version() != remote.version() {
        Err(HandshakeError::DifferentVersions)
    } else if local.connect_id() != remote.connect_id() {
        Err(HandshakeError::DifferentConnectionIds)
    } else if local.backend() != remote.backend() {
        Err(HandshakeError::DifferentRenderingBackends)
    } else {
        Err(HandshakeError::Unknown)
    }
}

/// Exchanges and validates the payload on an already-connected stream.
///
/// The client sends its payload and waits for the server's verdict. The
/// server reads the payload, classifies it against `local`, and sends the
/// code back before returning the same verdict.
///
/// # Errors
///
/// Returns the mismatch, or [`HandshakeError::ConnectionDropped`] if the
/// peer vanished mid-exchange.
pub fn perform_handshake(
    comm: &mut Communicator,
    side: Side,
    local: &str,
) -> Result<(), HandshakeError> {
    match side {
        Side::Client => {
            let bytes = local.as_bytes();
            let len = u32::try_from(bytes.len()).map_err(|_| HandshakeError::Unknown)?;
            comm.send_u32(len).map_err(HandshakeError::ConnectionDropped)?;
            comm.send_bytes(bytes)
                .map_err(HandshakeError::ConnectionDropped)?;
            let code = comm.receive_i32().map_err(HandshakeError::ConnectionDropped)?;
            HandshakeError::from_wire_code(code)
        }
        Side::Server => {
            let len = comm.receive_u32().map_err(HandshakeError::ConnectionDropped)? as usize;
            let verdict = if len > MAX_HANDSHAKE_LEN {
                warn!(len, "handshake payload exceeds limit");
                Err(HandshakeError::Unknown)
            } else {
                let mut raw = vec![0u8; len];
                comm.receive_bytes(&mut raw)
                    .map_err(HandshakeError::ConnectionDropped)?;
                match String::from_utf8(raw) {
                    Ok(remote) => {
                        debug!(local, remote = %remote, "comparing handshake payloads");
                        compare_payloads(local, &remote)
                    }
                    Err(_) => Err(HandshakeError::Unknown),
                }
            };

            let code = verdict
                .as_ref()
                .err()
                .and_then(HandshakeError::wire_code)
                .unwrap_or(0);
            comm.send_i32(code)
                .map_err(HandshakeError::ConnectionDropped)?;
            verdict
        }
    }
}

/// Runs the full handshake: communicator versions first, then the payload.
///
/// # Errors
///
/// Returns [`HandshakeError::SocketCommunicatorDifferent`] without touching
/// the payload if the versions differ, otherwise whatever
/// [`perform_handshake`] returns.
pub fn establish(
    comm: &mut Communicator,
    side: Side,
    communicator_version: u32,
    local: &str,
) -> Result<(), HandshakeError> {
    let remote = comm
        .exchange_versions(side, communicator_version)
        .map_err(HandshakeError::ConnectionDropped)?;
    if remote != communicator_version {
        warn!(local = communicator_version, remote, "communicator version mismatch");
        return Err(HandshakeError::SocketCommunicatorDifferent);
    }
    perform_handshake(comm, side, local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_without_connect_id() {
        let p: HandshakePayload = "app-1.0.renderingbackend.gl".parse().unwrap();
        assert_eq!(p.product(), "app");
        assert_eq!(p.version(), "1.0");
        assert_eq!(p.connect_id(), None);
        assert_eq!(p.backend(), "gl");
    }

    #[test]
    fn parse_with_connect_id_and_dashed_product() {
        let p: HandshakePayload = "viz-server-5.12.connect_id.4711.renderingbackend.egl"
            .parse()
            .unwrap();
        assert_eq!(p.product(), "viz-server");
        assert_eq!(p.version(), "5.12");
        assert_eq!(p.connect_id(), Some("4711"));
        assert_eq!(p.backend(), "egl");
    }

    #[test]
    fn format_then_parse_recovers_fields() {
        for payload in [
            HandshakePayload::new("app", 1, 0, "gl"),
            HandshakePayload::new("app", 2, 3, "osmesa").with_connect_id(99),
            HandshakePayload::new("a-b", 0, 0, "x.y"),
        ] {
            let text = payload.to_string();
            assert_eq!(text.parse::<HandshakePayload>().unwrap(), payload, "{text}");
        }
        assert_eq!(
            HandshakePayload::new("app", 1, 0, "gl")
                .with_connect_id(7)
                .to_string(),
            "app-1.0.connect_id.7.renderingbackend.gl"
        );
    }

    #[test]
    fn malformed_payloads() {
        assert_eq!(
            "app".parse::<HandshakePayload>(),
            Err(PayloadParseError::MissingProduct)
        );
        assert_eq!(
            "app-x.0.renderingbackend.gl".parse::<HandshakePayload>(),
            Err(PayloadParseError::InvalidVersion)
        );
        assert_eq!(
            "app-1.0.connect_id.abc.renderingbackend.gl".parse::<HandshakePayload>(),
            Err(PayloadParseError::InvalidConnectId)
        );
        assert_eq!(
            "app-1.0.renderingbackend.".parse::<HandshakePayload>(),
            Err(PayloadParseError::MissingBackend)
        );
        assert_eq!(
            "app-1.0.renderingbackend.gl\0".parse::<HandshakePayload>(),
            Err(PayloadParseError::InvalidCharacters)
        );
    }

    #[test]
    fn classification_priority() {
        let ok = compare_payloads("app-1.0.renderingbackend.gl", "app-1.0.renderingbackend.gl");
        assert!(ok.is_ok());

        assert!(matches!(
            compare_payloads(
                "app-1.0.connect_id.1.renderingbackend.gl",
                "app-2.0.connect_id.2.renderingbackend.egl"
            ),
            Err(HandshakeError::DifferentVersions)
        ));
        assert!(matches!(
            compare_payloads(
                "app-1.0.connect_id.1.renderingbackend.gl",
                "app-1.0.connect_id.2.renderingbackend.egl"
            ),
            Err(HandshakeError::DifferentConnectionIds)
        ));
        assert!(matches!(
            compare_payloads(
                "app-1.0.renderingbackend.gl",
                "app-1.0.connect_id.2.renderingbackend.gl"
            ),
            Err(HandshakeError::DifferentConnectionIds)
        ));
        assert!(matches!(
            compare_payloads("app-1.0.renderingbackend.gl", "app-1.0.renderingbackend.egl"),
            Err(HandshakeError::DifferentRenderingBackends)
        ));
        assert!(matches!(
            compare_payloads("app-1.0.renderingbackend.gl", "other-1.0.renderingbackend.gl"),
            Err(HandshakeError::Unknown)
        ));
        assert!(matches!(
            compare_payloads("app-1.0.renderingbackend.gl", "GET / HTTP/1.1"),
            Err(HandshakeError::Unknown)
        ));
    }

    #[test]
    fn version_and_id_compare_as_sent() {
        assert!(matches!(
            compare_payloads("app-1.0.renderingbackend.gl", "app-1.00.renderingbackend.gl"),
            Err(HandshakeError::DifferentVersions)
        ));
        assert!(matches!(
            compare_payloads(
                "app-1.0.connect_id.7.renderingbackend.gl",
                "app-1.0.connect_id.07.renderingbackend.gl"
            ),
            Err(HandshakeError::DifferentConnectionIds)
        ));
        assert!(matches!(
            compare_payloads(
                "app-1.0.connect_id.1.renderingbackend.gl",
                "app-1.0.connect_id.99999999999.renderingbackend.gl"
            ),
            Err(HandshakeError::DifferentConnectionIds)
        ));

        let wide: HandshakePayload = "app-1.0.connect_id.123456789012345678901234.renderingbackend.gl"
            .parse()
            .unwrap();
        assert_eq!(wide.connect_id(), Some("123456789012345678901234"));
    }

    #[test]
    fn wire_codes_round_trip() {
        for err in [
            HandshakeError::SocketCommunicatorDifferent,
            HandshakeError::DifferentVersions,
            HandshakeError::DifferentRenderingBackends,
            HandshakeError::DifferentConnectionIds,
            HandshakeError::Unknown,
        ] {
            let code = err.wire_code().unwrap();
            let decoded = HandshakeError::from_wire_code(code).unwrap_err();
            assert_eq!(decoded.wire_code(), Some(code));
        }
        assert!(HandshakeError::from_wire_code(0).is_ok());
        assert!(matches!(
            HandshakeError::from_wire_code(42),
            Err(HandshakeError::Unknown)
        ));
        assert_eq!(
            HandshakeError::ConnectionDropped(TransportError::Closed).wire_code(),
            None
        );
    }

    #[test]
    fn user_messages_are_distinct() {
        let messages = [
            HandshakeError::DifferentVersions.user_message(),
            HandshakeError::DifferentConnectionIds.user_message(),
            HandshakeError::DifferentRenderingBackends.user_message(),
            HandshakeError::Unknown.user_message(),
        ];
        for (i, a) in messages.iter().enumerate() {
            for b in &messages[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
