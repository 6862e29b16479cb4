//! Identifier and callback types shared by controllers and the composite.

use std::fmt;
use std::sync::Arc;

use crate::net::TransportError;
use crate::net::frame::{Wire, decode_message};

/// Process id a socket controller uses for its single peer.
pub const REMOTE_PROCESS_ID: i32 = 1;

/// Tag selecting the callback group an RMI is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RmiTag(u32);

impl RmiTag {
    /// Reserved tag that makes the receiving `process_rmis` return
    /// [`RmiStatus::Break`] instead of dispatching.
    pub const BREAK: Self = Self(239_954);

    /// Creates a new RMI tag.
    #[must_use]
    pub const fn new(tag: u32) -> Self {
        Self(tag)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for RmiTag {
    fn from(tag: u32) -> Self {
        Self(tag)
    }
}

impl From<RmiTag> for u32 {
    fn from(tag: RmiTag) -> Self {
        tag.0
    }
}

impl fmt::Display for RmiTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to one RMI registration on a single controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub(crate) u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obs#{}", self.0)
    }
}

/// Stable handle to a controller owned by a [`ControllerPool`].
///
/// [`ControllerPool`]: crate::control::ControllerPool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerId(pub(crate) u64);

impl ControllerId {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctl#{}", self.0)
    }
}

/// Id a [`CompositeController`] assigns to each registered controller.
///
/// [`CompositeController`]: crate::control::CompositeController
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(pub(crate) u32);

impl ParticipantId {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "participant#{}", self.0)
    }
}

/// Handle to an RMI registration made on a composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeObserverId(pub(crate) u64);

/// One inbound RMI, as seen by a callback.
#[derive(Debug, Clone, Copy)]
pub struct RmiCall<'a> {
    /// Tag the RMI was sent with.
    pub tag: RmiTag,
    /// Process that triggered it.
    pub remote_id: i32,
    /// Argument bytes.
    pub data: &'a [u8],
}

impl RmiCall<'_> {
    /// Decodes the argument bytes as a typed message.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not describe a `T`.
    pub fn decode<T: Wire>(&self) -> Result<T, TransportError> {
        decode_message(self.data)
    }
}

/// Shared RMI callback.
///
/// Shared so one registration can be mirrored onto many controllers.
pub type RmiCallback = Arc<dyn Fn(&RmiCall<'_>) + Send + Sync>;

/// Outcome of [`Controller::process_rmis`].
///
/// [`Controller::process_rmis`]: crate::control::Controller::process_rmis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmiStatus {
    /// Every requested message was dispatched (or none was pending).
    NoError,
    /// A break RMI arrived and ended processing.
    Break,
    /// Reading from the connection failed; the peer is likely gone.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[test]
    fn break_tag_is_reserved_value() {
        assert_eq!(RmiTag::BREAK.as_u32(), 239_954);
        assert_ne!(RmiTag::new(1), RmiTag::BREAK);
    }

    #[test]
    fn rmi_call_decodes_typed_arguments() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct SetTimestep(f64);

        let bytes = crate::net::frame::encode_message(&SetTimestep(0.25)).unwrap();
        let call = RmiCall {
            tag: RmiTag::new(10),
            remote_id: REMOTE_PROCESS_ID,
            data: &bytes,
        };
        assert_eq!(call.decode::<SetTimestep>().unwrap(), SetTimestep(0.25));
    }
}
