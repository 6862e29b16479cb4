//! Client/server session transport.
//!
//! Connections are opened through a [`NetworkAccessManager`], validated by
//! a two-step handshake, and exposed as [`Controller`]s offering tagged
//! send/receive and RMI dispatch. A [`CompositeController`] fronts several
//! controllers at once.

pub mod control;
pub mod net;
pub mod network;
mod trace;

pub use control::{
    CompositeController, Controller, ControllerId, ControllerPool, HandshakeError,
    HandshakePayload, RmiStatus, RmiTag,
};
pub use network::{EventStatus, NetworkAccessManager, NetworkConfig, NetworkEvent};
pub use trace::init_tracing;

// Re-export serde traits for typed RMI arguments
pub use serde::{Deserialize, Serialize};
