//! Socket primitives.
//!
//! Blocking TCP streams for data, non-blocking listeners for accept loops,
//! and level-triggered `poll(2)` readiness via rustix.

pub mod communicator;
pub mod endpoint;
pub mod frame;
pub mod socket;

pub use communicator::{COMMUNICATOR_VERSION, Communicator, Side, TransportError};
pub use endpoint::Endpoint;
pub use frame::{Frame, FrameKind, Wire};
pub use socket::Listener;
