//! Sessions over validated connections: handshake, controllers, composites.

pub mod composite;
pub mod controller;
pub mod handshake;
pub mod types;

pub use composite::{ChangeReason, CompositeController, CompositeError, CompositeEvent};
pub use controller::{Controller, ControllerPool};
pub use handshake::{
    HandshakeError, HandshakePayload, MAX_HANDSHAKE_LEN, PayloadParseError, compare_payloads,
    establish, perform_handshake,
};
pub use types::{
    CompositeObserverId, ControllerId, ObserverId, ParticipantId, REMOTE_PROCESS_ID, RmiCall,
    RmiCallback, RmiStatus, RmiTag,
};

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use super::{Controller, ControllerId, ControllerPool};
    use crate::net::communicator::tests::communicator_pair;

    /// Two controllers joined over loopback: `(client, server)`.
    pub(crate) fn controller_pair() -> (Controller, Controller) {
        let (client, server) = communicator_pair();
        (Controller::new(client), Controller::new(server))
    }

    /// Minimal pool owning server-side controllers.
    #[derive(Debug, Default)]
    pub(crate) struct TestPool {
        controllers: BTreeMap<ControllerId, Controller>,
        next: u64,
    }

    impl TestPool {
        /// Adds a server-side controller and returns it with its peer.
        pub(crate) fn connect(&mut self) -> (ControllerId, Controller) {
            let (client, server) = controller_pair();
            let id = ControllerId(self.next);
            self.next += 1;
            self.controllers.insert(id, server);
            (id, client)
        }
    }

    impl ControllerPool for TestPool {
        fn controller(&self, id: ControllerId) -> Option<&Controller> {
            self.controllers.get(&id)
        }

        fn controller_mut(&mut self, id: ControllerId) -> Option<&mut Controller> {
            self.controllers.get_mut(&id)
        }
    }
}
