//! Several controllers presented as one.
//!
//! The composite holds controller ids only; every operation that touches a
//! connection borrows the [`ControllerPool`] owning it. One participant is
//! *active* (the one the user last interacted with, or the newest) and one
//! is *master* (authoritative for shared state). RMI registrations are kept
//! centrally and mirrored onto every participant, including ones that join
//! later.

use std::collections::VecDeque;
use std::sync::Arc;

use minstant::Instant;
use thiserror::Error;

use crate::control::controller::{Controller, ControllerPool};
use crate::control::types::{
    CompositeObserverId, ControllerId, ObserverId, ParticipantId, REMOTE_PROCESS_ID, RmiCall,
    RmiCallback, RmiTag,
};
use crate::net::{Communicator, TransportError};
use crate::trace::{debug, info, warn};

/// What changed in a [`CompositeEvent::Changed`] notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    Registered(ParticipantId),
    Unregistered(ParticipantId),
    /// Disconnected participants were dropped.
    Pruned(usize),
    ActiveChanged(ParticipantId),
    MasterChanged(ParticipantId),
}

/// Notification queued by the composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeEvent {
    /// The participant set, the active participant or the master changed.
    Changed(ChangeReason),
}

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("composite has no active controller")]
    NoActiveController,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug)]
struct Participant {
    id: ParticipantId,
    controller: ControllerId,
    master: bool,
    mirrors: Vec<(CompositeObserverId, ObserverId)>,
}

struct CentralRegistration {
    id: CompositeObserverId,
    tag: RmiTag,
    callback: RmiCallback,
}

pub struct CompositeController {
    participants: Vec<Participant>,
    registrations: Vec<CentralRegistration>,
    active: Option<ParticipantId>,
    active_since: Instant,
    next_participant: u32,
    next_observer: u64,
    events: VecDeque<CompositeEvent>,
}

impl Default for CompositeController {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompositeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeController")
            .field("participants", &self.participants)
            .field("active", &self.active)
            .field("registrations", &self.registrations.len())
            .finish_non_exhaustive()
    }
}

impl CompositeController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            participants: Vec::new(),
            registrations: Vec::new(),
            active: None,
            active_since: Instant::now(),
            next_participant: 0,
            next_observer: 0,
            events: VecDeque::new(),
        }
    }

    fn fire(&mut self, reason: ChangeReason) {
        debug!(?reason, "composite changed");
        self.events.push_back(CompositeEvent::Changed(reason));
    }

    /// Takes all queued notifications.
    pub fn drain_events(&mut self) -> impl Iterator<Item = CompositeEvent> + '_ {
        self.events.drain(..)
    }

    fn index_of(&self, id: ParticipantId) -> Option<usize> {
        self.participants.iter().position(|p| p.id == id)
    }

    /// Adds a controller as a participant and makes it active.
    ///
    /// Central RMI registrations are mirrored onto it. Registering the same
    /// controller twice returns the existing id without a notification.
    /// Returns `None` if the pool has no such controller.
    pub fn register_controller<P: ControllerPool>(
        &mut self,
        pool: &mut P,
        controller: ControllerId,
    ) -> Option<ParticipantId> {
        if let Some(existing) = self.participant_of(controller) {
            return Some(existing);
        }
        let ctl = pool.controller_mut(controller)?;

        let mirrors = self
            .registrations
            .iter()
            .map(|r| (r.id, ctl.add_shared_rmi_callback(r.tag, Arc::clone(&r.callback))))
            .collect();

        let id = ParticipantId(self.next_participant);
        self.next_participant += 1;
        self.participants.push(Participant {
            id,
            controller,
            master: false,
            mirrors,
        });
        self.active = Some(id);
        self.active_since = Instant::now();
        info!(participant = %id, %controller, "controller joined composite");
        self.fire(ChangeReason::Registered(id));
        Some(id)
    }

    /// Detaches a participant without queuing a notification.
    fn detach<P: ControllerPool>(&mut self, pool: &mut P, index: usize) -> ParticipantId {
        let participant = self.participants.remove(index);
        if let Some(ctl) = pool.controller_mut(participant.controller) {
            for (_, observer) in &participant.mirrors {
                ctl.remove_rmi_callback(*observer);
            }
        }
        if self.active == Some(participant.id) {
            self.active = None;
            self.active_since = Instant::now();
        }
        info!(participant = %participant.id, "controller left composite");
        participant.id
    }

    /// Removes a controller from the composite.
    ///
    /// Its mirrored registrations are removed from it. If it was active the
    /// composite is left without an active participant until the next
    /// interaction; if it was master the master is cleared. Returns `false`
    /// if the controller was not a participant.
    pub fn unregister_controller<P: ControllerPool>(
        &mut self,
        pool: &mut P,
        controller: ControllerId,
    ) -> bool {
        let Some(index) = self
            .participants
            .iter()
            .position(|p| p.controller == controller)
        else {
            return false;
        };
        let id = self.detach(pool, index);
        self.fire(ChangeReason::Unregistered(id));
        true
    }

    /// Drops participants whose connection is gone. Returns how many.
    ///
    /// One notification covers the whole batch.
    pub fn prune_disconnected<P: ControllerPool>(&mut self, pool: &mut P) -> usize {
        let mut pruned = 0usize;
        let mut index = 0usize;
        while index < self.participants.len() {
            let alive = pool
                .controller(self.participants[index].controller)
                .is_some_and(|c| c.is_connected());
            if alive {
                index += 1;
            } else {
                let id = self.detach(pool, index);
                warn!(participant = %id, "pruned disconnected controller");
                pruned += 1;
            }
        }
        if pruned > 0 {
            self.fire(ChangeReason::Pruned(pruned));
        }
        pruned
    }

    /// Promotes the participant with the latest inbound interaction, if it
    /// happened after the current active participant was chosen.
    pub fn refresh_active<P: ControllerPool>(&mut self, pool: &P) {
        let latest = self
            .participants
            .iter()
            .filter_map(|p| {
                pool.controller(p.controller)
                    .and_then(|c| c.last_interaction())
                    .map(|at| (at, p.id))
            })
            .filter(|(at, _)| *at > self.active_since)
            .max_by_key(|(at, _)| *at);

        if let Some((at, id)) = latest {
            self.active_since = at;
            if self.active != Some(id) {
                self.active = Some(id);
                self.fire(ChangeReason::ActiveChanged(id));
            }
        }
    }

    /// Makes `id` active. Returns `false` for an unknown participant.
    pub fn set_active_participant(&mut self, id: ParticipantId) -> bool {
        if self.index_of(id).is_none() {
            return false;
        }
        self.active_since = Instant::now();
        if self.active != Some(id) {
            self.active = Some(id);
            self.fire(ChangeReason::ActiveChanged(id));
        }
        true
    }

    pub fn active_participant<P: ControllerPool>(&mut self, pool: &P) -> Option<ParticipantId> {
        self.refresh_active(pool);
        self.active
    }

    pub fn active_controller<P: ControllerPool>(&mut self, pool: &P) -> Option<ControllerId> {
        let active = self.active_participant(pool)?;
        self.controller_of(active)
    }

    /// The active participant's communicator.
    pub fn communicator<'p, P: ControllerPool>(
        &mut self,
        pool: &'p P,
    ) -> Option<&'p Communicator> {
        let id = self.active_controller(pool)?;
        pool.controller(id).map(|c| c.communicator())
    }

    /// Active participant, else the first, else none.
    fn elect_master(&self) -> Option<ParticipantId> {
        self.active
            .or_else(|| self.participants.first().map(|p| p.id))
    }

    /// Marks `id` as the only master and notifies, even if it already was.
    fn assign_master(&mut self, id: ParticipantId) {
        for p in &mut self.participants {
            p.master = p.id == id;
        }
        self.fire(ChangeReason::MasterChanged(id));
    }

    /// Marks `id` as master.
    ///
    /// An unknown id elects the active participant, else the first one.
    /// Every assignment is notified, including re-marking the current
    /// master; nothing is notified when no participant remains.
    pub fn set_master_controller(&mut self, id: ParticipantId) {
        let chosen = if self.index_of(id).is_some() {
            Some(id)
        } else {
            debug!(participant = %id, "unknown master requested, electing");
            self.elect_master()
        };
        if let Some(chosen) = chosen {
            self.assign_master(chosen);
        }
    }

    /// Current master, electing one if none is set.
    pub fn master_controller<P: ControllerPool>(&mut self, pool: &P) -> Option<ParticipantId> {
        if let Some(master) = self.participants.iter().find(|p| p.master) {
            return Some(master.id);
        }
        self.refresh_active(pool);
        let elected = self.elect_master()?;
        self.assign_master(elected);
        Some(elected)
    }

    /// Registers a callback centrally and on every current participant.
    pub fn add_rmi_callback<P, F>(&mut self, pool: &mut P, tag: RmiTag, callback: F) -> CompositeObserverId
    where
        P: ControllerPool,
        F: Fn(&RmiCall<'_>) + Send + Sync + 'static,
    {
        self.add_shared_rmi_callback(pool, tag, Arc::new(callback))
    }

    pub fn add_shared_rmi_callback<P: ControllerPool>(
        &mut self,
        pool: &mut P,
        tag: RmiTag,
        callback: RmiCallback,
    ) -> CompositeObserverId {
        let id = CompositeObserverId(self.next_observer);
        self.next_observer += 1;
        for participant in &mut self.participants {
            if let Some(ctl) = pool.controller_mut(participant.controller) {
                let observer = ctl.add_shared_rmi_callback(tag, Arc::clone(&callback));
                participant.mirrors.push((id, observer));
            }
        }
        self.registrations.push(CentralRegistration { id, tag, callback });
        id
    }

    /// Removes a central registration and all its mirrors.
    ///
    /// Returns `true` if anything was removed.
    pub fn remove_rmi_callback<P: ControllerPool>(
        &mut self,
        pool: &mut P,
        id: CompositeObserverId,
    ) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.id != id);
        let mut removed = self.registrations.len() != before;

        for participant in &mut self.participants {
            let mut ctl = pool.controller_mut(participant.controller);
            participant.mirrors.retain(|(central, observer)| {
                if *central != id {
                    return true;
                }
                if let Some(ctl) = ctl.as_deref_mut() {
                    removed |= ctl.remove_rmi_callback(*observer);
                }
                false
            });
        }
        removed
    }

    /// Removes every registration under `tag`, central and per participant.
    ///
    /// Returns the number of central registrations removed.
    pub fn remove_all_rmi_callbacks<P: ControllerPool>(&mut self, pool: &mut P, tag: RmiTag) -> usize {
        let dropped: Vec<CompositeObserverId> = self
            .registrations
            .iter()
            .filter(|r| r.tag == tag)
            .map(|r| r.id)
            .collect();
        self.registrations.retain(|r| r.tag != tag);

        for participant in &mut self.participants {
            participant
                .mirrors
                .retain(|(central, _)| !dropped.contains(central));
            if let Some(ctl) = pool.controller_mut(participant.controller) {
                ctl.remove_all_rmi_callbacks(tag);
            }
        }
        dropped.len()
    }

    /// Sends an RMI to every participant, skipping the active one unless
    /// `include_active`.
    ///
    /// Disconnected participants are pruned first. Returns the number of
    /// successful sends.
    pub fn trigger_rmi_to_all<P: ControllerPool>(
        &mut self,
        pool: &mut P,
        data: &[u8],
        tag: RmiTag,
        include_active: bool,
    ) -> usize {
        self.prune_disconnected(pool);
        self.refresh_active(pool);

        let mut sent = 0usize;
        for participant in &self.participants {
            if !include_active && self.active == Some(participant.id) {
                continue;
            }
            let Some(ctl) = pool.controller_mut(participant.controller) else {
                continue;
            };
            match ctl.trigger_rmi(REMOTE_PROCESS_ID, data, tag) {
                Ok(()) => sent += 1,
                Err(e) => warn!(participant = %participant.id, error = %e, "rmi fan-out failed"),
            }
        }
        sent
    }

    fn active_mut<'p, P: ControllerPool>(
        &mut self,
        pool: &'p mut P,
    ) -> Result<&'p mut Controller, CompositeError> {
        let id = self
            .active_controller(&*pool)
            .ok_or(CompositeError::NoActiveController)?;
        pool.controller_mut(id)
            .ok_or(CompositeError::NoActiveController)
    }

    /// Sends a data frame through the active participant.
    ///
    /// # Errors
    ///
    /// Fails without an active participant or on a transport error.
    pub fn send<P: ControllerPool>(&mut self, pool: &mut P, data: &[u8], tag: u32) -> Result<(), CompositeError> {
        Ok(self.active_mut(pool)?.send(data, tag)?)
    }

    /// Receives a data frame through the active participant.
    ///
    /// # Errors
    ///
    /// Fails without an active participant or on a transport error.
    pub fn receive<P: ControllerPool>(&mut self, pool: &mut P, tag: u32) -> Result<Vec<u8>, CompositeError> {
        Ok(self.active_mut(pool)?.receive(tag)?)
    }

    /// Sends an RMI through the active participant.
    ///
    /// # Errors
    ///
    /// Fails without an active participant or on a transport error.
    pub fn trigger_rmi<P: ControllerPool>(
        &mut self,
        pool: &mut P,
        remote_id: i32,
        data: &[u8],
        tag: RmiTag,
    ) -> Result<(), CompositeError> {
        Ok(self.active_mut(pool)?.trigger_rmi(remote_id, data, tag)?)
    }

    /// Participants in registration order.
    pub fn participants(&self) -> impl Iterator<Item = (ParticipantId, ControllerId)> + '_ {
        self.participants.iter().map(|p| (p.id, p.controller))
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn controller_of(&self, id: ParticipantId) -> Option<ControllerId> {
        self.participants
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.controller)
    }

    #[must_use]
    pub fn participant_of(&self, controller: ControllerId) -> Option<ParticipantId> {
        self.participants
            .iter()
            .find(|p| p.controller == controller)
            .map(|p| p.id)
    }
}
