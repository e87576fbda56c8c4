//! C9: maps a [`FullPaymentTag`] to its active FSM instance, creating on
//! first HTLC arrival and removing only when the FSM itself reports that it
//! has reached `Shutdown`.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::htlc::{InFlightPayments, OutgoingFailure};
use crate::payments::local::LocalReceiverFsm;
use crate::payments::trampoline::TrampolineRelayerFsm;
use crate::traits::Services;
use crate::types::{FullPaymentTag, PaymentKind, Preimage};

/// The two FSM variants a tag can be routed to, behind one handle.
pub enum Fsm<S: Services> {
    Local(LocalReceiverFsm<S>),
    Trampoline(TrampolineRelayerFsm<S>),
}

impl<S: Services> Fsm<S> {
    pub async fn handle_snapshot(&mut self, snapshot: &InFlightPayments) -> bool {
        match self {
            Self::Local(fsm) => fsm.handle_snapshot(snapshot).await,
            Self::Trampoline(fsm) => fsm.handle_snapshot(snapshot).await,
        }
    }

    pub fn handle_arrival(&mut self) {
        match self {
            Self::Local(fsm) => fsm.handle_arrival(),
            Self::Trampoline(fsm) => fsm.handle_arrival(),
        }
    }

    fn handle_outgoing_fulfill(&mut self, preimage: Preimage) {
        if let Self::Trampoline(fsm) = self {
            fsm.handle_outgoing_fulfill(preimage);
        }
    }

    fn handle_outgoing_failed(&mut self, failures: Vec<OutgoingFailure>) {
        if let Self::Trampoline(fsm) = self {
            fsm.handle_outgoing_failed(failures);
        }
    }
}

/// A shared, concurrent map from tag to active FSM. Single-writer per tag;
/// readers are the periodic snapshot dispatcher.
pub struct FsmRegistry<S: Services> {
    services: S,
    active: Mutex<HashMap<FullPaymentTag, Fsm<S>>>,
}

impl<S: Services> FsmRegistry<S> {
    pub fn new(services: S) -> Self {
        Self {
            services,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures an FSM exists for `tag`, creating one (dispatching on `kind`)
    /// if this is the first HTLC arrival we've seen for it.
    pub fn get_or_create(&self, tag: FullPaymentTag) {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(&tag) {
            return;
        }

        info!(?tag, "Creating FSM for new payment tag");
        let fsm = match tag.kind {
            PaymentKind::FinalIncoming => {
                Fsm::Local(LocalReceiverFsm::new(tag, self.services.clone()))
            }
            PaymentKind::TrampolineRouted => {
                Fsm::Trampoline(TrampolineRelayerFsm::new(tag, self.services.clone()))
            }
        };
        active.insert(tag, fsm);
    }

    /// Notifies the FSM for `tag` (creating it if needed) that one of its
    /// HTLCs just arrived, resetting its receive timeout.
    pub fn notify_arrival(&self, tag: FullPaymentTag) {
        self.get_or_create(tag);
        let mut active = self.active.lock().unwrap();
        if let Some(fsm) = active.get_mut(&tag) {
            fsm.handle_arrival();
        }
    }

    /// Routes a C5 fulfill callback to the trampoline FSM for `tag`, if one
    /// is currently active. A no-op for local receivers and for tags whose
    /// FSM has already shut down.
    pub fn notify_outgoing_fulfill(&self, tag: FullPaymentTag, preimage: Preimage) {
        let mut active = self.active.lock().unwrap();
        if let Some(fsm) = active.get_mut(&tag) {
            fsm.handle_outgoing_fulfill(preimage);
        }
    }

    /// Routes a C5 terminal-failure callback to the trampoline FSM for `tag`.
    pub fn notify_outgoing_failed(&self, tag: FullPaymentTag, failures: Vec<OutgoingFailure>) {
        let mut active = self.active.lock().unwrap();
        if let Some(fsm) = active.get_mut(&tag) {
            fsm.handle_outgoing_failed(failures);
        }
    }

    /// Dispatches one `InFlightPayments` snapshot to every active FSM whose
    /// tag appears in `snapshot.incoming`/`snapshot.outgoing`, plus every FSM
    /// we still have registered (so each can notice it has no HTLCs left and
    /// shut down). Removes any FSM that reports shutdown.
    pub async fn dispatch_snapshot(&self, snapshot: &InFlightPayments) {
        let tags: Vec<FullPaymentTag> = {
            let active = self.active.lock().unwrap();
            active.keys().copied().collect()
        };

        let mut shutdown = Vec::new();
        for tag in tags {
            // Take the FSM out of the map for the duration of the await so
            // the lock isn't held across `.await`, then put it back (or
            // drop it) based on the result.
            let taken = {
                let mut active = self.active.lock().unwrap();
                active.remove(&tag)
            };
            let Some(mut fsm) = taken else { continue };

            let should_shutdown = fsm.handle_snapshot(snapshot).await;
            if should_shutdown {
                shutdown.push(tag);
            } else {
                let mut active = self.active.lock().unwrap();
                active.insert(tag, fsm);
            }
        }

        if !shutdown.is_empty() {
            let mut active = self.active.lock().unwrap();
            for tag in shutdown {
                warn!(?tag, "FSM shut down, removing from registry");
                active.remove(&tag);
            }
        }
    }

    #[cfg(test)]
    pub fn contains(&self, tag: &FullPaymentTag) -> bool {
        self.active.lock().unwrap().contains_key(tag)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}
