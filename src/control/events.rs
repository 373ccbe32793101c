//! Event subscription and fan-out.
//!
//! The router is the model's observer: every service transition, removal,
//! and environment change lands here and is multicast into the write buffer
//! of each registered connection. Emission is synchronous with the mutation,
//! which is what keeps events ahead of the terminal reply of the command
//! that caused them.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::core::{EventCode, ModelObserver, Service};

use super::codec;
use super::conn::ConnShared;

/// Which unsolicited event classes a connection receives. Both default off;
/// service events are additionally latched on by any state-changing command
/// so the requester always observes the outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionFlags {
    pub service_events: bool,
    pub env_events: bool,
}

/// Per-connection protocol compatibility mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmitMode {
    /// Emit both the v5 and the legacy packet for every service event.
    #[default]
    Dual,
    /// Suppress the legacy packet for clients negotiated as v5-only.
    V5Only,
}

/// Fan-out hub: multicasts model events into every registered connection.
#[derive(Default)]
pub struct EventRouter {
    conns: RefCell<Vec<Rc<RefCell<ConnShared>>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn register(&self, conn: &Rc<RefCell<ConnShared>>) {
        self.conns.borrow_mut().push(Rc::clone(conn));
    }

    pub(super) fn unregister(&self, conn: &Rc<RefCell<ConnShared>>) {
        self.conns.borrow_mut().retain(|c| !Rc::ptr_eq(c, conn));
    }

    pub fn connection_count(&self) -> usize {
        self.conns.borrow().len()
    }
}

impl ModelObserver for EventRouter {
    fn service_event(&self, service: &Rc<Service>, event: EventCode) {
        trace!(service = service.name(), ?event, "service event");
        for conn in self.conns.borrow().iter() {
            let mut shared = conn.borrow_mut();
            if !shared.subs.service_events {
                continue;
            }
            // A connection without a handle for the service is not told.
            let Some(handle) = shared.handles.handle_of(service) else {
                continue;
            };
            let v5 = codec::service_event5_packet(handle, event, service);
            shared.append(&v5);
            if shared.emit_mode == EmitMode::Dual {
                let legacy = codec::service_event_packet(handle, event, service);
                shared.append(&legacy);
            }
        }
    }

    fn service_removed(&self, service: &Rc<Service>) {
        // Tombstoning is unconditional: handle validity is not a
        // subscription concern.
        for conn in self.conns.borrow().iter() {
            conn.borrow_mut().handles.tombstone(service);
        }
    }

    fn env_event(&self, text: &str, overridden: bool) {
        trace!(overridden, "environment event");
        let packet = codec::env_event_packet(text, overridden);
        for conn in self.conns.borrow().iter() {
            let mut shared = conn.borrow_mut();
            if shared.subs.env_events {
                shared.append(&packet);
            }
        }
    }
}
