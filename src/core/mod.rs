//! The service model: service records, the service set, and the environment
//! store. This is the state the control protocol inspects and mutates; the
//! protocol layer lives in [`crate::control`].

pub mod env;
pub mod service;
pub mod set;
pub mod state;

use std::rc::Rc;

pub use env::{EnvError, EnvStore, EnvUpdate};
pub use service::{DepEdge, Service, ServiceKind};
pub use set::{
    DepError, LoadError, OsSignals, ServiceLoader, ServiceSet, SignalDispatcher, SignalError,
    StartError, StopError, UnloadError, WakeError,
};
pub use state::{DepKind, EventCode, ServiceState, StopReason};

/// Receives model change notifications inline with the mutation that caused
/// them. Registered weakly on [`ServiceSet`] and [`EnvStore`]; a dropped
/// observer is pruned on the next notification.
pub trait ModelObserver {
    /// A service completed a transition.
    fn service_event(&self, service: &Rc<Service>, event: EventCode);

    /// A service left the model; references to it must be invalidated.
    fn service_removed(&self, service: &Rc<Service>);

    /// The environment store changed. `text` is the raw assignment
    /// (`NAME=value` or bare `NAME`); `overridden` is set when an existing
    /// binding was displaced.
    fn env_event(&self, text: &str, overridden: bool);
}
