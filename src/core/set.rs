//! The service set: every loaded service plus the mutation entry points the
//! control protocol drives.
//!
//! This is the single serialization point for model state. All methods take
//! `&self`; internal collections use `RefCell` because the whole supervisor
//! runs on one thread and observers are invoked inline with the mutation
//! that produced the change.
//!
//! Propagation rules:
//! - starting a service starts its hard dependencies first; the dependent
//!   finishes once every hard dependency is up (soft dependencies are
//!   started best-effort and never gate),
//! - stopping a service forces its hard dependents down first, then releases
//!   each dependency target: a target with no remaining started dependent
//!   and no active mark is stopped too,
//! - a restart stops synchronously and re-enters through [`ServiceSet::tick`].

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use thiserror::Error;
use tracing::{debug, warn};

use super::service::{Service, ServiceKind};
use super::state::{DepKind, EventCode, ServiceState, StopReason};
use super::ModelObserver;

/// Supplies service records for names the set does not yet hold.
pub trait ServiceLoader {
    fn load(&mut self, name: &str) -> Result<Rc<Service>, LoadError>;
}

/// Delivers signals to supervised processes.
pub trait SignalDispatcher {
    fn deliver(&self, pid: i32, signum: i32) -> Result<(), SignalError>;
}

/// Default dispatcher: `kill(2)` via nix.
pub struct OsSignals;

impl SignalDispatcher for OsSignals {
    fn deliver(&self, pid: i32, signum: i32) -> Result<(), SignalError> {
        let signal = nix::sys::signal::Signal::try_from(signum)
            .map_err(|_| SignalError::UnknownSignal(signum))?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal)
            .map_err(|source| SignalError::Delivery { pid, source })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("service not found: {0}")]
    NotFound(String),
    #[error("service description for {name} is invalid: {reason}")]
    Description { name: String, reason: String },
    #[error("failed to load service {name}: {reason}")]
    Failed { name: String, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("service is pinned stopped")]
    PinnedStopped,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StopError {
    #[error("service is pinned started")]
    PinnedStarted,
    #[error("service is not started")]
    NotStarted,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WakeError {
    #[error("service has no active dependent")]
    NoActiveDependent,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DepError {
    #[error("a service cannot depend on itself")]
    SelfDependency,
    #[error("dependency kind cannot be created over the control protocol")]
    UnsupportedKind,
    #[error("dependency already exists")]
    Duplicate,
    #[error("dependency does not exist")]
    Missing,
    #[error("dependency would create a cycle")]
    WouldCycle,
    #[error("hard dependency target is not started")]
    TargetNotStarted,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnloadError {
    #[error("service is active")]
    Active,
    #[error("service has dependents")]
    HasDependents,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("service has no process")]
    NoProcess,
    #[error("unknown signal number {0}")]
    UnknownSignal(i32),
    #[error("failed to signal pid {pid}")]
    Delivery {
        pid: i32,
        #[source]
        source: nix::errno::Errno,
    },
}

/// The set of loaded services.
pub struct ServiceSet {
    services: RefCell<Vec<Rc<Service>>>,
    loader: RefCell<Option<Box<dyn ServiceLoader>>>,
    signals: RefCell<Box<dyn SignalDispatcher>>,
    observers: RefCell<Vec<Weak<dyn ModelObserver>>>,
    restarts: RefCell<Vec<Rc<Service>>>,
}

impl Default for ServiceSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceSet {
    pub fn new() -> Self {
        ServiceSet {
            services: RefCell::new(Vec::new()),
            loader: RefCell::new(None),
            signals: RefCell::new(Box::new(OsSignals)),
            observers: RefCell::new(Vec::new()),
            restarts: RefCell::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, observer: Weak<dyn ModelObserver>) {
        self.observers.borrow_mut().push(observer);
    }

    pub fn set_loader(&self, loader: Box<dyn ServiceLoader>) {
        *self.loader.borrow_mut() = Some(loader);
    }

    pub fn set_signal_dispatcher(&self, signals: Box<dyn SignalDispatcher>) {
        *self.signals.borrow_mut() = signals;
    }

    pub fn add_service(&self, service: Rc<Service>) {
        debug_assert!(
            self.find_service(service.name()).is_none(),
            "duplicate service name {}",
            service.name()
        );
        self.services.borrow_mut().push(service);
    }

    pub fn find_service(&self, name: &str) -> Option<Rc<Service>> {
        self.services
            .borrow()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    /// Every loaded service, in load order.
    pub fn services_snapshot(&self) -> Vec<Rc<Service>> {
        self.services.borrow().clone()
    }

    /// Find a service, consulting the loader for unknown names.
    pub fn load_service(&self, name: &str) -> Result<Rc<Service>, LoadError> {
        if let Some(existing) = self.find_service(name) {
            return Ok(existing);
        }
        let mut loader = self.loader.borrow_mut();
        let Some(loader) = loader.as_mut() else {
            return Err(LoadError::NotFound(name.to_string()));
        };
        let service = loader.load(name)?;
        debug!(service = service.name(), "loaded service");
        self.add_service(Rc::clone(&service));
        Ok(service)
    }

    /// Remove an inactive, dependent-free service from the set.
    ///
    /// Observers are told last, after the record is detached, so handle
    /// tables tombstone against a service that is already gone.
    pub fn remove_service(&self, service: &Rc<Service>) -> Result<(), UnloadError> {
        if service.state() != ServiceState::Stopped || service.is_marked_active() {
            return Err(UnloadError::Active);
        }
        if service.has_dependents() {
            return Err(UnloadError::HasDependents);
        }
        Service::detach_deps(service);
        self.services
            .borrow_mut()
            .retain(|s| !Rc::ptr_eq(s, service));
        debug!(service = service.name(), "removed service");
        self.notify(|o| o.service_removed(service));
        Ok(())
    }

    // ---- transitions ----

    /// Explicit start request: marks the service active.
    pub fn start_service(&self, service: &Rc<Service>) -> Result<(), StartError> {
        if service.is_pinned_stopped() {
            return Err(StartError::PinnedStopped);
        }
        service.set_marked_active(true);
        self.do_start(service);
        Ok(())
    }

    /// Explicit stop request. With `restart`, the service must currently be
    /// started; it stops now and re-enters STARTING on the next [`tick`].
    ///
    /// [`tick`]: ServiceSet::tick
    pub fn stop_service(&self, service: &Rc<Service>, restart: bool) -> Result<(), StopError> {
        if service.is_pinned_started() {
            return Err(StopError::PinnedStarted);
        }
        if restart {
            if service.state() != ServiceState::Started {
                return Err(StopError::NotStarted);
            }
            self.do_stop(service);
            self.restarts.borrow_mut().push(Rc::clone(service));
            return Ok(());
        }
        service.set_marked_active(false);
        self.do_stop(service);
        Ok(())
    }

    /// Start a service on behalf of its dependents, without marking it
    /// active. Refused when nothing started depends on it.
    pub fn wake_service(&self, service: &Rc<Service>) -> Result<(), WakeError> {
        if !service.has_active_dependent() {
            return Err(WakeError::NoActiveDependent);
        }
        self.do_start(service);
        Ok(())
    }

    /// Drop the active mark; the service stops once nothing requires it.
    pub fn release_service(&self, service: &Rc<Service>) {
        service.set_marked_active(false);
        self.release_check(service);
    }

    pub fn pin_start(&self, service: &Rc<Service>) {
        service.set_pinned_started(true);
    }

    pub fn pin_stop(&self, service: &Rc<Service>) {
        service.set_pinned_stopped(true);
    }

    pub fn unpin(&self, service: &Rc<Service>) {
        service.set_pinned_started(false);
        service.set_pinned_stopped(false);
    }

    /// The started dependents (transitively, via hard edges) that a stop of
    /// `service` would force down. Used by the gentle-stop enumeration; the
    /// model is left untouched.
    pub fn stop_dependents_of(&self, service: &Rc<Service>) -> Vec<Rc<Service>> {
        let mut out: Vec<Rc<Service>> = Vec::new();
        let mut stack = vec![Rc::clone(service)];
        while let Some(current) = stack.pop() {
            for (kind, dependent) in current.dependents_snapshot() {
                if !kind.is_hard() || dependent.state() == ServiceState::Stopped {
                    continue;
                }
                if out.iter().any(|s| Rc::ptr_eq(s, &dependent)) {
                    continue;
                }
                out.push(Rc::clone(&dependent));
                stack.push(dependent);
            }
        }
        out
    }

    // ---- dependency edges ----

    /// Add a dependency edge. Only REGULAR, WAITS_FOR and MILESTONE edges
    /// can be created at runtime.
    pub fn add_dep(
        &self,
        from: &Rc<Service>,
        to: &Rc<Service>,
        kind: DepKind,
    ) -> Result<(), DepError> {
        if kind.is_ordering() || kind == DepKind::Soft {
            return Err(DepError::UnsupportedKind);
        }
        self.check_new_edge(from, to, kind)?;
        if kind.is_hard()
            && matches!(
                from.state(),
                ServiceState::Started | ServiceState::Starting
            )
            && to.state() != ServiceState::Started
        {
            // A started service must have its hard dependencies up.
            return Err(DepError::TargetNotStarted);
        }
        Service::link(from, to, kind);
        Ok(())
    }

    /// Remove a dependency edge and release the target.
    pub fn rem_dep(
        &self,
        from: &Rc<Service>,
        to: &Rc<Service>,
        kind: DepKind,
    ) -> Result<(), DepError> {
        if !Service::unlink(from, to, kind) {
            return Err(DepError::Missing);
        }
        self.release_check(to);
        Ok(())
    }

    /// Add a waits-for edge and bring the target up if the owner is already
    /// started.
    pub fn enable_service(
        &self,
        from: &Rc<Service>,
        to: &Rc<Service>,
        kind: DepKind,
    ) -> Result<(), DepError> {
        if kind != DepKind::WaitsFor {
            return Err(DepError::UnsupportedKind);
        }
        self.check_new_edge(from, to, kind)?;
        Service::link(from, to, kind);
        if from.state() == ServiceState::Started {
            self.do_start(to);
        }
        Ok(())
    }

    fn check_new_edge(
        &self,
        from: &Rc<Service>,
        to: &Rc<Service>,
        kind: DepKind,
    ) -> Result<(), DepError> {
        if Rc::ptr_eq(from, to) {
            return Err(DepError::SelfDependency);
        }
        if from.has_edge(to, kind) {
            return Err(DepError::Duplicate);
        }
        if self.reaches(to, from) {
            return Err(DepError::WouldCycle);
        }
        Ok(())
    }

    /// Depth-first reachability over dependency edges.
    fn reaches(&self, from: &Rc<Service>, needle: &Rc<Service>) -> bool {
        if Rc::ptr_eq(from, needle) {
            return true;
        }
        let mut seen: Vec<Rc<Service>> = Vec::new();
        let mut stack = vec![Rc::clone(from)];
        while let Some(current) = stack.pop() {
            for (_, target) in current.deps_snapshot() {
                if Rc::ptr_eq(&target, needle) {
                    return true;
                }
                if !seen.iter().any(|s| Rc::ptr_eq(s, &target)) {
                    seen.push(Rc::clone(&target));
                    stack.push(target);
                }
            }
        }
        false
    }

    // ---- process interaction ----

    /// Deliver a signal to the service's process.
    pub fn signal_service(&self, service: &Rc<Service>, signum: i32) -> Result<(), SignalError> {
        let Some(pid) = service.pid() else {
            return Err(SignalError::NoProcess);
        };
        self.signals.borrow().deliver(pid, signum)
    }

    // ---- model ticks ----

    /// A process service finished starting.
    pub fn started(&self, service: &Rc<Service>) {
        if service.state() == ServiceState::Starting && service.waiting_deps() == 0 {
            self.complete_start(service);
        }
    }

    /// A process service finished stopping.
    pub fn stopped(&self, service: &Rc<Service>) {
        if service.state() == ServiceState::Stopping {
            service.set_pid(None);
            self.complete_stop(service);
        }
    }

    /// A service failed to start. Still-starting hard dependents fail with
    /// it.
    pub fn start_failed(&self, service: &Rc<Service>) {
        self.fail_start(service, StopReason::Failed);
    }

    /// Run deferred work: restart re-entries queued by
    /// [`stop_service`](ServiceSet::stop_service).
    pub fn tick(&self) {
        let pending: Vec<Rc<Service>> = self.restarts.borrow_mut().drain(..).collect();
        for service in pending {
            match service.state() {
                ServiceState::Stopped => {
                    debug!(service = service.name(), "restarting");
                    self.do_start(&service);
                }
                // Still coming down; try again next tick.
                ServiceState::Stopping => self.restarts.borrow_mut().push(service),
                ServiceState::Starting | ServiceState::Started => {}
            }
        }
    }

    // ---- propagation internals ----

    fn do_start(&self, service: &Rc<Service>) {
        match service.state() {
            ServiceState::Started | ServiceState::Starting => return,
            ServiceState::Stopping => {
                // A process is being brought down; cancel the stop.
                if service.kind() == ServiceKind::Process {
                    service.set_target(ServiceState::Started);
                    service.set_state(ServiceState::Started);
                    self.emit(service, EventCode::StopCancelled);
                }
                return;
            }
            ServiceState::Stopped => {}
        }

        service.set_target(ServiceState::Started);
        service.set_state(ServiceState::Starting);
        service.set_stop_reason(StopReason::Normal);

        let mut pending = 0usize;
        for (kind, dep) in service.deps_snapshot() {
            if kind.is_ordering() {
                continue;
            }
            self.do_start(&dep);
            if kind.is_hard() && dep.state() != ServiceState::Started {
                pending += 1;
            }
        }
        service.set_waiting_deps(pending);

        if pending == 0 && service.kind() == ServiceKind::Internal {
            self.complete_start(service);
        }
    }

    fn complete_start(&self, service: &Rc<Service>) {
        service.set_state(ServiceState::Started);
        debug!(service = service.name(), "started");
        self.emit(service, EventCode::Started);

        for (kind, dependent) in service.dependents_snapshot() {
            if !kind.is_hard() || dependent.state() != ServiceState::Starting {
                continue;
            }
            let remaining = dependent.dec_waiting_deps();
            if remaining == 0 && dependent.kind() == ServiceKind::Internal {
                self.complete_start(&dependent);
            }
        }
    }

    fn fail_start(&self, service: &Rc<Service>, reason: StopReason) {
        if service.state() != ServiceState::Starting {
            return;
        }
        service.set_stop_reason(reason);
        service.set_target(ServiceState::Stopped);
        service.set_state(ServiceState::Stopped);
        warn!(service = service.name(), ?reason, "start failed");
        self.emit(service, EventCode::Failed);

        for (kind, dependent) in service.dependents_snapshot() {
            if kind.is_hard() {
                self.fail_start(&dependent, StopReason::DepFailed);
            }
        }
        self.release_targets(service);
    }

    fn do_stop(&self, service: &Rc<Service>) {
        match service.state() {
            ServiceState::Stopped | ServiceState::Stopping => return,
            ServiceState::Starting => {
                // Cancel the in-flight start; dependents waiting on this
                // service cannot complete either.
                service.set_target(ServiceState::Stopped);
                service.set_state(ServiceState::Stopped);
                self.emit(service, EventCode::StartCancelled);
                for (kind, dependent) in service.dependents_snapshot() {
                    if kind.is_hard() && dependent.state() == ServiceState::Starting {
                        self.do_stop(&dependent);
                    }
                }
                self.release_targets(service);
                return;
            }
            ServiceState::Started => {}
        }

        service.set_target(ServiceState::Stopped);
        // Claim the transition before touching dependents; their release
        // checks must not re-enter this stop.
        service.set_state(ServiceState::Stopping);

        // Hard dependents go down before the service they require.
        for (kind, dependent) in service.dependents_snapshot() {
            if kind.is_hard() && dependent.state() != ServiceState::Stopped {
                self.do_stop(&dependent);
            }
        }

        if service.kind() == ServiceKind::Process {
            if let Some(pid) = service.pid() {
                if let Err(err) = self.signals.borrow().deliver(pid, nix::libc::SIGTERM) {
                    warn!(service = service.name(), %err, "termination signal failed");
                }
                return;
            }
        }
        self.complete_stop(service);
    }

    fn complete_stop(&self, service: &Rc<Service>) {
        service.set_state(ServiceState::Stopped);
        debug!(service = service.name(), "stopped");
        self.emit(service, EventCode::Stopped);
        self.release_targets(service);
    }

    /// Release every dependency target of `service`; targets kept up only
    /// for its sake stop here.
    fn release_targets(&self, service: &Rc<Service>) {
        for (kind, target) in service.deps_snapshot() {
            if !kind.is_ordering() {
                self.release_check(&target);
            }
        }
    }

    fn release_check(&self, service: &Rc<Service>) {
        if service.is_marked_active() || service.has_active_dependent() {
            return;
        }
        if matches!(
            service.state(),
            ServiceState::Started | ServiceState::Starting
        ) {
            self.do_stop(service);
        }
    }

    fn emit(&self, service: &Rc<Service>, event: EventCode) {
        self.notify(|o| o.service_event(service, event));
    }

    fn notify(&self, f: impl Fn(&dyn ModelObserver)) {
        let observers: Vec<Rc<dyn ModelObserver>> = {
            let mut observers = self.observers.borrow_mut();
            observers.retain(|w| w.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            f(observer.as_ref());
        }
    }
}
