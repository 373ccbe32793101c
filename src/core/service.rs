//! The service record.
//!
//! Services are shared single-threaded via `Rc`; all mutable state lives in
//! cells so the graph algorithms in [`set`](super::set) can walk edges while
//! flipping states. Dependents are weak back-references: the edge owner is
//! always the depending side.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use super::state::{DepKind, ServiceState, StopReason};

/// How a service realises its transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    /// Transitions complete synchronously (grouping/target services).
    Internal,
    /// Transitions park until the supervisor reports process progress via
    /// [`ServiceSet::started`](super::set::ServiceSet::started) /
    /// [`ServiceSet::stopped`](super::set::ServiceSet::stopped).
    Process,
}

/// An owned dependency edge from a service to one of its requirements.
pub struct DepEdge {
    pub(crate) to: Rc<Service>,
    pub(crate) kind: DepKind,
}

impl DepEdge {
    pub fn target(&self) -> &Rc<Service> {
        &self.to
    }

    pub fn kind(&self) -> DepKind {
        self.kind
    }
}

pub(crate) struct Dependent {
    pub(crate) from: Weak<Service>,
    pub(crate) kind: DepKind,
}

/// A supervised unit: name, state machine, flags, and dependency links.
pub struct Service {
    name: String,
    kind: ServiceKind,
    state: Cell<ServiceState>,
    target: Cell<ServiceState>,
    marked_active: Cell<bool>,
    pinned_started: Cell<bool>,
    pinned_stopped: Cell<bool>,
    has_console: Cell<bool>,
    waiting_console: Cell<bool>,
    start_skipped: Cell<bool>,
    stop_reason: Cell<StopReason>,
    pid: Cell<Option<i32>>,
    exit_status: Cell<i32>,
    exit_code: Cell<i32>,
    // Hard dependencies not yet started; a start completes when this drains.
    waiting_deps: Cell<usize>,
    deps: RefCell<Vec<DepEdge>>,
    dependents: RefCell<Vec<Dependent>>,
}

impl Service {
    pub fn new(name: impl Into<String>, kind: ServiceKind) -> Rc<Self> {
        Rc::new(Service {
            name: name.into(),
            kind,
            state: Cell::new(ServiceState::Stopped),
            target: Cell::new(ServiceState::Stopped),
            marked_active: Cell::new(false),
            pinned_started: Cell::new(false),
            pinned_stopped: Cell::new(false),
            has_console: Cell::new(false),
            waiting_console: Cell::new(false),
            start_skipped: Cell::new(false),
            stop_reason: Cell::new(StopReason::Normal),
            pid: Cell::new(None),
            exit_status: Cell::new(0),
            exit_code: Cell::new(0),
            waiting_deps: Cell::new(0),
            deps: RefCell::new(Vec::new()),
            dependents: RefCell::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn state(&self) -> ServiceState {
        self.state.get()
    }

    pub fn target_state(&self) -> ServiceState {
        self.target.get()
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason.get()
    }

    pub fn is_marked_active(&self) -> bool {
        self.marked_active.get()
    }

    pub fn is_pinned_started(&self) -> bool {
        self.pinned_started.get()
    }

    pub fn is_pinned_stopped(&self) -> bool {
        self.pinned_stopped.get()
    }

    pub fn has_console(&self) -> bool {
        self.has_console.get()
    }

    pub fn is_waiting_for_console(&self) -> bool {
        self.waiting_console.get()
    }

    pub fn was_start_skipped(&self) -> bool {
        self.start_skipped.get()
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid.get()
    }

    /// Record the supervised process id (or clear it on exit).
    pub fn set_pid(&self, pid: Option<i32>) {
        self.pid.set(pid);
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.get()
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.get()
    }

    pub fn set_exit_status(&self, status: i32, code: i32) {
        self.exit_status.set(status);
        self.exit_code.set(code);
    }

    // ---- state machinery, reserved for the service set ----

    pub(crate) fn set_state(&self, state: ServiceState) {
        self.state.set(state);
    }

    pub(crate) fn set_target(&self, target: ServiceState) {
        self.target.set(target);
    }

    pub(crate) fn set_marked_active(&self, active: bool) {
        self.marked_active.set(active);
    }

    pub(crate) fn set_pinned_started(&self, pinned: bool) {
        self.pinned_started.set(pinned);
    }

    pub(crate) fn set_pinned_stopped(&self, pinned: bool) {
        self.pinned_stopped.set(pinned);
    }

    pub(crate) fn set_stop_reason(&self, reason: StopReason) {
        self.stop_reason.set(reason);
    }

    pub(crate) fn waiting_deps(&self) -> usize {
        self.waiting_deps.get()
    }

    pub(crate) fn set_waiting_deps(&self, n: usize) {
        self.waiting_deps.set(n);
    }

    pub(crate) fn dec_waiting_deps(&self) -> usize {
        let n = self.waiting_deps.get().saturating_sub(1);
        self.waiting_deps.set(n);
        n
    }

    // ---- graph links ----

    /// Install a dependency edge `from -> to` with its back-reference.
    pub(crate) fn link(from: &Rc<Service>, to: &Rc<Service>, kind: DepKind) {
        from.deps.borrow_mut().push(DepEdge {
            to: Rc::clone(to),
            kind,
        });
        to.dependents.borrow_mut().push(Dependent {
            from: Rc::downgrade(from),
            kind,
        });
    }

    /// Remove the edge `from -> to` of the given kind; true if one existed.
    pub(crate) fn unlink(from: &Rc<Service>, to: &Rc<Service>, kind: DepKind) -> bool {
        let mut deps = from.deps.borrow_mut();
        let Some(pos) = deps
            .iter()
            .position(|e| Rc::ptr_eq(&e.to, to) && e.kind == kind)
        else {
            return false;
        };
        deps.remove(pos);
        drop(deps);

        let from_weak = Rc::downgrade(from);
        to.dependents
            .borrow_mut()
            .retain(|d| !(d.kind == kind && Weak::ptr_eq(&d.from, &from_weak)));
        true
    }

    pub(crate) fn has_edge(&self, to: &Rc<Service>, kind: DepKind) -> bool {
        self.deps
            .borrow()
            .iter()
            .any(|e| Rc::ptr_eq(&e.to, to) && e.kind == kind)
    }

    /// Snapshot the dependency targets (kind, service).
    pub(crate) fn deps_snapshot(&self) -> Vec<(DepKind, Rc<Service>)> {
        self.deps
            .borrow()
            .iter()
            .map(|e| (e.kind, Rc::clone(&e.to)))
            .collect()
    }

    /// Snapshot the live dependents (kind, service).
    pub(crate) fn dependents_snapshot(&self) -> Vec<(DepKind, Rc<Service>)> {
        self.dependents
            .borrow()
            .iter()
            .filter_map(|d| d.from.upgrade().map(|s| (d.kind, s)))
            .collect()
    }

    pub(crate) fn has_dependents(&self) -> bool {
        self.dependents
            .borrow()
            .iter()
            .any(|d| d.from.upgrade().is_some())
    }

    /// A dependent of any kind that is started or starting keeps this
    /// service required.
    pub(crate) fn has_active_dependent(&self) -> bool {
        self.dependents_snapshot().iter().any(|(_, d)| {
            matches!(d.state(), ServiceState::Started | ServiceState::Starting)
        })
    }

    /// Detach every edge `this` owns, dropping the back-references held by
    /// its targets. Used when the service leaves the model.
    pub(crate) fn detach_deps(this: &Rc<Service>) {
        let targets = this.deps_snapshot();
        for (kind, to) in targets {
            Service::unlink(this, &to, kind);
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("target", &self.target.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_link_both_directions() {
        let a = Service::new("a", ServiceKind::Internal);
        let b = Service::new("b", ServiceKind::Internal);

        Service::link(&a, &b, DepKind::Regular);
        assert!(a.has_edge(&b, DepKind::Regular));
        assert!(!a.has_edge(&b, DepKind::WaitsFor));
        assert!(b.has_dependents());

        assert!(Service::unlink(&a, &b, DepKind::Regular));
        assert!(!a.has_edge(&b, DepKind::Regular));
        assert!(!b.has_dependents());
        assert!(!Service::unlink(&a, &b, DepKind::Regular));
    }

    #[test]
    fn dropped_dependent_disappears_from_snapshots() {
        let b = Service::new("b", ServiceKind::Internal);
        {
            let a = Service::new("a", ServiceKind::Internal);
            Service::link(&a, &b, DepKind::WaitsFor);
            assert_eq!(b.dependents_snapshot().len(), 1);
        }
        assert!(b.dependents_snapshot().is_empty());
        assert!(!b.has_dependents());
    }
}
