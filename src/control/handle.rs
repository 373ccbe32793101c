//! The per-connection handle table.
//!
//! Handles are opaque `u32` values bridging the wire to live service
//! records. The map is bidirectional: commands resolve handle to service,
//! event emission resolves service to handle. When a service is removed
//! from the model its entries become tombstones: the value stays reserved
//! (and answers CLOSEHANDLE) until the client explicitly closes it, so a
//! client can never observe one of its handles silently renamed to a
//! different service.

use std::collections::HashMap;
use std::rc::Rc;

use crate::core::Service;

use super::codec::Handle;

enum Slot {
    Live(Rc<Service>),
    Tombstone,
}

/// What a wire handle currently resolves to.
pub enum Resolved {
    Live(Rc<Service>),
    /// The service behind this handle has been removed.
    Stale,
    /// Never issued (or already closed).
    Unknown,
}

#[derive(Default)]
pub struct HandleTable {
    entries: HashMap<Handle, Slot>,
    // Keyed by service identity (Rc pointer), live entries only.
    by_service: HashMap<usize, Handle>,
    next: Handle,
}

fn service_key(service: &Rc<Service>) -> usize {
    Rc::as_ptr(service) as usize
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handle already issued for `service` on this connection, if any.
    pub fn handle_of(&self, service: &Rc<Service>) -> Option<Handle> {
        self.by_service.get(&service_key(service)).copied()
    }

    /// Return the existing handle for `service` or issue a fresh one.
    ///
    /// Fresh values skip zero and anything still present in the table,
    /// tombstones included, so a value is never reused while a client may
    /// still hold it.
    pub fn find_or_issue(&mut self, service: &Rc<Service>) -> Handle {
        if let Some(handle) = self.handle_of(service) {
            return handle;
        }
        loop {
            self.next = self.next.wrapping_add(1);
            if self.next == 0 || self.entries.contains_key(&self.next) {
                continue;
            }
            let handle = self.next;
            self.entries.insert(handle, Slot::Live(Rc::clone(service)));
            self.by_service.insert(service_key(service), handle);
            return handle;
        }
    }

    pub fn resolve(&self, handle: Handle) -> Resolved {
        match self.entries.get(&handle) {
            Some(Slot::Live(service)) => Resolved::Live(Rc::clone(service)),
            Some(Slot::Tombstone) => Resolved::Stale,
            None => Resolved::Unknown,
        }
    }

    /// Release a handle value. Succeeds whether the entry is live,
    /// tombstoned, or absent; the freed value becomes reusable.
    pub fn close(&mut self, handle: Handle) {
        if let Some(Slot::Live(service)) = self.entries.remove(&handle) {
            self.by_service.remove(&service_key(&service));
        }
    }

    /// Convert every entry for `service` into a tombstone.
    pub fn tombstone(&mut self, service: &Rc<Service>) {
        if let Some(handle) = self.by_service.remove(&service_key(service)) {
            self.entries.insert(handle, Slot::Tombstone);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServiceKind;

    #[test]
    fn issue_is_stable_per_service() {
        let mut table = HandleTable::new();
        let a = Service::new("a", ServiceKind::Internal);
        let b = Service::new("b", ServiceKind::Internal);

        let ha = table.find_or_issue(&a);
        let hb = table.find_or_issue(&b);
        assert_ne!(ha, 0);
        assert_ne!(ha, hb);
        assert_eq!(table.find_or_issue(&a), ha);

        match table.resolve(ha) {
            Resolved::Live(svc) => assert!(Rc::ptr_eq(&svc, &a)),
            _ => panic!("expected live handle"),
        }
    }

    #[test]
    fn tombstone_blocks_reuse_until_closed() {
        let mut table = HandleTable::new();
        let a = Service::new("a", ServiceKind::Internal);
        let ha = table.find_or_issue(&a);

        table.tombstone(&a);
        assert!(matches!(table.resolve(ha), Resolved::Stale));
        // The service no longer maps forward.
        assert_eq!(table.handle_of(&a), None);

        // A re-added service with the same identity gets a fresh value.
        let ha2 = table.find_or_issue(&a);
        assert_ne!(ha2, ha);

        table.close(ha);
        assert!(matches!(table.resolve(ha), Resolved::Unknown));
    }

    #[test]
    fn close_is_idempotent() {
        let mut table = HandleTable::new();
        let a = Service::new("a", ServiceKind::Internal);
        let ha = table.find_or_issue(&a);
        table.close(ha);
        table.close(ha);
        assert!(table.is_empty());
        assert_eq!(table.handle_of(&a), None);
    }
}
