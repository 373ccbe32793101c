//! Service lifecycle enums and their wire tags.
//!
//! Every enum here crosses the control protocol as a single byte, so the
//! discriminants are part of the wire format and must not be renumbered.

/// Lifecycle state of a service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
}

impl ServiceState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Why a service last came to rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StopReason {
    /// Stopped normally (or never started).
    Normal = 0,
    /// A dependency is restarting.
    DepRestart = 1,
    /// A dependency failed to start.
    DepFailed = 2,
    /// The service itself failed to start.
    Failed = 3,
    /// Process execution failed.
    ExecFailed = 4,
    /// A start or stop timed out.
    TimedOut = 5,
    /// The process terminated unexpectedly.
    Terminated = 6,
}

impl StopReason {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Transition notifications delivered to control connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EventCode {
    Started = 0,
    Stopped = 1,
    Failed = 2,
    StartCancelled = 3,
    StopCancelled = 4,
}

impl EventCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Dependency edge kinds.
///
/// Hard kinds gate the dependent's start and are forced down with it; soft
/// kinds are started best-effort and only keep their target alive while a
/// started dependent remains. `Before`/`After` are pure ordering tags: the
/// protocol transports them but the model attaches no runtime semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DepKind {
    Regular = 0,
    Soft = 1,
    WaitsFor = 2,
    Milestone = 3,
    Before = 4,
    After = 5,
}

impl DepKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(DepKind::Regular),
            1 => Some(DepKind::Soft),
            2 => Some(DepKind::WaitsFor),
            3 => Some(DepKind::Milestone),
            4 => Some(DepKind::Before),
            5 => Some(DepKind::After),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Hard dependencies must be up before the dependent can finish starting.
    pub fn is_hard(self) -> bool {
        matches!(self, DepKind::Regular | DepKind::Milestone)
    }

    /// Soft dependencies are started alongside the dependent but never gate it.
    pub fn is_soft(self) -> bool {
        matches!(self, DepKind::Soft | DepKind::WaitsFor)
    }

    /// Ordering-only kinds; never a real dependency edge.
    pub fn is_ordering(self) -> bool {
        matches!(self, DepKind::Before | DepKind::After)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dep_kind_tags_roundtrip() {
        for raw in 0..6u8 {
            let kind = DepKind::from_u8(raw).unwrap();
            assert_eq!(kind.as_u8(), raw);
        }
        assert_eq!(DepKind::from_u8(6), None);
    }

    #[test]
    fn dep_kind_classes_are_disjoint() {
        for raw in 0..6u8 {
            let kind = DepKind::from_u8(raw).unwrap();
            let classes = [kind.is_hard(), kind.is_soft(), kind.is_ordering()];
            assert_eq!(classes.iter().filter(|c| **c).count(), 1);
        }
    }
}
