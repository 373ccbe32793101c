#![forbid(unsafe_code)]

//! Control protocol core for the warden service supervisor.
//!
//! This crate implements the side of a supervisor that administrative
//! clients talk to over a local stream socket: the binary request/reply
//! framing, the per-connection handle table bridging wire identifiers to
//! live services, the command state machine, and the event fan-out that
//! keeps subscribed clients informed of service and environment changes.
//! Socket setup and the readiness loop belong to the embedding process;
//! see [`control::ControlHub`] for the entry point.

pub mod config;
pub mod control;
pub mod core;
pub mod error;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types an embedder wires together.
pub use crate::control::{
    CloseReason, Command, ConnStatus, ControlHub, Controller, EmitMode, Handle, Info, Reply,
    SubscriptionFlags,
};
pub use crate::core::{
    DepKind, EnvStore, EventCode, ModelObserver, Service, ServiceKind, ServiceLoader, ServiceSet,
    ServiceState, SignalDispatcher, StopReason,
};
pub use config::Config;
