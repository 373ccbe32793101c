//! The connection controller.
//!
//! One `Controller` per accepted client stream. It owns the read buffer and
//! the stream; the write buffer, handle table, subscription flags, and fatal
//! latch live in a shared cell so the event router can append into the
//! connection while a command on another connection is mid-dispatch.
//!
//! The controller is driven from outside by a readiness loop: call
//! [`Controller::read_ready`] / [`Controller::write_ready`] when the stream
//! polls readable/writable, and consult [`Controller::wants_read`] /
//! [`Controller::wants_write`] for the interest set. Nothing here blocks.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::core::{EnvStore, ServiceSet};

use super::buffer::{BufferLimits, FillOutcome, ReadBuffer, WriteBuffer};
use super::codec::Reply;
use super::dispatch::Step;
use super::events::{EmitMode, EventRouter, SubscriptionFlags};
use super::handle::HandleTable;

/// Why a connection is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its end.
    Eof,
    /// A fatal protocol error was replied and has drained.
    ProtocolError,
    /// The write buffer exceeded its hard cap.
    WriteOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Open,
    Closed(CloseReason),
}

/// Connection state shared with the event router.
pub struct ConnShared {
    pub(super) wbuf: WriteBuffer,
    pub(super) handles: HandleTable,
    pub(super) subs: SubscriptionFlags,
    pub(super) emit_mode: EmitMode,
    /// Once set, no further bytes are decoded; pending writes still drain.
    pub(super) fatal: bool,
    pub(super) failure: Option<CloseReason>,
}

impl ConnShared {
    fn new(limits: BufferLimits) -> Self {
        ConnShared {
            wbuf: WriteBuffer::new(limits),
            handles: HandleTable::new(),
            subs: SubscriptionFlags::default(),
            emit_mode: EmitMode::default(),
            fatal: false,
            failure: None,
        }
    }

    /// Queue outbound bytes. An overflow marks the connection failed
    /// rather than dropping part of the stream.
    pub(super) fn append(&mut self, bytes: &[u8]) {
        if self.failure.is_some() {
            return;
        }
        if let Err(err) = self.wbuf.append(bytes) {
            warn!(%err, "closing connection: write buffer overflow");
            self.failure = Some(CloseReason::WriteOverflow);
        }
    }
}

/// Drives one client connection over a non-blocking byte stream.
pub struct Controller<S> {
    pub(super) stream: S,
    pub(super) rbuf: ReadBuffer,
    pub(super) shared: Rc<RefCell<ConnShared>>,
    pub(super) services: Rc<ServiceSet>,
    pub(super) env: Rc<EnvStore>,
    router: Rc<EventRouter>,
    eof: bool,
}

impl<S> Controller<S> {
    pub(super) fn new(
        stream: S,
        services: Rc<ServiceSet>,
        env: Rc<EnvStore>,
        router: Rc<EventRouter>,
        limits: BufferLimits,
    ) -> Self {
        let shared = Rc::new(RefCell::new(ConnShared::new(limits)));
        router.register(&shared);
        debug!("control connection open");
        Controller {
            stream,
            rbuf: ReadBuffer::new(),
            shared,
            services,
            env,
            router,
            eof: false,
        }
    }

    /// Whether the external loop should watch for read readiness.
    pub fn wants_read(&self) -> bool {
        let shared = self.shared.borrow();
        !self.eof
            && !shared.fatal
            && shared.failure.is_none()
            && !shared.wbuf.over_high_water()
    }

    /// Whether the external loop should watch for write readiness.
    pub fn wants_write(&self) -> bool {
        !self.shared.borrow().wbuf.is_empty()
    }

    /// Set the protocol compatibility mode for this connection.
    pub fn set_emit_mode(&self, mode: EmitMode) {
        self.shared.borrow_mut().emit_mode = mode;
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    fn status(&self) -> ConnStatus {
        let shared = self.shared.borrow();
        if let Some(reason) = shared.failure {
            return ConnStatus::Closed(reason);
        }
        if shared.fatal && shared.wbuf.is_empty() {
            return ConnStatus::Closed(CloseReason::ProtocolError);
        }
        if self.eof && shared.wbuf.is_empty() {
            return ConnStatus::Closed(CloseReason::Eof);
        }
        ConnStatus::Open
    }
}

impl<S: Read + Write> Controller<S> {
    /// The stream polled readable: pull bytes, run every complete command,
    /// and opportunistically flush the output.
    pub fn read_ready(&mut self) -> io::Result<ConnStatus> {
        if self.wants_read() {
            match self.rbuf.fill(&mut self.stream)? {
                FillOutcome::Eof => {
                    debug!("control connection eof");
                    self.eof = true;
                }
                FillOutcome::WouldBlock => {}
            }
            self.process_packets();
        }
        self.flush()?;
        Ok(self.status())
    }

    /// The stream polled writable: drain the write buffer.
    pub fn write_ready(&mut self) -> io::Result<ConnStatus> {
        self.flush()?;
        Ok(self.status())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut shared = self.shared.borrow_mut();
        shared.wbuf.flush(&mut self.stream)?;
        Ok(())
    }

    fn process_packets(&mut self) {
        loop {
            if self.shared.borrow().fatal || self.shared.borrow().failure.is_some() {
                return;
            }
            match self.dispatch_one() {
                Step::Processed => continue,
                Step::Incomplete => return,
                Step::Fatal => return,
            }
        }
    }

    /// Reply BADREQ and latch the fatal state: reads stop, writes drain.
    pub(super) fn fatal_badreq(&mut self) {
        warn!("fatal protocol error; connection becomes write-only");
        let mut shared = self.shared.borrow_mut();
        shared.append(&[Reply::BadReq.as_u8()]);
        shared.fatal = true;
    }
}

impl<S> Drop for Controller<S> {
    fn drop(&mut self) {
        debug!("control connection closed");
        self.router.unregister(&self.shared);
    }
}
