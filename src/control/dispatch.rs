//! Command execution.
//!
//! One call per complete packet at the head of the read buffer. Handlers
//! follow the same discipline: length-check, parse, consume, mutate the
//! model (events raised by the mutation are appended by the router before
//! the handler returns), then queue the terminal reply. A handler never
//! holds a borrow of the shared connection state across a model call.

use std::io::{Read, Write};
use std::rc::Rc;

use tracing::trace;

use crate::core::{DepKind, LoadError, Service, ServiceState, StartError, StopError};

use super::codec::{self, Command, Handle, Reply, HANDLE_SIZE};
use super::conn::Controller;
use super::handle::Resolved;

/// Outcome of one dispatch attempt.
pub(super) enum Step {
    /// A packet was consumed and handled.
    Processed,
    /// The head packet is not complete yet.
    Incomplete,
    /// A protocol error latched the connection.
    Fatal,
}

// STARTSERVICE/STOPSERVICE/WAKESERVICE flag bits; unknown bits are fatal.
const FLAG_PIN: u8 = 1 << 0;
const FLAG_GENTLE: u8 = 1 << 1;
const FLAG_RESTART: u8 = 1 << 2;

fn read_handle(buf: &[u8], at: usize) -> Handle {
    Handle::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

impl<S: Read + Write> Controller<S> {
    pub(super) fn dispatch_one(&mut self) -> Step {
        let Some(&kind) = self.rbuf.as_slice().first() else {
            return Step::Incomplete;
        };
        let Some(command) = Command::from_u8(kind) else {
            trace!(kind, "unknown command byte");
            self.fatal_badreq();
            return Step::Fatal;
        };
        trace!(?command, "dispatch");

        match command {
            Command::QueryVersion => self.cmd_query_version(),
            Command::ListServices => self.cmd_list_services(),
            Command::FindService => self.cmd_find_or_load(false),
            Command::LoadService => self.cmd_find_or_load(true),
            Command::StartService => self.cmd_start(),
            Command::StopService => self.cmd_stop(),
            Command::WakeService => self.cmd_wake(),
            Command::ReleaseService => self.cmd_release(),
            Command::UnpinService => self.cmd_unpin(),
            Command::UnloadService => self.cmd_unload(),
            Command::ServiceStatus => self.cmd_service_status(),
            Command::AddDep => self.cmd_dep_edge(Command::AddDep),
            Command::RemDep => self.cmd_dep_edge(Command::RemDep),
            Command::EnableService => self.cmd_dep_edge(Command::EnableService),
            Command::QueryServiceName => self.cmd_query_name(),
            Command::CloseHandle => self.cmd_close_handle(),
            Command::Signal => self.cmd_signal(),
            Command::ListenEnv => self.cmd_listen_env(),
            Command::ListenSv => self.cmd_listen_sv(),
            Command::SetEnv => self.cmd_setenv(),
        }
    }

    // ---- small helpers ----

    fn reply(&self, bytes: &[u8]) {
        self.shared.borrow_mut().append(bytes);
    }

    fn reply_code(&self, code: Reply) {
        self.reply(&[code.as_u8()]);
    }

    fn resolve(&self, handle: Handle) -> Resolved {
        self.shared.borrow().handles.resolve(handle)
    }

    /// Live service for a handle, or queue NAK (stale and unknown handles
    /// are semantic errors for state-changing commands).
    fn live_or_nak(&self, handle: Handle) -> Option<Rc<Service>> {
        match self.resolve(handle) {
            Resolved::Live(service) => Some(service),
            Resolved::Stale | Resolved::Unknown => {
                self.reply_code(Reply::Nak);
                None
            }
        }
    }

    /// State-changing commands subscribe the issuing connection so it sees
    /// the transitions it causes.
    fn subscribe_service_events(&self) {
        self.shared.borrow_mut().subs.service_events = true;
    }

    /// ALREADYSS when the service already rests at the requested state;
    /// ACK while the transition is still in flight.
    fn reply_transition(&self, service: &Rc<Service>, wanted: ServiceState) {
        if service.state() == wanted {
            self.reply_code(Reply::AlreadySs);
        } else {
            self.reply_code(Reply::Ack);
        }
    }

    // ---- handlers ----

    fn cmd_query_version(&mut self) -> Step {
        self.rbuf.consume(1);
        self.reply(&codec::cpversion_reply());
        Step::Processed
    }

    fn cmd_list_services(&mut self) -> Step {
        self.rbuf.consume(1);
        for service in self.services.services_snapshot() {
            self.reply(&codec::svcinfo_record(&service));
        }
        Step::Processed
    }

    fn cmd_find_or_load(&mut self, load: bool) -> Step {
        let buf = self.rbuf.as_slice();
        if buf.len() < 3 {
            return Step::Incomplete;
        }
        let name_len = u16::from_ne_bytes([buf[1], buf[2]]) as usize;
        if buf.len() < 3 + name_len {
            return Step::Incomplete;
        }
        let name_bytes = buf[3..3 + name_len].to_vec();
        self.rbuf.consume(3 + name_len);

        // A name that is not valid UTF-8 cannot name any service.
        let name = match String::from_utf8(name_bytes) {
            Ok(name) => name,
            Err(_) => {
                self.reply_code(Reply::NoService);
                return Step::Processed;
            }
        };

        let found = if load {
            self.services.load_service(&name)
        } else {
            self.services
                .find_service(&name)
                .ok_or(LoadError::NotFound(name))
        };
        match found {
            Ok(service) => {
                let handle = self.shared.borrow_mut().handles.find_or_issue(&service);
                self.reply(&codec::service_record_reply(&service, handle));
            }
            Err(LoadError::NotFound(_)) => self.reply_code(Reply::NoService),
            Err(LoadError::Description { .. }) => self.reply_code(Reply::ServiceDescErr),
            Err(LoadError::Failed { .. }) => self.reply_code(Reply::ServiceLoadErr),
        }
        Step::Processed
    }

    fn cmd_start(&mut self) -> Step {
        let buf = self.rbuf.as_slice();
        if buf.len() < 2 + HANDLE_SIZE {
            return Step::Incomplete;
        }
        let flags = buf[1];
        let handle = read_handle(buf, 2);
        self.rbuf.consume(2 + HANDLE_SIZE);

        if flags & !FLAG_PIN != 0 {
            self.fatal_badreq();
            return Step::Fatal;
        }
        self.subscribe_service_events();
        let Some(service) = self.live_or_nak(handle) else {
            return Step::Processed;
        };
        if flags & FLAG_PIN != 0 {
            self.services.pin_start(&service);
        }
        match self.services.start_service(&service) {
            Ok(()) => self.reply_transition(&service, ServiceState::Started),
            Err(StartError::PinnedStopped) => self.reply_code(Reply::PinnedStopped),
        }
        Step::Processed
    }

    fn cmd_stop(&mut self) -> Step {
        let buf = self.rbuf.as_slice();
        if buf.len() < 2 + HANDLE_SIZE {
            return Step::Incomplete;
        }
        let flags = buf[1];
        let handle = read_handle(buf, 2);
        self.rbuf.consume(2 + HANDLE_SIZE);

        if flags & !(FLAG_PIN | FLAG_GENTLE | FLAG_RESTART) != 0 {
            self.fatal_badreq();
            return Step::Fatal;
        }
        self.subscribe_service_events();
        let Some(service) = self.live_or_nak(handle) else {
            return Step::Processed;
        };
        if flags & FLAG_PIN != 0 {
            self.services.pin_stop(&service);
        }
        if service.is_pinned_started() {
            self.reply_code(Reply::PinnedStarted);
            return Step::Processed;
        }

        if flags & FLAG_RESTART != 0 {
            match self.services.stop_service(&service, true) {
                Ok(()) => self.reply_code(Reply::Ack),
                Err(StopError::NotStarted) => self.reply_code(Reply::Nak),
                Err(StopError::PinnedStarted) => self.reply_code(Reply::PinnedStarted),
            }
            return Step::Processed;
        }

        if flags & FLAG_GENTLE != 0 {
            // Enumerate without stopping anything.
            let dependents = self.services.stop_dependents_of(&service);
            if !dependents.is_empty() {
                let handles: Vec<Handle> = {
                    let mut shared = self.shared.borrow_mut();
                    dependents
                        .iter()
                        .map(|d| shared.handles.find_or_issue(d))
                        .collect()
                };
                self.reply(&codec::dependents_reply(&handles));
                return Step::Processed;
            }
        }

        match self.services.stop_service(&service, false) {
            Ok(()) => self.reply_transition(&service, ServiceState::Stopped),
            Err(StopError::PinnedStarted) => self.reply_code(Reply::PinnedStarted),
            Err(StopError::NotStarted) => self.reply_code(Reply::Nak),
        }
        Step::Processed
    }

    fn cmd_wake(&mut self) -> Step {
        let buf = self.rbuf.as_slice();
        if buf.len() < 2 + HANDLE_SIZE {
            return Step::Incomplete;
        }
        let flags = buf[1];
        let handle = read_handle(buf, 2);
        self.rbuf.consume(2 + HANDLE_SIZE);

        if flags & !FLAG_PIN != 0 {
            self.fatal_badreq();
            return Step::Fatal;
        }
        self.subscribe_service_events();
        let Some(service) = self.live_or_nak(handle) else {
            return Step::Processed;
        };
        if flags & FLAG_PIN != 0 {
            self.services.pin_start(&service);
        }
        match self.services.wake_service(&service) {
            Ok(()) => self.reply_transition(&service, ServiceState::Started),
            Err(_) => self.reply_code(Reply::Nak),
        }
        Step::Processed
    }

    fn cmd_release(&mut self) -> Step {
        let buf = self.rbuf.as_slice();
        if buf.len() < 2 + HANDLE_SIZE {
            return Step::Incomplete;
        }
        let flags = buf[1];
        let handle = read_handle(buf, 2);
        self.rbuf.consume(2 + HANDLE_SIZE);

        if flags != 0 {
            self.fatal_badreq();
            return Step::Fatal;
        }
        self.subscribe_service_events();
        let Some(service) = self.live_or_nak(handle) else {
            return Step::Processed;
        };
        self.services.release_service(&service);
        self.reply_code(Reply::Ack);
        Step::Processed
    }

    fn cmd_unpin(&mut self) -> Step {
        let buf = self.rbuf.as_slice();
        if buf.len() < 1 + HANDLE_SIZE {
            return Step::Incomplete;
        }
        let handle = read_handle(buf, 1);
        self.rbuf.consume(1 + HANDLE_SIZE);

        let Some(service) = self.live_or_nak(handle) else {
            return Step::Processed;
        };
        self.services.unpin(&service);
        self.reply_code(Reply::Ack);
        Step::Processed
    }

    fn cmd_unload(&mut self) -> Step {
        let buf = self.rbuf.as_slice();
        if buf.len() < 1 + HANDLE_SIZE {
            return Step::Incomplete;
        }
        let handle = read_handle(buf, 1);
        self.rbuf.consume(1 + HANDLE_SIZE);

        let Resolved::Live(service) = self.resolve(handle) else {
            self.fatal_badreq();
            return Step::Fatal;
        };
        match self.services.remove_service(&service) {
            Ok(()) => self.reply_code(Reply::Ack),
            Err(_) => self.reply_code(Reply::Nak),
        }
        Step::Processed
    }

    fn cmd_service_status(&mut self) -> Step {
        let buf = self.rbuf.as_slice();
        if buf.len() < 1 + HANDLE_SIZE {
            return Step::Incomplete;
        }
        let handle = read_handle(buf, 1);
        self.rbuf.consume(1 + HANDLE_SIZE);

        let Resolved::Live(service) = self.resolve(handle) else {
            self.fatal_badreq();
            return Step::Fatal;
        };
        self.reply(&codec::service_status_reply(&service));
        Step::Processed
    }

    fn cmd_query_name(&mut self) -> Step {
        let buf = self.rbuf.as_slice();
        if buf.len() < 2 + HANDLE_SIZE {
            return Step::Incomplete;
        }
        // buf[1] is reserved.
        let handle = read_handle(buf, 2);
        self.rbuf.consume(2 + HANDLE_SIZE);

        let Resolved::Live(service) = self.resolve(handle) else {
            self.fatal_badreq();
            return Step::Fatal;
        };
        self.reply(&codec::service_name_reply(service.name()));
        Step::Processed
    }

    fn cmd_dep_edge(&mut self, which: Command) -> Step {
        let buf = self.rbuf.as_slice();
        if buf.len() < 2 + 2 * HANDLE_SIZE {
            return Step::Incomplete;
        }
        let kind_byte = buf[1];
        let from_handle = read_handle(buf, 2);
        let to_handle = read_handle(buf, 2 + HANDLE_SIZE);
        self.rbuf.consume(2 + 2 * HANDLE_SIZE);

        self.subscribe_service_events();
        let Some(kind) = DepKind::from_u8(kind_byte) else {
            self.reply_code(Reply::Nak);
            return Step::Processed;
        };
        let Some(from) = self.live_or_nak(from_handle) else {
            return Step::Processed;
        };
        let Some(to) = self.live_or_nak(to_handle) else {
            return Step::Processed;
        };

        let result = match which {
            Command::AddDep => self.services.add_dep(&from, &to, kind),
            Command::RemDep => self.services.rem_dep(&from, &to, kind),
            Command::EnableService => self.services.enable_service(&from, &to, kind),
            _ => unreachable!("not a dependency command"),
        };
        match result {
            Ok(()) => self.reply_code(Reply::Ack),
            Err(_) => self.reply_code(Reply::Nak),
        }
        Step::Processed
    }

    fn cmd_close_handle(&mut self) -> Step {
        let buf = self.rbuf.as_slice();
        if buf.len() < 1 + HANDLE_SIZE {
            return Step::Incomplete;
        }
        let handle = read_handle(buf, 1);
        self.rbuf.consume(1 + HANDLE_SIZE);

        self.shared.borrow_mut().handles.close(handle);
        self.reply_code(Reply::Ack);
        Step::Processed
    }

    fn cmd_signal(&mut self) -> Step {
        let buf = self.rbuf.as_slice();
        if buf.len() < 1 + 4 + HANDLE_SIZE {
            return Step::Incomplete;
        }
        let signum = i32::from_ne_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let handle = read_handle(buf, 5);
        self.rbuf.consume(1 + 4 + HANDLE_SIZE);

        let Some(service) = self.live_or_nak(handle) else {
            return Step::Processed;
        };
        match self.services.signal_service(&service, signum) {
            Ok(()) => self.reply_code(Reply::Ack),
            Err(_) => self.reply_code(Reply::Nak),
        }
        Step::Processed
    }

    fn cmd_listen_env(&mut self) -> Step {
        self.rbuf.consume(1);
        self.shared.borrow_mut().subs.env_events = true;
        self.reply_code(Reply::Ack);
        Step::Processed
    }

    fn cmd_listen_sv(&mut self) -> Step {
        self.rbuf.consume(1);
        self.subscribe_service_events();
        self.reply_code(Reply::Ack);
        Step::Processed
    }

    fn cmd_setenv(&mut self) -> Step {
        let buf = self.rbuf.as_slice();
        if buf.len() < 3 {
            return Step::Incomplete;
        }
        let len = u16::from_ne_bytes([buf[1], buf[2]]) as usize;
        if buf.len() < 3 + len {
            return Step::Incomplete;
        }
        let payload = buf[3..3 + len].to_vec();
        self.rbuf.consume(3 + len);

        if len == 0 {
            self.fatal_badreq();
            return Step::Fatal;
        }
        let Ok(text) = String::from_utf8(payload) else {
            self.fatal_badreq();
            return Step::Fatal;
        };
        // The store notifies the router, which broadcasts the ENVEVENT to
        // every subscribed connection (this one included) before the ACK.
        match self.env.apply(&text) {
            Ok(_) => self.reply_code(Reply::Ack),
            Err(_) => {
                self.fatal_badreq();
                return Step::Fatal;
            }
        }
        Step::Processed
    }
}
