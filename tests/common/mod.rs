//! Shared fixtures: an in-memory duplex stream and protocol helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

use warden::control::codec::HANDLE_SIZE;
use warden::{
    Command, ConnStatus, ControlHub, Controller, Handle, Reply, Service, ServiceKind, ServiceState,
};

/// A fake client stream: reads drain whatever was fed (would-block when
/// empty), writes land in `output` for inspection.
#[derive(Default)]
pub struct TestStream {
    input: VecDeque<u8>,
    pub output: Vec<u8>,
}

impl Read for TestStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.input.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.input.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for TestStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One attached control connection.
pub struct Conn {
    pub ctrl: Controller<TestStream>,
}

impl Conn {
    pub fn new(hub: &ControlHub) -> Self {
        Conn {
            ctrl: hub.attach(TestStream::default()),
        }
    }

    /// Feed client bytes and run the read-readiness path.
    pub fn send(&mut self, bytes: &[u8]) -> ConnStatus {
        self.ctrl.stream_mut().input.extend(bytes.iter().copied());
        self.ctrl.read_ready().expect("read_ready")
    }

    /// Everything the server has written since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.ctrl.stream_mut().output)
    }

    /// FINDSERVICE round-trip: asserts the SERVICERECORD shape and returns
    /// the issued handle.
    pub fn find_service(
        &mut self,
        name: &str,
        state: ServiceState,
        target: ServiceState,
    ) -> Handle {
        let mut cmd = vec![Command::FindService as u8];
        cmd.extend_from_slice(&(name.len() as u16).to_ne_bytes());
        cmd.extend_from_slice(name.as_bytes());
        self.send(&cmd);

        let out = self.take_output();
        assert_eq!(out.len(), 3 + HANDLE_SIZE, "SERVICERECORD size");
        assert_eq!(out[0], Reply::ServiceRecord as u8);
        assert_eq!(out[1], state as u8, "state byte");
        assert_eq!(out[6], target as u8, "target state byte");
        Handle::from_ne_bytes([out[2], out[3], out[4], out[5]])
    }
}

pub fn handle_at(buf: &[u8], at: usize) -> Handle {
    Handle::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub fn cmd_with_handle(command: Command, flags: u8, handle: Handle) -> Vec<u8> {
    let mut cmd = vec![command as u8, flags];
    cmd.extend_from_slice(&handle.to_ne_bytes());
    cmd
}

pub fn cmd_handle_only(command: Command, handle: Handle) -> Vec<u8> {
    let mut cmd = vec![command as u8];
    cmd.extend_from_slice(&handle.to_ne_bytes());
    cmd
}

pub fn cmd_dep(command: Command, kind: u8, from: Handle, to: Handle) -> Vec<u8> {
    let mut cmd = vec![command as u8, kind];
    cmd.extend_from_slice(&from.to_ne_bytes());
    cmd.extend_from_slice(&to.to_ne_bytes());
    cmd
}

pub fn cmd_setenv(text: &str) -> Vec<u8> {
    let mut cmd = vec![Command::SetEnv as u8];
    cmd.extend_from_slice(&(text.len() as u16).to_ne_bytes());
    cmd.extend_from_slice(text.as_bytes());
    cmd
}

pub fn add_internal(hub: &ControlHub, name: &str) -> Rc<Service> {
    let service = Service::new(name, ServiceKind::Internal);
    hub.services().add_service(Rc::clone(&service));
    service
}

pub fn add_process(hub: &ControlHub, name: &str) -> Rc<Service> {
    let service = Service::new(name, ServiceKind::Process);
    hub.services().add_service(Rc::clone(&service));
    service
}
