//! The control protocol wire format.
//!
//! Every packet starts with a one-byte kind. Command, reply, and info-event
//! kinds occupy disjoint regions of the byte space so a stream position can
//! always be classified from its first byte. Multi-byte integers are
//! host-endian: this is a local-socket protocol between processes on one
//! machine, never a network format.

use crate::core::{EventCode, Service};

/// Connection-scoped service identifier. Value 0 is reserved and never
/// issued.
pub type Handle = u32;

pub const HANDLE_SIZE: usize = std::mem::size_of::<Handle>();

/// Service status block: state, target state, flags, stop reason, two
/// reserved bytes, exit-status-or-pid.
pub const STATUS_SIZE: usize = 6 + 4;

/// Extended (v5) status block: as above plus a second word carrying the
/// exit-code detail.
pub const STATUS5_SIZE: usize = 6 + 2 * 4;

pub const SERVICE_EVENT_SIZE: usize = 7 + STATUS_SIZE;
pub const SERVICE_EVENT5_SIZE: usize = 7 + STATUS5_SIZE;

/// Protocol version range advertised by QUERYVERSION.
pub const MIN_PROTOCOL_VERSION: u16 = 1;
pub const PROTOCOL_VERSION: u16 = 5;

/// Status flag bits.
pub const FLAG_HAS_CONSOLE: u8 = 1 << 0;
pub const FLAG_WAITING_CONSOLE: u8 = 1 << 1;
pub const FLAG_START_SKIPPED: u8 = 1 << 2;
pub const FLAG_MARKED_ACTIVE: u8 = 1 << 3;
pub const FLAG_HAS_PID: u8 = 1 << 4;

/// Client-to-server command kinds (0..=49).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    QueryVersion = 0,
    FindService = 1,
    LoadService = 2,
    StartService = 3,
    StopService = 4,
    WakeService = 5,
    ReleaseService = 6,
    UnpinService = 7,
    UnloadService = 8,
    ListServices = 9,
    ServiceStatus = 10,
    AddDep = 11,
    RemDep = 12,
    EnableService = 13,
    QueryServiceName = 14,
    CloseHandle = 15,
    Signal = 16,
    ListenEnv = 17,
    ListenSv = 18,
    SetEnv = 19,
}

impl Command {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Command::QueryVersion,
            1 => Command::FindService,
            2 => Command::LoadService,
            3 => Command::StartService,
            4 => Command::StopService,
            5 => Command::WakeService,
            6 => Command::ReleaseService,
            7 => Command::UnpinService,
            8 => Command::UnloadService,
            9 => Command::ListServices,
            10 => Command::ServiceStatus,
            11 => Command::AddDep,
            12 => Command::RemDep,
            13 => Command::EnableService,
            14 => Command::QueryServiceName,
            15 => Command::CloseHandle,
            16 => Command::Signal,
            17 => Command::ListenEnv,
            18 => Command::ListenSv,
            19 => Command::SetEnv,
            _ => return None,
        })
    }
}

/// Server-to-client solicited reply kinds (50..=99).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Ack = 50,
    Nak = 51,
    BadReq = 52,
    CpVersion = 53,
    ServiceRecord = 54,
    NoService = 55,
    AlreadySs = 56,
    SvcInfo = 57,
    ServiceName = 58,
    ServiceStatus = 59,
    PinnedStarted = 60,
    PinnedStopped = 61,
    Dependents = 62,
    ServiceDescErr = 63,
    ServiceLoadErr = 64,
}

impl Reply {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Server-to-client unsolicited info-event kinds (100..).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Info {
    ServiceEvent = 100,
    EnvEvent = 101,
    ServiceEvent5 = 102,
}

impl Info {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

fn status_flags(service: &Service) -> u8 {
    let mut flags = 0;
    if service.has_console() {
        flags |= FLAG_HAS_CONSOLE;
    }
    if service.is_waiting_for_console() {
        flags |= FLAG_WAITING_CONSOLE;
    }
    if service.was_start_skipped() {
        flags |= FLAG_START_SKIPPED;
    }
    if service.is_marked_active() {
        flags |= FLAG_MARKED_ACTIVE;
    }
    if service.pid().is_some() {
        flags |= FLAG_HAS_PID;
    }
    flags
}

/// Legacy status block: the final word is the pid while a process is
/// running, the exit status otherwise.
pub fn status_block(service: &Service) -> [u8; STATUS_SIZE] {
    let mut out = [0u8; STATUS_SIZE];
    out[0] = service.state().as_u8();
    out[1] = service.target_state().as_u8();
    out[2] = status_flags(service);
    out[3] = service.stop_reason().as_u8();
    let word = service.pid().unwrap_or_else(|| service.exit_status());
    out[6..10].copy_from_slice(&word.to_ne_bytes());
    out
}

/// Extended status block: both words are present at fixed offsets.
pub fn status_block_v5(service: &Service) -> [u8; STATUS5_SIZE] {
    let mut out = [0u8; STATUS5_SIZE];
    out[..6].copy_from_slice(&status_block(service)[..6]);
    let word = service.pid().unwrap_or_else(|| service.exit_status());
    out[6..10].copy_from_slice(&word.to_ne_bytes());
    let detail = if service.pid().is_some() {
        0
    } else {
        service.exit_code()
    };
    out[10..14].copy_from_slice(&detail.to_ne_bytes());
    out
}

pub fn cpversion_reply() -> [u8; 5] {
    let mut out = [0u8; 5];
    out[0] = Reply::CpVersion.as_u8();
    out[1..3].copy_from_slice(&MIN_PROTOCOL_VERSION.to_ne_bytes());
    out[3..5].copy_from_slice(&PROTOCOL_VERSION.to_ne_bytes());
    out
}

/// SERVICERECORD: kind, state, handle, target state.
pub fn service_record_reply(service: &Service, handle: Handle) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + HANDLE_SIZE);
    out.push(Reply::ServiceRecord.as_u8());
    out.push(service.state().as_u8());
    out.extend_from_slice(&handle.to_ne_bytes());
    out.push(service.target_state().as_u8());
    out
}

/// SVCINFO: kind, name length, status block, name bytes. The name length is
/// one byte on the wire; longer names are truncated here.
pub fn svcinfo_record(service: &Service) -> Vec<u8> {
    let name = service.name().as_bytes();
    let name_len = name.len().min(u8::MAX as usize);
    let mut out = Vec::with_capacity(2 + STATUS_SIZE + name_len);
    out.push(Reply::SvcInfo.as_u8());
    out.push(name_len as u8);
    out.extend_from_slice(&status_block(service));
    out.extend_from_slice(&name[..name_len]);
    out
}

/// SERVICENAME: kind, reserved, u16 length, name bytes.
pub fn service_name_reply(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    let mut out = Vec::with_capacity(4 + len);
    out.push(Reply::ServiceName.as_u8());
    out.push(0);
    out.extend_from_slice(&(len as u16).to_ne_bytes());
    out.extend_from_slice(&bytes[..len]);
    out
}

/// SERVICESTATUS: kind, reserved, status block.
pub fn service_status_reply(service: &Service) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + STATUS_SIZE);
    out.push(Reply::ServiceStatus.as_u8());
    out.push(0);
    out.extend_from_slice(&status_block(service));
    out
}

/// DEPENDENTS: kind, native-width count, count handles.
pub fn dependents_reply(handles: &[Handle]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + std::mem::size_of::<usize>() + handles.len() * HANDLE_SIZE);
    out.push(Reply::Dependents.as_u8());
    out.extend_from_slice(&handles.len().to_ne_bytes());
    for handle in handles {
        out.extend_from_slice(&handle.to_ne_bytes());
    }
    out
}

/// Legacy SERVICEEVENT info packet.
pub fn service_event_packet(handle: Handle, event: EventCode, service: &Service) -> Vec<u8> {
    let mut out = Vec::with_capacity(SERVICE_EVENT_SIZE);
    out.push(Info::ServiceEvent.as_u8());
    out.push(SERVICE_EVENT_SIZE as u8);
    out.extend_from_slice(&handle.to_ne_bytes());
    out.push(event.as_u8());
    out.extend_from_slice(&status_block(service));
    out
}

/// Extended SERVICEEVENT5 info packet.
pub fn service_event5_packet(handle: Handle, event: EventCode, service: &Service) -> Vec<u8> {
    let mut out = Vec::with_capacity(SERVICE_EVENT5_SIZE);
    out.push(Info::ServiceEvent5.as_u8());
    out.push(SERVICE_EVENT5_SIZE as u8);
    out.extend_from_slice(&handle.to_ne_bytes());
    out.push(event.as_u8());
    out.extend_from_slice(&status_block_v5(service));
    out
}

/// ENVEVENT info packet: kind, header size, flags, u16 payload length
/// (including the terminating NUL), payload, NUL.
pub fn env_event_packet(text: &str, overridden: bool) -> Vec<u8> {
    let payload = text.as_bytes();
    let len = (payload.len() + 1) as u16;
    let mut out = Vec::with_capacity(3 + 2 + payload.len() + 1);
    out.push(Info::EnvEvent.as_u8());
    out.push((3 + std::mem::size_of::<u16>()) as u8);
    out.push(u8::from(overridden));
    out.extend_from_slice(&len.to_ne_bytes());
    out.extend_from_slice(payload);
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ServiceKind, ServiceState};

    #[test]
    fn kind_regions_are_disjoint() {
        for raw in 0..=19u8 {
            assert!(Command::from_u8(raw).is_some());
        }
        assert!(Command::from_u8(20).is_none());
        assert!(Reply::Ack.as_u8() >= 50);
        assert!(Info::ServiceEvent.as_u8() >= 100);
    }

    #[test]
    fn status_block_layout() {
        let svc = Service::new("s", ServiceKind::Process);
        svc.set_pid(Some(4242));
        let block = status_block(&svc);
        assert_eq!(block[0], ServiceState::Stopped.as_u8());
        assert_eq!(block[1], ServiceState::Stopped.as_u8());
        assert_eq!(block[2], FLAG_HAS_PID);
        assert_eq!(block[3], 0);
        assert_eq!(&block[4..6], &[0, 0]);
        assert_eq!(i32::from_ne_bytes(block[6..10].try_into().unwrap()), 4242);
    }

    #[test]
    fn v5_block_carries_exit_detail() {
        let svc = Service::new("s", ServiceKind::Process);
        svc.set_exit_status(3, 9);
        let block = status_block_v5(&svc);
        assert_eq!(i32::from_ne_bytes(block[6..10].try_into().unwrap()), 3);
        assert_eq!(i32::from_ne_bytes(block[10..14].try_into().unwrap()), 9);
    }

    #[test]
    fn service_record_shape() {
        let svc = Service::new("s", ServiceKind::Internal);
        let reply = service_record_reply(&svc, 7);
        assert_eq!(reply.len(), 3 + HANDLE_SIZE);
        assert_eq!(reply[0], Reply::ServiceRecord.as_u8());
        assert_eq!(
            Handle::from_ne_bytes(reply[2..6].try_into().unwrap()),
            7
        );
        assert_eq!(reply[6], ServiceState::Stopped.as_u8());
    }

    #[test]
    fn event_packets_declare_their_size() {
        let svc = Service::new("s", ServiceKind::Internal);
        let legacy = service_event_packet(9, EventCode::Started, &svc);
        assert_eq!(legacy.len(), SERVICE_EVENT_SIZE);
        assert_eq!(legacy[1] as usize, legacy.len());

        let v5 = service_event5_packet(9, EventCode::Started, &svc);
        assert_eq!(v5.len(), SERVICE_EVENT5_SIZE);
        assert_eq!(v5[1] as usize, v5.len());
        assert_eq!(v5[6], EventCode::Started.as_u8());
    }

    #[test]
    fn env_event_payload_is_nul_terminated() {
        let packet = env_event_packet("FOO=bar", false);
        assert_eq!(packet[0], Info::EnvEvent.as_u8());
        assert_eq!(packet[1], 5);
        assert_eq!(packet[2], 0);
        let len = u16::from_ne_bytes(packet[3..5].try_into().unwrap());
        assert_eq!(len as usize, "FOO=bar".len() + 1);
        assert_eq!(&packet[5..12], b"FOO=bar");
        assert_eq!(*packet.last().unwrap(), 0);
    }
}
