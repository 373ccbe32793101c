//! One connection over a real non-blocking unix socket.

mod common;

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::{Duration, Instant};

use common::add_internal;
use warden::{CloseReason, Command, ConnStatus, ControlHub, Reply};

fn read_exact_with_retry(stream: &mut UnixStream, buf: &mut [u8]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => panic!("server closed early"),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "timed out waiting for reply");
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("client read: {e}"),
        }
    }
}

#[test]
fn query_version_over_socketpair() {
    let hub = ControlHub::default();
    let (client, server) = UnixStream::pair().expect("socketpair");
    client.set_nonblocking(true).unwrap();
    server.set_nonblocking(true).unwrap();

    let mut ctrl = hub.attach(server);
    let mut client = client;

    client.write_all(&[Command::QueryVersion as u8]).unwrap();
    let status = ctrl.read_ready().unwrap();
    assert_eq!(status, ConnStatus::Open);

    let mut reply = [0u8; 5];
    read_exact_with_retry(&mut client, &mut reply);
    assert_eq!(reply[0], Reply::CpVersion as u8);

    // Client hangup surfaces as an EOF close.
    drop(client);
    let status = ctrl.read_ready().unwrap();
    assert_eq!(status, ConnStatus::Closed(CloseReason::Eof));
}

#[test]
fn find_service_over_listener_socket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("control.sock");
    let listener = UnixListener::bind(&path).expect("bind");

    let hub = ControlHub::default();
    add_internal(&hub, "svc-1");

    let mut client = UnixStream::connect(&path).expect("connect");
    let (server, _addr) = listener.accept().expect("accept");
    server.set_nonblocking(true).unwrap();
    client.set_nonblocking(true).unwrap();

    let mut ctrl = hub.attach(server);

    let mut cmd = vec![Command::FindService as u8];
    cmd.extend_from_slice(&(5u16).to_ne_bytes());
    cmd.extend_from_slice(b"svc-1");
    client.write_all(&cmd).unwrap();

    ctrl.read_ready().unwrap();

    let mut reply = [0u8; 7];
    read_exact_with_retry(&mut client, &mut reply);
    assert_eq!(reply[0], Reply::ServiceRecord as u8);
    let handle = u32::from_ne_bytes([reply[2], reply[3], reply[4], reply[5]]);
    assert_ne!(handle, 0);
}
