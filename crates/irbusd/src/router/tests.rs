use std::io::Read;
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::Duration;

use tempfile::{TempDir, tempdir};

use super::*;
use crate::registry::{FdRegistry, Originator, Role};

fn test_router() -> (Router, TempDir) {
    let dir = tempdir().expect("tempdir");
    let bind = |name: &str| UnixListener::bind(dir.path().join(name)).expect("bind");
    let registry = FdRegistry::new(bind("client"), bind("backend"), bind("control"));
    (Router::new(registry), dir)
}

fn add_client(router: &mut Router) -> (RawFd, UnixStream) {
    let (local, remote) = UnixStream::pair().expect("socketpair");
    remote
        .set_read_timeout(Some(Duration::from_millis(500)))
        .expect("read timeout");
    let fd = router.registry_mut().add_client(local);
    (fd, remote)
}

fn add_backend(router: &mut Router, id: &str) -> (RawFd, UnixStream) {
    let (local, remote) = UnixStream::pair().expect("socketpair");
    remote
        .set_read_timeout(Some(Duration::from_millis(500)))
        .expect("read timeout");
    let data = tempfile::tempfile().expect("tempfile");
    let fd = router.registry_mut().add_backend(local, data);
    router.registry_mut().find_mut(fd).expect("record").backend_id = id.into();
    (fd, remote)
}

fn read_some(stream: &mut UnixStream) -> String {
    let mut buffer = [0_u8; 512];
    let n = stream.read(&mut buffer).expect("read");
    String::from_utf8_lossy(&buffer[..n]).into_owned()
}

#[test]
fn connect_is_symmetric() {
    let (mut router, _dir) = test_router();
    let (client_fd, _client) = add_client(&mut router);
    let (backend_fd, _backend) = add_backend(&mut router, "acme@/dev/ir0");

    assert!(router.connect(Originator::Peer(client_fd), backend_fd));

    let registry = router.registry();
    assert_eq!(
        registry.find(client_fd).and_then(|r| r.connected_to()),
        Some(Originator::Peer(backend_fd))
    );
    assert_eq!(
        registry.find(backend_fd).and_then(|r| r.connected_to()),
        Some(Originator::Peer(client_fd))
    );
    assert!(registry.find(client_fd).expect("client").ticks_armed());
    assert!(!registry.find(backend_fd).expect("backend").ticks_armed());
}

#[test]
fn local_connect_marks_backend_side_only() {
    let (mut router, _dir) = test_router();
    let (backend_fd, _backend) = add_backend(&mut router, "acme@/dev/ir0");

    assert!(router.connect(Originator::Local, backend_fd));
    assert_eq!(
        router.registry().find(backend_fd).and_then(|r| r.connected_to()),
        Some(Originator::Local)
    );
    let armed = router.registry().iter().filter(|r| r.ticks_armed()).count();
    assert_eq!(armed, 0);
}

#[test]
fn connect_to_missing_backend_fails() {
    let (mut router, _dir) = test_router();
    let (client_fd, _client) = add_client(&mut router);
    assert!(!router.connect(Originator::Peer(client_fd), 9999));
}

#[test]
fn connect_refuses_to_steal_a_busy_backend() {
    let (mut router, _dir) = test_router();
    let (first_fd, _first) = add_client(&mut router);
    let (second_fd, _second) = add_client(&mut router);
    let (backend_fd, _backend) = add_backend(&mut router, "acme@/dev/ir0");
    assert!(router.connect(Originator::Peer(first_fd), backend_fd));

    assert!(!router.connect(Originator::Peer(second_fd), backend_fd));

    // The first routing survives intact and symmetric.
    let registry = router.registry();
    assert_eq!(
        registry.find(backend_fd).and_then(|r| r.connected_to()),
        Some(Originator::Peer(first_fd))
    );
    assert_eq!(
        registry.find(first_fd).and_then(|r| r.connected_to()),
        Some(Originator::Peer(backend_fd))
    );
    assert!(registry.find(first_fd).expect("first client").ticks_armed());
    assert_eq!(registry.find(second_fd).and_then(|r| r.connected_to()), None);
    assert!(!registry.find(second_fd).expect("second client").ticks_armed());

    // A locally connected backend (registration in progress) is busy too.
    let (local_backend_fd, _local_backend) = add_backend(&mut router, "late@/dev/ir1");
    assert!(router.connect(Originator::Local, local_backend_fd));
    assert!(!router.connect(Originator::Peer(second_fd), local_backend_fd));
}

#[test]
fn disconnect_clears_both_sides_from_either_end() {
    let (mut router, _dir) = test_router();
    let (client_fd, _client) = add_client(&mut router);
    let (backend_fd, _backend) = add_backend(&mut router, "acme@/dev/ir0");
    router.connect(Originator::Peer(client_fd), backend_fd);

    assert!(router.disconnect(backend_fd));

    let registry = router.registry();
    assert_eq!(registry.find(client_fd).and_then(|r| r.connected_to()), None);
    assert_eq!(registry.find(backend_fd).and_then(|r| r.connected_to()), None);
    let armed = registry.iter().filter(|r| r.ticks_armed()).count();
    assert_eq!(armed, 0);
}

#[test]
fn disconnect_on_idle_record_is_a_noop() {
    let (mut router, _dir) = test_router();
    let (client_fd, _client) = add_client(&mut router);
    assert!(!router.disconnect(client_fd));
    assert!(!router.disconnect(client_fd));
    assert_eq!(router.registry().find(client_fd).and_then(|r| r.connected_to()), None);
}

#[test]
fn armed_ticks_match_in_flight_routings() {
    let (mut router, _dir) = test_router();
    let (a_fd, _a) = add_client(&mut router);
    let (b_fd, _b) = add_client(&mut router);
    let (x_fd, _x) = add_backend(&mut router, "x@/dev/ir0");
    let (y_fd, _y) = add_backend(&mut router, "y@/dev/ir1");

    router.connect(Originator::Peer(a_fd), x_fd);
    router.connect(Originator::Peer(b_fd), y_fd);
    assert_eq!(router.registry().iter().filter(|r| r.ticks_armed()).count(), 2);

    router.disconnect(a_fd);
    assert_eq!(router.registry().iter().filter(|r| r.ticks_armed()).count(), 1);

    router.disconnect(y_fd);
    assert_eq!(router.registry().iter().filter(|r| r.ticks_armed()).count(), 0);
}

#[test]
fn broadcast_skips_clients_in_command_mode() {
    let (mut router, _dir) = test_router();
    let (busy_fd, mut busy) = add_client(&mut router);
    let (_idle_fd, mut idle) = add_client(&mut router);
    let (backend_fd, _backend) = add_backend(&mut router, "acme@/dev/ir0");
    router.connect(Originator::Peer(busy_fd), backend_fd);

    router.broadcast_event("0000000000000001 00 KEY_POWER MyRemote");

    assert_eq!(read_some(&mut idle), "0000000000000001 00 KEY_POWER MyRemote\n");
    busy.set_read_timeout(Some(Duration::from_millis(50))).expect("timeout");
    let mut buffer = [0_u8; 64];
    assert!(busy.read(&mut buffer).is_err(), "busy client must receive nothing");
}

#[test]
fn broadcast_preserves_event_order() {
    let (mut router, _dir) = test_router();
    let (_fd, mut client) = add_client(&mut router);

    router.broadcast_event("event one");
    router.broadcast_event("event two");

    let mut collected = String::new();
    while !collected.ends_with("event two\n") {
        collected.push_str(&read_some(&mut client));
    }
    assert_eq!(collected, "event one\nevent two\n");
}

#[test]
fn broadcast_removes_unwritable_clients() {
    let (mut router, _dir) = test_router();
    let (dead_fd, dead) = add_client(&mut router);
    let (_live_fd, mut live) = add_client(&mut router);
    drop(dead);

    // A first write may land in the socket buffer before the kernel reports
    // the hangup; the second is guaranteed to fail.
    router.broadcast_event("first");
    router.broadcast_event("second");

    assert!(router.registry().find(dead_fd).is_none());
    let mut collected = String::new();
    while !collected.ends_with("second\n") {
        collected.push_str(&read_some(&mut live));
    }
}

#[test]
fn tick_times_out_unanswered_commands() {
    let (mut router, _dir) = test_router();
    let (client_fd, mut client) = add_client(&mut router);
    let (backend_fd, _backend) = add_backend(&mut router, "acme@/dev/ir0");
    router.connect(Originator::Peer(client_fd), backend_fd);
    router.registry_mut().find_mut(client_fd).expect("client").expected =
        "SEND_ONCE X Y".into();

    for _ in 0..COMMAND_TIMEOUT_TICKS {
        router.tick();
    }

    assert_eq!(
        read_some(&mut client),
        "BEGIN\nSEND_ONCE X Y\nERROR\nDATA\n1\nTIMEOUT\nEND\n"
    );
    assert_eq!(router.registry().find(client_fd).and_then(|r| r.connected_to()), None);
    assert_eq!(
        router.registry().find(backend_fd).and_then(|r| r.connected_to()),
        None
    );
}

#[test]
fn tick_leaves_unarmed_records_alone() {
    let (mut router, _dir) = test_router();
    let (client_fd, _client) = add_client(&mut router);
    for _ in 0..COMMAND_TIMEOUT_TICKS * 2 {
        router.tick();
    }
    assert!(router.registry().find(client_fd).is_some());
}

#[test]
fn backend_loss_notifies_waiting_client_and_removes_pair() {
    let (mut router, _dir) = test_router();
    let (client_fd, mut client) = add_client(&mut router);
    let (backend_fd, _backend) = add_backend(&mut router, "acme@/dev/ir0");
    router.set_default_backend(Some(backend_fd));
    router.connect(Originator::Peer(client_fd), backend_fd);
    router.registry_mut().find_mut(client_fd).expect("client").expected = "LIST".into();
    let data_fd = router
        .registry()
        .find(backend_fd)
        .and_then(|r| r.peer_fd)
        .expect("peer fd");

    router.remove_connection(backend_fd, "test");

    assert!(router.registry().find(backend_fd).is_none());
    assert!(router.registry().find(data_fd).is_none());
    assert_eq!(router.default_backend(), None);
    assert_eq!(
        read_some(&mut client),
        "BEGIN\nLIST\nERROR\nDATA\n1\nbackend closed connection\nEND\n"
    );
    assert_eq!(router.registry().find(client_fd).and_then(|r| r.connected_to()), None);
}

#[test]
fn losing_the_default_backend_promotes_a_registered_one() {
    let (mut router, _dir) = test_router();
    let (first_fd, _first) = add_backend(&mut router, "first@/dev/ir0");
    let (second_fd, _second) = add_backend(&mut router, "second@/dev/ir1");
    let (unregistered_fd, _unregistered) = add_backend(&mut router, "");
    router.set_default_backend(Some(second_fd));

    router.remove_connection(second_fd, "test");

    assert_eq!(router.default_backend(), Some(first_fd));

    router.remove_connection(first_fd, "test");
    assert_eq!(router.default_backend(), None);
    assert!(router.registry().find(unregistered_fd).is_some());
}

#[test]
fn sighup_reaches_idle_clients_only() {
    let (mut router, _dir) = test_router();
    let (busy_fd, mut busy) = add_client(&mut router);
    let (_idle_fd, mut idle) = add_client(&mut router);
    let (backend_fd, _backend) = add_backend(&mut router, "acme@/dev/ir0");
    router.connect(Originator::Peer(busy_fd), backend_fd);

    router.broadcast_sighup();

    assert_eq!(read_some(&mut idle), "BEGIN\nSIGHUP\nEND\n");
    busy.set_read_timeout(Some(Duration::from_millis(50))).expect("timeout");
    let mut buffer = [0_u8; 64];
    assert!(busy.read(&mut buffer).is_err());
}
