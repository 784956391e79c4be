//! Socket set tests: capacity, token staleness, queued readiness purge.

use layersock_core::backend::BackendKind;
use layersock_core::interest::Interest;
use layersock_core::socket_set::{SocketSet, RESERVED_TOKEN};
use layersock_core::Error;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

fn pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

#[test]
fn test_capacity_is_enforced() {
    let mut set: SocketSet<&str> = SocketSet::new(BackendKind::Poll, 1).unwrap();
    let (a, _a2) = pair();
    let (b, _b2) = pair();
    set.insert_with(a.as_raw_fd(), Interest::READ, |_| "a").unwrap();
    let err = set
        .insert_with(b.as_raw_fd(), Interest::READ, |_| "b")
        .unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted { capacity: 1 }));
    assert_eq!(set.len(), 1);
    assert!(set.is_full());
}

#[test]
fn test_token_is_retired_on_remove() {
    let mut set: SocketSet<u32> = SocketSet::new(BackendKind::Poll, 4).unwrap();
    let (a, _a2) = pair();
    let (b, _b2) = pair();

    let first = set.insert_with(a.as_raw_fd(), Interest::READ, |_| 1).unwrap();
    assert_eq!(set.remove(first), Some(1));

    // slot is reused, token is not
    let second = set.insert_with(b.as_raw_fd(), Interest::READ, |_| 2).unwrap();
    assert_ne!(first, second);
    assert!(set.get_mut(first).is_none());
    assert_eq!(set.get_mut(second), Some(&mut 2));
    assert!(set.remove(first).is_none());
}

#[test]
fn test_insert_sees_own_token() {
    let mut set: SocketSet<Option<layersock_core::backend::Token>> =
        SocketSet::new(BackendKind::Edge, 4).unwrap();
    let (a, _a2) = pair();
    let token = set.insert_with(a.as_raw_fd(), Interest::READ, Some).unwrap();
    assert_eq!(set.get_mut(token).copied(), Some(Some(token)));
}

#[test]
fn test_remove_purges_collected_readiness() {
    for kind in [BackendKind::Poll, BackendKind::Edge, BackendKind::Completion] {
        let mut set: SocketSet<u8> = SocketSet::new(kind, 4).unwrap();
        let (a, mut a2) = pair();
        let (b, mut b2) = pair();
        let ta = set.insert_with(a.as_raw_fd(), Interest::READ, |_| 0).unwrap();
        let tb = set.insert_with(b.as_raw_fd(), Interest::READ, |_| 1).unwrap();

        a2.write_all(b"x").unwrap();
        b2.write_all(b"y").unwrap();
        assert_eq!(set.wait(Some(Duration::from_millis(50))).unwrap(), 2, "{kind}");

        // closing one socket while its event is still queued
        set.remove(ta);
        let ev = set.next_ready().expect("remaining event");
        assert_eq!(ev.token, tb);
        assert!(set.next_ready().is_none(), "{kind}: stale event survived removal");
    }
}

#[test]
fn test_set_interest_rearms() {
    let mut set: SocketSet<()> = SocketSet::new(BackendKind::Completion, 4).unwrap();
    let (a, _a2) = pair();
    let token = set.insert_with(a.as_raw_fd(), Interest::NONE, |_| ()).unwrap();
    assert_eq!(set.wait(Some(Duration::from_millis(10))).unwrap(), 0);

    set.set_interest(token, Interest::WRITE).unwrap();
    assert_eq!(set.interest(token), Some(Interest::WRITE));
    assert_eq!(set.wait(Some(Duration::from_millis(50))).unwrap(), 1);
    assert!(set.next_ready().unwrap().ready.is_writable());
}

#[test]
fn test_reserved_handle_does_not_count() {
    let mut set: SocketSet<()> = SocketSet::new(BackendKind::Edge, 1).unwrap();
    let (w, mut w2) = pair();
    let (a, _a2) = pair();
    set.register_reserved(w.as_raw_fd(), Interest::READ).unwrap();
    set.insert_with(a.as_raw_fd(), Interest::READ, |_| ()).unwrap();
    assert_eq!(set.len(), 1);

    w2.write_all(&[1]).unwrap();
    set.wait(Some(Duration::from_millis(50))).unwrap();
    assert_eq!(set.next_ready().unwrap().token, RESERVED_TOKEN);
}

#[test]
fn test_drain_empties_set() {
    let mut set: SocketSet<usize> = SocketSet::new(BackendKind::Poll, 8).unwrap();
    let pairs: Vec<_> = (0..3).map(|_| pair()).collect();
    for (i, (s, _)) in pairs.iter().enumerate() {
        set.insert_with(s.as_raw_fd(), Interest::READ, |_| i).unwrap();
    }
    assert_eq!(set.drain(), vec![0, 1, 2]);
    assert!(set.is_empty());
    assert!(set.tokens().is_empty());
}
