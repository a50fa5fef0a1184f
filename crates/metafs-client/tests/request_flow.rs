//! End-to-end request pipeline scenarios, driven through a fake messenger.

mod common;

use common::*;
use metafs_client::{DirectMode, Request, Target};
use metafs_common::{types::errno, Error, Ino, MdsState};
use metafs_proto::{CapMask, ForwardMessage, Message, Op, SessionOp};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn lookup(path: &str) -> Arc<Request> {
    Request::build(
        Op::Lookup,
        DirectMode::Any,
        Target::Path {
            ino: Ino::ROOT,
            path: path.to_string(),
        },
    )
    .finish()
}

/// Simple lookup, happy path: single active MDS, one safe reply.
#[test]
fn test_lookup_happy_path() {
    let (client, messenger, _maps) = setup();
    client.handle_map(map(1, &[MdsState::Active]));

    let req = lookup("a/b");
    let caller = {
        let client = client.clone();
        let req = req.clone();
        thread::spawn(move || client.execute(&req, None))
    };

    // the session handshake goes out first
    let (rank, _open) = wait_until("session open", || {
        messenger.session_msgs(SessionOp::RequestOpen).pop()
    });
    assert_eq!(rank, 0);
    client.dispatch(0, session_msg(SessionOp::Open, 1));

    let (rank, sent) = wait_until("request send", || messenger.requests().pop());
    assert_eq!(rank, 0);
    assert_eq!(sent.tid, 1);
    assert_eq!(sent.oldest_client_tid, 1);
    assert_eq!(sent.num_fwd, 0);
    assert_eq!(sent.num_retry, 0);
    assert!(!sent.replay);

    client.dispatch(0, reply(1, Op::Lookup, 0, true, Some(file_info(0x100))));

    assert!(caller.join().unwrap().is_ok());
    assert_eq!(client.in_flight(), 0);
    assert!(client.is_cached(Ino::new(0x100)));
}

/// Forward with must_resend: the request is re-sent to the new MDS with
/// bumped forward and retry counters.
#[test]
fn test_forward_must_resend() {
    let (client, messenger, _maps) = setup();
    // rank 1 is up but not serving yet, so the first pick is rank 0
    client.handle_map(map(1, &[MdsState::Active, MdsState::Replay]));

    // seed an auth cap for the target directory on rank 0
    let seed = lookup("work");
    let caller = {
        let client = client.clone();
        let req = seed.clone();
        thread::spawn(move || client.execute(&req, None))
    };
    wait_until("session open", || {
        messenger.session_msgs(SessionOp::RequestOpen).pop()
    });
    client.dispatch(0, session_msg(SessionOp::Open, 1));
    wait_until("seed request", || messenger.requests().pop());
    client.dispatch(
        0,
        reply(
            1,
            Op::Lookup,
            0,
            true,
            Some(with_cap(dir_info(0x200), CapMask::PIN, true)),
        ),
    );
    caller.join().unwrap().unwrap();

    client.handle_map(map(2, &[MdsState::Active, MdsState::Active]));

    let unlink = Request::build(
        Op::Unlink,
        DirectMode::Auth,
        Target::Dentry {
            dir: Ino::new(0x200),
            name: "victim".into(),
        },
    )
    .finish();
    let caller = {
        let client = client.clone();
        let req = unlink.clone();
        thread::spawn(move || client.execute(&req, None))
    };

    let (rank, sent) = wait_until("unlink send", || {
        messenger.requests().into_iter().find(|(_, r)| r.tid == 2)
    });
    assert_eq!(rank, 0);
    assert_eq!(sent.num_fwd, 0);

    client.dispatch(
        0,
        Message::Forward(ForwardMessage {
            tid: 2,
            next_mds: 1,
            fwd_seq: 1,
            must_resend: true,
        }),
    );

    // we open a session to mds1 and resend there
    let (rank, _open) = wait_until("second session open", || {
        messenger
            .session_msgs(SessionOp::RequestOpen)
            .into_iter()
            .find(|(rank, _)| *rank == 1)
    });
    assert_eq!(rank, 1);
    client.dispatch(1, session_msg(SessionOp::Open, 1));

    let (rank, resent) = wait_until("resent unlink", || {
        messenger
            .requests()
            .into_iter()
            .find(|(rank, r)| *rank == 1 && r.tid == 2)
    });
    assert_eq!(rank, 1);
    assert_eq!(resent.num_fwd, 1);
    assert_eq!(resent.num_retry, 1);

    // unsafe then safe completes the caller and clears the map
    client.dispatch(1, reply(2, Op::Unlink, 0, false, None));
    assert!(caller.join().unwrap().is_ok());
    assert_eq!(client.in_flight(), 1);
    client.dispatch(1, reply(2, Op::Unlink, 0, true, None));
    assert_eq!(client.in_flight(), 0);
    assert!(unlink.is_safe());
}

/// A stale forward (fwd_seq not advancing) is ignored.
#[test]
fn test_old_forward_ignored() {
    let (client, messenger, _maps) = setup();
    client.handle_map(map(1, &[MdsState::Active, MdsState::Active]));

    let req = Request::build(Op::Getattr, DirectMode::Any, Target::Inode(Ino::ROOT)).finish();
    let caller = {
        let client = client.clone();
        let req = req.clone();
        thread::spawn(move || client.execute(&req, None))
    };
    let (first_rank, _) = wait_until("session open", || {
        messenger.session_msgs(SessionOp::RequestOpen).pop()
    });
    client.dispatch(first_rank, session_msg(SessionOp::Open, 1));
    wait_until("request send", || messenger.requests().pop());

    let other = 1 - first_rank;
    client.dispatch(
        first_rank,
        Message::Forward(ForwardMessage {
            tid: 1,
            next_mds: other,
            fwd_seq: 1,
            must_resend: true,
        }),
    );
    // the duplicate forward changes nothing
    client.dispatch(
        first_rank,
        Message::Forward(ForwardMessage {
            tid: 1,
            next_mds: other,
            fwd_seq: 1,
            must_resend: true,
        }),
    );

    client.dispatch(other, session_msg(SessionOp::Open, 1));
    let (_, resent) = wait_until("resent request", || {
        messenger
            .requests()
            .into_iter()
            .find(|(rank, _)| *rank == other)
    });
    assert_eq!(resent.num_fwd, 1);

    client.dispatch(other, reply(1, Op::Getattr, 0, true, None));
    assert!(caller.join().unwrap().is_ok());
}

/// Two consecutive stale handles are retried against the auth MDS; the
/// third surfaces to the caller.
#[test]
fn test_estale_twice_then_surfaces() {
    let (client, messenger, _maps) = setup();
    client.handle_map(map(1, &[MdsState::Active]));

    // seed the target inode with an auth cap on rank 0
    let seed = lookup("data");
    let caller = {
        let client = client.clone();
        let req = seed.clone();
        thread::spawn(move || client.execute(&req, None))
    };
    wait_until("session open", || {
        messenger.session_msgs(SessionOp::RequestOpen).pop()
    });
    client.dispatch(0, session_msg(SessionOp::Open, 1));
    wait_until("seed request", || messenger.requests().pop());
    client.dispatch(
        0,
        reply(
            1,
            Op::Lookup,
            0,
            true,
            Some(with_cap(file_info(0x300), CapMask::PIN, true)),
        ),
    );
    caller.join().unwrap().unwrap();

    let req = Request::build(Op::Getattr, DirectMode::Any, Target::Inode(Ino::new(0x300)))
        .finish();
    let caller = {
        let client = client.clone();
        let req = req.clone();
        thread::spawn(move || client.execute(&req, None))
    };

    for attempt in 1..=3u32 {
        let (_, sent) = wait_until("getattr attempt", || {
            let sends: Vec<_> = messenger
                .requests()
                .into_iter()
                .filter(|(_, r)| r.tid == 2)
                .collect();
            (sends.len() >= attempt as usize).then(|| sends[attempt as usize - 1].clone())
        });
        assert_eq!(sent.num_retry, attempt - 1);
        client.dispatch(0, reply(2, Op::Getattr, errno::ESTALE, true, None));
    }

    assert_eq!(caller.join().unwrap(), Err(Error::Mds(errno::ESTALE)));
    assert_eq!(client.in_flight(), 0);
}

/// Local timeout: the caller sees the failure, the request is torn down,
/// and a late reply is dropped at the tid lookup.
#[test]
fn test_request_timeout_is_local() {
    let (client, messenger, _maps) = setup();
    client.handle_map(map(1, &[MdsState::Active]));

    let req = Request::build(Op::Lookup, DirectMode::Any, Target::Inode(Ino::ROOT))
        .timeout(Duration::from_millis(100))
        .finish();
    // the session never opens, so the request stays parked until timeout
    let result = client.execute(&req, None);
    assert_eq!(result, Err(Error::Timeout));
    assert_eq!(client.in_flight(), 0);

    // late replies are ignored
    client.dispatch(0, session_msg(SessionOp::Open, 1));
    client.dispatch(0, reply(1, Op::Lookup, 0, true, Some(file_info(0x999))));
    assert!(req.outcome().unwrap().is_err());
    let _ = messenger;
}

/// Duplicate unsafe replies are dropped; the cache is populated once.
#[test]
fn test_duplicate_unsafe_reply_dropped() {
    let (client, messenger, _maps) = setup();
    client.handle_map(map(1, &[MdsState::Active]));

    let req = Request::build(
        Op::Create,
        DirectMode::Any,
        Target::Dentry {
            dir: Ino::ROOT,
            name: "newfile".into(),
        },
    )
    .finish();
    let caller = {
        let client = client.clone();
        let req = req.clone();
        thread::spawn(move || client.execute(&req, None))
    };
    wait_until("session open", || {
        messenger.session_msgs(SessionOp::RequestOpen).pop()
    });
    client.dispatch(0, session_msg(SessionOp::Open, 1));
    wait_until("create send", || messenger.requests().pop());

    client.dispatch(0, reply(1, Op::Create, 0, false, Some(file_info(0x700))));
    assert!(caller.join().unwrap().is_ok());

    // second delivery of the same unsafe reply must be a no-op
    client.dispatch(0, reply(1, Op::Create, 0, false, Some(file_info(0x700))));
    assert_eq!(client.in_flight(), 1);
    assert!(!req.is_safe());

    client.dispatch(0, reply(1, Op::Create, 0, true, None));
    assert_eq!(client.in_flight(), 0);
}

/// The oldest in-flight tid rides along on every request.
#[test]
fn test_oldest_tid_reported() {
    let (client, messenger, _maps) = setup();
    client.handle_map(map(1, &[MdsState::Active]));
    client.dispatch(0, session_msg(SessionOp::Open, 1));

    let first = lookup("one");
    let second = lookup("two");
    client.submit(&first, None).unwrap();
    client.submit(&second, None).unwrap();

    let sends = wait_until("both sends", || {
        let sends = messenger.requests();
        (sends.len() >= 2).then_some(sends)
    });
    assert_eq!(sends[0].1.tid, 1);
    assert_eq!(sends[0].1.oldest_client_tid, 1);
    assert_eq!(sends[1].1.tid, 2);
    // the first request is still in flight
    assert_eq!(sends[1].1.oldest_client_tid, 1);
}
