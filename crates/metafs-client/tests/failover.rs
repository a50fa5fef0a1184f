//! Failover scenarios: map transitions, stale sessions, reconnect, and
//! shutdown with unsafe requests outstanding.

mod common;

use common::*;
use metafs_client::{DirectMode, Request, SessionState, Target};
use metafs_common::{Ino, MdsState};
use metafs_proto::{CapMask, Message, Op, SessionOp, SnapMessage, SnapRealmInfo};
use std::thread;
use std::time::Duration;

/// Unsafe reply, then the MDS goes down for good: the cache update stands,
/// the caller was already woken, and shutdown tears the request down
/// without waiting for a safe reply that will never come.
#[test]
fn test_unsafe_then_map_loss_then_shutdown() {
    let (client, messenger, _maps) = setup();
    client.handle_map(map(1, &[MdsState::Active]));

    let create = Request::build(
        Op::Create,
        DirectMode::Any,
        Target::Dentry {
            dir: Ino::ROOT,
            name: "scratch".into(),
        },
    )
    .finish();
    let caller = {
        let client = client.clone();
        let req = create.clone();
        thread::spawn(move || client.execute(&req, None))
    };
    wait_until("session open", || {
        messenger.session_msgs(SessionOp::RequestOpen).pop()
    });
    client.dispatch(0, session_msg(SessionOp::Open, 1));
    wait_until("create send", || messenger.requests().pop());
    client.dispatch(0, reply(1, Op::Create, 0, false, Some(file_info(0x400))));
    assert!(caller.join().unwrap().is_ok());
    assert_eq!(client.in_flight(), 1);
    assert!(client.is_cached(Ino::new(0x400)));

    // the rank vanishes; the unsafe request cannot be rekicked anywhere
    client.handle_map(map(2, &[MdsState::Down]));
    assert_eq!(client.in_flight(), 1);
    assert!(client.is_cached(Ino::new(0x400)));

    // shutdown abandons it after the mount timeout
    client.pre_umount();
    assert_eq!(client.in_flight(), 0);
    create.wait_safe();

    client.close_sessions();
    assert!(client.session_state(0).is_none());
}

/// Session goes hung on ttl expiry, the MDS declares us stale, and a renew
/// brings the caps back — waking waiters and dropping the old generation.
#[test]
fn test_session_stale_then_fresh() {
    let (client, messenger, maps) = setup();
    client.handle_map(map_with_autoclose(
        1,
        &[MdsState::Active],
        Duration::from_millis(1),
    ));
    client.dispatch(0, session_msg(SessionOp::Open, 1));
    assert_eq!(client.session_state(0), Some(SessionState::Open));

    client.dispatch(0, cap_grant(0x500, CapMask::PIN | CapMask::RD, 1));
    assert!(client.caps_issued(Ino::new(0x500)).contains(CapMask::RD));

    // the tick notices the expired ttl and asks for the next map epoch
    thread::sleep(Duration::from_millis(20));
    client.tick_once();
    assert_eq!(client.session_state(0), Some(SessionState::Hung));
    assert!(maps.asked.lock().unwrap().contains(&2));

    // stale: generation bumps and a renew goes out immediately
    client.dispatch(0, session_msg(SessionOp::Stale, 2));
    assert_eq!(client.session_state(0), Some(SessionState::Open));
    assert!(!messenger.session_msgs(SessionOp::RequestRenewCaps).is_empty());

    // fresh again: the old-generation cap did not survive
    client.dispatch(0, session_msg(SessionOp::RenewCaps, 3));
    assert!(client.caps_issued(Ino::new(0x500)).is_empty());
}

/// Reconnect round trip: unsafe requests replay with their original tids,
/// and every cap and snap realm is echoed to the recovering MDS.
#[test]
fn test_reconnect_replays_and_echoes_state() {
    let (client, messenger, _maps) = setup();
    client.handle_map(map(1, &[MdsState::Active]));

    // seed a cap with a name link so the reconnect record carries a path
    let seed = Request::build(
        Op::Lookup,
        DirectMode::Any,
        Target::Dentry {
            dir: Ino::ROOT,
            name: "f".into(),
        },
    )
    .finish();
    let caller = {
        let client = client.clone();
        let req = seed.clone();
        thread::spawn(move || client.execute(&req, None))
    };
    wait_until("session open", || {
        messenger.session_msgs(SessionOp::RequestOpen).pop()
    });
    client.dispatch(0, session_msg(SessionOp::Open, 1));
    wait_until("seed send", || messenger.requests().pop());
    client.dispatch(
        0,
        reply_with_dentry(
            1,
            Op::Lookup,
            dir_info(Ino::ROOT.as_u64()),
            "f",
            with_cap(file_info(0x600), CapMask::PIN | CapMask::RD, true),
        ),
    );
    caller.join().unwrap().unwrap();

    // the client knows one snap realm
    client.dispatch(
        0,
        Message::Snap(SnapMessage {
            realms: vec![SnapRealmInfo {
                ino: Ino::ROOT,
                seq: 1,
                parent: Ino::ROOT,
            }],
        }),
    );

    // an unsafe create is outstanding when the MDS fails
    let create = Request::build(
        Op::Create,
        DirectMode::Any,
        Target::Dentry {
            dir: Ino::ROOT,
            name: "g".into(),
        },
    )
    .finish();
    let caller = {
        let client = client.clone();
        let req = create.clone();
        thread::spawn(move || client.execute(&req, None))
    };
    let (_, first_send) = wait_until("create send", || {
        messenger.requests().into_iter().find(|(_, r)| r.tid == 2)
    });
    assert!(!first_send.replay);
    client.dispatch(0, reply(2, Op::Create, 0, false, Some(file_info(0x601))));
    assert!(caller.join().unwrap().is_ok());

    // the rank comes back in reconnect
    client.handle_map(map(2, &[MdsState::Reconnect]));

    // the unsafe request was replayed, flagged as a replay, with a hint to
    // the inode its earlier unsafe reply created
    let replayed = wait_until("replayed create", || {
        messenger
            .requests()
            .into_iter()
            .find(|(_, r)| r.tid == 2 && r.replay)
    });
    assert_eq!(replayed.1.ino_hint, Some(Ino::new(0x601)));

    // the reconnect payload names our cap (with its path) and our realm
    let reconnect = wait_until("reconnect payload", || {
        messenger
            .sent
            .lock()
            .unwrap()
            .iter()
            .find_map(|(_, msg)| match msg {
                Message::Reconnect(m) => Some(m.clone()),
                _ => None,
            })
    });
    assert!(!reconnect.was_closed);
    assert_eq!(reconnect.caps.len(), 1);
    assert_eq!(reconnect.caps[0].ino, Ino::new(0x600));
    assert_eq!(reconnect.caps[0].pathbase, Ino::ROOT);
    assert_eq!(reconnect.caps[0].path, "f");
    assert_eq!(reconnect.realms.len(), 1);
    assert_eq!(client.session_state(0), Some(SessionState::Open));

    // back to active; the safe reply finally lands
    client.handle_map(map(3, &[MdsState::Active]));
    client.dispatch(0, reply(2, Op::Create, 0, true, None));
    assert_eq!(client.in_flight(), 0);
    assert!(create.is_safe());
}

/// Reconnect cap records carry a path that stops at snap realm boundaries:
/// a cap inside a snapped subtree is described relative to the first
/// ancestor outside its realm.
#[test]
fn test_reconnect_path_stops_at_snap_boundary() {
    let (client, messenger, _maps) = setup();
    client.handle_map(map(1, &[MdsState::Active]));
    client.dispatch(0, session_msg(SessionOp::Open, 1));

    // ROOT/outer is in the root realm; outer/snapd roots its own realm and
    // snapd/f (the cap holder) lives inside it
    let outer = dir_info(0x620);
    let snapd = with_realm(dir_info(0x621), 0x621);
    let leaf = with_realm(
        with_cap(file_info(0x622), CapMask::PIN | CapMask::RD, true),
        0x621,
    );

    let chain = [
        (dir_info(Ino::ROOT.as_u64()), "outer", outer.clone()),
        (outer, "snapd", snapd.clone()),
        (snapd, "f", leaf),
    ];
    for (i, (dir, name, target)) in chain.into_iter().enumerate() {
        let tid = i as u64 + 1;
        let req = Request::build(
            Op::Lookup,
            DirectMode::Any,
            Target::Dentry {
                dir: dir.ino,
                name: name.to_string(),
            },
        )
        .finish();
        let caller = {
            let client = client.clone();
            let req = req.clone();
            thread::spawn(move || client.execute(&req, None))
        };
        wait_until("lookup send", || {
            messenger.requests().into_iter().find(|(_, r)| r.tid == tid)
        });
        client.dispatch(0, reply_with_dentry(tid, Op::Lookup, dir, name, target));
        caller.join().unwrap().unwrap();
    }

    client.handle_map(map(2, &[MdsState::Reconnect]));
    let reconnect = wait_until("reconnect payload", || {
        messenger
            .sent
            .lock()
            .unwrap()
            .iter()
            .find_map(|(_, msg)| match msg {
                Message::Reconnect(m) => Some(m.clone()),
                _ => None,
            })
    });
    assert_eq!(reconnect.caps.len(), 1);
    assert_eq!(reconnect.caps[0].ino, Ino::new(0x622));
    // the walk stopped where the realm changed, not at the root
    assert_eq!(reconnect.caps[0].pathbase, Ino::new(0x620));
    assert_eq!(reconnect.caps[0].path, "snapd/f");
    assert_eq!(reconnect.caps[0].snap_realm, Ino::new(0x621));
}

/// Unsolicited session opens from high ranks grow the session table.
#[test]
fn test_high_rank_session_registration() {
    let (client, _messenger, _maps) = setup();
    client.handle_map(map(
        1,
        &[
            MdsState::Active,
            MdsState::Active,
            MdsState::Active,
            MdsState::Active,
            MdsState::Active,
            MdsState::Active,
        ],
    ));
    client.dispatch(5, session_msg(SessionOp::Open, 1));
    assert_eq!(client.session_state(5), Some(SessionState::Open));
    assert_eq!(client.session_state(3), None);
}

/// An address change while a session is opening unregisters it and reparks
/// its requests for the new map.
#[test]
fn test_addr_change_while_opening() {
    let (client, messenger, maps) = setup();
    client.handle_map(map(1, &[MdsState::Active]));

    let req = Request::build(Op::Getattr, DirectMode::Any, Target::Inode(Ino::ROOT)).finish();
    client.submit(&req, None).unwrap();
    wait_until("session open", || {
        messenger.session_msgs(SessionOp::RequestOpen).pop()
    });
    assert_eq!(client.session_state(0), Some(SessionState::Opening));

    // same rank, new address: the half-open session is abandoned
    let mut moved = map(2, &[MdsState::Active]);
    moved.ranks[0].addr = Some("127.0.0.1:9999".parse().unwrap());
    client.handle_map(moved);

    // the request was rekicked into a fresh session open
    wait_until("second open attempt", || {
        let opens = messenger.session_msgs(SessionOp::RequestOpen);
        (opens.len() >= 2).then_some(())
    });
    assert_eq!(client.session_state(0), Some(SessionState::Opening));
    let _ = maps;
}
