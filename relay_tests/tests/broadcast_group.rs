// End-to-end tests for a full broadcast group.
//
// Each test starts a real relay on a random localhost port and connects real
// `RelayClient`s through `TestClient`. The scenarios cover the relay's
// behaviour as clients see it: who receives what, in what order, and what
// happens as peers arrive, misbehave, and leave.

use std::net::{IpAddr, Ipv4Addr};

use abridge_protocol::{MAX_FRAME_LEN, encode_length};
use abridge_relay::server::{RelayConfig, RelayHandle, start_relay};
use relay_tests::{TestClient, sync_group};

const NAMES: [&str; 6] = ["alice", "bob", "carol", "dave", "erin", "frank"];

/// Start a relay and connect `n` clients, all confirmed slotted.
fn start_group(n: usize) -> (RelayHandle, std::net::SocketAddr, Vec<TestClient>) {
    let config = RelayConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        ..RelayConfig::default()
    };
    let (handle, addr) = start_relay(config).unwrap();
    let mut group: Vec<TestClient> = NAMES[..n]
        .iter()
        .map(|&name| TestClient::connect(addr, name))
        .collect();
    sync_group(&mut group);
    (handle, addr, group)
}

// ---------------------------------------------------------------------------
// Test scenarios
// ---------------------------------------------------------------------------

#[test]
fn each_sender_reaches_everyone_else() {
    let (handle, _addr, mut group) = start_group(4);

    for sender in 0..group.len() {
        let payload = format!("from {}", group[sender].name).into_bytes();
        group[sender].send(&payload);
        for (i, client) in group.iter_mut().enumerate() {
            if i != sender {
                assert_eq!(client.wait_for_frame(), payload);
            }
        }
    }
    for client in &mut group {
        client.assert_quiet();
    }

    handle.stop();
}

#[test]
fn interleaved_senders_keep_per_origin_order() {
    let (handle, _addr, mut group) = start_group(3);

    for i in 0u8..20 {
        group[0].send(&[b'a', i]);
        group[1].send(&[b'b', i]);
    }

    // Carol sees both streams; each one in its own order.
    let mut next_a = 0u8;
    let mut next_b = 0u8;
    for _ in 0..40 {
        let frame = group[2].wait_for_frame();
        match frame[0] {
            b'a' => {
                assert_eq!(frame[1], next_a);
                next_a += 1;
            }
            b'b' => {
                assert_eq!(frame[1], next_b);
                next_b += 1;
            }
            other => panic!("unexpected origin tag {other}"),
        }
    }
    assert_eq!((next_a, next_b), (20, 20));

    handle.stop();
}

#[test]
fn full_relay_turns_away_the_sixth() {
    let (handle, addr, mut group) = start_group(5);

    let mut frank = TestClient::connect(addr, NAMES[5]);
    frank.wait_for_close();

    group[2].send(b"still five");
    for (i, client) in group.iter_mut().enumerate() {
        if i != 2 {
            assert_eq!(client.wait_for_frame(), b"still five");
        }
    }

    handle.stop();
}

#[test]
fn leaving_frees_a_slot_for_a_newcomer() {
    let (handle, addr, mut group) = start_group(5);

    let mut alice = group.remove(0);
    alice.disconnect();
    drop(alice);

    // Bob's frame is processed after alice's EOF, which sits earlier in
    // slot order.
    group[0].send(b"bye alice");
    for client in group[1..].iter_mut() {
        assert_eq!(client.wait_for_frame(), b"bye alice");
    }

    let mut frank = TestClient::connect(addr, NAMES[5]);
    group[0].send(b"hi frank");
    assert_eq!(frank.wait_for_frame(), b"hi frank");
    for client in group[1..].iter_mut() {
        assert_eq!(client.wait_for_frame(), b"hi frank");
    }

    frank.send(b"thanks");
    for client in &mut group {
        assert_eq!(client.wait_for_frame(), b"thanks");
    }

    handle.stop();
}

#[test]
fn protocol_violation_drops_only_the_offender() {
    let (handle, _addr, mut group) = start_group(3);

    group[0].send_raw(&encode_length(MAX_FRAME_LEN + 1));
    group[0].wait_for_close();
    group[1].assert_quiet();
    group[2].assert_quiet();

    group[1].send(b"carry on");
    assert_eq!(group[2].wait_for_frame(), b"carry on");

    handle.stop();
}

#[test]
fn zero_length_and_max_length_frames_pass_through() {
    let (handle, _addr, mut group) = start_group(2);

    group[0].send(b"");
    assert_eq!(group[1].wait_for_frame(), Vec::<u8>::new());

    let max = vec![0xc3; MAX_FRAME_LEN as usize];
    group[1].send(&max);
    assert_eq!(group[0].wait_for_frame(), max);

    handle.stop();
}

#[test]
fn stopping_the_relay_closes_everyone() {
    let (handle, _addr, mut group) = start_group(3);
    handle.stop();
    for client in &mut group {
        client.wait_for_close();
    }
}
