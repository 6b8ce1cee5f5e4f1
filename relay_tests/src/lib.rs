// Test-only broadcast client for relay integration tests.
//
// Wraps the real `RelayClient` (from `abridge_relay::client`) with a
// synchronous, test-friendly API: blocking waits with a deadline, and
// assertions about silence and disconnection. All networking uses the same
// code paths as any other relay client; only the polling loops are
// test-specific.
//
// See also: `tests/broadcast_group.rs` for the scenarios.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use abridge_relay::client::{ClientEvent, RelayClient};

/// Default timeout for blocking waits.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long a client must stay quiet to count as having received nothing.
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// A named test client wrapping a real `RelayClient`.
pub struct TestClient {
    pub name: &'static str,
    client: RelayClient,
    /// Events drained while waiting for something else.
    backlog: Vec<ClientEvent>,
}

impl TestClient {
    /// Connect to a relay.
    pub fn connect(addr: SocketAddr, name: &'static str) -> Self {
        let client = RelayClient::connect(addr).expect("TestClient::connect failed");
        Self {
            name,
            client,
            backlog: Vec::new(),
        }
    }

    /// Send one frame.
    pub fn send(&mut self, payload: &[u8]) {
        self.client
            .send(payload)
            .unwrap_or_else(|e| panic!("{}: send failed: {e}", self.name));
    }

    /// Send raw bytes with no framing.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.client
            .send_raw(bytes)
            .unwrap_or_else(|e| panic!("{}: send_raw failed: {e}", self.name));
    }

    fn next_event(&mut self) -> Option<ClientEvent> {
        if self.backlog.is_empty() {
            self.backlog.extend(self.client.poll());
        }
        if self.backlog.is_empty() {
            None
        } else {
            Some(self.backlog.remove(0))
        }
    }

    /// Blocking poll until the next frame arrives. Panics on timeout or if
    /// the connection closes first.
    pub fn wait_for_frame(&mut self) -> Vec<u8> {
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "{}: timed out waiting for a frame",
                self.name
            );
            match self.next_event() {
                Some(ClientEvent::Frame(payload)) => return payload,
                Some(ClientEvent::Closed(reason)) => {
                    panic!("{}: closed while waiting for a frame: {reason}", self.name)
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        }
    }

    /// Blocking poll until the relay closes this connection. Panics if a
    /// frame arrives first.
    pub fn wait_for_close(&mut self) -> String {
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "{}: timed out waiting for close",
                self.name
            );
            match self.next_event() {
                Some(ClientEvent::Closed(reason)) => return reason,
                Some(ClientEvent::Frame(payload)) => {
                    panic!("{}: expected close, got frame {payload:?}", self.name)
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        }
    }

    /// Assert nothing arrives for `QUIET_PERIOD`.
    pub fn assert_quiet(&mut self) {
        thread::sleep(QUIET_PERIOD);
        let events: Vec<ClientEvent> = self
            .backlog
            .drain(..)
            .chain(self.client.poll())
            .collect();
        assert!(
            events.is_empty(),
            "{}: expected no traffic, got {events:?}",
            self.name
        );
    }

    /// Close the connection from this side.
    pub fn disconnect(&mut self) {
        self.client.disconnect();
    }
}

/// Send `sync` from the last client and wait for every other client to see
/// it. Afterwards every client in `group` is known to hold a relay slot.
pub fn sync_group(group: &mut [TestClient]) {
    let Some((last, rest)) = group.split_last_mut() else {
        return;
    };
    last.send(b"sync");
    for client in rest {
        assert_eq!(client.wait_for_frame(), b"sync", "{} missed sync", client.name);
    }
}
