// TCP listener and the single-threaded multiplexing event loop.
//
// Architecture: one thread, one `poll(2)` set.
//
// - The loop owns the `TcpListener` and a `SlotTable<TcpStream>`. Nothing
//   else touches either.
// - Each cycle waits, with no timeout, for the listener and every occupied
//   slot. Stale descriptors reported by the wait are evicted one at a time
//   and the wait is retried.
// - A ready listener is accepted first. At capacity the new stream is
//   dropped straight away, which closes it; the client sees its connection
//   accepted and then closed. If accept fails because the process is out of
//   descriptors or memory, the listener sits out of the wait for
//   `ACCEPT_BACKOFF` instead of spinning on a connection it can't take.
// - Ready clients are then handed to `relay::relay_frame` in slot order. Each
//   relay runs to completion before the next one starts.
//
// Per-client failures never end the loop. The loop returns only when the
// readiness wait itself fails, or when an embedding caller asks it to stop.
//
// Embedding: `start_relay` runs the loop on a background thread and returns a
// `RelayHandle`. Stopping uses a `UnixStream` pair as a waker: `stop()` clears
// `keep_running` and writes a byte, the wait returns, the loop sees the flag
// and exits. The standalone binary calls `run_relay_blocking` instead and has
// no waker at all.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use abridge_protocol::MAX_FRAME_LEN;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::poll;
use crate::relay::relay_frame;
use crate::slots::SlotTable;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 9999;

/// Default number of simultaneous clients.
pub const DEFAULT_CAPACITY: usize = 5;

/// How long accepting stays paused after the process runs out of
/// descriptors or memory.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept errors that leave the pending connection queued.
fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// Configuration for starting a relay server.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub capacity: usize,
    pub max_frame_len: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            capacity: DEFAULT_CAPACITY,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl RelayConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    waker: UnixStream,
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down. Connected
    /// clients see their connections close.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Err(e) = self.waker.write_all(&[1]) {
            warn!(error = %e, "failed to wake relay loop");
        }
        if let Some(Err(_)) = self.thread.take().map(thread::JoinHandle::join) {
            warn!("relay loop thread panicked");
        }
    }
}

/// Bind the listening socket. Failure here is the one fatal error.
pub fn bind_listener(config: &RelayConfig) -> Result<TcpListener, RelayError> {
    let addr = config.socket_addr();
    TcpListener::bind(addr).map_err(|source| RelayError::ListenerSetup { addr, source })
}

/// Start the relay server on a background thread. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used
/// to let the OS pick a free port).
pub fn start_relay(config: RelayConfig) -> Result<(RelayHandle, SocketAddr), RelayError> {
    let listener = bind_listener(&config)?;
    let addr = listener
        .local_addr()
        .map_err(|source| RelayError::ListenerSetup {
            addr: config.socket_addr(),
            source,
        })?;
    let (waker, wake_rx) = UnixStream::pair().map_err(|source| RelayError::ListenerSetup {
        addr,
        source,
    })?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_clone = keep_running.clone();

    info!(%addr, capacity = config.capacity, "relay listening");
    let thread = thread::spawn(move || {
        let mut event_loop = EventLoop::new(listener, Some(wake_rx), &config);
        if let Err(e) = event_loop.run(&keep_running_clone) {
            error!(error = %e, "relay loop stopped");
        }
    });

    Ok((
        RelayHandle {
            keep_running,
            waker,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Run the relay on the calling thread until the readiness wait fails.
pub fn run_relay_blocking(listener: TcpListener, config: &RelayConfig) -> Result<(), RelayError> {
    let keep_running = AtomicBool::new(true);
    EventLoop::new(listener, None, config).run(&keep_running)
}

/// Loop state: the listener, the slot table, and the optional waker.
struct EventLoop {
    listener: TcpListener,
    waker: Option<UnixStream>,
    slots: SlotTable<TcpStream>,
    max_frame_len: u32,
    accept_paused_until: Option<Instant>,
}

impl EventLoop {
    fn new(listener: TcpListener, waker: Option<UnixStream>, config: &RelayConfig) -> Self {
        Self {
            listener,
            waker,
            slots: SlotTable::with_capacity(config.capacity),
            max_frame_len: config.max_frame_len,
            accept_paused_until: None,
        }
    }

    fn run(&mut self, keep_running: &AtomicBool) -> Result<(), RelayError> {
        while keep_running.load(Ordering::SeqCst) {
            if !self.turn(keep_running)? {
                break;
            }
        }
        info!(clients = self.slots.len(), "relay loop exiting");
        Ok(())
    }

    /// One WAITING + DISPATCHING cycle. Returns `false` once a stop request
    /// has been seen.
    fn turn(&mut self, keep_running: &AtomicBool) -> Result<bool, RelayError> {
        // WAITING
        let (listener, timeout) = self.accept_interest(Instant::now());
        let waker_fd = self.waker.as_ref().map(AsRawFd::as_raw_fd);
        let clients: Vec<RawFd> = self.slots.for_each_active().map(|(_, fd)| fd).collect();
        let ready = poll::wait(listener, waker_fd, &clients, timeout).map_err(RelayError::Poll)?;

        // DISPATCHING
        if let Some(&stale) = ready.invalid.first() {
            self.evict_stale(stale);
            return Ok(true);
        }
        if ready.waker {
            self.drain_waker();
            if !keep_running.load(Ordering::SeqCst) {
                return Ok(false);
            }
        }
        if ready.listener {
            self.accept_client();
        }
        for origin in ready.readable {
            self.dispatch(origin);
        }
        Ok(true)
    }

    /// Whether the listener joins the next wait, and for how long the wait
    /// may block while it doesn't.
    fn accept_interest(&mut self, now: Instant) -> (Option<RawFd>, Option<Duration>) {
        match self.accept_paused_until {
            Some(until) if until > now => (None, Some(until - now)),
            Some(_) => {
                debug!("resuming accepts");
                self.accept_paused_until = None;
                (Some(self.listener.as_raw_fd()), None)
            }
            None => (Some(self.listener.as_raw_fd()), None),
        }
    }

    /// Drop a descriptor the kernel no longer knows about.
    fn evict_stale(&mut self, descriptor: RawFd) {
        warn!(descriptor, "descriptor invalid during wait, freeing slot");
        if let Some(stream) = self.slots.remove(descriptor) {
            // The number may already belong to something else; don't close it.
            std::mem::forget(stream);
        }
    }

    fn drain_waker(&mut self) {
        if let Some(waker) = self.waker.as_mut() {
            let mut buf = [0u8; 16];
            if let Err(e) = waker.read(&mut buf) {
                warn!(error = %e, "failed to drain relay waker");
            }
        }
    }

    /// Accept one pending connection into a free slot, or close it.
    fn accept_client(&mut self) {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                self.accept_failed(&e, Instant::now());
                return;
            }
        };
        stream.set_nodelay(true).ok();

        match self.slots.insert(stream) {
            Ok(index) => {
                info!(%peer, slot = index, active = self.slots.len(), "client connected");
            }
            Err(rejected) => {
                info!(%peer, reason = %rejected.reason, "refusing client");
                drop(rejected.stream);
            }
        }
    }

    /// A failed accept leaves the connection in the backlog when the process
    /// is out of descriptors or memory, so the listener would stay readable.
    /// Pause accepting for `ACCEPT_BACKOFF` in that case.
    fn accept_failed(&mut self, err: &io::Error, now: Instant) {
        if is_resource_exhaustion(err) {
            warn!(
                error = %err,
                backoff_ms = ACCEPT_BACKOFF.as_millis() as u64,
                "accept failed, pausing accepts"
            );
            self.accept_paused_until = Some(now + ACCEPT_BACKOFF);
        } else {
            warn!(error = %err, "accept failed");
        }
    }

    /// Relay one frame from a readable client.
    fn dispatch(&mut self, origin: RawFd) {
        if !self.slots.contains(origin) {
            return;
        }
        match relay_frame(&mut self.slots, origin, self.max_frame_len) {
            Ok(_) => {}
            Err(RelayError::ConnectionLost { descriptor, source }) if source.is_clean_close() => {
                info!(descriptor, active = self.slots.len(), "client disconnected");
            }
            Err(e @ RelayError::ProtocolViolation { .. }) => {
                warn!(error = %e, active = self.slots.len(), "dropping client");
            }
            Err(e) => {
                debug!(error = %e, active = self.slots.len(), "dropping client");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    use abridge_protocol::{encode_frame, read_frame};

    // Far above any open-file limit, so never a live descriptor.
    const STALE_FD: RawFd = i32::MAX - 1;

    fn local_config() -> RelayConfig {
        RelayConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..RelayConfig::default()
        }
    }

    #[test]
    fn defaults_match_wire_contract() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 9999);
        assert_eq!(config.capacity, 5);
        assert_eq!(config.max_frame_len, 4096);
        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:9999");
    }

    #[test]
    fn bind_conflict_is_listener_setup_error() {
        let (handle, addr) = start_relay(local_config()).unwrap();
        let clash = RelayConfig {
            port: addr.port(),
            ..local_config()
        };
        let err = start_relay(clash).err().unwrap();
        assert!(matches!(err, RelayError::ListenerSetup { .. }));
        handle.stop();
    }

    #[test]
    fn stop_closes_connected_clients() {
        let (handle, addr) = start_relay(local_config()).unwrap();
        let mut a = TcpStream::connect(addr).unwrap();
        let mut b = TcpStream::connect(addr).unwrap();
        b.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        // Round-trip one frame so both are known to be slotted.
        a.write_all(&encode_frame(b"ping").unwrap()).unwrap();
        assert_eq!(read_frame(&mut b, MAX_FRAME_LEN).unwrap(), b"ping");

        handle.stop();
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }

    fn local_loop() -> (EventLoop, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (EventLoop::new(listener, None, &local_config()), addr)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    #[test]
    fn only_resource_exhaustion_pauses_accepts() {
        for errno in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            assert!(is_resource_exhaustion(&io::Error::from_raw_os_error(errno)));
        }
        let aborted = io::Error::from_raw_os_error(libc::ECONNABORTED);
        assert!(!is_resource_exhaustion(&aborted));
        assert!(!is_resource_exhaustion(&io::Error::from(
            io::ErrorKind::Interrupted
        )));

        let (mut event_loop, _addr) = local_loop();
        let now = Instant::now();
        event_loop.accept_failed(&aborted, now);
        assert_eq!(
            event_loop.accept_interest(now),
            (Some(event_loop.listener.as_raw_fd()), None)
        );
    }

    #[test]
    fn exhausted_accept_takes_the_listener_out_of_the_wait() {
        let running = AtomicBool::new(true);
        let (mut event_loop, addr) = local_loop();
        let _pending = connect(addr);

        let start = Instant::now();
        event_loop.accept_failed(&io::Error::from_raw_os_error(libc::EMFILE), start);
        assert_eq!(event_loop.accept_interest(start), (None, Some(ACCEPT_BACKOFF)));

        // The queued connection keeps the listener readable, but the cycle
        // waits out the pause instead of returning at once.
        assert!(event_loop.turn(&running).unwrap());
        assert!(start.elapsed() >= ACCEPT_BACKOFF / 2);
        assert!(event_loop.slots.is_empty());

        thread::sleep(ACCEPT_BACKOFF);
        assert!(event_loop.turn(&running).unwrap());
        assert_eq!(event_loop.slots.len(), 1);
        assert!(event_loop.accept_paused_until.is_none());
    }

    #[test]
    fn stale_descriptor_is_evicted_and_relaying_continues() {
        let running = AtomicBool::new(true);
        let (mut event_loop, addr) = local_loop();
        let mut a = connect(addr);
        assert!(event_loop.turn(&running).unwrap());
        let mut b = connect(addr);
        assert!(event_loop.turn(&running).unwrap());
        assert_eq!(event_loop.slots.len(), 2);

        // A slot whose descriptor the kernel doesn't know. Eviction forgets
        // the stream rather than closing it.
        let stale = unsafe { TcpStream::from_raw_fd(STALE_FD) };
        event_loop.slots.insert(stale).unwrap();
        assert_eq!(event_loop.slots.len(), 3);

        assert!(event_loop.turn(&running).unwrap());
        assert_eq!(event_loop.slots.len(), 2);
        assert!(!event_loop.slots.contains(STALE_FD));

        a.write_all(&encode_frame(b"after").unwrap()).unwrap();
        assert!(event_loop.turn(&running).unwrap());
        assert_eq!(read_frame(&mut b, MAX_FRAME_LEN).unwrap(), b"after");

        // The freed slot takes a newcomer, who joins the fan-out.
        let mut c = connect(addr);
        assert!(event_loop.turn(&running).unwrap());
        assert_eq!(event_loop.slots.len(), 3);

        b.write_all(&encode_frame(b"welcome").unwrap()).unwrap();
        assert!(event_loop.turn(&running).unwrap());
        assert_eq!(read_frame(&mut a, MAX_FRAME_LEN).unwrap(), b"welcome");
        assert_eq!(read_frame(&mut c, MAX_FRAME_LEN).unwrap(), b"welcome");
    }
}
