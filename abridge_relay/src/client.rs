// TCP client for connecting to the relay.
//
// Architecture:
// - `connect()` opens the TCP connection on the calling thread, then spawns a
//   background reader thread.
// - The reader thread calls `read_frame()` in a loop and pushes each payload
//   into an `mpsc` channel. When the relay closes the connection (or sends
//   something unframable) it pushes a final `Closed` and exits.
// - The caller holds the write half and sends synchronously.
// - `poll()` drains the inbox without blocking.
//
// There is no handshake: a connected socket is immediately part of the
// broadcast group, unless the relay was full, in which case the first thing
// the reader sees is EOF.

use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use abridge_protocol::{FrameError, MAX_FRAME_LEN, TransferError, read_frame, write_exact, write_frame};
use tracing::debug;

/// Something the reader thread observed.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// A complete frame payload relayed from another client.
    Frame(Vec<u8>),
    /// The connection ended; no further events follow.
    Closed(String),
}

/// TCP client for relay communication.
pub struct RelayClient {
    writer: TcpStream,
    inbox: Receiver<ClientEvent>,
    _reader_thread: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// Connect to a relay and start the reader thread.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> std::io::Result<Self> {
        let writer = TcpStream::connect(addr)?;
        writer.set_nodelay(true).ok();
        let reader = writer.try_clone()?;

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || {
            reader_loop(reader, tx);
        });

        Ok(Self {
            writer,
            inbox: rx,
            _reader_thread: Some(reader_thread),
        })
    }

    /// Send one frame to be broadcast to every other client.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        write_frame(&mut self.writer, payload)
    }

    /// Send bytes as-is, with no framing added.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        write_exact(&mut self.writer, bytes)
    }

    /// Drain all queued events (non-blocking).
    pub fn poll(&self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.inbox.try_recv() {
            events.push(event);
        }
        events
    }

    /// Block for the next event, up to `timeout`.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<ClientEvent> {
        self.inbox.recv_timeout(timeout).ok()
    }

    /// Close both directions. The reader thread exits on the resulting EOF.
    pub fn disconnect(&self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

/// Reader thread: read frames in a loop, push to channel.
fn reader_loop(mut reader: TcpStream, tx: Sender<ClientEvent>) {
    let reason = loop {
        match read_frame(&mut reader, MAX_FRAME_LEN) {
            Ok(payload) => {
                if tx.send(ClientEvent::Frame(payload)).is_err() {
                    return; // Caller dropped the client
                }
            }
            Err(e) => break e.to_string(),
        }
    };
    debug!(%reason, "relay connection closed");
    let _ = tx.send(ClientEvent::Closed(reason));
}
