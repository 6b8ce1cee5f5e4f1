// Error kinds for the relay.
//
// Only `ListenerSetup` and `Poll` ever leave the event loop. Everything else
// describes a single client and is logged, then dropped: the affected slot is
// freed (origin failures) or skipped (destination failures), and the loop
// carries on.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use abridge_protocol::TransferError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Every slot is taken; the new connection is closed on the spot.
    #[error("slot table full ({capacity} clients)")]
    CapacityExceeded { capacity: usize },

    /// A descriptor that is already tracked was offered to the slot table.
    #[error("descriptor {0} already occupies a slot")]
    DuplicateDescriptor(RawFd),

    /// The descriptor is not in the slot table.
    #[error("descriptor {0} is not an active slot")]
    UnknownDescriptor(RawFd),

    /// The peer closed or errored mid-read or mid-write.
    #[error("connection lost on descriptor {descriptor}: {source}")]
    ConnectionLost {
        descriptor: RawFd,
        #[source]
        source: TransferError,
    },

    /// Declared frame length over the configured maximum.
    #[error("descriptor {descriptor} declared a {len}-byte frame (max {max})")]
    ProtocolViolation { descriptor: RawFd, len: u32, max: u32 },

    /// Could not bind or listen. Fatal at startup.
    #[error("cannot listen on {addr}: {source}")]
    ListenerSetup {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The readiness wait failed for a reason other than interruption.
    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),
}
