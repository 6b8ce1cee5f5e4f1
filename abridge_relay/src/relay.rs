// Frame relay: read one frame from an origin slot, write it to every other.
//
// Called by the event loop once per readable client. The whole operation runs
// to completion before the loop waits again, so all reachable destinations get
// a frame before the origin's next one is even read.
//
// Origin failures free the origin's slot. That covers a lost connection while
// reading the prefix or the payload, and a declared length over the maximum
// (the unread payload would otherwise desynchronise the stream). In every such
// case nothing is sent to anyone.
//
// Destination failures are contained to the destination. A failed prefix
// write skips the payload write for that slot; a failed payload write leaves
// the destination holding a truncated frame. Neither removes the slot: the
// broken peer is reclaimed when its own descriptor turns readable and the read
// hits EOF.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use abridge_protocol::{LENGTH_PREFIX_LEN, decode_length, encode_length, read_exact, write_exact};
use tracing::{debug, trace, warn};

use crate::error::RelayError;
use crate::slots::SlotTable;

/// What happened to one relayed frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Payload length of the frame.
    pub len: u32,
    /// Destinations that received the full frame.
    pub delivered: usize,
    /// Destinations skipped because a write failed.
    pub failed: usize,
}

/// Read one frame from `origin` and fan it out to every other active slot.
///
/// An `Err` always means the origin has already been removed from `slots`,
/// except for `UnknownDescriptor`, where there was nothing to remove.
pub fn relay_frame<S>(
    slots: &mut SlotTable<S>,
    origin: RawFd,
    max_frame_len: u32,
) -> Result<Delivery, RelayError>
where
    S: Read + Write + AsRawFd,
{
    let payload = match read_from_origin(slots, origin, max_frame_len) {
        Ok(payload) => payload,
        Err(err @ RelayError::UnknownDescriptor(_)) => return Err(err),
        Err(err) => {
            slots.remove(origin);
            return Err(err);
        }
    };
    trace!(origin, payload = %hex::encode(&payload), "frame payload");
    Ok(fan_out(slots, origin, &payload))
}

fn read_from_origin<S>(
    slots: &mut SlotTable<S>,
    origin: RawFd,
    max_frame_len: u32,
) -> Result<Vec<u8>, RelayError>
where
    S: Read + AsRawFd,
{
    let stream = slots
        .get_mut(origin)
        .ok_or(RelayError::UnknownDescriptor(origin))?;
    let lost = |source| RelayError::ConnectionLost {
        descriptor: origin,
        source,
    };

    let header = read_exact(stream, LENGTH_PREFIX_LEN).map_err(lost)?;
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    prefix.copy_from_slice(&header);
    let len = decode_length(prefix);
    if len > max_frame_len {
        return Err(RelayError::ProtocolViolation {
            descriptor: origin,
            len,
            max: max_frame_len,
        });
    }

    read_exact(stream, len as usize).map_err(lost)
}

/// Write `payload` as a frame to every active slot except `origin`, in slot
/// order. Each destination succeeds or fails on its own.
fn fan_out<S>(slots: &mut SlotTable<S>, origin: RawFd, payload: &[u8]) -> Delivery
where
    S: Write + AsRawFd,
{
    // Came off the wire behind a u32 prefix, so it fits.
    let len = payload.len() as u32;
    let prefix = encode_length(len);
    let mut delivery = Delivery {
        len,
        ..Delivery::default()
    };

    for (index, descriptor, stream) in slots.iter_mut() {
        if descriptor == origin {
            continue;
        }
        if let Err(e) = write_exact(stream, &prefix) {
            warn!(slot = index, descriptor, error = %e, "length write failed, skipping destination");
            delivery.failed += 1;
            continue;
        }
        if let Err(e) = write_exact(stream, payload) {
            warn!(slot = index, descriptor, error = %e, "payload write failed, destination holds a truncated frame");
            delivery.failed += 1;
            continue;
        }
        delivery.delivered += 1;
    }

    debug!(
        origin,
        len,
        delivered = delivery.delivered,
        failed = delivery.failed,
        "relayed frame"
    );
    delivery
}
