// Fixed-capacity connection slot table.
//
// `SlotTable` is a `Vec<Option<Slot<S>>>` sized once at construction. A slot
// is either empty or holds a connected stream together with its descriptor;
// there is no in-between state, so the event loop never sees a half-built
// entry. Streams are owned by the table: removing a slot drops the stream,
// which closes the socket.
//
// Iteration is always in slot-index order. The event loop's readiness set and
// the relay's fan-out both walk the table this way, which makes delivery order
// deterministic for a given set of connected clients.
//
// Generic over the stream type so the relay can be exercised over
// `UnixStream` pairs in tests; the server instantiates it with `TcpStream`.

use std::os::fd::{AsRawFd, RawFd};

use crate::error::RelayError;

/// One occupied slot.
struct Slot<S> {
    descriptor: RawFd,
    stream: S,
}

/// Returned by `SlotTable::insert` when the stream cannot be admitted. The
/// stream is handed back so the caller decides how to close it.
#[derive(Debug)]
pub struct Rejected<S> {
    pub stream: S,
    pub reason: RelayError,
}

/// Fixed-capacity map from slot index to connected stream.
pub struct SlotTable<S> {
    slots: Vec<Option<Slot<S>>>,
    active: usize,
}

impl<S: AsRawFd> SlotTable<S> {
    /// Create a table with `capacity` empty slots.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, active: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub fn is_full(&self) -> bool {
        self.active == self.slots.len()
    }

    /// Place `stream` in the lowest free slot and return its index.
    ///
    /// Fails with `CapacityExceeded` when every slot is occupied, or
    /// `DuplicateDescriptor` if the stream's descriptor is already tracked.
    pub fn insert(&mut self, stream: S) -> Result<usize, Rejected<S>> {
        let descriptor = stream.as_raw_fd();
        if self.contains(descriptor) {
            return Err(Rejected {
                stream,
                reason: RelayError::DuplicateDescriptor(descriptor),
            });
        }
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            return Err(Rejected {
                stream,
                reason: RelayError::CapacityExceeded {
                    capacity: self.capacity(),
                },
            });
        };
        self.slots[index] = Some(Slot { descriptor, stream });
        self.active += 1;
        Ok(index)
    }

    /// Free the slot holding `descriptor` and return its stream. Returns
    /// `None` (and changes nothing) if the descriptor is not present.
    pub fn remove(&mut self, descriptor: RawFd) -> Option<S> {
        let index = self.index_of(descriptor)?;
        let slot = self.slots[index].take()?;
        self.active -= 1;
        Some(slot.stream)
    }

    pub fn contains(&self, descriptor: RawFd) -> bool {
        self.index_of(descriptor).is_some()
    }

    /// Slot index currently holding `descriptor`.
    pub fn index_of(&self, descriptor: RawFd) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|slot| slot.descriptor == descriptor)
        })
    }

    pub fn get_mut(&mut self, descriptor: RawFd) -> Option<&mut S> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|slot| slot.descriptor == descriptor)
            .map(|slot| &mut slot.stream)
    }

    /// Occupied slots as `(index, descriptor)`, in index order.
    pub fn for_each_active(&self) -> impl Iterator<Item = (usize, RawFd)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|slot| (index, slot.descriptor)))
    }

    /// Occupied slots with mutable stream access, in index order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, RawFd, &mut S)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_mut()
                    .map(|slot| (index, slot.descriptor, &mut slot.stream))
            })
    }
}
