// abridge_relay — fixed-capacity TCP broadcast relay.
//
// Every frame a client sends is written to every other connected client.
// There is no session, no handshake, and no interpretation of payloads; the
// wire format is `abridge_protocol`'s 4-byte big-endian length prefix plus
// payload.
//
// Module overview:
// - `slots.rs`:   `SlotTable`, the fixed-capacity registry of connected
//                 streams, iterated in slot order.
// - `poll.rs`:    Readiness wait over the listener and all slots (`poll(2)`),
//                 including stale-descriptor detection.
// - `relay.rs`:   `relay_frame`, which reads one frame from an origin and fans
//                 it out to every other slot, isolating per-peer failures.
// - `server.rs`:  Listener setup and the single-threaded event loop that ties
//                 the above together; `start_relay` for embedding.
// - `client.rs`:  `RelayClient`, a small threaded client for tools and tests.
// - `daemon.rs`:  Fork-and-setsid used by the binary unless `--dontfork`.
// - `error.rs`:   `RelayError`.
//
// Unix-only: the event loop is built directly on `poll(2)` and raw
// descriptors.

pub mod client;
pub mod daemon;
pub mod error;
pub mod poll;
pub mod relay;
pub mod server;
pub mod slots;

pub use error::RelayError;
pub use server::{RelayConfig, RelayHandle, run_relay_blocking, start_relay};
