// abridge_protocol — wire framing shared by the abridge relay and its clients.
//
// The protocol is nothing but framing: a 4-byte big-endian length prefix
// followed by that many opaque payload bytes. There is no handshake, no
// message type, and no version field.
//
// Module overview:
// - `framing.rs`:  Length codec (`encode_length` / `decode_length`), the
//                  exact-count `read_exact` / `write_exact` primitives with
//                  interruption retry, and whole-frame helpers built on them.
//
// Works over any `std::io::Read` / `Write`, so the same code serves blocking
// `TcpStream`s in the relay and in-memory buffers in tests.

pub mod framing;

pub use framing::{
    FrameError, LENGTH_PREFIX_LEN, MAX_FRAME_LEN, TransferError, decode_length, encode_frame,
    encode_length, read_exact, read_frame, write_exact, write_frame,
};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn length_codec_is_lossless(n in any::<u32>()) {
            prop_assert_eq!(decode_length(encode_length(n)), n);
        }

        #[test]
        fn length_codec_preserves_order(a in any::<u32>(), b in any::<u32>()) {
            // Big-endian bytes compare the same way the integers do.
            prop_assert_eq!(encode_length(a).cmp(&encode_length(b)), a.cmp(&b));
        }

        #[test]
        fn any_bounded_payload_survives_the_wire(
            payload in proptest::collection::vec(any::<u8>(), 0..=MAX_FRAME_LEN as usize)
        ) {
            let wire = encode_frame(&payload).unwrap();
            prop_assert_eq!(wire.len(), LENGTH_PREFIX_LEN + payload.len());

            let mut cursor = Cursor::new(wire);
            let recovered = read_frame(&mut cursor, MAX_FRAME_LEN).unwrap();
            prop_assert_eq!(recovered, payload);
        }
    }

    #[test]
    fn hello_scenario_bytes() {
        let wire = encode_frame(b"hello").unwrap();
        assert_eq!(wire, [0x00, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }
}
