// Length-prefixed frame codec and exact-count byte transfer.
//
// Wire format: a 4-byte big-endian length, then exactly that many payload
// bytes. The payload is opaque; nothing here looks inside it.
//
// `read_exact` / `write_exact` are the relay's only I/O primitives. They
// differ from the `std::io` helpers of the same name in two ways: the error
// carries how many bytes moved before the failure, and a peer close is
// reported as `PeerClosed` rather than folded into `UnexpectedEof`, so the
// caller can tell "client went away" apart from "the OS said no".
//
// `MAX_FRAME_LEN` (4096) bounds the allocation a length prefix can trigger.
// `read_frame` rejects an oversized prefix after consuming only those four
// bytes; the unread payload is left on the stream and the caller is expected
// to drop the connection.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Largest payload the relay accepts.
pub const MAX_FRAME_LEN: u32 = 4096;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Failure of an exact-count read or write.
///
/// Both variants mean the connection is no longer usable. Bytes already
/// moved are not rolled back.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The peer closed the stream (read returned 0, or write accepted 0).
    #[error("peer closed after {transferred} of {expected} bytes")]
    PeerClosed { transferred: usize, expected: usize },

    /// The OS reported an error other than `Interrupted`.
    #[error("i/o error after {transferred} of {expected} bytes: {source}")]
    Io {
        transferred: usize,
        expected: usize,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    /// Bytes that made it across before the failure.
    pub fn transferred(&self) -> usize {
        match self {
            Self::PeerClosed { transferred, .. } | Self::Io { transferred, .. } => *transferred,
        }
    }

    /// The peer closed cleanly on a frame boundary: EOF before any byte of
    /// the transfer. Every other failure means the stream broke mid-transfer
    /// or the OS reported an error.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Self::PeerClosed { transferred: 0, .. })
    }
}

/// Failure to read or write a whole frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection lost: {0}")]
    ConnectionLost(#[from] TransferError),

    /// Declared length exceeds the accepted maximum. Only the prefix has
    /// been consumed.
    #[error("frame too large: {len} bytes (max {max})")]
    TooLarge { len: u32, max: u32 },
}

/// Big-endian wire form of a frame length.
pub fn encode_length(len: u32) -> [u8; LENGTH_PREFIX_LEN] {
    len.to_be_bytes()
}

/// Inverse of `encode_length`.
pub fn decode_length(bytes: [u8; LENGTH_PREFIX_LEN]) -> u32 {
    u32::from_be_bytes(bytes)
}

/// Build a complete wire frame (prefix + payload) in one buffer.
pub fn encode_frame(payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {} bytes does not fit a u32 length", payload.len()),
        )
    })?;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    buf.extend_from_slice(&encode_length(len));
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Read exactly `n` bytes. Interrupted reads are retried; anything else that
/// stops short discards what was read and returns an error.
pub fn read_exact<R: Read + ?Sized>(reader: &mut R, n: usize) -> Result<Vec<u8>, TransferError> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(TransferError::PeerClosed {
                    transferred: filled,
                    expected: n,
                });
            }
            Ok(count) => filled += count,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(source) => {
                return Err(TransferError::Io {
                    transferred: filled,
                    expected: n,
                    source,
                });
            }
        }
    }
    Ok(buf)
}

/// Write all of `bytes`. Interrupted writes are retried; a zero-length write
/// or other error stops the transfer where it is.
pub fn write_exact<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> Result<(), TransferError> {
    let mut written = 0;
    while written < bytes.len() {
        match writer.write(&bytes[written..]) {
            Ok(0) => {
                return Err(TransferError::PeerClosed {
                    transferred: written,
                    expected: bytes.len(),
                });
            }
            Ok(count) => written += count,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(source) => {
                return Err(TransferError::Io {
                    transferred: written,
                    expected: bytes.len(),
                    source,
                });
            }
        }
    }
    Ok(())
}

/// Read the 4-byte length prefix of the next frame.
pub fn read_length<R: Read + ?Sized>(reader: &mut R) -> Result<u32, TransferError> {
    let bytes = read_exact(reader, LENGTH_PREFIX_LEN)?;
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    prefix.copy_from_slice(&bytes);
    Ok(decode_length(prefix))
}

/// Read one frame, rejecting lengths above `max_len` before touching the
/// payload.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R, max_len: u32) -> Result<Vec<u8>, FrameError> {
    let len = read_length(reader)?;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }
    Ok(read_exact(reader, len as usize)?)
}

/// Write one frame: prefix, then payload, as two exact writes.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: u32::MAX,
        max: u32::MAX,
    })?;
    write_exact(writer, &encode_length(len))?;
    write_exact(writer, payload)?;
    writer.flush().map_err(|source| TransferError::Io {
        transferred: payload.len(),
        expected: payload.len(),
        source,
    })?;
    Ok(())
}
