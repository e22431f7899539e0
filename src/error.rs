//! Crate-wide error type.
//!
//! Per the error handling philosophy of this crate (mirroring the source's "never throw"
//! stance), most parse failures are *not* represented here: a malformed descriptor, an
//! unmapped PID, or a CRC mismatch degrade to `None`/a counter increment rather than an
//! `Err`. [`Error`] is reserved for failures that make a buffer un-interpretable at all.

use thiserror::Error as ThisError;

/// Errors produced while extracting fixed-layout data from a byte slice.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A read or skip ran past the end of the available bytes.
    #[error("buffer overrun: requested {requested} bytes with {remaining} remaining at offset {offset}")]
    BufferOverrun {
        /// Byte offset within the buffer the read was attempted at.
        offset: usize,
        /// Number of bytes requested.
        requested: usize,
        /// Number of bytes actually remaining.
        remaining: usize,
    },
    /// The packet's sync byte was not `0x47`.
    #[error("lost sync: expected 0x47, found {found:#04x}")]
    LostSync {
        /// The byte actually encountered.
        found: u8,
    },
    /// An adaptation field's declared length was inconsistent with the packet.
    #[error("bad adaptation field header")]
    BadAdaptationHeader,
}

/// [`std::result::Result`] alias using this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
