use thiserror::Error;

pub type Result<T> = std::result::Result<T, Hdf5Error>;

/// Every way the engine can fail, as a closed sum.
///
/// Parse errors propagate to the top-level operation without exposing a
/// partially-built object. Write errors poison the handle; everything after
/// that fails with `HandlePoisoned`.
#[derive(Debug, Error)]
pub enum Hdf5Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrong magic bytes at the expected offset.
    #[error("bad signature at expected offset")]
    BadSignature,
    /// Superblock or message-format version outside the supported range.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    /// A reserved byte, integer, or bitfield was non-zero.
    #[error("reserved bits violated")]
    ReservedBitsViolated,
    /// A header message with the fail-on-unknown flag set was not recognized.
    #[error("unknown required message type {0:#06x}")]
    UnknownRequiredMessage(u16),
    /// A fractal heap id names an offset outside the heap's managed space.
    #[error("heap id out of range")]
    HeapIdOutOfRange,
    /// A fractal heap child block pointer was the undefined address.
    #[error("unallocated child block")]
    UnallocatedChildBlock,
    /// B-tree keys were not monotonically increasing within a node.
    #[error("b-tree key order violation")]
    BtreeKeyOrderViolation,
    /// An allocation would advance end-of-file past what offset-size can encode.
    #[error("allocation overflow")]
    AllocationOverflow,
    /// The channel returned fewer bytes than required.
    #[error("truncated read")]
    TruncatedRead,
    /// In-memory serialization exceeded its allocated slot.
    #[error("buffer overflow on write")]
    BufferOverflowOnWrite,
    /// Operation issued against a handle after close().
    #[error("operation on closed handle")]
    CacheMissOnClosedHandle,
    /// A previous write error left the handle unusable.
    #[error("handle poisoned by earlier write error")]
    HandlePoisoned,
    /// bit offset + bit precision exceeds the descriptor width.
    #[error("bit precision exceeds descriptor width")]
    PrecisionExceedsWidth,
    #[error("negative bit offset")]
    NegativeBitOffset,
    /// Requested host type does not match the dataset's datatype.
    #[error("datatype mismatch: {0}")]
    TypeMismatch(String),
    /// Structural decode failure that has no more specific kind.
    #[error("parse error: {0}")]
    Parse(String),
}

impl<'a> From<nom::Err<nom::error::VerboseError<&'a [u8]>>> for Hdf5Error {
    fn from(e: nom::Err<nom::error::VerboseError<&'a [u8]>>) -> Self {
        use nom::Err::*;
        match &e {
            Incomplete(_) => Hdf5Error::TruncatedRead,
            Error(ctx) | Failure(ctx) => Hdf5Error::Parse(
                ctx.errors
                    .iter()
                    .rev()
                    .filter_map(|(_, kind)| match kind {
                        nom::error::VerboseErrorKind::Context(c) => Some(*c),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(" > "),
            ),
        }
    }
}
