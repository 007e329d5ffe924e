//! Error types.
//!
//! Every fallible library operation returns [`Error`]. Parsing errors are raised before
//! any byte of an image is touched; errors from `apply` leave the image unchanged.

use crate::address::Region;

/// Errors produced while parsing images, parsing patches or mutating an image.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The image header or one of its length/offset fields is malformed.
    #[error("malformed image: {0}")]
    Format(String),
    /// Segments overlap, or the entry point is outside the code window.
    #[error("invalid layout: {0}")]
    InvalidLayout(String),
    /// A patch record (or persisted patch) is truncated or not valid hex.
    #[error("malformed patch: {0}")]
    MalformedPatch(String),
    /// A patch record starts with a tag byte we do not understand.
    #[error("unsupported patch tag 0x{tag:02X} at byte {position}")]
    UnsupportedTag { tag: u8, position: usize },
    /// An injected routine declared zero or a negative number of instructions.
    #[error("injected routine at 0x{address:08X} declares {count} instructions")]
    NonPositiveCount { address: u32, count: i32 },
    /// Two records of one batch target the same address.
    #[error("more than one patch targets 0x{0:08X}")]
    Uniqueness(u32),
    /// The address is not covered by any mapped region.
    #[error("address 0x{0:08X} is outside every mapped region")]
    OutOfRange(u32),
    /// The address maps to memory with no bytes in the image.
    #[error("address 0x{address:08X} lies in {region} and has no bytes in the image")]
    UnpatchableRegion { address: u32, region: Region },
    /// A target, cursor or branch displacement is not word aligned.
    #[error("address 0x{0:08X} is not word aligned")]
    MisalignedAddress(u32),
    /// A relative branch cannot reach its destination.
    #[error("branch from 0x{from:08X} to 0x{to:08X} is out of range")]
    DisplacementOverflow { from: u32, to: u32 },
    /// A persisted patch carries an unknown `type`.
    #[error("unknown patch type `{0}`")]
    UnknownTag(String),
    /// The patch record cannot take the requested change.
    #[error("patch record: {0}")]
    Record(String),
    /// Reading or writing the underlying storage failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
