//! Mirror error types.

use keystone_abi::{DecodeError, DemangleError};
use thiserror::Error;

/// Why a reflection query failed
///
/// None of these are fatal to the mirror. A query that fails leaves the
/// context usable for the next one.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// The target refused or could not satisfy a read
    #[error("Failed to read {size} bytes at {address:#x}")]
    ReadFailed { address: u64, size: u64 },

    /// The peer process went away or the pipe broke
    #[error("Pipe I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The peer answered with something the protocol does not allow
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Unknown two-byte request code
    #[error("Unknown request {0:?}")]
    UnknownRequest([u8; 2]),

    /// The target does not export a symbol
    #[error("Symbol '{0}' is not defined in the target")]
    MissingSymbol(String),

    /// A relative reference with a zero displacement where one is required
    #[error("Null relative reference at {0:#x}")]
    NullReference(u64),

    /// A reflection record points outside every registered section
    #[error("Reference to {0:#x} leaves the reflection sections")]
    DanglingReference(u64),

    /// Reflection section bytes could not be parsed
    #[error("Malformed reflection records: {0}")]
    Decode(#[from] DecodeError),

    /// A mangled name in the records or from the caller does not demangle
    #[error("Bad mangled name: {0}")]
    Demangle(#[from] DemangleError),

    /// No field descriptor registered for a nominal type
    #[error("No reflection records for {0}")]
    MissingFieldDescriptor(String),

    /// No builtin descriptor registered for a builtin type
    #[error("No layout for builtin type {0}")]
    UnknownBuiltin(String),

    /// Metadata word that is not a known kind
    #[error("Unrecognized metadata kind {kind:#x} at {metadata:#x}")]
    UnknownMetadataKind { metadata: u64, kind: u64 },

    /// Opaque metadata that is not one of the runtime's builtin records
    #[error("Opaque metadata at {0:#x} is not a known builtin")]
    UnknownOpaqueMetadata(u64),

    /// Metadata without the descriptor its kind requires
    #[error("Metadata at {0:#x} has no nominal type descriptor")]
    MissingDescriptor(u64),

    /// Handle that this context never issued
    #[error("Invalid type reference handle {0}")]
    InvalidTypeRef(u64),

    /// Generic parameter with no binding in the enclosing type
    #[error("Unbound generic parameter {0}")]
    UnboundGenericParam(u32),

    /// Child lookup past the last field
    #[error("Child {index} out of range; type has {count} fields")]
    ChildOutOfRange { index: usize, count: usize },

    /// Type that has no stored representation the mirror understands
    #[error("Cannot lay out {0}")]
    NotLowerable(String),

    /// An offset from a target address runs past the end of the address space
    #[error("Address {base:#x} + {offset:#x} overflows")]
    AddressOverflow { base: u64, offset: u64 },

    /// Nesting deeper than any sane type, usually a cycle in corrupt metadata
    #[error("Type nesting exceeds {0} levels")]
    TooDeep(usize),
}

pub type MirrorResult<T> = Result<T, MirrorError>;
