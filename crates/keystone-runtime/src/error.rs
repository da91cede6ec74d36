//! Runtime error types.

use keystone_abi::{DecodeError, ImageError};
use thiserror::Error;

/// Errors raised while executing access functions or building metadata
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// The allocator refused a request
    #[error("Out of memory allocating {size} bytes")]
    OutOfMemory { size: u64 },

    /// Free of an address that is not the start of a live allocation
    #[error("Invalid free of {address:#x}")]
    InvalidFree { address: u64 },

    /// Access outside every mapped region
    #[error("Access of {len} bytes at unmapped address {address:#x}")]
    Unmapped { address: u64, len: u64 },

    /// Word access at a misaligned address
    #[error("Misaligned atomic access at {address:#x}")]
    Misaligned { address: u64 },

    /// Function body could not be decoded
    #[error("Bad function body at {function:#x}: {source}")]
    Decode {
        function: u64,
        #[source]
        source: DecodeError,
    },

    /// `BeginOnce` without a matching `EndOnce`, or the reverse
    #[error("Unbalanced once region in function {function:#x}")]
    UnbalancedOnce { function: u64 },

    /// Function body ended without returning
    #[error("Function {function:#x} ended without returning")]
    MissingReturn { function: u64 },

    /// A context-relative op ran without a context metadata
    #[error("No context metadata in function {function:#x}")]
    NoContext { function: u64 },

    /// An op read an argument the caller did not pass
    #[error("Function {function:#x} has no argument {index}")]
    MissingArgument { function: u64, index: u16 },

    /// Instantiation called with the wrong number of arguments
    #[error("Pattern {pattern:#x} expects {expected} arguments, got {actual}")]
    ArgumentCount {
        pattern: u64,
        expected: u16,
        actual: usize,
    },

    /// Field type vector index out of range or no vector allocated
    #[error("Bad field type store in function {function:#x}")]
    FieldTypeVector { function: u64 },

    /// A method removed as dead code was called
    #[error("Deleted method called through {function:#x}")]
    DeletedMethod { function: u64 },

    /// Class operation on metadata that is not a class
    #[error("Metadata {metadata:#x} is not a class")]
    NotAClass { metadata: u64 },

    /// Value operation on metadata that is not a struct or enum
    #[error("Metadata {metadata:#x} is not a value type")]
    NotAValueType { metadata: u64 },

    /// Superclass or class used before its instance layout was computed
    #[error("Class {metadata:#x} has no instance layout yet")]
    UninitializedClass { metadata: u64 },

    /// Kind word holds no known metadata kind
    #[error("Unknown metadata kind {kind:#x} at {metadata:#x}")]
    UnknownMetadataKind { metadata: u64, kind: u64 },

    /// Recursive request for metadata that is not far enough along to return
    #[error("Cyclic metadata dependency through {address:#x}")]
    CyclicDependency { address: u64 },

    /// Instantiation failed on the building thread
    #[error("Instantiation of pattern {pattern:#x} failed")]
    InstantiationFailed { pattern: u64 },

    /// Metadata has no nominal type descriptor
    #[error("Metadata {metadata:#x} has no descriptor")]
    MissingDescriptor { metadata: u64 },

    /// Generic class whose members moved because a resilient ancestor grew
    #[error("Cannot relocate the members of generic class {metadata:#x}")]
    UnsupportedRelocation { metadata: u64 },

    /// Symbol lookup failed
    #[error("Unknown symbol {0}")]
    UnknownSymbol(String),
}

/// Errors raised while loading an image
#[derive(Debug, Error)]
pub enum LoadError {
    /// Image built for a different pointer width
    #[error("Image {module} has {pointer_size}-byte pointers; this process uses {expected}")]
    PointerSize {
        module: String,
        pointer_size: u8,
        expected: u8,
    },

    /// Relocation entry outside the image
    #[error("Relocation at offset {offset:#x} is outside image {module}")]
    RelocationOutOfRange { module: String, offset: u64 },

    /// Bind entry naming a symbol nothing provides
    #[error("Image {module} needs undefined symbol {symbol}")]
    UnresolvedSymbol { module: String, symbol: String },

    /// Image file error
    #[error(transparent)]
    Image(#[from] ImageError),

    /// Memory error
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
