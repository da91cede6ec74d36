//! Compilation errors

use keystone_ast::ValidationError;
use thiserror::Error;

pub type IrGenResult<T> = Result<T, IrGenError>;

/// Broken layout invariants
///
/// These can only arise from a declaration graph that validation should
/// have rejected, so the compile driver treats them as fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{decl} has no type metadata")]
    NoMetadata { decl: String },

    #[error("Address point of {decl} was never recorded")]
    MissingAddressPoint { decl: String },

    #[error("Address point of {decl} recorded more than once")]
    DuplicateAddressPoint { decl: String },

    #[error("{decl} has no virtual methods")]
    NoVTable { decl: String },

    #[error("{decl} is not a class")]
    NotAClass { decl: String },

    #[error("{slot} is not part of the metadata of {decl}")]
    SlotNotFound { decl: String, slot: String },

    #[error("Generic parameter {index} referenced outside a generic context")]
    NoGenericContext { index: u32 },
}

#[derive(Debug, Error)]
pub enum IrGenError {
    #[error("Layout invariant violated: {0}")]
    Layout(#[from] LayoutError),

    #[error("Invalid declarations: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid target: {message}")]
    InvalidTarget { message: String },

    #[error("Unknown declaration #{0}")]
    UnknownDecl(u32),

    #[error("{ty} does not conform to {protocol}")]
    MissingConformance { ty: String, protocol: String },

    #[error("Symbol {name} defined twice")]
    DuplicateSymbol { name: String },

    #[error("Undefined symbol {name} referenced from {from}")]
    UndefinedSymbol { name: String, from: String },

    #[error("Relative reference from {from} to {name} is out of range")]
    RelativeOutOfRange { name: String, from: String },
}
