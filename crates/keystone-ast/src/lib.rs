//! Keystone declaration model
//!
//! Fully resolved, canonical descriptions of nominal types (structs, enums,
//! classes and protocols) as handed to the metadata compiler. Nothing in this
//! crate computes layout; it only describes what was declared.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod decl;
pub mod lexer;
pub mod manifest;
pub mod parser;
pub mod program;
pub mod ty;

pub use decl::{
    CaseDecl, Conformance, DeclId, DeclKind, FieldDecl, GenericParam, MethodDecl, MethodRef,
    NominalDecl,
};
pub use manifest::{Manifest, ManifestError};
pub use program::{Program, ValidationError};
pub use ty::{BuiltinType, Span, Type};
