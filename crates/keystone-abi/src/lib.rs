//! Keystone ABI
//!
//! Binary formats that the metadata compiler, the runtime and the remote
//! mirror must agree on byte for byte: the per-target pointer facts, metadata
//! kind values and flag bits, value layout rules, reflection records, the
//! mangling grammar, op-program function bodies and the linked image file.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bytes;
pub mod image;
pub mod kind;
pub mod mangle;
pub mod opcode;
pub mod records;
pub mod symbols;
pub mod target;
pub mod value;

pub use bytes::{align_up, ByteReader, ByteWriter, DecodeError};
pub use image::{Bind, Image, ImageError, Rebase, Section, Symbol, SymbolKind};
pub use kind::{DescriptorKind, FieldDescriptorKind, MetadataKind};
pub use mangle::{
    demangle_symbol, demangle_to_string, demangle_type, DemangleError, Entity, MangledType,
    NominalKind,
};
pub use opcode::{AccessOp, CacheRef, ClassInit, SlotRef, TypeRecipe};
pub use records::{ReflectionSection, REFLECTION_METADATA_VERSION};
pub use target::{Arch, ObjectFormat, TargetAbi};
pub use value::{EnumLayout, EnumStrategy, RecordLayout, ValueLayout};
