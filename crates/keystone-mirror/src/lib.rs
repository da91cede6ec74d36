//! Keystone remote mirror
//!
//! Reconstructs type layouts of a running (or crashed) target from the
//! reflection sections its images carry and the metadata records in its
//! memory. The mirror never runs target code and never trusts target memory:
//! every read can fail, and a failed read fails only the query that made it.
//!
//! The pieces:
//! - `reader`: where target bytes come from (in-process, C callbacks, pipe)
//! - `pipe`: the two-byte request protocol and a responder for `keystone serve`
//! - `registry`: copies of registered reflection sections, indexed by name
//! - `typeref`: interned type references and their tree dump
//! - `lowering`: size, alignment and children of a type reference
//! - `context`: the query surface tying the above together
//! - `capi`: the same surface for C embedders

#![warn(rust_2018_idioms)]

pub mod capi;
pub mod context;
pub mod error;
pub mod lowering;
pub mod pipe;
pub mod reader;
pub mod registry;
pub mod typeref;

pub use context::{
    demangle, supported_metadata_version, AssociatedTypeWitness, ChildInfo, ReflectionContext,
};
pub use error::{MirrorError, MirrorResult};
pub use lowering::{FieldInfo, LayoutKind, TypeInfo};
pub use pipe::{InstanceKind, PipeMemoryReader, Responder};
pub use reader::{CallbackReader, MemoryReader, RuntimeReader};
pub use registry::{ReflectionInfo, RemoteSection};
pub use typeref::TypeRefId;

use keystone_runtime::LoadedImage;

impl From<&LoadedImage> for ReflectionInfo {
    fn from(image: &LoadedImage) -> Self {
        Self {
            sections: image.reflection_sections().map(|range| RemoteSection {
                start: range.start,
                size: range.size,
            }),
        }
    }
}
