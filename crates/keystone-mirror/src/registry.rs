//! Registered reflection sections
//!
//! Section bytes are copied out of the target once, when an image is
//! registered, and every record is resolved to owned strings right away.
//! Lookups after that never touch the target.

use crate::error::{MirrorError, MirrorResult};
use crate::reader::MemoryReader;
use keystone_abi::bytes::read_cstr;
use keystone_abi::records::{
    parse_associated_type_section, parse_builtin_section, parse_capture_section,
    parse_field_section, RelRef,
};
use keystone_abi::{FieldDescriptorKind, ReflectionSection, ValueLayout};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// A byte range in the target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteSection {
    pub start: u64,
    pub size: u64,
}

impl RemoteSection {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address - self.start < self.size
    }
}

/// Reflection sections of one image, in `ReflectionSection::ALL` order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReflectionInfo {
    pub sections: [RemoteSection; 6],
}

impl ReflectionInfo {
    pub fn section(&self, kind: ReflectionSection) -> RemoteSection {
        let index = ReflectionSection::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(0);
        self.sections[index]
    }
}

/// One stored property or enum case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRecord {
    pub name: String,
    /// Mangled type; `None` for enum cases without payload
    pub mangled_type: Option<String>,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub kind: FieldDescriptorKind,
    /// Mangled superclass type, for classes with one
    pub superclass: Option<String>,
    pub fields: Vec<FieldRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociatedTypes {
    /// Mangled protocol
    pub protocol: String,
    /// Requirement name and mangled witness type
    pub witnesses: Vec<(String, String)>,
}

/// Closure context layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDescriptor {
    pub captures: Vec<String>,
    pub num_bindings: u32,
}

/// Local copy of one remote section
struct SectionCopy {
    start: u64,
    bytes: Vec<u8>,
}

/// Records of one image, resolved but not yet registered
#[derive(Default)]
struct ParsedImage {
    fields: Vec<(String, FieldDescriptor)>,
    builtins: Vec<(String, ValueLayout)>,
    associated: Vec<(String, AssociatedTypes)>,
    captures: Vec<CaptureDescriptor>,
}

/// Everything learned from registered images
#[derive(Default)]
pub struct TypeRegistry {
    fields: FxHashMap<String, Arc<FieldDescriptor>>,
    builtins: FxHashMap<String, ValueLayout>,
    associated: FxHashMap<String, Vec<AssociatedTypes>>,
    captures: Vec<CaptureDescriptor>,
    strings: Vec<SectionCopy>,
    images: usize,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image_count(&self) -> usize {
        self.images
    }

    /// Copy and index one image's sections
    ///
    /// A type described by more than one image keeps the first description.
    /// Nothing is registered unless every section reads and parses.
    #[instrument(skip(self, reader, info))]
    pub fn add<R: MemoryReader + ?Sized>(
        &mut self,
        reader: &R,
        info: &ReflectionInfo,
    ) -> MirrorResult<()> {
        let copy = |kind: ReflectionSection| -> MirrorResult<SectionCopy> {
            let section = info.section(kind);
            let bytes = if section.size == 0 {
                Vec::new()
            } else {
                reader.read_bytes(section.start, section.size)?
            };
            Ok(SectionCopy {
                start: section.start,
                bytes,
            })
        };
        let fieldmd = copy(ReflectionSection::FieldMetadata)?;
        let assocty = copy(ReflectionSection::AssociatedTypes)?;
        let builtin = copy(ReflectionSection::Builtin)?;
        let capture = copy(ReflectionSection::Capture)?;
        let typeref = copy(ReflectionSection::TypeRef)?;
        let reflstr = copy(ReflectionSection::ReflectionStrings)?;

        let mark = self.strings.len();
        self.strings.push(typeref);
        self.strings.push(reflstr);
        let parsed = self.parse(&fieldmd, &assocty, &builtin, &capture);
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                self.strings.truncate(mark);
                return Err(e);
            }
        };

        let mut new_fields = 0usize;
        for (name, descriptor) in parsed.fields {
            if !self.fields.contains_key(&name) {
                new_fields += 1;
                self.fields.insert(name, Arc::new(descriptor));
            }
        }
        for (name, layout) in parsed.builtins {
            self.builtins.entry(name).or_insert(layout);
        }
        for (conforming, types) in parsed.associated {
            let entry = self.associated.entry(conforming).or_default();
            if !entry.iter().any(|existing| existing.protocol == types.protocol) {
                entry.push(types);
            }
        }
        self.captures.extend(parsed.captures);
        self.images += 1;
        debug!(
            fields = new_fields,
            builtins = self.builtins.len(),
            "registered reflection info"
        );
        Ok(())
    }

    fn parse(
        &self,
        fieldmd: &SectionCopy,
        assocty: &SectionCopy,
        builtin: &SectionCopy,
        capture: &SectionCopy,
    ) -> MirrorResult<ParsedImage> {
        let mut parsed = ParsedImage::default();
        for raw in parse_field_section(&fieldmd.bytes)? {
            let name = self.required(&raw.mangled_type_name, fieldmd.start)?;
            let superclass = self.optional(&raw.superclass, fieldmd.start)?;
            let fields = raw
                .fields
                .iter()
                .map(|record| {
                    Ok(FieldRecord {
                        name: self.required(&record.field_name, fieldmd.start)?,
                        mangled_type: self.optional(&record.mangled_type_name, fieldmd.start)?,
                        flags: record.flags,
                    })
                })
                .collect::<MirrorResult<Vec<_>>>()?;
            parsed.fields.push((
                name,
                FieldDescriptor {
                    kind: raw.kind,
                    superclass,
                    fields,
                },
            ));
        }

        for raw in parse_builtin_section(&builtin.bytes)? {
            let name = self.required(&raw.type_name, builtin.start)?;
            let layout = ValueLayout {
                size: raw.size as u64,
                align: (raw.alignment as u64).max(1),
                stride: raw.stride as u64,
                extra_inhabitants: raw.extra_inhabitants,
                pod: true,
                bitwise_takable: true,
            };
            parsed.builtins.push((name, layout));
        }

        for raw in parse_associated_type_section(&assocty.bytes)? {
            let conforming = self.required(&raw.conforming_type_name, assocty.start)?;
            let protocol = self.required(&raw.protocol_type_name, assocty.start)?;
            let witnesses = raw
                .records
                .iter()
                .map(|record| {
                    Ok((
                        self.required(&record.name, assocty.start)?,
                        self.required(&record.substituted_type_name, assocty.start)?,
                    ))
                })
                .collect::<MirrorResult<Vec<_>>>()?;
            parsed.associated.push((
                conforming,
                AssociatedTypes {
                    protocol,
                    witnesses,
                },
            ));
        }

        for raw in parse_capture_section(&capture.bytes)? {
            let captures = raw
                .capture_types
                .iter()
                .map(|reference| self.required(reference, capture.start))
                .collect::<MirrorResult<Vec<_>>>()?;
            parsed.captures.push(CaptureDescriptor {
                captures,
                num_bindings: raw.num_bindings,
            });
        }
        Ok(parsed)
    }

    fn required(&self, reference: &RelRef, section_start: u64) -> MirrorResult<String> {
        let at = section_start.wrapping_add(reference.at);
        let target = reference
            .resolve(section_start)
            .ok_or(MirrorError::NullReference(at))?;
        self.string_at(target)
    }

    fn optional(&self, reference: &RelRef, section_start: u64) -> MirrorResult<Option<String>> {
        match reference.resolve(section_start) {
            Some(target) => self.string_at(target).map(Some),
            None => Ok(None),
        }
    }

    /// String in a registered `typeref` or `reflstr` section
    fn string_at(&self, address: u64) -> MirrorResult<String> {
        let copy = self
            .strings
            .iter()
            .find(|copy| address >= copy.start && address - copy.start < copy.bytes.len() as u64)
            .ok_or(MirrorError::DanglingReference(address))?;
        Ok(read_cstr(&copy.bytes, (address - copy.start) as usize)?.to_string())
    }

    /// Field descriptor by unbound mangled nominal name
    pub fn field_descriptor(&self, mangled: &str) -> Option<Arc<FieldDescriptor>> {
        self.fields.get(mangled).cloned()
    }

    /// Layout of a builtin by its mangled code
    pub fn builtin(&self, code: &str) -> Option<ValueLayout> {
        self.builtins.get(code).copied()
    }

    /// Associated type witnesses of a conforming type
    pub fn associated_types(&self, conforming: &str) -> &[AssociatedTypes] {
        self.associated
            .get(conforming)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn captures(&self) -> &[CaptureDescriptor] {
        &self.captures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::RuntimeReader;
    use keystone_abi::kind::field_record_flags;
    use keystone_ast::{BuiltinType, NominalDecl, Program, Type};
    use keystone_irgen::{CompileOptions, Compiler};
    use keystone_runtime::Runtime;

    #[test]
    fn test_records_resolve_to_owned_strings() {
        let mut program = Program::new();
        let sequence = program.add(NominalDecl::protocol("Sequence", "main").with_associated_type("Element"));
        program.add(
            NominalDecl::structure("Bytes", "main")
                .with_field("count", Type::Builtin(BuiltinType::Int64))
                .with_conformance(
                    sequence,
                    vec![("Element".to_string(), Type::Builtin(BuiltinType::Int8))],
                ),
        );
        let compilation = Compiler::new(&program, "main", CompileOptions::default())
            .compile()
            .unwrap();
        let rt = Runtime::new().unwrap();
        let loaded = rt.load(&compilation.image).unwrap();

        let mut registry = TypeRegistry::new();
        registry.add(&RuntimeReader::new(&rt), &ReflectionInfo::from(loaded.as_ref())).unwrap();
        let bytes = registry.field_descriptor("4main5BytesV").unwrap();
        assert_eq!(bytes.kind, FieldDescriptorKind::Struct);
        assert_eq!(bytes.fields[0].name, "count");
        assert_eq!(bytes.fields[0].mangled_type.as_deref(), Some("Bi64_"));
        assert_eq!(bytes.fields[0].flags, field_record_flags::IS_VAR);
        assert_eq!(registry.builtin("Bi64_").unwrap().size, 8);
        let witnesses = registry.associated_types("4main5BytesV");
        assert_eq!(witnesses[0].protocol, "4main8SequenceP");
        assert_eq!(
            witnesses[0].witnesses,
            vec![("Element".to_string(), "Bi8_".to_string())]
        );

        // A second registration of the same image changes nothing.
        registry.add(&RuntimeReader::new(&rt), &ReflectionInfo::from(loaded.as_ref())).unwrap();
        assert_eq!(registry.image_count(), 2);
        assert!(Arc::ptr_eq(&bytes, &registry.field_descriptor("4main5BytesV").unwrap()));
    }

    #[test]
    fn test_unreadable_section_fails_registration() {
        let rt = Runtime::new().unwrap();
        let mut info = ReflectionInfo::default();
        info.sections[0] = RemoteSection { start: 64, size: 16 };
        let mut registry = TypeRegistry::new();
        assert!(matches!(
            registry.add(&RuntimeReader::new(&rt), &info),
            Err(MirrorError::ReadFailed { address: 64, .. })
        ));
        assert_eq!(registry.image_count(), 0);
    }
}
