//! Reflection context
//!
//! Ties a memory reader to the registered reflection records. Type
//! references come from three places: metadata records in the target (read
//! structurally, without running any of the target's code), heap objects
//! (through their isa word), and mangled names. Every query either answers
//! completely or returns an error; a failed read never leaves partial state
//! behind in the caches.

use crate::error::{MirrorError, MirrorResult};
use crate::lowering::{LayoutKind, TypeConverter, TypeInfo};
use crate::reader::MemoryReader;
use crate::registry::{ReflectionInfo, TypeRegistry};
use crate::typeref::{self, substitute, unbound_name, TypeRefId, TypeRefTable};
use keystone_abi::kind::{
    class_layout, descriptor_layout, existential_metadata, function_metadata, metatype_metadata,
    protocol_layout, tuple_metadata, vwt, vwt_flags,
};
use keystone_abi::mangle::MANGLING_PREFIX;
use keystone_abi::symbols::{builtin_metadata, BUILTIN_CODES, ISA_MASK};
use keystone_abi::value::EXISTENTIAL_BUFFER_WORDS;
use keystone_abi::{
    demangle_to_string, demangle_type, DescriptorKind, MangledType, MetadataKind, NominalKind,
    REFLECTION_METADATA_VERSION,
};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// Upper bound on element, parameter and argument counts read from metadata
const MAX_COUNT: u64 = 256;

/// Deepest metadata nesting followed while decoding
const MAX_METADATA_DEPTH: usize = 64;

/// `base + offset` in the target; addresses come from target memory and may
/// be garbage
fn address_at(base: u64, offset: u64) -> MirrorResult<u64> {
    base.checked_add(offset)
        .ok_or(MirrorError::AddressOverflow { base, offset })
}

/// Address of word `index` after `base`
fn word_at(base: u64, index: u64, word: u64) -> MirrorResult<u64> {
    let offset = index
        .checked_mul(word)
        .ok_or(MirrorError::AddressOverflow { base, offset: index })?;
    address_at(base, offset)
}

/// Version of the reflection record format this mirror reads
pub fn supported_metadata_version() -> u16 {
    REFLECTION_METADATA_VERSION
}

/// Readable form of a mangled symbol or type
pub fn demangle(mangled: &str) -> String {
    demangle_to_string(mangled)
}

/// One stored child of a type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildInfo {
    pub name: String,
    pub offset: u64,
    pub kind: LayoutKind,
    pub typeref: TypeRefId,
}

/// One associated type witness of a conformance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociatedTypeWitness {
    pub protocol: TypeRefId,
    pub name: String,
    pub witness: TypeRefId,
}

/// Reflection over one target
pub struct ReflectionContext<R> {
    reader: R,
    registry: TypeRegistry,
    typerefs: TypeRefTable,
    converter: TypeConverter,
    isa_mask: Option<u64>,
    metadata: FxHashMap<u64, TypeRefId>,
    builtins: Option<FxHashMap<u64, &'static str>>,
}

impl<R: MemoryReader> ReflectionContext<R> {
    pub fn new(reader: R) -> Self {
        let converter = TypeConverter::new(reader.pointer_size());
        Self {
            reader,
            registry: TypeRegistry::new(),
            typerefs: TypeRefTable::default(),
            converter,
            isa_mask: None,
            metadata: FxHashMap::default(),
            builtins: None,
        }
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    fn word(&self) -> u64 {
        self.reader.pointer_size() as u64
    }

    /// Register one image's reflection sections
    pub fn add_reflection_info(&mut self, info: &ReflectionInfo) -> MirrorResult<()> {
        self.registry.add(&self.reader, info)?;
        self.converter.clear();
        Ok(())
    }

    /// Mask applied to an isa word to find the class; all ones when the
    /// target does not export one
    pub fn read_isa_mask(&mut self) -> MirrorResult<u64> {
        if let Some(mask) = self.isa_mask {
            return Ok(mask);
        }
        let mask = match self.reader.symbol_address(ISA_MASK) {
            Ok(address) => self.reader.read_word(address)?,
            Err(MirrorError::MissingSymbol(_)) => u64::MAX,
            Err(e) => return Err(e),
        };
        self.isa_mask = Some(mask);
        Ok(mask)
    }

    /// Type reference handle for a tree
    pub fn intern(&mut self, ty: MangledType) -> TypeRefId {
        self.typerefs.intern(ty)
    }

    /// Tree behind a handle
    pub fn typeref(&self, id: TypeRefId) -> MirrorResult<&MangledType> {
        self.typerefs.get(id).map(|ty| &**ty)
    }

    /// Type reference for a metadata record in the target
    #[instrument(skip(self))]
    pub fn typeref_for_metadata(&mut self, metadata: u64) -> MirrorResult<TypeRefId> {
        if let Some(id) = self.metadata.get(&metadata) {
            return Ok(*id);
        }
        let ty = self.decode_metadata(metadata, 0)?;
        let id = self.typerefs.intern(ty);
        self.metadata.insert(metadata, id);
        Ok(id)
    }

    /// Type reference for the class of a heap object
    pub fn typeref_for_instance(&mut self, object: u64) -> MirrorResult<TypeRefId> {
        let metadata = self.class_of(object)?;
        self.typeref_for_metadata(metadata)
    }

    /// Type reference for a mangled type, with or without the symbol prefix
    pub fn typeref_for_mangled_name(&mut self, mangled: &str) -> MirrorResult<TypeRefId> {
        let body = mangled.strip_prefix(MANGLING_PREFIX).unwrap_or(mangled);
        let ty = demangle_type(body)?;
        Ok(self.typerefs.intern(ty))
    }

    pub fn generic_argument_count(&self, id: TypeRefId) -> MirrorResult<usize> {
        Ok(match self.typeref(id)? {
            MangledType::Nominal { args, .. } => args.len(),
            _ => 0,
        })
    }

    pub fn generic_argument(&mut self, id: TypeRefId, index: usize) -> MirrorResult<TypeRefId> {
        let arg = match self.typeref(id)? {
            MangledType::Nominal { args, .. } => {
                args.get(index).cloned().ok_or(MirrorError::ChildOutOfRange {
                    index,
                    count: args.len(),
                })?
            }
            _ => return Err(MirrorError::ChildOutOfRange { index, count: 0 }),
        };
        Ok(self.typerefs.intern(arg))
    }

    /// Lowering of a value of the type
    pub fn info_for_typeref(&mut self, id: TypeRefId) -> MirrorResult<Arc<TypeInfo>> {
        let ty = self.typerefs.get(id)?.clone();
        self.converter.type_info(&self.registry, &ty)
    }

    pub fn child_of_typeref(&mut self, id: TypeRefId, index: usize) -> MirrorResult<ChildInfo> {
        let info = self.info_for_typeref(id)?;
        self.child(&info, index)
    }

    /// Lowering for a metadata record: the instance layout for classes, the
    /// value layout otherwise
    pub fn info_for_metadata(&mut self, metadata: u64) -> MirrorResult<Arc<TypeInfo>> {
        let id = self.typeref_for_metadata(metadata)?;
        let ty = self.typerefs.get(id)?.clone();
        match ty.as_ref() {
            MangledType::Nominal {
                kind: NominalKind::Class,
                ..
            } => self.converter.instance_info(&self.registry, &ty),
            _ => self.converter.type_info(&self.registry, &ty),
        }
    }

    pub fn child_of_metadata(&mut self, metadata: u64, index: usize) -> MirrorResult<ChildInfo> {
        let info = self.info_for_metadata(metadata)?;
        self.child(&info, index)
    }

    /// Instance layout of a heap object's class
    pub fn info_for_instance(&mut self, object: u64) -> MirrorResult<Arc<TypeInfo>> {
        let metadata = self.class_of(object)?;
        let info = self.info_for_metadata(metadata)?;
        if info.kind != LayoutKind::ClassInstance {
            return Err(MirrorError::NotLowerable(format!(
                "object at {:#x} is not a class instance",
                object
            )));
        }
        Ok(info)
    }

    pub fn child_of_instance(&mut self, object: u64, index: usize) -> MirrorResult<ChildInfo> {
        let info = self.info_for_instance(object)?;
        self.child(&info, index)
    }

    fn child(&mut self, info: &TypeInfo, index: usize) -> MirrorResult<ChildInfo> {
        let field = info.fields.get(index).ok_or(MirrorError::ChildOutOfRange {
            index,
            count: info.fields.len(),
        })?;
        Ok(ChildInfo {
            name: field.name.clone(),
            offset: field.offset,
            kind: field.info.kind,
            typeref: self.typerefs.intern(field.typeref.clone()),
        })
    }

    /// Dynamic type and value address inside an existential container
    ///
    /// Class references are returned as the object address. Values that fit
    /// the inline buffer start at the container; larger values live in a box
    /// whose address the container's first word holds.
    #[instrument(skip(self))]
    pub fn project_existential(&mut self, address: u64, id: TypeRefId) -> MirrorResult<(TypeRefId, u64)> {
        let info = self.info_for_typeref(id)?;
        match info.kind {
            LayoutKind::ClassExistential => {
                let object = self.reader.read_word(address)?;
                let dynamic = self.typeref_for_instance(object)?;
                Ok((dynamic, object))
            }
            LayoutKind::OpaqueExistential => {
                let word = self.word();
                let metadata = self
                    .reader
                    .read_word(word_at(address, EXISTENTIAL_BUFFER_WORDS, word)?)?;
                let dynamic = self.typeref_for_metadata(metadata)?;
                let start = if self.is_class_metadata(metadata)? {
                    self.reader.read_word(address)?
                } else {
                    let table = self.reader.read_word(metadata.wrapping_sub(word))?;
                    let flags = self.reader.read_word(word_at(table, vwt::FLAGS as u64, word)?)?;
                    if flags & vwt_flags::IS_NON_INLINE != 0 {
                        self.reader.read_word(address)?
                    } else {
                        address
                    }
                };
                trace!(metadata, start, "projected existential");
                Ok((dynamic, start))
            }
            _ => Err(MirrorError::NotLowerable(format!(
                "{} is not an existential",
                self.typeref(id)?
            ))),
        }
    }

    pub fn dump_typeref(&self, id: TypeRefId) -> MirrorResult<String> {
        Ok(typeref::dump_typeref(self.typeref(id)?))
    }

    pub fn demangle(&self, mangled: &str) -> String {
        demangle(mangled)
    }

    /// Associated type witnesses of every registered conformance of a type
    pub fn associated_types(&mut self, id: TypeRefId) -> MirrorResult<Vec<AssociatedTypeWitness>> {
        let ty = self.typerefs.get(id)?.clone();
        let args: &[MangledType] = match ty.as_ref() {
            MangledType::Nominal { args, .. } => args,
            _ => &[],
        };
        let Some(name) = unbound_name(&ty) else {
            return Ok(Vec::new());
        };
        let mut resolved = Vec::new();
        for conformance in self.registry.associated_types(&name) {
            let protocol = demangle_type(&conformance.protocol)?;
            for (requirement, mangled) in &conformance.witnesses {
                resolved.push((
                    protocol.clone(),
                    requirement.clone(),
                    substitute(&demangle_type(mangled)?, args)?,
                ));
            }
        }
        Ok(resolved
            .into_iter()
            .map(|(protocol, name, witness)| AssociatedTypeWitness {
                protocol: self.typerefs.intern(protocol),
                name,
                witness: self.typerefs.intern(witness),
            })
            .collect())
    }

    fn class_of(&mut self, object: u64) -> MirrorResult<u64> {
        let isa = self.reader.read_word(object)?;
        Ok(isa & self.read_isa_mask()?)
    }

    fn kind_of(&self, metadata: u64) -> MirrorResult<MetadataKind> {
        let word = self.reader.read_word(metadata)?;
        MetadataKind::from_word(word).ok_or(MirrorError::UnknownMetadataKind {
            metadata,
            kind: word,
        })
    }

    fn is_class_metadata(&self, metadata: u64) -> MirrorResult<bool> {
        Ok(matches!(
            self.kind_of(metadata)?,
            MetadataKind::Class | MetadataKind::ForeignClass
        ))
    }

    fn count_at(&self, address: u64) -> MirrorResult<u64> {
        let count = self.reader.read_word(address)?;
        if count > MAX_COUNT {
            return Err(MirrorError::NotLowerable(format!(
                "implausible count {} at {:#x}",
                count, address
            )));
        }
        Ok(count)
    }

    fn decode_metadata(&mut self, metadata: u64, depth: usize) -> MirrorResult<MangledType> {
        if depth > MAX_METADATA_DEPTH {
            return Err(MirrorError::TooDeep(MAX_METADATA_DEPTH));
        }
        let word = self.word();
        let slot = |index: usize| word_at(metadata, index as u64, word);
        let kind = self.kind_of(metadata)?;
        trace!(metadata, ?kind, "decoding metadata");
        match kind {
            MetadataKind::Class | MetadataKind::ForeignClass => {
                let descriptor = self
                    .reader
                    .read_word(address_at(metadata, class_layout::DESCRIPTOR as u64)?)?;
                self.decode_nominal(metadata, descriptor, depth)
            }
            MetadataKind::Struct | MetadataKind::Enum | MetadataKind::Optional => {
                let descriptor = self.reader.read_word(slot(1)?)?;
                self.decode_nominal(metadata, descriptor, depth)
            }
            MetadataKind::Opaque => {
                let code = self
                    .builtin_code(metadata)?
                    .ok_or(MirrorError::UnknownOpaqueMetadata(metadata))?;
                Ok(MangledType::Builtin(code.to_string()))
            }
            MetadataKind::Tuple => {
                let count = self.count_at(slot(tuple_metadata::NUM_ELEMENTS)?)?;
                let mut elements = Vec::with_capacity(count as usize);
                for index in 0..count as usize {
                    let element = self.reader.read_word(slot(
                        tuple_metadata::ELEMENTS + index * tuple_metadata::ELEMENT_WORDS,
                    )?)?;
                    elements.push(self.decode_metadata(element, depth + 1)?);
                }
                Ok(MangledType::Tuple(elements))
            }
            MetadataKind::Function => {
                let count = self.count_at(slot(function_metadata::NUM_PARAMS)?)?;
                let result = self.reader.read_word(slot(function_metadata::RESULT)?)?;
                let result = Box::new(self.decode_metadata(result, depth + 1)?);
                let mut params = Vec::with_capacity(count as usize);
                for index in 0..count as usize {
                    let param = self
                        .reader
                        .read_word(slot(function_metadata::PARAMS + index)?)?;
                    params.push(self.decode_metadata(param, depth + 1)?);
                }
                Ok(MangledType::Function { params, result })
            }
            MetadataKind::Existential => {
                let count = self.count_at(slot(existential_metadata::NUM_PROTOCOLS)?)?;
                let mut protocols = Vec::with_capacity(count as usize);
                for index in 0..count as usize {
                    let descriptor = self
                        .reader
                        .read_word(slot(existential_metadata::PROTOCOLS + index)?)?;
                    let name = self.read_relative_string(address_at(descriptor, protocol_layout::NAME as u64)?)?;
                    let module =
                        self.read_relative_string(address_at(descriptor, protocol_layout::MODULE as u64)?)?;
                    protocols.push(MangledType::nominal(module, name, NominalKind::Protocol));
                }
                Ok(MangledType::Existential(protocols))
            }
            MetadataKind::Metatype => {
                let instance = self
                    .reader
                    .read_word(slot(metatype_metadata::INSTANCE_TYPE)?)?;
                Ok(MangledType::Metatype(Box::new(
                    self.decode_metadata(instance, depth + 1)?,
                )))
            }
            _ => Err(MirrorError::UnknownMetadataKind {
                metadata,
                kind: kind.value(),
            }),
        }
    }

    fn read_relative_string(&self, address: u64) -> MirrorResult<String> {
        let target = self.reader.read_relative(address)?;
        self.reader.read_string(target)
    }

    /// Nominal type named by a descriptor, with the generic arguments stored
    /// in its metadata
    fn decode_nominal(&mut self, metadata: u64, descriptor: u64, depth: usize) -> MirrorResult<MangledType> {
        if descriptor == 0 {
            return Err(MirrorError::MissingDescriptor(metadata));
        }
        let raw_kind = self
            .reader
            .read_u32(address_at(descriptor, descriptor_layout::KIND as u64)?)?;
        let kind = match DescriptorKind::from_u32(raw_kind) {
            Some(DescriptorKind::Class) => NominalKind::Class,
            Some(DescriptorKind::Struct) => NominalKind::Struct,
            Some(DescriptorKind::Enum) => NominalKind::Enum,
            None => return Err(MirrorError::MissingDescriptor(metadata)),
        };
        let name = self.read_relative_string(address_at(descriptor, descriptor_layout::NAME as u64)?)?;
        let module =
            self.read_relative_string(address_at(descriptor, descriptor_layout::MODULE as u64)?)?;
        let count = self
            .reader
            .read_u32(address_at(descriptor, descriptor_layout::NUM_GENERIC_PARAMS as u64)?)?
            as u64;
        if count > MAX_COUNT {
            return Err(MirrorError::MissingDescriptor(metadata));
        }
        let mut args = Vec::with_capacity(count as usize);
        if count > 0 {
            let start = self
                .reader
                .read_u32(address_at(descriptor, descriptor_layout::GENERIC_ARGS_OFFSET as u64)?)?
                as u64;
            let word = self.word();
            for index in 0..count {
                let arg = self.reader.read_word(word_at(metadata, start + index, word)?)?;
                args.push(self.decode_metadata(arg, depth + 1)?);
            }
        }
        Ok(MangledType::Nominal {
            module,
            name,
            kind,
            args,
        })
    }

    /// Builtin code of an opaque metadata record, matched against the
    /// target's exported builtin metadata symbols
    fn builtin_code(&mut self, metadata: u64) -> MirrorResult<Option<&'static str>> {
        if self.builtins.is_none() {
            let mut table = FxHashMap::default();
            for code in BUILTIN_CODES {
                match self.reader.symbol_address(&builtin_metadata(code)) {
                    Ok(address) => {
                        table.insert(address, code);
                    }
                    Err(MirrorError::MissingSymbol(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            debug!(builtins = table.len(), "indexed builtin metadata");
            self.builtins = Some(table);
        }
        Ok(self
            .builtins
            .as_ref()
            .and_then(|table| table.get(&metadata).copied()))
    }
}
