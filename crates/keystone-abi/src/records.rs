//! Reflection section records
//!
//! Six sections per image carry everything the remote mirror needs to lay out
//! types without the compiler: field descriptors, associated type
//! descriptors, builtin type descriptors, closure capture descriptors, mangled
//! type references and strings. Records point at each other with 32-bit
//! offsets relative to the address of the offset field itself, so the set can
//! move as a unit without fix-ups.

use crate::bytes::{ByteReader, DecodeError};
use crate::kind::FieldDescriptorKind;

/// Version of the reflection record formats produced by this crate
pub const REFLECTION_METADATA_VERSION: u16 = 1;

/// Section kinds, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReflectionSection {
    /// Field descriptors
    FieldMetadata,
    /// Associated type descriptors
    AssociatedTypes,
    /// Builtin type descriptors
    Builtin,
    /// Closure capture descriptors
    Capture,
    /// Mangled type names
    TypeRef,
    /// Field and requirement names
    ReflectionStrings,
}

impl ReflectionSection {
    /// All sections, in wire order
    pub const ALL: [ReflectionSection; 6] = [
        ReflectionSection::FieldMetadata,
        ReflectionSection::AssociatedTypes,
        ReflectionSection::Builtin,
        ReflectionSection::Capture,
        ReflectionSection::TypeRef,
        ReflectionSection::ReflectionStrings,
    ];

    /// Section name in images
    pub fn name(self) -> &'static str {
        match self {
            ReflectionSection::FieldMetadata => "fieldmd",
            ReflectionSection::AssociatedTypes => "assocty",
            ReflectionSection::Builtin => "builtin",
            ReflectionSection::Capture => "capture",
            ReflectionSection::TypeRef => "typeref",
            ReflectionSection::ReflectionStrings => "reflstr",
        }
    }

    /// Look up a section by name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.name() == name)
    }
}

/// Field descriptor header size
pub const FIELD_DESCRIPTOR_SIZE: usize = 16;
/// Field record size
pub const FIELD_RECORD_SIZE: u16 = 12;
/// Associated type descriptor header size
pub const ASSOCIATED_TYPE_DESCRIPTOR_SIZE: usize = 16;
/// Associated type record size
pub const ASSOCIATED_TYPE_RECORD_SIZE: u32 = 8;
/// Builtin type descriptor size
pub const BUILTIN_TYPE_DESCRIPTOR_SIZE: usize = 20;
/// Capture descriptor header size
pub const CAPTURE_DESCRIPTOR_SIZE: usize = 12;

/// A relative offset read from a section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelRef {
    /// Offset of the field within its section
    pub at: u64,
    /// Stored displacement; zero means null
    pub delta: i32,
}

impl RelRef {
    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let at = reader.position() as u64;
        let delta = reader.read_i32()?;
        Ok(Self { at, delta })
    }

    /// Whether the reference is null
    pub fn is_null(&self) -> bool {
        self.delta == 0
    }

    /// Absolute target address given the address the section is mapped at
    pub fn resolve(&self, section_address: u64) -> Option<u64> {
        if self.is_null() {
            return None;
        }
        let field = section_address.checked_add(self.at)?;
        Some(field.wrapping_add(self.delta as i64 as u64))
    }
}

/// One stored property or enum case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFieldRecord {
    /// Flags (see `kind::field_record_flags`)
    pub flags: u32,
    /// Mangled type name (null for no-payload cases)
    pub mangled_type_name: RelRef,
    /// Field name
    pub field_name: RelRef,
}

/// Fields of one nominal type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFieldDescriptor {
    /// Offset of the descriptor within the section
    pub offset: u64,
    /// Mangled name of the described type
    pub mangled_type_name: RelRef,
    /// Mangled name of the superclass, for classes
    pub superclass: RelRef,
    /// Kind of type
    pub kind: FieldDescriptorKind,
    /// Fields in declaration order
    pub fields: Vec<RawFieldRecord>,
}

/// One associated type witness
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAssociatedTypeRecord {
    /// Requirement name
    pub name: RelRef,
    /// Mangled witness type
    pub substituted_type_name: RelRef,
}

/// Associated type witnesses of one conformance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAssociatedTypeDescriptor {
    /// Mangled conforming type
    pub conforming_type_name: RelRef,
    /// Mangled protocol
    pub protocol_type_name: RelRef,
    /// Witnesses
    pub records: Vec<RawAssociatedTypeRecord>,
}

/// Layout of a builtin type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBuiltinTypeDescriptor {
    /// Mangled builtin name
    pub type_name: RelRef,
    /// Size in bytes
    pub size: u32,
    /// Alignment in bytes
    pub alignment: u32,
    /// Stride in bytes
    pub stride: u32,
    /// Extra inhabitants
    pub extra_inhabitants: u32,
}

/// Where a closure context's generic metadata comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMetadataSource {
    /// Mangled generic parameter
    pub mangled_type_name: RelRef,
    /// Encoded source
    pub mangled_metadata_source: RelRef,
}

/// Layout of a closure context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCaptureDescriptor {
    /// Captured value types
    pub capture_types: Vec<RelRef>,
    /// Metadata sources
    pub metadata_sources: Vec<RawMetadataSource>,
    /// Number of necessary bindings
    pub num_bindings: u32,
}

/// Parse every field descriptor in a `fieldmd` section
pub fn parse_field_section(bytes: &[u8]) -> Result<Vec<RawFieldDescriptor>, DecodeError> {
    let mut reader = ByteReader::new(bytes, 8);
    let mut descriptors = Vec::new();
    while reader.remaining() >= FIELD_DESCRIPTOR_SIZE {
        let offset = reader.position() as u64;
        let mangled_type_name = RelRef::read(&mut reader)?;
        let superclass = RelRef::read(&mut reader)?;
        let raw_kind = reader.read_u16()?;
        let kind = FieldDescriptorKind::from_u16(raw_kind)
            .ok_or(DecodeError::InvalidTag(raw_kind as u8, offset as usize + 8))?;
        let record_size = reader.read_u16()? as usize;
        let count = reader.read_u32()? as usize;
        if record_size < FIELD_RECORD_SIZE as usize {
            return Err(DecodeError::UnexpectedEnd(reader.position()));
        }
        let mut fields = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let start = reader.position();
            let flags = reader.read_u32()?;
            let mangled_type_name = RelRef::read(&mut reader)?;
            let field_name = RelRef::read(&mut reader)?;
            reader.seek(start + record_size);
            fields.push(RawFieldRecord {
                flags,
                mangled_type_name,
                field_name,
            });
        }
        if reader.position() > bytes.len() {
            return Err(DecodeError::UnexpectedEnd(bytes.len()));
        }
        descriptors.push(RawFieldDescriptor {
            offset,
            mangled_type_name,
            superclass,
            kind,
            fields,
        });
    }
    Ok(descriptors)
}

/// Parse every descriptor in an `assocty` section
pub fn parse_associated_type_section(
    bytes: &[u8],
) -> Result<Vec<RawAssociatedTypeDescriptor>, DecodeError> {
    let mut reader = ByteReader::new(bytes, 8);
    let mut descriptors = Vec::new();
    while reader.remaining() >= ASSOCIATED_TYPE_DESCRIPTOR_SIZE {
        let conforming_type_name = RelRef::read(&mut reader)?;
        let protocol_type_name = RelRef::read(&mut reader)?;
        let count = reader.read_u32()? as usize;
        let record_size = reader.read_u32()? as usize;
        if record_size < ASSOCIATED_TYPE_RECORD_SIZE as usize {
            return Err(DecodeError::UnexpectedEnd(reader.position()));
        }
        let mut records = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let start = reader.position();
            let name = RelRef::read(&mut reader)?;
            let substituted_type_name = RelRef::read(&mut reader)?;
            reader.seek(start + record_size);
            records.push(RawAssociatedTypeRecord {
                name,
                substituted_type_name,
            });
        }
        if reader.position() > bytes.len() {
            return Err(DecodeError::UnexpectedEnd(bytes.len()));
        }
        descriptors.push(RawAssociatedTypeDescriptor {
            conforming_type_name,
            protocol_type_name,
            records,
        });
    }
    Ok(descriptors)
}

/// Parse every descriptor in a `builtin` section
pub fn parse_builtin_section(bytes: &[u8]) -> Result<Vec<RawBuiltinTypeDescriptor>, DecodeError> {
    let mut reader = ByteReader::new(bytes, 8);
    let mut descriptors = Vec::new();
    while reader.remaining() >= BUILTIN_TYPE_DESCRIPTOR_SIZE {
        descriptors.push(RawBuiltinTypeDescriptor {
            type_name: RelRef::read(&mut reader)?,
            size: reader.read_u32()?,
            alignment: reader.read_u32()?,
            stride: reader.read_u32()?,
            extra_inhabitants: reader.read_u32()?,
        });
    }
    Ok(descriptors)
}

/// Parse every descriptor in a `capture` section
pub fn parse_capture_section(bytes: &[u8]) -> Result<Vec<RawCaptureDescriptor>, DecodeError> {
    let mut reader = ByteReader::new(bytes, 8);
    let mut descriptors = Vec::new();
    while reader.remaining() >= CAPTURE_DESCRIPTOR_SIZE {
        let num_captures = reader.read_u32()? as usize;
        let num_sources = reader.read_u32()? as usize;
        let num_bindings = reader.read_u32()?;
        let mut capture_types = Vec::with_capacity(num_captures.min(1024));
        for _ in 0..num_captures {
            capture_types.push(RelRef::read(&mut reader)?);
        }
        let mut metadata_sources = Vec::with_capacity(num_sources.min(1024));
        for _ in 0..num_sources {
            metadata_sources.push(RawMetadataSource {
                mangled_type_name: RelRef::read(&mut reader)?,
                mangled_metadata_source: RelRef::read(&mut reader)?,
            });
        }
        descriptors.push(RawCaptureDescriptor {
            capture_types,
            metadata_sources,
            num_bindings,
        });
    }
    Ok(descriptors)
}
