//! Metadata and descriptor discriminators
//!
//! Numeric values here are part of the runtime ABI: the compiler writes them,
//! the runtime and the remote mirror read them back.

use serde::{Deserialize, Serialize};

/// Largest value a kind word can hold before it is read as an isa pointer
pub const MAX_METADATA_KIND: u64 = 0x7FF;

/// Kind word stored at the address point of every metadata record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MetadataKind {
    /// Native class (also any isa-pointer kind word)
    Class = 0,
    /// Struct
    Struct = 1,
    /// Enum
    Enum = 2,
    /// Optional
    Optional = 3,
    /// Builtin or otherwise opaque type
    Opaque = 8,
    /// Tuple
    Tuple = 9,
    /// Function
    Function = 10,
    /// Existential
    Existential = 12,
    /// Metatype
    Metatype = 13,
    /// Wrapper around a foreign class object
    ObjCClassWrapper = 14,
    /// Existential metatype
    ExistentialMetatype = 15,
    /// Foreign class
    ForeignClass = 16,
    /// Heap box for a captured variable
    HeapLocalVariable = 64,
    /// Heap box for a generic captured variable
    HeapGenericLocalVariable = 65,
    /// Boxed error value
    ErrorObject = 128,
}

impl MetadataKind {
    /// Decode a kind word; isa pointers decode as `Class`
    pub fn from_word(word: u64) -> Option<Self> {
        if word > MAX_METADATA_KIND {
            return Some(MetadataKind::Class);
        }
        Some(match word {
            0 => MetadataKind::Class,
            1 => MetadataKind::Struct,
            2 => MetadataKind::Enum,
            3 => MetadataKind::Optional,
            8 => MetadataKind::Opaque,
            9 => MetadataKind::Tuple,
            10 => MetadataKind::Function,
            12 => MetadataKind::Existential,
            13 => MetadataKind::Metatype,
            14 => MetadataKind::ObjCClassWrapper,
            15 => MetadataKind::ExistentialMetatype,
            16 => MetadataKind::ForeignClass,
            64 => MetadataKind::HeapLocalVariable,
            65 => MetadataKind::HeapGenericLocalVariable,
            128 => MetadataKind::ErrorObject,
            _ => return None,
        })
    }

    /// Kind word value
    pub fn value(self) -> u64 {
        self as u32 as u64
    }
}

/// Kind of a reflection field descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum FieldDescriptorKind {
    /// Struct
    Struct = 0,
    /// Class
    Class = 1,
    /// Enum with at most one payload case
    Enum = 2,
    /// Enum with several payload cases
    MultiPayloadEnum = 3,
    /// Protocol
    Protocol = 4,
    /// Class-bound protocol
    ClassProtocol = 5,
    /// Objective-C protocol
    ObjCProtocol = 6,
    /// Objective-C class
    ObjCClass = 7,
}

impl FieldDescriptorKind {
    /// Decode a raw kind
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => FieldDescriptorKind::Struct,
            1 => FieldDescriptorKind::Class,
            2 => FieldDescriptorKind::Enum,
            3 => FieldDescriptorKind::MultiPayloadEnum,
            4 => FieldDescriptorKind::Protocol,
            5 => FieldDescriptorKind::ClassProtocol,
            6 => FieldDescriptorKind::ObjCProtocol,
            7 => FieldDescriptorKind::ObjCClass,
            _ => return None,
        })
    }
}

/// Value witness table flag bits
pub mod vwt_flags {
    /// Alignment minus one
    pub const ALIGN_MASK: u64 = 0xFFFF;
    /// Copying requires more than a memcpy
    pub const IS_NON_POD: u64 = 0x1_0000;
    /// Does not fit in an existential's inline buffer
    pub const IS_NON_INLINE: u64 = 0x2_0000;
    /// Has extra inhabitants usable by enclosing enums
    pub const HAS_EXTRA_INHABITANTS: u64 = 0x4_0000;
    /// Moving requires more than a memcpy
    pub const IS_NON_BITWISE_TAKABLE: u64 = 0x10_0000;
}

/// Value witness table layout, in words from the table start
pub mod vwt {
    /// Destroy function
    pub const DESTROY: usize = 0;
    /// Copy-initialize function
    pub const INITIALIZE_WITH_COPY: usize = 1;
    /// Copy-assign function
    pub const ASSIGN_WITH_COPY: usize = 2;
    /// Take-initialize function
    pub const INITIALIZE_WITH_TAKE: usize = 3;
    /// Value size
    pub const SIZE: usize = 4;
    /// Flags (see `vwt_flags`)
    pub const FLAGS: usize = 5;
    /// Array stride
    pub const STRIDE: usize = 6;
    /// Number of extra inhabitants
    pub const EXTRA_INHABITANTS: usize = 7;
    /// Total words
    pub const WORDS: usize = 8;
}

/// Class metadata flags
pub mod class_flags {
    /// Uses native reference counting
    pub const USES_NATIVE_REFCOUNTING: u32 = 0x2;
    /// Has a custom Objective-C name
    pub const HAS_CUSTOM_OBJC_NAME: u32 = 0x4;
    /// Layout computed at runtime
    pub const HAS_RESILIENT_ANCESTRY: u32 = 0x8;
}

/// Low bits mixed into field-type vector entries
pub mod field_type_flags {
    /// Field is stored indirectly
    pub const INDIRECT: u64 = 0x1;
    /// Field is a weak reference
    pub const WEAK: u64 = 0x2;
    /// Mask of all flag bits
    pub const MASK: u64 = 0x3;
}

/// Field record flags
pub mod field_record_flags {
    /// Indirect enum case
    pub const IS_INDIRECT_CASE: u32 = 0x1;
    /// Mutable stored property
    pub const IS_VAR: u32 = 0x2;
    /// Weak reference storage
    pub const IS_WEAK: u32 = 0x4;
}

/// Protocol requirement flags
pub mod requirement_flags {
    /// Requirement is a method
    pub const KIND_METHOD: u32 = 0x0;
    /// Requirement is an associated type access function
    pub const KIND_ASSOCIATED_TYPE: u32 = 0x1;
    /// A default witness is recorded for the requirement
    pub const HAS_DEFAULT: u32 = 0x100;
}

/// Protocol descriptor flags
pub mod protocol_flags {
    /// Protocol is class-bound
    pub const CLASS_CONSTRAINED: u32 = 0x1;
    /// Protocol is resilient
    pub const IS_RESILIENT: u32 = 0x2;
}

/// Nominal type descriptor kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum DescriptorKind {
    /// Class
    Class = 0,
    /// Struct
    Struct = 1,
    /// Enum
    Enum = 2,
}

impl DescriptorKind {
    /// Decode a raw kind
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(DescriptorKind::Class),
            1 => Some(DescriptorKind::Struct),
            2 => Some(DescriptorKind::Enum),
            _ => None,
        }
    }
}

/// Nominal type descriptor flag bits
pub mod descriptor_flags {
    /// Type is generic
    pub const IS_GENERIC: u32 = 0x80;
    /// Layout is resilient
    pub const IS_RESILIENT: u32 = 0x40;
    /// Metadata needs one-time initialization
    pub const HAS_SINGLETON_INIT: u32 = 0x20;
    /// Foreign metadata
    pub const IS_FOREIGN: u32 = 0x10;
    /// Class introduces vtable entries; the vtable offset and size are valid
    pub const HAS_VTABLE: u32 = 0x08;
}

/// Byte offsets of class metadata fields, relative to the address point, for
/// 8-byte pointers
pub mod class_layout {
    /// isa / kind word
    pub const ISA: i64 = 0;
    /// Superclass metadata
    pub const SUPERCLASS: i64 = 8;
    /// Two words of method cache
    pub const CACHE: i64 = 16;
    /// Data pointer
    pub const DATA: i64 = 32;
    /// Class flags (u32)
    pub const FLAGS: i64 = 40;
    /// Instance address point (u32)
    pub const INSTANCE_ADDRESS_POINT: i64 = 44;
    /// Instance size (u32)
    pub const INSTANCE_SIZE: i64 = 48;
    /// Instance alignment mask (u16)
    pub const INSTANCE_ALIGN_MASK: i64 = 52;
    /// Reserved (u16)
    pub const RESERVED: i64 = 54;
    /// Size of the whole metadata object (u32)
    pub const CLASS_SIZE: i64 = 56;
    /// Address point within the metadata object (u32)
    pub const CLASS_ADDRESS_POINT: i64 = 60;
    /// Nominal type descriptor
    pub const DESCRIPTOR: i64 = 64;
    /// Instance variable destroyer
    pub const IVAR_DESTROYER: i64 = 72;
    /// First class member (generic arguments, vtable, field offsets)
    pub const MEMBERS: i64 = 80;
    /// Words before the address point (destructor, value witness table)
    pub const PREFIX_WORDS: i64 = 2;
}

/// Byte offsets within a nominal type descriptor
///
/// Fields marked relative hold 32-bit offsets from the field's own address.
pub mod descriptor_layout {
    /// Flags (u32, see `descriptor_flags`)
    pub const FLAGS: usize = 0;
    /// Kind (u32, see `DescriptorKind`)
    pub const KIND: usize = 4;
    /// Relative pointer to the type name
    pub const NAME: usize = 8;
    /// Relative pointer to the module name
    pub const MODULE: usize = 12;
    /// Generic parameter count (u32)
    pub const NUM_GENERIC_PARAMS: usize = 16;
    /// Generic witness table count (u32)
    pub const NUM_GENERIC_WITNESSES: usize = 20;
    /// Offset of the own generic arguments in words from the address point (u32)
    pub const GENERIC_ARGS_OFFSET: usize = 24;
    /// Stored property or payload case count (u32)
    pub const NUM_FIELDS: usize = 28;
    /// Field offset vector offset in words from the address point (u32)
    pub const FIELD_OFFSET_VECTOR: usize = 32;
    /// Relative pointer to the field type accessor
    pub const FIELD_TYPE_ACCESSOR: usize = 36;
    /// Relative pointer to the reflection field descriptor
    pub const REFLECTION_FIELDS: usize = 40;
    /// Enum: cases without payload (u32)
    pub const NUM_EMPTY_CASES: usize = 44;
    /// Enum: payload size offset in words from the address point, zero if absent (u32)
    pub const PAYLOAD_SIZE_OFFSET: usize = 48;
    /// Class: relative pointer to the superclass mangled name
    pub const SUPERCLASS_NAME: usize = 44;
    /// Class: vtable offset in words from the address point (u32)
    pub const VTABLE_OFFSET: usize = 48;
    /// Class: vtable entry count (u32)
    pub const VTABLE_SIZE: usize = 52;
    /// Total descriptor size
    pub const SIZE: usize = 56;
}

/// Byte offsets within a protocol descriptor
pub mod protocol_layout {
    /// Flags (u32, see `protocol_flags`)
    pub const FLAGS: usize = 0;
    /// Relative pointer to the protocol name
    pub const NAME: usize = 4;
    /// Relative pointer to the module name
    pub const MODULE: usize = 8;
    /// Inherited protocol count (u32)
    pub const NUM_INHERITED: usize = 12;
    /// Relative pointer to the inherited protocol list
    pub const INHERITED: usize = 16;
    /// Requirement count (u32)
    pub const NUM_REQUIREMENTS: usize = 20;
    /// First requirement: flags (u32) and relative default implementation
    pub const REQUIREMENTS: usize = 24;
    /// Bytes per requirement
    pub const REQUIREMENT_SIZE: usize = 8;
}

/// Generic metadata pattern header, in bytes from the pattern start
pub mod pattern_header {
    /// Relative pointer to the instantiation function
    pub const CREATE_FUNCTION: usize = 0;
    /// Bytes to allocate per instantiation (u32)
    pub const SIZE: usize = 4;
    /// Generic argument count including witness tables (u16)
    pub const NUM_ARGUMENTS: usize = 8;
    /// Address point offset within the allocation (u16)
    pub const ADDRESS_POINT: usize = 10;
    /// Private words for the runtime
    pub const PRIVATE_DATA: usize = 16;
    /// Number of private words
    pub const PRIVATE_DATA_WORDS: usize = 4;
    /// Header size; the template body follows
    pub const SIZE_BYTES: usize = 48;
}

/// Tuple metadata, in words from the address point
pub mod tuple_metadata {
    /// Element count
    pub const NUM_ELEMENTS: usize = 1;
    /// Label string, zero when unlabeled
    pub const LABELS: usize = 2;
    /// First element: metadata then byte offset
    pub const ELEMENTS: usize = 3;
    /// Words per element
    pub const ELEMENT_WORDS: usize = 2;
}

/// Function metadata, in words from the address point
pub mod function_metadata {
    /// Parameter count
    pub const NUM_PARAMS: usize = 1;
    /// Result metadata
    pub const RESULT: usize = 2;
    /// First parameter metadata
    pub const PARAMS: usize = 3;
}

/// Existential metadata, in words from the address point
pub mod existential_metadata {
    /// Witness table count, plus `CLASS_CONSTRAINT`
    pub const FLAGS: usize = 1;
    /// Protocol count
    pub const NUM_PROTOCOLS: usize = 2;
    /// First protocol descriptor
    pub const PROTOCOLS: usize = 3;
    /// Set in the flags word of class-bound compositions
    pub const CLASS_CONSTRAINT: u64 = 0x8000_0000;
    /// Witness table count within the flags word
    pub const NUM_WITNESS_TABLES_MASK: u64 = 0x00FF_FFFF;
}

/// Metatype metadata, in words from the address point
pub mod metatype_metadata {
    /// Instance type metadata
    pub const INSTANCE_TYPE: usize = 1;
}
