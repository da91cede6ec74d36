//! Function bodies
//!
//! Access functions, instantiation functions, field type accessors and
//! method stubs are stored in the `text` section as small op programs that
//! the runtime interprets. A program is a `u32` byte length followed by the
//! encoded ops. References to other symbols are 32-bit offsets relative to
//! the operand's own address, so programs need no relocation.
//!
//! Ops and recipes are generic over the reference type: the compiler builds
//! them over symbol names, the runtime decodes them over absolute addresses.

use crate::bytes::{ByteReader, ByteWriter, DecodeError};
use std::fmt;

/// How to produce a type metadata pointer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRecipe<R> {
    /// Constant metadata
    Metadata(R),
    /// Call an access function with no arguments
    Accessor(R),
    /// Word loaded from the context metadata at a byte offset from its address point
    GenericArgument(i32),
    /// The running function's own argument
    Argument(u16),
    /// Call a generic access function with computed arguments
    Instantiate {
        /// Generic access function
        accessor: R,
        /// Arguments: metadata then witness tables
        args: Vec<TypeRecipe<R>>,
    },
    /// Constant witness table
    WitnessTable(R),
    /// Tuple metadata
    Tuple(Vec<TypeRecipe<R>>),
    /// Function metadata
    Function {
        /// Parameters
        params: Vec<TypeRecipe<R>>,
        /// Result
        result: Box<TypeRecipe<R>>,
    },
    /// Existential metadata for a protocol composition
    Existential {
        /// Protocol descriptors
        protocols: Vec<R>,
        /// Whether the composition is class-bound
        class_bound: bool,
    },
    /// Metatype metadata
    Metatype(Box<TypeRecipe<R>>),
    /// Metadata pointer stored in a bound word, for metadata the runtime provides
    Indirect(R),
}

/// Where a cache lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheRef<R> {
    /// Global variable
    Global(R),
    /// Word at a byte offset from the context metadata's address point
    MetadataSlot(i32),
}

/// Address of a metadata slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotRef<R> {
    /// Fixed byte offset from the address point
    Static(i32),
    /// Offset stored in a base-offset global, plus a fixed displacement
    Dynamic {
        /// Base offset global
        base: R,
        /// Displacement from the base
        relative: i32,
    },
}

/// One-time class initialization parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassInit<R> {
    /// Superclass, evaluated against the class being initialized
    pub superclass: Option<TypeRecipe<R>>,
    /// Base offset global to fill when member placement is only known at run time
    pub base_offset: Option<R>,
    /// Byte offset of this class's own members in the compiled object
    pub members_start: u32,
    /// Byte size of this class's own members
    pub members_size: u32,
    /// Vtable overrides: slot and implementation
    pub overrides: Vec<(SlotRef<R>, R)>,
    /// Field offset globals to fill, one per stored property
    pub field_offset_globals: Vec<R>,
}

/// Interpreter ops
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AccessOp<R> {
    /// Plain load of a cache into the accumulator
    LoadCache(CacheRef<R>),
    /// Acquire fence (thread-sanitizer builds)
    AcquireFence,
    /// Return the accumulator if it is non-null
    ReturnIfNonNull,
    /// Run the ops up to the matching `EndOnce` exactly once per token
    BeginOnce(R),
    /// End of a once region
    EndOnce,
    /// Compute metadata into the accumulator
    Materialize(TypeRecipe<R>),
    /// Unique generic metadata for the function arguments from a pattern
    Instantiate(R),
    /// Unique foreign metadata in the accumulator
    RegisterForeign,
    /// Initialize class metadata in the accumulator
    InitializeClass(ClassInit<R>),
    /// Initialize value metadata in the accumulator from its field types
    InitializeValue,
    /// Release store of the accumulator into a cache
    StoreRelease(CacheRef<R>),
    /// Return the accumulator
    Return,
    /// Allocate and copy a generic pattern; the accumulator becomes the new address point
    AllocateMetadata(R),
    /// Copy a value witness table pattern and install it before the address point
    InstallDependentVwt(R),
    /// Write argument `argument` at byte `offset` from the new address point
    Fill {
        /// Byte offset from the address point
        offset: i32,
        /// Argument index
        argument: u16,
    },
    /// Allocate a field type vector
    AllocateFieldTypes(u32),
    /// Store the accumulator, tagged with flags, into the field type vector
    StoreFieldType {
        /// Field index
        index: u32,
        /// Flag bits (see `kind::field_type_flags`)
        flags: u8,
    },
    /// Publish the field type vector with compare-and-swap, freeing it on loss
    PublishFieldTypes(CacheRef<R>),
    /// Abort: a deleted method was called
    Trap,
}

mod tag {
    pub const LOAD_CACHE: u8 = 0x01;
    pub const ACQUIRE_FENCE: u8 = 0x02;
    pub const RETURN_IF_NON_NULL: u8 = 0x03;
    pub const BEGIN_ONCE: u8 = 0x04;
    pub const END_ONCE: u8 = 0x05;
    pub const MATERIALIZE: u8 = 0x06;
    pub const INSTANTIATE: u8 = 0x07;
    pub const REGISTER_FOREIGN: u8 = 0x08;
    pub const INITIALIZE_CLASS: u8 = 0x09;
    pub const INITIALIZE_VALUE: u8 = 0x0A;
    pub const STORE_RELEASE: u8 = 0x0B;
    pub const RETURN: u8 = 0x0C;
    pub const ALLOCATE_METADATA: u8 = 0x0D;
    pub const INSTALL_DEPENDENT_VWT: u8 = 0x0E;
    pub const FILL: u8 = 0x0F;
    pub const ALLOCATE_FIELD_TYPES: u8 = 0x10;
    pub const STORE_FIELD_TYPE: u8 = 0x11;
    pub const PUBLISH_FIELD_TYPES: u8 = 0x12;
    pub const TRAP: u8 = 0x13;

    pub const R_METADATA: u8 = 0;
    pub const R_ACCESSOR: u8 = 1;
    pub const R_GENERIC_ARGUMENT: u8 = 2;
    pub const R_ARGUMENT: u8 = 3;
    pub const R_INSTANTIATE: u8 = 4;
    pub const R_WITNESS_TABLE: u8 = 5;
    pub const R_TUPLE: u8 = 6;
    pub const R_FUNCTION: u8 = 7;
    pub const R_EXISTENTIAL: u8 = 8;
    pub const R_METATYPE: u8 = 9;
    pub const R_INDIRECT: u8 = 10;

    pub const CACHE_GLOBAL: u8 = 0;
    pub const CACHE_SLOT: u8 = 1;
    pub const SLOT_STATIC: u8 = 0;
    pub const SLOT_DYNAMIC: u8 = 1;
}

/// Destination for encoded ops
pub trait OpSink<R> {
    /// Emit a byte
    fn emit_u8(&mut self, value: u8);
    /// Emit a 16-bit integer
    fn emit_u16(&mut self, value: u16);
    /// Emit a 32-bit integer
    fn emit_u32(&mut self, value: u32);
    /// Emit a signed 32-bit integer
    fn emit_i32(&mut self, value: i32);
    /// Emit a 32-bit relative reference
    fn emit_ref(&mut self, target: &R);
}

/// Counts encoded bytes
#[derive(Debug, Default)]
pub struct SizeSink(pub usize);

impl<R> OpSink<R> for SizeSink {
    fn emit_u8(&mut self, _: u8) {
        self.0 += 1;
    }
    fn emit_u16(&mut self, _: u16) {
        self.0 += 2;
    }
    fn emit_u32(&mut self, _: u32) {
        self.0 += 4;
    }
    fn emit_i32(&mut self, _: i32) {
        self.0 += 4;
    }
    fn emit_ref(&mut self, _: &R) {
        self.0 += 4;
    }
}

/// Encodes references to known absolute addresses for a program placed at `base`
pub struct AddressSink {
    writer: ByteWriter,
    base: u64,
}

impl AddressSink {
    /// Sink for a program starting at `base`
    pub fn new(base: u64) -> Self {
        Self {
            writer: ByteWriter::new(8),
            base,
        }
    }

    /// Encoded bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.writer.into_bytes()
    }
}

impl OpSink<u64> for AddressSink {
    fn emit_u8(&mut self, value: u8) {
        self.writer.emit_u8(value);
    }
    fn emit_u16(&mut self, value: u16) {
        self.writer.emit_u16(value);
    }
    fn emit_u32(&mut self, value: u32) {
        self.writer.emit_u32(value);
    }
    fn emit_i32(&mut self, value: i32) {
        self.writer.emit_i32(value);
    }
    fn emit_ref(&mut self, target: &u64) {
        let at = self.base + self.writer.offset() as u64;
        self.writer.emit_i32(target.wrapping_sub(at) as i64 as i32);
    }
}

fn encode_list<R, S: OpSink<R>>(items: &[TypeRecipe<R>], sink: &mut S) {
    sink.emit_u16(items.len() as u16);
    for item in items {
        item.encode(sink);
    }
}

impl<R> TypeRecipe<R> {
    /// Encode into a sink
    pub fn encode<S: OpSink<R>>(&self, sink: &mut S) {
        match self {
            TypeRecipe::Metadata(r) => {
                sink.emit_u8(tag::R_METADATA);
                sink.emit_ref(r);
            }
            TypeRecipe::Accessor(r) => {
                sink.emit_u8(tag::R_ACCESSOR);
                sink.emit_ref(r);
            }
            TypeRecipe::GenericArgument(offset) => {
                sink.emit_u8(tag::R_GENERIC_ARGUMENT);
                sink.emit_i32(*offset);
            }
            TypeRecipe::Argument(index) => {
                sink.emit_u8(tag::R_ARGUMENT);
                sink.emit_u16(*index);
            }
            TypeRecipe::Instantiate { accessor, args } => {
                sink.emit_u8(tag::R_INSTANTIATE);
                sink.emit_ref(accessor);
                encode_list(args, sink);
            }
            TypeRecipe::WitnessTable(r) => {
                sink.emit_u8(tag::R_WITNESS_TABLE);
                sink.emit_ref(r);
            }
            TypeRecipe::Tuple(elements) => {
                sink.emit_u8(tag::R_TUPLE);
                encode_list(elements, sink);
            }
            TypeRecipe::Function { params, result } => {
                sink.emit_u8(tag::R_FUNCTION);
                encode_list(params, sink);
                result.encode(sink);
            }
            TypeRecipe::Existential {
                protocols,
                class_bound,
            } => {
                sink.emit_u8(tag::R_EXISTENTIAL);
                sink.emit_u8(*class_bound as u8);
                sink.emit_u16(protocols.len() as u16);
                for p in protocols {
                    sink.emit_ref(p);
                }
            }
            TypeRecipe::Metatype(instance) => {
                sink.emit_u8(tag::R_METATYPE);
                instance.encode(sink);
            }
            TypeRecipe::Indirect(r) => {
                sink.emit_u8(tag::R_INDIRECT);
                sink.emit_ref(r);
            }
        }
    }

    /// Map every reference
    pub fn map_refs<S>(&self, f: &mut dyn FnMut(&R) -> S) -> TypeRecipe<S> {
        fn list<R, S>(items: &[TypeRecipe<R>], f: &mut dyn FnMut(&R) -> S) -> Vec<TypeRecipe<S>> {
            items.iter().map(|i| i.map_refs(&mut *f)).collect()
        }
        match self {
            TypeRecipe::Metadata(r) => TypeRecipe::Metadata(f(r)),
            TypeRecipe::Accessor(r) => TypeRecipe::Accessor(f(r)),
            TypeRecipe::GenericArgument(o) => TypeRecipe::GenericArgument(*o),
            TypeRecipe::Argument(i) => TypeRecipe::Argument(*i),
            TypeRecipe::Instantiate { accessor, args } => TypeRecipe::Instantiate {
                accessor: f(accessor),
                args: list(args, f),
            },
            TypeRecipe::WitnessTable(r) => TypeRecipe::WitnessTable(f(r)),
            TypeRecipe::Tuple(elements) => TypeRecipe::Tuple(list(elements, f)),
            TypeRecipe::Function { params, result } => TypeRecipe::Function {
                params: list(params, f),
                result: Box::new(result.map_refs(&mut *f)),
            },
            TypeRecipe::Existential {
                protocols,
                class_bound,
            } => TypeRecipe::Existential {
                protocols: protocols.iter().map(|p| f(p)).collect(),
                class_bound: *class_bound,
            },
            TypeRecipe::Metatype(instance) => TypeRecipe::Metatype(Box::new(instance.map_refs(&mut *f))),
            TypeRecipe::Indirect(r) => TypeRecipe::Indirect(f(r)),
        }
    }
}

impl<R> CacheRef<R> {
    fn encode<S: OpSink<R>>(&self, sink: &mut S) {
        match self {
            CacheRef::Global(r) => {
                sink.emit_u8(tag::CACHE_GLOBAL);
                sink.emit_ref(r);
            }
            CacheRef::MetadataSlot(offset) => {
                sink.emit_u8(tag::CACHE_SLOT);
                sink.emit_i32(*offset);
            }
        }
    }

    fn map_refs<S>(&self, f: &mut dyn FnMut(&R) -> S) -> CacheRef<S> {
        match self {
            CacheRef::Global(r) => CacheRef::Global(f(r)),
            CacheRef::MetadataSlot(o) => CacheRef::MetadataSlot(*o),
        }
    }
}

impl<R> SlotRef<R> {
    fn encode<S: OpSink<R>>(&self, sink: &mut S) {
        match self {
            SlotRef::Static(offset) => {
                sink.emit_u8(tag::SLOT_STATIC);
                sink.emit_i32(*offset);
            }
            SlotRef::Dynamic { base, relative } => {
                sink.emit_u8(tag::SLOT_DYNAMIC);
                sink.emit_ref(base);
                sink.emit_i32(*relative);
            }
        }
    }

    fn map_refs<S>(&self, f: &mut dyn FnMut(&R) -> S) -> SlotRef<S> {
        match self {
            SlotRef::Static(o) => SlotRef::Static(*o),
            SlotRef::Dynamic { base, relative } => SlotRef::Dynamic {
                base: f(base),
                relative: *relative,
            },
        }
    }
}

impl<R> AccessOp<R> {
    /// Encode into a sink
    pub fn encode<S: OpSink<R>>(&self, sink: &mut S) {
        match self {
            AccessOp::LoadCache(cache) => {
                sink.emit_u8(tag::LOAD_CACHE);
                cache.encode(sink);
            }
            AccessOp::AcquireFence => sink.emit_u8(tag::ACQUIRE_FENCE),
            AccessOp::ReturnIfNonNull => sink.emit_u8(tag::RETURN_IF_NON_NULL),
            AccessOp::BeginOnce(token) => {
                sink.emit_u8(tag::BEGIN_ONCE);
                sink.emit_ref(token);
            }
            AccessOp::EndOnce => sink.emit_u8(tag::END_ONCE),
            AccessOp::Materialize(recipe) => {
                sink.emit_u8(tag::MATERIALIZE);
                recipe.encode(sink);
            }
            AccessOp::Instantiate(pattern) => {
                sink.emit_u8(tag::INSTANTIATE);
                sink.emit_ref(pattern);
            }
            AccessOp::RegisterForeign => sink.emit_u8(tag::REGISTER_FOREIGN),
            AccessOp::InitializeClass(init) => {
                sink.emit_u8(tag::INITIALIZE_CLASS);
                match &init.superclass {
                    Some(recipe) => {
                        sink.emit_u8(1);
                        recipe.encode(sink);
                    }
                    None => sink.emit_u8(0),
                }
                match &init.base_offset {
                    Some(base) => {
                        sink.emit_u8(1);
                        sink.emit_ref(base);
                    }
                    None => sink.emit_u8(0),
                }
                sink.emit_u32(init.members_start);
                sink.emit_u32(init.members_size);
                sink.emit_u16(init.overrides.len() as u16);
                for (slot, implementation) in &init.overrides {
                    slot.encode(sink);
                    sink.emit_ref(implementation);
                }
                sink.emit_u16(init.field_offset_globals.len() as u16);
                for global in &init.field_offset_globals {
                    sink.emit_ref(global);
                }
            }
            AccessOp::InitializeValue => sink.emit_u8(tag::INITIALIZE_VALUE),
            AccessOp::StoreRelease(cache) => {
                sink.emit_u8(tag::STORE_RELEASE);
                cache.encode(sink);
            }
            AccessOp::Return => sink.emit_u8(tag::RETURN),
            AccessOp::AllocateMetadata(pattern) => {
                sink.emit_u8(tag::ALLOCATE_METADATA);
                sink.emit_ref(pattern);
            }
            AccessOp::InstallDependentVwt(vwt) => {
                sink.emit_u8(tag::INSTALL_DEPENDENT_VWT);
                sink.emit_ref(vwt);
            }
            AccessOp::Fill { offset, argument } => {
                sink.emit_u8(tag::FILL);
                sink.emit_i32(*offset);
                sink.emit_u16(*argument);
            }
            AccessOp::AllocateFieldTypes(count) => {
                sink.emit_u8(tag::ALLOCATE_FIELD_TYPES);
                sink.emit_u32(*count);
            }
            AccessOp::StoreFieldType { index, flags } => {
                sink.emit_u8(tag::STORE_FIELD_TYPE);
                sink.emit_u32(*index);
                sink.emit_u8(*flags);
            }
            AccessOp::PublishFieldTypes(cache) => {
                sink.emit_u8(tag::PUBLISH_FIELD_TYPES);
                cache.encode(sink);
            }
            AccessOp::Trap => sink.emit_u8(tag::TRAP),
        }
    }

    /// Map every reference
    pub fn map_refs<S>(&self, f: &mut dyn FnMut(&R) -> S) -> AccessOp<S> {
        match self {
            AccessOp::LoadCache(c) => AccessOp::LoadCache(c.map_refs(&mut *f)),
            AccessOp::AcquireFence => AccessOp::AcquireFence,
            AccessOp::ReturnIfNonNull => AccessOp::ReturnIfNonNull,
            AccessOp::BeginOnce(t) => AccessOp::BeginOnce(f(t)),
            AccessOp::EndOnce => AccessOp::EndOnce,
            AccessOp::Materialize(r) => AccessOp::Materialize(r.map_refs(&mut *f)),
            AccessOp::Instantiate(p) => AccessOp::Instantiate(f(p)),
            AccessOp::RegisterForeign => AccessOp::RegisterForeign,
            AccessOp::InitializeClass(init) => AccessOp::InitializeClass(ClassInit {
                superclass: init.superclass.as_ref().map(|r| r.map_refs(&mut *f)),
                base_offset: init.base_offset.as_ref().map(|b| f(b)),
                members_start: init.members_start,
                members_size: init.members_size,
                overrides: init
                    .overrides
                    .iter()
                    .map(|(slot, imp)| (slot.map_refs(&mut *f), f(imp)))
                    .collect(),
                field_offset_globals: init.field_offset_globals.iter().map(|g| f(g)).collect(),
            }),
            AccessOp::InitializeValue => AccessOp::InitializeValue,
            AccessOp::StoreRelease(c) => AccessOp::StoreRelease(c.map_refs(&mut *f)),
            AccessOp::Return => AccessOp::Return,
            AccessOp::AllocateMetadata(p) => AccessOp::AllocateMetadata(f(p)),
            AccessOp::InstallDependentVwt(v) => AccessOp::InstallDependentVwt(f(v)),
            AccessOp::Fill { offset, argument } => AccessOp::Fill {
                offset: *offset,
                argument: *argument,
            },
            AccessOp::AllocateFieldTypes(n) => AccessOp::AllocateFieldTypes(*n),
            AccessOp::StoreFieldType { index, flags } => AccessOp::StoreFieldType {
                index: *index,
                flags: *flags,
            },
            AccessOp::PublishFieldTypes(c) => AccessOp::PublishFieldTypes(c.map_refs(&mut *f)),
            AccessOp::Trap => AccessOp::Trap,
        }
    }
}

/// Encode a whole program (length prefix and ops)
pub fn encode_program<R, S: OpSink<R>>(ops: &[AccessOp<R>], sink: &mut S) {
    let mut size = SizeSink::default();
    for op in ops {
        op.encode::<SizeSink>(&mut size);
    }
    sink.emit_u32(size.0 as u32);
    for op in ops {
        op.encode(sink);
    }
}

/// Encoded size of a program including its length prefix
pub fn program_size<R>(ops: &[AccessOp<R>]) -> usize {
    let mut size = SizeSink::default();
    for op in ops {
        op.encode::<SizeSink>(&mut size);
    }
    4 + size.0
}

struct ProgramReader<'a> {
    reader: ByteReader<'a>,
    address: u64,
}

impl<'a> ProgramReader<'a> {
    fn reference(&mut self) -> Result<u64, DecodeError> {
        let at = self.address + self.reader.position() as u64;
        let delta = self.reader.read_i32()?;
        Ok(at.wrapping_add(delta as i64 as u64))
    }

    fn list(&mut self) -> Result<Vec<TypeRecipe<u64>>, DecodeError> {
        let count = self.reader.read_u16()? as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.recipe()?);
        }
        Ok(items)
    }

    fn recipe(&mut self) -> Result<TypeRecipe<u64>, DecodeError> {
        let at = self.reader.position();
        Ok(match self.reader.read_u8()? {
            tag::R_METADATA => TypeRecipe::Metadata(self.reference()?),
            tag::R_ACCESSOR => TypeRecipe::Accessor(self.reference()?),
            tag::R_GENERIC_ARGUMENT => TypeRecipe::GenericArgument(self.reader.read_i32()?),
            tag::R_ARGUMENT => TypeRecipe::Argument(self.reader.read_u16()?),
            tag::R_INSTANTIATE => {
                let accessor = self.reference()?;
                let args = self.list()?;
                TypeRecipe::Instantiate { accessor, args }
            }
            tag::R_WITNESS_TABLE => TypeRecipe::WitnessTable(self.reference()?),
            tag::R_TUPLE => TypeRecipe::Tuple(self.list()?),
            tag::R_FUNCTION => {
                let params = self.list()?;
                let result = Box::new(self.recipe()?);
                TypeRecipe::Function { params, result }
            }
            tag::R_EXISTENTIAL => {
                let class_bound = self.reader.read_u8()? != 0;
                let count = self.reader.read_u16()? as usize;
                let mut protocols = Vec::with_capacity(count);
                for _ in 0..count {
                    protocols.push(self.reference()?);
                }
                TypeRecipe::Existential {
                    protocols,
                    class_bound,
                }
            }
            tag::R_METATYPE => TypeRecipe::Metatype(Box::new(self.recipe()?)),
            tag::R_INDIRECT => TypeRecipe::Indirect(self.reference()?),
            other => return Err(DecodeError::InvalidTag(other, at)),
        })
    }

    fn cache(&mut self) -> Result<CacheRef<u64>, DecodeError> {
        let at = self.reader.position();
        match self.reader.read_u8()? {
            tag::CACHE_GLOBAL => Ok(CacheRef::Global(self.reference()?)),
            tag::CACHE_SLOT => Ok(CacheRef::MetadataSlot(self.reader.read_i32()?)),
            other => Err(DecodeError::InvalidTag(other, at)),
        }
    }

    fn slot(&mut self) -> Result<SlotRef<u64>, DecodeError> {
        let at = self.reader.position();
        match self.reader.read_u8()? {
            tag::SLOT_STATIC => Ok(SlotRef::Static(self.reader.read_i32()?)),
            tag::SLOT_DYNAMIC => {
                let base = self.reference()?;
                let relative = self.reader.read_i32()?;
                Ok(SlotRef::Dynamic { base, relative })
            }
            other => Err(DecodeError::InvalidTag(other, at)),
        }
    }

    fn class_init(&mut self) -> Result<ClassInit<u64>, DecodeError> {
        let superclass = if self.reader.read_u8()? != 0 {
            Some(self.recipe()?)
        } else {
            None
        };
        let base_offset = if self.reader.read_u8()? != 0 {
            Some(self.reference()?)
        } else {
            None
        };
        let members_start = self.reader.read_u32()?;
        let members_size = self.reader.read_u32()?;
        let count = self.reader.read_u16()? as usize;
        let mut overrides = Vec::with_capacity(count);
        for _ in 0..count {
            let slot = self.slot()?;
            let implementation = self.reference()?;
            overrides.push((slot, implementation));
        }
        let count = self.reader.read_u16()? as usize;
        let mut field_offset_globals = Vec::with_capacity(count);
        for _ in 0..count {
            field_offset_globals.push(self.reference()?);
        }
        Ok(ClassInit {
            superclass,
            base_offset,
            members_start,
            members_size,
            overrides,
            field_offset_globals,
        })
    }

    fn op(&mut self) -> Result<AccessOp<u64>, DecodeError> {
        let at = self.reader.position();
        Ok(match self.reader.read_u8()? {
            tag::LOAD_CACHE => AccessOp::LoadCache(self.cache()?),
            tag::ACQUIRE_FENCE => AccessOp::AcquireFence,
            tag::RETURN_IF_NON_NULL => AccessOp::ReturnIfNonNull,
            tag::BEGIN_ONCE => AccessOp::BeginOnce(self.reference()?),
            tag::END_ONCE => AccessOp::EndOnce,
            tag::MATERIALIZE => AccessOp::Materialize(self.recipe()?),
            tag::INSTANTIATE => AccessOp::Instantiate(self.reference()?),
            tag::REGISTER_FOREIGN => AccessOp::RegisterForeign,
            tag::INITIALIZE_CLASS => AccessOp::InitializeClass(self.class_init()?),
            tag::INITIALIZE_VALUE => AccessOp::InitializeValue,
            tag::STORE_RELEASE => AccessOp::StoreRelease(self.cache()?),
            tag::RETURN => AccessOp::Return,
            tag::ALLOCATE_METADATA => AccessOp::AllocateMetadata(self.reference()?),
            tag::INSTALL_DEPENDENT_VWT => AccessOp::InstallDependentVwt(self.reference()?),
            tag::FILL => {
                let offset = self.reader.read_i32()?;
                let argument = self.reader.read_u16()?;
                AccessOp::Fill { offset, argument }
            }
            tag::ALLOCATE_FIELD_TYPES => AccessOp::AllocateFieldTypes(self.reader.read_u32()?),
            tag::STORE_FIELD_TYPE => {
                let index = self.reader.read_u32()?;
                let flags = self.reader.read_u8()?;
                AccessOp::StoreFieldType { index, flags }
            }
            tag::PUBLISH_FIELD_TYPES => AccessOp::PublishFieldTypes(self.cache()?),
            tag::TRAP => AccessOp::Trap,
            other => return Err(DecodeError::InvalidTag(other, at)),
        })
    }
}

/// Length in bytes of the program at the start of `bytes`, including its prefix
pub fn program_len(bytes: &[u8]) -> Result<usize, DecodeError> {
    let mut reader = ByteReader::new(bytes, 8);
    Ok(reader.read_u32()? as usize + 4)
}

/// Decode the program at the start of `bytes`, which is mapped at `address`
pub fn decode_program(bytes: &[u8], address: u64) -> Result<Vec<AccessOp<u64>>, DecodeError> {
    let len = program_len(bytes)?;
    let body = bytes.get(..len).ok_or(DecodeError::UnexpectedEnd(bytes.len()))?;
    let mut program = ProgramReader {
        reader: ByteReader::at(body, 4, 8),
        address,
    };
    let mut ops = Vec::new();
    while program.reader.has_more() {
        ops.push(program.op()?);
    }
    Ok(ops)
}

impl<R: fmt::Display> fmt::Display for TypeRecipe<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<R: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[TypeRecipe<R>]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", item)?;
            }
            Ok(())
        }
        match self {
            TypeRecipe::Metadata(r) => write!(f, "metadata {}", r),
            TypeRecipe::Accessor(r) => write!(f, "call {}", r),
            TypeRecipe::GenericArgument(o) => write!(f, "context[{}]", o),
            TypeRecipe::Argument(i) => write!(f, "arg{}", i),
            TypeRecipe::Instantiate { accessor, args } => {
                write!(f, "call {}(", accessor)?;
                list(f, args)?;
                f.write_str(")")
            }
            TypeRecipe::WitnessTable(r) => write!(f, "witness {}", r),
            TypeRecipe::Tuple(elements) => {
                f.write_str("tuple(")?;
                list(f, elements)?;
                f.write_str(")")
            }
            TypeRecipe::Function { params, result } => {
                f.write_str("function(")?;
                list(f, params)?;
                write!(f, ") -> {}", result)
            }
            TypeRecipe::Existential {
                protocols,
                class_bound,
            } => {
                f.write_str(if *class_bound { "class existential(" } else { "existential(" })?;
                for (i, p) in protocols.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                f.write_str(")")
            }
            TypeRecipe::Metatype(instance) => write!(f, "metatype({})", instance),
            TypeRecipe::Indirect(r) => write!(f, "load {}", r),
        }
    }
}

impl<R: fmt::Display> fmt::Display for CacheRef<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheRef::Global(r) => write!(f, "{}", r),
            CacheRef::MetadataSlot(o) => write!(f, "context[{}]", o),
        }
    }
}

impl<R: fmt::Display> fmt::Display for AccessOp<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessOp::LoadCache(c) => write!(f, "load {}", c),
            AccessOp::AcquireFence => f.write_str("fence acquire"),
            AccessOp::ReturnIfNonNull => f.write_str("ret.nonnull"),
            AccessOp::BeginOnce(t) => write!(f, "once {} {{", t),
            AccessOp::EndOnce => f.write_str("}"),
            AccessOp::Materialize(r) => write!(f, "materialize {}", r),
            AccessOp::Instantiate(p) => write!(f, "instantiate {}", p),
            AccessOp::RegisterForeign => f.write_str("register.foreign"),
            AccessOp::InitializeClass(init) => write!(
                f,
                "init.class members={}+{} overrides={}",
                init.members_start,
                init.members_size,
                init.overrides.len()
            ),
            AccessOp::InitializeValue => f.write_str("init.value"),
            AccessOp::StoreRelease(c) => write!(f, "store release {}", c),
            AccessOp::Return => f.write_str("ret"),
            AccessOp::AllocateMetadata(p) => write!(f, "alloc {}", p),
            AccessOp::InstallDependentVwt(v) => write!(f, "install.vwt {}", v),
            AccessOp::Fill { offset, argument } => write!(f, "fill [{}] = arg{}", offset, argument),
            AccessOp::AllocateFieldTypes(n) => write!(f, "alloc.fields {}", n),
            AccessOp::StoreFieldType { index, flags } => {
                write!(f, "store.field {} flags={:#x}", index, flags)
            }
            AccessOp::PublishFieldTypes(c) => write!(f, "publish.fields {}", c),
            AccessOp::Trap => f.write_str("trap"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_program() -> Vec<AccessOp<u64>> {
        vec![
            AccessOp::LoadCache(CacheRef::Global(0x2000)),
            AccessOp::ReturnIfNonNull,
            AccessOp::BeginOnce(0x2008),
            AccessOp::Materialize(TypeRecipe::Metadata(0x1000)),
            AccessOp::InitializeClass(ClassInit {
                superclass: Some(TypeRecipe::Instantiate {
                    accessor: 0x3000,
                    args: vec![TypeRecipe::GenericArgument(80), TypeRecipe::WitnessTable(0x1800)],
                }),
                base_offset: Some(0x2010),
                members_start: 80,
                members_size: 24,
                overrides: vec![(
                    SlotRef::Dynamic {
                        base: 0x2018,
                        relative: 8,
                    },
                    0x3100,
                )],
                field_offset_globals: vec![0x2020],
            }),
            AccessOp::StoreRelease(CacheRef::Global(0x2000)),
            AccessOp::EndOnce,
            AccessOp::LoadCache(CacheRef::Global(0x2000)),
            AccessOp::Return,
        ]
    }

    #[test]
    fn test_program_decodes_at_its_address() {
        let ops = sample_program();
        let base = 0x4000;
        let mut sink = AddressSink::new(base);
        encode_program(&ops, &mut sink);
        let bytes = sink.into_bytes();
        assert_eq!(bytes.len(), program_size(&ops));
        assert_eq!(program_len(&bytes).unwrap(), bytes.len());
        assert_eq!(decode_program(&bytes, base).unwrap(), ops);
    }

    #[test]
    fn test_structural_recipes() {
        let ops = vec![
            AccessOp::AllocateFieldTypes(2),
            AccessOp::Materialize(TypeRecipe::Function {
                params: vec![TypeRecipe::Tuple(vec![])],
                result: Box::new(TypeRecipe::Metatype(Box::new(TypeRecipe::Argument(1)))),
            }),
            AccessOp::StoreFieldType { index: 1, flags: 0 },
            AccessOp::Materialize(TypeRecipe::Indirect(0x40)),
            AccessOp::StoreFieldType { index: 0, flags: 2 },
            AccessOp::Materialize(TypeRecipe::Existential {
                protocols: vec![0x10, 0x20],
                class_bound: true,
            }),
            AccessOp::PublishFieldTypes(CacheRef::MetadataSlot(96)),
            AccessOp::Fill {
                offset: -16,
                argument: 3,
            },
            AccessOp::Trap,
        ];
        let mut sink = AddressSink::new(0x100);
        encode_program(&ops, &mut sink);
        assert_eq!(decode_program(&sink.into_bytes(), 0x100).unwrap(), ops);
    }

    #[test]
    fn test_unknown_op_rejected() {
        let bytes = [1, 0, 0, 0, 0xEE];
        assert_eq!(decode_program(&bytes, 0), Err(DecodeError::InvalidTag(0xEE, 4)));
    }

    #[test]
    fn test_map_refs_and_display() {
        let ops = sample_program();
        let named: Vec<AccessOp<String>> = ops
            .iter()
            .map(|op| op.map_refs(&mut |addr: &u64| format!("sym{:x}", addr)))
            .collect();
        assert_eq!(named[0].to_string(), "load sym2000");
        assert_eq!(named[2].to_string(), "once sym2008 {");
        assert_eq!(named[3].to_string(), "materialize metadata sym1000");
    }
}
