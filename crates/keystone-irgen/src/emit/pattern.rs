//! Generic metadata patterns
//!
//! A generic type has no metadata object in the image. Its pattern holds a
//! template of the record plus a header telling the runtime how much to
//! allocate; the instantiation function copies the template, writes each
//! generic argument into its slot and completes whatever layout depends on
//! the arguments.

use super::define_program;
use crate::blob::{ConstantBlob, SectionKind};
use crate::context::CompilationContext;
use crate::error::IrGenResult;
use crate::layout::{walk, HeaderSlot, LayoutPlan, LayoutVisitor, MetadataLayout};
use crate::naming::DeclNames;
use crate::typeinfo::TypeInfo;
use keystone_abi::kind::pattern_header;
use keystone_abi::AccessOp;
use keystone_ast::{DeclId, NominalDecl};

/// Copy of instantiation argument `argument` into the new record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillOp {
    /// Byte offset from the address point
    pub offset: i32,
    pub argument: u16,
}

/// Collects the fill operations for a declaration's own generic slots
pub struct FillCollector<'a> {
    info: &'a TypeInfo<'a>,
    decl_id: DeclId,
    decl: &'a NominalDecl,
    word: i32,
    next: i32,
    address_point: i32,
    ops: Vec<FillOp>,
}

impl<'a> FillCollector<'a> {
    pub fn collect(info: &'a TypeInfo<'a>, plan: &LayoutPlan) -> IrGenResult<Vec<FillOp>> {
        let decl = info.decl(plan.decl)?;
        let mut collector = FillCollector {
            info,
            decl_id: plan.decl,
            decl,
            word: info.target.pointer_size as i32,
            next: 0,
            address_point: 0,
            ops: Vec::new(),
        };
        walk(plan, &mut collector);
        Ok(collector.ops)
    }

    fn advance(&mut self, size: i32) {
        self.next += size;
    }

    fn fill(&mut self, argument: u16) {
        self.ops.push(FillOp {
            offset: self.next - self.address_point,
            argument,
        });
    }
}

impl LayoutVisitor for FillCollector<'_> {
    fn add_word(&mut self, _slot: HeaderSlot) {
        self.advance(self.word);
    }

    fn add_int32(&mut self, _slot: HeaderSlot) {
        self.advance(4);
    }

    fn add_int16(&mut self, _slot: HeaderSlot) {
        self.advance(2);
    }

    fn note_address_point(&mut self) {
        self.address_point = self.next;
    }

    fn add_generic_argument(&mut self, owner: DeclId, index: u32) {
        if owner == self.decl_id {
            self.fill(index as u16);
        }
        self.advance(self.word);
    }

    fn add_generic_witness(&mut self, owner: DeclId, param: u32, protocol: DeclId) {
        if owner == self.decl_id {
            let params = self.decl.generic_params.len() as u32;
            if let Some(index) = self.info.witness_index(self.decl, param, protocol) {
                self.fill((params + index) as u16);
            }
        }
        self.advance(self.word);
    }

    fn add_method(&mut self, _owner: DeclId, _index: usize) {
        self.advance(self.word);
    }

    fn add_field_offset(&mut self, _owner: DeclId, _index: usize) {
        self.advance(self.word);
    }

    fn add_payload_size(&mut self) {
        self.advance(self.word);
    }
}

/// Template and instructions for instantiating a generic type
#[derive(Debug, Clone)]
pub struct Pattern {
    pub header: ConstantBlob,
    pub body: ConstantBlob,
    pub fill_ops: Vec<FillOp>,
    /// Value witness table to copy into each instantiation
    pub dependent_vwt: Option<String>,
}

impl Pattern {
    pub fn new(
        names: &DeclNames,
        decl: &NominalDecl,
        layout: &MetadataLayout,
        body: ConstantBlob,
        fill_ops: Vec<FillOp>,
        dependent_vwt: Option<String>,
    ) -> Self {
        let word = layout.pointer_size as u32;
        let arguments = decl.generic_params.len() + decl.num_generic_witnesses();
        let mut header = ConstantBlob::new(layout.pointer_size);
        header.emit_relative(names.instantiation_function());
        // One extra word after the record caches the field type vector.
        header.emit_u32(layout.total_size + word);
        header.emit_u16(arguments as u16);
        header.emit_u16(layout.address_point as u16);
        header.emit_zeros(pattern_header::PRIVATE_DATA - header.len());
        header.emit_zeros(pattern_header::PRIVATE_DATA_WORDS * 8);
        debug_assert_eq!(header.len(), pattern_header::SIZE_BYTES);
        Self {
            header,
            body,
            fill_ops,
            dependent_vwt,
        }
    }

    /// Body of the instantiation function
    pub fn instantiation_program(
        &self,
        names: &DeclNames,
        initialize: Option<AccessOp<String>>,
    ) -> Vec<AccessOp<String>> {
        let mut ops = vec![AccessOp::AllocateMetadata(names.pattern())];
        if let Some(vwt) = &self.dependent_vwt {
            ops.push(AccessOp::InstallDependentVwt(vwt.clone()));
        }
        ops.extend(self.fill_ops.iter().map(|fill| AccessOp::Fill {
            offset: fill.offset,
            argument: fill.argument,
        }));
        ops.extend(initialize);
        ops.push(AccessOp::Return);
        ops
    }

    /// Define the pattern and its instantiation function
    pub fn emit(
        self,
        cx: &mut CompilationContext<'_>,
        names: &DeclNames,
        initialize: Option<AccessOp<String>>,
    ) -> IrGenResult<()> {
        let program = self.instantiation_program(names, initialize);
        let mut blob = self.header;
        blob.append(self.body);
        cx.symbols.define(names.pattern(), SectionKind::Data, blob)?;
        define_program(cx, names.instantiation_function(), &program)
    }
}
