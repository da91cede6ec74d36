//! Struct and enum metadata

use super::emit_accessor;
use super::pattern::{FillCollector, Pattern};
use crate::access::strategy;
use crate::blob::{ConstantBlob, SectionKind};
use crate::context::CompilationContext;
use crate::error::IrGenResult;
use crate::layout::{walk, HeaderSlot, LayoutPlan, LayoutVisitor};
use crate::naming::DeclNames;
use crate::typeinfo::identity_args;
use keystone_abi::symbols::VALUE_WITNESS_FUNCTIONS;
use keystone_abi::{AccessOp, MetadataKind, ValueLayout};
use keystone_ast::{DeclId, DeclKind};

/// Builds the record of a value type in plan order
struct ValueBody<'n> {
    blob: ConstantBlob,
    names: &'n DeclNames,
    kind: MetadataKind,
    field_offsets: Option<Vec<u64>>,
    /// Whether the address point gets the metadata symbol
    canonical: bool,
}

impl LayoutVisitor for ValueBody<'_> {
    fn add_word(&mut self, slot: HeaderSlot) {
        match slot {
            HeaderSlot::ValueWitnesses => self.blob.emit_address(self.names.value_witnesses()),
            HeaderSlot::Kind => self.blob.emit_word(self.kind.value()),
            HeaderSlot::Descriptor => self.blob.emit_address(self.names.descriptor()),
            _ => self.blob.emit_word(0),
        }
    }

    fn add_int32(&mut self, _slot: HeaderSlot) {
        self.blob.emit_u32(0);
    }

    fn add_int16(&mut self, _slot: HeaderSlot) {
        self.blob.emit_u16(0);
    }

    fn note_address_point(&mut self) {
        if self.canonical {
            self.blob.label(self.names.metadata());
        }
    }

    fn add_generic_argument(&mut self, _owner: DeclId, _index: u32) {
        self.blob.emit_word(0);
    }

    fn add_generic_witness(&mut self, _owner: DeclId, _param: u32, _protocol: DeclId) {
        self.blob.emit_word(0);
    }

    fn add_method(&mut self, _owner: DeclId, _index: usize) {
        self.blob.emit_word(0);
    }

    fn add_field_offset(&mut self, _owner: DeclId, index: usize) {
        let offset = self
            .field_offsets
            .as_ref()
            .and_then(|offsets| offsets.get(index).copied())
            .unwrap_or(0);
        self.blob.emit_word(offset);
    }

    fn add_payload_size(&mut self) {
        self.blob.emit_word(0);
    }
}

/// Value witness table; size fields stay zero until the runtime computes them
fn emit_value_witnesses(
    cx: &mut CompilationContext<'_>,
    names: &DeclNames,
    layout: Option<ValueLayout>,
) -> IrGenResult<()> {
    let ps = cx.pointer_size();
    let mut blob = ConstantBlob::new(ps);
    for function in VALUE_WITNESS_FUNCTIONS {
        blob.emit_address(function);
    }
    match layout {
        Some(layout) => {
            blob.emit_word(layout.size);
            blob.emit_word(layout.vwt_flags(ps));
            blob.emit_word(layout.stride);
            blob.emit_word(layout.extra_inhabitants as u64);
        }
        None => blob.emit_zeros(4 * ps as usize),
    }
    cx.symbols.define(names.value_witnesses(), SectionKind::Data, blob)
}

pub(super) fn emit_value_type(cx: &mut CompilationContext<'_>, id: DeclId) -> IrGenResult<()> {
    let decl = cx.decl(id)?;
    let names = DeclNames::new(decl);
    let layout = cx.layout(id)?;
    let strategy = strategy(&cx.types(), id);
    let value_layout = cx.types().decl_value_layout(id);
    let field_offsets = match decl.kind {
        DeclKind::Struct => cx
            .types()
            .struct_layout(id, &identity_args(decl))
            .map(|record| record.offsets),
        _ => None,
    };
    let plan = LayoutPlan::build(&cx.types(), id)?;

    emit_value_witnesses(cx, &names, value_layout)?;

    let mut body = ValueBody {
        blob: ConstantBlob::new(cx.pointer_size()),
        names: &names,
        kind: if decl.kind == DeclKind::Enum {
            MetadataKind::Enum
        } else {
            MetadataKind::Struct
        },
        field_offsets,
        canonical: !decl.is_generic(),
    };
    walk(&plan, &mut body);
    let body = body.blob;

    if decl.is_generic() {
        let fill_ops = FillCollector::collect(&cx.types(), &plan)?;
        // Fixed layouts share the constant table; others get a private copy
        // that instantiation completes.
        let dependent = value_layout.is_none();
        let pattern = Pattern::new(
            &names,
            decl,
            &layout,
            body,
            fill_ops,
            dependent.then(|| names.value_witnesses()),
        );
        pattern.emit(cx, &names, dependent.then_some(AccessOp::InitializeValue))?;
    } else {
        cx.symbols
            .define(names.full_metadata(), SectionKind::Data, body)?;
    }
    emit_accessor(cx, &names, strategy, None)
}

#[cfg(test)]
mod tests {
    use crate::context::{CompilationContext, CompileOptions};
    use crate::emit::emit_decl;
    use keystone_abi::opcode::decode_program;
    use keystone_ast::{BuiltinType, NominalDecl, Program, Type};

    fn compile<'a>(program: &'a Program, module: &str) -> CompilationContext<'a> {
        let mut cx = CompilationContext::new(program, module, CompileOptions::default()).unwrap();
        for (id, _) in program.iter() {
            emit_decl(&mut cx, id).unwrap();
        }
        cx
    }

    fn word(bytes: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    }

    #[test]
    fn test_fixed_struct_metadata_is_constant() {
        let mut program = Program::new();
        program.add(
            NominalDecl::structure("Point", "main")
                .with_field("x", Type::Builtin(BuiltinType::Int32))
                .with_field("y", Type::Builtin(BuiltinType::Int64)),
        );
        let cx = compile(&program, "main");
        let (full, offset) = cx.symbols.lookup("$s4main5PointVN").unwrap();
        assert_eq!(full.name, "$s4main5PointVMf");
        assert_eq!(offset, 8);
        let bytes = full.blob.bytes();
        assert_eq!(word(bytes, 8), 1);
        assert_eq!(word(bytes, 24), 0);
        assert_eq!(word(bytes, 32), 8);
        assert_eq!(full.blob.fixups()[0].target(), "$s4main5PointVWV");

        let (vwt, _) = cx.symbols.lookup("$s4main5PointVWV").unwrap();
        assert_eq!(vwt.blob.fixups().len(), 4);
        assert_eq!(word(vwt.blob.bytes(), 32), 16);
        assert!(!cx.symbols.contains("$s4main5PointVML"));
    }

    #[test]
    fn test_resilient_field_defers_layout_to_runtime() {
        let mut program = Program::new();
        let opaque = program.add(
            NominalDecl::structure("Opaque", "lib")
                .resilient()
                .with_field("x", Type::Builtin(BuiltinType::Int8)),
        );
        program.add(NominalDecl::structure("Holder", "main").with_field("o", Type::nominal(opaque)));
        let cx = compile(&program, "main");
        let (vwt, _) = cx.symbols.lookup("$s4main6HolderVWV").unwrap();
        assert_eq!(word(vwt.blob.bytes(), 32), 0);
        assert!(cx.symbols.contains("$s4main6HolderVML"));
        assert!(cx.symbols.contains("$s4main6HolderVMl"));
        let (accessor, _) = cx.symbols.lookup("$s4main6HolderVMa").unwrap();
        let ops = decode_program(accessor.blob.bytes(), 0).unwrap();
        assert!(ops.contains(&keystone_abi::AccessOp::InitializeValue));
    }

    #[test]
    fn test_generic_struct_gets_pattern_instead_of_metadata() {
        let mut program = Program::new();
        program.add(
            NominalDecl::structure("Box", "main")
                .with_generic_param("T", vec![])
                .with_field("value", Type::GenericParam(0)),
        );
        let cx = compile(&program, "main");
        assert!(!cx.symbols.contains("$s4main3BoxVN"));
        assert!(cx.symbols.contains("$s4main3BoxVMP"));
        let (mi, _) = cx.symbols.lookup("$s4main3BoxVMi").unwrap();
        let ops = decode_program(mi.blob.bytes(), 0).unwrap();
        assert!(matches!(ops[1], keystone_abi::AccessOp::InstallDependentVwt(_)));
        assert_eq!(
            ops[2],
            keystone_abi::AccessOp::Fill {
                offset: 16,
                argument: 0
            }
        );
        assert_eq!(ops[3], keystone_abi::AccessOp::InitializeValue);
    }
}
