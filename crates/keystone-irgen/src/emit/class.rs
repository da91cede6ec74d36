//! Class metadata
//!
//! A class record starts with the heap destructor and the native object value
//! witness table, followed by the header the foreign object model expects and
//! then every ancestor's members, root first. Records that can be completed
//! here are constant; the rest are finished by the runtime at first access,
//! which copies the superclass's members, patches overrides and lays out the
//! instance.

use super::pattern::{FillCollector, Pattern};
use super::{define_zero_word, emit_accessor};
use crate::access::{strategy, AccessStrategy};
use crate::blob::{ConstantBlob, SectionKind};
use crate::context::CompilationContext;
use crate::error::IrGenResult;
use crate::layout::{walk, HeaderSlot, LayoutPlan, LayoutVisitor, MetadataLayout, StoredOffset};
use crate::naming::DeclNames;
use crate::recipe::type_recipe;
use keystone_abi::kind::class_flags;
use keystone_abi::symbols::{DELETED_METHOD_ERROR, NATIVE_OBJECT_VWT, OBJECT_DESTROY};
use keystone_abi::{AccessOp, ClassInit, MetadataKind, SlotRef};
use keystone_ast::{DeclId, MethodRef};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Words in the metaclass placeholder
const METACLASS_WORDS: usize = 5;

enum Isa {
    Zero,
    Kind(MetadataKind),
    Metaclass(String),
}

struct ClassBody<'n> {
    blob: ConstantBlob,
    names: &'n DeclNames,
    canonical: bool,
    isa: Isa,
    superclass: Option<String>,
    flags: u32,
    instance_size: u32,
    instance_align_mask: u16,
    class_size: u32,
    class_address_point: u32,
    vtable: FxHashMap<(DeclId, usize), String>,
    field_offsets: FxHashMap<DeclId, Vec<u64>>,
}

impl LayoutVisitor for ClassBody<'_> {
    fn add_word(&mut self, slot: HeaderSlot) {
        match slot {
            HeaderSlot::Destructor => self.blob.emit_address(OBJECT_DESTROY),
            HeaderSlot::ValueWitnesses => self.blob.emit_address(NATIVE_OBJECT_VWT),
            HeaderSlot::Isa => match &self.isa {
                Isa::Zero => self.blob.emit_word(0),
                Isa::Kind(kind) => self.blob.emit_word(kind.value()),
                Isa::Metaclass(name) => self.blob.emit_address(name.clone()),
            },
            HeaderSlot::Superclass => match &self.superclass {
                Some(name) => self.blob.emit_address(name.clone()),
                None => self.blob.emit_word(0),
            },
            HeaderSlot::Descriptor => self.blob.emit_address(self.names.descriptor()),
            _ => self.blob.emit_word(0),
        }
    }

    fn add_int32(&mut self, slot: HeaderSlot) {
        let value = match slot {
            HeaderSlot::ClassFlags => self.flags,
            HeaderSlot::InstanceSize => self.instance_size,
            HeaderSlot::ClassSize => self.class_size,
            HeaderSlot::ClassAddressPoint => self.class_address_point,
            _ => 0,
        };
        self.blob.emit_u32(value);
    }

    fn add_int16(&mut self, slot: HeaderSlot) {
        let value = match slot {
            HeaderSlot::InstanceAlignMask => self.instance_align_mask,
            _ => 0,
        };
        self.blob.emit_u16(value);
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

    fn add_method(&mut self, owner: DeclId, index: usize) {
        match self.vtable.get(&(owner, index)) {
            Some(implementation) => self.blob.emit_address(implementation.clone()),
            None => self.blob.emit_word(0),
        }
    }

    fn add_field_offset(&mut self, owner: DeclId, index: usize) {
        let offset = self
            .field_offsets
            .get(&owner)
            .and_then(|offsets| offsets.get(index).copied())
            .unwrap_or(0);
        self.blob.emit_word(offset);
    }

    fn add_payload_size(&mut self) {
        self.blob.emit_word(0);
    }
}

/// Vtable entries known at compile time
///
/// Constant records get every slot. Records completed at run time only carry
/// the slots their class introduces; inherited slots are copied from the
/// superclass and overrides patched in by the runtime.
fn vtable_entries(
    cx: &CompilationContext<'_>,
    id: DeclId,
    plan: &LayoutPlan,
    strategy: AccessStrategy,
) -> IrGenResult<FxHashMap<(DeclId, usize), String>> {
    let info = cx.types();
    let mut entries = FxHashMap::default();
    for step in &plan.steps {
        let crate::layout::LayoutStep::Method { owner, index } = *step else {
            continue;
        };
        if !strategy.is_constant() && owner != id {
            continue;
        }
        let slot = MethodRef {
            class: owner,
            index,
        };
        let Some(implementation) = info.implementation(id, slot) else {
            continue;
        };
        let class = cx.decl(implementation.class)?;
        let Some(method) = class.methods.get(implementation.index) else {
            continue;
        };
        let entry = if method.dead {
            DELETED_METHOD_ERROR.to_string()
        } else {
            DeclNames::new(class).method(&method.name)
        };
        entries.insert((owner, index), entry);
    }
    Ok(entries)
}

/// Parameters for completing the record at run time
fn class_init(
    cx: &mut CompilationContext<'_>,
    id: DeclId,
    layout: &MetadataLayout,
) -> IrGenResult<ClassInit<String>> {
    let decl = cx.decl(id)?;
    let names = DeclNames::new(decl);
    let superclass = match &decl.superclass {
        Some(ty) => Some(type_recipe(cx, ty, Some(id))?),
        None => None,
    };
    let own = layout.own_members().copied();
    let mut overrides = Vec::new();
    for (index, method) in decl.methods.iter().enumerate() {
        if method.overrides.is_none() {
            continue;
        }
        let root = cx.types().root_method(MethodRef { class: id, index });
        let slot = match layout.method_offset(root.class, root.index)? {
            StoredOffset::Static(offset) => SlotRef::Static(offset),
            StoredOffset::Dynamic { boundary, relative } => SlotRef::Dynamic {
                base: DeclNames::new(cx.decl(boundary)?).base_offset(),
                relative,
            },
        };
        overrides.push((slot, names.method(&method.name)));
    }
    let field_offset_globals = if decl.is_generic() {
        Vec::new()
    } else {
        decl.fields
            .iter()
            .map(|field| names.field_offset(&field.name))
            .collect()
    };
    Ok(ClassInit {
        superclass,
        base_offset: own.filter(|m| m.dynamic).map(|_| names.base_offset()),
        members_start: own.map(|m| m.start as u32).unwrap_or(0),
        members_size: own.map(|m| m.size).unwrap_or(0),
        overrides,
        field_offset_globals,
    })
}

pub(super) fn emit_class(cx: &mut CompilationContext<'_>, id: DeclId) -> IrGenResult<()> {
    let decl = cx.decl(id)?;
    let names = DeclNames::new(decl);
    let layout = cx.layout(id)?;
    let strategy = strategy(&cx.types(), id);
    let plan = LayoutPlan::build(&cx.types(), id)?;
    let instance = cx.types().class_instance_layout(id);
    let dynamic = cx.types().has_dynamic_members(id);
    let ps = cx.pointer_size();

    let isa = if decl.foreign {
        Isa::Kind(MetadataKind::ForeignClass)
    } else if cx.target.objc_interop {
        let mut blob = ConstantBlob::new(ps);
        blob.emit_zeros(METACLASS_WORDS * ps as usize);
        cx.symbols.define(names.metaclass(), SectionKind::Data, blob)?;
        Isa::Metaclass(names.metaclass())
    } else {
        Isa::Zero
    };

    let superclass = match cx.program.superclass_decl(id) {
        Some(parent) if strategy.is_constant() => Some(DeclNames::new(cx.decl(parent)?).metadata()),
        _ => None,
    };

    let mut flags = class_flags::USES_NATIVE_REFCOUNTING;
    if dynamic {
        flags |= class_flags::HAS_RESILIENT_ANCESTRY;
    }

    let mut field_offsets = FxHashMap::default();
    if let Some(instance) = &instance {
        for (class, offsets) in &instance.classes {
            field_offsets.insert(*class, offsets.clone());
        }
    }

    let mut body = ClassBody {
        blob: ConstantBlob::new(ps),
        names: &names,
        canonical: !decl.is_generic(),
        isa,
        superclass,
        flags,
        instance_size: instance.as_ref().map(|i| i.size as u32).unwrap_or(0),
        instance_align_mask: instance
            .as_ref()
            .map(|i| (i.align - 1) as u16)
            .unwrap_or(0),
        class_size: layout.total_size,
        class_address_point: layout.address_point,
        vtable: vtable_entries(cx, id, &plan, strategy)?,
        field_offsets,
    };
    walk(&plan, &mut body);
    let body = body.blob;

    if let Some(own) = layout.own_members().filter(|m| m.dynamic) {
        let mut blob = ConstantBlob::new(ps);
        blob.emit_word(own.start as u64);
        cx.symbols.define(names.base_offset(), SectionKind::Data, blob)?;
    }

    if !decl.is_generic() {
        let own_offsets = instance.as_ref().and_then(|i| i.offsets_of(id));
        for (index, field) in decl.fields.iter().enumerate() {
            match own_offsets.and_then(|offsets| offsets.get(index)) {
                Some(offset) => {
                    let mut blob = ConstantBlob::new(ps);
                    blob.emit_word(*offset);
                    cx.symbols
                        .define(names.field_offset(&field.name), SectionKind::Data, blob)?;
                }
                None => define_zero_word(cx, names.field_offset(&field.name))?,
            }
        }
    }

    debug!(
        class = %decl.name,
        ?strategy,
        dynamic,
        size = layout.total_size,
        "emitting class metadata"
    );
    match strategy {
        AccessStrategy::Generic => {
            let fill_ops = FillCollector::collect(&cx.types(), &plan)?;
            let init = class_init(cx, id, &layout)?;
            let pattern = Pattern::new(&names, decl, &layout, body, fill_ops, None);
            pattern.emit(cx, &names, Some(AccessOp::InitializeClass(init)))?;
            emit_accessor(cx, &names, strategy, None)
        }
        AccessStrategy::SingletonInit => {
            cx.symbols
                .define(names.full_metadata(), SectionKind::Data, body)?;
            let init = class_init(cx, id, &layout)?;
            emit_accessor(cx, &names, strategy, Some(AccessOp::InitializeClass(init)))
        }
        AccessStrategy::Constant | AccessStrategy::Foreign => {
            cx.symbols
                .define(names.full_metadata(), SectionKind::Data, body)?;
            emit_accessor(cx, &names, strategy, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::context::{CompilationContext, CompileOptions};
    use crate::emit::emit_decl;
    use keystone_abi::kind::class_layout;
    use keystone_abi::opcode::decode_program;
    use keystone_abi::symbols::DELETED_METHOD_ERROR;
    use keystone_abi::{AccessOp, ClassInit, SlotRef};
    use keystone_ast::{BuiltinType, MethodRef, NominalDecl, Program, Type};

    fn compile<'p>(program: &'p Program, options: CompileOptions) -> CompilationContext<'p> {
        let mut cx = CompilationContext::new(program, "main", options).unwrap();
        for (id, _) in program.iter() {
            emit_decl(&mut cx, id).unwrap();
        }
        cx
    }

    fn word(bytes: &[u8], at: i64) -> u64 {
        let at = at as usize;
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    }

    fn u32_at(bytes: &[u8], at: i64) -> u32 {
        let at = at as usize;
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    fn class_init(cx: &CompilationContext<'_>, accessor: &str) -> ClassInit<u64> {
        let (def, _) = cx.symbols.lookup(accessor).unwrap();
        decode_program(def.blob.bytes(), 0)
            .unwrap()
            .into_iter()
            .find_map(|op| match op {
                AccessOp::InitializeClass(init) => Some(init),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_constant_class_has_complete_vtable() {
        let mut program = Program::new();
        let base = program.add(
            NominalDecl::class("Base", "main")
                .with_method("run")
                .with_dead_method("unused")
                .with_field("a", Type::Builtin(BuiltinType::Int32)),
        );
        program.add(
            NominalDecl::class("Leaf", "main")
                .with_superclass(Type::nominal(base))
                .with_override("run", MethodRef { class: base, index: 0 }),
        );
        let cx = compile(&program, CompileOptions::default());
        let (full, ap) = cx.symbols.lookup("$s4main4LeafCN").unwrap();
        assert_eq!(ap, 16);
        let ap = ap as i64;
        let bytes = full.blob.bytes();
        assert_eq!(u32_at(bytes, ap + class_layout::INSTANCE_SIZE), 20);
        assert_eq!(u32_at(bytes, ap + class_layout::CLASS_SIZE), 16 + 104);
        let targets: Vec<(usize, &str)> = full
            .blob
            .fixups()
            .iter()
            .map(|f| (f.at(), f.target()))
            .collect();
        let members = (ap + class_layout::MEMBERS) as usize;
        assert!(targets.contains(&(members, "$s4main4LeafC3runF")));
        assert!(targets.contains(&(members + 8, DELETED_METHOD_ERROR)));
        assert!(targets.contains(&((ap + class_layout::SUPERCLASS) as usize, "$s4main4BaseCN")));
        assert_eq!(word(bytes, members as i64 + 16), 16);
        assert!(cx.symbols.contains("$s4main4BaseC6unusedF"));
        assert!(cx.symbols.contains("$s4main4BaseC1aWv"));
    }

    #[test]
    fn test_resilient_ancestry_uses_base_offset() {
        let mut program = Program::new();
        let base = program.add(
            NominalDecl::class("Base", "lib")
                .resilient()
                .with_method("draw"),
        );
        program.add(
            NominalDecl::class("Shape", "main")
                .with_superclass(Type::nominal(base))
                .with_override("draw", MethodRef { class: base, index: 0 })
                .with_method("area"),
        );
        let cx = compile(&program, CompileOptions::default());
        let (mo, _) = cx.symbols.lookup("$s4main5ShapeCMo").unwrap();
        assert_eq!(word(mo.blob.bytes(), 0), 88);
        let init = class_init(&cx, "$s4main5ShapeCMa");
        assert!(init.base_offset.is_some());
        assert_eq!(init.members_start, 88);
        assert_eq!(init.members_size, 8);
        assert_eq!(init.overrides.len(), 1);
        assert!(matches!(
            init.overrides[0].0,
            SlotRef::Dynamic { relative: 0, .. }
        ));
        let (full, ap) = cx.symbols.lookup("$s4main5ShapeCN").unwrap();
        let flags = u32_at(full.blob.bytes(), ap as i64 + class_layout::FLAGS);
        assert_ne!(flags & keystone_abi::kind::class_flags::HAS_RESILIENT_ANCESTRY, 0);
    }

    #[test]
    fn test_objc_interop_installs_metaclass() {
        let mut program = Program::new();
        program.add(NominalDecl::class("View", "main"));
        let options = CompileOptions {
            arch: "arm64".to_string(),
            format: "macho".to_string(),
            ..CompileOptions::default()
        };
        let cx = compile(&program, options);
        assert!(cx.symbols.contains("$s4main4ViewCMm"));
        let (full, ap) = cx.symbols.lookup("$s4main4ViewCN").unwrap();
        assert!(full
            .blob
            .fixups()
            .iter()
            .any(|f| f.at() == ap && f.target() == "$s4main4ViewCMm"));
    }

    #[test]
    fn test_generic_class_instantiates_with_class_init() {
        let mut program = Program::new();
        let base = program.add(NominalDecl::class("Base", "main").with_method("run"));
        program.add(
            NominalDecl::class("Node", "main")
                .with_generic_param("T", vec![])
                .with_superclass(Type::nominal(base))
                .with_field("value", Type::GenericParam(0)),
        );
        let cx = compile(&program, CompileOptions::default());
        assert!(!cx.symbols.contains("$s4main4NodeCN"));
        assert!(!cx.symbols.contains("$s4main4NodeC5valueWv"));
        let init = class_init(&cx, "$s4main4NodeCMi");
        assert!(init.field_offset_globals.is_empty());
        assert!(matches!(init.superclass, Some(keystone_abi::TypeRecipe::Metadata(_))));
        assert_eq!(init.members_start, 88);
    }
}
