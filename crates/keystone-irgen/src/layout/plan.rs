//! Canonical slot order of metadata records
//!
//! A `LayoutPlan` lists every slot of one declaration's metadata in the order
//! the record stores them. Everything that needs to agree on that order (the
//! scanner, the constant body builders, the fill-op collector) walks the same
//! plan with its own `LayoutVisitor`, so they cannot drift apart.
//!
//! Class records place each ancestor's members before the class's own, root
//! first, which makes a subclass record a prefix extension of its
//! superclass's.

use crate::error::{IrGenResult, LayoutError};
use crate::typeinfo::TypeInfo;
use keystone_ast::{DeclId, DeclKind};
use serde::Serialize;
use std::fmt;

/// Fixed slot in a metadata header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HeaderSlot {
    /// Heap destructor (classes, before the address point)
    Destructor,
    /// Value witness table (before the address point)
    ValueWitnesses,
    /// Kind word for value types
    Kind,
    /// Metaclass or kind word for classes
    Isa,
    Superclass,
    /// Method cache words of the foreign object model
    Cache(u8),
    /// Foreign object model data pointer
    Data,
    ClassFlags,
    InstanceAddressPoint,
    InstanceSize,
    InstanceAlignMask,
    Reserved,
    ClassSize,
    ClassAddressPoint,
    Descriptor,
    IvarDestroyer,
}

/// One step of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutStep {
    /// Pointer-sized header slot
    Word(HeaderSlot),
    /// 32-bit header slot
    Int32(HeaderSlot),
    /// 16-bit header slot
    Int16(HeaderSlot),
    /// The canonical pointer points here
    AddressPoint,
    /// Members introduced by one declaration start here
    BeginMembers(DeclId),
    /// Members introduced by one declaration end here
    EndMembers(DeclId),
    /// Metadata for a generic argument
    GenericArgument { owner: DeclId, index: u32 },
    /// Witness table for a generic requirement
    GenericWitness {
        owner: DeclId,
        param: u32,
        protocol: DeclId,
    },
    /// Vtable slot introduced by `owner`
    Method { owner: DeclId, index: usize },
    /// Offset of a stored property
    FieldOffset { owner: DeclId, index: usize },
    /// Payload size of an enum whose layout is only known at run time
    PayloadSize,
}

impl fmt::Display for HeaderSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderSlot::Cache(i) => write!(f, "cache[{}]", i),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Capabilities a plan walker calls back into
pub trait LayoutVisitor {
    fn add_word(&mut self, slot: HeaderSlot);
    fn add_int32(&mut self, slot: HeaderSlot);
    fn add_int16(&mut self, slot: HeaderSlot);
    fn note_address_point(&mut self);
    fn begin_members(&mut self, _owner: DeclId) {}
    fn end_members(&mut self, _owner: DeclId) {}
    fn add_generic_argument(&mut self, owner: DeclId, index: u32);
    fn add_generic_witness(&mut self, owner: DeclId, param: u32, protocol: DeclId);
    fn add_method(&mut self, owner: DeclId, index: usize);
    fn add_field_offset(&mut self, owner: DeclId, index: usize);
    fn add_payload_size(&mut self);
}

/// Ordered slots of one declaration's metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutPlan {
    pub decl: DeclId,
    pub kind: DeclKind,
    pub steps: Vec<LayoutStep>,
}

impl LayoutPlan {
    /// Build the plan for a struct, enum or class
    pub fn build(info: &TypeInfo<'_>, id: DeclId) -> IrGenResult<Self> {
        let decl = info.decl(id)?;
        let mut steps = Vec::new();
        match decl.kind {
            DeclKind::Struct | DeclKind::Enum => {
                steps.push(LayoutStep::Word(HeaderSlot::ValueWitnesses));
                steps.push(LayoutStep::AddressPoint);
                steps.push(LayoutStep::Word(HeaderSlot::Kind));
                steps.push(LayoutStep::Word(HeaderSlot::Descriptor));
                steps.push(LayoutStep::BeginMembers(id));
                push_generic_requirements(info, id, &mut steps)?;
                if decl.kind == DeclKind::Struct {
                    for index in 0..decl.fields.len() {
                        steps.push(LayoutStep::FieldOffset { owner: id, index });
                    }
                } else if decl.cases.iter().any(|c| c.payload.is_some())
                    && info.decl_value_layout(id).is_none()
                {
                    steps.push(LayoutStep::PayloadSize);
                }
                steps.push(LayoutStep::EndMembers(id));
            }
            DeclKind::Class => {
                steps.extend([
                    LayoutStep::Word(HeaderSlot::Destructor),
                    LayoutStep::Word(HeaderSlot::ValueWitnesses),
                    LayoutStep::AddressPoint,
                    LayoutStep::Word(HeaderSlot::Isa),
                    LayoutStep::Word(HeaderSlot::Superclass),
                    LayoutStep::Word(HeaderSlot::Cache(0)),
                    LayoutStep::Word(HeaderSlot::Cache(1)),
                    LayoutStep::Word(HeaderSlot::Data),
                    LayoutStep::Int32(HeaderSlot::ClassFlags),
                    LayoutStep::Int32(HeaderSlot::InstanceAddressPoint),
                    LayoutStep::Int32(HeaderSlot::InstanceSize),
                    LayoutStep::Int16(HeaderSlot::InstanceAlignMask),
                    LayoutStep::Int16(HeaderSlot::Reserved),
                    LayoutStep::Int32(HeaderSlot::ClassSize),
                    LayoutStep::Int32(HeaderSlot::ClassAddressPoint),
                    LayoutStep::Word(HeaderSlot::Descriptor),
                    LayoutStep::Word(HeaderSlot::IvarDestroyer),
                ]);
                for class in info.program.class_hierarchy(id) {
                    let ancestor = info.decl(class)?;
                    if ancestor.kind != DeclKind::Class {
                        return Err(LayoutError::NotAClass {
                            decl: ancestor.name.clone(),
                        }
                        .into());
                    }
                    steps.push(LayoutStep::BeginMembers(class));
                    push_generic_requirements(info, class, &mut steps)?;
                    for index in info.introduced_methods(class) {
                        steps.push(LayoutStep::Method {
                            owner: class,
                            index,
                        });
                    }
                    for index in 0..ancestor.fields.len() {
                        steps.push(LayoutStep::FieldOffset {
                            owner: class,
                            index,
                        });
                    }
                    steps.push(LayoutStep::EndMembers(class));
                }
            }
            DeclKind::Protocol => {
                return Err(LayoutError::NoMetadata {
                    decl: decl.name.clone(),
                }
                .into())
            }
        }
        Ok(Self {
            decl: id,
            kind: decl.kind,
            steps,
        })
    }
}

fn push_generic_requirements(
    info: &TypeInfo<'_>,
    owner: DeclId,
    steps: &mut Vec<LayoutStep>,
) -> IrGenResult<()> {
    let decl = info.decl(owner)?;
    for index in 0..decl.generic_params.len() as u32 {
        steps.push(LayoutStep::GenericArgument { owner, index });
    }
    for (param, p) in decl.generic_params.iter().enumerate() {
        for protocol in &p.requirements {
            steps.push(LayoutStep::GenericWitness {
                owner,
                param: param as u32,
                protocol: *protocol,
            });
        }
    }
    Ok(())
}

/// Drive a visitor over a plan in order
pub fn walk<V: LayoutVisitor>(plan: &LayoutPlan, visitor: &mut V) {
    for step in &plan.steps {
        match *step {
            LayoutStep::Word(slot) => visitor.add_word(slot),
            LayoutStep::Int32(slot) => visitor.add_int32(slot),
            LayoutStep::Int16(slot) => visitor.add_int16(slot),
            LayoutStep::AddressPoint => visitor.note_address_point(),
            LayoutStep::BeginMembers(owner) => visitor.begin_members(owner),
            LayoutStep::EndMembers(owner) => visitor.end_members(owner),
            LayoutStep::GenericArgument { owner, index } => {
                visitor.add_generic_argument(owner, index)
            }
            LayoutStep::GenericWitness {
                owner,
                param,
                protocol,
            } => visitor.add_generic_witness(owner, param, protocol),
            LayoutStep::Method { owner, index } => visitor.add_method(owner, index),
            LayoutStep::FieldOffset { owner, index } => visitor.add_field_offset(owner, index),
            LayoutStep::PayloadSize => visitor.add_payload_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_abi::{Arch, ObjectFormat, TargetAbi};
    use keystone_ast::{BuiltinType, NominalDecl, Program, Type};

    #[derive(Default)]
    struct Recorder(Vec<String>);

    impl LayoutVisitor for Recorder {
        fn add_word(&mut self, slot: HeaderSlot) {
            self.0.push(format!("word {}", slot));
        }
        fn add_int32(&mut self, slot: HeaderSlot) {
            self.0.push(format!("i32 {}", slot));
        }
        fn add_int16(&mut self, slot: HeaderSlot) {
            self.0.push(format!("i16 {}", slot));
        }
        fn note_address_point(&mut self) {
            self.0.push("ap".into());
        }
        fn add_generic_argument(&mut self, _owner: DeclId, index: u32) {
            self.0.push(format!("arg {}", index));
        }
        fn add_generic_witness(&mut self, _owner: DeclId, param: u32, _protocol: DeclId) {
            self.0.push(format!("wt {}", param));
        }
        fn add_method(&mut self, owner: DeclId, index: usize) {
            self.0.push(format!("method {}.{}", owner.0, index));
        }
        fn add_field_offset(&mut self, owner: DeclId, index: usize) {
            self.0.push(format!("field {}.{}", owner.0, index));
        }
        fn add_payload_size(&mut self) {
            self.0.push("payload".into());
        }
    }

    #[test]
    fn test_generic_struct_plan_order() {
        let mut program = Program::new();
        let eq = program.add(NominalDecl::protocol("Equatable", "main"));
        let pair = program.add(
            NominalDecl::structure("Pair", "main")
                .with_generic_param("A", vec![eq])
                .with_generic_param("B", vec![])
                .with_field("a", Type::GenericParam(0))
                .with_field("b", Type::GenericParam(1)),
        );
        let target = TargetAbi::lookup(Arch::X86_64, ObjectFormat::Elf);
        let info = TypeInfo::new(&program, "main", &target);
        let plan = LayoutPlan::build(&info, pair).unwrap();
        let mut rec = Recorder::default();
        walk(&plan, &mut rec);
        assert_eq!(
            rec.0,
            vec![
                "word ValueWitnesses",
                "ap",
                "word Kind",
                "word Descriptor",
                "arg 0",
                "arg 1",
                "wt 0",
                "field 1.0",
                "field 1.1",
            ]
        );
    }

    #[test]
    fn test_class_plan_puts_ancestors_first() {
        let mut program = Program::new();
        let base = program.add(
            NominalDecl::class("Base", "main")
                .with_method("run")
                .with_field("a", Type::Builtin(BuiltinType::Int32)),
        );
        let derived = program.add(
            NominalDecl::class("Derived", "main")
                .with_superclass(Type::nominal(base))
                .with_override("run", keystone_ast::MethodRef { class: base, index: 0 })
                .with_method("stop"),
        );
        let target = TargetAbi::lookup(Arch::X86_64, ObjectFormat::Elf);
        let info = TypeInfo::new(&program, "main", &target);
        let plan = LayoutPlan::build(&info, derived).unwrap();
        let mut rec = Recorder::default();
        walk(&plan, &mut rec);
        let members: Vec<&str> = rec.0.iter().skip(17).map(String::as_str).collect();
        assert_eq!(members, vec!["method 0.0", "field 0.0", "method 1.1"]);
        assert_eq!(rec.0[2], "ap");
    }

    #[test]
    fn test_protocols_have_no_metadata() {
        let mut program = Program::new();
        let proto = program.add(NominalDecl::protocol("P", "main"));
        let target = TargetAbi::lookup(Arch::X86_64, ObjectFormat::Elf);
        let info = TypeInfo::new(&program, "main", &target);
        assert!(LayoutPlan::build(&info, proto).is_err());
    }
}
