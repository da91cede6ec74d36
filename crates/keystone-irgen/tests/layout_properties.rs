//! Properties of compiled metadata layouts over generated declaration graphs

use keystone_abi::opcode::decode_program;
use keystone_abi::{AccessOp, Image};
use keystone_ast::{BuiltinType, NominalDecl, Program, Type};
use keystone_irgen::{Compilation, CompileOptions, Compiler, MetadataLayout, SlotName};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

fn field_type(code: u8) -> Type {
    Type::Builtin(match code % 4 {
        0 => BuiltinType::Int8,
        1 => BuiltinType::Int32,
        2 => BuiltinType::Int64,
        _ => BuiltinType::NativeObject,
    })
}

/// Shape of one class in a generated chain: field type codes and method count
#[derive(Debug, Clone)]
struct ClassShape {
    fields: Vec<u8>,
    methods: usize,
}

fn class_shape() -> impl Strategy<Value = ClassShape> {
    (prop::collection::vec(any::<u8>(), 0..4), 0usize..4)
        .prop_map(|(fields, methods)| ClassShape { fields, methods })
}

fn class_chain(shapes: &[ClassShape]) -> Program {
    let mut program = Program::new();
    let mut parent = None;
    for (level, shape) in shapes.iter().enumerate() {
        let mut decl = NominalDecl::class(format!("Level{}", level), "main");
        for (index, code) in shape.fields.iter().enumerate() {
            decl = decl.with_field(format!("f{}", index), field_type(*code));
        }
        for index in 0..shape.methods {
            decl = decl.with_method(format!("m{}_{}", level, index));
        }
        if let Some(parent) = parent {
            decl = decl.with_superclass(Type::nominal(parent));
        }
        parent = Some(program.add(decl));
    }
    program
}

fn compile(program: &Program) -> Compilation {
    Compiler::new(program, "main", CompileOptions::default())
        .compile()
        .unwrap()
}

fn layout_named<'a>(compilation: &'a Compilation, name: &str) -> &'a Arc<MetadataLayout> {
    compilation
        .layouts
        .iter()
        .find(|layout| layout.name == name)
        .unwrap()
}

fn fill_offsets(image: &Image, function: &str) -> BTreeSet<i32> {
    let bytes = image.flatten();
    let start = image.symbol_offset(function).unwrap();
    decode_program(&bytes[start as usize..], start)
        .unwrap()
        .into_iter()
        .filter_map(|op| match op {
            AccessOp::Fill { offset, .. } => Some(offset),
            _ => None,
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn subclass_layout_extends_superclass(shapes in prop::collection::vec(class_shape(), 2..5)) {
        let compilation = compile(&class_chain(&shapes));
        for level in 1..shapes.len() {
            let parent = layout_named(&compilation, &format!("Level{}", level - 1));
            let child = layout_named(&compilation, &format!("Level{}", level));
            prop_assert_eq!(parent.address_point, child.address_point);
            prop_assert!(child.total_size >= parent.total_size);
            for slot in &parent.slots {
                let inherited = child.slot(slot.name);
                prop_assert!(inherited.is_some(), "{} missing from subclass", slot.name);
                let inherited = inherited.unwrap();
                prop_assert_eq!(inherited.position, slot.position);
                prop_assert_eq!(inherited.offset, slot.offset);
            }
        }
    }

    #[test]
    fn address_point_lies_inside_every_record(shapes in prop::collection::vec(class_shape(), 1..4)) {
        let compilation = compile(&class_chain(&shapes));
        for layout in &compilation.layouts {
            prop_assert!(layout.address_point < layout.total_size);
            for slot in &layout.slots {
                let absolute = layout.absolute(slot.position);
                prop_assert!(absolute + slot.size as u32 <= layout.total_size);
                prop_assert_eq!(absolute as i32 - layout.address_point as i32, slot.position);
            }
        }
    }

    #[test]
    fn fills_cover_exactly_the_generic_slots(
        requirements in prop::collection::vec(0usize..3, 1..4),
        field_codes in prop::collection::vec(any::<u8>(), 0..3),
    ) {
        let mut program = Program::new();
        let protocols: Vec<_> = (0..2)
            .map(|index| program.add(NominalDecl::protocol(format!("P{}", index), "main")))
            .collect();
        let mut bag = NominalDecl::structure("Bag", "main");
        for (index, count) in requirements.iter().enumerate() {
            bag = bag.with_generic_param(format!("T{}", index), protocols[..*count].to_vec());
            bag = bag.with_field(format!("item{}", index), Type::GenericParam(index as u32));
        }
        for (index, code) in field_codes.iter().enumerate() {
            bag = bag.with_field(format!("extra{}", index), field_type(*code));
        }
        program.add(bag);

        let compilation = compile(&program);
        let layout = layout_named(&compilation, "Bag");
        let generic: BTreeSet<i32> = layout
            .slots
            .iter()
            .filter(|slot| slot.name.is_generic_requirement())
            .map(|slot| slot.offset.as_static().unwrap())
            .collect();
        let expected = requirements.len() + requirements.iter().sum::<usize>();
        prop_assert_eq!(generic.len(), expected);
        prop_assert_eq!(fill_offsets(&compilation.image, "$s4main3BagVMi"), generic);
    }
}

#[test]
fn generic_subclass_fills_only_its_own_arguments() {
    let mut program = Program::new();
    let base = program.add(NominalDecl::class("Base", "main").with_generic_param("T", vec![]));
    program.add(
        NominalDecl::class("Derived", "main")
            .with_generic_param("U", vec![])
            .with_superclass(Type::bound(base, vec![Type::GenericParam(0)])),
    );
    let compilation = compile(&program);
    let derived = layout_named(&compilation, "Derived");
    let own: BTreeSet<i32> = derived
        .generic_slots()
        .iter()
        .map(|slot| slot.position)
        .collect();
    assert_eq!(own.len(), 1);
    assert_eq!(fill_offsets(&compilation.image, "$s4main7DerivedCMi"), own);
    let inherited = derived
        .slots
        .iter()
        .filter(|slot| matches!(slot.name, SlotName::GenericArgument { owner, .. } if owner == base))
        .count();
    assert_eq!(inherited, 1);
}

#[test]
fn names_are_identical_across_compilations() {
    let shapes = vec![
        ClassShape { fields: vec![1, 2], methods: 2 },
        ClassShape { fields: vec![3], methods: 1 },
    ];
    let first = compile(&class_chain(&shapes));
    let second = compile(&class_chain(&shapes));
    assert_eq!(first.symbols, second.symbols);
    assert_eq!(first.image, second.image);
    assert!(first.symbols.iter().any(|s| s == "$s4main6Level1CMa"));
}

#[test]
fn linked_image_survives_encoding() {
    let mut program = Program::new();
    program.add(
        NominalDecl::structure("Point", "main")
            .with_field("x", Type::Builtin(BuiltinType::Int32))
            .with_field("y", Type::Builtin(BuiltinType::Bool)),
    );
    let compilation = compile(&program);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("point.ksim");
    compilation.image.write_to_file(&path).unwrap();
    let decoded = Image::read_from_file(&path).unwrap();
    assert_eq!(decoded, compilation.image);
    for section in ["fieldmd", "typeref", "reflstr", "builtin"] {
        assert!(decoded.section(section).is_some(), "missing {}", section);
    }
}
