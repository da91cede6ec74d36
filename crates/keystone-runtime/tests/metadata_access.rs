//! Integration tests: compile declarations, load the image and run the
//! emitted access functions

use keystone_abi::kind::{class_layout, descriptor_layout, vwt};
use keystone_abi::{Image, MetadataKind};
use keystone_ast::{BuiltinType, MethodRef, NominalDecl, Program, Type};
use keystone_irgen::{CompileOptions, Compiler};
use keystone_runtime::{LoadError, Runtime, RuntimeError};
use std::sync::{Arc, Barrier};

fn compile(program: &Program, options: CompileOptions) -> Image {
    Compiler::new(program, "main", options)
        .compile()
        .expect("compile")
        .image
}

fn load(program: &Program) -> Runtime {
    let runtime = Runtime::new().unwrap();
    runtime
        .load(&compile(program, CompileOptions::default()))
        .unwrap();
    runtime
}

fn int(bits: u32) -> Type {
    Type::Builtin(match bits {
        8 => BuiltinType::Int8,
        32 => BuiltinType::Int32,
        _ => BuiltinType::Int64,
    })
}

fn word(rt: &Runtime, address: u64) -> u64 {
    rt.memory().read_word(address).unwrap()
}

/// Offsets from a struct's field offset vector
fn struct_field_offsets(rt: &Runtime, metadata: u64) -> Vec<u64> {
    let descriptor = word(rt, metadata + 8);
    let count = rt
        .memory()
        .read_u32(descriptor + descriptor_layout::NUM_FIELDS as u64)
        .unwrap();
    let vector = rt
        .memory()
        .read_u32(descriptor + descriptor_layout::FIELD_OFFSET_VECTOR as u64)
        .unwrap() as u64;
    (0..count as u64)
        .map(|index| word(rt, metadata + (vector + index) * 8))
        .collect()
}

/// Size and stride from a value witness table
fn value_size(rt: &Runtime, metadata: u64) -> (u64, u64) {
    let table = word(rt, metadata - 8);
    (
        word(rt, table + vwt::SIZE as u64 * 8),
        word(rt, table + vwt::STRIDE as u64 * 8),
    )
}

fn run_threads<T: Send + 'static>(
    threads: usize,
    task: impl Fn() -> T + Send + Sync + 'static,
) -> Vec<T> {
    let barrier = Arc::new(Barrier::new(threads));
    let task = Arc::new(task);
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let barrier = barrier.clone();
            let task = task.clone();
            std::thread::spawn(move || {
                barrier.wait();
                task()
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_constant_struct_accessor_returns_static_record() {
    let mut program = Program::new();
    program.add(
        NominalDecl::structure("Point", "main")
            .with_field("x", int(32))
            .with_field("y", int(64)),
    );
    let rt = load(&program);
    let metadata = rt.invoke_symbol("$s4main5PointVMa", &[]).unwrap();
    assert_eq!(Some(metadata), rt.symbol("$s4main5PointVN"));
    assert_eq!(word(&rt, metadata), MetadataKind::Struct.value());
    assert_eq!(value_size(&rt, metadata), (16, 16));
    assert_eq!(struct_field_offsets(&rt, metadata), vec![0, 8]);
    assert!(rt.describe(metadata).unwrap().contains("main.Point"));
}

#[test]
fn test_singleton_struct_initializes_once_across_threads() {
    let mut program = Program::new();
    let opaque = program.add(
        NominalDecl::structure("Opaque", "lib")
            .resilient()
            .with_field("value", int(64)),
    );
    program.add(
        NominalDecl::structure("Holder", "main")
            .with_field("opaque", Type::nominal(opaque))
            .with_field("flag", int(8)),
    );
    let rt = Arc::new(load(&program));
    let threads = num_cpus::get().clamp(4, 16);
    let results = {
        let rt = rt.clone();
        run_threads(threads, move || rt.invoke_symbol("$s4main6HolderVMa", &[]).unwrap())
    };
    let metadata = results[0];
    assert!(results.iter().all(|m| *m == metadata));
    assert_eq!(rt.stats().once_regions_run, 1);
    assert_eq!(value_size(&rt, metadata), (9, 16));
    assert_eq!(struct_field_offsets(&rt, metadata), vec![0, 8]);
    let cache = rt.symbol("$s4main6HolderVML").unwrap();
    assert_eq!(word(&rt, cache), metadata);
    let token = rt.symbol("$s4main6HolderVMl").unwrap();
    assert_ne!(word(&rt, token), 0);
}

#[test]
fn test_accessor_without_redundant_store_elision() {
    let mut program = Program::new();
    let opaque = program.add(
        NominalDecl::structure("Opaque", "lib")
            .resilient()
            .with_field("value", int(32)),
    );
    program.add(NominalDecl::structure("Holder", "main").with_field("opaque", Type::nominal(opaque)));
    let options = CompileOptions {
        tsan: true,
        skip_redundant_stores: false,
        ..CompileOptions::default()
    };
    let rt = Runtime::new().unwrap();
    rt.load(&compile(&program, options)).unwrap();
    let first = rt.invoke_symbol("$s4main6HolderVMa", &[]).unwrap();
    let second = rt.invoke_symbol("$s4main6HolderVMa", &[]).unwrap();
    assert_eq!(first, second);
    assert_eq!(value_size(&rt, first), (4, 4));
}

#[test]
fn test_generic_instantiation_is_unique_per_arguments() {
    let mut program = Program::new();
    program.add(
        NominalDecl::structure("Box", "main")
            .with_generic_param("T", vec![])
            .with_field("value", Type::GenericParam(0))
            .with_field("count", int(32)),
    );
    let rt = Arc::new(load(&program));
    let int64 = rt.symbol("$sBi64_N").unwrap();
    let int8 = rt.symbol("$sBi8_N").unwrap();

    let results = {
        let rt = rt.clone();
        run_threads(8, move || rt.invoke_symbol("$s4main3BoxVMa", &[int64]).unwrap())
    };
    let box_int64 = results[0];
    assert!(results.iter().all(|m| *m == box_int64));
    assert_eq!(rt.stats().instantiations, 1);

    let box_int8 = rt.invoke_symbol("$s4main3BoxVMa", &[int8]).unwrap();
    assert_ne!(box_int8, box_int64);
    assert_eq!(rt.stats().instantiations, 2);

    assert_eq!(word(&rt, box_int64 + 16), int64);
    assert_eq!(value_size(&rt, box_int64), (12, 16));
    assert_eq!(struct_field_offsets(&rt, box_int64), vec![0, 8]);
    assert_eq!(value_size(&rt, box_int8), (8, 8));
    assert_eq!(struct_field_offsets(&rt, box_int8), vec![0, 4]);
    // Each instance owns its value witness table.
    assert_ne!(word(&rt, box_int64 - 8), word(&rt, box_int8 - 8));
}

#[test]
fn test_instantiation_rejects_wrong_argument_count() {
    let mut program = Program::new();
    program.add(
        NominalDecl::structure("Box", "main")
            .with_generic_param("T", vec![])
            .with_field("value", Type::GenericParam(0)),
    );
    let rt = load(&program);
    let result = rt.invoke_symbol("$s4main3BoxVMa", &[]);
    assert!(matches!(
        result,
        Err(RuntimeError::ArgumentCount {
            expected: 1,
            actual: 0,
            ..
        })
    ));
    // A failed instantiation is retried, not cached.
    let int32 = rt.symbol("$sBi32_N").unwrap();
    assert!(rt.invoke_symbol("$s4main3BoxVMa", &[int32]).is_ok());
}

#[test]
fn test_structural_field_types_are_uniqued() {
    let mut program = Program::new();
    program.add(
        NominalDecl::structure("Pair", "main")
            .with_generic_param("T", vec![])
            .with_field("both", Type::Tuple(vec![Type::GenericParam(0), int(8)])),
    );
    let rt = load(&program);
    let int64 = rt.symbol("$sBi64_N").unwrap();
    let pair = rt.invoke_symbol("$s4main4PairVMa", &[int64]).unwrap();
    let fields = rt.field_types_of(pair).unwrap();
    assert_eq!(fields.len(), 1);
    let tuple = fields[0].metadata;
    assert_eq!(word(&rt, tuple), MetadataKind::Tuple.value());
    assert_eq!(rt.tuple_metadata(&[int64, rt.symbol("$sBi8_N").unwrap()]).unwrap(), tuple);
    assert_eq!(value_size(&rt, pair), (9, 16));
}

#[test]
fn test_class_with_resilient_superclass_is_completed() {
    let mut program = Program::new();
    let base = program.add(
        NominalDecl::class("Base", "lib")
            .resilient()
            .with_method("draw")
            .with_field("a", int(64)),
    );
    program.add(
        NominalDecl::class("Shape", "main")
            .with_superclass(Type::nominal(base))
            .with_override("draw", MethodRef { class: base, index: 0 })
            .with_field("b", int(8)),
    );
    let rt = load(&program);
    let shape = rt.invoke_symbol("$s4main5ShapeCMa", &[]).unwrap();
    let base = rt.invoke_symbol("$s3lib4BaseCMa", &[]).unwrap();

    assert_eq!(word(&rt, shape + class_layout::SUPERCLASS as u64), base);
    let instance_size = rt
        .memory()
        .read_u32(shape + class_layout::INSTANCE_SIZE as u64)
        .unwrap();
    assert_eq!(instance_size, 25);
    let b_offset = rt.symbol("$s4main5ShapeC1bWv").unwrap();
    assert_eq!(word(&rt, b_offset), 24);
    assert_eq!(
        word(&rt, shape + class_layout::MEMBERS as u64),
        rt.symbol("$s4main5ShapeC4drawF").unwrap()
    );
    assert_eq!(
        word(&rt, base + class_layout::MEMBERS as u64),
        rt.symbol("$s3lib4BaseC4drawF").unwrap()
    );

    let object = rt.allocate_object(shape).unwrap();
    assert_eq!(rt.object_metadata(object).unwrap(), shape);
    assert_eq!(rt.call_method(shape, class_layout::MEMBERS as i32), Ok(0));
}

#[test]
fn test_deleted_method_traps() {
    let mut program = Program::new();
    program.add(
        NominalDecl::class("Widget", "main")
            .with_method("run")
            .with_dead_method("unused"),
    );
    let rt = load(&program);
    let class = rt.invoke_symbol("$s4main6WidgetCMa", &[]).unwrap();
    let slot = class_layout::MEMBERS as i32 + 8;
    let trap = rt.symbol(keystone_abi::symbols::DELETED_METHOD_ERROR).unwrap();
    assert_eq!(
        rt.call_method(class, slot),
        Err(RuntimeError::DeletedMethod { function: trap })
    );
    assert!(rt.call_method(class, class_layout::MEMBERS as i32).is_ok());
}

#[test]
fn test_recursive_generic_class_sees_partial_metadata() {
    let mut program = Program::new();
    let node = program.next_id();
    program.add(
        NominalDecl::class("Node", "main")
            .with_generic_param("T", vec![])
            .with_field("value", Type::GenericParam(0))
            .with_field("next", Type::bound(node, vec![Type::GenericParam(0)])),
    );
    let rt = load(&program);
    let int64 = rt.symbol("$sBi64_N").unwrap();
    let metadata = rt.invoke_symbol("$s4main4NodeCMa", &[int64]).unwrap();
    let fields = rt.field_types_of(metadata).unwrap();
    assert_eq!(fields[0].metadata, int64);
    assert_eq!(fields[1].metadata, metadata);
    let size = rt
        .memory()
        .read_u32(metadata + class_layout::INSTANCE_SIZE as u64)
        .unwrap();
    assert_eq!(size, 32);
    assert_eq!(rt.invoke_symbol("$s4main4NodeCMa", &[int64]).unwrap(), metadata);
}

#[test]
fn test_field_type_vector_published_once() {
    let mut program = Program::new();
    program.add(
        NominalDecl::class("Holder", "main")
            .with_field("a", int(32))
            .with_weak_field("b", Type::Builtin(BuiltinType::NativeObject)),
    );
    let rt = Arc::new(load(&program));
    let class = rt.invoke_symbol("$s4main6HolderCMa", &[]).unwrap();
    let results = {
        let rt = rt.clone();
        run_threads(8, move || rt.field_types_of(class).unwrap())
    };
    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(!results[0][0].is_reference());
    assert!(results[0][1].is_reference());
    let cache = rt.symbol("$s4main6HolderCMV").unwrap();
    assert_ne!(word(&rt, cache), 0);
    assert!(rt.stats().freed_field_vectors < 8);
}

#[test]
fn test_foreign_metadata_is_unique_across_images() {
    let mut program = Program::new();
    program.add(NominalDecl::class("Handle", "ext").foreign());
    let image = compile(&program, CompileOptions::default());
    let rt = Runtime::new().unwrap();
    let first = rt.load(&image).unwrap();
    let second = rt.load(&image).unwrap();

    let accessor = "$s3ext6HandleCMa";
    let from_first = rt.invoke(first.symbol(accessor).unwrap(), &[]).unwrap();
    let from_second = rt.invoke(second.symbol(accessor).unwrap(), &[]).unwrap();
    assert_eq!(from_first, from_second);
    assert_eq!(from_first, first.symbol("$s3ext6HandleCN").unwrap());
    assert_eq!(word(&rt, from_first), MetadataKind::ForeignClass.value());
    assert_eq!(rt.stats().foreign_registrations, 1);
}

#[test]
fn test_foreign_accessor_race_publishes_one_record() {
    let mut program = Program::new();
    program.add(NominalDecl::class("Handle", "ext").foreign());
    let rt = Arc::new(load(&program));
    let threads = num_cpus::get().clamp(4, 16);
    let results = {
        let rt = rt.clone();
        run_threads(threads, move || rt.invoke_symbol("$s3ext6HandleCMa", &[]).unwrap())
    };
    let metadata = results[0];
    assert!(results.iter().all(|m| *m == metadata));
    assert_eq!(Some(metadata), rt.symbol("$s3ext6HandleCN"));

    let cache = rt.symbol("$s3ext6HandleCML").unwrap();
    assert_eq!(word(&rt, cache), metadata);
    assert_eq!(rt.stats().foreign_registrations, 1);
    assert_eq!(rt.stats().once_regions_run, 0);
    assert_eq!(rt.invoke_symbol("$s3ext6HandleCMa", &[]).unwrap(), metadata);
}

#[test]
fn test_existential_containers() {
    let mut program = Program::new();
    program.add(NominalDecl::class("Item", "main").with_field("id", int(64)));
    let rt = load(&program);
    let class = rt.invoke_symbol("$s4main4ItemCMa", &[]).unwrap();
    let object = rt.allocate_object(class).unwrap();
    let container = rt.make_class_existential(object, &[0x40]).unwrap();
    assert_eq!(word(&rt, container), object);
    assert_eq!(word(&rt, container + 8), 0x40);

    let int32 = rt.symbol("$sBi32_N").unwrap();
    let opaque = rt.make_existential(int32, &42u32.to_le_bytes(), &[]).unwrap();
    assert_eq!(word(&rt, opaque + 24), int32);
}

#[test]
fn test_image_for_other_pointer_width_is_rejected() {
    let image = Image::new("narrow", 4);
    let rt = Runtime::new().unwrap();
    assert!(matches!(
        rt.load(&image),
        Err(LoadError::PointerSize { pointer_size: 4, expected: 8, .. })
    ));
}
