//! Integration tests for manifest loading

use keystone_ast::{BuiltinType, DeclKind, Manifest, ManifestError, Type, ValidationError};
use std::io::Write;

#[test]
fn test_load_manifest_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[module]
name = "Zoo"

[target]
arch = "arm64"
format = "macho"

[options]
tsan = true

[[types]]
name = "Option"
kind = "enum"
generic = ["T"]
cases = [{{ name = "some", payload = "T" }}, {{ name = "none" }}]

[[types]]
name = "Cage"
kind = "struct"
fields = [{{ name = "occupant", type = "Option<Int32>" }}, {{ name = "open", type = "Bool" }}]
"#
    )
    .unwrap();

    let manifest = Manifest::from_file(file.path()).unwrap();
    assert_eq!(manifest.target.arch, "arm64");
    assert_eq!(manifest.target.format, "macho");
    assert!(manifest.options.tsan);

    let program = manifest.build_program().unwrap();
    let option = program.lookup("Zoo", "Option").unwrap();
    let cage = program.get(program.lookup("Zoo", "Cage").unwrap()).unwrap();
    assert_eq!(cage.kind, DeclKind::Struct);
    assert_eq!(
        cage.fields[0].ty,
        Type::bound(option, vec![Type::Builtin(BuiltinType::Int32)])
    );
    assert_eq!(program.get(option).unwrap().cases[1].payload, None);
}

#[test]
fn test_generic_argument_count_is_validated() {
    let source = r#"
[module]
name = "Zoo"

[[types]]
name = "Box"
kind = "struct"
generic = ["T"]
fields = [{ name = "value", type = "T" }]

[[types]]
name = "Crate"
kind = "struct"
fields = [{ name = "inner", type = "Box<Int32, Bool>" }]
"#;
    let err = Manifest::parse(source).unwrap().build_program().unwrap_err();
    assert!(matches!(
        err,
        ManifestError::Validation(ValidationError::GenericArgCount {
            expected: 1,
            found: 2,
            ..
        })
    ));
}

#[test]
fn test_missing_module_section_is_rejected() {
    let err = Manifest::parse("[[types]]\nname = \"A\"\nkind = \"struct\"\n").unwrap_err();
    assert!(matches!(err, ManifestError::ParseError(_)));
}
