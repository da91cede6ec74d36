//! End-to-end tests of the `keystone` binary

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const MANIFEST: &str = r#"
[module]
name = "main"

[[types]]
name = "Point"
kind = "struct"
fields = [{ name = "x", type = "Int32" }, { name = "y", type = "Bool" }]

[[types]]
name = "Item"
kind = "class"
fields = [{ name = "id", type = "Int64" }]

[[types]]
name = "Direction"
kind = "enum"
cases = [{ name = "north" }, { name = "south" }]
"#;

fn keystone(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_keystone"))
        .args(["--color", "never"])
        .args(args)
        .env_remove("KEYSTONE_LOG")
        .output()
        .expect("run keystone")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn write_manifest(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("types.toml");
    std::fs::write(&path, text).unwrap();
    path
}

/// Manifest compiled to `image.ksi` in `dir`
fn emit_image(dir: &Path) -> PathBuf {
    let manifest = write_manifest(dir, MANIFEST);
    let image = dir.join("image.ksi");
    let output = keystone(&[
        "emit",
        manifest.to_str().unwrap(),
        "-o",
        image.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    image
}

#[test]
fn test_symbols_lists_accessors() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(dir.path(), MANIFEST);
    let output = keystone(&["symbols", manifest.to_str().unwrap()]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.lines().any(|line| line == "$s4main5PointVMa"));
    assert!(text.lines().any(|line| line == "$s4main4ItemCMa"));
}

#[test]
fn test_layout_json_for_one_type() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(dir.path(), MANIFEST);
    let output = keystone(&["layout", manifest.to_str().unwrap(), "--type", "Point", "--json"]);
    assert!(output.status.success());
    let layouts: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let layouts = layouts.as_array().unwrap();
    assert_eq!(layouts.len(), 1);
    assert_eq!(layouts[0]["name"], "Point");

    let missing = keystone(&["layout", manifest.to_str().unwrap(), "--type", "Ghost"]);
    assert!(!missing.status.success());
}

#[test]
fn test_emit_then_inspect() {
    let dir = tempfile::tempdir().unwrap();
    let image = emit_image(dir.path());
    let output = keystone(&["inspect", image.to_str().unwrap()]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("image main"));
    assert!(text.contains("field descriptors"));
    assert!(text.contains("x: Builtin.Int32"));

    let json = keystone(&["inspect", image.to_str().unwrap(), "--json"]);
    let summary: serde_json::Value = serde_json::from_slice(&json.stdout).unwrap();
    assert_eq!(summary["module"], "main");
    assert!(summary["symbols"].as_array().unwrap().len() > 3);
}

#[test]
fn test_bad_manifest_fails_with_diagnostic() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(
        dir.path(),
        "[module]\nname = \"main\"\n\n[[types]]\nname = \"Bad\"\nkind = \"struct\"\nfields = [{ name = \"x\", type = \"Nope\" }]\n",
    );
    let output = keystone(&["symbols", manifest.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Nope"));
}

#[test]
fn test_demangle_arguments() {
    let output = keystone(&["demangle", "$s4main5PointVN", "notmangled"]);
    assert!(output.status.success());
    let text = stdout(&output);
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("main.Point"));
    assert_eq!(lines[1], "notmangled");
}

#[test]
fn test_reflect_class_instance_over_pipes() {
    let dir = tempfile::tempdir().unwrap();
    let image = emit_image(dir.path());
    let output = keystone(&["reflect-test", image.to_str().unwrap(), "--type", "Item"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let text = stdout(&output);
    assert!(text.contains("(class main.Item)"));
    assert!(text.contains("(class_instance size=24"));
    assert!(text.contains("(field name=id offset=16"));
}

#[test]
fn test_reflect_struct_in_existential() {
    let dir = tempfile::tempdir().unwrap();
    let image = emit_image(dir.path());
    let output = keystone(&["reflect-test", image.to_str().unwrap(), "--type", "Point"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let text = stdout(&output);
    assert!(text.contains("start address"));
    assert!(text.contains("(struct main.Point)"));
    assert!(text.contains("(struct size=5 alignment=4 stride=8"));
    assert!(text.contains("(field name=y offset=4"));
}

#[test]
fn test_reflect_unknown_type_fails() {
    let dir = tempfile::tempdir().unwrap();
    let image = emit_image(dir.path());
    let output = keystone(&["reflect-test", image.to_str().unwrap(), "--type", "Ghost"]);
    assert!(!output.status.success());
}
