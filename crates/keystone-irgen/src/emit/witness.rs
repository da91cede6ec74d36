//! Protocol witness tables

use super::protocol::{requirements, Requirement};
use super::{define_program, method_stub};
use crate::blob::{ConstantBlob, SectionKind};
use crate::context::CompilationContext;
use crate::diagnostic::{Diagnostic, MISSING_WITNESS};
use crate::error::IrGenResult;
use crate::naming::DeclNames;
use crate::recipe::type_recipe;
use keystone_abi::{AccessOp, TypeRecipe};
use keystone_ast::{DeclId, DeclKind, NominalDecl};
use tracing::debug;

/// Most-derived live method named `name` visible from `id`
fn find_method<'a>(
    cx: &CompilationContext<'a>,
    id: DeclId,
    name: &str,
) -> IrGenResult<Option<&'a NominalDecl>> {
    let decl = cx.decl(id)?;
    let candidates = if decl.kind == DeclKind::Class {
        cx.program.class_hierarchy(id)
    } else {
        vec![id]
    };
    for candidate in candidates.into_iter().rev() {
        let owner = cx.decl(candidate)?;
        if owner.methods.iter().any(|m| m.name == name && !m.dead) {
            return Ok(Some(owner));
        }
    }
    Ok(None)
}

fn associated_type_witness(
    cx: &mut CompilationContext<'_>,
    id: DeclId,
    index: usize,
    protocol: &NominalDecl,
    name: &str,
) -> IrGenResult<String> {
    let decl = cx.decl(id)?;
    let names = DeclNames::new(decl);
    let conformance = &decl.conformances[index];
    let witness = conformance
        .associated_types
        .iter()
        .find(|(assoc, _)| assoc == name)
        .map(|(_, ty)| ty);
    let recipe = match witness {
        Some(ty) => type_recipe(cx, ty, Some(id))?,
        None => {
            cx.diagnose(
                Diagnostic::error(format!(
                    "{} does not name associated type {} of {}",
                    decl.name, name, protocol.name
                ))
                .with_code(MISSING_WITNESS)
                .with_span(decl.span, "conformance declared here")
                .with_note("the empty tuple was substituted"),
            );
            TypeRecipe::Tuple(Vec::new())
        }
    };
    let symbol = names.associated_type_witness(protocol, name);
    define_program(
        cx,
        symbol.clone(),
        &[AccessOp::Materialize(recipe), AccessOp::Return],
    )?;
    Ok(symbol)
}

fn method_witness(
    cx: &mut CompilationContext<'_>,
    id: DeclId,
    protocol: &NominalDecl,
    name: &str,
    has_default: bool,
) -> IrGenResult<String> {
    if let Some(owner) = find_method(cx, id, name)? {
        return Ok(DeclNames::new(owner).method(name));
    }
    if has_default {
        return Ok(DeclNames::new(protocol).method(name));
    }
    let decl = cx.decl(id)?;
    cx.diagnose(
        Diagnostic::warning(format!(
            "{} has no implementation of {}.{}",
            decl.name, protocol.name, name
        ))
        .with_span(decl.span, "conformance declared here")
        .with_note("an empty implementation was synthesized"),
    );
    method_stub(cx, DeclNames::new(decl).method(name), false)
}

/// Witness table for conformance `index` of `id`
pub(super) fn emit_witness_table(
    cx: &mut CompilationContext<'_>,
    id: DeclId,
    index: usize,
) -> IrGenResult<()> {
    let decl = cx.decl(id)?;
    let protocol = cx.decl(decl.conformances[index].protocol)?;
    let names = DeclNames::new(decl);
    let mut blob = ConstantBlob::new(cx.pointer_size());
    blob.emit_address(DeclNames::new(protocol).protocol_descriptor());
    for requirement in requirements(protocol) {
        let entry = match requirement {
            Requirement::AssociatedType(name) => {
                associated_type_witness(cx, id, index, protocol, name)?
            }
            Requirement::Method { name, has_default } => {
                method_witness(cx, id, protocol, name, has_default)?
            }
        };
        blob.emit_address(entry);
    }
    debug!(
        conformer = %decl.name,
        protocol = %protocol.name,
        entries = blob.len() / cx.pointer_size() as usize,
        "witness table"
    );
    cx.symbols
        .define(names.witness_table(protocol), SectionKind::Data, blob)
}

#[cfg(test)]
mod tests {
    use crate::context::{CompilationContext, CompileOptions};
    use crate::diagnostic::MISSING_WITNESS;
    use crate::emit::{emit_conformances, emit_decl};
    use keystone_abi::opcode::decode_program;
    use keystone_abi::{AccessOp, TypeRecipe};
    use keystone_ast::{BuiltinType, NominalDecl, Program, Type};

    fn compile(program: &Program) -> CompilationContext<'_> {
        let mut cx = CompilationContext::new(program, "main", CompileOptions::default()).unwrap();
        for (id, _) in program.iter() {
            emit_decl(&mut cx, id).unwrap();
        }
        for (id, _) in program.iter() {
            emit_conformances(&mut cx, id).unwrap();
        }
        cx
    }

    fn entries(cx: &CompilationContext<'_>, symbol: &str) -> Vec<String> {
        let (def, _) = cx.symbols.lookup(symbol).unwrap();
        def.blob
            .fixups()
            .iter()
            .map(|f| f.target().to_string())
            .collect()
    }

    #[test]
    fn test_table_follows_requirement_order() {
        let mut program = Program::new();
        let sequence = program.add(
            NominalDecl::protocol("Sequence", "main")
                .with_requirement("next", false)
                .with_associated_type("Element")
                .with_requirement("count", true),
        );
        program.add(
            NominalDecl::structure("Range", "main")
                .with_method("next")
                .with_conformance(
                    sequence,
                    vec![("Element".to_string(), Type::Builtin(BuiltinType::Int64))],
                ),
        );
        let cx = compile(&program);
        assert_eq!(
            entries(&cx, "$s4main5RangeV4main8SequencePWP"),
            vec![
                "$s4main8SequencePMp",
                "$s4main5RangeV4main8SequenceP7ElementWt",
                "$s4main5RangeV4nextF",
                "$s4main8SequenceP5countF",
            ]
        );
        let (wt, _) = cx
            .symbols
            .lookup("$s4main5RangeV4main8SequenceP7ElementWt")
            .unwrap();
        let ops = decode_program(wt.blob.bytes(), 0).unwrap();
        assert!(matches!(ops[0], AccessOp::Materialize(TypeRecipe::Indirect(_))));
        assert!(cx.diagnostics.is_empty());
    }

    #[test]
    fn test_subclass_inherits_witnesses() {
        let mut program = Program::new();
        let drawable = program.add(NominalDecl::protocol("Drawable", "main").with_requirement("draw", false));
        let base = program.add(NominalDecl::class("Base", "main").with_method("draw"));
        program.add(
            NominalDecl::class("Leaf", "main")
                .with_superclass(Type::nominal(base))
                .with_conformance(drawable, vec![]),
        );
        let cx = compile(&program);
        let table = entries(&cx, "$s4main4LeafC4main8DrawablePWP");
        assert_eq!(table[1], "$s4main4BaseC4drawF");
    }

    #[test]
    fn test_missing_associated_type_is_diagnosed() {
        let mut program = Program::new();
        let container = program.add(NominalDecl::protocol("Container", "main").with_associated_type("Item"));
        program.add(NominalDecl::structure("Bag", "main").with_conformance(container, vec![]));
        let cx = compile(&program);
        assert_eq!(cx.diagnostics.len(), 1);
        assert_eq!(cx.diagnostics[0].code, Some(MISSING_WITNESS));
        let (wt, _) = cx.symbols.lookup("$s4main3BagV4main9ContainerP4ItemWt").unwrap();
        let ops = decode_program(wt.blob.bytes(), 0).unwrap();
        assert_eq!(ops[0], AccessOp::Materialize(TypeRecipe::Tuple(Vec::new())));
    }
}
