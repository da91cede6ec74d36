//! Lowering types to metadata recipes
//!
//! A recipe tells the runtime how to produce the metadata for a type that
//! appears inside some declaration: a field type, a superclass, an associated
//! type witness. Generic parameters of the enclosing declaration are read
//! from its metadata, which the runtime passes as the context.

use crate::access::{strategy, AccessStrategy};
use crate::blob::{ConstantBlob, SectionKind};
use crate::context::CompilationContext;
use crate::diagnostic::Diagnostic;
use crate::error::{IrGenError, IrGenResult, LayoutError};
use crate::layout::{SlotName, StoredOffset};
use crate::naming::{builtin_code, indirection_cell, DeclNames};
use keystone_abi::symbols::builtin_metadata;
use keystone_abi::TypeRecipe;
use keystone_ast::{DeclId, DeclKind, Type};

pub type Recipe = TypeRecipe<String>;

/// Word bound to a runtime-provided symbol, defined on first use
pub fn indirection(cx: &mut CompilationContext<'_>, symbol: &str) -> IrGenResult<String> {
    let name = indirection_cell(symbol);
    if !cx.symbols.contains(&name) {
        let mut blob = ConstantBlob::new(cx.pointer_size());
        blob.emit_address(symbol);
        cx.symbols.define(name.clone(), SectionKind::Data, blob)?;
    }
    Ok(name)
}

fn generic_slot(
    cx: &mut CompilationContext<'_>,
    context: Option<DeclId>,
    slot: impl Fn(DeclId) -> SlotName,
    index: u32,
) -> IrGenResult<i32> {
    let owner = context.ok_or(LayoutError::NoGenericContext { index })?;
    let layout = cx.layout(owner)?;
    let info = layout.slot(slot(owner)).copied().ok_or_else(|| LayoutError::SlotNotFound {
        decl: layout.name.clone(),
        slot: slot(owner).to_string(),
    })?;
    if let StoredOffset::Dynamic { .. } = info.offset {
        let span = cx.decl(owner)?.span;
        cx.diagnose(
            Diagnostic::unimplemented("generic class with resilient ancestry")
                .with_span(span, "declared here"),
        );
    }
    Ok(info.position)
}

/// Recipe for the metadata of `ty` as written inside `context`
pub fn type_recipe(
    cx: &mut CompilationContext<'_>,
    ty: &Type,
    context: Option<DeclId>,
) -> IrGenResult<Recipe> {
    Ok(match ty {
        Type::Builtin(b) => {
            let cell = indirection(cx, &builtin_metadata(builtin_code(*b)))?;
            TypeRecipe::Indirect(cell)
        }
        Type::GenericParam(index) => {
            let index = *index;
            let offset = generic_slot(
                cx,
                context,
                |owner| SlotName::GenericArgument { owner, index },
                index,
            )?;
            TypeRecipe::GenericArgument(offset)
        }
        Type::Nominal { decl, args } => {
            let d = cx.decl(*decl)?;
            let names = DeclNames::new(d);
            if d.kind == DeclKind::Protocol {
                return existential(cx, &[*decl]);
            }
            if args.is_empty() {
                match strategy(&cx.types(), *decl) {
                    AccessStrategy::Constant => TypeRecipe::Metadata(names.metadata()),
                    _ => TypeRecipe::Accessor(names.accessor()),
                }
            } else {
                let mut lowered = Vec::with_capacity(args.len() + d.num_generic_witnesses());
                for arg in args {
                    lowered.push(type_recipe(cx, arg, context)?);
                }
                for (param, p) in d.generic_params.iter().enumerate() {
                    let arg = args.get(param).cloned().unwrap_or(Type::Tuple(Vec::new()));
                    for protocol in &p.requirements {
                        lowered.push(witness_recipe(cx, &arg, *protocol, context)?);
                    }
                }
                TypeRecipe::Instantiate {
                    accessor: names.accessor(),
                    args: lowered,
                }
            }
        }
        Type::Tuple(elements) => {
            let mut lowered = Vec::with_capacity(elements.len());
            for element in elements {
                lowered.push(type_recipe(cx, element, context)?);
            }
            TypeRecipe::Tuple(lowered)
        }
        Type::Function { params, result } => {
            if ty.has_type_parameter() {
                let span = context.and_then(|c| cx.program.get(c)).and_then(|d| d.span);
                cx.diagnose(
                    Diagnostic::unimplemented("metadata for generic function types")
                        .with_span(span, "used here")
                        .with_note("an empty tuple was substituted"),
                );
                return Ok(TypeRecipe::Tuple(Vec::new()));
            }
            let mut lowered = Vec::with_capacity(params.len());
            for param in params {
                lowered.push(type_recipe(cx, param, context)?);
            }
            TypeRecipe::Function {
                params: lowered,
                result: Box::new(type_recipe(cx, result, context)?),
            }
        }
        Type::Existential(protocols) => existential(cx, protocols)?,
        Type::Metatype(instance) => {
            TypeRecipe::Metatype(Box::new(type_recipe(cx, instance, context)?))
        }
    })
}

fn existential(cx: &mut CompilationContext<'_>, protocols: &[DeclId]) -> IrGenResult<Recipe> {
    let mut descriptors = Vec::with_capacity(protocols.len());
    for protocol in protocols {
        descriptors.push(DeclNames::new(cx.decl(*protocol)?).protocol_descriptor());
    }
    Ok(TypeRecipe::Existential {
        protocols: descriptors,
        class_bound: cx.types().is_class_bound(protocols),
    })
}

/// Declaration whose conformance list covers `ty`, searching superclasses
fn conforming_decl(cx: &CompilationContext<'_>, decl: DeclId, protocol: DeclId) -> Option<DeclId> {
    cx.program
        .class_hierarchy(decl)
        .into_iter()
        .rev()
        .find(|id| {
            cx.program
                .get(*id)
                .is_some_and(|d| d.conformances.iter().any(|c| c.protocol == protocol))
        })
}

/// Recipe for the witness table of `ty`'s conformance to `protocol`
pub fn witness_recipe(
    cx: &mut CompilationContext<'_>,
    ty: &Type,
    protocol: DeclId,
    context: Option<DeclId>,
) -> IrGenResult<Recipe> {
    let missing = |cx: &CompilationContext<'_>| IrGenError::MissingConformance {
        ty: cx.program.display_type(ty, context),
        protocol: cx
            .program
            .get(protocol)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| format!("#{}", protocol.0)),
    };
    match ty {
        Type::GenericParam(param) => {
            let param = *param;
            let owner = context.ok_or(LayoutError::NoGenericContext { index: param })?;
            let required = cx
                .decl(owner)?
                .generic_params
                .get(param as usize)
                .is_some_and(|p| p.requirements.contains(&protocol));
            if !required {
                return Err(missing(cx));
            }
            let offset = generic_slot(
                cx,
                context,
                |owner| SlotName::GenericWitness {
                    owner,
                    param,
                    protocol,
                },
                param,
            )?;
            Ok(TypeRecipe::GenericArgument(offset))
        }
        Type::Nominal { decl, .. } => {
            let Some(conformer) = conforming_decl(cx, *decl, protocol) else {
                return Err(missing(cx));
            };
            let names = DeclNames::new(cx.decl(conformer)?);
            Ok(TypeRecipe::WitnessTable(names.witness_table(cx.decl(protocol)?)))
        }
        _ => Err(missing(cx)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CompileOptions;
    use keystone_ast::{BuiltinType, NominalDecl, Program};

    fn context(program: &Program) -> CompilationContext<'_> {
        CompilationContext::new(program, "main", CompileOptions::default()).unwrap()
    }

    #[test]
    fn test_builtin_goes_through_indirection_cell() {
        let program = Program::new();
        let mut cx = context(&program);
        let recipe = type_recipe(&mut cx, &Type::Builtin(BuiltinType::Int32), None).unwrap();
        assert_eq!(recipe, TypeRecipe::Indirect(".Lgot.$sBi32_N".to_string()));
        type_recipe(&mut cx, &Type::Builtin(BuiltinType::Int32), None).unwrap();
        assert_eq!(cx.symbols.len(), 1);
    }

    #[test]
    fn test_generic_argument_reads_context_slot() {
        let mut program = Program::new();
        let hashable = program.add(NominalDecl::protocol("Hashable", "main"));
        let int = program.add(
            NominalDecl::structure("Int", "main")
                .with_field("value", Type::Builtin(BuiltinType::Int64))
                .with_conformance(hashable, vec![]),
        );
        let dict = program.add(
            NominalDecl::structure("Set", "main").with_generic_param("Element", vec![hashable]),
        );
        let mut cx = context(&program);
        let arg = type_recipe(&mut cx, &Type::GenericParam(0), Some(dict)).unwrap();
        assert_eq!(arg, TypeRecipe::GenericArgument(16));
        let witness = witness_recipe(&mut cx, &Type::GenericParam(0), hashable, Some(dict)).unwrap();
        assert_eq!(witness, TypeRecipe::GenericArgument(24));

        let bound = type_recipe(&mut cx, &Type::bound(dict, vec![Type::nominal(int)]), None).unwrap();
        assert_eq!(
            bound,
            TypeRecipe::Instantiate {
                accessor: "$s4main3SetVMa".to_string(),
                args: vec![
                    TypeRecipe::Metadata("$s4main3IntVN".to_string()),
                    TypeRecipe::WitnessTable("$s4main3IntV4main8HashablePWP".to_string()),
                ],
            }
        );
        assert!(matches!(
            type_recipe(&mut cx, &Type::GenericParam(0), None),
            Err(IrGenError::Layout(LayoutError::NoGenericContext { index: 0 }))
        ));
    }

    #[test]
    fn test_missing_conformance_is_an_error() {
        let mut program = Program::new();
        let proto = program.add(NominalDecl::protocol("P", "main"));
        let plain = program.add(NominalDecl::structure("S", "main"));
        let mut cx = context(&program);
        assert!(matches!(
            witness_recipe(&mut cx, &Type::nominal(plain), proto, None),
            Err(IrGenError::MissingConformance { .. })
        ));
    }

    #[test]
    fn test_generic_function_type_is_diagnosed() {
        let mut program = Program::new();
        let holder = program.add(NominalDecl::structure("Holder", "main").with_generic_param("T", vec![]));
        let mut cx = context(&program);
        let ty = Type::Function {
            params: vec![Type::GenericParam(0)],
            result: Box::new(Type::Tuple(Vec::new())),
        };
        let recipe = type_recipe(&mut cx, &ty, Some(holder)).unwrap();
        assert_eq!(recipe, TypeRecipe::Tuple(Vec::new()));
        assert_eq!(cx.diagnostics.len(), 1);
        assert!(cx.has_errors());
    }

    #[test]
    fn test_protocol_as_type_is_existential() {
        let mut program = Program::new();
        let proto = program.add(NominalDecl::protocol("Shape", "geo"));
        let mut cx = context(&program);
        let recipe = type_recipe(&mut cx, &Type::nominal(proto), None).unwrap();
        assert_eq!(
            recipe,
            TypeRecipe::Existential {
                protocols: vec!["$s3geo5ShapePMp".to_string()],
                class_bound: false
            }
        );
    }
}
