//! Type manifest parsing (TOML)
//!
//! A manifest names the module being compiled, the target, and every nominal
//! type the compiler should know about, including types imported from other
//! modules. Type expressions are parsed with [`crate::parser`] and resolved
//! against the declared names.

use crate::decl::{DeclId, DeclKind, MethodRef, NominalDecl};
use crate::parser::{parse_type, ParseError, TypeExpr};
use crate::program::{Program, ValidationError};
use crate::ty::{BuiltinType, Span, Type};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use toml::Spanned;

/// Errors that can occur while loading a manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Failed to read manifest file
    #[error("Failed to read manifest file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse manifest: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Malformed type expression
    #[error("Invalid type expression: {message}")]
    Syntax {
        /// Description
        message: String,
        /// Location in the manifest
        span: Span,
    },

    /// Name that does not resolve to a builtin, parameter or declaration
    #[error("Cannot find type '{name}'")]
    UnresolvedName {
        /// The name
        name: String,
        /// Location in the manifest
        span: Span,
    },

    /// Declaration graph rejected by validation
    #[error("Invalid declarations: {0}")]
    Validation(#[from] ValidationError),
}

impl ManifestError {
    /// Location of the error in the manifest source, if known
    pub fn span(&self) -> Option<Span> {
        match self {
            ManifestError::Syntax { span, .. } | ManifestError::UnresolvedName { span, .. } => {
                Some(*span)
            }
            _ => None,
        }
    }
}

/// Parsed manifest
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Module being compiled
    pub module: ModuleSection,
    /// Target description
    #[serde(default)]
    pub target: TargetSection,
    /// Code generation options
    #[serde(default)]
    pub options: OptionsSection,
    /// Declared types
    #[serde(default)]
    pub types: Vec<TypeEntry>,
}

/// `[module]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleSection {
    /// Module name
    pub name: String,
}

/// `[target]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetSection {
    /// Architecture name (e.g. "x86_64", "arm64")
    #[serde(default = "default_arch")]
    pub arch: String,
    /// Object format (e.g. "elf", "macho")
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_arch() -> String {
    "x86_64".to_string()
}

fn default_format() -> String {
    "elf".to_string()
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            arch: default_arch(),
            format: default_format(),
        }
    }
}

/// `[options]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionsSection {
    /// Building for the thread sanitizer
    #[serde(default)]
    pub tsan: bool,
    /// Emit reflection sections
    #[serde(default = "default_true")]
    pub reflection: bool,
}

fn default_true() -> bool {
    true
}

impl Default for OptionsSection {
    fn default() -> Self {
        Self {
            tsan: false,
            reflection: true,
        }
    }
}

/// `[[types]]`
#[derive(Debug, Clone, Deserialize)]
pub struct TypeEntry {
    /// Type name
    pub name: Spanned<String>,
    /// Declaration kind
    pub kind: DeclKind,
    /// Module of origin, defaulting to the manifest's module
    #[serde(default)]
    pub module: Option<String>,
    /// Generic parameters, as `"T"` or `"T: P & Q"`
    #[serde(default)]
    pub generic: Vec<Spanned<String>>,
    /// Stored fields
    #[serde(default)]
    pub fields: Vec<FieldEntry>,
    /// Enum cases
    #[serde(default)]
    pub cases: Vec<CaseEntry>,
    /// Methods or protocol requirements
    #[serde(default)]
    pub methods: Vec<MethodEntry>,
    /// Superclass type expression
    #[serde(default)]
    pub superclass: Option<Spanned<String>>,
    /// Inherited protocols
    #[serde(default)]
    pub inherits: Vec<Spanned<String>>,
    /// Conformances
    #[serde(default)]
    pub conforms: Vec<ConformanceEntry>,
    /// Associated type requirements
    #[serde(default)]
    pub associated_types: Vec<String>,
    /// Resilient layout
    #[serde(default)]
    pub resilient: bool,
    /// Foreign object model
    #[serde(default)]
    pub foreign: bool,
    /// Objective-C runtime publication
    #[serde(default)]
    pub objc: bool,
    /// Class-bound protocol
    #[serde(default)]
    pub class_bound: bool,
}

/// Field entry
#[derive(Debug, Clone, Deserialize)]
pub struct FieldEntry {
    /// Field name
    pub name: String,
    /// Type expression
    #[serde(rename = "type")]
    pub ty: Spanned<String>,
    /// Boxed storage
    #[serde(default)]
    pub indirect: bool,
    /// Weak storage
    #[serde(default)]
    pub weak: bool,
}

/// Case entry
#[derive(Debug, Clone, Deserialize)]
pub struct CaseEntry {
    /// Case name
    pub name: String,
    /// Payload type expression
    #[serde(default)]
    pub payload: Option<Spanned<String>>,
    /// Boxed payload
    #[serde(default)]
    pub indirect: bool,
}

/// Method entry
#[derive(Debug, Clone, Deserialize)]
pub struct MethodEntry {
    /// Method name
    pub name: String,
    /// Overridden method as `Class.method`
    #[serde(default)]
    pub overrides: Option<Spanned<String>>,
    /// Eliminated by dead-code stripping
    #[serde(default)]
    pub dead: bool,
    /// Protocol requirement with a default
    #[serde(default)]
    pub default: bool,
}

/// Conformance entry
#[derive(Debug, Clone, Deserialize)]
pub struct ConformanceEntry {
    /// Protocol name
    pub protocol: Spanned<String>,
    /// Associated type witnesses
    #[serde(default)]
    pub associated: BTreeMap<String, Spanned<String>>,
}

impl Manifest {
    /// Parse a manifest from TOML source
    pub fn parse(source: &str) -> Result<Self, ManifestError> {
        Ok(toml::from_str(source)?)
    }

    /// Read and parse a manifest file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let source = std::fs::read_to_string(path)?;
        Self::parse(&source)
    }

    /// Resolve every entry into a validated `Program`
    pub fn build_program(&self) -> Result<Program, ManifestError> {
        let mut program = Program::new();
        let mut ids = Vec::with_capacity(self.types.len());
        for entry in &self.types {
            let module = entry.module.clone().unwrap_or_else(|| self.module.name.clone());
            let mut decl = NominalDecl::new(entry.kind, entry.name.get_ref().clone(), module);
            decl.span = Some(span_of(&entry.name));
            ids.push(program.add(decl));
        }

        let mut pending_overrides = Vec::new();
        for (entry, &id) in self.types.iter().zip(&ids) {
            let decl = self.resolve_entry(&program, id, entry, &mut pending_overrides)?;
            program.replace(id, decl);
        }

        for (id, index, target) in pending_overrides {
            let method_ref = resolve_override(&program, id, &target)?;
            if let Some(decl) = program.get(id).cloned() {
                let mut decl = decl;
                decl.methods[index].overrides = Some(method_ref);
                program.replace(id, decl);
            }
        }

        program.validate()?;
        Ok(program)
    }

    fn resolve_entry(
        &self,
        program: &Program,
        id: DeclId,
        entry: &TypeEntry,
        pending_overrides: &mut Vec<(DeclId, usize, Spanned<String>)>,
    ) -> Result<NominalDecl, ManifestError> {
        let placeholder = program
            .get(id)
            .cloned()
            .ok_or(ValidationError::UnknownDecl(id.0))?;
        let mut decl = placeholder;

        let mut param_names = Vec::new();
        let mut param_requirements = Vec::new();
        for param in &entry.generic {
            let text = param.get_ref();
            let (name, requirements) = match text.split_once(':') {
                Some((name, reqs)) => (name.trim(), reqs),
                None => (text.trim(), ""),
            };
            let mut resolved = Vec::new();
            for req in reqs_of(requirements) {
                resolved.push(resolve_decl_path(program, &decl.module, req, span_of(param))?);
            }
            param_names.push(name.to_string());
            param_requirements.push(resolved);
        }
        for (name, requirements) in param_names.iter().zip(param_requirements) {
            decl = decl.with_generic_param(name.clone(), requirements);
        }

        let resolver = Resolver {
            program,
            module: &decl.module,
            params: &param_names,
        };

        for field in &entry.fields {
            let ty = resolver.resolve_spanned(&field.ty)?;
            decl.fields.push(crate::decl::FieldDecl {
                name: field.name.clone(),
                ty,
                indirect: field.indirect,
                weak: field.weak,
            });
        }
        for case in &entry.cases {
            let payload = case
                .payload
                .as_ref()
                .map(|p| resolver.resolve_spanned(p))
                .transpose()?;
            decl.cases.push(crate::decl::CaseDecl {
                name: case.name.clone(),
                payload,
                indirect: case.indirect,
            });
        }
        for (index, method) in entry.methods.iter().enumerate() {
            decl.methods.push(crate::decl::MethodDecl {
                name: method.name.clone(),
                overrides: None,
                dead: method.dead,
                has_default: method.default,
            });
            if let Some(target) = &method.overrides {
                pending_overrides.push((id, index, target.clone()));
            }
        }
        if let Some(superclass) = &entry.superclass {
            decl.superclass = Some(resolver.resolve_spanned(superclass)?);
        }
        for proto in &entry.inherits {
            decl.protocols.push(resolve_decl_path(
                program,
                &decl.module,
                proto.get_ref(),
                span_of(proto),
            )?);
        }
        for conformance in &entry.conforms {
            let protocol = resolve_decl_path(
                program,
                &decl.module,
                conformance.protocol.get_ref(),
                span_of(&conformance.protocol),
            )?;
            let mut associated = Vec::new();
            for (name, ty) in &conformance.associated {
                associated.push((name.clone(), resolver.resolve_spanned(ty)?));
            }
            decl.conformances.push(crate::decl::Conformance {
                protocol,
                associated_types: associated,
            });
        }
        decl.associated_types = entry.associated_types.clone();
        decl.resilient = entry.resilient;
        decl.foreign = entry.foreign;
        decl.objc = entry.objc;
        decl.class_bound = entry.class_bound;
        Ok(decl)
    }
}

fn span_of<T>(spanned: &Spanned<T>) -> Span {
    let range = spanned.span();
    Span::new(range.start, range.end)
}

fn reqs_of(text: &str) -> impl Iterator<Item = &str> {
    text.split('&').map(str::trim).filter(|s| !s.is_empty())
}

fn resolve_decl_path(
    program: &Program,
    module: &str,
    path: &str,
    span: Span,
) -> Result<DeclId, ManifestError> {
    let found = match path.trim().split_once('.') {
        Some((m, name)) => program.lookup(m, name),
        None => program.lookup_unqualified(module, path.trim()),
    };
    found.ok_or_else(|| ManifestError::UnresolvedName {
        name: path.trim().to_string(),
        span,
    })
}

fn resolve_override(
    program: &Program,
    id: DeclId,
    target: &Spanned<String>,
) -> Result<MethodRef, ManifestError> {
    let span = span_of(target);
    let unresolved = || ManifestError::UnresolvedName {
        name: target.get_ref().clone(),
        span,
    };
    let (class_name, method) = target.get_ref().rsplit_once('.').ok_or_else(unresolved)?;
    let module = program.get(id).map(|d| d.module.clone()).unwrap_or_default();
    let class = resolve_decl_path(program, &module, class_name, span)?;
    let index = program
        .get(class)
        .and_then(|c| c.method_index(method))
        .ok_or_else(unresolved)?;
    Ok(MethodRef { class, index })
}

struct Resolver<'a> {
    program: &'a Program,
    module: &'a str,
    params: &'a [String],
}

impl Resolver<'_> {
    fn resolve_spanned(&self, source: &Spanned<String>) -> Result<Type, ManifestError> {
        // Spans inside the string are shifted past the opening quote.
        let base = source.span().start + 1;
        let expr = parse_type(source.get_ref()).map_err(|err: ParseError| ManifestError::Syntax {
            message: err.to_string(),
            span: err
                .span()
                .map(|s| s.offset_by(base))
                .unwrap_or_else(|| span_of(source)),
        })?;
        self.resolve(&expr, base)
    }

    fn resolve(&self, expr: &TypeExpr, base: usize) -> Result<Type, ManifestError> {
        match expr {
            TypeExpr::Named {
                module,
                name,
                args,
                span,
            } => {
                if module.is_none() && args.is_empty() {
                    if let Some(index) = self.params.iter().position(|p| p == name) {
                        return Ok(Type::GenericParam(index as u32));
                    }
                    if let Some(builtin) = BuiltinType::from_name(name) {
                        return Ok(Type::Builtin(builtin));
                    }
                }
                let decl = match module {
                    Some(m) => self.program.lookup(m, name),
                    None => self.program.lookup_unqualified(self.module, name),
                }
                .ok_or_else(|| ManifestError::UnresolvedName {
                    name: name.clone(),
                    span: span.offset_by(base),
                })?;
                let args = args
                    .iter()
                    .map(|a| self.resolve(a, base))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Type::Nominal { decl, args })
            }
            TypeExpr::Tuple(elements) => Ok(Type::Tuple(
                elements
                    .iter()
                    .map(|e| self.resolve(e, base))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            TypeExpr::Function { params, result } => Ok(Type::Function {
                params: params
                    .iter()
                    .map(|p| self.resolve(p, base))
                    .collect::<Result<Vec<_>, _>>()?,
                result: Box::new(self.resolve(result, base)?),
            }),
            TypeExpr::Existential(protocols) => {
                let mut ids = Vec::new();
                for (module, name, span) in protocols {
                    let id = match module {
                        Some(m) => self.program.lookup(m, name),
                        None => self.program.lookup_unqualified(self.module, name),
                    }
                    .ok_or_else(|| ManifestError::UnresolvedName {
                        name: name.clone(),
                        span: span.offset_by(base),
                    })?;
                    ids.push(id);
                }
                Ok(Type::Existential(ids))
            }
            TypeExpr::Metatype(inner) => Ok(Type::Metatype(Box::new(self.resolve(inner, base)?))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPES: &str = r#"
[module]
name = "Shapes"

[[types]]
name = "Drawable"
kind = "protocol"
methods = [{ name = "draw" }, { name = "describe", default = true }]
associated_types = ["Canvas"]

[[types]]
name = "Point"
kind = "struct"
fields = [{ name = "x", type = "Int32" }, { name = "y", type = "Bool" }]
conforms = [{ protocol = "Drawable", associated = { Canvas = "Int32" } }]

[[types]]
name = "Pair"
kind = "struct"
generic = ["A: Drawable", "B"]
fields = [{ name = "first", type = "A" }, { name = "second", type = "(B, Int64)" }]

[[types]]
name = "Base"
kind = "class"
module = "Lib"
resilient = true
methods = [{ name = "area" }]

[[types]]
name = "Circle"
kind = "class"
superclass = "Lib.Base"
fields = [{ name = "radius", type = "Float64" }]
methods = [{ name = "area", overrides = "Base.area" }, { name = "scale" }]
"#;

    #[test]
    fn test_manifest_builds_program() {
        let manifest = Manifest::parse(SHAPES).unwrap();
        assert_eq!(manifest.module.name, "Shapes");
        assert_eq!(manifest.target, TargetSection::default());
        assert!(manifest.options.reflection);

        let program = manifest.build_program().unwrap();
        assert_eq!(program.len(), 5);

        let pair = program.get(program.lookup("Shapes", "Pair").unwrap()).unwrap();
        assert_eq!(pair.generic_params.len(), 2);
        assert_eq!(pair.num_generic_witnesses(), 1);
        assert_eq!(pair.fields[0].ty, Type::GenericParam(0));
        assert_eq!(
            pair.fields[1].ty,
            Type::Tuple(vec![Type::GenericParam(1), Type::Builtin(BuiltinType::Int64)])
        );

        let base = program.lookup("Lib", "Base").unwrap();
        let circle = program.get(program.lookup("Shapes", "Circle").unwrap()).unwrap();
        assert_eq!(circle.superclass, Some(Type::nominal(base)));
        assert_eq!(
            circle.methods[0].overrides,
            Some(MethodRef {
                class: base,
                index: 0
            })
        );
        assert!(program.get(base).unwrap().is_resilient_from("Shapes"));
    }

    #[test]
    fn test_unresolved_name_reports_span() {
        let source = r#"
[module]
name = "M"

[[types]]
name = "S"
kind = "struct"
fields = [{ name = "x", type = "Pair<Missing>" }]
"#;
        let err = Manifest::parse(source).unwrap().build_program().unwrap_err();
        match err {
            ManifestError::UnresolvedName { name, span } => {
                assert_eq!(name, "Pair");
                assert_eq!(&source[span.start..span.end], "Pair");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_syntax_error_reports_span() {
        let source = "[module]\nname = \"M\"\n[[types]]\nname = \"S\"\nkind = \"struct\"\nfields = [{ name = \"x\", type = \"Int32?\" }]\n";
        let err = Manifest::parse(source).unwrap().build_program().unwrap_err();
        let span = err.span().unwrap();
        assert_eq!(&source[span.start..span.end], "?");
    }
}
