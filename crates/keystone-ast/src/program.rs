//! Declaration arena
//!
//! A `Program` owns every declaration visible to a compilation session,
//! including declarations imported from other modules. Once validated it is
//! treated as immutable.

use crate::decl::{DeclId, DeclKind, NominalDecl};
use crate::ty::Type;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Malformed declaration graph
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Reference to a declaration outside the arena
    #[error("Unknown declaration #{0}")]
    UnknownDecl(u32),

    /// Two declarations share a qualified name
    #[error("Duplicate declaration {module}.{name}")]
    DuplicateName {
        /// Module
        module: String,
        /// Name
        name: String,
    },

    /// Superclass is not a class type
    #[error("Superclass of {0} is not a class")]
    SuperclassNotClass(String),

    /// Superclass chain loops
    #[error("Inheritance cycle through {0}")]
    InheritanceCycle(String),

    /// Generic parameter index outside the declaration's parameter list
    #[error("Generic parameter {index} out of range in {decl}")]
    GenericParamOutOfRange {
        /// Declaration name
        decl: String,
        /// Offending index
        index: u32,
    },

    /// Wrong number of generic arguments
    #[error("{decl} expects {expected} generic arguments, found {found}")]
    GenericArgCount {
        /// Declaration name
        decl: String,
        /// Declared parameter count
        expected: usize,
        /// Supplied argument count
        found: usize,
    },

    /// Override target is not a method of an ancestor
    #[error("Method {method} of {decl} overrides a method that is not inherited")]
    BadOverride {
        /// Declaration name
        decl: String,
        /// Method name
        method: String,
    },

    /// Protocol position holds a non-protocol
    #[error("{name} is used as a protocol by {decl} but is not one")]
    NotAProtocol {
        /// Declaration name
        decl: String,
        /// Offending name
        name: String,
    },

    /// Member kind not allowed for this declaration kind
    #[error("{decl}: {what} are not allowed on a {kind}")]
    MisplacedMember {
        /// Declaration name
        decl: String,
        /// Member description
        what: &'static str,
        /// Declaration keyword
        kind: &'static str,
    },
}

/// Arena of declarations
#[derive(Debug, Clone, Default)]
pub struct Program {
    decls: Vec<NominalDecl>,
    by_name: FxHashMap<(String, String), DeclId>,
}

impl Program {
    /// Create an empty program
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a declaration, returning its id
    pub fn add(&mut self, decl: NominalDecl) -> DeclId {
        let id = DeclId(self.decls.len() as u32);
        self.by_name
            .entry((decl.module.clone(), decl.name.clone()))
            .or_insert(id);
        self.decls.push(decl);
        id
    }

    /// Id the next `add` will return
    pub fn next_id(&self) -> DeclId {
        DeclId(self.decls.len() as u32)
    }

    /// Get a declaration
    ///
    /// Ids are only produced by `add`, so lookups of validated ids succeed.
    pub fn get(&self, id: DeclId) -> Option<&NominalDecl> {
        self.decls.get(id.index())
    }

    /// Replace a declaration in place (used while resolving manifests)
    pub fn replace(&mut self, id: DeclId, decl: NominalDecl) {
        if let Some(slot) = self.decls.get_mut(id.index()) {
            *slot = decl;
        }
    }

    /// Look up a declaration by qualified name
    pub fn lookup(&self, module: &str, name: &str) -> Option<DeclId> {
        self.by_name
            .get(&(module.to_string(), name.to_string()))
            .copied()
    }

    /// Look up a declaration by unqualified name, preferring `module`
    pub fn lookup_unqualified(&self, module: &str, name: &str) -> Option<DeclId> {
        self.lookup(module, name).or_else(|| {
            self.decls
                .iter()
                .position(|d| d.name == name)
                .map(|i| DeclId(i as u32))
        })
    }

    /// Iterate over all declarations
    pub fn iter(&self) -> impl Iterator<Item = (DeclId, &NominalDecl)> {
        self.decls
            .iter()
            .enumerate()
            .map(|(i, d)| (DeclId(i as u32), d))
    }

    /// Number of declarations
    pub fn len(&self) -> usize {
        self.decls.len()
    }

    /// Whether the program is empty
    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    /// Superclass declaration of a class
    pub fn superclass_decl(&self, id: DeclId) -> Option<DeclId> {
        self.get(id)?.superclass.as_ref()?.decl()
    }

    /// Ancestors of a class, root first, ending with the class itself
    pub fn class_hierarchy(&self, id: DeclId) -> Vec<DeclId> {
        let mut chain = vec![id];
        let mut current = id;
        while let Some(parent) = self.superclass_decl(current) {
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        chain.reverse();
        chain
    }

    /// Readable spelling of a type
    pub fn display_type(&self, ty: &Type, context: Option<DeclId>) -> String {
        match ty {
            Type::Builtin(b) => b.name().to_string(),
            Type::Nominal { decl, args } => {
                let name = self
                    .get(*decl)
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| format!("#{}", decl.0));
                if args.is_empty() {
                    name
                } else {
                    let args: Vec<String> =
                        args.iter().map(|a| self.display_type(a, context)).collect();
                    format!("{}<{}>", name, args.join(", "))
                }
            }
            Type::GenericParam(index) => context
                .and_then(|c| self.get(c))
                .and_then(|d| d.generic_params.get(*index as usize))
                .map(|p| p.name.clone())
                .unwrap_or_else(|| format!("T{}", index)),
            Type::Tuple(elements) => {
                let parts: Vec<String> = elements
                    .iter()
                    .map(|e| self.display_type(e, context))
                    .collect();
                format!("({})", parts.join(", "))
            }
            Type::Function { params, result } => {
                let parts: Vec<String> =
                    params.iter().map(|p| self.display_type(p, context)).collect();
                format!(
                    "({}) -> {}",
                    parts.join(", "),
                    self.display_type(result, context)
                )
            }
            Type::Existential(protocols) if protocols.is_empty() => "Any".to_string(),
            Type::Existential(protocols) => {
                let names: Vec<String> = protocols
                    .iter()
                    .map(|p| self.get(*p).map(|d| d.name.clone()).unwrap_or_default())
                    .collect();
                format!("any {}", names.join(" & "))
            }
            Type::Metatype(inner) => format!("{}.Type", self.display_type(inner, context)),
        }
    }

    /// Check the declaration graph for the invariants the compiler relies on
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = FxHashMap::default();
        for (id, decl) in self.iter() {
            if seen
                .insert((decl.module.as_str(), decl.name.as_str()), id)
                .is_some()
            {
                return Err(ValidationError::DuplicateName {
                    module: decl.module.clone(),
                    name: decl.name.clone(),
                });
            }
            self.validate_decl(id, decl)?;
        }
        Ok(())
    }

    fn validate_decl(&self, id: DeclId, decl: &NominalDecl) -> Result<(), ValidationError> {
        let params = decl.generic_params.len();
        let misplaced = |what| ValidationError::MisplacedMember {
            decl: decl.name.clone(),
            what,
            kind: decl.kind.keyword(),
        };

        match decl.kind {
            DeclKind::Enum if !decl.fields.is_empty() => return Err(misplaced("stored fields")),
            DeclKind::Struct | DeclKind::Class | DeclKind::Protocol if !decl.cases.is_empty() => {
                return Err(misplaced("cases"))
            }
            DeclKind::Protocol if !decl.fields.is_empty() => return Err(misplaced("stored fields")),
            DeclKind::Struct | DeclKind::Enum if !decl.methods.is_empty() => {
                return Err(misplaced("dispatched methods"))
            }
            _ => {}
        }
        if decl.superclass.is_some() && decl.kind != DeclKind::Class {
            return Err(misplaced("superclasses"));
        }

        for param in &decl.generic_params {
            for req in &param.requirements {
                self.expect_protocol(decl, *req)?;
            }
        }
        for field in &decl.fields {
            self.validate_type(decl, &field.ty, params)?;
        }
        for case in &decl.cases {
            if let Some(payload) = &case.payload {
                self.validate_type(decl, payload, params)?;
            }
        }
        for proto in &decl.protocols {
            self.expect_protocol(decl, *proto)?;
        }
        for conformance in &decl.conformances {
            self.expect_protocol(decl, conformance.protocol)?;
            for (_, ty) in &conformance.associated_types {
                self.validate_type(decl, ty, params)?;
            }
        }

        if let Some(superclass) = &decl.superclass {
            self.validate_type(decl, superclass, params)?;
            let parent = superclass
                .decl()
                .ok_or_else(|| ValidationError::SuperclassNotClass(decl.name.clone()))?;
            let parent_decl = self.get(parent).ok_or(ValidationError::UnknownDecl(parent.0))?;
            if parent_decl.kind != DeclKind::Class {
                return Err(ValidationError::SuperclassNotClass(decl.name.clone()));
            }
            let mut current = parent;
            let mut steps = 0;
            while let Some(next) = self.superclass_decl(current) {
                steps += 1;
                if next == id || steps > self.decls.len() {
                    return Err(ValidationError::InheritanceCycle(decl.name.clone()));
                }
                current = next;
            }
        }

        let ancestors = self.class_hierarchy(id);
        for method in &decl.methods {
            if let Some(target) = method.overrides {
                let valid = target.class != id
                    && ancestors.contains(&target.class)
                    && self
                        .get(target.class)
                        .map(|c| target.index < c.methods.len())
                        .unwrap_or(false);
                if !valid {
                    return Err(ValidationError::BadOverride {
                        decl: decl.name.clone(),
                        method: method.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn expect_protocol(&self, decl: &NominalDecl, proto: DeclId) -> Result<(), ValidationError> {
        let target = self.get(proto).ok_or(ValidationError::UnknownDecl(proto.0))?;
        if target.kind != DeclKind::Protocol {
            return Err(ValidationError::NotAProtocol {
                decl: decl.name.clone(),
                name: target.name.clone(),
            });
        }
        Ok(())
    }

    fn validate_type(
        &self,
        decl: &NominalDecl,
        ty: &Type,
        params: usize,
    ) -> Result<(), ValidationError> {
        match ty {
            Type::Builtin(_) => Ok(()),
            Type::GenericParam(index) if (*index as usize) < params => Ok(()),
            Type::GenericParam(index) => Err(ValidationError::GenericParamOutOfRange {
                decl: decl.name.clone(),
                index: *index,
            }),
            Type::Nominal { decl: target, args } => {
                let target_decl = self.get(*target).ok_or(ValidationError::UnknownDecl(target.0))?;
                if target_decl.generic_params.len() != args.len() {
                    return Err(ValidationError::GenericArgCount {
                        decl: target_decl.name.clone(),
                        expected: target_decl.generic_params.len(),
                        found: args.len(),
                    });
                }
                args.iter()
                    .try_for_each(|a| self.validate_type(decl, a, params))
            }
            Type::Tuple(elements) => elements
                .iter()
                .try_for_each(|e| self.validate_type(decl, e, params)),
            Type::Function { params: inputs, result } => {
                inputs
                    .iter()
                    .try_for_each(|p| self.validate_type(decl, p, params))?;
                self.validate_type(decl, result, params)
            }
            Type::Existential(protocols) => protocols
                .iter()
                .try_for_each(|p| self.expect_protocol(decl, *p)),
            Type::Metatype(inner) => self.validate_type(decl, inner, params),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decl::MethodRef;
    use crate::ty::BuiltinType;

    fn int32() -> Type {
        Type::Builtin(BuiltinType::Int32)
    }

    #[test]
    fn test_lookup_and_hierarchy() {
        let mut program = Program::new();
        let base = program.add(NominalDecl::class("Base", "Main").with_method("draw"));
        let derived = program.add(
            NominalDecl::class("Derived", "Main").with_superclass(Type::nominal(base)),
        );
        assert_eq!(program.lookup("Main", "Derived"), Some(derived));
        assert_eq!(program.lookup("Other", "Derived"), None);
        assert_eq!(program.class_hierarchy(derived), vec![base, derived]);
        assert!(program.validate().is_ok());
    }

    #[test]
    fn test_rejects_struct_superclass() {
        let mut program = Program::new();
        let point = program.add(NominalDecl::structure("Point", "Main"));
        program.add(NominalDecl::class("Shape", "Main").with_superclass(Type::nominal(point)));
        assert_eq!(
            program.validate(),
            Err(ValidationError::SuperclassNotClass("Shape".to_string()))
        );
    }

    #[test]
    fn test_rejects_inheritance_cycle() {
        let mut program = Program::new();
        let a = program.next_id();
        let b = DeclId(a.0 + 1);
        program.add(NominalDecl::class("A", "Main").with_superclass(Type::nominal(b)));
        program.add(NominalDecl::class("B", "Main").with_superclass(Type::nominal(a)));
        assert!(matches!(
            program.validate(),
            Err(ValidationError::InheritanceCycle(_))
        ));
    }

    #[test]
    fn test_rejects_out_of_range_generic_param() {
        let mut program = Program::new();
        program.add(
            NominalDecl::structure("Box", "Main")
                .with_generic_param("T", vec![])
                .with_field("value", Type::GenericParam(1)),
        );
        assert_eq!(
            program.validate(),
            Err(ValidationError::GenericParamOutOfRange {
                decl: "Box".to_string(),
                index: 1
            })
        );
    }

    #[test]
    fn test_rejects_override_of_unrelated_class() {
        let mut program = Program::new();
        let other = program.add(NominalDecl::class("Other", "Main").with_method("run"));
        program.add(NominalDecl::class("Lonely", "Main").with_override(
            "run",
            MethodRef {
                class: other,
                index: 0,
            },
        ));
        assert!(matches!(
            program.validate(),
            Err(ValidationError::BadOverride { .. })
        ));
    }

    #[test]
    fn test_display_type() {
        let mut program = Program::new();
        let pair = program.add(
            NominalDecl::structure("Pair", "Main")
                .with_generic_param("A", vec![])
                .with_generic_param("B", vec![]),
        );
        let ty = Type::bound(pair, vec![int32(), Type::GenericParam(1)]);
        assert_eq!(program.display_type(&ty, Some(pair)), "Pair<Int32, B>");
        let func = Type::Function {
            params: vec![int32()],
            result: Box::new(Type::Tuple(vec![])),
        };
        assert_eq!(program.display_type(&func, None), "(Int32) -> ()");
    }
}
