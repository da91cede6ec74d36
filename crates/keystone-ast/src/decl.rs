//! Nominal type declarations

use crate::ty::{Span, Type};
use serde::{Deserialize, Serialize};

/// Index of a declaration in its `Program`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeclId(pub u32);

impl DeclId {
    /// Arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Kind of nominal declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclKind {
    /// Value type with stored fields
    Struct,
    /// Value type with cases
    Enum,
    /// Reference type with single inheritance
    Class,
    /// Protocol
    Protocol,
}

impl DeclKind {
    /// Keyword spelling
    pub fn keyword(self) -> &'static str {
        match self {
            DeclKind::Struct => "struct",
            DeclKind::Enum => "enum",
            DeclKind::Class => "class",
            DeclKind::Protocol => "protocol",
        }
    }
}

/// Generic parameter with its protocol requirements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericParam {
    /// Parameter name
    pub name: String,
    /// Protocols the argument must conform to
    pub requirements: Vec<DeclId>,
}

/// Stored property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    /// Field name
    pub name: String,
    /// Field type
    pub ty: Type,
    /// Stored out of line in a box
    pub indirect: bool,
    /// Weak reference storage
    pub weak: bool,
}

/// Enum case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseDecl {
    /// Case name
    pub name: String,
    /// Payload type, if any
    pub payload: Option<Type>,
    /// Payload is boxed
    pub indirect: bool,
}

/// Reference to a method slot declared by a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    /// Class that introduces the method
    pub class: DeclId,
    /// Index into that class's method list
    pub index: usize,
}

/// Class method or protocol requirement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDecl {
    /// Method name
    pub name: String,
    /// Superclass method this overrides; introduces a new slot otherwise
    pub overrides: Option<MethodRef>,
    /// Removed by dead-code elimination
    pub dead: bool,
    /// Protocol requirement with a default implementation
    pub has_default: bool,
}

/// Protocol conformance of a nominal type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conformance {
    /// Protocol declaration
    pub protocol: DeclId,
    /// Associated type witnesses, by requirement name
    pub associated_types: Vec<(String, Type)>,
}

/// A nominal type declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NominalDecl {
    /// Unqualified name
    pub name: String,
    /// Module of origin
    pub module: String,
    /// Declaration kind
    pub kind: DeclKind,
    /// Generic parameters (depth zero only)
    pub generic_params: Vec<GenericParam>,
    /// Stored properties (structs and classes)
    pub fields: Vec<FieldDecl>,
    /// Cases (enums)
    pub cases: Vec<CaseDecl>,
    /// Methods (classes) or requirements (protocols)
    pub methods: Vec<MethodDecl>,
    /// Superclass (classes)
    pub superclass: Option<Type>,
    /// Inherited protocols (protocols)
    pub protocols: Vec<DeclId>,
    /// Conformances (structs, enums, classes)
    pub conformances: Vec<Conformance>,
    /// Associated type requirements (protocols)
    pub associated_types: Vec<String>,
    /// Layout may change across library versions
    pub resilient: bool,
    /// Imported from a foreign object model
    pub foreign: bool,
    /// Published to the Objective-C runtime on first use
    pub objc: bool,
    /// Protocol restricted to class types
    pub class_bound: bool,
    /// Location of the declaration in its manifest
    #[serde(skip)]
    pub span: Option<Span>,
}

impl NominalDecl {
    /// New declaration with no members
    pub fn new(kind: DeclKind, name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            kind,
            generic_params: Vec::new(),
            fields: Vec::new(),
            cases: Vec::new(),
            methods: Vec::new(),
            superclass: None,
            protocols: Vec::new(),
            conformances: Vec::new(),
            associated_types: Vec::new(),
            resilient: false,
            foreign: false,
            objc: false,
            class_bound: false,
            span: None,
        }
    }

    /// New struct declaration
    pub fn structure(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self::new(DeclKind::Struct, name, module)
    }

    /// New enum declaration
    pub fn enumeration(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self::new(DeclKind::Enum, name, module)
    }

    /// New class declaration
    pub fn class(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self::new(DeclKind::Class, name, module)
    }

    /// New protocol declaration
    pub fn protocol(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self::new(DeclKind::Protocol, name, module)
    }

    /// Add a generic parameter
    pub fn with_generic_param(mut self, name: impl Into<String>, requirements: Vec<DeclId>) -> Self {
        self.generic_params.push(GenericParam {
            name: name.into(),
            requirements,
        });
        self
    }

    /// Add a stored field
    pub fn with_field(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.fields.push(FieldDecl {
            name: name.into(),
            ty,
            indirect: false,
            weak: false,
        });
        self
    }

    /// Add a weak reference field
    pub fn with_weak_field(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.fields.push(FieldDecl {
            name: name.into(),
            ty,
            indirect: false,
            weak: true,
        });
        self
    }

    /// Add an enum case
    pub fn with_case(mut self, name: impl Into<String>, payload: Option<Type>) -> Self {
        self.cases.push(CaseDecl {
            name: name.into(),
            payload,
            indirect: false,
        });
        self
    }

    /// Add a method introducing a new slot
    pub fn with_method(mut self, name: impl Into<String>) -> Self {
        self.methods.push(MethodDecl {
            name: name.into(),
            overrides: None,
            dead: false,
            has_default: false,
        });
        self
    }

    /// Add a method overriding a superclass slot
    pub fn with_override(mut self, name: impl Into<String>, target: MethodRef) -> Self {
        self.methods.push(MethodDecl {
            name: name.into(),
            overrides: Some(target),
            dead: false,
            has_default: false,
        });
        self
    }

    /// Add a method eliminated by dead-code stripping
    pub fn with_dead_method(mut self, name: impl Into<String>) -> Self {
        self.methods.push(MethodDecl {
            name: name.into(),
            overrides: None,
            dead: true,
            has_default: false,
        });
        self
    }

    /// Add a protocol requirement
    pub fn with_requirement(mut self, name: impl Into<String>, has_default: bool) -> Self {
        self.methods.push(MethodDecl {
            name: name.into(),
            overrides: None,
            dead: false,
            has_default,
        });
        self
    }

    /// Set the superclass
    pub fn with_superclass(mut self, superclass: Type) -> Self {
        self.superclass = Some(superclass);
        self
    }

    /// Add an inherited protocol
    pub fn with_inherited(mut self, protocol: DeclId) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// Add a conformance
    pub fn with_conformance(mut self, protocol: DeclId, associated_types: Vec<(String, Type)>) -> Self {
        self.conformances.push(Conformance {
            protocol,
            associated_types,
        });
        self
    }

    /// Add an associated type requirement
    pub fn with_associated_type(mut self, name: impl Into<String>) -> Self {
        self.associated_types.push(name.into());
        self
    }

    /// Mark as resilient
    pub fn resilient(mut self) -> Self {
        self.resilient = true;
        self
    }

    /// Mark as foreign
    pub fn foreign(mut self) -> Self {
        self.foreign = true;
        self
    }

    /// Mark as published to the Objective-C runtime
    pub fn objc(mut self) -> Self {
        self.objc = true;
        self
    }

    /// Whether the declaration has generic parameters
    pub fn is_generic(&self) -> bool {
        !self.generic_params.is_empty()
    }

    /// Number of generic witness tables (one per requirement)
    pub fn num_generic_witnesses(&self) -> usize {
        self.generic_params.iter().map(|p| p.requirements.len()).sum()
    }

    /// Whether layout is opaque to clients in `module`
    pub fn is_resilient_from(&self, module: &str) -> bool {
        self.resilient && self.module != module
    }

    /// Index of a field by name
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Index of a method by name
    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name)
    }
}
