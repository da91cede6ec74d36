//! Canonical type descriptions
//!
//! Types reference declarations by `DeclId` and generic parameters by their
//! index in the enclosing declaration's parameter list.

use crate::decl::DeclId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Byte range in a manifest source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    /// Start offset (inclusive)
    pub start: usize,
    /// End offset (exclusive)
    pub end: usize,
}

impl Span {
    /// Create a new span
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Shift a span that is relative to an embedded string
    pub fn offset_by(self, base: usize) -> Self {
        Self {
            start: self.start + base,
            end: self.end + base,
        }
    }
}

/// Builtin scalar and reference types provided by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuiltinType {
    /// 1-bit integer used for booleans
    Bool,
    /// 8-bit integer
    Int8,
    /// 16-bit integer
    Int16,
    /// 32-bit integer
    Int32,
    /// 64-bit integer
    Int64,
    /// Pointer-sized integer
    Word,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// Untyped pointer
    RawPointer,
    /// Strong reference to a native heap object
    NativeObject,
    /// Strong reference to an object of unknown object model
    UnknownObject,
}

impl BuiltinType {
    /// All builtin types, in a stable order
    pub const ALL: [BuiltinType; 11] = [
        BuiltinType::Bool,
        BuiltinType::Int8,
        BuiltinType::Int16,
        BuiltinType::Int32,
        BuiltinType::Int64,
        BuiltinType::Word,
        BuiltinType::Float32,
        BuiltinType::Float64,
        BuiltinType::RawPointer,
        BuiltinType::NativeObject,
        BuiltinType::UnknownObject,
    ];

    /// Source-level spelling
    pub fn name(self) -> &'static str {
        match self {
            BuiltinType::Bool => "Bool",
            BuiltinType::Int8 => "Int8",
            BuiltinType::Int16 => "Int16",
            BuiltinType::Int32 => "Int32",
            BuiltinType::Int64 => "Int64",
            BuiltinType::Word => "Word",
            BuiltinType::Float32 => "Float32",
            BuiltinType::Float64 => "Float64",
            BuiltinType::RawPointer => "RawPointer",
            BuiltinType::NativeObject => "NativeObject",
            BuiltinType::UnknownObject => "UnknownObject",
        }
    }

    /// Look up a builtin by its source spelling
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.name() == name)
    }

    /// Whether values of this type are object references
    pub fn is_reference(self) -> bool {
        matches!(self, BuiltinType::NativeObject | BuiltinType::UnknownObject)
    }
}

/// A fully resolved type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// Builtin type
    Builtin(BuiltinType),
    /// Nominal type, possibly with generic arguments bound
    Nominal {
        /// Declaration
        decl: DeclId,
        /// Generic arguments, one per declared parameter
        args: Vec<Type>,
    },
    /// Generic parameter of the enclosing declaration
    GenericParam(u32),
    /// Tuple of element types (empty is the unit type)
    Tuple(Vec<Type>),
    /// Function type
    Function {
        /// Parameter types
        params: Vec<Type>,
        /// Result type
        result: Box<Type>,
    },
    /// Existential over a protocol composition (empty is `Any`)
    Existential(Vec<DeclId>),
    /// Metatype of a type
    Metatype(Box<Type>),
}

impl Type {
    /// Non-generic nominal type
    pub fn nominal(decl: DeclId) -> Self {
        Type::Nominal {
            decl,
            args: Vec::new(),
        }
    }

    /// Bound generic nominal type
    pub fn bound(decl: DeclId, args: Vec<Type>) -> Self {
        Type::Nominal { decl, args }
    }

    /// Whether this type mentions any generic parameter
    pub fn has_type_parameter(&self) -> bool {
        match self {
            Type::GenericParam(_) => true,
            Type::Builtin(_) | Type::Existential(_) => false,
            Type::Nominal { args, .. } | Type::Tuple(args) => {
                args.iter().any(Type::has_type_parameter)
            }
            Type::Function { params, result } => {
                params.iter().any(Type::has_type_parameter) || result.has_type_parameter()
            }
            Type::Metatype(inner) => inner.has_type_parameter(),
        }
    }

    /// Replace generic parameters with the given arguments
    pub fn substitute(&self, args: &[Type]) -> Type {
        match self {
            Type::GenericParam(index) => args
                .get(*index as usize)
                .cloned()
                .unwrap_or(Type::GenericParam(*index)),
            Type::Builtin(_) | Type::Existential(_) => self.clone(),
            Type::Nominal { decl, args: inner } => Type::Nominal {
                decl: *decl,
                args: inner.iter().map(|t| t.substitute(args)).collect(),
            },
            Type::Tuple(elements) => {
                Type::Tuple(elements.iter().map(|t| t.substitute(args)).collect())
            }
            Type::Function { params, result } => Type::Function {
                params: params.iter().map(|t| t.substitute(args)).collect(),
                result: Box::new(result.substitute(args)),
            },
            Type::Metatype(inner) => Type::Metatype(Box::new(inner.substitute(args))),
        }
    }

    /// Declaration of a nominal type
    pub fn decl(&self) -> Option<DeclId> {
        match self {
            Type::Nominal { decl, .. } => Some(*decl),
            _ => None,
        }
    }
}

impl fmt::Display for BuiltinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        assert_eq!(BuiltinType::from_name("Int32"), Some(BuiltinType::Int32));
        assert_eq!(BuiltinType::from_name("Int128"), None);
        assert!(BuiltinType::NativeObject.is_reference());
        assert!(!BuiltinType::Bool.is_reference());
    }

    #[test]
    fn test_substitute_generic_params() {
        let pair = Type::bound(
            DeclId(3),
            vec![Type::GenericParam(1), Type::Tuple(vec![Type::GenericParam(0)])],
        );
        let result = pair.substitute(&[
            Type::Builtin(BuiltinType::Bool),
            Type::Builtin(BuiltinType::Int32),
        ]);
        assert_eq!(
            result,
            Type::bound(
                DeclId(3),
                vec![
                    Type::Builtin(BuiltinType::Int32),
                    Type::Tuple(vec![Type::Builtin(BuiltinType::Bool)]),
                ]
            )
        );
        assert!(pair.has_type_parameter());
        assert!(!result.has_type_parameter());
    }
}
