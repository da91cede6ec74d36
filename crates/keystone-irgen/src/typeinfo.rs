//! Compile-time knowledge about value layouts and class shapes
//!
//! A layout is *fixed* when this module can compute it without running
//! anything: it fails to be fixed when it depends on a generic parameter or
//! on a resilient type from another module. Fixed layouts use the shared
//! rules in `keystone_abi::value`, so the runtime and the mirror reproduce
//! them exactly.

use crate::error::{IrGenError, IrGenResult};
use keystone_abi::value::{
    builtin_layout, existential_layout, function_layout, layout_enum, metatype_layout,
    EnumLayout, RecordBuilder, RecordLayout, ValueLayout, HEAP_OBJECT_HEADER_WORDS,
};
use keystone_abi::TargetAbi;
use keystone_ast::{DeclId, DeclKind, FieldDecl, MethodRef, NominalDecl, Program, Type};

use crate::naming::builtin_code;

const MAX_NESTING: u32 = 64;

/// Storage facts about a stored property or payload
#[derive(Debug, Clone, PartialEq)]
pub struct StoredField {
    pub name: String,
    pub ty: Option<Type>,
    pub indirect: bool,
    pub weak: bool,
}

/// Instance layout of a class, root class first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInstanceLayout {
    /// Field offsets of each class in the hierarchy
    pub classes: Vec<(DeclId, Vec<u64>)>,
    pub size: u64,
    pub align: u64,
}

impl ClassInstanceLayout {
    pub fn offsets_of(&self, class: DeclId) -> Option<&[u64]> {
        self.classes
            .iter()
            .find(|(id, _)| *id == class)
            .map(|(_, offsets)| offsets.as_slice())
    }
}

/// Read-only view of the declarations from one module's point of view
#[derive(Clone, Copy)]
pub struct TypeInfo<'a> {
    pub program: &'a Program,
    pub module: &'a str,
    pub target: &'a TargetAbi,
}

impl<'a> TypeInfo<'a> {
    pub fn new(program: &'a Program, module: &'a str, target: &'a TargetAbi) -> Self {
        Self {
            program,
            module,
            target,
        }
    }

    pub fn decl(&self, id: DeclId) -> IrGenResult<&'a NominalDecl> {
        self.program.get(id).ok_or(IrGenError::UnknownDecl(id.0))
    }

    fn reference(&self) -> ValueLayout {
        ValueLayout::reference(self.target.pointer_size, self.target.least_valid_pointer)
    }

    /// Layout of a value of type `ty`, or `None` if it is not fixed here
    pub fn value_layout(&self, ty: &Type) -> Option<ValueLayout> {
        self.value_layout_at(ty, 0)
    }

    fn value_layout_at(&self, ty: &Type, depth: u32) -> Option<ValueLayout> {
        if depth > MAX_NESTING {
            return None;
        }
        let ps = self.target.pointer_size;
        let lvp = self.target.least_valid_pointer;
        match ty {
            Type::Builtin(b) => builtin_layout(builtin_code(*b), ps, lvp),
            Type::GenericParam(_) => None,
            Type::Tuple(elements) => {
                let mut builder = RecordBuilder::new();
                for element in elements {
                    builder.add_field(&self.value_layout_at(element, depth + 1)?);
                }
                Some(builder.finish().layout)
            }
            Type::Function { .. } => Some(function_layout(ps, lvp)),
            Type::Metatype(_) => Some(metatype_layout(ps, lvp)),
            Type::Existential(protocols) => Some(self.existential(protocols)),
            Type::Nominal { decl, args } => {
                let d = self.program.get(*decl)?;
                match d.kind {
                    DeclKind::Class => Some(self.reference()),
                    DeclKind::Protocol => Some(self.existential(&[*decl])),
                    _ if d.is_resilient_from(self.module) => None,
                    DeclKind::Struct => self.struct_layout_at(*decl, args, depth + 1).map(|r| r.layout),
                    DeclKind::Enum => self.enum_layout_at(*decl, args, depth + 1).map(|e| e.layout),
                }
            }
        }
    }

    fn existential(&self, protocols: &[DeclId]) -> ValueLayout {
        existential_layout(
            self.target.pointer_size,
            self.is_class_bound(protocols),
            protocols.len() as u64,
            self.target.least_valid_pointer,
        )
    }

    /// Whether a protocol composition only admits class types
    pub fn is_class_bound(&self, protocols: &[DeclId]) -> bool {
        let mut pending: Vec<DeclId> = protocols.to_vec();
        let mut seen = Vec::new();
        while let Some(p) = pending.pop() {
            if seen.contains(&p) {
                continue;
            }
            seen.push(p);
            if let Some(decl) = self.program.get(p) {
                if decl.class_bound {
                    return true;
                }
                pending.extend(decl.protocols.iter().copied());
            }
        }
        false
    }

    fn storage_layout(&self, field: &StoredField, depth: u32) -> Option<ValueLayout> {
        if field.indirect || field.weak {
            return Some(self.reference());
        }
        match &field.ty {
            Some(ty) => self.value_layout_at(ty, depth),
            None => Some(ValueLayout::empty()),
        }
    }

    /// Stored fields of a struct or class with `args` substituted
    pub fn stored_fields(&self, decl: &NominalDecl, args: &[Type]) -> Vec<StoredField> {
        decl.fields
            .iter()
            .map(|f: &FieldDecl| StoredField {
                name: f.name.clone(),
                ty: Some(substitute(&f.ty, args)),
                indirect: f.indirect,
                weak: f.weak,
            })
            .collect()
    }

    /// Payload cases of an enum with `args` substituted
    pub fn payload_cases(&self, decl: &NominalDecl, args: &[Type]) -> Vec<StoredField> {
        decl.cases
            .iter()
            .filter(|c| c.payload.is_some())
            .map(|c| StoredField {
                name: c.name.clone(),
                ty: c.payload.as_ref().map(|t| substitute(t, args)),
                indirect: c.indirect,
                weak: false,
            })
            .collect()
    }

    /// Record layout of a struct's stored fields
    pub fn struct_layout(&self, id: DeclId, args: &[Type]) -> Option<RecordLayout> {
        self.struct_layout_at(id, args, 0)
    }

    fn struct_layout_at(&self, id: DeclId, args: &[Type], depth: u32) -> Option<RecordLayout> {
        let decl = self.program.get(id)?;
        let mut builder = RecordBuilder::new();
        for field in self.stored_fields(decl, args) {
            builder.add_field(&self.storage_layout(&field, depth)?);
        }
        Some(builder.finish())
    }

    /// Layout of an enum from its payload cases
    pub fn enum_layout(&self, id: DeclId, args: &[Type]) -> Option<EnumLayout> {
        self.enum_layout_at(id, args, 0)
    }

    fn enum_layout_at(&self, id: DeclId, args: &[Type], depth: u32) -> Option<EnumLayout> {
        let decl = self.program.get(id)?;
        let payloads = self
            .payload_cases(decl, args)
            .iter()
            .map(|c| self.storage_layout(c, depth))
            .collect::<Option<Vec<_>>>()?;
        let empty = (decl.cases.len() - payloads.len()) as u64;
        Some(layout_enum(&payloads, empty))
    }

    /// Layout of a declaration's own value, with its parameters unbound
    pub fn decl_value_layout(&self, id: DeclId) -> Option<ValueLayout> {
        let decl = self.program.get(id)?;
        let args = identity_args(decl);
        match decl.kind {
            DeclKind::Struct => self.struct_layout(id, &args).map(|r| r.layout),
            DeclKind::Enum => self.enum_layout(id, &args).map(|e| e.layout),
            DeclKind::Class => Some(self.reference()),
            DeclKind::Protocol => Some(self.existential(&[id])),
        }
    }

    /// Class hierarchy root first, each with the generic arguments it is
    /// bound to in terms of the last class's own parameters
    pub fn hierarchy_with_args(&self, class: DeclId) -> Vec<(DeclId, Vec<Type>)> {
        let mut chain = Vec::new();
        let mut current = match self.program.get(class) {
            Some(decl) => Some((class, identity_args(decl))),
            None => None,
        };
        while let Some((id, args)) = current.take() {
            if chain.iter().any(|(seen, _)| *seen == id) {
                break;
            }
            let next = self
                .program
                .get(id)
                .and_then(|d| d.superclass.as_ref())
                .and_then(|sup| match substitute(sup, &args) {
                    Type::Nominal { decl, args } => Some((decl, args)),
                    _ => None,
                });
            chain.push((id, args));
            current = next;
        }
        chain.reverse();
        chain
    }

    /// Instance layout of a class, or `None` if some ancestor's is not fixed
    pub fn class_instance_layout(&self, class: DeclId) -> Option<ClassInstanceLayout> {
        let word = self.target.pointer_size as u64;
        let mut size = HEAP_OBJECT_HEADER_WORDS * word;
        let mut align = word;
        let mut classes = Vec::new();
        for (id, args) in self.hierarchy_with_args(class) {
            let decl = self.program.get(id)?;
            if decl.is_resilient_from(self.module) {
                return None;
            }
            let mut builder = RecordBuilder::with_start(size, align);
            let mut offsets = Vec::with_capacity(decl.fields.len());
            for field in self.stored_fields(decl, &args) {
                offsets.push(builder.add_field(&self.storage_layout(&field, 0)?));
            }
            let record = builder.finish();
            size = record.layout.size;
            align = record.layout.align;
            classes.push((id, offsets));
        }
        Some(ClassInstanceLayout {
            classes,
            size,
            align,
        })
    }

    /// Whether the member slots a class introduces sit at an offset only
    /// known at run time: the class or a strict ancestor is resilient from
    /// the compiling module
    pub fn has_dynamic_members(&self, class: DeclId) -> bool {
        self.program
            .class_hierarchy(class)
            .iter()
            .filter_map(|id| self.program.get(*id))
            .any(|d| d.is_resilient_from(self.module))
    }

    /// Whether any class in the hierarchy needs its metadata completed at run time
    pub fn class_needs_initialization(&self, class: DeclId) -> bool {
        let hierarchy = self.program.class_hierarchy(class);
        let ancestors_need_runtime = hierarchy
            .iter()
            .filter(|id| **id != class)
            .filter_map(|id| self.program.get(*id))
            .any(|d| d.is_generic() || d.foreign);
        let any_flagged = hierarchy
            .iter()
            .filter_map(|id| self.program.get(*id))
            .any(|d| d.objc || d.is_resilient_from(self.module));
        ancestors_need_runtime || any_flagged || self.class_instance_layout(class).is_none()
    }

    /// Whether a non-generic value type's layout must be computed at run time
    pub fn value_needs_initialization(&self, id: DeclId) -> bool {
        self.decl_value_layout(id).is_none()
    }

    /// First method in an override chain
    pub fn root_method(&self, method: MethodRef) -> MethodRef {
        let mut current = method;
        for _ in 0..MAX_NESTING {
            let next = self
                .program
                .get(current.class)
                .and_then(|d| d.methods.get(current.index))
                .and_then(|m| m.overrides);
            match next {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// Methods of a class that introduce a vtable slot
    pub fn introduced_methods(&self, class: DeclId) -> Vec<usize> {
        self.program
            .get(class)
            .map(|d| {
                d.methods
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.overrides.is_none())
                    .map(|(i, _)| i)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Most-derived implementation of vtable slot `slot` as seen from `class`
    pub fn implementation(&self, class: DeclId, slot: MethodRef) -> Option<MethodRef> {
        let hierarchy = self.program.class_hierarchy(class);
        for id in hierarchy.iter().rev() {
            let decl = self.program.get(*id)?;
            for (index, _) in decl.methods.iter().enumerate() {
                let candidate = MethodRef { class: *id, index };
                if self.root_method(candidate) == slot {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Number of witness tables contributed by generic parameters before `param`
    pub fn witness_index(&self, decl: &NominalDecl, param: u32, protocol: DeclId) -> Option<u32> {
        let mut index = 0u32;
        for (i, p) in decl.generic_params.iter().enumerate() {
            for req in &p.requirements {
                if i as u32 == param && *req == protocol {
                    return Some(index);
                }
                index += 1;
            }
        }
        None
    }
}

/// `[τ_0, τ_1, ...]` for a declaration's own parameters
pub fn identity_args(decl: &NominalDecl) -> Vec<Type> {
    (0..decl.generic_params.len() as u32)
        .map(Type::GenericParam)
        .collect()
}

fn substitute(ty: &Type, args: &[Type]) -> Type {
    if args.is_empty() {
        ty.clone()
    } else {
        ty.substitute(args)
    }
}
