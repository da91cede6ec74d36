//! Metadata layout scanner
//!
//! Walks a plan and records the byte offset of every slot relative to the
//! address point. Members of a class whose ancestry crosses a resilience
//! boundary cannot be placed at compile time: the runtime record may be
//! larger than this module can see. Those slots are recorded as dynamic,
//! relative to the start of the members of the class that introduces them,
//! and consumers read the real start from that class's base-offset global.

use super::plan::{walk, HeaderSlot, LayoutPlan, LayoutVisitor};
use crate::error::{IrGenResult, LayoutError};
use crate::typeinfo::TypeInfo;
use keystone_ast::{DeclId, DeclKind};
use serde::Serialize;
use std::fmt;

/// Where a slot lives relative to the address point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StoredOffset {
    /// Fixed byte offset
    Static(i32),
    /// Byte offset from the start of `boundary`'s members, known at run time
    Dynamic { boundary: DeclId, relative: i32 },
}

impl StoredOffset {
    pub fn is_static(&self) -> bool {
        matches!(self, StoredOffset::Static(_))
    }

    pub fn as_static(&self) -> Option<i32> {
        match self {
            StoredOffset::Static(offset) => Some(*offset),
            StoredOffset::Dynamic { .. } => None,
        }
    }
}

impl fmt::Display for StoredOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredOffset::Static(offset) => write!(f, "{}", offset),
            StoredOffset::Dynamic { boundary, relative } => {
                write!(f, "dynamic(#{} + {})", boundary.0, relative)
            }
        }
    }
}

/// Logical name of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SlotName {
    Header(HeaderSlot),
    GenericArgument { owner: DeclId, index: u32 },
    GenericWitness {
        owner: DeclId,
        param: u32,
        protocol: DeclId,
    },
    Method { owner: DeclId, index: usize },
    FieldOffset { owner: DeclId, index: usize },
    PayloadSize,
}

impl SlotName {
    /// Slot filled per instantiation of a generic type
    pub fn is_generic_requirement(&self) -> bool {
        matches!(
            self,
            SlotName::GenericArgument { .. } | SlotName::GenericWitness { .. }
        )
    }
}

impl fmt::Display for SlotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotName::Header(slot) => write!(f, "{}", slot),
            SlotName::GenericArgument { owner, index } => {
                write!(f, "generic argument {} of #{}", index, owner.0)
            }
            SlotName::GenericWitness { owner, param, protocol } => write!(
                f,
                "witness table of #{} for parameter {} of #{}",
                protocol.0, param, owner.0
            ),
            SlotName::Method { owner, index } => write!(f, "vtable slot {} of #{}", index, owner.0),
            SlotName::FieldOffset { owner, index } => {
                write!(f, "field offset {} of #{}", index, owner.0)
            }
            SlotName::PayloadSize => f.write_str("payload size"),
        }
    }
}

/// One recorded slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub name: SlotName,
    pub offset: StoredOffset,
    /// Offset from the address point in this module's view of the record
    pub position: i32,
    /// Size in bytes
    pub size: u8,
}

/// Members introduced by one declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemberRange {
    pub owner: DeclId,
    /// Offset of the first member from the address point, in this module's view
    pub start: i32,
    pub size: u32,
    /// Whether the real start is only known at run time
    pub dynamic: bool,
}

/// Layout of one declaration's metadata record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataLayout {
    pub decl: DeclId,
    pub kind: DeclKind,
    pub name: String,
    pub pointer_size: u8,
    /// Size of the whole record in bytes
    pub total_size: u32,
    /// Offset of the address point from the start of the record
    pub address_point: u32,
    pub slots: Vec<SlotInfo>,
    pub members: Vec<MemberRange>,
}

impl MetadataLayout {
    /// Scan a plan
    pub fn scan(info: &TypeInfo<'_>, plan: &LayoutPlan) -> IrGenResult<Self> {
        let decl = info.decl(plan.decl)?;
        let mut scanner = Scanner {
            info,
            word: info.target.pointer_size as i32,
            next: 0,
            address_point: None,
            duplicate_address_point: false,
            slots: Vec::new(),
            members: Vec::new(),
            open: None,
        };
        walk(plan, &mut scanner);
        if scanner.duplicate_address_point {
            return Err(LayoutError::DuplicateAddressPoint {
                decl: decl.name.clone(),
            }
            .into());
        }
        let address_point = scanner
            .address_point
            .ok_or_else(|| LayoutError::MissingAddressPoint {
                decl: decl.name.clone(),
            })?;
        let slots = scanner
            .slots
            .into_iter()
            .map(|s| SlotInfo {
                position: s.position - address_point,
                offset: match s.offset {
                    StoredOffset::Static(absolute) => StoredOffset::Static(absolute - address_point),
                    dynamic => dynamic,
                },
                ..s
            })
            .collect();
        let members = scanner
            .members
            .into_iter()
            .map(|m| MemberRange {
                start: m.start - address_point,
                ..m
            })
            .collect();
        Ok(Self {
            decl: plan.decl,
            kind: plan.kind,
            name: decl.name.clone(),
            pointer_size: info.target.pointer_size,
            total_size: scanner.next as u32,
            address_point: address_point as u32,
            slots,
            members,
        })
    }

    fn missing(&self, slot: impl fmt::Display) -> LayoutError {
        LayoutError::SlotNotFound {
            decl: self.name.clone(),
            slot: slot.to_string(),
        }
    }

    fn require_class(&self) -> Result<(), LayoutError> {
        if self.kind == DeclKind::Class {
            Ok(())
        } else {
            Err(LayoutError::NotAClass {
                decl: self.name.clone(),
            })
        }
    }

    pub fn slot(&self, name: SlotName) -> Option<&SlotInfo> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// Stored offset of a named slot
    pub fn offset_of(&self, name: SlotName) -> Result<StoredOffset, LayoutError> {
        self.slot(name)
            .map(|s| s.offset)
            .ok_or_else(|| self.missing(name))
    }

    /// Offset of a header slot, which never moves
    pub fn header_offset(&self, slot: HeaderSlot) -> Result<i32, LayoutError> {
        self.slot(SlotName::Header(slot))
            .map(|s| s.position)
            .ok_or_else(|| self.missing(slot))
    }

    /// Offset of the slot holding a field's offset
    pub fn field_offset(&self, owner: DeclId, index: usize) -> Result<StoredOffset, LayoutError> {
        self.offset_of(SlotName::FieldOffset { owner, index })
    }

    /// Vtable slot of a method, identified by the method that introduced it
    pub fn method_offset(&self, owner: DeclId, index: usize) -> Result<StoredOffset, LayoutError> {
        self.require_class()?;
        self.offset_of(SlotName::Method { owner, index })
    }

    /// First vtable slot this declaration introduces
    pub fn vtable_offset(&self) -> Result<StoredOffset, LayoutError> {
        self.require_class()?;
        self.own_slots()
            .find(|s| matches!(s.name, SlotName::Method { .. }))
            .map(|s| s.offset)
            .ok_or_else(|| LayoutError::NoVTable {
                decl: self.name.clone(),
            })
    }

    /// Position of the first vtable slot this declaration introduces
    pub fn vtable_position(&self) -> Result<i32, LayoutError> {
        self.require_class()?;
        self.own_slots()
            .find(|s| matches!(s.name, SlotName::Method { .. }))
            .map(|s| s.position)
            .ok_or_else(|| LayoutError::NoVTable {
                decl: self.name.clone(),
            })
    }

    /// Number of vtable slots this declaration introduces
    pub fn vtable_size(&self) -> usize {
        self.own_slots()
            .filter(|s| matches!(s.name, SlotName::Method { .. }))
            .count()
    }

    /// Where this declaration's own generic requirements start
    pub fn generic_requirements_offset(&self) -> Result<StoredOffset, LayoutError> {
        let range = self.own_members().ok_or_else(|| self.missing("own members"))?;
        Ok(self.member_offset(range, range.start))
    }

    pub fn instance_size_offset(&self) -> Result<i32, LayoutError> {
        self.require_class()?;
        self.header_offset(HeaderSlot::InstanceSize)
    }

    pub fn instance_align_mask_offset(&self) -> Result<i32, LayoutError> {
        self.require_class()?;
        self.header_offset(HeaderSlot::InstanceAlignMask)
    }

    fn member_offset(&self, range: &MemberRange, position: i32) -> StoredOffset {
        if range.dynamic {
            StoredOffset::Dynamic {
                boundary: range.owner,
                relative: position - range.start,
            }
        } else {
            StoredOffset::Static(position)
        }
    }

    pub fn members_of(&self, owner: DeclId) -> Option<&MemberRange> {
        self.members.iter().find(|m| m.owner == owner)
    }

    pub fn own_members(&self) -> Option<&MemberRange> {
        self.members_of(self.decl)
    }

    fn own_slots(&self) -> impl Iterator<Item = &SlotInfo> {
        let decl = self.decl;
        self.slots.iter().filter(move |s| slot_owner(&s.name) == Some(decl))
    }

    /// Slots the instantiation function must fill
    pub fn generic_slots(&self) -> Vec<&SlotInfo> {
        self.own_slots()
            .filter(|s| s.name.is_generic_requirement())
            .collect()
    }

    /// Field offset slots of this declaration's own stored properties
    pub fn own_field_offsets(&self) -> Vec<&SlotInfo> {
        self.own_slots()
            .filter(|s| matches!(s.name, SlotName::FieldOffset { .. }))
            .collect()
    }

    /// Whether any slot needs a run-time base offset
    pub fn has_dynamic_slots(&self) -> bool {
        self.slots.iter().any(|s| !s.offset.is_static())
    }

    /// Absolute position in the record of an address-point-relative offset
    pub fn absolute(&self, relative: i32) -> u32 {
        (relative + self.address_point as i32) as u32
    }
}

fn slot_owner(name: &SlotName) -> Option<DeclId> {
    match name {
        SlotName::GenericArgument { owner, .. }
        | SlotName::GenericWitness { owner, .. }
        | SlotName::Method { owner, .. }
        | SlotName::FieldOffset { owner, .. } => Some(*owner),
        SlotName::Header(_) | SlotName::PayloadSize => None,
    }
}

struct OpenRange {
    owner: DeclId,
    start: i32,
    dynamic: bool,
}

struct Scanner<'a, 'b> {
    info: &'b TypeInfo<'a>,
    word: i32,
    next: i32,
    address_point: Option<i32>,
    duplicate_address_point: bool,
    slots: Vec<SlotInfo>,
    members: Vec<MemberRange>,
    open: Option<OpenRange>,
}

impl Scanner<'_, '_> {
    fn record(&mut self, name: SlotName, size: i32) {
        let position = self.next;
        let offset = match &self.open {
            Some(range) if range.dynamic => StoredOffset::Dynamic {
                boundary: range.owner,
                relative: position - range.start,
            },
            _ => StoredOffset::Static(position),
        };
        self.slots.push(SlotInfo {
            name,
            offset,
            position,
            size: size as u8,
        });
        self.next += size;
    }
}

impl LayoutVisitor for Scanner<'_, '_> {
    fn add_word(&mut self, slot: HeaderSlot) {
        self.record(SlotName::Header(slot), self.word);
    }

    fn add_int32(&mut self, slot: HeaderSlot) {
        self.record(SlotName::Header(slot), 4);
    }

    fn add_int16(&mut self, slot: HeaderSlot) {
        self.record(SlotName::Header(slot), 2);
    }

    fn note_address_point(&mut self) {
        if self.address_point.is_some() {
            self.duplicate_address_point = true;
        }
        self.address_point = Some(self.next);
    }

    fn begin_members(&mut self, owner: DeclId) {
        let dynamic = self
            .info
            .program
            .get(owner)
            .is_some_and(|d| d.kind == DeclKind::Class)
            && self.info.has_dynamic_members(owner);
        self.open = Some(OpenRange {
            owner,
            start: self.next,
            dynamic,
        });
    }

    fn end_members(&mut self, owner: DeclId) {
        if let Some(range) = self.open.take() {
            self.members.push(MemberRange {
                owner,
                start: range.start,
                size: (self.next - range.start) as u32,
                dynamic: range.dynamic,
            });
        }
    }

    fn add_generic_argument(&mut self, owner: DeclId, index: u32) {
        self.record(SlotName::GenericArgument { owner, index }, self.word);
    }

    fn add_generic_witness(&mut self, owner: DeclId, param: u32, protocol: DeclId) {
        self.record(
            SlotName::GenericWitness {
                owner,
                param,
                protocol,
            },
            self.word,
        );
    }

    fn add_method(&mut self, owner: DeclId, index: usize) {
        self.record(SlotName::Method { owner, index }, self.word);
    }

    fn add_field_offset(&mut self, owner: DeclId, index: usize) {
        self.record(SlotName::FieldOffset { owner, index }, self.word);
    }

    fn add_payload_size(&mut self) {
        self.record(SlotName::PayloadSize, self.word);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_abi::kind::class_layout;
    use keystone_abi::{Arch, ObjectFormat, TargetAbi};
    use keystone_ast::{BuiltinType, NominalDecl, Program, Type};

    fn scan(program: &Program, module: &str, target: &TargetAbi, id: DeclId) -> MetadataLayout {
        let info = TypeInfo::new(program, module, target);
        let plan = LayoutPlan::build(&info, id).unwrap();
        MetadataLayout::scan(&info, &plan).unwrap()
    }

    #[test]
    fn test_class_header_matches_runtime_offsets() {
        let mut program = Program::new();
        let class = program.add(NominalDecl::class("Node", "main").with_method("visit"));
        let target = TargetAbi::lookup(Arch::X86_64, ObjectFormat::Elf);
        let layout = scan(&program, "main", &target, class);
        let expected = [
            (HeaderSlot::Isa, class_layout::ISA),
            (HeaderSlot::Superclass, class_layout::SUPERCLASS),
            (HeaderSlot::Cache(0), class_layout::CACHE),
            (HeaderSlot::Data, class_layout::DATA),
            (HeaderSlot::ClassFlags, class_layout::FLAGS),
            (HeaderSlot::InstanceAddressPoint, class_layout::INSTANCE_ADDRESS_POINT),
            (HeaderSlot::InstanceSize, class_layout::INSTANCE_SIZE),
            (HeaderSlot::InstanceAlignMask, class_layout::INSTANCE_ALIGN_MASK),
            (HeaderSlot::Reserved, class_layout::RESERVED),
            (HeaderSlot::ClassSize, class_layout::CLASS_SIZE),
            (HeaderSlot::ClassAddressPoint, class_layout::CLASS_ADDRESS_POINT),
            (HeaderSlot::Descriptor, class_layout::DESCRIPTOR),
            (HeaderSlot::IvarDestroyer, class_layout::IVAR_DESTROYER),
        ];
        for (slot, offset) in expected {
            assert_eq!(layout.header_offset(slot).unwrap() as i64, offset, "{}", slot);
        }
        assert_eq!(layout.address_point as i64, class_layout::PREFIX_WORDS * 8);
        assert_eq!(
            layout.vtable_offset().unwrap(),
            StoredOffset::Static(class_layout::MEMBERS as i32)
        );
        assert_eq!(layout.vtable_position().unwrap() as i64, class_layout::MEMBERS);
        assert_eq!(layout.total_size, 16 + 88);
        assert_eq!(layout.header_offset(HeaderSlot::Destructor).unwrap(), -16);
    }

    #[test]
    fn test_class_without_methods_has_no_vtable() {
        let mut program = Program::new();
        let class = program.add(
            NominalDecl::class("Plain", "main").with_field("id", Type::Builtin(BuiltinType::Int64)),
        );
        let target = TargetAbi::lookup(Arch::X86_64, ObjectFormat::Elf);
        let layout = scan(&program, "main", &target, class);
        assert_eq!(layout.vtable_size(), 0);
        assert!(matches!(layout.vtable_offset(), Err(LayoutError::NoVTable { .. })));
        assert!(matches!(layout.vtable_position(), Err(LayoutError::NoVTable { .. })));
    }

    #[test]
    fn test_struct_layout_offsets() {
        let mut program = Program::new();
        let point = program.add(
            NominalDecl::structure("Point", "main")
                .with_field("x", Type::Builtin(BuiltinType::Int32))
                .with_field("y", Type::Builtin(BuiltinType::Bool)),
        );
        let target = TargetAbi::lookup(Arch::I386, ObjectFormat::Elf);
        let layout = scan(&program, "main", &target, point);
        assert_eq!(layout.address_point, 4);
        assert_eq!(layout.field_offset(point, 0).unwrap(), StoredOffset::Static(8));
        assert_eq!(layout.field_offset(point, 1).unwrap(), StoredOffset::Static(12));
        assert_eq!(layout.total_size, 20);
        assert!(matches!(
            layout.vtable_offset(),
            Err(LayoutError::NotAClass { .. })
        ));
        assert!(layout.field_offset(DeclId(7), 0).is_err());
    }

    #[test]
    fn test_resilient_ancestor_makes_slots_dynamic() {
        let mut program = Program::new();
        let base = program.add(
            NominalDecl::class("Base", "lib")
                .with_field("a", Type::Builtin(BuiltinType::Int64))
                .resilient(),
        );
        let derived = program.add(
            NominalDecl::class("Derived", "main")
                .with_superclass(Type::nominal(base))
                .with_method("go")
                .with_field("b", Type::Builtin(BuiltinType::Int32)),
        );
        let target = TargetAbi::lookup(Arch::X86_64, ObjectFormat::Elf);
        let layout = scan(&program, "main", &target, derived);
        assert_eq!(
            layout.method_offset(derived, 0).unwrap(),
            StoredOffset::Dynamic {
                boundary: derived,
                relative: 0
            }
        );
        assert_eq!(
            layout.field_offset(derived, 0).unwrap(),
            StoredOffset::Dynamic {
                boundary: derived,
                relative: 8
            }
        );
        assert_eq!(
            layout.instance_size_offset().unwrap() as i64,
            class_layout::INSTANCE_SIZE
        );
        let own = layout.own_members().unwrap();
        assert!(own.dynamic);
        assert_eq!(own.start, 88);

        let lib_view = scan(&program, "lib", &target, derived);
        assert!(!lib_view.has_dynamic_slots());
    }

    #[test]
    fn test_generic_slots_are_own_requirements() {
        let mut program = Program::new();
        let base = program.add(NominalDecl::class("Base", "main").with_generic_param("T", vec![]));
        let derived = program.add(
            NominalDecl::class("Derived", "main")
                .with_generic_param("U", vec![])
                .with_superclass(Type::bound(base, vec![Type::GenericParam(0)])),
        );
        let target = TargetAbi::lookup(Arch::X86_64, ObjectFormat::Elf);
        let layout = scan(&program, "main", &target, derived);
        let generic: Vec<SlotName> = layout.generic_slots().iter().map(|s| s.name).collect();
        assert_eq!(
            generic,
            vec![SlotName::GenericArgument {
                owner: derived,
                index: 0
            }]
        );
        assert_eq!(
            layout.generic_requirements_offset().unwrap(),
            StoredOffset::Static(88)
        );
    }
}
