//! Memoized metadata layouts
//!
//! Declarations are immutable once validated, so a layout is scanned at most
//! once per session and never invalidated.

use super::plan::LayoutPlan;
use super::scanner::MetadataLayout;
use crate::error::IrGenResult;
use crate::typeinfo::TypeInfo;
use keystone_ast::DeclId;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Default)]
pub struct LayoutCache {
    layouts: FxHashMap<DeclId, Arc<MetadataLayout>>,
    hits: u64,
}

impl LayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layout of `id`, scanning it on first request
    pub fn get_or_compute(
        &mut self,
        info: &TypeInfo<'_>,
        id: DeclId,
    ) -> IrGenResult<Arc<MetadataLayout>> {
        if let Some(layout) = self.layouts.get(&id) {
            self.hits += 1;
            trace!(decl = id.0, "layout cache hit");
            return Ok(Arc::clone(layout));
        }
        let plan = LayoutPlan::build(info, id)?;
        let layout = Arc::new(MetadataLayout::scan(info, &plan)?);
        debug!(
            decl = %layout.name,
            size = layout.total_size,
            address_point = layout.address_point,
            "scanned metadata layout"
        );
        self.layouts.insert(id, Arc::clone(&layout));
        Ok(layout)
    }

    pub fn get(&self, id: DeclId) -> Option<Arc<MetadataLayout>> {
        self.layouts.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Number of requests answered without scanning
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// All layouts, ordered by declaration
    pub fn sorted(&self) -> Vec<Arc<MetadataLayout>> {
        let mut layouts: Vec<_> = self.layouts.values().cloned().collect();
        layouts.sort_by_key(|l| l.decl);
        layouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_abi::{Arch, ObjectFormat, TargetAbi};
    use keystone_ast::{NominalDecl, Program};

    #[test]
    fn test_layout_scanned_once() {
        let mut program = Program::new();
        let class = program.add(NominalDecl::class("C", "main").with_method("m"));
        let target = TargetAbi::lookup(Arch::Arm64, ObjectFormat::MachO);
        let info = TypeInfo::new(&program, "main", &target);
        let mut cache = LayoutCache::new();
        let first = cache.get_or_compute(&info, class).unwrap();
        let second = cache.get_or_compute(&info, class).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn test_failed_scan_is_not_cached() {
        let mut program = Program::new();
        let proto = program.add(NominalDecl::protocol("P", "main"));
        let target = TargetAbi::lookup(Arch::Arm64, ObjectFormat::MachO);
        let info = TypeInfo::new(&program, "main", &target);
        let mut cache = LayoutCache::new();
        assert!(cache.get_or_compute(&info, proto).is_err());
        assert!(cache.is_empty());
    }
}
