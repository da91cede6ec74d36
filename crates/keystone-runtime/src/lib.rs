//! Keystone Runtime
//!
//! Loads linked images into process memory and executes their function
//! bodies: metadata access functions, generic instantiation functions, field
//! type accessors and method stubs. Caches are real words in memory read and
//! written with atomics, so concurrent callers observe the same publication
//! protocol compiled code would.

mod builtins;
mod class;
pub mod error;
mod instantiate;
mod interpreter;
pub mod loader;
pub mod memory;
mod metadata;
mod object;
mod once;
mod structural;
mod value;

pub use error::{LoadError, RuntimeError, RuntimeResult};
pub use loader::{LoadedImage, SectionRange};
pub use memory::Memory;
pub use metadata::FieldType;

use builtins::Builtins;
use dashmap::DashMap;
use instantiate::InstanceTable;
use keystone_abi::{AccessOp, TargetAbi};
use once::OnceTable;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use structural::StructuralCache;

/// Counters exposed for tests and diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Once regions that ran to completion
    pub once_regions_run: u64,
    /// Generic instantiations built
    pub instantiations: u64,
    /// Field type vectors freed after losing the publish race
    pub freed_field_vectors: u64,
    /// Foreign metadata records that became canonical
    pub foreign_registrations: u64,
    /// Tuple, function, existential and metatype records created
    pub structural_records: u64,
    pub allocated_bytes: usize,
}

#[derive(Debug, Default)]
struct Counters {
    once_regions_run: AtomicU64,
    instantiations: AtomicU64,
    freed_field_vectors: AtomicU64,
    foreign_registrations: AtomicU64,
    structural_records: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A process's metadata runtime
pub struct Runtime {
    target: TargetAbi,
    memory: Memory,
    builtins: Builtins,
    /// Exported symbols of every loaded image, first definition wins
    symbols: DashMap<String, u64>,
    images: RwLock<Vec<Arc<LoadedImage>>>,
    /// Decoded function bodies by address
    programs: DashMap<u64, Arc<[AccessOp<u64>]>>,
    once: OnceTable,
    instances: InstanceTable,
    structural: StructuralCache,
    counters: Counters,
}

static GLOBAL: Lazy<Result<Runtime, RuntimeError>> = Lazy::new(Runtime::new);

impl Runtime {
    /// Runtime for the host target with builtin symbols installed
    pub fn new() -> RuntimeResult<Self> {
        let target = TargetAbi::host();
        let memory = Memory::new();
        let builtins = Builtins::install(&memory, &target)?;
        Ok(Self {
            target,
            memory,
            builtins,
            symbols: DashMap::new(),
            images: RwLock::new(Vec::new()),
            programs: DashMap::new(),
            once: OnceTable::default(),
            instances: InstanceTable::default(),
            structural: StructuralCache::default(),
            counters: Counters::default(),
        })
    }

    /// The process-wide runtime
    pub fn global() -> RuntimeResult<&'static Runtime> {
        GLOBAL.as_ref().map_err(Clone::clone)
    }

    pub fn target(&self) -> &TargetAbi {
        &self.target
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Address of a builtin or exported symbol
    pub fn symbol(&self, name: &str) -> Option<u64> {
        self.builtins
            .symbol(name)
            .or_else(|| self.symbols.get(name).map(|entry| *entry))
    }

    /// Every loaded image, in load order
    pub fn images(&self) -> Vec<Arc<LoadedImage>> {
        self.images.read().clone()
    }

    /// Whether `[address, address + len)` is runtime memory
    pub fn is_mapped(&self, address: u64, len: u64) -> bool {
        self.memory.contains(address, len)
    }

    /// Call a function body with arguments
    pub fn invoke(&self, function: u64, args: &[u64]) -> RuntimeResult<u64> {
        self.call(function, args, 0)
    }

    /// Call a function body by symbol name
    pub fn invoke_symbol(&self, name: &str, args: &[u64]) -> RuntimeResult<u64> {
        let function = self
            .symbol(name)
            .ok_or_else(|| RuntimeError::UnknownSymbol(name.to_string()))?;
        self.invoke(function, args)
    }

    /// Call the method in the vtable slot at byte `offset` from a class's address point
    pub fn call_method(&self, class: u64, offset: i32) -> RuntimeResult<u64> {
        let function = self
            .memory
            .read_word(class.wrapping_add(offset as i64 as u64))?;
        self.call(function, &[], class)
    }

    pub fn stats(&self) -> RuntimeStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RuntimeStats {
            once_regions_run: load(&self.counters.once_regions_run),
            instantiations: load(&self.counters.instantiations),
            freed_field_vectors: load(&self.counters.freed_field_vectors),
            foreign_registrations: load(&self.counters.foreign_registrations),
            structural_records: load(&self.counters.structural_records),
            allocated_bytes: self.memory.allocated_bytes(),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("target", &self.target)
            .field("images", &self.images.read().len())
            .field("stats", &self.stats())
            .finish()
    }
}
