//! Structural type metadata and foreign metadata uniquing
//!
//! Tuple, function, existential and metatype records have no declaration to
//! hang a cache off, so the runtime keeps one table per shape. A record is
//! built outside the table lock; when two threads race on the same key the
//! loser frees its copy and returns the winner.
//!
//! Each record is one allocation: a value witness table, the pointer to it,
//! then the kind word at the address point followed by the shape's words.

use crate::error::RuntimeResult;
use crate::{Counters, Runtime};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use keystone_abi::kind::{existential_metadata, vwt};
use keystone_abi::value::{existential_layout, function_layout, layout_record, metatype_layout};
use keystone_abi::{MetadataKind, ValueLayout};
use std::hash::Hash;
use tracing::{debug, trace};

/// Bytes before the address point of a structural record
const RECORD_PREFIX: u64 = (vwt::WORDS as u64 + 1) * 8;

#[derive(Debug, Default)]
pub(crate) struct StructuralCache {
    tuples: DashMap<Vec<u64>, u64>,
    functions: DashMap<(Vec<u64>, u64), u64>,
    existentials: DashMap<(Vec<u64>, bool), u64>,
    metatypes: DashMap<u64, u64>,
    /// Canonical foreign metadata by `module.name`
    foreign: DashMap<String, u64>,
}

impl Runtime {
    fn build_record(&self, kind: MetadataKind, layout: &ValueLayout, words: &[u64]) -> RuntimeResult<u64> {
        let block = self
            .memory
            .allocate(RECORD_PREFIX + 8 + words.len() as u64 * 8)?;
        for (index, function) in self.builtins.value_witness_functions().iter().enumerate() {
            self.memory.write_word(block + index as u64 * 8, *function)?;
        }
        let ps = self.target.pointer_size;
        let table = [
            (vwt::SIZE, layout.size),
            (vwt::FLAGS, layout.vwt_flags(ps)),
            (vwt::STRIDE, layout.stride),
            (vwt::EXTRA_INHABITANTS, layout.extra_inhabitants as u64),
        ];
        for (index, value) in table {
            self.memory.write_word(block + index as u64 * 8, value)?;
        }
        let metadata = block + RECORD_PREFIX;
        self.memory.write_word(metadata - 8, block)?;
        self.memory.write_word(metadata, kind.value())?;
        for (index, word) in words.iter().enumerate() {
            self.memory
                .write_word(metadata + (index as u64 + 1) * 8, *word)?;
        }
        Ok(metadata)
    }

    fn unique<K: Eq + Hash>(
        &self,
        table: &DashMap<K, u64>,
        key: K,
        kind: MetadataKind,
        build: impl FnOnce() -> RuntimeResult<(ValueLayout, Vec<u64>)>,
    ) -> RuntimeResult<u64> {
        if let Some(existing) = table.get(&key) {
            return Ok(*existing);
        }
        let (layout, words) = build()?;
        let metadata = self.build_record(kind, &layout, &words)?;
        match table.entry(key) {
            Entry::Occupied(entry) => {
                let winner = *entry.get();
                drop(entry);
                self.memory.free(metadata - RECORD_PREFIX)?;
                trace!(?kind, winner, "lost structural metadata race");
                Ok(winner)
            }
            Entry::Vacant(entry) => {
                entry.insert(metadata);
                Counters::bump(&self.counters.structural_records);
                trace!(?kind, metadata, "created structural metadata");
                Ok(metadata)
            }
        }
    }

    /// Unique tuple metadata
    pub fn tuple_metadata(&self, elements: &[u64]) -> RuntimeResult<u64> {
        self.unique(&self.structural.tuples, elements.to_vec(), MetadataKind::Tuple, || {
            let layouts = elements
                .iter()
                .map(|element| self.value_layout_of(*element))
                .collect::<RuntimeResult<Vec<_>>>()?;
            let record = layout_record(&layouts);
            let mut words = vec![elements.len() as u64, 0];
            for (element, offset) in elements.iter().zip(&record.offsets) {
                words.push(*element);
                words.push(*offset);
            }
            Ok((record.layout, words))
        })
    }

    /// Unique function metadata
    pub fn function_metadata(&self, params: &[u64], result: u64) -> RuntimeResult<u64> {
        let key = (params.to_vec(), result);
        self.unique(&self.structural.functions, key, MetadataKind::Function, || {
            let mut words = vec![params.len() as u64, result];
            words.extend_from_slice(params);
            let layout = function_layout(self.target.pointer_size, self.target.least_valid_pointer);
            Ok((layout, words))
        })
    }

    /// Unique existential metadata for a protocol composition
    pub fn existential_metadata(&self, protocols: &[u64], class_bound: bool) -> RuntimeResult<u64> {
        let key = (protocols.to_vec(), class_bound);
        self.unique(&self.structural.existentials, key, MetadataKind::Existential, || {
            let count = protocols.len() as u64;
            let mut flags = count & existential_metadata::NUM_WITNESS_TABLES_MASK;
            if class_bound {
                flags |= existential_metadata::CLASS_CONSTRAINT;
            }
            let mut words = vec![flags, count];
            words.extend_from_slice(protocols);
            let layout = existential_layout(
                self.target.pointer_size,
                class_bound,
                count,
                self.target.least_valid_pointer,
            );
            Ok((layout, words))
        })
    }

    /// Unique metatype metadata
    pub fn metatype_metadata(&self, instance: u64) -> RuntimeResult<u64> {
        self.unique(&self.structural.metatypes, instance, MetadataKind::Metatype, || {
            let layout = metatype_layout(self.target.pointer_size, self.target.least_valid_pointer);
            Ok((layout, vec![instance]))
        })
    }

    /// Canonical record for foreign metadata; the first registration of a
    /// name wins
    pub(crate) fn register_foreign(&self, metadata: u64) -> RuntimeResult<u64> {
        let descriptor = self.descriptor_of(metadata)?;
        let name = self.descriptor_name(descriptor)?;
        let canonical = match self.structural.foreign.entry(name) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                debug!(name = %entry.key(), metadata, "registered foreign metadata");
                entry.insert(metadata);
                Counters::bump(&self.counters.foreign_registrations);
                metadata
            }
        };
        if canonical != metadata {
            trace!(metadata, canonical, "foreign metadata already registered");
        }
        Ok(canonical)
    }
}
