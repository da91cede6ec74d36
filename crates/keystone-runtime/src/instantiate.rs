//! Generic metadata instantiation
//!
//! One table keyed by (pattern, arguments). The thread that inserts a key
//! builds the record by running the pattern's instantiation function; other
//! threads asking for the same key block until it is ready. A request for the
//! key from the building thread itself returns the partially built record, so
//! a generic class whose field type mentions its own instantiation
//! terminates.

use crate::error::{RuntimeError, RuntimeResult};
use crate::interpreter::Pending;
use crate::{Counters, Runtime};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use keystone_abi::kind::pattern_header;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InstanceKey {
    pattern: u64,
    args: Box<[u64]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceState {
    Building { thread: ThreadId, partial: u64 },
    Ready(u64),
    Failed,
}

/// One instantiation, possibly still being built
#[derive(Debug)]
pub(crate) struct Instance {
    state: Mutex<InstanceState>,
    ready: Condvar,
}

impl Instance {
    fn building() -> Self {
        Self {
            state: Mutex::new(InstanceState::Building {
                thread: thread::current().id(),
                partial: 0,
            }),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn publish_partial(&self, metadata: u64) {
        if let InstanceState::Building { partial, .. } = &mut *self.state.lock() {
            *partial = metadata;
        }
    }

    fn complete(&self, state: InstanceState) {
        *self.state.lock() = state;
        self.ready.notify_all();
    }

    fn wait(&self, pattern: u64) -> RuntimeResult<u64> {
        let current = thread::current().id();
        let mut state = self.state.lock();
        loop {
            let observed = *state;
            match observed {
                InstanceState::Ready(metadata) => return Ok(metadata),
                InstanceState::Failed => return Err(RuntimeError::InstantiationFailed { pattern }),
                InstanceState::Building { thread, partial } if thread == current => {
                    return match partial {
                        0 => Err(RuntimeError::CyclicDependency { address: pattern }),
                        partial => Ok(partial),
                    }
                }
                InstanceState::Building { .. } => self.ready.wait(&mut state),
            }
        }
    }
}

/// Unique generic instantiations
#[derive(Debug, Default)]
pub(crate) struct InstanceTable {
    entries: DashMap<InstanceKey, Arc<Instance>>,
}

impl Runtime {
    /// Unique metadata for `pattern` applied to `args`
    pub(crate) fn instantiate(&self, pattern: u64, args: &[u64]) -> RuntimeResult<u64> {
        let key = InstanceKey {
            pattern,
            args: args.into(),
        };
        // The shard lock is released at the end of this statement.
        let (instance, builder) = match self.instances.entries.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let instance = Arc::new(Instance::building());
                entry.insert(instance.clone());
                (instance, true)
            }
        };
        if !builder {
            return instance.wait(pattern);
        }

        let create = self
            .memory
            .read_relative(pattern + pattern_header::CREATE_FUNCTION as u64);
        let result = create.and_then(|create| {
            self.call_with(create, args, 0, Some(Pending::Instance(instance.clone())))
        });
        match result {
            Ok(metadata) => {
                instance.complete(InstanceState::Ready(metadata));
                Counters::bump(&self.counters.instantiations);
                debug!(pattern, metadata, args = args.len(), "instantiated generic metadata");
                Ok(metadata)
            }
            Err(error) => {
                self.instances.entries.remove(&key);
                instance.complete(InstanceState::Failed);
                warn!(pattern, %error, "generic instantiation failed");
                Err(error)
            }
        }
    }
}
