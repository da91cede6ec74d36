//! Run-once gates for one-time metadata initialization
//!
//! One gate per once-token address. The first thread through runs the region;
//! threads arriving meanwhile block until it finishes. A request from the
//! initializing thread itself (a class whose field type is the class) gets
//! the partially initialized record back instead of deadlocking. A region
//! that fails leaves the gate idle so a later call can retry.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    Running { thread: ThreadId, partial: u64 },
    Done,
}

/// Outcome of entering a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Entered {
    /// The caller must run the region and then call `finish`
    Run,
    /// Another call completed the region
    Done,
    /// The region is running on this thread; carries the partial record
    Reentered(u64),
}

#[derive(Debug)]
pub(crate) struct OnceGate {
    state: Mutex<GateState>,
    finished: Condvar,
}

impl OnceGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Idle),
            finished: Condvar::new(),
        }
    }

    pub(crate) fn enter(&self) -> Entered {
        let current = thread::current().id();
        let mut state = self.state.lock();
        loop {
            let observed = *state;
            match observed {
                GateState::Idle => {
                    *state = GateState::Running {
                        thread: current,
                        partial: 0,
                    };
                    return Entered::Run;
                }
                GateState::Done => return Entered::Done,
                GateState::Running { thread, partial } if thread == current => {
                    return Entered::Reentered(partial)
                }
                GateState::Running { .. } => self.finished.wait(&mut state),
            }
        }
    }

    /// Record the metadata being initialized for recursive requests
    pub(crate) fn publish_partial(&self, metadata: u64) {
        if let GateState::Running { partial, .. } = &mut *self.state.lock() {
            *partial = metadata;
        }
    }

    pub(crate) fn finish(&self, success: bool) {
        *self.state.lock() = if success {
            GateState::Done
        } else {
            GateState::Idle
        };
        self.finished.notify_all();
    }
}

/// Gates by token address
#[derive(Debug, Default)]
pub(crate) struct OnceTable {
    gates: DashMap<u64, Arc<OnceGate>>,
}

impl OnceTable {
    pub(crate) fn gate(&self, token: u64) -> Arc<OnceGate> {
        self.gates
            .entry(token)
            .or_insert_with(|| Arc::new(OnceGate::new()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn test_reentry_returns_partial() {
        let table = OnceTable::default();
        let gate = table.gate(0x1000);
        assert_eq!(gate.enter(), Entered::Run);
        assert_eq!(gate.enter(), Entered::Reentered(0));
        gate.publish_partial(0xABC0);
        assert_eq!(table.gate(0x1000).enter(), Entered::Reentered(0xABC0));
        gate.finish(true);
        assert_eq!(gate.enter(), Entered::Done);
    }

    #[test]
    fn test_failed_region_can_retry() {
        let gate = OnceGate::new();
        assert_eq!(gate.enter(), Entered::Run);
        gate.finish(false);
        assert_eq!(gate.enter(), Entered::Run);
    }

    #[test]
    fn test_one_runner_across_threads() {
        let table = Arc::new(OnceTable::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let table = table.clone();
                let runs = runs.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let gate = table.gate(0x2000);
                    match gate.enter() {
                        Entered::Run => {
                            runs.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            gate.finish(true);
                        }
                        Entered::Done => {}
                        Entered::Reentered(_) => panic!("reentered on another thread"),
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
