//! Function body interpreter
//!
//! Executes the op programs stored in an image's text section. Each call gets
//! a frame holding the arguments, the context metadata (the record whose
//! generic arguments context-relative recipes read), an accumulator and the
//! field type vector under construction.
//!
//! Caches are read with a relaxed load: everything reached through the loaded
//! pointer was written before the release store that published it, and the
//! address dependency orders those reads. `AcquireFence` makes that ordering
//! explicit for race detectors that do not model dependencies.

use crate::error::{RuntimeError, RuntimeResult};
use crate::instantiate::Instance;
use crate::once::{Entered, OnceGate};
use crate::{Counters, Runtime};
use keystone_abi::kind::pattern_header;
use keystone_abi::opcode::decode_program;
use keystone_abi::{AccessOp, CacheRef, TypeRecipe};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Bytes of a value witness table
const VWT_BYTES: u64 = keystone_abi::kind::vwt::WORDS as u64 * 8;

/// Arguments and context of one call
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scope<'a> {
    pub function: u64,
    pub args: &'a [u64],
    pub context: u64,
}

impl<'a> Scope<'a> {
    /// Scope for evaluating recipes against a metadata record
    pub fn context(context: u64) -> Scope<'static> {
        Scope {
            function: 0,
            args: &[],
            context,
        }
    }

    fn arg(&self, index: u16) -> RuntimeResult<u64> {
        self.args
            .get(index as usize)
            .copied()
            .ok_or(RuntimeError::MissingArgument {
                function: self.function,
                index,
            })
    }

    fn require_context(&self) -> RuntimeResult<u64> {
        match self.context {
            0 => Err(RuntimeError::NoContext {
                function: self.function,
            }),
            context => Ok(context),
        }
    }
}

/// Metadata under construction that recursive requests may see early
pub(crate) enum Pending {
    Once(Arc<OnceGate>),
    Instance(Arc<Instance>),
}

impl Pending {
    fn publish(&self, metadata: u64) {
        match self {
            Pending::Once(gate) => gate.publish_partial(metadata),
            Pending::Instance(instance) => instance.publish_partial(metadata),
        }
    }
}

struct Frame<'a> {
    scope: Scope<'a>,
    acc: u64,
    /// Vector address and entry count
    field_types: Option<(u64, u32)>,
    pending: Option<Pending>,
}

impl Frame<'_> {
    fn publish_partial(&self) {
        if let Some(pending) = &self.pending {
            pending.publish(self.acc);
        }
    }
}

enum Flow {
    Next,
    Return(u64),
}

/// Index of the `EndOnce` closing the `BeginOnce` at `start`
fn matching_end(program: &[AccessOp<u64>], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (index, op) in program.iter().enumerate().skip(start) {
        match op {
            AccessOp::BeginOnce(_) => depth += 1,
            AccessOp::EndOnce => {
                depth -= 1;
                if depth == 0 {
                    return Some(index);
                }
            }
            _ => {}
        }
    }
    None
}

impl Runtime {
    /// Decoded body of the function at `function`
    pub(crate) fn program(&self, function: u64) -> RuntimeResult<Arc<[AccessOp<u64>]>> {
        if let Some(program) = self.programs.get(&function) {
            return Ok(program.clone());
        }
        let len = self.memory.read_u32(function)? as u64 + 4;
        let bytes = self.memory.read_bytes(function, len)?;
        let ops: Arc<[AccessOp<u64>]> = decode_program(&bytes, function)
            .map_err(|source| RuntimeError::Decode { function, source })?
            .into();
        trace!(function, ops = ops.len(), "decoded function body");
        Ok(self.programs.entry(function).or_insert(ops).clone())
    }

    pub(crate) fn call(&self, function: u64, args: &[u64], context: u64) -> RuntimeResult<u64> {
        self.call_with(function, args, context, None)
    }

    pub(crate) fn call_with(
        &self,
        function: u64,
        args: &[u64],
        context: u64,
        pending: Option<Pending>,
    ) -> RuntimeResult<u64> {
        let program = self.program(function)?;
        let mut frame = Frame {
            scope: Scope {
                function,
                args,
                context,
            },
            acc: 0,
            field_types: None,
            pending,
        };
        match self.execute(&program, 0, program.len(), &mut frame)? {
            Flow::Return(value) => Ok(value),
            Flow::Next => Err(RuntimeError::MissingReturn { function }),
        }
    }

    fn execute(
        &self,
        program: &[AccessOp<u64>],
        start: usize,
        end: usize,
        frame: &mut Frame<'_>,
    ) -> RuntimeResult<Flow> {
        let function = frame.scope.function;
        let mut pc = start;
        while pc < end {
            match &program[pc] {
                AccessOp::BeginOnce(token) => {
                    let close = matching_end(program, pc)
                        .filter(|close| *close < end)
                        .ok_or(RuntimeError::UnbalancedOnce { function })?;
                    if let Flow::Return(value) = self.run_once(*token, program, pc + 1, close, frame)? {
                        return Ok(Flow::Return(value));
                    }
                    pc = close + 1;
                    continue;
                }
                AccessOp::EndOnce => return Err(RuntimeError::UnbalancedOnce { function }),
                op => {
                    if let Flow::Return(value) = self.step(op, frame)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            pc += 1;
        }
        Ok(Flow::Next)
    }

    fn run_once(
        &self,
        token: u64,
        program: &[AccessOp<u64>],
        start: usize,
        end: usize,
        frame: &mut Frame<'_>,
    ) -> RuntimeResult<Flow> {
        let word = self.memory.atomic(token)?;
        if word.load(Ordering::Acquire) != 0 {
            return Ok(Flow::Next);
        }
        let gate = self.once.gate(token);
        match gate.enter() {
            Entered::Done => Ok(Flow::Next),
            Entered::Reentered(0) => Err(RuntimeError::CyclicDependency { address: token }),
            Entered::Reentered(partial) => Ok(Flow::Return(partial)),
            Entered::Run => {
                let outer = frame.pending.replace(Pending::Once(gate.clone()));
                let result = self.execute(program, start, end, frame);
                frame.pending = outer;
                match &result {
                    Ok(_) => {
                        word.store(1, Ordering::Release);
                        gate.finish(true);
                        Counters::bump(&self.counters.once_regions_run);
                        debug!(token, "once region complete");
                    }
                    Err(error) => {
                        gate.finish(false);
                        debug!(token, %error, "once region failed");
                    }
                }
                result
            }
        }
    }

    fn cache_address(&self, cache: &CacheRef<u64>, scope: &Scope<'_>) -> RuntimeResult<u64> {
        match cache {
            CacheRef::Global(address) => Ok(*address),
            CacheRef::MetadataSlot(offset) => Ok(scope
                .require_context()?
                .wrapping_add(*offset as i64 as u64)),
        }
    }

    fn step(&self, op: &AccessOp<u64>, frame: &mut Frame<'_>) -> RuntimeResult<Flow> {
        let function = frame.scope.function;
        match op {
            AccessOp::LoadCache(cache) => {
                let address = self.cache_address(cache, &frame.scope)?;
                frame.acc = self.memory.atomic(address)?.load(Ordering::Relaxed);
            }
            AccessOp::AcquireFence => fence(Ordering::Acquire),
            AccessOp::ReturnIfNonNull => {
                if frame.acc != 0 {
                    return Ok(Flow::Return(frame.acc));
                }
            }
            AccessOp::Materialize(recipe) => frame.acc = self.materialize(recipe, frame.scope)?,
            AccessOp::Instantiate(pattern) => {
                frame.acc = self.instantiate(*pattern, frame.scope.args)?;
            }
            AccessOp::RegisterForeign => frame.acc = self.register_foreign(frame.acc)?,
            AccessOp::InitializeClass(init) => {
                frame.publish_partial();
                let pending = &frame.pending;
                frame.acc = self.initialize_class(frame.acc, init, &|moved| {
                    if let Some(pending) = pending {
                        pending.publish(moved);
                    }
                })?;
            }
            AccessOp::InitializeValue => {
                frame.publish_partial();
                self.initialize_value(frame.acc)?;
            }
            AccessOp::StoreRelease(cache) => {
                let address = self.cache_address(cache, &frame.scope)?;
                self.memory
                    .atomic(address)?
                    .store(frame.acc, Ordering::Release);
            }
            AccessOp::Return => return Ok(Flow::Return(frame.acc)),
            AccessOp::AllocateMetadata(pattern) => {
                frame.acc = self.allocate_metadata(*pattern, frame.scope.args)?;
                frame.scope.context = frame.acc;
            }
            AccessOp::InstallDependentVwt(table) => {
                let copy = self.memory.allocate(VWT_BYTES)?;
                self.memory.copy(*table, copy, VWT_BYTES)?;
                self.memory.write_word(frame.acc.wrapping_sub(8), copy)?;
            }
            AccessOp::Fill { offset, argument } => {
                let value = frame.scope.arg(*argument)?;
                self.memory
                    .write_word(frame.acc.wrapping_add(*offset as i64 as u64), value)?;
            }
            AccessOp::AllocateFieldTypes(count) => {
                let vector = self.memory.allocate(*count as u64 * 8)?;
                frame.field_types = Some((vector, *count));
            }
            AccessOp::StoreFieldType { index, flags } => {
                let (vector, count) = frame
                    .field_types
                    .filter(|(_, count)| index < count)
                    .ok_or(RuntimeError::FieldTypeVector { function })?;
                self.memory
                    .write_word(vector + *index as u64 * 8, frame.acc | *flags as u64)?;
            }
            AccessOp::PublishFieldTypes(cache) => {
                let (vector, _) = frame
                    .field_types
                    .take()
                    .ok_or(RuntimeError::FieldTypeVector { function })?;
                let address = self.cache_address(cache, &frame.scope)?;
                let slot = self.memory.atomic(address)?;
                frame.acc = match slot.compare_exchange(0, vector, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => vector,
                    Err(winner) => {
                        self.memory.free(vector)?;
                        Counters::bump(&self.counters.freed_field_vectors);
                        trace!(vector, "lost field type publish race");
                        winner
                    }
                };
            }
            AccessOp::Trap => return Err(RuntimeError::DeletedMethod { function }),
            AccessOp::BeginOnce(_) | AccessOp::EndOnce => {
                return Err(RuntimeError::UnbalancedOnce { function })
            }
        }
        Ok(Flow::Next)
    }

    /// Copy a generic pattern's template into a fresh record; returns its address point
    fn allocate_metadata(&self, pattern: u64, args: &[u64]) -> RuntimeResult<u64> {
        let size = self.memory.read_u32(pattern + pattern_header::SIZE as u64)? as u64;
        let expected = self
            .memory
            .read_u16(pattern + pattern_header::NUM_ARGUMENTS as u64)?;
        if args.len() != expected as usize {
            return Err(RuntimeError::ArgumentCount {
                pattern,
                expected,
                actual: args.len(),
            });
        }
        let address_point = self
            .memory
            .read_u16(pattern + pattern_header::ADDRESS_POINT as u64)? as u64;
        let base = self.memory.allocate(size)?;
        // The last word is the field type vector cache and starts out null.
        let template = size.saturating_sub(8);
        self.memory
            .copy(pattern + pattern_header::SIZE_BYTES as u64, base, template)?;
        Ok(base + address_point)
    }

    /// Evaluate a recipe to a metadata or witness table pointer
    pub(crate) fn materialize(&self, recipe: &TypeRecipe<u64>, scope: Scope<'_>) -> RuntimeResult<u64> {
        let all = |items: &[TypeRecipe<u64>]| -> RuntimeResult<Vec<u64>> {
            items.iter().map(|item| self.materialize(item, scope)).collect()
        };
        Ok(match recipe {
            TypeRecipe::Metadata(address) | TypeRecipe::WitnessTable(address) => *address,
            TypeRecipe::Indirect(cell) => self.memory.read_word(*cell)?,
            TypeRecipe::Accessor(function) => self.call(*function, &[], 0)?,
            TypeRecipe::GenericArgument(offset) => self
                .memory
                .read_word(scope.require_context()?.wrapping_add(*offset as i64 as u64))?,
            TypeRecipe::Argument(index) => scope.arg(*index)?,
            TypeRecipe::Instantiate { accessor, args } => {
                let values = all(args)?;
                self.call(*accessor, &values, 0)?
            }
            TypeRecipe::Tuple(elements) => self.tuple_metadata(&all(elements)?)?,
            TypeRecipe::Function { params, result } => {
                let params = all(params)?;
                let result = self.materialize(result, scope)?;
                self.function_metadata(&params, result)?
            }
            TypeRecipe::Existential {
                protocols,
                class_bound,
            } => self.existential_metadata(protocols, *class_bound)?,
            TypeRecipe::Metatype(instance) => {
                let instance = self.materialize(instance, scope)?;
                self.metatype_metadata(instance)?
            }
        })
    }
}
