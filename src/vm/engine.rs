use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

use log::debug;
use serde::Serialize;

use super::arena::{ArenaStats, HeapArena};
use super::bytecode::Module;
use super::call::Activation;
use super::eh::EhStack;
use super::error::{ErrorKind, FatalError, VmError, VmResult};
use super::gc::{Collector, new_collector};
use super::heap::{BuiltinId, GcStats, Heap, ObjectClass, Proto};
use super::object::PropKey;
use super::prop_cache::CacheStats;
use super::value::Value;
use crate::config::{CollectorKind, RuntimeConfig};

/// Interned names the engine looks up itself.
#[derive(Debug, Clone, Copy)]
pub struct Names {
    pub length: Value,
    pub prototype: Value,
    pub name: Value,
    pub message: Value,
    pub value_of: Value,
    pub to_string: Value,
}

/// Everything `--gc-stats` reports.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineStats {
    pub collector: &'static str,
    pub gc: GcStats,
    pub arena: ArenaStats,
    pub property_cache: CacheStats,
    pub handler_frames_allocated: usize,
    pub instructions: u64,
}

/// One engine instance: heap, handler stack, value stack and module state.
pub struct Engine {
    pub(crate) heap: Heap,
    pub(crate) eh: EhStack,
    /// Activation storage. Every slot owns its value.
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Activation>,
    /// Owned values held by Rust code across a call back into the
    /// dispatcher. Tracing collectors treat them as roots.
    pub(crate) temp_roots: Vec<Value>,
    pub(crate) globals: Vec<Value>,
    pub(crate) module: Rc<Module>,
    /// String constants, interned and pinned
    pub(crate) constants: Vec<Value>,
    pub(crate) names: Names,
    /// Pinned function objects of the natives pushed so far
    pub(crate) natives: HashMap<u16, Value>,
    pub(crate) collector: Box<dyn Collector>,
    pub(crate) config: RuntimeConfig,
    pub(crate) output: Box<dyn Write>,
    pub(crate) instructions: u64,
}

impl Engine {
    pub fn new(module: Module, globals: Vec<Value>, config: RuntimeConfig) -> Result<Self, FatalError> {
        let arena = HeapArena::new(config.heap_bytes, config.internal_bytes, config.node_pool_bytes);
        let track_all = config.collector == CollectorKind::MarkSweep;
        let mut heap = Heap::new(arena, track_all)?;

        let mut constants = Vec::with_capacity(module.strings.len());
        for s in &module.strings {
            constants.push(heap.intern(s)?);
        }
        let names = Names {
            length: heap.intern("length")?,
            prototype: heap.intern("prototype")?,
            name: heap.intern("name")?,
            message: heap.intern("message")?,
            value_of: heap.intern("valueOf")?,
            to_string: heap.intern("toString")?,
        };
        let collector = new_collector(config.collector, config.cycle_trigger_bytes);
        debug!(
            "engine: {} functions, {} constants, {} globals, heap {} bytes, collector {}",
            module.functions.len(),
            constants.len(),
            globals.len(),
            config.heap_bytes,
            collector.name()
        );

        Ok(Self {
            heap,
            eh: EhStack::new(),
            stack: Vec::with_capacity(1024),
            frames: Vec::new(),
            temp_roots: Vec::new(),
            globals,
            module: Rc::new(module),
            constants,
            names,
            natives: HashMap::new(),
            collector,
            config,
            output: Box::new(io::stdout()),
            instructions: 0,
        })
    }

    /// Redirect `print` output.
    pub fn with_output(mut self, output: Box<dyn Write>) -> Self {
        self.output = output;
        self
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn global(&self, index: usize) -> Option<Value> {
        self.globals.get(index).copied()
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    /// Run the module's entry method. `this` is the opaque first argument.
    pub fn run_entry(&mut self, this: Value) -> VmResult<Value> {
        let entry = self.module.entry;
        let header = self.module.header(entry).map_err(|e| FatalError::BadBytecode(e.to_string()))?;
        if header.formals != 0 {
            return Err(FatalError::BadBytecode(format!(
                "entry function #{} declares {} formals",
                entry, header.formals
            ))
            .into());
        }
        debug!("entering {} (#{})", self.module.function_name(entry), entry);
        self.call(Value::function(entry), this, &[])
    }

    // -------------------------------------------------------------------------
    // Ownership helpers
    // -------------------------------------------------------------------------

    /// Push a borrowed or floating value, taking a reference.
    #[inline]
    pub(crate) fn push(&mut self, v: Value) {
        self.heap.inc_ref(v);
        self.stack.push(v);
    }

    /// Push a value whose reference the caller already owns.
    #[inline]
    pub(crate) fn push_owned(&mut self, v: Value) {
        self.stack.push(v);
    }

    /// Pop a value. The caller owns the returned reference.
    #[inline]
    pub(crate) fn pop(&mut self) -> Result<Value, FatalError> {
        self.stack
            .pop()
            .ok_or_else(|| FatalError::BadBytecode("operand stack underflow".to_string()))
    }

    #[inline]
    pub(crate) fn peek(&self, from_top: usize) -> Result<Value, FatalError> {
        self.stack
            .len()
            .checked_sub(from_top + 1)
            .map(|i| self.stack[i])
            .ok_or_else(|| FatalError::BadBytecode("operand stack underflow".to_string()))
    }

    #[inline]
    pub(crate) fn release(&mut self, v: Value) -> Result<(), FatalError> {
        self.heap.dec_ref(v)
    }

    /// Take a reference and hand it back.
    #[inline]
    pub(crate) fn retain(&mut self, v: Value) -> Value {
        self.heap.inc_ref(v);
        v
    }

    /// Replace a stack slot, adjusting both refcounts.
    pub(crate) fn store_slot(&mut self, index: usize, v: Value) -> Result<(), FatalError> {
        let old = *self
            .stack
            .get(index)
            .ok_or_else(|| FatalError::BadBytecode(format!("slot {} out of range", index)))?;
        self.heap.inc_ref(v);
        self.stack[index] = v;
        self.heap.dec_ref(old)
    }

    /// Replace the top `n` slots with `v`.
    pub(crate) fn replace_top(&mut self, n: usize, v: Value) -> Result<(), FatalError> {
        let len = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| FatalError::BadBytecode("operand stack underflow".to_string()))?;
        self.heap.inc_ref(v);
        self.truncate_stack(len)?;
        self.stack.push(v);
        Ok(())
    }

    /// Drop every stack slot at or above `len`, topmost first.
    pub(crate) fn truncate_stack(&mut self, len: usize) -> Result<(), FatalError> {
        while self.stack.len() > len {
            if let Some(v) = self.stack.pop() {
                self.heap.dec_ref(v)?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Errors
    // -------------------------------------------------------------------------

    /// A fresh error object. Like every new allocation it starts floating
    /// (refcount 0): the caller either takes a reference or releases it with
    /// `release_if_floating`. Allocation never collects, so it cannot be
    /// reclaimed while its properties are filled in.
    pub fn make_error(&mut self, kind: ErrorKind, message: &str) -> Result<Value, FatalError> {
        let obj = self
            .heap
            .alloc_object(ObjectClass::Error, Proto::Builtin(BuiltinId::ErrorProto))?;
        let v = Value::object(obj);
        let name = self.heap.intern(kind.name())?;
        let msg = self.heap.alloc_string(message)?;
        self.heap.define_own(obj, PropKey::Name(self.names.name), name)?;
        self.heap.define_own(obj, PropKey::Name(self.names.message), msg)?;
        Ok(v)
    }

    /// Build an error of `kind` as an exception in flight.
    pub(crate) fn throw_error(&mut self, kind: ErrorKind, message: impl AsRef<str>) -> VmError {
        match self.make_error(kind, message.as_ref()) {
            Ok(v) => VmError::Exception(self.retain(v)),
            Err(e) => VmError::Fatal(e),
        }
    }

    // -------------------------------------------------------------------------
    // Collection
    // -------------------------------------------------------------------------

    fn roots(&self) -> Vec<Value> {
        let mut roots: Vec<Value> = self
            .stack
            .iter()
            .chain(self.globals.iter())
            .chain(self.temp_roots.iter())
            .copied()
            .filter(|v| v.needs_rc())
            .collect();
        for frame in &self.frames {
            roots.extend([frame.env, frame.arguments, frame.callee].into_iter().filter(|v| v.needs_rc()));
        }
        roots.extend(self.eh.roots(&self.heap));
        roots
    }

    /// Run `f` with `v` registered as a root. The caller keeps its reference.
    pub(crate) fn with_root<T>(&mut self, v: Value, f: impl FnOnce(&mut Self) -> T) -> T {
        self.temp_roots.push(v);
        let result = f(self);
        self.temp_roots.pop();
        result
    }

    /// Run a collection pass now. Returns the number of blocks reclaimed.
    pub fn collect_cycles(&mut self) -> Result<usize, FatalError> {
        let roots = self.roots();
        self.collector.collect(&mut self.heap, &roots)
    }

    /// Collect if the backend says a pass is due. Only called at
    /// instruction boundaries.
    #[inline]
    pub(crate) fn safe_point(&mut self) -> Result<(), FatalError> {
        if self.collector.should_collect(&self.heap) {
            self.collect_cycles()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            collector: self.collector.name(),
            gc: self.heap.stats(),
            arena: self.heap.arena_stats(),
            property_cache: self.heap.cache.stats(),
            handler_frames_allocated: self.eh.frames_allocated(),
            instructions: self.instructions,
        }
    }

    /// Release every engine-held reference: stack, globals and handler frames.
    pub fn shutdown(&mut self) -> Result<(), FatalError> {
        self.truncate_stack(0)?;
        self.eh.unwind_owner(&mut self.heap, 0)?;
        for v in std::mem::take(&mut self.globals) {
            self.heap.dec_ref(v)?;
        }
        Ok(())
    }

    pub(crate) fn write_line(&mut self, line: &str) -> VmResult<()> {
        writeln!(self.output, "{}", line)
            .and_then(|_| self.output.flush())
            .map_err(|e| VmError::Report(format!("io error: {}", e)))
    }
}

/// A cloneable in-memory sink for `print` output.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput(Rc<RefCell<Vec<u8>>>);

impl CapturedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
