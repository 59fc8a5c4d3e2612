//! Module images, method headers and the bytecode assembler.
//!
//! Binary format (all integers little-endian):
//! - Magic: "TAGV" (4 bytes)
//! - Version: u32
//! - Entry function index: u32
//! - String pool: count + (length, UTF-8 bytes)
//! - Function table: count + header offsets into the code blob
//! - Code blob: length + bytes (method headers followed by instructions)
//! - Symbols: count + (name, data length, data)
//!
//! Each function starts with a 20-byte [`MethodHeader`]; its `code_offset`
//! is measured from the header start to the first instruction.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use thiserror::Error;

use super::error::FatalError;
use super::ops::{Opcode, PrimOp, PrimType};
use super::value::Value;

/// Magic bytes for module images
pub const MAGIC: &[u8; 4] = b"TAGV";

/// Current image format version
pub const VERSION: u32 = 1;

/// Size of an encoded method header
pub const METHOD_HEADER_SIZE: usize = 20;

/// Symbol carrying the module's global-data snapshot
pub const MODULE_DECL_SYMBOL: &str = "__module_decl__";

/// Header `name` value for anonymous functions
pub const NO_NAME: u32 = u32::MAX;

pub const FLAG_STRICT: u16 = 1 << 0;
pub const FLAG_USES_ARGUMENTS: u16 = 1 << 1;

#[derive(Debug, Error)]
pub enum BytecodeError {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    #[error("function #{0} is malformed")]
    BadFunction(u32),
    #[error("entry function #{0} does not exist")]
    BadEntry(u32),
    #[error("missing symbol {0}")]
    MissingSymbol(&'static str),
    #[error("global #{0} is not a primitive value word")]
    BadGlobal(u16),
    #[error("label {0} used but never bound")]
    UnboundLabel(usize),
    #[error("function #{0} declared but never defined")]
    UndefinedFunction(u32),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// =============================================================================
// Method header
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHeader {
    /// Local slots
    pub frame_size: u16,
    pub formals: u16,
    /// Environment slots created on entry
    pub upvalues: u16,
    pub eval_stack_depth: u16,
    pub flags: u16,
    /// String-constant index of the name, or [`NO_NAME`]
    pub name: u32,
    pub code_offset: u32,
}

impl MethodHeader {
    pub fn is_strict(&self) -> bool {
        self.flags & FLAG_STRICT != 0
    }

    pub fn uses_arguments(&self) -> bool {
        self.flags & FLAG_USES_ARGUMENTS != 0
    }

    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u16(w, self.frame_size)?;
        write_u16(w, self.formals)?;
        write_u16(w, self.upvalues)?;
        write_u16(w, self.eval_stack_depth)?;
        write_u16(w, self.flags)?;
        write_u16(w, 0)?;
        write_u32(w, self.name)?;
        write_u32(w, self.code_offset)
    }

    fn read<R: Read>(r: &mut R) -> Result<Self, BytecodeError> {
        let frame_size = read_u16(r)?;
        let formals = read_u16(r)?;
        let upvalues = read_u16(r)?;
        let eval_stack_depth = read_u16(r)?;
        let flags = read_u16(r)?;
        let _reserved = read_u16(r)?;
        let name = read_u32(r)?;
        let code_offset = read_u32(r)?;
        Ok(Self {
            frame_size,
            formals,
            upvalues,
            eval_stack_depth,
            flags,
            name,
            code_offset,
        })
    }
}

// =============================================================================
// Module
// =============================================================================

/// A loaded module image.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub strings: Vec<String>,
    /// Header offset of each function within `code`
    pub functions: Vec<u32>,
    pub code: Vec<u8>,
    pub entry: u32,
    pub symbols: Vec<(String, Vec<u8>)>,
}

impl Module {
    pub fn header(&self, func: u32) -> Result<MethodHeader, BytecodeError> {
        let offset = *self
            .functions
            .get(func as usize)
            .ok_or(BytecodeError::BadFunction(func))? as usize;
        let bytes = self
            .code
            .get(offset..offset + METHOD_HEADER_SIZE)
            .ok_or(BytecodeError::BadFunction(func))?;
        MethodHeader::read(&mut &bytes[..])
    }

    /// Absolute position of the first instruction of `func`.
    pub fn code_start(&self, func: u32) -> Result<usize, BytecodeError> {
        let header = self.header(func)?;
        Ok(self.functions[func as usize] as usize + header.code_offset as usize)
    }

    pub fn function_name(&self, func: u32) -> &str {
        self.header(func)
            .ok()
            .and_then(|h| self.strings.get(h.name as usize))
            .map_or("<anonymous>", String::as_str)
    }

    pub fn symbol(&self, name: &str) -> Option<&[u8]> {
        self.symbols
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }

    /// Decode the global-data snapshot. Only primitive words are accepted.
    pub fn globals(&self) -> Result<Vec<Value>, BytecodeError> {
        let mut data = self
            .symbol(MODULE_DECL_SYMBOL)
            .ok_or(BytecodeError::MissingSymbol(MODULE_DECL_SYMBOL))?;
        let count = read_u16(&mut data)?;
        let mut globals = Vec::with_capacity(count as usize);
        for i in 0..count {
            let word = read_u64(&mut data)?;
            match Value::from_bits(word) {
                Some(v) if !v.needs_rc() => globals.push(v),
                _ => return Err(BytecodeError::BadGlobal(i)),
            }
        }
        Ok(globals)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.write(&mut buf);
        buf
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(MAGIC)?;
        write_u32(w, VERSION)?;
        write_u32(w, self.entry)?;

        write_u32(w, self.strings.len() as u32)?;
        for s in &self.strings {
            write_string(w, s)?;
        }

        write_u32(w, self.functions.len() as u32)?;
        for &offset in &self.functions {
            write_u32(w, offset)?;
        }

        write_u32(w, self.code.len() as u32)?;
        w.write_all(&self.code)?;

        write_u32(w, self.symbols.len() as u32)?;
        for (name, data) in &self.symbols {
            write_string(w, name)?;
            write_u32(w, data.len() as u32)?;
            w.write_all(data)?;
        }
        Ok(())
    }

    pub fn deserialize(data: &[u8]) -> Result<Module, BytecodeError> {
        let mut r = data;
        Self::read(&mut r)
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Module, BytecodeError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)
            .map_err(|_| BytecodeError::UnexpectedEof)?;
        if &magic != MAGIC {
            return Err(BytecodeError::InvalidMagic);
        }
        let version = read_u32(r)?;
        if version != VERSION {
            return Err(BytecodeError::UnsupportedVersion(version));
        }
        let entry = read_u32(r)?;

        let string_count = read_u32(r)? as usize;
        let mut strings = Vec::with_capacity(string_count.min(4096));
        for _ in 0..string_count {
            strings.push(read_string(r)?);
        }

        let func_count = read_u32(r)? as usize;
        let mut functions = Vec::with_capacity(func_count.min(4096));
        for _ in 0..func_count {
            functions.push(read_u32(r)?);
        }

        let code = read_bytes(r)?;

        let symbol_count = read_u32(r)? as usize;
        let mut symbols = Vec::with_capacity(symbol_count.min(64));
        for _ in 0..symbol_count {
            let name = read_string(r)?;
            symbols.push((name, read_bytes(r)?));
        }

        let module = Module {
            strings,
            functions,
            code,
            entry,
            symbols,
        };
        module.validate()?;
        Ok(module)
    }

    fn validate(&self) -> Result<(), BytecodeError> {
        for func in 0..self.functions.len() as u32 {
            let start = self.code_start(func)?;
            if start > self.code.len() {
                return Err(BytecodeError::BadFunction(func));
            }
        }
        if self.entry as usize >= self.functions.len() {
            return Err(BytecodeError::BadEntry(self.entry));
        }
        Ok(())
    }
}

// =============================================================================
// Instruction operands
// =============================================================================

fn operand<const N: usize>(code: &[u8], at: usize) -> Result<[u8; N], FatalError> {
    code.get(at..at + N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| FatalError::BadBytecode(format!("truncated operand at {}", at)))
}

#[inline]
pub fn operand_u8(code: &[u8], at: usize) -> Result<u8, FatalError> {
    operand::<1>(code, at).map(|b| b[0])
}

#[inline]
pub fn operand_u16(code: &[u8], at: usize) -> Result<u16, FatalError> {
    operand(code, at).map(u16::from_le_bytes)
}

#[inline]
pub fn operand_u32(code: &[u8], at: usize) -> Result<u32, FatalError> {
    operand(code, at).map(u32::from_le_bytes)
}

#[inline]
pub fn operand_i32(code: &[u8], at: usize) -> Result<i32, FatalError> {
    operand(code, at).map(i32::from_le_bytes)
}

#[inline]
pub fn operand_u64(code: &[u8], at: usize) -> Result<u64, FatalError> {
    operand(code, at).map(u64::from_le_bytes)
}

/// Apply a relative branch offset to an instruction start.
#[inline]
pub fn branch_target(pc: usize, offset: i32) -> Result<usize, FatalError> {
    pc.checked_add_signed(offset as isize)
        .ok_or_else(|| FatalError::BadBytecode(format!("branch out of range at {}", pc)))
}

// =============================================================================
// Assembler
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Emits the instructions of one function.
///
/// Branches may target labels bound later; string operands are given by
/// contents and resolved against the module's pool when the function is
/// added to a [`ModuleBuilder`].
#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    /// (operand position, instruction start, label)
    fixups: Vec<(usize, usize, Label)>,
    /// (operand position, string contents)
    string_refs: Vec<(usize, String)>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    pub fn here(&self) -> usize {
        self.code.len()
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.code.push(op as u8);
        self
    }

    /// Emit a raw byte. Used to build deliberately malformed code.
    pub fn raw(&mut self, byte: u8) -> &mut Self {
        self.code.push(byte);
        self
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.code.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.code.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.code.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i32(&mut self, v: i32) -> &mut Self {
        self.code.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn string_ref(&mut self, s: &str) -> &mut Self {
        self.string_refs.push((self.code.len(), s.to_string()));
        self.u32(0)
    }

    fn label_ref(&mut self, inst: usize, label: Label) -> &mut Self {
        self.fixups.push((self.code.len(), inst, label));
        self.i32(0)
    }

    pub fn push_int(&mut self, n: i32) -> &mut Self {
        self.op(Opcode::PushInt).i32(n)
    }

    pub fn push_double(&mut self, f: f64) -> &mut Self {
        self.op(Opcode::PushDouble);
        self.code.extend_from_slice(&Value::double(f).bits().to_le_bytes());
        self
    }

    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.op(Opcode::PushString).string_ref(s)
    }

    pub fn push_function(&mut self, func: u32) -> &mut Self {
        self.op(Opcode::PushFunction).u32(func)
    }

    pub fn new_closure(&mut self, func: u32) -> &mut Self {
        self.op(Opcode::NewClosure).u32(func)
    }

    pub fn push_native(&mut self, id: u16) -> &mut Self {
        self.op(Opcode::PushNative).u16(id)
    }

    pub fn load_arg(&mut self, i: u16) -> &mut Self {
        self.op(Opcode::LoadArg).u16(i)
    }

    pub fn store_arg(&mut self, i: u16) -> &mut Self {
        self.op(Opcode::StoreArg).u16(i)
    }

    pub fn load_local(&mut self, i: u16) -> &mut Self {
        self.op(Opcode::LoadLocal).u16(i)
    }

    pub fn store_local(&mut self, i: u16) -> &mut Self {
        self.op(Opcode::StoreLocal).u16(i)
    }

    pub fn load_global(&mut self, i: u16) -> &mut Self {
        self.op(Opcode::LoadGlobal).u16(i)
    }

    pub fn store_global(&mut self, i: u16) -> &mut Self {
        self.op(Opcode::StoreGlobal).u16(i)
    }

    pub fn load_env(&mut self, depth: u8, slot: u16) -> &mut Self {
        self.op(Opcode::LoadEnv).u8(depth).u16(slot)
    }

    pub fn store_env(&mut self, depth: u8, slot: u16) -> &mut Self {
        self.op(Opcode::StoreEnv).u8(depth).u16(slot)
    }

    pub fn enter_env(&mut self, slots: u16) -> &mut Self {
        self.op(Opcode::EnterEnv).u16(slots)
    }

    pub fn prim(&mut self, op: PrimOp, ty: PrimType) -> &mut Self {
        self.op(Opcode::PrimBinary).u8(op as u8).u8(ty as u8)
    }

    /// `Jump`, `JumpIfTrue`, `JumpIfFalse` or `Gosub` to `label`.
    pub fn jump(&mut self, op: Opcode, label: Label) -> &mut Self {
        let inst = self.here();
        self.op(op).label_ref(inst, label)
    }

    pub fn gosub(&mut self, label: Label) -> &mut Self {
        self.jump(Opcode::Gosub, label)
    }

    pub fn switch(&mut self, low: i32, targets: &[Label], default: Label) -> &mut Self {
        let inst = self.here();
        self.op(Opcode::Switch).i32(low).u16(targets.len() as u16);
        self.label_ref(inst, default);
        for &target in targets {
            self.label_ref(inst, target);
        }
        self
    }

    pub fn try_(&mut self, catch: Option<Label>, finally: Option<Label>) -> &mut Self {
        let inst = self.here();
        self.op(Opcode::Try);
        for label in [catch, finally] {
            match label {
                Some(label) => self.label_ref(inst, label),
                None => self.i32(0),
            };
        }
        self
    }

    pub fn new_array(&mut self, count: u16) -> &mut Self {
        self.op(Opcode::NewArray).u16(count)
    }

    pub fn get_named(&mut self, name: &str) -> &mut Self {
        self.op(Opcode::GetPropByName).string_ref(name)
    }

    pub fn set_named(&mut self, name: &str) -> &mut Self {
        self.op(Opcode::SetPropByName).string_ref(name)
    }

    pub fn init_named(&mut self, name: &str) -> &mut Self {
        self.op(Opcode::InitPropByName).string_ref(name)
    }

    pub fn call(&mut self, func: u32, argc: u8) -> &mut Self {
        self.op(Opcode::Call).u32(func).u8(argc)
    }

    pub fn call_value(&mut self, argc: u8) -> &mut Self {
        self.op(Opcode::CallValue).u8(argc)
    }

    pub fn new_(&mut self, argc: u8) -> &mut Self {
        self.op(Opcode::New).u8(argc)
    }

    pub fn call_native(&mut self, id: u16, argc: u8) -> &mut Self {
        self.op(Opcode::CallNative).u16(id).u8(argc)
    }

    /// Resolve labels. String operands stay unresolved.
    fn finish(mut self) -> Result<(Vec<u8>, Vec<(usize, String)>), BytecodeError> {
        for &(at, inst, label) in &self.fixups {
            let target = self.labels[label.0].ok_or(BytecodeError::UnboundLabel(label.0))?;
            let offset = target as i64 - inst as i64;
            self.code[at..at + 4].copy_from_slice(&(offset as i32).to_le_bytes());
        }
        Ok((self.code, self.string_refs))
    }
}

// =============================================================================
// Module builder
// =============================================================================

/// Per-function header fields.
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub name: Option<String>,
    pub formals: u16,
    pub locals: u16,
    pub upvalues: u16,
    pub max_stack: u16,
    pub strict: bool,
    pub uses_arguments: bool,
}

impl FunctionSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            formals: 0,
            locals: 0,
            upvalues: 0,
            max_stack: 16,
            strict: false,
            uses_arguments: false,
        }
    }

    pub fn formals(mut self, n: u16) -> Self {
        self.formals = n;
        self
    }

    pub fn locals(mut self, n: u16) -> Self {
        self.locals = n;
        self
    }

    pub fn upvalues(mut self, n: u16) -> Self {
        self.upvalues = n;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn uses_arguments(mut self) -> Self {
        self.uses_arguments = true;
        self
    }
}

/// Builds a [`Module`] from assembled functions.
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    strings: Vec<String>,
    string_ids: HashMap<String, u32>,
    functions: Vec<Option<Vec<u8>>>,
    globals: Vec<Value>,
    entry: u32,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of a string constant, added on first use.
    pub fn string(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.string_ids.insert(s.to_string(), id);
        id
    }

    /// Reserve a function index, for functions referenced before they are
    /// assembled (recursion, forward calls).
    pub fn declare(&mut self) -> u32 {
        self.functions.push(None);
        (self.functions.len() - 1) as u32
    }

    pub fn define(&mut self, func: u32, spec: FunctionSpec, asm: Assembler) -> Result<(), BytecodeError> {
        let (mut code, string_refs) = asm.finish()?;
        for (at, s) in string_refs {
            let id = self.string(&s);
            code[at..at + 4].copy_from_slice(&id.to_le_bytes());
        }
        let header = MethodHeader {
            frame_size: spec.locals,
            formals: spec.formals,
            upvalues: spec.upvalues,
            eval_stack_depth: spec.max_stack,
            flags: (if spec.strict { FLAG_STRICT } else { 0 })
                | (if spec.uses_arguments { FLAG_USES_ARGUMENTS } else { 0 }),
            name: spec.name.as_deref().map_or(NO_NAME, |n| self.string(n)),
            code_offset: METHOD_HEADER_SIZE as u32,
        };
        let mut bytes = Vec::with_capacity(METHOD_HEADER_SIZE + code.len());
        header.write(&mut bytes)?;
        bytes.extend_from_slice(&code);
        let slot = self
            .functions
            .get_mut(func as usize)
            .ok_or(BytecodeError::BadFunction(func))?;
        *slot = Some(bytes);
        Ok(())
    }

    pub fn function(&mut self, spec: FunctionSpec, asm: Assembler) -> Result<u32, BytecodeError> {
        let func = self.declare();
        self.define(func, spec, asm)?;
        Ok(func)
    }

    /// Add a global slot with a primitive initial value.
    pub fn global(&mut self, init: Value) -> u16 {
        self.globals.push(init);
        (self.globals.len() - 1) as u16
    }

    pub fn entry(&mut self, func: u32) -> &mut Self {
        self.entry = func;
        self
    }

    pub fn build(self) -> Result<Module, BytecodeError> {
        let mut code = Vec::new();
        let mut functions = Vec::with_capacity(self.functions.len());
        for (i, body) in self.functions.into_iter().enumerate() {
            let body = body.ok_or(BytecodeError::UndefinedFunction(i as u32))?;
            functions.push(code.len() as u32);
            code.extend_from_slice(&body);
        }

        let mut decl = Vec::with_capacity(2 + 8 * self.globals.len());
        write_u16(&mut decl, self.globals.len() as u16)?;
        for g in &self.globals {
            write_u64(&mut decl, g.bits())?;
        }

        let module = Module {
            strings: self.strings,
            functions,
            code,
            entry: self.entry,
            symbols: vec![(MODULE_DECL_SYMBOL.to_string(), decl)],
        };
        module.validate()?;
        Ok(module)
    }
}

// Helper functions for reading/writing primitives

fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16, BytecodeError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(u16::from_le_bytes(buf))
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, BytecodeError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, BytecodeError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, BytecodeError> {
    let len = read_u32(r)? as usize;
    let mut buf = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(BytecodeError::UnexpectedEof);
    }
    Ok(buf)
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn read_string<R: Read>(r: &mut R) -> Result<String, BytecodeError> {
    String::from_utf8(read_bytes(r)?).map_err(|_| BytecodeError::InvalidUtf8)
}
