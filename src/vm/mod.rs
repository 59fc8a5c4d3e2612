pub mod arena;
mod arith;
pub mod builtins;
pub mod bytecode;
mod call;
pub mod convert;
pub mod disasm;
pub mod eh;
mod engine;
pub mod error;
pub mod gc;
pub mod heap;
mod interp;
pub mod object;
pub mod ops;
pub mod prop_cache;
pub mod value;

pub use arena::{ArenaError, ArenaStats, HeapArena};
pub use arith::{BinaryOp, Hint, Relation};
pub use bytecode::{Assembler, BytecodeError, FunctionSpec, Label, MethodHeader, Module, ModuleBuilder};
pub use call::Activation;
pub use disasm::{Disassembler, disassemble};
pub use engine::{CapturedOutput, Engine, EngineStats};
pub use error::{ErrorKind, FatalError, VmError, VmResult};
pub use heap::{GcRef, GcStats, Heap, ObjectClass};
pub use object::PropKey;
pub use ops::{Opcode, PrimOp, PrimType};
pub use value::{Kind, Value};
