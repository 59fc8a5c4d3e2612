use thiserror::Error;

use super::arena::ArenaError;
use super::value::Value;

/// Internal-consistency failures. Never catchable by hosted code; the
/// process reports them and aborts.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("unknown opcode 0x{op:02x} at pc {pc}")]
    UnknownOpcode { op: u8, pc: usize },
    #[error("unsupported operation {name} at pc {pc}")]
    Unsupported { name: &'static str, pc: usize },
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error("malformed bytecode: {0}")]
    BadBytecode(String),
    #[error("malformed handler-frame stack: {0}")]
    HandlerStack(&'static str),
    #[error("gc invariant violated: {0}")]
    GcInvariant(String),
}

/// Builtin error constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
    UriError,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::UriError => "URIError",
        }
    }
}

/// Outcome of anything that runs hosted code.
#[derive(Debug, Error)]
pub enum VmError {
    /// A thrown value in flight. The error owns one reference to it.
    #[error("uncaught exception")]
    Exception(Value),
    /// Explicit engine-level error report requested by the program.
    #[error("{0}")]
    Report(String),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl From<ArenaError> for VmError {
    fn from(e: ArenaError) -> Self {
        VmError::Fatal(FatalError::Arena(e))
    }
}

pub type VmResult<T> = Result<T, VmError>;
