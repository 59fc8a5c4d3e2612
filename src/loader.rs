//! Module loading and the process-level run protocol.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

use crate::config::RuntimeConfig;
use crate::vm::{BytecodeError, Engine, EngineStats, FatalError, Module, Value, VmError};

/// Exit code for a normal run
pub const EXIT_OK: u8 = 0;
/// Exit code when the image cannot be loaded
pub const EXIT_LOAD_FAILED: u8 = 1;
/// Exit code after reporting an uncaught exception
pub const EXIT_UNCAUGHT: u8 = 3;
/// Exit code after an explicit engine-level error report
pub const EXIT_REPORT: u8 = 8;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid module image: {0}")]
    Bytecode(#[from] BytecodeError),
    #[error("entry function {name} declares {formals} formals")]
    EntryFormals { name: String, formals: u16 },
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// How a run ended, short of a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// ToString of the value that escaped the entry method
    Uncaught(String),
    Report(String),
}

impl Outcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Completed => EXIT_OK,
            Outcome::Uncaught(_) => EXIT_UNCAUGHT,
            Outcome::Report(_) => EXIT_REPORT,
        }
    }

    /// Diagnostic line for stderr, if any.
    pub fn diagnostic(&self) -> Option<String> {
        match self {
            Outcome::Completed => None,
            Outcome::Uncaught(text) => Some(format!("uncaught exception: {}", text)),
            Outcome::Report(msg) => Some(format!("error: {}", msg)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: Outcome,
    pub stats: EngineStats,
}

/// Read and decode a module image.
pub fn load_file(path: &Path) -> Result<Module, LoadError> {
    let data = std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let module = Module::deserialize(&data)?;
    debug!(
        "loaded {}: {} functions, {} strings, {} code bytes",
        path.display(),
        module.functions.len(),
        module.strings.len(),
        module.code.len()
    );
    Ok(module)
}

/// Load `path` and run its entry method, printing to stdout.
pub fn run_file(path: &Path, arg: Option<&str>, config: RuntimeConfig) -> Result<RunReport, RunError> {
    let module = load_file(path)?;
    run_module(module, arg, config, Box::new(io::stdout()))
}

/// Build an engine for `module` and run its entry method. `arg` becomes the
/// entry's `this` (a string, or undefined when absent).
pub fn run_module(
    module: Module,
    arg: Option<&str>,
    config: RuntimeConfig,
    output: Box<dyn Write>,
) -> Result<RunReport, RunError> {
    let globals = module.globals().map_err(LoadError::from)?;
    let header = module.header(module.entry).map_err(LoadError::from)?;
    if header.formals != 0 {
        return Err(LoadError::EntryFormals {
            name: module.function_name(module.entry).to_string(),
            formals: header.formals,
        }
        .into());
    }

    let mut engine = Engine::new(module, globals, config)?.with_output(output);
    let this = match arg {
        Some(s) => engine.heap_mut().alloc_string(s).map_err(FatalError::from)?,
        None => Value::UNDEFINED,
    };

    let outcome = match engine.run_entry(this) {
        Ok(result) => {
            engine.heap_mut().dec_ref(result)?;
            Outcome::Completed
        }
        Err(VmError::Exception(thrown)) => {
            let outcome = describe_uncaught(&mut engine, thrown)?;
            engine.heap_mut().dec_ref(thrown)?;
            outcome
        }
        Err(VmError::Report(msg)) => Outcome::Report(msg),
        Err(VmError::Fatal(e)) => return Err(e.into()),
    };
    engine.shutdown()?;
    debug!("run finished: {:?}", outcome);
    Ok(RunReport {
        outcome,
        stats: engine.stats(),
    })
}

/// ToString of an escaped exception. A second throw while converting is
/// swallowed; an error report while converting wins.
fn describe_uncaught(engine: &mut Engine, thrown: Value) -> Result<Outcome, FatalError> {
    match engine.with_root(thrown, |e| e.to_display(thrown)) {
        Ok(text) => Ok(Outcome::Uncaught(text)),
        Err(VmError::Exception(inner)) => {
            engine.heap_mut().dec_ref(inner)?;
            Ok(Outcome::Uncaught("<exception while converting exception>".to_string()))
        }
        Err(VmError::Report(msg)) => Ok(Outcome::Report(msg)),
        Err(VmError::Fatal(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Assembler, CapturedOutput, FunctionSpec, ModuleBuilder, Opcode};

    fn module(body: impl FnOnce(&mut Assembler)) -> Module {
        let mut b = ModuleBuilder::new();
        let mut asm = Assembler::new();
        body(&mut asm);
        let main = b.function(FunctionSpec::new("main"), asm).unwrap();
        b.entry(main);
        b.build().unwrap()
    }

    #[test]
    fn test_arg_is_entry_this() {
        let out = CapturedOutput::new();
        let m = module(|a| {
            a.op(Opcode::PushUndefined)
                .op(Opcode::PushThis)
                .call_native(0, 1)
                .op(Opcode::Pop)
                .op(Opcode::ReturnUndefined);
        });
        let report = run_module(m, Some("hello"), RuntimeConfig::default(), Box::new(out.clone())).unwrap();
        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(out.contents(), "hello\n");
    }

    #[test]
    fn test_uncaught_outcome() {
        let m = module(|a| {
            a.push_int(7).op(Opcode::Throw);
        });
        let report = run_module(m, None, RuntimeConfig::default(), Box::new(CapturedOutput::new())).unwrap();
        assert_eq!(report.outcome, Outcome::Uncaught("7".to_string()));
        assert_eq!(report.outcome.exit_code(), EXIT_UNCAUGHT);
        assert_eq!(report.outcome.diagnostic().unwrap(), "uncaught exception: 7");
    }

    #[test]
    fn test_entry_with_formals_rejected() {
        let mut b = ModuleBuilder::new();
        let mut asm = Assembler::new();
        asm.op(Opcode::ReturnUndefined);
        let main = b.function(FunctionSpec::new("main").formals(1), asm).unwrap();
        b.entry(main);
        let err = run_module(b.build().unwrap(), None, RuntimeConfig::default(), Box::new(io::sink())).unwrap_err();
        assert!(matches!(err, RunError::Load(LoadError::EntryFormals { formals: 1, .. })));
    }

    #[test]
    fn test_missing_file() {
        let err = load_file(Path::new("/nonexistent/image.tagv")).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }
}
