//! In-process integration tests.
//!
//! These tests assemble module images with the builder API and run them
//! through the library loader, capturing `print` output.

use tagvm::config::{CollectorKind, RuntimeConfig};
use tagvm::loader::{Outcome, RunError, RunReport, run_module};
use tagvm::vm::{
    Assembler, CapturedOutput, FatalError, FunctionSpec, Module, ModuleBuilder, Opcode, PrimOp, PrimType, Value,
};

const PRINT: u16 = 0;
const ERROR: u16 = 1;
const GC: u16 = 3;
const ERROR_CTOR: u16 = 7;
const TYPE_ERROR_CTOR: u16 = 8;

fn run_with(module: Module, config: RuntimeConfig) -> (RunReport, String) {
    let out = CapturedOutput::new();
    let report = run_module(module, None, config, Box::new(out.clone())).expect("run failed");
    (report, out.contents())
}

fn run(module: Module) -> (Outcome, String) {
    let (report, out) = run_with(module, RuntimeConfig::default());
    (report.outcome, out)
}

/// Single-function module with `locals` local slots.
fn main_only(locals: u16, body: impl FnOnce(&mut Assembler)) -> Module {
    let mut b = ModuleBuilder::new();
    let mut asm = Assembler::new();
    body(&mut asm);
    let main = b.function(FunctionSpec::new("main").locals(locals), asm).unwrap();
    b.entry(main);
    b.build().unwrap()
}

/// `print(<value pushed by f>)`, discarding the result.
fn print(a: &mut Assembler, f: impl FnOnce(&mut Assembler)) {
    a.op(Opcode::PushUndefined);
    f(a);
    a.call_native(PRINT, 1).op(Opcode::Pop);
}

// Arithmetic

#[test]
fn test_int_overflow_promotes_to_double() {
    let m = main_only(0, |a| {
        print(a, |a| {
            a.push_int(2_000_000_000).push_int(2_000_000_000).op(Opcode::Add);
        });
        print(a, |a| {
            a.push_int(i32::MIN).op(Opcode::Neg);
        });
        a.op(Opcode::ReturnUndefined);
    });
    let (outcome, out) = run(m);
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(out, "4000000000\n2147483648\n");
}

#[test]
fn test_division_edge_values() {
    let m = main_only(0, |a| {
        for (x, y) in [(1, 0), (-1, 0), (0, 0), (7, 2)] {
            print(a, |a| {
                a.push_int(x).push_int(y).op(Opcode::Div);
            });
        }
        a.op(Opcode::ReturnUndefined);
    });
    let (_, out) = run(m);
    assert_eq!(out, "Infinity\n-Infinity\nNaN\n3.5\n");
}

#[test]
fn test_string_concatenation_and_typeof() {
    let m = main_only(0, |a| {
        print(a, |a| {
            a.push_str("a").push_int(1).op(Opcode::Add).push_double(0.5).op(Opcode::Add);
        });
        print(a, |a| {
            a.push_str("s").op(Opcode::Typeof);
        });
        print(a, |a| {
            a.op(Opcode::NewObject).op(Opcode::Typeof);
        });
        print(a, |a| {
            a.push_str("héllo").get_named("length");
        });
        a.op(Opcode::ReturnUndefined);
    });
    let (_, out) = run(m);
    assert_eq!(out, "a10.5\nstring\nobject\n5\n");
}

#[test]
fn test_equality() {
    let m = main_only(0, |a| {
        print(a, |a| {
            a.push_str("1").push_int(1).op(Opcode::Eq);
        });
        print(a, |a| {
            a.push_str("1").push_int(1).op(Opcode::StrictEq);
        });
        print(a, |a| {
            a.op(Opcode::PushNull).op(Opcode::PushUndefined).op(Opcode::Eq);
        });
        print(a, |a| {
            a.push_int(2).push_double(2.0).op(Opcode::StrictEq);
        });
        a.op(Opcode::ReturnUndefined);
    });
    let (_, out) = run(m);
    assert_eq!(out, "true\nfalse\ntrue\ntrue\n");
}

#[test]
fn test_prim_binary_wraps_to_type() {
    let m = main_only(0, |a| {
        print(a, |a| {
            a.push_int(250).push_int(10).prim(PrimOp::Add, PrimType::U8);
        });
        print(a, |a| {
            a.push_int(127).push_int(1).prim(PrimOp::Add, PrimType::I8);
        });
        a.op(Opcode::ReturnUndefined);
    });
    let (_, out) = run(m);
    assert_eq!(out, "4\n-128\n");
}

#[test]
fn test_prim_binary_division_by_zero_throws() {
    let m = main_only(0, |a| {
        a.push_int(7).push_int(0).prim(PrimOp::Div, PrimType::I32).op(Opcode::ReturnUndefined);
    });
    let (outcome, _) = run(m);
    match outcome {
        Outcome::Uncaught(text) => assert!(text.starts_with("RangeError"), "{}", text),
        other => panic!("unexpected outcome {:?}", other),
    }
}

// Calls and environments

#[test]
fn test_recursive_factorial() {
    let mut b = ModuleBuilder::new();
    let fact = b.declare();
    let mut f = Assembler::new();
    let recurse = f.label();
    f.load_arg(0)
        .push_int(1)
        .op(Opcode::Le)
        .jump(Opcode::JumpIfFalse, recurse)
        .push_int(1)
        .op(Opcode::Return)
        .bind(recurse)
        .load_arg(0)
        .op(Opcode::PushUndefined)
        .load_arg(0)
        .push_int(1)
        .op(Opcode::Sub)
        .call(fact, 1)
        .op(Opcode::Mul)
        .op(Opcode::Return);
    b.define(fact, FunctionSpec::new("fact").formals(1), f).unwrap();

    let mut m = Assembler::new();
    print(&mut m, |a| {
        a.op(Opcode::PushUndefined).push_int(10).call(fact, 1);
    });
    m.op(Opcode::ReturnUndefined);
    let main = b.function(FunctionSpec::new("main"), m).unwrap();
    b.entry(main);

    let (outcome, out) = run(b.build().unwrap());
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(out, "3628800\n");
}

#[test]
fn test_missing_arguments_are_undefined() {
    let mut b = ModuleBuilder::new();
    let mut f = Assembler::new();
    f.load_arg(1).op(Opcode::Return);
    let second = b.function(FunctionSpec::new("second").formals(2), f).unwrap();

    let mut m = Assembler::new();
    print(&mut m, |a| {
        a.op(Opcode::PushUndefined).push_int(1).call(second, 1);
    });
    m.op(Opcode::ReturnUndefined);
    let main = b.function(FunctionSpec::new("main"), m).unwrap();
    b.entry(main);

    let (_, out) = run(b.build().unwrap());
    assert_eq!(out, "undefined\n");
}

#[test]
fn test_closure_counter_shares_environment() {
    let mut b = ModuleBuilder::new();

    let mut inc = Assembler::new();
    inc.load_env(0, 0)
        .push_int(1)
        .op(Opcode::Add)
        .op(Opcode::Dup)
        .store_env(0, 0)
        .op(Opcode::Return);
    let inc = b.function(FunctionSpec::new("inc"), inc).unwrap();

    let mut make = Assembler::new();
    make.push_int(0).store_env(0, 0).new_closure(inc).op(Opcode::Return);
    let make = b.function(FunctionSpec::new("makeCounter").upvalues(1), make).unwrap();

    let mut m = Assembler::new();
    m.op(Opcode::PushUndefined).call(make, 0).store_local(0);
    for _ in 0..2 {
        m.load_local(0).op(Opcode::PushUndefined).call_value(0).op(Opcode::Pop);
    }
    print(&mut m, |a| {
        a.load_local(0).op(Opcode::PushUndefined).call_value(0);
    });
    m.op(Opcode::ReturnUndefined);
    let main = b.function(FunctionSpec::new("main").locals(1), m).unwrap();
    b.entry(main);

    let (outcome, out) = run(b.build().unwrap());
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(out, "3\n");
}

#[test]
fn test_block_environment() {
    let m = main_only(0, |a| {
        a.enter_env(1).push_str("inner").store_env(0, 0);
        print(a, |a| {
            a.load_env(0, 0);
        });
        a.op(Opcode::LeaveEnv).op(Opcode::ReturnUndefined);
    });
    let (outcome, out) = run(m);
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(out, "inner\n");
}

#[test]
fn test_arguments_object() {
    let mut b = ModuleBuilder::new();
    let mut f = Assembler::new();
    f.op(Opcode::GetArguments).get_named("length").op(Opcode::Return);
    let count = b.function(FunctionSpec::new("count").uses_arguments(), f).unwrap();

    let mut m = Assembler::new();
    print(&mut m, |a| {
        a.op(Opcode::PushUndefined).push_int(1).push_int(2).push_int(3).call(count, 3);
    });
    m.op(Opcode::ReturnUndefined);
    let main = b.function(FunctionSpec::new("main"), m).unwrap();
    b.entry(main);

    let (_, out) = run(b.build().unwrap());
    assert_eq!(out, "3\n");
}

#[test]
fn test_call_depth_limit() {
    let mut b = ModuleBuilder::new();
    let spin = b.declare();
    let mut f = Assembler::new();
    f.op(Opcode::PushUndefined).call(spin, 0).op(Opcode::Return);
    b.define(spin, FunctionSpec::new("spin"), f).unwrap();
    let mut m = Assembler::new();
    m.op(Opcode::PushUndefined).call(spin, 0).op(Opcode::Return);
    let main = b.function(FunctionSpec::new("main"), m).unwrap();
    b.entry(main);

    let config = RuntimeConfig {
        max_call_depth: 64,
        ..Default::default()
    };
    let (report, _) = run_with(b.build().unwrap(), config);
    assert_eq!(
        report.outcome,
        Outcome::Uncaught("RangeError: maximum call depth exceeded".to_string())
    );
}

#[test]
fn test_calling_non_function_throws_type_error() {
    let m = main_only(0, |a| {
        a.push_int(1).op(Opcode::PushUndefined).call_value(0).op(Opcode::Return);
    });
    let (outcome, _) = run(m);
    assert_eq!(outcome, Outcome::Uncaught("TypeError: number is not a function".to_string()));
}

// Objects

#[test]
fn test_constructor_and_instanceof() {
    let mut b = ModuleBuilder::new();
    let mut ctor = Assembler::new();
    ctor.op(Opcode::PushThis)
        .load_arg(0)
        .set_named("x")
        .op(Opcode::Pop)
        .op(Opcode::ReturnUndefined);
    let point = b.function(FunctionSpec::new("Point").formals(1), ctor).unwrap();

    let mut m = Assembler::new();
    m.new_closure(point)
        .store_local(0)
        .load_local(0)
        .op(Opcode::NewObject)
        .set_named("prototype")
        .op(Opcode::Pop)
        .load_local(0)
        .push_int(5)
        .new_(1)
        .store_local(1);
    print(&mut m, |a| {
        a.load_local(1).get_named("x");
    });
    print(&mut m, |a| {
        a.load_local(1).load_local(0).op(Opcode::InstanceOf);
    });
    print(&mut m, |a| {
        a.load_local(1).push_native(ERROR_CTOR).op(Opcode::InstanceOf);
    });
    m.op(Opcode::ReturnUndefined);
    let main = b.function(FunctionSpec::new("main").locals(2), m).unwrap();
    b.entry(main);

    let (outcome, out) = run(b.build().unwrap());
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(out, "5\ntrue\nfalse\n");
}

#[test]
fn test_arrays_and_computed_properties() {
    let m = main_only(1, |a| {
        a.push_int(1).push_str("two").push_int(3).new_array(3).store_local(0);
        a.load_local(0).push_int(5).push_int(6).op(Opcode::SetProp).op(Opcode::Pop);
        print(a, |a| {
            a.load_local(0).get_named("length");
        });
        print(a, |a| {
            a.load_local(0).push_str("1").op(Opcode::GetProp);
        });
        print(a, |a| {
            a.load_local(0);
        });
        print(a, |a| {
            a.push_int(2).load_local(0).op(Opcode::In);
        });
        a.op(Opcode::ReturnUndefined);
    });
    let (outcome, out) = run(m);
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(out, "6\ntwo\n1,two,3,,,6\ntrue\n");
}

#[test]
fn test_delete_and_object_literal() {
    let m = main_only(1, |a| {
        a.op(Opcode::NewObject)
            .push_int(1)
            .init_named("a")
            .push_int(2)
            .init_named("b")
            .store_local(0);
        print(a, |a| {
            a.load_local(0).push_str("a").op(Opcode::DeleteProp);
        });
        print(a, |a| {
            a.push_str("a").load_local(0).op(Opcode::In);
        });
        print(a, |a| {
            a.load_local(0).get_named("b");
        });
        a.op(Opcode::ReturnUndefined);
    });
    let (_, out) = run(m);
    assert_eq!(out, "true\nfalse\n2\n");
}

#[test]
fn test_strict_mode_rejects_primitive_property_set() {
    let build = |strict: bool| {
        let mut b = ModuleBuilder::new();
        let mut asm = Assembler::new();
        asm.push_int(1).push_int(2).set_named("x").op(Opcode::Return);
        let spec = FunctionSpec::new("main");
        let spec = if strict { spec.strict() } else { spec };
        let main = b.function(spec, asm).unwrap();
        b.entry(main);
        b.build().unwrap()
    };
    assert_eq!(run(build(false)).0, Outcome::Completed);
    match run(build(true)).0 {
        Outcome::Uncaught(text) => assert!(text.starts_with("TypeError"), "{}", text),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_property_cache_hits_on_repeated_reads() {
    let m = main_only(2, |a| {
        let top = a.label();
        let done = a.label();
        a.op(Opcode::NewObject).push_int(1).init_named("x").store_local(0);
        a.push_int(0).store_local(1);
        a.bind(top)
            .load_local(1)
            .push_int(10)
            .op(Opcode::Lt)
            .jump(Opcode::JumpIfFalse, done)
            .load_local(0)
            .get_named("x")
            .op(Opcode::Pop)
            .load_local(1)
            .push_int(1)
            .op(Opcode::Add)
            .store_local(1)
            .jump(Opcode::Jump, top)
            .bind(done)
            .op(Opcode::ReturnUndefined);
    });
    let (report, _) = run_with(m, RuntimeConfig::default());
    assert_eq!(report.outcome, Outcome::Completed);
    assert!(report.stats.property_cache.hits >= 9, "{:?}", report.stats.property_cache);
}

// Control flow

#[test]
fn test_switch_dispatch() {
    let mut b = ModuleBuilder::new();
    let mut f = Assembler::new();
    let (one, two, three, other) = (f.label(), f.label(), f.label(), f.label());
    f.load_arg(0).switch(1, &[one, two, three], other);
    for (label, text) in [(one, "one"), (two, "two"), (three, "three"), (other, "other")] {
        f.bind(label).push_str(text).op(Opcode::Return);
    }
    let pick = b.function(FunctionSpec::new("pick").formals(1), f).unwrap();

    let mut m = Assembler::new();
    print(&mut m, |a| {
        a.op(Opcode::PushUndefined).push_int(2).call(pick, 1);
    });
    print(&mut m, |a| {
        a.op(Opcode::PushUndefined).push_int(5).call(pick, 1);
    });
    print(&mut m, |a| {
        a.op(Opcode::PushUndefined).push_double(1.5).call(pick, 1);
    });
    print(&mut m, |a| {
        a.op(Opcode::PushUndefined).push_double(3.0).call(pick, 1);
    });
    m.op(Opcode::ReturnUndefined);
    let main = b.function(FunctionSpec::new("main"), m).unwrap();
    b.entry(main);

    let (_, out) = run(b.build().unwrap());
    assert_eq!(out, "two\nother\nother\nthree\n");
}

// Exceptions

#[test]
fn test_try_catch_finally_runs_each_block_once() {
    let mut b = ModuleBuilder::new();
    let result = b.global(Value::UNDEFINED);
    let ran = b.global(Value::int(0));
    let mut a = Assembler::new();
    let (lc, lf, lend) = (a.label(), a.label(), a.label());
    a.try_(Some(lc), Some(lf))
        .push_int(1)
        .op(Opcode::Throw)
        .gosub(lf)
        .op(Opcode::EndTry)
        .jump(Opcode::Jump, lend);
    a.bind(lc)
        .op(Opcode::Catch)
        .store_global(result)
        .gosub(lf)
        .op(Opcode::EndTry)
        .jump(Opcode::Jump, lend);
    a.bind(lf)
        .op(Opcode::Finally)
        .load_global(ran)
        .push_int(1)
        .op(Opcode::Add)
        .store_global(ran)
        .op(Opcode::Retsub);
    a.bind(lend);
    print(&mut a, |a| {
        a.load_global(result);
    });
    print(&mut a, |a| {
        a.load_global(ran);
    });
    a.op(Opcode::ReturnUndefined);
    let main = b.function(FunctionSpec::new("main"), a).unwrap();
    b.entry(main);

    let (outcome, out) = run(b.build().unwrap());
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(out, "1\n1\n");
}

#[test]
fn test_finally_runs_before_rethrow() {
    let m = main_only(0, |a| {
        let (lf, lend) = (a.label(), a.label());
        a.try_(None, Some(lf))
            .push_str("boom")
            .op(Opcode::Throw)
            .gosub(lf)
            .op(Opcode::EndTry)
            .jump(Opcode::Jump, lend);
        a.bind(lf).op(Opcode::Finally);
        print(a, |a| {
            a.push_str("cleanup");
        });
        a.op(Opcode::Retsub).bind(lend).op(Opcode::ReturnUndefined);
    });
    let (outcome, out) = run(m);
    assert_eq!(outcome, Outcome::Uncaught("boom".to_string()));
    assert_eq!(out, "cleanup\n");
}

#[test]
fn test_exception_crosses_activations() {
    let mut b = ModuleBuilder::new();
    let mut f = Assembler::new();
    f.op(Opcode::PushUndefined)
        .push_str("bad input")
        .call_native(TYPE_ERROR_CTOR, 1)
        .op(Opcode::Throw);
    let thrower = b.function(FunctionSpec::new("thrower"), f).unwrap();

    let mut m = Assembler::new();
    let (lc, lend) = (m.label(), m.label());
    m.try_(Some(lc), None)
        .op(Opcode::PushUndefined)
        .call(thrower, 0)
        .op(Opcode::Pop)
        .op(Opcode::EndTry)
        .jump(Opcode::Jump, lend);
    m.bind(lc).op(Opcode::Catch).store_local(0).op(Opcode::EndTry);
    print(&mut m, |a| {
        a.load_local(0);
    });
    print(&mut m, |a| {
        a.load_local(0).push_native(ERROR_CTOR).op(Opcode::InstanceOf);
    });
    m.bind(lend).op(Opcode::ReturnUndefined);
    let main = b.function(FunctionSpec::new("main").locals(1), m).unwrap();
    b.entry(main);

    let (outcome, out) = run(b.build().unwrap());
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(out, "TypeError: bad input\ntrue\n");
}

#[test]
fn test_handler_restores_operand_stack() {
    let m = main_only(0, |a| {
        let (lc, lend) = (a.label(), a.label());
        a.op(Opcode::PushUndefined); // print's `this`, below the try
        a.try_(Some(lc), None)
            .push_int(10)
            .push_int(20)
            .push_str("oops")
            .op(Opcode::Throw);
        a.bind(lc).op(Opcode::Catch).op(Opcode::EndTry);
        a.call_native(PRINT, 1).op(Opcode::Pop);
        a.bind(lend).op(Opcode::ReturnUndefined);
    });
    let (outcome, out) = run(m);
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(out, "oops\n");
}

#[test]
fn test_uninitialized_local_is_reference_error() {
    let m = main_only(1, |a| {
        a.load_local(0).op(Opcode::Return);
    });
    let (outcome, _) = run(m);
    match outcome {
        Outcome::Uncaught(text) => assert!(text.starts_with("ReferenceError"), "{}", text),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_error_native_reports() {
    let m = main_only(0, |a| {
        a.op(Opcode::PushUndefined)
            .push_str("custom failure")
            .call_native(ERROR, 1)
            .op(Opcode::Return);
    });
    let (outcome, _) = run(m);
    assert_eq!(outcome, Outcome::Report("custom failure".to_string()));
    assert_eq!(outcome.exit_code(), 8);
}

// Memory

fn cycle_program(keep_first: bool) -> Module {
    main_only(2, |a| {
        a.op(Opcode::NewObject).store_local(0);
        a.op(Opcode::NewObject).store_local(1);
        a.load_local(0).load_local(1).set_named("peer").op(Opcode::Pop);
        a.load_local(1).load_local(0).set_named("peer").op(Opcode::Pop);
        if !keep_first {
            a.op(Opcode::PushUndefined).store_local(0);
        }
        a.op(Opcode::PushUndefined).store_local(1);
        print(a, |a| {
            a.op(Opcode::PushUndefined).call_native(GC, 0);
        });
        a.op(Opcode::ReturnUndefined);
    })
}

fn freed_by_gc(collector: CollectorKind, keep_first: bool) -> f64 {
    let config = RuntimeConfig {
        collector,
        ..Default::default()
    };
    let (report, out) = run_with(cycle_program(keep_first), config);
    assert_eq!(report.outcome, Outcome::Completed);
    out.trim().parse().unwrap()
}

#[test]
fn test_unreachable_cycle_is_collected() {
    assert!(freed_by_gc(CollectorKind::TrialDeletion, false) >= 2.0);
    assert!(freed_by_gc(CollectorKind::MarkSweep, false) >= 2.0);
}

#[test]
fn test_externally_held_cycle_survives() {
    assert_eq!(freed_by_gc(CollectorKind::TrialDeletion, true), 0.0);
    assert_eq!(freed_by_gc(CollectorKind::MarkSweep, true), 0.0);
}

/// `a.valueOf` and `b.toString` build fresh strings, so the first operand's
/// primitive is alive only in the engine while the second conversion runs.
fn conversion_program() -> Module {
    let mut b = ModuleBuilder::new();
    let mut f = Assembler::new();
    f.push_str("ab").push_str("cd").op(Opcode::Add).op(Opcode::Return);
    let value_of = b.function(FunctionSpec::new("valueOf"), f).unwrap();
    let mut g = Assembler::new();
    g.push_str("ef").push_str("gh").op(Opcode::Add).op(Opcode::Return);
    let to_string = b.function(FunctionSpec::new("toString"), g).unwrap();

    let mut m = Assembler::new();
    m.op(Opcode::NewObject).store_local(0);
    m.load_local(0).new_closure(value_of).set_named("valueOf").op(Opcode::Pop);
    m.op(Opcode::NewObject).store_local(1);
    m.load_local(1).new_closure(to_string).set_named("toString").op(Opcode::Pop);
    print(&mut m, |a| {
        a.load_local(0).load_local(0).op(Opcode::Add);
    });
    print(&mut m, |a| {
        a.load_local(0).load_local(1).op(Opcode::Add);
    });
    print(&mut m, |a| {
        a.load_local(0).load_local(1).op(Opcode::Lt);
    });
    print(&mut m, |a| {
        a.load_local(0).load_local(0).op(Opcode::Le);
    });
    m.op(Opcode::ReturnUndefined);
    let main = b.function(FunctionSpec::new("main").locals(2), m).unwrap();
    b.entry(main);
    b.build().unwrap()
}

#[test]
fn test_conversion_results_survive_collection() {
    for collector in [CollectorKind::TrialDeletion, CollectorKind::MarkSweep] {
        let config = RuntimeConfig {
            collector,
            cycle_trigger_bytes: 0,
            ..Default::default()
        };
        let (report, out) = run_with(conversion_program(), config);
        assert_eq!(report.outcome, Outcome::Completed, "{:?}", collector);
        assert_eq!(out, "abcdabcd\nabcdefgh\ntrue\ntrue\n", "{:?}", collector);
    }
}

#[test]
fn test_released_objects_are_counted() {
    let m = main_only(0, |a| {
        for _ in 0..10 {
            a.op(Opcode::NewObject).op(Opcode::Pop);
        }
        a.op(Opcode::ReturnUndefined);
    });
    let (report, _) = run_with(m, RuntimeConfig::default());
    assert!(report.stats.gc.released >= 10);
    assert!(report.stats.arena.app.reused > 0);
}

// Fatal paths

#[test]
fn test_reserved_opcode_is_fatal() {
    let m = main_only(0, |a| {
        a.op(Opcode::IRead32).op(Opcode::ReturnUndefined);
    });
    let err = run_module(m, None, RuntimeConfig::default(), Box::new(std::io::sink())).unwrap_err();
    assert!(matches!(err, RunError::Fatal(FatalError::Unsupported { name: "iread32", .. })));
}

#[test]
fn test_unknown_opcode_is_fatal() {
    let m = main_only(0, |a| {
        a.raw(0xEE);
    });
    let err = run_module(m, None, RuntimeConfig::default(), Box::new(std::io::sink())).unwrap_err();
    assert!(matches!(err, RunError::Fatal(FatalError::UnknownOpcode { op: 0xEE, .. })));
}

#[test]
fn test_image_roundtrip_runs_identically() {
    let m = main_only(0, |a| {
        print(a, |a| {
            a.push_str("from image").push_double(-0.25).op(Opcode::Add);
        });
        a.op(Opcode::ReturnUndefined);
    });
    let bytes = m.serialize();
    let loaded = Module::deserialize(&bytes).unwrap();
    assert_eq!(run(m).1, run(loaded).1);
}
