use serde::Serialize;
use std::io;
use std::time::Instant;

use tagvm::config::{CollectorKind, RuntimeConfig};
use tagvm::loader::{Outcome, run_module};
use tagvm::vm::{Assembler, FunctionSpec, Module, ModuleBuilder, Opcode};

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    trial_deletion_secs: f64,
    mark_sweep_secs: f64,
    rust_time_secs: f64,
    instructions: u64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

// Rust reference implementations

fn rust_sum_loop() {
    let mut sum: i64 = 0;
    for i in 1..=1_000_000 {
        sum += i;
    }
    eprintln!("{}", sum);
}

fn rust_fibonacci(n: i32) -> i32 {
    if n <= 1 {
        n
    } else {
        rust_fibonacci(n - 1) + rust_fibonacci(n - 2)
    }
}

fn rust_cycles() {
    use std::cell::RefCell;
    use std::rc::{Rc, Weak};
    struct Node {
        peer: RefCell<Weak<Node>>,
    }
    let mut kept = 0;
    for _ in 0..100_000 {
        let a = Rc::new(Node { peer: RefCell::new(Weak::new()) });
        let b = Rc::new(Node { peer: RefCell::new(Rc::downgrade(&a)) });
        *a.peer.borrow_mut() = Rc::downgrade(&b);
        kept += Rc::weak_count(&a);
    }
    eprintln!("{}", kept);
}

// Benchmark modules

/// `for (i = 1; i <= n; i++) sum += i`
fn sum_loop(n: i32) -> Module {
    let mut b = ModuleBuilder::new();
    let mut a = Assembler::new();
    let (top, done) = (a.label(), a.label());
    a.push_int(0).store_local(0).push_int(1).store_local(1);
    a.bind(top)
        .load_local(1)
        .push_int(n)
        .op(Opcode::Le)
        .jump(Opcode::JumpIfFalse, done)
        .load_local(0)
        .load_local(1)
        .op(Opcode::Add)
        .store_local(0)
        .load_local(1)
        .push_int(1)
        .op(Opcode::Add)
        .store_local(1)
        .jump(Opcode::Jump, top);
    a.bind(done).load_local(0).op(Opcode::Return);
    let main = b.function(FunctionSpec::new("main").locals(2), a).unwrap();
    b.entry(main);
    b.build().unwrap()
}

fn fibonacci(n: i32) -> Module {
    let mut b = ModuleBuilder::new();
    let fib = b.declare();
    let mut f = Assembler::new();
    let recurse = f.label();
    f.load_arg(0)
        .push_int(1)
        .op(Opcode::Le)
        .jump(Opcode::JumpIfFalse, recurse)
        .load_arg(0)
        .op(Opcode::Return)
        .bind(recurse);
    for k in [1, 2] {
        f.op(Opcode::PushUndefined).load_arg(0).push_int(k).op(Opcode::Sub).call(fib, 1);
    }
    f.op(Opcode::Add).op(Opcode::Return);
    b.define(fib, FunctionSpec::new("fib").formals(1), f).unwrap();

    let mut m = Assembler::new();
    m.op(Opcode::PushUndefined).push_int(n).call(fib, 1).op(Opcode::Return);
    let main = b.function(FunctionSpec::new("main"), m).unwrap();
    b.entry(main);
    b.build().unwrap()
}

/// Build and drop `n` two-object cycles.
fn cycles(n: i32) -> Module {
    let mut b = ModuleBuilder::new();
    let mut a = Assembler::new();
    let (top, done) = (a.label(), a.label());
    a.push_int(0).store_local(0);
    a.bind(top)
        .load_local(0)
        .push_int(n)
        .op(Opcode::Lt)
        .jump(Opcode::JumpIfFalse, done)
        .op(Opcode::NewObject)
        .store_local(1)
        .op(Opcode::NewObject)
        .store_local(2)
        .load_local(1)
        .load_local(2)
        .set_named("peer")
        .op(Opcode::Pop)
        .load_local(2)
        .load_local(1)
        .set_named("peer")
        .op(Opcode::Pop)
        .load_local(0)
        .push_int(1)
        .op(Opcode::Add)
        .store_local(0)
        .jump(Opcode::Jump, top);
    a.bind(done).op(Opcode::ReturnUndefined);
    let main = b.function(FunctionSpec::new("main").locals(3), a).unwrap();
    b.entry(main);
    b.build().unwrap()
}

fn time_rust<F>(f: F) -> f64
where
    F: FnOnce(),
{
    let start = Instant::now();
    f();
    start.elapsed().as_secs_f64()
}

fn run_tagvm_benchmark(name: &str, module: Module, collector: CollectorKind) -> (f64, u64) {
    let config = RuntimeConfig {
        collector,
        cycle_trigger_bytes: 256 * 1024,
        ..Default::default()
    };

    let start = Instant::now();
    let result = run_module(module, None, config, Box::new(io::sink()));
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(report) => {
            if report.outcome != Outcome::Completed {
                eprintln!("tagvm benchmark {} ({:?}) ended with {:?}", name, collector, report.outcome);
            }
            (elapsed, report.stats.instructions)
        }
        Err(e) => {
            eprintln!("tagvm benchmark {} ({:?}) failed: {}", name, collector, e);
            (elapsed, 0)
        }
    }
}

fn bench(name: &str, module: fn() -> Module, rust_time: f64) -> BenchmarkResult {
    let (trial_deletion_secs, instructions) = run_tagvm_benchmark(name, module(), CollectorKind::TrialDeletion);
    let (mark_sweep_secs, _) = run_tagvm_benchmark(name, module(), CollectorKind::MarkSweep);
    BenchmarkResult {
        name: name.to_string(),
        trial_deletion_secs,
        mark_sweep_secs,
        rust_time_secs: rust_time,
        instructions,
    }
}

fn main() {
    let results = vec![
        bench("sum_loop", || sum_loop(1_000_000), time_rust(rust_sum_loop)),
        bench(
            "fibonacci",
            || fibonacci(25),
            time_rust(|| eprintln!("{}", rust_fibonacci(25))),
        ),
        bench("cycles", || cycles(100_000), time_rust(rust_cycles)),
    ];

    let output = BenchmarkOutput { results };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("cannot encode results: {}", e),
    }
}
