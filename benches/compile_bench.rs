//! Benchmarks for Orus compilation and execution

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use orus::lexer::Lexer;
use orus::vm::Vm;

/// Benchmark compile time for varying program sizes
fn bench_compile_time(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_time");

    for &statements in &[1, 8, 32, 128] {
        let source = create_program(statements);
        group.throughput(Throughput::Elements(statements as u64));

        // Warm up
        let _ = Vm::compile(&source, "bench.orus");

        group.bench_function(format!("{}_stmts", statements), |b| {
            b.iter(|| {
                let result = Vm::compile(black_box(&source), "bench.orus");
                black_box(result)
            })
        });
    }

    group.finish();
}

/// Benchmark the scanner on its own
fn bench_lexer(c: &mut Criterion) {
    let source = create_program(64);
    c.bench_function("lex_64_stmts", |b| {
        b.iter(|| {
            let tokens = Lexer::new(black_box(&source)).scan_all();
            black_box(tokens)
        })
    });
}

/// Benchmark execution
fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");

    let fib = "fn fib(n: i32) -> i32 { if n < 2 { return n }\nreturn fib(n - 1) + fib(n - 2) }\nprint(fib(15))";
    let fib_script = Vm::compile(fib, "bench.orus").unwrap();
    group.bench_function("fib_15", |b| {
        b.iter(|| {
            let mut vm = Vm::new();
            vm.capture_output();
            let result = vm.execute(fib_script.clone());
            black_box(result)
        })
    });

    let loop_src = "mut s = 0\nfor i in 0..1000 { s = s + i }\nprint(s)";
    let loop_script = Vm::compile(loop_src, "bench.orus").unwrap();
    group.bench_function("loop_1000", |b| {
        b.iter(|| {
            let mut vm = Vm::new();
            vm.capture_output();
            let result = vm.execute(loop_script.clone());
            black_box(result)
        })
    });

    group.finish();
}

/// Create a program with N simple statements
fn create_program(statements: usize) -> String {
    let mut source = String::from("mut acc = 0\n");
    for i in 0..statements {
        source.push_str(&format!("acc = acc + {}\n", i % 100));
    }
    source.push_str("print(acc)\n");
    source
}

criterion_group!(benches, bench_compile_time, bench_lexer, bench_execute);
criterion_main!(benches);
