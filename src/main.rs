//! Orus command-line front end.
//!
//! Thin shell over the library: loads configuration (orus.toml, `ORUS_*`
//! environment, flags), wires up logging, and drives compile/execute. Exit
//! codes: 0 on success, 65 on compile errors, 70 on runtime errors.

use anyhow::{Context, Result};
use clap::Parser;
use orus::config::OrusConfig;
use orus::vm::{InterpretOutcome, Vm};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;

#[derive(Parser)]
#[command(name = "orus")]
#[command(version)]
#[command(about = "Statically-typed scripting language on a register VM", long_about = None)]
struct Cli {
    /// Script to run; omit for the REPL
    input_file: Option<PathBuf>,

    /// Trace each instruction through the dispatch loop
    #[arg(long)]
    trace: bool,

    /// Enable developer diagnostics in the VM
    #[arg(long)]
    debug: bool,

    /// Force the interactive prompt
    #[arg(long)]
    repl: bool,

    /// Time compile and execute phases separately
    #[arg(long)]
    benchmark: bool,

    /// Print the scanned token stream and exit
    #[arg(long)]
    show_tokens: bool,

    /// Print the parsed tree and exit
    #[arg(long)]
    show_ast: bool,

    /// Print the compiled bytecode and exit
    #[arg(long)]
    show_bytecode: bool,

    /// Print constant-folding statistics
    #[arg(long)]
    show_optimization_stats: bool,

    /// Enable VM profiling counters
    #[arg(long)]
    profile: bool,

    /// Profile instruction mix
    #[arg(long)]
    profile_instructions: bool,

    /// Profile hot paths
    #[arg(long)]
    profile_hot_paths: bool,

    /// Profile register traffic
    #[arg(long)]
    profile_registers: bool,

    /// Profile memory accesses
    #[arg(long)]
    profile_memory_access: bool,

    /// Profile branch behaviour
    #[arg(long)]
    profile_branches: bool,

    /// Where to write profiling output
    #[arg(long)]
    profile_output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Explicit configuration file
    #[arg(long)]
    config_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("orus: {:#}", err);
            return ExitCode::from(EXIT_COMPILE_ERROR);
        }
    };
    init_logging(&config);

    match run(&config) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("orus: {:#}", err);
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

/// File config, environment, then flags, in increasing precedence.
fn build_config(cli: &Cli) -> Result<OrusConfig> {
    let mut config = match &cli.config_file {
        Some(path) => OrusConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => OrusConfig::load_from_cwd().context("loading orus.toml")?,
    };
    config.apply_env();

    if let Some(path) = config.config_file.clone() {
        if cli.config_file.is_none() {
            config = OrusConfig::load(&path)
                .with_context(|| format!("loading config {}", path.display()))?;
            config.apply_env();
        }
    }

    config.trace_execution |= cli.trace;
    config.debug_mode |= cli.debug;
    config.repl_mode |= cli.repl;
    config.benchmark_mode |= cli.benchmark;
    config.show_tokens |= cli.show_tokens;
    config.show_ast |= cli.show_ast;
    config.show_bytecode |= cli.show_bytecode;
    config.show_optimization_stats |= cli.show_optimization_stats;
    config.vm_profiling_enabled |= cli.profile;
    config.profiling.instructions |= cli.profile_instructions;
    config.profiling.hot_paths |= cli.profile_hot_paths;
    config.profiling.registers |= cli.profile_registers;
    config.profiling.memory_access |= cli.profile_memory_access;
    config.profiling.branches |= cli.profile_branches;
    if cli.profile_output.is_some() {
        config.profile_output = cli.profile_output.clone();
    }
    config.verbose |= cli.verbose;
    config.quiet |= cli.quiet;
    if cli.input_file.is_some() {
        config.input_file = cli.input_file.clone();
    }
    Ok(config)
}

fn init_logging(config: &OrusConfig) {
    let filter = EnvFilter::try_new(&config.logging.level)
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.logging.colors)
        .with_writer(io::stderr);
    let builder = if config.logging.location {
        builder.with_file(true).with_line_number(true)
    } else {
        builder.with_file(false).with_line_number(false)
    };
    if config.logging.timestamp {
        let _ = builder.try_init();
    } else {
        let _ = builder.without_time().try_init();
    }
}

fn run(config: &OrusConfig) -> Result<ExitCode> {
    match &config.input_file {
        Some(path) if !config.repl_mode => run_file(config, path.clone()),
        _ => run_repl(config),
    }
}

fn run_file(config: &OrusConfig, path: PathBuf) -> Result<ExitCode> {
    let source = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let display_path = path.display().to_string();

    if config.show_tokens {
        for token in orus::Lexer::new(&source).scan_all() {
            println!(
                "{:>4}:{:<3} {:<16} {:?}",
                token.line, token.column, token.kind.to_string(), token.lexeme
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    if config.show_ast || config.show_optimization_stats {
        let mut outcome = orus::parse(&source);
        if !outcome.diagnostics.is_empty() {
            report_diagnostics(&outcome.diagnostics);
            return Ok(ExitCode::from(EXIT_COMPILE_ERROR));
        }
        if let Err(diagnostics) = orus::resolve(&mut outcome.ast) {
            report_diagnostics(&diagnostics);
            return Ok(ExitCode::from(EXIT_COMPILE_ERROR));
        }
        let stats = orus::optimize(&mut outcome.ast);
        if config.show_optimization_stats {
            println!(
                "constants folded: {}\nexpressions folded: {}\nnodes eliminated: {}",
                stats.constants_folded, stats.expressions_folded, stats.nodes_eliminated
            );
        }
        if config.show_ast {
            for root in &outcome.ast.roots {
                println!("{:#?}", outcome.ast.node(*root));
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    if config.show_bytecode {
        match Vm::compile(&source, &display_path) {
            Ok(script) => {
                print!("{}", orus::disassemble(&script.chunk, &script.name));
                return Ok(ExitCode::SUCCESS);
            }
            Err(diagnostics) => {
                report_diagnostics(&diagnostics);
                return Ok(ExitCode::from(EXIT_COMPILE_ERROR));
            }
        }
    }

    let mut vm = Vm::new();
    vm.set_trace(config.trace_execution);
    vm.set_dev_mode(config.debug_mode);

    if config.benchmark_mode {
        let compile_start = Instant::now();
        let script = match Vm::compile(&source, &display_path) {
            Ok(script) => script,
            Err(diagnostics) => {
                report_diagnostics(&diagnostics);
                return Ok(ExitCode::from(EXIT_COMPILE_ERROR));
            }
        };
        let compile_time = compile_start.elapsed();
        let exec_start = Instant::now();
        let outcome = vm.execute(script);
        let exec_time = exec_start.elapsed();
        if !config.quiet {
            eprintln!("compile: {:?}  execute: {:?}", compile_time, exec_time);
        }
        return Ok(outcome_exit(config, &vm, outcome));
    }

    let outcome = vm.interpret(&source, &display_path);
    Ok(outcome_exit(config, &vm, outcome))
}

fn outcome_exit(config: &OrusConfig, vm: &Vm, outcome: InterpretOutcome) -> ExitCode {
    match outcome {
        InterpretOutcome::Ok => {
            if config.vm_profiling_enabled && !config.quiet {
                let (objects, bytes) = vm.heap_stats();
                eprintln!("heap: {} live objects, {} bytes", objects, bytes);
            }
            ExitCode::SUCCESS
        }
        InterpretOutcome::CompileError(diagnostics) => {
            report_diagnostics(&diagnostics);
            ExitCode::from(EXIT_COMPILE_ERROR)
        }
        InterpretOutcome::RuntimeError(err) => {
            eprintln!("{}", err);
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

fn report_diagnostics(diagnostics: &[orus::Diagnostic]) {
    for diagnostic in diagnostics {
        eprintln!("{}", diagnostic);
    }
}

/// Line-at-a-time prompt against one persistent VM. Each entry compiles as
/// its own unit; the heap and register file persist across entries.
fn run_repl(config: &OrusConfig) -> Result<ExitCode> {
    let mut vm = Vm::new();
    vm.set_trace(config.trace_execution);
    vm.set_dev_mode(config.debug_mode);

    if !config.quiet {
        println!("orus {} (repl); ctrl-d to exit", orus::VERSION);
    }
    let stdin = io::stdin();
    let mut line_no = 0usize;
    loop {
        print!("> ");
        io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        line_no += 1;
        match vm.interpret(trimmed, &format!("<repl:{}>", line_no)) {
            InterpretOutcome::Ok => {}
            InterpretOutcome::CompileError(diagnostics) => report_diagnostics(&diagnostics),
            InterpretOutcome::RuntimeError(err) => {
                eprintln!("{}", err);
                vm.clear_last_error();
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
