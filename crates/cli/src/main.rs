//! Salmon CLI
//!
//! Runs a `.salmon` source file: preprocess imports, compile, interpret.
//! Exit codes follow the sysexits-style contract: 64 for usage errors, 65
//! for compile errors, 70 for runtime errors, 74 for I/O failures.

mod imports;

use std::path::PathBuf;
use std::process;

use clap::Parser;
use clap::error::ErrorKind;
use tracing_subscriber::EnvFilter;

use salmon_runtime::{InterpretResult, Vm, VmOptions};

const EXIT_USAGE: i32 = 64;
const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;
const EXIT_IO_ERROR: i32 = 74;

#[derive(Parser)]
#[command(name = "salmon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Salmon interpreter - run .salmon scripts", long_about = None)]
struct Cli {
    /// Source file to run
    path: PathBuf,

    /// Dump compiled bytecode before execution
    #[arg(long)]
    disassemble: bool,

    /// Trace every executed instruction (logged at trace level)
    #[arg(long)]
    trace: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            if matches!(
                error.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) {
                process::exit(0);
            }
            process::exit(EXIT_USAGE);
        }
    };

    let filter = if cli.trace {
        EnvFilter::new("salmon_runtime=trace,salmon_core=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let source = match imports::preprocess(&cli.path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("{error}");
            process::exit(EXIT_IO_ERROR);
        }
    };

    let options = VmOptions {
        trace_execution: cli.trace,
        disassemble: cli.disassemble,
    };
    let mut vm = Vm::new(options);
    match vm.interpret(&source, &cli.path.display().to_string()) {
        InterpretResult::Ok => {}
        InterpretResult::CompileError => process::exit(EXIT_COMPILE_ERROR),
        InterpretResult::RuntimeError => process::exit(EXIT_RUNTIME_ERROR),
    }
}
