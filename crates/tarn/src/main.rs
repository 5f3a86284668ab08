use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tarn_core::{binary, disassemble, BinaryError, Program, Value, VM};

#[derive(Parser)]
#[command(name = "tarn", about = "Tarn: a sandboxed scripting runtime", version)]
struct Cli {
    /// Compiled program (.bin)
    file: Option<String>,

    /// Print a human-readable listing instead of running
    #[arg(short = 'd', long)]
    disassemble: bool,

    /// List embedded resources
    #[arg(short = 'r', long)]
    resources: bool,

    /// Step quota (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_steps: u64,

    /// Allocation quota in bytes (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_allocations: u64,

    /// Call-depth quota (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_frames: usize,

    /// Arguments forwarded to the program's main function
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let Some(file) = cli.file.as_deref() else {
        return Err("usage: tarn [OPTIONS] PROGRAM [ARGS]...".into());
    };
    let program = load_program(Path::new(file))?;

    if cli.disassemble {
        print!("{}", disassemble(&program));
        return Ok(());
    }
    if cli.resources {
        let mut names: Vec<&String> = program.resources.keys().collect();
        names.sort();
        for name in names {
            println!("{name} {}", program.resources[name].len());
        }
        return Ok(());
    }

    let mut vm = VM::new(Arc::new(program), None);
    vm.max_steps = cli.max_steps;
    vm.max_allocations = cli.max_allocations;
    vm.max_frames = cli.max_frames;

    let args: Vec<Value> = cli.args.into_iter().map(Value::string).collect();
    match vm.run(&args) {
        Ok(_) => Ok(()),
        Err(err) if err.stack_trace.is_empty() => Err(err.message),
        Err(err) => Err(format!("{}\n{}", err.message, err.stack_trace)),
    }
}

fn load_program(path: &Path) -> Result<Program, String> {
    let data = fs::read(path).map_err(|e| format!("{}: {e}", path.display()))?;
    binary::read(&data).map_err(|e| match e {
        BinaryError::InvalidHeader => format!(
            "{}: not a compiled tarn program (compile the source first)",
            path.display()
        ),
        other => format!("{}: {other}", path.display()),
    })
}
