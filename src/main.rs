use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, bail};
use clap::Parser;
use rustyline::error::ReadlineError;

use rat::bytecode::compile_error::CompileErrorKind;
use rat::bytecode::disasm;
use rat::frontend::lexer::Lexer;
use rat::frontend::token_dumper::TokenDumper;
use rat::{CompileErrors, ExitCode, Program, Vm, VmConfig, compile};

#[derive(Parser, Debug)]
#[command(name = "rat", version, about = "Run Rat programs")]
struct Args {
    /// Program to run: `.rat` source or `.ratc` bytecode. Starts a REPL when omitted.
    file: Option<PathBuf>,

    /// Print the token stream instead of running
    #[arg(long)]
    tokens: bool,

    /// Disable ANSI colors in token output
    #[arg(long)]
    no_color: bool,

    /// Show each token's debug representation
    #[arg(long)]
    pretty: bool,

    /// Print the bytecode before running
    #[arg(long)]
    disasm: bool,

    /// Print the operand stack after every instruction (stderr)
    #[arg(long)]
    trace: bool,

    /// Write compiled bytecode to OUT instead of running
    #[arg(long, value_name = "OUT")]
    emit: Option<PathBuf>,

    /// Operand stack capacity
    #[arg(long, value_name = "N", default_value_t = VmConfig::default().stack_capacity)]
    stack: usize,
}

fn main() {
    let args = Args::parse();
    let code = match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    process::exit(code);
}

fn run(args: &Args) -> anyhow::Result<i32> {
    let config = VmConfig {
        stack_capacity: args.stack,
        trace: args.trace,
        ..VmConfig::default()
    };

    match &args.file {
        Some(path) => run_file(path, args, config),
        None => repl(config, args.disasm),
    }
}

enum Input {
    Source,
    Bytecode,
}

fn input_kind(path: &Path) -> anyhow::Result<Input> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("rat") => Ok(Input::Source),
        Some("ratc") => Ok(Input::Bytecode),
        _ => bail!("expected a .rat or .ratc file, got {}", path.display()),
    }
}

fn run_file(path: &Path, args: &Args, config: VmConfig) -> anyhow::Result<i32> {
    let program = match input_kind(path)? {
        Input::Bytecode => {
            if args.tokens {
                bail!("--tokens needs a .rat source file");
            }
            let bytes =
                fs::read(path).with_context(|| format!("failed to read '{}'", path.display()))?;
            Program::from_bytes(&bytes)
                .with_context(|| format!("failed to load '{}'", path.display()))?
        }
        Input::Source => {
            let source = fs::read_to_string(path)
                .with_context(|| format!("failed to read '{}'", path.display()))?;
            if args.tokens {
                return dump_tokens(&source, args);
            }
            match compile(&source) {
                Ok(program) => program,
                Err(errors) => {
                    eprintln!("{}", errors);
                    return Ok(errors.code());
                }
            }
        }
    };

    if let Some(out) = &args.emit {
        let bytes = program.to_bytes()?;
        fs::write(out, bytes).with_context(|| format!("failed to write '{}'", out.display()))?;
        return Ok(ExitCode::Ok.code());
    }

    if args.disasm {
        disasm::print_program(&program)?;
    }

    let mut vm = Vm::with_config(config);
    Ok(match vm.interpret(&program) {
        Ok(()) => ExitCode::Ok.code(),
        Err(e) => {
            eprintln!("{}", e);
            e.code.code()
        }
    })
}

fn dump_tokens(source: &str, args: &Args) -> anyhow::Result<i32> {
    let tokens = match Lexer::new(source).tokenize() {
        Ok(tokens) => tokens,
        Err(e) => {
            let errors = CompileErrors::from(e);
            eprintln!("{}", errors);
            return Ok(errors.code());
        }
    };

    let mut dumper = TokenDumper::new();
    if args.no_color {
        dumper = dumper.no_color();
    }
    if args.pretty {
        dumper = dumper.pretty();
    }
    dumper.dump(&tokens)?;
    Ok(ExitCode::Ok.code())
}

/// Line-at-a-time session on one VM. A line that opens a block keeps
/// reading (`.. ` prompt) until the block is closed.
fn repl(config: VmConfig, show_disasm: bool) -> anyhow::Result<i32> {
    let mut editor = rustyline::DefaultEditor::new()?;
    let mut vm = Vm::with_config(config);
    let mut pending = String::new();

    loop {
        let prompt = if pending.is_empty() { ">> " } else { ".. " };
        let line = match editor.readline(prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                pending.clear();
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        if pending.is_empty() && line.trim().is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line.as_str());
        pending.push_str(&line);
        pending.push('\n');

        let program = match compile(&pending) {
            Ok(program) => program,
            Err(errors)
                if errors
                    .iter()
                    .any(|e| e.kind == CompileErrorKind::UnclosedBlock) =>
            {
                continue;
            }
            Err(errors) => {
                eprintln!("{}", errors);
                pending.clear();
                continue;
            }
        };
        pending.clear();

        if show_disasm {
            disasm::print_program(&program)?;
        }
        if let Err(e) = vm.interpret(&program) {
            eprintln!("{}", e);
        }
    }

    Ok(ExitCode::Ok.code())
}
