use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use tern::bytecode::CompiledProgram;
use tern::compiler;
use tern::diagnostic::{self, ansi::AnsiRenderer, Diagnostic};
use tern::vm::{ProcessExit, Variable, Vm, VmConfig};

#[derive(Parser)]
#[command(name = "tern", version, about = "Compile tern scripts to bytecode, or run them")]
struct Cli {
    /// Script to compile
    file: PathBuf,

    /// Print the disassembly instead of writing the compiled file
    #[arg(short = 'p', long = "print-disasm")]
    print_disasm: bool,

    /// Print an intermediate form instead of compiling
    #[arg(long, value_enum)]
    emit: Option<Emit>,

    /// Run FN and print its return value
    #[arg(long, value_name = "FN")]
    run: Option<String>,

    /// Report diagnostics as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Emit {
    Ast,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_env("TERN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(diagnostics) => {
            report(&diagnostics, cli.json);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Vec<Diagnostic>> {
    let source = std::fs::read_to_string(&cli.file).map_err(|e| {
        vec![Diagnostic::error(format!("cannot read {}: {}", cli.file.display(), e))]
    })?;
    let with_source = |diags: Vec<Diagnostic>| -> Vec<Diagnostic> {
        diags.into_iter().map(|d| d.with_source(source.clone())).collect()
    };

    let program = compiler::parse_source(&source)
        .map_err(|e| with_source(diagnostic::from_compile_error(&e)))?;

    if let Some(Emit::Ast) = cli.emit {
        let json = serde_json::to_string_pretty(&program)
            .map_err(|e| vec![Diagnostic::error(format!("cannot serialize AST: {}", e))])?;
        println!("{}", json);
        return Ok(());
    }

    let compiled = compiler::compile_program(&program)
        .map_err(|e| with_source(diagnostic::from_compile_error(&e)))?;
    let bytes = compiled.to_bytes().map_err(|e| vec![Diagnostic::from(&e)])?;

    if cli.print_disasm {
        let reloaded = CompiledProgram::from_bytes(&bytes).map_err(|e| vec![Diagnostic::from(&e)])?;
        print!("{}", reloaded.disassemble());
        return Ok(());
    }

    if let Some(entry) = &cli.run {
        let value = execute(compiled, entry)?;
        println!("{}", value);
        return Ok(());
    }

    let out = output_path(&cli.file);
    std::fs::write(&out, &bytes).map_err(|e| {
        vec![Diagnostic::error(format!("cannot write {}: {}", out.display(), e))]
    })?;
    Ok(())
}

/// `script.tern` -> `script.ternc`
fn output_path(input: &Path) -> PathBuf {
    let mut out = input.as_os_str().to_owned();
    out.push("c");
    PathBuf::from(out)
}

/// Run `entry` on a fresh VM with a `$print` external bound.
fn execute(program: CompiledProgram, entry: &str) -> Result<Variable, Vec<Diagnostic>> {
    let fail = |d: Diagnostic| vec![d];
    let mut vm = Vm::new(VmConfig::default()).map_err(|e| fail(Diagnostic::from(&e)))?;
    vm.bind_external("print", |_, _, args| {
        let line: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        println!("{}", line.join(" "));
        Ok(())
    })
    .map_err(|e| fail(Diagnostic::from(&e)))?;
    vm.run().map_err(|e| fail(Diagnostic::from(&e)))?;

    let handle = vm.create(Arc::new(program));
    let completion = vm.start(handle, entry).map_err(|e| fail(Diagnostic::from(&e)))?;
    match completion.wait() {
        ProcessExit::Completed => Ok(vm
            .retrieve_return_value(handle)
            .map_err(|e| fail(Diagnostic::from(&e)))?
            .unwrap_or(Variable::Unit)),
        ProcessExit::Faulted(e) => Err(fail(Diagnostic::from(&e))),
        ProcessExit::Closed => Err(fail(Diagnostic::error("process was closed before it finished"))),
    }
}

fn report(diagnostics: &[Diagnostic], json: bool) {
    if json {
        for d in diagnostics {
            eprintln!("{}", diagnostic::json::render(d));
        }
        return;
    }
    let renderer = AnsiRenderer { use_color: std::io::stderr().is_terminal() };
    for d in diagnostics {
        eprint!("{}", renderer.render(d));
    }
}
