//! The compiler binary. Takes a JSON-encoded module (see `wabc::wire`
//! for the shape — a stand-in for whatever a real WAT grammar toolkit
//! would hand the pipeline), a target architecture, and a container
//! format, and writes the finished binary to disk.
//!
//! Run with `--help` for more info.

use std::process::ExitCode;

use clap::Parser;

use wabc::target::{Container, Target};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// path to the JSON-encoded module to compile
    file: String,
    /// target architecture
    #[arg(long, value_enum)]
    target: Target,
    /// output container format
    #[arg(long, value_enum, default_value_t = Container::Flat)]
    container: Container,
    /// where to write the compiled binary
    #[arg(long, default_value = "a.out")]
    out: String,
    /// print the intermediate assembly to stderr before assembling
    #[arg(long, default_value_t = false)]
    emit_asm: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let text = match std::fs::read_to_string(&args.file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("error: could not read {}: {e}", args.file);
            return ExitCode::FAILURE;
        }
    };

    let module = match wabc::wire::parse_module(&text) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("error: could not parse {}: {e}", args.file);
            return ExitCode::FAILURE;
        }
    };

    if args.emit_asm {
        match wabc::pipeline::lower_to_asm(&module, args.target) {
            Ok(asm) => eprintln!("{asm}"),
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let bytes = match wabc::pipeline::compile(&module, args.target, args.container) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = std::fs::write(&args.out, &bytes) {
        eprintln!("error: could not write {}: {e}", args.out);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
