//! Skein command-line driver.
//!
//! Runs a source snippet or a boot script against a fresh machine. Any
//! exception prints its cause chain to stderr and the process exits nonzero
//! after the final collection has had its chance to retire libraries.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;

use clap::Parser;

use skein_core::MachineConfig;
use skein_runtime::{boot, standard_machine};

#[derive(Parser)]
#[command(name = "skein")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Skein - runtime for a small concatenative language", long_about = None)]
struct Cli {
    /// Source snippet to execute
    #[arg(short = 'x', long, visible_short_alias = 'e', value_name = "CODE")]
    execute: Option<String>,

    /// Boot script to run when no snippet is given
    #[arg(short, long, value_name = "PATH")]
    boot: Option<PathBuf>,

    /// Kernel module that provides the builtin words
    #[arg(short, long, default_value = "kernel", value_name = "PATH")]
    kernel: String,

    /// Verbosity: 0 is quiet, >= 1 echoes the data stack after each
    /// instruction
    #[arg(short, long, default_value_t = 0, value_name = "N")]
    verbose: u8,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let source = match (cli.execute, cli.boot) {
        (Some(code), _) => code,
        (None, Some(path)) => match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(error) => {
                eprintln!("[error] failed to read boot script '{}': {error}", path.display());
                process::exit(1);
            }
        },
        (None, None) => String::new(),
    };

    let mut machine = standard_machine(MachineConfig {
        verbosity: cli.verbose,
        kernel_path: cli.kernel,
        ..MachineConfig::default()
    });

    let stderr = io::stderr();
    let mut failed = false;

    // report before finalizing: the final collection reclaims the
    // exception value along with everything else
    if let Err(exception) = boot::execute(&mut machine, &source) {
        failed = true;
        let _ = boot::report(&machine, &mut stderr.lock(), exception);
    }
    if let Err(exception) = boot::finalize(&mut machine) {
        failed = true;
        let _ = boot::report(&machine, &mut stderr.lock(), exception);
    }
    if failed {
        process::exit(1);
    }
}
