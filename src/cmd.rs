use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use makro_vm::{Config, InterpretError, VM};
use reedline::Signal;
use termcolor::{ColorChoice, StandardStream};

use crate::repl::{self, Prompt};

/// Exit codes from sysexits.h.
const EXIT_DATAERR: u8 = 65;
const EXIT_SOFTWARE: u8 = 70;

#[derive(Debug, Parser)]
#[clap(about, author, disable_help_subcommand = true, propagate_version = true, version)]
pub enum Cmd {
    /// Start an interactive session.
    Repl {
        /// Collect garbage before every allocation.
        #[clap(long)]
        gc_stress: bool,
    },
    /// Run a script.
    Run {
        path: PathBuf,
        /// Collect garbage before every allocation.
        #[clap(long)]
        gc_stress: bool,
    },
}

impl Cmd {
    pub fn run(&self) -> Result<ExitCode> {
        match self {
            Cmd::Repl { gc_stress } => run_repl(config(*gc_stress)),
            Cmd::Run { path, gc_stress } => run_file(path, config(*gc_stress)),
        }
    }
}

fn config(gc_stress: bool) -> Config {
    let default = Config::default();
    Config { gc_stress: gc_stress || default.gc_stress, ..default }
}

fn run_file(path: &Path, config: Config) -> Result<ExitCode> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("could not read file: {}", path.display()))?;

    let mut vm = VM::with_config(config);
    let stdout = io::stdout();
    let result = vm.interpret(&source, &mut stdout.lock());
    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            report(&e, vm.source())?;
            let code = match e {
                InterpretError::Compile(_) => EXIT_DATAERR,
                InterpretError::Runtime { .. } => EXIT_SOFTWARE,
            };
            Ok(ExitCode::from(code))
        }
    }
}

fn run_repl(config: Config) -> Result<ExitCode> {
    let mut editor = repl::editor();
    let mut vm = VM::with_config(config);

    loop {
        match editor.read_line(&Prompt).context("could not read line")? {
            Signal::Success(line) => {
                if let Err(e) = vm.interpret(&line, &mut io::stdout()) {
                    report(&e, vm.source())?;
                }
            }
            Signal::CtrlD => return Ok(ExitCode::SUCCESS),
            _ => {}
        }
    }
}

fn report(e: &InterpretError, source: &str) -> Result<()> {
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    e.report(&mut stderr, source).context("could not write to stderr")
}
