//! msi - the mscript interpreter CLI.
//!
//! Three modes: a line-by-line REPL (the default), one-shot execution of a
//! script file, and a built-in smoke test behind `--test`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use rustyline::error::ReadlineError;

use mscript::Vm;

#[derive(Parser)]
#[command(name = "msi")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "mscript interpreter", long_about = None)]
struct Cli {
    /// Script file to interpret; starts a REPL when omitted
    script: Option<PathBuf>,

    /// Run the built-in smoke-test program instead of a script
    #[arg(long)]
    test: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut vm = Vm::new();

    if cli.test {
        run_test(&mut vm);
    } else {
        match cli.script {
            Some(path) => run_file(&mut vm, &path),
            None => repl(&mut vm),
        }
    }
}

fn run_test(vm: &mut Vm) {
    match vm.run_test_program() {
        Ok(()) => println!("smoke test passed"),
        Err(_) => {
            eprintln!("smoke test failed");
            process::exit(-1);
        }
    }
}

fn run_file(vm: &mut Vm, path: &Path) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("couldn't open file {}: {}", path.display(), err);
            process::exit(-1);
        }
    };

    // diagnostics already went to stderr; the exit code stays 0 either way
    let _ = vm.interpret(&source);
}

fn repl(vm: &mut Vm) {
    let mut editor = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("couldn't start line editor: {}", err);
            process::exit(-1);
        }
    };

    let history = home::home_dir().map(|dir| dir.join(".msi_history"));
    if let Some(path) = &history {
        // absent on first run
        let _ = editor.load_history(path);
    }

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                // each line is a complete program
                let _ = vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("couldn't read line: {}", err);
                process::exit(-1);
            }
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
}
