//! Driver tests: run the `msi` binary against real files.

use std::io::Write;
use std::process::Command;

fn msi() -> Command {
    Command::new(env!("CARGO_BIN_EXE_msi"))
}

#[test]
fn test_runs_a_script_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "x = 0").unwrap();
    writeln!(file, "while x < 10").unwrap();
    writeln!(file, "x = x + 1").unwrap();
    writeln!(file, "end while").unwrap();

    let output = msi().arg(file.path()).output().unwrap();
    assert!(output.status.success(), "stderr: {:?}", output.stderr);
}

#[test]
fn test_script_with_errors_still_exits_zero() {
    // diagnostics go to stderr; a failed program still exits 0
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "1 + \"abc\"").unwrap();

    let output = msi().arg(file.path()).output().unwrap();
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Runtime Error: Types must be the same. [line 1]"),
        "stderr: {}",
        stderr
    );
}

#[test]
fn test_compile_error_diagnostic_format() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "x = 1").unwrap();
    writeln!(file, "end banana").unwrap();

    let output = msi().arg(file.path()).output().unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Compiler Error:") && stderr.contains("[line 2]"),
        "stderr: {}",
        stderr
    );
}

#[test]
fn test_missing_file_fails() {
    let output = msi().arg("definitely/not/a/file.ms").output().unwrap();
    assert!(!output.status.success());
    // exit(-1), which the shell sees as 255
    assert_eq!(output.status.code(), Some(255));
}

#[test]
fn test_smoke_test_flag() {
    let output = msi().arg("--test").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("smoke test passed"), "stdout: {}", stdout);
}

#[test]
fn test_extra_arguments_print_usage() {
    let output = msi().arg("one.ms").arg("two.ms").output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage"), "stderr: {}", stderr);
}
