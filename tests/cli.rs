use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn tern() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tern"));
    cmd.env_remove("TERN_LOG");
    cmd
}

fn write_script(dir: &Path, name: &str, source: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, source).expect("write script");
    path
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

const ADD: &str = "fn add(a, b) { return a + b; }\nfn main() { return add(2, 3); }\n";

// --- compile ---

#[test]
fn compiles_to_sibling_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "add.tern", ADD);
    let out = tern().arg(&path).output().expect("failed to run tern");
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let compiled = dir.path().join("add.ternc");
    let bytes = std::fs::read(&compiled).expect("compiled file exists");
    assert_eq!(&bytes[..5], b"TRN01");
    let program = tern::bytecode::CompiledProgram::load_file(&compiled).unwrap();
    assert_eq!(program.function_id("main"), Some(1));
}

#[test]
fn print_disasm_does_not_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "add.tern", ADD);
    let out = tern().arg(&path).arg("-p").output().expect("failed to run tern");
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let text = stdout(&out);
    assert!(text.contains("String Table:"), "{text}");
    assert!(text.contains("Function ID Table:"), "{text}");
    assert!(text.contains("CALL 2"), "{text}");
    assert!(!dir.path().join("add.ternc").exists());
}

#[test]
fn emit_ast_prints_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "add.tern", ADD);
    let out = tern().arg(&path).args(["--emit", "ast"]).output().expect("failed to run tern");
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let ast: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("valid JSON");
    assert_eq!(ast["functions"][0]["name"], "add");
    assert_eq!(ast["functions"][1]["name"], "main");
}

// --- run ---

#[test]
fn run_prints_return_value() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "add.tern", ADD);
    let out = tern().arg(&path).args(["--run", "main"]).output().expect("failed to run tern");
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out).trim(), "5");
}

#[test]
fn run_binds_print() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "hello.tern", r#"fn main() { $print("hello", 1 + 1); }"#);
    let out = tern().arg(&path).args(["--run", "main"]).output().expect("failed to run tern");
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "hello 2\nunit\n");
}

#[test]
fn runtime_fault_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "bad.tern", "fn main() { return true + 1; }");
    let out = tern().arg(&path).args(["--run", "main"]).output().expect("failed to run tern");
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("TRN-R001"), "{err}");
    assert!(err.contains("BOOLEAN"), "{err}");
}

#[test]
fn unknown_entry_point() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "add.tern", ADD);
    let out = tern().arg(&path).args(["--run", "nope"]).output().expect("failed to run tern");
    assert!(!out.status.success());
    assert!(stderr(&out).contains("nope"));
}

// --- errors ---

#[test]
fn syntax_errors_are_all_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "bad.tern", "fn a( { }\nfn b() { x = ; }\n");
    let out = tern().arg(&path).output().expect("failed to run tern");
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.matches("error[TRN-P").count() >= 2, "{err}");
    assert!(!dir.path().join("bad.ternc").exists());
}

#[test]
fn json_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "bad.tern", "fn main() { return y; }");
    let out = tern().arg(&path).arg("--json").output().expect("failed to run tern");
    assert_eq!(out.status.code(), Some(1));
    let line = stderr(&out);
    let v: serde_json::Value = serde_json::from_str(line.trim()).expect("valid JSON");
    assert_eq!(v["severity"], "error");
    assert_eq!(v["code"], "TRN-C001");
    assert_eq!(v["notes"][0], "in function 'main'");
}

#[test]
fn missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = tern().arg(dir.path().join("nope.tern")).output().expect("failed to run tern");
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("cannot read"));
}

#[test]
fn no_arguments_prints_usage() {
    let out = tern().output().expect("failed to run tern");
    assert!(!out.status.success());
    assert!(stderr(&out).contains("Usage"));
}
