//! Host-facing facade over the VM: scripts are addressed by short random
//! ids and loaded from disk once per path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::bytecode::{CompiledProgram, FormatError};
use crate::compiler::{self, CompileError};
use crate::vm::{
    CallContext, ExecError, ProcessExit, ProcessHandle, ProcessState, Variable, Vm, VmConfig,
    VmError,
};

const ID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ID_LEN: usize = 10;
/// Paths with this extension are loaded as bytecode instead of compiled.
pub const BYTECODE_EXTENSION: &str = "ternc";

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("cannot compile {path}: {source}")]
    Compile { path: PathBuf, source: CompileError },
    #[error("cannot load {path}: {source}")]
    Load { path: PathBuf, source: FormatError },
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error("script fault: {0}")]
    Exec(#[from] ExecError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteResult {
    /// Unknown process id, or the process was closed mid-call.
    NoResult,
    Success(Variable),
}

pub struct ProcessManager {
    vm: Vm,
    processes: Mutex<HashMap<String, ProcessHandle>>,
    programs: Mutex<HashMap<PathBuf, Arc<CompiledProgram>>>,
}

impl ProcessManager {
    pub fn new(config: VmConfig) -> Result<Self, ManagerError> {
        Ok(ProcessManager {
            vm: Vm::new(config)?,
            processes: Mutex::new(HashMap::new()),
            programs: Mutex::new(HashMap::new()),
        })
    }

    pub fn bind_external<F>(&mut self, name: &str, f: F) -> Result<(), ManagerError>
    where
        F: Fn(&mut ProcessState, &CallContext, Vec<Variable>) -> Result<(), ExecError>
            + Send
            + Sync
            + 'static,
    {
        Ok(self.vm.bind_external(name, f)?)
    }

    pub fn start(&mut self) -> Result<(), ManagerError> {
        Ok(self.vm.run()?)
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// Load the script at `path` into a fresh process and return its id.
    pub fn new_process(&self, path: impl AsRef<Path>) -> Result<String, ManagerError> {
        let program = self.program(path.as_ref()).inspect_err(|e| {
            error!(path = %path.as_ref().display(), error = %e, "failed to load script");
        })?;
        let handle = self.vm.create(program);

        let mut processes = self.processes.lock();
        let id = loop {
            let id = random_id();
            if !processes.contains_key(&id) {
                break id;
            }
        };
        debug!(%id, %handle, "new process");
        processes.insert(id.clone(), handle);
        Ok(id)
    }

    /// Run `function` in process `id` and block until it unwinds.
    pub fn execute_function(&self, id: &str, function: &str) -> Result<ExecuteResult, ManagerError> {
        let Some(handle) = self.handle(id) else {
            return Ok(ExecuteResult::NoResult);
        };
        match self.vm.start(handle, function)?.wait() {
            ProcessExit::Completed => {
                let value = self.vm.retrieve_return_value(handle)?.unwrap_or(Variable::Unit);
                Ok(ExecuteResult::Success(value))
            }
            ProcessExit::Faulted(e) => Err(e.into()),
            ProcessExit::Closed => Ok(ExecuteResult::NoResult),
        }
    }

    /// Returns false when `id` is unknown.
    pub fn close_process(&self, id: &str, force: bool) -> Result<bool, ManagerError> {
        let Some(handle) = self.processes.lock().remove(id) else {
            return Ok(false);
        };
        self.vm.close_process(handle, force)?;
        Ok(true)
    }

    pub fn sleep(&self, id: &str) -> Result<bool, ManagerError> {
        let Some(handle) = self.handle(id) else {
            return Ok(false);
        };
        self.vm.pause(handle)?;
        Ok(true)
    }

    pub fn wake(&self, id: &str) -> Result<bool, ManagerError> {
        let Some(handle) = self.handle(id) else {
            return Ok(false);
        };
        self.vm.wake(handle)?;
        Ok(true)
    }

    pub fn is_busy(&self, id: &str) -> bool {
        self.handle(id).is_some_and(|h| self.vm.is_active(h).unwrap_or(false))
    }

    fn handle(&self, id: &str) -> Option<ProcessHandle> {
        self.processes.lock().get(id).copied()
    }

    fn program(&self, path: &Path) -> Result<Arc<CompiledProgram>, ManagerError> {
        if let Some(program) = self.programs.lock().get(path) {
            return Ok(Arc::clone(program));
        }
        let program = Arc::new(load_program(path)?);
        self.programs.lock().insert(path.to_path_buf(), Arc::clone(&program));
        Ok(program)
    }
}

/// Bytecode files are read as-is. Source files are compiled and pushed
/// through the binary format so both paths load the same way.
fn load_program(path: &Path) -> Result<CompiledProgram, ManagerError> {
    if path.extension().is_some_and(|e| e == BYTECODE_EXTENSION) {
        return CompiledProgram::load_file(path)
            .map_err(|source| ManagerError::Load { path: path.to_path_buf(), source });
    }
    let source = std::fs::read_to_string(path)
        .map_err(|source| ManagerError::Read { path: path.to_path_buf(), source })?;
    let bytes = compiler::compile_to_bytes(&source)
        .map_err(|source| ManagerError::Compile { path: path.to_path_buf(), source })?;
    CompiledProgram::from_bytes(&bytes)
        .map_err(|source| ManagerError::Load { path: path.to_path_buf(), source })
}

fn random_id() -> String {
    (0..ID_LEN)
        .map(|_| ID_CHARS[fastrand::usize(..ID_CHARS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn script(dir: &tempfile::TempDir, name: &str, source: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(source.as_bytes()).unwrap();
        path
    }

    fn manager() -> ProcessManager {
        let mut m = ProcessManager::new(VmConfig::default()).unwrap();
        m.start().unwrap();
        m
    }

    #[test]
    fn ids_are_ten_uppercase_alphanumerics() {
        for _ in 0..50 {
            let id = random_id();
            assert_eq!(id.len(), 10);
            assert!(id.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()), "{id}");
        }
    }

    #[test]
    fn execute_from_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "add.tern", "fn main() { return add(2, 3); } fn add(a, b) { return a + b; }");
        let m = manager();
        let id = m.new_process(&path).unwrap();
        assert_eq!(
            m.execute_function(&id, "main").unwrap(),
            ExecuteResult::Success(Variable::Int(5))
        );
        assert!(!m.is_busy(&id));
    }

    #[test]
    fn execute_from_bytecode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greet.ternc");
        compiler::compile_source(r#"fn main() { return "hi " + 2; }"#)
            .unwrap()
            .save_file(&path)
            .unwrap();
        let m = manager();
        let id = m.new_process(&path).unwrap();
        assert_eq!(
            m.execute_function(&id, "main").unwrap(),
            ExecuteResult::Success(Variable::Str("hi 2".into()))
        );
    }

    #[test]
    fn no_return_value_is_unit() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "empty.tern", "fn main() { x = 1; }");
        let m = manager();
        let id = m.new_process(&path).unwrap();
        assert_eq!(m.execute_function(&id, "main").unwrap(), ExecuteResult::Success(Variable::Unit));
    }

    #[test]
    fn programs_are_cached_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "one.tern", "fn main() { return 1; }");
        let m = manager();
        let a = m.new_process(&path).unwrap();
        // Later edits to the file are not picked up.
        script(&dir, "one.tern", "fn main() { return 2; }");
        let b = m.new_process(&path).unwrap();
        assert_ne!(a, b);
        assert_eq!(m.execute_function(&b, "main").unwrap(), ExecuteResult::Success(Variable::Int(1)));
        assert_eq!(m.programs.lock().len(), 1);
    }

    #[test]
    fn unknown_id_has_no_result() {
        let m = manager();
        assert_eq!(m.execute_function("NOPE", "main").unwrap(), ExecuteResult::NoResult);
        assert!(!m.close_process("NOPE", true).unwrap());
    }

    #[test]
    fn load_failures_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager();
        assert!(matches!(
            m.new_process(dir.path().join("missing.tern")),
            Err(ManagerError::Read { .. })
        ));
        let bad = script(&dir, "bad.tern", "fn main( {");
        assert!(matches!(m.new_process(&bad), Err(ManagerError::Compile { .. })));
        let junk = script(&dir, "junk.ternc", "not bytecode");
        assert!(matches!(m.new_process(&junk), Err(ManagerError::Load { .. })));
    }

    #[test]
    fn faults_surface_as_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "div.tern", "fn main() { return 1 / 0; }");
        let m = manager();
        let id = m.new_process(&path).unwrap();
        assert!(matches!(
            m.execute_function(&id, "main"),
            Err(ManagerError::Exec(ExecError::DivisionByZero))
        ));
        assert!(matches!(
            m.execute_function(&id, "missing"),
            Err(ManagerError::Vm(VmError::NoSuchFunction { .. }))
        ));
    }

    #[test]
    fn close_forgets_the_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "a.tern", "fn main() { }");
        let m = manager();
        let id = m.new_process(&path).unwrap();
        assert!(m.close_process(&id, true).unwrap());
        assert_eq!(m.execute_function(&id, "main").unwrap(), ExecuteResult::NoResult);
    }

    #[test]
    fn externals_are_bound_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "ext.tern", "fn main() { return $answer(); }");
        let mut m = ProcessManager::new(VmConfig::default()).unwrap();
        m.bind_external("answer", |state, _, _| state.push(Variable::Int(42))).unwrap();
        m.start().unwrap();
        let id = m.new_process(&path).unwrap();
        assert_eq!(m.execute_function(&id, "main").unwrap(), ExecuteResult::Success(Variable::Int(42)));
    }
}
