//! Cooperative virtual machine.
//!
//! A [`Vm`] owns a table of processes, each an independent script instance
//! with its own frame stack. One scheduler thread sweeps the table and runs
//! up to `time_slice` instructions of every running process per sweep. A
//! fault ends only the process that raised it.
//!
//! Lock order is table, then process. The scheduler never holds the table
//! lock while running a slice, so host calls and external functions can
//! use the VM while scripts run.

pub mod dispatch;
mod process;
mod value;

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::bytecode::CompiledProgram;

pub use process::{Completion, Frame, ProcessExit, ProcessState, ProcessStatus};
pub use value::{Variable, VariableType};

// ── Errors ───────────────────────────────────────────────────────────

/// A fault raised while executing one process. It ends that process only.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("type error: {op} is not defined for {left} and {right}")]
    TypeError { op: &'static str, left: VariableType, right: VariableType },
    #[error("type error: {op} is not defined for {operand}")]
    UnaryTypeError { op: &'static str, operand: VariableType },
    #[error("type error: {op} expects {expected}, found {found}")]
    UnexpectedType { op: &'static str, expected: VariableType, found: VariableType },
    #[error("cannot convert NaN to INT")]
    NotANumber,
    #[error("division by zero")]
    DivisionByZero,
    #[error("stack level has exceeded max {depth}")]
    StackOverflow { depth: usize },
    #[error("operand stack is empty")]
    StackUnderflow,
    #[error("no active frame")]
    NoActiveFrame,
    #[error("local slot {slot} is outside the limit of {max}")]
    LocalOutOfRange { slot: usize, max: usize },
    #[error("local {slot} is not set")]
    NoSuchLocal { slot: usize },
    #[error("string id {id} is outside the string table")]
    BadStringId { id: usize },
    #[error("function id {id} is outside the function table")]
    BadFunctionId { id: usize },
    #[error("function id {id} has no body")]
    InvalidFunctionEntry { id: usize },
    #[error("imported function {source_file}:{name} cannot be executed")]
    ImportedUnsupported { source_file: String, name: String },
    #[error("opcode {code} has no handler")]
    InvalidOpcode { code: u8 },
    #[error("no external function named `{name}` is bound")]
    UnboundExternal { name: String },
    #[error("external function failed: {0}")]
    External(String),
}

/// Errors returned synchronously by VM operations.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("no process with handle {0}")]
    NoSuchProcess(ProcessHandle),
    #[error("no function named `{name}`")]
    NoSuchFunction { name: String },
    #[error("cannot start entry point `{name}`: {source}")]
    InvalidEntry { name: String, source: ExecError },
    #[error("process {0} is already running")]
    AlreadyRunning(ProcessHandle),
    #[error("cannot bind external `{name}` after the VM has started")]
    BindAfterStart { name: String },
    #[error("the scheduler is already running")]
    SchedulerRunning,
    #[error("cannot initialize dispatch table: {details}")]
    DispatchMismatch { details: String },
    #[error("cannot spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),
}

// ── Configuration ────────────────────────────────────────────────────

/// What `EXT` does when no host function is bound under the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnboundExternal {
    /// Consume the name and arguments, push nothing.
    #[default]
    Ignore,
    /// Consume the name and arguments, push `UNIT`.
    PushUnit,
    /// Fault the process.
    Fault,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Instructions run per process per sweep.
    pub time_slice: usize,
    pub max_stack_depth: usize,
    pub unbound_external: UnboundExternal,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig { time_slice: 60, max_stack_depth: 256, unbound_external: UnboundExternal::Ignore }
    }
}

// ── Handles & call context ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessHandle(pub u64);

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A host function callable from scripts with `$name(...)`. Results go back
/// through the process state, usually with `push`.
pub type ExtFn =
    Arc<dyn Fn(&mut ProcessState, &CallContext, Vec<Variable>) -> Result<(), ExecError> + Send + Sync>;

/// Scheduler-side context handed to every instruction handler.
pub struct CallContext {
    handle: ProcessHandle,
    externals: Arc<HashMap<String, ExtFn>>,
    pub(crate) unbound: UnboundExternal,
    waker: Waker,
}

impl CallContext {
    /// A context with no externals and no scheduler behind it.
    pub fn detached(handle: ProcessHandle) -> Self {
        CallContext {
            handle,
            externals: Arc::new(HashMap::new()),
            unbound: UnboundExternal::default(),
            waker: Waker { handle, shared: Weak::new() },
        }
    }

    pub fn handle(&self) -> ProcessHandle {
        self.handle
    }

    /// A handle that resumes this process from any thread.
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    pub(crate) fn call_external(
        &self,
        name: &str,
        state: &mut ProcessState,
        args: Vec<Variable>,
    ) -> Result<(), ExecError> {
        if let Some(f) = self.externals.get(name) {
            return f(state, self, args);
        }
        warn!(handle = self.handle.0, name, "call to unbound external function");
        match self.unbound {
            UnboundExternal::Ignore => Ok(()),
            UnboundExternal::PushUnit => state.push(Variable::Unit),
            UnboundExternal::Fault => Err(ExecError::UnboundExternal { name: name.to_string() }),
        }
    }
}

#[cfg(test)]
impl CallContext {
    pub(crate) fn bind_for_test(&mut self, name: &str, f: ExtFn) {
        Arc::make_mut(&mut self.externals).insert(name.to_string(), f);
    }
}

/// Wakes one sleeping process. Requests are queued and applied at the
/// start of the next sweep.
#[derive(Clone)]
pub struct Waker {
    handle: ProcessHandle,
    shared: Weak<Shared>,
}

impl Waker {
    pub fn wake(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.queue_wake(self.handle);
        }
    }
}

impl std::fmt::Debug for Waker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Waker").field(&self.handle).finish()
    }
}

// ── Shared state ─────────────────────────────────────────────────────

#[derive(Default)]
struct ProcessTable {
    processes: BTreeMap<ProcessHandle, Arc<Mutex<ProcessState>>>,
    next_handle: u64,
}

#[derive(Default)]
struct Signals {
    wake: Vec<ProcessHandle>,
    /// Set by anything that made a process runnable since the sweep began.
    kicked: bool,
}

#[derive(Default)]
struct Shared {
    table: Mutex<ProcessTable>,
    signals: Mutex<Signals>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

impl Shared {
    fn kick(&self) {
        self.signals.lock().kicked = true;
        self.condvar.notify_one();
    }

    fn queue_wake(&self, handle: ProcessHandle) {
        self.signals.lock().wake.push(handle);
        self.condvar.notify_one();
    }

    fn take_wakes(&self) -> Vec<ProcessHandle> {
        let mut signals = self.signals.lock();
        signals.kicked = false;
        std::mem::take(&mut signals.wake)
    }

    /// Block until something is kicked, woken or shut down.
    fn sleep(&self) {
        let mut signals = self.signals.lock();
        if signals.kicked || !signals.wake.is_empty() || self.shutdown.load(Ordering::Acquire) {
            return;
        }
        info!("scheduler sleeping, no process is running");
        self.condvar.wait(&mut signals);
        info!("scheduler woken");
    }

    fn process(&self, handle: ProcessHandle) -> Result<Arc<Mutex<ProcessState>>, VmError> {
        self.table
            .lock()
            .processes
            .get(&handle)
            .cloned()
            .ok_or(VmError::NoSuchProcess(handle))
    }
}

// ── Scheduler ────────────────────────────────────────────────────────

fn run_scheduler(shared: Arc<Shared>, externals: Arc<HashMap<String, ExtFn>>, config: VmConfig) {
    info!(time_slice = config.time_slice, "scheduler started");
    while !shared.shutdown.load(Ordering::Acquire) {
        let woken = shared.take_wakes();
        let processes: Vec<(ProcessHandle, Arc<Mutex<ProcessState>>)> = {
            let table = shared.table.lock();
            for handle in woken {
                if let Some(p) = table.processes.get(&handle) {
                    if p.lock().wake() {
                        debug!(handle = handle.0, "process woken");
                    }
                }
            }
            table.processes.iter().map(|(h, p)| (*h, Arc::clone(p))).collect()
        };

        let mut awake = 0;
        for (handle, process) in processes {
            let mut state = process.lock();
            if state.status() != ProcessStatus::Running {
                continue;
            }
            awake += 1;
            let ctx = CallContext {
                handle,
                externals: Arc::clone(&externals),
                unbound: config.unbound_external,
                waker: Waker { handle, shared: Arc::downgrade(&shared) },
            };
            let slice = panic::catch_unwind(AssertUnwindSafe(|| {
                state.run_slice(&ctx, config.time_slice)
            }));
            let fault = match slice {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e),
                Err(payload) => Some(ExecError::External(format!(
                    "panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            };
            if let Some(e) = fault {
                error!(handle = handle.0, error = %e, "process faulted");
                state.finish(ProcessExit::Faulted(e));
            }
        }

        shared.table.lock().processes.retain(|handle, p| {
            let finalizing = p.lock().status() == ProcessStatus::Finalizing;
            if finalizing {
                debug!(handle = handle.0, "process removed");
            }
            !finalizing
        });

        if awake == 0 {
            shared.sleep();
        }
    }
    info!("scheduler stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

// ── VM ───────────────────────────────────────────────────────────────

pub struct Vm {
    shared: Arc<Shared>,
    externals: HashMap<String, ExtFn>,
    worker: Option<JoinHandle<()>>,
    config: VmConfig,
}

impl Vm {
    pub fn new(config: VmConfig) -> Result<Vm, VmError> {
        dispatch::verify_dispatch()?;
        Ok(Vm { shared: Arc::new(Shared::default()), externals: HashMap::new(), worker: None, config })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Register a host function. Bindings are frozen once the VM runs.
    pub fn bind_external<F>(&mut self, name: &str, f: F) -> Result<(), VmError>
    where
        F: Fn(&mut ProcessState, &CallContext, Vec<Variable>) -> Result<(), ExecError>
            + Send
            + Sync
            + 'static,
    {
        if self.is_running() {
            return Err(VmError::BindAfterStart { name: name.to_string() });
        }
        self.externals.insert(name.to_string(), Arc::new(f));
        Ok(())
    }

    /// Spawn the scheduler thread.
    pub fn run(&mut self) -> Result<(), VmError> {
        if self.is_running() {
            return Err(VmError::SchedulerRunning);
        }
        let shared = Arc::clone(&self.shared);
        let externals = Arc::new(self.externals.clone());
        let config = self.config.clone();
        let worker = std::thread::Builder::new()
            .name("tern-scheduler".into())
            .spawn(move || run_scheduler(shared, externals, config))?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Stop and join the scheduler. Processes stay in the table.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.kick();
        if worker.join().is_err() {
            error!("scheduler thread panicked");
        }
    }

    // ── Process lifecycle ───────────────────────────────────────────

    pub fn create(&self, program: Arc<CompiledProgram>) -> ProcessHandle {
        let mut table = self.shared.table.lock();
        let handle = ProcessHandle(table.next_handle);
        table.next_handle += 1;
        let state = ProcessState::new(program, self.config.max_stack_depth);
        table.processes.insert(handle, Arc::new(Mutex::new(state)));
        debug!(handle = handle.0, "process created");
        handle
    }

    /// Run `entry` from a fresh frame stack. The returned completion resolves
    /// when the call unwinds, faults, or the process is removed.
    pub fn start(&self, handle: ProcessHandle, entry: &str) -> Result<Completion, VmError> {
        let table = self.shared.table.lock();
        let process = table.processes.get(&handle).ok_or(VmError::NoSuchProcess(handle))?;
        let mut state = process.lock();
        match state.status() {
            ProcessStatus::Running | ProcessStatus::Sleeping => {
                return Err(VmError::AlreadyRunning(handle));
            }
            ProcessStatus::Finalizing => return Err(VmError::NoSuchProcess(handle)),
            ProcessStatus::Inactive => {}
        }
        let id = state
            .program()
            .function_id(entry)
            .ok_or_else(|| VmError::NoSuchFunction { name: entry.to_string() })?;

        let (tx, completion) = Completion::channel();
        state.reset(tx);
        state
            .enter_function(id, Vec::new())
            .map_err(|source| VmError::InvalidEntry { name: entry.to_string(), source })?;
        state.set_status(ProcessStatus::Running);
        debug!(handle = handle.0, entry, "process started");
        drop(state);
        drop(table);
        self.shared.kick();
        Ok(completion)
    }

    /// Read and clear the value left by the last completed invocation.
    pub fn retrieve_return_value(&self, handle: ProcessHandle) -> Result<Option<Variable>, VmError> {
        Ok(self.shared.process(handle)?.lock().take_return_value())
    }

    pub fn is_active(&self, handle: ProcessHandle) -> Result<bool, VmError> {
        Ok(self.process_status(handle)? == ProcessStatus::Running)
    }

    pub fn process_status(&self, handle: ProcessHandle) -> Result<ProcessStatus, VmError> {
        Ok(self.shared.process(handle)?.lock().status())
    }

    /// Forced: remove now. Otherwise the process stops running at once and
    /// is removed at the end of the current sweep.
    pub fn close_process(&self, handle: ProcessHandle, force: bool) -> Result<(), VmError> {
        let mut table = self.shared.table.lock();
        if force {
            table.processes.remove(&handle).ok_or(VmError::NoSuchProcess(handle))?;
            debug!(handle = handle.0, "process force-closed");
            return Ok(());
        }
        let process = table.processes.get(&handle).ok_or(VmError::NoSuchProcess(handle))?;
        process.lock().set_status(ProcessStatus::Finalizing);
        drop(table);
        self.shared.kick();
        Ok(())
    }

    /// Suspend a running process between instructions.
    pub fn pause(&self, handle: ProcessHandle) -> Result<(), VmError> {
        self.shared.process(handle)?.lock().pause();
        Ok(())
    }

    pub fn wake(&self, handle: ProcessHandle) -> Result<(), VmError> {
        let woke = self.shared.process(handle)?.lock().wake();
        if woke {
            self.shared.kick();
        }
        Ok(())
    }

    /// Attach host data that external functions can read back through
    /// [`ProcessState::additional_data`].
    pub fn set_additional_data(
        &self,
        handle: ProcessHandle,
        data: Box<dyn std::any::Any + Send>,
    ) -> Result<(), VmError> {
        self.shared.process(handle)?.lock().set_additional_data(data);
        Ok(())
    }

    /// Run `f` against the process state under its lock.
    pub fn with_process<R>(
        &self,
        handle: ProcessHandle,
        f: impl FnOnce(&mut ProcessState) -> R,
    ) -> Result<R, VmError> {
        Ok(f(&mut self.shared.process(handle)?.lock()))
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Tests ────────────────────────────────────────────────────────────
