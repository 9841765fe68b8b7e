use std::any::Any;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::bytecode::{CompiledProgram, FunctionTableEntry, MAX_LOCALS, Op};

use super::dispatch;
use super::{CallContext, ExecError, Variable};

/// Lifecycle of one script instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Inactive,
    Running,
    Sleeping,
    /// Close requested; removed at the end of the current sweep.
    Finalizing,
}

/// How a started invocation ended.
#[derive(Debug)]
pub enum ProcessExit {
    /// The last frame returned. The value, if any, is waiting in
    /// `Vm::retrieve_return_value`.
    Completed,
    Faulted(ExecError),
    /// The process was removed before it finished.
    Closed,
}

/// Receiving end of a started invocation.
#[derive(Debug)]
pub struct Completion {
    rx: mpsc::Receiver<ProcessExit>,
}

impl Completion {
    pub(crate) fn channel() -> (mpsc::Sender<ProcessExit>, Completion) {
        let (tx, rx) = mpsc::channel();
        (tx, Completion { rx })
    }

    /// Block until the invocation ends.
    pub fn wait(self) -> ProcessExit {
        self.rx.recv().unwrap_or(ProcessExit::Closed)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ProcessExit> {
        match self.rx.recv_timeout(timeout) {
            Ok(exit) => Some(exit),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(ProcessExit::Closed),
        }
    }

    /// `None` while the invocation is still going.
    pub fn try_wait(&self) -> Option<ProcessExit> {
        match self.rx.try_recv() {
            Ok(exit) => Some(exit),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(ProcessExit::Closed),
        }
    }
}

/// Control transfer requested by the instruction that just ran. Without
/// one the frame advances to the next instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Jump(usize),
    Exit,
}

/// One function activation.
#[derive(Debug)]
pub struct Frame {
    pub function: usize,
    ip: usize,
    stack: Vec<Variable>,
    locals: Vec<Option<Variable>>,
}

impl Frame {
    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn stack(&self) -> &[Variable] {
        &self.stack
    }
}

/// Execution state of one process: its frames, its lifecycle status and
/// whatever the host attached to it. External functions receive this to
/// push results, jump, call back into script functions or pause.
pub struct ProcessState {
    program: Arc<CompiledProgram>,
    frames: Vec<Frame>,
    status: ProcessStatus,
    return_value: Option<Variable>,
    transfer: Option<Transfer>,
    completion: Option<mpsc::Sender<ProcessExit>>,
    additional: Option<Box<dyn Any + Send>>,
    max_depth: usize,
}

impl std::fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessState")
            .field("frames", &self.frames)
            .field("status", &self.status)
            .field("return_value", &self.return_value)
            .finish_non_exhaustive()
    }
}

impl ProcessState {
    pub fn new(program: Arc<CompiledProgram>, max_depth: usize) -> Self {
        ProcessState {
            program,
            frames: Vec::new(),
            status: ProcessStatus::Inactive,
            return_value: None,
            transfer: None,
            completion: None,
            additional: None,
            max_depth,
        }
    }

    pub fn program(&self) -> &CompiledProgram {
        &self.program
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: ProcessStatus) {
        self.status = status;
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Drop every frame and pending result ahead of a fresh start.
    pub(crate) fn reset(&mut self, completion: mpsc::Sender<ProcessExit>) {
        self.frames.clear();
        self.return_value = None;
        self.transfer = None;
        self.completion = Some(completion);
    }

    // ── Frames ──────────────────────────────────────────────────────

    fn frame(&self) -> Result<&Frame, ExecError> {
        self.frames.last().ok_or(ExecError::NoActiveFrame)
    }

    fn frame_mut(&mut self) -> Result<&mut Frame, ExecError> {
        self.frames.last_mut().ok_or(ExecError::NoActiveFrame)
    }

    /// Push a frame for function `id` with `args` copied into slots 1..=n.
    pub fn enter_function(&mut self, id: usize, args: Vec<Variable>) -> Result<(), ExecError> {
        if self.frames.len() == self.max_depth {
            return Err(ExecError::StackOverflow { depth: self.max_depth });
        }
        let local_count = match self.program.function(id) {
            Some(FunctionTableEntry::Local(f)) => f.local_count,
            Some(FunctionTableEntry::Imported { source_file, name }) => {
                return Err(ExecError::ImportedUnsupported {
                    source_file: source_file.clone(),
                    name: name.clone(),
                });
            }
            Some(FunctionTableEntry::Invalid) => return Err(ExecError::InvalidFunctionEntry { id }),
            None => return Err(ExecError::BadFunctionId { id }),
        };
        if local_count > MAX_LOCALS {
            return Err(ExecError::LocalOutOfRange { slot: local_count - 1, max: MAX_LOCALS });
        }
        debug!(function = id, depth = self.frames.len() + 1, "enter function");

        let mut locals = vec![None; local_count.max(args.len() + 1)];
        for (slot, arg) in locals[1..].iter_mut().zip(args) {
            *slot = Some(arg);
        }
        self.frames.push(Frame { function: id, ip: 0, stack: Vec::new(), locals });
        Ok(())
    }

    /// Leave the current frame once the running instruction finishes.
    pub fn exit_function(&mut self) {
        debug!("exit function");
        self.transfer = Some(Transfer::Exit);
    }

    /// Continue at `ip` in the current frame once the running instruction finishes.
    pub fn set_next_ip(&mut self, ip: usize) {
        self.transfer = Some(Transfer::Jump(ip));
    }

    /// Pop the current frame. The pending return value moves onto the
    /// caller's stack; popping the last frame finishes the process and
    /// leaves the value for the host.
    fn pop_frame(&mut self) -> Result<(), ExecError> {
        if self.frames.pop().is_none() {
            return Err(ExecError::NoActiveFrame);
        }
        if self.frames.is_empty() {
            debug!("last frame popped");
            self.finish(ProcessExit::Completed);
            return Ok(());
        }
        if let Some(value) = self.return_value.take() {
            self.push(value)?;
        }
        Ok(())
    }

    /// Mark the process inactive and resolve its completion.
    pub(crate) fn finish(&mut self, exit: ProcessExit) {
        if matches!(exit, ProcessExit::Faulted(_)) {
            self.frames.clear();
        }
        self.status = ProcessStatus::Inactive;
        self.transfer = None;
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(exit);
        }
    }

    // ── Operand stack & locals ──────────────────────────────────────

    pub fn push(&mut self, value: Variable) -> Result<(), ExecError> {
        self.frame_mut()?.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Variable, ExecError> {
        self.frame_mut()?.stack.pop().ok_or(ExecError::StackUnderflow)
    }

    /// Pop `n` values and return them in push order.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Variable>, ExecError> {
        let stack = &mut self.frame_mut()?.stack;
        if stack.len() < n {
            return Err(ExecError::StackUnderflow);
        }
        Ok(stack.split_off(stack.len() - n))
    }

    pub fn get_local(&self, slot: usize) -> Result<Variable, ExecError> {
        let value = self
            .frame()?
            .locals
            .get(slot)
            .and_then(|v| v.clone())
            .ok_or(ExecError::NoSuchLocal { slot })?;
        debug!(slot, %value, "get local");
        Ok(value)
    }

    pub fn set_local(&mut self, slot: usize, value: Variable) -> Result<(), ExecError> {
        debug!(slot, %value, "set local");
        if slot >= MAX_LOCALS {
            return Err(ExecError::LocalOutOfRange { slot, max: MAX_LOCALS });
        }
        let locals = &mut self.frame_mut()?.locals;
        if slot >= locals.len() {
            locals.resize(slot + 1, None);
        }
        locals[slot] = Some(value);
        Ok(())
    }

    pub fn string(&self, id: usize) -> Result<&str, ExecError> {
        self.program.string(id).ok_or(ExecError::BadStringId { id })
    }

    // ── Host-facing ─────────────────────────────────────────────────

    pub fn set_return_value(&mut self, value: Variable) {
        self.return_value = Some(value);
    }

    /// Read and clear the pending return value.
    pub fn take_return_value(&mut self) -> Option<Variable> {
        self.return_value.take()
    }

    /// Stop after the current instruction until woken.
    pub fn pause(&mut self) {
        if self.status == ProcessStatus::Running {
            self.status = ProcessStatus::Sleeping;
        }
    }

    pub fn wake(&mut self) -> bool {
        if self.status == ProcessStatus::Sleeping {
            self.status = ProcessStatus::Running;
            return true;
        }
        false
    }

    pub fn set_additional_data(&mut self, data: Box<dyn Any + Send>) {
        self.additional = Some(data);
    }

    pub fn additional_data<T: Any>(&mut self) -> Option<&mut T> {
        self.additional.as_mut().and_then(|d| d.downcast_mut::<T>())
    }

    // ── Execution ───────────────────────────────────────────────────

    fn current_op(&self) -> Result<Option<Op>, ExecError> {
        let frame = self.frame()?;
        match self.program.function(frame.function) {
            Some(FunctionTableEntry::Local(f)) => Ok(f.ops.get(frame.ip).copied()),
            _ => Err(ExecError::InvalidFunctionEntry { id: frame.function }),
        }
    }

    /// Execute one instruction of the current frame. Running off the end of
    /// a body pops the frame.
    pub fn step(&mut self, ctx: &CallContext) -> Result<(), ExecError> {
        let Some(op) = self.current_op()? else {
            return self.pop_frame();
        };
        let depth = self.frames.len();
        debug!(handle = ctx.handle().0, depth, %op, "step");

        dispatch::execute(op, self, ctx)?;

        match self.transfer.take() {
            Some(Transfer::Exit) => self.pop_frame()?,
            Some(Transfer::Jump(ip)) => {
                if let Some(frame) = self.frames.get_mut(depth - 1) {
                    frame.ip = ip;
                }
            }
            None => {
                if let Some(frame) = self.frames.get_mut(depth - 1) {
                    frame.ip += 1;
                }
            }
        }
        Ok(())
    }

    /// Run up to `budget` instructions while the process stays running.
    /// Returns the number executed.
    pub(crate) fn run_slice(&mut self, ctx: &CallContext, budget: usize) -> Result<usize, ExecError> {
        let mut executed = 0;
        while executed < budget && self.status == ProcessStatus::Running {
            self.step(ctx)?;
            executed += 1;
        }
        Ok(executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{LocalFunction, Mnemonic};
    use crate::compiler::compile_source;
    use crate::vm::{CallContext, ProcessHandle};

    fn process(source: &str) -> ProcessState {
        let program = Arc::new(compile_source(source).unwrap());
        ProcessState::new(program, 256)
    }

    fn start(p: &mut ProcessState, entry: &str) -> Completion {
        let (tx, completion) = Completion::channel();
        p.reset(tx);
        let id = p.program().function_id(entry).unwrap();
        p.enter_function(id, vec![]).unwrap();
        p.set_status(ProcessStatus::Running);
        completion
    }

    fn run_to_end(p: &mut ProcessState) -> Result<(), ExecError> {
        let ctx = CallContext::detached(ProcessHandle(0));
        while p.status() == ProcessStatus::Running {
            p.step(&ctx)?;
        }
        Ok(())
    }

    #[test]
    fn return_value_reaches_caller_then_host() {
        let mut p = process("fn main() { return add(2, 3); } fn add(a, b) { return a + b; }");
        let done = start(&mut p, "main");
        run_to_end(&mut p).unwrap();
        assert!(matches!(done.try_wait(), Some(ProcessExit::Completed)));
        assert_eq!(p.take_return_value(), Some(Variable::Int(5)));
        assert_eq!(p.take_return_value(), None);
        assert!(p.frames().is_empty());
    }

    #[test]
    fn falling_off_the_end_returns_unit() {
        let mut p = process("fn main() { x = 1; }");
        start(&mut p, "main");
        run_to_end(&mut p).unwrap();
        assert_eq!(p.take_return_value(), Some(Variable::Unit));
    }

    #[test]
    fn arguments_land_in_slots_from_one() {
        let mut p = process("fn f(a, b) { return a; }");
        let id = p.program().function_id("f").unwrap();
        p.enter_function(id, vec![Variable::Int(1), Variable::Str("b".into())]).unwrap();
        assert!(matches!(p.get_local(0), Err(ExecError::NoSuchLocal { slot: 0 })));
        assert_eq!(p.get_local(1).unwrap(), Variable::Int(1));
        assert_eq!(p.get_local(2).unwrap(), Variable::Str("b".into()));
    }

    #[test]
    fn extra_arguments_grow_the_frame() {
        let mut p = process("fn f() { }");
        p.enter_function(0, vec![Variable::Int(1), Variable::Int(2), Variable::Int(3)]).unwrap();
        assert_eq!(p.get_local(3).unwrap(), Variable::Int(3));
        p.set_local(10, Variable::Unit).unwrap();
        assert_eq!(p.get_local(10).unwrap(), Variable::Unit);
    }

    #[test]
    fn stack_depth_is_bounded() {
        let mut p = process("fn f() { return f(); }");
        start(&mut p, "f");
        let err = run_to_end(&mut p).unwrap_err();
        assert!(matches!(err, ExecError::StackOverflow { depth: 256 }));
        assert_eq!(p.frames().len(), 256);
    }

    #[test]
    fn stack_underflow_and_missing_frame() {
        let mut p = process("fn f() { }");
        assert!(matches!(p.pop(), Err(ExecError::NoActiveFrame)));
        assert!(matches!(p.push(Variable::Unit), Err(ExecError::NoActiveFrame)));
        p.enter_function(0, vec![]).unwrap();
        assert!(matches!(p.pop(), Err(ExecError::StackUnderflow)));
        p.push(Variable::Int(1)).unwrap();
        p.push(Variable::Int(2)).unwrap();
        assert_eq!(p.pop_n(2).unwrap(), vec![Variable::Int(1), Variable::Int(2)]);
    }

    #[test]
    fn bad_function_ids() {
        let mut p = process("fn f() { }");
        assert!(matches!(p.enter_function(9, vec![]), Err(ExecError::BadFunctionId { id: 9 })));

        let mut program = CompiledProgram::new();
        program.functions.push(FunctionTableEntry::Invalid);
        program.functions.push(FunctionTableEntry::Imported {
            source_file: "lib.tern".into(),
            name: "g".into(),
        });
        let mut p = ProcessState::new(Arc::new(program), 256);
        assert!(matches!(p.enter_function(0, vec![]), Err(ExecError::InvalidFunctionEntry { id: 0 })));
        assert!(matches!(p.enter_function(1, vec![]), Err(ExecError::ImportedUnsupported { .. })));
    }

    #[test]
    fn pause_and_wake() {
        let mut p = process("fn f() { }");
        p.pause();
        assert_eq!(p.status(), ProcessStatus::Inactive);
        start(&mut p, "f");
        p.pause();
        assert_eq!(p.status(), ProcessStatus::Sleeping);
        assert!(p.wake());
        assert!(!p.wake());
        assert_eq!(p.status(), ProcessStatus::Running);
    }

    #[test]
    fn additional_data_downcasts() {
        let mut p = process("fn f() { }");
        assert!(p.additional_data::<u32>().is_none());
        p.set_additional_data(Box::new(41u32));
        *p.additional_data::<u32>().unwrap() += 1;
        assert_eq!(p.additional_data::<u32>().copied(), Some(42));
        assert!(p.additional_data::<String>().is_none());
    }

    #[test]
    fn slice_budget_is_respected() {
        let mut p = process("fn f() { a = 1; b = 2; c = 3; }");
        start(&mut p, "f");
        let ctx = CallContext::detached(ProcessHandle(0));
        assert_eq!(p.run_slice(&ctx, 2).unwrap(), 2);
        assert_eq!(p.frames()[0].ip(), 2);
        assert_eq!(p.frames()[0].stack(), &[] as &[Variable]);
    }

    #[test]
    fn local_slots_are_bounded() {
        let mut program = CompiledProgram::new();
        program.functions.push(FunctionTableEntry::Local(LocalFunction::new(vec![
            Op::bare(Mnemonic::PushUnit),
            Op::new(Mnemonic::SetL, 0xFFFF_FFFF),
        ])));
        let mut p = ProcessState::new(Arc::new(program), 256);
        assert!(matches!(
            p.enter_function(0, vec![]),
            Err(ExecError::LocalOutOfRange { slot: 0xFFFF_FFFF, max: MAX_LOCALS })
        ));
        assert!(p.frames().is_empty());

        let mut p = process("fn f() { }");
        p.enter_function(0, vec![]).unwrap();
        assert!(matches!(
            p.set_local(MAX_LOCALS, Variable::Unit),
            Err(ExecError::LocalOutOfRange { .. })
        ));
        p.set_local(MAX_LOCALS - 1, Variable::Unit).unwrap();
    }
}
