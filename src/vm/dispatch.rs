//! Opcode handlers.
//!
//! `DISPATCH` is indexed by opcode byte. Every handler pops its operands off
//! the current frame, pushes its result, and may request a jump or frame
//! exit through the process state.

use crate::bytecode::{Mnemonic, Op};

use super::process::ProcessState;
use super::{CallContext, ExecError, Variable, VariableType, VmError};

pub type Handler = fn(Op, &mut ProcessState, &CallContext) -> Result<(), ExecError>;

pub struct OpSpec {
    pub mnemonic: Mnemonic,
    pub handler: Handler,
}

const fn spec(mnemonic: Mnemonic, handler: Handler) -> OpSpec {
    OpSpec { mnemonic, handler }
}

pub static DISPATCH: [OpSpec; 27] = [
    spec(Mnemonic::Nop, nop),
    spec(Mnemonic::PushI, push_i),
    spec(Mnemonic::PushF, push_f),
    spec(Mnemonic::PushS, push_s),
    spec(Mnemonic::PushB, push_b),
    spec(Mnemonic::Add, add),
    spec(Mnemonic::Sub, sub),
    spec(Mnemonic::Mul, mul),
    spec(Mnemonic::Div, div),
    spec(Mnemonic::Not, not),
    spec(Mnemonic::And, and),
    spec(Mnemonic::Or, or),
    spec(Mnemonic::Gt, gt),
    spec(Mnemonic::Lt, lt),
    spec(Mnemonic::Gte, gte),
    spec(Mnemonic::Lte, lte),
    spec(Mnemonic::Eq, eq),
    spec(Mnemonic::Je, je),
    spec(Mnemonic::Jne, jne),
    spec(Mnemonic::J, j),
    spec(Mnemonic::Ext, ext),
    spec(Mnemonic::Call, call),
    spec(Mnemonic::PushFnRef, push_fn_ref),
    spec(Mnemonic::GetL, get_l),
    spec(Mnemonic::SetL, set_l),
    spec(Mnemonic::Retn, retn),
    spec(Mnemonic::PushUnit, push_unit),
];

/// Check that every entry sits at the index of its own opcode.
pub fn verify_dispatch() -> Result<(), VmError> {
    verify_table(&DISPATCH)
}

fn verify_table(table: &[OpSpec]) -> Result<(), VmError> {
    let mismatches: Vec<String> = table
        .iter()
        .enumerate()
        .filter(|(i, s)| s.mnemonic.code() as usize != *i)
        .map(|(i, s)| format!("entry {} services {} (code {})", i, s.mnemonic, s.mnemonic.code()))
        .collect();
    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(VmError::DispatchMismatch { details: mismatches.join("; ") })
    }
}

pub fn execute(op: Op, state: &mut ProcessState, ctx: &CallContext) -> Result<(), ExecError> {
    let spec = DISPATCH
        .get(op.mnemonic.code() as usize)
        .ok_or(ExecError::InvalidOpcode { code: op.mnemonic.code() })?;
    (spec.handler)(op, state, ctx)
}

// ── Helpers ──────────────────────────────────────────────────────────

fn binary(
    state: &mut ProcessState,
    f: impl FnOnce(&Variable, &Variable) -> Result<Variable, ExecError>,
) -> Result<(), ExecError> {
    let right = state.pop()?;
    let left = state.pop()?;
    let result = f(&left, &right)?;
    state.push(result)
}

fn pop_bool(state: &mut ProcessState, op: &'static str) -> Result<bool, ExecError> {
    match state.pop()? {
        Variable::Boolean(b) => Ok(b),
        other => Err(ExecError::UnexpectedType {
            op,
            expected: VariableType::Boolean,
            found: other.ty(),
        }),
    }
}

// ── Literals ─────────────────────────────────────────────────────────

fn nop(_: Op, _: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    Ok(())
}

fn push_i(op: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    state.push(Variable::Int(op.data_i32()))
}

fn push_f(op: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    state.push(Variable::Float(op.data_f32()))
}

fn push_s(op: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    let s = state.string(op.data_index())?.to_string();
    state.push(Variable::Str(s))
}

fn push_b(op: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    state.push(Variable::Boolean(op.data() != 0))
}

fn push_fn_ref(op: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    state.push(Variable::FunctionRef(op.data_index()))
}

fn push_unit(_: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    state.push(Variable::Unit)
}

// ── Arithmetic & logic ───────────────────────────────────────────────

fn add(_: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    binary(state, Variable::add)
}

fn sub(_: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    binary(state, Variable::sub)
}

fn mul(_: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    binary(state, Variable::mul)
}

fn div(_: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    binary(state, Variable::div)
}

fn not(_: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    let v = state.pop()?.not()?;
    state.push(v)
}

fn and(_: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    binary(state, Variable::and)
}

fn or(_: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    binary(state, Variable::or)
}

fn gt(_: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    binary(state, Variable::gt)
}

fn lt(_: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    binary(state, Variable::lt)
}

fn gte(_: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    binary(state, Variable::gte)
}

fn lte(_: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    binary(state, Variable::lte)
}

fn eq(_: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    binary(state, |l, r| Ok(l.equals(r)))
}

// ── Control flow ─────────────────────────────────────────────────────

fn je(op: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    if pop_bool(state, "JE")? {
        state.set_next_ip(op.data_index());
    }
    Ok(())
}

fn jne(op: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    if !pop_bool(state, "JNE")? {
        state.set_next_ip(op.data_index());
    }
    Ok(())
}

fn j(op: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    state.set_next_ip(op.data_index());
    Ok(())
}

/// Stack: `arg1 .. argN name`.
fn ext(op: Op, state: &mut ProcessState, ctx: &CallContext) -> Result<(), ExecError> {
    let name = match state.pop()? {
        Variable::Str(name) => name,
        other => {
            return Err(ExecError::UnexpectedType {
                op: "EXT",
                expected: VariableType::Str,
                found: other.ty(),
            });
        }
    };
    let args = state.pop_n(op.data_index())?;
    ctx.call_external(&name, state, args)
}

/// Stack: `arg1 .. argN fnref`.
fn call(op: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    let id = match state.pop()? {
        Variable::FunctionRef(id) => id,
        other => {
            return Err(ExecError::UnexpectedType {
                op: "CALL",
                expected: VariableType::FunctionRef,
                found: other.ty(),
            });
        }
    };
    let args = state.pop_n(op.data_index())?;
    state.enter_function(id, args)
}

fn retn(_: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    let value = state.pop()?;
    state.set_return_value(value);
    state.exit_function();
    Ok(())
}

// ── Locals ───────────────────────────────────────────────────────────

fn get_l(op: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    let v = state.get_local(op.data_index())?;
    state.push(v)
}

fn set_l(op: Op, state: &mut ProcessState, _: &CallContext) -> Result<(), ExecError> {
    let v = state.pop()?;
    state.set_local(op.data_index(), v)
}
