use std::collections::HashMap;

use tracing::debug;

use crate::ast::*;
use crate::bytecode::{FunctionTableEntry, LocalFunction, Mnemonic, Op, ProgramScaffolding};

use super::optimize::Optimizer;
use super::scope::ScopeChain;
use super::CompileError;

type Result<T> = std::result::Result<T, CompileError>;

/// Slot 0 of every frame is never bound to a name; parameters start at 1.
pub const RESERVED_SLOTS: u32 = 1;

/// The function whose body is currently being emitted.
struct FunctionContext {
    name: String,
    id: usize,
    ops: Vec<Op>,
    scopes: ScopeChain,
}

/// Walks the tree and emits per-function instruction lists.
///
/// Strings and function names are interned into dense ids as they are met.
/// Function ids are reserved up front so bodies can call functions declared
/// later in the file.
#[derive(Default)]
pub struct CodeGen {
    strings: HashMap<String, usize>,
    functions: HashMap<String, usize>,
    bodies: HashMap<usize, Vec<Op>>,
    current: Option<FunctionContext>,
}

impl CodeGen {
    pub fn new() -> Self {
        CodeGen::default()
    }

    // ── Interning ────────────────────────────────────────────────────

    pub fn new_string(&mut self, s: &str) -> usize {
        if let Some(&id) = self.strings.get(s) {
            return id;
        }
        let id = self.strings.len();
        self.strings.insert(s.to_string(), id);
        id
    }

    /// Reserve an id for `name`. Registering the same name again returns the same id.
    pub fn create_function_identifier(&mut self, name: &str) -> usize {
        if let Some(&id) = self.functions.get(name) {
            return id;
        }
        let id = self.functions.len();
        self.functions.insert(name.to_string(), id);
        id
    }

    pub fn find_function_identifier(&self, name: &str) -> Option<usize> {
        self.functions.get(name).copied()
    }

    // ── Function context ─────────────────────────────────────────────

    /// Open `name` for emission with `params` bound to slots 1..=n.
    pub fn implement_function(&mut self, name: &str, params: &[String]) -> Result<()> {
        if let Some(open) = &self.current {
            return Err(CompileError::NestedFunction {
                name: name.to_string(),
                open: open.name.clone(),
            });
        }
        let id = self
            .find_function_identifier(name)
            .ok_or_else(|| CompileError::UnregisteredFunction { name: name.to_string() })?;
        let mut scopes = ScopeChain::new(RESERVED_SLOTS);
        for param in params {
            scopes.declare(param);
        }
        self.current = Some(FunctionContext { name: name.to_string(), id, ops: Vec::new(), scopes });
        Ok(())
    }

    /// Close the open function. A body that can run off its end gets a
    /// trailing `PUSHUNIT; RETN`.
    pub fn exit_function(&mut self) -> Result<()> {
        let Some(mut ctx) = self.current.take() else {
            return Err(CompileError::NoFunctionContext);
        };
        if !ends_with_return(&ctx.ops) {
            ctx.ops.push(Op::bare(Mnemonic::PushUnit));
            ctx.ops.push(Op::bare(Mnemonic::Retn));
        }
        debug!(
            function = %ctx.name,
            id = ctx.id,
            ops = ctx.ops.len(),
            slots = ctx.scopes.slot_count(),
            "generated function"
        );
        self.bodies.insert(ctx.id, ctx.ops);
        Ok(())
    }

    fn context(&mut self) -> Result<&mut FunctionContext> {
        self.current.as_mut().ok_or(CompileError::NoFunctionContext)
    }

    fn function_name(&self) -> String {
        self.current.as_ref().map(|c| c.name.clone()).unwrap_or_default()
    }

    pub fn new_scope(&mut self) -> Result<()> {
        self.context()?.scopes.push();
        Ok(())
    }

    pub fn exit_scope(&mut self) -> Result<()> {
        self.context()?.scopes.pop();
        Ok(())
    }

    // ── Emission ─────────────────────────────────────────────────────

    /// Index the next emitted instruction will occupy.
    pub fn next_ip(&mut self) -> Result<usize> {
        Ok(self.context()?.ops.len())
    }

    /// Append `op` to the open function; returns its index for later patching.
    pub fn emit(&mut self, op: Op) -> Result<usize> {
        let ctx = self.context()?;
        ctx.ops.push(op);
        Ok(ctx.ops.len() - 1)
    }

    /// Point the jump at `at` to `target`.
    pub fn patch(&mut self, at: usize, target: usize) -> Result<()> {
        let ctx = self.context()?;
        if let Some(op) = ctx.ops.get_mut(at) {
            op.set_data(target as i64);
        }
        Ok(())
    }

    // ---- Program ----

    /// Register every function name, then generate each body.
    pub fn generate_program(&mut self, program: &Program) -> Result<()> {
        let mut seen: HashMap<&str, Span> = HashMap::new();
        for f in &program.functions {
            if let Some(first) = seen.insert(f.name.as_str(), f.span) {
                return Err(CompileError::DuplicateFunction {
                    name: f.name.clone(),
                    span: f.span,
                    first,
                });
            }
            self.create_function_identifier(&f.name);
        }
        for f in &program.functions {
            self.generate_function(f)?;
        }
        Ok(())
    }

    pub fn generate_function(&mut self, f: &Function) -> Result<()> {
        self.implement_function(&f.name, &f.params)?;
        for stmt in &f.body {
            self.generate_stmt(stmt)?;
        }
        self.exit_function()
    }

    fn generate_block(&mut self, block: &Block) -> Result<()> {
        self.new_scope()?;
        for stmt in block {
            self.generate_stmt(stmt)?;
        }
        self.exit_scope()
    }

    // ---- Statements ----

    fn generate_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Assign { name, value } => {
                // The target slot exists before the value is generated, so
                // `x = x + 1` in a nested scope reads the new, unset `x`.
                let slot = self.context()?.scopes.declare(name);
                self.generate_expr(value)?;
                self.emit(Op::new(Mnemonic::SetL, slot as i64))?;
            }

            Stmt::While { condition, body } => {
                let cond_ip = self.next_ip()?;
                self.generate_condition(condition)?;
                let exit_jump = self.emit(Op::bare(Mnemonic::Jne))?;
                self.generate_block(body)?;
                let back_jump = self.emit(Op::new(Mnemonic::J, cond_ip as i64))?;
                self.patch(exit_jump, back_jump + 1)?;
            }

            Stmt::If { branches } => self.generate_if(branches)?,

            // No POP opcode exists: a call statement leaves its result on the
            // operand stack, where it is discarded with the frame.
            Stmt::Call(call) => self.generate_call(call)?,

            Stmt::Return(value) => {
                match value {
                    Some(expr) => self.generate_expr(expr)?,
                    None => {
                        self.emit(Op::bare(Mnemonic::PushUnit))?;
                    }
                }
                self.emit(Op::bare(Mnemonic::Retn))?;
            }
        }
        Ok(())
    }

    fn generate_if(&mut self, branches: &[Branch]) -> Result<()> {
        let Some((last, guarded)) = branches.split_last() else {
            return Err(self.malformed("conditional has no branches"));
        };
        if last.guard != Guard::Else {
            return Err(self.malformed("conditional does not end in an else branch"));
        }

        let mut to_end = Vec::with_capacity(guarded.len());
        for branch in guarded {
            self.generate_guard(&branch.guard)?;
            let skip = self.emit(Op::bare(Mnemonic::Jne))?;
            self.generate_block(&branch.body)?;
            to_end.push(self.emit(Op::bare(Mnemonic::J))?);
            let next = self.next_ip()?;
            self.patch(skip, next)?;
        }

        self.generate_block(&last.body)?;

        let end = self.next_ip()?;
        for jump in to_end {
            self.patch(jump, end)?;
        }
        Ok(())
    }

    fn generate_guard(&mut self, guard: &Guard) -> Result<()> {
        match guard {
            Guard::When(expr) => self.generate_condition(expr),
            Guard::Else => Err(CompileError::ElseGuardEvaluated { function: self.function_name() }),
        }
    }

    /// Conditions must be able to produce a boolean. Anything that statically
    /// cannot is rejected here; the rest is checked by `JE`/`JNE` at run time.
    fn generate_condition(&mut self, expr: &Expr) -> Result<()> {
        let reason = match expr {
            Expr::Literal(Literal::Int(_)) | Expr::Literal(Literal::Float(_)) => {
                Some("a numeric literal is never a boolean")
            }
            Expr::Literal(Literal::Text(_)) => Some("a string literal is never a boolean"),
            Expr::FunctionRef(_) => Some("a function reference is never a boolean"),
            Expr::Binary { op, .. } if op.is_arithmetic() => {
                Some("an arithmetic expression is never a boolean")
            }
            Expr::Negate(_) => Some("a negation is never a boolean"),
            _ => None,
        };
        match reason {
            Some(reason) => Err(self.malformed(reason)),
            None => self.generate_expr(expr),
        }
    }

    fn malformed(&self, reason: &str) -> CompileError {
        CompileError::MalformedConditional {
            function: self.function_name(),
            reason: reason.to_string(),
        }
    }

    // ---- Expressions ----

    fn generate_expr(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Literal(lit) => {
                let op = match lit {
                    Literal::Int(n) => Op::new(Mnemonic::PushI, *n as i64),
                    Literal::Float(f) => Op::float(Mnemonic::PushF, *f),
                    Literal::Bool(b) => Op::new(Mnemonic::PushB, *b as i64),
                    Literal::Text(s) => Op::new(Mnemonic::PushS, self.new_string(s) as i64),
                };
                self.emit(op)?;
            }

            Expr::Ident(name) => {
                let slot = self.resolve_local(name)?;
                self.emit(Op::new(Mnemonic::GetL, slot as i64))?;
            }

            Expr::FunctionRef(name) => {
                let id = self.find_function_identifier(name).ok_or_else(|| {
                    CompileError::UnresolvedFunction {
                        name: name.clone(),
                        function: self.function_name(),
                    }
                })?;
                self.emit(Op::new(Mnemonic::PushFnRef, id as i64))?;
            }

            Expr::Call(call) => self.generate_call(call)?,

            Expr::Binary { op, left, right } => {
                self.generate_expr(left)?;
                self.generate_expr(right)?;
                let mnemonic = match op {
                    BinOp::Add => Mnemonic::Add,
                    BinOp::Subtract => Mnemonic::Sub,
                    BinOp::Multiply => Mnemonic::Mul,
                    BinOp::Divide => Mnemonic::Div,
                    BinOp::Equals | BinOp::NotEquals => Mnemonic::Eq,
                    BinOp::GreaterThan => Mnemonic::Gt,
                    BinOp::LessThan => Mnemonic::Lt,
                    BinOp::GreaterOrEqual => Mnemonic::Gte,
                    BinOp::LessOrEqual => Mnemonic::Lte,
                    BinOp::And => Mnemonic::And,
                    BinOp::Or => Mnemonic::Or,
                };
                self.emit(Op::bare(mnemonic))?;
                if *op == BinOp::NotEquals {
                    self.emit(Op::bare(Mnemonic::Not))?;
                }
            }

            Expr::Not(inner) => {
                self.generate_expr(inner)?;
                self.emit(Op::bare(Mnemonic::Not))?;
            }

            Expr::Negate(inner) => {
                self.generate_expr(inner)?;
                self.emit(Op::new(Mnemonic::PushI, -1))?;
                self.emit(Op::bare(Mnemonic::Mul))?;
            }

            Expr::Access { field, .. } => {
                return Err(CompileError::Unsupported {
                    function: self.function_name(),
                    what: format!("field access `.{}`", field),
                });
            }
        }
        Ok(())
    }

    fn resolve_local(&mut self, name: &str) -> Result<u32> {
        let function = self.function_name();
        self.context()?
            .scopes
            .resolve(name)
            .ok_or_else(|| CompileError::UnresolvedIdentifier { name: name.to_string(), function })
    }

    /// Arguments left to right, then the callee. Internal callees resolve to a
    /// declared function first and a local holding a function reference second.
    fn generate_call(&mut self, call: &Call) -> Result<()> {
        for arg in &call.args {
            self.generate_expr(arg)?;
        }
        let argc = call.args.len() as i64;
        match call.kind {
            CallKind::Internal => {
                if let Some(id) = self.find_function_identifier(&call.name) {
                    self.emit(Op::new(Mnemonic::PushFnRef, id as i64))?;
                } else {
                    let slot = self.resolve_local(&call.name)?;
                    self.emit(Op::new(Mnemonic::GetL, slot as i64))?;
                }
                self.emit(Op::new(Mnemonic::Call, argc))?;
            }
            CallKind::External => {
                let name = self.new_string(&call.name);
                self.emit(Op::new(Mnemonic::PushS, name as i64))?;
                self.emit(Op::new(Mnemonic::Ext, argc))?;
            }
        }
        Ok(())
    }

    // ── Output ───────────────────────────────────────────────────────

    /// Replace every generated body with the optimizer's output.
    pub fn optimize(&mut self, optimizer: &dyn Optimizer) {
        for ops in self.bodies.values_mut() {
            *ops = optimizer.optimize(std::mem::take(ops));
        }
    }

    /// Hand every interned string and function to `out`. A registered
    /// function that was never implemented becomes an invalid entry.
    pub fn scaffold(&self, out: &mut impl ProgramScaffolding) {
        for (s, &id) in &self.strings {
            out.set_string(id, s.clone());
        }
        for (name, &id) in &self.functions {
            let entry = match self.bodies.get(&id) {
                Some(ops) => FunctionTableEntry::Local(LocalFunction::new(ops.clone())),
                None => FunctionTableEntry::Invalid,
            };
            out.set_function(id, name.clone(), entry);
        }
    }
}

/// True when control can only leave through a `RETN`: the last instruction
/// is one and no jump lands past the end.
fn ends_with_return(ops: &[Op]) -> bool {
    let last_is_return = ops.last().is_some_and(|op| op.mnemonic == Mnemonic::Retn);
    let jumps_past_end = ops.iter().any(|op| {
        matches!(op.mnemonic, Mnemonic::J | Mnemonic::Je | Mnemonic::Jne)
            && op.data_index() >= ops.len()
    });
    last_is_return && !jumps_past_end
}
