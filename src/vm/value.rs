use std::fmt;

use super::ExecError;

/// A runtime value. Every operation produces a fresh value; nothing is
/// shared between frames.
#[derive(Debug, Clone, PartialEq)]
pub enum Variable {
    Int(i32),
    Float(f32),
    Boolean(bool),
    Str(String),
    /// Index into the program's function table.
    FunctionRef(usize),
    Unit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableType {
    Int,
    Float,
    Boolean,
    Str,
    FunctionRef,
    Unit,
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VariableType::Int => "INT",
            VariableType::Float => "FLOAT",
            VariableType::Boolean => "BOOLEAN",
            VariableType::Str => "STRING",
            VariableType::FunctionRef => "FUNCTIONREF",
            VariableType::Unit => "UNIT",
        })
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variable::Int(n) => write!(f, "{}", n),
            Variable::Float(x) => fmt_float(*x, f),
            Variable::Boolean(b) => write!(f, "{}", b),
            Variable::Str(s) => write!(f, "{}", s),
            Variable::FunctionRef(id) => write!(f, "FunctionRef({})", id),
            Variable::Unit => write!(f, "unit"),
        }
    }
}

/// Plain decimal for magnitudes in `[1e-3, 1e7)` and zero, scientific with
/// an upper-case `E` otherwise. The mantissa always carries a fraction
/// digit: `2.5`, `7.0`, `1.0E20`, `1.5E-5`, `NaN`, `-Infinity`.
fn fmt_float(x: f32, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if x.is_nan() {
        return f.write_str("NaN");
    }
    if x.is_infinite() {
        return f.write_str(if x < 0.0 { "-Infinity" } else { "Infinity" });
    }
    let abs = x.abs();
    if abs == 0.0 || (1e-3..1e7).contains(&abs) {
        let plain = x.to_string();
        return if plain.contains('.') { f.write_str(&plain) } else { write!(f, "{}.0", plain) };
    }
    let sci = format!("{:e}", x);
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    if mantissa.contains('.') {
        write!(f, "{}E{}", mantissa, exponent)
    } else {
        write!(f, "{}.0E{}", mantissa, exponent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

impl Arith {
    fn name(self) -> &'static str {
        match self {
            Arith::Add => "ADD",
            Arith::Sub => "SUB",
            Arith::Mul => "MUL",
            Arith::Div => "DIV",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Gt,
    Lt,
    Gte,
    Lte,
}

impl Cmp {
    fn name(self) -> &'static str {
        match self {
            Cmp::Gt => "GT",
            Cmp::Lt => "LT",
            Cmp::Gte => "GTE",
            Cmp::Lte => "LTE",
        }
    }

    fn holds<T: PartialOrd>(self, a: T, b: T) -> bool {
        match self {
            Cmp::Gt => a > b,
            Cmp::Lt => a < b,
            Cmp::Gte => a >= b,
            Cmp::Lte => a <= b,
        }
    }
}

/// Round half up, as used when a FLOAT meets an INT on the left.
fn round_to_int(x: f32) -> Result<i32, ExecError> {
    if x.is_nan() {
        return Err(ExecError::NotANumber);
    }
    Ok((x + 0.5).floor() as i32)
}

impl Variable {
    pub fn ty(&self) -> VariableType {
        match self {
            Variable::Int(_) => VariableType::Int,
            Variable::Float(_) => VariableType::Float,
            Variable::Boolean(_) => VariableType::Boolean,
            Variable::Str(_) => VariableType::Str,
            Variable::FunctionRef(_) => VariableType::FunctionRef,
            Variable::Unit => VariableType::Unit,
        }
    }

    pub fn add(&self, rhs: &Variable) -> Result<Variable, ExecError> {
        if let Variable::Str(s) = self {
            return Ok(Variable::Str(format!("{}{}", s, rhs)));
        }
        self.arith(Arith::Add, rhs)
    }

    pub fn sub(&self, rhs: &Variable) -> Result<Variable, ExecError> {
        self.arith(Arith::Sub, rhs)
    }

    pub fn mul(&self, rhs: &Variable) -> Result<Variable, ExecError> {
        self.arith(Arith::Mul, rhs)
    }

    pub fn div(&self, rhs: &Variable) -> Result<Variable, ExecError> {
        self.arith(Arith::Div, rhs)
    }

    fn arith(&self, op: Arith, rhs: &Variable) -> Result<Variable, ExecError> {
        match (self, rhs) {
            (Variable::Int(a), Variable::Int(b)) => int_arith(op, *a, *b),
            (Variable::Int(a), Variable::Float(b)) => int_arith(op, *a, round_to_int(*b)?),
            (Variable::Float(a), Variable::Float(b)) => Ok(Variable::Float(float_arith(op, *a, *b))),
            (Variable::Float(a), Variable::Int(b)) => {
                Ok(Variable::Float(float_arith(op, *a, *b as f32)))
            }
            _ => Err(self.type_error(op.name(), rhs)),
        }
    }

    pub fn gt(&self, rhs: &Variable) -> Result<Variable, ExecError> {
        self.compare(Cmp::Gt, rhs)
    }

    pub fn lt(&self, rhs: &Variable) -> Result<Variable, ExecError> {
        self.compare(Cmp::Lt, rhs)
    }

    pub fn gte(&self, rhs: &Variable) -> Result<Variable, ExecError> {
        self.compare(Cmp::Gte, rhs)
    }

    pub fn lte(&self, rhs: &Variable) -> Result<Variable, ExecError> {
        self.compare(Cmp::Lte, rhs)
    }

    fn compare(&self, op: Cmp, rhs: &Variable) -> Result<Variable, ExecError> {
        let result = match (self, rhs) {
            (Variable::Int(a), Variable::Int(b)) => op.holds(*a, *b),
            (Variable::Int(a), Variable::Float(b)) => op.holds(*a, round_to_int(*b)?),
            (Variable::Float(a), Variable::Float(b)) => op.holds(*a, *b),
            (Variable::Float(a), Variable::Int(b)) => op.holds(*a, *b as f32),
            _ => return Err(self.type_error(op.name(), rhs)),
        };
        Ok(Variable::Boolean(result))
    }

    /// Total: values of different types are never equal.
    pub fn equals(&self, rhs: &Variable) -> Variable {
        Variable::Boolean(self == rhs)
    }

    pub fn and(&self, rhs: &Variable) -> Result<Variable, ExecError> {
        match (self, rhs) {
            (Variable::Boolean(a), Variable::Boolean(b)) => Ok(Variable::Boolean(*a && *b)),
            _ => Err(self.type_error("AND", rhs)),
        }
    }

    pub fn or(&self, rhs: &Variable) -> Result<Variable, ExecError> {
        match (self, rhs) {
            (Variable::Boolean(a), Variable::Boolean(b)) => Ok(Variable::Boolean(*a || *b)),
            _ => Err(self.type_error("OR", rhs)),
        }
    }

    pub fn not(&self) -> Result<Variable, ExecError> {
        match self {
            Variable::Boolean(b) => Ok(Variable::Boolean(!b)),
            other => Err(ExecError::UnaryTypeError { op: "NOT", operand: other.ty() }),
        }
    }

    fn type_error(&self, op: &'static str, rhs: &Variable) -> ExecError {
        ExecError::TypeError { op, left: self.ty(), right: rhs.ty() }
    }
}

fn int_arith(op: Arith, a: i32, b: i32) -> Result<Variable, ExecError> {
    let n = match op {
        Arith::Add => a.wrapping_add(b),
        Arith::Sub => a.wrapping_sub(b),
        Arith::Mul => a.wrapping_mul(b),
        Arith::Div => {
            if b == 0 {
                return Err(ExecError::DivisionByZero);
            }
            a.wrapping_div(b)
        }
    };
    Ok(Variable::Int(n))
}

fn float_arith(op: Arith, a: f32, b: f32) -> f32 {
    match op {
        Arith::Add => a + b,
        Arith::Sub => a - b,
        Arith::Mul => a * b,
        Arith::Div => a / b,
    }
}
