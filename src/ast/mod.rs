use serde::Serialize;

pub mod source_map;
pub use source_map::SourceMap;

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl From<std::ops::Range<usize>> for Span {
    fn from(r: std::ops::Range<usize>) -> Self {
        Span { start: r.start, end: r.end }
    }
}

// ---- Core AST types ----

/// `fn name(a, b) { ... }`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: Block,
    #[serde(skip)]
    pub span: Span,
}

pub type Block = Vec<Stmt>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Stmt {
    /// `name = expr;`
    Assign { name: String, value: Expr },

    /// `while cond { body }`
    While { condition: Expr, body: Block },

    /// `if a {..} elsif b {..} else {..}`. The last branch is always `Guard::Else`.
    If { branches: Vec<Branch> },

    /// Call whose result is discarded.
    Call(Call),

    /// `return;` or `return expr;`
    Return(Option<Expr>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Branch {
    pub guard: Guard,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Guard {
    When(Expr),
    /// Sentinel for the final branch. Never evaluated.
    Else,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallKind {
    /// `name(args)`: a function in this program, or a local holding a function reference.
    Internal,
    /// `$name(args)`: a host-bound function, looked up by name at run time.
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Call {
    pub kind: CallKind,
    pub name: String,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    Literal(Literal),

    /// Variable reference
    Ident(String),

    /// `@name`: reference to a declared function
    FunctionRef(String),

    Call(Call),

    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// `!expr`
    Not(Box<Expr>),

    /// `-expr`
    Negate(Box<Expr>),

    /// `obj.field`
    Access { object: Box<Expr>, field: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Literal {
    Int(i32),
    Float(f32),
    Bool(bool),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    And,
    Or,
}

impl BinOp {
    pub fn is_arithmetic(self) -> bool {
        matches!(self, BinOp::Add | BinOp::Subtract | BinOp::Multiply | BinOp::Divide)
    }
}

/// A complete program is a list of function declarations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Program {
    pub functions: Vec<Function>,
    #[serde(skip)]
    pub source: Option<String>,
}
