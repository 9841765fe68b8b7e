use crate::ast::*;
use crate::lexer::Token;

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Parse error at token {position}: {message}")]
pub struct ParseError {
    pub code: &'static str,
    pub position: usize,
    pub span: Span,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

const MAX_ERRORS: usize = 20;

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| *s)
            .or_else(|| self.tokens.last().map(|(_, s)| Span { start: s.end, end: s.end }))
            .unwrap_or(Span::UNKNOWN)
    }

    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|(_, s)| *s)
            .unwrap_or(Span::UNKNOWN)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    /// Consume the next token if it equals `tok`.
    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span> {
        match self.peek() {
            Some(tok) if tok == expected => {
                let span = self.peek_span();
                self.advance();
                Ok(span)
            }
            Some(tok) => Err(self.error("TRN-P003", format!("expected {:?}, got {:?}", expected, tok))),
            None => Err(self.error("TRN-P004", format!("expected {:?}, got EOF", expected))),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(name)
            }
            Some(tok) => Err(self.error("TRN-P005", format!("expected identifier, got {:?}", tok))),
            None => Err(self.error("TRN-P006", "expected identifier, got EOF".into())),
        }
    }

    fn error(&self, code: &'static str, message: String) -> ParseError {
        ParseError {
            code,
            position: self.pos,
            span: self.peek_span(),
            message,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // ---- Top-level parsing ----

    pub fn parse_program(&mut self) -> (Program, Vec<ParseError>) {
        let mut functions = Vec::new();
        let mut errors: Vec<ParseError> = Vec::new();

        while !self.at_end() {
            if errors.len() >= MAX_ERRORS {
                break;
            }
            let start = self.pos;
            match self.parse_function() {
                Ok(f) => functions.push(f),
                Err(e) => {
                    errors.push(e);
                    self.sync_to_fn(start);
                }
            }
        }

        (Program { functions, source: None }, errors)
    }

    /// Skip to the next `fn` keyword (or EOF). Consumes at least one token when
    /// the failed attempt made no progress.
    fn sync_to_fn(&mut self, start: usize) {
        if self.pos == start {
            self.advance();
        }
        while let Some(tok) = self.peek() {
            if *tok == Token::Fn {
                break;
            }
            self.advance();
        }
    }

    /// `fn name(a, b) { body }`
    fn parse_function(&mut self) -> Result<Function> {
        let start = self.peek_span();
        match self.peek() {
            Some(Token::Fn) => {
                self.advance();
            }
            Some(tok) => {
                return Err(self.error("TRN-P001", format!("expected `fn`, got {:?}", tok)));
            }
            None => return Err(self.error("TRN-P002", "expected `fn`, got EOF".into())),
        }
        let name = self.expect_ident()?;
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                let param = self.expect_ident()?;
                if params.contains(&param) {
                    return Err(ParseError {
                        code: "TRN-P007",
                        position: self.pos - 1,
                        span: self.prev_span(),
                        message: format!("duplicate parameter `{}` in `{}`", param, name),
                    });
                }
                params.push(param);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(&Token::Comma)?;
            }
        }
        let body = self.parse_block()?;
        let span = start.merge(self.prev_span());
        Ok(Function { name, params, body, span })
    }

    /// `{ statement* }`
    fn parse_block(&mut self) -> Result<Block> {
        self.expect(&Token::LBrace)?;
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Some(Token::RBrace) => {
                    self.advance();
                    return Ok(body);
                }
                None => return Err(self.error("TRN-P008", "unclosed block, got EOF".into())),
                _ => body.push(self.parse_stmt()?),
            }
        }
    }

    // ---- Statements ----

    fn parse_stmt(&mut self) -> Result<Stmt> {
        match self.peek() {
            Some(Token::If) => self.parse_if(),
            Some(Token::While) => {
                self.advance();
                let condition = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Stmt::While { condition, body })
            }
            Some(Token::Return) => {
                self.advance();
                let value = if self.peek() == Some(&Token::Semi) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(&Token::Semi)?;
                Ok(Stmt::Return(value))
            }
            Some(Token::Ident(_)) if self.peek_at(1) == Some(&Token::Assign) => {
                let name = self.expect_ident()?;
                self.advance();
                let value = self.parse_expr()?;
                self.expect(&Token::Semi)?;
                Ok(Stmt::Assign { name, value })
            }
            Some(Token::Ident(_)) | Some(Token::Dollar) => {
                let call = self.parse_call()?;
                self.expect(&Token::Semi)?;
                Ok(Stmt::Call(call))
            }
            Some(tok) => {
                let hint = if matches!(tok, Token::Elsif | Token::Else) {
                    "\n  hint: `elsif`/`else` must follow the closing brace of an `if` block"
                } else {
                    ""
                };
                Err(self.error("TRN-P009", format!("expected statement, got {:?}{}", tok, hint)))
            }
            None => Err(self.error("TRN-P010", "expected statement, got EOF".into())),
        }
    }

    /// `if c {..} (elsif c {..})* [else {..}]`. A missing `else` becomes an empty one.
    fn parse_if(&mut self) -> Result<Stmt> {
        self.expect(&Token::If)?;
        let mut branches = Vec::new();
        let guard = self.parse_expr()?;
        let body = self.parse_block()?;
        branches.push(Branch { guard: Guard::When(guard), body });

        while self.eat(&Token::Elsif) {
            let guard = self.parse_expr()?;
            let body = self.parse_block()?;
            branches.push(Branch { guard: Guard::When(guard), body });
        }

        let else_body = if self.eat(&Token::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        branches.push(Branch { guard: Guard::Else, body: else_body });

        Ok(Stmt::If { branches })
    }

    /// `name(args)` or `$name(args)`
    fn parse_call(&mut self) -> Result<Call> {
        let kind = if self.eat(&Token::Dollar) {
            CallKind::External
        } else {
            CallKind::Internal
        };
        let name = self.expect_ident()?;
        let args = self.parse_args()?;
        Ok(Call { kind, name, args })
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(&Token::Comma)?;
        }
    }

    // ---- Expressions ----
    //
    // Precedence, loosest first: || && (== !=) (< > <= >=) (+ -) (* /) unary postfix

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.parse_and()?;
            left = Self::binary(BinOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.parse_equality()?;
            left = Self::binary(BinOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Equals,
                Some(Token::NotEq) => BinOp::NotEquals,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = Self::binary(op, left, right);
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Less) => BinOp::LessThan,
                Some(Token::Greater) => BinOp::GreaterThan,
                Some(Token::LessEq) => BinOp::LessOrEqual,
                Some(Token::GreaterEq) => BinOp::GreaterOrEqual,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Self::binary(op, left, right);
        }
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Subtract,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Self::binary(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Multiply,
                Some(Token::Slash) => BinOp::Divide,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Self::binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Bang) => {
                self.advance();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.advance();
                // Fold `-<literal>` so negative constants are a single push.
                match self.peek().cloned() {
                    Some(Token::Int(n)) => {
                        self.advance();
                        Ok(Expr::Literal(Literal::Int(0i32.wrapping_sub_unsigned(n))))
                    }
                    Some(Token::Float(f)) => {
                        self.advance();
                        Ok(Expr::Literal(Literal::Float(-f)))
                    }
                    _ => Ok(Expr::Negate(Box::new(self.parse_unary()?))),
                }
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_atom()?;
        while self.eat(&Token::Dot) {
            let field = self.expect_ident()?;
            expr = Expr::Access { object: Box::new(expr), field };
        }
        Ok(expr)
    }

    /// Parse an atom: the smallest expression unit
    fn parse_atom(&mut self) -> Result<Expr> {
        match self.peek().cloned() {
            Some(Token::Int(n)) => match i32::try_from(n) {
                Ok(n) => {
                    self.advance();
                    Ok(Expr::Literal(Literal::Int(n)))
                }
                Err(_) => Err(self.error(
                    "TRN-P013",
                    format!("integer literal {} does not fit in 32 bits unless negated", n),
                )),
            },
            Some(Token::Float(f)) => {
                self.advance();
                Ok(Expr::Literal(Literal::Float(f)))
            }
            Some(Token::Text(s)) => {
                self.advance();
                Ok(Expr::Literal(Literal::Text(s)))
            }
            Some(Token::True) => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(true)))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(false)))
            }
            Some(Token::At) => {
                self.advance();
                Ok(Expr::FunctionRef(self.expect_ident()?))
            }
            Some(Token::LParen) => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Dollar) => Ok(Expr::Call(self.parse_call()?)),
            Some(Token::Ident(name)) => {
                if self.peek_at(1) == Some(&Token::LParen) {
                    Ok(Expr::Call(self.parse_call()?))
                } else {
                    self.advance();
                    Ok(Expr::Ident(name))
                }
            }
            Some(tok) => Err(self.error("TRN-P011", format!("expected expression, got {:?}", tok))),
            None => Err(self.error("TRN-P012", "expected expression, got EOF".into())),
        }
    }
}

/// Parse from token+span pairs.
/// Returns `(program, errors)`. Functions that failed to parse are left out of
/// the program; check `errors.is_empty()` before generating code.
pub fn parse(tokens: Vec<(Token, Span)>) -> (Program, Vec<ParseError>) {
    let mut parser = Parser::new(tokens);
    parser.parse_program()
}
