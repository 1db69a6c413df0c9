use crate::runtime::code::BinaryOp;
use crate::runtime::compiler::lexer::{Tok, Token};
use crate::runtime::error::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
    Name(String),
    List(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub line: u32,
    pub cond: Expr,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptHandler {
    pub line: u32,
    pub name: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expr(Expr),
    Assign(String, Expr),
    AugAssign(String, BinaryOp, Expr),
    Return(Option<Expr>),
    Raise(Expr),
    Pass,
    Break,
    Continue,
    If {
        branches: Vec<Branch>,
        orelse: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Try {
        body: Vec<Stmt>,
        handler: ExceptHandler,
    },
    Def(FunctionDef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub line: u32,
    pub kind: StmtKind,
}

/// Recursive descent parser over [`Token`] stream.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Line of the last consumed `Newline`, marks the end of a block.
    last_newline: u32,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            last_newline: 0,
        }
    }

    pub fn parse_module(mut self) -> Result<Vec<Stmt>, RuntimeError> {
        let mut body = vec![];
        while !self.at(&Tok::Eof) {
            body.push(self.statement()?);
        }
        Ok(body)
    }

    fn peek(&self) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[self.pos.min(last)]
    }

    fn peek_nth(&self, n: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + n).map(|t| &t.tok)
    }

    fn at(&self, tok: &Tok) -> bool {
        &self.peek().tok == tok
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        if token.tok == Tok::Newline {
            self.last_newline = token.line;
        }
        token
    }

    fn unexpected(&self, expected: &str) -> RuntimeError {
        let token = self.peek();
        RuntimeError::syntax(
            token.line,
            format!("expected {expected}, found {:?}", token.tok),
        )
    }

    fn expect(&mut self, tok: Tok, expected: &str) -> Result<Token, RuntimeError> {
        if self.at(&tok) {
            return Ok(self.advance());
        }
        Err(self.unexpected(expected))
    }

    fn name(&mut self) -> Result<String, RuntimeError> {
        match self.peek().tok.clone() {
            Tok::Name(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("name")),
        }
    }

    fn statement(&mut self) -> Result<Stmt, RuntimeError> {
        let Token { tok, line } = self.peek().clone();
        let kind = match tok {
            Tok::Def => StmtKind::Def(self.def()?),
            Tok::If => self.if_stmt()?,
            Tok::While => {
                self.advance();
                let cond = self.expr()?;
                let (body, _) = self.block()?;
                StmtKind::While { cond, body }
            }
            Tok::Try => {
                self.advance();
                let (body, _) = self.block()?;
                let except_line = self.expect(Tok::Except, "`except`")?.line;
                let name = if self.at(&Tok::Colon) {
                    None
                } else {
                    Some(self.name()?)
                };
                let (handler_body, _) = self.block()?;
                StmtKind::Try {
                    body,
                    handler: ExceptHandler {
                        line: except_line,
                        name,
                        body: handler_body,
                    },
                }
            }
            _ => {
                let kind = self.simple_statement()?;
                self.expect(Tok::Newline, "end of line")?;
                kind
            }
        };
        Ok(Stmt { line, kind })
    }

    fn simple_statement(&mut self) -> Result<StmtKind, RuntimeError> {
        let kind = match self.peek().tok.clone() {
            Tok::Pass => {
                self.advance();
                StmtKind::Pass
            }
            Tok::Break => {
                self.advance();
                StmtKind::Break
            }
            Tok::Continue => {
                self.advance();
                StmtKind::Continue
            }
            Tok::Return => {
                self.advance();
                if self.at(&Tok::Newline) {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.expr()?))
                }
            }
            Tok::Raise => {
                self.advance();
                StmtKind::Raise(self.expr()?)
            }
            Tok::Name(name) if self.peek_nth(1) == Some(&Tok::Assign) => {
                self.pos += 2;
                StmtKind::Assign(name, self.expr()?)
            }
            Tok::Name(name) if self.peek_nth(1) == Some(&Tok::PlusAssign) => {
                self.pos += 2;
                StmtKind::AugAssign(name, BinaryOp::Add, self.expr()?)
            }
            Tok::Name(name) if self.peek_nth(1) == Some(&Tok::MinusAssign) => {
                self.pos += 2;
                StmtKind::AugAssign(name, BinaryOp::Sub, self.expr()?)
            }
            _ => StmtKind::Expr(self.expr()?),
        };
        Ok(kind)
    }

    /// Parse `: NEWLINE INDENT stmt+ DEDENT`, return statements and last line of the block.
    fn block(&mut self) -> Result<(Vec<Stmt>, u32), RuntimeError> {
        self.expect(Tok::Colon, "`:`")?;
        self.expect(Tok::Newline, "end of line")?;
        self.expect(Tok::Indent, "indented block")?;
        let mut body = vec![];
        while !self.at(&Tok::Dedent) && !self.at(&Tok::Eof) {
            body.push(self.statement()?);
        }
        let end_line = self.last_newline;
        self.expect(Tok::Dedent, "end of block")?;
        Ok((body, end_line))
    }

    fn def(&mut self) -> Result<FunctionDef, RuntimeError> {
        let line = self.expect(Tok::Def, "`def`")?.line;
        let name = self.name()?;
        self.expect(Tok::LParen, "`(`")?;
        let mut params = vec![];
        while !self.at(&Tok::RParen) {
            let param = self.name()?;
            if params.contains(&param) {
                return Err(RuntimeError::syntax(
                    line,
                    format!("duplicate argument `{param}`"),
                ));
            }
            params.push(param);
            if !self.at(&Tok::RParen) {
                self.expect(Tok::Comma, "`,`")?;
            }
        }
        self.advance();
        let (body, end_line) = self.block()?;
        Ok(FunctionDef {
            name,
            params,
            body,
            line,
            end_line,
        })
    }

    fn if_stmt(&mut self) -> Result<StmtKind, RuntimeError> {
        let mut branches = vec![];
        let line = self.advance().line;
        let cond = self.expr()?;
        let (body, _) = self.block()?;
        branches.push(Branch { line, cond, body });

        while self.at(&Tok::Elif) {
            let line = self.advance().line;
            let cond = self.expr()?;
            let (body, _) = self.block()?;
            branches.push(Branch { line, cond, body });
        }

        let mut orelse = vec![];
        if self.at(&Tok::Else) {
            self.advance();
            orelse = self.block()?.0;
        }
        Ok(StmtKind::If { branches, orelse })
    }

    pub fn expr(&mut self) -> Result<Expr, RuntimeError> {
        if self.at(&Tok::Not) {
            self.advance();
            let operand = self.expr()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, RuntimeError> {
        let lhs = self.additive()?;
        let op = match self.peek().tok {
            Tok::Lt => BinaryOp::Lt,
            Tok::Le => BinaryOp::Le,
            Tok::Gt => BinaryOp::Gt,
            Tok::Ge => BinaryOp::Ge,
            Tok::EqEq => BinaryOp::Eq,
            Tok::NotEq => BinaryOp::Ne,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Expr, RuntimeError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek().tok {
                Tok::Plus => BinaryOp::Add,
                Tok::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, RuntimeError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().tok {
                Tok::Star => BinaryOp::Mul,
                Tok::Slash => BinaryOp::Div,
                Tok::Percent => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, RuntimeError> {
        if self.at(&Tok::Minus) {
            self.advance();
            let operand = self.unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, RuntimeError> {
        let mut expr = self.atom()?;
        while self.at(&Tok::LParen) {
            self.advance();
            let args = self.sequence(Tok::RParen, "`)`")?;
            expr = Expr::Call(Box::new(expr), args);
        }
        Ok(expr)
    }

    /// Parse comma separated expressions up to (and including) the closing token.
    fn sequence(&mut self, close: Tok, expected: &str) -> Result<Vec<Expr>, RuntimeError> {
        let mut items = vec![];
        while !self.at(&close) {
            items.push(self.expr()?);
            if !self.at(&close) {
                self.expect(Tok::Comma, expected)?;
            }
        }
        self.advance();
        Ok(items)
    }

    fn atom(&mut self) -> Result<Expr, RuntimeError> {
        let expr = match self.peek().tok.clone() {
            Tok::Int(i) => Expr::Int(i),
            Tok::Float(f) => Expr::Float(f),
            Tok::Str(s) => Expr::Str(s),
            Tok::True => Expr::Bool(true),
            Tok::False => Expr::Bool(false),
            Tok::None => Expr::None,
            Tok::Name(name) => Expr::Name(name),
            Tok::LParen => {
                self.advance();
                let expr = self.expr()?;
                self.expect(Tok::RParen, "`)`")?;
                return Ok(expr);
            }
            Tok::LBracket => {
                self.advance();
                return Ok(Expr::List(self.sequence(Tok::RBracket, "`]`")?));
            }
            _ => return Err(self.unexpected("expression")),
        };
        self.advance();
        Ok(expr)
    }
}
