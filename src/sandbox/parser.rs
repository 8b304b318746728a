//! Recursive-descent parser producing the sandbox AST.

use std::sync::Arc;

use super::lexer::{tokenize, FStringPart, Token};
use super::SandboxError;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Piece of an f-string after expression sub-parsing.
#[derive(Debug, Clone)]
pub enum FsPart {
    Lit(String),
    Expr { expr: Box<Expr>, spec: Option<String> },
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Literal),
    Name(String),
    FString(Vec<FsPart>),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Attr {
        obj: Box<Expr>,
        name: String,
    },
    Index {
        obj: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        obj: Box<Expr>,
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    BoolChain {
        op: BoolOp,
        values: Vec<Expr>,
    },
    Compare {
        left: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    Ternary {
        condition: Box<Expr>,
        then: Box<Expr>,
        orelse: Box<Expr>,
    },
    Await(Box<Expr>),
    ListComp {
        element: Box<Expr>,
        target: AssignTarget,
        iter: Box<Expr>,
        condition: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone)]
pub enum AssignTarget {
    Name(String),
    Tuple(Vec<AssignTarget>),
    Index { obj: Box<Expr>, index: Box<Expr> },
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

/// A function defined by the guest program.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub is_async: bool,
}

#[derive(Debug, Clone)]
pub struct ExceptHandler {
    /// Exception class name, when one was written (`except ValueError`).
    pub class: Option<String>,
    /// Binding name (`except Exception as e`).
    pub binding: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Import {
        module: String,
        alias: Option<String>,
    },
    FromImport {
        module: String,
        names: Vec<(String, Option<String>)>,
    },
    FunctionDef(Arc<FunctionDef>),
    Assign {
        target: AssignTarget,
        value: Expr,
    },
    AugAssign {
        target: AssignTarget,
        op: BinOp,
        value: Expr,
    },
    ExprStmt(Expr),
    Return(Option<Expr>),
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
    },
    For {
        target: AssignTarget,
        iter: Expr,
        body: Vec<Stmt>,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
    },
    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        finally: Vec<Stmt>,
    },
    Raise(Option<Expr>),
    Break,
    Continue,
    Pass,
}

/// A parsed program: the flat list of module-level statements.
#[derive(Debug, Clone)]
pub struct Program {
    pub body: Vec<Stmt>,
}

impl Program {
    /// Find a top-level async function by name.
    pub fn find_async_function(&self, name: &str) -> Option<Arc<FunctionDef>> {
        self.body.iter().find_map(|stmt| match stmt {
            Stmt::FunctionDef(def) if def.name == name && def.is_async => Some(Arc::clone(def)),
            _ => None,
        })
    }
}

/// Parse a program from source.
pub fn parse_program(source: &str) -> Result<Program, SandboxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let body = parser.parse_block_until(&[Token::Eof])?;
    Ok(Program { body })
}

/// Parse a single expression (used for f-string parts).
pub fn parse_expression(source: &str) -> Result<Expr, SandboxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expression()?;
    parser.skip_newlines();
    if !matches!(parser.peek(), Token::Eof) {
        return Err(SandboxError::Syntax(format!(
            "unexpected trailing input in expression '{source}'"
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).unwrap_or(&Token::Eof)
    }

    fn bump(&mut self) -> Token {
        let token = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        token
    }

    fn syntax(&self, message: impl Into<String>) -> SandboxError {
        SandboxError::Syntax(format!("{} (near token {:?})", message.into(), self.peek()))
    }

    fn expect(&mut self, expected: &Token) -> Result<(), SandboxError> {
        if self.peek() == expected {
            self.bump();
            Ok(())
        } else {
            Err(self.syntax(format!("expected {expected:?}")))
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.bump();
            true
        } else {
            false
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Token::Newline) {
            self.bump();
        }
    }

    // --- blocks ---

    /// Parse statements until one of the terminators is reached
    /// (the terminator is not consumed).
    fn parse_block_until(&mut self, terminators: &[Token]) -> Result<Vec<Stmt>, SandboxError> {
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            if terminators.contains(self.peek()) {
                return Ok(body);
            }
            if matches!(self.peek(), Token::Eof) {
                return Ok(body);
            }
            body.push(self.statement()?);
        }
    }

    /// Parse `: NEWLINE INDENT stmts DEDENT`.
    fn parse_suite(&mut self) -> Result<Vec<Stmt>, SandboxError> {
        self.expect(&Token::Colon)?;
        if !matches!(self.peek(), Token::Newline) {
            // Single-line suite: `if x: return y`
            let stmt = self.simple_statement()?;
            return Ok(vec![stmt]);
        }
        self.bump(); // newline
        self.expect(&Token::Indent)?;
        let body = self.parse_block_until(&[Token::Dedent])?;
        self.expect(&Token::Dedent)?;
        if body.is_empty() {
            return Err(self.syntax("expected an indented block"));
        }
        Ok(body)
    }

    // --- statements ---

    fn statement(&mut self) -> Result<Stmt, SandboxError> {
        match self.peek() {
            Token::Async | Token::Def => self.function_def(),
            Token::If => self.if_statement(),
            Token::For => self.for_statement(),
            Token::While => self.while_statement(),
            Token::Try => self.try_statement(),
            _ => {
                let stmt = self.simple_statement()?;
                if !matches!(self.peek(), Token::Eof | Token::Dedent) {
                    self.expect(&Token::Newline)?;
                }
                Ok(stmt)
            }
        }
    }

    fn simple_statement(&mut self) -> Result<Stmt, SandboxError> {
        match self.peek() {
            Token::Import => self.import_statement(),
            Token::From => self.from_import_statement(),
            Token::Return => {
                self.bump();
                if matches!(self.peek(), Token::Newline | Token::Eof | Token::Dedent) {
                    Ok(Stmt::Return(None))
                } else {
                    Ok(Stmt::Return(Some(self.expression_or_tuple()?)))
                }
            }
            Token::Raise => {
                self.bump();
                if matches!(self.peek(), Token::Newline | Token::Eof | Token::Dedent) {
                    Ok(Stmt::Raise(None))
                } else {
                    Ok(Stmt::Raise(Some(self.expression()?)))
                }
            }
            Token::Pass => {
                self.bump();
                Ok(Stmt::Pass)
            }
            Token::Break => {
                self.bump();
                Ok(Stmt::Break)
            }
            Token::Continue => {
                self.bump();
                Ok(Stmt::Continue)
            }
            _ => self.assignment_or_expr(),
        }
    }

    fn import_statement(&mut self) -> Result<Stmt, SandboxError> {
        self.expect(&Token::Import)?;
        let module = self.ident()?;
        let alias = if self.eat(&Token::As) {
            Some(self.ident()?)
        } else {
            None
        };
        Ok(Stmt::Import { module, alias })
    }

    fn from_import_statement(&mut self) -> Result<Stmt, SandboxError> {
        self.expect(&Token::From)?;
        let module = self.ident()?;
        self.expect(&Token::Import)?;
        let mut names = Vec::new();
        loop {
            let name = self.ident()?;
            let alias = if self.eat(&Token::As) {
                Some(self.ident()?)
            } else {
                None
            };
            names.push((name, alias));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(Stmt::FromImport { module, names })
    }

    fn function_def(&mut self) -> Result<Stmt, SandboxError> {
        let is_async = self.eat(&Token::Async);
        self.expect(&Token::Def)?;
        let name = self.ident()?;
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        while !matches!(self.peek(), Token::RParen) {
            let param_name = self.ident()?;
            let default = if self.eat(&Token::Assign) {
                Some(self.expression()?)
            } else {
                None
            };
            params.push(Param {
                name: param_name,
                default,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        // Optional return annotation: `-> expr`.
        if self.eat(&Token::Arrow) {
            let _ = self.expression()?;
        }
        let body = self.parse_suite()?;
        Ok(Stmt::FunctionDef(Arc::new(FunctionDef {
            name,
            params,
            body,
            is_async,
        })))
    }

    fn if_statement(&mut self) -> Result<Stmt, SandboxError> {
        self.expect(&Token::If)?;
        let condition = self.expression()?;
        let body = self.parse_suite()?;
        let mut branches = vec![(condition, body)];
        let mut orelse = Vec::new();
        loop {
            self.skip_newlines_before(&[Token::Elif, Token::Else]);
            match self.peek() {
                Token::Elif => {
                    self.bump();
                    let condition = self.expression()?;
                    let body = self.parse_suite()?;
                    branches.push((condition, body));
                }
                Token::Else => {
                    self.bump();
                    orelse = self.parse_suite()?;
                    break;
                }
                _ => break,
            }
        }
        Ok(Stmt::If { branches, orelse })
    }

    /// Peek past newlines for a continuation keyword without consuming
    /// anything when it is absent.
    fn skip_newlines_before(&mut self, continuations: &[Token]) {
        let mut offset = 0;
        while matches!(self.peek_at(offset), Token::Newline) {
            offset += 1;
        }
        if continuations.contains(self.peek_at(offset)) {
            self.pos += offset;
        }
    }

    fn for_statement(&mut self) -> Result<Stmt, SandboxError> {
        self.expect(&Token::For)?;
        let target = self.assign_target_list()?;
        self.expect(&Token::In)?;
        let iter = self.expression()?;
        let body = self.parse_suite()?;
        Ok(Stmt::For { target, iter, body })
    }

    fn while_statement(&mut self) -> Result<Stmt, SandboxError> {
        self.expect(&Token::While)?;
        let condition = self.expression()?;
        let body = self.parse_suite()?;
        Ok(Stmt::While { condition, body })
    }

    fn try_statement(&mut self) -> Result<Stmt, SandboxError> {
        self.expect(&Token::Try)?;
        let body = self.parse_suite()?;
        let mut handlers = Vec::new();
        let mut finally = Vec::new();
        loop {
            self.skip_newlines_before(&[Token::Except, Token::Finally]);
            match self.peek() {
                Token::Except => {
                    self.bump();
                    let class = if let Token::Ident(_) = self.peek() {
                        Some(self.ident()?)
                    } else {
                        None
                    };
                    let binding = if self.eat(&Token::As) {
                        Some(self.ident()?)
                    } else {
                        None
                    };
                    let handler_body = self.parse_suite()?;
                    handlers.push(ExceptHandler {
                        class,
                        binding,
                        body: handler_body,
                    });
                }
                Token::Finally => {
                    self.bump();
                    finally = self.parse_suite()?;
                    break;
                }
                _ => break,
            }
        }
        if handlers.is_empty() && finally.is_empty() {
            return Err(self.syntax("try without except or finally"));
        }
        Ok(Stmt::Try {
            body,
            handlers,
            finally,
        })
    }

    fn assignment_or_expr(&mut self) -> Result<Stmt, SandboxError> {
        let expr = self.expression_or_tuple()?;
        match self.peek().clone() {
            Token::Assign => {
                self.bump();
                let target = expr_to_target(&expr)
                    .ok_or_else(|| self.syntax("invalid assignment target"))?;
                let value = self.expression_or_tuple()?;
                Ok(Stmt::Assign { target, value })
            }
            Token::PlusAssign | Token::MinusAssign | Token::StarAssign | Token::SlashAssign => {
                let op = match self.bump() {
                    Token::PlusAssign => BinOp::Add,
                    Token::MinusAssign => BinOp::Sub,
                    Token::StarAssign => BinOp::Mul,
                    _ => BinOp::Div,
                };
                let target = expr_to_target(&expr)
                    .ok_or_else(|| self.syntax("invalid assignment target"))?;
                let value = self.expression()?;
                Ok(Stmt::AugAssign { target, op, value })
            }
            _ => Ok(Stmt::ExprStmt(expr)),
        }
    }

    fn assign_target_list(&mut self) -> Result<AssignTarget, SandboxError> {
        let mut targets = vec![self.assign_target_atom()?];
        while self.eat(&Token::Comma) {
            targets.push(self.assign_target_atom()?);
        }
        if targets.len() == 1 {
            Ok(targets.pop().expect("non-empty"))
        } else {
            Ok(AssignTarget::Tuple(targets))
        }
    }

    fn assign_target_atom(&mut self) -> Result<AssignTarget, SandboxError> {
        if self.eat(&Token::LParen) {
            let target = self.assign_target_list()?;
            self.expect(&Token::RParen)?;
            return Ok(target);
        }
        let name = self.ident()?;
        Ok(AssignTarget::Name(name))
    }

    fn ident(&mut self) -> Result<String, SandboxError> {
        match self.bump() {
            Token::Ident(name) => Ok(name),
            other => Err(SandboxError::Syntax(format!(
                "expected identifier, found {other:?}"
            ))),
        }
    }

    // --- expressions ---

    /// `a, b, c` at statement level becomes a tuple.
    fn expression_or_tuple(&mut self) -> Result<Expr, SandboxError> {
        let first = self.expression()?;
        if !matches!(self.peek(), Token::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if matches!(self.peek(), Token::Newline | Token::Eof | Token::Assign) {
                break;
            }
            items.push(self.expression()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn expression(&mut self) -> Result<Expr, SandboxError> {
        let value = self.or_expr()?;
        if self.eat(&Token::If) {
            let condition = self.or_expr()?;
            self.expect(&Token::Else)?;
            let orelse = self.expression()?;
            return Ok(Expr::Ternary {
                condition: Box::new(condition),
                then: Box::new(value),
                orelse: Box::new(orelse),
            });
        }
        Ok(value)
    }

    fn or_expr(&mut self) -> Result<Expr, SandboxError> {
        let first = self.and_expr()?;
        if !matches!(self.peek(), Token::Or) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Token::Or) {
            values.push(self.and_expr()?);
        }
        Ok(Expr::BoolChain {
            op: BoolOp::Or,
            values,
        })
    }

    fn and_expr(&mut self) -> Result<Expr, SandboxError> {
        let first = self.not_expr()?;
        if !matches!(self.peek(), Token::And) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Token::And) {
            values.push(self.not_expr()?);
        }
        Ok(Expr::BoolChain {
            op: BoolOp::And,
            values,
        })
    }

    fn not_expr(&mut self) -> Result<Expr, SandboxError> {
        if self.eat(&Token::Not) {
            let operand = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SandboxError> {
        let left = self.arithmetic()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Token::Eq => CmpOp::Eq,
                Token::NotEq => CmpOp::NotEq,
                Token::Lt => CmpOp::Lt,
                Token::LtEq => CmpOp::LtEq,
                Token::Gt => CmpOp::Gt,
                Token::GtEq => CmpOp::GtEq,
                Token::In => CmpOp::In,
                Token::Is => {
                    self.bump();
                    let op = if self.eat(&Token::Not) {
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    };
                    rest.push((op, self.arithmetic()?));
                    continue;
                }
                Token::Not if matches!(self.peek_at(1), Token::In) => {
                    self.bump();
                    self.bump();
                    rest.push((CmpOp::NotIn, self.arithmetic()?));
                    continue;
                }
                _ => break,
            };
            self.bump();
            rest.push((op, self.arithmetic()?));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                rest,
            })
        }
    }

    fn arithmetic(&mut self) -> Result<Expr, SandboxError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, SandboxError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::DoubleSlash => BinOp::FloorDiv,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.bump();
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, SandboxError> {
        if self.eat(&Token::Minus) {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        if self.eat(&Token::Plus) {
            return self.unary();
        }
        if self.eat(&Token::Await) {
            let operand = self.unary()?;
            return Ok(Expr::Await(Box::new(operand)));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, SandboxError> {
        let base = self.postfix()?;
        if self.eat(&Token::DoubleStar) {
            let exponent = self.unary()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, SandboxError> {
        let mut expr = self.atom()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.bump();
                    let name = self.ident()?;
                    expr = Expr::Attr {
                        obj: Box::new(expr),
                        name,
                    };
                }
                Token::LParen => {
                    self.bump();
                    let (args, kwargs) = self.call_arguments()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        kwargs,
                    };
                }
                Token::LBracket => {
                    self.bump();
                    expr = self.subscript(expr)?;
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn call_arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), SandboxError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !matches!(self.peek(), Token::RParen) {
            if let (Token::Ident(name), Token::Assign) = (self.peek(), self.peek_at(1)) {
                let name = name.clone();
                self.bump();
                self.bump();
                kwargs.push((name, self.expression()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.syntax("positional argument after keyword argument"));
                }
                args.push(self.expression()?);
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok((args, kwargs))
    }

    fn subscript(&mut self, obj: Expr) -> Result<Expr, SandboxError> {
        // `[:b]`, `[a:]`, `[a:b]`, `[a]`
        let lower = if matches!(self.peek(), Token::Colon) {
            None
        } else {
            Some(Box::new(self.expression()?))
        };
        if self.eat(&Token::Colon) {
            let upper = if matches!(self.peek(), Token::RBracket) {
                None
            } else {
                Some(Box::new(self.expression()?))
            };
            self.expect(&Token::RBracket)?;
            return Ok(Expr::Slice {
                obj: Box::new(obj),
                lower,
                upper,
            });
        }
        self.expect(&Token::RBracket)?;
        let index = lower.ok_or_else(|| self.syntax("empty subscript"))?;
        Ok(Expr::Index {
            obj: Box::new(obj),
            index,
        })
    }

    fn atom(&mut self) -> Result<Expr, SandboxError> {
        match self.bump() {
            Token::Int(value) => Ok(Expr::Literal(Literal::Int(value))),
            Token::Float(value) => Ok(Expr::Literal(Literal::Float(value))),
            Token::Str(value) => Ok(Expr::Literal(Literal::Str(value))),
            Token::FStr(parts) => {
                let mut parsed = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        FStringPart::Lit(text) => parsed.push(FsPart::Lit(text)),
                        FStringPart::Expr { source, spec } => parsed.push(FsPart::Expr {
                            expr: Box::new(parse_expression(&source)?),
                            spec,
                        }),
                    }
                }
                Ok(Expr::FString(parsed))
            }
            Token::True => Ok(Expr::Literal(Literal::Bool(true))),
            Token::False => Ok(Expr::Literal(Literal::Bool(false))),
            Token::NoneKw => Ok(Expr::Literal(Literal::None)),
            Token::Ident(name) => Ok(Expr::Name(name)),
            Token::LParen => {
                if self.eat(&Token::RParen) {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.expression()?;
                if self.eat(&Token::Comma) {
                    let mut items = vec![first];
                    while !matches!(self.peek(), Token::RParen) {
                        items.push(self.expression()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::RParen)?;
                    return Ok(Expr::Tuple(items));
                }
                self.expect(&Token::RParen)?;
                Ok(first)
            }
            Token::LBracket => {
                if self.eat(&Token::RBracket) {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.expression()?;
                if self.eat(&Token::For) {
                    let target = self.assign_target_list()?;
                    self.expect(&Token::In)?;
                    let iter = self.or_expr()?;
                    let condition = if self.eat(&Token::If) {
                        Some(Box::new(self.or_expr()?))
                    } else {
                        None
                    };
                    self.expect(&Token::RBracket)?;
                    return Ok(Expr::ListComp {
                        element: Box::new(first),
                        target,
                        iter: Box::new(iter),
                        condition,
                    });
                }
                let mut items = vec![first];
                while self.eat(&Token::Comma) {
                    if matches!(self.peek(), Token::RBracket) {
                        break;
                    }
                    items.push(self.expression()?);
                }
                self.expect(&Token::RBracket)?;
                Ok(Expr::List(items))
            }
            Token::LBrace => {
                let mut entries = Vec::new();
                while !matches!(self.peek(), Token::RBrace) {
                    let key = self.expression()?;
                    self.expect(&Token::Colon)?;
                    let value = self.expression()?;
                    entries.push((key, value));
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RBrace)?;
                Ok(Expr::Dict(entries))
            }
            Token::Lambda => Err(SandboxError::Syntax(
                "lambda expressions are not supported in the sandbox".into(),
            )),
            other => Err(SandboxError::Syntax(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

/// Re-interpret an expression as an assignment target.
fn expr_to_target(expr: &Expr) -> Option<AssignTarget> {
    match expr {
        Expr::Name(name) => Some(AssignTarget::Name(name.clone())),
        Expr::Tuple(items) => {
            let targets: Option<Vec<AssignTarget>> = items.iter().map(expr_to_target).collect();
            Some(AssignTarget::Tuple(targets?))
        }
        Expr::Index { obj, index } => Some(AssignTarget::Index {
            obj: obj.clone(),
            index: index.clone(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_async_main() {
        let program = parse_program(
            "async def main():\n    return {\"status\": \"completed\", \"result\": \"4\"}\n",
        )
        .unwrap();
        let main = program.find_async_function("main").unwrap();
        assert!(main.is_async);
        assert_eq!(main.params.len(), 0);
        assert!(matches!(main.body[0], Stmt::Return(Some(_))));
    }

    #[test]
    fn test_missing_async_main_detected() {
        let program = parse_program("def main():\n    return 1\n").unwrap();
        assert!(program.find_async_function("main").is_none());
    }

    #[test]
    fn test_parse_tool_call_with_kwargs() {
        let program =
            parse_program("async def main():\n    r = await default.multiply(x=6, y=7)\n    return r\n")
                .unwrap();
        let main = program.find_async_function("main").unwrap();
        match &main.body[0] {
            Stmt::Assign { value, .. } => match value {
                Expr::Await(inner) => match &**inner {
                    Expr::Call { kwargs, .. } => {
                        assert_eq!(kwargs.len(), 2);
                        assert_eq!(kwargs[0].0, "x");
                    }
                    other => panic!("expected call, got {other:?}"),
                },
                other => panic!("expected await, got {other:?}"),
            },
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_if_elif_else() {
        let source = "if x > 1:\n    a = 1\nelif x < 0:\n    a = 2\nelse:\n    a = 3\n";
        let program = parse_program(source).unwrap();
        match &program.body[0] {
            Stmt::If { branches, orelse } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(orelse.len(), 1);
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_try_except_finally() {
        let source = "try:\n    x = 1\nexcept Exception as e:\n    x = 2\nfinally:\n    y = 3\n";
        let program = parse_program(source).unwrap();
        match &program.body[0] {
            Stmt::Try {
                handlers, finally, ..
            } => {
                assert_eq!(handlers.len(), 1);
                assert_eq!(handlers[0].binding.as_deref(), Some("e"));
                assert_eq!(finally.len(), 1);
            }
            other => panic!("expected try, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_list_comprehension() {
        let program = parse_program("xs = [i * 2 for i in range(3) if i > 0]\n").unwrap();
        match &program.body[0] {
            Stmt::Assign { value, .. } => {
                assert!(matches!(value, Expr::ListComp { condition: Some(_), .. }));
            }
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_tuple_unpacking_for() {
        let program =
            parse_program("for k, v in items:\n    pass\n").unwrap();
        match &program.body[0] {
            Stmt::For { target, .. } => {
                assert!(matches!(target, AssignTarget::Tuple(t) if t.len() == 2));
            }
            other => panic!("expected for, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_slice_and_index() {
        let program = parse_program("a = xs[1]\nb = xs[1:3]\nc = xs[:2]\n").unwrap();
        assert_eq!(program.body.len(), 3);
        assert!(matches!(
            &program.body[1],
            Stmt::Assign { value: Expr::Slice { .. }, .. }
        ));
    }

    #[test]
    fn test_chained_comparison() {
        let program = parse_program("ok = 0 < x < 10\n").unwrap();
        match &program.body[0] {
            Stmt::Assign { value, .. } => match value {
                Expr::Compare { rest, .. } => assert_eq!(rest.len(), 2),
                other => panic!("expected compare, got {other:?}"),
            },
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn test_lambda_rejected() {
        assert!(parse_program("f = lambda x: x\n").is_err());
    }
}
