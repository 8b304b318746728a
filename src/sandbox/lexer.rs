//! Tokenizer for the sandboxed language.
//!
//! Indentation-sensitive: the token stream carries `Newline`, `Indent`,
//! and `Dedent` tokens derived from leading whitespace, with implicit
//! line joining inside brackets. F-strings are lexed into literal and
//! expression parts; the parser sub-parses the expression sources.

use super::SandboxError;

/// One piece of an f-string.
#[derive(Debug, Clone, PartialEq)]
pub enum FStringPart {
    /// Literal text.
    Lit(String),
    /// `{expr[:spec]}`: raw expression source plus optional format spec.
    Expr { source: String, spec: Option<String> },
}

/// Lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals and names
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    FStr(Vec<FStringPart>),

    // Keywords
    Async,
    Def,
    Return,
    If,
    Elif,
    Else,
    For,
    While,
    In,
    Not,
    And,
    Or,
    Is,
    Import,
    From,
    As,
    Try,
    Except,
    Finally,
    Raise,
    Pass,
    Break,
    Continue,
    Await,
    True,
    False,
    NoneKw,
    Lambda,

    // Operators and punctuation
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Arrow,

    // Layout
    Newline,
    Indent,
    Dedent,
    Eof,
}

fn keyword(word: &str) -> Option<Token> {
    Some(match word {
        "async" => Token::Async,
        "def" => Token::Def,
        "return" => Token::Return,
        "if" => Token::If,
        "elif" => Token::Elif,
        "else" => Token::Else,
        "for" => Token::For,
        "while" => Token::While,
        "in" => Token::In,
        "not" => Token::Not,
        "and" => Token::And,
        "or" => Token::Or,
        "is" => Token::Is,
        "import" => Token::Import,
        "from" => Token::From,
        "as" => Token::As,
        "try" => Token::Try,
        "except" => Token::Except,
        "finally" => Token::Finally,
        "raise" => Token::Raise,
        "pass" => Token::Pass,
        "break" => Token::Break,
        "continue" => Token::Continue,
        "await" => Token::Await,
        "True" => Token::True,
        "False" => Token::False,
        "None" => Token::NoneKw,
        "lambda" => Token::Lambda,
        _ => return None,
    })
}

/// Tokenize a program.
pub fn tokenize(source: &str) -> Result<Vec<Token>, SandboxError> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    tokens: Vec<Token>,
    indent_stack: Vec<usize>,
    paren_depth: usize,
    at_line_start: bool,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            tokens: Vec::new(),
            indent_stack: vec![0],
            paren_depth: 0,
            at_line_start: true,
        }
    }

    fn syntax(&self, message: impl Into<String>) -> SandboxError {
        SandboxError::Syntax(format!("line {}: {}", self.line, message.into()))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
            if c == Some('\n') {
                self.line += 1;
            }
        }
        c
    }

    fn run(mut self) -> Result<Vec<Token>, SandboxError> {
        while self.pos < self.chars.len() {
            if self.at_line_start && self.paren_depth == 0 {
                self.handle_indentation()?;
                if self.pos >= self.chars.len() {
                    break;
                }
            }
            let Some(c) = self.peek() else { break };
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '\n' => {
                    self.bump();
                    if self.paren_depth == 0 {
                        if !matches!(self.tokens.last(), None | Some(Token::Newline)) {
                            self.tokens.push(Token::Newline);
                        }
                        self.at_line_start = true;
                    }
                }
                '\\' if self.peek_at(1) == Some('\n') => {
                    // Explicit line continuation.
                    self.bump();
                    self.bump();
                }
                '\'' | '"' => self.string(None)?,
                c if c.is_ascii_digit() => self.number()?,
                c if c.is_alphabetic() || c == '_' => self.word()?,
                _ => self.operator()?,
            }
        }

        if !matches!(self.tokens.last(), None | Some(Token::Newline)) {
            self.tokens.push(Token::Newline);
        }
        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            self.tokens.push(Token::Dedent);
        }
        self.tokens.push(Token::Eof);
        Ok(self.tokens)
    }

    /// Measure leading whitespace and emit Indent/Dedent tokens.
    fn handle_indentation(&mut self) -> Result<(), SandboxError> {
        loop {
            let mut width = 0usize;
            while let Some(c) = self.peek() {
                match c {
                    ' ' => {
                        width += 1;
                        self.bump();
                    }
                    '\t' => {
                        width += 8 - width % 8;
                        self.bump();
                    }
                    _ => break,
                }
            }
            match self.peek() {
                // Blank or comment-only lines do not affect indentation.
                Some('\n') => {
                    self.bump();
                    continue;
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    continue;
                }
                None => {
                    self.at_line_start = false;
                    return Ok(());
                }
                Some(_) => {
                    self.at_line_start = false;
                    let current = *self.indent_stack.last().unwrap_or(&0);
                    if width > current {
                        self.indent_stack.push(width);
                        self.tokens.push(Token::Indent);
                    } else if width < current {
                        while self
                            .indent_stack
                            .last()
                            .map(|&level| level > width)
                            .unwrap_or(false)
                        {
                            self.indent_stack.pop();
                            self.tokens.push(Token::Dedent);
                        }
                        if self.indent_stack.last() != Some(&width) {
                            return Err(self.syntax("inconsistent indentation"));
                        }
                    }
                    return Ok(());
                }
            }
        }
    }

    fn word(&mut self) -> Result<(), SandboxError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        // String prefixes: f"", r"", fr"".
        if matches!(self.peek(), Some('\'') | Some('"')) {
            let lower = word.to_lowercase();
            if lower.chars().all(|c| matches!(c, 'f' | 'r' | 'b' | 'u')) && !lower.is_empty() {
                return self.string(Some(&lower));
            }
        }

        match keyword(&word) {
            Some(token) => self.tokens.push(token),
            None => self.tokens.push(Token::Ident(word)),
        }
        Ok(())
    }

    fn number(&mut self) -> Result<(), SandboxError> {
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.bump();
            } else if c == '.' && self.peek_at(1).map(|n| n.is_ascii_digit()).unwrap_or(false) {
                is_float = true;
                self.bump();
            } else if (c == 'e' || c == 'E')
                && self
                    .peek_at(1)
                    .map(|n| n.is_ascii_digit() || n == '+' || n == '-')
                    .unwrap_or(false)
            {
                is_float = true;
                self.bump();
                self.bump();
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|&&c| c != '_')
            .collect();
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| self.syntax(format!("invalid float literal '{text}'")))?;
            self.tokens.push(Token::Float(value));
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| self.syntax(format!("invalid int literal '{text}'")))?;
            self.tokens.push(Token::Int(value));
        }
        Ok(())
    }

    fn string(&mut self, prefix: Option<&str>) -> Result<(), SandboxError> {
        let is_fstring = prefix.map(|p| p.contains('f')).unwrap_or(false);
        let is_raw = prefix.map(|p| p.contains('r')).unwrap_or(false);

        let quote = self.bump().ok_or_else(|| self.syntax("unterminated string"))?;
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let mut raw = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.syntax("unterminated string literal"));
            };
            if triple {
                if c == quote && self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.bump();
                    self.bump();
                    self.bump();
                    break;
                }
                if c == '\\' && !is_raw {
                    self.bump();
                    raw.push(self.escape()?);
                    continue;
                }
                raw.push(c);
                self.bump();
            } else {
                if c == quote {
                    self.bump();
                    break;
                }
                if c == '\n' {
                    return Err(self.syntax("unterminated string literal"));
                }
                if c == '\\' && !is_raw {
                    self.bump();
                    raw.push(self.escape()?);
                    continue;
                }
                raw.push(c);
                self.bump();
            }
        }

        if is_fstring {
            self.tokens.push(Token::FStr(split_fstring(&raw).map_err(
                |message| self.syntax(message),
            )?));
        } else {
            self.tokens.push(Token::Str(raw));
        }
        Ok(())
    }

    fn escape(&mut self) -> Result<char, SandboxError> {
        let c = self
            .bump()
            .ok_or_else(|| self.syntax("dangling escape at end of string"))?;
        Ok(match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            '\\' => '\\',
            '\'' => '\'',
            '"' => '"',
            '\n' => return self.escape_continuation(),
            other => other,
        })
    }

    fn escape_continuation(&mut self) -> Result<char, SandboxError> {
        // Backslash-newline inside a string swallows the newline; yield
        // the next escaped or literal character instead.
        let Some(c) = self.peek() else {
            return Err(self.syntax("unterminated string literal"));
        };
        self.bump();
        Ok(c)
    }

    fn operator(&mut self) -> Result<(), SandboxError> {
        let c = self.bump().ok_or_else(|| self.syntax("unexpected end"))?;
        let next = self.peek();
        let token = match (c, next) {
            ('*', Some('*')) => {
                self.bump();
                Token::DoubleStar
            }
            ('*', Some('=')) => {
                self.bump();
                Token::StarAssign
            }
            ('*', _) => Token::Star,
            ('/', Some('/')) => {
                self.bump();
                Token::DoubleSlash
            }
            ('/', Some('=')) => {
                self.bump();
                Token::SlashAssign
            }
            ('/', _) => Token::Slash,
            ('+', Some('=')) => {
                self.bump();
                Token::PlusAssign
            }
            ('+', _) => Token::Plus,
            ('-', Some('=')) => {
                self.bump();
                Token::MinusAssign
            }
            ('-', Some('>')) => {
                self.bump();
                Token::Arrow
            }
            ('-', _) => Token::Minus,
            ('%', _) => Token::Percent,
            ('=', Some('=')) => {
                self.bump();
                Token::Eq
            }
            ('=', _) => Token::Assign,
            ('!', Some('=')) => {
                self.bump();
                Token::NotEq
            }
            ('<', Some('=')) => {
                self.bump();
                Token::LtEq
            }
            ('<', _) => Token::Lt,
            ('>', Some('=')) => {
                self.bump();
                Token::GtEq
            }
            ('>', _) => Token::Gt,
            ('(', _) => {
                self.paren_depth += 1;
                Token::LParen
            }
            (')', _) => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                Token::RParen
            }
            ('[', _) => {
                self.paren_depth += 1;
                Token::LBracket
            }
            (']', _) => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                Token::RBracket
            }
            ('{', _) => {
                self.paren_depth += 1;
                Token::LBrace
            }
            ('}', _) => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                Token::RBrace
            }
            (',', _) => Token::Comma,
            (':', _) => Token::Colon,
            ('.', _) => Token::Dot,
            (other, _) => return Err(self.syntax(format!("unexpected character '{other}'"))),
        };
        self.tokens.push(token);
        Ok(())
    }
}

/// Split an f-string body into literal and `{expr}` parts.
fn split_fstring(raw: &str) -> Result<Vec<FStringPart>, String> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let chars: Vec<char> = raw.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '{' if chars.get(i + 1) == Some(&'{') => {
                literal.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                literal.push('}');
                i += 2;
            }
            '{' => {
                if !literal.is_empty() {
                    parts.push(FStringPart::Lit(std::mem::take(&mut literal)));
                }
                let mut depth = 1;
                let mut body = String::new();
                i += 1;
                while i < chars.len() && depth > 0 {
                    let c = chars[i];
                    match c {
                        '{' | '[' | '(' => depth += 1,
                        '}' | ']' | ')' => {
                            depth -= 1;
                            if depth == 0 && c == '}' {
                                break;
                            }
                        }
                        _ => {}
                    }
                    body.push(c);
                    i += 1;
                }
                if depth != 0 {
                    return Err("unbalanced braces in f-string".to_string());
                }
                i += 1; // consume closing '}'
                let (source, spec) = match split_format_spec(&body) {
                    Some((expr, spec)) => (expr.to_string(), Some(spec.to_string())),
                    None => (body.clone(), None),
                };
                if source.trim().is_empty() {
                    return Err("empty expression in f-string".to_string());
                }
                parts.push(FStringPart::Expr { source, spec });
            }
            '}' => return Err("single '}' in f-string".to_string()),
            _ => {
                literal.push(c);
                i += 1;
            }
        }
    }
    if !literal.is_empty() {
        parts.push(FStringPart::Lit(literal));
    }
    Ok(parts)
}

/// Split `expr:spec` at the first top-level colon.
fn split_format_spec(body: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    let mut in_string: Option<char> = None;
    for (idx, c) in body.char_indices() {
        match c {
            '\'' | '"' => match in_string {
                Some(q) if q == c => in_string = None,
                None => in_string = Some(c),
                _ => {}
            },
            _ if in_string.is_some() => {}
            '[' | '(' | '{' => depth += 1,
            ']' | ')' | '}' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => return Some((&body[..idx], &body[idx + 1..])),
            _ => {}
        }
    }
    None
}
