//! A small line-oriented script engine.
//!
//! One statement per line, `#` starts a comment:
//!
//! ```text
//! let name = ask("name?")
//! notice "got a name"
//! print "hello " + name
//! sleep 50
//! 2 + 2
//! ```
//!
//! A trailing bare expression has its value displayed on stdout. Variables live in one
//! namespace per engine instance and outlive the cell that set them.

use super::{Capabilities, CellOutput, CellStatus, Engine, EngineError};
use crate::protocol::StreamKind;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Int(i64),
    Str(String),
    Var(String),
    Neg(Box<Expr>),
    Ask(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    Let(String, Expr),
    Print(Expr),
    Eprint(Expr),
    Notice(Expr),
    Sleep(Expr),
    Fail(Expr),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "syntax error on line {}: {}", self.line, self.message)
    }
}

fn tokenize(line: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '#' => break,
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => return Err("unterminated string".to_string()),
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some('"') => s.push('"'),
                            Some('\\') => s.push('\\'),
                            Some(other) => return Err(format!("unknown escape '\\{}'", other)),
                            None => return Err("unterminated string".to_string()),
                        },
                        Some(ch) => s.push(ch),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = digits
                    .parse::<i64>()
                    .map_err(|_| format!("integer literal {} out of range", digits))?;
                tokens.push(Token::Int(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

/// Bound on expression depth: nested parentheses, unary minus and operator chains all count.
/// Parsing and evaluation recurse on the cell thread's stack, and overflowing it aborts the
/// whole process.
const MAX_NESTING: usize = 200;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn descend(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(format!(
                "expression nested more than {} levels deep",
                MAX_NESTING
            ));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: &Token) -> Result<(), String> {
        match self.next() {
            Some(ref t) if t == want => Ok(()),
            Some(t) => Err(format!("expected {:?}, found {:?}", want, t)),
            None => Err(format!("expected {:?}, found end of line", want)),
        }
    }

    fn statement(&mut self) -> Result<Stmt, String> {
        let keyword = match self.peek() {
            Some(Token::Ident(name)) if self.tokens.len() > 1 => Some(name.clone()),
            _ => None,
        };

        let stmt = match keyword.as_deref() {
            Some("let") => {
                self.pos += 1;
                let name = match self.next() {
                    Some(Token::Ident(name)) => name,
                    _ => return Err("expected a variable name after 'let'".to_string()),
                };
                self.expect(&Token::Eq)?;
                Stmt::Let(name, self.expr()?)
            }
            Some("print") => {
                self.pos += 1;
                Stmt::Print(self.expr()?)
            }
            Some("eprint") => {
                self.pos += 1;
                Stmt::Eprint(self.expr()?)
            }
            Some("notice") => {
                self.pos += 1;
                Stmt::Notice(self.expr()?)
            }
            Some("sleep") => {
                self.pos += 1;
                Stmt::Sleep(self.expr()?)
            }
            Some("fail") => {
                self.pos += 1;
                Stmt::Fail(self.expr()?)
            }
            _ => Stmt::Expr(self.expr()?),
        };

        match self.peek() {
            None => Ok(stmt),
            Some(t) => Err(format!("unexpected {:?} after statement", t)),
        }
    }

    // Each operator in a chain deepens the left-leaning tree by one level.
    fn expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.term()?;
        let mut chained = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => {
                    self.depth -= chained;
                    return Ok(lhs);
                }
            };
            self.pos += 1;
            self.descend()?;
            chained += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        let mut chained = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => {
                    self.depth -= chained;
                    return Ok(lhs);
                }
            };
            self.pos += 1;
            self.descend()?;
            chained += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Int(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) if name == "ask" && self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                self.descend()?;
                let prompt = self.expr()?;
                self.expect(&Token::RParen)?;
                self.depth -= 1;
                Ok(Expr::Ask(Box::new(prompt)))
            }
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(t) => Err(format!("unexpected {:?}", t)),
            None => Err("unexpected end of line".to_string()),
        }
    }
}

/// Parse a whole cell up front so a syntax error runs nothing.
fn parse_cell(code: &str) -> Result<Vec<(usize, Stmt)>, SyntaxError> {
    let mut stmts = Vec::new();
    for (idx, line) in code.lines().enumerate() {
        let line_no = idx + 1;
        let tokens = tokenize(line).map_err(|message| SyntaxError {
            line: line_no,
            message,
        })?;
        if tokens.is_empty() {
            continue;
        }
        let stmt = Parser::new(tokens)
            .statement()
            .map_err(|message| SyntaxError {
                line: line_no,
                message,
            })?;
        stmts.push((line_no, stmt));
    }
    Ok(stmts)
}

pub struct ScriptEngine {
    namespace: Mutex<HashMap<String, Value>>,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self {
            namespace: Mutex::new(HashMap::new()),
        }
    }

    /// Read a variable from the shared namespace.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.namespace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn set(&self, name: &str, value: Value) {
        self.namespace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), value);
    }

    fn eval(&self, expr: &Expr, caps: &dyn Capabilities) -> Result<Value, String> {
        match expr {
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Var(name) => self
                .get(name)
                .ok_or_else(|| format!("name '{}' is not defined", name)),
            Expr::Neg(inner) => match self.eval(inner, caps)? {
                Value::Int(n) => n
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| "integer overflow".to_string()),
                Value::Str(_) => Err("cannot negate a string".to_string()),
            },
            Expr::Ask(prompt) => {
                let prompt = self.eval(prompt, caps)?.to_string();
                caps.ask(&prompt)
                    .map(Value::Str)
                    .map_err(|e| format!("ask failed: {}", e))
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs, caps)?;
                let rhs = self.eval(rhs, caps)?;
                binary(*op, lhs, rhs)
            }
        }
    }

    fn exec(
        &self,
        stmt: &Stmt,
        out: &mut dyn CellOutput,
        caps: &dyn Capabilities,
        display: bool,
    ) -> Result<(), String> {
        match stmt {
            Stmt::Let(name, expr) => {
                let value = self.eval(expr, caps)?;
                self.set(name, value);
            }
            Stmt::Print(expr) => {
                let value = self.eval(expr, caps)?;
                out.write(StreamKind::Stdout, &format!("{}\n", value));
            }
            Stmt::Eprint(expr) => {
                let value = self.eval(expr, caps)?;
                out.write(StreamKind::Stderr, &format!("{}\n", value));
            }
            Stmt::Notice(expr) => {
                let value = self.eval(expr, caps)?;
                caps.notice(&value.to_string());
            }
            Stmt::Sleep(expr) => match self.eval(expr, caps)? {
                Value::Int(ms) if ms >= 0 => std::thread::sleep(Duration::from_millis(ms as u64)),
                other => return Err(format!("sleep expects a non-negative integer, got '{}'", other)),
            },
            Stmt::Fail(expr) => {
                let value = self.eval(expr, caps)?;
                return Err(value.to_string());
            }
            Stmt::Expr(expr) => {
                let value = self.eval(expr, caps)?;
                if display {
                    out.write(StreamKind::Stdout, &format!("{}\n", value));
                }
            }
        }
        Ok(())
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, String> {
    match (op, lhs, rhs) {
        (BinOp::Add, Value::Int(a), Value::Int(b)) => a
            .checked_add(b)
            .map(Value::Int)
            .ok_or_else(|| "integer overflow".to_string()),
        (BinOp::Add, a, b) => Ok(Value::Str(format!("{}{}", a, b))),
        (BinOp::Sub, Value::Int(a), Value::Int(b)) => a
            .checked_sub(b)
            .map(Value::Int)
            .ok_or_else(|| "integer overflow".to_string()),
        (BinOp::Mul, Value::Int(a), Value::Int(b)) => a
            .checked_mul(b)
            .map(Value::Int)
            .ok_or_else(|| "integer overflow".to_string()),
        (BinOp::Div, Value::Int(_), Value::Int(0)) => Err("division by zero".to_string()),
        (BinOp::Div, Value::Int(a), Value::Int(b)) => a
            .checked_div(b)
            .map(Value::Int)
            .ok_or_else(|| "integer overflow".to_string()),
        (op, _, _) => Err(format!("unsupported operand types for {:?}", op)),
    }
}

impl Engine for ScriptEngine {
    fn name(&self) -> &str {
        "script"
    }

    fn run_cell(
        &self,
        code: &str,
        out: &mut dyn CellOutput,
        caps: &dyn Capabilities,
    ) -> Result<CellStatus, EngineError> {
        let stmts = match parse_cell(code) {
            Ok(stmts) => stmts,
            Err(e) => {
                out.write(StreamKind::Stderr, &format!("{}\n", e));
                return Ok(CellStatus::failed());
            }
        };

        let last = stmts.len().saturating_sub(1);
        for (idx, (line_no, stmt)) in stmts.iter().enumerate() {
            if let Err(message) = self.exec(stmt, out, caps, idx == last) {
                out.write(
                    StreamKind::Stderr,
                    &format!("error on line {}: {}\n", line_no, message),
                );
                return Ok(CellStatus::failed());
            }
        }

        Ok(CellStatus::ok())
    }
}
