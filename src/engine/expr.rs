//! # engine::expr
//!
//! The small, statically typed expression language rule conditions are
//! written in.
//!
//! ```text
//! or      := and   (("or"  | "|") and)*
//! and     := not   (("and" | "&") not)*
//! not     := ("not" | "~") not | compare
//! compare := sum   (("<" | "<=" | ">" | ">=" | "==" | "!=") sum)*
//! sum     := term  (("+" | "-") term)*
//! term    := unary (("*" | "/" | "//" | "%") unary)*
//! unary   := ("-" | "+") unary | power
//! power   := atom  ("**" unary)?
//! atom    := number | "true" | "false" | column | "(" or ")"
//! ```
//!
//! Nesting (parentheses, `not`, unary signs, exponents) is limited to
//! [`MAX_DEPTH`] levels.  `and`/`or` chains are kept flat, so a long list of
//! terms costs no depth.
//!
//! Keywords are case-insensitive, column names are not.  Comparisons chain
//! (`1 < close < 5` means `1 < close and close < 5`).  Arithmetic takes
//! numbers, logic takes booleans and the whole expression must be boolean;
//! all of that is checked by [`parse`], before any data is seen.
//!
//! Parsing yields an `Expr<String>`; [`Expr::bind`] resolves column names
//! against a schema to an `Expr<usize>` that evaluates rows by index.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("type error: {0}")]
    Type(String),

    #[error("unknown column '{0}'")]
    UnknownColumn(String),
}

/// Deepest nesting [`parse`] accepts.
pub const MAX_DEPTH: usize = 128;

fn syntax(position: usize, message: impl Into<String>) -> ExprError {
    ExprError::Syntax {
        position,
        message: message.into(),
    }
}

// ─── AST ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

/// Expression tree, generic over how columns are referenced.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr<C = String> {
    Num(f64),
    Bool(bool),
    Column(C),
    Unary(UnaryOp, Box<Expr<C>>),
    Arith(ArithOp, Box<Expr<C>>, Box<Expr<C>>),
    /// `first op1 e1 op2 e2 ...`
    Compare(Box<Expr<C>>, Vec<(CmpOp, Expr<C>)>),
    /// Two or more operands joined by the same operator.
    Logic(LogicOp, Vec<Expr<C>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ty {
    Num,
    Bool,
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Num => f.write_str("a number"),
            Ty::Bool => f.write_str("true/false"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Num(f64),
    Bool(bool),
}

impl Value {
    fn as_num(self) -> f64 {
        match self {
            Value::Num(n) => n,
            Value::Bool(b) => f64::from(u8::from(b)),
        }
    }

    fn as_bool(self) -> bool {
        match self {
            Value::Bool(b) => b,
            Value::Num(n) => n != 0.0,
        }
    }
}

/// Parses and type-checks `src`.  The result is guaranteed to be boolean.
pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = lex(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    if *parser.peek() != Tok::End {
        return Err(syntax(
            parser.offset(),
            format!("unexpected {}", parser.peek()),
        ));
    }
    match expr.ty()? {
        Ty::Bool => Ok(expr),
        Ty::Num => Err(ExprError::Type(
            "condition must evaluate to true/false, found a number".into(),
        )),
    }
}

impl<C> Expr<C> {
    /// Static type, or the first mismatch found.
    pub fn ty(&self) -> Result<Ty, ExprError> {
        match self {
            Expr::Num(_) | Expr::Column(_) => Ok(Ty::Num),
            Expr::Bool(_) => Ok(Ty::Bool),
            Expr::Unary(op, inner) => {
                let (want, label) = match op {
                    UnaryOp::Neg => (Ty::Num, "unary '-'"),
                    UnaryOp::Pos => (Ty::Num, "unary '+'"),
                    UnaryOp::Not => (Ty::Bool, "'not'"),
                };
                expect(label, want, inner.ty()?)?;
                Ok(want)
            }
            Expr::Arith(op, lhs, rhs) => {
                let label = arith_symbol(*op);
                expect(label, Ty::Num, lhs.ty()?)?;
                expect(label, Ty::Num, rhs.ty()?)?;
                Ok(Ty::Num)
            }
            Expr::Compare(first, rest) => {
                let mut left = first.ty()?;
                for (op, rhs) in rest {
                    let right = rhs.ty()?;
                    match op {
                        CmpOp::Eq | CmpOp::Ne => {
                            if left != right {
                                return Err(ExprError::Type(format!(
                                    "'{}' compares {left} with {right}",
                                    cmp_symbol(*op)
                                )));
                            }
                        }
                        _ => {
                            expect(cmp_symbol(*op), Ty::Num, left)?;
                            expect(cmp_symbol(*op), Ty::Num, right)?;
                        }
                    }
                    left = right;
                }
                Ok(Ty::Bool)
            }
            Expr::Logic(op, operands) => {
                let label = match op {
                    LogicOp::And => "'and'",
                    LogicOp::Or => "'or'",
                };
                for operand in operands {
                    expect(label, Ty::Bool, operand.ty()?)?;
                }
                Ok(Ty::Bool)
            }
        }
    }

    fn try_map<D, F>(&self, f: &mut F) -> Result<Expr<D>, ExprError>
    where
        F: FnMut(&C) -> Result<D, ExprError>,
    {
        Ok(match self {
            Expr::Num(n) => Expr::Num(*n),
            Expr::Bool(b) => Expr::Bool(*b),
            Expr::Column(c) => Expr::Column(f(c)?),
            Expr::Unary(op, inner) => Expr::Unary(*op, Box::new(inner.try_map(f)?)),
            Expr::Arith(op, lhs, rhs) => {
                Expr::Arith(*op, Box::new(lhs.try_map(f)?), Box::new(rhs.try_map(f)?))
            }
            Expr::Compare(first, rest) => {
                let first = Box::new(first.try_map(f)?);
                let rest = rest
                    .iter()
                    .map(|(op, e)| Ok((*op, e.try_map(f)?)))
                    .collect::<Result<Vec<_>, ExprError>>()?;
                Expr::Compare(first, rest)
            }
            Expr::Logic(op, operands) => Expr::Logic(
                *op,
                operands
                    .iter()
                    .map(|e| e.try_map(f))
                    .collect::<Result<Vec<_>, ExprError>>()?,
            ),
        })
    }
}

fn expect(label: &str, want: Ty, got: Ty) -> Result<(), ExprError> {
    if want == got {
        Ok(())
    } else {
        Err(ExprError::Type(format!("{label} expects {want}, found {got}")))
    }
}

impl Expr<String> {
    /// Resolves every column name to its index in `columns`.
    pub fn bind(&self, columns: &[String]) -> Result<Expr<usize>, ExprError> {
        self.try_map(&mut |name: &String| {
            columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| ExprError::UnknownColumn(name.clone()))
        })
    }
}

impl Expr<usize> {
    pub fn eval(&self, row: &[f64]) -> Value {
        match self {
            Expr::Num(n) => Value::Num(*n),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Column(idx) => Value::Num(row.get(*idx).copied().unwrap_or(f64::NAN)),
            Expr::Unary(op, inner) => match op {
                UnaryOp::Neg => Value::Num(-inner.num(row)),
                UnaryOp::Pos => Value::Num(inner.num(row)),
                UnaryOp::Not => Value::Bool(!inner.truth(row)),
            },
            Expr::Arith(op, lhs, rhs) => {
                let (a, b) = (lhs.num(row), rhs.num(row));
                Value::Num(match op {
                    ArithOp::Add => a + b,
                    ArithOp::Sub => a - b,
                    ArithOp::Mul => a * b,
                    ArithOp::Div => a / b,
                    ArithOp::FloorDiv => (a / b).floor(),
                    ArithOp::Mod => a - b * (a / b).floor(),
                    ArithOp::Pow => a.powf(b),
                })
            }
            Expr::Compare(first, rest) => {
                let mut left = first.eval(row);
                for (op, rhs) in rest {
                    let right = rhs.eval(row);
                    let holds = match op {
                        CmpOp::Eq => left == right,
                        CmpOp::Ne => left != right,
                        CmpOp::Lt => left.as_num() < right.as_num(),
                        CmpOp::Le => left.as_num() <= right.as_num(),
                        CmpOp::Gt => left.as_num() > right.as_num(),
                        CmpOp::Ge => left.as_num() >= right.as_num(),
                    };
                    if !holds {
                        return Value::Bool(false);
                    }
                    left = right;
                }
                Value::Bool(true)
            }
            Expr::Logic(LogicOp::And, operands) => Value::Bool(operands.iter().all(|e| e.truth(row))),
            Expr::Logic(LogicOp::Or, operands) => Value::Bool(operands.iter().any(|e| e.truth(row))),
        }
    }

    #[inline]
    pub fn num(&self, row: &[f64]) -> f64 {
        self.eval(row).as_num()
    }

    #[inline]
    pub fn truth(&self, row: &[f64]) -> bool {
        self.eval(row).as_bool()
    }
}

fn arith_symbol(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "'+'",
        ArithOp::Sub => "'-'",
        ArithOp::Mul => "'*'",
        ArithOp::Div => "'/'",
        ArithOp::FloorDiv => "'//'",
        ArithOp::Mod => "'%'",
        ArithOp::Pow => "'**'",
    }
}

fn cmp_symbol(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Lt => "'<'",
        CmpOp::Le => "'<='",
        CmpOp::Gt => "'>'",
        CmpOp::Ge => "'>='",
        CmpOp::Eq => "'=='",
        CmpOp::Ne => "'!='",
    }
}

// ─── Lexer ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Ident(String),
    And,
    Or,
    Not,
    True,
    False,
    Sym(&'static str),
    LParen,
    RParen,
    End,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Num(n) => write!(f, "number {n}"),
            Tok::Ident(name) => write!(f, "'{name}'"),
            Tok::And => f.write_str("'and'"),
            Tok::Or => f.write_str("'or'"),
            Tok::Not => f.write_str("'not'"),
            Tok::True => f.write_str("'true'"),
            Tok::False => f.write_str("'false'"),
            Tok::Sym(s) => write!(f, "'{s}'"),
            Tok::LParen => f.write_str("'('"),
            Tok::RParen => f.write_str("')'"),
            Tok::End => f.write_str("end of input"),
        }
    }
}

fn lex(src: &str) -> Result<Vec<(usize, Tok)>, ExprError> {
    let b = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    while i < b.len() {
        let start = i;
        let next = b.get(i + 1).copied();
        let tok = match b[i] {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'0'..=b'9' | b'.' => {
                let (n, end) = lex_number(src, i)?;
                i = end;
                Tok::Num(n)
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                while i < b.len() && (b[i].is_ascii_alphanumeric() || b[i] == b'_') {
                    i += 1;
                }
                let word = &src[start..i];
                match word.to_ascii_lowercase().as_str() {
                    "and" => Tok::And,
                    "or" => Tok::Or,
                    "not" => Tok::Not,
                    "true" => Tok::True,
                    "false" => Tok::False,
                    _ => Tok::Ident(word.to_string()),
                }
            }
            c => {
                let (tok, width) = match (c, next) {
                    (b'(', _) => (Tok::LParen, 1),
                    (b')', _) => (Tok::RParen, 1),
                    (b'*', Some(b'*')) => (Tok::Sym("**"), 2),
                    (b'*', _) => (Tok::Sym("*"), 1),
                    (b'/', Some(b'/')) => (Tok::Sym("//"), 2),
                    (b'/', _) => (Tok::Sym("/"), 1),
                    (b'%', _) => (Tok::Sym("%"), 1),
                    (b'+', _) => (Tok::Sym("+"), 1),
                    (b'-', _) => (Tok::Sym("-"), 1),
                    (b'<', Some(b'=')) => (Tok::Sym("<="), 2),
                    (b'<', _) => (Tok::Sym("<"), 1),
                    (b'>', Some(b'=')) => (Tok::Sym(">="), 2),
                    (b'>', _) => (Tok::Sym(">"), 1),
                    (b'=', Some(b'=')) => (Tok::Sym("=="), 2),
                    (b'=', _) => return Err(syntax(i, "'=' is not a comparison, use '=='")),
                    (b'!', Some(b'=')) => (Tok::Sym("!="), 2),
                    (b'&', _) => (Tok::And, 1),
                    (b'|', _) => (Tok::Or, 1),
                    (b'~', _) => (Tok::Not, 1),
                    _ => {
                        let ch = src[i..].chars().next().unwrap_or('?');
                        return Err(syntax(i, format!("unexpected character '{ch}'")));
                    }
                };
                i += width;
                tok
            }
        };
        out.push((start, tok));
    }

    out.push((src.len(), Tok::End));
    Ok(out)
}

fn lex_number(src: &str, start: usize) -> Result<(f64, usize), ExprError> {
    let b = src.as_bytes();
    let digits = |mut i: usize| {
        while i < b.len() && (b[i].is_ascii_digit() || b[i] == b'_') {
            i += 1;
        }
        i
    };

    let mut i = digits(start);
    if b.get(i) == Some(&b'.') {
        i = digits(i + 1);
    }
    if matches!(b.get(i), Some(b'e' | b'E')) {
        let mut j = i + 1;
        if matches!(b.get(j), Some(b'+' | b'-')) {
            j += 1;
        }
        if b.get(j).is_some_and(u8::is_ascii_digit) {
            i = digits(j);
        }
    }

    let raw = &src[start..i];
    raw.replace('_', "")
        .parse::<f64>()
        .map(|n| (n, i))
        .map_err(|_| syntax(start, format!("invalid number '{raw}'")))
}

// ─── Parser ───────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(usize, Tok)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].1
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos].0
    }

    fn bump(&mut self) -> Tok {
        let tok = self.tokens[self.pos].1.clone();
        if tok != Tok::End {
            self.pos += 1;
        }
        tok
    }

    fn at_sym(&self, sym: &str) -> bool {
        matches!(self.peek(), Tok::Sym(s) if *s == sym)
    }

    /// Runs `f` one nesting level deeper.
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ExprError>,
    ) -> Result<T, ExprError> {
        if self.depth >= MAX_DEPTH {
            return Err(syntax(self.offset(), "expression nested too deeply"));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let first = self.and()?;
        self.chain(LogicOp::Or, Tok::Or, first, Self::and)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let first = self.not()?;
        self.chain(LogicOp::And, Tok::And, first, Self::not)
    }

    fn chain(
        &mut self,
        op: LogicOp,
        sep: Tok,
        first: Expr,
        operand: fn(&mut Self) -> Result<Expr, ExprError>,
    ) -> Result<Expr, ExprError> {
        if *self.peek() != sep {
            return Ok(first);
        }
        let mut operands = vec![first];
        while *self.peek() == sep {
            self.bump();
            operands.push(operand(self)?);
        }
        Ok(Expr::Logic(op, operands))
    }

    fn not(&mut self) -> Result<Expr, ExprError> {
        if *self.peek() == Tok::Not {
            self.bump();
            let inner = self.nested(Self::not)?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, ExprError> {
        let first = self.sum()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Sym("<") => CmpOp::Lt,
                Tok::Sym("<=") => CmpOp::Le,
                Tok::Sym(">") => CmpOp::Gt,
                Tok::Sym(">=") => CmpOp::Ge,
                Tok::Sym("==") => CmpOp::Eq,
                Tok::Sym("!=") => CmpOp::Ne,
                _ => break,
            };
            self.bump();
            rest.push((op, self.sum()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn sum(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Sym("+") => ArithOp::Add,
                Tok::Sym("-") => ArithOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.term()?;
            lhs = Expr::Arith(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Sym("*") => ArithOp::Mul,
                Tok::Sym("/") => ArithOp::Div,
                Tok::Sym("//") => ArithOp::FloorDiv,
                Tok::Sym("%") => ArithOp::Mod,
                _ => break,
            };
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::Arith(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        let op = match self.peek() {
            Tok::Sym("-") => UnaryOp::Neg,
            Tok::Sym("+") => UnaryOp::Pos,
            _ => return self.power(),
        };
        self.bump();
        let inner = self.nested(Self::unary)?;
        Ok(Expr::Unary(op, Box::new(inner)))
    }

    fn power(&mut self) -> Result<Expr, ExprError> {
        let base = self.atom()?;
        if self.at_sym("**") {
            self.bump();
            let exp = self.nested(Self::unary)?;
            return Ok(Expr::Arith(ArithOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, ExprError> {
        let at = self.offset();
        match self.bump() {
            Tok::Num(n) => Ok(Expr::Num(n)),
            Tok::True => Ok(Expr::Bool(true)),
            Tok::False => Ok(Expr::Bool(false)),
            Tok::Ident(name) => Ok(Expr::Column(name)),
            Tok::LParen => {
                let inner = self.nested(Self::or)?;
                if *self.peek() != Tok::RParen {
                    return Err(syntax(
                        self.offset(),
                        format!("expected ')', found {}", self.peek()),
                    ));
                }
                self.bump();
                Ok(inner)
            }
            other => Err(syntax(at, format!("expected a value, found {other}"))),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
