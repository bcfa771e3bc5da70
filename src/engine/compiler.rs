//! # engine::compiler
//!
//! Turns a rule tree into something that can filter a [`Frame`].
//!
//! ## Rendering
//!
//! * Condition → `"(value)"` after the value passes the sanitizer.  Blank
//!   conditions render as `""`, ones longer than [`MAX_CONDITION_LEN`]
//!   characters are rejected.
//! * Group → children rendered, empty renders dropped, the rest joined with
//!   `" AND "` / `" OR "` and wrapped in parentheses.  No children left → `""`.
//!
//! An absent root, or one that renders to `""`, compiles to
//! [`Predicate::PassAll`].  Anything else is parsed and type-checked once by
//! [`expr::parse`], then bound to each frame's columns before its rows are read,
//! so a bad column name fails the whole call and never yields partial output.
//!
//! [`CompiledTree`] keeps the tree shape instead of flattening it, so each
//! condition can be evaluated against data of its own timeframe.

use thiserror::Error;

use crate::engine::expr::{self, Expr, ExprError};
use crate::engine::sanitizer::{self, SanitizeError};
use crate::models::{Frame, Group, Node, Operator, Timeframe};

/// Longest condition text, in characters, a rule may contain.
pub const MAX_CONDITION_LEN: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleErrorKind {
    #[error("condition is {0} characters long, the limit is {max}", max = MAX_CONDITION_LEN)]
    TooLong(usize),

    #[error(transparent)]
    Sanitize(#[from] SanitizeError),

    #[error(transparent)]
    Expr(#[from] ExprError),
}

/// A rule that can never be evaluated.  Fatal for a scan.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid rule '{expression}': {kind}")]
pub struct RuleError {
    pub expression: String,
    pub kind: RuleErrorKind,
}

impl RuleError {
    fn new(expression: &str, kind: impl Into<RuleErrorKind>) -> Self {
        Self {
            expression: expression.to_string(),
            kind: kind.into(),
        }
    }
}

// ─── Rendering ────────────────────────────────────────────────────────────────

/// Renders `group` to a single infix expression, sanitizing every condition.
pub fn render(group: &Group) -> Result<String, RuleError> {
    let mut parts = Vec::with_capacity(group.children.len());
    for child in &group.children {
        let text = match child {
            Node::Condition(c) => render_condition(&c.value)?,
            Node::Group(g) => render(g)?,
        };
        if !text.is_empty() {
            parts.push(text);
        }
    }

    if parts.is_empty() {
        return Ok(String::new());
    }
    let joiner = format!(" {} ", group.operator.keyword());
    Ok(format!("({})", parts.join(&joiner)))
}

fn render_condition(value: &str) -> Result<String, RuleError> {
    let text = value.trim();
    if text.is_empty() {
        return Ok(String::new());
    }
    let length = text.chars().count();
    if length > MAX_CONDITION_LEN {
        let head: String = text.chars().take(40).collect();
        return Err(RuleError::new(&format!("{head}..."), RuleErrorKind::TooLong(length)));
    }
    sanitizer::check(text).map_err(|e| RuleError::new(text, e))?;
    Ok(format!("({text})"))
}

// ─── Predicate ────────────────────────────────────────────────────────────────

/// A compiled row filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Keeps every row.
    PassAll,
    Expr { text: String, expr: Expr },
}

impl Predicate {
    pub fn compile(root: Option<&Group>) -> Result<Self, RuleError> {
        let Some(root) = root else {
            return Ok(Predicate::PassAll);
        };
        let text = render(root)?;
        if text.is_empty() {
            return Ok(Predicate::PassAll);
        }
        let expr = expr::parse(&text).map_err(|e| RuleError::new(&text, e))?;
        Ok(Predicate::Expr { text, expr })
    }

    /// The rows of `frame` the predicate accepts, in their original order.
    pub fn apply(&self, frame: &Frame) -> Result<Frame, RuleError> {
        match self {
            Predicate::PassAll => Ok(frame.clone()),
            Predicate::Expr { text, expr } => {
                let bound = expr
                    .bind(frame.columns())
                    .map_err(|e| RuleError::new(text, e))?;
                Ok(frame.filter(|row| bound.truth(&row.values)))
            }
        }
    }

    /// Rendered expression, `None` for [`Predicate::PassAll`].
    pub fn expression(&self) -> Option<&str> {
        match self {
            Predicate::PassAll => None,
            Predicate::Expr { text, .. } => Some(text),
        }
    }
}

pub fn compile(root: Option<&Group>) -> Result<Predicate, RuleError> {
    Predicate::compile(root)
}

/// Compiles `root` and applies it to `frame` in one go.
pub fn apply(frame: &Frame, root: Option<&Group>) -> Result<Frame, RuleError> {
    compile(root)?.apply(frame)
}

// ─── Per-timeframe evaluation ─────────────────────────────────────────────────

/// Column names plus one row of values.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    pub columns: &'a [String],
    pub values: &'a [f64],
}

#[derive(Debug, Clone, PartialEq)]
enum CompiledNode {
    Condition {
        timeframe: Option<Timeframe>,
        text: String,
        expr: Expr,
    },
    Group {
        operator: Operator,
        children: Vec<CompiledNode>,
    },
}

/// A rule tree whose conditions were compiled one by one, keeping their
/// timeframe tags.  Blank conditions and empty groups are pruned.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledTree {
    root: Option<CompiledNode>,
}

impl CompiledTree {
    pub fn compile(root: Option<&Group>) -> Result<Self, RuleError> {
        Ok(Self {
            root: match root {
                Some(group) => compile_group(group)?,
                None => None,
            },
        })
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Evaluates the tree, reading each condition's row from `lookup` by its
    /// timeframe (`None` = snapshot).  A condition without data is false.
    pub fn evaluate<'a, F>(&self, lookup: F) -> Result<bool, RuleError>
    where
        F: Fn(Option<Timeframe>) -> Option<RowView<'a>>,
    {
        match &self.root {
            None => Ok(true),
            Some(node) => eval_node(node, &lookup),
        }
    }
}

fn compile_group(group: &Group) -> Result<Option<CompiledNode>, RuleError> {
    let mut children = Vec::with_capacity(group.children.len());
    for child in &group.children {
        let compiled = match child {
            Node::Group(g) => compile_group(g)?,
            Node::Condition(c) => {
                let text = render_condition(&c.value)?;
                if text.is_empty() {
                    None
                } else {
                    let expr = expr::parse(&text).map_err(|e| RuleError::new(&text, e))?;
                    Some(CompiledNode::Condition {
                        timeframe: c.timeframe,
                        text,
                        expr,
                    })
                }
            }
        };
        children.extend(compiled);
    }

    if children.is_empty() {
        return Ok(None);
    }
    Ok(Some(CompiledNode::Group {
        operator: group.operator,
        children,
    }))
}

fn eval_node<'a, F>(node: &CompiledNode, lookup: &F) -> Result<bool, RuleError>
where
    F: Fn(Option<Timeframe>) -> Option<RowView<'a>>,
{
    match node {
        CompiledNode::Condition {
            timeframe,
            text,
            expr,
        } => {
            let Some(view) = lookup(*timeframe) else {
                return Ok(false);
            };
            let bound = expr
                .bind(view.columns)
                .map_err(|e| RuleError::new(text, e))?;
            Ok(bound.truth(view.values))
        }
        CompiledNode::Group { operator, children } => {
            for child in children {
                let hit = eval_node(child, lookup)?;
                match operator {
                    Operator::And if !hit => return Ok(false),
                    Operator::Or if hit => return Ok(true),
                    _ => {}
                }
            }
            Ok(*operator == Operator::And)
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
