//! # models::rule
//!
//! The boolean filter tree a strategy scans with.  Leaves are [`Condition`]s
//! (an expression over data columns, optionally tagged with a [`Timeframe`]);
//! interior nodes are [`Group`]s combining their children with AND / OR.
//!
//! ```json
//! { "type": "group", "operator": "AND", "children": [
//!     { "type": "condition", "value": "amount > 100000" },
//!     { "type": "group", "operator": "OR", "children": [
//!         { "type": "condition", "value": "close > open", "timeframe": "minute5" },
//!         { "type": "condition", "value": "volume > 10" } ] } ] }
//! ```
//!
//! The tree is an owned recursive enum, so it is finite and acyclic by
//! construction.  An empty [`Group`] means "no constraint".

use serde::{Deserialize, Deserializer, Serialize};

use crate::models::market::Timeframe;

// ─── Operator ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Operator {
    #[default]
    #[serde(rename = "AND", alias = "and", alias = "And")]
    And,
    #[serde(rename = "OR", alias = "or", alias = "Or")]
    Or,
}

impl Operator {
    /// Keyword used when a group is rendered to text.
    pub fn keyword(&self) -> &'static str {
        match self {
            Operator::And => "AND",
            Operator::Or => "OR",
        }
    }
}

// ─── Nodes ────────────────────────────────────────────────────────────────────

/// A single boolean expression, e.g. `close > open * 1.02`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub value: String,

    /// Historical resolution the referenced columns come from.  `None` means
    /// the current snapshot.  The dashboard sends `""` for "none".
    #[serde(
        default,
        deserialize_with = "blank_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeframe: Option<Timeframe>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Node {
    Condition(Condition),
    Group(Group),
}

#[cfg(test)]
impl Condition {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            timeframe: None,
        }
    }

    pub fn on(timeframe: Timeframe, value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            timeframe: Some(timeframe),
        }
    }
}

impl Group {
    pub fn new(operator: Operator, children: Vec<Node>) -> Self {
        Self { operator, children }
    }

    pub fn and(children: Vec<Node>) -> Self {
        Self::new(Operator::And, children)
    }
}

#[cfg(test)]
impl Group {
    pub fn or(children: Vec<Node>) -> Self {
        Self::new(Operator::Or, children)
    }
}

#[cfg(test)]
impl Node {
    pub fn condition(value: impl Into<String>) -> Self {
        Node::Condition(Condition::new(value))
    }

    pub fn condition_on(timeframe: Timeframe, value: impl Into<String>) -> Self {
        Node::Condition(Condition::on(timeframe, value))
    }
}

impl From<Condition> for Node {
    fn from(c: Condition) -> Self {
        Node::Condition(c)
    }
}

impl From<Group> for Node {
    fn from(g: Group) -> Self {
        Node::Group(g)
    }
}

// ─── Root groups ──────────────────────────────────────────────────────────────

/// (De)serializers for the `first_scan` / `second_scan` roots.
///
/// Roots are written as tagged group nodes so stored blobs round-trip through
/// the dashboard unchanged.  On input a root may be a tagged group, an
/// untagged group object, or a lone condition (wrapped into an AND group).
pub(crate) mod root {
    use super::*;
    use serde::de::Error as _;

    pub fn serialize<S>(group: &Option<Group>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        group
            .as_ref()
            .map(|g| Node::Group(g.clone()))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Group>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(value) = Option::<serde_json::Value>::deserialize(deserializer)? else {
            return Ok(None);
        };
        if value.get("type").is_none() {
            return serde_json::from_value::<Group>(value)
                .map(Some)
                .map_err(D::Error::custom);
        }
        match serde_json::from_value::<Node>(value).map_err(D::Error::custom)? {
            Node::Group(g) => Ok(Some(g)),
            Node::Condition(c) => Ok(Some(Group::and(vec![Node::Condition(c)]))),
        }
    }
}

fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<Timeframe>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(id) => id.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
