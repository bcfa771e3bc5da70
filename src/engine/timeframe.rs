//! Collects the historical resolutions a rule tree depends on.

use std::collections::BTreeSet;

use crate::models::{Group, Node, Timeframe};

/// Distinct timeframe tags of every condition under `group`.  Untagged
/// conditions contribute nothing.
pub fn extract_timeframes(group: &Group) -> BTreeSet<Timeframe> {
    let mut out = BTreeSet::new();
    for child in &group.children {
        collect(child, &mut out);
    }
    out
}

fn collect(node: &Node, out: &mut BTreeSet<Timeframe>) {
    match node {
        Node::Condition(c) => out.extend(c.timeframe),
        Node::Group(g) => g.children.iter().for_each(|child| collect(child, out)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_tree_needs_nothing() {
        let tree = Group::and(vec![
            Node::condition("close > 1"),
            Group::or(vec![Node::condition("volume > 1")]).into(),
        ]);
        assert!(extract_timeframes(&tree).is_empty());
        assert!(extract_timeframes(&Group::default()).is_empty());
    }

    #[test]
    fn collects_distinct_tags_at_any_depth() {
        let tree = Group::and(vec![
            Node::condition_on(Timeframe::Minute5, "close > open"),
            Group::or(vec![
                Node::condition_on(Timeframe::Day, "close > 1"),
                Node::condition_on(Timeframe::Minute5, "volume > 1"),
                Node::condition("amount > 1"),
            ])
            .into(),
        ]);

        let found: Vec<_> = extract_timeframes(&tree).into_iter().collect();
        assert_eq!(found, vec![Timeframe::Minute5, Timeframe::Day]);
    }
}
