//! Position search over syntax trees.
//!
//! The search is written once against [`TreeAdapter`]; [`SyntaxTree`] adapts
//! tree-sitter trees. Diagnostic placement and fix generators both use it.

use crate::diagnostics::Region;
use std::ops::Range;
use tree_sitter::{Node, Tree};

/// Navigation capability the finder needs from a tree.
pub trait TreeAdapter {
    type Node: Copy;

    fn root(&self) -> Self::Node;
    fn span_of(&self, node: Self::Node) -> Range<usize>;
    fn category_of(&self, node: Self::Node) -> &str;
    fn children_of(&self, node: Self::Node) -> Vec<Self::Node>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindPolicy {
    /// The most deeply nested containing node of the category; on identical
    /// spans the last visited wins.
    Innermost,
    /// Starting at the smallest node enclosing the region, walk up through
    /// ancestors with exactly that span and return the first of the category.
    OutermostAtPosition,
}

fn contains(span: &Range<usize>, region: Region) -> bool {
    span.start <= region.offset && region.end() <= span.end
}

/// Find the node of `category` selected by `policy` for `region`.
pub fn find<A: TreeAdapter>(
    adapter: &A,
    region: Region,
    category: &str,
    policy: FindPolicy,
) -> Option<A::Node> {
    match policy {
        FindPolicy::Innermost => find_innermost(adapter, region, category),
        FindPolicy::OutermostAtPosition => find_outermost_at_position(adapter, region, category),
    }
}

fn find_innermost<A: TreeAdapter>(adapter: &A, region: Region, category: &str) -> Option<A::Node> {
    let root = adapter.root();
    if !contains(&adapter.span_of(root), region) {
        return None;
    }

    let mut best = None;
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if adapter.category_of(node) == category {
            best = Some(node);
        }
        // Children are pushed in reverse so they are visited in order.
        let children = adapter.children_of(node);
        stack.extend(
            children
                .into_iter()
                .rev()
                .filter(|child| contains(&adapter.span_of(*child), region)),
        );
    }
    best
}

fn find_outermost_at_position<A: TreeAdapter>(
    adapter: &A,
    region: Region,
    category: &str,
) -> Option<A::Node> {
    let root = adapter.root();
    if !contains(&adapter.span_of(root), region) {
        return None;
    }

    // Chain of containing nodes from the root down to the smallest one.
    let mut chain = vec![root];
    let mut current = root;
    loop {
        let next = adapter
            .children_of(current)
            .into_iter()
            .filter(|child| contains(&adapter.span_of(*child), region))
            .last();
        match next {
            Some(child) => {
                chain.push(child);
                current = child;
            }
            None => break,
        }
    }

    let enclosing = adapter.span_of(current);
    chain
        .into_iter()
        .rev()
        .take_while(|node| adapter.span_of(*node) == enclosing)
        .find(|node| adapter.category_of(*node) == category)
}

/// Tree-sitter tree adapter. Categories are node kinds.
pub struct SyntaxTree<'tree> {
    tree: &'tree Tree,
    named_only: bool,
}

impl<'tree> SyntaxTree<'tree> {
    pub fn new(tree: &'tree Tree) -> Self {
        Self {
            tree,
            named_only: false,
        }
    }

    /// Skip anonymous tokens (punctuation, keywords) while searching.
    pub fn named_only(mut self) -> Self {
        self.named_only = true;
        self
    }
}

impl<'tree> TreeAdapter for SyntaxTree<'tree> {
    type Node = Node<'tree>;

    fn root(&self) -> Node<'tree> {
        self.tree.root_node()
    }

    fn span_of(&self, node: Node<'tree>) -> Range<usize> {
        node.start_byte()..node.end_byte()
    }

    fn category_of(&self, node: Node<'tree>) -> &str {
        node.kind()
    }

    fn children_of(&self, node: Node<'tree>) -> Vec<Node<'tree>> {
        let mut cursor = node.walk();
        if self.named_only {
            node.named_children(&mut cursor).collect()
        } else {
            node.children(&mut cursor).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Arena tree: node 0 is the root.
    struct ArenaTree {
        nodes: Vec<(Range<usize>, &'static str, Vec<usize>)>,
    }

    impl TreeAdapter for ArenaTree {
        type Node = usize;

        fn root(&self) -> usize {
            0
        }

        fn span_of(&self, node: usize) -> Range<usize> {
            self.nodes[node].0.clone()
        }

        fn category_of(&self, node: usize) -> &str {
            self.nodes[node].1
        }

        fn children_of(&self, node: usize) -> Vec<usize> {
            self.nodes[node].2.clone()
        }
    }

    fn nested() -> ArenaTree {
        ArenaTree {
            nodes: vec![
                (0..100, "block", vec![1, 3]),
                (10..20, "block", vec![2]),
                (12..15, "name", vec![]),
                (50..60, "block", vec![]),
            ],
        }
    }

    #[test]
    fn innermost_prefers_nested_candidate() {
        let tree = nested();
        assert_eq!(
            find(&tree, Region::new(12, 3), "block", FindPolicy::Innermost),
            Some(1)
        );
        assert_eq!(
            find(&tree, Region::new(30, 2), "block", FindPolicy::Innermost),
            Some(0)
        );
    }

    #[test]
    fn innermost_descends_through_other_categories() {
        let tree = ArenaTree {
            nodes: vec![
                (0..100, "module", vec![1]),
                (0..50, "function", vec![2]),
                (5..20, "call", vec![]),
            ],
        };
        assert_eq!(
            find(&tree, Region::new(6, 2), "call", FindPolicy::Innermost),
            Some(2)
        );
        assert_eq!(
            find(&tree, Region::new(60, 2), "call", FindPolicy::Innermost),
            None
        );
    }

    #[test]
    fn identical_spans_last_visited_wins() {
        let tree = ArenaTree {
            nodes: vec![
                (0..10, "root", vec![1, 2]),
                (2..8, "expr", vec![]),
                (2..8, "expr", vec![]),
            ],
        };
        assert_eq!(
            find(&tree, Region::new(3, 1), "expr", FindPolicy::Innermost),
            Some(2)
        );
    }

    #[test]
    fn region_outside_root_is_none() {
        let tree = nested();
        assert_eq!(
            find(&tree, Region::new(99, 5), "block", FindPolicy::Innermost),
            None
        );
        assert_eq!(
            find(&tree, Region::new(99, 5), "block", FindPolicy::OutermostAtPosition),
            None
        );
    }

    #[test]
    fn outermost_at_position_walks_equal_spans_upward() {
        let tree = ArenaTree {
            nodes: vec![
                (0..40, "module", vec![1]),
                (10..20, "statement", vec![2]),
                (10..20, "expression", vec![3]),
                (10..20, "call", vec![]),
            ],
        };
        let region = Region::new(12, 2);
        assert_eq!(
            find(&tree, region, "expression", FindPolicy::OutermostAtPosition),
            Some(2)
        );
        assert_eq!(
            find(&tree, region, "statement", FindPolicy::OutermostAtPosition),
            Some(1)
        );
        // `module` is an ancestor, but its span is wider than the construct.
        assert_eq!(
            find(&tree, region, "module", FindPolicy::OutermostAtPosition),
            None
        );
    }

    #[test]
    fn named_only_skips_keyword_tokens() {
        let source = "module a::m;\nfun f() { abort 7 }\n";
        let tree = crate::parser::parse_source(source).unwrap();
        let start = source.find("abort").unwrap();
        let region = Region::new(start, "abort".len());

        let all = SyntaxTree::new(&tree);
        let keyword = find(&all, region, "abort", FindPolicy::Innermost).unwrap();
        assert_eq!(keyword.start_byte(), start);

        let named = SyntaxTree::new(&tree).named_only();
        assert!(find(&named, region, "abort", FindPolicy::Innermost).is_none());
        let expr = find(&named, region, "abort_expression", FindPolicy::Innermost).unwrap();
        assert_eq!(&source[expr.start_byte()..expr.end_byte()], "abort 7");
    }
}
