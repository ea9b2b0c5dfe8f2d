// SPDX-License-Identifier: GPL-3.0-or-later

//! The unified symbol model.
//!
//! Symbols are stored in an arena ([`SymbolTree`]) addressed by integer
//! [`SymbolId`]s. Parent links are plain indices into the same arena, which
//! keeps navigation cheap without aliased owning references, and makes the
//! whole tree serializable for the persistent cache.

use lsp_types::{Position, Range, SymbolKind};
use serde::{Deserialize, Serialize};

use crate::paths::FileLocation;

/// Index of a symbol within its [`SymbolTree`].
pub type SymbolId = usize;

/// A named code entity, or a synthetic File/Package node.
///
/// `children` and `parent` are indices into the tree the node belongs to.
/// A detached clone keeps those indices; they are only meaningful alongside
/// the originating tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolNode {
    /// Symbol name as reported by the server (or file/directory name).
    pub name: String,
    /// LSP symbol kind. Synthetic nodes use `File` and `Package`.
    pub kind: SymbolKind,
    /// Full extent of the symbol.
    pub range: Range,
    /// The sub-range identifying the symbol's name.
    #[serde(rename = "selectionRange")]
    pub selection_range: Range,
    /// Enriched location of the symbol.
    pub location: FileLocation,
    /// Source text of the symbol, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Child symbols, in server order.
    pub children: Vec<SymbolId>,
    /// Containing symbol, absent for roots.
    pub parent: Option<SymbolId>,
}

/// Arena of symbols with an ordered set of roots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolTree {
    nodes: Vec<SymbolNode>,
    roots: Vec<SymbolId>,
}

impl SymbolTree {
    /// An empty tree.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            roots: Vec::new(),
        }
    }

    /// Number of symbols in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the tree holds no symbols.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a node and returns its id. The node's `children`/`parent`
    /// indices must already refer to this tree.
    pub fn push(&mut self, node: SymbolNode) -> SymbolId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Marks an existing node as a root.
    pub fn add_root(&mut self, id: SymbolId) {
        self.roots.push(id);
    }

    /// Borrow a node by id.
    #[must_use]
    pub fn get(&self, id: SymbolId) -> Option<&SymbolNode> {
        self.nodes.get(id)
    }

    /// Mutably borrow a node by id.
    pub fn get_mut(&mut self, id: SymbolId) -> Option<&mut SymbolNode> {
        self.nodes.get_mut(id)
    }

    /// Ids of the root symbols, in order.
    #[must_use]
    pub fn root_ids(&self) -> &[SymbolId] {
        &self.roots
    }

    /// The root symbols, in order.
    pub fn roots(&self) -> impl Iterator<Item = &SymbolNode> {
        self.roots.iter().filter_map(|&id| self.nodes.get(id))
    }

    /// Children of a node, in order.
    pub fn children(&self, id: SymbolId) -> impl Iterator<Item = &SymbolNode> {
        self.nodes
            .get(id)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|&c| self.nodes.get(c))
    }

    /// The parent of a node, if any.
    #[must_use]
    pub fn parent(&self, id: SymbolId) -> Option<&SymbolNode> {
        self.nodes.get(id)?.parent.and_then(|p| self.nodes.get(p))
    }

    /// Pre-order (depth-first) traversal of all roots and descendants.
    #[must_use]
    pub fn flat(&self) -> Vec<SymbolId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<SymbolId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(node) = self.nodes.get(id) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    /// Pre-order traversal as node references.
    #[must_use]
    pub fn flat_symbols(&self) -> Vec<&SymbolNode> {
        self.flat()
            .into_iter()
            .filter_map(|id| self.nodes.get(id))
            .collect()
    }

    /// Copies `other` into this tree beneath `parent`, returning the new
    /// ids of `other`'s roots. All internal indices are remapped.
    pub fn graft(&mut self, other: &Self, parent: Option<SymbolId>) -> Vec<SymbolId> {
        let offset = self.nodes.len();
        for node in &other.nodes {
            let mut copied = node.clone();
            copied.children = copied.children.iter().map(|c| c + offset).collect();
            copied.parent = copied.parent.map(|p| p + offset);
            self.nodes.push(copied);
        }
        let new_roots: Vec<SymbolId> = other.roots.iter().map(|r| r + offset).collect();
        if let Some(parent_id) = parent {
            for &root in &new_roots {
                if let Some(node) = self.nodes.get_mut(root) {
                    node.parent = Some(parent_id);
                }
            }
            if let Some(parent_node) = self.nodes.get_mut(parent_id) {
                parent_node.children.extend(new_roots.iter().copied());
            }
        }
        new_roots
    }
}

/// A symbol that references another symbol, together with the location of
/// the reference inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceInSymbol {
    /// The referencing symbol.
    pub symbol: SymbolNode,
    /// Zero-based line of the reference.
    pub line: u32,
    /// Zero-based column of the reference.
    pub character: u32,
}

/// Symbol kinds that can act as containers for position queries.
/// One-line candidates are discarded so that import statements (which many
/// servers report as single-line symbols of these kinds) never win.
const CONTAINER_KINDS: [SymbolKind; 4] = [
    SymbolKind::METHOD,
    SymbolKind::FUNCTION,
    SymbolKind::CLASS,
    SymbolKind::VARIABLE,
];

/// Whether `(line, column)` falls inside `range` under the given
/// strictness. In strict mode the position must lie strictly past the
/// range start, which lets callers find the parent of a symbol by probing
/// the symbol's own start.
#[must_use]
pub fn position_in_range(range: &Range, line: u32, column: Option<u32>, strict: bool) -> bool {
    let start = range.start;
    let end = range.end;

    let line_ok = if strict {
        line > start.line && line <= end.line
    } else {
        line >= start.line && line <= end.line
    };
    if !line_ok {
        return false;
    }

    match column {
        Some(col) if line == start.line => {
            if strict {
                col > start.character
            } else {
                col >= start.character
            }
        }
        _ => true,
    }
}

/// Selects the innermost container symbol for a position out of `symbols`.
///
/// Candidates are Method/Function/Class/Variable symbols spanning more than
/// one line. Among candidates containing the position, the one starting on
/// the greatest line wins.
#[must_use]
pub fn select_containing<'a>(
    symbols: &[&'a SymbolNode],
    line: u32,
    column: Option<u32>,
    strict: bool,
) -> Option<&'a SymbolNode> {
    symbols
        .iter()
        .filter(|s| CONTAINER_KINDS.contains(&s.kind))
        .filter(|s| s.location.range.start.line != s.location.range.end.line)
        .filter(|s| position_in_range(&s.location.range, line, column, strict))
        .max_by_key(|s| s.location.range.start.line)
        .copied()
}

/// Extracts the source text of `range` from file contents, with the first
/// line's leading `range.start.character` characters stripped.
#[must_use]
pub fn extract_body(contents: &str, range: &Range) -> String {
    let lines: Vec<&str> = contents.split('\n').collect();
    let start_line = range.start.line as usize;
    let end_line = (range.end.line as usize).min(lines.len().saturating_sub(1));
    if start_line >= lines.len() {
        return String::new();
    }
    let body = lines[start_line..=end_line].join("\n");
    let indent = range.start.character as usize;
    body.char_indices()
        .nth(indent)
        .map_or(String::new(), |(offset, _)| body[offset..].to_string())
}

/// The range covering an entire file: `(0,0)` to
/// `(line count, length of the last line)`.
#[must_use]
pub fn full_file_range(contents: &str) -> Range {
    let lines: Vec<&str> = contents.split('\n').collect();
    let end_line = u32::try_from(lines.len()).unwrap_or(u32::MAX);
    let end_character = lines
        .last()
        .map_or(0, |l| u32::try_from(l.chars().count()).unwrap_or(u32::MAX));
    Range::new(Position::new(0, 0), Position::new(end_line, end_character))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::UriPathMapper;
    use std::path::PathBuf;

    fn node(name: &str, kind: SymbolKind, start: (u32, u32), end: (u32, u32)) -> SymbolNode {
        let range = Range::new(
            Position::new(start.0, start.1),
            Position::new(end.0, end.1),
        );
        let mapper = UriPathMapper::new(PathBuf::from("/repo"));
        SymbolNode {
            name: name.to_string(),
            kind,
            range,
            selection_range: range,
            location: mapper.location_for_relative("m.py", range),
            body: None,
            children: Vec::new(),
            parent: None,
        }
    }

    fn sample_tree() -> SymbolTree {
        // class C (0..5) { def m (1..3) }, def f (6..8)
        let mut tree = SymbolTree::new();
        let c = tree.push(node("C", SymbolKind::CLASS, (0, 0), (5, 0)));
        let m = tree.push(node("m", SymbolKind::METHOD, (1, 4), (3, 0)));
        let f = tree.push(node("f", SymbolKind::FUNCTION, (6, 0), (8, 0)));
        if let Some(class_node) = tree.get_mut(c) {
            class_node.children.push(m);
        }
        if let Some(method_node) = tree.get_mut(m) {
            method_node.parent = Some(c);
        }
        tree.add_root(c);
        tree.add_root(f);
        tree
    }

    #[test]
    fn flat_is_preorder() {
        let tree = sample_tree();
        let names: Vec<&str> = tree
            .flat_symbols()
            .into_iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(names, vec!["C", "m", "f"]);
    }

    #[test]
    fn graft_remaps_indices_and_sets_parent() {
        let mut target = SymbolTree::new();
        let pkg = target.push(node("pkg", SymbolKind::PACKAGE, (0, 0), (0, 0)));
        target.add_root(pkg);

        let file_tree = sample_tree();
        let new_roots = target.graft(&file_tree, Some(pkg));
        assert_eq!(new_roots.len(), 2);

        let class_node = target.get(new_roots[0]).map(|n| n.name.as_str());
        assert_eq!(class_node, Some("C"));
        assert_eq!(
            target.parent(new_roots[0]).map(|n| n.name.as_str()),
            Some("pkg")
        );

        // The method keeps its link to the class through the remap.
        let method_id = target
            .get(new_roots[0])
            .and_then(|n| n.children.first().copied());
        let method_parent =
            method_id.and_then(|id| target.parent(id).map(|n| n.name.as_str()));
        assert_eq!(method_parent, Some("C"));

        let names: Vec<&str> = target
            .flat_symbols()
            .into_iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(names, vec!["pkg", "C", "m", "f"]);
    }

    #[test]
    fn containing_picks_innermost() {
        let tree = sample_tree();
        let symbols = tree.flat_symbols();
        let hit = select_containing(&symbols, 2, Some(0), false);
        assert_eq!(hit.map(|s| s.name.as_str()), Some("m"));
    }

    #[test]
    fn containing_strict_skips_symbol_start() {
        let tree = sample_tree();
        let symbols = tree.flat_symbols();
        // Non-strict at the class header line returns the class itself.
        let loose = select_containing(&symbols, 0, Some(4), false);
        assert_eq!(loose.map(|s| s.name.as_str()), Some("C"));
        // Strict at the same position climbs out of the class.
        let strict = select_containing(&symbols, 0, Some(4), true);
        assert!(strict.is_none());
    }

    #[test]
    fn containing_ignores_one_liners_and_foreign_kinds() {
        let mut tree = sample_tree();
        let import = tree.push(node("os", SymbolKind::VARIABLE, (0, 0), (0, 9)));
        tree.add_root(import);
        let ns = tree.push(node("N", SymbolKind::NAMESPACE, (0, 0), (9, 0)));
        tree.add_root(ns);

        let symbols = tree.flat_symbols();
        let hit = select_containing(&symbols, 4, Some(0), false);
        // Neither the one-line variable nor the namespace may win.
        assert_eq!(hit.map(|s| s.name.as_str()), Some("C"));
    }

    #[test]
    fn body_extraction_strips_leading_indent() {
        let contents = "class C:\n    def m(self):\n        pass\n";
        let range = Range::new(Position::new(1, 4), Position::new(2, 12));
        assert_eq!(extract_body(contents, &range), "def m(self):\n        pass");
    }

    #[test]
    fn file_range_spans_line_count_and_last_line() {
        let range = full_file_range("a\nbb\n");
        assert_eq!(range.start, Position::new(0, 0));
        // "a\nbb\n" splits into ["a", "bb", ""]: three lines, empty last.
        assert_eq!(range.end, Position::new(3, 0));
    }

    #[test]
    fn position_in_range_column_rules() {
        let range = Range::new(Position::new(2, 4), Position::new(5, 0));
        assert!(position_in_range(&range, 2, Some(4), false));
        assert!(!position_in_range(&range, 2, Some(3), false));
        assert!(!position_in_range(&range, 2, Some(4), true));
        assert!(position_in_range(&range, 3, Some(0), false));
        assert!(position_in_range(&range, 3, Some(0), true));
        assert!(!position_in_range(&range, 6, None, false));
    }
}
