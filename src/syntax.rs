//! Syntactic helpers over tree-sitter Go nodes.
//!
//! The analysis passes identify mutexes by the *textual* form of the
//! expression they are locked through (`s.mu`, `b.m`, ...). This module
//! provides the small vocabulary everything else is built from:
//! rendering an expression to its selector string, splitting a selector at
//! the first dot, extracting the call from a statement, and recognizing
//! `x.Lock()` / `x.Unlock()` style calls including the deferred-closure
//! release form `defer func() { ... x.Unlock() ... }()`.

use phf::{phf_set, Set};
use tree_sitter::Node;

/// Method names that acquire a mutex.
pub static LOCK_METHODS: Set<&'static str> = phf_set! {"Lock", "RLock"};

/// Method names that release a mutex.
pub static UNLOCK_METHODS: Set<&'static str> = phf_set! {"Unlock", "RUnlock"};

/// Source position of a node, cheap to copy and hash.
///
/// `file` indexes into the owning package's file list; `byte` makes the
/// position unique within the file and is the deduplication key for findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pos {
    pub file: usize,
    pub byte: usize,
    pub line: usize,
    pub column: usize,
}

impl Pos {
    /// Position of a node within the file at `file`.
    #[must_use]
    pub fn of(file: usize, node: Node) -> Self {
        let point = node.start_position();
        Pos {
            file,
            byte: node.start_byte(),
            line: point.row + 1,
            column: point.column + 1,
        }
    }
}

/// Decode the source text of a node, replacing invalid UTF-8 with nothing.
#[inline]
#[must_use]
pub fn text<'s>(node: Node, source: &'s [u8]) -> &'s str {
    std::str::from_utf8(&source[node.start_byte()..node.end_byte()]).unwrap_or("")
}

/// Canonical textual form of an expression, used as selector identity.
#[must_use]
pub fn render(node: Node, source: &[u8]) -> String {
    text(node, source).to_string()
}

/// Split a selector string at the first dot.
///
/// `"w.m"` becomes `("w", "m")`, `"a.b.c"` becomes `("a", "b.c")`, and a
/// bare identifier splits to `(id, "")`.
#[must_use]
pub fn split_selector(selector: &str) -> (&str, &str) {
    match selector.find('.') {
        Some(i) => (&selector[..i], &selector[i + 1..]),
        None => (selector, ""),
    }
}

/// Extract the call expression embedded in a statement, if any.
///
/// Handles a bare `call_expression`, an expression statement, and an
/// assignment or short variable declaration whose right-hand side contains
/// a call (`v := foo()`, `v = foo()`).
#[must_use]
pub fn call_of(node: Node) -> Option<Node> {
    match node.kind() {
        "call_expression" => Some(node),
        "expression_statement" => {
            let inner = node.named_child(0)?;
            (inner.kind() == "call_expression").then_some(inner)
        }
        "assignment_statement" | "short_var_declaration" => {
            let rhs = node.child_by_field_name("right")?;
            let mut cursor = rhs.walk();
            let found = rhs
                .named_children(&mut cursor)
                .find(|c| c.kind() == "call_expression");
            found
        }
        _ => None,
    }
}

/// The `selector_expression` callee of a call, if the call is a method or
/// field call (`x.M(...)`).
#[must_use]
pub fn callee_selector(call: Node) -> Option<Node> {
    let callee = call.child_by_field_name("function")?;
    (callee.kind() == "selector_expression").then_some(callee)
}

/// If the node is a call to one of the named methods, return the receiver
/// expression: for `m.Lock()` with `names = {Lock}`, the expression `m`.
///
/// Accepts a bare call or an expression statement wrapping one.
#[must_use]
pub fn subject_of_named_call<'t>(
    node: Node<'t>,
    names: &Set<&'static str>,
    source: &[u8],
) -> Option<Node<'t>> {
    let call = match node.kind() {
        "call_expression" => node,
        "expression_statement" => {
            let inner = node.named_child(0)?;
            if inner.kind() != "call_expression" {
                return None;
            }
            inner
        }
        _ => return None,
    };

    let selector = callee_selector(call)?;
    let method = selector.child_by_field_name("field")?;
    if names.contains(text(method, source)) {
        selector.child_by_field_name("operand")
    } else {
        None
    }
}

/// Descend the left spine of a selector expression to its base identifier.
///
/// For the callee of `a.b.c.M()` this returns the `a` identifier node.
#[must_use]
pub fn root_of(selector: Node) -> Option<Node> {
    let mut node = selector;
    loop {
        match node.kind() {
            "selector_expression" => node = node.child_by_field_name("operand")?,
            "identifier" => return Some(node),
            _ => return None,
        }
    }
}

/// The call expression deferred by a `defer` statement.
#[must_use]
pub fn defer_call(stmt: Node) -> Option<Node> {
    if stmt.kind() != "defer_statement" {
        return None;
    }
    let call = stmt.named_child(0)?;
    (call.kind() == "call_expression").then_some(call)
}

/// Subject of a deferred mutex release.
///
/// Recognizes both `defer x.Unlock()` and a deferred closure that releases
/// in its body, `defer func() { x.Unlock(); ... }()`. Only top-level
/// statements of the closure body are inspected.
#[must_use]
pub fn defer_release_subject<'t>(stmt: Node<'t>, source: &[u8]) -> Option<Node<'t>> {
    let call = defer_call(stmt)?;

    if let Some(subject) = subject_of_named_call(call, &UNLOCK_METHODS, source) {
        return Some(subject);
    }

    let callee = call.child_by_field_name("function")?;
    if callee.kind() != "func_literal" {
        return None;
    }
    let body = callee.child_by_field_name("body")?;
    for inner in block_statements(body) {
        if let Some(subject) = subject_of_named_call(inner, &UNLOCK_METHODS, source) {
            return Some(subject);
        }
    }
    None
}

/// Statically known boolean value of an expression, if it is a literal.
#[must_use]
pub fn bool_literal(node: Node, source: &[u8]) -> Option<bool> {
    match node.kind() {
        "true" => Some(true),
        "false" => Some(false),
        // Some grammar versions surface the predeclared constants as plain
        // identifiers.
        "identifier" => match text(node, source) {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Argument expressions of a call, in order.
#[must_use]
pub fn call_args<'t>(call: Node<'t>) -> Vec<Node<'t>> {
    let Some(args) = call.child_by_field_name("arguments") else {
        return Vec::new();
    };
    let mut cursor = args.walk();
    args.named_children(&mut cursor)
        .filter(|c| c.kind() != "comment")
        .collect()
}

/// Statements of a block (or any node whose named children are statements),
/// with comments filtered out.
#[must_use]
pub fn block_statements<'t>(block: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = block.walk();
    block
        .named_children(&mut cursor)
        .filter(|c| c.kind() != "comment")
        .collect()
}

/// Body statements of a switch/select case clause.
///
/// Case values (and the communication clause of a select case) are field
/// children; the body statements are the fieldless named children.
#[must_use]
pub fn case_body<'t>(case: Node<'t>) -> Vec<Node<'t>> {
    let mut out = Vec::new();
    let mut cursor = case.walk();
    if cursor.goto_first_child() {
        loop {
            let node = cursor.node();
            if node.is_named() && cursor.field_name().is_none() && node.kind() != "comment" {
                out.push(node);
            }
            if !cursor.goto_next_sibling() {
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tree_sitter::{Parser, Tree};

    fn parse_go(source: &str) -> Tree {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_go::LANGUAGE.into())
            .unwrap();
        parser.parse(source, None).unwrap()
    }

    /// First statement of the first function body in the source.
    fn first_stmt(tree: &Tree) -> Node<'_> {
        let root = tree.root_node();
        let mut cursor = root.walk();
        let func = root
            .named_children(&mut cursor)
            .find(|c| c.kind() == "function_declaration" || c.kind() == "method_declaration")
            .expect("function in source");
        let body = func.child_by_field_name("body").unwrap();
        block_statements(body)[0]
    }

    #[test]
    fn split_selector_at_first_dot() {
        assert_eq!(split_selector("w.m"), ("w", "m"));
        assert_eq!(split_selector("a.b.c"), ("a", "b.c"));
        assert_eq!(split_selector("mu"), ("mu", ""));
    }

    #[test]
    fn subject_of_lock_call() {
        let src = "package p\nfunc f() {\n\ts.mu.Lock()\n}\n";
        let tree = parse_go(src);
        let stmt = first_stmt(&tree);
        let subject = subject_of_named_call(stmt, &LOCK_METHODS, src.as_bytes()).unwrap();
        assert_eq!(render(subject, src.as_bytes()), "s.mu");
    }

    #[test]
    fn subject_ignores_other_methods() {
        let src = "package p\nfunc f() {\n\ts.mu.TryLock()\n}\n";
        let tree = parse_go(src);
        let stmt = first_stmt(&tree);
        assert!(subject_of_named_call(stmt, &LOCK_METHODS, src.as_bytes()).is_none());
    }

    #[test]
    fn call_of_assignment_rhs() {
        let src = "package p\nfunc f() {\n\tv := s.isGood()\n}\n";
        let tree = parse_go(src);
        let stmt = first_stmt(&tree);
        let call = call_of(stmt).unwrap();
        assert_eq!(call.kind(), "call_expression");
    }

    #[test]
    fn root_of_selector_chain() {
        let src = "package p\nfunc f() {\n\ta.b.c.M()\n}\n";
        let tree = parse_go(src);
        let stmt = first_stmt(&tree);
        let call = call_of(stmt).unwrap();
        let selector = callee_selector(call).unwrap();
        let root = root_of(selector).unwrap();
        assert_eq!(render(root, src.as_bytes()), "a");
    }

    #[test]
    fn deferred_direct_release() {
        let src = "package p\nfunc f() {\n\tdefer s.mu.Unlock()\n}\n";
        let tree = parse_go(src);
        let stmt = first_stmt(&tree);
        let subject = defer_release_subject(stmt, src.as_bytes()).unwrap();
        assert_eq!(render(subject, src.as_bytes()), "s.mu");
    }

    #[test]
    fn deferred_closure_release() {
        let src = "package p\nfunc f() {\n\tdefer func() {\n\t\tb.m.Unlock()\n\t\trecover()\n\t}()\n}\n";
        let tree = parse_go(src);
        let stmt = first_stmt(&tree);
        let subject = defer_release_subject(stmt, src.as_bytes()).unwrap();
        assert_eq!(render(subject, src.as_bytes()), "b.m");
    }

    #[test]
    fn deferred_lock_is_not_a_release() {
        let src = "package p\nfunc f() {\n\tdefer s.mu.Lock()\n}\n";
        let tree = parse_go(src);
        let stmt = first_stmt(&tree);
        assert!(defer_release_subject(stmt, src.as_bytes()).is_none());
    }

    #[test]
    fn bool_literal_values() {
        let src = "package p\nfunc f() {\n\tg(true, false, x)\n}\n";
        let tree = parse_go(src);
        let stmt = first_stmt(&tree);
        let call = call_of(stmt).unwrap();
        let args = call_args(call);
        assert_eq!(args.len(), 3);
        assert_eq!(bool_literal(args[0], src.as_bytes()), Some(true));
        assert_eq!(bool_literal(args[1], src.as_bytes()), Some(false));
        assert_eq!(bool_literal(args[2], src.as_bytes()), None);
    }
}
