//! Per-function lock scope tracking.
//!
//! A [`LockTracker`] consumes the statement stream of one function body and
//! produces [`MutexScope`]s: for every acquisition, the region of AST nodes
//! executed while that mutex is held, whether the scope was closed by a
//! matching release (direct or deferred), and wrapper attribution when the
//! acquisition went through a wrapper method.
//!
//! Mutually exclusive branches (if/else, switch and type-switch cases,
//! select communication cases) are analyzed on a fork of the tracker so a
//! release inside one branch cannot retire a scope its siblings still hold.
//! A fork shares nothing with its parent; when it is finalized, its finished
//! scopes merge back by (selector, position) identity: a scope the parent
//! still holds absorbs the branch-added nodes (and a branch release marks
//! it released), anything else is appended as a finished scope of its own.

use rustc_hash::{FxHashMap, FxHashSet};
use tree_sitter::Node;

use crate::fqn::Fqn;
use crate::model::{FuncDecl, Model};
use crate::syntax::{self, Pos, LOCK_METHODS, UNLOCK_METHODS};

/// The wrapper method a lock acquisition went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperInfo {
    /// Fully qualified name of the wrapper method.
    pub fqn: Fqn,
    /// Position of the acquisition inside the wrapper body.
    pub lock_pos: Pos,
}

/// A region of one function during which a mutex selector is held.
#[derive(Debug, Clone)]
pub struct MutexScope<'p> {
    selector: String,
    pos: Pos,
    nodes: Vec<Node<'p>>,
    unlocked: bool,
    wrapper: Option<WrapperInfo>,
}

impl<'p> MutexScope<'p> {
    fn new(selector: String, pos: Pos, wrapper: Option<WrapperInfo>) -> Self {
        MutexScope {
            selector,
            pos,
            nodes: Vec::new(),
            unlocked: false,
            wrapper,
        }
    }

    /// The mutex selector as rendered inside the acquiring function.
    #[must_use]
    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Position of the acquisition.
    #[must_use]
    pub fn pos(&self) -> Pos {
        self.pos
    }

    /// Nodes executed while the lock is held.
    #[must_use]
    pub fn nodes(&self) -> &[Node<'p>] {
        &self.nodes
    }

    /// Whether the scope was closed by a matching release.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// Wrapper attribution, when acquired through a wrapper method.
    #[must_use]
    pub fn wrapper(&self) -> Option<&WrapperInfo> {
        self.wrapper.as_ref()
    }

    #[must_use]
    pub fn has_same_selector(&self, other: &MutexScope<'_>) -> bool {
        self.selector == other.selector
    }
}

/// Shared context for a tracking pass over one function.
#[derive(Clone, Copy)]
pub struct TrackCtx<'p, 'm> {
    pub model: &'m Model<'p>,
    pub func: &'m FuncDecl<'p>,
}

impl<'p> TrackCtx<'p, '_> {
    #[must_use]
    pub fn source(&self) -> &'p [u8] {
        self.model.source(self.func.file)
    }

    #[must_use]
    pub fn pos(&self, node: Node) -> Pos {
        Pos::of(self.func.file, node)
    }
}

/// Tracks lock acquisitions through one function body.
pub struct LockTracker<'p, 'm> {
    ctx: TrackCtx<'p, 'm>,
    ongoing: FxHashMap<String, MutexScope<'p>>,
    defers: FxHashSet<String>,
    finished: Vec<MutexScope<'p>>,
}

impl<'p, 'm> LockTracker<'p, 'm> {
    #[must_use]
    pub fn new(ctx: TrackCtx<'p, 'm>) -> Self {
        LockTracker {
            ctx,
            ongoing: FxHashMap::default(),
            defers: FxHashSet::default(),
            finished: Vec::new(),
        }
    }

    #[must_use]
    pub(crate) fn ctx(&self) -> TrackCtx<'p, 'm> {
        self.ctx
    }

    /// Fork for branch-local analysis. The fork copies the mutable state
    /// and starts with an empty finished list.
    pub(crate) fn fork(&self) -> Self {
        LockTracker {
            ctx: self.ctx,
            ongoing: self.ongoing.clone(),
            defers: self.defers.clone(),
            finished: Vec::new(),
        }
    }

    /// Node counts of the ongoing scopes at a fork point, used to splice
    /// branch-added nodes back during [`merge_branch`](Self::merge_branch).
    pub(crate) fn fork_marks(&self) -> FxHashMap<String, (Pos, usize)> {
        self.ongoing
            .iter()
            .map(|(k, v)| (k.clone(), (v.pos, v.nodes.len())))
            .collect()
    }

    /// Merge a finalized fork's finished scopes back into this tracker.
    pub(crate) fn merge_branch(
        &mut self,
        finished: Vec<MutexScope<'p>>,
        marks: &FxHashMap<String, (Pos, usize)>,
    ) {
        for scope in finished {
            match self.ongoing.get_mut(&scope.selector) {
                Some(parent) if parent.pos == scope.pos => {
                    let base = marks
                        .get(&scope.selector)
                        .map_or(0, |&(_, count)| count)
                        .min(scope.nodes.len());
                    parent.nodes.extend_from_slice(&scope.nodes[base..]);
                    if scope.unlocked {
                        parent.unlocked = true;
                    }
                }
                _ => self.finished.push(scope),
            }
        }
    }

    pub(crate) fn take_finished(&mut self) -> Vec<MutexScope<'p>> {
        std::mem::take(&mut self.finished)
    }

    /// Track every statement of a block.
    pub fn track_block(&mut self, block: Node<'p>, add_to_ongoing: bool) {
        for stmt in syntax::block_statements(block) {
            self.track(stmt, add_to_ongoing);
        }
    }

    /// Process one statement.
    ///
    /// When `add_to_ongoing` is set, the statement (or, for compound
    /// statements, its prefix parts that execute before any body code) is
    /// recorded into every ongoing scope before lock operations are applied.
    pub fn track(&mut self, stmt: Node<'p>, add_to_ongoing: bool) {
        if add_to_ongoing {
            self.add_statement_prefixes(stmt);
        }
        self.track_ops(stmt);
        self.track_nested(stmt, add_to_ongoing);
    }

    /// Recognize the direct acquire / deferred release / direct release
    /// operations of a single statement, without recursing.
    pub(crate) fn track_ops(&mut self, stmt: Node<'p>) {
        let source = self.ctx.source();

        if let Some(subject) = syntax::subject_of_named_call(stmt, &LOCK_METHODS, source) {
            if self.ctx.model.is_mutex(self.ctx.func, subject) {
                let selector = syntax::render(subject, source);
                self.start_scope(selector, self.ctx.pos(stmt), None);
            }
        }

        if let Some(subject) = syntax::defer_release_subject(stmt, source) {
            self.defers.insert(syntax::render(subject, source));
        }

        if let Some(subject) = syntax::subject_of_named_call(stmt, &UNLOCK_METHODS, source) {
            let selector = syntax::render(subject, source);
            self.end_scope(&selector);
        }
    }

    /// Open an ongoing scope unless the selector already has one.
    pub(crate) fn start_scope(&mut self, selector: String, pos: Pos, wrapper: Option<WrapperInfo>) {
        self.ongoing
            .entry(selector.clone())
            .or_insert_with(|| MutexScope::new(selector, pos, wrapper));
    }

    /// Close the matching ongoing scope as released.
    pub(crate) fn end_scope(&mut self, selector: &str) {
        if let Some(mut scope) = self.ongoing.remove(selector) {
            scope.unlocked = true;
            self.finished.push(scope);
        }
    }

    /// Register a deferred release for a selector.
    pub(crate) fn add_deferred(&mut self, selector: String) {
        self.defers.insert(selector);
    }

    /// Record a node into every ongoing scope.
    fn add_to_ongoing(&mut self, node: Node<'p>) {
        for scope in self.ongoing.values_mut() {
            scope.nodes.push(node);
        }
    }

    /// Record the parts of a statement that execute while current locks are
    /// held. For compound statements that is only the prefix (init and
    /// condition of `if` and counted `for`, the iteree of a ranged `for`,
    /// init and tag of a switch, init and discriminator of a type switch);
    /// bodies are visited separately. Everything else is added whole.
    pub(crate) fn add_statement_prefixes(&mut self, stmt: Node<'p>) {
        match stmt.kind() {
            "if_statement" => {
                if let Some(init) = stmt.child_by_field_name("initializer") {
                    self.add_to_ongoing(init);
                }
                if let Some(cond) = stmt.child_by_field_name("condition") {
                    self.add_to_ongoing(cond);
                }
            }
            "for_statement" => {
                for clause in for_header(stmt) {
                    self.add_to_ongoing(clause);
                }
            }
            "expression_switch_statement" => {
                if let Some(init) = stmt.child_by_field_name("initializer") {
                    self.add_to_ongoing(init);
                }
                if let Some(tag) = stmt.child_by_field_name("value") {
                    self.add_to_ongoing(tag);
                }
            }
            "type_switch_statement" => {
                if let Some(init) = stmt.child_by_field_name("initializer") {
                    self.add_to_ongoing(init);
                }
                if let Some(value) = stmt.child_by_field_name("value") {
                    self.add_to_ongoing(value);
                }
            }
            "select_statement" | "block" => {}
            _ => self.add_to_ongoing(stmt),
        }
    }

    /// Visit statements nested inside compound statements. Mutually
    /// exclusive constructs run each branch on a fork.
    fn track_nested(&mut self, stmt: Node<'p>, add_to_ongoing: bool) {
        match stmt.kind() {
            "if_statement" => {
                if let Some(body) = stmt.child_by_field_name("consequence") {
                    self.run_branch(|t| t.track_block(body, add_to_ongoing));
                }
                if let Some(alt) = stmt.child_by_field_name("alternative") {
                    self.run_branch(|t| match alt.kind() {
                        "block" => t.track_block(alt, add_to_ongoing),
                        "if_statement" => t.track(alt, add_to_ongoing),
                        _ => {}
                    });
                }
            }
            "for_statement" => {
                if let Some(body) = stmt.child_by_field_name("body") {
                    self.track_block(body, add_to_ongoing);
                }
            }
            "expression_switch_statement" | "type_switch_statement" | "select_statement" => {
                for case in switch_cases(stmt) {
                    self.run_branch(|t| {
                        for inner in syntax::case_body(case) {
                            t.track(inner, add_to_ongoing);
                        }
                    });
                }
            }
            "block" => self.track_block(stmt, add_to_ongoing),
            _ => {}
        }
    }

    /// Run one mutually exclusive branch on a fork and merge it back.
    fn run_branch(&mut self, branch_body: impl FnOnce(&mut Self)) {
        let marks = self.fork_marks();
        let mut branch = self.fork();
        branch_body(&mut branch);
        branch.end_block();
        let finished = branch.take_finished();
        self.merge_branch(finished, &marks);
    }

    /// Finalize at the end of the function body: selectors with a deferred
    /// release close as released; every other remaining scope is finished
    /// as-is (an unreleased scope still contributes to wrapper
    /// classification and transitive analysis). Clears the mutable state.
    pub fn end_block(&mut self) {
        let mut remaining: Vec<MutexScope<'p>> =
            self.ongoing.drain().map(|(_, scope)| scope).collect();
        remaining.sort_by_key(MutexScope::pos);

        let defers = std::mem::take(&mut self.defers);
        for mut scope in remaining {
            if defers.contains(&scope.selector) {
                scope.unlocked = true;
            }
            self.finished.push(scope);
        }
    }

    /// Whether any scopes were produced.
    #[must_use]
    pub fn has_scopes(&self) -> bool {
        !self.finished.is_empty()
    }

    /// Consume the tracker, returning its finished scopes.
    #[must_use]
    pub fn into_scopes(self) -> Vec<MutexScope<'p>> {
        self.finished
    }
}

/// Prefix nodes of a `for` statement header: init and condition of a
/// counted loop, the iteree of a ranged loop, or the bare condition.
/// The post clause runs after the body and is never included.
fn for_header<'t>(stmt: Node<'t>) -> Vec<Node<'t>> {
    let mut out = Vec::new();
    let body = stmt.child_by_field_name("body");
    let mut cursor = stmt.walk();
    for child in stmt.named_children(&mut cursor) {
        if Some(child.id()) == body.map(|b| b.id()) || child.kind() == "comment" {
            continue;
        }
        match child.kind() {
            "for_clause" => {
                if let Some(init) = child.child_by_field_name("initializer") {
                    out.push(init);
                }
                if let Some(cond) = child.child_by_field_name("condition") {
                    out.push(cond);
                }
            }
            "range_clause" => {
                if let Some(right) = child.child_by_field_name("right") {
                    out.push(right);
                }
            }
            // `for cond { ... }`
            _ => out.push(child),
        }
    }
    out
}

/// Case clauses of a switch, type switch, or select statement.
pub(crate) fn switch_cases<'t>(stmt: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = stmt.walk();
    stmt.named_children(&mut cursor)
        .filter(|c| {
            matches!(
                c.kind(),
                "expression_case" | "type_case" | "default_case" | "communication_case"
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Package;
    use crate::syntax::render;

    fn tracked(source: &str) -> Vec<(String, bool, Vec<String>)> {
        let pkg = Package::parse("example/tests", [("fixture.go", source.to_string())]).unwrap();
        let model = Model::build(&pkg);
        let func = &model.funcs[0];
        let ctx = TrackCtx { model: &model, func };
        let mut tracker = LockTracker::new(ctx);
        tracker.track_block(func.body, true);
        tracker.end_block();

        let src = source.as_bytes();
        tracker
            .into_scopes()
            .into_iter()
            .map(|s| {
                let nodes = s.nodes().iter().map(|n| render(*n, src)).collect();
                (s.selector().to_string(), s.is_unlocked(), nodes)
            })
            .collect()
    }

    #[test]
    fn direct_lock_and_unlock_closes_scope() {
        let scopes = tracked(
            "package p\n\ntype s struct{}\n\nfunc (x *s) f() {\n\tx.mu.Lock()\n\tx.n = 1\n\tx.mu.Unlock()\n}\n",
        );
        assert_eq!(scopes.len(), 1);
        let (selector, unlocked, nodes) = &scopes[0];
        assert_eq!(selector, "x.mu");
        assert!(*unlocked);
        assert_eq!(nodes, &vec!["x.n = 1".to_string(), "x.mu.Unlock()".to_string()]);
    }

    #[test]
    fn deferred_release_closes_at_end_of_block() {
        let scopes = tracked(
            "package p\n\nfunc (x *s) f() {\n\tx.mu.Lock()\n\tdefer x.mu.Unlock()\n\tx.work()\n}\n",
        );
        assert_eq!(scopes.len(), 1);
        assert!(scopes[0].1, "deferred release marks the scope released");
        assert!(scopes[0].2.contains(&"x.work()".to_string()));
    }

    #[test]
    fn missing_release_leaves_scope_open() {
        let scopes = tracked("package p\n\nfunc (x *s) f() {\n\tx.mu.Lock()\n}\n");
        assert_eq!(scopes.len(), 1);
        assert!(!scopes[0].1);
    }

    #[test]
    fn branch_statements_accumulate_into_held_scope() {
        let scopes = tracked(
            "package p\n\nfunc (x *s) f() {\n\tx.mu.Lock()\n\tdefer x.mu.Unlock()\n\tif x.ready {\n\t\tx.work()\n\t}\n}\n",
        );
        assert_eq!(scopes.len(), 1);
        let nodes = &scopes[0].2;
        assert!(nodes.contains(&"x.ready".to_string()), "condition is a prefix part");
        assert!(nodes.contains(&"x.work()".to_string()), "branch body nodes splice back");
    }

    #[test]
    fn release_in_one_branch_does_not_leak_into_siblings() {
        // The release in the first case must not retire the scope the
        // second case still sees as held.
        let scopes = tracked(
            "package p\n\nfunc (x *s) f(v int) {\n\tx.mu.Lock()\n\tswitch v {\n\tcase 1:\n\t\tx.mu.Unlock()\n\tcase 2:\n\t\tx.work()\n\t}\n\tx.mu.Unlock()\n}\n",
        );
        assert_eq!(scopes.len(), 1);
        let (_, unlocked, nodes) = &scopes[0];
        assert!(*unlocked);
        assert!(
            nodes.contains(&"x.work()".to_string()),
            "second case still runs under the lock"
        );
    }

    #[test]
    fn branch_release_marks_parent_scope_released() {
        // Released in one branch only: the function must not classify as a
        // lock-only wrapper, so the merged scope reads as released.
        let scopes = tracked(
            "package p\n\nfunc (x *s) f(ok bool) {\n\tx.mu.Lock()\n\tif ok {\n\t\tx.mu.Unlock()\n\t}\n}\n",
        );
        assert_eq!(scopes.len(), 1);
        assert!(scopes[0].1);
    }

    #[test]
    fn scope_opened_inside_case_finishes_unreleased() {
        let scopes = tracked(
            "package p\n\nfunc (x *s) f(v int) {\n\tswitch v {\n\tcase 1:\n\t\tx.mu.Lock()\n\t\tx.work()\n\t}\n}\n",
        );
        assert_eq!(scopes.len(), 1);
        let (selector, unlocked, nodes) = &scopes[0];
        assert_eq!(selector, "x.mu");
        assert!(!*unlocked);
        assert_eq!(nodes, &vec!["x.work()".to_string()]);
    }

    #[test]
    fn statements_after_release_are_not_recorded() {
        let scopes = tracked(
            "package p\n\nfunc (x *s) f() {\n\tx.mu.Lock()\n\tx.mu.Unlock()\n\tx.work()\n}\n",
        );
        assert_eq!(scopes.len(), 1);
        assert!(!scopes[0].2.contains(&"x.work()".to_string()));
    }

    #[test]
    fn second_acquisition_of_same_selector_is_recorded_not_restarted() {
        let scopes = tracked(
            "package p\n\nfunc (x *s) f() {\n\tx.mu.Lock()\n\tx.mu.Lock()\n\tx.mu.Unlock()\n}\n",
        );
        assert_eq!(scopes.len(), 1);
        assert!(
            scopes[0].2.contains(&"x.mu.Lock()".to_string()),
            "the reacquisition stays visible to the reentrancy pass"
        );
    }

    #[test]
    fn deferred_closure_release_counts() {
        let scopes = tracked(
            "package p\n\nfunc (x *s) f() {\n\tx.mu.Lock()\n\tdefer func() {\n\t\tx.mu.Unlock()\n\t}()\n\tx.work()\n}\n",
        );
        assert_eq!(scopes.len(), 1);
        assert!(scopes[0].1);
    }

    #[test]
    fn select_comm_cases_are_forked() {
        let scopes = tracked(
            "package p\n\nfunc (x *s) f() {\n\tx.mu.Lock()\n\tselect {\n\tcase <-x.done:\n\t\tx.mu.Unlock()\n\tcase v := <-x.in:\n\t\tx.handle(v)\n\t}\n\tx.mu.Unlock()\n}\n",
        );
        assert_eq!(scopes.len(), 1);
        let (_, unlocked, nodes) = &scopes[0];
        assert!(*unlocked);
        assert!(
            nodes.contains(&"x.handle(v)".to_string()),
            "the second comm case still runs under the lock: {nodes:?}"
        );
    }

    #[test]
    fn type_switch_discriminator_is_a_prefix_part() {
        let scopes = tracked(
            "package p\n\nfunc (x *s) f(v interface{}) {\n\tx.mu.Lock()\n\tdefer x.mu.Unlock()\n\tswitch t := v.(type) {\n\tcase int:\n\t\tx.handleInt(t)\n\t}\n}\n",
        );
        assert_eq!(scopes.len(), 1);
        let nodes = &scopes[0].2;
        assert!(nodes.contains(&"v".to_string()), "discriminator recorded: {nodes:?}");
        assert!(nodes.contains(&"x.handleInt(t)".to_string()));
    }

    #[test]
    fn ranged_for_iteree_is_a_prefix_part() {
        let scopes = tracked(
            "package p\n\nfunc (x *s) f() {\n\tx.mu.Lock()\n\tdefer x.mu.Unlock()\n\tfor _, v := range x.items() {\n\t\tx.use(v)\n\t}\n}\n",
        );
        assert_eq!(scopes.len(), 1);
        let nodes = &scopes[0].2;
        assert!(nodes.contains(&"x.items()".to_string()));
        assert!(nodes.contains(&"x.use(v)".to_string()));
    }
}
