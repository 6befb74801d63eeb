//! Reentrancy analysis and the pass orchestrator.
//!
//! [`analyze`] runs the whole pipeline over one package:
//!
//! 1. collect function declarations into the symbol model;
//! 2. track direct lock scopes per function and record top-level calls;
//! 3. classify lock/unlock wrapper methods;
//! 4. re-analyze wrapper-using functions for logical scopes;
//! 5. propagate conditional locks to fixpoint;
//! 6. flag returns that leak a held lock;
//! 7. flag direct and transitive reacquisitions inside held scopes;
//! 8. deduplicate, resolve positions, and sort the findings.
//!
//! Transitive checking walks the intra-package call graph with a memoized
//! depth-first search; the memo is scoped to one query, and marking a
//! function on entry terminates cycles. Calls that escape the current
//! region asynchronously are not inspected: anything under a goroutine
//! spawn, and any function literal that is not directly invoked (passed as
//! an argument, returned, or assigned, it runs later, typically after the
//! lock is gone).

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;
use tree_sitter::Node;

use crate::branch::ReturnTracker;
use crate::conditional::ConditionalLockRegistry;
use crate::findings::{Finding, MissingRelease, Reentrant, WrapperSite};
use crate::fqn::Fqn;
use crate::model::{FuncDecl, Model};
use crate::package::Package;
use crate::scope::{LockTracker, MutexScope, TrackCtx, WrapperInfo};
use crate::syntax::{self, Pos, LOCK_METHODS};
use crate::wrappers::{WrapperAwareTracker, WrapperRegistry};

/// Analyze one package, producing every finding the engine can prove.
#[must_use]
pub fn analyze(pkg: &Package) -> Vec<Finding> {
    let model = Model::build(pkg);
    let mut analysis = Analysis {
        pkg,
        model: &model,
        scopes: FxHashMap::default(),
        calls: FxHashMap::default(),
        wrappers: WrapperRegistry::new(),
        conditionals: ConditionalLockRegistry::new(),
    };
    analysis.run()
}

struct Analysis<'p, 'm> {
    pkg: &'p Package,
    model: &'m Model<'p>,
    /// Finished lock scopes per function (direct pass, then wrapper pass).
    scopes: FxHashMap<Fqn, Vec<MutexScope<'p>>>,
    /// Top-level calls per function.
    calls: FxHashMap<Fqn, Vec<Fqn>>,
    wrappers: WrapperRegistry,
    conditionals: ConditionalLockRegistry,
}

impl<'p> Analysis<'p, '_> {
    fn run(&mut self) -> Vec<Finding> {
        self.collect_direct();
        self.wrappers.identify(&self.scopes, self.model);
        self.collect_wrapped();
        self.conditionals.scan(self.model);
        self.conditionals.propagate(self.model);

        let mut findings = Vec::new();
        self.check_missing_releases(&mut findings);
        self.check_reentrant_locks(&mut findings);

        findings.sort_by(|a, b| a.target().cmp(b.target()));
        debug!(count = findings.len(), "analysis complete");
        findings
    }

    /// Direct lock scopes and the top-level call graph.
    fn collect_direct(&mut self) {
        for func in &self.model.funcs {
            let ctx = TrackCtx {
                model: self.model,
                func,
            };
            let mut tracker = LockTracker::new(ctx);
            tracker.track_block(func.body, true);
            tracker.end_block();
            if tracker.has_scopes() {
                self.scopes.insert(func.fqn.clone(), tracker.into_scopes());
            }

            let mut callees = Vec::new();
            for stmt in syntax::block_statements(func.body) {
                if let Some(call) = syntax::call_of(stmt) {
                    if let Some(fqn) = self.model.resolve_call(func, call) {
                        callees.push(fqn);
                    }
                }
            }
            if !callees.is_empty() {
                self.calls.insert(func.fqn.clone(), callees);
            }
        }
        debug!(
            locked = self.scopes.len(),
            calling = self.calls.len(),
            "direct pass done"
        );
    }

    /// Wrapper-aware scopes for functions with no direct scopes.
    fn collect_wrapped(&mut self) {
        for func in &self.model.funcs {
            if self.scopes.contains_key(&func.fqn) {
                continue;
            }
            let ctx = TrackCtx {
                model: self.model,
                func,
            };
            let mut tracker = WrapperAwareTracker::new(ctx, &self.wrappers);
            tracker.analyze_block(func.body);
            let scopes = tracker.finish();
            if !scopes.is_empty() {
                self.scopes.insert(func.fqn.clone(), scopes);
            }
        }
    }

    /// Returns that leave a lock held, one finding per return position.
    fn check_missing_releases(&self, findings: &mut Vec<Finding>) {
        let mut reported: FxHashSet<Pos> = FxHashSet::default();
        for func in &self.model.funcs {
            let ctx = TrackCtx {
                model: self.model,
                func,
            };
            let mut tracker = ReturnTracker::new(ctx, &self.wrappers);
            let mut leaks = Vec::new();
            tracker.analyze_block(func.body, &mut leaks);

            for leak in leaks {
                if !reported.insert(leak.return_pos) {
                    continue;
                }
                findings.push(Finding::MissingRelease(MissingRelease {
                    lock: self.pkg.location(leak.lock.pos),
                    return_pos: self.pkg.location(leak.return_pos),
                    wrapper: leak.lock.wrapper.as_ref().map(|w| self.wrapper_site(w)),
                }));
            }
        }
    }

    /// Reacquisitions of a held mutex, direct or through calls.
    fn check_reentrant_locks(&self, findings: &mut Vec<Finding>) {
        let mut reported: FxHashSet<Pos> = FxHashSet::default();
        for func in &self.model.funcs {
            let Some(scopes) = self.scopes.get(&func.fqn) else {
                continue;
            };
            for scope in scopes {
                for &node in scope.nodes() {
                    let mut calls = Vec::new();
                    collect_region_calls(node, &mut calls);
                    for call in calls {
                        self.check_call(func, scope, call, &mut reported, findings);
                    }
                }
            }
        }
    }

    fn check_call(
        &self,
        func: &FuncDecl<'p>,
        scope: &MutexScope<'p>,
        call: Node<'p>,
        reported: &mut FxHashSet<Pos>,
        findings: &mut Vec<Finding>,
    ) {
        let source = self.model.source(func.file);

        // Direct: the same selector textually reacquired. A name-only match
        // on a different selector is not conclusive; the call may still be a
        // package-local method that happens to be named Lock, so it falls
        // through to the transitive check.
        if let Some(subject) = syntax::subject_of_named_call(call, &LOCK_METHODS, source) {
            if syntax::text(subject, source) == scope.selector() {
                self.record_reentrant(scope, Pos::of(func.file, call), reported, findings);
                return;
            }
        }

        // Transitive: a call on the same receiver whose chain reacquires.
        if let Some(selector) = syntax::callee_selector(call) {
            if let Some(root) = syntax::root_of(selector) {
                let (scope_root, _) = syntax::split_selector(scope.selector());
                if !scope_root.is_empty() && syntax::text(root, source) != scope_root {
                    return;
                }
            }
        }

        let Some(fqn) = self.model.resolve_call(func, call) else {
            return;
        };
        if self
            .conditionals
            .should_skip(&fqn, call, scope.selector(), source)
        {
            return;
        }

        let mut checked = FxHashMap::default();
        if self.reaches_same_mutex(&fqn, scope, &mut checked) {
            self.record_reentrant(scope, Pos::of(func.file, call), reported, findings);
        }
    }

    /// Memoized DFS: does `fqn` (or anything it calls) acquire the scope's
    /// selector? Marking on entry terminates call cycles.
    fn reaches_same_mutex(
        &self,
        fqn: &Fqn,
        scope: &MutexScope<'p>,
        checked: &mut FxHashMap<Fqn, bool>,
    ) -> bool {
        if let Some(&known) = checked.get(fqn) {
            return known;
        }
        checked.insert(fqn.clone(), false);

        if let Some(scopes) = self.scopes.get(fqn) {
            if scopes.iter().any(|s| s.has_same_selector(scope)) {
                checked.insert(fqn.clone(), true);
                return true;
            }
        }

        if let Some(callees) = self.calls.get(fqn) {
            for callee in callees {
                if self.reaches_same_mutex(callee, scope, checked) {
                    checked.insert(fqn.clone(), true);
                    return true;
                }
            }
        }
        false
    }

    fn record_reentrant(
        &self,
        scope: &MutexScope<'p>,
        second: Pos,
        reported: &mut FxHashSet<Pos>,
        findings: &mut Vec<Finding>,
    ) {
        if !reported.insert(second) {
            return;
        }
        findings.push(Finding::Reentrant(Reentrant {
            origin: self.pkg.location(scope.pos()),
            second_lock: self.pkg.location(second),
            wrapper: scope.wrapper().map(|w| self.wrapper_site(w)),
        }));
    }

    fn wrapper_site(&self, info: &WrapperInfo) -> WrapperSite {
        WrapperSite {
            name: info.fqn.short_name().to_string(),
            lock: self.pkg.location(info.lock_pos),
        }
    }
}

/// Collect the call expressions syntactically inside a held-scope node,
/// excluding code that runs outside the locked region: goroutine bodies
/// and function literals that escape rather than being invoked in place.
fn collect_region_calls<'t>(node: Node<'t>, out: &mut Vec<Node<'t>>) {
    match node.kind() {
        "go_statement" => return,
        "func_literal" if !is_immediately_invoked(node) => return,
        "call_expression" => out.push(node),
        _ => {}
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_region_calls(child, out);
    }
}

/// A function literal that is the callee of its parent call runs in place
/// and stays part of the locked region.
fn is_immediately_invoked(literal: Node) -> bool {
    literal.parent().is_some_and(|parent| {
        parent.kind() == "call_expression"
            && parent
                .child_by_field_name("function")
                .is_some_and(|f| f.id() == literal.id())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_go(source: &str) -> tree_sitter::Tree {
        let mut parser = tree_sitter::Parser::new();
        parser
            .set_language(&tree_sitter_go::LANGUAGE.into())
            .unwrap();
        parser.parse(source, None).unwrap()
    }

    fn first_stmt(tree: &tree_sitter::Tree) -> Node<'_> {
        let root = tree.root_node();
        let mut cursor = root.walk();
        let func = root
            .named_children(&mut cursor)
            .find(|c| c.kind() == "function_declaration")
            .unwrap();
        syntax::block_statements(func.child_by_field_name("body").unwrap())[0]
    }

    fn collected(source: &str) -> Vec<String> {
        let tree = parse_go(source);
        let stmt = first_stmt(&tree);
        let mut calls = Vec::new();
        collect_region_calls(stmt, &mut calls);
        calls
            .into_iter()
            .map(|c| syntax::render(c, source.as_bytes()))
            .collect()
    }

    #[test]
    fn goroutine_bodies_are_excluded() {
        let calls = collected("package p\nfunc f() {\n\tgo func() {\n\t\ta.mu.Lock()\n\t}()\n}\n");
        assert!(calls.is_empty());
    }

    #[test]
    fn literal_arguments_are_excluded_but_the_call_is_kept() {
        let calls = collected(
            "package p\nfunc f() {\n\tt = AfterFunc(d, func() {\n\t\ta.mu.Lock()\n\t})\n}\n",
        );
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("AfterFunc"));
    }

    #[test]
    fn immediately_invoked_literals_are_inspected() {
        let calls =
            collected("package p\nfunc f() {\n\tfunc() {\n\t\ta.mu.Lock()\n\t}()\n}\n");
        assert_eq!(calls.len(), 2, "the invocation and the inner lock call");
        assert!(calls.iter().any(|c| c == "a.mu.Lock()"));
    }

    #[test]
    fn assigned_literals_are_excluded() {
        let calls = collected(
            "package p\nfunc f() {\n\tcb := func() {\n\t\ta.mu.Lock()\n\t}\n}\n",
        );
        assert!(calls.is_empty());
    }

    #[test]
    fn nested_calls_inside_arguments_are_collected() {
        let calls = collected("package p\nfunc f() {\n\tuse(a.get(), b.get())\n}\n");
        assert_eq!(calls.len(), 3);
    }
}
