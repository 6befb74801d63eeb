//! Branch-sensitive detection of returns that leak a held lock.
//!
//! Walks a function body forking tracker state at every control-flow fork,
//! so a release that exists on one path never satisfies a sibling path. At
//! each `return` statement, every lock still ongoing without a registered
//! deferred release is reported. Recognizes direct acquire/release, wrapper
//! calls, and deferred releases in both forms.
//!
//! State containers are copied by value at forks; the findings sink is
//! passed down as a shared mutable reference so branch-local discoveries
//! surface in one place.

use rustc_hash::{FxHashMap, FxHashSet};
use tree_sitter::Node;

use crate::scope::{switch_cases, TrackCtx, WrapperInfo};
use crate::syntax::{self, Pos, LOCK_METHODS, UNLOCK_METHODS};
use crate::wrappers::{WrapperKind, WrapperRegistry};

/// A lock known to be held at the current point of the walk.
#[derive(Debug, Clone)]
pub struct HeldLock {
    pub pos: Pos,
    pub wrapper: Option<WrapperInfo>,
}

/// A return statement reached while a lock is held with no deferred release.
#[derive(Debug, Clone)]
pub struct ReturnLeak {
    pub selector: String,
    pub lock: HeldLock,
    pub return_pos: Pos,
}

/// Tracks held locks through branching control flow.
pub struct ReturnTracker<'p, 'm> {
    ctx: TrackCtx<'p, 'm>,
    registry: &'m WrapperRegistry,
    ongoing: FxHashMap<String, HeldLock>,
    defers: FxHashSet<String>,
}

impl<'p, 'm> ReturnTracker<'p, 'm> {
    #[must_use]
    pub fn new(ctx: TrackCtx<'p, 'm>, registry: &'m WrapperRegistry) -> Self {
        ReturnTracker {
            ctx,
            registry,
            ongoing: FxHashMap::default(),
            defers: FxHashSet::default(),
        }
    }

    fn fork(&self) -> Self {
        ReturnTracker {
            ctx: self.ctx,
            registry: self.registry,
            ongoing: self.ongoing.clone(),
            defers: self.defers.clone(),
        }
    }

    /// Analyze every statement of a block, appending leaks to `sink`.
    pub fn analyze_block(&mut self, block: Node<'p>, sink: &mut Vec<ReturnLeak>) {
        for stmt in syntax::block_statements(block) {
            self.analyze_stmt(stmt, sink);
        }
    }

    fn analyze_stmt(&mut self, stmt: Node<'p>, sink: &mut Vec<ReturnLeak>) {
        let source = self.ctx.source();

        if let Some(subject) = syntax::subject_of_named_call(stmt, &LOCK_METHODS, source) {
            if self.ctx.model.is_mutex(self.ctx.func, subject) {
                let selector = syntax::render(subject, source);
                self.ongoing.entry(selector).or_insert(HeldLock {
                    pos: self.ctx.pos(stmt),
                    wrapper: None,
                });
            }
        }

        self.track_wrapper_ops(stmt);

        if let Some(subject) = syntax::defer_release_subject(stmt, source) {
            self.defers.insert(syntax::render(subject, source));
        }

        if let Some(subject) = syntax::subject_of_named_call(stmt, &UNLOCK_METHODS, source) {
            self.ongoing.remove(&syntax::render(subject, source));
        }

        if stmt.kind() == "return_statement" {
            self.report_return(stmt, sink);
            return;
        }

        self.analyze_nested(stmt, sink);
    }

    /// Wrapper lock/unlock calls, plain and deferred.
    fn track_wrapper_ops(&mut self, stmt: Node<'p>) {
        if let Some(call) = syntax::call_of(stmt) {
            if let Some((kind, info, selector)) = self.wrapper_at(call) {
                match kind {
                    WrapperKind::Lock => {
                        let pos = self.ctx.pos(stmt);
                        self.ongoing.entry(selector).or_insert(HeldLock {
                            pos,
                            wrapper: Some(info),
                        });
                    }
                    WrapperKind::Unlock => {
                        self.ongoing.remove(&selector);
                    }
                }
            }
        }

        if let Some(call) = syntax::defer_call(stmt) {
            if let Some((WrapperKind::Unlock, _, selector)) = self.wrapper_at(call) {
                self.defers.insert(selector);
            }
        }
    }

    fn wrapper_at(&self, call: Node<'p>) -> Option<(WrapperKind, WrapperInfo, String)> {
        let fqn = self.ctx.model.resolve_call(self.ctx.func, call)?;
        let wrapper = self.registry.get(&fqn)?;

        let selector = syntax::callee_selector(call)?;
        let receiver = syntax::root_of(selector)?;
        let root = syntax::text(receiver, self.ctx.source());
        Some((
            wrapper.kind,
            WrapperInfo {
                fqn: wrapper.fqn.clone(),
                lock_pos: wrapper.lock_pos,
            },
            format!("{root}.{}", wrapper.mutex_field),
        ))
    }

    fn report_return(&self, ret: Node<'p>, sink: &mut Vec<ReturnLeak>) {
        let return_pos = self.ctx.pos(ret);
        let mut held: Vec<(&String, &HeldLock)> = self
            .ongoing
            .iter()
            .filter(|(selector, _)| !self.defers.contains(*selector))
            .collect();
        held.sort_by(|a, b| a.0.cmp(b.0));

        for (selector, lock) in held {
            sink.push(ReturnLeak {
                selector: selector.clone(),
                lock: lock.clone(),
                return_pos,
            });
        }
    }

    fn analyze_nested(&mut self, stmt: Node<'p>, sink: &mut Vec<ReturnLeak>) {
        match stmt.kind() {
            "if_statement" => {
                if let Some(init) = stmt.child_by_field_name("initializer") {
                    self.analyze_stmt(init, sink);
                }
                if let Some(body) = stmt.child_by_field_name("consequence") {
                    self.fork().analyze_block(body, sink);
                }
                if let Some(alt) = stmt.child_by_field_name("alternative") {
                    let mut branch = self.fork();
                    match alt.kind() {
                        "block" => branch.analyze_block(alt, sink),
                        "if_statement" => branch.analyze_stmt(alt, sink),
                        _ => {}
                    }
                }
                // After the fork the parent keeps its pre-branch state: the
                // lock remains held as far as later statements can tell.
            }
            "for_statement" => {
                for header in for_init(stmt) {
                    self.analyze_stmt(header, sink);
                }
                if let Some(body) = stmt.child_by_field_name("body") {
                    self.fork().analyze_block(body, sink);
                }
            }
            "expression_switch_statement" | "type_switch_statement" | "select_statement" => {
                if let Some(init) = stmt.child_by_field_name("initializer") {
                    self.analyze_stmt(init, sink);
                }
                for case in switch_cases(stmt) {
                    let mut branch = self.fork();
                    for inner in syntax::case_body(case) {
                        branch.analyze_stmt(inner, sink);
                    }
                }
            }
            "block" => self.analyze_block(stmt, sink),
            _ => {}
        }
    }
}

/// Init statement of a counted `for`, when present.
fn for_init<'t>(stmt: Node<'t>) -> Vec<Node<'t>> {
    let mut out = Vec::new();
    let mut cursor = stmt.walk();
    for child in stmt.named_children(&mut cursor) {
        if child.kind() == "for_clause" {
            if let Some(init) = child.child_by_field_name("initializer") {
                out.push(init);
            }
        }
    }
    out
}
