//! Lock/unlock wrapper methods.
//!
//! A *lock wrapper* acquires a mutex field of its receiver and returns
//! without releasing it (`func (w *W) Acquire() { w.m.Lock() }`); an
//! *unlock wrapper* releases without acquiring. Code written against such
//! wrappers never mentions `Lock`/`Unlock` directly, so a second pass
//! re-analyzes wrapper-using functions, treating wrapper calls as logical
//! acquire/release of `<call-receiver>.<mutex-field>`.
//!
//! A function that both acquires and releases (a self-contained locker) is
//! not a wrapper, and only functions with no direct lock scopes of their
//! own are re-analyzed; together these keep ordinary locked methods from
//! masquerading as wrappers.

use rustc_hash::FxHashMap;
use tracing::debug;
use tree_sitter::Node;

use crate::fqn::Fqn;
use crate::model::Model;
use crate::scope::{switch_cases, LockTracker, MutexScope, TrackCtx, WrapperInfo};
use crate::syntax::{self, Pos, LOCK_METHODS, UNLOCK_METHODS};

/// Whether a wrapper acquires or releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperKind {
    Lock,
    Unlock,
}

/// A method classified as a lock or unlock wrapper.
#[derive(Debug, Clone)]
pub struct WrapperMethod {
    pub fqn: Fqn,
    /// Field suffix of the selector operated on inside the wrapper
    /// (`m` for `w.m.Lock()`), used to rebuild the effective selector at
    /// call sites.
    pub mutex_field: String,
    pub kind: WrapperKind,
    /// Position of the internal acquire/release, for diagnostic attribution.
    pub lock_pos: Pos,
}

/// Registry of wrapper methods, keyed by fully qualified name.
#[derive(Default)]
pub struct WrapperRegistry {
    wrappers: FxHashMap<Fqn, WrapperMethod>,
}

impl WrapperRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fqn: Fqn, mutex_field: String, kind: WrapperKind, lock_pos: Pos) {
        debug!(wrapper = %fqn, field = %mutex_field, ?kind, "registered wrapper");
        self.wrappers.insert(
            fqn.clone(),
            WrapperMethod {
                fqn,
                mutex_field,
                kind,
                lock_pos,
            },
        );
    }

    #[must_use]
    pub fn get(&self, fqn: &Fqn) -> Option<&WrapperMethod> {
        self.wrappers.get(fqn)
    }

    #[must_use]
    pub fn is_lock_wrapper(&self, fqn: &Fqn) -> bool {
        matches!(self.get(fqn), Some(w) if w.kind == WrapperKind::Lock)
    }

    #[must_use]
    pub fn is_unlock_wrapper(&self, fqn: &Fqn) -> bool {
        matches!(self.get(fqn), Some(w) if w.kind == WrapperKind::Unlock)
    }

    /// Classify wrappers from the direct-lock scopes and function bodies.
    ///
    /// A lock wrapper is a function with a scope left unreleased; the first
    /// such scope's field is registered. An unlock wrapper has a release
    /// call but no acquire call among its top-level statements. A function
    /// registered as a lock wrapper is never also an unlock wrapper.
    pub fn identify(&mut self, scopes: &FxHashMap<Fqn, Vec<MutexScope<'_>>>, model: &Model<'_>) {
        for func in &model.funcs {
            let Some(func_scopes) = scopes.get(&func.fqn) else {
                continue;
            };
            for scope in func_scopes {
                if scope.is_unlocked() {
                    continue;
                }
                let (_, field) = syntax::split_selector(scope.selector());
                if !field.is_empty() {
                    self.register(
                        func.fqn.clone(),
                        field.to_string(),
                        WrapperKind::Lock,
                        scope.pos(),
                    );
                    break;
                }
            }
        }

        for func in &model.funcs {
            if self.wrappers.contains_key(&func.fqn) {
                continue;
            }
            let source = model.source(func.file);

            let mut has_lock = false;
            let mut unlock: Option<(String, Pos)> = None;
            for stmt in syntax::block_statements(func.body) {
                if syntax::subject_of_named_call(stmt, &LOCK_METHODS, source).is_some() {
                    has_lock = true;
                }
                if let Some(subject) = syntax::subject_of_named_call(stmt, &UNLOCK_METHODS, source)
                {
                    let selector = syntax::render(subject, source);
                    let (_, field) = syntax::split_selector(&selector);
                    if !field.is_empty() {
                        unlock = Some((field.to_string(), Pos::of(func.file, stmt)));
                    }
                }
            }

            if !has_lock {
                if let Some((field, pos)) = unlock {
                    self.register(func.fqn.clone(), field, WrapperKind::Unlock, pos);
                }
            }
        }
    }
}

/// Re-analyzes a function body recognizing wrapper calls as lock operations.
///
/// Follows the same prefix-adding and branch-forking discipline as the
/// direct tracker; wrapper-opened scopes carry [`WrapperInfo`] so findings
/// can point at the acquisition inside the wrapper.
pub struct WrapperAwareTracker<'p, 'm> {
    inner: LockTracker<'p, 'm>,
    registry: &'m WrapperRegistry,
}

impl<'p, 'm> WrapperAwareTracker<'p, 'm> {
    #[must_use]
    pub fn new(ctx: TrackCtx<'p, 'm>, registry: &'m WrapperRegistry) -> Self {
        WrapperAwareTracker {
            inner: LockTracker::new(ctx),
            registry,
        }
    }

    /// Analyze every statement of a block.
    pub fn analyze_block(&mut self, block: Node<'p>) {
        for stmt in syntax::block_statements(block) {
            self.track(stmt);
        }
    }

    /// Finalize and return the produced scopes.
    #[must_use]
    pub fn finish(mut self) -> Vec<MutexScope<'p>> {
        self.inner.end_block();
        self.inner.into_scopes()
    }

    fn track(&mut self, stmt: Node<'p>) {
        self.inner.add_statement_prefixes(stmt);
        self.track_wrapper_call(stmt);
        self.inner.track_ops(stmt);
        self.track_nested(stmt);
    }

    /// Recognize a top-level call (or deferred call) to a wrapper method.
    fn track_wrapper_call(&mut self, stmt: Node<'p>) {
        let ctx = self.inner.ctx();

        if let Some(call) = syntax::call_of(stmt) {
            if let Some((wrapper, selector)) = self.wrapper_at(call) {
                match wrapper.kind {
                    WrapperKind::Lock => {
                        let info = WrapperInfo {
                            fqn: wrapper.fqn.clone(),
                            lock_pos: wrapper.lock_pos,
                        };
                        self.inner.start_scope(selector, ctx.pos(stmt), Some(info));
                    }
                    WrapperKind::Unlock => self.inner.end_scope(&selector),
                }
            }
        }

        if let Some(call) = syntax::defer_call(stmt) {
            if let Some((wrapper, selector)) = self.wrapper_at(call) {
                if wrapper.kind == WrapperKind::Unlock {
                    self.inner.add_deferred(selector);
                }
            }
        }
    }

    /// Resolve a call to a registered wrapper and compute the effective
    /// selector `<call-receiver-root>.<mutex-field>`.
    fn wrapper_at(&self, call: Node<'p>) -> Option<(&'m WrapperMethod, String)> {
        let ctx = self.inner.ctx();
        let fqn = ctx.model.resolve_call(ctx.func, call)?;
        let wrapper = self.registry.get(&fqn)?;

        let selector = syntax::callee_selector(call)?;
        let receiver = syntax::root_of(selector)?;
        let root = syntax::text(receiver, ctx.source());
        Some((wrapper, format!("{root}.{}", wrapper.mutex_field)))
    }

    fn track_nested(&mut self, stmt: Node<'p>) {
        match stmt.kind() {
            "if_statement" => {
                if let Some(body) = stmt.child_by_field_name("consequence") {
                    self.run_branch(|t| t.analyze_block(body));
                }
                if let Some(alt) = stmt.child_by_field_name("alternative") {
                    self.run_branch(|t| match alt.kind() {
                        "block" => t.analyze_block(alt),
                        "if_statement" => t.track(alt),
                        _ => {}
                    });
                }
            }
            "for_statement" => {
                if let Some(body) = stmt.child_by_field_name("body") {
                    self.analyze_block(body);
                }
            }
            "expression_switch_statement" | "type_switch_statement" | "select_statement" => {
                for case in switch_cases(stmt) {
                    self.run_branch(|t| {
                        for inner in syntax::case_body(case) {
                            t.track(inner);
                        }
                    });
                }
            }
            "block" => self.analyze_block(stmt),
            _ => {}
        }
    }

    fn run_branch(&mut self, branch_body: impl FnOnce(&mut Self)) {
        let marks = self.inner.fork_marks();
        let mut branch = WrapperAwareTracker {
            inner: self.inner.fork(),
            registry: self.registry,
        };
        branch_body(&mut branch);
        branch.inner.end_block();
        let finished = branch.inner.take_finished();
        self.inner.merge_branch(finished, &marks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Package;
    use crate::syntax::render;

    const WRAPPER_FIXTURE: &str = r#"
package tests

import "sync"

type wrapper struct {
	m     sync.Mutex
	count int
}

func (w *wrapper) Acquire() {
	w.m.Lock()
}

func (w *wrapper) Release() {
	w.m.Unlock()
}

func (w *wrapper) doSomeWork() {
	w.m.Lock()
	defer w.m.Unlock()
	w.count = 1
}

func (w *wrapper) Test() {
	w.Acquire()
	defer w.Release()
	if w.count > 0 {
		w.Acquire()
		w.count = 0
		w.Release()
	}
}
"#;

    fn direct_scopes<'p>(
        model: &'p Model<'p>,
    ) -> FxHashMap<Fqn, Vec<MutexScope<'p>>> {
        let mut scopes = FxHashMap::default();
        for func in &model.funcs {
            let ctx = TrackCtx { model, func };
            let mut tracker = LockTracker::new(ctx);
            tracker.track_block(func.body, true);
            tracker.end_block();
            if tracker.has_scopes() {
                scopes.insert(func.fqn.clone(), tracker.into_scopes());
            }
        }
        scopes
    }

    #[test]
    fn classifies_lock_and_unlock_wrappers() {
        let pkg = Package::parse("example/tests", [("w.go", WRAPPER_FIXTURE)]).unwrap();
        let model = Model::build(&pkg);
        let scopes = direct_scopes(&model);

        let mut registry = WrapperRegistry::new();
        registry.identify(&scopes, &model);

        let acquire = Fqn::method("example/tests", "wrapper", "Acquire");
        let release = Fqn::method("example/tests", "wrapper", "Release");
        let self_contained = Fqn::method("example/tests", "wrapper", "doSomeWork");

        assert!(registry.is_lock_wrapper(&acquire));
        assert_eq!(registry.get(&acquire).unwrap().mutex_field, "m");
        assert!(registry.is_unlock_wrapper(&release));
        assert!(registry.get(&self_contained).is_none());
    }

    #[test]
    fn wrapper_calls_open_and_close_logical_scopes() {
        let pkg = Package::parse("example/tests", [("w.go", WRAPPER_FIXTURE)]).unwrap();
        let model = Model::build(&pkg);
        let scopes = direct_scopes(&model);
        let mut registry = WrapperRegistry::new();
        registry.identify(&scopes, &model);

        let test_fn = model.funcs.iter().find(|f| f.name == "Test").unwrap();
        let ctx = TrackCtx {
            model: &model,
            func: test_fn,
        };
        let mut tracker = WrapperAwareTracker::new(ctx, &registry);
        tracker.analyze_block(test_fn.body);
        let produced = tracker.finish();

        assert_eq!(produced.len(), 1);
        let scope = &produced[0];
        assert_eq!(scope.selector(), "w.m");
        assert!(scope.is_unlocked(), "deferred Release closes the scope");
        let wrapper = scope.wrapper().expect("wrapper attribution");
        assert_eq!(wrapper.fqn.short_name(), "wrapper:Acquire");

        let src = WRAPPER_FIXTURE.as_bytes();
        let nodes: Vec<String> = scope.nodes().iter().map(|n| render(*n, src)).collect();
        assert!(
            nodes.contains(&"w.Acquire()".to_string()),
            "the branch-local reacquisition is recorded in the scope: {nodes:?}"
        );
    }

    #[test]
    fn unlock_wrapper_requires_no_lock_in_body() {
        let source = r#"
package tests

type q struct{}

func (x *q) Cycle() {
	x.m.Lock()
	x.m.Unlock()
}
"#;
        let pkg = Package::parse("example/tests", [("q.go", source)]).unwrap();
        let model = Model::build(&pkg);
        let scopes = direct_scopes(&model);
        let mut registry = WrapperRegistry::new();
        registry.identify(&scopes, &model);

        let cycle = Fqn::method("example/tests", "q", "Cycle");
        assert!(registry.get(&cycle).is_none());
    }
}
