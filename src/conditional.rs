//! Conditional locks: acquisitions gated by a boolean parameter.
//!
//! The pattern under analysis:
//!
//! ```go
//! func (s *store) helper(lock bool) {
//!     if lock {
//!         s.mu.Lock()
//!         defer s.mu.Unlock()
//!     }
//!     ...
//! }
//! ```
//!
//! Calling `helper(false)` from a region that already holds `s.mu` is safe,
//! and flagging it would drown real findings in noise. The registry records
//! which parameter gates which selector (and with which polarity), then
//! propagates the gate through intermediate callers that pass one of their
//! own boolean parameters along, iterating until no new entries appear.
//! At a call site, `should_skip` proves the gate off only for boolean
//! literal arguments; anything else stays conservatively flagged.

use rustc_hash::FxHashMap;
use tracing::debug;
use tree_sitter::Node;

use crate::fqn::Fqn;
use crate::model::Model;
use crate::syntax::{self, LOCK_METHODS};

/// A lock acquisition gated by a boolean parameter of its function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalLock {
    /// Index of the gating parameter.
    pub param_index: usize,
    /// Name of the gating parameter.
    pub param_name: String,
    /// Selector acquired under the gate, rendered in the callee.
    pub selector: String,
    /// True when the gate is `if !param` rather than `if param`.
    pub negated: bool,
}

/// Conditional locks per function.
#[derive(Default)]
pub struct ConditionalLockRegistry {
    locks: FxHashMap<Fqn, Vec<ConditionalLock>>,
}

impl ConditionalLockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Conditional locks recorded for a function.
    #[must_use]
    pub fn get(&self, fqn: &Fqn) -> &[ConditionalLock] {
        self.locks.get(fqn).map_or(&[], Vec::as_slice)
    }

    /// First pass: detect directly gated acquisitions in every function.
    ///
    /// Only a top-level `if` whose condition is exactly a boolean-parameter
    /// identifier (or its negation) qualifies, and only when the then-block
    /// contains an acquire among its top-level statements.
    pub fn scan(&mut self, model: &Model<'_>) {
        for func in &model.funcs {
            let bool_params = func.bool_params();
            if bool_params.is_empty() {
                continue;
            }
            let source = model.source(func.file);

            for stmt in syntax::block_statements(func.body) {
                if stmt.kind() != "if_statement" {
                    continue;
                }
                let Some(cond) = stmt.child_by_field_name("condition") else {
                    continue;
                };
                let Some((name, negated)) = bool_param_condition(cond, &bool_params, source)
                else {
                    continue;
                };
                let Some(body) = stmt.child_by_field_name("consequence") else {
                    continue;
                };
                let Some(selector) = lock_in_block(body, source) else {
                    continue;
                };

                debug!(func = %func.fqn, param = %name, %selector, negated, "conditional lock");
                self.locks.entry(func.fqn.clone()).or_default().push(ConditionalLock {
                    param_index: bool_params[name],
                    param_name: name.to_string(),
                    selector,
                    negated,
                });
            }
        }
    }

    /// Propagation pass: a caller that forwards one of its own boolean
    /// parameters into a callee's conditional parameter position inherits
    /// the callee's gate. Runs to fixpoint.
    pub fn propagate(&mut self, model: &Model<'_>) {
        let mut rounds = 0usize;
        loop {
            rounds += 1;
            let mut changed = false;

            for func in &model.funcs {
                let bool_params = func.bool_params();
                if bool_params.is_empty() {
                    continue;
                }
                let source = model.source(func.file);

                let mut inherited = Vec::new();
                for stmt in syntax::block_statements(func.body) {
                    let Some(call) = syntax::call_of(stmt) else {
                        continue;
                    };
                    let Some(callee) = model.resolve_call(func, call) else {
                        continue;
                    };
                    let callee_locks = self.get(&callee);
                    if callee_locks.is_empty() {
                        continue;
                    }

                    let args = syntax::call_args(call);
                    for callee_lock in callee_locks {
                        let Some(arg) = args.get(callee_lock.param_index) else {
                            continue;
                        };
                        if arg.kind() != "identifier" {
                            continue;
                        }
                        let arg_name = syntax::text(*arg, source);
                        let Some(&our_index) = bool_params.get(arg_name) else {
                            continue;
                        };
                        inherited.push(ConditionalLock {
                            param_index: our_index,
                            param_name: arg_name.to_string(),
                            selector: callee_lock.selector.clone(),
                            negated: callee_lock.negated,
                        });
                    }
                }

                for lock in inherited {
                    let own = self.locks.entry(func.fqn.clone()).or_default();
                    let duplicate = own.iter().any(|existing| {
                        existing.param_index == lock.param_index
                            && existing.selector == lock.selector
                            && existing.negated == lock.negated
                    });
                    if !duplicate {
                        own.push(lock);
                        changed = true;
                    }
                }
            }

            if !changed {
                break;
            }
        }
        debug!(rounds, "conditional lock propagation reached fixpoint");
    }

    /// Whether a transitive check through `fqn` can be skipped because the
    /// call site statically disables every gate on `held_selector`.
    #[must_use]
    pub fn should_skip(
        &self,
        fqn: &Fqn,
        call: Node<'_>,
        held_selector: &str,
        source: &[u8],
    ) -> bool {
        let locks = self.get(fqn);
        if locks.is_empty() {
            return false;
        }

        let args = syntax::call_args(call);
        for lock in locks {
            if lock.selector != held_selector {
                continue;
            }
            let Some(arg) = args.get(lock.param_index) else {
                continue;
            };
            let Some(value) = syntax::bool_literal(*arg, source) else {
                continue;
            };
            // The gate fires when param == !negated; a literal proving the
            // opposite means the acquisition cannot happen on this path.
            if value == lock.negated {
                return true;
            }
        }
        false
    }
}

/// Match a condition that is exactly a boolean parameter or its negation.
fn bool_param_condition<'s>(
    cond: Node<'_>,
    bool_params: &FxHashMap<&'s str, usize>,
    source: &[u8],
) -> Option<(&'s str, bool)> {
    match cond.kind() {
        "identifier" => {
            let name = syntax::text(cond, source);
            bool_params.get_key_value(name).map(|(&k, _)| (k, false))
        }
        "unary_expression" => {
            let op = cond.child_by_field_name("operator")?;
            if syntax::text(op, source) != "!" {
                return None;
            }
            let operand = cond.child_by_field_name("operand")?;
            if operand.kind() != "identifier" {
                return None;
            }
            let name = syntax::text(operand, source);
            bool_params.get_key_value(name).map(|(&k, _)| (k, true))
        }
        _ => None,
    }
}

/// Selector of an acquire among the top-level statements of a block,
/// direct or deferred.
fn lock_in_block(block: Node<'_>, source: &[u8]) -> Option<String> {
    for stmt in syntax::block_statements(block) {
        if let Some(subject) = syntax::subject_of_named_call(stmt, &LOCK_METHODS, source) {
            return Some(syntax::render(subject, source));
        }
        if let Some(call) = syntax::defer_call(stmt) {
            if let Some(subject) = syntax::subject_of_named_call(call, &LOCK_METHODS, source) {
                return Some(syntax::render(subject, source));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Package;

    const FIXTURE: &str = r#"
package tests

import "sync"

type some struct {
	m  sync.RWMutex
	sm map[string]int
}

func (s *some) conditionalLockHelper(lock bool) {
	if lock {
		s.m.Lock()
		defer s.m.Unlock()
	}
	s.sm["conditional"] = 1
}

func (s *some) negatedConditionalHelper(lock bool) {
	if !lock {
		s.m.Lock()
		defer s.m.Unlock()
	}
	s.sm["negated"] = 1
}

func (s *some) intermediateHelper(lock bool) {
	s.sm["intermediate"] = 1
	s.conditionalLockHelper(lock)
}

func (s *some) outerHelper(lock bool) {
	s.intermediateHelper(lock)
}

func (s *some) Caller() {
	s.conditionalLockHelper(false)
	s.intermediateHelper(true)
}
"#;

    fn registry_for(pkg: &Package) -> (Model<'_>, ConditionalLockRegistry) {
        let model = Model::build(pkg);
        let mut registry = ConditionalLockRegistry::new();
        registry.scan(&model);
        registry.propagate(&model);
        (model, registry)
    }

    #[test]
    fn detects_both_polarities() {
        let pkg = Package::parse("example/tests", [("c.go", FIXTURE)]).unwrap();
        let (_, registry) = registry_for(&pkg);

        let plain = Fqn::method("example/tests", "some", "conditionalLockHelper");
        let negated = Fqn::method("example/tests", "some", "negatedConditionalHelper");

        let locks = registry.get(&plain);
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].selector, "s.m");
        assert!(!locks[0].negated);
        assert_eq!(locks[0].param_index, 0);

        let locks = registry.get(&negated);
        assert_eq!(locks.len(), 1);
        assert!(locks[0].negated);
    }

    #[test]
    fn propagates_through_intermediate_callers() {
        let pkg = Package::parse("example/tests", [("c.go", FIXTURE)]).unwrap();
        let (_, registry) = registry_for(&pkg);

        let mid = Fqn::method("example/tests", "some", "intermediateHelper");
        let outer = Fqn::method("example/tests", "some", "outerHelper");

        assert_eq!(registry.get(&mid).len(), 1);
        assert_eq!(registry.get(&mid)[0].selector, "s.m");
        // Two hops: outerHelper -> intermediateHelper -> conditionalLockHelper.
        assert_eq!(registry.get(&outer).len(), 1);
    }

    #[test]
    fn should_skip_only_on_proving_literals() {
        let pkg = Package::parse("example/tests", [("c.go", FIXTURE)]).unwrap();
        let (model, registry) = registry_for(&pkg);

        let caller = model.funcs.iter().find(|f| f.name == "Caller").unwrap();
        let stmts = syntax::block_statements(caller.body);
        let source = model.source(caller.file);

        let helper_false = syntax::call_of(stmts[0]).unwrap();
        let helper = Fqn::method("example/tests", "some", "conditionalLockHelper");
        assert!(registry.should_skip(&helper, helper_false, "s.m", source));
        assert!(
            !registry.should_skip(&helper, helper_false, "s.other", source),
            "a different held selector is not covered by the gate"
        );

        let mid_true = syntax::call_of(stmts[1]).unwrap();
        let mid = Fqn::method("example/tests", "some", "intermediateHelper");
        assert!(!registry.should_skip(&mid, mid_true, "s.m", source));
    }
}
