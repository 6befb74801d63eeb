//! Fully qualified names for functions and methods.
//!
//! An [`Fqn`] uniquely identifies a function within the analyzed package:
//! `<package-path>.<ReceiverType>:<method>` for methods (one level of pointer
//! indirection stripped from the receiver type) and `<package-path>.<name>`
//! for free functions. FQNs are the unit of call-graph identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fully qualified name of a function or method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fqn(String);

impl Fqn {
    /// FQN of a free function: `<pkg>.<name>`.
    #[must_use]
    pub fn function(pkg: &str, name: &str) -> Self {
        Fqn(format!("{pkg}.{name}"))
    }

    /// FQN of a method: `<pkg>.<ReceiverType>:<method>`.
    ///
    /// Strips a leading `*` from the receiver type so that pointer and value
    /// receivers resolve to the same identity.
    #[must_use]
    pub fn method(pkg: &str, recv_type: &str, method: &str) -> Self {
        let recv = recv_type.trim_start_matches('*');
        Fqn(format!("{pkg}.{recv}:{method}"))
    }

    /// The `<ReceiverType>:<method>` (or bare name) tail after the package path.
    ///
    /// Used for wrapper attribution in diagnostics.
    #[must_use]
    pub fn short_name(&self) -> &str {
        match self.0.rfind('.') {
            Some(i) => &self.0[i + 1..],
            None => &self.0,
        }
    }

    /// Full string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_fqn_strips_pointer_receiver() {
        let fqn = Fqn::method("example.com/pkg", "*Queue", "Push");
        assert_eq!(fqn.as_str(), "example.com/pkg.Queue:Push");
        assert_eq!(fqn.short_name(), "Queue:Push");
    }

    #[test]
    fn function_fqn_has_no_receiver_part() {
        let fqn = Fqn::function("pkg", "helper");
        assert_eq!(fqn.as_str(), "pkg.helper");
        assert_eq!(fqn.short_name(), "helper");
    }

    #[test]
    fn short_name_uses_last_dot() {
        let fqn = Fqn::function("example.com/a/b", "run");
        assert_eq!(fqn.short_name(), "run");
    }
}
