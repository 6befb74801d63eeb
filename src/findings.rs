//! Structured, renderer-agnostic findings.
//!
//! The engine reports two kinds of defects: a reentrant acquisition of a
//! mutex that is already held, and a `return` that leaves an acquired lock
//! without a release. Each finding carries the source locations a renderer
//! needs, plus wrapper attribution when the origin lock went through a
//! lock-wrapper method.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A resolved source location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    /// File path as supplied to the package.
    pub file: String,
    /// Line number (1-indexed).
    pub line: usize,
    /// Column number (1-indexed).
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Attribution of a lock acquired through a wrapper method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrapperSite {
    /// Short name of the wrapper, `Type:method`.
    pub name: String,
    /// Location of the acquisition inside the wrapper body.
    pub lock: Location,
}

/// A lock acquired while the same mutex is already held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reentrant {
    /// Where the mutex was first acquired.
    pub origin: Location,
    /// The offending second acquisition (direct, or the call leading to it).
    pub second_lock: Location,
    /// Set when the origin acquisition went through a wrapper method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrapper: Option<WrapperSite>,
}

/// A `return` reached while a lock is held with no deferred release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingRelease {
    /// Where the leaked lock was acquired.
    pub lock: Location,
    /// The return statement that leaves the lock held.
    pub return_pos: Location,
    /// Set when the acquisition went through a wrapper method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrapper: Option<WrapperSite>,
}

/// A single analysis finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    Reentrant(Reentrant),
    MissingRelease(MissingRelease),
}

impl Finding {
    /// The location the finding is reported at: the second acquisition for
    /// reentrancy, the return statement for a missing release. Findings at
    /// the same target location deduplicate to one.
    #[must_use]
    pub fn target(&self) -> &Location {
        match self {
            Finding::Reentrant(r) => &r.second_lock,
            Finding::MissingRelease(m) => &m.return_pos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_displays_file_and_line() {
        let loc = Location {
            file: "pkg/queue.go".to_string(),
            line: 42,
            column: 3,
        };
        assert_eq!(loc.to_string(), "pkg/queue.go:42");
    }

    #[test]
    fn findings_serialize_with_kind_tag() {
        let finding = Finding::Reentrant(Reentrant {
            origin: Location {
                file: "a.go".into(),
                line: 3,
                column: 2,
            },
            second_lock: Location {
                file: "a.go".into(),
                line: 6,
                column: 2,
            },
            wrapper: None,
        });
        let json = serde_json::to_value(&finding).unwrap();
        assert_eq!(json["kind"], "reentrant");
        assert_eq!(json["second_lock"]["line"], 6);
        assert!(json.get("wrapper").is_none());
    }
}
