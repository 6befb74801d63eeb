//! relock - reentrant mutex lock analysis for Go packages.
//!
//! Detects two classes of locking defects in Go code, per package:
//!
//! - **Reentrant acquisition**: taking a `sync.Mutex`/`sync.RWMutex` that
//!   the current call chain already holds, directly, through wrapper
//!   methods, or through arbitrarily deep synchronous calls on the same
//!   receiver. Go's locks are not reentrant; a read lock taken again while
//!   a writer waits deadlocks.
//! - **Missing release**: an early `return` that leaves an acquired lock
//!   without a direct or deferred release on that path.
//!
//! The analysis is intra-package, receiver-rooted, and synchronous:
//! goroutine bodies and escaping function literals are treated as running
//! after the current region releases its locks.
//!
//! # Example
//!
//! ```
//! use relock::{analyze, Package};
//!
//! let source = r#"
//! package queue
//!
//! import "sync"
//!
//! type Queue struct {
//!     mu sync.Mutex
//! }
//!
//! func (q *Queue) Push() {
//!     q.mu.Lock()
//!     defer q.mu.Unlock()
//!     q.grow()
//! }
//!
//! func (q *Queue) grow() {
//!     q.mu.Lock()
//!     defer q.mu.Unlock()
//! }
//! "#;
//!
//! let pkg = Package::parse("example.com/queue", [("queue.go", source)]).unwrap();
//! let findings = analyze(&pkg);
//! assert_eq!(findings.len(), 1);
//! ```
//!
//! # Limitations
//!
//! Mutex identity is textual: aliasing a mutex through a local variable
//! (`mu := &s.mu`) silently defeats detection. Interface dispatch, locks
//! passed as parameters, and cross-package chains are out of scope.

pub mod analyzer;
pub mod branch;
pub mod conditional;
pub mod error;
pub mod findings;
pub mod fqn;
pub mod model;
pub mod package;
pub mod report;
pub mod scope;
pub mod syntax;
pub mod wrappers;

pub use analyzer::analyze;
pub use error::{Error, Result};
pub use findings::{Finding, Location, MissingRelease, Reentrant, WrapperSite};
pub use fqn::Fqn;
pub use package::{discover, Package, SourceFile};
pub use report::{render_json, render_text};
