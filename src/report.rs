//! Rendering of findings.
//!
//! The text format quotes the trimmed source line at each position and
//! attributes wrapper acquisitions:
//!
//! ```text
//! <file>:<line>: Mutex lock is acquired on this line: <line text>
//!     <file>:<line>: But the same lock was acquired here: <line text> (via <Type:method> at <file>:<line>)
//! ```
//!
//! JSON output is a plain serialization of the findings list.

use std::fmt::Write as _;

use crate::error::Result;
use crate::findings::{Finding, Location, WrapperSite};
use crate::package::Package;

/// Render findings in the human-readable text format.
#[must_use]
pub fn render_text(pkg: &Package, findings: &[Finding]) -> String {
    let mut out = String::new();
    for finding in findings {
        match finding {
            Finding::Reentrant(r) => {
                let _ = writeln!(
                    out,
                    "{}: Mutex lock is acquired on this line: {}",
                    r.second_lock,
                    line_at(pkg, &r.second_lock),
                );
                let _ = writeln!(
                    out,
                    "    {}: But the same lock was acquired here: {}{}",
                    r.origin,
                    line_at(pkg, &r.origin),
                    wrapper_suffix(r.wrapper.as_ref()),
                );
            }
            Finding::MissingRelease(m) => {
                let _ = writeln!(
                    out,
                    "{}: Mutex lock must be released before this line",
                    m.return_pos,
                );
                let _ = writeln!(
                    out,
                    "    {}: Lock was acquired here: {}{}",
                    m.lock,
                    line_at(pkg, &m.lock),
                    wrapper_suffix(m.wrapper.as_ref()),
                );
            }
        }
    }
    out
}

/// Render findings as pretty-printed JSON.
pub fn render_json(findings: &[Finding]) -> Result<String> {
    Ok(serde_json::to_string_pretty(findings)?)
}

fn line_at(pkg: &Package, loc: &Location) -> String {
    pkg.file_by_path(&loc.file)
        .and_then(|f| f.line_text(loc.line))
        .map(|l| l.trim().to_string())
        .unwrap_or_default()
}

fn wrapper_suffix(wrapper: Option<&WrapperSite>) -> String {
    match wrapper {
        Some(w) => format!(" (via {} at {})", w.name, w.lock),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;

    #[test]
    fn text_format_quotes_trimmed_lines() {
        let source = "package p\n\nimport \"sync\"\n\ntype s struct {\n\tmu sync.Mutex\n}\n\nfunc (x *s) f() {\n\tx.mu.Lock()\n\tdefer x.mu.Unlock()\n\tx.mu.Lock()\n\tx.mu.Unlock()\n}\n";
        let pkg = Package::parse("p", [("s.go", source)]).unwrap();
        let findings = analyze(&pkg);
        assert_eq!(findings.len(), 1);

        let text = render_text(&pkg, &findings);
        assert!(
            text.starts_with("s.go:12: Mutex lock is acquired on this line: x.mu.Lock()"),
            "got: {text}"
        );
        assert!(text.contains("    s.go:10: But the same lock was acquired here: x.mu.Lock()"));
    }

    #[test]
    fn json_is_a_findings_array() {
        let source = "package p\n\nfunc (x *s) f() {\n\tx.mu.Lock()\n\tif x.bad {\n\t\treturn\n\t}\n\tx.mu.Unlock()\n}\n";
        let pkg = Package::parse("p", [("s.go", source)]).unwrap();
        let findings = analyze(&pkg);
        let json = render_json(&findings).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value.as_array().unwrap().len(), findings.len());
    }
}
