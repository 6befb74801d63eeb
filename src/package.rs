//! Package input: parsed Go source files grouped by import path.
//!
//! A [`Package`] owns the source bytes and tree-sitter parse trees of one
//! compilation unit; every analysis pass borrows from it. Packages can be
//! built from in-memory sources (tests, embedding) or discovered on disk,
//! one package per directory in the usual Go layout.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tracing::{debug, warn};
use tree_sitter::{Node, Parser, Tree};

use crate::error::{Error, Result};
use crate::findings::Location;
use crate::syntax::Pos;

/// Directories never descended into during discovery.
const SKIP_DIRS: &[&str] = &["vendor", "testdata", ".git", "node_modules"];

/// A parsed Go source file.
pub struct SourceFile {
    /// Path as given by the caller (used verbatim in diagnostics).
    pub path: String,
    /// Raw source bytes.
    pub source: Vec<u8>,
    /// Tree-sitter parse tree over `source`.
    pub tree: Tree,
}

impl SourceFile {
    /// Parse Go source into a file.
    pub fn parse(path: impl Into<String>, source: impl Into<Vec<u8>>) -> Result<Self> {
        let path = path.into();
        let source = source.into();
        let mut parser = go_parser()?;
        let tree = parser.parse(&source, None).ok_or_else(|| Error::Parse {
            file: path.clone(),
            message: "tree-sitter produced no tree".to_string(),
        })?;
        Ok(SourceFile { path, source, tree })
    }

    /// Read and parse a Go file from disk.
    pub fn read(path: &Path) -> Result<Self> {
        let source = std::fs::read(path).map_err(|e| Error::io(e, path))?;
        Self::parse(path.display().to_string(), source)
    }

    /// Root node of the parse tree.
    #[must_use]
    pub fn root(&self) -> Node<'_> {
        self.tree.root_node()
    }

    /// Text of a 1-indexed source line.
    #[must_use]
    pub fn line_text(&self, line: usize) -> Option<&str> {
        let text = std::str::from_utf8(&self.source).ok()?;
        text.lines().nth(line.checked_sub(1)?)
    }
}

/// One Go package: its import path and parsed files.
pub struct Package {
    /// Import path used to form fully qualified names.
    pub import_path: String,
    /// Parsed source files, in a stable order.
    pub files: Vec<SourceFile>,
}

impl Package {
    /// Build a package from in-memory `(path, source)` pairs.
    pub fn parse<P, S>(import_path: &str, sources: impl IntoIterator<Item = (P, S)>) -> Result<Self>
    where
        P: Into<String>,
        S: Into<Vec<u8>>,
    {
        let mut files = Vec::new();
        for (path, source) in sources {
            files.push(SourceFile::parse(path, source)?);
        }
        Ok(Package {
            import_path: import_path.to_string(),
            files,
        })
    }

    /// Resolve an internal position to a renderer-facing location.
    #[must_use]
    pub fn location(&self, pos: Pos) -> Location {
        Location {
            file: self.files[pos.file].path.clone(),
            line: pos.line,
            column: pos.column,
        }
    }

    /// Look up a file by its diagnostic path.
    #[must_use]
    pub fn file_by_path(&self, path: &str) -> Option<&SourceFile> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// Discover Go packages under a directory, one per subdirectory that
/// contains `.go` files. Honors ignore files the same way the rest of the
/// toolchain does; `vendor` and `testdata` trees are skipped.
///
/// Files that fail to parse are skipped with a warning; a package is only
/// dropped when it ends up with no parsable files.
pub fn discover(root: &Path) -> Result<Vec<Package>> {
    let mut by_dir: Vec<(PathBuf, Vec<PathBuf>)> = Vec::new();

    let walker = WalkBuilder::new(root)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.path().is_dir() && SKIP_DIRS.contains(&name.as_ref()))
        })
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("go") {
            continue;
        }

        let dir = path.parent().unwrap_or(root).to_path_buf();
        match by_dir.iter_mut().find(|(d, _)| *d == dir) {
            Some((_, paths)) => paths.push(path.to_path_buf()),
            None => by_dir.push((dir, vec![path.to_path_buf()])),
        }
    }

    let mut packages = Vec::new();
    for (dir, mut paths) in by_dir {
        paths.sort();
        let import_path = import_path_for(root, &dir);

        let mut files = Vec::new();
        for path in paths {
            match SourceFile::read(&path) {
                Ok(file) => files.push(file),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping file"),
            }
        }
        if files.is_empty() {
            continue;
        }
        debug!(package = %import_path, files = files.len(), "discovered package");
        packages.push(Package { import_path, files });
    }

    packages.sort_by(|a, b| a.import_path.cmp(&b.import_path));
    Ok(packages)
}

/// Import path of a package directory relative to the walk root.
fn import_path_for(root: &Path, dir: &Path) -> String {
    let relative = dir.strip_prefix(root).unwrap_or(dir);
    if relative.as_os_str().is_empty() {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string())
    } else {
        relative.display().to_string().replace('\\', "/")
    }
}

fn go_parser() -> Result<Parser> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_go::LANGUAGE.into())
        .map_err(|e| Error::TreeSitter(e.to_string()))?;
    Ok(parser)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_in_memory_sources() {
        let pkg = Package::parse(
            "example/pkg",
            [("a.go", "package pkg\n"), ("b.go", "package pkg\n")],
        )
        .unwrap();
        assert_eq!(pkg.files.len(), 2);
        assert_eq!(pkg.files[0].root().kind(), "source_file");
    }

    #[test]
    fn line_text_is_one_indexed() {
        let file = SourceFile::parse("x.go", "package pkg\n\nfunc f() {}\n").unwrap();
        assert_eq!(file.line_text(1), Some("package pkg"));
        assert_eq!(file.line_text(3), Some("func f() {}"));
        assert_eq!(file.line_text(99), None);
    }

    #[test]
    fn discover_groups_by_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("queue");
        std::fs::create_dir(&sub).unwrap();

        let mut root_file = std::fs::File::create(dir.path().join("main.go")).unwrap();
        writeln!(root_file, "package main").unwrap();
        let mut sub_file = std::fs::File::create(sub.join("queue.go")).unwrap();
        writeln!(sub_file, "package queue").unwrap();

        // vendor trees are not analyzed
        let vendored = dir.path().join("vendor");
        std::fs::create_dir(&vendored).unwrap();
        let mut v = std::fs::File::create(vendored.join("dep.go")).unwrap();
        writeln!(v, "package dep").unwrap();

        let packages = discover(dir.path()).unwrap();
        assert_eq!(packages.len(), 2);
        assert!(packages.iter().all(|p| p
            .files
            .iter()
            .all(|f| !f.path.contains("vendor"))));
    }
}
