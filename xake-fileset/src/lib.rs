//! Filesets and glob matching.
//!
//! A [`Fileset`] is an ordered list of glob patterns resolved against a
//! project root. `*` matches within a single path segment, `**` matches any
//! number of segments. Matching is case-sensitive on every platform.

use std::io;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

/// An ordered collection of glob patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fileset {
    patterns: Vec<String>,
}

impl Fileset {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Fileset {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Expand this fileset against `root`, returning the matching files as
    /// root-relative paths in lexicographic order.
    ///
    /// The result is deterministic for a fixed filesystem snapshot, which is
    /// what allows expansions to be compared across build runs.
    ///
    /// # Errors
    ///
    /// * If a pattern fails to compile.
    /// * If the directory walk hits an I/O error.
    pub fn expand(&self, root: &Path) -> io::Result<Vec<PathBuf>> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.patterns {
            let glob = compile(pattern)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        let mut files = Vec::new();
        walk(root, root, &set, &mut files)?;
        files.sort();
        Ok(files)
    }
}

/// Returns whether `pattern` matches `path` taken relative to `root`.
///
/// A path outside of `root` is matched against its full form.
pub fn matches(pattern: &str, root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let Ok(glob) = compile(pattern) else {
        return false;
    };
    glob.compile_matcher().is_match(relative)
}

/// Compile a single pattern with per-segment `*` semantics.
fn compile(pattern: &str) -> Result<Glob, globset::Error> {
    GlobBuilder::new(pattern).literal_separator(true).build()
}

fn walk(root: &Path, dir: &Path, set: &GlobSet, files: &mut Vec<PathBuf>) -> io::Result<()> {
    // Sort directory entries so the walk order never depends on the
    // filesystem's enumeration order.
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, set, files)?;
        } else if file_type.is_file() {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            if set.is_match(relative) {
                files.push(relative.to_path_buf());
            }
        }
    }
    Ok(())
}
