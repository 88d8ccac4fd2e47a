//! Types used throughout `xake`.
//!
//! The goal of this crate is to be very lightweight, so take care with adding
//! dependencies.

use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use xake_fileset::Fileset;

/// Mtime drift below which a file dependency is considered unchanged.
///
/// Filesystems commonly truncate mtimes to 1 or 2 second granularity; 100ms
/// is enough to recognize our own writes without spuriously invalidating
/// cross-filesystem copies.
pub const TOLERANCE: Duration = Duration::from_millis(100);

/// Returns whether two mtimes are equal within [`TOLERANCE`].
pub fn same_mtime(a: SystemTime, b: SystemTime) -> bool {
    let drift = match a.duration_since(b) {
        Ok(duration) => duration,
        Err(err) => err.duration(),
    };
    drift <= TOLERANCE
}

/// An absolute-path handle to a file on disk.
///
/// Two artifacts are equal when their normalised absolute paths are equal.
/// Normalisation is lexical, `.` and `..` components are folded but symlinks
/// are not resolved.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Artifact {
    path: PathBuf,
}

impl Artifact {
    /// Create an [`Artifact`] for `name` resolved against `root`.
    pub fn new<P: AsRef<Path>>(root: &Path, name: P) -> Self {
        let name = name.as_ref();
        let absolute = if name.is_absolute() {
            name.to_path_buf()
        } else {
            root.join(name)
        };
        Artifact {
            path: normalize(&absolute),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Last modified time of the file, as reported by the filesystem.
    pub fn mtime(&self) -> io::Result<SystemTime> {
        std::fs::metadata(&self.path)?.modified()
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Fold `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

/// The unit of work: a file to produce or a phony name to invoke.
///
/// A phony name shadows a like-named file when both could match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Target {
    File(Artifact),
    Phony(CompactString),
}

impl Target {
    pub fn file<P: AsRef<Path>>(root: &Path, name: P) -> Self {
        Target::File(Artifact::new(root, name))
    }

    pub fn phony(name: impl Into<CompactString>) -> Self {
        Target::Phony(name.into())
    }

    /// The artifact behind this target, if it is a file.
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Target::File(artifact) => Some(artifact),
            Target::Phony(_) => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Target::File(_))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::File(artifact) => write!(f, "{artifact}"),
            Target::Phony(name) => write!(f, "{name}"),
        }
    }
}

/// A dependency observed while a recipe was running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Dependency {
    /// A file was consumed, with the mtime observed at the time.
    File { artifact: Artifact, mtime: SystemTime },
    /// Another target was demanded through `need`.
    Artifact(Target),
    /// An OS environment variable was read.
    EnvVar {
        name: CompactString,
        value: Option<String>,
    },
    /// A script-level variable was read.
    Var {
        name: CompactString,
        value: Option<String>,
    },
    /// A fileset was expanded into a concrete file list.
    Filelist { fileset: Fileset, files: Vec<PathBuf> },
    /// The recipe opted out of caching.
    AlwaysRerun,
}

/// The persisted record of a target's last successful execution.
///
/// `depends` preserves the order in which the recipe requested dependencies.
/// Only persisted on successful completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub target: Target,
    pub built_at: SystemTime,
    pub depends: Vec<Dependency>,
}

impl BuildResult {
    pub fn new(target: Target) -> Self {
        BuildResult {
            target,
            built_at: SystemTime::now(),
            depends: Vec::new(),
        }
    }

    /// Append a dependency record.
    pub fn record(&mut self, dependency: Dependency) {
        self.depends.push(dependency);
    }
}

/// How a target's execution concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The recipe ran to completion.
    Succeeded,
    /// The stored result was still fresh, nothing ran.
    Skipped,
    /// No rule matched, but the file already exists on disk.
    JustFile,
}

impl ExecStatus {
    /// Combine two statuses: `Succeeded` dominates.
    pub fn combine(self, other: ExecStatus) -> ExecStatus {
        match (self, other) {
            (ExecStatus::Succeeded, _) | (_, ExecStatus::Succeeded) => ExecStatus::Succeeded,
            _ => ExecStatus::Skipped,
        }
    }
}
