//! Errors surfaced while executing build targets.

use std::sync::Arc;

/// A build failure.
///
/// Cloneable so that every caller joined on a memoised target future
/// observes the same failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No rule matched the target and nothing exists on disk.
    #[error("Neither rule nor file is found for '{name}'")]
    NoRule { name: String },

    /// The recipe raised while executing. Nothing was persisted, the next
    /// run re-attempts the target.
    #[error("recipe for '{target}' failed: {source}")]
    Recipe {
        target: String,
        source: Arc<anyhow::Error>,
    },

    /// The build database rejected an operation.
    #[error("build database error: {message}")]
    Db { message: String },

    /// A filesystem operation failed outside of change detection.
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: Arc<std::io::Error>,
    },

    /// Several independent subtrees failed.
    #[error("{} targets failed: {}", .0.len(), join_messages(.0))]
    Many(Vec<Error>),
}

impl Error {
    /// Flatten into the list of leaf failures.
    pub fn flatten(self) -> Vec<Error> {
        match self {
            Error::Many(errors) => errors.into_iter().flat_map(Error::flatten).collect(),
            other => vec![other],
        }
    }
}

fn join_messages(errors: &[Error]) -> String {
    let messages: Vec<String> = errors.iter().map(|err| err.to_string()).collect();
    messages.join("; ")
}
