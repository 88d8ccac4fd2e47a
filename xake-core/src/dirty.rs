//! Change detection over persisted build results.
//!
//! Target verdicts are memoised per build invocation so evaluating a
//! dependency DAG stays linear in its size. Filesystem errors during
//! detection make a target dirty with a reason; they are never fatal.

use futures::future::BoxFuture;
use futures::FutureExt;
use xake_types::{same_mtime, BuildResult, Dependency, Target};

use crate::executor::ExecCore;

impl ExecCore {
    /// Decide whether `target` must re-run given its last persisted result.
    ///
    /// `None` means the stored result is still fresh; `Some` carries the
    /// reason it is not.
    pub(crate) async fn dirty_reason(
        &self,
        target: &Target,
        previous: Option<&BuildResult>,
    ) -> Option<String> {
        let Some(previous) = previous else {
            return Some("unknown state".to_string());
        };
        if previous.depends.is_empty() {
            return Some("no dependencies".to_string());
        }
        if let Target::File(artifact) = target {
            if !artifact.exists() {
                return Some("target not found".to_string());
            }
        }
        for dependency in &previous.depends {
            if let Some(reason) = self.dependency_changed(dependency).await {
                return Some(reason);
            }
        }
        None
    }

    async fn dependency_changed(&self, dependency: &Dependency) -> Option<String> {
        match dependency {
            Dependency::AlwaysRerun => Some("always rerun".to_string()),
            Dependency::File { artifact, mtime } => {
                if !artifact.exists() {
                    return Some(format!("'{artifact}' is missing"));
                }
                match artifact.mtime() {
                    Ok(current) if same_mtime(current, *mtime) => None,
                    Ok(_) => Some(format!("'{artifact}' has changed")),
                    Err(err) => Some(format!("failed to stat '{artifact}': {err}")),
                }
            }
            Dependency::Artifact(target) => {
                if let Target::File(artifact) = target {
                    if !artifact.exists() {
                        return Some(format!("'{artifact}' is missing"));
                    }
                }
                if self.target_outdated(target).await {
                    Some(format!("'{target}' is outdated"))
                } else {
                    None
                }
            }
            Dependency::EnvVar { name, value } => {
                let current = std::env::var(name.as_str()).ok();
                (&current != value).then(|| format!("env var '{name}' has changed"))
            }
            Dependency::Var { name, value } => {
                let current = self.vars.get(name.as_str()).cloned();
                (&current != value).then(|| format!("var '{name}' has changed"))
            }
            Dependency::Filelist { fileset, files } => {
                match fileset.expand(&self.project_root) {
                    Ok(current) if &current == files => None,
                    Ok(_) => Some("file list has changed".to_string()),
                    Err(err) => Some(format!("failed to expand fileset: {err}")),
                }
            }
        }
    }

    /// Memoised recursive verdict for a single target.
    fn target_outdated<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, bool> {
        async move {
            {
                let memo = self.dirty_memo.lock().expect("change detector memo poisoned");
                if let Some(&known) = memo.get(target) {
                    return known;
                }
            }

            // A database error means we cannot know the state, which is dirty.
            let previous = self.db.get(target).await.ok().flatten();
            let outdated = self.dirty_reason(target, previous.as_ref()).await.is_some();

            self.dirty_memo
                .lock()
                .expect("change detector memo poisoned")
                .insert(target.clone(), outdated);
            outdated
        }
        .boxed()
    }
}
