//! The ambient context a running recipe works through.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedSemaphorePermit;
use xake_fileset::Fileset;
use xake_log::Level;
use xake_types::{BuildResult, Dependency, Target};

use crate::executor::ExecCore;

/// Handle a recipe uses to record dependencies, demand other targets, and
/// write to the build log.
///
/// Dependency records are appended in call order. The accumulating
/// [`BuildResult`] has a single logical writer: the recipe this context was
/// created for.
#[derive(Clone)]
pub struct TaskContext {
    target: Target,
    result: Arc<Mutex<BuildResult>>,
    /// Permit held while the recipe body is executing. Handed back while
    /// awaiting `need`ed targets, re-acquired before the recipe resumes.
    permit: Arc<tokio::sync::Mutex<Option<OwnedSemaphorePermit>>>,
    core: Arc<ExecCore>,
}

impl TaskContext {
    pub(crate) fn new(target: Target, core: Arc<ExecCore>, permit: OwnedSemaphorePermit) -> Self {
        TaskContext {
            result: Arc::new(Mutex::new(BuildResult::new(target.clone()))),
            target,
            permit: Arc::new(tokio::sync::Mutex::new(Some(permit))),
            core,
        }
    }

    /// Take the accumulated result once the recipe has returned.
    pub(crate) fn take_result(&self) -> BuildResult {
        let mut result = self.result.lock().expect("task context lock poisoned");
        std::mem::replace(&mut *result, BuildResult::new(self.target.clone()))
    }

    fn record(&self, dependency: Dependency) {
        self.result
            .lock()
            .expect("task context lock poisoned")
            .record(dependency);
    }

    /// The target this recipe is building.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Demand other targets by name, await their execution, and record them
    /// as dependencies.
    ///
    /// A name resolves to a phony target when a phony rule of that name
    /// exists, otherwise to a file under the project root. A failure in any
    /// demanded subtree re-raises here.
    pub async fn need<I, S>(&self, names: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let targets = names
            .into_iter()
            .map(|name| {
                self.core
                    .rules
                    .resolve(&self.core.project_root, name.as_ref())
            })
            .collect();
        self.exec_need(targets).await
    }

    /// As [`need`], but every name is taken as a file target.
    ///
    /// [`need`]: TaskContext::need
    pub async fn need_files<I, S>(&self, names: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::path::Path>,
    {
        let targets = names
            .into_iter()
            .map(|name| Target::file(&self.core.project_root, name))
            .collect();
        self.exec_need(targets).await
    }

    /// Release our permit, execute `targets`, re-acquire, record.
    async fn exec_need(&self, targets: Vec<Target>) -> anyhow::Result<()> {
        {
            // Hand the permit back so a tree of `need` calls cannot exhaust
            // the pool and deadlock on the cap.
            let mut slot = self.permit.lock().await;
            drop(slot.take());
        }

        let outcome = self.core.clone().exec_many(targets).await;

        let permit = self.core.pool.acquire().await;
        {
            let mut slot = self.permit.lock().await;
            *slot = Some(permit);
        }

        let (_status, depends) = outcome?;
        for dependency in depends {
            self.record(dependency);
        }
        Ok(())
    }

    /// Read an OS environment variable, recording the observed value.
    pub fn get_env(&self, name: &str) -> Option<String> {
        let value = std::env::var(name).ok();
        self.record(Dependency::EnvVar {
            name: name.into(),
            value: value.clone(),
        });
        value
    }

    /// Read a script-level variable, recording the observed value.
    pub fn get_var(&self, name: &str) -> Option<String> {
        let value = self.core.vars.get(name).cloned();
        self.record(Dependency::Var {
            name: name.into(),
            value: value.clone(),
        });
        value
    }

    /// Expand a fileset against the project root, recording the expansion.
    pub fn get_files(&self, fileset: &Fileset) -> std::io::Result<Vec<PathBuf>> {
        let files = fileset.expand(&self.core.project_root)?;
        self.record(Dependency::Filelist {
            fileset: fileset.clone(),
            files: files.clone(),
        });
        Ok(files)
    }

    /// Opt this target out of caching: it will re-run on every build.
    pub fn always_rerun(&self) {
        self.record(Dependency::AlwaysRerun);
    }

    /// Write to the build log.
    pub fn write_log(&self, level: Level, message: impl std::fmt::Display) {
        self.core.logger.write(level, message);
    }
}
