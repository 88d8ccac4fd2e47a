//! Orchestrates rule lookup, pool submission, and database updates.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use compact_str::CompactString;
use futures::future::BoxFuture;
use futures::FutureExt;
use xake_db::Database;
use xake_log::{Level, Logger};
use xake_types::{Dependency, ExecStatus, Target};

use crate::context::TaskContext;
use crate::pool::WorkerPool;
use crate::rules::{Recipe, RuleSet};
use crate::Error;

/// Shared state for one build invocation.
pub(crate) struct ExecCore {
    pub project_root: PathBuf,
    pub rules: RuleSet,
    pub db: Database,
    pub pool: WorkerPool,
    pub logger: Logger,
    pub vars: BTreeMap<CompactString, String>,
    /// Per-invocation change detector memo.
    pub dirty_memo: Mutex<HashMap<Target, bool>>,
}

impl ExecCore {
    /// Execute a single target, returning its status and the dependency
    /// record the caller should keep for it.
    ///
    /// A target with no rule but an existing file is a pre-existing input:
    /// nothing runs and the caller records a file snapshot instead of an
    /// artifact dependency.
    pub(crate) fn exec_one(
        self: &Arc<Self>,
        target: Target,
    ) -> BoxFuture<'static, Result<(ExecStatus, Dependency), Error>> {
        let core = Arc::clone(self);
        async move {
            let located = core
                .rules
                .locate(&target, &core.project_root)
                .map(|rule| rule.recipe().clone());
            match located {
                Some(recipe) => {
                    let run_core = Arc::clone(&core);
                    let run_target = target.clone();
                    let execution = core.pool.submit(target.clone(), move || {
                        run_core.run_target(run_target, recipe).boxed()
                    });
                    let status = execution.await?;
                    Ok((status, Dependency::Artifact(target)))
                }
                None => match &target {
                    Target::File(artifact) if artifact.exists() => {
                        let mtime = artifact.mtime().map_err(|err| Error::Io {
                            context: format!("failed to stat '{artifact}'"),
                            source: Arc::new(err),
                        })?;
                        let snapshot = Dependency::File {
                            artifact: artifact.clone(),
                            mtime,
                        };
                        Ok((ExecStatus::JustFile, snapshot))
                    }
                    _ => Err(Error::NoRule {
                        name: target.to_string(),
                    }),
                },
            }
        }
        .boxed()
    }

    /// Pool task body for one rule-matched target.
    async fn run_target(
        self: Arc<Self>,
        target: Target,
        recipe: Recipe,
    ) -> Result<ExecStatus, Error> {
        let permit = self.pool.acquire().await;

        let previous = self.db.get(&target).await.map_err(|err| Error::Db {
            message: err.to_string(),
        })?;
        let Some(reason) = self.dirty_reason(&target, previous.as_ref()).await else {
            self.logger
                .write(Level::Normal, format!("Skipped {target} (up to date)"));
            return Ok(ExecStatus::Skipped);
        };

        tracing::debug!(%target, %reason, "rebuilding");
        self.logger
            .write(Level::Loud, format!("Started {target} ({reason})"));

        let context = TaskContext::new(target.clone(), Arc::clone(&self), permit);
        match (recipe)(context.clone()).await {
            Ok(()) => {
                let mut result = context.take_result();
                result.built_at = SystemTime::now();
                // Snapshot the produced artifact, so an input-free file
                // recipe stays fresh until someone touches its output.
                if let Target::File(artifact) = &target {
                    if let Ok(mtime) = artifact.mtime() {
                        result.record(Dependency::File {
                            artifact: artifact.clone(),
                            mtime,
                        });
                    }
                }
                self.db.put(result).await.map_err(|err| Error::Db {
                    message: err.to_string(),
                })?;
                self.logger
                    .write(Level::Normal, format!("Completed {target}"));
                Ok(ExecStatus::Succeeded)
            }
            Err(err) => {
                self.logger
                    .write(Level::Quiet, format!("Failed {target}: {err}"));
                Err(Error::Recipe {
                    target: target.to_string(),
                    source: Arc::new(err),
                })
            }
        }
    }

    /// Execute many targets in parallel, combining their statuses.
    ///
    /// Failures are reported only after every sibling completes; siblings
    /// are never interrupted.
    pub(crate) async fn exec_many(
        self: Arc<Self>,
        targets: Vec<Target>,
    ) -> Result<(ExecStatus, Vec<Dependency>), Error> {
        let executions: Vec<_> = targets
            .into_iter()
            .map(|target| self.exec_one(target))
            .collect();
        let results = futures::future::join_all(executions).await;

        let mut status = ExecStatus::Skipped;
        let mut depends = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok((child_status, dependency)) => {
                    status = status.combine(child_status);
                    depends.push(dependency);
                }
                Err(err) => failures.push(err),
            }
        }

        if failures.is_empty() {
            Ok((status, depends))
        } else if failures.len() == 1 {
            Err(failures.remove(0))
        } else {
            Err(Error::Many(failures))
        }
    }
}
