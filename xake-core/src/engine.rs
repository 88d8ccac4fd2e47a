//! Engine configuration and the top-level build driver.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use compact_str::CompactString;
use derivative::Derivative;
use xake_db::Database;
use xake_log::{ConsoleSink, FileSink, Level, LogSink, Logger};
use xake_types::{ExecStatus, Target};

use crate::executor::ExecCore;
use crate::pool::WorkerPool;
use crate::rules::{Rule, RuleSet};
use crate::Error;

/// Configuration for one build invocation.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ExecOptions {
    /// Directory globs and file targets are resolved against.
    pub project_root: PathBuf,
    /// Worker pool cap. Defaults to the number of logical CPUs.
    pub threads: usize,
    /// Initial targets; defaults to `["main"]` when empty.
    pub want: Vec<String>,
    /// Path of the file log; no file sink when unset.
    pub file_log: Option<PathBuf>,
    /// Level of the file sink.
    pub file_log_level: Level,
    /// Level of the console sink.
    pub con_log_level: Level,
    /// Additional sink composed with the built-ins.
    #[derivative(Debug = "ignore")]
    pub custom_logger: Option<Box<dyn LogSink>>,
    /// Script-level `(name, value)` pairs.
    pub vars: Vec<(String, String)>,
    /// Re-raise on failure instead of reporting through the summary.
    pub fail_on_error: bool,
}

impl ExecOptions {
    pub fn new<P: AsRef<Path>>(project_root: P) -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(2);
        ExecOptions {
            project_root: project_root.as_ref().to_path_buf(),
            threads,
            want: Vec::new(),
            file_log: None,
            file_log_level: Level::Chatty,
            con_log_level: Level::Normal,
            custom_logger: None,
            vars: Vec::new(),
            fail_on_error: true,
        }
    }
}

/// Outcome of a whole build invocation.
#[derive(Debug)]
pub struct BuildSummary {
    /// Combined status of the demanded targets.
    pub status: ExecStatus,
    /// Failures observed when `fail_on_error` is disabled.
    pub failures: Vec<Error>,
}

impl BuildSummary {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The build engine: a rule set plus the options to run it with.
///
/// The rule set is fixed once [`run`] starts.
///
/// [`run`]: Engine::run
#[derive(Debug)]
pub struct Engine {
    options: ExecOptions,
    rules: RuleSet,
}

impl Engine {
    pub fn new(options: ExecOptions) -> Self {
        Engine {
            options,
            rules: RuleSet::new(),
        }
    }

    /// Append a rule. Rules are matched in registration order.
    pub fn add_rule(&mut self, rule: Rule) -> &mut Self {
        self.rules.add(rule);
        self
    }

    /// Add names to the initial want list.
    pub fn want<I, S>(&mut self, names: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.want.extend(names.into_iter().map(Into::into));
        self
    }

    /// Run the build: resolve the want list, execute everything outdated,
    /// persist the results.
    pub async fn run(mut self) -> anyhow::Result<BuildSummary> {
        let logger = build_logger(&mut self.options);

        let db = match Database::open(&self.options.project_root) {
            Ok(db) => db,
            Err(err) => {
                logger.write(
                    Level::Quiet,
                    format!("Build database is unusable ({err}), continuing with an empty one"),
                );
                Database::ephemeral()
            }
        };

        let vars: BTreeMap<CompactString, String> = std::mem::take(&mut self.options.vars)
            .into_iter()
            .map(|(name, value)| (CompactString::from(name), value))
            .collect();

        let core = Arc::new(ExecCore {
            project_root: self.options.project_root.clone(),
            rules: self.rules,
            db: db.clone(),
            pool: WorkerPool::new(self.options.threads),
            logger: logger.clone(),
            vars,
            dirty_memo: Mutex::new(HashMap::new()),
        });

        let want = if self.options.want.is_empty() {
            vec!["main".to_string()]
        } else {
            std::mem::take(&mut self.options.want)
        };
        logger.write(Level::Loud, format!("Building {}", want.join(", ")));
        let targets: Vec<Target> = want
            .iter()
            .map(|name| core.rules.resolve(&core.project_root, name))
            .collect();

        let started = Instant::now();
        let outcome = Arc::clone(&core).exec_many(targets).await;
        let elapsed = started.elapsed();

        if let Err(err) = db.close_and_flush().await {
            logger.write(Level::Quiet, format!("Failed to flush build database: {err}"));
        }

        let summary = match outcome {
            Ok((status, _depends)) => {
                logger.write(Level::Normal, format!("Build completed in {elapsed:.2?}"));
                Ok(BuildSummary {
                    status,
                    failures: Vec::new(),
                })
            }
            Err(err) => {
                logger.write(Level::Quiet, format!("Build failed in {elapsed:.2?}: {err}"));
                if self.options.fail_on_error {
                    Err(anyhow::Error::new(err))
                } else {
                    Ok(BuildSummary {
                        status: ExecStatus::Skipped,
                        failures: err.flatten(),
                    })
                }
            }
        };

        logger.flush().await;
        summary
    }
}

fn build_logger(options: &mut ExecOptions) -> Logger {
    let mut sinks: Vec<Box<dyn LogSink>> = Vec::new();
    if options.con_log_level != Level::Silent {
        sinks.push(Box::new(ConsoleSink::new(options.con_log_level)));
    }
    if let Some(path) = &options.file_log {
        if options.file_log_level != Level::Silent {
            match FileSink::create(path, options.file_log_level) {
                Ok(sink) => sinks.push(Box::new(sink)),
                Err(err) => {
                    tracing::warn!(path = ?path, %err, "failed to open the build log file");
                }
            }
        }
    }
    if let Some(custom) = options.custom_logger.take() {
        sinks.push(custom);
    }
    Logger::new(sinks)
}
