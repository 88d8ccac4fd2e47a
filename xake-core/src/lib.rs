//! An incremental, parallel build engine.
//!
//! A script declares rules (pattern → recipe) and wants (targets to
//! produce). The engine turns those declarations into a DAG of build tasks,
//! executes outdated tasks concurrently up to a worker cap, records every
//! dependency a recipe actually touched, and on subsequent runs skips
//! targets whose recorded dependencies are all unchanged.

mod context;
mod dirty;
mod engine;
mod error;
mod executor;
mod pool;
mod rules;

#[cfg(test)]
mod tests;

pub use context::TaskContext;
pub use engine::{BuildSummary, Engine, ExecOptions};
pub use error::Error;
pub use rules::{PathPredicate, Recipe, Rule, RuleSet};

pub use xake_fileset::Fileset;
pub use xake_log::{Level, LogSink};
pub use xake_types::{Dependency, ExecStatus, Target, TOLERANCE};
