//! Build rules and first-match target resolution.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use compact_str::CompactString;
use derivative::Derivative;
use futures::future::BoxFuture;
use futures::FutureExt;
use xake_types::Target;

use crate::context::TaskContext;

/// The user-supplied body of a rule.
pub type Recipe =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Predicate over an absolute artifact path.
pub type PathPredicate = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

fn wrap<F, Fut>(recipe: F) -> Recipe
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |context| recipe(context).boxed())
}

/// A pattern and the recipe to run when a demanded target matches it.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub enum Rule {
    /// Matches file targets whose root-relative path matches a glob.
    FilePattern {
        pattern: String,
        #[derivative(Debug = "ignore")]
        recipe: Recipe,
    },
    /// Matches file targets for which the predicate holds.
    FileConditional {
        #[derivative(Debug = "ignore")]
        predicate: PathPredicate,
        #[derivative(Debug = "ignore")]
        recipe: Recipe,
    },
    /// Matches a phony target by name.
    Phony {
        name: CompactString,
        #[derivative(Debug = "ignore")]
        recipe: Recipe,
    },
}

impl Rule {
    /// Rule for file targets matching a glob pattern.
    pub fn file<F, Fut>(pattern: impl Into<String>, recipe: F) -> Rule
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Rule::FilePattern {
            pattern: pattern.into(),
            recipe: wrap(recipe),
        }
    }

    /// Rule for file targets selected by a predicate over the absolute path.
    pub fn file_if<P, F, Fut>(predicate: P, recipe: F) -> Rule
    where
        P: Fn(&Path) -> bool + Send + Sync + 'static,
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Rule::FileConditional {
            predicate: Arc::new(predicate),
            recipe: wrap(recipe),
        }
    }

    /// Rule for a phony target.
    pub fn phony<F, Fut>(name: impl Into<CompactString>, recipe: F) -> Rule
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Rule::Phony {
            name: name.into(),
            recipe: wrap(recipe),
        }
    }

    /// A phony target that demands other targets and always reruns.
    ///
    /// `Rule::requires("all", ["app", "docs"])` is the declarative form of a
    /// phony rule whose body needs every listed target.
    pub fn requires<I, S>(name: impl Into<CompactString>, depends: I) -> Rule
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let depends: Arc<Vec<String>> = Arc::new(depends.into_iter().map(Into::into).collect());
        Rule::phony(name, move |context: TaskContext| {
            let depends = Arc::clone(&depends);
            async move {
                context.need(depends.iter().map(String::as_str)).await?;
                context.always_rerun();
                Ok(())
            }
        })
    }

    pub(crate) fn recipe(&self) -> &Recipe {
        match self {
            Rule::FilePattern { recipe, .. }
            | Rule::FileConditional { recipe, .. }
            | Rule::Phony { recipe, .. } => recipe,
        }
    }

    fn matches(&self, target: &Target, project_root: &Path) -> bool {
        match (self, target) {
            (Rule::Phony { name, .. }, Target::Phony(target_name)) => name == target_name,
            (Rule::FileConditional { predicate, .. }, Target::File(artifact)) => {
                predicate(artifact.path())
            }
            (Rule::FilePattern { pattern, .. }, Target::File(artifact)) => {
                xake_fileset::matches(pattern, project_root, artifact.path())
            }
            _ => false,
        }
    }
}

/// Ordered collection of rules. Lookup is first match wins.
#[derive(Debug, Default, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        RuleSet::default()
    }

    /// Append a rule. Earlier rules always win over later ones.
    pub fn add(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// The first rule matching `target`, if any.
    pub fn locate(&self, target: &Target, project_root: &Path) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(target, project_root))
    }

    fn has_phony(&self, name: &str) -> bool {
        self.rules.iter().any(
            |rule| matches!(rule, Rule::Phony { name: rule_name, .. } if rule_name.as_str() == name),
        )
    }

    /// Resolve a demanded name into a target: phony when a phony rule of
    /// that name exists, otherwise a file under the project root.
    pub fn resolve(&self, project_root: &Path, name: &str) -> Target {
        if self.has_phony(name) {
            Target::phony(name)
        } else {
            Target::file(project_root, name)
        }
    }
}
