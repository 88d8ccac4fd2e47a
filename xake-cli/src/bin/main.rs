//! End-to-end demo of the build engine: declares a tiny script in a scratch
//! workspace and runs it twice, showing the second run skipping fresh
//! targets.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use xake_core::{BuildSummary, Engine, ExecOptions, Level, Rule};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let workspace = tempfile::tempdir()?;
    println!("workspace: {}", workspace.path().display());

    let spinner = ProgressBar::new_spinner().with_message("building...");
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_style(ProgressStyle::with_template("{spinner:.blue} {msg}")?);

    let first = build(workspace.path()).await?;
    let second = build(workspace.path()).await?;
    spinner.finish_and_clear();

    println!("first run:  {:?}", first.status);
    println!("second run: {:?} (greeting.txt was fresh)", second.status);
    Ok(())
}

async fn build(root: &Path) -> anyhow::Result<BuildSummary> {
    let mut options = ExecOptions::new(root);
    options.con_log_level = Level::Loud;
    options.vars = vec![("audience".to_string(), "xake".to_string())];

    let mut engine = Engine::new(options);
    engine.add_rule(Rule::requires("main", ["greeting.txt"]));
    engine.add_rule(Rule::file("greeting.txt", |context| async move {
        let audience = context
            .get_var("audience")
            .unwrap_or_else(|| "world".to_string());
        let path = context
            .target()
            .artifact()
            .context("greeting rule only builds files")?
            .path()
            .to_path_buf();
        std::fs::write(path, format!("hello, {audience}!\n"))?;
        context.write_log(Level::Normal, "wrote greeting.txt");
        Ok(())
    }));
    engine.want(["main"]);
    engine.run().await
}
