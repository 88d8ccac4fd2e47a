use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;
use xake_db::Database;

use crate::{Dependency, Engine, ExecOptions, ExecStatus, Fileset, Level, Rule, Target};

fn quiet_options(root: &Path) -> ExecOptions {
    let mut options = ExecOptions::new(root);
    options.con_log_level = Level::Silent;
    options.threads = 4;
    options
}

/// `main ⇐ [out.txt]`, where `out.txt` is written by its recipe. Counts how
/// often the file recipe actually runs.
fn hello_engine(root: &Path, wrote: &Arc<AtomicUsize>) -> Engine {
    let mut engine = Engine::new(quiet_options(root));
    engine.add_rule(Rule::requires("main", ["out.txt"]));
    let wrote = Arc::clone(wrote);
    engine.add_rule(Rule::file("out.txt", move |context| {
        let wrote = Arc::clone(&wrote);
        async move {
            wrote.fetch_add(1, Ordering::SeqCst);
            let path = context.target().artifact().expect("file target").path().to_path_buf();
            std::fs::write(path, "hello")?;
            Ok(())
        }
    }));
    engine.want(["main"]);
    engine
}

#[tokio::test]
async fn scenario_simple_rebuild() {
    let temp = TempDir::new().unwrap();
    let wrote = Arc::new(AtomicUsize::new(0));

    let summary = hello_engine(temp.path(), &wrote).run().await.unwrap();
    assert_eq!(summary.status, ExecStatus::Succeeded);
    assert_eq!(wrote.load(Ordering::SeqCst), 1);
    let content = std::fs::read_to_string(temp.path().join("out.txt")).unwrap();
    assert_eq!(content, "hello");

    // Second run: the file target is fresh and skips; the phony always
    // reruns, so the build still counts as succeeded.
    let summary = hello_engine(temp.path(), &wrote).run().await.unwrap();
    assert_eq!(summary.status, ExecStatus::Succeeded);
    assert_eq!(wrote.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scenario_touched_output_rebuilds() {
    let temp = TempDir::new().unwrap();
    let wrote = Arc::new(AtomicUsize::new(0));

    hello_engine(temp.path(), &wrote).run().await.unwrap();
    assert_eq!(wrote.load(Ordering::SeqCst), 1);

    // Externally bump the output's mtime by a full second.
    let path = temp.path().join("out.txt");
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(1)).unwrap();
    drop(file);

    hello_engine(temp.path(), &wrote).run().await.unwrap();
    assert_eq!(wrote.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn scenario_touch_within_tolerance_stays_fresh() {
    let temp = TempDir::new().unwrap();
    let wrote = Arc::new(AtomicUsize::new(0));

    hello_engine(temp.path(), &wrote).run().await.unwrap();
    assert_eq!(wrote.load(Ordering::SeqCst), 1);

    let path = temp.path().join("out.txt");
    let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(mtime + Duration::from_millis(50)).unwrap();
    drop(file);

    hello_engine(temp.path(), &wrote).run().await.unwrap();
    assert_eq!(wrote.load(Ordering::SeqCst), 1);
}

fn env_engine(root: &Path, runs: &Arc<AtomicUsize>, var: &'static str) -> Engine {
    let mut engine = Engine::new(quiet_options(root));
    let runs = Arc::clone(runs);
    engine.add_rule(Rule::phony("build", move |context| {
        let runs = Arc::clone(&runs);
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            context.get_env(var);
            Ok(())
        }
    }));
    engine.want(["build"]);
    engine
}

#[tokio::test]
async fn scenario_env_var_invalidation() {
    static VAR: &str = "XAKE_TEST_MODE_ENV_SCENARIO";
    let temp = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    std::env::set_var(VAR, "debug");
    env_engine(temp.path(), &runs, VAR).run().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Same value: the stored env snapshot is unchanged, nothing reruns.
    let summary = env_engine(temp.path(), &runs, VAR).run().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(summary.status, ExecStatus::Skipped);

    std::env::set_var(VAR, "release");
    env_engine(temp.path(), &runs, VAR).run().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn scenario_script_var_invalidation() {
    let temp = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let engine_with_mode = |mode: &str| {
        let mut options = quiet_options(temp.path());
        options.vars = vec![("mode".to_string(), mode.to_string())];
        let mut engine = Engine::new(options);
        let runs = Arc::clone(&runs);
        engine.add_rule(Rule::phony("build", move |context| {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                context.get_var("mode");
                Ok(())
            }
        }));
        engine.want(["build"]);
        engine
    };

    engine_with_mode("debug").run().await.unwrap();
    engine_with_mode("debug").run().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    engine_with_mode("release").run().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn scenario_phony_shadows_existing_file() {
    let temp = TempDir::new().unwrap();
    let marker = temp.path().join("clean");
    std::fs::write(&marker, "stale build outputs").unwrap();

    let mut engine = Engine::new(quiet_options(temp.path()));
    let target_path = marker.clone();
    engine.add_rule(Rule::phony("clean", move |context| {
        let target_path = target_path.clone();
        async move {
            std::fs::remove_file(&target_path)?;
            context.always_rerun();
            Ok(())
        }
    }));
    engine.want(["clean"]);

    let summary = engine.run().await.unwrap();
    assert_eq!(summary.status, ExecStatus::Succeeded);
    assert!(!marker.exists());
}

#[tokio::test]
async fn scenario_missing_rule_and_file_fails() {
    let temp = TempDir::new().unwrap();
    let mut engine = Engine::new(quiet_options(temp.path()));
    engine.want(["ghost"]);

    let err = engine.run().await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("Neither rule nor file is found for"), "{message}");
    assert!(message.contains("ghost"), "{message}");
}

#[tokio::test]
async fn scenario_failures_reported_in_summary() {
    let temp = TempDir::new().unwrap();
    let mut options = quiet_options(temp.path());
    options.fail_on_error = false;
    let mut engine = Engine::new(options);
    engine.want(["ghost"]);

    let summary = engine.run().await.unwrap();
    assert!(!summary.succeeded());
    assert_eq!(summary.failures.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_shared_dependency_runs_once() {
    let temp = TempDir::new().unwrap();
    let shared_runs = Arc::new(AtomicUsize::new(0));

    let mut engine = Engine::new(quiet_options(temp.path()));
    engine.add_rule(Rule::requires("all", ["a", "b"]));
    for name in ["a", "b"] {
        engine.add_rule(Rule::phony(name, move |context| async move {
            context.need(["shared"]).await?;
            context.always_rerun();
            Ok(())
        }));
    }
    let shared_runs_ = Arc::clone(&shared_runs);
    engine.add_rule(Rule::phony("shared", move |context| {
        let shared_runs = Arc::clone(&shared_runs_);
        async move {
            // Stay busy long enough for both parents to request us.
            tokio::time::sleep(Duration::from_millis(30)).await;
            shared_runs.fetch_add(1, Ordering::SeqCst);
            context.always_rerun();
            Ok(())
        }
    }));
    engine.want(["all"]);

    let summary = engine.run().await.unwrap();
    assert_eq!(summary.status, ExecStatus::Succeeded);
    assert_eq!(shared_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scenario_nested_need_does_not_deadlock_at_cap_one() {
    let temp = TempDir::new().unwrap();
    let mut options = quiet_options(temp.path());
    options.threads = 1;

    let mut engine = Engine::new(options);
    engine.add_rule(Rule::phony("top", |context| async move {
        context.need(["mid"]).await?;
        context.always_rerun();
        Ok(())
    }));
    engine.add_rule(Rule::phony("mid", |context| async move {
        context.need(["leaf"]).await?;
        context.always_rerun();
        Ok(())
    }));
    engine.add_rule(Rule::phony("leaf", |context| async move {
        context.always_rerun();
        Ok(())
    }));
    engine.want(["top"]);

    let summary = tokio::time::timeout(Duration::from_secs(10), engine.run())
        .await
        .expect("build deadlocked")
        .unwrap();
    assert_eq!(summary.status, ExecStatus::Succeeded);
}

#[tokio::test]
async fn scenario_filelist_expansion_invalidates() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("a.txt"), "a").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let make_engine = || {
        let mut engine = Engine::new(quiet_options(temp.path()));
        let runs = Arc::clone(&runs);
        engine.add_rule(Rule::phony("list", move |context| {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                context.get_files(&Fileset::new(["*.txt"]))?;
                Ok(())
            }
        }));
        engine.want(["list"]);
        engine
    };

    make_engine().run().await.unwrap();
    make_engine().run().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    std::fs::write(temp.path().join("b.txt"), "b").unwrap();
    make_engine().run().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn scenario_dependencies_recorded_in_call_order() {
    static VAR: &str = "XAKE_TEST_MODE_ORDER_SCENARIO";
    let temp = TempDir::new().unwrap();
    std::env::set_var(VAR, "set");
    std::fs::write(temp.path().join("input.txt"), "input").unwrap();
    std::fs::write(temp.path().join("notes.md"), "notes").unwrap();

    let mut options = quiet_options(temp.path());
    options.vars = vec![("alpha".to_string(), "1".to_string())];
    let mut engine = Engine::new(options);
    engine.add_rule(Rule::phony("build", move |context| async move {
        context.get_var("alpha");
        context.get_env(VAR);
        context.need(["input.txt"]).await?;
        context.get_files(&Fileset::new(["*.md"]))?;
        context.always_rerun();
        Ok(())
    }));
    engine.want(["build"]);
    engine.run().await.unwrap();

    let db = Database::open(temp.path()).unwrap();
    let result = db
        .get(&Target::phony("build"))
        .await
        .unwrap()
        .expect("result should be persisted");
    db.close_and_flush().await.unwrap();

    assert_eq!(result.depends.len(), 5);
    assert!(matches!(&result.depends[0], Dependency::Var { name, .. } if name == "alpha"));
    assert!(matches!(&result.depends[1], Dependency::EnvVar { name, .. } if name == VAR));
    // A demanded plain input file is recorded as a snapshot, not an artifact.
    assert!(matches!(&result.depends[2], Dependency::File { .. }));
    assert!(matches!(
        &result.depends[3],
        Dependency::Filelist { files, .. } if files == &[PathBuf::from("notes.md")]
    ));
    assert!(matches!(&result.depends[4], Dependency::AlwaysRerun));
}

#[tokio::test]
async fn scenario_need_files_records_snapshots() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("data.bin"), [1u8, 2, 3]).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let make_engine = || {
        let mut engine = Engine::new(quiet_options(temp.path()));
        let runs = Arc::clone(&runs);
        engine.add_rule(Rule::phony("pack", move |context| {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                context.need_files(["data.bin"]).await?;
                Ok(())
            }
        }));
        engine.want(["pack"]);
        engine
    };

    make_engine().run().await.unwrap();
    make_engine().run().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Rewriting the input moves its mtime past the tolerance window.
    let path = temp.path().join("data.bin");
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(2)).unwrap();
    drop(file);

    make_engine().run().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn scenario_want_defaults_to_main() {
    let temp = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let mut engine = Engine::new(quiet_options(temp.path()));
    let runs_ = Arc::clone(&runs);
    engine.add_rule(Rule::phony("main", move |context| {
        let runs = Arc::clone(&runs_);
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            context.always_rerun();
            Ok(())
        }
    }));

    let summary = engine.run().await.unwrap();
    assert_eq!(summary.status, ExecStatus::Succeeded);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_thread_cap_bounds_running_recipes() {
    let temp = TempDir::new().unwrap();
    let mut options = quiet_options(temp.path());
    options.threads = 2;

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut engine = Engine::new(options);
    let leaves = ["w1", "w2", "w3", "w4"];
    engine.add_rule(Rule::requires("all", leaves));
    for name in leaves {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        engine.add_rule(Rule::phony(name, move |context| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                context.always_rerun();
                Ok(())
            }
        }));
    }
    engine.want(["all"]);
    engine.run().await.unwrap();

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "peak concurrency was {peak}");
}

#[tokio::test]
async fn scenario_failed_recipe_is_not_cached() {
    let temp = TempDir::new().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));

    let make_engine = |succeed: bool| {
        let mut engine = Engine::new(quiet_options(temp.path()));
        let attempts = Arc::clone(&attempts);
        engine.add_rule(Rule::phony("flaky", move |context| {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                context.get_var("unused");
                if succeed {
                    Ok(())
                } else {
                    anyhow::bail!("transient failure")
                }
            }
        }));
        engine.want(["flaky"]);
        engine
    };

    let err = make_engine(false).run().await.unwrap_err();
    assert!(err.to_string().contains("transient failure"), "{err}");
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    // Nothing was persisted, so the next run re-attempts the target.
    make_engine(true).run().await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // Now the stored result is fresh.
    make_engine(true).run().await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
