//! Smoke test - runs job files end-to-end through a real bash
//!
//! Run with: cargo test --test smoke_test

use cirun::core::config::PipelineConfig;
use cirun::core::{ExecutionStatus, JobState, StepOutcome};
use cirun::execution::{ExecutionEngine, JobExecutor, RunSettings, SchedulingStrategy};
use cirun::persistence::{ArtifactStore, DirectoryCacheStore};
use cirun::runner::ShellRunner;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn engine(root: &Path, strategy: SchedulingStrategy, repository: Option<String>) -> ExecutionEngine {
    let source = root.join("source");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("requirements.txt"), "biopython\n").unwrap();

    let executor = JobExecutor::new(
        Arc::new(ShellRunner::default()),
        Arc::new(DirectoryCacheStore::new(root.join("cache"))),
        ArtifactStore::new(root.join("artifacts")),
        RunSettings {
            branch: "master".to_string(),
            revision: "4f2a9c1".to_string(),
            repository,
            source_dir: source,
            workspace_root: root.join("workspace"),
            ..Default::default()
        },
    );
    ExecutionEngine::new(executor, strategy)
}

async fn run(root: &Path, yaml: &str) -> cirun::Pipeline {
    run_from(root, yaml, None).await
}

async fn run_from(root: &Path, yaml: &str, repository: Option<String>) -> cirun::Pipeline {
    let config = PipelineConfig::from_yaml(yaml).expect("Should parse YAML");
    let mut pipeline = config.to_pipeline(None).unwrap();
    let engine = engine(root, SchedulingStrategy::Sequential, repository);

    tokio::time::timeout(Duration::from_secs(60), engine.execute(&mut pipeline))
        .await
        .expect("pipeline timed out");
    pipeline
}

/// Simple smoke test - runs a minimal pipeline and verifies it works
#[tokio::test]
async fn smoke_test_basic_pipeline() {
    let root = TempDir::new().unwrap();
    let yaml = r#"
name: smoke
variables:
  GREETING: hello
jobs:
  hello:
    working_directory: ~/repo
    steps:
      - checkout
      - run: test -f requirements.txt
      - run: test "$GREETING" = hello
      - run: test "$(pwd -P)" = "$(cd "$HOME/repo" && pwd -P)"
      - run: test "$CI" = true && test "$CI_JOB" = hello
"#;

    let pipeline = run(root.path(), yaml).await;
    assert_eq!(pipeline.state.status, ExecutionStatus::Completed);
    assert!(pipeline.is_complete());
}

#[tokio::test]
async fn smoke_test_checkout_clones_into_workspace_root() {
    let root = TempDir::new().unwrap();
    let upstream = root.path().join("upstream");
    std::fs::create_dir_all(&upstream).unwrap();
    std::fs::write(upstream.join("setup.py"), "setup()\n").unwrap();

    let git_config = [
        "-c", "user.name=cirun",
        "-c", "user.email=cirun@localhost",
        "-c", "commit.gpgsign=false",
    ];
    let commands: [&[&str]; 4] = [
        &["init", "-q"],
        &["add", "."],
        &["commit", "-q", "-m", "initial import"],
        &["branch", "-M", "master"],
    ];
    for args in commands {
        let status = std::process::Command::new("git")
            .args(git_config)
            .args(args)
            .current_dir(&upstream)
            .status();
        match status {
            Ok(status) => assert!(status.success(), "git {:?} failed", args),
            Err(_) => return, // git not installed
        }
    }

    let yaml = r#"
name: smoke
jobs:
  build:
    steps:
      - checkout
      - run: test -f setup.py
      - run: git log --oneline | grep -q "initial import"
      - run: test -f "$BASH_ENV"
"#;
    let repository = format!("file://{}", upstream.display());
    let pipeline = run_from(root.path(), yaml, Some(repository)).await;
    assert_eq!(
        pipeline.state.status,
        ExecutionStatus::Completed,
        "{:?}",
        pipeline.job("build").unwrap().state
    );
}

#[tokio::test]
async fn smoke_test_bash_env_persists_within_job_only() {
    let root = TempDir::new().unwrap();
    let yaml = r#"
name: smoke
jobs:
  setup:
    steps:
      - run: echo 'export VENV_ACTIVE=1' >> $BASH_ENV
      - run: test "$VENV_ACTIVE" = 1
  other:
    steps:
      - run: test -z "${VENV_ACTIVE:-}"
workflows:
  main:
    jobs:
      - setup
      - other:
          requires: [setup]
"#;

    let pipeline = run(root.path(), yaml).await;
    assert_eq!(
        pipeline.state.status,
        ExecutionStatus::Completed,
        "{:?}",
        pipeline.jobs.values().map(|j| (&j.id, &j.state)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn smoke_test_pipefail_and_exit_code() {
    let root = TempDir::new().unwrap();
    let yaml = r#"
name: smoke
jobs:
  broken:
    steps:
      - run:
          name: pipe
          command: false | cat
      - run:
          name: never
          command: echo unreachable
"#;

    let pipeline = run(root.path(), yaml).await;
    assert_eq!(pipeline.state.status, ExecutionStatus::Failed);

    let steps = pipeline.job("broken").unwrap().state.step_results().to_vec();
    assert_eq!(steps[0].outcome, StepOutcome::Failed);
    assert_eq!(steps[0].exit_code, Some(1));
    assert_eq!(steps[1].outcome, StepOutcome::Skipped);
}

#[tokio::test]
async fn smoke_test_step_timeout() {
    let root = TempDir::new().unwrap();
    let yaml = r#"
name: smoke
jobs:
  slow:
    steps:
      - run:
          command: sleep 30
          timeout_secs: 1
"#;

    let pipeline = run(root.path(), yaml).await;
    let JobState::Failed { error, .. } = &pipeline.job("slow").unwrap().state else {
        panic!("slow job should fail");
    };
    assert!(error.contains("Timeout after 1 seconds"), "{}", error);
}

#[tokio::test]
async fn smoke_test_cache_and_coverage() {
    let root = TempDir::new().unwrap();
    let yaml = r#"
name: smoke
jobs:
  build:
    working_directory: ~/repo
    steps:
      - checkout
      - restore_cache:
          keys:
            - v1-deps-{{ checksum "requirements.txt" }}
      - run: test -f venv/ok || (mkdir -p venv && echo built > venv/ok && echo fresh > fresh)
      - save_cache:
          key: v1-deps-{{ checksum "requirements.txt" }}
          paths: [venv]
      - run: echo '<coverage/>' > coverage.xml
      - upload_coverage:
          file: coverage.xml
          uploader: echo
          flags: [unittests]
      - store_artifacts:
          path: coverage.xml
"#;

    let first = run(root.path(), yaml).await;
    assert_eq!(first.state.status, ExecutionStatus::Completed);

    let coverage = first
        .job("build")
        .unwrap()
        .state
        .step_results()
        .iter()
        .find(|s| s.name.starts_with("Uploading coverage"))
        .cloned()
        .unwrap();
    assert!(coverage.output.contains("-F unittests"));

    let artifact = ArtifactStore::new(root.path().join("artifacts"))
        .job_dir(first.state.execution_id, "build")
        .join("coverage.xml");
    assert!(artifact.exists());

    // Second run restores venv, so the build step finds it
    let second = run(root.path(), yaml).await;
    assert_eq!(second.state.status, ExecutionStatus::Completed);
}

#[tokio::test]
#[ignore] // Requires docker
async fn smoke_test_docker_runner() {
    use cirun::runner::{ContainerEngine, ContainerRunner, RunnerConfig};

    let root = TempDir::new().unwrap();
    let executor = JobExecutor::new(
        Arc::new(ContainerRunner::new(ContainerEngine::Docker, RunnerConfig::default())),
        Arc::new(DirectoryCacheStore::new(root.path().join("cache"))),
        ArtifactStore::new(root.path().join("artifacts")),
        RunSettings {
            workspace_root: root.path().join("workspace"),
            source_dir: root.path().to_path_buf(),
            ..Default::default()
        },
    );
    let yaml = r#"
name: docker
jobs:
  build:
    image: python:3.8-slim
    steps:
      - run: python --version
"#;
    let mut pipeline = PipelineConfig::from_yaml(yaml).unwrap().to_pipeline(None).unwrap();
    let status = ExecutionEngine::new(executor, SchedulingStrategy::Sequential)
        .execute(&mut pipeline)
        .await;
    assert_eq!(status, ExecutionStatus::Completed);
}
