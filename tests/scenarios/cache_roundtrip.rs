//! Dependency cache restored across runs

use crate::helpers::*;
use cirun::core::JobState;
use cirun::execution::ExecutionEvent;
use cirun::persistence::DirectoryCacheStore;

const CACHED: &str = r#"
name: pyani
jobs:
  build:
    working_directory: ~/repo
    steps:
      - checkout
      - restore_cache:
          keys:
            - v1-dependencies-{{ .Branch }}-{{ checksum "requirements.txt" }}
            - v1-dependencies-
      - run:
          name: install dependencies
          command: |
            python3 -m venv venv
            . venv/bin/activate
            pip install -r requirements.txt
      - save_cache:
          key: v1-dependencies-{{ .Branch }}-{{ checksum "requirements.txt" }}
          paths:
            - ./venv
      - run: pytest -v
"#;

fn runner() -> MockRunner {
    MockRunner::new().on(
        "python3 -m venv",
        MockResponse::ok("Successfully installed biopython")
            .creating("venv/bin/activate", "# venv\n")
            .creating("venv/lib/site-packages/Bio/__init__.py", ""),
    )
}

fn restored(result: &RunResult) -> Option<(String, String)> {
    result.events.iter().find_map(|e| match e {
        ExecutionEvent::CacheRestored {
            key, matched_key, ..
        } => Some((key.clone(), matched_key.clone())),
        _ => None,
    })
}

fn saved(result: &RunResult) -> Vec<String> {
    result
        .events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::CacheSaved { key, .. } => Some(key.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_first_run_misses_then_saves() {
    let harness = Harness::new(runner());
    let result = harness.run(CACHED).await;
    assert_completed(&result);

    assert!(restored(&result).is_none());
    let misses: Vec<&Vec<String>> = result
        .events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::CacheMiss { keys, .. } => Some(keys),
            _ => None,
        })
        .collect();
    assert_eq!(misses.len(), 1);
    assert_eq!(misses[0].len(), 2);
    assert!(misses[0][0].starts_with("v1-dependencies-master-"));
    assert_eq!(misses[0][1], "v1-dependencies-");

    let keys = saved(&result);
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0], misses[0][0]);
}

#[tokio::test]
async fn test_second_run_restores_exact_key() {
    let harness = Harness::new(runner());
    let first = harness.run(CACHED).await;
    assert_completed(&first);
    let key = saved(&first).remove(0);

    let second = harness.run(CACHED).await;
    assert_completed(&second);

    assert_eq!(restored(&second), Some((key.clone(), key.clone())));
    // Existing keys are never overwritten
    assert!(saved(&second).is_empty());

    let entry = harness.cache_dir.join(DirectoryCacheStore::entry_id(&key));
    assert!(exists_under(&entry, "entry.json"));
}

#[tokio::test]
async fn test_changed_manifest_falls_back_to_prefix() {
    let harness = Harness::new(runner());
    let first = harness.run(CACHED).await;
    let old_key = saved(&first).remove(0);

    harness.write_source("requirements.txt", "biopython\nmatplotlib\npandas\n");
    let second = harness.run(CACHED).await;
    assert_completed(&second);

    let (requested, matched) = restored(&second).unwrap();
    assert_eq!(requested, "v1-dependencies-");
    assert_eq!(matched, old_key);

    let new_keys = saved(&second);
    assert_eq!(new_keys.len(), 1);
    assert_ne!(new_keys[0], old_key);
}

#[tokio::test]
async fn test_other_branch_restores_by_prefix() {
    let mut harness = Harness::new(runner());
    let master = harness.run(CACHED).await;
    let master_key = saved(&master).remove(0);
    assert!(master_key.starts_with("v1-dependencies-master-"));

    harness.branch = "develop".to_string();
    let develop = harness.run(CACHED).await;
    assert_completed(&develop);

    let (requested, matched) = restored(&develop).unwrap();
    assert_eq!(requested, "v1-dependencies-");
    assert_eq!(matched, master_key);

    let develop_keys = saved(&develop);
    assert_eq!(develop_keys.len(), 1);
    assert!(develop_keys[0].starts_with("v1-dependencies-develop-"));
    // Same manifest, so only the branch segment differs
    assert_eq!(
        develop_keys[0].rsplit('-').next(),
        master_key.rsplit('-').next()
    );
}

#[tokio::test]
async fn test_missing_checksum_file_fails_save() {
    let yaml = r#"
name: pyani
jobs:
  build:
    steps:
      - restore_cache:
          key: v1-{{ checksum "poetry.lock" }}
      - run: pytest
      - save_cache:
          key: v1-{{ checksum "poetry.lock" }}
          paths: [venv]
"#;
    let harness = Harness::new(MockRunner::new());
    let result = harness.run(yaml).await;

    assert_failed(&result);
    let JobState::Failed { error, .. } = result.state("build") else {
        panic!("expected failure: {}", result.summary());
    };
    assert!(error.contains("cache key"), "{}", error);
    // The unrenderable restore key was skipped, not fatal
    assert_eq!(harness.runner.calls_matching("pytest").len(), 1);
}
