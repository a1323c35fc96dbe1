//! Failing steps, skipped dependents, retries and timeouts

use crate::helpers::*;
use cirun::core::{JobState, StepOutcome};
use cirun::execution::{ExecutionEvent, SchedulingStrategy};

const FAILING: &str = r#"
name: pyani
jobs:
  test:
    steps:
      - run: pip install -r requirements.txt
      - run:
          name: run tests
          command: pytest -v
      - run:
          name: build docs
          command: make html
      - run:
          name: collect logs
          command: tar czf logs.tgz logs
          when: always
      - run:
          name: report failure
          command: notify-failure
          when: on_fail
  lint:
    steps:
      - run: flake8 pyani
  publish:
    steps:
      - run: twine upload dist/*
  announce:
    steps:
      - run: echo released
workflows:
  main:
    jobs:
      - test
      - lint
      - publish:
          requires: [test, lint]
      - announce:
          requires: [publish]
"#;

#[tokio::test]
async fn test_failing_step_stops_job() {
    let harness = Harness::new(MockRunner::new().on("pytest", MockResponse::exit(2)));
    let result = harness.run(FAILING).await;

    assert_failed(&result);
    assert_eq!(
        result.steps_with("test", StepOutcome::Success),
        vec![
            "pip install -r requirements.txt",
            "collect logs",
            "report failure"
        ]
    );
    assert_eq!(result.steps_with("test", StepOutcome::Failed), vec!["run tests"]);
    assert_eq!(result.steps_with("test", StepOutcome::Skipped), vec!["build docs"]);
    assert!(harness.runner.calls_matching("make html").is_empty());

    let JobState::Failed { error, attempts, .. } = result.state("test") else {
        panic!("test should fail: {}", result.summary());
    };
    assert_eq!(*attempts, 1);
    assert!(error.contains("run tests"));
    assert!(error.contains("Exited with code 2"));

    let failed_step = &result.steps("test")[1];
    assert_eq!(failed_step.exit_code, Some(2));
}

#[tokio::test]
async fn test_on_fail_step_skipped_when_job_passes() {
    let harness = Harness::new(MockRunner::new());
    let result = harness.run(FAILING).await;

    assert_completed(&result);
    assert_eq!(
        result.steps_with("test", StepOutcome::Skipped),
        vec!["report failure"]
    );
    assert!(harness.runner.calls_matching("notify-failure").is_empty());
}

#[tokio::test]
async fn test_dependents_skipped_independent_jobs_complete() {
    let harness = Harness::new(MockRunner::new().on("pytest", MockResponse::exit(1)));
    let result = harness.run(FAILING).await;

    assert_failed(&result);
    assert!(matches!(result.state("lint"), JobState::Completed { .. }));
    assert!(matches!(
        result.state("publish"),
        JobState::Skipped { reason } if reason.contains("'test'")
    ));
    assert!(matches!(result.state("announce"), JobState::Skipped { .. }));
    assert!(harness.runner.calls_matching("twine").is_empty());

    let skipped: Vec<&str> = result
        .events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::JobSkipped { job_id, .. } => Some(job_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec!["publish", "announce"]);
    assert_eq!(result.pipeline.state.failed_jobs, 1);
    assert_eq!(result.pipeline.state.skipped_jobs, 2);
}

#[tokio::test]
async fn test_parallel_strategy_same_outcome() {
    let harness = Harness::new(MockRunner::new().on("pytest", MockResponse::exit(1)));
    let result = harness.run_with(FAILING, SchedulingStrategy::Parallel).await;

    assert_failed(&result);
    assert!(matches!(result.state("lint"), JobState::Completed { .. }));
    assert!(matches!(result.state("publish"), JobState::Skipped { .. }));
}

#[tokio::test]
async fn test_job_retried_in_fresh_workspace() {
    let yaml = r#"
name: flaky
jobs:
  integration:
    max_retries: 2
    steps:
      - run: touch marker
      - run: ./download-genomes.sh
"#;
    let harness = Harness::new(
        MockRunner::new()
            .on("touch marker", MockResponse::ok("").creating("marker", ""))
            .on("download-genomes", MockResponse::flaky(1)),
    );
    let result = harness.run(yaml).await;

    assert_completed(&result);
    assert!(matches!(
        result.state("integration"),
        JobState::Completed { attempts: 2, .. }
    ));
    assert_eq!(result.start_order(), vec!["integration", "integration"]);

    let retries: Vec<usize> = result
        .events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::JobRetrying { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![2]);
    assert_eq!(harness.runner.calls_matching("touch marker").len(), 2);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let yaml = r#"
name: flaky
jobs:
  integration:
    max_retries: 1
    steps:
      - run: ./download-genomes.sh
"#;
    let harness = Harness::new(MockRunner::new().on("download-genomes", MockResponse::flaky(5)));
    let result = harness.run(yaml).await;

    assert_failed(&result);
    assert!(matches!(
        result.state("integration"),
        JobState::Failed { attempts: 2, .. }
    ));
    assert_eq!(harness.runner.calls().len(), 2);
}

#[tokio::test]
async fn test_no_retry_by_default() {
    let yaml = r#"
name: flaky
jobs:
  integration:
    steps:
      - run: ./download-genomes.sh
"#;
    let harness = Harness::new(MockRunner::new().on("download-genomes", MockResponse::flaky(1)));
    let result = harness.run(yaml).await;

    assert_failed(&result);
    assert_eq!(harness.runner.calls().len(), 1);
}

#[tokio::test]
async fn test_step_timeout_fails_step() {
    let yaml = r#"
name: slow
defaults:
  timeout_secs: 600
jobs:
  test:
    steps:
      - run:
          command: pytest tests/test_slow.py
          timeout_secs: 5
      - run: echo after
"#;
    let harness = Harness::new(MockRunner::new().on("test_slow", MockResponse::timeout()));
    let result = harness.run(yaml).await;

    assert_failed(&result);
    let JobState::Failed { error, .. } = result.state("test") else {
        panic!("expected failure: {}", result.summary());
    };
    assert!(error.contains("Timeout after 5 seconds"), "{}", error);
    assert_eq!(harness.runner.calls()[0].timeout_secs, 5);
    assert!(harness.runner.calls_matching("echo after").is_empty());
}

#[tokio::test]
async fn test_missing_coverage_report_fails() {
    let yaml = r#"
name: coverage
jobs:
  test:
    steps:
      - run: pytest
      - upload_coverage:
          file: coverage.xml
"#;
    let harness = Harness::new(MockRunner::new());
    let result = harness.run(yaml).await;

    assert_failed(&result);
    let JobState::Failed { error, .. } = result.state("test") else {
        panic!("expected failure: {}", result.summary());
    };
    assert!(error.contains("coverage.xml"));
    assert!(harness.runner.calls_matching("codecov").is_empty());
}
