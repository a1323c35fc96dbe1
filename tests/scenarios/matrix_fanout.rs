//! Matrix jobs sharing one template

use crate::helpers::*;
use cirun::core::config::PipelineConfig;
use cirun::core::matrix::matrix_groups;
use cirun::core::JobState;
use cirun::execution::SchedulingStrategy;

const MATRIX: &str = r#"
name: pyani
templates:
  python-build:
    working_directory: ~/repo
    steps:
      - checkout
      - run: pip install -r requirements.txt
      - run: pip install -e .
      - run: pytest -v
jobs:
  build:
    template: python-build
    matrix:
      image: ["circleci/python:3.7", "circleci/python:3.8", "circleci/python:3.9"]
  report:
    steps:
      - run: python summarise.py
workflows:
  main:
    jobs:
      - build
      - report:
          requires: [build]
"#;

#[tokio::test]
async fn test_matrix_entries_differ_only_by_image() {
    let config = PipelineConfig::from_yaml(MATRIX).unwrap();
    let expanded = config.expand_jobs().unwrap();
    let groups = matrix_groups(&expanded);

    assert_eq!(groups.len(), 1);
    assert!(groups[0].differs_only_by_image());
    assert_eq!(
        groups[0].images(),
        vec!["circleci/python:3.7", "circleci/python:3.8", "circleci/python:3.9"]
    );
}

#[tokio::test]
async fn test_each_entry_runs_in_its_image() {
    let harness = Harness::new(MockRunner::new());
    let result = harness.run_with(MATRIX, SchedulingStrategy::Parallel).await;
    assert_completed(&result);

    let mut images: Vec<String> = harness
        .runner
        .calls_matching("pytest")
        .into_iter()
        .map(|c| {
            assert_eq!(c.env["CI_IMAGE"], c.image.clone().unwrap_or_default());
            c.image.unwrap_or_default()
        })
        .collect();
    images.sort();
    assert_eq!(
        images,
        vec!["circleci/python:3.7", "circleci/python:3.8", "circleci/python:3.9"]
    );

    for job in ["build-3.7", "build-3.8", "build-3.9"] {
        assert!(matches!(result.state(job), JobState::Completed { .. }));
    }
}

#[tokio::test]
async fn test_base_name_requires_every_entry() {
    let harness = Harness::new(MockRunner::new());
    let result = harness.run(MATRIX).await;
    assert_completed(&result);

    let order = result.start_order();
    assert_eq!(order.len(), 4);
    assert_eq!(order.last().map(String::as_str), Some("report"));
    assert_eq!(
        result.pipeline.job("report").unwrap().requires,
        vec!["build-3.7", "build-3.8", "build-3.9"]
    );
}

#[tokio::test]
async fn test_one_failing_entry_blocks_dependents() {
    let harness = Harness::new(MockRunner::new().on("pip install -e .", MockResponse::exit(1)));
    let config = PipelineConfig::from_yaml(MATRIX).unwrap();
    let mut pipeline = config.to_pipeline(None).unwrap();
    pipeline.select_jobs(&["report".to_string()]).unwrap();
    assert_eq!(pipeline.jobs.len(), 4);

    let result = harness.run_pipeline(pipeline, SchedulingStrategy::LimitedParallel(2)).await;

    assert_failed(&result);
    for job in ["build-3.7", "build-3.8", "build-3.9"] {
        assert!(matches!(result.state(job), JobState::Failed { .. }));
    }
    assert!(matches!(result.state("report"), JobState::Skipped { .. }));
}
