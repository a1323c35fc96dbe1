//! Linear pipelines that succeed

use crate::helpers::*;
use cirun::core::{JobState, StepOutcome};
use cirun::execution::ExecutionEvent;
use cirun::runner::StreamKind;

const CHAIN: &str = r#"
name: pyani
variables:
  PYTHONUNBUFFERED: 1
  LEVEL: pipeline
jobs:
  lint:
    working_directory: ~/repo
    environment:
      LEVEL: job
    steps:
      - checkout
      - run:
          name: flake8
          command: flake8 pyani
          environment:
            STEP_ONLY: yes
  test:
    working_directory: ~/repo
    steps:
      - checkout
      - run: pytest -v tests
      - run:
          name: build docs
          command: make html
          working_directory: docs
  package:
    steps:
      - run: python setup.py sdist
workflows:
  main:
    jobs:
      - lint
      - test:
          requires: [lint]
      - package:
          requires: [test]
"#;

#[tokio::test]
async fn test_jobs_run_in_requires_order() {
    let harness = Harness::new(MockRunner::new());
    let result = harness.run(CHAIN).await;

    assert_completed(&result);
    assert_eq!(result.start_order(), vec!["lint", "test", "package"]);
    for job in ["lint", "test", "package"] {
        assert!(matches!(result.state(job), JobState::Completed { attempts: 1, .. }));
    }
    assert_eq!(
        result.steps_with("test", StepOutcome::Success),
        vec!["Checkout code", "pytest -v tests", "build docs"]
    );
    assert_eq!(result.pipeline.state.completed_jobs, 3);
}

#[tokio::test]
async fn test_step_environment_layers() {
    let mut harness = Harness::new(MockRunner::new());
    harness
        .overrides
        .insert("PYTHONUNBUFFERED".to_string(), "0".to_string());
    let result = harness.run(CHAIN).await;
    assert_completed(&result);

    let calls = harness.runner.calls_matching("flake8");
    assert_eq!(calls.len(), 1);
    let env = &calls[0].env;
    let workspace = harness.job_workspace(&result, "lint");

    assert_eq!(env["CI"], "true");
    assert_eq!(env["CI_JOB"], "lint");
    assert_eq!(env["CI_BRANCH"], "master");
    assert_eq!(env["CI_REVISION"], "4f2a9c1");
    assert_eq!(env["HOME"], workspace.display().to_string());
    assert_eq!(env["BASH_ENV"], workspace.join(".bash_env").display().to_string());
    assert_eq!(env["LEVEL"], "job");
    assert_eq!(env["STEP_ONLY"], "yes");
    assert_eq!(env["PYTHONUNBUFFERED"], "0");
    assert_eq!(calls[0].working_dir, workspace.join("repo"));
}

#[tokio::test]
async fn test_checkout_and_working_directories() {
    let mut harness = Harness::new(MockRunner::new());
    harness.keep_workspace = true;
    let result = harness.run(CHAIN).await;
    assert_completed(&result);

    let repo = harness.job_workspace(&result, "test").join("repo");
    assert!(exists_under(&repo, "requirements.txt"));
    assert!(exists_under(&repo, "setup.py"));

    let docs = harness.runner.calls_matching("make html");
    assert_eq!(docs[0].working_dir, repo.join("docs"));
    assert!(repo.join("docs").is_dir());
}

#[tokio::test]
async fn test_workspace_removed_after_job() {
    let harness = Harness::new(MockRunner::new());
    let result = harness.run(CHAIN).await;
    assert_completed(&result);

    assert!(!harness.job_workspace(&result, "lint").exists());
}

#[tokio::test]
async fn test_output_streamed_as_events() {
    let harness = Harness::new(
        MockRunner::new().on("pytest", MockResponse::ok("collected 12 items\n12 passed\n")),
    );
    let result = harness.run(CHAIN).await;
    assert_completed(&result);

    let lines: Vec<&str> = result
        .events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::StepOutput {
                job_id,
                stream: StreamKind::Stdout,
                line,
            } if job_id == "test" => Some(line.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(lines, vec!["collected 12 items", "12 passed"]);

    let pytest = result
        .steps("test")
        .iter()
        .find(|s| s.name == "pytest -v tests")
        .unwrap();
    assert_eq!(pytest.exit_code, Some(0));
    assert!(pytest.output.contains("12 passed"));
}

#[tokio::test]
async fn test_artifacts_and_test_results_stored() {
    let yaml = r#"
name: pyani
jobs:
  test:
    working_directory: ~/repo
    steps:
      - checkout
      - run: pytest --junitxml=test-reports/junit.xml
      - store_test_results:
          path: test-reports
      - store_artifacts:
          path: tests/test_output
          destination: tests
      - store_artifacts:
          path: missing-dir
"#;
    let harness = Harness::new(
        MockRunner::new().on(
            "pytest",
            MockResponse::ok("")
                .creating("test-reports/junit.xml", "<testsuite/>")
                .creating("tests/test_output/anim/ANIm.tab", "1.0\n"),
        ),
    );
    let result = harness.run(yaml).await;
    assert_completed(&result);

    let job_dir = harness
        .artifacts()
        .job_dir(result.pipeline.state.execution_id, "test");
    assert!(exists_under(&job_dir, "test-results/test-reports/junit.xml"));
    assert!(exists_under(&job_dir, "tests/anim/ANIm.tab"));

    let stored = result
        .events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::ArtifactStored { .. }))
        .count();
    assert_eq!(stored, 2);
    // A missing artifact path is not an error
    assert_eq!(result.steps_with("test", StepOutcome::Failed), Vec::<String>::new());
}

#[tokio::test]
async fn test_coverage_upload_runs_uploader() {
    let yaml = r#"
name: pyani
variables:
  CODECOV_TOKEN: secret
jobs:
  test:
    steps:
      - run: pytest --cov-report=xml
      - upload_coverage:
          file: coverage.xml
          flags: [unittests]
          token_env: CODECOV_TOKEN
"#;
    let harness = Harness::new(
        MockRunner::new().on("pytest", MockResponse::ok("").creating("coverage.xml", "<coverage/>")),
    );
    let result = harness.run(yaml).await;
    assert_completed(&result);

    let uploads = harness.runner.calls_matching("codecov");
    assert_eq!(uploads.len(), 1);
    let script = &uploads[0].script;
    assert!(script.contains("coverage.xml"));
    assert!(script.contains("-F unittests"));
    assert!(script.contains("-t \"$CODECOV_TOKEN\""));
    assert_eq!(uploads[0].env["CODECOV_TOKEN"], "secret");
}

#[tokio::test]
async fn test_coverage_upload_names_report_inside_container() {
    use cirun::runner::{ContainerEngine, ContainerRunner, RunnerConfig};

    let yaml = r#"
name: pyani
jobs:
  test:
    image: circleci/python:3.8
    working_directory: ~/repo
    steps:
      - run: pytest --cov-report=xml
      - upload_coverage:
          file: coverage.xml
"#;
    let harness = Harness::new(
        MockRunner::new().on("pytest", MockResponse::ok("").creating("coverage.xml", "<coverage/>")),
    );
    harness.run(yaml).await;

    let uploads = harness.runner.calls_matching("codecov");
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].script, "codecov -f coverage.xml");

    let workspace = uploads[0].workspace.display().to_string();
    let args = ContainerRunner::new(ContainerEngine::Docker, RunnerConfig::default())
        .run_args(&uploads[0])
        .unwrap();
    let mount = format!("{}:/workspace", workspace);
    for arg in args.iter().filter(|a| **a != mount) {
        assert!(!arg.contains(&workspace), "host workspace path in {}", arg);
    }
    assert!(args.contains(&"/workspace/repo".to_string()));
}
