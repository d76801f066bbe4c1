//! Build lifecycle integration tests.
//!
//! Drive the full scope protocol — enter, command sequence, exit — against
//! the mock engine and mock tracker. No Docker daemon or API server needed.

use std::collections::HashSet;
use std::sync::Arc;

use docbuild_api::MockTracker;
use docbuild_core::settings::TIMEOUT_EXIT_CODE;
use docbuild_core::types::{BuildRecord, Project, Version};
use docbuild_core::{Error, Settings};
use docbuild_environment::{
    BuildCommand, BuildEnvironment, ContainerState, DockerBuildEnvironment, Environment,
    ExecOutcome, MockEngine,
};

// =============================================================================
// Helpers
// =============================================================================

fn project(doc_path: &std::path::Path) -> Project {
    Project {
        id: 12,
        slug: "demo".into(),
        doc_path: doc_path.to_path_buf(),
        container_image: None,
        container_mem_limit: None,
        container_time_limit: None,
        features: HashSet::new(),
    }
}

fn docker_env(
    doc_path: &std::path::Path,
    engine: Arc<MockEngine>,
    tracker: Arc<MockTracker>,
) -> DockerBuildEnvironment {
    let env = BuildEnvironment::new(
        Settings::default(),
        tracker,
        project(doc_path),
        Version {
            id: 5,
            slug: "latest".into(),
        },
        Some(BuildRecord::new(77, 12, 5)),
    );
    DockerBuildEnvironment::new(env).with_engine(engine)
}

fn running_state() -> ContainerState {
    ContainerState {
        running: true,
        exit_code: None,
        oom_killed: false,
        error: None,
    }
}

fn exited_state(exit_code: i64) -> ContainerState {
    ContainerState {
        running: false,
        exit_code: Some(exit_code),
        oom_killed: false,
        error: None,
    }
}

// =============================================================================
// Provisioning
// =============================================================================

#[tokio::test]
async fn running_name_collision_aborts_before_create() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    engine.push_state(Some(running_state()));
    let tracker = Arc::new(MockTracker::new());
    let mut env = docker_env(tmp.path(), engine.clone(), tracker.clone());

    let result = env.enter().await;
    assert_eq!(result, Err(Error::VersionLocked));
    assert!(engine.created.lock().await.is_empty());
    assert!(env.failed());

    let builds = tracker.builds.lock().await;
    assert_eq!(builds.len(), 1);
    assert_eq!(
        builds[0].error,
        "A build environment is currently running for this version"
    );
}

#[tokio::test]
async fn stale_container_is_removed_before_provisioning() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    engine.push_state(Some(exited_state(0)));
    let tracker = Arc::new(MockTracker::new());
    let mut env = docker_env(tmp.path(), engine.clone(), tracker);

    env.enter().await.unwrap();
    assert_eq!(engine.remove_count(), 1);
    {
        let created = engine.created.lock().await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name, "build-77-project-12-demo");
        assert!(created[0]
            .command
            .contains(&format!("exit {TIMEOUT_EXIT_CODE}")));
    }

    // Stale removal, then the usual teardown removal on exit.
    env.exit(Ok(())).await;
    assert_eq!(engine.remove_count(), 2);
    assert_eq!(engine.kill_count(), 1);
}

#[tokio::test]
async fn provisioning_failure_tears_down_and_reports() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    engine.fail_create();
    let tracker = Arc::new(MockTracker::new());
    let mut env = docker_env(tmp.path(), engine.clone(), tracker.clone());

    let result = env.enter().await;
    assert_eq!(result, Err(Error::CreationFailed));
    assert!(env.failed());
    // Entry failure still ran the teardown path.
    assert_eq!(engine.kill_count(), 1);
    assert_eq!(engine.remove_count(), 1);

    let builds = tracker.builds.lock().await;
    assert_eq!(builds[0].error, "Build environment creation failed");
}

// =============================================================================
// Command sequence
// =============================================================================

#[tokio::test]
async fn failing_second_command_fails_the_build() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    engine.push_exec(ExecOutcome {
        output: b"ok\n".to_vec(),
        exit_code: 0,
    });
    engine.push_exec(ExecOutcome {
        output: b"boom\n".to_vec(),
        exit_code: 2,
    });
    let tracker = Arc::new(MockTracker::new());
    let mut env = docker_env(tmp.path(), engine.clone(), tracker.clone());

    env.enter().await.unwrap();
    let body = async {
        env.run(BuildCommand::new(["git", "fetch"])).await?;
        env.run(BuildCommand::new(["sphinx-build", "-b", "html", ".", "_build"]))
            .await?;
        Ok(())
    }
    .await;
    assert!(body.is_err());
    env.exit(body).await;

    assert!(env.failed());
    assert!(!env.successful());
    assert_eq!(env.commands().len(), 2);

    let builds = tracker.builds.lock().await;
    assert_eq!(builds.len(), 1, "exactly one PUT on scope exit");
    assert!(!builds[0].error.is_empty());
    assert!(builds[0].error.contains("sphinx-build"));
    assert_eq!(tracker.commands.lock().await.len(), 2);
}

#[tokio::test]
async fn warn_only_failure_keeps_the_build_green() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    engine.push_exec(ExecOutcome {
        output: b"missing\n".to_vec(),
        exit_code: 1,
    });
    let tracker = Arc::new(MockTracker::new());
    let mut env = docker_env(tmp.path(), engine.clone(), tracker);

    env.enter().await.unwrap();
    let body = async {
        env.run(BuildCommand::new(["cat", "optional.cfg"]).record(false))
            .await?;
        Ok(())
    }
    .await;
    assert!(body.is_ok());
    env.exit(body).await;

    // Unrecorded commands never fail the build.
    assert!(env.successful());
    assert!(env.commands().is_empty());
}

// =============================================================================
// Teardown and reconciliation
// =============================================================================

#[tokio::test]
async fn silent_timeout_is_reconciled_from_container_state() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    // No container before entry; exited with the sentinel by exit time.
    engine.push_state(None);
    engine.push_state(Some(exited_state(TIMEOUT_EXIT_CODE)));
    let tracker = Arc::new(MockTracker::new());
    let mut env = docker_env(tmp.path(), engine, tracker.clone());

    env.enter().await.unwrap();
    env.exit(Ok(())).await;

    assert!(env.failed());
    assert!(env.commands().is_empty());
    assert_eq!(env.failure(), Some(&Error::BuildTimeout));
    let builds = tracker.builds.lock().await;
    assert_eq!(builds[0].error, "Build exited due to time out");
}

#[tokio::test]
async fn oom_kill_is_reconciled_from_container_state() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    engine.push_state(None);
    engine.push_state(Some(ContainerState {
        running: false,
        exit_code: Some(137),
        oom_killed: true,
        error: None,
    }));
    let tracker = Arc::new(MockTracker::new());
    let mut env = docker_env(tmp.path(), engine, tracker.clone());

    env.enter().await.unwrap();
    env.exit(Ok(())).await;

    let builds = tracker.builds.lock().await;
    assert_eq!(
        builds[0].error,
        "Build exited due to excessive memory consumption"
    );
}

#[tokio::test]
async fn command_failure_wins_over_container_state() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    engine.push_exec(ExecOutcome {
        output: b"broken\n".to_vec(),
        exit_code: 2,
    });
    engine.push_state(None);
    engine.push_state(Some(exited_state(TIMEOUT_EXIT_CODE)));
    let tracker = Arc::new(MockTracker::new());
    let mut env = docker_env(tmp.path(), engine, tracker.clone());

    env.enter().await.unwrap();
    let body = async {
        env.run(BuildCommand::new(["make", "html"])).await?;
        Ok(())
    }
    .await;
    env.exit(body).await;

    // First-reported failure wins; the timeout never overwrites it.
    let builds = tracker.builds.lock().await;
    assert!(builds[0].error.starts_with("Command make html failed"));
}

#[tokio::test]
async fn teardown_tolerates_missing_container() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    engine.missing_on_teardown();
    let tracker = Arc::new(MockTracker::new());
    let mut env = docker_env(tmp.path(), engine.clone(), tracker);

    env.enter().await.unwrap();
    env.exit(Ok(())).await;

    assert!(env.successful());
    assert_eq!(engine.kill_count(), 1);
    assert_eq!(engine.remove_count(), 1);
}

#[tokio::test]
async fn kill_and_remove_run_once_per_scope() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    let tracker = Arc::new(MockTracker::new());
    let mut env = docker_env(tmp.path(), engine.clone(), tracker);

    env.enter().await.unwrap();
    env.exit(Ok(())).await;

    assert_eq!(engine.kill_count(), 1);
    assert_eq!(engine.remove_count(), 1);
}

// =============================================================================
// Image resolution
// =============================================================================

#[tokio::test]
async fn image_resolution_prefers_testing_flag() {
    use docbuild_core::types::{BuildConfig, Feature};

    let tmp = tempfile::tempdir().unwrap();
    let tracker: Arc<MockTracker> = Arc::new(MockTracker::new());

    let mut testing_project = project(tmp.path());
    testing_project.features.insert(Feature::TestingBuildImage);
    testing_project.container_image = Some("custom/image:1".into());
    let env = BuildEnvironment::new(
        Settings::default(),
        tracker.clone(),
        testing_project,
        Version {
            id: 5,
            slug: "latest".into(),
        },
        Some(BuildRecord::new(77, 12, 5)),
    )
    .with_config(BuildConfig {
        docker_image: Some("user/image:2".into()),
    });
    let env = DockerBuildEnvironment::new(env);
    assert_eq!(env.container_image(), "docbuild/build:testing");

    let mut manual_project = project(tmp.path());
    manual_project.container_image = Some("custom/image:1".into());
    let env = BuildEnvironment::new(
        Settings::default(),
        tracker.clone(),
        manual_project,
        Version {
            id: 5,
            slug: "latest".into(),
        },
        Some(BuildRecord::new(77, 12, 5)),
    );
    let env = DockerBuildEnvironment::new(env);
    assert_eq!(env.container_image(), "custom/image:1");

    let env = BuildEnvironment::new(
        Settings::default(),
        tracker,
        project(tmp.path()),
        Version {
            id: 5,
            slug: "latest".into(),
        },
        Some(BuildRecord::new(77, 12, 5)),
    )
    .with_config(BuildConfig {
        docker_image: Some("user/image:2".into()),
    });
    let env = DockerBuildEnvironment::new(env);
    assert_eq!(env.container_image(), "user/image:2");
}

#[tokio::test]
async fn project_limits_override_defaults() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();
    let tracker = Arc::new(MockTracker::new());

    let mut limited = project(tmp.path());
    limited.container_mem_limit = Some(512 * 1024 * 1024);
    limited.container_time_limit = Some(60);
    let env = BuildEnvironment::new(
        Settings::default(),
        tracker,
        limited,
        Version {
            id: 5,
            slug: "latest".into(),
        },
        Some(BuildRecord::new(77, 12, 5)),
    );
    let mut env = DockerBuildEnvironment::new(env).with_engine(engine.clone());

    env.enter().await.unwrap();
    let created = engine.created.lock().await;
    assert_eq!(created[0].memory_limit_bytes, 512 * 1024 * 1024);
    assert!(created[0].command.starts_with("sleep 60;"));
}
