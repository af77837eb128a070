// ABOUTME: Integration tests for lifecycle operations through a session.
// ABOUTME: Runs against the in-memory driver with injected faults.

mod support;

use berth::runtime::{
    ContainerError, ErrorKind, ExecRequest, LogOptions, LogStream, MemoryDriver, Signal,
    StopBehavior,
};
use berth::{DispatchSettings, Dispatcher, LifecycleState, Registry};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use support::{alpine, memory_session};

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn created_container_inspects_as_created() {
    let (session, _driver) = memory_session().await;

    let handle = session.create("web", &alpine()).await.unwrap();
    assert_eq!(handle.state, LifecycleState::Created);
    assert_eq!(session.inspect("web").await.unwrap(), LifecycleState::Created);
}

#[tokio::test]
async fn full_lifecycle_ends_unregistered() {
    let (session, driver) = memory_session().await;

    let handle = session.create("web", &alpine()).await.unwrap();
    session.start("web").await.unwrap();
    assert_eq!(session.inspect("web").await.unwrap(), LifecycleState::Running);

    let stopped = session.stop("web", None).await.unwrap();
    assert_eq!(stopped, LifecycleState::Exited(Some(143)));
    assert_eq!(session.inspect("web").await.unwrap(), stopped);

    session.remove("web", false).await.unwrap();
    let err = session.resolve("web").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(driver.state_of(&handle.id), None);
}

#[tokio::test]
async fn start_after_exit_requires_recreate() {
    let (session, _driver) = memory_session().await;
    session.create("job", &alpine()).await.unwrap();
    session.start("job").await.unwrap();
    session.stop("job", None).await.unwrap();

    let err = session.start("job").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(session.resolve("job").unwrap().state.is_exited());
}

#[tokio::test]
async fn duplicate_name_is_rejected() {
    let (session, driver) = memory_session().await;
    session.create("web", &alpine()).await.unwrap();

    let err = session.create("web", &alpine()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(driver.container_count(), 1);
}

#[tokio::test]
async fn invalid_name_is_an_invalid_spec() {
    let (session, driver) = memory_session().await;

    let err = session.create("Web_App!", &alpine()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSpec);
    assert_eq!(driver.calls("create"), 0);
}

#[tokio::test]
async fn created_containers_carry_session_labels() {
    let (session, driver) = memory_session().await;
    let handle = session.create("web", &alpine()).await.unwrap();

    let labels = driver.labels_of(&handle.id).unwrap();
    assert_eq!(labels["berth.name"], "web");
    assert_eq!(labels["berth.managed"], "true");
    assert_eq!(labels["berth.session"], session.id().to_string());
    assert!(labels.contains_key("berth.host"));
}

#[tokio::test]
async fn pause_and_unpause_round_trip() {
    let (session, _driver) = memory_session().await;
    session.create("web", &alpine()).await.unwrap();

    let err = session.pause("web").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    session.start("web").await.unwrap();
    session.pause("web").await.unwrap();
    assert_eq!(session.resolve("web").unwrap().state, LifecycleState::Paused);

    let err = session.exec("web", &echo()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    session.unpause("web").await.unwrap();
    assert_eq!(session.inspect("web").await.unwrap(), LifecycleState::Running);
}

#[tokio::test]
async fn signal_leaves_state_for_next_observation() {
    let (session, _driver) = memory_session().await;
    session.create("web", &alpine()).await.unwrap();
    session.start("web").await.unwrap();

    session.signal("web", Signal::Kill).await.unwrap();
    assert_eq!(session.resolve("web").unwrap().state, LifecycleState::Running);
    assert_eq!(
        session.inspect("web").await.unwrap(),
        LifecycleState::Exited(Some(137))
    );
    assert_eq!(
        session.resolve("web").unwrap().state,
        LifecycleState::Exited(Some(137))
    );
}

#[tokio::test]
async fn failed_operation_leaves_state_unchanged() {
    let (session, _driver) = memory_session().await;
    session.create("db", &alpine()).await.unwrap();
    session.start("db").await.unwrap();
    let err = session.remove("db", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(session.resolve("db").unwrap().state, LifecycleState::Running);
}

// =============================================================================
// Stop escalation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn hung_stop_escalates_to_kill() {
    let (session, driver) = memory_session().await;
    driver.set_stop_behavior(StopBehavior::Hang);
    session.create("stubborn", &alpine()).await.unwrap();
    session.start("stubborn").await.unwrap();

    let state = session
        .stop("stubborn", Some(Duration::from_secs(3)))
        .await
        .unwrap();

    assert_eq!(state, LifecycleState::Exited(Some(137)));
    assert_eq!(driver.calls("signal"), 1);
}

#[tokio::test(start_paused = true)]
async fn backend_stop_timeout_escalates_to_kill() {
    let (session, driver) = memory_session().await;
    driver.set_stop_behavior(StopBehavior::TimeOut);
    session.create("stubborn", &alpine()).await.unwrap();
    session.start("stubborn").await.unwrap();

    let state = session.stop("stubborn", None).await.unwrap();
    assert_eq!(state, LifecycleState::Exited(Some(137)));
}

#[tokio::test]
async fn force_remove_stops_running_container() {
    let (session, driver) = memory_session().await;
    let handle = session.create("web", &alpine()).await.unwrap();
    session.start("web").await.unwrap();

    session.remove("web", true).await.unwrap();
    assert_eq!(driver.calls("stop"), 1);
    assert_eq!(driver.state_of(&handle.id), None);
    assert!(session.list().is_empty());
}

#[tokio::test]
async fn concurrent_stop_and_remove_serialize() {
    let (session, driver) = memory_session().await;
    driver.set_latency(Duration::from_millis(5));
    session.create("web", &alpine()).await.unwrap();
    session.start("web").await.unwrap();

    let (stopped, removed) = tokio::join!(session.stop("web", None), session.remove("web", true));

    assert!(removed.is_ok(), "{removed:?}");
    match stopped {
        Ok(state) => assert!(state.is_exited()),
        Err(err) => assert_eq!(err.kind(), ErrorKind::NotFound),
    }
    match session.resolve("web") {
        Ok(handle) => assert!(handle.state.is_exited()),
        Err(err) => assert_eq!(err.kind(), ErrorKind::NotFound),
    }
    assert_eq!(driver.container_count(), 0);
}

// =============================================================================
// Retry
// =============================================================================

#[tokio::test]
async fn transient_failures_are_retried() {
    let (session, driver) = memory_session().await;
    driver.fail_next(2);

    session.create("web", &alpine()).await.unwrap();
    assert_eq!(driver.calls("create"), 3);
    assert_eq!(session.list().len(), 1);
}

#[tokio::test]
async fn retries_give_up_after_ceiling() {
    let (session, driver) = memory_session().await;
    driver.fail_next(10);

    let err = session.create("web", &alpine()).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(driver.calls("create"), 3);
    assert!(session.list().is_empty());
}

#[tokio::test]
async fn semantic_errors_are_not_retried() {
    let (session, driver) = memory_session().await;
    driver.remove_image("alpine:3.20");

    let err = session.create("web", &alpine()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ImageNotFound);
    assert_eq!(driver.calls("create"), 1);

    driver.exhaust_resources(true);
    let spec = berth::runtime::ContainerSpec::builder("busybox").build().unwrap();
    let err = session.create("web", &spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_eq!(driver.calls("create"), 2);
}

#[tokio::test]
async fn exec_is_not_retried() {
    let (session, driver) = memory_session().await;
    session.create("web", &alpine()).await.unwrap();
    session.start("web").await.unwrap();
    driver.fail_next(1);

    let err = session.exec("web", &echo()).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(driver.calls("exec"), 1);
}

// =============================================================================
// Out-of-band changes
// =============================================================================

#[tokio::test]
async fn remove_of_vanished_container_succeeds() {
    let (session, driver) = memory_session().await;
    let handle = session.create("web", &alpine()).await.unwrap();
    driver.delete_out_of_band(&handle.id);

    session.remove("web", false).await.unwrap();
    assert!(!session.list().iter().any(|h| h.name.as_str() == "web"));
}

#[tokio::test]
async fn inspect_of_vanished_container_is_not_found() {
    let (session, driver) = memory_session().await;
    let handle = session.create("web", &alpine()).await.unwrap();
    driver.delete_out_of_band(&handle.id);

    let err = session.inspect("web").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn unknown_state_is_refreshed_before_operating() {
    let (session, driver) = memory_session().await;
    session.create("web", &alpine()).await.unwrap();
    session.start("web").await.unwrap();

    driver.fail_next(1);
    let report = session.reconcile().await.unwrap();
    assert_eq!(report.unreachable, 1);
    assert_eq!(session.resolve("web").unwrap().state, LifecycleState::Unknown);

    let state = session.stop("web", None).await.unwrap();
    assert!(state.is_exited());
}

#[tokio::test]
async fn out_of_band_exit_blocks_stop() {
    let (session, driver) = memory_session().await;
    let handle = session.create("web", &alpine()).await.unwrap();
    session.start("web").await.unwrap();
    driver.exit_out_of_band(&handle.id, 2);

    assert_eq!(
        session.inspect("web").await.unwrap(),
        LifecycleState::Exited(Some(2))
    );
    let err = session.stop("web", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

// =============================================================================
// Exec and logs
// =============================================================================

fn echo() -> ExecRequest {
    ExecRequest::from_vec(vec!["echo".to_string(), "hello".to_string()]).unwrap()
}

#[tokio::test]
async fn exec_returns_output() {
    let (session, _driver) = memory_session().await;
    session.create("web", &alpine()).await.unwrap();

    let err = session.exec("web", &echo()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    session.start("web").await.unwrap();
    let output = session.exec("web", &echo()).await.unwrap();
    assert!(output.success());
    assert_eq!(output.stdout_lossy(), "hello\n");
}

#[tokio::test(start_paused = true)]
async fn exec_timeout_is_reported() {
    let (session, _driver) = memory_session().await;
    session.create("web", &alpine()).await.unwrap();
    session.start("web").await.unwrap();

    let request = ExecRequest::from_vec(vec!["sleep".to_string(), "60".to_string()])
        .unwrap()
        .with_timeout(Duration::from_secs(1));
    let err = session.exec("web", &request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn logs_respect_stream_and_tail() {
    let (session, driver) = memory_session().await;
    let handle = session.create("web", &alpine()).await.unwrap();
    driver.push_log(&handle.id, LogStream::Stdout, "one");
    driver.push_log(&handle.id, LogStream::Stderr, "oops");
    driver.push_log(&handle.id, LogStream::Stdout, "two");

    let opts = LogOptions {
        stderr: false,
        tail: Some(1),
        ..LogOptions::default()
    };
    let lines: Vec<_> = session
        .logs("web", &opts)
        .await
        .unwrap()
        .map(|l| l.unwrap().content)
        .collect()
        .await;
    assert_eq!(lines, ["two"]);
}

// =============================================================================
// Adopt
// =============================================================================

#[tokio::test]
async fn adopt_registers_existing_container() {
    let (session, driver) = memory_session().await;
    let id = driver.insert_existing("legacy-app", LifecycleState::Running);

    let handle = session.adopt("legacy", "legacy-app").await.unwrap();
    assert_eq!(handle.id, id);
    assert_eq!(handle.state, LifecycleState::Running);

    let err = session.adopt("again", id.as_str()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let err = session.adopt("ghost", "no-such-container").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// =============================================================================
// Dispatcher without a session
// =============================================================================

#[tokio::test]
async fn dispatcher_works_over_dyn_driver() {
    let driver: Arc<dyn berth::runtime::Driver> = Arc::new(MemoryDriver::new());
    let registry = Arc::new(Registry::new());
    let dispatcher = Dispatcher::new(driver, registry.clone(), DispatchSettings::default());

    dispatcher.create("web", &alpine()).await.unwrap();
    dispatcher.start("web").await.unwrap();
    assert_eq!(registry.len(), 1);
    assert_eq!(
        registry.resolve("web").unwrap().state,
        LifecycleState::Running
    );
}

#[tokio::test]
async fn closed_session_rejects_operations() {
    let (session, _driver) = memory_session().await;
    session.create("web", &alpine()).await.unwrap();
    session.close().await.unwrap();

    for result in [
        session.start("web").await,
        session.remove("web", true).await,
    ] {
        assert!(matches!(result, Err(ContainerError::SessionClosed)));
    }
    assert!(matches!(
        session.resolve("web"),
        Err(ContainerError::SessionClosed)
    ));
    assert!(session.list().is_empty());
}
