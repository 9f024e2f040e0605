//! Lifecycle guarantees that must hold under races and late messages.

mod common;

use common::{Engine, PIPELINE, hang, run_paths, spawn_agent, succeed, wait_commands};
use flowline_config::SystemConfig;
use flowline_core::agent::AgentCommand;
use flowline_core::job::JobStatus;
use flowline_core::step::{ExecResult, StepStatus};
use std::time::Duration;

#[tokio::test]
async fn test_finished_job_never_changes_again() {
    let engine = Engine::new(SystemConfig::default()).await;
    spawn_agent(&engine, "agent-1", false, succeed);
    engine.start_flow().await;

    let job = engine.run(PIPELINE).await;
    let done = engine.wait_status(job.id, JobStatus::Success).await;

    let after_cancel = engine.service.cancel(job.id).await.unwrap();
    assert_eq!(after_cancel.status, JobStatus::Success);

    // A late duplicate result is dropped.
    let steps = engine.service.steps(job.id).await.unwrap();
    engine
        .publish_result(&ExecResult::new(steps[0].id, StepStatus::Failure))
        .await;
    engine.drain(&engine.config.queue.callback).await;

    let job = engine.service.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.finished_at, done.finished_at);
    let steps = engine.service.steps(job.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_a_step_result() {
    let engine = Engine::new(SystemConfig::default()).await;
    let received = spawn_agent(&engine, "agent-1", false, hang);
    engine.start_flow().await;

    let job = engine.run(PIPELINE).await;
    engine.wait_status(job.id, JobStatus::Running).await;
    let steps = engine.service.steps(job.id).await.unwrap();

    let service = engine.service.clone();
    let cancel = tokio::spawn(async move { service.cancel(job.id).await });
    let machine = engine.service.machine().clone();
    let result = ExecResult::new(steps[0].id, StepStatus::Success);
    let advance = tokio::spawn(async move { machine.on_step_result(result).await });
    cancel.await.unwrap().unwrap();
    advance.await.unwrap().unwrap();

    let job = engine.service.get(job.id).await.unwrap();
    match job.status {
        // Result first, then the kill reached the agent running "test".
        JobStatus::Cancelling => {
            wait_commands(&received, 3).await;
            let commands = received.lock().clone();
            assert_eq!(commands[2], AgentCommand::Kill { job_id: job.id });
            assert_eq!(run_paths(&received), vec!["api/build", "api/test"]);
            assert!(job.finished_at.is_none());
        }
        // Kill first, then the result confirmed it.
        JobStatus::Cancelled => {
            wait_commands(&received, 2).await;
            let commands = received.lock().clone();
            assert_eq!(commands[1], AgentCommand::Kill { job_id: job.id });
            assert_eq!(run_paths(&received), vec!["api/build"]);
            assert_eq!(job.message.as_deref(), Some("kill confirmed by agent"));
            assert!(job.finished_at.is_some());
        }
        other => panic!("unexpected status {}", other),
    }
}

#[tokio::test]
async fn test_agent_offline_cancels_bound_job() {
    let engine = Engine::new(SystemConfig::default()).await;
    spawn_agent(&engine, "agent-1", false, hang);
    engine.start_flow().await;

    let job = engine.run(PIPELINE).await;
    engine.wait_status(job.id, JobStatus::Running).await;

    let agent = engine.agents.set_offline("agent-1").unwrap();
    let job = engine
        .service
        .on_agent_status(&agent)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.message.as_deref(), Some("Agent unexpectedly offline"));
    let steps = engine.service.steps(job.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Skipped));
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_kill_times_out() {
    let mut config = SystemConfig::default();
    config.job.cancel_timeout_secs = 5;
    let engine = Engine::new(config).await;
    spawn_agent(&engine, "agent-1", false, hang);
    engine.start_flow().await;

    let job = engine.run(PIPELINE).await;
    engine.wait_status(job.id, JobStatus::Running).await;
    let job = engine.service.cancel(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelling);

    // A second cancel while waiting for confirmation changes nothing.
    let job = engine.service.cancel(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelling);

    tokio::time::sleep(Duration::from_secs(6)).await;
    let job = engine.wait_status(job.id, JobStatus::Cancelled).await;
    assert_eq!(job.message.as_deref(), Some("kill confirmation timed out"));
    let steps = engine.service.steps(job.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Skipped));
}

#[tokio::test]
async fn test_allow_failure_and_post_steps() {
    const DEFINITION: &str = r#"
pipeline "api"
step "lint" allow-failure=#true { run "make lint" }
step "build" { run "make" }
step "test" { run "make test" }
step "notify" post=#true { run "./notify.sh" }
"#;
    let engine = Engine::new(SystemConfig::default()).await;
    let received = spawn_agent(&engine, "agent-1", false, |run| {
        let status = match run.node_path.as_str() {
            "api/lint" | "api/build" => StepStatus::Failure,
            _ => StepStatus::Success,
        };
        Some(ExecResult::new(run.step_id, status))
    });
    engine.start_flow().await;

    let job = engine.run(DEFINITION).await;
    let job = engine.wait_status(job.id, JobStatus::Failure).await;

    assert_eq!(
        run_paths(&received),
        vec!["api/lint", "api/build", "api/notify"]
    );
    let steps = engine.service.steps(job.id).await.unwrap();
    let status: Vec<_> = steps.iter().map(|s| s.status).collect();
    assert_eq!(
        status,
        vec![
            StepStatus::Failure,
            StepStatus::Failure,
            StepStatus::Skipped,
            StepStatus::Success
        ]
    );
}

#[tokio::test]
async fn test_step_timeout_times_out_job() {
    let engine = Engine::new(SystemConfig::default()).await;
    spawn_agent(&engine, "agent-1", false, |run| {
        Some(ExecResult::new(run.step_id, StepStatus::Timeout))
    });
    engine.start_flow().await;

    let job = engine.run(PIPELINE).await;
    let job = engine.wait_status(job.id, JobStatus::Timeout).await;
    assert_eq!(job.message.as_deref(), Some("step api/build timed out"));
}

#[tokio::test]
async fn test_outputs_flow_into_later_steps() {
    let engine = Engine::new(SystemConfig::default()).await;
    let received = spawn_agent(&engine, "agent-1", false, |run| {
        Some(ExecResult::new(run.step_id, StepStatus::Success).with_output("VERSION", "1.2.0"))
    });
    engine.start_flow().await;

    let job = engine.run(PIPELINE).await;
    let job = engine.wait_status(job.id, JobStatus::Success).await;
    assert_eq!(job.context.get("VERSION").map(String::as_str), Some("1.2.0"));

    let commands = received.lock().clone();
    let AgentCommand::Run(test) = &commands[1] else {
        panic!("expected a run command");
    };
    assert_eq!(test.node_path, "api/test");
    assert_eq!(test.inputs.get("VERSION").map(String::as_str), Some("1.2.0"));
    assert_eq!(test.inputs.get("STAGE").map(String::as_str), Some("ci"));
    assert_eq!(
        test.inputs.get("FLOWLINE_FLOW_NAME").map(String::as_str),
        Some("api")
    );
    assert_eq!(test.timeout_secs, engine.config.job.timeout_secs);
}

#[tokio::test]
async fn test_jobs_are_numbered_per_flow() {
    let engine = Engine::new(SystemConfig::default()).await;
    let first = engine.create(PIPELINE).await;
    let second = engine.create(PIPELINE).await;
    assert_eq!(first.build_number + 1, second.build_number);

    let by_key = engine
        .service
        .get_by_key(engine.flow.id, second.build_number)
        .await
        .unwrap();
    assert_eq!(by_key.id, second.id);

    let listed = engine.service.list(engine.flow.id, 10).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);

    let cancelled = engine.service.cancel(first.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.message.as_deref(), Some("cancelled before start"));
}

#[tokio::test]
async fn test_invalid_definition_is_rejected() {
    let engine = Engine::new(SystemConfig::default()).await;
    let err = engine
        .service
        .create(
            &engine.flow,
            "pipeline \"api\"",
            flowline_core::job::Trigger::Api,
            Default::default(),
        )
        .await
        .unwrap_err();
    assert!(!err.is_not_found());
    assert!(engine.service.list(engine.flow.id, 10).await.unwrap().is_empty());
}
