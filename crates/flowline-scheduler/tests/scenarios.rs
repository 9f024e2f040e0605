//! End-to-end job lifecycle scenarios on the in-memory engine.

mod common;

use common::{Engine, PIPELINE, hang, run_paths, spawn_agent, succeed, wait_commands};
use flowline_config::SystemConfig;
use flowline_core::agent::AgentCommand;
use flowline_core::job::JobStatus;
use flowline_core::step::{ExecResult, StepStatus};
use flowline_scheduler::queue::Broker;
use std::time::Duration;

#[tokio::test]
async fn test_expired_job_times_out_before_enqueue() {
    let mut config = SystemConfig::default();
    config.job.expire_secs = 0;
    let engine = Engine::new(config).await;
    engine.start_flow().await;

    let job = engine.create(PIPELINE).await;
    let job = engine.service.start(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Timeout);
    assert_eq!(job.message.as_deref(), Some("expired before enqueue"));
    assert!(job.finished_at.is_some());
    assert_eq!(engine.broker.ready_count(&engine.flow.queue_name()), 0);
    assert_eq!(engine.broker.unacked_count(&engine.flow.queue_name()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_queued_job_times_out_through_dead_letter() {
    let mut config = SystemConfig::default();
    config.job.expire_secs = 60;
    let engine = Engine::new(config).await;
    // Queue only, no dispatch worker: the message waits until its TTL.
    let queue = engine.flow.queue_name();
    engine
        .broker
        .declare(&queue, Some(&engine.config.queue.dead_letter))
        .await
        .unwrap();

    let job = engine.run(PIPELINE).await;
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(engine.broker.ready_count(&queue), 1);

    tokio::time::sleep(Duration::from_secs(61)).await;

    let job = engine.wait_status(job.id, JobStatus::Timeout).await;
    assert_eq!(job.message.as_deref(), Some("expired while queued up"));
    assert_eq!(engine.broker.ready_count(&queue), 0);
    assert!(engine.service.steps(job.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dequeued_job_ignores_late_dead_letter() {
    let engine = Engine::new(SystemConfig::default()).await;
    let received = spawn_agent(&engine, "agent-1", false, hang);
    engine.start_flow().await;

    let job = engine.run(PIPELINE).await;
    let job = engine.wait_status(job.id, JobStatus::Running).await;
    assert_eq!(job.agent_id.as_deref(), Some("agent-1"));
    wait_commands(&received, 1).await;
    assert_eq!(run_paths(&received), vec!["api/build"]);

    let dead_letter = engine.config.queue.dead_letter.clone();
    engine
        .broker
        .publish(&dead_letter, job.id.to_bytes(), Default::default())
        .await
        .unwrap();
    engine.drain(&dead_letter).await;

    let job = engine.service.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.finished_at.is_none());
}

#[tokio::test]
async fn test_cancel_running_job_waits_for_kill_confirmation() {
    let engine = Engine::new(SystemConfig::default()).await;
    let received = spawn_agent(&engine, "agent-1", true, hang);
    engine.start_flow().await;

    let job = engine.run(PIPELINE).await;
    engine.wait_status(job.id, JobStatus::Running).await;

    let cancelling = engine.service.cancel(job.id).await.unwrap();
    assert_eq!(cancelling.status, JobStatus::Cancelling);

    let job = engine.wait_status(job.id, JobStatus::Cancelled).await;
    assert_eq!(job.message.as_deref(), Some("kill confirmed by agent"));
    assert!(
        received
            .lock()
            .contains(&AgentCommand::Kill { job_id: job.id })
    );

    let steps = engine.service.steps(job.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Killed);
    assert_eq!(steps[0].code, Some(137));
    assert_eq!(steps[1].status, StepStatus::Skipped);

    // The agent is free again.
    let agents = engine.agents.agents();
    assert!(!agents[0].is_busy());
}

#[tokio::test]
async fn test_all_steps_succeed_in_order() {
    let engine = Engine::new(SystemConfig::default()).await;
    let received = spawn_agent(&engine, "agent-1", false, succeed);
    engine.start_flow().await;

    let job = engine.run(PIPELINE).await;
    let job = engine.wait_status(job.id, JobStatus::Success).await;

    assert_eq!(run_paths(&received), vec!["api/build", "api/test"]);
    assert!(job.finished_at.is_some());
    assert_eq!(
        job.context.get("FLOWLINE_JOB_STATUS").map(String::as_str),
        Some("SUCCESS")
    );
    let steps = engine.service.steps(job.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Success));
}

#[tokio::test]
async fn test_hard_failure_stops_dispatch() {
    let engine = Engine::new(SystemConfig::default()).await;
    let received = spawn_agent(&engine, "agent-1", false, |run| {
        let status = if run.node_path == "api/build" {
            StepStatus::Failure
        } else {
            StepStatus::Success
        };
        Some(ExecResult::new(run.step_id, status).with_code(1))
    });
    engine.start_flow().await;

    let job = engine.run(PIPELINE).await;
    let job = engine.wait_status(job.id, JobStatus::Failure).await;

    assert_eq!(run_paths(&received), vec!["api/build"]);
    let steps = engine.service.steps(job.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failure);
    assert_eq!(steps[1].status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_deleted_flow_never_dispatches_pending_jobs() {
    let engine = Engine::new(SystemConfig::default()).await;
    engine.start_flow().await;
    let queue = engine.flow.queue_name();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(engine.run(PIPELINE).await.id);
    }
    // With no agent around, the worker holds one message and waits.
    for _ in 0..1000 {
        if engine.broker.unacked_count(&queue) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.broker.ready_count(&queue), 2);

    let deleted = engine
        .service
        .delete_flow(engine.flow.id)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(deleted, 3);
    assert!(!engine.broker.exists(&queue));
    assert!(!engine.service.registry().is_running(engine.flow.id));

    let received = spawn_agent(&engine, "agent-1", false, succeed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(received.lock().is_empty());
    for id in ids {
        assert!(engine.service.get(id).await.unwrap_err().is_not_found());
    }
}

#[tokio::test]
async fn test_flow_deleted_after_agent_acquired() {
    let engine = Engine::new(SystemConfig::default()).await;
    let received = spawn_agent(&engine, "agent-1", false, hang);
    engine.start_flow().await;
    let queue = engine.flow.queue_name();

    let first = engine.run(PIPELINE).await;
    let first = engine.wait_status(first.id, JobStatus::Running).await;
    assert_eq!(first.agent_id.as_deref(), Some("agent-1"));
    wait_commands(&received, 1).await;

    // The only agent is busy; the second message is held by the worker.
    let second = engine.run(PIPELINE).await;
    for _ in 0..1000 {
        if engine.broker.unacked_count(&queue) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.broker.unacked_count(&queue), 1);
    assert_eq!(engine.broker.ready_count(&queue), 0);

    let deleted = engine
        .service
        .delete_flow(engine.flow.id)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(deleted, 2);
    assert!(!engine.broker.exists(&queue));

    // The dispatched job went out exactly once; the held one never did.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(run_paths(&received), vec!["api/build"]);
    match &received.lock()[0] {
        AgentCommand::Run(run) => assert_eq!(run.job_id, first.id),
        other => panic!("unexpected command {:?}", other),
    }
    assert!(engine.service.get(second.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let engine = Engine::new(SystemConfig::default()).await;
    // Queue only, no dispatch worker.
    let queue = engine.flow.queue_name();
    engine
        .broker
        .declare(&queue, Some(&engine.config.queue.dead_letter))
        .await
        .unwrap();

    let job = engine.run(PIPELINE).await;
    assert_eq!(job.status, JobStatus::Queued);

    let job = engine.service.cancel(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.message.as_deref(), Some("cancelled while queued up"));
    assert!(job.finished_at.is_some());

    // The stale message is dropped once a worker picks it up.
    let received = spawn_agent(&engine, "agent-1", false, succeed);
    engine.start_flow().await;
    engine.drain(&queue).await;
    assert!(received.lock().is_empty());
    let job = engine.service.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_with_agent_offline_skips_kill() {
    let engine = Engine::new(SystemConfig::default()).await;
    let received = spawn_agent(&engine, "agent-1", true, hang);
    engine.start_flow().await;

    let job = engine.run(PIPELINE).await;
    engine.wait_status(job.id, JobStatus::Running).await;
    wait_commands(&received, 1).await;

    // Offline, but the status report has not been handled yet.
    engine.agents.set_offline("agent-1").unwrap();
    let job = engine.service.cancel(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.message.as_deref(), Some("cancel while agent offline"));
    let steps = engine.service.steps(job.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Skipped));
    assert!(
        !received
            .lock()
            .iter()
            .any(|command| matches!(command, AgentCommand::Kill { .. }))
    );
}

#[tokio::test]
async fn test_undelivered_kill_cancels_job() {
    let engine = Engine::new(SystemConfig::default()).await;
    let mut commands = engine.agents.register("agent-1");
    engine.start_flow().await;

    let job = engine.run(PIPELINE).await;
    engine.wait_status(job.id, JobStatus::Running).await;
    assert!(matches!(commands.recv().await, Some(AgentCommand::Run(_))));
    // The agent stops listening without going offline.
    drop(commands);

    let job = engine.service.cancel(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    let message = job.message.unwrap_or_default();
    assert!(message.starts_with("kill not delivered"), "{}", message);
    let steps = engine.service.steps(job.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Skipped));
}

#[tokio::test]
async fn test_enqueue_failure_fails_job() {
    let engine = Engine::new(SystemConfig::default()).await;
    // The flow queue was never declared.
    let job = engine.run(PIPELINE).await;

    assert_eq!(job.status, JobStatus::Failure);
    let message = job.message.clone().unwrap_or_default();
    assert!(message.starts_with("failed to enqueue"), "{}", message);
    assert!(message.contains("not declared"), "{}", message);
    assert!(job.finished_at.is_some());
    assert!(!engine.broker.exists(&engine.flow.queue_name()));
}

#[tokio::test]
async fn test_longest_durations_run_to_success() {
    let mut config = SystemConfig::default();
    config.job.expire_secs = flowline_core::job::MAX_DURATION_SECS;
    config.job.timeout_secs = flowline_core::job::MAX_DURATION_SECS;
    let engine = Engine::new(config).await;
    spawn_agent(&engine, "agent-1", false, succeed);
    engine.start_flow().await;

    let job = engine.run(PIPELINE).await;
    let job = engine.wait_status(job.id, JobStatus::Success).await;
    assert!(job.expire_at > job.created_at);
}
