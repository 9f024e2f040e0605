//! Local step runner.
//!
//! Executes run commands as shell scripts on this host and reports results
//! on the callback queue, like a remote agent would.

use chrono::Utc;
use flowline_core::ResourceId;
use flowline_core::agent::{AgentCommand, RunCommand};
use flowline_core::step::{ExecResult, StepStatus};
use flowline_scheduler::queue::{Broker, PublishOptions};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Step currently executing.
struct Running {
    job_id: ResourceId,
    step_id: ResourceId,
    kill: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct LocalRunner {
    id: String,
    broker: Arc<dyn Broker>,
    callback: String,
}

impl LocalRunner {
    pub fn new(id: impl Into<String>, broker: Arc<dyn Broker>, callback: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            broker,
            callback: callback.into(),
        }
    }

    pub async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<AgentCommand>,
        shutdown: CancellationToken,
    ) {
        info!(agent_id = %self.id, "Local runner started");
        let this = Arc::new(self);
        let mut current: Option<Running> = None;

        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                AgentCommand::Run(run) => {
                    let kill = shutdown.child_token();
                    let job_id = run.job_id;
                    let step_id = run.step_id;
                    let runner = this.clone();
                    let token = kill.clone();
                    let handle = tokio::spawn(async move {
                        let result = execute(&run, token).await;
                        runner.report(result).await;
                    });
                    current = Some(Running {
                        job_id,
                        step_id,
                        kill,
                        handle,
                    });
                }
                AgentCommand::Kill { job_id } => match &current {
                    Some(running) if running.job_id == job_id && !running.handle.is_finished() => {
                        info!(agent_id = %this.id, job_id = %job_id, "Killing step");
                        running.kill.cancel();
                    }
                    Some(running) if running.job_id == job_id => {
                        // Nothing left to kill; confirm right away.
                        this.report(ExecResult::new(running.step_id, StepStatus::Killed))
                            .await;
                    }
                    _ => warn!(agent_id = %this.id, job_id = %job_id, "Kill for a job this runner does not own"),
                },
            }
        }

        if let Some(running) = current {
            running.kill.cancel();
            let _ = running.handle.await;
        }
        info!(agent_id = %this.id, "Local runner stopped");
    }

    async fn report(&self, result: ExecResult) {
        let body = match serde_json::to_vec(&result) {
            Ok(body) => body,
            Err(e) => {
                warn!(agent_id = %self.id, error = %e, "Cannot encode step result");
                return;
            }
        };
        if let Err(e) = self
            .broker
            .publish(&self.callback, body, PublishOptions::default())
            .await
        {
            warn!(agent_id = %self.id, step_id = %result.step_id, error = %e, "Failed to report step result");
        }
    }
}

enum Exit {
    Code(Option<i32>),
    Killed,
    TimedOut,
}

async fn execute(run: &RunCommand, kill: CancellationToken) -> ExecResult {
    let started_at = Utc::now();
    if let Some(image) = &run.image {
        debug!(path = %run.node_path, image = %image, "Image ignored by local runner");
    }

    let mut child = match Command::new("sh")
        .arg("-ec")
        .arg(run.commands.join("\n"))
        .envs(&run.inputs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return ExecResult::new(run.step_id, StepStatus::Exception)
                .with_error(format!("failed to start: {}", e));
        }
    };

    let mut result = ExecResult::new(run.step_id, StepStatus::Running);
    result.process_id = child.id().and_then(|pid| i32::try_from(pid).ok());
    result.started_at = Some(started_at);

    let stdout = child.stdout.take().map(|out| tokio::spawn(relay(run.node_path.clone(), out)));
    let stderr = child.stderr.take().map(|err| tokio::spawn(relay(run.node_path.clone(), err)));

    let timeout = Duration::from_secs(run.timeout_secs);
    let exit = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Exit::Code(status.code()),
            Err(e) => {
                result.error = Some(e.to_string());
                Exit::Code(None)
            }
        },
        _ = kill.cancelled() => Exit::Killed,
        _ = tokio::time::sleep(timeout) => Exit::TimedOut,
    };
    if matches!(exit, Exit::Killed | Exit::TimedOut) {
        if let Err(e) = child.kill().await {
            warn!(path = %run.node_path, error = %e, "Failed to kill step process");
        }
    }

    // Orphaned grandchildren can keep the pipes open after a kill.
    let mut log_size = 0;
    for mut reader in [stdout, stderr].into_iter().flatten() {
        match tokio::time::timeout(OUTPUT_GRACE, &mut reader).await {
            Ok(Ok(size)) => log_size += size,
            Ok(Err(_)) => {}
            Err(_) => reader.abort(),
        }
    }

    result.log_size = log_size;
    result.finished_at = Some(Utc::now());
    match exit {
        Exit::Code(Some(0)) => result.status = StepStatus::Success,
        Exit::Code(code) => {
            result.status = StepStatus::Failure;
            result.code = code;
        }
        Exit::Killed => result.status = StepStatus::Killed,
        Exit::TimedOut => {
            result.status = StepStatus::Timeout;
            result.error = Some(format!("step exceeded {}s", run.timeout_secs));
        }
    }
    if result.status == StepStatus::Success {
        result.code = Some(0);
    }
    info!(path = %run.node_path, status = %result.status, "Step finished");
    result
}

/// Forward process output to the log, returning the number of bytes read.
async fn relay(path: String, output: impl AsyncRead + Unpin) -> i64 {
    let mut lines = BufReader::new(output).lines();
    let mut size = 0i64;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                size += line.len() as i64 + 1;
                info!(target: "flowlined::step", path = %path, "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to read step output");
                break;
            }
        }
    }
    size
}
