//! Step lifecycle and the per-job step list cache.

use chrono::Utc;
use flowline_core::ResourceId;
use flowline_core::event::{DomainEvent, EventBus};
use flowline_core::job::Job;
use flowline_core::pipeline::NodeTree;
use flowline_core::step::{ExecResult, Step, StepStatus};
use flowline_db::StepRepo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::{SchedulerError, SchedulerResult};

/// Single writer of step state.
///
/// Step lists are cached per job and read through to the store on a miss.
/// Every write invalidates the job's entry before the refreshed list is
/// published.
pub struct StepManager {
    repo: Arc<dyn StepRepo>,
    events: EventBus,
    cache: RwLock<HashMap<ResourceId, Arc<Vec<Step>>>>,
    /// Bumped on every invalidation; a read that raced one is not cached.
    generation: AtomicU64,
}

impl StepManager {
    pub fn new(repo: Arc<dyn StepRepo>, events: EventBus) -> Self {
        Self {
            repo,
            events,
            cache: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Create one step per tree node in a single batch.
    pub async fn init(&self, job: &Job, tree: &NodeTree) -> SchedulerResult<Vec<Step>> {
        let steps: Vec<Step> = tree
            .steps
            .iter()
            .enumerate()
            .map(|(position, node)| {
                Step::new(job.flow_id, job.id, job.build_number, position as u32, node)
            })
            .collect();

        self.repo.insert_all(&steps).await?;
        self.invalidate(job.id);
        debug!(job_id = %job.id, count = steps.len(), "Steps initialized");
        self.events.publish(DomainEvent::StepsInitialized {
            job_id: job.id,
            steps: steps.clone(),
        });
        Ok(steps)
    }

    pub async fn get(&self, step_id: ResourceId) -> SchedulerResult<Step> {
        Ok(self.repo.get(step_id).await?)
    }

    pub async fn get_by_path(&self, job_id: ResourceId, path: &str) -> SchedulerResult<Step> {
        self.list(job_id)
            .await?
            .into_iter()
            .find(|s| s.node_path == path)
            .ok_or_else(|| {
                SchedulerError::Core(flowline_core::Error::NotFound(format!(
                    "step {} of job {}",
                    path, job_id
                )))
            })
    }

    /// Steps of a job in tree order.
    pub async fn list(&self, job_id: ResourceId) -> SchedulerResult<Vec<Step>> {
        if let Some(steps) = self.cache.read().get(&job_id) {
            return Ok(steps.as_ref().clone());
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let steps = Arc::new(self.repo.list_by_job(job_id).await?);
        let mut cache = self.cache.write();
        if self.generation.load(Ordering::SeqCst) == generation {
            cache.insert(job_id, steps.clone());
        }
        Ok(steps.as_ref().clone())
    }

    /// Move a step to a new status. Returns `false` when it already had it.
    pub async fn status_change(
        &self,
        step: &mut Step,
        status: StepStatus,
        error: Option<String>,
    ) -> SchedulerResult<bool> {
        if step.status == status {
            return Ok(false);
        }

        apply_status(step, status, error);
        self.repo.save(step).await?;
        debug!(job_id = %step.job_id, path = %step.node_path, status = %status, "Step status changed");
        self.refresh(step.job_id).await?;
        Ok(true)
    }

    /// Apply an agent-reported result to its step.
    pub async fn result_update(&self, result: ExecResult) -> SchedulerResult<Step> {
        let mut step = self.repo.get(result.step_id).await?;

        if result.process_id.is_some() {
            step.process_id = result.process_id;
        }
        step.code = result.code.or(step.code);
        step.started_at = result.started_at.or(step.started_at);
        step.finished_at = result.finished_at.or(step.finished_at);
        if result.log_size >= 0 {
            step.log_size = result.log_size;
        }
        step.output.extend(result.output);

        if step.status == result.status {
            // Execution fields only; no status event.
            self.repo.save(&step).await?;
            self.invalidate(step.job_id);
        } else {
            self.status_change(&mut step, result.status, result.error)
                .await?;
        }
        Ok(step)
    }

    /// Force every step of a job in one of `from` to SKIPPED.
    pub async fn skip(&self, job_id: ResourceId, from: &[StepStatus]) -> SchedulerResult<usize> {
        let mut skipped = 0;
        for mut step in self.list(job_id).await? {
            if from.contains(&step.status) {
                apply_status(&mut step, StepStatus::Skipped, None);
                self.repo.save(&step).await?;
                skipped += 1;
            }
        }

        if skipped > 0 {
            debug!(job_id = %job_id, count = skipped, "Steps skipped");
            self.refresh(job_id).await?;
        }
        Ok(skipped)
    }

    /// Drop a job's cached list, e.g. once the job is finished.
    pub fn forget(&self, job_id: ResourceId) {
        self.invalidate(job_id);
    }

    pub async fn delete_by_flow(&self, flow_id: ResourceId) -> SchedulerResult<u64> {
        let deleted = self.repo.delete_by_flow(flow_id).await?;
        let mut cache = self.cache.write();
        cache.retain(|_, steps| steps.first().is_none_or(|s| s.flow_id != flow_id));
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(deleted)
    }

    pub fn cached_jobs(&self) -> usize {
        self.cache.read().len()
    }

    fn invalidate(&self, job_id: ResourceId) {
        let mut cache = self.cache.write();
        cache.remove(&job_id);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Invalidate, reload and publish the full list.
    async fn refresh(&self, job_id: ResourceId) -> SchedulerResult<()> {
        self.invalidate(job_id);
        let steps = self.list(job_id).await?;
        self.events
            .publish(DomainEvent::StepStatusChanged { job_id, steps });
        Ok(())
    }
}

fn apply_status(step: &mut Step, status: StepStatus, error: Option<String>) {
    let now = Utc::now();
    step.status = status;
    if error.is_some() {
        step.error = error;
    }
    if status == StepStatus::Running && step.started_at.is_none() {
        step.started_at = Some(now);
    }
    if status.is_finished() && step.finished_at.is_none() {
        step.finished_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::job::{Trigger, Vars};
    use flowline_core::pipeline::StepNode;
    use flowline_db::MemStepRepo;

    fn tree() -> NodeTree {
        let node = |name: &str| StepNode {
            name: name.to_string(),
            path: format!("api/{}", name),
            allow_failure: false,
            post: false,
            image: None,
            commands: vec!["true".to_string()],
            env: Vars::new(),
        };
        NodeTree {
            name: "api".to_string(),
            env: Vars::new(),
            steps: vec![node("build"), node("test")],
        }
    }

    fn setup() -> (StepManager, EventBus, Job) {
        let events = EventBus::new();
        let manager = StepManager::new(Arc::new(MemStepRepo::new()), events.clone());
        let job = Job::new(ResourceId::new(), 1, Trigger::Manual, "");
        (manager, events, job)
    }

    #[tokio::test]
    async fn test_init_creates_pending_steps_in_order() {
        let (manager, events, job) = setup();
        let mut rx = events.subscribe();

        let steps = manager.init(&job, &tree()).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));

        match rx.recv().await.unwrap() {
            DomainEvent::StepsInitialized { job_id, steps } => {
                assert_eq!(job_id, job.id);
                assert_eq!(steps.len(), 2);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let listed = manager.list(job.id).await.unwrap();
        assert_eq!(listed[0].node_path, "api/build");
        assert_eq!(listed[1].node_path, "api/test");
    }

    #[tokio::test]
    async fn test_status_change_is_idempotent_and_coherent() {
        let (manager, events, job) = setup();
        manager.init(&job, &tree()).await.unwrap();
        // Warm the cache.
        manager.list(job.id).await.unwrap();
        let mut rx = events.subscribe();

        let mut step = manager.get_by_path(job.id, "api/build").await.unwrap();
        assert!(manager
            .status_change(&mut step, StepStatus::Running, None)
            .await
            .unwrap());
        assert!(!manager
            .status_change(&mut step, StepStatus::Running, None)
            .await
            .unwrap());

        let listed = manager.list(job.id).await.unwrap();
        assert_eq!(listed[0].status, StepStatus::Running);
        assert!(listed[0].started_at.is_some());

        match rx.recv().await.unwrap() {
            DomainEvent::StepStatusChanged { steps, .. } => {
                assert_eq!(steps[0].status, StepStatus::Running);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_result_update_copies_execution_fields() {
        let (manager, _events, job) = setup();
        let steps = manager.init(&job, &tree()).await.unwrap();

        let result = ExecResult::new(steps[0].id, StepStatus::Failure)
            .with_code(2)
            .with_output("ARTIFACT", "target/app")
            .with_error("exit status 2");
        let updated = manager.result_update(result).await.unwrap();

        assert_eq!(updated.status, StepStatus::Failure);
        assert_eq!(updated.code, Some(2));
        assert_eq!(updated.output.get("ARTIFACT").unwrap(), "target/app");
        assert_eq!(updated.error.as_deref(), Some("exit status 2"));
        assert!(updated.finished_at.is_some());

        let listed = manager.list(job.id).await.unwrap();
        assert_eq!(listed[0].code, Some(2));
    }

    #[tokio::test]
    async fn test_skip_only_touches_requested_statuses() {
        let (manager, _events, job) = setup();
        manager.init(&job, &tree()).await.unwrap();
        let mut build = manager.get_by_path(job.id, "api/build").await.unwrap();
        manager
            .status_change(&mut build, StepStatus::Success, None)
            .await
            .unwrap();

        let skipped = manager
            .skip(job.id, &[StepStatus::Pending, StepStatus::Running])
            .await
            .unwrap();
        assert_eq!(skipped, 1);

        let listed = manager.list(job.id).await.unwrap();
        assert_eq!(listed[0].status, StepStatus::Success);
        assert_eq!(listed[1].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_forget_and_delete_by_flow() {
        let (manager, _events, job) = setup();
        manager.init(&job, &tree()).await.unwrap();
        manager.list(job.id).await.unwrap();
        assert_eq!(manager.cached_jobs(), 1);

        manager.forget(job.id);
        assert_eq!(manager.cached_jobs(), 0);

        manager.list(job.id).await.unwrap();
        assert_eq!(manager.delete_by_flow(job.flow_id).await.unwrap(), 2);
        assert_eq!(manager.cached_jobs(), 0);
        assert!(manager.list(job.id).await.unwrap().is_empty());
    }
}
