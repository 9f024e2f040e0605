//! In-memory stores, used when no database is configured and in tests.

use async_trait::async_trait;
use flowline_core::ResourceId;
use flowline_core::job::Job;
use flowline_core::step::Step;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

use crate::{DbError, DbResult, JobRepo, StepRepo};

#[derive(Debug, Default)]
pub struct MemJobRepo {
    jobs: RwLock<HashMap<ResourceId, Job>>,
    numbers: Mutex<HashMap<ResourceId, u64>>,
}

impl MemJobRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepo for MemJobRepo {
    async fn next_build_number(&self, flow_id: ResourceId) -> DbResult<u64> {
        let mut numbers = self.numbers.lock();
        let value = numbers.entry(flow_id).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn insert(&self, job: &Job) -> DbResult<()> {
        let mut jobs = self.jobs.write();
        let taken = jobs.values().any(|j| {
            j.id == job.id || (j.flow_id == job.flow_id && j.build_number == job.build_number)
        });
        if taken {
            return Err(DbError::Duplicate(format!("job {}", job.key())));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> DbResult<Job> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn get_by_key(&self, flow_id: ResourceId, build_number: u64) -> DbResult<Job> {
        self.jobs
            .read()
            .values()
            .find(|j| j.flow_id == flow_id && j.build_number == build_number)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}:{}", flow_id, build_number)))
    }

    async fn save(&self, job: &Job) -> DbResult<()> {
        match self.jobs.write().get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(DbError::NotFound(format!("job {}", job.id))),
        }
    }

    async fn list_by_flow(&self, flow_id: ResourceId, limit: i64) -> DbResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|j| j.flow_id == flow_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.build_number.cmp(&a.build_number));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn delete_by_flow(&self, flow_id: ResourceId) -> DbResult<u64> {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, j| j.flow_id != flow_id);
        self.numbers.lock().remove(&flow_id);
        Ok((before - jobs.len()) as u64)
    }
}

#[derive(Debug, Default)]
pub struct MemStepRepo {
    steps: RwLock<HashMap<ResourceId, Step>>,
}

impl MemStepRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepRepo for MemStepRepo {
    async fn insert_all(&self, steps: &[Step]) -> DbResult<()> {
        let mut stored = self.steps.write();
        if let Some(dup) = steps.iter().find(|s| stored.contains_key(&s.id)) {
            return Err(DbError::Duplicate(format!("step {}", dup.node_path)));
        }
        for step in steps {
            stored.insert(step.id, step.clone());
        }
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> DbResult<Step> {
        self.steps
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("step {}", id)))
    }

    async fn list_by_job(&self, job_id: ResourceId) -> DbResult<Vec<Step>> {
        let mut steps: Vec<Step> = self
            .steps
            .read()
            .values()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.position);
        Ok(steps)
    }

    async fn save(&self, step: &Step) -> DbResult<()> {
        match self.steps.write().get_mut(&step.id) {
            Some(stored) => {
                *stored = step.clone();
                Ok(())
            }
            None => Err(DbError::NotFound(format!("step {}", step.id))),
        }
    }

    async fn delete_by_flow(&self, flow_id: ResourceId) -> DbResult<u64> {
        let mut steps = self.steps.write();
        let before = steps.len();
        steps.retain(|_, s| s.flow_id != flow_id);
        Ok((before - steps.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::job::{JobStatus, Trigger, Vars};
    use flowline_core::pipeline::StepNode;

    fn node(name: &str) -> StepNode {
        StepNode {
            name: name.to_string(),
            path: format!("api/{}", name),
            allow_failure: false,
            post: false,
            image: None,
            commands: vec!["true".to_string()],
            env: Vars::new(),
        }
    }

    #[tokio::test]
    async fn test_build_numbers_per_flow() {
        let repo = MemJobRepo::new();
        let a = ResourceId::new();
        let b = ResourceId::new();
        assert_eq!(repo.next_build_number(a).await.unwrap(), 1);
        assert_eq!(repo.next_build_number(a).await.unwrap(), 2);
        assert_eq!(repo.next_build_number(b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_job_insert_get_save() {
        let repo = MemJobRepo::new();
        let mut job = Job::new(ResourceId::new(), 1, Trigger::Api, "");
        repo.insert(&job).await.unwrap();
        assert!(matches!(
            repo.insert(&job).await,
            Err(DbError::Duplicate(_))
        ));

        job.status = JobStatus::Queued;
        repo.save(&job).await.unwrap();
        let loaded = repo.get_by_key(job.flow_id, 1).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Queued);

        assert!(repo.get(ResourceId::new()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_and_delete_by_flow() {
        let repo = MemJobRepo::new();
        let flow_id = ResourceId::new();
        for n in 1..=3 {
            repo.insert(&Job::new(flow_id, n, Trigger::Manual, ""))
                .await
                .unwrap();
        }
        repo.insert(&Job::new(ResourceId::new(), 1, Trigger::Manual, ""))
            .await
            .unwrap();

        let listed = repo.list_by_flow(flow_id, 2).await.unwrap();
        let numbers: Vec<u64> = listed.iter().map(|j| j.build_number).collect();
        assert_eq!(numbers, vec![3, 2]);

        assert_eq!(repo.delete_by_flow(flow_id).await.unwrap(), 3);
        assert!(repo.list_by_flow(flow_id, 10).await.unwrap().is_empty());
        assert_eq!(repo.next_build_number(flow_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_steps_listed_in_tree_order() {
        let repo = MemStepRepo::new();
        let flow_id = ResourceId::new();
        let job_id = ResourceId::new();
        let steps: Vec<Step> = ["build", "test", "deploy"]
            .iter()
            .enumerate()
            .map(|(i, name)| Step::new(flow_id, job_id, 1, i as u32, &node(name)))
            .collect();
        repo.insert_all(&steps).await.unwrap();
        assert!(repo.insert_all(&steps[..1]).await.is_err());

        let listed = repo.list_by_job(job_id).await.unwrap();
        let paths: Vec<&str> = listed.iter().map(|s| s.node_path.as_str()).collect();
        assert_eq!(paths, vec!["api/build", "api/test", "api/deploy"]);

        assert_eq!(repo.delete_by_flow(flow_id).await.unwrap(), 3);
        assert!(repo.get(steps[0].id).await.unwrap_err().is_not_found());
    }
}
