//! Worker与采样表

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::MemoryStore;
use capd_core::{CapError, CapResult};
use capd_domain::{CpuMemSample, CpuMemSampleRepository, Worker, WorkerRepository};

#[async_trait]
impl WorkerRepository for MemoryStore {
    async fn register(&self, worker: &Worker) -> CapResult<Worker> {
        let mut state = self.state.write().await;
        if state.workers.values().any(|w| w.address == worker.address) {
            return Err(CapError::database_error(format!(
                "Worker地址已存在: {}",
                worker.address
            )));
        }
        let mut worker = worker.clone();
        worker.id = state.ids.next_worker();
        state.workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    async fn worker_by_id(&self, id: i64) -> CapResult<Option<Worker>> {
        Ok(self.state.read().await.workers.get(&id).cloned())
    }

    async fn worker_by_address(&self, address: &str) -> CapResult<Option<Worker>> {
        Ok(self
            .state
            .read()
            .await
            .workers
            .values()
            .find(|w| w.address == address)
            .cloned())
    }

    async fn all_workers(&self) -> CapResult<Vec<Worker>> {
        let state = self.state.read().await;
        let mut workers: Vec<Worker> = state.workers.values().cloned().collect();
        workers.sort_by_key(|w| w.id);
        Ok(workers)
    }

    async fn record_heartbeat(
        &self,
        id: i64,
        at: DateTime<Utc>,
        work_dir: &str,
    ) -> CapResult<()> {
        let mut state = self.state.write().await;
        let worker = state
            .workers
            .get_mut(&id)
            .ok_or(CapError::WorkerNotFound { id })?;
        // 心跳时间只增不减
        if at > worker.last_heartbeat {
            worker.last_heartbeat = at;
        }
        worker.work_dir = work_dir.to_string();
        Ok(())
    }

    async fn update_worker_facts(
        &self,
        id: i64,
        total_cpu: i32,
        total_mem_mb: i64,
        platform: &str,
    ) -> CapResult<()> {
        let mut state = self.state.write().await;
        let worker = state
            .workers
            .get_mut(&id)
            .ok_or(CapError::WorkerNotFound { id })?;
        worker.total_cpu = total_cpu;
        worker.total_mem_mb = total_mem_mb;
        worker.platform = platform.to_string();
        Ok(())
    }
}

#[async_trait]
impl CpuMemSampleRepository for MemoryStore {
    async fn append_sample(&self, sample: &CpuMemSample) -> CapResult<CpuMemSample> {
        let mut state = self.state.write().await;
        let mut sample = sample.clone();
        sample.id = state.ids.next_sample();
        state.samples.push(sample.clone());
        Ok(sample)
    }

    async fn prune_samples_before(&self, cutoff: DateTime<Utc>) -> CapResult<u64> {
        let mut state = self.state.write().await;
        let before = state.samples.len();
        state.samples.retain(|s| s.sampled_at >= cutoff);
        Ok((before - state.samples.len()) as u64)
    }

    async fn latest_sample(&self, worker_id: i64) -> CapResult<Option<CpuMemSample>> {
        let state = self.state.read().await;
        Ok(state
            .samples
            .iter()
            .filter(|s| s.worker_id == worker_id)
            .max_by_key(|s| s.id)
            .cloned())
    }

    async fn recent_samples(
        &self,
        worker_id: i64,
        limit: usize,
    ) -> CapResult<Vec<CpuMemSample>> {
        let state = self.state.read().await;
        let mut samples: Vec<CpuMemSample> = state
            .samples
            .iter()
            .filter(|s| s.worker_id == worker_id)
            .cloned()
            .collect();
        samples.sort_by_key(|s| std::cmp::Reverse(s.id));
        samples.truncate(limit);
        samples.reverse();
        Ok(samples)
    }
}
