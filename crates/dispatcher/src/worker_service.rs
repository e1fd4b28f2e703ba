//! Worker注册、存活判定与自监控

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use capd_core::{CapError, CapResult};
use capd_domain::{
    CpuMemSample, CpuMemSampleRepository, HeartbeatSink, JobCallback, JobSpec, JobStep,
    RemoteJobClient, ResourceSample, Worker, WorkerRepository,
};

/// 自监控采样的CRON规则（每分钟一次）
const MONITOR_RULE: &str = "0 * * * * *";

/// Worker服务：心跳落库、存活判定、自监控安装与采样处理
pub struct WorkerService {
    worker_repo: Arc<dyn WorkerRepository>,
    sample_repo: Arc<dyn CpuMemSampleRepository>,
    remote: Arc<dyn RemoteJobClient>,
    /// 心跳新鲜窗口（秒），窗口内免探活
    heartbeat_alive_seconds: i64,
    /// 采样保留天数
    sample_keep_days: i64,
}

impl WorkerService {
    pub fn new(
        worker_repo: Arc<dyn WorkerRepository>,
        sample_repo: Arc<dyn CpuMemSampleRepository>,
        remote: Arc<dyn RemoteJobClient>,
        heartbeat_alive_seconds: i64,
        sample_keep_days: i64,
    ) -> Self {
        Self {
            worker_repo,
            sample_repo,
            remote,
            heartbeat_alive_seconds,
            sample_keep_days,
        }
    }

    /// 处理一次心跳：未知地址即注册，已知地址刷新心跳时间与工作目录
    pub async fn heartbeat(&self, address: &str, work_dir: &str) -> CapResult<Worker> {
        let now = Utc::now();
        match self.worker_repo.worker_by_address(address).await? {
            Some(worker) => {
                self.worker_repo
                    .record_heartbeat(worker.id, now, work_dir)
                    .await?;
                self.worker_repo
                    .worker_by_id(worker.id)
                    .await?
                    .ok_or(CapError::WorkerNotFound { id: worker.id })
            }
            None => {
                let worker = self
                    .worker_repo
                    .register(&Worker::new(address.to_string(), work_dir.to_string()))
                    .await?;
                info!("新Worker注册: address={address}, id={}", worker.id);
                Ok(worker)
            }
        }
    }

    /// 存活判定：心跳在窗口内直接判活（避免探测风暴），否则带外探活
    pub async fn is_alive(&self, worker: &Worker) -> bool {
        if worker.heartbeat_fresh(Utc::now(), self.heartbeat_alive_seconds) {
            return true;
        }
        match self.remote.ping(&worker.address).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Worker探活失败: address={}, error={e}", worker.address);
                false
            }
        }
    }

    pub async fn find_by_id(&self, id: i64) -> CapResult<Worker> {
        self.worker_repo
            .worker_by_id(id)
            .await?
            .ok_or(CapError::WorkerNotFound { id })
    }

    pub async fn find_all(&self) -> CapResult<Vec<Worker>> {
        self.worker_repo.all_workers().await
    }

    /// 在Worker上安装自监控任务：每分钟采样一次CPU/内存并回传。
    /// 同键旧安装先删后装，幂等。
    pub async fn install_self_monitor(&self, worker: &Worker) -> CapResult<()> {
        let key = worker.monitor_key();
        if self.remote.get(&worker.address, &key).await? {
            self.remote.delete(&worker.address, &key).await?;
        }
        let spec = JobSpec::new(vec![JobStep::SampleResources]);
        let callback = JobCallback::ResourceMonitor {
            worker_id: worker.id,
        };
        self.remote
            .cron_set(&worker.address, &key, MONITOR_RULE, &spec, &callback)
            .await?;
        info!("已安装自监控任务: address={}, key={key}", worker.address);
        Ok(())
    }

    /// 采样落库：刷新容量事实、追加采样、清理过期采样
    pub async fn handle_sample(&self, worker_id: i64, sample: &ResourceSample) -> CapResult<()> {
        self.worker_repo
            .update_worker_facts(
                worker_id,
                sample.total_cpu,
                sample.total_mem_mb,
                &sample.platform,
            )
            .await?;

        let record = CpuMemSample {
            id: 0,
            worker_id,
            sampled_at: Utc::now(),
            cpu_percent: sample.cpu_percent,
            mem_percent: sample.mem_percent,
        };
        self.sample_repo.append_sample(&record).await?;

        let cutoff = Utc::now() - Duration::days(self.sample_keep_days);
        let pruned = self.sample_repo.prune_samples_before(cutoff).await?;
        if pruned > 0 {
            debug!("清理过期采样: worker_id={worker_id}, 条数={pruned}");
        }
        Ok(())
    }

    /// 当前CPU/内存负载；Worker不在线时为None
    pub async fn cpu_mem_now(&self, worker: &Worker) -> CapResult<Option<(i32, i32)>> {
        if !self.is_alive(worker).await {
            return Ok(None);
        }
        Ok(self
            .sample_repo
            .latest_sample(worker.id)
            .await?
            .map(|s| (s.cpu_percent, s.mem_percent)))
    }

    /// 最近的CPU/内存历史，按时间正序
    pub async fn cpu_mem_history(
        &self,
        worker: &Worker,
        limit: usize,
    ) -> CapResult<Vec<CpuMemSample>> {
        self.sample_repo.recent_samples(worker.id, limit).await
    }
}

#[async_trait]
impl HeartbeatSink for WorkerService {
    async fn heartbeat(&self, address: &str, work_dir: &str) -> CapResult<()> {
        if let Err(e) = WorkerService::heartbeat(self, address, work_dir).await {
            warn!("心跳处理失败: address={address}, error={e}");
            return Err(e);
        }
        Ok(())
    }
}
