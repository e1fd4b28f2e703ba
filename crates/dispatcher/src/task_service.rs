//! 任务生命周期与状态机
//!
//! 状态迁移规则：
//! - 启用：部署失败的任务重新走完整部署；禁用/已启用的任务直接安装远程任务
//! - 禁用：要求Worker在线才能确认移除远程安装，否则仅本地置为禁用（尽力而为）
//! - 在途部署期间（待部署/正在部署）启用、禁用、立即执行一律快速失败

use std::sync::Arc;

use tracing::{info, warn};

use crate::cron_utils::CronScheduler;
use crate::deploy::DeploymentPipeline;
use crate::worker_service::WorkerService;
use capd_core::{CapError, CapResult};
use capd_domain::{
    GroupRepository, PublishRecord, RemoteJobClient, SourceRepoRepository, Task, TaskKind,
    TaskRepository, TaskStatus, WorkerRepository, DEFAULT_GROUP_NAME,
};
use chrono::Utc;

/// 任务的声明式定义（创建入参）
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskDefinition {
    pub kind: TaskKind,
    pub name: String,
    pub worker_id: i64,
    pub repo_id: i64,
    pub version: String,
    /// CRON规则，仅计划任务
    pub rule: Option<String>,
    pub pre_build: String,
    pub run_cmd: String,
    pub info: String,
    pub owner: String,
    /// 不指定时归入默认分组
    pub group_id: Option<i64>,
}

/// 任务服务
pub struct TaskService {
    task_repo: Arc<dyn TaskRepository>,
    worker_repo: Arc<dyn WorkerRepository>,
    repo_repo: Arc<dyn SourceRepoRepository>,
    group_repo: Arc<dyn GroupRepository>,
    worker_service: Arc<WorkerService>,
    pipeline: Arc<DeploymentPipeline>,
    remote: Arc<dyn RemoteJobClient>,
}

impl TaskService {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        worker_repo: Arc<dyn WorkerRepository>,
        repo_repo: Arc<dyn SourceRepoRepository>,
        group_repo: Arc<dyn GroupRepository>,
        worker_service: Arc<WorkerService>,
        pipeline: Arc<DeploymentPipeline>,
        remote: Arc<dyn RemoteJobClient>,
    ) -> Self {
        Self {
            task_repo,
            worker_repo,
            repo_repo,
            group_repo,
            worker_service,
            pipeline,
            remote,
        }
    }

    /// 创建任务；新任务处于禁用态，由调用方决定何时部署
    pub async fn create(&self, definition: TaskDefinition) -> CapResult<Task> {
        match definition.kind {
            TaskKind::Scheduled => {
                let rule = definition.rule.as_deref().ok_or_else(|| {
                    CapError::config_error("计划任务必须提供CRON规则")
                })?;
                CronScheduler::validate_cron_expression(rule)?;
            }
            TaskKind::Continuous => {
                if definition.rule.is_some() {
                    return Err(CapError::config_error("常驻任务不接受CRON规则"));
                }
            }
        }

        self.worker_repo
            .worker_by_id(definition.worker_id)
            .await?
            .ok_or(CapError::WorkerNotFound {
                id: definition.worker_id,
            })?;
        self.repo_repo
            .repo_by_id(definition.repo_id)
            .await?
            .ok_or(CapError::RepoNotFound {
                id: definition.repo_id,
            })?;

        let group_id = match definition.group_id {
            Some(id) => id,
            None => self.group_repo.ensure_group(DEFAULT_GROUP_NAME).await?.id,
        };

        let now = Utc::now();
        let task = Task {
            id: 0,
            kind: definition.kind,
            name: definition.name,
            worker_id: definition.worker_id,
            repo_id: definition.repo_id,
            version: definition.version,
            rule: definition.rule,
            pre_build: definition.pre_build,
            run_cmd: definition.run_cmd,
            info: definition.info,
            owner: definition.owner,
            group_id,
            status: TaskStatus::Disabled,
            run_count: 0,
            latest_execution_id: None,
            created_at: now,
            updated_at: now,
        };
        let task = self.task_repo.insert_task(&task).await?;
        info!("任务已创建: id={}, kind={}", task.id, task.kind.as_str());
        Ok(task)
    }

    pub async fn find_by_id(&self, task_id: i64) -> CapResult<Task> {
        self.task_repo
            .task_by_id(task_id)
            .await?
            .ok_or(CapError::TaskNotFound { id: task_id })
    }

    /// 发起完整部署（检出代码并安装正式任务）
    pub async fn deploy(&self, task_id: i64) -> CapResult<PublishRecord> {
        self.pipeline.deploy(task_id).await
    }

    /// 启用任务
    pub async fn enable(&self, task_id: i64) -> CapResult<()> {
        let task = self.find_by_id(task_id).await?;
        if task.status.deploy_in_flight() {
            return Err(CapError::ConcurrentDeployment { task_id });
        }
        if task.status == TaskStatus::DeployFailed {
            // 部署失败只能从头重新部署
            self.pipeline.deploy(task_id).await?;
            return Ok(());
        }

        self.pipeline.install_real_job(&task).await?;
        self.task_repo
            .update_task_status(task.id, TaskStatus::Enabled)
            .await?;
        info!("任务已启用: id={task_id}");
        Ok(())
    }

    /// 禁用任务。移除远程安装需要Worker在线确认；Worker不可达时仅翻转
    /// 本地状态，远端任务可能继续运行（已知且接受的缺口）。
    pub async fn disable(&self, task_id: i64) -> CapResult<()> {
        let task = self.find_by_id(task_id).await?;
        if task.status.deploy_in_flight() {
            return Err(CapError::ConcurrentDeployment { task_id });
        }
        if task.status == TaskStatus::DeployFailed {
            return Err(CapError::invalid_state(
                "当前任务状态为部署失败，仅可进行删除/修改",
            ));
        }

        let worker = self
            .worker_repo
            .worker_by_id(task.worker_id)
            .await?
            .ok_or(CapError::WorkerNotFound { id: task.worker_id })?;
        if self.worker_service.is_alive(&worker).await {
            if let Err(e) = self.pipeline.remove_remote_job(&task).await {
                warn!("移除远程安装失败,本地状态仍置为禁用: task_id={task_id}, error={e}");
            }
        } else {
            warn!(
                "Worker不在线,未确认远程移除: task_id={task_id}, worker={}",
                worker.address
            );
        }

        self.task_repo
            .update_task_status(task.id, TaskStatus::Disabled)
            .await?;
        info!("任务已禁用: id={task_id}");
        Ok(())
    }

    /// 删除任务：先尽力移除远程安装，再物理删除记录
    pub async fn remove(&self, task_id: i64) -> CapResult<()> {
        let task = self.find_by_id(task_id).await?;
        let worker = self
            .worker_repo
            .worker_by_id(task.worker_id)
            .await?
            .ok_or(CapError::WorkerNotFound { id: task.worker_id })?;
        if self.worker_service.is_alive(&worker).await {
            if let Err(e) = self.pipeline.remove_remote_job(&task).await {
                warn!("删除任务时移除远程安装失败: task_id={task_id}, error={e}");
            }
        }
        self.task_repo.delete_task(task.id).await?;
        info!("任务已删除: id={task_id}");
        Ok(())
    }

    /// 立即执行一次（仅计划任务；重新安装后触发，保证安装与定义一致）
    pub async fn run_once(&self, task_id: i64) -> CapResult<()> {
        let task = self.find_by_id(task_id).await?;
        if task.kind != TaskKind::Scheduled {
            return Err(CapError::invalid_state("仅计划任务支持立即执行"));
        }
        if task.status.deploy_in_flight() {
            return Err(CapError::ConcurrentDeployment { task_id });
        }
        if task.status != TaskStatus::Enabled {
            return Err(CapError::invalid_state(format!(
                "当前任务状态为{},不允许执行此操作",
                task.status.label()
            )));
        }

        let worker = self
            .worker_repo
            .worker_by_id(task.worker_id)
            .await?
            .ok_or(CapError::WorkerNotFound { id: task.worker_id })?;
        self.pipeline.install_real_job(&task).await?;
        self.remote.run_now(&worker.address, &task.job_key()).await?;
        info!("任务已触发立即执行: id={task_id}");
        Ok(())
    }

    /// 常驻任务当前是否在运行
    pub async fn is_running(&self, task_id: i64) -> CapResult<bool> {
        let task = self.find_by_id(task_id).await?;
        if task.kind != TaskKind::Continuous {
            return Err(CapError::invalid_state("仅常驻任务支持运行状态查询"));
        }
        if task.status != TaskStatus::Enabled {
            return Ok(false);
        }
        let worker = self
            .worker_repo
            .worker_by_id(task.worker_id)
            .await?
            .ok_or(CapError::WorkerNotFound { id: task.worker_id })?;
        if !self.worker_service.is_alive(&worker).await {
            return Ok(false);
        }
        Ok(self
            .remote
            .is_running(&worker.address, &task.job_key())
            .await
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use capd_domain::{JobCallback, JobSpec, RepoKind, SourceRepository, Worker};
    use capd_infrastructure::MemoryStore;
    use chrono::Duration;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration as StdDuration;
    use tokio::sync::Mutex;

    /// 记录安装动作的通道假件
    #[derive(Default)]
    struct FakeRemote {
        installed: Mutex<HashMap<String, &'static str>>,
        running_keys: Mutex<HashSet<String>>,
        run_now_calls: Mutex<Vec<String>>,
        ping_ok: std::sync::atomic::AtomicBool,
    }

    impl FakeRemote {
        fn new(ping_ok: bool) -> Self {
            let remote = Self::default();
            remote
                .ping_ok
                .store(ping_ok, std::sync::atomic::Ordering::SeqCst);
            remote
        }

        async fn installed_kind(&self, key: &str) -> Option<&'static str> {
            self.installed.lock().await.get(key).copied()
        }
    }

    #[async_trait]
    impl RemoteJobClient for FakeRemote {
        async fn cron_set(
            &self,
            _address: &str,
            key: &str,
            _rule: &str,
            _spec: &JobSpec,
            _callback: &JobCallback,
        ) -> CapResult<()> {
            self.installed.lock().await.insert(key.to_string(), "cron");
            Ok(())
        }
        async fn daemon_set(
            &self,
            _address: &str,
            key: &str,
            _spec: &JobSpec,
            _callback: &JobCallback,
        ) -> CapResult<()> {
            self.installed
                .lock()
                .await
                .insert(key.to_string(), "daemon");
            Ok(())
        }
        async fn task_set(
            &self,
            _address: &str,
            key: &str,
            _spec: &JobSpec,
            _callback: &JobCallback,
            _timeout: StdDuration,
        ) -> CapResult<()> {
            self.installed.lock().await.insert(key.to_string(), "task");
            Ok(())
        }
        async fn delete(&self, _address: &str, key: &str) -> CapResult<()> {
            self.installed.lock().await.remove(key);
            Ok(())
        }
        async fn get(&self, _address: &str, key: &str) -> CapResult<bool> {
            Ok(self.installed.lock().await.contains_key(key))
        }
        async fn run_now(&self, _address: &str, key: &str) -> CapResult<()> {
            self.run_now_calls.lock().await.push(key.to_string());
            Ok(())
        }
        async fn is_running(&self, _address: &str, key: &str) -> CapResult<bool> {
            Ok(self.running_keys.lock().await.contains(key))
        }
        async fn ping(&self, _address: &str) -> CapResult<()> {
            if self.ping_ok.load(std::sync::atomic::Ordering::SeqCst) {
                Ok(())
            } else {
                Err(CapError::network_error("no route to host"))
            }
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        remote: Arc<FakeRemote>,
        service: TaskService,
        worker_id: i64,
        repo_id: i64,
    }

    async fn harness_with_remote(remote: FakeRemote, worker_alive: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(remote);

        let mut worker = Worker::new("10.0.0.1".to_string(), "/data/capd".to_string());
        if !worker_alive {
            // 把心跳做旧，迫使存活判定走探活
            worker.last_heartbeat = Utc::now() - Duration::seconds(60);
        }
        let worker = store.register(&worker).await.unwrap();
        let repo = store
            .add_repo(&SourceRepository::new(
                RepoKind::Git,
                "https://repo.example.com/app.git".to_string(),
                String::new(),
                String::new(),
            ))
            .await
            .unwrap();

        let worker_service = Arc::new(WorkerService::new(
            store.clone(),
            store.clone(),
            remote.clone(),
            6,
            7,
        ));
        let pipeline = Arc::new(DeploymentPipeline::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            worker_service.clone(),
            remote.clone(),
            StdDuration::from_secs(600),
        ));
        let service = TaskService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            worker_service,
            pipeline,
            remote.clone(),
        );

        Harness {
            store,
            remote,
            service,
            worker_id: worker.id,
            repo_id: repo.id,
        }
    }

    async fn harness(worker_alive: bool) -> Harness {
        harness_with_remote(FakeRemote::new(worker_alive), worker_alive).await
    }

    fn definition(harness: &Harness, kind: TaskKind) -> TaskDefinition {
        TaskDefinition {
            kind,
            name: "report".to_string(),
            worker_id: harness.worker_id,
            repo_id: harness.repo_id,
            version: "abc123".to_string(),
            rule: match kind {
                TaskKind::Scheduled => Some("0 0 2 * * *".to_string()),
                TaskKind::Continuous => None,
            },
            pre_build: String::new(),
            run_cmd: "python main.py".to_string(),
            info: String::new(),
            owner: "ops".to_string(),
            group_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_default_group() {
        let h = harness(true).await;
        let task = h
            .service
            .create(definition(&h, TaskKind::Scheduled))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Disabled);
        assert!(task.group_id > 0);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_rule() {
        let h = harness(true).await;
        let mut def = definition(&h, TaskKind::Scheduled);
        def.rule = Some("whenever".to_string());
        assert!(matches!(
            h.service.create(def).await.unwrap_err(),
            CapError::InvalidCron { .. }
        ));

        let mut def = definition(&h, TaskKind::Scheduled);
        def.rule = None;
        assert!(matches!(
            h.service.create(def).await.unwrap_err(),
            CapError::Configuration(_)
        ));
    }

    #[tokio::test]
    async fn test_enable_installs_remote_job_directly() {
        let h = harness(true).await;
        let task = h
            .service
            .create(definition(&h, TaskKind::Scheduled))
            .await
            .unwrap();

        h.service.enable(task.id).await.unwrap();

        let stored = h.service.find_by_id(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Enabled);
        assert_eq!(h.remote.installed_kind(&task.job_key()).await, Some("cron"));
    }

    #[tokio::test]
    async fn test_enable_from_deploy_failed_redeploys() {
        let h = harness(true).await;
        let task = h
            .service
            .create(definition(&h, TaskKind::Scheduled))
            .await
            .unwrap();
        h.store
            .update_task_status(task.id, TaskStatus::DeployFailed)
            .await
            .unwrap();

        h.service.enable(task.id).await.unwrap();

        let stored = h.service.find_by_id(task.id).await.unwrap();
        // 完整部署从待部署重新开始
        assert_eq!(stored.status, TaskStatus::PendingDeploy);
        assert_eq!(h.remote.installed_kind("publish-1").await, Some("task"));
    }

    #[tokio::test]
    async fn test_guards_while_deploy_in_flight() {
        let h = harness(true).await;
        let task = h
            .service
            .create(definition(&h, TaskKind::Scheduled))
            .await
            .unwrap();

        for status in [TaskStatus::PendingDeploy, TaskStatus::Deploying] {
            h.store.update_task_status(task.id, status).await.unwrap();

            assert!(matches!(
                h.service.enable(task.id).await.unwrap_err(),
                CapError::ConcurrentDeployment { .. }
            ));
            assert!(matches!(
                h.service.disable(task.id).await.unwrap_err(),
                CapError::ConcurrentDeployment { .. }
            ));
            assert!(matches!(
                h.service.run_once(task.id).await.unwrap_err(),
                CapError::ConcurrentDeployment { .. }
            ));
            // 快速失败不改动状态
            assert_eq!(h.service.find_by_id(task.id).await.unwrap().status, status);
        }
    }

    #[tokio::test]
    async fn test_disable_rejected_when_deploy_failed() {
        let h = harness(true).await;
        let task = h
            .service
            .create(definition(&h, TaskKind::Scheduled))
            .await
            .unwrap();
        h.store
            .update_task_status(task.id, TaskStatus::DeployFailed)
            .await
            .unwrap();

        assert!(matches!(
            h.service.disable(task.id).await.unwrap_err(),
            CapError::InvalidState(_)
        ));
        assert_eq!(
            h.service.find_by_id(task.id).await.unwrap().status,
            TaskStatus::DeployFailed
        );
    }

    #[tokio::test]
    async fn test_disable_removes_remote_install_when_alive() {
        let h = harness(true).await;
        let task = h
            .service
            .create(definition(&h, TaskKind::Scheduled))
            .await
            .unwrap();
        h.service.enable(task.id).await.unwrap();
        assert!(h.remote.installed_kind(&task.job_key()).await.is_some());

        h.service.disable(task.id).await.unwrap();
        assert_eq!(
            h.service.find_by_id(task.id).await.unwrap().status,
            TaskStatus::Disabled
        );
        assert!(h.remote.installed_kind(&task.job_key()).await.is_none());
    }

    #[tokio::test]
    async fn test_disable_with_offline_worker_flips_local_state_only() {
        let h = harness(false).await;
        let task = h
            .service
            .create(definition(&h, TaskKind::Scheduled))
            .await
            .unwrap();
        h.store
            .update_task_status(task.id, TaskStatus::Enabled)
            .await
            .unwrap();
        // 模拟远端残留的安装
        h.remote
            .installed
            .lock()
            .await
            .insert(task.job_key(), "cron");

        h.service.disable(task.id).await.unwrap();

        assert_eq!(
            h.service.find_by_id(task.id).await.unwrap().status,
            TaskStatus::Disabled
        );
        // Worker不可达，远端安装未被移除
        assert!(h.remote.installed_kind(&task.job_key()).await.is_some());
    }

    #[tokio::test]
    async fn test_deploy_requires_alive_worker() {
        let h = harness(false).await;
        let task = h
            .service
            .create(definition(&h, TaskKind::Scheduled))
            .await
            .unwrap();

        assert!(matches!(
            h.service.deploy(task.id).await.unwrap_err(),
            CapError::WorkerOffline { .. }
        ));
        assert_eq!(
            h.service.find_by_id(task.id).await.unwrap().status,
            TaskStatus::Disabled
        );
    }

    #[tokio::test]
    async fn test_second_deploy_replaces_remote_install() {
        let h = harness(true).await;
        let task = h
            .service
            .create(definition(&h, TaskKind::Scheduled))
            .await
            .unwrap();
        // 第一次部署完成后留下的正式安装
        h.remote
            .installed
            .lock()
            .await
            .insert(task.job_key(), "cron");

        h.service.deploy(task.id).await.unwrap();

        // 旧安装被删除，新的部署任务在途
        assert!(h.remote.installed_kind(&task.job_key()).await.is_none());
        assert_eq!(h.remote.installed_kind("publish-1").await, Some("task"));
    }

    #[tokio::test]
    async fn test_run_once_reinstalls_and_triggers() {
        let h = harness(true).await;
        let task = h
            .service
            .create(definition(&h, TaskKind::Scheduled))
            .await
            .unwrap();
        h.service.enable(task.id).await.unwrap();

        h.service.run_once(task.id).await.unwrap();
        assert_eq!(
            h.remote.run_now_calls.lock().await.as_slice(),
            &[task.job_key()]
        );
    }

    #[tokio::test]
    async fn test_run_once_rejected_when_not_enabled() {
        let h = harness(true).await;
        let task = h
            .service
            .create(definition(&h, TaskKind::Scheduled))
            .await
            .unwrap();

        assert!(matches!(
            h.service.run_once(task.id).await.unwrap_err(),
            CapError::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn test_is_running_for_continuous_tasks() {
        let h = harness(true).await;
        let task = h
            .service
            .create(definition(&h, TaskKind::Continuous))
            .await
            .unwrap();

        // 未启用一律视为未运行
        assert!(!h.service.is_running(task.id).await.unwrap());

        h.store
            .update_task_status(task.id, TaskStatus::Enabled)
            .await
            .unwrap();
        h.remote
            .running_keys
            .lock()
            .await
            .insert(task.job_key());
        assert!(h.service.is_running(task.id).await.unwrap());

        // 计划任务不支持该查询
        let cron_task = h
            .service
            .create(definition(&h, TaskKind::Scheduled))
            .await
            .unwrap();
        assert!(h.service.is_running(cron_task.id).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_deletes_record_and_remote_install() {
        let h = harness(true).await;
        let task = h
            .service
            .create(definition(&h, TaskKind::Scheduled))
            .await
            .unwrap();
        h.service.enable(task.id).await.unwrap();

        h.service.remove(task.id).await.unwrap();
        assert!(matches!(
            h.service.find_by_id(task.id).await.unwrap_err(),
            CapError::TaskNotFound { .. }
        ));
        assert!(h.remote.installed_kind(&task.job_key()).await.is_none());
    }
}
