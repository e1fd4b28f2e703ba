//! 部署流水线
//!
//! 把任务定义变成Worker上的一份安装：清目录、检出固定版本、可选预构建，
//! 之后由回调驱动安装正式任务。整个过程不阻塞等待远端完成。

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::worker_service::WorkerService;
use capd_core::{CapError, CapResult};
use capd_domain::{
    JobCallback, JobSpec, JobStep, PublishRecord, PublishRecordRepository, RemoteJobClient,
    SourceRepoRepository, SourceRepository, Task, TaskKind, TaskRepository, TaskStatus, Worker,
    WorkerRepository,
};

/// 部署流水线：一次部署对应一条发布记录与一个一次性远程任务
pub struct DeploymentPipeline {
    task_repo: Arc<dyn TaskRepository>,
    publish_repo: Arc<dyn PublishRecordRepository>,
    worker_repo: Arc<dyn WorkerRepository>,
    repo_repo: Arc<dyn SourceRepoRepository>,
    worker_service: Arc<WorkerService>,
    remote: Arc<dyn RemoteJobClient>,
    deploy_timeout: Duration,
}

impl DeploymentPipeline {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        publish_repo: Arc<dyn PublishRecordRepository>,
        worker_repo: Arc<dyn WorkerRepository>,
        repo_repo: Arc<dyn SourceRepoRepository>,
        worker_service: Arc<WorkerService>,
        remote: Arc<dyn RemoteJobClient>,
        deploy_timeout: Duration,
    ) -> Self {
        Self {
            task_repo,
            publish_repo,
            worker_repo,
            repo_repo,
            worker_service,
            remote,
            deploy_timeout,
        }
    }

    /// 发布记录对应的一次性任务安装键
    pub fn publish_key(publish_id: i64) -> String {
        format!("publish-{publish_id}")
    }

    /// 发起一次部署。同一任务同一时刻至多一次在途部署。
    pub async fn deploy(&self, task_id: i64) -> CapResult<PublishRecord> {
        let task = self
            .task_repo
            .task_by_id(task_id)
            .await?
            .ok_or(CapError::TaskNotFound { id: task_id })?;
        if task.status.deploy_in_flight() {
            return Err(CapError::ConcurrentDeployment { task_id });
        }

        let worker = self.load_worker(task.worker_id).await?;
        if !self.worker_service.is_alive(&worker).await {
            return Err(CapError::worker_offline(worker.address.clone()));
        }
        let repo = self.load_repo(task.repo_id).await?;

        // 同键旧安装先删除，保证至多一份活动安装
        let job_key = task.job_key();
        if self.remote.get(&worker.address, &job_key).await? {
            self.remote.delete(&worker.address, &job_key).await?;
        }

        let publish = self
            .publish_repo
            .insert_publish(&PublishRecord::new(task.id, task.kind))
            .await?;
        self.task_repo
            .update_task_status(task.id, TaskStatus::PendingDeploy)
            .await?;

        let spec = build_deploy_spec(&task, &repo, &worker);
        let callback = JobCallback::Deploy {
            task_id: task.id,
            task_kind: task.kind,
            publish_id: publish.id,
        };
        self.remote
            .task_set(
                &worker.address,
                &Self::publish_key(publish.id),
                &spec,
                &callback,
                self.deploy_timeout,
            )
            .await?;

        info!(
            "部署已下发: task={}({}), worker={}, publish_id={}",
            task.name,
            job_key,
            worker.address,
            publish.id
        );
        Ok(publish)
    }

    /// 安装正式任务（部署成功回调、启用、立即执行都会走到这里）
    pub async fn install_real_job(&self, task: &Task) -> CapResult<()> {
        let worker = self.load_worker(task.worker_id).await?;
        let repo = self.load_repo(task.repo_id).await?;

        let spec = build_run_spec(task, &worker);
        let callback = JobCallback::TaskRun {
            task_id: task.id,
            task_kind: task.kind,
            repo_url: repo.url.clone(),
            version: task.version.clone(),
        };
        let key = task.job_key();

        match task.kind {
            TaskKind::Scheduled => {
                let rule = task.rule.as_deref().ok_or_else(|| {
                    CapError::config_error(format!("计划任务缺少CRON规则: task_id={}", task.id))
                })?;
                self.remote
                    .cron_set(&worker.address, &key, rule, &spec, &callback)
                    .await?;
            }
            TaskKind::Continuous => {
                self.remote
                    .daemon_set(&worker.address, &key, &spec, &callback)
                    .await?;
            }
        }
        info!("正式任务已安装: key={key}, worker={}", worker.address);
        Ok(())
    }

    /// 移除任务的远程安装；key不存在时为无操作
    pub async fn remove_remote_job(&self, task: &Task) -> CapResult<()> {
        let worker = self.load_worker(task.worker_id).await?;
        if self.remote.get(&worker.address, &task.job_key()).await? {
            self.remote.delete(&worker.address, &task.job_key()).await?;
        } else {
            warn!("移除时未发现远程安装: key={}", task.job_key());
        }
        Ok(())
    }

    async fn load_worker(&self, id: i64) -> CapResult<Worker> {
        self.worker_repo
            .worker_by_id(id)
            .await?
            .ok_or(CapError::WorkerNotFound { id })
    }

    async fn load_repo(&self, id: i64) -> CapResult<SourceRepository> {
        self.repo_repo
            .repo_by_id(id)
            .await?
            .ok_or(CapError::RepoNotFound { id })
    }
}

/// 部署任务规格：清空部署目录、重建、检出固定版本、可选预构建
fn build_deploy_spec(task: &Task, repo: &SourceRepository, worker: &Worker) -> JobSpec {
    let deploy_dir = task.deploy_dir(&worker.work_dir);
    let mut steps = vec![
        JobStep::CleanDir {
            path: deploy_dir.clone(),
        },
        JobStep::MakeDir {
            path: deploy_dir.clone(),
        },
        JobStep::Checkout {
            kind: repo.kind,
            url: repo.url.clone(),
            username: repo.username.clone(),
            password: repo.password.clone(),
            version: task.version.clone(),
            dest: deploy_dir,
        },
    ];
    if !task.pre_build.trim().is_empty() {
        steps.push(JobStep::Shell {
            command: task.pre_build.clone(),
            cwd: Some(task.code_dir(&worker.work_dir)),
        });
    }
    JobSpec::new(steps)
}

/// 正式任务规格：在检出目录里执行运行命令
fn build_run_spec(task: &Task, worker: &Worker) -> JobSpec {
    JobSpec::new(vec![JobStep::Shell {
        command: task.run_cmd.clone(),
        cwd: Some(task.code_dir(&worker.work_dir)),
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use capd_domain::RepoKind;
    use chrono::Utc;

    fn sample_task(kind: TaskKind) -> Task {
        Task {
            id: 5,
            kind,
            name: "nightly".to_string(),
            worker_id: 1,
            repo_id: 1,
            version: "abc123".to_string(),
            rule: Some("0 0 2 * * *".to_string()),
            pre_build: "pip install -r requirements.txt".to_string(),
            run_cmd: "python main.py".to_string(),
            info: String::new(),
            owner: "ops".to_string(),
            group_id: 1,
            status: TaskStatus::Disabled,
            run_count: 0,
            latest_execution_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sample_repo() -> SourceRepository {
        SourceRepository::new(
            RepoKind::Git,
            "https://repo.example.com/app.git".to_string(),
            String::new(),
            String::new(),
        )
    }

    #[test]
    fn test_deploy_spec_layout() {
        let task = sample_task(TaskKind::Scheduled);
        let worker = Worker::new("10.0.0.1".to_string(), "/data".to_string());
        let spec = build_deploy_spec(&task, &sample_repo(), &worker);

        assert_eq!(spec.steps.len(), 4);
        assert!(
            matches!(&spec.steps[0], JobStep::CleanDir { path } if path == "/data/cron/5")
        );
        assert!(
            matches!(&spec.steps[1], JobStep::MakeDir { path } if path == "/data/cron/5")
        );
        assert!(matches!(
            &spec.steps[2],
            JobStep::Checkout { version, dest, .. }
                if version == "abc123" && dest == "/data/cron/5"
        ));
        assert!(matches!(
            &spec.steps[3],
            JobStep::Shell { cwd: Some(cwd), .. } if cwd == "/data/cron/5/code_dir"
        ));
    }

    #[test]
    fn test_deploy_spec_skips_empty_pre_build() {
        let mut task = sample_task(TaskKind::Continuous);
        task.pre_build = "   ".to_string();
        let worker = Worker::new("10.0.0.1".to_string(), "/data".to_string());
        let spec = build_deploy_spec(&task, &sample_repo(), &worker);
        assert_eq!(spec.steps.len(), 3);
        // 常驻任务的检出目录在task段下
        assert!(
            matches!(&spec.steps[0], JobStep::CleanDir { path } if path == "/data/task/5")
        );
    }

    #[test]
    fn test_run_spec_uses_code_dir() {
        let task = sample_task(TaskKind::Scheduled);
        let worker = Worker::new("10.0.0.1".to_string(), "/data".to_string());
        let spec = build_run_spec(&task, &worker);
        assert!(matches!(
            &spec.steps[0],
            JobStep::Shell { command, cwd: Some(cwd) }
                if command == "python main.py" && cwd == "/data/cron/5/code_dir"
        ));
    }

    #[test]
    fn test_publish_key_format() {
        assert_eq!(DeploymentPipeline::publish_key(12), "publish-12");
    }
}
