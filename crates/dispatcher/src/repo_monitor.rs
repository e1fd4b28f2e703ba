//! 代码库登记与提交轮询
//!
//! 每个代码库一个常驻轮询任务，安装在指定的Worker上；轮询结果
//! （提交历史、过程日志）经回调通道写回。

use std::sync::Arc;

use tracing::info;

use crate::worker_service::WorkerService;
use capd_core::{CapError, CapResult};
use capd_domain::{
    CommitLogEntry, CommitLogRepository, JobCallback, JobSpec, JobStep, RemoteJobClient,
    RepoKind, RepoPollLog, RepoPollLogRepository, SourceRepoRepository, SourceRepository,
    WorkerRepository,
};

/// git轮询枚举的提交条数上限
const GIT_POLL_LIMIT: usize = 300;
/// svn轮询枚举的提交条数上限
const SVN_POLL_LIMIT: usize = 500;

/// 代码库监控服务
pub struct RepoMonitorService {
    repo_repo: Arc<dyn SourceRepoRepository>,
    commit_repo: Arc<dyn CommitLogRepository>,
    poll_log_repo: Arc<dyn RepoPollLogRepository>,
    worker_repo: Arc<dyn WorkerRepository>,
    worker_service: Arc<WorkerService>,
    remote: Arc<dyn RemoteJobClient>,
}

impl RepoMonitorService {
    pub fn new(
        repo_repo: Arc<dyn SourceRepoRepository>,
        commit_repo: Arc<dyn CommitLogRepository>,
        poll_log_repo: Arc<dyn RepoPollLogRepository>,
        worker_repo: Arc<dyn WorkerRepository>,
        worker_service: Arc<WorkerService>,
        remote: Arc<dyn RemoteJobClient>,
    ) -> Self {
        Self {
            repo_repo,
            commit_repo,
            poll_log_repo,
            worker_repo,
            worker_service,
            remote,
        }
    }

    /// 登记代码库；url唯一
    pub async fn add_repo(
        &self,
        kind: RepoKind,
        url: String,
        username: String,
        password: String,
    ) -> CapResult<SourceRepository> {
        if self.repo_repo.repo_by_url(&url).await?.is_some() {
            return Err(CapError::database_error(format!("代码库已存在: {url}")));
        }
        let repo = self
            .repo_repo
            .add_repo(&SourceRepository::new(kind, url, username, password))
            .await?;
        info!("代码库已登记: id={}, kind={}", repo.id, repo.kind.as_str());
        Ok(repo)
    }

    pub async fn repo_by_id(&self, repo_id: i64) -> CapResult<SourceRepository> {
        self.repo_repo
            .repo_by_id(repo_id)
            .await?
            .ok_or(CapError::RepoNotFound { id: repo_id })
    }

    /// 在指定Worker上开启提交轮询（同键旧安装先删后装）
    pub async fn enable(&self, repo_id: i64, worker_id: i64) -> CapResult<()> {
        let repo = self.repo_by_id(repo_id).await?;
        let worker = self
            .worker_repo
            .worker_by_id(worker_id)
            .await?
            .ok_or(CapError::WorkerNotFound { id: worker_id })?;
        if !self.worker_service.is_alive(&worker).await {
            return Err(CapError::worker_offline(worker.address.clone()));
        }

        let key = repo.monitor_key();
        if self.remote.get(&worker.address, &key).await? {
            self.remote.delete(&worker.address, &key).await?;
        }

        let mirror_dir = repo.mirror_dir(&worker.work_dir);
        let limit = match repo.kind {
            RepoKind::Git => GIT_POLL_LIMIT,
            RepoKind::Svn => SVN_POLL_LIMIT,
        };
        let spec = JobSpec::new(vec![
            JobStep::MakeDir {
                path: mirror_dir.clone(),
            },
            JobStep::PollCommits {
                kind: repo.kind,
                url: repo.url.clone(),
                username: repo.username.clone(),
                password: repo.password.clone(),
                mirror_dir,
                limit,
            },
        ]);
        let callback = JobCallback::RepoPoll { repo_id: repo.id };
        self.remote
            .daemon_set(&worker.address, &key, &spec, &callback)
            .await?;
        info!(
            "代码监控已开启: repo_id={}, worker={}, key={key}",
            repo.id, worker.address
        );
        Ok(())
    }

    /// 停止提交轮询；未安装时为无操作
    pub async fn disable(&self, repo_id: i64, worker_id: i64) -> CapResult<()> {
        let repo = self.repo_by_id(repo_id).await?;
        let worker = self
            .worker_repo
            .worker_by_id(worker_id)
            .await?
            .ok_or(CapError::WorkerNotFound { id: worker_id })?;

        let key = repo.monitor_key();
        if self.remote.get(&worker.address, &key).await? {
            self.remote.delete(&worker.address, &key).await?;
            info!("代码监控已停止: repo_id={repo_id}, key={key}");
        }
        Ok(())
    }

    /// 最近的提交历史
    pub async fn commit_history(
        &self,
        repo_id: i64,
        limit: usize,
    ) -> CapResult<Vec<CommitLogEntry>> {
        self.commit_repo.commits_by_repo(repo_id, limit).await
    }

    /// 轮询过程日志
    pub async fn poll_log(&self, repo_id: i64) -> CapResult<Option<RepoPollLog>> {
        self.poll_log_repo.poll_log(repo_id).await
    }
}
