//! 回调路由
//!
//! Worker回传的事件在这里落回存储并驱动任务状态机。事件可能乱序、
//! 并发到达：发布记录的终态写入全部带状态护卫，先到的终态获胜——
//! 超时之后晚到的成功回调直接丢弃。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::deploy::DeploymentPipeline;
use crate::worker_service::WorkerService;
use capd_core::{CapError, CapResult};
use capd_domain::{
    CommitInfo, CommitLogEntry, CommitLogRepository, ExecutionRecord, ExecutionRecordRepository,
    ExecutionStatus, JobCallback, JobEvent, JobEventKind, PublishRecordRepository, PublishState,
    RepoPollLogRepository, ResourceSample, TaskKind, TaskRepository, TaskStatus,
};
use capd_domain::CallbackSink;

/// 事件到记录变更的路由器
pub struct CallbackRouter {
    task_repo: Arc<dyn TaskRepository>,
    publish_repo: Arc<dyn PublishRecordRepository>,
    execution_repo: Arc<dyn ExecutionRecordRepository>,
    commit_repo: Arc<dyn CommitLogRepository>,
    poll_log_repo: Arc<dyn RepoPollLogRepository>,
    worker_service: Arc<WorkerService>,
    pipeline: Arc<DeploymentPipeline>,
    /// 每个任务保留的运行记录条数
    execution_keep: usize,
    /// 轮询日志保留字符数
    poll_log_max_chars: usize,
}

impl CallbackRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        publish_repo: Arc<dyn PublishRecordRepository>,
        execution_repo: Arc<dyn ExecutionRecordRepository>,
        commit_repo: Arc<dyn CommitLogRepository>,
        poll_log_repo: Arc<dyn RepoPollLogRepository>,
        worker_service: Arc<WorkerService>,
        pipeline: Arc<DeploymentPipeline>,
        execution_keep: usize,
        poll_log_max_chars: usize,
    ) -> Self {
        Self {
            task_repo,
            publish_repo,
            execution_repo,
            commit_repo,
            poll_log_repo,
            worker_service,
            pipeline,
            execution_keep,
            poll_log_max_chars,
        }
    }

    /// 部署任务事件：驱动发布记录与任务状态机
    async fn on_deploy_event(
        &self,
        task_id: i64,
        publish_id: i64,
        kind: &JobEventKind,
    ) -> CapResult<()> {
        match kind {
            JobEventKind::Started => {
                self.publish_repo
                    .mark_publish_running_if_pending(publish_id)
                    .await?;
                let flipped = self
                    .task_repo
                    .update_task_status_if(
                        task_id,
                        &[TaskStatus::PendingDeploy],
                        TaskStatus::Deploying,
                    )
                    .await?;
                if flipped {
                    debug!("部署开始: task_id={task_id}, publish_id={publish_id}");
                }
            }
            JobEventKind::Finished {
                success: true,
                stdout,
                stderr,
                ..
            } => {
                // 终态护卫：超时已落盘时丢弃晚到的成功回调
                if let Some(record) = self.publish_repo.publish_by_id(publish_id).await? {
                    if record.state.is_terminal() {
                        warn!(
                            "发布记录已是终态({}),丢弃晚到的成功回调: publish_id={publish_id}",
                            record.state.label()
                        );
                        return Ok(());
                    }
                }

                let task = self
                    .task_repo
                    .task_by_id(task_id)
                    .await?
                    .ok_or(CapError::TaskNotFound { id: task_id })?;
                if let Err(e) = self.pipeline.install_real_job(&task).await {
                    warn!("部署完成但安装正式任务失败: task_id={task_id}, error={e}");
                    self.publish_repo
                        .finish_publish_if_active(
                            publish_id,
                            PublishState::Failed,
                            stdout,
                            &format!("{stderr}{e}\n"),
                        )
                        .await?;
                    self.task_repo
                        .update_task_status_if(
                            task_id,
                            &[TaskStatus::PendingDeploy, TaskStatus::Deploying],
                            TaskStatus::DeployFailed,
                        )
                        .await?;
                    return Ok(());
                }

                let won = self
                    .publish_repo
                    .finish_publish_if_active(publish_id, PublishState::Succeeded, stdout, stderr)
                    .await?;
                if won {
                    self.task_repo
                        .update_task_status_if(
                            task_id,
                            &[TaskStatus::PendingDeploy, TaskStatus::Deploying],
                            TaskStatus::Enabled,
                        )
                        .await?;
                    info!("部署成功,任务已启用: task_id={task_id}, publish_id={publish_id}");
                }
            }
            JobEventKind::Finished {
                success: false,
                stdout,
                stderr,
                error,
            } => {
                warn!(
                    "部署失败: task_id={task_id}, publish_id={publish_id}, error={:?}",
                    error
                );
                self.publish_repo
                    .finish_publish_if_active(publish_id, PublishState::Failed, stdout, stderr)
                    .await?;
                self.task_repo
                    .update_task_status_if(
                        task_id,
                        &[TaskStatus::PendingDeploy, TaskStatus::Deploying],
                        TaskStatus::DeployFailed,
                    )
                    .await?;
            }
            JobEventKind::TimedOut => {
                warn!("部署超时: task_id={task_id}, publish_id={publish_id}");
                self.publish_repo
                    .finish_publish_if_active(publish_id, PublishState::TimedOut, "", "")
                    .await?;
                self.task_repo
                    .update_task_status_if(
                        task_id,
                        &[TaskStatus::PendingDeploy, TaskStatus::Deploying],
                        TaskStatus::DeployFailed,
                    )
                    .await?;
            }
            other => {
                debug!("忽略部署事件: publish_id={publish_id}, kind={other:?}");
            }
        }
        Ok(())
    }

    /// 正式任务运行事件：滚动保留运行记录并写入结果。
    /// 运行失败不改变任务状态（任务保持启用，失败体现在运行记录里）。
    async fn on_run_event(
        &self,
        task_id: i64,
        task_kind: TaskKind,
        repo_url: &str,
        version: &str,
        kind: &JobEventKind,
    ) -> CapResult<()> {
        match kind {
            JobEventKind::Started => {
                // 插入前先裁剪，保证插入后不超过保留上限
                let keep = self.execution_keep.saturating_sub(1);
                self.execution_repo
                    .prune_executions_keep_recent(task_id, task_kind, keep)
                    .await?;

                let mut record = ExecutionRecord::new(
                    task_id,
                    task_kind,
                    repo_url.to_string(),
                    version.to_string(),
                );
                record.begin(Utc::now());
                let record = self.execution_repo.insert_execution(&record).await?;
                self.task_repo.record_task_run(task_id, record.id).await?;
                debug!("任务开始运行: task_id={task_id}, execution_id={}", record.id);
            }
            JobEventKind::Finished {
                success,
                stdout,
                stderr,
                ..
            } => {
                let task = self
                    .task_repo
                    .task_by_id(task_id)
                    .await?
                    .ok_or(CapError::TaskNotFound { id: task_id })?;
                let Some(execution_id) = task.latest_execution_id else {
                    warn!("运行结束但没有对应的运行记录: task_id={task_id}");
                    return Ok(());
                };
                let status = if *success {
                    ExecutionStatus::Succeeded
                } else {
                    ExecutionStatus::Failed
                };
                self.execution_repo
                    .finish_execution(execution_id, status, stdout, stderr)
                    .await?;
            }
            other => {
                debug!("忽略运行事件: task_id={task_id}, kind={other:?}");
            }
        }
        Ok(())
    }

    /// 自监控采样事件
    async fn on_monitor_event(&self, worker_id: i64, kind: &JobEventKind) -> CapResult<()> {
        if let JobEventKind::Sample(sample) = kind {
            self.on_sample(worker_id, sample).await?;
        }
        Ok(())
    }

    async fn on_sample(&self, worker_id: i64, sample: &ResourceSample) -> CapResult<()> {
        self.worker_service.handle_sample(worker_id, sample).await
    }

    /// 代码库轮询事件：提交入库（去重）、日志滚动保留
    async fn on_repo_poll_event(&self, repo_id: i64, kind: &JobEventKind) -> CapResult<()> {
        match kind {
            JobEventKind::Commits(commits) => {
                let entries: Vec<CommitLogEntry> = commits
                    .iter()
                    .map(|c: &CommitInfo| CommitLogEntry {
                        id: 0,
                        repo_id,
                        version: c.version.clone(),
                        author: c.author.clone(),
                        committed_at: c.committed_at,
                        message: c.message.clone(),
                    })
                    .collect();
                let inserted = self.commit_repo.insert_commits(&entries).await?;
                if inserted > 0 {
                    debug!("新增提交记录: repo_id={repo_id}, 条数={inserted}");
                }
            }
            JobEventKind::LogLine(line) => {
                self.poll_log_repo
                    .append_poll_line(repo_id, line, self.poll_log_max_chars)
                    .await?;
            }
            JobEventKind::Finished {
                success: false,
                error,
                ..
            } => {
                self.poll_log_repo
                    .append_poll_line(
                        repo_id,
                        &format!("轮询任务异常退出: {}", error.as_deref().unwrap_or("未知")),
                        self.poll_log_max_chars,
                    )
                    .await?;
            }
            other => {
                debug!("忽略轮询事件: repo_id={repo_id}, kind={other:?}");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CallbackSink for CallbackRouter {
    async fn deliver(&self, event: JobEvent) -> CapResult<()> {
        match &event.callback {
            JobCallback::Deploy {
                task_id,
                publish_id,
                ..
            } => self.on_deploy_event(*task_id, *publish_id, &event.kind).await,
            JobCallback::TaskRun {
                task_id,
                task_kind,
                repo_url,
                version,
            } => {
                self.on_run_event(*task_id, *task_kind, repo_url, version, &event.kind)
                    .await
            }
            JobCallback::ResourceMonitor { worker_id } => {
                self.on_monitor_event(*worker_id, &event.kind).await
            }
            JobCallback::RepoPoll { repo_id } => {
                self.on_repo_poll_event(*repo_id, &event.kind).await
            }
            JobCallback::Noop => Ok(()),
        }
    }
}
