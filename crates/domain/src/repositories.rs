//! 领域仓储抽象
//!
//! 数据访问的抽象接口。关系型存储本身是外部协作方，这里只定义契约；
//! 状态翻转一律走条件更新（比较并交换），晚到的回调不能覆盖终态。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{
    CommitLogEntry, CpuMemSample, ExecutionRecord, ExecutionStatus, Group, PublishRecord,
    PublishState, RepoPollLog, SourceRepository, Task, TaskKind, TaskStatus, Worker,
};
use capd_core::CapResult;

/// Worker仓储抽象
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// 注册新Worker并分配id；address重复时报错
    async fn register(&self, worker: &Worker) -> CapResult<Worker>;
    async fn worker_by_id(&self, id: i64) -> CapResult<Option<Worker>>;
    async fn worker_by_address(&self, address: &str) -> CapResult<Option<Worker>>;
    async fn all_workers(&self) -> CapResult<Vec<Worker>>;
    /// 记录心跳；last_heartbeat只增不减
    async fn record_heartbeat(&self, id: i64, at: DateTime<Utc>, work_dir: &str)
        -> CapResult<()>;
    /// 更新容量事实（核数、内存、平台）
    async fn update_worker_facts(
        &self,
        id: i64,
        total_cpu: i32,
        total_mem_mb: i64,
        platform: &str,
    ) -> CapResult<()>;
}

/// Worker CPU/内存采样仓储抽象
#[async_trait]
pub trait CpuMemSampleRepository: Send + Sync {
    async fn append_sample(&self, sample: &CpuMemSample) -> CapResult<CpuMemSample>;
    /// 删除cutoff之前的采样，返回删除条数
    async fn prune_samples_before(&self, cutoff: DateTime<Utc>) -> CapResult<u64>;
    async fn latest_sample(&self, worker_id: i64) -> CapResult<Option<CpuMemSample>>;
    /// 最近limit条，按时间正序返回
    async fn recent_samples(&self, worker_id: i64, limit: usize)
        -> CapResult<Vec<CpuMemSample>>;
}

/// 源码库仓储抽象
#[async_trait]
pub trait SourceRepoRepository: Send + Sync {
    /// url唯一，重复时报错
    async fn add_repo(&self, repo: &SourceRepository) -> CapResult<SourceRepository>;
    async fn repo_by_id(&self, id: i64) -> CapResult<Option<SourceRepository>>;
    async fn repo_by_url(&self, url: &str) -> CapResult<Option<SourceRepository>>;
    async fn all_repos(&self) -> CapResult<Vec<SourceRepository>>;
}

/// 提交历史仓储抽象
#[async_trait]
pub trait CommitLogRepository: Send + Sync {
    /// 批量写入，(repo_id, version)重复的条目静默跳过；返回新增条数
    async fn insert_commits(&self, entries: &[CommitLogEntry]) -> CapResult<u64>;
    /// 最近limit条，按提交时间倒序
    async fn commits_by_repo(&self, repo_id: i64, limit: usize)
        -> CapResult<Vec<CommitLogEntry>>;
}

/// 代码库轮询日志仓储抽象
#[async_trait]
pub trait RepoPollLogRepository: Send + Sync {
    /// 追加一行（带时间戳），整体截断到最近max_chars个字符
    async fn append_poll_line(&self, repo_id: i64, line: &str, max_chars: usize)
        -> CapResult<()>;
    async fn poll_log(&self, repo_id: i64) -> CapResult<Option<RepoPollLog>>;
}

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert_task(&self, task: &Task) -> CapResult<Task>;
    async fn task_by_id(&self, id: i64) -> CapResult<Option<Task>>;
    async fn all_tasks(&self) -> CapResult<Vec<Task>>;
    async fn update_task(&self, task: &Task) -> CapResult<()>;
    async fn update_task_status(&self, id: i64, status: TaskStatus) -> CapResult<()>;
    /// 仅当当前状态在expected内时翻转到status，返回是否生效
    async fn update_task_status_if(
        &self,
        id: i64,
        expected: &[TaskStatus],
        status: TaskStatus,
    ) -> CapResult<bool>;
    /// 记录一次被接受的运行：run_count加一并指向最新运行记录
    async fn record_task_run(&self, id: i64, execution_id: i64) -> CapResult<()>;
    /// 物理删除（仅在调用方显式要求移除时使用）
    async fn delete_task(&self, id: i64) -> CapResult<bool>;
}

/// 发布记录仓储抽象
#[async_trait]
pub trait PublishRecordRepository: Send + Sync {
    async fn insert_publish(&self, record: &PublishRecord) -> CapResult<PublishRecord>;
    async fn publish_by_id(&self, id: i64) -> CapResult<Option<PublishRecord>>;
    /// 最近limit条，按创建时间倒序
    async fn publishes_by_task(
        &self,
        task_id: i64,
        task_kind: TaskKind,
        limit: usize,
    ) -> CapResult<Vec<PublishRecord>>;
    /// Pending -> Running，已离开Pending则不动，返回是否生效
    async fn mark_publish_running_if_pending(&self, id: i64) -> CapResult<bool>;
    /// 写入终态与输出，仅在尚未终态时生效（先到的终态获胜，
    /// 晚到的成功/失败回调被丢弃）；返回是否生效
    async fn finish_publish_if_active(
        &self,
        id: i64,
        state: PublishState,
        stdout: &str,
        stderr: &str,
    ) -> CapResult<bool>;
}

/// 运行记录仓储抽象
#[async_trait]
pub trait ExecutionRecordRepository: Send + Sync {
    async fn insert_execution(&self, record: &ExecutionRecord) -> CapResult<ExecutionRecord>;
    async fn execution_by_id(&self, id: i64) -> CapResult<Option<ExecutionRecord>>;
    /// 最近limit条，按创建时间倒序
    async fn recent_executions(
        &self,
        task_id: i64,
        task_kind: TaskKind,
        limit: usize,
    ) -> CapResult<Vec<ExecutionRecord>>;
    async fn execution_count(&self, task_id: i64, task_kind: TaskKind) -> CapResult<u64>;
    /// 只留最近keep条，删除更早的；返回删除条数
    async fn prune_executions_keep_recent(
        &self,
        task_id: i64,
        task_kind: TaskKind,
        keep: usize,
    ) -> CapResult<u64>;
    /// 写入运行结果与结束时间
    async fn finish_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        stdout: &str,
        stderr: &str,
    ) -> CapResult<()>;
}

/// 任务分组仓储抽象
#[async_trait]
pub trait GroupRepository: Send + Sync {
    /// name唯一，重复时报错
    async fn add_group(&self, name: &str) -> CapResult<Group>;
    async fn group_by_name(&self, name: &str) -> CapResult<Option<Group>>;
    async fn all_groups(&self) -> CapResult<Vec<Group>>;
    /// 确保名为name的分组存在并返回它
    async fn ensure_group(&self, name: &str) -> CapResult<Group>;
}
