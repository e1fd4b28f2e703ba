//! 远程执行通道抽象
//!
//! 控制面把工作描述成可序列化的步骤序列（JobSpec）下发给Worker上的固定
//! 执行器；随任务一并下发的回调规格（JobCallback）对Worker不透明，Worker
//! 在每个事件里原样回传，控制面据此把结果写回自己的存储。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{RepoKind, TaskKind};
use capd_core::CapResult;

/// 一步远程工作
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step")]
pub enum JobStep {
    /// 递归删除目录
    CleanDir { path: String },
    /// 递归创建目录
    MakeDir { path: String },
    /// 检出固定版本到dest/code_dir
    Checkout {
        kind: RepoKind,
        url: String,
        username: String,
        password: String,
        version: String,
        dest: String,
    },
    /// 在cwd下执行shell命令，非零退出码一律视为失败
    Shell { command: String, cwd: Option<String> },
    /// 采集本机CPU/内存/平台信息并以Sample事件回传
    SampleResources,
    /// 刷新镜像并枚举提交历史，以Commits事件回传
    PollCommits {
        kind: RepoKind,
        url: String,
        username: String,
        password: String,
        mirror_dir: String,
        limit: usize,
    },
}

/// 下发给Worker的任务规格
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub steps: Vec<JobStep>,
}

impl JobSpec {
    pub fn new(steps: Vec<JobStep>) -> Self {
        Self { steps }
    }
}

/// 回调规格：控制面侧回调的全部闭包参数，Worker原样回传
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum JobCallback {
    /// 部署任务：结果写回发布记录并驱动任务状态机
    Deploy {
        task_id: i64,
        task_kind: TaskKind,
        publish_id: i64,
    },
    /// 正式任务的一次运行：结果写入运行记录
    TaskRun {
        task_id: i64,
        task_kind: TaskKind,
        repo_url: String,
        version: String,
    },
    /// Worker自监控采样
    ResourceMonitor { worker_id: i64 },
    /// 代码库提交轮询
    RepoPoll { repo_id: i64 },
    /// 无动作
    Noop,
}

/// 资源采样结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub total_cpu: i32,
    pub total_mem_mb: i64,
    pub platform: String,
    pub cpu_percent: i32,
    pub mem_percent: i32,
}

/// 一条提交信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitInfo {
    pub version: String,
    pub author: String,
    pub committed_at: DateTime<Utc>,
    pub message: String,
}

/// Worker回传的事件种类
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEventKind {
    /// 任务开始执行
    Started,
    /// 任务执行结束（success为假时error给出首个失败原因）
    Finished {
        success: bool,
        stdout: String,
        stderr: String,
        error: Option<String>,
    },
    /// 一次性任务超时，任务已被终止
    TimedOut,
    /// 资源采样
    Sample(ResourceSample),
    /// 轮询到的提交
    Commits(Vec<CommitInfo>),
    /// 轮询过程日志行
    LogLine(String),
}

/// Worker回传给控制面的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: String,
    pub worker_address: String,
    pub key: String,
    pub callback: JobCallback,
    pub kind: JobEventKind,
    pub emitted_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(
        worker_address: String,
        key: String,
        callback: JobCallback,
        kind: JobEventKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            worker_address,
            key,
            callback,
            kind,
            emitted_at: Utc::now(),
        }
    }
}

/// 远程执行通道（每Worker的线协议）
///
/// key是已安装任务的唯一身份，实现必须以替换语义处理重复安装；
/// 传输本身（如何到达Worker）不在本系统范围内。
#[async_trait]
pub trait RemoteJobClient: Send + Sync {
    /// 安装按CRON规则触发的计划任务
    async fn cron_set(
        &self,
        address: &str,
        key: &str,
        rule: &str,
        spec: &JobSpec,
        callback: &JobCallback,
    ) -> CapResult<()>;

    /// 安装常驻任务（退出即重启）
    async fn daemon_set(
        &self,
        address: &str,
        key: &str,
        spec: &JobSpec,
        callback: &JobCallback,
    ) -> CapResult<()>;

    /// 安装一次性任务，超过timeout未完成则终止并回传TimedOut
    async fn task_set(
        &self,
        address: &str,
        key: &str,
        spec: &JobSpec,
        callback: &JobCallback,
        timeout: Duration,
    ) -> CapResult<()>;

    /// 移除安装；key不存在时为无操作
    async fn delete(&self, address: &str, key: &str) -> CapResult<()>;

    /// 查询key下是否存在安装
    async fn get(&self, address: &str, key: &str) -> CapResult<bool>;

    /// 立即触发一次执行（计划/一次性任务）
    async fn run_now(&self, address: &str, key: &str) -> CapResult<()>;

    /// 常驻任务当前是否在运行
    async fn is_running(&self, address: &str, key: &str) -> CapResult<bool>;

    /// 带外存活探测
    async fn ping(&self, address: &str) -> CapResult<()>;
}

/// Worker到控制面的事件回传通道
#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn deliver(&self, event: JobEvent) -> CapResult<()>;
}

/// Worker到控制面的心跳上报通道
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn heartbeat(&self, address: &str, work_dir: &str) -> CapResult<()>;
}
