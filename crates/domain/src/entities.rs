use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 为整数编码的状态枚举生成 i32 互转与 sqlx 编解码实现
macro_rules! int_enum_codec {
    ($name:ident { $($variant:ident => $value:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_i32(self) -> i32 {
                match self { $( $name::$variant => $value, )+ }
            }
        }

        impl TryFrom<i32> for $name {
            type Error = String;
            fn try_from(value: i32) -> Result<Self, Self::Error> {
                match value {
                    $( $value => Ok($name::$variant), )+
                    other => Err(format!("无效的{}取值: {other}", stringify!($name))),
                }
            }
        }

        impl sqlx::Type<sqlx::Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <i32 as sqlx::Type<sqlx::Postgres>>::type_info()
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <i32 as sqlx::Type<sqlx::Sqlite>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $name {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let v = <i32 as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
                Self::try_from(v).map_err(Into::into)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $name {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let v = <i32 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Self::try_from(v).map_err(Into::into)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <i32 as sqlx::Encode<sqlx::Postgres>>::encode(self.as_i32(), buf)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <i32 as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_i32(), buf)
            }
        }
    };
}

/// Worker节点：通过心跳注册的执行主机，只增不删
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: i64,
    /// 唯一自然键
    pub address: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub work_dir: String,
    /// CPU核数
    pub total_cpu: i32,
    /// 内存总量（MB）
    pub total_mem_mb: i64,
    pub platform: String,
}

impl Worker {
    pub fn new(address: String, work_dir: String) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 由存储层分配
            address,
            registered_at: now,
            last_heartbeat: now,
            work_dir,
            total_cpu: 0,
            total_mem_mb: 0,
            platform: String::new(),
        }
    }

    /// 心跳是否在新鲜窗口内（窗口内免网络探活）
    pub fn heartbeat_fresh(&self, now: DateTime<Utc>, window_seconds: i64) -> bool {
        now - self.last_heartbeat <= Duration::seconds(window_seconds)
    }

    /// 自监控任务的安装键
    pub fn monitor_key(&self) -> String {
        format!("{}-cpu_mem_log", self.address)
    }
}

/// Worker节点CPU/内存采样
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuMemSample {
    pub id: i64,
    pub worker_id: i64,
    pub sampled_at: DateTime<Utc>,
    pub cpu_percent: i32,
    pub mem_percent: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RepoKind {
    #[serde(rename = "git")]
    Git,
    #[serde(rename = "svn")]
    Svn,
}

impl RepoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoKind::Git => "git",
            RepoKind::Svn => "svn",
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for RepoKind {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl sqlx::Type<sqlx::Sqlite> for RepoKind {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for RepoKind {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        match s {
            "git" => Ok(RepoKind::Git),
            "svn" => Ok(RepoKind::Svn),
            _ => Err(format!("无效的代码库类型: {s}").into()),
        }
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for RepoKind {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        match s {
            "git" => Ok(RepoKind::Git),
            "svn" => Ok(RepoKind::Svn),
            _ => Err(format!("无效的代码库类型: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for RepoKind {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for RepoKind {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 源码库：git或svn地址、凭据，下属若干任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRepository {
    pub id: i64,
    pub kind: RepoKind,
    /// 唯一自然键
    pub url: String,
    pub username: String,
    pub password: String,
    pub added_at: DateTime<Utc>,
}

impl SourceRepository {
    pub fn new(kind: RepoKind, url: String, username: String, password: String) -> Self {
        Self {
            id: 0,
            kind,
            url,
            username,
            password,
            added_at: Utc::now(),
        }
    }

    /// 提交轮询守护任务的安装键
    pub fn monitor_key(&self) -> String {
        format!("repo_monitor-{}", self.id)
    }

    /// 轮询任务在Worker上的镜像目录
    pub fn mirror_dir(&self, work_dir: &str) -> String {
        format!("{}/repo_code_monitor/{}", work_dir, self.id)
    }
}

/// 代码库提交历史，(repo_id, version) 去重
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitLogEntry {
    pub id: i64,
    pub repo_id: i64,
    pub version: String,
    pub author: String,
    pub committed_at: DateTime<Utc>,
    pub message: String,
}

/// 代码库轮询滚动日志
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoPollLog {
    pub repo_id: i64,
    pub updated_at: DateTime<Utc>,
    pub log: String,
}

/// 任务类型：计划（cron规则触发）或常驻（持续运行）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskKind {
    #[serde(rename = "cron")]
    Scheduled,
    #[serde(rename = "daemon")]
    Continuous,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Scheduled => "cron",
            TaskKind::Continuous => "daemon",
        }
    }

    /// 代码检出目录的类别段（历史沿用cron/task）
    fn dir_segment(&self) -> &'static str {
        match self {
            TaskKind::Scheduled => "cron",
            TaskKind::Continuous => "task",
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for TaskKind {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskKind {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TaskKind {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        match s {
            "cron" => Ok(TaskKind::Scheduled),
            "daemon" => Ok(TaskKind::Continuous),
            _ => Err(format!("无效的任务类型: {s}").into()),
        }
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskKind {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        match s {
            "cron" => Ok(TaskKind::Scheduled),
            "daemon" => Ok(TaskKind::Continuous),
            _ => Err(format!("无效的任务类型: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for TaskKind {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskKind {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 任务状态机的状态集合
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Disabled,
    PendingDeploy,
    Enabled,
    Deploying,
    DeployFailed,
}

int_enum_codec!(TaskStatus {
    Disabled => -1,
    PendingDeploy => 0,
    Enabled => 1,
    Deploying => 2,
    DeployFailed => 3,
});

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Disabled => "禁用",
            TaskStatus::PendingDeploy => "待部署",
            TaskStatus::Enabled => "启用",
            TaskStatus::Deploying => "正在部署",
            TaskStatus::DeployFailed => "部署失败",
        }
    }

    /// 是否有部署在途（在途期间拒绝启用/禁用/立即执行）
    pub fn deploy_in_flight(&self) -> bool {
        matches!(self, TaskStatus::PendingDeploy | TaskStatus::Deploying)
    }
}

/// 可调度任务：绑定一个Worker和一个源码库版本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub kind: TaskKind,
    pub name: String,
    pub worker_id: i64,
    pub repo_id: i64,
    /// 固定检出的版本号
    pub version: String,
    /// CRON规则，仅计划任务
    pub rule: Option<String>,
    pub pre_build: String,
    pub run_cmd: String,
    pub info: String,
    pub owner: String,
    pub group_id: i64,
    pub status: TaskStatus,
    pub run_count: i64,
    pub latest_execution_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// 远程安装键，跨重新部署复用以保证同一任务至多一份安装
    pub fn job_key(&self) -> String {
        format!("{}-{}", self.kind.as_str(), self.id)
    }

    /// 部署目录（清空后重新检出的根）
    pub fn deploy_dir(&self, work_dir: &str) -> String {
        format!("{}/{}/{}", work_dir, self.kind.dir_segment(), self.id)
    }

    /// 检出后的代码目录，运行命令在其中执行
    pub fn code_dir(&self, work_dir: &str) -> String {
        format!("{}/code_dir", self.deploy_dir(work_dir))
    }
}

/// 发布（部署尝试）状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PublishState {
    Pending,
    Running,
    TimedOut,
    Failed,
    Succeeded,
}

int_enum_codec!(PublishState {
    Pending => 0,
    Running => 1,
    TimedOut => 2,
    Failed => 3,
    Succeeded => 4,
});

impl PublishState {
    pub fn label(&self) -> &'static str {
        match self {
            PublishState::Pending => "待执行",
            PublishState::Running => "正在执行",
            PublishState::TimedOut => "执行超时",
            PublishState::Failed => "执行失败",
            PublishState::Succeeded => "执行成功",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PublishState::TimedOut | PublishState::Failed | PublishState::Succeeded
        )
    }
}

/// 一次部署尝试的记录，状态独立于任务状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRecord {
    pub id: i64,
    pub task_id: i64,
    pub task_kind: TaskKind,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout: String,
    pub stderr: String,
    pub state: PublishState,
}

impl PublishRecord {
    pub fn new(task_id: i64, task_kind: TaskKind) -> Self {
        Self {
            id: 0,
            task_id,
            task_kind,
            created_at: Utc::now(),
            finished_at: None,
            stdout: String::new(),
            stderr: String::new(),
            state: PublishState::Pending,
        }
    }
}

/// 运行记录状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

int_enum_codec!(ExecutionStatus {
    Queued => 0,
    Running => 1,
    Succeeded => 2,
    Failed => 3,
});

impl ExecutionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "待运行",
            ExecutionStatus::Running => "正在运行",
            ExecutionStatus::Succeeded => "运行正常完成",
            ExecutionStatus::Failed => "运行异常退出",
        }
    }
}

/// 已安装任务一次实际运行的记录，按任务有界保留
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub task_id: i64,
    pub task_kind: TaskKind,
    pub repo_url: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionRecord {
    pub fn new(task_id: i64, task_kind: TaskKind, repo_url: String, version: String) -> Self {
        Self {
            id: 0,
            task_id,
            task_kind,
            repo_url,
            version,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            status: ExecutionStatus::Queued,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// 标记开始运行
    pub fn begin(&mut self, at: DateTime<Utc>) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(at);
    }
}

/// 任务分组
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// 默认分组名，首次启动时自动创建
pub const DEFAULT_GROUP_NAME: &str = "默认";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_int_round_trip() {
        for status in [
            TaskStatus::Disabled,
            TaskStatus::PendingDeploy,
            TaskStatus::Enabled,
            TaskStatus::Deploying,
            TaskStatus::DeployFailed,
        ] {
            assert_eq!(TaskStatus::try_from(status.as_i32()).unwrap(), status);
        }
        assert_eq!(TaskStatus::Disabled.as_i32(), -1);
        assert_eq!(TaskStatus::DeployFailed.as_i32(), 3);
        assert!(TaskStatus::try_from(9).is_err());

        assert_eq!(PublishState::TimedOut.as_i32(), 2);
        assert_eq!(ExecutionStatus::Succeeded.as_i32(), 2);
    }

    #[test]
    fn test_heartbeat_freshness_window() {
        let now = Utc::now();
        let mut worker = Worker::new("10.0.0.1".to_string(), "/data/capd".to_string());

        worker.last_heartbeat = now - Duration::seconds(3);
        assert!(worker.heartbeat_fresh(now, 6));

        worker.last_heartbeat = now - Duration::seconds(10);
        assert!(!worker.heartbeat_fresh(now, 6));
    }

    #[test]
    fn test_job_keys_and_dirs() {
        let mut task = Task {
            id: 42,
            kind: TaskKind::Scheduled,
            name: "report".to_string(),
            worker_id: 1,
            repo_id: 1,
            version: "abc123".to_string(),
            rule: Some("0 * * * * *".to_string()),
            pre_build: String::new(),
            run_cmd: "python run.py".to_string(),
            info: String::new(),
            owner: "ops".to_string(),
            group_id: 1,
            status: TaskStatus::Disabled,
            run_count: 0,
            latest_execution_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(task.job_key(), "cron-42");
        assert_eq!(task.code_dir("/data"), "/data/cron/42/code_dir");

        task.kind = TaskKind::Continuous;
        assert_eq!(task.job_key(), "daemon-42");
        assert_eq!(task.code_dir("/data"), "/data/task/42/code_dir");

        let worker = Worker::new("10.0.0.9".to_string(), "/data".to_string());
        assert_eq!(worker.monitor_key(), "10.0.0.9-cpu_mem_log");
    }

    #[test]
    fn test_publish_state_terminality() {
        assert!(!PublishState::Pending.is_terminal());
        assert!(!PublishState::Running.is_terminal());
        assert!(PublishState::TimedOut.is_terminal());
        assert!(PublishState::Failed.is_terminal());
        assert!(PublishState::Succeeded.is_terminal());
    }
}
