use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CapError {
    #[error("Worker节点已离线: {address}")]
    WorkerOffline { address: String },
    #[error("当前任务正在部署,请稍后再操作: task_id={task_id}")]
    ConcurrentDeployment { task_id: i64 },
    #[error("任务状态不允许此操作: {0}")]
    InvalidState(String),
    #[error("远程命令执行失败: {0}")]
    RemoteExecution(String),
    #[error("Worker不存在: id={id}")]
    WorkerNotFound { id: i64 },
    #[error("代码库不存在: id={id}")]
    RepoNotFound { id: i64 },
    #[error("任务不存在: id={id}")]
    TaskNotFound { id: i64 },
    #[error("发布记录不存在: id={id}")]
    PublishRecordNotFound { id: i64 },
    #[error("运行记录不存在: id={id}")]
    ExecutionRecordNotFound { id: i64 },
    #[error("CRON表达式无效: {expr}: {message}")]
    InvalidCron { expr: String, message: String },
    #[error("数据库操作失败: {0}")]
    DatabaseOperation(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("数据序列化错误: {0}")]
    Serialization(String),
    #[error("网络连接失败: {0}")]
    Network(String),
    #[error("系统内部错误: {0}")]
    Internal(String),
}

pub type CapResult<T> = Result<T, CapError>;

impl CapError {
    pub fn worker_offline<S: Into<String>>(address: S) -> Self {
        Self::WorkerOffline {
            address: address.into(),
        }
    }
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }
    pub fn remote_execution<S: Into<String>>(msg: S) -> Self {
        Self::RemoteExecution(msg.into())
    }
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn network_error<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// 瞬时故障，调用方可稍后重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CapError::DatabaseOperation(_)
                | CapError::Network(_)
                | CapError::ConcurrentDeployment { .. }
        )
    }
}

impl From<sqlx::Error> for CapError {
    fn from(err: sqlx::Error) -> Self {
        CapError::DatabaseOperation(err.to_string())
    }
}

impl From<serde_json::Error> for CapError {
    fn from(err: serde_json::Error) -> Self {
        CapError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for CapError {
    fn from(err: anyhow::Error) -> Self {
        CapError::Internal(err.to_string())
    }
}
