//! 控制面服务：Worker存活、任务生命周期、部署流水线、回调路由与代码库轮询。

pub mod callback_router;
pub mod cron_utils;
pub mod deploy;
pub mod repo_monitor;
pub mod task_service;
pub mod worker_service;

pub use callback_router::CallbackRouter;
pub use cron_utils::CronScheduler;
pub use deploy::DeploymentPipeline;
pub use repo_monitor::RepoMonitorService;
pub use task_service::{TaskDefinition, TaskService};
pub use worker_service::WorkerService;
