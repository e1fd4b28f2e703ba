//! 应用装配
//!
//! 嵌入式单进程部署：内存存储 + 回环通道 + 本机Worker运行时。
//! 真实网络传输与关系型存储都是外部协作方，接到对应端口上即可
//! 替换这里的内存实现。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;

use capd_core::AppConfig;
use capd_dispatcher::{
    CallbackRouter, DeploymentPipeline, RepoMonitorService, TaskService, WorkerService,
};
use capd_domain::{CallbackSink, GroupRepository, HeartbeatSink, DEFAULT_GROUP_NAME};
use capd_infrastructure::{LoopbackRemote, MemoryStore};
use capd_worker::{HeartbeatLoop, JobRegistry};

/// 主应用程序
pub struct Application {
    config: AppConfig,
    store: Arc<MemoryStore>,
    remote: Arc<LoopbackRemote>,
    worker_service: Arc<WorkerService>,
    task_service: Arc<TaskService>,
    repo_monitor: Arc<RepoMonitorService>,
    /// 本机Worker运行时（worker.enabled时存在）
    registry: Option<Arc<JobRegistry>>,
}

impl Application {
    /// 创建应用实例并完成服务装配
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序");

        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(LoopbackRemote::new());

        let worker_service = Arc::new(WorkerService::new(
            store.clone(),
            store.clone(),
            remote.clone(),
            config.dispatcher.heartbeat_alive_seconds,
            config.dispatcher.sample_keep_days,
        ));
        let pipeline = Arc::new(DeploymentPipeline::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            worker_service.clone(),
            remote.clone(),
            Duration::from_secs(config.dispatcher.deploy_timeout_seconds),
        ));
        let router: Arc<CallbackRouter> = Arc::new(CallbackRouter::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            worker_service.clone(),
            pipeline.clone(),
            config.dispatcher.execution_keep,
            config.dispatcher.poll_log_max_chars,
        ));
        let task_service = Arc::new(TaskService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            worker_service.clone(),
            pipeline.clone(),
            remote.clone(),
        ));
        let repo_monitor = Arc::new(RepoMonitorService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            worker_service.clone(),
            remote.clone(),
        ));

        let registry = if config.worker.enabled {
            let sink: Arc<dyn CallbackSink> = router;
            let registry = Arc::new(JobRegistry::new(config.worker.address.clone(), sink));
            remote.attach_worker(registry.clone()).await;
            Some(registry)
        } else {
            None
        };

        Ok(Self {
            config,
            store,
            remote,
            worker_service,
            task_service,
            repo_monitor,
            registry,
        })
    }

    /// 启动前的准备：默认分组、本机Worker注册与自监控安装
    pub async fn bootstrap(&self) -> Result<()> {
        self.store
            .ensure_group(DEFAULT_GROUP_NAME)
            .await
            .context("创建默认分组失败")?;

        if self.registry.is_some() {
            let worker = self
                .worker_service
                .heartbeat(&self.config.worker.address, &self.config.worker.work_dir)
                .await
                .context("本机Worker注册失败")?;
            self.worker_service
                .install_self_monitor(&worker)
                .await
                .context("安装自监控任务失败")?;
        }
        Ok(())
    }

    /// 运行应用程序直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.bootstrap().await?;

        let heartbeat_handle = self.registry.as_ref().map(|_| {
            let sink: Arc<dyn HeartbeatSink> = self.worker_service.clone();
            HeartbeatLoop::new(
                sink,
                self.config.worker.address.clone(),
                self.config.worker.work_dir.clone(),
                Duration::from_secs(self.config.worker.heartbeat_interval_seconds),
            )
            .spawn(shutdown_rx.resubscribe())
        });

        info!("控制平面已就绪");
        let _ = shutdown_rx.recv().await;

        info!("开始关闭");
        if let Some(handle) = heartbeat_handle {
            let _ = handle.await;
        }
        if let Some(registry) = &self.registry {
            registry.shutdown().await;
        }
        info!("应用已退出");
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    pub fn remote(&self) -> Arc<LoopbackRemote> {
        self.remote.clone()
    }

    pub fn worker_service(&self) -> Arc<WorkerService> {
        self.worker_service.clone()
    }

    pub fn task_service(&self) -> Arc<TaskService> {
        self.task_service.clone()
    }

    pub fn repo_monitor(&self) -> Arc<RepoMonitorService> {
        self.repo_monitor.clone()
    }
}
