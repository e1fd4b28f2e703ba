//! 进程内回环通道
//!
//! 把远程执行端口接到本进程托管的Worker注册表上，用于嵌入式部署
//! 与测试。可以按地址模拟离线，用来驱动存活判定与尽力而为的移除
//! 路径。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use capd_core::{CapError, CapResult};
use capd_domain::{JobCallback, JobSpec, RemoteJobClient};
use capd_worker::JobRegistry;

/// 回环远程通道
#[derive(Default)]
pub struct LoopbackRemote {
    registries: RwLock<HashMap<String, Arc<JobRegistry>>>,
    offline: RwLock<HashSet<String>>,
}

impl LoopbackRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// 托管一个Worker注册表，地址取注册表自身的地址
    pub async fn attach_worker(&self, registry: Arc<JobRegistry>) {
        let address = registry.address().to_string();
        self.registries.write().await.insert(address.clone(), registry);
        debug!("回环通道接入Worker: {address}");
    }

    /// 模拟Worker离线/恢复（测试与演练用）
    pub async fn set_offline(&self, address: &str, offline: bool) {
        let mut set = self.offline.write().await;
        if offline {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    async fn registry(&self, address: &str) -> CapResult<Arc<JobRegistry>> {
        if self.offline.read().await.contains(address) {
            return Err(CapError::network_error(format!("Worker不可达: {address}")));
        }
        self.registries
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| CapError::network_error(format!("未知的Worker地址: {address}")))
    }
}

#[async_trait]
impl RemoteJobClient for LoopbackRemote {
    async fn cron_set(
        &self,
        address: &str,
        key: &str,
        rule: &str,
        spec: &JobSpec,
        callback: &JobCallback,
    ) -> CapResult<()> {
        self.registry(address)
            .await?
            .set_cron(key, rule, spec, callback)
            .await
    }

    async fn daemon_set(
        &self,
        address: &str,
        key: &str,
        spec: &JobSpec,
        callback: &JobCallback,
    ) -> CapResult<()> {
        self.registry(address)
            .await?
            .set_daemon(key, spec, callback)
            .await
    }

    async fn task_set(
        &self,
        address: &str,
        key: &str,
        spec: &JobSpec,
        callback: &JobCallback,
        timeout: Duration,
    ) -> CapResult<()> {
        self.registry(address)
            .await?
            .set_oneshot(key, spec, callback, timeout)
            .await
    }

    async fn delete(&self, address: &str, key: &str) -> CapResult<()> {
        self.registry(address).await?.delete(key).await;
        Ok(())
    }

    async fn get(&self, address: &str, key: &str) -> CapResult<bool> {
        Ok(self.registry(address).await?.get(key).await)
    }

    async fn run_now(&self, address: &str, key: &str) -> CapResult<()> {
        self.registry(address).await?.run_now(key).await
    }

    async fn is_running(&self, address: &str, key: &str) -> CapResult<bool> {
        Ok(self.registry(address).await?.is_running(key).await)
    }

    async fn ping(&self, address: &str) -> CapResult<()> {
        self.registry(address).await.map(|_| ())
    }
}
