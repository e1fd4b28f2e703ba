//! Worker心跳上报

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use capd_domain::HeartbeatSink;

/// 周期性向控制面上报心跳
pub struct HeartbeatLoop {
    sink: Arc<dyn HeartbeatSink>,
    address: String,
    work_dir: String,
    period: Duration,
}

impl HeartbeatLoop {
    pub fn new(
        sink: Arc<dyn HeartbeatSink>,
        address: String,
        work_dir: String,
        period: Duration,
    ) -> Self {
        Self {
            sink,
            address,
            work_dir,
            period,
        }
    }

    /// 启动心跳循环；收到关闭信号后退出
    pub fn spawn(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sink.heartbeat(&self.address, &self.work_dir).await {
                            warn!("心跳上报失败: address={}, error={e}", self.address);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("心跳循环退出: address={}", self.address);
                        break;
                    }
                }
            }
        })
    }
}
