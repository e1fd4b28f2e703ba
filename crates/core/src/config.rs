use std::path::Path;

use anyhow::Result;
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub dispatcher: DispatcherConfig,
    pub worker: WorkerConfig,
    pub log: LogConfig,
}

/// 控制面（调度侧）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// 心跳新鲜窗口（秒），窗口内免探活
    pub heartbeat_alive_seconds: i64,
    /// 部署任务超时（秒）
    pub deploy_timeout_seconds: u64,
    /// 每个任务保留的运行记录条数
    pub execution_keep: usize,
    /// Worker CPU/内存采样保留天数
    pub sample_keep_days: i64,
    /// 代码库监控日志保留字符数
    pub poll_log_max_chars: usize,
}

/// 本机Worker运行时配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// Worker地址（注册与任务下发的标识）
    pub address: String,
    /// 任务代码检出根目录
    pub work_dir: String,
    pub heartbeat_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig {
                enabled: true,
                heartbeat_alive_seconds: 6,
                deploy_timeout_seconds: 600,
                execution_keep: 100,
                sample_keep_days: 7,
                poll_log_max_chars: 9000,
            },
            worker: WorkerConfig {
                enabled: true,
                address: "127.0.0.1".to_string(),
                work_dir: "/tmp/capd".to_string(),
                heartbeat_interval_seconds: 3,
            },
            log: LogConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// 加载配置：显式路径 > 默认路径 > 内置默认值，环境变量CAPD_*始终可覆盖
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {path}"));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/capd.toml", "capd.toml", "/etc/capd/config.toml"];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        let defaults = AppConfig::default();
        let builder = builder
            .set_default("dispatcher.enabled", defaults.dispatcher.enabled)?
            .set_default(
                "dispatcher.heartbeat_alive_seconds",
                defaults.dispatcher.heartbeat_alive_seconds,
            )?
            .set_default(
                "dispatcher.deploy_timeout_seconds",
                defaults.dispatcher.deploy_timeout_seconds as i64,
            )?
            .set_default(
                "dispatcher.execution_keep",
                defaults.dispatcher.execution_keep as i64,
            )?
            .set_default(
                "dispatcher.sample_keep_days",
                defaults.dispatcher.sample_keep_days,
            )?
            .set_default(
                "dispatcher.poll_log_max_chars",
                defaults.dispatcher.poll_log_max_chars as i64,
            )?
            .set_default("worker.enabled", defaults.worker.enabled)?
            .set_default("worker.address", defaults.worker.address.clone())?
            .set_default("worker.work_dir", defaults.worker.work_dir.clone())?
            .set_default(
                "worker.heartbeat_interval_seconds",
                defaults.worker.heartbeat_interval_seconds as i64,
            )?
            .set_default("log.level", defaults.log.level.clone())?
            .set_default("log.format", defaults.log.format.clone())?
            .add_source(Environment::with_prefix("CAPD").separator("__"));

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.heartbeat_alive_seconds <= 0 {
            return Err(anyhow::anyhow!("heartbeat_alive_seconds 必须为正数"));
        }
        if self.dispatcher.deploy_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("deploy_timeout_seconds 必须为正数"));
        }
        if self.dispatcher.execution_keep == 0 {
            return Err(anyhow::anyhow!("execution_keep 必须为正数"));
        }
        if self.dispatcher.sample_keep_days <= 0 {
            return Err(anyhow::anyhow!("sample_keep_days 必须为正数"));
        }
        if self.worker.enabled {
            if self.worker.address.trim().is_empty() {
                return Err(anyhow::anyhow!("worker.address 不能为空"));
            }
            if self.worker.work_dir.trim().is_empty() {
                return Err(anyhow::anyhow!("worker.work_dir 不能为空"));
            }
        }
        match self.log.format.as_str() {
            "pretty" | "json" => {}
            other => return Err(anyhow::anyhow!("不支持的日志格式: {other}")),
        }
        Ok(())
    }
}
