//! 分布式发布与计划任务控制平面
//!
//! 嵌入式装配入口；各子系统见成员crate：
//! 领域模型与端口在 `capd_domain`，控制面服务在 `capd_dispatcher`，
//! Worker运行时在 `capd_worker`，内存存储与回环通道在
//! `capd_infrastructure`。

pub mod app;
pub mod shutdown;

pub use app::Application;
pub use shutdown::ShutdownManager;

pub use capd_core;
pub use capd_dispatcher;
pub use capd_domain;
pub use capd_infrastructure;
pub use capd_worker;
