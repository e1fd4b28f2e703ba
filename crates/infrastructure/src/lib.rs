//! 基础设施实现：内存存储与进程内回环通道。
//!
//! 关系型存储是外部协作方；内存实现满足全部仓储契约，用于嵌入式
//! 部署与测试。回环通道把远程执行端口接到进程内的Worker注册表上
//! （真实网络传输不在本系统范围内）。

pub mod loopback;
pub mod memory;

pub use loopback::LoopbackRemote;
pub use memory::MemoryStore;
