//! 内存存储
//!
//! 满足全部仓储契约：每张表独立自增id、自然键唯一约束、心跳单调、
//! 有界保留与条件更新。所有变更都在一次写锁内完成，单条提交，
//! 不做跨表事务。

mod records;
mod repos;
mod tasks;
mod workers;

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use capd_domain::{
    CommitLogEntry, CpuMemSample, ExecutionRecord, Group, PublishRecord, RepoPollLog,
    SourceRepository, Task, Worker,
};

#[derive(Default)]
pub(crate) struct State {
    pub(crate) workers: HashMap<i64, Worker>,
    pub(crate) samples: Vec<CpuMemSample>,
    pub(crate) repos: HashMap<i64, SourceRepository>,
    pub(crate) commits: Vec<CommitLogEntry>,
    /// (repo_id, version) 去重集合
    pub(crate) commit_keys: HashSet<(i64, String)>,
    pub(crate) poll_logs: HashMap<i64, RepoPollLog>,
    pub(crate) tasks: HashMap<i64, Task>,
    pub(crate) publishes: HashMap<i64, PublishRecord>,
    pub(crate) executions: Vec<ExecutionRecord>,
    pub(crate) groups: HashMap<i64, Group>,
    pub(crate) ids: IdGen,
}

/// 每张表独立的自增主键
#[derive(Default)]
pub(crate) struct IdGen {
    worker: i64,
    sample: i64,
    repo: i64,
    commit: i64,
    task: i64,
    publish: i64,
    execution: i64,
    group: i64,
}

impl IdGen {
    pub(crate) fn next_worker(&mut self) -> i64 {
        self.worker += 1;
        self.worker
    }
    pub(crate) fn next_sample(&mut self) -> i64 {
        self.sample += 1;
        self.sample
    }
    pub(crate) fn next_repo(&mut self) -> i64 {
        self.repo += 1;
        self.repo
    }
    pub(crate) fn next_commit(&mut self) -> i64 {
        self.commit += 1;
        self.commit
    }
    pub(crate) fn next_task(&mut self) -> i64 {
        self.task += 1;
        self.task
    }
    pub(crate) fn next_publish(&mut self) -> i64 {
        self.publish += 1;
        self.publish
    }
    pub(crate) fn next_execution(&mut self) -> i64 {
        self.execution += 1;
        self.execution
    }
    pub(crate) fn next_group(&mut self) -> i64 {
        self.group += 1;
        self.group
    }
}

/// 内存存储，实现全部仓储端口
#[derive(Default)]
pub struct MemoryStore {
    pub(crate) state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// 按字符数保留字符串尾部（日志滚动用，避免在多字节字符上截断）
pub(crate) fn keep_last_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect()
}
