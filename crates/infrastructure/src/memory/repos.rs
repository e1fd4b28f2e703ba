//! 源码库、提交历史与轮询日志表

use async_trait::async_trait;
use chrono::Utc;

use super::{keep_last_chars, MemoryStore};
use capd_core::{CapError, CapResult};
use capd_domain::{
    CommitLogEntry, CommitLogRepository, RepoPollLog, RepoPollLogRepository, SourceRepoRepository,
    SourceRepository,
};

#[async_trait]
impl SourceRepoRepository for MemoryStore {
    async fn add_repo(&self, repo: &SourceRepository) -> CapResult<SourceRepository> {
        let mut state = self.state.write().await;
        if state.repos.values().any(|r| r.url == repo.url) {
            return Err(CapError::database_error(format!(
                "代码库地址已存在: {}",
                repo.url
            )));
        }
        let mut repo = repo.clone();
        repo.id = state.ids.next_repo();
        state.repos.insert(repo.id, repo.clone());
        Ok(repo)
    }

    async fn repo_by_id(&self, id: i64) -> CapResult<Option<SourceRepository>> {
        Ok(self.state.read().await.repos.get(&id).cloned())
    }

    async fn repo_by_url(&self, url: &str) -> CapResult<Option<SourceRepository>> {
        Ok(self
            .state
            .read()
            .await
            .repos
            .values()
            .find(|r| r.url == url)
            .cloned())
    }

    async fn all_repos(&self) -> CapResult<Vec<SourceRepository>> {
        let state = self.state.read().await;
        let mut repos: Vec<SourceRepository> = state.repos.values().cloned().collect();
        repos.sort_by_key(|r| r.id);
        Ok(repos)
    }
}

#[async_trait]
impl CommitLogRepository for MemoryStore {
    async fn insert_commits(&self, entries: &[CommitLogEntry]) -> CapResult<u64> {
        let mut state = self.state.write().await;
        let mut inserted = 0u64;
        for entry in entries {
            let key = (entry.repo_id, entry.version.clone());
            if state.commit_keys.contains(&key) {
                continue;
            }
            let mut entry = entry.clone();
            entry.id = state.ids.next_commit();
            state.commit_keys.insert(key);
            state.commits.push(entry);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn commits_by_repo(
        &self,
        repo_id: i64,
        limit: usize,
    ) -> CapResult<Vec<CommitLogEntry>> {
        let state = self.state.read().await;
        let mut commits: Vec<CommitLogEntry> = state
            .commits
            .iter()
            .filter(|c| c.repo_id == repo_id)
            .cloned()
            .collect();
        commits.sort_by(|a, b| b.committed_at.cmp(&a.committed_at).then(b.id.cmp(&a.id)));
        commits.truncate(limit);
        Ok(commits)
    }
}

#[async_trait]
impl RepoPollLogRepository for MemoryStore {
    async fn append_poll_line(
        &self,
        repo_id: i64,
        line: &str,
        max_chars: usize,
    ) -> CapResult<()> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let entry = state.poll_logs.entry(repo_id).or_insert_with(|| RepoPollLog {
            repo_id,
            updated_at: now,
            log: String::new(),
        });
        entry.log.push_str(&format!(
            "[{}]:{line}\n",
            now.format("%Y-%m-%d %H:%M:%S")
        ));
        entry.log = keep_last_chars(&entry.log, max_chars);
        entry.updated_at = now;
        Ok(())
    }

    async fn poll_log(&self, repo_id: i64) -> CapResult<Option<RepoPollLog>> {
        Ok(self.state.read().await.poll_logs.get(&repo_id).cloned())
    }
}
