//! 发布记录与运行记录表

use async_trait::async_trait;
use chrono::Utc;

use super::MemoryStore;
use capd_core::{CapError, CapResult};
use capd_domain::{
    ExecutionRecord, ExecutionRecordRepository, ExecutionStatus, PublishRecord,
    PublishRecordRepository, PublishState, TaskKind,
};

#[async_trait]
impl PublishRecordRepository for MemoryStore {
    async fn insert_publish(&self, record: &PublishRecord) -> CapResult<PublishRecord> {
        let mut state = self.state.write().await;
        let mut record = record.clone();
        record.id = state.ids.next_publish();
        state.publishes.insert(record.id, record.clone());
        Ok(record)
    }

    async fn publish_by_id(&self, id: i64) -> CapResult<Option<PublishRecord>> {
        Ok(self.state.read().await.publishes.get(&id).cloned())
    }

    async fn publishes_by_task(
        &self,
        task_id: i64,
        task_kind: TaskKind,
        limit: usize,
    ) -> CapResult<Vec<PublishRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<PublishRecord> = state
            .publishes
            .values()
            .filter(|p| p.task_id == task_id && p.task_kind == task_kind)
            .cloned()
            .collect();
        records.sort_by_key(|p| std::cmp::Reverse(p.id));
        records.truncate(limit);
        Ok(records)
    }

    async fn mark_publish_running_if_pending(&self, id: i64) -> CapResult<bool> {
        let mut state = self.state.write().await;
        let record = state
            .publishes
            .get_mut(&id)
            .ok_or(CapError::PublishRecordNotFound { id })?;
        if record.state != PublishState::Pending {
            return Ok(false);
        }
        record.state = PublishState::Running;
        Ok(true)
    }

    async fn finish_publish_if_active(
        &self,
        id: i64,
        new_state: PublishState,
        stdout: &str,
        stderr: &str,
    ) -> CapResult<bool> {
        let mut state = self.state.write().await;
        let record = state
            .publishes
            .get_mut(&id)
            .ok_or(CapError::PublishRecordNotFound { id })?;
        // 终态只写一次，先到的获胜
        if record.state.is_terminal() {
            return Ok(false);
        }
        record.state = new_state;
        record.stdout = stdout.to_string();
        record.stderr = stderr.to_string();
        record.finished_at = Some(Utc::now());
        Ok(true)
    }
}

#[async_trait]
impl ExecutionRecordRepository for MemoryStore {
    async fn insert_execution(&self, record: &ExecutionRecord) -> CapResult<ExecutionRecord> {
        let mut state = self.state.write().await;
        let mut record = record.clone();
        record.id = state.ids.next_execution();
        state.executions.push(record.clone());
        Ok(record)
    }

    async fn execution_by_id(&self, id: i64) -> CapResult<Option<ExecutionRecord>> {
        Ok(self
            .state
            .read()
            .await
            .executions
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn recent_executions(
        &self,
        task_id: i64,
        task_kind: TaskKind,
        limit: usize,
    ) -> CapResult<Vec<ExecutionRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<ExecutionRecord> = state
            .executions
            .iter()
            .filter(|r| r.task_id == task_id && r.task_kind == task_kind)
            .cloned()
            .collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.id));
        records.truncate(limit);
        Ok(records)
    }

    async fn execution_count(&self, task_id: i64, task_kind: TaskKind) -> CapResult<u64> {
        let state = self.state.read().await;
        Ok(state
            .executions
            .iter()
            .filter(|r| r.task_id == task_id && r.task_kind == task_kind)
            .count() as u64)
    }

    async fn prune_executions_keep_recent(
        &self,
        task_id: i64,
        task_kind: TaskKind,
        keep: usize,
    ) -> CapResult<u64> {
        let mut state = self.state.write().await;
        let mut ids: Vec<i64> = state
            .executions
            .iter()
            .filter(|r| r.task_id == task_id && r.task_kind == task_kind)
            .map(|r| r.id)
            .collect();
        if ids.len() <= keep {
            return Ok(0);
        }
        ids.sort_by_key(|id| std::cmp::Reverse(*id));
        let cutoff: std::collections::HashSet<i64> = ids.into_iter().skip(keep).collect();
        let before = state.executions.len();
        state.executions.retain(|r| !cutoff.contains(&r.id));
        Ok((before - state.executions.len()) as u64)
    }

    async fn finish_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        stdout: &str,
        stderr: &str,
    ) -> CapResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .executions
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(CapError::ExecutionRecordNotFound { id })?;
        record.status = status;
        record.stdout = stdout.to_string();
        record.stderr = stderr.to_string();
        record.ended_at = Some(Utc::now());
        Ok(())
    }
}
