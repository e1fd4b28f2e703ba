//! 任务与分组表

use async_trait::async_trait;
use chrono::Utc;

use super::MemoryStore;
use capd_core::{CapError, CapResult};
use capd_domain::{Group, GroupRepository, Task, TaskRepository, TaskStatus};

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn insert_task(&self, task: &Task) -> CapResult<Task> {
        let mut state = self.state.write().await;
        let mut task = task.clone();
        task.id = state.ids.next_task();
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn task_by_id(&self, id: i64) -> CapResult<Option<Task>> {
        Ok(self.state.read().await.tasks.get(&id).cloned())
    }

    async fn all_tasks(&self) -> CapResult<Vec<Task>> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn update_task(&self, task: &Task) -> CapResult<()> {
        let mut state = self.state.write().await;
        let existing = state
            .tasks
            .get_mut(&task.id)
            .ok_or(CapError::TaskNotFound { id: task.id })?;
        let mut task = task.clone();
        task.updated_at = Utc::now();
        *existing = task;
        Ok(())
    }

    async fn update_task_status(&self, id: i64, status: TaskStatus) -> CapResult<()> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(CapError::TaskNotFound { id })?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn update_task_status_if(
        &self,
        id: i64,
        expected: &[TaskStatus],
        status: TaskStatus,
    ) -> CapResult<bool> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(CapError::TaskNotFound { id })?;
        if !expected.contains(&task.status) {
            return Ok(false);
        }
        task.status = status;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_task_run(&self, id: i64, execution_id: i64) -> CapResult<()> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(CapError::TaskNotFound { id })?;
        task.run_count += 1;
        task.latest_execution_id = Some(execution_id);
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_task(&self, id: i64) -> CapResult<bool> {
        let mut state = self.state.write().await;
        Ok(state.tasks.remove(&id).is_some())
    }
}

#[async_trait]
impl GroupRepository for MemoryStore {
    async fn add_group(&self, name: &str) -> CapResult<Group> {
        let mut state = self.state.write().await;
        if state.groups.values().any(|g| g.name == name) {
            return Err(CapError::database_error(format!("分组已存在: {name}")));
        }
        let group = Group {
            id: state.ids.next_group(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        state.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn group_by_name(&self, name: &str) -> CapResult<Option<Group>> {
        Ok(self
            .state
            .read()
            .await
            .groups
            .values()
            .find(|g| g.name == name)
            .cloned())
    }

    async fn all_groups(&self) -> CapResult<Vec<Group>> {
        let state = self.state.read().await;
        let mut groups: Vec<Group> = state.groups.values().cloned().collect();
        groups.sort_by_key(|g| g.id);
        Ok(groups)
    }

    async fn ensure_group(&self, name: &str) -> CapResult<Group> {
        if let Some(group) = self.group_by_name(name).await? {
            return Ok(group);
        }
        self.add_group(name).await
    }
}
