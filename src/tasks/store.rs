//! Task persistence.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use super::model::{NewTask, Task, TaskFilter, TaskUpdate};
use crate::identity::CallerIdentity;

/// Errors reported by a task store.
#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// CRUD over tasks, always scoped to the owning user.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, owner: &CallerIdentity, task: NewTask) -> Result<Task, TaskStoreError>;

    async fn get(&self, owner: &CallerIdentity, id: u64) -> Result<Option<Task>, TaskStoreError>;

    /// Matching tasks, newest first.
    async fn list(&self, owner: &CallerIdentity, filter: &TaskFilter)
        -> Result<Vec<Task>, TaskStoreError>;

    /// Apply `update`; `None` if the task does not exist for this owner.
    async fn update(
        &self,
        owner: &CallerIdentity,
        id: u64,
        update: TaskUpdate,
    ) -> Result<Option<Task>, TaskStoreError>;

    /// `true` if a task was removed.
    async fn delete(&self, owner: &CallerIdentity, id: u64) -> Result<bool, TaskStoreError>;
}

/// Process-local task store.
#[derive(Debug)]
pub struct InMemoryTaskStore {
    tasks: RwLock<BTreeMap<u64, Task>>,
    next_id: AtomicU64,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, owner: &CallerIdentity, task: NewTask) -> Result<Task, TaskStoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Task {
            id,
            user_id: owner.as_str().to_string(),
            title: task.title,
            description: task.description,
            is_done: false,
        };
        self.tasks.write().insert(id, task.clone());
        Ok(task)
    }

    async fn get(&self, owner: &CallerIdentity, id: u64) -> Result<Option<Task>, TaskStoreError> {
        Ok(self
            .tasks
            .read()
            .get(&id)
            .filter(|t| t.user_id == owner.as_str())
            .cloned())
    }

    async fn list(
        &self,
        owner: &CallerIdentity,
        filter: &TaskFilter,
    ) -> Result<Vec<Task>, TaskStoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .rev()
            .filter(|t| t.user_id == owner.as_str() && filter.matches(t))
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        owner: &CallerIdentity,
        id: u64,
        update: TaskUpdate,
    ) -> Result<Option<Task>, TaskStoreError> {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(&id).filter(|t| t.user_id == owner.as_str()) else {
            return Ok(None);
        };

        if let Some(title) = update.title {
            task.title = title;
        }
        if let Some(description) = update.description {
            task.description = Some(description);
        }
        if let Some(is_done) = update.is_done {
            task.is_done = is_done;
        }
        Ok(Some(task.clone()))
    }

    async fn delete(&self, owner: &CallerIdentity, id: u64) -> Result<bool, TaskStoreError> {
        let mut tasks = self.tasks.write();
        let owned = tasks.get(&id).is_some_and(|t| t.user_id == owner.as_str());
        Ok(owned && tasks.remove(&id).is_some())
    }
}
