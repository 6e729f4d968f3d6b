//! SQLite-backed task store.
//!
//! Tasks survive restarts. Every write is its own statement, so there is no
//! transaction to commit or roll back. The schema lives in `migrations/` and
//! is applied when the store is opened.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::str::FromStr;
use tracing::{debug, info};

use super::model::{NewTask, Task, TaskFilter, TaskUpdate};
use super::store::{TaskStore, TaskStoreError};
use crate::identity::CallerIdentity;

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    user_id: String,
    title: String,
    description: Option<String>,
    is_done: bool,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            id: row.id as u64,
            user_id: row.user_id,
            title: row.title,
            description: row.description,
            is_done: row.is_done,
        }
    }
}

/// Task store on top of a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url` and apply the schema.
    ///
    /// An in-memory database lives only as long as its connection, so it is
    /// held on a single connection that is never recycled.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, TaskStoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };
        let pool = pool_options.connect_with(options).await?;

        let store = Self::new(pool);
        store.migrate().await?;
        info!(url = %url, "Task store ready");
        Ok(store)
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), TaskStoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }
}

/// Escape `LIKE` wildcards so the search term matches literally.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, owner: &CallerIdentity, task: NewTask) -> Result<Task, TaskStoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO tasks (user_id, title, description)
            VALUES (?, ?, ?)
            RETURNING id, user_id, title, description, is_done
            "#,
        )
        .bind(owner.as_str())
        .bind(task.title)
        .bind(task.description)
        .fetch_one(&self.pool)
        .await?;

        debug!(task_id = row.id, "Task row inserted");
        Ok(row.into())
    }

    async fn get(&self, owner: &CallerIdentity, id: u64) -> Result<Option<Task>, TaskStoreError> {
        let Ok(id) = i64::try_from(id) else {
            return Ok(None);
        };

        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, user_id, title, description, is_done
            FROM tasks
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(id)
        .bind(owner.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Task::from))
    }

    /// SQLite `LIKE` folds case for ASCII letters only.
    async fn list(
        &self,
        owner: &CallerIdentity,
        filter: &TaskFilter,
    ) -> Result<Vec<Task>, TaskStoreError> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, user_id, title, description, is_done FROM tasks WHERE user_id = ",
        );
        query.push_bind(owner.as_str());

        if let Some(is_done) = filter.is_done {
            query.push(" AND is_done = ").push_bind(is_done);
        }
        if let Some(term) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            let pattern = format!("%{}%", escape_like(term));
            query
                .push(" AND (title LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR description LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }
        query.push(" ORDER BY id DESC");

        let rows = query
            .build_query_as::<TaskRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn update(
        &self,
        owner: &CallerIdentity,
        id: u64,
        update: TaskUpdate,
    ) -> Result<Option<Task>, TaskStoreError> {
        let Ok(id) = i64::try_from(id) else {
            return Ok(None);
        };

        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET title = COALESCE(?, title),
                description = COALESCE(?, description),
                is_done = COALESCE(?, is_done)
            WHERE id = ? AND user_id = ?
            RETURNING id, user_id, title, description, is_done
            "#,
        )
        .bind(update.title)
        .bind(update.description)
        .bind(update.is_done)
        .bind(id)
        .bind(owner.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Task::from))
    }

    async fn delete(&self, owner: &CallerIdentity, id: u64) -> Result<bool, TaskStoreError> {
        let Ok(id) = i64::try_from(id) else {
            return Ok(false);
        };

        let deleted = sqlx::query("DELETE FROM tasks WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(owner.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    async fn memory_store() -> SqliteTaskStore {
        SqliteTaskStore::connect("sqlite::memory:", 1).await.unwrap()
    }

    fn owner(id: &str) -> CallerIdentity {
        CallerIdentity::new(id).unwrap()
    }

    fn new_task(title: &str, description: Option<&str>) -> NewTask {
        NewTask {
            title: title.to_string(),
            description: description.map(str::to_string),
        }
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("plain"), "plain");
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }

    #[tokio::test]
    async fn test_tasks_isolated_per_owner() {
        let store = memory_store().await;
        let a = owner("user-a");
        let b = owner("user-b");

        let task = store.create(&a, new_task("A's task", None)).await.unwrap();
        assert_eq!(task.user_id, "user-a");
        assert!(!task.is_done);

        assert_eq!(store.get(&a, task.id).await.unwrap(), Some(task.clone()));
        assert!(store.get(&b, task.id).await.unwrap().is_none());
        assert!(!store.delete(&b, task.id).await.unwrap());
        assert!(store.list(&b, &TaskFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_newest_first() {
        let store = memory_store().await;
        let u1 = owner("u1");

        let milk = store.create(&u1, new_task("Buy milk", None)).await.unwrap();
        store
            .create(&u1, new_task("Call bank", Some("about the 50% fee")))
            .await
            .unwrap();
        store
            .update(
                &u1,
                milk.id,
                TaskUpdate {
                    is_done: Some(true),
                    ..TaskUpdate::default()
                },
            )
            .await
            .unwrap();

        let all = store.list(&u1, &TaskFilter::default()).await.unwrap();
        let titles: Vec<_> = all.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["Call bank", "Buy milk"]);

        let done = TaskFilter {
            is_done: Some(true),
            search: None,
        };
        assert_eq!(store.list(&u1, &done).await.unwrap().len(), 1);

        let search = |term: &str| TaskFilter {
            is_done: None,
            search: Some(term.to_string()),
        };
        assert_eq!(store.list(&u1, &search("MILK")).await.unwrap().len(), 1);
        assert_eq!(store.list(&u1, &search("50%")).await.unwrap().len(), 1);
        assert_eq!(store.list(&u1, &search("%")).await.unwrap().len(), 1);
        assert!(store.list(&u1, &search("bread")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_update_and_delete() {
        let store = memory_store().await;
        let u1 = owner("u1");
        let task = store
            .create(&u1, new_task("write report", Some("draft")))
            .await
            .unwrap();

        let updated = store
            .update(
                &u1,
                task.id,
                TaskUpdate {
                    title: Some("write final report".to_string()),
                    ..TaskUpdate::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.title, "write final report");
        assert_eq!(updated.description.as_deref(), Some("draft"));
        assert!(!updated.is_done);

        assert!(store
            .update(&owner("u2"), task.id, TaskUpdate::default())
            .await
            .unwrap()
            .is_none());

        assert!(store.delete(&u1, task.id).await.unwrap());
        assert!(!store.delete(&u1, task.id).await.unwrap());
        assert!(store.get(&u1, task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_id_is_not_found() {
        let store = memory_store().await;
        let u1 = owner("u1");

        assert!(store.get(&u1, u64::MAX).await.unwrap().is_none());
        assert!(!store.delete(&u1, u64::MAX).await.unwrap());
    }

    #[tokio::test]
    async fn test_tasks_survive_reopen() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("taskgate-{}-{nanos}.db", std::process::id()));
        let url = format!("sqlite://{}", path.display());
        let u1 = owner("u1");

        let id = {
            let store = SqliteTaskStore::connect(&url, 2).await.unwrap();
            let task = store.create(&u1, new_task("persist me", None)).await.unwrap();
            store.pool.close().await;
            task.id
        };

        let reopened = SqliteTaskStore::connect(&url, 2).await.unwrap();
        let task = reopened.get(&u1, id).await.unwrap().unwrap();
        assert_eq!(task.title, "persist me");

        reopened.pool.close().await;
        let _ = std::fs::remove_file(&path);
    }
}
