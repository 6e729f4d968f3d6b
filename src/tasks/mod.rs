//! Per-user task list API.
//!
//! Every route is wrapped in an admission guard for its own operation id.
//! Whether a route is actually rate limited depends only on the policy table.

mod handlers;
mod model;
mod sqlite;
mod store;

pub use handlers::{TaskError, TaskState};
pub use model::{DeleteResponse, NewTask, Task, TaskFilter, TaskUpdate};
pub use sqlite::SqliteTaskStore;
pub use store::{InMemoryTaskStore, TaskStore, TaskStoreError};

use axum::routing::{delete, get, post, put};
use axum::Router;
use std::sync::Arc;

use crate::config::{OP_TASKS_CREATE, OP_TASKS_DELETE, OP_TASKS_LIST, OP_TASKS_READ, OP_TASKS_UPDATE};
use crate::http::AdmissionGuard;

/// Build the `/tasks` routes.
pub fn router(store: Arc<dyn TaskStore>, guard: &AdmissionGuard) -> Router {
    let state = TaskState { store };

    Router::new()
        .route(
            "/tasks/",
            guard
                .for_operation(OP_TASKS_CREATE)
                .wrap(post(handlers::create_task))
                .merge(guard.for_operation(OP_TASKS_LIST).wrap(get(handlers::list_tasks))),
        )
        .route(
            "/tasks/{id}",
            guard
                .for_operation(OP_TASKS_READ)
                .wrap(get(handlers::read_task))
                .merge(
                    guard
                        .for_operation(OP_TASKS_UPDATE)
                        .wrap(put(handlers::update_task)),
                )
                .merge(
                    guard
                        .for_operation(OP_TASKS_DELETE)
                        .wrap(delete(handlers::delete_task)),
                ),
        )
        .with_state(state)
}
