//! Task route handlers.
//!
//! Handlers run behind the admission middleware, which has already resolved
//! the caller and placed it in the request extensions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, instrument};

use super::model::{validate_lengths, DeleteResponse, NewTask, Task, TaskFilter, TaskUpdate};
use super::store::{TaskStore, TaskStoreError};
use crate::identity::CallerIdentity;

/// Shared state of the task routes.
#[derive(Clone)]
pub struct TaskState {
    pub store: Arc<dyn TaskStore>,
}

/// Errors returned by the task routes.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task with ID {id} not found for user {user}")]
    NotFound { id: u64, user: String },

    #[error("No fields provided for update.")]
    NoFields,

    #[error("Validation Error: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] TaskStoreError),
}

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        let status = match &self {
            TaskError::NotFound { .. } => StatusCode::NOT_FOUND,
            TaskError::NoFields => StatusCode::BAD_REQUEST,
            TaskError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TaskError::Storage(err) => {
                error!(error = %err, "Task store failure");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "detail": "Internal server error" })),
                )
                    .into_response();
            }
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

fn not_found(id: u64, caller: &CallerIdentity) -> TaskError {
    TaskError::NotFound {
        id,
        user: caller.to_string(),
    }
}

#[instrument(skip_all, fields(caller = %caller))]
pub async fn create_task(
    State(state): State<TaskState>,
    Extension(caller): Extension<CallerIdentity>,
    Json(body): Json<NewTask>,
) -> Result<(StatusCode, Json<Task>), TaskError> {
    validate_lengths(Some(&body.title), body.description.as_deref()).map_err(TaskError::Validation)?;

    let task = state.store.create(&caller, body).await?;
    debug!(task_id = task.id, "Task created");
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn list_tasks(
    State(state): State<TaskState>,
    Extension(caller): Extension<CallerIdentity>,
    Query(filter): Query<TaskFilter>,
) -> Result<Json<Vec<Task>>, TaskError> {
    Ok(Json(state.store.list(&caller, &filter).await?))
}

pub async fn read_task(
    State(state): State<TaskState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<u64>,
) -> Result<Json<Task>, TaskError> {
    state
        .store
        .get(&caller, id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(id, &caller))
}

pub async fn update_task(
    State(state): State<TaskState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<u64>,
    Json(body): Json<TaskUpdate>,
) -> Result<Json<Task>, TaskError> {
    if body.is_empty() {
        return Err(TaskError::NoFields);
    }
    validate_lengths(body.title.as_deref(), body.description.as_deref())
        .map_err(TaskError::Validation)?;

    state
        .store
        .update(&caller, id, body)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(id, &caller))
}

pub async fn delete_task(
    State(state): State<TaskState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<u64>,
) -> Result<Json<DeleteResponse>, TaskError> {
    if !state.store.delete(&caller, id).await? {
        return Err(not_found(id, &caller));
    }
    Ok(Json(DeleteResponse {
        message: format!("Task {id} deleted successfully."),
        task_id: id,
    }))
}
