//! Task records and request bodies.

use serde::{Deserialize, Serialize};

pub const MAX_TITLE_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 1000;

/// A stored task, owned by exactly one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub is_done: bool,
}

/// Body of `POST /tasks/`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Body of `PUT /tasks/{id}`; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_done: Option<bool>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.is_done.is_none()
    }
}

/// Query of `GET /tasks/`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    pub is_done: Option<bool>,
    /// Case-insensitive substring of title or description
    pub search: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if self.is_done.is_some_and(|done| done != task.is_done) {
            return false;
        }
        match self.search.as_deref().filter(|s| !s.is_empty()) {
            None => true,
            Some(term) => {
                let term = term.to_lowercase();
                task.title.to_lowercase().contains(&term)
                    || task
                        .description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&term))
            }
        }
    }
}

/// Body returned by `DELETE /tasks/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub message: String,
    pub task_id: u64,
}

/// Length checks shared by create and update.
pub fn validate_lengths(title: Option<&str>, description: Option<&str>) -> Result<(), String> {
    if let Some(title) = title {
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(format!("title must be at most {MAX_TITLE_LEN} characters"));
        }
    }
    if let Some(description) = description {
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(format!(
                "description must be at most {MAX_DESCRIPTION_LEN} characters"
            ));
        }
    }
    Ok(())
}
