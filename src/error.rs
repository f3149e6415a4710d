use crate::session::SessionStatus;
use crate::{SessionId, TaskId, WordId};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at the engine boundary.
///
/// An empty candidate pool is not an error: selection returns an empty list.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("word {0} not found in catalog")]
    WordNotFound(WordId),

    #[error("word {word_id} is not part of session {session_id}")]
    WordNotInSession {
        session_id: SessionId,
        word_id: WordId,
    },

    #[error("task {task_id} already has session {active_session_id} in progress")]
    SessionConflict {
        task_id: TaskId,
        active_session_id: SessionId,
    },

    #[error("cannot {action} session {session_id} while it is {from}")]
    InvalidTransition {
        session_id: SessionId,
        from: SessionStatus,
        action: &'static str,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the "referenced thing does not exist" family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::TaskNotFound(_)
                | Error::SessionNotFound(_)
                | Error::WordNotFound(_)
                | Error::WordNotInSession { .. }
        )
    }
}
