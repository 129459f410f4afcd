/// Failures raised by a [`crate::db::PollStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("poll {0} not found")]
    NotFound(i64),

    #[error("option {0} not found")]
    OptionNotFound(i64),

    #[error("voter already has a vote recorded on poll {id_poll}")]
    DuplicateVote { id_poll: i64 },

    #[error("poll {id_poll} cannot be reopened")]
    InvalidTransition { id_poll: i64 },

    /// Transient; the unit of work may be retried from the start.
    #[error("conflicting transaction: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        // serialization_failure, deadlock_detected
        let transient = match &e {
            sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001") | Some("40P01")),
            _ => false,
        };
        if transient {
            return StoreError::Conflict(e.to_string());
        }

        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            e => StoreError::Database(e),
        }
    }
}

/// Caller-facing outcome of a failed poll operation.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("poll {0} not found")]
    PollNotFound(i64),

    #[error("option {0} not found")]
    OptionNotFound(i64),

    #[error("option {id_option} does not belong to poll {id_poll}")]
    OptionPollMismatch { id_poll: i64, id_option: i64 },

    #[error("poll {0} is closed")]
    PollClosed(i64),

    #[error("already voted on poll {0}")]
    AlreadyVoted(i64),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl From<StoreError> for PollError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id_poll) => PollError::PollNotFound(id_poll),
            StoreError::OptionNotFound(id_option) => PollError::OptionNotFound(id_option),
            StoreError::DuplicateVote { id_poll } => PollError::AlreadyVoted(id_poll),
            e => PollError::StoreUnavailable(e),
        }
    }
}
