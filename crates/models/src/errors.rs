/// Error is the stable taxonomy of failures surfaced by the orchestration
/// core. Callers branch on the variant; the message is for humans.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed config, illegal state transition, or missing required field.
    /// Never retried.
    #[error("validation error: {0}")]
    Validation(String),
    /// A referenced task, interface, or data source does not exist.
    #[error("{entity} {id:?} was not found")]
    NotFound { entity: &'static str, id: String },
    /// Duplicate name, deletion blocked by dependents, or a task that is not
    /// startable in its current status.
    #[error("conflict: {0}")]
    Conflict(String),
    /// A driver or external system failed. Retryable at the task level.
    #[error("remote error: {0:#}")]
    Remote(anyhow::Error),
    /// The distributed lock could not be acquired for a scheduled fire.
    /// Treated as a skip, not a failure.
    #[error("could not acquire lock {0:?}")]
    TransientLock(String),
    /// Unrecoverable: lost database at startup, unparseable cron engine.
    #[error("fatal: {0:#}")]
    Fatal(anyhow::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Stable machine-readable kind, used by the external surface when
    /// rendering structured error objects.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound { .. } => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Remote(_) => "remote",
            Error::TransientLock(_) => "transient_lock",
            Error::Fatal(_) => "fatal",
        }
    }
}

#[cfg(feature = "sqlx-support")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Error::NotFound {
                entity: "row",
                id: String::new(),
            },
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                Error::Conflict(db.message().to_string())
            }
            _ => Error::Remote(err.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(Error::validation("x").kind(), "validation");
        assert_eq!(Error::not_found("task", "0011").kind(), "not_found");
        assert_eq!(Error::conflict("dup").kind(), "conflict");
        assert_eq!(
            Error::TransientLock("basic:0011".to_string()).kind(),
            "transient_lock"
        );
    }
}
