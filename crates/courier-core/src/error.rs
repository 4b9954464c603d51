//! Error types shared by the storage layer and domain helpers.
//!
//! Database failures are mapped into a small taxonomy so callers can
//! distinguish a missing row or a constraint conflict from an unavailable
//! database without matching on driver-specific errors.

use sqlx::error::ErrorKind;
use thiserror::Error;

/// Result alias for storage and domain helpers.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Failure raised by the storage layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The database could not be reached or the statement failed.
    #[error("database unavailable: {0}")]
    Database(String),

    /// The named record does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Unique, foreign key, not-null or check constraint rejected a write.
    #[error("constraint violated: {0}")]
    ConstraintViolation(String),

    /// A caller-supplied value was rejected before reaching the database.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A stored or queued record could not be encoded or decoded.
    #[error("malformed record: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row".to_string()),
            sqlx::Error::Database(db_err) => match db_err.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => Self::ConstraintViolation(format!(
                    "{} ({})",
                    db_err.message(),
                    db_err.constraint().unwrap_or("unnamed")
                )),
                _ => Self::Database(db_err.to_string()),
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Serialization(err.to_string())
            },
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let error = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(error, CoreError::NotFound(_)));
    }

    #[test]
    fn pool_timeout_maps_to_database() {
        let error = CoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(error, CoreError::Database(_)));
    }

    #[test]
    fn json_errors_map_to_serialization() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error = CoreError::from(json_error);
        assert!(error.to_string().starts_with("malformed record"));
    }
}
