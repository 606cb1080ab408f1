//! Error type shared by every catalogue operation.

use rusqlite::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The video API answered with a non-success status.
    #[error("video api returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("video api request failed: {0}")]
    Transport(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("missing reference: {0}")]
    MissingReference(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    /// Filesystem failure around the database, such as creating its
    /// directory.
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

pub type CatalogResult<T> = Result<T, CatalogError>;

impl CatalogError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<rusqlite::Error> for CatalogError {
    /// Constraint failures are lifted out of the generic database bucket so
    /// callers can tell a duplicate apart from a broken store.
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, message) = &err
            && failure.code == ErrorCode::ConstraintViolation
        {
            let detail = message.clone().unwrap_or_else(|| failure.to_string());
            return match failure.extended_code {
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => Self::Conflict(detail),
                rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Self::MissingReference(detail),
                _ => Self::Database(err),
            };
        }
        Self::Database(err)
    }
}
