use std::fmt;

/// Store-level error shared by the Postgres and in-memory repositories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    NotFound { entity: String, id: String },
    /// Unique key (e.g. `client_txn_id`) already present.
    UniqueViolation { entity: String, message: String },
    /// Exclusion constraint or explicit overlap check refused the write.
    SlotConflict { message: String },
    /// Row exists but is not in a state that permits the requested change.
    InvalidState { entity: String, message: String },
    ConnectionError { message: String },
    /// Serialization failure or deadlock; safe to retry the whole unit.
    TransientConflict { message: String },
    Unknown { message: String },
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn not_found(entity: &str, id: impl fmt::Display) -> Self {
        Self::new(DatabaseErrorKind::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        })
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::ConnectionError {
            message: message.into(),
        })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DatabaseErrorKind::ConnectionError { .. } | DatabaseErrorKind::TransientConflict { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::NotFound { .. })
    }

    #[cfg(feature = "database")]
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseErrorKind::ConnectionError {
                    message: err.to_string(),
                }
            }
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some("23505") => DatabaseErrorKind::UniqueViolation {
                    entity: db_err.table().unwrap_or("unknown").to_string(),
                    message: db_err.message().to_string(),
                },
                Some("23P01") => DatabaseErrorKind::SlotConflict {
                    message: db_err.message().to_string(),
                },
                Some("40001") | Some("40P01") => DatabaseErrorKind::TransientConflict {
                    message: db_err.message().to_string(),
                },
                _ => DatabaseErrorKind::Unknown {
                    message: db_err.message().to_string(),
                },
            },
            _ => DatabaseErrorKind::Unknown {
                message: err.to_string(),
            },
        };
        Self::new(kind)
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DatabaseErrorKind::NotFound { entity, id } => write!(f, "{} '{}' not found", entity, id),
            DatabaseErrorKind::UniqueViolation { entity, message } => {
                write!(f, "Duplicate {}: {}", entity, message)
            }
            DatabaseErrorKind::SlotConflict { message } => write!(f, "Slot conflict: {}", message),
            DatabaseErrorKind::InvalidState { entity, message } => {
                write!(f, "Invalid {} state: {}", entity, message)
            }
            DatabaseErrorKind::ConnectionError { message } => {
                write!(f, "Database connection error: {}", message)
            }
            DatabaseErrorKind::TransientConflict { message } => {
                write!(f, "Transient database conflict: {}", message)
            }
            DatabaseErrorKind::Unknown { message } => write!(f, "Database error: {}", message),
        }
    }
}

impl std::error::Error for DatabaseError {}

impl From<DatabaseError> for crate::error::AppError {
    fn from(err: DatabaseError) -> Self {
        use crate::error::{AppError, AppErrorKind, DomainError, InfrastructureError};

        let is_retryable = err.is_retryable();
        let kind = match err.kind {
            DatabaseErrorKind::SlotConflict { message } => {
                AppErrorKind::Domain(DomainError::SlotConflict { slot: message })
            }
            other => AppErrorKind::Infrastructure(InfrastructureError::Database {
                message: DatabaseError::new(other).to_string(),
                is_retryable,
            }),
        };
        AppError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_and_transient_errors_are_retryable() {
        assert!(DatabaseError::connection("reset").is_retryable());
        assert!(DatabaseError::new(DatabaseErrorKind::TransientConflict {
            message: "could not serialize access".to_string()
        })
        .is_retryable());
        assert!(!DatabaseError::not_found("PaymentOrder", "txn_1").is_retryable());
    }

    #[test]
    fn slot_conflict_maps_to_domain_error() {
        let app: crate::error::AppError = DatabaseError::new(DatabaseErrorKind::SlotConflict {
            message: "hallA|2024-06-17|09:00-17:00".to_string(),
        })
        .into();
        assert_eq!(app.status_code(), 409);
    }
}
