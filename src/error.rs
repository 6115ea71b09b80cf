//! Unified error handling for the payments service
//!
//! Every failure that can reach an HTTP caller is folded into [`AppError`],
//! which knows its status code, stable error code and a message that is safe
//! to show to the person paying.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "SLOT_CONFLICT")]
    SlotConflict,
    #[serde(rename = "ORDER_NOT_FOUND")]
    OrderNotFound,
    #[serde(rename = "BOOKING_NOT_FOUND")]
    BookingNotFound,
    #[serde(rename = "DUPLICATE_ORDER")]
    DuplicateOrder,
    #[serde(rename = "ORDER_ALREADY_FINAL")]
    OrderAlreadyFinal,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CACHE_ERROR")]
    CacheError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,
    #[serde(rename = "PERSISTENCE_ERROR")]
    PersistenceError,

    // External errors (502, 503, 504)
    #[serde(rename = "GATEWAY_UNAVAILABLE")]
    GatewayUnavailable,
    #[serde(rename = "GATEWAY_REJECTED")]
    GatewayRejected,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimitError,
    #[serde(rename = "PAYMENT_TIMEOUT")]
    PaymentTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Booking and order rules
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Another active booking already holds an overlapping slot
    SlotConflict { slot: String },
    /// No order with this client transaction id
    OrderNotFound { client_txn_id: String },
    /// No booking with this id
    BookingNotFound { booking_id: String },
    /// An order with this client transaction id was already created
    DuplicateOrder { client_txn_id: String },
    /// The order already reached a terminal status
    OrderAlreadyFinal {
        client_txn_id: String,
        status: String,
    },
}

/// Infrastructure-level errors (database, cache, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    /// Database connection or query failure
    Database { message: String, is_retryable: bool },
    /// Redis cache unavailable
    Cache { message: String },
    /// Missing or invalid configuration
    Configuration { message: String },
    /// A confirmed payment could not be recorded after retries
    Persistence { client_txn_id: String, message: String },
}

/// Gateway and throttling errors
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Network failure, timeout or 5xx from the payment gateway
    GatewayUnavailable { message: String },
    /// The gateway refused the request
    GatewayRejected {
        message: String,
        field: Option<String>,
    },
    /// Caller exceeded the booking attempt budget
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },
    /// No terminal status within the polling window
    PaymentTimeout {
        client_txn_id: String,
        waited_secs: u64,
    },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// Invalid amount (format or value)
    InvalidAmount { amount: String, reason: String },
    /// Slot text or time window could not be parsed
    InvalidSlot { slot: String, reason: String },
    /// Required field missing
    MissingField { field: String },
    /// Field failed a format rule
    InvalidField { field: String, reason: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::SlotConflict { .. } => 409,
                DomainError::OrderNotFound { .. } => 404,
                DomainError::BookingNotFound { .. } => 404,
                DomainError::DuplicateOrder { .. } => 409,
                DomainError::OrderAlreadyFinal { .. } => 409,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayUnavailable { .. } => 503,
                ExternalError::GatewayRejected { field: Some(_), .. } => 400,
                ExternalError::GatewayRejected { .. } => 502,
                ExternalError::RateLimit { .. } => 429,
                ExternalError::PaymentTimeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::SlotConflict { .. } => ErrorCode::SlotConflict,
                DomainError::OrderNotFound { .. } => ErrorCode::OrderNotFound,
                DomainError::BookingNotFound { .. } => ErrorCode::BookingNotFound,
                DomainError::DuplicateOrder { .. } => ErrorCode::DuplicateOrder,
                DomainError::OrderAlreadyFinal { .. } => ErrorCode::OrderAlreadyFinal,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Cache { .. } => ErrorCode::CacheError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
                InfrastructureError::Persistence { .. } => ErrorCode::PersistenceError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayUnavailable { .. } => ErrorCode::GatewayUnavailable,
                ExternalError::GatewayRejected { .. } => ErrorCode::GatewayRejected,
                ExternalError::RateLimit { .. } => ErrorCode::RateLimitError,
                ExternalError::PaymentTimeout { .. } => ErrorCode::PaymentTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::SlotConflict { slot } => {
                    format!("The slot {} was just booked by someone else", slot)
                }
                DomainError::OrderNotFound { client_txn_id } => {
                    format!("Payment '{}' not found", client_txn_id)
                }
                DomainError::BookingNotFound { booking_id } => {
                    format!("Booking '{}' not found", booking_id)
                }
                DomainError::DuplicateOrder { client_txn_id } => {
                    format!("Payment '{}' already exists", client_txn_id)
                }
                DomainError::OrderAlreadyFinal {
                    client_txn_id,
                    status,
                } => format!("Payment '{}' is already {}", client_txn_id, status),
            },
            AppErrorKind::Infrastructure(InfrastructureError::Persistence { .. }) => {
                "Your payment was received but we could not confirm the booking. Support has been notified".to_string()
            }
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayUnavailable { .. } => {
                    "Payment gateway is temporarily unavailable. Please try again shortly"
                        .to_string()
                }
                ExternalError::GatewayRejected {
                    field: Some(field),
                    message,
                } => format!("Invalid {}: {}", field, message),
                ExternalError::GatewayRejected { message, .. } => {
                    format!("Payment gateway rejected the request: {}", message)
                }
                ExternalError::RateLimit {
                    service,
                    retry_after,
                } => {
                    if let Some(secs) = retry_after {
                        format!(
                            "Too many {} attempts. Please try again in {} seconds",
                            service, secs
                        )
                    } else {
                        format!("Too many {} attempts. Please try again later", service)
                    }
                }
                ExternalError::PaymentTimeout { waited_secs, .. } => format!(
                    "No payment confirmation received after {} seconds. If money was debited it will be reconciled automatically",
                    waited_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::InvalidSlot { slot, reason } => {
                    format!("Invalid slot '{}': {}", slot, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid {}: {}", field, reason)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Cache { .. } => true,
                InfrastructureError::Configuration { .. } => false,
                InfrastructureError::Persistence { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayUnavailable { .. } => true,
                ExternalError::GatewayRejected { .. } => false,
                ExternalError::RateLimit { .. } => true,
                ExternalError::PaymentTimeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// From<DatabaseError>, From<GatewayError> and From<ReconcileError> live next to
// their source types.

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_conflict_error() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::SlotConflict {
            slot: "hallA|2024-06-17|09:00-17:00".to_string(),
        }));

        assert_eq!(error.status_code(), 409);
        assert_eq!(error.error_code(), ErrorCode::SlotConflict);
        assert!(error.user_message().contains("hallA"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_gateway_rejection_with_field_is_bad_request() {
        let error = AppError::new(AppErrorKind::External(ExternalError::GatewayRejected {
            message: "unrecognised date".to_string(),
            field: Some("txn_date".to_string()),
        }));

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::GatewayRejected);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_rate_limit_error() {
        let error = AppError::new(AppErrorKind::External(ExternalError::RateLimit {
            service: "booking".to_string(),
            retry_after: Some(60),
        }));

        assert_eq!(error.status_code(), 429);
        assert_eq!(error.error_code(), ErrorCode::RateLimitError);
        assert!(error.user_message().contains("60 seconds"));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_persistence_error_is_not_retryable() {
        let error = AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Persistence {
                client_txn_id: "txn_1".to_string(),
                message: "connection reset".to_string(),
            },
        ));

        assert_eq!(error.status_code(), 500);
        assert_eq!(error.error_code(), ErrorCode::PersistenceError);
        assert!(error.user_message().contains("Support"));
        assert!(!error.is_retryable());
    }
}
