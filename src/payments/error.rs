use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Network failure, timeout, 429 or 5xx after local retries.
    #[error("Gateway unavailable: {message}")]
    Unavailable {
        message: String,
        status_code: Option<u16>,
    },

    /// Permanent rejection: bad amount, malformed date, invalid key, 4xx.
    #[error("Gateway rejected request: {message}")]
    Rejected {
        message: String,
        field: Option<String>,
        provider_code: Option<String>,
    },
}

impl GatewayError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        GatewayError::Unavailable {
            message: message.into(),
            status_code: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        GatewayError::Rejected {
            message: message.into(),
            field: None,
            provider_code: None,
        }
    }

    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        GatewayError::Rejected {
            message: message.into(),
            field: Some(field.to_string()),
            provider_code: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unavailable { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            GatewayError::Unavailable { message, .. } | GatewayError::Rejected { message, .. } => {
                message
            }
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            GatewayError::Unavailable { .. } => 503,
            GatewayError::Rejected { field: Some(_), .. } => 400,
            GatewayError::Rejected { .. } => 502,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Unavailable { .. } => {
                "Payment gateway is temporarily unavailable. Please try again shortly".to_string()
            }
            GatewayError::Rejected {
                field: Some(field),
                message,
                ..
            } => format!("Invalid {}: {}", field, message),
            GatewayError::Rejected { message, .. } => {
                format!("Payment gateway rejected the request: {}", message)
            }
        }
    }
}

impl From<GatewayError> for crate::error::AppError {
    fn from(err: GatewayError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError};

        let kind = match err {
            GatewayError::Unavailable { message, .. } => {
                AppErrorKind::External(ExternalError::GatewayUnavailable { message })
            }
            GatewayError::Rejected { message, field, .. } => {
                AppErrorKind::External(ExternalError::GatewayRejected { message, field })
            }
        };
        AppError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(GatewayError::unavailable("connection reset").is_retryable());
        assert!(!GatewayError::rejected("invalid key").is_retryable());
        assert!(!GatewayError::invalid_field("amount", "must be positive").is_retryable());
    }

    #[test]
    fn http_status_mapping_is_correct() {
        assert_eq!(GatewayError::unavailable("down").http_status_code(), 503);
        assert_eq!(
            GatewayError::invalid_field("txn_date", "bad date").http_status_code(),
            400
        );
        assert_eq!(GatewayError::rejected("invalid key").http_status_code(), 502);
    }

    #[test]
    fn user_message_names_the_field() {
        let err = GatewayError::invalid_field("amount", "must be greater than zero");
        assert!(err.user_message().contains("amount"));
    }
}
