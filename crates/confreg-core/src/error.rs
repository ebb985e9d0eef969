use thiserror::Error;

/// Registration pipeline errors.
///
/// Business rejections (declined charges, credentials held by someone else) are
/// not errors; they travel as `success: false` results. These variants cover
/// caller-correctable input problems and infrastructure failures.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Gateway '{gateway}' failed: {message}")]
    Gateway { gateway: String, message: String },

    #[error("Gateway not configured for provider '{0}'")]
    GatewayNotFound(String),

    #[error("Identity provider error: {0}")]
    Identity(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RegistrationError {
    pub fn step_violation(expected: &str, actual: &str) -> Self {
        Self::InvariantViolation(format!(
            "step order violation: expected '{}', got '{}'",
            expected, actual
        ))
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Callable error code surfaced to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid-argument",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::NotFound(_) => "not-found",
            Self::Conflict(_) => "already-exists",
            Self::InvariantViolation(_) => "failed-precondition",
            Self::Store(_)
            | Self::Gateway { .. }
            | Self::GatewayNotFound(_)
            | Self::Identity(_)
            | Self::Notification(_)
            | Self::Serialization(_) => "internal",
        }
    }

    /// True for caller-correctable failures that must not be logged as incidents.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_)
                | Self::Unauthenticated(_)
                | Self::NotFound(_)
                | Self::Conflict(_)
                | Self::InvariantViolation(_)
        )
    }
}

impl From<serde_json::Error> for RegistrationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_callable_error_model() {
        assert_eq!(
            RegistrationError::invalid("bad").code(),
            "invalid-argument"
        );
        assert_eq!(
            RegistrationError::Unauthenticated("x".into()).code(),
            "unauthenticated"
        );
        assert_eq!(RegistrationError::Store("down".into()).code(), "internal");
        assert!(!RegistrationError::Store("down".into()).is_validation());
        assert!(RegistrationError::NotFound("r".into()).is_validation());
    }
}
