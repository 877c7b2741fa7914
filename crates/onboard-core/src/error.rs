use thiserror::Error;

/// Identity-provider failures surfaced to the signing user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    DuplicateEmail,
    WeakCredential,
    InvalidCredential,
    RateLimited,
    Unauthorized,
    SessionExpired,
}

impl AuthFailure {
    pub fn name(self) -> &'static str {
        match self {
            Self::DuplicateEmail => "duplicate_email",
            Self::WeakCredential => "weak_credential",
            Self::InvalidCredential => "invalid_credential",
            Self::RateLimited => "rate_limited",
            Self::Unauthorized => "unauthorized",
            Self::SessionExpired => "session_expired",
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::DuplicateEmail => "An account with this email already exists.",
            Self::WeakCredential => {
                "Password must be at least 8 characters and contain letters and digits."
            }
            Self::InvalidCredential => "Email or password is incorrect.",
            Self::RateLimited => "Too many attempts. Please wait a few minutes and try again.",
            Self::Unauthorized => "You are not allowed to perform this action.",
            Self::SessionExpired => "Your session has expired. Please sign in again.",
        }
    }
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Onboarding errors.
#[derive(Debug, Error)]
pub enum OnboardError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {failure}: {detail}")]
    Auth { failure: AuthFailure, detail: String },

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Workflow operation issued at a step where it does not apply.
    #[error("out of order: {0}")]
    StepOrder(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl OnboardError {
    pub fn auth(failure: AuthFailure, detail: impl Into<String>) -> Self {
        Self::Auth {
            failure,
            detail: detail.into(),
        }
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::auth(AuthFailure::Unauthorized, detail)
    }

    pub fn status_violation(from: &str, to: &str) -> Self {
        Self::Conflict(format!("status transition '{}' -> '{}' is not allowed", from, to))
    }

    /// Text shown inline at the step where the error happened.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(detail) => detail.clone(),
            Self::Auth { failure, .. } => failure.user_message().to_string(),
            Self::Verification(detail) => detail.clone(),
            Self::Storage(_) => {
                "We could not store your signed agreement. Please try again.".to_string()
            }
            Self::Conflict(_) => "This record was changed elsewhere. Please reload.".to_string(),
            Self::StepOrder(_) => {
                "That action is not available at this step. Please continue from the current step."
                    .to_string()
            }
            Self::NotFound(_) => "Record not found.".to_string(),
            Self::Backend(_) | Self::Serialization(_) => {
                "Something went wrong. Please try again.".to_string()
            }
        }
    }
}

impl From<serde_json::Error> for OnboardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
