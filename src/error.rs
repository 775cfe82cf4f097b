use std::error::Error as StdError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IntegrationError>;

/// Reason reported for errors that carry no code of their own.
pub const UNEXPECTED_ERROR_REASON: &str = "Unexpected error occurred";

/// Common error type for `lattice_core`.
///
/// Every variant maps to a stable `code()`; user-visible event descriptions
/// are rendered by [`IntegrationError::event_description`] so log lines and
/// remote events can be correlated through a shared `errorId`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IntegrationError {
    #[error("{message}")]
    ConfigValidation { message: String },

    #[error("unknown step id(s) in start states: {}", step_ids.join(", "))]
    StepStartStateInvalidStepId { step_ids: Vec<String> },

    #[error("no start state provided for step(s): {}", step_ids.join(", "))]
    UnaccountedStepStartStates { step_ids: Vec<String> },

    #[error("Provider authentication failed at {endpoint}: {status} {status_text}")]
    ProviderAuthentication {
        endpoint: String,
        status: u16,
        status_text: String,
    },

    #[error("Provider authorization failed at {endpoint}: {status} {status_text}")]
    ProviderAuthorization {
        endpoint: String,
        status: u16,
        status_text: String,
    },

    #[error("{message}")]
    Validation { message: String },

    #[error("step \"{step_id}\" failed: {source}")]
    StepExecution {
        step_id: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("{message}")]
    Canonicalization { message: String },

    #[error("duplicate _key detected: {key}")]
    DuplicateKey { key: String },

    #[error("synchronization api call to {endpoint} failed: {message}")]
    SynchronizationApi {
        endpoint: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{}", UNEXPECTED_ERROR_REASON)]
    Unexpected {
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },
}

impl IntegrationError {
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn canonicalization(message: impl Into<String>) -> Self {
        Self::Canonicalization {
            message: message.into(),
        }
    }

    pub fn step_execution(
        step_id: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::StepExecution {
            step_id: step_id.into(),
            source: Box::new(source),
        }
    }

    pub fn sync_api(
        endpoint: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self::SynchronizationApi {
            endpoint: endpoint.into(),
            status,
            message: message.into(),
        }
    }

    pub fn unexpected(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Unexpected {
            source: Box::new(source),
        }
    }

    /// Stable code published with every error event.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigValidation { .. } => "CONFIG_VALIDATION_ERROR",
            Self::StepStartStateInvalidStepId { .. } => "STEP_START_STATE_INVALID_STEP_ID",
            Self::UnaccountedStepStartStates { .. } => "UNACCOUNTED_STEP_START_STATES",
            Self::ProviderAuthentication { .. } => "PROVIDER_AUTHENTICATION_ERROR",
            Self::ProviderAuthorization { .. } => "PROVIDER_AUTHORIZATION_ERROR",
            Self::Validation { .. } => "INTEGRATION_VALIDATION_ERROR",
            Self::StepExecution { .. } => "STEP_EXECUTION_ERROR",
            Self::Canonicalization { .. } => "ENTITY_CANONICALIZATION_ERROR",
            Self::DuplicateKey { .. } => "DUPLICATE_KEY_DETECTED",
            Self::SynchronizationApi { .. } => "SYNCHRONIZATION_API_ERROR",
            Self::Unexpected { .. } => "UNEXPECTED_ERROR",
        }
    }

    /// Whether the framework understands this failure. Only errors without a
    /// code of their own are un-handled; those trigger a job abort with
    /// [`UNEXPECTED_ERROR_REASON`].
    pub fn is_handled(&self) -> bool {
        !matches!(self, Self::Unexpected { .. })
    }

    /// Retriable failures: network-level synchronization errors (no status)
    /// and server-side transient statuses.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SynchronizationApi { status, .. } => match status {
                None => true,
                Some(code) => *code == 429 || *code >= 500,
            },
            _ => false,
        }
    }

    /// Extra `key="value"` attributes appended to event descriptions.
    fn attributes(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::ProviderAuthentication {
                endpoint, status, ..
            }
            | Self::ProviderAuthorization {
                endpoint, status, ..
            } => vec![
                ("endpoint", endpoint.clone()),
                ("status", status.to_string()),
            ],
            Self::SynchronizationApi {
                endpoint, status, ..
            } => {
                let mut attrs = vec![("endpoint", endpoint.clone())];
                if let Some(code) = status {
                    attrs.push(("status", code.to_string()));
                }
                attrs
            }
            Self::StepExecution { step_id, .. } => vec![("step", step_id.clone())],
            _ => Vec::new(),
        }
    }

    /// Renders `<prefix> (errorCode="…", errorId="…", reason="…"[, k="v"]*)`
    /// with a fresh correlation id, returning `(description, error_id)`.
    pub fn event_description(&self, prefix: &str) -> (String, String) {
        self.event_description_with(prefix, &[])
    }

    /// Like [`IntegrationError::event_description`], with caller-supplied
    /// attributes appended after the error's own.
    pub fn event_description_with(
        &self,
        prefix: &str,
        extras: &[(String, String)],
    ) -> (String, String) {
        let error_id = uuid::Uuid::new_v4().to_string();
        let mut out = format!(
            "{prefix} (errorCode=\"{code}\", errorId=\"{error_id}\", reason=\"{self}\"",
            code = self.code(),
        );
        for (key, value) in self.attributes() {
            out.push_str(&format!(", {key}=\"{value}\""));
        }
        for (key, value) in extras {
            out.push_str(&format!(", {key}=\"{value}\""));
        }
        out.push(')');
        (out, error_id)
    }
}
