use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistrationError>;

/// Failure talking to the registry. Never fatal to the sidecar.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Registry unreachable at {endpoint}: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Registry at {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u128 },

    #[error("Registry at {endpoint} rejected request with status {status}: {body}")]
    Rejected {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Registry error: {0}")]
    Internal(String),
}

impl RegistrationError {
    /// Short label used for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RegistrationError::Unreachable { .. } => "unreachable",
            RegistrationError::Timeout { .. } => "timeout",
            RegistrationError::Rejected { .. } => "rejected",
            RegistrationError::Internal(_) => "internal",
        }
    }
}

/// Invalid startup configuration. Fatal: the sidecar must not serve with it.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration value: {0}")]
    Missing(&'static str),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
