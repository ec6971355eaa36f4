use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("VALIDATION: {0}")]
    Validation(String),
    #[error("AUTH: {0}")]
    Auth(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("CONFLICT: {0}")]
    Conflict(String),
    #[error("TRANSIENT_TRANSPORT: {0}")]
    TransientTransport(String),
    #[error("REMOTE_PROCESSING: {0}")]
    RemoteProcessing(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::Auth(_) => "AUTH",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::TransientTransport(_) => "TRANSIENT_TRANSPORT",
            Self::RemoteProcessing(_) => "REMOTE_PROCESSING",
            Self::Io(_) | Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Auth(_) => 401,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::TransientTransport(_) | Self::RemoteProcessing(_) => 502,
            Self::Io(_) | Self::Internal(_) => 500,
        }
    }

    /// Message without the kind prefix, suitable for item and snapshot error fields.
    pub fn message(&self) -> &str {
        match self {
            Self::Validation(message)
            | Self::Auth(message)
            | Self::NotFound(message)
            | Self::Conflict(message)
            | Self::TransientTransport(message)
            | Self::RemoteProcessing(message)
            | Self::Io(message)
            | Self::Internal(message) => message,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientTransport(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
