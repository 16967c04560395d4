use thiserror::Error;

/// Top-level application error. All variants carry a human-readable message
/// for display/logging; user-facing routes map them onto transient notices
/// rather than bare 500s.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Moderation ───────────────────────────────────────────────────────────
    /// The moderation check itself failed. The submission is blocked; a
    /// failed check is never treated as "not flagged".
    #[error("Moderation check unavailable: {message}")]
    ModerationUnavailable { message: String },

    #[error("Your message was flagged by moderation. Please rephrase it.")]
    ModerationFlagged,

    // ── Dataset upload ───────────────────────────────────────────────────────
    #[error("Upload of '{filename}' failed: {message}")]
    UploadFailed { filename: String, message: String },

    #[error("'{filename}' was rejected: {reason}")]
    InvalidDataset { filename: String, reason: String },

    // ── Streaming ────────────────────────────────────────────────────────────
    /// The remote stream broke an ordering guarantee (e.g. a delta with no
    /// open item). Rendering continues best-effort.
    #[error("Unexpected event from the analysis stream: {detail}")]
    StreamProtocolFault { detail: String },

    #[error("Chart {file_id} could not be retrieved: {message}")]
    ArtifactFetchFailed { file_id: String, message: String },

    #[error("The code ran but produced no output.")]
    EmptyExecutionResult,

    #[error("Connection to the analysis service was lost: {message}")]
    StreamTransport { message: String },

    // ── Session / validation ─────────────────────────────────────────────────
    #[error("Session '{id}' not found")]
    SessionNotFound { id: String },

    #[error("A response is still streaming for this session")]
    TurnInProgress,

    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    // ── Remote API / configuration ───────────────────────────────────────────
    #[error("Request to {endpoint} failed: {message}")]
    ApiRequestFailed { endpoint: String, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl AppError {
    pub fn api(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::ApiRequestFailed {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn artifact(file_id: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::ArtifactFetchFailed {
            file_id: file_id.into(),
            message: message.into(),
        }
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        AppError::StreamProtocolFault { detail: detail.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::SessionNotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AppError::EmptyField { .. }
                | AppError::InvalidDataset { .. }
                | AppError::ModerationFlagged
                | AppError::TurnInProgress
        )
    }

    pub fn is_remote_unavailable(&self) -> bool {
        matches!(
            self,
            AppError::ModerationUnavailable { .. }
                | AppError::ApiRequestFailed { .. }
                | AppError::UploadFailed { .. }
                | AppError::StreamTransport { .. }
        )
    }
}
