use thiserror::Error;

/// Errors surfaced to the embedding application.
///
/// Per-frame parse failures are not represented here: a malformed stream
/// line is logged and skipped inside the parser and never escalates.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The platform refused to hand out a microphone stream.
    #[error("microphone unavailable: {0}")]
    MicrophoneAccess(String),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A start/request call arrived while another capture or generation
    /// was already in flight. Callers may surface a soft notice or drop it.
    #[error("another operation is already in flight")]
    Busy,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Attachment upload failure. No automatic retry is performed; the caller
/// decides whether to re-submit.
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// The server answered and rejected the upload; the message is the
    /// human-readable reason extracted from the response body.
    #[error("upload rejected: {0}")]
    Server(String),

    /// The request never completed (connection, timeout, body read).
    #[error("upload failed: {0}")]
    Network(String),
}

/// Failure opening or reading the generation stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("server returned {code}: {message}")]
    Status { code: u16, message: String },

    #[error("stream read failed: {0}")]
    Read(String),
}
