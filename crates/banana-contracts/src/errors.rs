use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::history::EntryId;

/// Contradictions in resolution negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("AUTO resolution requires an input image to match")]
    AutoWithoutInput,
    #[error("input image has a zero dimension ({width}x{height})")]
    DegenerateInput { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationKind {
    EmptyPrompt,
    DimensionMismatch,
    MissingMask,
    MissingReference,
    UnexpectedMask,
    MissingBaseImage,
    Resolution,
}

impl ValidationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmptyPrompt => "EMPTY_PROMPT",
            Self::DimensionMismatch => "DIMENSION_MISMATCH",
            Self::MissingMask => "MISSING_MASK",
            Self::MissingReference => "MISSING_REFERENCE",
            Self::UnexpectedMask => "UNEXPECTED_MASK",
            Self::MissingBaseImage => "MISSING_BASE_IMAGE",
            Self::Resolution => "RESOLUTION",
        }
    }
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A malformed request, rejected before any network call.
///
/// `field` names the input that failed so the UI can point at it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} ({field}): {message}")]
pub struct ValidationError {
    pub kind: ValidationKind,
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(kind: ValidationKind, field: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            field,
            message: message.into(),
        }
    }
}

impl From<ConfigurationError> for ValidationError {
    fn from(err: ConfigurationError) -> Self {
        Self::new(ValidationKind::Resolution, "target_resolution", err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationErrorKind {
    AuthInvalid,
    RequestRejected,
    Timeout,
    Cancelled,
    DecodeFailed,
    TransientExhausted,
}

impl GenerationErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthInvalid => "AUTH_INVALID",
            Self::RequestRejected => "REQUEST_REJECTED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::DecodeFailed => "DECODE_FAILED",
            Self::TransientExhausted => "TRANSIENT_EXHAUSTED",
        }
    }
}

impl fmt::Display for GenerationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct GenerationError {
    pub kind: GenerationErrorKind,
    pub message: String,
    /// HTTP status of the last response, when one was received.
    pub status: Option<u16>,
    /// Transport attempts made before the error surfaced.
    pub attempts: u32,
}

impl GenerationError {
    pub fn new(kind: GenerationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            attempts: 0,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(GenerationErrorKind::Cancelled, "request cancelled")
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == GenerationErrorKind::Cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("history entry {id} is not part of this store")]
pub struct NotFoundError {
    pub id: EntryId,
}

/// Only produced under a reject-while-busy policy; the orchestrator cancels
/// the in-flight request instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("a generation request is already in flight")]
pub struct BusyError;
