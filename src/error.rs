use std::{
    any::Any,
    fmt::{self, Display},
};

use thiserror::Error;

/// Category of a pipeline failure, reported as the `type` field of unexpected errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    EmptyInput,
    InputTooLarge,
    Decode,
    Config,
    ModelLoad,
    Inference,
    Read,
    Logging,
    Panic,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::EmptyInput => "EmptyInputError",
            ErrorKind::InputTooLarge => "InputTooLargeError",
            ErrorKind::Decode => "DecodeError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::ModelLoad => "ModelLoadError",
            ErrorKind::Inference => "InferenceError",
            ErrorKind::Read => "ReadError",
            ErrorKind::Logging => "LoggingError",
            ErrorKind::Panic => "Panic",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No image data provided")]
    EmptyInput,

    #[error("Input exceeds the {limit} byte limit")]
    InputTooLarge { limit: usize },

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to load configuration: {0:#}")]
    Config(anyhow::Error),

    #[error("Failed to load model: {0:#}")]
    ModelLoad(anyhow::Error),

    #[error("Inference failed: {0:#}")]
    Inference(anyhow::Error),

    #[error("Unexpected error: {0}")]
    Read(#[from] std::io::Error),

    #[error("Unexpected error: {0:#}")]
    Logging(anyhow::Error),

    #[error("Unexpected error: {0}")]
    Panic(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::EmptyInput => ErrorKind::EmptyInput,
            PipelineError::InputTooLarge { .. } => ErrorKind::InputTooLarge,
            PipelineError::Decode(_) => ErrorKind::Decode,
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::ModelLoad(_) => ErrorKind::ModelLoad,
            PipelineError::Inference(_) => ErrorKind::Inference,
            PipelineError::Read(_) => ErrorKind::Read,
            PipelineError::Logging(_) => ErrorKind::Logging,
            PipelineError::Panic(_) => ErrorKind::Panic,
        }
    }

    /// Fatal failures go to stderr with exit status 1. Inference failures are the
    /// one exception: they are reported on stdout as a regular result.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::Inference(_))
    }

    /// Failures outside the enumerated pipeline stages. These carry their kind
    /// name in the `type` field of the error report.
    #[inline]
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            PipelineError::Read(_) | PipelineError::Logging(_) | PipelineError::Panic(_)
        )
    }
}

/// Message carried by a panic payload from `catch_unwind`.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
