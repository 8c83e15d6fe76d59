use std::time::Duration;

use thiserror::Error;

/// Unified app errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Job: {0}")]
    Job(#[from] JobError),

    #[error("Store: {0}")]
    Store(#[from] StoreError),

    #[error("Engine: {0}")]
    Engine(#[from] EngineError),

    #[error("Config: {0}")]
    Config(String),
}

impl AppError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Job(err) => err.user_message(),
            Self::Store(err) => err.user_message(),
            Self::Engine(err) => err.user_message(),
            Self::Config(_) => "No transcription backend is configured.",
        }
    }
}

/// Failures of a single transcription attempt. These end up in the job record
/// as `{status: error, error: message}` rather than being returned to callers.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    /// Engine-reported failure, stored verbatim.
    #[error("{0}")]
    Engine(String),

    #[error("Invalid transcription request: {0}")]
    InvalidRequest(String),

    #[error("Transcription stalled: no activity for {0:?}")]
    Stalled(Duration),

    #[error("No finished transcript to export")]
    NoTranscript,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Decode(_) => "Could not decode the audio file. Try converting it to WAV or MP3.",
            Self::ModelLoad(_) => {
                "The speech model could not be loaded. Check the model file and try again."
            }
            Self::Engine(_) => "The speech engine reported an error while transcribing.",
            Self::InvalidRequest(_) => "The transcription settings are not valid.",
            Self::Stalled(_) => "The transcription stopped responding. Please try again.",
            Self::NoTranscript => "There is no finished transcript to export yet.",
            Self::Io(_) => {
                "The app could not read or write its local files. Check disk space and permissions."
            }
        }
    }
}

/// Job record persistence failures. Never fatal: the in-memory record stays authoritative.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Io(_) | Self::Backend(_) => {
                "Transcription progress could not be saved. It will be lost when the app closes."
            }
            Self::Serialize(_) => "The saved transcription could not be read and was discarded.",
        }
    }
}

/// Host-engine request failures.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Host engine unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Request(String),

    #[error("Host engine protocol error: {0}")]
    Protocol(String),

    #[error("Host engine did not answer {0} within {1:?}")]
    Timeout(&'static str, Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Unavailable(_) | Self::Io(_) => {
                "The speech engine is not running. Try restarting the app."
            }
            Self::Request(_) => "The speech engine rejected the request.",
            Self::Protocol(_) | Self::Timeout(..) => {
                "The speech engine stopped responding. Try restarting the app."
            }
        }
    }
}

/// Model asset download failures.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("{0}: request failed: {1}")]
    Request(String, String),

    #[error("{0}: unexpected status {1}")]
    Status(String, u16),

    #[error("Incomplete download: expected {expected} bytes, got {actual}")]
    Incomplete { expected: u64, actual: u64 },

    #[error("Download aborted")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Request(..) | Self::Status(..) | Self::Incomplete { .. } => {
                "Could not download the speech model. Check your internet connection and try again."
            }
            Self::Aborted => "The model download was cancelled.",
            Self::Io(_) => {
                "The app could not read or write its local files. Check disk space and permissions."
            }
        }
    }
}
