//! Job record, identity and request options shared by both backends.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    LoadingModel,
    Transcribing,
    Done,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::LoadingModel | Self::Transcribing)
    }
}

/// A recognized span of text. Times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

/// Where the audio comes from. Two references are the same audio when the
/// variant and its fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AudioRef {
    Path { path: PathBuf },
    InMemory { handle: u64, name: String },
}

impl AudioRef {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path { path: path.into() }
    }

    pub fn in_memory(handle: u64, name: impl Into<String>) -> Self {
        Self::InMemory {
            handle,
            name: name.into(),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Self::Path { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            Self::InMemory { name, .. } => name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ModelRef {
    /// Model file on disk, used by the host engine.
    Path { path: PathBuf },
    /// Remote model identifier such as `Xenova/whisper-tiny`.
    Remote { id: String },
}

impl ModelRef {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path { path: path.into() }
    }

    pub fn remote(id: impl Into<String>) -> Self {
        Self::Remote { id: id.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentity {
    pub audio: AudioRef,
    pub model: ModelRef,
}

impl JobIdentity {
    pub fn new(audio: AudioRef, model: ModelRef) -> Self {
        Self { audio, model }
    }
}

/// The persisted record of the single current job.
///
/// `error` is present exactly when `status` is `Error`, and `progress` stays
/// within `[0, 100]`. The mutators below keep both true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "file")]
    pub audio: AudioRef,
    pub model: ModelRef,
    pub status: JobStatus,
    pub progress: f32,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    pub fn loading(identity: &JobIdentity) -> Self {
        Self {
            audio: identity.audio.clone(),
            model: identity.model.clone(),
            status: JobStatus::LoadingModel,
            progress: 0.0,
            segments: Vec::new(),
            error: None,
        }
    }

    pub fn failed(identity: &JobIdentity, message: impl Into<String>) -> Self {
        let mut job = Self::loading(identity);
        job.fail(message);
        job
    }

    pub fn identity(&self) -> JobIdentity {
        JobIdentity::new(self.audio.clone(), self.model.clone())
    }

    pub fn matches(&self, audio: &AudioRef, model: &ModelRef) -> bool {
        &self.audio == audio && &self.model == model
    }

    pub fn set_progress(&mut self, progress: f32) {
        self.progress = clamp_progress(progress);
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        if status != JobStatus::Error {
            self.error = None;
        }
    }

    pub fn finish(&mut self, segments: Vec<Segment>) {
        self.set_status(JobStatus::Done);
        self.progress = 100.0;
        self.segments = segments;
    }

    /// Moves to `Error`, dropping partial output.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Error;
        self.error = Some(message.into());
        self.progress = 0.0;
        self.segments.clear();
    }

    /// Moves to `Cancelled`, keeping whatever progress and segments exist.
    pub fn cancel(&mut self) {
        self.set_status(JobStatus::Cancelled);
    }

    /// Restores the record invariants on data read back from storage.
    pub(crate) fn normalized(mut self) -> Self {
        self.progress = clamp_progress(self.progress);
        match self.status {
            JobStatus::Error if self.error.is_none() => {
                self.error = Some("Unknown error".to_string());
            }
            JobStatus::Error => {}
            _ => self.error = None,
        }
        self
    }
}

pub(crate) fn clamp_progress(progress: f32) -> f32 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Transcribe,
    Translate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SamplingStrategy {
    #[serde(rename_all = "camelCase")]
    Greedy { best_of: u32 },
    #[serde(rename_all = "camelCase")]
    BeamSearch {
        beam_size: u32,
        patience: f32,
        length_penalty: f32,
    },
}

impl Default for SamplingStrategy {
    fn default() -> Self {
        Self::Greedy { best_of: 1 }
    }
}

/// Engine options forwarded with a transcription request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscriptionOptions {
    /// Language code, or `auto` to let the engine detect it.
    pub language: String,
    pub translate: bool,
    pub thread_count: usize,
    pub strategy: SamplingStrategy,
    pub temperature: f32,
    pub initial_prompt: String,
    pub suppress_blank: bool,
    pub suppress_non_speech_tokens: bool,
    pub split_on_word: bool,
    pub token_timestamps: bool,
    /// Maximum segment length in characters; 0 is unbounded.
    pub max_length: u32,
    pub use_gpu: bool,
    pub gpu_device: u32,
    /// Prefer quantized weights in the in-process pipeline.
    pub quantized: bool,
}

impl Default for TranscriptionOptions {
    fn default() -> Self {
        Self {
            language: "auto".to_string(),
            translate: false,
            thread_count: num_cpus::get_physical().max(1),
            strategy: SamplingStrategy::default(),
            temperature: 0.0,
            initial_prompt: String::new(),
            suppress_blank: true,
            suppress_non_speech_tokens: false,
            split_on_word: false,
            token_timestamps: false,
            max_length: 0,
            use_gpu: true,
            gpu_device: 0,
            quantized: true,
        }
    }
}

impl TranscriptionOptions {
    /// `None` when the language should be detected.
    pub fn language_code(&self) -> Option<&str> {
        let language = self.language.trim();
        if language.is_empty() || language.eq_ignore_ascii_case("auto") {
            None
        } else {
            Some(language)
        }
    }

    pub fn task(&self) -> Task {
        if self.translate {
            Task::Translate
        } else {
            Task::Transcribe
        }
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.thread_count == 0 {
            return Err(JobError::InvalidRequest(
                "thread count must be at least 1".to_string(),
            ));
        }
        match self.strategy {
            SamplingStrategy::Greedy { best_of: 0 } => {
                return Err(JobError::InvalidRequest(
                    "best-of must be at least 1".to_string(),
                ))
            }
            SamplingStrategy::BeamSearch { beam_size: 0, .. } => {
                return Err(JobError::InvalidRequest(
                    "beam size must be at least 1".to_string(),
                ))
            }
            _ => {}
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(JobError::InvalidRequest(format!(
                "temperature {} is outside [0, 1]",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// A request to transcribe one audio file with one model.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub identity: JobIdentity,
    pub options: TranscriptionOptions,
    /// Encoded audio for in-memory references. Path references are read on demand.
    pub audio_bytes: Option<Arc<Vec<u8>>>,
}

impl JobRequest {
    pub fn new(audio: AudioRef, model: ModelRef) -> Self {
        Self {
            identity: JobIdentity::new(audio, model),
            options: TranscriptionOptions::default(),
            audio_bytes: None,
        }
    }

    pub fn with_options(mut self, options: TranscriptionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_audio_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.audio_bytes = Some(Arc::new(bytes));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "camelCase")]
pub enum StartOutcome {
    /// A new attempt is running; watch the store for its progress.
    Started,
    /// The stored job for this identity was kept as is.
    Resumed(Job),
    /// The attempt failed before reaching the engine. The store holds the error too.
    Failed(String),
}
