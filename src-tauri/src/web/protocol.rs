//! Messages exchanged between the adapter and its background context.

use serde::{Deserialize, Serialize};

use crate::job::{Segment, Task};
use crate::segments::{self, TimeUnit};

/// One decoded chunk; `timestamp` is `(start, end)` in seconds and the end
/// is missing for a chunk that is still open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedChunk {
    pub timestamp: (f64, Option<f64>),
    pub text: String,
}

impl RecognizedChunk {
    pub fn new(start: f64, end: Option<f64>, text: impl Into<String>) -> Self {
        Self {
            timestamp: (start, end),
            text: text.into(),
        }
    }

    pub fn to_segment(&self) -> Segment {
        let (start, end) = self.timestamp;
        segments::normalize(start, end, &self.text, TimeUnit::Seconds)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodedOutput {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub chunks: Vec<RecognizedChunk>,
}

impl DecodedOutput {
    pub fn from_chunks(chunks: Vec<RecognizedChunk>) -> Self {
        let text = chunks
            .iter()
            .map(|chunk| chunk.text.as_str())
            .collect::<String>();
        Self { text, chunks }
    }

    pub fn to_segments(&self) -> Vec<Segment> {
        self.chunks.iter().map(RecognizedChunk::to_segment).collect()
    }
}

/// Status messages posted by the background context, tagged by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerMessage {
    /// A model asset started loading.
    Initiate {
        file: String,
        #[serde(default)]
        name: String,
    },
    Progress {
        file: String,
        progress: f32,
    },
    Done {
        file: String,
    },
    /// The recognition pipeline is loaded.
    Ready,
    /// Partial decoder output: `(text, output)`.
    Update {
        data: (String, DecodedOutput),
    },
    Complete {
        data: DecodedOutput,
    },
    Error {
        data: String,
    },
}

/// The single request a background context serves.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextRequest {
    pub audio: Vec<f32>,
    pub model: String,
    pub quantized: bool,
    /// `None` lets the pipeline detect the language.
    pub language: Option<String>,
    pub task: Task,
}
