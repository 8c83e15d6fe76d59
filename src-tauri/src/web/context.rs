use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crate::error::{FetchError, JobError};
use crate::job::Task;
use crate::store::lock;

use super::protocol::{ContextRequest, DecodedOutput, WorkerMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum AssetEvent {
    Initiate { file: String, name: String },
    Progress { file: String, progress: f32 },
    Done { file: String },
}

impl From<AssetEvent> for WorkerMessage {
    fn from(event: AssetEvent) -> Self {
        match event {
            AssetEvent::Initiate { file, name } => Self::Initiate { file, name },
            AssetEvent::Progress { file, progress } => Self::Progress { file, progress },
            AssetEvent::Done { file } => Self::Done { file },
        }
    }
}

/// Makes the files of a model available locally.
pub trait AssetFetcher: Send + Sync {
    fn fetch(
        &self,
        model: &str,
        quantized: bool,
        abort: &AtomicBool,
        on_event: &mut dyn FnMut(AssetEvent),
    ) -> Result<PathBuf, FetchError>;
}

/// Builds a recognition pipeline from fetched model files.
pub trait PipelineFactory: Send + Sync {
    fn load(
        &self,
        model: &str,
        model_dir: &Path,
        quantized: bool,
    ) -> Result<Box<dyn SpeechPipeline>, String>;
}

pub trait SpeechPipeline: Send {
    /// Decodes 16 kHz mono audio. `on_update` receives the full decoded
    /// output so far each time it grows.
    fn transcribe(
        &mut self,
        audio: &[f32],
        options: &DecodeOptions,
        abort: &AtomicBool,
        on_update: &mut dyn FnMut(DecodedOutput),
    ) -> Result<DecodedOutput, String>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkingPlan {
    pub chunk_length_secs: f32,
    pub stride_secs: f32,
}

impl ChunkingPlan {
    pub fn for_model(model: &str) -> Self {
        if model.starts_with("distil-whisper/") {
            Self {
                chunk_length_secs: 20.0,
                stride_secs: 3.0,
            }
        } else {
            Self {
                chunk_length_secs: 30.0,
                stride_secs: 5.0,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOptions {
    pub language: Option<String>,
    pub task: Task,
    pub chunking: ChunkingPlan,
}

struct CachedPipeline {
    model: String,
    quantized: bool,
    pipeline: Box<dyn SpeechPipeline>,
}

/// Keeps the last loaded pipeline between attempts. A request for another
/// model or quantization disposes it.
#[derive(Default)]
pub struct PipelineCache {
    slot: Mutex<Option<CachedPipeline>>,
}

impl PipelineCache {
    fn take(&self, model: &str, quantized: bool) -> Option<Box<dyn SpeechPipeline>> {
        let cached = lock(&self.slot).take()?;
        if cached.model == model && cached.quantized == quantized {
            Some(cached.pipeline)
        } else {
            log::info!("Disposing cached pipeline for {}", cached.model);
            None
        }
    }

    fn put(&self, model: &str, quantized: bool, pipeline: Box<dyn SpeechPipeline>) {
        *lock(&self.slot) = Some(CachedPipeline {
            model: model.to_string(),
            quantized,
            pipeline,
        });
    }

    pub fn is_loaded(&self, model: &str) -> bool {
        lock(&self.slot)
            .as_ref()
            .is_some_and(|cached| cached.model == model)
    }
}

/// Everything a background context needs to serve a request.
#[derive(Clone)]
pub struct Recognizer {
    fetcher: Arc<dyn AssetFetcher>,
    factory: Arc<dyn PipelineFactory>,
    cache: Arc<PipelineCache>,
}

impl Recognizer {
    pub fn new(fetcher: Arc<dyn AssetFetcher>, factory: Arc<dyn PipelineFactory>) -> Self {
        Self {
            fetcher,
            factory,
            cache: Arc::new(PipelineCache::default()),
        }
    }

    pub fn cache(&self) -> &PipelineCache {
        &self.cache
    }
}

/// An isolated thread that serves one request and posts [`WorkerMessage`]s
/// back. Terminating it stops all further messages.
pub struct BackgroundContext {
    requests: Option<Sender<ContextRequest>>,
    abort: Arc<AtomicBool>,
}

impl BackgroundContext {
    pub fn spawn(recognizer: Recognizer) -> io::Result<(Self, Receiver<WorkerMessage>)> {
        let (request_tx, request_rx) = mpsc::channel();
        let (message_tx, message_rx) = mpsc::channel();
        let abort = Arc::new(AtomicBool::new(false));

        let outbox = Outbox {
            messages: message_tx,
            abort: abort.clone(),
        };
        thread::Builder::new()
            .name("transcription-context".to_string())
            .spawn(move || run_context(request_rx, outbox, recognizer))?;

        let context = Self {
            requests: Some(request_tx),
            abort,
        };
        Ok((context, message_rx))
    }

    pub fn post(&self, request: ContextRequest) -> bool {
        self.requests
            .as_ref()
            .is_some_and(|tx| tx.send(request).is_ok())
    }

    pub fn terminate(self) {
        log::info!("Terminating transcription context");
    }
}

impl Drop for BackgroundContext {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::SeqCst);
        self.requests.take();
    }
}

struct Outbox {
    messages: Sender<WorkerMessage>,
    abort: Arc<AtomicBool>,
}

impl Outbox {
    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn post(&self, message: WorkerMessage) {
        if !self.aborted() {
            let _ = self.messages.send(message);
        }
    }
}

fn run_context(requests: Receiver<ContextRequest>, outbox: Outbox, recognizer: Recognizer) {
    let Ok(request) = requests.recv() else {
        return;
    };

    let started = Instant::now();
    match serve(&request, &recognizer, &outbox) {
        Ok(Some(output)) => {
            log::info!(
                "Context finished {} chunks in {:?}",
                output.chunks.len(),
                started.elapsed()
            );
            outbox.post(WorkerMessage::Complete { data: output });
        }
        Ok(None) => log::info!("Context aborted after {:?}", started.elapsed()),
        Err(message) => {
            log::error!("Context failed: {message}");
            outbox.post(WorkerMessage::Error { data: message });
        }
    }
}

fn serve(
    request: &ContextRequest,
    recognizer: &Recognizer,
    outbox: &Outbox,
) -> Result<Option<DecodedOutput>, String> {
    let model = request.model.as_str();
    let mut pipeline = match recognizer.cache.take(model, request.quantized) {
        Some(pipeline) => pipeline,
        None => {
            let fetched = recognizer.fetcher.fetch(
                model,
                request.quantized,
                &outbox.abort,
                &mut |event| outbox.post(event.into()),
            );
            let model_dir = match fetched {
                Ok(dir) => dir,
                Err(FetchError::Aborted) => return Ok(None),
                Err(err) => {
                    log::error!("Model download failed for {model}: {err}");
                    return Err(err.user_message().to_string());
                }
            };
            if outbox.aborted() {
                return Ok(None);
            }
            recognizer
                .factory
                .load(model, &model_dir, request.quantized)
                .map_err(|e| JobError::ModelLoad(e).to_string())?
        }
    };
    outbox.post(WorkerMessage::Ready);

    let options = DecodeOptions {
        language: request.language.clone(),
        task: request.task,
        chunking: ChunkingPlan::for_model(model),
    };
    let result = pipeline.transcribe(&request.audio, &options, &outbox.abort, &mut |output| {
        outbox.post(WorkerMessage::Update {
            data: (output.text.clone(), output),
        })
    });

    if outbox.aborted() {
        return Ok(None);
    }
    recognizer.cache.put(model, request.quantized, pipeline);
    result.map(Some)
}
