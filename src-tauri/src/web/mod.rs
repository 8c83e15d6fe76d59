//! In-process backend: the recognition pipeline runs on a background context
//! and reports through status-tagged [`WorkerMessage`]s.

mod context;
mod downloads;
mod hub;
mod protocol;

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crate::audio::{self, PreparedAudio};
use crate::config::AdapterSettings;
use crate::error::JobError;
use crate::identity::{resume_decision, ResumeDecision, IN_PROCESS_RESUMABLE};
use crate::job::{
    AudioRef, Job, JobIdentity, JobRequest, JobStatus, ModelRef, StartOutcome, Task,
};
use crate::segments::SegmentAssembler;
use crate::store::{lock, JobStore};

pub use context::{
    AssetEvent, AssetFetcher, BackgroundContext, ChunkingPlan, DecodeOptions, PipelineCache,
    PipelineFactory, Recognizer, SpeechPipeline,
};
pub use downloads::{AssetStatus, DownloadAsset, DownloadTracker};
pub use hub::{default_model_cache_dir, model_files, revision_for, HubFetcher};
pub use protocol::{ContextRequest, DecodedOutput, RecognizedChunk, WorkerMessage};

/// State of the attempt the adapter is currently driving.
struct Run {
    identity: JobIdentity,
    job: Job,
    downloads: DownloadTracker,
    assembler: SegmentAssembler,
    duration_secs: f64,
}

impl Run {
    fn new(identity: &JobIdentity) -> Self {
        Self {
            identity: identity.clone(),
            job: Job::loading(identity),
            downloads: DownloadTracker::new(),
            assembler: SegmentAssembler::new(),
            duration_secs: 0.0,
        }
    }
}

#[derive(Default)]
struct Slot {
    generation: u64,
    context: Option<BackgroundContext>,
    run: Option<Run>,
}

pub struct WebAdapter {
    store: Arc<JobStore>,
    recognizer: Recognizer,
    settings: AdapterSettings,
    slot: Arc<Mutex<Slot>>,
    start_lock: Mutex<()>,
}

impl WebAdapter {
    pub fn new(store: Arc<JobStore>, recognizer: Recognizer, settings: AdapterSettings) -> Self {
        Self {
            store,
            recognizer,
            settings,
            slot: Arc::new(Mutex::new(Slot::default())),
            start_lock: Mutex::new(()),
        }
    }

    pub fn start(&self, request: &JobRequest) -> StartOutcome {
        let _guard = lock(&self.start_lock);
        let identity = &request.identity;

        if let ResumeDecision::Resume(job) =
            resume_decision(&self.store, identity, IN_PROCESS_RESUMABLE)
        {
            return StartOutcome::Resumed(job);
        }

        let generation = {
            let mut slot = lock(&self.slot);
            if let Some(previous) = slot.context.take() {
                previous.terminate();
            }
            slot.generation += 1;
            let run = Run::new(identity);
            self.store.set_state(run.job.clone());
            slot.run = Some(run);
            slot.generation
        };

        let model = match &identity.model {
            ModelRef::Remote { id } => id.clone(),
            ModelRef::Path { path } => path.to_string_lossy().into_owned(),
        };

        let input = match request
            .options
            .validate()
            .and_then(|()| AudioInput::from_request(request))
        {
            Ok(input) => input,
            Err(err) => return self.fail_start(generation, err),
        };

        let (context, messages) = match BackgroundContext::spawn(self.recognizer.clone()) {
            Ok(spawned) => spawned,
            Err(err) => return self.fail_start(generation, JobError::Io(err)),
        };
        {
            let mut slot = lock(&self.slot);
            if slot.generation != generation {
                return StartOutcome::Started;
            }
            slot.context = Some(context);
        }

        log::info!(
            "Starting in-process transcription of {} with {model}",
            identity.audio.display_name()
        );

        let work = Work {
            input,
            model,
            quantized: request.options.quantized,
            language: request.options.language_code().map(str::to_string),
            task: request.options.task(),
        };
        let pump = Pump {
            store: self.store.clone(),
            slot: self.slot.clone(),
            settings: self.settings,
            generation,
        };
        let spawned = thread::Builder::new()
            .name("transcription-pump".to_string())
            .spawn(move || pump.run(work, messages));
        if let Err(err) = spawned {
            return self.fail_start(generation, JobError::Io(err));
        }

        StartOutcome::Started
    }

    /// Terminates the running context. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        let mut slot = lock(&self.slot);
        let Some(context) = slot.context.take() else {
            return false;
        };
        context.terminate();
        slot.generation += 1;
        if let Some(mut run) = slot.run.take() {
            run.job.cancel();
            log::info!(
                "Cancelled in-process transcription of {} at {:.0}%",
                run.identity.audio.display_name(),
                run.job.progress
            );
            self.store.set_state(run.job);
        }
        true
    }

    /// Drops the running attempt, if any, without touching the stored record.
    pub fn abandon(&self) {
        let mut slot = lock(&self.slot);
        slot.generation += 1;
        slot.run = None;
        if let Some(context) = slot.context.take() {
            context.terminate();
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.slot).context.is_some()
    }

    /// Per-asset model loading progress of the current attempt.
    pub fn downloads(&self) -> Vec<DownloadAsset> {
        lock(&self.slot)
            .run
            .as_ref()
            .map(|run| run.downloads.assets().to_vec())
            .unwrap_or_default()
    }

    pub fn recognizer(&self) -> &Recognizer {
        &self.recognizer
    }

    fn fail_start(&self, generation: u64, err: JobError) -> StartOutcome {
        log::error!("In-process transcription could not start: {err}");
        let message = err.to_string();
        let mut slot = lock(&self.slot);
        if slot.generation == generation {
            if let Some(context) = slot.context.take() {
                context.terminate();
            }
            if let Some(mut run) = slot.run.take() {
                run.job.fail(message.clone());
                self.store.set_state(run.job);
            }
        }
        StartOutcome::Failed(message)
    }
}

impl Drop for WebAdapter {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Audio still to be decoded. Decoding happens on the pump thread so a
/// cancel can land while it runs.
enum AudioInput {
    Encoded(Arc<Vec<u8>>),
    File(PathBuf),
}

impl AudioInput {
    fn from_request(request: &JobRequest) -> Result<Self, JobError> {
        if let Some(bytes) = &request.audio_bytes {
            return Ok(Self::Encoded(bytes.clone()));
        }
        match &request.identity.audio {
            AudioRef::Path { path } => Ok(Self::File(path.clone())),
            AudioRef::InMemory { name, .. } => Err(JobError::InvalidRequest(format!(
                "no audio data supplied for {name}"
            ))),
        }
    }

    fn prepare(&self) -> Result<PreparedAudio, JobError> {
        match self {
            Self::Encoded(bytes) => audio::preprocess(bytes.as_ref().clone()),
            Self::File(path) => audio::preprocess_file(path),
        }
    }
}

/// Everything the context needs once the audio is decoded.
struct Work {
    input: AudioInput,
    model: String,
    quantized: bool,
    language: Option<String>,
    task: Task,
}

/// Moves context messages into the job record for one generation.
struct Pump {
    store: Arc<JobStore>,
    slot: Arc<Mutex<Slot>>,
    settings: AdapterSettings,
    generation: u64,
}

impl Pump {
    fn run(self, work: Work, messages: Receiver<WorkerMessage>) {
        if !self.dispatch(work) {
            return;
        }
        let mut last_activity = Instant::now();

        loop {
            match messages.recv_timeout(self.settings.poll_interval) {
                Ok(message) => {
                    last_activity = Instant::now();
                    if !self.apply(message) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !self.is_current() {
                        break;
                    }
                    if let Some(limit) = self.settings.stall_timeout {
                        if last_activity.elapsed() >= limit {
                            log::error!("Transcription context silent for {limit:?}, terminating");
                            self.finish_with_error(JobError::Stalled(limit).to_string());
                            break;
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.finish_with_error(
                        JobError::Engine("transcription context exited unexpectedly".into())
                            .to_string(),
                    );
                    break;
                }
            }
        }
    }

    /// Decodes the audio and hands the request to the context. Returns
    /// `false` when the attempt ended or was replaced meanwhile.
    fn dispatch(&self, work: Work) -> bool {
        let prepared = match work.input.prepare() {
            Ok(prepared) => prepared,
            Err(err) => {
                log::error!("Audio preparation failed: {err}");
                self.finish_with_error(err.to_string());
                return false;
            }
        };

        let mut slot = lock(&self.slot);
        if slot.generation != self.generation {
            log::debug!("Attempt replaced while its audio was decoding");
            return false;
        }
        if let Some(run) = slot.run.as_mut() {
            run.duration_secs = prepared.duration_secs;
            log::info!(
                "Decoded {} ({:.1}s of audio)",
                run.identity.audio.display_name(),
                prepared.duration_secs
            );
        }
        let request = ContextRequest {
            audio: prepared.samples,
            model: work.model,
            quantized: work.quantized,
            language: work.language,
            task: work.task,
        };
        let posted = slot
            .context
            .as_ref()
            .is_some_and(|context| context.post(request));
        drop(slot);

        if !posted {
            self.finish_with_error(
                JobError::Engine("transcription context is not accepting work".into()).to_string(),
            );
        }
        posted
    }

    fn is_current(&self) -> bool {
        lock(&self.slot).generation == self.generation
    }

    /// Applies one message. Returns `false` once the pump should stop.
    fn apply(&self, message: WorkerMessage) -> bool {
        let mut slot = lock(&self.slot);
        if slot.generation != self.generation {
            return false;
        }
        let Some(run) = slot.run.as_mut() else {
            return false;
        };

        let terminal = match message {
            WorkerMessage::Initiate { file, name } => {
                run.downloads.initiate(&file, &name);
                run.job.set_status(JobStatus::LoadingModel);
                apply_download_progress(run);
                false
            }
            WorkerMessage::Progress { file, progress } => {
                run.downloads.progress(&file, progress);
                apply_download_progress(run);
                false
            }
            WorkerMessage::Done { file } => {
                run.downloads.done(&file);
                apply_download_progress(run);
                false
            }
            WorkerMessage::Ready => {
                run.job.set_status(JobStatus::Transcribing);
                run.job.set_progress(0.0);
                false
            }
            WorkerMessage::Update { data: (_, output) } => {
                run.assembler.replace_all(output.to_segments());
                run.job.set_status(JobStatus::Transcribing);
                run.job.segments = run.assembler.segments().to_vec();
                if let Some(last_end) = run.assembler.last_end() {
                    if run.duration_secs > 0.0 {
                        let estimate = (last_end / run.duration_secs * 100.0) as f32;
                        run.job.set_progress(estimate.min(99.0));
                    }
                }
                false
            }
            WorkerMessage::Complete { data } => {
                run.assembler.replace_all(data.to_segments());
                run.job.finish(run.assembler.segments().to_vec());
                true
            }
            WorkerMessage::Error { data } => {
                log::error!("Transcription context reported failure: {data}");
                run.job.fail(data);
                true
            }
        };

        self.store.set_state(run.job.clone());
        if terminal {
            if run.job.status == JobStatus::Done {
                self.store.remember_session(run.job.segments.clone());
            }
            log::info!(
                "In-process transcription of {} ended as {:?}",
                run.identity.audio.display_name(),
                run.job.status
            );
            slot.context.take();
        }
        !terminal
    }

    fn finish_with_error(&self, message: String) {
        let mut slot = lock(&self.slot);
        if slot.generation != self.generation {
            return;
        }
        if let Some(context) = slot.context.take() {
            context.terminate();
        }
        if let Some(run) = slot.run.as_mut() {
            run.job.fail(message);
            self.store.set_state(run.job.clone());
        }
    }
}

fn apply_download_progress(run: &mut Run) {
    if let Some(aggregate) = run.downloads.aggregate() {
        run.job.set_progress(aggregate);
    }
}
