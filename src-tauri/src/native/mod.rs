//! Host-engine backend: requests go out through [`HostEngine`], progress and
//! results come back as [`EngineEvent`] notifications.

mod events;
mod sidecar;

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde::Serialize;

use crate::config::AdapterSettings;
use crate::error::{EngineError, JobError};
use crate::identity::{resume_decision, ResumeDecision, NATIVE_RESUMABLE};
use crate::job::{
    AudioRef, Job, JobIdentity, JobRequest, JobStatus, ModelRef, StartOutcome,
    TranscriptionOptions,
};
use crate::segments::{self, SegmentAssembler, TimeUnit};
use crate::store::{lock, JobStore};

pub use events::{EngineEvent, EngineSegment, EventBus, Subscription};
pub use sidecar::SidecarEngine;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadModelRequest {
    pub model_path: PathBuf,
    pub use_gpu: bool,
    pub gpu_device: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeRequest {
    pub audio_path: PathBuf,
    #[serde(flatten)]
    pub options: TranscriptionOptions,
}

/// A speech engine living outside this crate.
///
/// `transcribe` may return as soon as the job is accepted or block until it
/// ends; either way the outcome is reported through the event stream.
pub trait HostEngine: Send + Sync {
    fn load_model(&self, request: &LoadModelRequest) -> Result<(), EngineError>;
    fn transcribe(&self, request: &TranscribeRequest) -> Result<(), EngineError>;
    fn cancel(&self) -> Result<(), EngineError>;
    fn subscribe(&self) -> Subscription;
}

#[derive(Default)]
struct Control {
    generation: u64,
    active: bool,
    cancel_requested: bool,
}

pub struct NativeAdapter {
    engine: Arc<dyn HostEngine>,
    store: Arc<JobStore>,
    settings: AdapterSettings,
    control: Arc<Mutex<Control>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    start_lock: Mutex<()>,
}

impl NativeAdapter {
    pub fn new(
        engine: Arc<dyn HostEngine>,
        store: Arc<JobStore>,
        settings: AdapterSettings,
    ) -> Self {
        Self {
            engine,
            store,
            settings,
            control: Arc::new(Mutex::new(Control::default())),
            driver: Mutex::new(None),
            start_lock: Mutex::new(()),
        }
    }

    pub fn start(&self, request: &JobRequest) -> StartOutcome {
        let _guard = lock(&self.start_lock);
        let identity = &request.identity;

        if let ResumeDecision::Resume(job) =
            resume_decision(&self.store, identity, NATIVE_RESUMABLE)
        {
            return StartOutcome::Resumed(job);
        }

        if self.is_active() {
            log::info!("Dropping the running host-engine attempt for a new one");
            self.abandon();
        }
        self.join_driver();

        let generation = {
            let mut control = lock(&self.control);
            control.generation += 1;
            control.active = true;
            control.cancel_requested = false;
            self.store.set_state(Job::loading(identity));
            control.generation
        };

        let (load, transcribe) = match build_requests(request) {
            Ok(requests) => requests,
            Err(err) => return self.fail_start(generation, identity, err),
        };

        log::info!(
            "Starting host-engine transcription of {} with {}",
            transcribe.audio_path.display(),
            load.model_path.display()
        );

        let subscription = self.engine.subscribe();
        let driver = Driver {
            engine: self.engine.clone(),
            store: self.store.clone(),
            control: self.control.clone(),
            settings: self.settings,
            generation,
            identity: identity.clone(),
        };
        let spawned = thread::Builder::new()
            .name("host-engine-driver".to_string())
            .spawn(move || driver.run(subscription, load, transcribe));

        match spawned {
            Ok(handle) => {
                *lock(&self.driver) = Some(handle);
                StartOutcome::Started
            }
            Err(err) => self.fail_start(generation, identity, JobError::Io(err)),
        }
    }

    /// Asks the engine to stop. `Ok(false)` when nothing is running.
    pub fn cancel(&self) -> Result<bool, EngineError> {
        {
            let mut control = lock(&self.control);
            if !control.active {
                return Ok(false);
            }
            control.cancel_requested = true;
        }
        log::info!("Requesting host-engine cancellation");
        self.engine.cancel()?;
        Ok(true)
    }

    /// Stops tracking the running attempt and asks the engine to drop it.
    pub fn abandon(&self) {
        if self.detach() {
            if let Err(err) = self.engine.cancel() {
                log::warn!("Host engine did not accept cancellation: {err}");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.control).active
    }

    fn join_driver(&self) {
        if let Some(handle) = lock(&self.driver).take() {
            if handle.join().is_err() {
                log::error!("Host-engine driver thread panicked");
            }
        }
    }

    fn detach(&self) -> bool {
        let mut control = lock(&self.control);
        control.generation += 1;
        std::mem::replace(&mut control.active, false)
    }

    fn fail_start(&self, generation: u64, identity: &JobIdentity, err: JobError) -> StartOutcome {
        log::error!("Host-engine transcription could not start: {err}");
        let message = err.to_string();
        let mut control = lock(&self.control);
        if control.generation == generation {
            control.active = false;
            self.store.set_state(Job::failed(identity, message.clone()));
        }
        StartOutcome::Failed(message)
    }
}

impl Drop for NativeAdapter {
    fn drop(&mut self) {
        self.detach();
        self.join_driver();
    }
}

fn build_requests(
    request: &JobRequest,
) -> Result<(LoadModelRequest, TranscribeRequest), JobError> {
    request.options.validate()?;

    let ModelRef::Path { path: model_path } = &request.identity.model else {
        return Err(JobError::InvalidRequest(
            "the host engine needs a model file path".to_string(),
        ));
    };
    let AudioRef::Path { path: audio_path } = &request.identity.audio else {
        return Err(JobError::InvalidRequest(
            "the host engine needs an audio file path".to_string(),
        ));
    };

    let load = LoadModelRequest {
        model_path: model_path.clone(),
        use_gpu: request.options.use_gpu,
        gpu_device: request.options.gpu_device,
    };
    let transcribe = TranscribeRequest {
        audio_path: audio_path.clone(),
        options: request.options.clone(),
    };
    Ok((load, transcribe))
}

enum Step {
    ModelLoaded(Result<(), EngineError>),
    TranscribeReturned(Result<(), EngineError>),
}

enum Flow {
    Continue,
    Finished,
}

/// Owns one attempt: issues the requests and folds events into the job record.
struct Driver {
    engine: Arc<dyn HostEngine>,
    store: Arc<JobStore>,
    control: Arc<Mutex<Control>>,
    settings: AdapterSettings,
    generation: u64,
    identity: JobIdentity,
}

impl Driver {
    fn run(
        self,
        subscription: Subscription,
        load: LoadModelRequest,
        transcribe: TranscribeRequest,
    ) {
        let started = Instant::now();
        let (steps_tx, steps) = mpsc::channel();
        let (proceed, proceed_rx) = mpsc::channel();
        let requests = spawn_requests(self.engine.clone(), load, transcribe, steps_tx, proceed_rx);
        if let Err(err) = requests {
            let mut job = Job::loading(&self.identity);
            job.fail(JobError::Io(err).to_string());
            self.commit(&job, true);
            return;
        }

        let mut job = Job::loading(&self.identity);
        let mut assembler = SegmentAssembler::new();
        let mut proceed = Some(proceed);
        let mut last_activity = Instant::now();

        loop {
            if !self.is_current() {
                log::debug!("Host-engine driver detached");
                break;
            }

            match steps.try_recv() {
                Ok(step) => {
                    last_activity = Instant::now();
                    if let Flow::Finished = self.apply_step(step, &mut job, proceed.take()) {
                        break;
                    }
                    continue;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }

            match subscription.recv_timeout(self.settings.poll_interval) {
                Ok(event) => {
                    last_activity = Instant::now();
                    if let Flow::Finished = self.apply_event(event, &mut job, &mut assembler) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(limit) = self.settings.stall_timeout {
                        if last_activity.elapsed() >= limit {
                            log::error!("Host engine silent for {limit:?}, abandoning attempt");
                            if let Err(err) = self.engine.cancel() {
                                log::warn!("Host engine did not accept cancellation: {err}");
                            }
                            job.fail(JobError::Stalled(limit).to_string());
                            self.commit(&job, true);
                            break;
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let err = JobError::Engine("host engine closed its event stream".into());
                    job.fail(err.to_string());
                    self.commit(&job, true);
                    break;
                }
            }
        }

        drop(subscription);
        log::info!(
            "Host-engine attempt for {} ended as {:?} after {:?}",
            self.identity.audio.display_name(),
            job.status,
            started.elapsed()
        );
    }

    fn apply_step(&self, step: Step, job: &mut Job, proceed: Option<Sender<()>>) -> Flow {
        match step {
            Step::ModelLoaded(Ok(())) => {
                if lock(&self.control).cancel_requested {
                    log::info!("Cancelled while the model was loading");
                    job.cancel();
                    self.commit(job, true);
                    return Flow::Finished;
                }
                job.set_status(JobStatus::Transcribing);
                if !self.commit(job, false) {
                    return Flow::Finished;
                }
                if let Some(proceed) = proceed {
                    let _ = proceed.send(());
                }
                Flow::Continue
            }
            Step::ModelLoaded(Err(err)) => {
                log::error!("Host engine failed to load model: {err}");
                job.fail(JobError::ModelLoad(err.to_string()).to_string());
                self.commit(job, true);
                Flow::Finished
            }
            Step::TranscribeReturned(Ok(())) => Flow::Continue,
            Step::TranscribeReturned(Err(err)) => {
                log::error!("Host engine rejected transcription: {err}");
                job.fail(err.to_string());
                self.commit(job, true);
                Flow::Finished
            }
        }
    }

    fn apply_event(
        &self,
        event: EngineEvent,
        job: &mut Job,
        assembler: &mut SegmentAssembler,
    ) -> Flow {
        // Nothing of ours is in flight before the transcribe request goes out.
        if job.status == JobStatus::LoadingModel {
            log::debug!("Ignoring host-engine event left over from an earlier attempt");
            return Flow::Continue;
        }
        match event {
            EngineEvent::Progress(progress) => {
                job.set_progress(progress.max(job.progress));
                self.commit(job, false);
                Flow::Continue
            }
            EngineEvent::NewSegment(raw) => {
                let segment = segments::normalize(
                    raw.start as f64,
                    Some(raw.end as f64),
                    &raw.text,
                    TimeUnit::Centiseconds,
                );
                if assembler.append(segment) {
                    job.segments = assembler.segments().to_vec();
                    self.commit(job, false);
                }
                Flow::Continue
            }
            EngineEvent::Completed => {
                job.finish(assembler.segments().to_vec());
                if self.commit(job, true) {
                    self.store.remember_session(job.segments.clone());
                }
                Flow::Finished
            }
            EngineEvent::Failed(message) => {
                log::error!("Host engine reported failure: {message}");
                job.fail(JobError::Engine(message).to_string());
                self.commit(job, true);
                Flow::Finished
            }
            EngineEvent::Cancelled => {
                job.cancel();
                self.commit(job, true);
                Flow::Finished
            }
        }
    }

    fn is_current(&self) -> bool {
        lock(&self.control).generation == self.generation
    }

    /// Writes the record if this attempt is still the current one.
    fn commit(&self, job: &Job, last: bool) -> bool {
        let mut control = lock(&self.control);
        if control.generation != self.generation {
            return false;
        }
        if last {
            control.active = false;
        }
        self.store.set_state(job.clone());
        true
    }
}

fn spawn_requests(
    engine: Arc<dyn HostEngine>,
    load: LoadModelRequest,
    transcribe: TranscribeRequest,
    steps: Sender<Step>,
    proceed: Receiver<()>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("host-engine-requests".to_string())
        .spawn(move || {
            let loaded = engine.load_model(&load);
            let ok = loaded.is_ok();
            if steps.send(Step::ModelLoaded(loaded)).is_err() || !ok {
                return;
            }
            if proceed.recv().is_err() {
                return;
            }
            let _ = steps.send(Step::TranscribeReturned(engine.transcribe(&transcribe)));
        })
}
