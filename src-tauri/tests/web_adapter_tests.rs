use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use transcript_runner_lib::config::AdapterSettings;
use transcript_runner_lib::error::FetchError;
use transcript_runner_lib::job::{
    AudioRef, Job, JobRequest, JobStatus, ModelRef, Segment, StartOutcome, Task,
    TranscriptionOptions,
};
use transcript_runner_lib::store::JobStore;
use transcript_runner_lib::web::{
    AssetEvent, AssetFetcher, AssetStatus, DecodeOptions, DecodedOutput, PipelineFactory,
    RecognizedChunk, Recognizer, SpeechPipeline, WebAdapter,
};

const WAIT: Duration = Duration::from_secs(10);
const MODEL: &str = "Xenova/whisper-tiny.en";

/// Emits scripted asset events until its sender is dropped.
struct ScriptedFetcher {
    batches: Mutex<Receiver<Vec<AssetEvent>>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    fn new() -> (Arc<Self>, Sender<Vec<AssetEvent>>) {
        let (tx, rx) = mpsc::channel();
        let fetcher = Arc::new(Self {
            batches: Mutex::new(rx),
            calls: AtomicUsize::new(0),
        });
        (fetcher, tx)
    }

    fn instant() -> Arc<Self> {
        let (fetcher, tx) = Self::new();
        drop(tx);
        fetcher
    }
}

impl AssetFetcher for ScriptedFetcher {
    fn fetch(
        &self,
        _model: &str,
        _quantized: bool,
        abort: &AtomicBool,
        on_event: &mut dyn FnMut(AssetEvent),
    ) -> Result<PathBuf, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let batches = self.batches.lock().unwrap();
        loop {
            if abort.load(Ordering::SeqCst) {
                return Err(FetchError::Aborted);
            }
            match batches.recv_timeout(Duration::from_millis(5)) {
                Ok(batch) => {
                    for event in batch {
                        on_event(event);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(PathBuf::from("/models/fake")),
            }
        }
    }
}

/// Every download fails with a server error.
struct UnreachableHub;

impl AssetFetcher for UnreachableHub {
    fn fetch(
        &self,
        model: &str,
        _quantized: bool,
        _abort: &AtomicBool,
        _on_event: &mut dyn FnMut(AssetEvent),
    ) -> Result<PathBuf, FetchError> {
        Err(FetchError::Status(format!("https://huggingface.co/{model}"), 503))
    }
}

struct ScriptedPipeline {
    updates: Vec<DecodedOutput>,
    gate: Option<Receiver<()>>,
    result: Result<DecodedOutput, String>,
    seen: Arc<Mutex<Vec<DecodeOptions>>>,
}

impl ScriptedPipeline {
    fn completing(result: DecodedOutput) -> Self {
        Self {
            updates: Vec::new(),
            gate: None,
            result: Ok(result),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn with_update(mut self, update: DecodedOutput) -> Self {
        self.updates.push(update);
        self
    }

    fn gated(mut self) -> (Self, Sender<()>) {
        let (tx, rx) = mpsc::channel();
        self.gate = Some(rx);
        (self, tx)
    }
}

impl SpeechPipeline for ScriptedPipeline {
    fn transcribe(
        &mut self,
        _audio: &[f32],
        options: &DecodeOptions,
        abort: &AtomicBool,
        on_update: &mut dyn FnMut(DecodedOutput),
    ) -> Result<DecodedOutput, String> {
        self.seen.lock().unwrap().push(options.clone());
        for update in self.updates.clone() {
            on_update(update);
        }
        if let Some(gate) = &self.gate {
            loop {
                if abort.load(Ordering::SeqCst) {
                    return Err("aborted".to_string());
                }
                match gate.recv_timeout(Duration::from_millis(5)) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
            }
        }
        self.result.clone()
    }
}

struct ScriptedFactory {
    pipeline: Mutex<Option<ScriptedPipeline>>,
    loads: AtomicUsize,
}

impl ScriptedFactory {
    fn new(pipeline: Option<ScriptedPipeline>) -> Arc<Self> {
        Arc::new(Self {
            pipeline: Mutex::new(pipeline),
            loads: AtomicUsize::new(0),
        })
    }
}

impl PipelineFactory for ScriptedFactory {
    fn load(
        &self,
        _model: &str,
        _model_dir: &Path,
        _quantized: bool,
    ) -> Result<Box<dyn SpeechPipeline>, String> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.pipeline
            .lock()
            .unwrap()
            .take()
            .map(|pipeline| Box::new(pipeline) as Box<dyn SpeechPipeline>)
            .ok_or_else(|| "no pipeline available".to_string())
    }
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn settings() -> AdapterSettings {
    AdapterSettings {
        stall_timeout: None,
        poll_interval: Duration::from_millis(5),
    }
}

fn wav_bytes(seconds: f32, sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav writer");
        let frames = (seconds * sample_rate as f32) as usize;
        for i in 0..frames {
            let value = ((i as f32 * 0.05).sin() * 8_000.0) as i16;
            writer.write_sample(value).expect("write sample");
        }
        writer.finalize().expect("finalize wav");
    }
    cursor.into_inner()
}

fn request(handle: u64) -> JobRequest {
    JobRequest::new(
        AudioRef::in_memory(handle, format!("clip-{handle}.wav")),
        ModelRef::remote(MODEL),
    )
    .with_audio_bytes(wav_bytes(2.0, 16_000))
}

fn output(chunks: &[(f64, Option<f64>, &str)]) -> DecodedOutput {
    DecodedOutput::from_chunks(
        chunks
            .iter()
            .map(|(start, end, text)| RecognizedChunk::new(*start, *end, *text))
            .collect(),
    )
}

fn initiate(file: &str) -> AssetEvent {
    AssetEvent::Initiate {
        file: file.to_string(),
        name: MODEL.to_string(),
    }
}

fn progress(file: &str, progress: f32) -> AssetEvent {
    AssetEvent::Progress {
        file: file.to_string(),
        progress,
    }
}

fn wait_for<F>(store: &JobStore, predicate: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(job) = store.get_state().filter(|job| predicate(job)) {
            return job;
        }
        assert!(Instant::now() < deadline, "timed out, last state: {:?}", store.get_state());
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn download_progress_is_averaged_over_loading_assets() {
    init_logger();
    let (fetcher, batches) = ScriptedFetcher::new();
    let factory = ScriptedFactory::new(Some(ScriptedPipeline::completing(output(&[(
        0.0,
        Some(1.0),
        "hello",
    )]))));
    let store = Arc::new(JobStore::in_memory());
    let adapter = WebAdapter::new(store.clone(), Recognizer::new(fetcher, factory), settings());

    assert_eq!(adapter.start(&request(1)), StartOutcome::Started);

    batches
        .send(vec![
            initiate("config.json"),
            initiate("onnx/encoder_model_quantized.onnx"),
            progress("config.json", 40.0),
            progress("onnx/encoder_model_quantized.onnx", 60.0),
        ])
        .unwrap();
    let job = wait_for(&store, |job| job.progress == 50.0);
    assert_eq!(job.status, JobStatus::LoadingModel);

    batches
        .send(vec![AssetEvent::Done {
            file: "config.json".to_string(),
        }])
        .unwrap();
    wait_for(&store, |job| job.progress == 60.0);

    let assets = adapter.downloads();
    assert_eq!(assets.len(), 2);
    assert_eq!(assets[0].status, AssetStatus::Done);
    assert_eq!(assets[1].status, AssetStatus::Loading);

    drop(batches);
    let job = wait_for(&store, |job| job.status == JobStatus::Done);
    assert_eq!(job.progress, 100.0);
    assert_eq!(job.segments, vec![Segment::new(0.0, 1.0, "hello")]);
}

#[test]
fn partial_output_estimates_progress_below_completion() {
    let (pipeline, release) = ScriptedPipeline::completing(output(&[
        (0.0, Some(1.0), "hello"),
        (1.0, Some(2.0), " world"),
    ]))
    .with_update(output(&[(0.0, Some(1.0), "hello"), (1.0, Some(5.0), " wor")]))
    .gated();
    let store = Arc::new(JobStore::in_memory());
    let adapter = WebAdapter::new(
        store.clone(),
        Recognizer::new(ScriptedFetcher::instant(), ScriptedFactory::new(Some(pipeline))),
        settings(),
    );

    adapter.start(&request(1));
    let job = wait_for(&store, |job| job.segments.len() == 2);
    assert_eq!(job.status, JobStatus::Transcribing);
    assert_eq!(job.progress, 99.0);
    assert_eq!(job.segments[1].text, "wor");

    release.send(()).unwrap();
    let job = wait_for(&store, |job| job.status == JobStatus::Done);
    assert_eq!(job.progress, 100.0);
    assert_eq!(
        job.segments,
        vec![Segment::new(0.0, 1.0, "hello"), Segment::new(1.0, 2.0, "world")]
    );
    assert_eq!(store.session_segments(), Some(job.segments));
    assert!(!adapter.is_active());
}

#[test]
fn decode_options_follow_the_request() {
    let pipeline = ScriptedPipeline::completing(DecodedOutput::default());
    let seen = pipeline.seen.clone();
    let store = Arc::new(JobStore::in_memory());
    let adapter = WebAdapter::new(
        store.clone(),
        Recognizer::new(ScriptedFetcher::instant(), ScriptedFactory::new(Some(pipeline))),
        settings(),
    );

    let options = TranscriptionOptions {
        language: "fr".to_string(),
        translate: true,
        ..TranscriptionOptions::default()
    };
    let request = JobRequest::new(
        AudioRef::in_memory(7, "french.wav"),
        ModelRef::remote("distil-whisper/distil-small.en"),
    )
    .with_options(options)
    .with_audio_bytes(wav_bytes(1.0, 16_000));

    adapter.start(&request);
    wait_for(&store, |job| job.status == JobStatus::Done);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].language.as_deref(), Some("fr"));
    assert_eq!(seen[0].task, Task::Translate);
    assert_eq!(seen[0].chunking.chunk_length_secs, 20.0);
    assert_eq!(seen[0].chunking.stride_secs, 3.0);
}

#[test]
fn cancel_terminates_and_keeps_partial_output() {
    let (pipeline, _release) = ScriptedPipeline::completing(DecodedOutput::default())
        .with_update(output(&[(0.0, Some(0.5), "partial")]))
        .gated();
    let store = Arc::new(JobStore::in_memory());
    let adapter = WebAdapter::new(
        store.clone(),
        Recognizer::new(ScriptedFetcher::instant(), ScriptedFactory::new(Some(pipeline))),
        settings(),
    );

    assert!(!adapter.cancel());
    adapter.start(&request(1));
    let before = wait_for(&store, |job| !job.segments.is_empty());

    assert!(adapter.cancel());
    let job = store.get_state().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.progress, before.progress);
    assert_eq!(job.segments, before.segments);
    assert!(!adapter.is_active());
    assert!(!adapter.cancel());

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(store.get_state().unwrap().status, JobStatus::Cancelled);

    assert!(matches!(adapter.start(&request(1)), StartOutcome::Resumed(_)));
}

#[test]
fn pipeline_error_is_stored_verbatim() {
    let pipeline = ScriptedPipeline {
        result: Err("out of memory".to_string()),
        ..ScriptedPipeline::completing(DecodedOutput::default())
    }
    .with_update(output(&[(0.0, Some(0.5), "partial")]));
    let store = Arc::new(JobStore::in_memory());
    let adapter = WebAdapter::new(
        store.clone(),
        Recognizer::new(ScriptedFetcher::instant(), ScriptedFactory::new(Some(pipeline))),
        settings(),
    );

    adapter.start(&request(1));
    let job = wait_for(&store, |job| job.status == JobStatus::Error);
    assert_eq!(job.error.as_deref(), Some("out of memory"));
    assert!(job.segments.is_empty());
    assert_eq!(job.progress, 0.0);
    assert!(!adapter.cancel());
}

#[test]
fn model_load_failure_ends_in_error() {
    let store = Arc::new(JobStore::in_memory());
    let adapter = WebAdapter::new(
        store.clone(),
        Recognizer::new(ScriptedFetcher::instant(), ScriptedFactory::new(None)),
        settings(),
    );

    adapter.start(&request(1));
    let job = wait_for(&store, |job| job.status == JobStatus::Error);
    assert!(job.error.unwrap().contains("no pipeline available"));
}

#[test]
fn undecodable_audio_ends_in_error_off_the_start_path() {
    let factory = ScriptedFactory::new(None);
    let store = Arc::new(JobStore::in_memory());
    let adapter = WebAdapter::new(
        store.clone(),
        Recognizer::new(ScriptedFetcher::instant(), factory.clone()),
        settings(),
    );
    let request = JobRequest::new(AudioRef::in_memory(3, "broken.mp3"), ModelRef::remote(MODEL))
        .with_audio_bytes(b"definitely not audio".to_vec());

    assert_eq!(adapter.start(&request), StartOutcome::Started);
    let job = wait_for(&store, |job| job.status == JobStatus::Error);
    assert!(job.error.unwrap().starts_with("Audio decode error"));
    assert_eq!(factory.loads.load(Ordering::SeqCst), 0);
    assert!(!adapter.is_active());
}

#[test]
fn cancel_is_accepted_while_audio_is_decoding() {
    let (pipeline, _release) = ScriptedPipeline::completing(DecodedOutput::default()).gated();
    let store = Arc::new(JobStore::in_memory());
    let adapter = WebAdapter::new(
        store.clone(),
        Recognizer::new(ScriptedFetcher::instant(), ScriptedFactory::new(Some(pipeline))),
        settings(),
    );
    let request = JobRequest::new(AudioRef::in_memory(5, "long.wav"), ModelRef::remote(MODEL))
        .with_audio_bytes(wav_bytes(120.0, 44_100));

    assert_eq!(adapter.start(&request), StartOutcome::Started);
    assert!(adapter.is_active());
    assert!(adapter.cancel());

    let job = store.get_state().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.segments.is_empty());

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(store.get_state().unwrap().status, JobStatus::Cancelled);
    assert!(!adapter.is_active());
}

#[test]
fn download_failure_is_reported_in_user_terms() {
    let store = Arc::new(JobStore::in_memory());
    let adapter = WebAdapter::new(
        store.clone(),
        Recognizer::new(Arc::new(UnreachableHub), ScriptedFactory::new(None)),
        settings(),
    );

    adapter.start(&request(1));
    let job = wait_for(&store, |job| job.status == JobStatus::Error);
    let error = job.error.unwrap();
    assert!(error.starts_with("Could not download the speech model"), "{error}");
    assert!(!error.contains("503"));
}

#[test]
fn in_memory_audio_without_bytes_is_rejected() {
    let store = Arc::new(JobStore::in_memory());
    let adapter = WebAdapter::new(
        store.clone(),
        Recognizer::new(ScriptedFetcher::instant(), ScriptedFactory::new(None)),
        settings(),
    );
    let request = JobRequest::new(AudioRef::in_memory(4, "missing.wav"), ModelRef::remote(MODEL));

    match adapter.start(&request) {
        StartOutcome::Failed(message) => assert!(message.contains("missing.wav")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn loaded_pipeline_is_reused_across_attempts() {
    let fetcher = ScriptedFetcher::instant();
    let factory = ScriptedFactory::new(Some(ScriptedPipeline::completing(output(&[(
        0.0,
        Some(1.0),
        "again",
    )]))));
    let store = Arc::new(JobStore::in_memory());
    let adapter = WebAdapter::new(
        store.clone(),
        Recognizer::new(fetcher.clone(), factory.clone()),
        settings(),
    );

    adapter.start(&request(1));
    wait_for(&store, |job| job.status == JobStatus::Done);
    assert!(adapter.recognizer().cache().is_loaded(MODEL));

    assert_eq!(adapter.start(&request(2)), StartOutcome::Started);
    let job = wait_for(&store, |job| {
        job.status == JobStatus::Done && job.audio == AudioRef::in_memory(2, "clip-2.wav")
    });
    assert_eq!(job.segments, vec![Segment::new(0.0, 1.0, "again")]);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(factory.loads.load(Ordering::SeqCst), 1);
}

#[test]
fn silent_context_trips_the_watchdog() {
    let (fetcher, batches) = ScriptedFetcher::new();
    let store = Arc::new(JobStore::in_memory());
    let adapter = WebAdapter::new(
        store.clone(),
        Recognizer::new(fetcher, ScriptedFactory::new(None)),
        AdapterSettings {
            stall_timeout: Some(Duration::from_millis(100)),
            poll_interval: Duration::from_millis(5),
        },
    );

    adapter.start(&request(1));
    let job = wait_for(&store, |job| job.status == JobStatus::Error);
    assert!(job.error.unwrap().contains("stalled"));
    assert!(!adapter.is_active());
    drop(batches);
}
