use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use transcript_runner_lib::config::AdapterSettings;
use transcript_runner_lib::error::EngineError;
use transcript_runner_lib::job::{
    AudioRef, Job, JobIdentity, JobRequest, JobStatus, ModelRef, Segment, StartOutcome,
};
use transcript_runner_lib::native::{
    EventBus, HostEngine, LoadModelRequest, NativeAdapter, Subscription, TranscribeRequest,
};
use transcript_runner_lib::store::{JobStore, JsonFileStorage};

fn temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("transcript-runner-{label}-{nanos}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn identity(audio: &str, model: &str) -> JobIdentity {
    JobIdentity::new(AudioRef::path(audio), ModelRef::path(model))
}

fn transcribing(identity: &JobIdentity, progress: f32) -> Job {
    let mut job = Job::loading(identity);
    job.set_status(JobStatus::Transcribing);
    job.set_progress(progress);
    job.segments = vec![Segment::new(0.0, 2.5, "persisted words")];
    job
}

/// Counts calls and never emits anything.
struct IdleEngine {
    bus: Arc<EventBus>,
    calls: AtomicUsize,
}

impl HostEngine for IdleEngine {
    fn load_model(&self, _request: &LoadModelRequest) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn transcribe(&self, _request: &TranscribeRequest) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cancel(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }
}

#[test]
fn job_record_survives_reopen() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = temp_dir("reopen").join("job.json");
    let job = transcribing(&identity("/a.wav", "/m.bin"), 42.0);

    {
        let store = JobStore::open(JsonFileStorage::new(&path));
        store.set_state(job.clone());
    }

    let reopened = JobStore::open(JsonFileStorage::new(&path));
    assert_eq!(reopened.get_state(), Some(job));
    assert_eq!(reopened.session_segments(), None);
}

#[test]
fn persisted_in_progress_job_is_resumed_after_restart() {
    let path = temp_dir("resume").join("job.json");
    let identity = identity("/recordings/lecture.mp3", "/models/ggml-small.bin");
    JobStore::open(JsonFileStorage::new(&path)).set_state(transcribing(&identity, 42.0));

    let store = Arc::new(JobStore::open(JsonFileStorage::new(&path)));
    let engine = Arc::new(IdleEngine {
        bus: EventBus::new(),
        calls: AtomicUsize::new(0),
    });
    let adapter = NativeAdapter::new(engine.clone(), store.clone(), AdapterSettings::default());

    let request = JobRequest::new(identity.audio.clone(), identity.model.clone());
    match adapter.start(&request) {
        StartOutcome::Resumed(job) => {
            assert_eq!(job.status, JobStatus::Transcribing);
            assert_eq!(job.progress, 42.0);
        }
        other => panic!("expected resume, got {other:?}"),
    }
    assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    assert!(!adapter.is_active());
}

#[test]
fn match_or_null_only_returns_the_same_pair() {
    let audios = ["/one.wav", "/two.wav"];
    let models = ["/tiny.bin", "/base.bin"];
    let store = JobStore::in_memory();

    for stored_audio in audios {
        for stored_model in models {
            store.set_state(Job::loading(&identity(stored_audio, stored_model)));
            for audio in audios {
                for model in models {
                    let found =
                        store.match_or_null(&AudioRef::path(audio), &ModelRef::path(model));
                    let same = audio == stored_audio && model == stored_model;
                    assert_eq!(
                        found.is_some(),
                        same,
                        "{audio} {model} vs {stored_audio} {stored_model}"
                    );
                }
            }
        }
    }

    store.clear();
    assert!(store
        .match_or_null(&AudioRef::path("/one.wav"), &ModelRef::path("/tiny.bin"))
        .is_none());
}

#[test]
fn clear_removes_the_persisted_record() {
    let path = temp_dir("clear").join("job.json");
    let store = JobStore::open(JsonFileStorage::new(&path));
    store.set_state(Job::loading(&identity("/a.wav", "/m.bin")));
    assert!(path.exists());

    store.clear();
    assert!(!path.exists());
    assert_eq!(JobStore::open(JsonFileStorage::new(&path)).get_state(), None);
}

#[test]
fn unreadable_record_opens_empty() {
    let dir = temp_dir("corrupt");
    let path = dir.join("job.json");
    std::fs::write(&path, "{ not json").expect("write corrupt record");

    let store = JobStore::open(JsonFileStorage::new(&path));
    assert_eq!(store.get_state(), None);
    assert_eq!(
        store.storage_warning().as_deref(),
        Some("The saved transcription could not be read and was discarded.")
    );

    store.set_state(Job::loading(&identity("/a.wav", "/m.bin")));
    assert_eq!(store.storage_warning(), None);
    let reopened = JobStore::open(JsonFileStorage::new(&path));
    assert_eq!(
        reopened.get_state().map(|job| job.status),
        Some(JobStatus::LoadingModel)
    );
}

#[test]
fn out_of_range_progress_is_clamped_on_load() {
    let path = temp_dir("clamp").join("job.json");
    std::fs::write(
        &path,
        r#"{
            "file": {"kind": "path", "path": "/a.wav"},
            "model": {"kind": "path", "path": "/m.bin"},
            "status": "transcribing",
            "progress": 140.0
        }"#,
    )
    .expect("write record");

    let job = JobStore::open(JsonFileStorage::new(&path))
        .get_state()
        .expect("record should load");
    assert_eq!(job.progress, 100.0);
    assert!(job.segments.is_empty());
    assert_eq!(job.error, None);
}

#[test]
fn watchers_see_writes_and_clears() {
    let store = JobStore::in_memory();
    let changes = store.watch();
    let identity = identity("/a.wav", "/m.bin");

    store.set_state(Job::loading(&identity));
    store.update(|job| job.set_progress(12.0));
    store.clear();

    let timeout = Duration::from_secs(1);
    let first = changes.recv_timeout(timeout).unwrap().unwrap();
    assert_eq!(first.status, JobStatus::LoadingModel);
    let second = changes.recv_timeout(timeout).unwrap().unwrap();
    assert_eq!(second.progress, 12.0);
    assert_eq!(changes.recv_timeout(timeout).unwrap(), None);
}
