//! Facade over the two backends and the shared job record.

use std::sync::{Arc, Mutex};

use crate::config::{BackendKind, OrchestratorConfig};
use crate::error::{AppError, JobError};
use crate::job::{Job, JobRequest, Segment, StartOutcome};
use crate::native::{NativeAdapter, SidecarEngine};
use crate::store::{lock, JobStore, JsonFileStorage};
use crate::web::{DownloadAsset, HubFetcher, PipelineFactory, Recognizer, WebAdapter};

pub struct Orchestrator {
    store: Arc<JobStore>,
    native: Option<NativeAdapter>,
    in_process: Option<WebAdapter>,
    default_backend: BackendKind,
    active: Mutex<Option<BackendKind>>,
}

impl Orchestrator {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self {
            store,
            native: None,
            in_process: None,
            default_backend: BackendKind::Native,
            active: Mutex::new(None),
        }
    }

    /// Wires the backends described by `config`. The in-process backend is
    /// only available when a pipeline factory is supplied.
    pub fn from_config(
        config: &OrchestratorConfig,
        factory: Option<Arc<dyn PipelineFactory>>,
    ) -> Result<Self, AppError> {
        let store = Arc::new(JobStore::open(JsonFileStorage::new(&config.state_path)));
        Self::from_config_with_store(config, store, factory)
    }

    pub fn from_config_with_store(
        config: &OrchestratorConfig,
        store: Arc<JobStore>,
        factory: Option<Arc<dyn PipelineFactory>>,
    ) -> Result<Self, AppError> {
        let mut orchestrator = Self::new(store.clone()).with_default_backend(config.backend);

        if let Some(path) = &config.host_engine_path {
            let engine = SidecarEngine::new(path, config.request_timeout)
                .with_args(config.host_engine_args.iter().cloned());
            orchestrator = orchestrator.with_native(NativeAdapter::new(
                Arc::new(engine),
                store.clone(),
                config.adapter,
            ));
        }
        if let Some(factory) = factory {
            let recognizer =
                Recognizer::new(Arc::new(HubFetcher::new(&config.model_cache_dir)), factory);
            orchestrator =
                orchestrator.with_in_process(WebAdapter::new(store, recognizer, config.adapter));
        }

        if !orchestrator.has_backend(config.backend) {
            return Err(AppError::Config(format!(
                "backend {:?} is not configured",
                config.backend
            )));
        }
        Ok(orchestrator)
    }

    pub fn with_native(mut self, adapter: NativeAdapter) -> Self {
        self.native = Some(adapter);
        self
    }

    pub fn with_in_process(mut self, adapter: WebAdapter) -> Self {
        self.in_process = Some(adapter);
        self
    }

    pub fn with_default_backend(mut self, backend: BackendKind) -> Self {
        self.default_backend = backend;
        self
    }

    pub fn has_backend(&self, backend: BackendKind) -> bool {
        match backend {
            BackendKind::Native => self.native.is_some(),
            BackendKind::InProcess => self.in_process.is_some(),
        }
    }

    pub fn start(&self, request: &JobRequest) -> StartOutcome {
        self.start_with(self.default_backend, request)
    }

    pub fn start_with(&self, backend: BackendKind, request: &JobRequest) -> StartOutcome {
        let other = backend.other();
        if self.is_running(other) {
            let identity = &request.identity;
            if let Some(job) = self
                .store
                .match_or_null(&identity.audio, &identity.model)
                .filter(|job| job.status.is_active())
            {
                return StartOutcome::Resumed(job);
            }
            log::info!("Abandoning the running {other:?} attempt before starting on {backend:?}");
            self.abandon(other);
        }

        let outcome = match backend {
            BackendKind::Native => self.native.as_ref().map(|adapter| adapter.start(request)),
            BackendKind::InProcess => self
                .in_process
                .as_ref()
                .map(|adapter| adapter.start(request)),
        };

        match outcome {
            Some(outcome) => {
                if outcome == StartOutcome::Started {
                    *lock(&self.active) = Some(backend);
                }
                outcome
            }
            None => {
                let err =
                    JobError::InvalidRequest(format!("backend {backend:?} is not configured"));
                log::error!("{err}");
                self.store
                    .set_state(Job::failed(&request.identity, err.to_string()));
                StartOutcome::Failed(err.to_string())
            }
        }
    }

    /// Cancels the running attempt. Returns whether a cancellation was issued.
    pub fn cancel(&self) -> bool {
        let active = *lock(&self.active);
        match active {
            Some(BackendKind::Native) => match self.native.as_ref().map(NativeAdapter::cancel) {
                Some(Ok(issued)) => issued,
                Some(Err(err)) => {
                    log::error!("Failed to cancel host-engine transcription: {err}");
                    false
                }
                None => false,
            },
            Some(BackendKind::InProcess) => self
                .in_process
                .as_ref()
                .is_some_and(WebAdapter::cancel),
            None => false,
        }
    }

    pub fn is_running(&self, backend: BackendKind) -> bool {
        match backend {
            BackendKind::Native => self.native.as_ref().is_some_and(NativeAdapter::is_active),
            BackendKind::InProcess => self.in_process.as_ref().is_some_and(WebAdapter::is_active),
        }
    }

    fn abandon(&self, backend: BackendKind) {
        match backend {
            BackendKind::Native => {
                if let Some(adapter) = &self.native {
                    adapter.abandon();
                }
            }
            BackendKind::InProcess => {
                if let Some(adapter) = &self.in_process {
                    adapter.abandon();
                }
            }
        }
    }

    pub fn state(&self) -> Option<Job> {
        self.store.get_state()
    }

    /// Drops any running attempt and forgets the stored job.
    pub fn clear(&self) {
        self.abandon(BackendKind::Native);
        self.abandon(BackendKind::InProcess);
        *lock(&self.active) = None;
        self.store.clear();
    }

    pub fn session_segments(&self) -> Option<Vec<Segment>> {
        self.store.session_segments()
    }

    pub fn downloads(&self) -> Vec<DownloadAsset> {
        self.in_process
            .as_ref()
            .map(WebAdapter::downloads)
            .unwrap_or_default()
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }
}
