//! Job State Store: the single current job record, persisted through a
//! pluggable backend, plus the in-memory session record of the last result.

mod file;
#[cfg(feature = "desktop")]
mod tauri_store;

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::StoreError;
use crate::job::{clamp_progress, AudioRef, Job, ModelRef, Segment};

pub use file::{default_state_path, JsonFileStorage};
#[cfg(feature = "desktop")]
pub use tauri_store::TauriStoreStorage;

/// Durable slot for the job record.
pub trait JobStorage: Send + Sync {
    fn load(&self) -> Result<Option<Job>, StoreError>;
    fn save(&self, job: &Job) -> Result<(), StoreError>;
    fn remove(&self) -> Result<(), StoreError>;
}

/// Keeps the record in memory only.
#[derive(Default)]
pub struct MemoryStorage {
    job: Mutex<Option<Job>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStorage for MemoryStorage {
    fn load(&self) -> Result<Option<Job>, StoreError> {
        Ok(lock(&self.job).clone())
    }

    fn save(&self, job: &Job) -> Result<(), StoreError> {
        *lock(&self.job) = Some(job.clone());
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        *lock(&self.job) = None;
        Ok(())
    }
}

#[derive(Default)]
struct StoreState {
    job: Option<Job>,
    session: Option<Vec<Segment>>,
    storage_warning: Option<String>,
    watchers: Vec<Sender<Option<Job>>>,
}

/// Holds at most one job. Writes replace the whole record (last writer wins)
/// and are written through to storage; storage failures are logged and the
/// in-memory record stays authoritative.
pub struct JobStore {
    storage: Box<dyn JobStorage>,
    state: Mutex<StoreState>,
}

impl JobStore {
    /// Opens the store and rehydrates whatever the backend last saved.
    pub fn open(storage: impl JobStorage + 'static) -> Self {
        let mut storage_warning = None;
        let job = match storage.load() {
            Ok(job) => job.map(Job::normalized),
            Err(err) => {
                log::warn!("Discarding unreadable job record: {err}");
                storage_warning = Some(err.user_message().to_string());
                None
            }
        };
        if let Some(job) = &job {
            log::info!(
                "Restored job for {} with status {:?} ({:.0}%)",
                job.audio.display_name(),
                job.status,
                job.progress
            );
        }

        Self {
            storage: Box::new(storage),
            state: Mutex::new(StoreState {
                job,
                storage_warning,
                ..StoreState::default()
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::open(MemoryStorage::new())
    }

    pub fn set_state(&self, mut job: Job) {
        job.progress = clamp_progress(job.progress);
        let mut state = self.lock_state();
        match self.storage.save(&job) {
            Ok(()) => state.storage_warning = None,
            Err(err) => {
                log::warn!("Failed to persist job record: {err}");
                state.storage_warning = Some(err.user_message().to_string());
            }
        }
        notify(&mut state.watchers, Some(&job));
        state.job = Some(job);
    }

    pub fn get_state(&self) -> Option<Job> {
        self.lock_state().job.clone()
    }

    /// Applies `update` to the current record, if any, and stores the result.
    pub fn update<F>(&self, update: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut job = self.get_state()?;
        update(&mut job);
        self.set_state(job.clone());
        Some(job)
    }

    /// Resets to the empty state and forgets the session record.
    pub fn clear(&self) {
        let mut state = self.lock_state();
        if let Err(err) = self.storage.remove() {
            log::warn!("Failed to remove persisted job record: {err}");
            state.storage_warning = Some(err.user_message().to_string());
        }
        state.job = None;
        state.session = None;
        notify(&mut state.watchers, None);
    }

    /// The stored job when it belongs to the given audio and model, else `None`.
    pub fn match_or_null(&self, audio: &AudioRef, model: &ModelRef) -> Option<Job> {
        self.lock_state()
            .job
            .as_ref()
            .filter(|job| job.matches(audio, model))
            .cloned()
    }

    pub fn remember_session(&self, segments: Vec<Segment>) {
        self.lock_state().session = Some(segments);
    }

    pub fn session_segments(&self) -> Option<Vec<Segment>> {
        self.lock_state().session.clone()
    }

    /// Last persistence problem in user-facing words. Cleared by the next
    /// successful write.
    pub fn storage_warning(&self) -> Option<String> {
        self.lock_state().storage_warning.clone()
    }

    /// Every later write is sent to the returned receiver; `None` marks a clear.
    pub fn watch(&self) -> Receiver<Option<Job>> {
        let (tx, rx) = mpsc::channel();
        self.lock_state().watchers.push(tx);
        rx
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        lock(&self.state)
    }
}

fn notify(watchers: &mut Vec<Sender<Option<Job>>>, job: Option<&Job>) {
    watchers.retain(|tx| tx.send(job.cloned()).is_ok());
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
