use tauri::AppHandle;
use tauri_plugin_store::StoreExt;

use crate::error::StoreError;
use crate::job::Job;

use super::JobStorage;

const STORE_PATH: &str = "transcription.json";
const JOB_KEY: &str = "job";

/// Keeps the job record in the app's `tauri-plugin-store` file.
pub struct TauriStoreStorage {
    app: AppHandle,
}

impl TauriStoreStorage {
    pub fn new(app: AppHandle) -> Self {
        Self { app }
    }
}

impl JobStorage for TauriStoreStorage {
    fn load(&self) -> Result<Option<Job>, StoreError> {
        let store = self
            .app
            .store(STORE_PATH)
            .map_err(|e| StoreError::Backend(format!("Failed to open job store: {e}")))?;
        match store.get(JOB_KEY) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn save(&self, job: &Job) -> Result<(), StoreError> {
        let store = self
            .app
            .store(STORE_PATH)
            .map_err(|e| StoreError::Backend(format!("Failed to open job store: {e}")))?;
        store.set(JOB_KEY, serde_json::to_value(job)?);
        store.save().map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn remove(&self) -> Result<(), StoreError> {
        let store = self
            .app
            .store(STORE_PATH)
            .map_err(|e| StoreError::Backend(format!("Failed to open job store: {e}")))?;
        store.delete(JOB_KEY);
        store.save().map_err(|e| StoreError::Backend(e.to_string()))
    }
}
