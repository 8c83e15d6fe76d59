use std::sync::Arc;

use tauri::{App, AppHandle, Builder, Emitter, Manager};

use crate::commands;
use crate::config::OrchestratorConfig;
use crate::orchestrator::Orchestrator;
use crate::store::{JobStore, TauriStoreStorage};

const STATE_EVENT: &str = "transcription-state";

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    let context = tauri::generate_context!();

    let app = Builder::default()
        .plugin(
            tauri_plugin_log::Builder::new()
                .targets([
                    tauri_plugin_log::Target::new(tauri_plugin_log::TargetKind::Stdout),
                    tauri_plugin_log::Target::new(tauri_plugin_log::TargetKind::LogDir {
                        file_name: None,
                    }),
                ])
                .rotation_strategy(tauri_plugin_log::RotationStrategy::KeepAll)
                .max_file_size(2_000_000)
                .timezone_strategy(tauri_plugin_log::TimezoneStrategy::UseLocal)
                .level(log::LevelFilter::Info)
                .build(),
        )
        .plugin(tauri_plugin_store::Builder::default().build())
        .setup(setup)
        .invoke_handler(tauri::generate_handler![
            commands::start_transcription,
            commands::cancel_transcription,
            commands::transcription_state,
            commands::clear_transcription,
            commands::session_transcript,
            commands::model_downloads,
            commands::storage_warning,
            commands::export_transcript
        ])
        .build(context)
        .expect("error while running tauri application");

    app.run(|_, _| {});
}

fn setup(app: &mut App) -> Result<(), Box<dyn std::error::Error>> {
    let handle = app.handle().clone();
    let config = OrchestratorConfig::from_env();
    let store = Arc::new(JobStore::open(TauriStoreStorage::new(handle.clone())));

    let orchestrator = match Orchestrator::from_config_with_store(&config, store.clone(), None) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            log::error!("Transcription backend unavailable: {err}");
            Orchestrator::new(store.clone())
        }
    };

    forward_state_changes(handle, &store);
    app.manage(orchestrator);
    Ok(())
}

fn forward_state_changes(app_handle: AppHandle, store: &JobStore) {
    let changes = store.watch();
    std::thread::spawn(move || {
        for job in changes {
            if let Err(err) = app_handle.emit(STATE_EVENT, job) {
                log::error!("Failed to emit {STATE_EVENT} event: {err}");
            }
        }
    });
}
