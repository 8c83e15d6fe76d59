use serde::Deserialize;
use tauri::State;

use crate::config::BackendKind;
use crate::error::{AppError, JobError};
use crate::export::{segments_to_srt, segments_to_text};
use crate::job::{
    AudioRef, Job, JobRequest, JobStatus, ModelRef, Segment, StartOutcome, TranscriptionOptions,
};
use crate::orchestrator::Orchestrator;
use crate::web::DownloadAsset;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTranscriptionArgs {
    pub audio: AudioRef,
    pub model: ModelRef,
    #[serde(default)]
    pub options: TranscriptionOptions,
    #[serde(default)]
    pub backend: Option<BackendKind>,
    #[serde(default)]
    pub audio_bytes: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Text,
    Srt,
}

#[tauri::command]
pub fn start_transcription(
    state: State<'_, Orchestrator>,
    args: StartTranscriptionArgs,
) -> StartOutcome {
    log::info!(
        "Command start_transcription invoked for {}",
        args.audio.display_name()
    );
    let mut request = JobRequest::new(args.audio, args.model).with_options(args.options);
    if let Some(bytes) = args.audio_bytes {
        request = request.with_audio_bytes(bytes);
    }
    match args.backend {
        Some(backend) => state.start_with(backend, &request),
        None => state.start(&request),
    }
}

#[tauri::command]
pub fn cancel_transcription(state: State<'_, Orchestrator>) -> bool {
    state.cancel()
}

#[tauri::command]
pub fn transcription_state(state: State<'_, Orchestrator>) -> Option<Job> {
    state.state()
}

#[tauri::command]
pub fn clear_transcription(state: State<'_, Orchestrator>) {
    state.clear()
}

#[tauri::command]
pub fn session_transcript(state: State<'_, Orchestrator>) -> Option<Vec<Segment>> {
    state.session_segments()
}

#[tauri::command]
pub fn model_downloads(state: State<'_, Orchestrator>) -> Vec<DownloadAsset> {
    state.downloads()
}

#[tauri::command]
pub fn storage_warning(state: State<'_, Orchestrator>) -> Option<String> {
    state.store().storage_warning()
}

#[tauri::command]
pub fn export_transcript(
    state: State<'_, Orchestrator>,
    format: ExportFormat,
) -> Result<String, String> {
    log::info!("Command export_transcript invoked ({format:?})");
    render_transcript(state.state(), format).map_err(|err| {
        log::warn!("Export refused: {err}");
        err.user_message().to_string()
    })
}

fn render_transcript(job: Option<Job>, format: ExportFormat) -> Result<String, AppError> {
    let job = job
        .filter(|job| job.status == JobStatus::Done)
        .ok_or(JobError::NoTranscript)?;

    Ok(match format {
        ExportFormat::Text => segments_to_text(&job.segments),
        ExportFormat::Srt => segments_to_srt(&job.segments),
    })
}
