use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::RANGE;
use reqwest::StatusCode;

use crate::error::FetchError;

use super::context::{AssetEvent, AssetFetcher};

const HUB_BASE_URL: &str = "https://huggingface.co";
const MAX_RETRIES: usize = 3;
const RETRY_BACKOFF_SECS: u64 = 2;

pub fn default_model_cache_dir() -> PathBuf {
    let base = dirs_next::cache_dir()
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("transcript-runner").join("models")
}

/// Files an ONNX whisper export needs.
pub fn model_files(quantized: bool) -> Vec<String> {
    let suffix = if quantized { "_quantized" } else { "" };
    vec![
        "config.json".to_string(),
        "tokenizer.json".to_string(),
        "tokenizer_config.json".to_string(),
        "preprocessor_config.json".to_string(),
        "generation_config.json".to_string(),
        format!("onnx/encoder_model{suffix}.onnx"),
        format!("onnx/decoder_model_merged{suffix}.onnx"),
    ]
}

/// Medium models are fetched without attention outputs to save memory.
pub fn revision_for(model: &str) -> &'static str {
    if model.contains("/whisper-medium") {
        "no_attentions"
    } else {
        "main"
    }
}

/// Downloads model files from the Hugging Face hub into a local cache.
pub struct HubFetcher {
    cache_dir: PathBuf,
    base_url: String,
}

impl HubFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            base_url: HUB_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model_dir(&self, model: &str) -> PathBuf {
        self.cache_dir
            .join(format!("models--{}", model.replace('/', "--")))
            .join(revision_for(model))
    }

    pub fn missing_files(&self, model: &str, quantized: bool) -> Vec<String> {
        let dir = self.model_dir(model);
        model_files(quantized)
            .into_iter()
            .filter(|file| !dir.join(file).exists())
            .collect()
    }
}

impl AssetFetcher for HubFetcher {
    fn fetch(
        &self,
        model: &str,
        quantized: bool,
        abort: &AtomicBool,
        on_event: &mut dyn FnMut(AssetEvent),
    ) -> Result<PathBuf, FetchError> {
        let dir = self.model_dir(model);
        let revision = revision_for(model);
        let client = build_client(model)?;

        for file in model_files(quantized) {
            if abort.load(Ordering::SeqCst) {
                return Err(FetchError::Aborted);
            }

            on_event(AssetEvent::Initiate {
                file: file.clone(),
                name: model.to_string(),
            });

            let dest = dir.join(&file);
            if !dest.exists() {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                let url = format!("{}/{model}/resolve/{revision}/{file}", self.base_url);
                download_asset(&client, &url, &dest, abort, &mut |progress| {
                    on_event(AssetEvent::Progress {
                        file: file.clone(),
                        progress,
                    })
                })?;
            }

            on_event(AssetEvent::Done { file });
        }

        log::info!("Model {model} available at {}", dir.display());
        Ok(dir)
    }
}

fn build_client(model: &str) -> Result<Client, FetchError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(None::<Duration>)
        .build()
        .map_err(|e| FetchError::Request(model.to_string(), e.to_string()))
}

fn download_asset(
    client: &Client,
    url: &str,
    dest: &Path,
    abort: &AtomicBool,
    on_progress: &mut dyn FnMut(f32),
) -> Result<(), FetchError> {
    let tmp = dest.with_extension("download");
    let mut last_err: Option<FetchError> = None;

    for attempt in 1..=MAX_RETRIES {
        log::info!(
            "Downloading model asset to {} from {url} (attempt {attempt}/{MAX_RETRIES})",
            dest.display()
        );

        match try_download_resumable(client, url, &tmp, dest, abort, on_progress) {
            Ok(()) => return Ok(()),
            Err(FetchError::Aborted) => return Err(FetchError::Aborted),
            Err(err) => {
                log::warn!("Download attempt {} failed: {}", attempt, err);
                last_err = Some(err);

                if attempt < MAX_RETRIES {
                    std::thread::sleep(Duration::from_secs(RETRY_BACKOFF_SECS * attempt as u64));
                }
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| FetchError::Request(url.to_string(), "failed to download".into())))
}

fn try_download_resumable(
    client: &Client,
    url: &str,
    tmp: &Path,
    dest: &Path,
    abort: &AtomicBool,
    on_progress: &mut dyn FnMut(f32),
) -> Result<(), FetchError> {
    let current_len = fs::metadata(tmp).map(|m| m.len()).unwrap_or(0);

    let mut request = client.get(url);
    if current_len > 0 {
        request = request.header(RANGE, format!("bytes={current_len}-"));
    }

    let mut response = request
        .send()
        .map_err(|e| FetchError::Request(url.to_string(), e.to_string()))?;

    let status = response.status();
    if status == StatusCode::RANGE_NOT_SATISFIABLE && current_len > 0 {
        log::warn!(
            "Partial download of {url} is not resumable ({current_len} bytes), starting over"
        );
        drop(response);
        fs::remove_file(tmp)?;
        return try_download_resumable(client, url, tmp, dest, abort, on_progress);
    }
    if !status.is_success() {
        return Err(FetchError::Status(url.to_string(), status.as_u16()));
    }
    let resumed = status == StatusCode::PARTIAL_CONTENT;
    let content_len = response.content_length().unwrap_or(0);
    let total_size = if resumed {
        current_len + content_len
    } else {
        content_len
    };

    let mut file = if resumed {
        log::debug!("Resuming download from byte {}", current_len);
        fs::OpenOptions::new().create(true).append(true).open(tmp)?
    } else {
        if current_len > 0 {
            log::warn!(
                "Server does not support resuming or file changed (status {}), restarting download.",
                status
            );
        }
        fs::File::create(tmp)?
    };

    let mut downloaded = if resumed { current_len } else { 0 };
    let mut buffer = [0; 8192];
    report(on_progress, downloaded, total_size);

    loop {
        if abort.load(Ordering::SeqCst) {
            return Err(FetchError::Aborted);
        }

        let bytes_read = response
            .read(&mut buffer)
            .map_err(|e| FetchError::Request(url.to_string(), format!("read failed: {e}")))?;
        if bytes_read == 0 {
            break;
        }

        file.write_all(&buffer[..bytes_read])?;
        downloaded += bytes_read as u64;
        report(on_progress, downloaded, total_size);
    }

    if total_size > 0 && downloaded != total_size {
        return Err(FetchError::Incomplete {
            expected: total_size,
            actual: downloaded,
        });
    }

    fs::rename(tmp, dest)?;
    Ok(())
}

fn report(on_progress: &mut dyn FnMut(f32), downloaded: u64, total: u64) {
    if total > 0 {
        on_progress((downloaded as f64 / total as f64 * 100.0) as f32);
    }
}
