use serde::Serialize;

use crate::job::clamp_progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetStatus {
    Loading,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadAsset {
    pub file: String,
    pub name: String,
    pub progress: f32,
    pub status: AssetStatus,
}

/// Per-asset loading progress for the current attempt. Finished assets stay
/// listed but no longer count towards the aggregate.
#[derive(Debug, Clone, Default)]
pub struct DownloadTracker {
    assets: Vec<DownloadAsset>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initiate(&mut self, file: &str, name: &str) {
        let asset = self.entry(file);
        asset.name = name.to_string();
        asset.progress = 0.0;
        asset.status = AssetStatus::Loading;
    }

    pub fn progress(&mut self, file: &str, progress: f32) {
        let asset = self.entry(file);
        if asset.status == AssetStatus::Loading {
            asset.progress = clamp_progress(progress);
        }
    }

    pub fn done(&mut self, file: &str) {
        let asset = self.entry(file);
        asset.progress = 100.0;
        asset.status = AssetStatus::Done;
    }

    /// Mean progress of the assets still loading, or `None` when there are none.
    pub fn aggregate(&self) -> Option<f32> {
        let (sum, count) = self
            .assets
            .iter()
            .filter(|asset| asset.status == AssetStatus::Loading)
            .fold((0.0f32, 0usize), |(sum, count), asset| {
                (sum + asset.progress, count + 1)
            });
        (count > 0).then(|| sum / count as f32)
    }

    pub fn assets(&self) -> &[DownloadAsset] {
        &self.assets
    }

    fn entry(&mut self, file: &str) -> &mut DownloadAsset {
        let index = match self.assets.iter().position(|asset| asset.file == file) {
            Some(index) => index,
            None => {
                self.assets.push(DownloadAsset {
                    file: file.to_string(),
                    name: String::new(),
                    progress: 0.0,
                    status: AssetStatus::Loading,
                });
                self.assets.len() - 1
            }
        };
        &mut self.assets[index]
    }
}
