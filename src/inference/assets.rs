//! Model asset acquisition.
//!
//! Downloading and unpacking archives happens outside this crate; the session
//! only asks whether the assets exist and, when they do not, asks the provider
//! to fetch them and listens to its status text.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::watch;

use crate::error::{GenError, GenResult};

#[async_trait]
pub trait ModelAssets: Send + Sync {
    fn model_exists(&self) -> bool;

    /// Make the model available. Called only when `model_exists` is false.
    async fn download(&self) -> GenResult<()>;

    /// Human readable download status ("Downloading model: 40%").
    fn subscribe(&self) -> watch::Receiver<String>;
}

/// A model directory provisioned by someone else (a setup tool, a package,
/// a volume mount). The model exists when every marker file is present.
pub struct LocalModelDirectory {
    root: PathBuf,
    markers: Vec<PathBuf>,
    status: watch::Sender<String>,
}

impl LocalModelDirectory {
    /// `config.json` is the marker unless others are given.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_markers(root, ["config.json"])
    }

    pub fn with_markers<I, P>(root: impl Into<PathBuf>, markers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let (status, _) = watch::channel(String::new());
        Self {
            root: root.into(),
            markers: markers.into_iter().map(Into::into).collect(),
            status,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn missing(&self) -> Vec<&Path> {
        self.markers
            .iter()
            .filter(|m| !self.root.join(m).exists())
            .map(PathBuf::as_path)
            .collect()
    }
}

#[async_trait]
impl ModelAssets for LocalModelDirectory {
    fn model_exists(&self) -> bool {
        self.missing().is_empty()
    }

    async fn download(&self) -> GenResult<()> {
        let missing = self.missing();
        if missing.is_empty() {
            debug!("Model directory {} is complete", self.root.display());
            return Ok(());
        }
        warn!(
            "Model directory {} is missing {:?}",
            self.root.display(),
            missing
        );
        self.status
            .send_replace("Model files missing. Provision them from the setup screen.".to_string());
        Err(GenError::model_missing("Description")
            .with_context(format!("{} is incomplete", self.root.display())))
    }

    fn subscribe(&self) -> watch::Receiver<String> {
        self.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_marker_reports_model_missing() {
        let dir = tempfile::tempdir().unwrap();
        let assets = LocalModelDirectory::new(dir.path());
        assert!(!assets.model_exists());

        let err = assets.download().await.unwrap_err();
        assert_eq!(err.category(), "model_missing");
        assert!(!assets.subscribe().borrow().is_empty());
    }

    #[tokio::test]
    async fn present_markers_mean_model_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("weights.bin"), b"").unwrap();

        let assets = LocalModelDirectory::with_markers(dir.path(), ["config.json", "weights.bin"]);
        assert!(assets.model_exists());
        assert!(assets.download().await.is_ok());
    }
}
