//! Where the core keeps its files and which backend it talks to.

use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Database and downloaded speech models
    pub data_dir: PathBuf,
    /// Pasted images, fetched pages and transcripts
    pub cache_dir: PathBuf,
    pub ollama_base_url: String,
}

impl CoreConfig {
    /// Platform directories, overridable through `CORRAL_DATA_DIR`,
    /// `CORRAL_CACHE_DIR` and `OLLAMA_BASE_URL`.
    pub fn from_env() -> Self {
        let dirs = directories::ProjectDirs::from("com.local", "Corral", "Corral");
        let data_dir = env::var_os("CORRAL_DATA_DIR")
            .map(PathBuf::from)
            .or_else(|| dirs.as_ref().map(|p| p.data_dir().to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("./data"));
        let cache_dir = env::var_os("CORRAL_CACHE_DIR")
            .map(PathBuf::from)
            .or_else(|| dirs.as_ref().map(|p| p.cache_dir().to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("./cache"));
        let ollama_base_url = env::var("OLLAMA_BASE_URL")
            .unwrap_or_else(|_| providers::ollama::DEFAULT_BASE_URL.to_string());

        Self {
            data_dir,
            cache_dir,
            ollama_base_url,
        }
    }

    /// Config rooted at explicit directories.
    pub fn at(data_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            cache_dir: cache_dir.into(),
            ollama_base_url: providers::ollama::DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.cache_dir.join("images")
    }

    pub fn websites_dir(&self) -> PathBuf {
        self.cache_dir.join("websites")
    }

    pub fn youtube_dir(&self) -> PathBuf {
        self.cache_dir.join("youtube")
    }

    pub fn speech_models_dir(&self) -> PathBuf {
        self.data_dir.join("whisper")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.images_dir(),
            self.websites_dir(),
            self.youtube_dir(),
            self.speech_models_dir(),
        ] {
            create_dir(&dir)?;
        }
        Ok(())
    }
}

fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_dirs_creates_layout() {
        let root = TempDir::new().unwrap();
        let config = CoreConfig::at(root.path().join("data"), root.path().join("cache"));
        config.ensure_dirs().unwrap();

        assert!(config.images_dir().is_dir());
        assert!(config.websites_dir().is_dir());
        assert!(config.youtube_dir().is_dir());
        assert!(config.speech_models_dir().is_dir());
        assert!(config.speech_models_dir().starts_with(root.path().join("data")));
    }
}
