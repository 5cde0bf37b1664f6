//! Filesystem layout helpers and atomic write operations
//!
//! Manages the .stepchart/ directory: the config file and one record per
//! workflow run. Writes go through a temp file, fsync and rename.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};

use super::RuntimeConfig;

/// Storage manager for runtime persistence
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the directory holding all run records
    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    /// Get the directory holding the runs of one workflow
    pub fn workflow_dir(&self, workflow: &str) -> PathBuf {
        self.runs_dir().join(workflow)
    }

    /// Get the record path of one run
    pub fn run_path(&self, workflow: &str, run_id: &str) -> PathBuf {
        self.workflow_dir(workflow).join(format!("{run_id}.json"))
    }

    /// Write data atomically to a file
    ///
    /// Creates a temporary file, writes the data, syncs, then renames
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

        file.write_all(data)
            .context("Failed to write data")?;

        file.sync_all()
            .context("Failed to sync file")?;

        drop(file);

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new()
                .read(true)
                .open(parent)
                .with_context(|| format!("Failed to open directory: {:?}", parent))?;

            dir.sync_all()
                .context("Failed to sync directory")?;
        }

        Ok(())
    }

    /// Read a file
    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path)
            .with_context(|| format!("Failed to read file: {:?}", path))
    }

    /// Create a directory and all parent directories
    pub fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {:?}", path))
    }

    /// List run ids stored for a workflow, sorted
    pub fn list_runs(&self, workflow: &str) -> Result<Vec<String>> {
        let dir = self.workflow_dir(workflow);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory: {:?}", dir))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    runs.push(stem.to_string());
                }
            }
        }
        runs.sort();

        Ok(runs)
    }
}

/// Initialize storage directories for a new runtime
pub fn init_storage(root: &Path) -> Result<()> {
    let storage = Storage::new(root.to_path_buf());
    storage.create_dir_all(root)?;
    storage.create_dir_all(&storage.runs_dir())?;
    Ok(())
}

/// Write runtime configuration
pub fn write_config(config: &RuntimeConfig) -> Result<()> {
    config.validate()?;
    let storage = Storage::new(config.root.clone());
    let config_path = storage.config_path();

    let json = serde_json::to_vec_pretty(config)
        .context("Failed to serialize config")?;

    storage.write_atomic(&config_path, &json)?;

    Ok(())
}

/// Load runtime configuration
pub fn load_config(root: &Path) -> Result<RuntimeConfig> {
    let storage = Storage::new(root.to_path_buf());
    let config_path = storage.config_path();

    let data = storage.read_file(&config_path)?;
    let config: RuntimeConfig = serde_json::from_slice(&data)
        .context("Failed to deserialize config")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_storage() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        init_storage(root).unwrap();

        assert!(root.join("runs").exists());
    }

    #[test]
    fn test_config_round_trip() {
        let temp = TempDir::new().unwrap();
        let config = RuntimeConfig {
            root: temp.path().to_path_buf(),
            max_microsteps: 64,
            default_retry_delay_ms: 5,
            inspect: true,
        };

        init_storage(&config.root).unwrap();
        write_config(&config).unwrap();
        assert_eq!(load_config(&config.root).unwrap(), config);
    }

    #[test]
    fn test_invalid_config_is_rejected_on_write_and_load() {
        let temp = TempDir::new().unwrap();
        let config = RuntimeConfig {
            root: temp.path().to_path_buf(),
            max_microsteps: 0,
            ..RuntimeConfig::default()
        };
        init_storage(&config.root).unwrap();
        assert!(write_config(&config).is_err());
        assert!(!temp.path().join("config.json").exists());

        fs::write(temp.path().join("config.json"), br#"{"max_microsteps": 0}"#).unwrap();
        let err = load_config(temp.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::runtime::error::RuntimeError>(),
            Some(crate::runtime::error::RuntimeError::Config(_))
        ));
    }

    #[test]
    fn test_list_runs_ignores_temp_files() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());
        storage.create_dir_all(&storage.workflow_dir("orders")).unwrap();
        storage.write_atomic(&storage.run_path("orders", "b"), b"{}").unwrap();
        storage.write_atomic(&storage.run_path("orders", "a"), b"{}").unwrap();
        fs::write(storage.workflow_dir("orders").join("c.tmp"), b"{}").unwrap();

        assert_eq!(storage.list_runs("orders").unwrap(), vec!["a", "b"]);
        assert!(storage.list_runs("missing").unwrap().is_empty());
    }
}
