//! Experiment output folders.

use crate::config::{save_config, TrainConfig};
use crate::error::TrainError;
use crate::train::checkpoint::CheckpointManager;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";
pub const SPEAKERS_FILE: &str = "speakers.json";
pub const TEST_AUDIO_DIR: &str = "test_audios";

/// Create `output_path/<run_name>-<date>` (suffixed when it already exists).
pub fn create_experiment_folder(output_path: &Path, run_name: &str) -> Result<PathBuf, TrainError> {
    let date = chrono::Local::now().format("%B-%d-%Y_%I+%M%p");
    let base = format!("{run_name}-{date}");
    let mut path = output_path.join(&base);
    let mut suffix = 1;
    while path.exists() {
        path = output_path.join(format!("{base}-{suffix}"));
        suffix += 1;
    }
    fs::create_dir_all(&path)?;
    tracing::info!("Experiment folder: {}", path.display());
    Ok(path)
}

/// Delete `path` unless it holds at least one checkpoint.
///
/// Returns whether the folder was removed.
pub fn remove_experiment_folder(path: &Path) -> Result<bool, TrainError> {
    if !path.exists() {
        return Ok(false);
    }
    if CheckpointManager::latest_in(path)?.is_some() {
        tracing::info!("Keeping {} (holds checkpoints)", path.display());
        return Ok(false);
    }
    fs::remove_dir_all(path)?;
    tracing::info!("Removed experiment folder {}", path.display());
    Ok(true)
}

/// Copy the run configuration into the experiment folder.
pub fn copy_config(config: &TrainConfig, out_path: &Path, restore_path: Option<&Path>) -> Result<(), TrainError> {
    save_config(config, out_path.join(CONFIG_FILE), restore_path)
        .map_err(|err| TrainError::Config(format!("writing {CONFIG_FILE}: {err:#}")))
}
