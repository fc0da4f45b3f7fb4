use crate::error::Result;
use crate::render::RenderOptions;
use log::warn;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Process-wide settings shared by every session worker.
///
/// All fields have defaults, so a config file only needs the keys it wants
/// to change.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory uploaded datasets are read from
    pub upload_dir: PathBuf,

    /// Where remote files are downloaded to; reused when the size matches
    pub remote_cache_dir: PathBuf,

    /// Seconds a worker waits for a request before shutting itself down
    pub idle_timeout_secs: u64,

    /// Whether sessions may be launched from a remote file
    pub remote_fetch_enabled: bool,

    /// Allow `download_subset` to write CSV files for a notebook server
    pub jupyter_export_enabled: bool,

    /// Directory notebook exports are written into
    pub jupyter_export_path: PathBuf,

    /// Rendering thresholds
    pub render: RenderOptions,
}

impl Default for Config {
    /// Creates the default configuration
    ///
    /// # Returns
    /// * `Config` with:
    ///   - uploads under `$TMPDIR/plotplot`, remote cache in its `gdrive` subdirectory
    ///   - a 26 hour idle timeout
    ///   - remote fetch and notebook export disabled
    ///   - default render thresholds
    fn default() -> Self {
        let upload_dir = env::temp_dir().join("plotplot");
        Self {
            remote_cache_dir: upload_dir.join("gdrive"),
            jupyter_export_path: upload_dir.join("jupyter"),
            upload_dir,
            idle_timeout_secs: 26 * 3600,
            remote_fetch_enabled: false,
            jupyter_export_enabled: false,
            render: RenderOptions::default(),
        }
    }
}

impl Config {
    /// Load a JSON config file, then apply environment overrides.
    ///
    /// # Arguments
    /// * `path` - Path to a JSON object with any subset of the fields
    ///
    /// # Returns
    /// * `Result<Config>` - The merged configuration or an IO/JSON error
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&text)?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// `PLOTPLOT_UPLOAD_DIR` and `PLOTPLOT_IDLE_TIMEOUT_SECS` take precedence
    /// over file values.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = env::var("PLOTPLOT_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
            self.remote_cache_dir = self.upload_dir.join("gdrive");
        }
        if let Ok(secs) = env::var("PLOTPLOT_IDLE_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(v) => self.idle_timeout_secs = v,
                Err(_) => warn!("Ignoring PLOTPLOT_IDLE_TIMEOUT_SECS={:?}: not an integer", secs),
            }
        }
    }
}
