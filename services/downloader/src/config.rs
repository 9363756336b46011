//! Service configuration, loaded once at startup from downloader.yaml.
//!
//! A missing or malformed configuration file is fatal: nothing runs on a
//! partial config.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use tracing::debug;

/// Root configuration for the downloader service.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// In-flight transfers land here before verification.
    pub staging_dir: PathBuf,
    /// Verified output tree for the reanalysis streams.
    pub data_dir: PathBuf,
    /// Verified output tree for derived products (fire, agro, ...).
    pub deriv_dir: PathBuf,
    /// SQLite existence index.
    pub db_path: PathBuf,
    /// Queued request descriptions written by `download --queue`.
    #[serde(default = "default_request_dir")]
    pub request_dir: PathBuf,
    /// High-priority queue directory; defaults to `<request_dir>/Urgent`.
    #[serde(default)]
    pub urgent_dir: Option<PathBuf>,
    /// Result-URL host markers considered slow and rewritten to an alternate.
    #[serde(default)]
    pub slow_hosts: Vec<String>,
    /// Alternate host markers assigned round-robin across a batch.
    #[serde(default)]
    pub alt_hosts: Vec<String>,
    /// API credential files (YAML with url + key), alternated across a batch.
    pub credential_files: Vec<PathBuf>,
    pub commands: CommandSet,
    /// Resume attempts per item after the initial fetch.
    #[serde(default = "default_retry")]
    pub retry: u32,
    /// Ceiling on concurrent downloads.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_request_dir() -> PathBuf {
    PathBuf::from("requests")
}

fn default_retry() -> u32 {
    5
}

fn default_max_concurrent() -> usize {
    8
}

/// External command argument vectors. Paths and URLs are appended as extra
/// arguments; nothing is interpreted by a shell.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSet {
    /// Fetch a URL to a staging path: `fetch... <staged> <url>`.
    pub fetch: Vec<String>,
    /// Resume a partial transfer: `resume... <staged> <url>`.
    pub resume: Vec<String>,
    /// Compress a verified file into place: `compress... <staged> <dest>`.
    pub compress: Vec<String>,
    /// Concatenate extracted fragments: `concat... <inputs>... <output>`.
    pub concat: Vec<String>,
    /// Unpack a tar archive: `extract_tar... <staged> -C <dir>`.
    pub extract_tar: Vec<String>,
    /// Unpack a zip archive: `extract_zip... <staged> -d <dir>`.
    pub extract_zip: Vec<String>,
}

impl AppConfig {
    /// Load configuration from `<config_dir>/downloader.yaml`.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("downloader.yaml");
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        debug!(path = %path.display(), "Loaded service configuration");
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            !self.credential_files.is_empty(),
            "credential_files must list at least one API credential file"
        );
        for (name, argv) in [
            ("fetch", &self.commands.fetch),
            ("resume", &self.commands.resume),
            ("compress", &self.commands.compress),
            ("concat", &self.commands.concat),
            ("extract_tar", &self.commands.extract_tar),
            ("extract_zip", &self.commands.extract_zip),
        ] {
            ensure!(!argv.is_empty(), "commands.{name} must not be empty");
        }
        Ok(())
    }

    /// Output root for a stream: derived products live under `deriv_dir`.
    pub fn dest_root(&self, derived: bool) -> &Path {
        if derived {
            &self.deriv_dir
        } else {
            &self.data_dir
        }
    }

    pub fn urgent_dir(&self) -> PathBuf {
        self.urgent_dir
            .clone()
            .unwrap_or_else(|| self.request_dir.join("Urgent"))
    }
}
