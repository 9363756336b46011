//! Download executor: one WorkItem in, one verified file out.
//!
//! The remote request call is behind the `Retriever` trait; the transfer
//! itself goes through configured external commands. Every failure mode is
//! converted into a per-item outcome; nothing here propagates into the
//! batch loop.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use era5_catalog::Request;

use crate::config::AppConfig;

/// What the remote service hands back once a request is ready.
#[derive(Debug, Clone)]
pub struct RetrieveResponse {
    /// URL of the prepared result file.
    pub location: String,
    /// Expected size of the result in bytes.
    pub content_length: u64,
}

/// The opaque remote request call: submit a request, get back where to fetch
/// the result and how big it should be.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, dataset: &str, request: &Request) -> Result<RetrieveResponse>;
}

/// Unit of execution: one request, one staged file, one destination.
/// Immutable after creation; consumed exactly once.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub dsid: String,
    pub request: Request,
    pub staging_path: PathBuf,
    pub dest_path: PathBuf,
    /// Alternate host marker assigned to this item, if a pool is configured.
    pub host: Option<String>,
    /// Index into the credential pool.
    pub credential: usize,
}

/// Per-item result. Failures are recorded, not raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

/// Executes WorkItems: retrieval, fetch, size verification, post-processing.
#[derive(Clone)]
pub struct Executor {
    config: Arc<AppConfig>,
}

impl Executor {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    /// Run one item to completion. Stateless apart from the filesystem; safe
    /// to run many items concurrently.
    pub async fn execute(&self, retriever: &dyn Retriever, item: &WorkItem) -> Outcome {
        let staged = &item.staging_path;
        info!(dataset = %item.dsid, file = %staged.display(), "Requesting");

        let response = match retriever.retrieve(&item.dsid, &item.request).await {
            Ok(r) => r,
            Err(e) => {
                error!(file = %staged.display(), error = %e, "Request failed");
                return Outcome::Failed;
            }
        };

        let url = self.rewrite_slow_host(&response.location, item.host.as_deref());
        info!(url = %url, file = %staged.display(), "Downloading");

        if let Err(e) = run_command(
            &self.config.commands.fetch,
            &[staged.as_os_str(), OsStr::new(&url)],
        )
        .await
        {
            // a failed fetch may still have left a partial file worth resuming
            warn!(file = %staged.display(), error = %e, "Fetch command failed");
        }

        match self.verify(&url, staged, response.content_length).await {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    file = %staged.display(),
                    expected = response.content_length,
                    retries = self.config.retry,
                    "Transfer incomplete after resume attempts"
                );
                return Outcome::Failed;
            }
            Err(e) => {
                error!(file = %staged.display(), error = %e, "Verification failed");
                return Outcome::Failed;
            }
        }

        match self.post_process(item).await {
            Ok(()) => {
                info!(file = %item.dest_path.display(), "Download success");
                Outcome::Completed
            }
            Err(e) => {
                error!(file = %staged.display(), error = %e, "Post-processing failed");
                // don't leave a corrupt output behind
                tokio::fs::remove_file(&item.dest_path).await.ok();
                tokio::fs::remove_file(&item.dest_path.with_extension("nc"))
                    .await
                    .ok();
                Outcome::Failed
            }
        }
    }

    /// Compare the staged size against the expected size, resuming up to the
    /// configured ceiling. The resume command's exit status is not trusted:
    /// only an on-disk size match counts as success.
    async fn verify(&self, url: &str, staged: &Path, expected: u64) -> Result<bool> {
        let mut size = file_size(staged).await;
        if size == expected {
            return Ok(true);
        }

        let mut attempt = 0;
        while size < expected && attempt < self.config.retry {
            attempt += 1;
            info!(file = %staged.display(), attempt, size, expected, "Resuming download");
            if let Err(e) = run_command(
                &self.config.commands.resume,
                &[staged.as_os_str(), OsStr::new(url)],
            )
            .await
            {
                warn!(file = %staged.display(), attempt, error = %e, "Resume command failed");
            }
            size = file_size(staged).await;
            if size == expected {
                return Ok(true);
            }
        }

        Ok(size == expected)
    }

    /// Post-processing keyed on the staged extension. Archives unpack and
    /// concatenate into a netcdf destination; netcdf compresses into place;
    /// anything else moves over as-is.
    async fn post_process(&self, item: &WorkItem) -> Result<()> {
        let staged = &item.staging_path;
        let ext = staged.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "nc" => {
                info!(file = %staged.display(), "Compressing into destination");
                run_command(
                    &self.config.commands.compress,
                    &[staged.as_os_str(), item.dest_path.as_os_str()],
                )
                .await?;
                tokio::fs::remove_file(staged).await.ok();
            }
            "tgz" => {
                info!(file = %staged.display(), "Untarring and concatenating");
                self.unpack_concat(&self.config.commands.extract_tar, "-C", item)
                    .await?;
            }
            "zip" => {
                info!(file = %staged.display(), "Unzipping and concatenating");
                self.unpack_concat(&self.config.commands.extract_zip, "-d", item)
                    .await?;
            }
            _ => {
                debug!(file = %staged.display(), "No post-processing for this format");
                move_file(staged, &item.dest_path).await?;
            }
        }
        Ok(())
    }

    /// Unpack an archive into a scratch directory, concatenate its netcdf
    /// fragments into the destination, and clean up.
    async fn unpack_concat(&self, extract: &[String], dir_flag: &str, item: &WorkItem) -> Result<()> {
        let staged = &item.staging_path;
        let scratch = staged.with_extension("d");
        tokio::fs::create_dir_all(&scratch).await?;

        let result = async {
            run_command(
                extract,
                &[staged.as_os_str(), OsStr::new(dir_flag), scratch.as_os_str()],
            )
            .await?;

            let mut parts: Vec<PathBuf> = std::fs::read_dir(&scratch)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("nc"))
                .collect();
            parts.sort();
            ensure!(
                !parts.is_empty(),
                "archive {} contained no netcdf fragments",
                staged.display()
            );

            let out = item.dest_path.with_extension("nc");
            let mut extra: Vec<&OsStr> = parts.iter().map(|p| p.as_os_str()).collect();
            extra.push(out.as_os_str());
            run_command(&self.config.commands.concat, &extra).await?;
            Ok(())
        }
        .await;

        tokio::fs::remove_dir_all(&scratch).await.ok();
        if result.is_ok() {
            tokio::fs::remove_file(staged).await.ok();
        }
        result
    }

    /// Rewrite a result URL pointing at a known slow host to this item's
    /// assigned alternate.
    fn rewrite_slow_host(&self, url: &str, alt: Option<&str>) -> String {
        let Some(alt) = alt else {
            return url.to_string();
        };
        for slow in &self.config.slow_hosts {
            let marker = format!(".{slow}/");
            if url.contains(&marker) {
                debug!(url = %url, slow = %slow, alt = %alt, "Rewriting slow host");
                return url.replace(&marker, &format!(".{alt}/"));
            }
        }
        url.to_string()
    }
}

async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Rename, falling back to copy+delete for cross-filesystem moves.
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::rename(from, to).await.is_err() {
        tokio::fs::copy(from, to).await?;
        tokio::fs::remove_file(from).await?;
    }
    Ok(())
}

/// Run a configured argument vector with extra arguments appended. No shell
/// is involved; a non-zero exit becomes an error carrying stderr.
async fn run_command(argv: &[String], extra: &[&OsStr]) -> Result<()> {
    let (program, args) = argv.split_first().context("empty command vector")?;
    debug!(command = %program, "Running external command");

    let output = Command::new(program)
        .args(args)
        .args(extra)
        .output()
        .await
        .with_context(|| format!("Failed to run {program}"))?;

    if !output.status.success() {
        bail!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// API credentials: endpoint URL plus "uid:key" token.
#[derive(Debug, Clone, Deserialize)]
struct Credentials {
    url: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct TaskReply {
    state: String,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    content_length: Option<u64>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Retriever against the archive's request API: submit the request, poll the
/// task until the result is prepared, hand back its location and size.
pub struct CdsClient {
    http: reqwest::Client,
    credentials: Credentials,
    poll_interval: Duration,
}

impl CdsClient {
    /// Build a client from a credentials file (YAML with `url` and `key`).
    pub fn from_credentials_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials file: {}", path.display()))?;
        let credentials: Credentials = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse credentials file: {}", path.display()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            credentials,
            poll_interval: Duration::from_secs(30),
        })
    }

    fn auth(&self) -> (String, Option<String>) {
        match self.credentials.key.split_once(':') {
            Some((user, pass)) => (user.to_string(), Some(pass.to_string())),
            None => (self.credentials.key.clone(), None),
        }
    }
}

#[async_trait]
impl Retriever for CdsClient {
    async fn retrieve(&self, dataset: &str, request: &Request) -> Result<RetrieveResponse> {
        let (user, pass) = self.auth();
        let submit_url = format!("{}/resources/{}", self.credentials.url, dataset);

        let mut reply: TaskReply = self
            .http
            .post(&submit_url)
            .basic_auth(&user, pass.as_deref())
            .json(request)
            .send()
            .await
            .context("Request submission failed")?
            .error_for_status()
            .context("Request rejected by service")?
            .json()
            .await
            .context("Malformed reply from service")?;

        // poll until the service has prepared the result
        loop {
            match reply.state.as_str() {
                "completed" => {
                    let location = reply
                        .location
                        .clone()
                        .context("Completed reply without location")?;
                    let content_length = reply
                        .content_length
                        .context("Completed reply without content length")?;
                    return Ok(RetrieveResponse {
                        location,
                        content_length,
                    });
                }
                "queued" | "running" => {
                    let request_id = reply
                        .request_id
                        .clone()
                        .context("Pending reply without request id")?;
                    debug!(dataset = %dataset, state = %reply.state, "Waiting for request");
                    tokio::time::sleep(self.poll_interval).await;

                    let poll_url = format!("{}/tasks/{}", self.credentials.url, request_id);
                    reply = self
                        .http
                        .get(&poll_url)
                        .basic_auth(&user, pass.as_deref())
                        .send()
                        .await
                        .context("Task poll failed")?
                        .error_for_status()
                        .context("Task poll rejected")?
                        .json()
                        .await
                        .context("Malformed task reply")?;
                }
                "failed" => {
                    bail!(
                        "Request failed on the service side: {}",
                        reply
                            .error
                            .as_ref()
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "no reason given".to_string())
                    );
                }
                other => bail!("Unexpected task state: {other}"),
            }
        }
    }
}
