//! Batch orchestrator: sweep years x months x variables, skip anything the
//! index already knows about, and dispatch the rest with bounded
//! concurrency.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use era5_catalog::{
    build_mars_request, build_request, OutputFormat, Resolution, Stream, StreamDescriptor,
    Timestep, VariableCatalog,
};

use crate::config::AppConfig;
use crate::download::{CdsClient, Executor, Outcome, Retriever, WorkItem};
use crate::index::ExistenceIndex;
use crate::plan::{self, Target};

/// The 2000-2006 pressure-level record is served from the ERA5.1 rerun
/// through the legacy dialect.
const LEGACY_YEARS: RangeInclusive<i32> = 2000..=2006;

fn needs_legacy(stream: Stream, year: i32) -> bool {
    stream == Stream::Pressure && LEGACY_YEARS.contains(&year)
}

/// One batch selection, as parsed from the CLI or a queued request file.
#[derive(Debug, Clone)]
pub struct BatchArgs {
    pub stream: Stream,
    pub tstep: Timestep,
    pub format: OutputFormat,
    /// Parameter codes; empty means the stream's routine list.
    pub params: Vec<String>,
    pub years: Vec<i32>,
    /// Months 1-12; empty means the whole year.
    pub months: Vec<u32>,
    pub back: bool,
}

/// Serialized form of a batch selection for `download --queue` / `scan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub format: String,
    pub stream: String,
    pub params: Vec<String>,
    pub years: Vec<i32>,
    pub months: Vec<u32>,
    pub timestep: String,
    pub back: bool,
}

impl QueuedRequest {
    pub fn from_args(args: &BatchArgs) -> Self {
        Self {
            format: args.format.to_string(),
            stream: args.stream.to_string(),
            params: args.params.clone(),
            years: args.years.clone(),
            months: args.months.clone(),
            timestep: args.tstep.to_string(),
            back: args.back,
        }
    }

    pub fn into_args(self) -> Result<BatchArgs> {
        Ok(BatchArgs {
            stream: Stream::from_str(&self.stream)?,
            tstep: Timestep::from_str(&self.timestep)?,
            format: OutputFormat::from_str(&self.format)?,
            params: self.params,
            years: self.years,
            months: self.months,
            back: self.back,
        })
    }

    /// Write to a timestamped file in `dir` and return its path.
    pub fn dump(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let stamp = Local::now().format("%Y%m%d%H%M%S");
        let path = dir.join(format!("era5_request_{stamp}.json"));
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write request file: {}", path.display()))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse request file: {}", path.display()))
    }
}

/// Work list built by the sweep, before dispatch.
#[derive(Debug)]
pub struct WorkList {
    pub items: Vec<WorkItem>,
    pub skipped: usize,
    pub distinct_vars: usize,
}

/// Aggregate counts reported after a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub requested: usize,
    pub skipped: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Drives one batch end to end: build the work list, dispatch it, report.
pub struct Orchestrator {
    config: Arc<AppConfig>,
    config_dir: PathBuf,
    index: ExistenceIndex,
}

impl Orchestrator {
    pub fn new(config: Arc<AppConfig>, config_dir: PathBuf, index: ExistenceIndex) -> Self {
        Self {
            config,
            config_dir,
            index,
        }
    }

    /// Sweep the cartesian product and produce WorkItems for everything not
    /// already on disk according to the index.
    pub async fn build_work_list(&self, args: &BatchArgs) -> Result<WorkList> {
        let desc = StreamDescriptor::load(&self.config_dir, args.stream.as_str(), args.tstep)?;
        let catalog = VariableCatalog::load(&self.config_dir, args.stream)?;

        // the rerun descriptor is only needed when the sweep enters the band
        let legacy_desc = if args.years.iter().any(|&y| needs_legacy(args.stream, y)) {
            Some(StreamDescriptor::load(
                &self.config_dir,
                "pressure51",
                args.tstep,
            )?)
        } else {
            None
        };

        let params = if args.params.is_empty() {
            desc.params.clone()
        } else {
            args.params.clone()
        };
        let months: Vec<u32> = if args.months.is_empty() {
            (1..=12).collect()
        } else {
            args.months.clone()
        };
        debug!(?params, ?months, "Sweep selection");

        let dest_root = self.config.dest_root(args.stream.is_derived()).to_path_buf();
        let mut items = Vec::new();
        let mut skipped = 0usize;
        let mut planned: HashSet<String> = HashSet::new();
        let mut vars_in_batch: HashSet<String> = HashSet::new();
        // progress index alternating hosts and credentials
        let mut i = 0usize;

        for &year in &args.years {
            let legacy = needs_legacy(args.stream, year);
            let desc_for = if legacy {
                legacy_desc.as_ref().expect("legacy descriptor loaded")
            } else {
                &desc
            };

            for &month in &months {
                for code in &params {
                    let (name, cds_name) = match catalog.resolve(code) {
                        Resolution::Available { name, cds_name } => (name, cds_name),
                        Resolution::NoRemoteName { name } => {
                            warn!(code = %code, name = %name, "No remote name for known code, skipping");
                            continue;
                        }
                        Resolution::Unknown => {
                            warn!(code = %code, "Parameter code not available, skipping");
                            continue;
                        }
                    };

                    let target = Target::plan(
                        &self.config.staging_dir,
                        &dest_root,
                        args.stream,
                        &name,
                        year,
                        month,
                        desc_for,
                        args.tstep,
                        args.back,
                        args.format,
                    );

                    let location = plan::location(args.stream, &name, year, args.tstep);
                    let existing = self.index.lookup(&location).await?;
                    if existing.iter().any(|f| f == &target.filename) {
                        info!(file = %target.filename, "Skipping, already exists");
                        skipped += 1;
                        continue;
                    }
                    if !planned.insert(target.filename.clone()) {
                        debug!(file = %target.filename, "Duplicate target in this batch");
                        skipped += 1;
                        continue;
                    }

                    let request = if legacy {
                        build_mars_request(desc_for, year, month, code, args.format)
                    } else {
                        build_request(
                            desc_for,
                            year,
                            month,
                            &cds_name,
                            &target.days,
                            args.format,
                            args.tstep,
                            args.back,
                        )
                    };

                    target.ensure_dirs()?;
                    let host = (!self.config.alt_hosts.is_empty())
                        .then(|| self.config.alt_hosts[i % self.config.alt_hosts.len()].clone());
                    let credential = i % self.config.credential_files.len();

                    info!(file = %target.filename, "Added request");
                    items.push(WorkItem {
                        dsid: desc_for.dsid.clone(),
                        request,
                        staging_path: target.staging_path(),
                        dest_path: target.dest_path(),
                        host,
                        credential,
                    });
                    vars_in_batch.insert(name);
                    i += 1;
                }

                if args.back {
                    // one bulk file covers the whole period
                    debug!("Bulk mode, breaking after first month");
                    break;
                }
            }
        }

        Ok(WorkList {
            items,
            skipped,
            distinct_vars: vars_in_batch.len(),
        })
    }

    /// Run a batch with the given retriever pool (one per credential).
    pub async fn run_with(
        &self,
        args: &BatchArgs,
        retrievers: &[Arc<dyn Retriever>],
    ) -> Result<BatchSummary> {
        let list = self.build_work_list(args).await?;
        let requested = list.items.len();

        if requested == 0 {
            info!(skipped = list.skipped, "No files to download");
            return Ok(BatchSummary {
                requested: 0,
                skipped: list.skipped,
                completed: 0,
                failed: 0,
            });
        }

        // one worker per variable, capped by configuration
        let pool = list.distinct_vars.max(1).min(self.config.max_concurrent);
        info!(requested, pool, "Dispatching downloads");

        let executor = Executor::new(self.config.clone());
        let results = stream::iter(list.items)
            .map(|item| {
                let executor = executor.clone();
                let retriever = retrievers[item.credential % retrievers.len()].clone();
                async move { executor.execute(retriever.as_ref(), &item).await }
            })
            .buffer_unordered(pool)
            .collect::<Vec<_>>()
            .await;

        let completed = results.iter().filter(|o| **o == Outcome::Completed).count();
        let failed = results.len() - completed;

        info!(
            requested,
            skipped = list.skipped,
            completed,
            failed,
            "Batch complete"
        );
        Ok(BatchSummary {
            requested,
            skipped: list.skipped,
            completed,
            failed,
        })
    }

    /// Run a batch against the real service, one client per credential file.
    pub async fn run(&self, args: &BatchArgs) -> Result<BatchSummary> {
        let retrievers: Vec<Arc<dyn Retriever>> = self
            .config
            .credential_files
            .iter()
            .map(|path| {
                CdsClient::from_credentials_file(path).map(|c| Arc::new(c) as Arc<dyn Retriever>)
            })
            .collect::<Result<_>>()?;
        self.run_with(args, &retrievers).await
    }

    pub fn index(&self) -> &ExistenceIndex {
        &self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::RetrieveResponse;
    use crate::index::FileRecord;
    use anyhow::bail;
    use async_trait::async_trait;
    use era5_catalog::Request;

    fn repo_config_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config")
    }

    fn test_config(tmp: &Path) -> AppConfig {
        serde_yaml::from_str(&format!(
            r#"
staging_dir: {0}/staging
data_dir: {0}/data
deriv_dir: {0}/derived
db_path: {0}/era5.sqlite
alt_hosts: ["110", "210"]
credential_files: ["{0}/.cdsapirc1", "{0}/.cdsapirc2"]
commands:
  fetch: ["/bin/sh", "-c", "printf abcde > \"$0\""]
  resume: ["true"]
  compress: ["cp"]
  concat: ["cat"]
  extract_tar: ["tar", "-xzf"]
  extract_zip: ["unzip", "-o"]
retry: 2
max_concurrent: 4
"#,
            tmp.display(),
        ))
        .unwrap()
    }

    fn surface_args() -> BatchArgs {
        BatchArgs {
            stream: Stream::Surface,
            tstep: Timestep::Hour,
            format: OutputFormat::Netcdf,
            params: vec!["167.128".to_string()],
            years: vec![2020],
            months: vec![3],
            back: false,
        }
    }

    async fn orchestrator(tmp: &Path) -> Orchestrator {
        let config = Arc::new(test_config(tmp));
        let index = ExistenceIndex::open_memory().await.unwrap();
        Orchestrator::new(config, repo_config_dir(), index)
    }

    struct OkRetriever;

    #[async_trait]
    impl Retriever for OkRetriever {
        async fn retrieve(&self, _dataset: &str, _request: &Request) -> Result<RetrieveResponse> {
            Ok(RetrieveResponse {
                location: "http://download.example.110/result".to_string(),
                content_length: 5,
            })
        }
    }

    struct ErrRetriever;

    #[async_trait]
    impl Retriever for ErrRetriever {
        async fn retrieve(&self, _dataset: &str, _request: &Request) -> Result<RetrieveResponse> {
            bail!("service unavailable")
        }
    }

    #[tokio::test]
    async fn test_one_item_for_missing_target() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(tmp.path()).await;

        let list = orch.build_work_list(&surface_args()).await.unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.skipped, 0);
        assert_eq!(list.distinct_vars, 1);

        let item = &list.items[0];
        assert_eq!(item.dsid, "reanalysis-era5-single-levels");
        assert!(item
            .staging_path
            .ends_with("surface/2m_temperature/2020/2m_temperature_era5_025_20200301_20200331.nc"));
        assert!(item.staging_path.parent().unwrap().is_dir());
        assert!(item.dest_path.parent().unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_indexed_target_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(tmp.path()).await;
        orch.index()
            .insert(&[FileRecord {
                filename: "2m_temperature_era5_025_20200301_20200331.nc".to_string(),
                location: "surface/2m_temperature/2020".to_string(),
                ncidate: "2020-04-01T10:00:00".to_string(),
                size: 1,
            }])
            .await
            .unwrap();

        let list = orch.build_work_list(&surface_args()).await.unwrap();
        assert!(list.items.is_empty());
        assert_eq!(list.skipped, 1);
    }

    #[tokio::test]
    async fn test_unknown_code_skipped_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(tmp.path()).await;
        let mut args = surface_args();
        args.params = vec!["999.999".to_string(), "167.128".to_string()];

        let list = orch.build_work_list(&args).await.unwrap();
        assert_eq!(list.items.len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_breaks_after_first_month() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(tmp.path()).await;
        let args = BatchArgs {
            stream: Stream::Land,
            tstep: Timestep::Month,
            format: OutputFormat::Netcdf,
            params: vec!["141.128".to_string()],
            years: vec![2005],
            months: vec![],
            back: true,
        };

        let list = orch.build_work_list(&args).await.unwrap();
        // one bulk file per variable, not one per month
        assert_eq!(list.items.len(), 1);
        assert!(list.items[0]
            .dest_path
            .ends_with("land/snow_depth/monthly/snow_depth_era5land_mon_01_198101_201812.nc"));
    }

    #[tokio::test]
    async fn test_legacy_band_routed_to_mars_dialect() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(tmp.path()).await;
        let args = BatchArgs {
            stream: Stream::Pressure,
            tstep: Timestep::Hour,
            format: OutputFormat::Netcdf,
            params: vec!["130.128".to_string()],
            years: vec![2003, 2010],
            months: vec![1],
            back: false,
        };

        let list = orch.build_work_list(&args).await.unwrap();
        assert_eq!(list.items.len(), 2);

        let legacy: Vec<_> = list
            .items
            .iter()
            .filter(|i| i.dsid == "reanalysis-era5.1-complete")
            .collect();
        assert_eq!(legacy.len(), 1);
        assert!(matches!(legacy[0].request, Request::Legacy(_)));

        let modern: Vec<_> = list
            .items
            .iter()
            .filter(|i| i.dsid == "reanalysis-era5-pressure-levels")
            .collect();
        assert_eq!(modern.len(), 1);
        assert!(matches!(modern[0].request, Request::Hourly(_)));
    }

    #[tokio::test]
    async fn test_round_robin_hosts_and_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(tmp.path()).await;
        let mut args = surface_args();
        args.params = vec![
            "167.128".to_string(),
            "168.128".to_string(),
            "228.128".to_string(),
        ];

        let list = orch.build_work_list(&args).await.unwrap();
        assert_eq!(list.items.len(), 3);
        let hosts: Vec<_> = list.items.iter().map(|i| i.host.clone().unwrap()).collect();
        assert_eq!(hosts, vec!["110", "210", "110"]);
        let creds: Vec<_> = list.items.iter().map(|i| i.credential).collect();
        assert_eq!(creds, vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn test_batch_continues_past_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(tmp.path()).await;
        let mut args = surface_args();
        args.params = vec!["167.128".to_string(), "168.128".to_string()];

        // credential 0 fails, credential 1 succeeds
        let retrievers: Vec<Arc<dyn Retriever>> =
            vec![Arc::new(ErrRetriever), Arc::new(OkRetriever)];
        let summary = orch.run_with(&args, &retrievers).await.unwrap();

        assert_eq!(summary.requested, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_queued_request_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let args = surface_args();

        let path = QueuedRequest::from_args(&args).dump(tmp.path()).unwrap();
        let loaded = QueuedRequest::load(&path).unwrap().into_args().unwrap();

        assert_eq!(loaded.stream, args.stream);
        assert_eq!(loaded.tstep, args.tstep);
        assert_eq!(loaded.format, args.format);
        assert_eq!(loaded.params, args.params);
        assert_eq!(loaded.years, args.years);
        assert_eq!(loaded.months, args.months);
        assert_eq!(loaded.back, args.back);
    }
}
