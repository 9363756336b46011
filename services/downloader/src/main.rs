//! ERA5 bulk downloader.
//!
//! Requests reanalysis files from the climate archive, skips anything the
//! local file index already knows about, downloads with bounded concurrency,
//! and verifies every transfer by size before post-processing it into place.
//!
//! Per-item download failures are reported through the log; the exit status
//! only reflects configuration or catalog failures.

mod batch;
mod config;
mod download;
mod index;
mod plan;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use era5_catalog::{
    OutputFormat, Resolution, Stream, StreamDescriptor, Timestep, VariableCatalog,
};

use batch::{BatchArgs, Orchestrator, QueuedRequest};
use config::AppConfig;
use index::{crawl, expected_files, ExistenceIndex, LocationFilter};
use plan::location_pattern;

#[derive(Parser, Debug)]
#[command(name = "era5dl")]
#[command(about = "Request and download ERA5 data from the climate archive")]
struct Cli {
    /// Show debug info
    #[arg(long, global = true)]
    debug: bool,

    /// Configuration directory (downloader.yaml, streams/, variables.yaml)
    #[arg(long, global = true, env = "ERA5DL_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download variables for a stream; whole year unless months are given
    Download(DownloadArgs),
    /// Execute a queued request description from a file
    Scan(ScanArgs),
    /// Maintain the file existence index
    Db(DbArgs),
}

#[derive(Args, Debug)]
struct DownloadArgs {
    /// Stream: surface, pressure, wave, land, cems_fire, agera5, wfde5
    #[arg(short, long)]
    stream: String,

    /// Parameter code(s), e.g. 167.128; defaults to the stream's routine list
    #[arg(short, long = "param")]
    params: Vec<String>,

    /// Year(s) to download
    #[arg(short, long = "year", required = true)]
    years: Vec<i32>,

    /// Month(s) 1-12; defaults to the whole year
    #[arg(short, long = "month")]
    months: Vec<u32>,

    /// Timestep: hr, day or mon
    #[arg(short, long, default_value = "hr")]
    timestep: String,

    /// Output format: netcdf, grib, zip or tgz
    #[arg(short = 'f', long, default_value = "netcdf")]
    format: String,

    /// One file spanning the entire historical coverage (monthly/daily only)
    #[arg(short, long)]
    back: bool,

    /// Queue the request description to a file instead of executing it
    #[arg(short, long)]
    queue: bool,

    /// Queue into the high-priority directory (with --queue)
    #[arg(short, long)]
    urgent: bool,
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Queued request file written by download --queue
    #[arg(short, long)]
    file: PathBuf,
}

#[derive(Args, Debug)]
struct DbArgs {
    /// update, list or delete
    #[arg(short, long, default_value = "update")]
    action: String,

    /// Stream; required for list and delete
    #[arg(short, long)]
    stream: Option<String>,

    /// Variable name(s); required for delete
    #[arg(short, long = "param")]
    params: Vec<String>,

    /// Year(s); required for delete
    #[arg(short, long = "year")]
    years: Vec<i32>,

    /// Month(s) 1-12
    #[arg(short, long = "month")]
    months: Vec<u32>,

    /// Timestep: hr, day or mon
    #[arg(short, long, default_value = "hr")]
    timestep: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // configuration problems are fatal before any work starts
    let config = AppConfig::load(&cli.config_dir)?;

    match cli.command {
        Command::Download(args) => run_download(config, &cli.config_dir, args).await,
        Command::Scan(args) => {
            let batch = QueuedRequest::load(&args.file)?.into_args()?;
            run_batch(config, &cli.config_dir, batch).await
        }
        Command::Db(args) => run_db(config, &cli.config_dir, args).await,
    }
}

async fn run_download(config: AppConfig, config_dir: &Path, args: DownloadArgs) -> Result<()> {
    let stream = Stream::from_str(&args.stream)?;
    let tstep = Timestep::from_str(&args.timestep)?;
    let format = OutputFormat::from_str(&args.format)?;

    if args.back && stream != Stream::Wfde5 && !matches!(tstep, Timestep::Month | Timestep::Day) {
        bail!("--back is only available for monthly and daily data");
    }
    ensure!(
        format.valid_for(stream),
        "Download format {format} not available for the {stream} product"
    );
    for &m in &args.months {
        ensure!((1..=12).contains(&m), "Invalid month: {m}");
    }

    let batch = BatchArgs {
        stream,
        tstep,
        format,
        params: args.params,
        years: args.years,
        months: args.months,
        back: args.back,
    };

    if args.queue {
        let dir = if args.urgent {
            config.urgent_dir()
        } else {
            config.request_dir.clone()
        };
        let path = QueuedRequest::from_args(&batch).dump(&dir)?;
        info!(path = %path.display(), "Queued request");
        return Ok(());
    }

    run_batch(config, config_dir, batch).await
}

async fn run_batch(config: AppConfig, config_dir: &Path, batch: BatchArgs) -> Result<()> {
    let index = ExistenceIndex::open(&config.db_path).await?;
    let orch = Orchestrator::new(Arc::new(config), config_dir.to_path_buf(), index);

    let summary = orch.run(&batch).await?;
    info!(
        requested = summary.requested,
        skipped = summary.skipped,
        completed = summary.completed,
        failed = summary.failed,
        "--- Done ---"
    );
    Ok(())
}

async fn run_db(config: AppConfig, config_dir: &Path, args: DbArgs) -> Result<()> {
    let tstep = Timestep::from_str(&args.timestep)?;
    let stream = args
        .stream
        .as_deref()
        .map(Stream::from_str)
        .transpose()?;
    let index = ExistenceIndex::open(&config.db_path).await?;

    match args.action.as_str() {
        "update" => db_update(&config, &index, stream, tstep).await,
        "list" => {
            let stream = stream.context("db list requires --stream")?;
            db_list(&config, config_dir, &index, stream, tstep, &args.params).await
        }
        "delete" => {
            let stream = stream.context("db delete requires --stream")?;
            ensure!(
                !args.params.is_empty(),
                "db delete requires at least one --param <variable>"
            );
            ensure!(!args.years.is_empty(), "db delete requires at least one --year");
            db_delete(&index, stream, tstep, &args.params, &args.years, &args.months).await
        }
        other => bail!("Unknown db action: {other}"),
    }
}

/// Crawl the data roots and index anything new.
async fn db_update(
    config: &AppConfig,
    index: &ExistenceIndex,
    stream: Option<Stream>,
    tstep: Timestep,
) -> Result<()> {
    let known = index.known_filenames().await?;
    info!(records = known.len(), "Records already in db");

    let new_files = match stream {
        Some(stream) => {
            let filter = LocationFilter::new(stream, tstep);
            let base = config.dest_root(stream.is_derived());
            info!(base = %base.display(), stream = %stream, "Crawling");
            crawl(base, filter.depth(), &known, Some(&filter))
        }
        None => {
            // the full reanalysis tree plus the flatter derived tree
            let mut files = crawl(&config.data_dir, 3, &known, None);
            files.extend(crawl(&config.deriv_dir, 2, &known, None));
            files
        }
    };
    info!(new = new_files.len(), "New files found");

    if !new_files.is_empty() {
        let added = index.insert(&new_files).await?;
        info!(added, "Updated db");
    }
    info!("--- Done ---");
    Ok(())
}

/// Per-variable comparison of disk, index and expected file counts.
async fn db_list(
    config: &AppConfig,
    config_dir: &Path,
    index: &ExistenceIndex,
    stream: Stream,
    tstep: Timestep,
    params: &[String],
) -> Result<()> {
    let varnames: Vec<String> = if params.is_empty() {
        let desc = StreamDescriptor::load(config_dir, stream.as_str(), tstep)?;
        let catalog = VariableCatalog::load(config_dir, stream)?;
        println!("Variables currently updated for this stream:");
        let mut names = Vec::new();
        for code in &desc.params {
            if let Resolution::Available { name, cds_name } = catalog.resolve(code) {
                println!("  {name} - {cds_name} - {code}");
                names.push(name);
            }
        }
        names
    } else {
        params.to_vec()
    };

    let expected = expected_files(stream, tstep, chrono::Local::now().date_naive());
    let base = config.dest_root(stream.is_derived());

    for var in &varnames {
        let on_disk = disk_count(base, stream, var, tstep) as i64;
        let in_db = index.count_like(&location_pattern(stream, var, tstep)).await?;
        println!("{var}: {on_disk} on disk, {in_db} in db, {expected} expected");
        if on_disk < expected {
            println!("  {} file(s) missing for {var}", expected - on_disk);
        } else if on_disk > expected {
            println!("  {} more file(s) than expected for {var}", on_disk - expected);
        }
    }
    Ok(())
}

/// Count netcdf files for one variable at its conventional depth.
fn disk_count(base: &Path, stream: Stream, var: &str, tstep: Timestep) -> usize {
    let (dir, depth) = match tstep {
        Timestep::Hour => (base.join(stream.as_str()).join(var), 2),
        Timestep::Month => (base.join(stream.as_str()).join(var).join("monthly"), 1),
        Timestep::Day => (base.join(stream.as_str()).join(var), 1),
    };
    walkdir::WalkDir::new(dir)
        .min_depth(depth)
        .max_depth(depth)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".nc"))
        .count()
}

/// Select matching records, show them, and delete after confirmation.
async fn db_delete(
    index: &ExistenceIndex,
    stream: Stream,
    tstep: Timestep,
    params: &[String],
    years: &[i32],
    months: &[u32],
) -> Result<()> {
    let months: Vec<Option<u32>> = if months.is_empty() {
        vec![None]
    } else {
        months.iter().map(|&m| Some(m)).collect()
    };
    let tag = stream.product_tag();

    let mut selected: Vec<(String, String)> = Vec::new();
    for var in params {
        for &year in years {
            for &month in &months {
                let mn = month
                    .map(|m| format!("{m:02}"))
                    .unwrap_or_else(|| "%".to_string());
                let (location, fname) = match tstep {
                    Timestep::Month => (
                        format!("{}/{var}/monthly", stream.as_str()),
                        format!("{var}_{tag}_mon_%_{year}{mn}.nc"),
                    ),
                    Timestep::Day => (
                        format!("{}/{var}", stream.as_str()),
                        format!("{var}_{tag}_day_%_{year}{mn}01_%.nc"),
                    ),
                    Timestep::Hour => (
                        format!("{}/{var}/{year}", stream.as_str()),
                        format!("{var}_{tag}_%_{year}{mn}01_%.nc"),
                    ),
                };
                selected.extend(index.select_records(&location, &fname).await?);
            }
        }
    }
    selected.sort();
    selected.dedup();

    if selected.is_empty() {
        info!("No matching records");
        return Ok(());
    }

    println!("Selected records in db:");
    for (fname, location) in &selected {
        println!("  {location}/{fname}");
    }
    if !confirm(&format!("Delete {} record(s)? (y/n) ", selected.len()))? {
        info!("Aborted, nothing deleted");
        return Ok(());
    }

    let mut deleted = 0;
    for (fname, location) in &selected {
        deleted += index.delete(fname, location).await?;
    }
    info!(deleted, "Rows deleted");
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}
