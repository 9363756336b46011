//! File existence index backed by SQLite.
//!
//! One table tracks every output file known to be on disk. The index is a
//! cache of filesystem truth, populated only by crawls; a file deleted on
//! disk stays indexed until an explicit delete. Records are never updated
//! in place.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};
use walkdir::WalkDir;

use era5_catalog::{Stream, Timestep};

/// One indexed file. `location` is the directory relative to its data root,
/// e.g. "surface/2m_temperature/2020".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub filename: String,
    pub location: String,
    /// Modification timestamp, "%Y-%m-%dT%H:%M:%S".
    pub ncidate: String,
    pub size: i64,
}

/// Existence index over the single `file` table.
pub struct ExistenceIndex {
    pool: SqlitePool,
}

impl ExistenceIndex {
    /// Open or create the index database at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        Self::init(&pool).await?;
        info!(path = %path.display(), "Opened file index");
        Ok(Self { pool })
    }

    /// Open an in-memory index (for testing).
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::init(&pool).await?;
        Ok(Self { pool })
    }

    async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file (
                filename TEXT PRIMARY KEY,
                location TEXT,
                ncidate TEXT,
                size INT
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Filenames indexed under an exact location scope.
    pub async fn lookup(&self, location: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT filename FROM file WHERE location = ? ORDER BY filename ASC")
                .bind(location)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Filenames matching SQL-wildcard patterns over location and filename.
    pub async fn lookup_like(
        &self,
        location_pattern: &str,
        filename_pattern: &str,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT filename FROM file WHERE location LIKE ? AND filename LIKE ? ORDER BY filename ASC",
        )
        .bind(location_pattern)
        .bind(filename_pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Records matching wildcard patterns, with their locations. Used by the
    /// delete flow to show exactly what would go.
    pub async fn select_records(
        &self,
        location_pattern: &str,
        filename_pattern: &str,
    ) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT filename, location FROM file WHERE location LIKE ? AND filename LIKE ? ORDER BY filename ASC",
        )
        .bind(location_pattern)
        .bind(filename_pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Number of records under a location pattern.
    pub async fn count_like(&self, location_pattern: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM file WHERE location LIKE ?")
            .bind(location_pattern)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Every indexed filename. The crawl diffs against this set.
    pub async fn known_filenames(&self) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT filename FROM file")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Bulk insert-or-ignore. Duplicate filenames keep their first-seen
    /// record. Returns the number of rows actually added.
    pub async fn insert(&self, records: &[FileRecord]) -> Result<u64> {
        let mut added = 0;
        for rec in records {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO file (filename, location, ncidate, size) VALUES (?, ?, ?, ?)",
            )
            .bind(&rec.filename)
            .bind(&rec.location)
            .bind(&rec.ncidate)
            .bind(rec.size)
            .execute(&self.pool)
            .await?;
            added += result.rows_affected();
        }
        Ok(added)
    }

    /// Delete one record by exact filename and location. Destructive; only
    /// reachable through the CLI's confirmed delete flow.
    pub async fn delete(&self, filename: &str, location: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM file WHERE filename = ? AND location = ?")
            .bind(filename)
            .bind(location)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Walk a data root for netcdf files and return those not yet indexed, with
/// stat metadata captured. `depth` is the directory depth of the files below
/// the root (stream/var/year = 3, stream/var = 2 for derived trees).
pub fn crawl(
    base: &Path,
    depth: usize,
    known: &HashSet<String>,
    filter: Option<&LocationFilter>,
) -> Vec<FileRecord> {
    let mut found = Vec::new();

    for entry in WalkDir::new(base)
        .min_depth(depth + 1)
        .max_depth(depth + 1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".nc") {
            continue;
        }
        if known.contains(&name) {
            continue;
        }

        let location = match entry.path().parent().and_then(|p| p.strip_prefix(base).ok()) {
            Some(rel) => rel.to_string_lossy().replace('\\', "/"),
            None => continue,
        };
        if let Some(f) = filter {
            if !f.matches(&location) {
                continue;
            }
        }

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let mtime = meta
            .modified()
            .map(|t| {
                DateTime::<Utc>::from(t)
                    .with_timezone(&Local)
                    .format("%Y-%m-%dT%H:%M:%S")
                    .to_string()
            })
            .unwrap_or_default();

        found.push(FileRecord {
            filename: name,
            location,
            ncidate: mtime,
            size: meta.len() as i64,
        });
    }

    debug!(base = %base.display(), new = found.len(), "Crawled data root");
    found
}

/// Restricts a crawl to one stream's conventional layout.
pub struct LocationFilter {
    stream: Stream,
    tstep: Timestep,
}

impl LocationFilter {
    pub fn new(stream: Stream, tstep: Timestep) -> Self {
        Self { stream, tstep }
    }

    /// Directory depth of files for this stream/timestep below the root.
    pub fn depth(&self) -> usize {
        match self.tstep {
            Timestep::Day => 2,
            _ => 3,
        }
    }

    fn matches(&self, location: &str) -> bool {
        let parts: Vec<&str> = location.split('/').collect();
        if parts.first() != Some(&self.stream.as_str()) {
            return false;
        }
        match self.tstep {
            Timestep::Hour => {
                parts.len() == 3 && parts[2].len() == 4 && parts[2].chars().all(|c| c.is_ascii_digit())
            }
            Timestep::Month => parts.len() == 3 && parts[2] == "monthly",
            Timestep::Day => parts.len() == 2,
        }
    }
}

/// Expected number of published files to date for a stream and timestep,
/// used by `db list` to report gaps. Derived forcing datasets have a fixed
/// record length; everything else accrues monthly with a publication delay.
pub fn expected_files(stream: Stream, tstep: Timestep, today: NaiveDate) -> i64 {
    use chrono::Datelike;

    if matches!(stream, Stream::Wfde5 | Stream::Agera5) {
        return 40;
    }

    let start_yr = stream.start_year() as i64;
    let end_yr = today.year() as i64;
    // after the 15th the previous month should have landed
    let mut end_mn = if today.day() <= 15 {
        today.month() as i64 - 2
    } else {
        today.month() as i64 - 1
    };
    // fire, land and all monthly products publish one month later again
    if matches!(stream, Stream::CemsFire | Stream::Land) || tstep == Timestep::Month {
        end_mn -= 1;
    }

    match tstep {
        Timestep::Hour => (end_yr - start_yr) * 12 + end_mn,
        Timestep::Month => 1 + end_mn,
        Timestep::Day => end_yr - start_yr + end_mn,
    }
}
