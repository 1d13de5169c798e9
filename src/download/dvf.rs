//! DVF transaction downloader.
//!
//! One gzip CSV per department per year, decompressed into the raw cache as
//! `dvf_{year}_{dept}.csv`. Transfers are sequential and failures are
//! isolated per file: a department that cannot be fetched is logged and
//! skipped, never aborting the batch.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::config::{Config, IDF_DEPARTMENTS};
use crate::error::PipelineError;
use crate::fetch::{BasicClient, fetch_bytes};
use crate::records::RawTransaction;

pub struct DvfDownloader<'a> {
    config: &'a Config,
}

impl<'a> DvfDownloader<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Path of the decompressed cache file for one department and year.
    pub fn cache_path(&self, dept: &str, year: u16) -> PathBuf {
        self.config.raw_data_dir.join(format!("dvf_{year}_{dept}.csv"))
    }

    /// Downloads and decompresses one department file. Returns the cache
    /// path, reusing an existing file unless `force`, or `None` when the
    /// transfer or decompression failed (partial output is deleted).
    pub async fn download_department(
        &self,
        dept: &str,
        year: u16,
        force: bool,
    ) -> Option<PathBuf> {
        let output_file = self.cache_path(dept, year);

        if output_file.exists() && !force {
            info!(path = %output_file.display(), "File already cached");
            return Some(output_file);
        }

        let Some(url) = self.config.dvf_url(dept, year) else {
            error!(dept, year, "No DVF URL configured for this department");
            return None;
        };

        info!(url = %url, dept, "Downloading DVF department file");
        let client = BasicClient::new();

        let bytes = match fetch_bytes(&client, &url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(dept, year, error = %e, "DVF download failed");
                return None;
            }
        };

        debug!(bytes = bytes.len(), dept, "Decompressing");
        if let Err(e) = write_decompressed(&bytes, &output_file) {
            error!(dept, year, error = %e, "DVF decompression failed");
            let _ = std::fs::remove_file(&output_file);
            return None;
        }

        info!(path = %output_file.display(), "Downloaded and decompressed");
        Some(output_file)
    }

    /// Downloads every Île-de-France department sequentially. Returns the
    /// successfully cached files keyed by department code.
    pub async fn download_region(&self, year: u16, force: bool) -> BTreeMap<String, PathBuf> {
        info!(year, "Downloading DVF data for Île-de-France");

        let mut downloaded = BTreeMap::new();
        for (dept, _) in IDF_DEPARTMENTS {
            if let Some(path) = self.download_department(dept, year, force).await {
                downloaded.insert((*dept).to_string(), path);
            }
        }

        info!(
            downloaded = downloaded.len(),
            total = IDF_DEPARTMENTS.len(),
            "Department downloads finished"
        );
        downloaded
    }

    /// Loads and concatenates the cached department files for one year,
    /// stamping each row with its department code. A year with no cached
    /// file at all is the catchable missing-input condition.
    pub fn load_region(&self, year: u16) -> Result<Vec<RawTransaction>> {
        let mut rows = Vec::new();
        let mut files_read = 0usize;

        for (dept, _) in IDF_DEPARTMENTS {
            let path = self.cache_path(dept, year);
            if !path.exists() {
                warn!(path = %path.display(), "File not cached");
                continue;
            }

            match load_department_file(&path, dept) {
                Ok(mut dept_rows) => {
                    info!(dept, rows = dept_rows.len(), "Department file loaded");
                    rows.append(&mut dept_rows);
                    files_read += 1;
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to load department file");
                }
            }
        }

        if files_read == 0 {
            return Err(PipelineError::missing_data(
                "DVF",
                year,
                format!("run `dvf_analyzer download --year {year}` first"),
            )
            .into());
        }

        info!(rows = rows.len(), year, "Transactions loaded");
        Ok(rows)
    }
}

fn write_decompressed(gz_bytes: &[u8], output: &PathBuf) -> Result<()> {
    let mut decoder = GzDecoder::new(gz_bytes);
    let mut file = std::fs::File::create(output)
        .with_context(|| format!("creating {}", output.display()))?;
    std::io::copy(&mut decoder, &mut file)
        .with_context(|| format!("decompressing into {}", output.display()))?;
    Ok(())
}

fn load_department_file(path: &PathBuf, dept: &str) -> Result<Vec<RawTransaction>> {
    let file = std::fs::File::open(path)?;
    let mut rdr = csv::Reader::from_reader(file);

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for result in rdr.deserialize() {
        match result {
            Ok(record) => {
                let mut record: RawTransaction = record;
                record.code_departement = Some(dept.to_string());
                rows.push(record);
            }
            Err(_) => skipped += 1,
        }
    }

    if skipped > 0 {
        debug!(skipped, dept, "Unreadable rows skipped");
    }
    Ok(rows)
}
