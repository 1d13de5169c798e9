//! Rent-indicator downloader ("Carte des loyers").
//!
//! One CSV per year (older vintages) or one per property type (apartments /
//! houses since 2023). The published files are inconsistent about encoding
//! (UTF-8 or a Latin-1 family variant), delimiter (`;` or `,`), decimal
//! separator (French comma) and header quoting, so loading normalizes all
//! four before any row is typed.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{Config, RentUrlSource, is_idf_department};
use crate::error::PipelineError;
use crate::fetch::{BasicClient, fetch_bytes};

pub const TYPE_APARTMENTS: &str = "appartements";
pub const TYPE_HOUSES: &str = "maisons";
/// Tag for single-file vintages that pool every property type.
pub const TYPE_ALL: &str = "tous";

/// Candidate encodings, tried in priority order. The WHATWG registry folds
/// latin-1 / iso-8859-1 / cp1252 into windows-1252.
const ENCODING_CANDIDATES: &[&encoding_rs::Encoding] =
    &[encoding_rs::UTF_8, encoding_rs::WINDOWS_1252];

/// One commune (× property type) rent-indicator row.
#[derive(Debug, Clone, PartialEq)]
pub struct RentRecord {
    pub id_zone: Option<String>,
    pub insee_code: Option<String>,
    pub commune: Option<String>,
    pub epci: Option<String>,
    pub departement: Option<String>,
    pub region: Option<String>,
    /// Predicted rent in EUR per m² per month.
    pub loypredm2: Option<f64>,
    /// Lower bound of the prediction interval.
    pub lwr_ipm2: Option<f64>,
    /// Upper bound of the prediction interval.
    pub upr_ipm2: Option<f64>,
    /// Prediction granularity label (commune-level vs pooled zone).
    pub typpred: Option<String>,
    pub nbobs_com: Option<u32>,
    pub nbobs_mail: Option<u32>,
    pub r2_adj: Option<f64>,
    pub type_bien: String,
}

/// Downloaded file set for one year, mirroring the configured URL shape.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadedRent {
    Single(PathBuf),
    PerType(BTreeMap<String, PathBuf>),
}

pub struct RentDownloader<'a> {
    config: &'a Config,
}

impl<'a> RentDownloader<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    fn single_path(&self, year: u16) -> PathBuf {
        self.config.raw_data_dir.join(format!("carte_loyers_{year}.csv"))
    }

    fn typed_path(&self, year: u16, property_type: &str) -> PathBuf {
        self.config
            .raw_data_dir
            .join(format!("carte_loyers_{year}_{property_type}.csv"))
    }

    /// Downloads the rent file(s) for a year. URL priority: explicit
    /// `custom` argument, then the per-year configuration. Existing files
    /// are reused unless `force`; a failed transfer deletes its partial
    /// output and aborts (these are one or two files, not a batch).
    pub async fn download(
        &self,
        year: u16,
        custom: Option<RentUrlSource>,
        force: bool,
    ) -> Result<DownloadedRent> {
        let source = match custom {
            Some(source) => {
                info!(year, "Using caller-supplied rent URL(s)");
                source
            }
            None => self
                .config
                .rent_url(year)
                .cloned()
                .ok_or_else(|| {
                    error!(year, "No rent URL configured");
                    PipelineError::NoUrlConfigured(year)
                })?,
        };

        match source {
            RentUrlSource::Single(url) => {
                let output = self.single_path(year);
                if output.exists() && !force {
                    info!(path = %output.display(), "File already cached");
                    return Ok(DownloadedRent::Single(output));
                }
                self.fetch_to(&url, &output, year).await?;
                Ok(DownloadedRent::Single(output))
            }
            RentUrlSource::PerType(urls) => {
                let mut downloaded = BTreeMap::new();
                for (property_type, url) in urls {
                    let output = self.typed_path(year, &property_type);
                    if output.exists() && !force {
                        info!(path = %output.display(), "File already cached");
                        downloaded.insert(property_type, output);
                        continue;
                    }
                    self.fetch_to(&url, &output, year)
                        .await
                        .with_context(|| format!("downloading rent data ({property_type})"))?;
                    downloaded.insert(property_type, output);
                }
                Ok(DownloadedRent::PerType(downloaded))
            }
        }
    }

    async fn fetch_to(&self, url: &str, output: &Path, year: u16) -> Result<()> {
        info!(url, year, "Downloading rent data");
        let client = BasicClient::with_timeout(Duration::from_secs(60));

        let bytes = match fetch_bytes(&client, url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(url, error = %e, "Rent download failed");
                let _ = std::fs::remove_file(output);
                return Err(e);
            }
        };

        std::fs::write(output, &bytes)
            .with_context(|| format!("writing {}", output.display()))?;
        info!(path = %output.display(), "Downloaded");
        Ok(())
    }

    /// Loads the rent table for a year. Split per-type files are preferred
    /// when present (each row tagged with its property type, concatenated);
    /// otherwise the single pooled file is used. `property_type` restricts
    /// a split vintage to one of its files.
    pub fn load(&self, year: u16, property_type: Option<&str>) -> Result<Vec<RentRecord>> {
        let file_apartments = self.typed_path(year, TYPE_APARTMENTS);
        let file_houses = self.typed_path(year, TYPE_HOUSES);
        let file_single = self.single_path(year);

        let has_split = file_apartments.exists() || file_houses.exists();

        if !has_split && !file_single.exists() {
            return Err(PipelineError::missing_data(
                "rent",
                year,
                format!("run `dvf_analyzer download --rent-year {year}` first"),
            )
            .into());
        }

        let mut rows = Vec::new();

        if has_split {
            for (tag, path) in [(TYPE_APARTMENTS, &file_apartments), (TYPE_HOUSES, &file_houses)] {
                if property_type.is_some_and(|p| p != tag) {
                    continue;
                }
                if path.exists() {
                    let mut parsed = parse_rent_csv(path, tag)?;
                    info!(rows = parsed.len(), property_type = tag, "Rent file loaded");
                    rows.append(&mut parsed);
                } else if property_type == Some(tag) {
                    return Err(PipelineError::missing_data(
                        "rent",
                        year,
                        format!("no {tag} file cached for {year}"),
                    )
                    .into());
                }
            }
        } else {
            rows = parse_rent_csv(&file_single, TYPE_ALL)?;
            info!(rows = rows.len(), "Rent file loaded");
        }

        Ok(rows)
    }

    /// Keeps the Île-de-France departments. When no row carries a department
    /// code at all (column absent from the source), the table is returned
    /// unfiltered with a warning, as there is nothing to filter on.
    pub fn filter_region(&self, rows: Vec<RentRecord>) -> Vec<RentRecord> {
        if !rows.is_empty() && rows.iter().all(|r| r.departement.is_none()) {
            warn!("No department column in rent data; region filter skipped");
            return rows;
        }

        let total = rows.len();
        let filtered: Vec<RentRecord> = rows
            .into_iter()
            .filter(|r| r.departement.as_deref().is_some_and(is_idf_department))
            .collect();
        info!(kept = filtered.len(), total, "Rent rows filtered to Île-de-France");
        filtered
    }
}

/// Decodes bytes with the first candidate that succeeds without decode
/// errors; exhaustion is a hard error, never a silent fallback.
fn decode_candidates(
    bytes: &[u8],
    candidates: &[&'static encoding_rs::Encoding],
    path: &Path,
) -> Result<String> {
    for encoding in candidates {
        let (text, _, had_errors) = encoding.decode(bytes);
        if !had_errors {
            info!(encoding = encoding.name(), path = %path.display(), "Decoded");
            return Ok(text.into_owned());
        }
    }

    Err(PipelineError::EncodingExhausted {
        path: path.display().to_string(),
        tried: candidates
            .iter()
            .map(|e| e.name())
            .collect::<Vec<_>>()
            .join(", "),
    }
    .into())
}

/// Picks the column delimiter by counting candidates on the header line.
fn sniff_delimiter(header_line: &str) -> u8 {
    let semicolons = header_line.matches(';').count();
    let commas = header_line.matches(',').count();
    if semicolons >= commas && semicolons > 0 {
        b';'
    } else {
        b','
    }
}

/// Strips quotes and whitespace, and replaces periods with underscores so
/// header variants like `"R2.adj"` normalize to the canonical `R2_adj`.
fn normalize_header(name: &str) -> String {
    name.trim().trim_matches('"').trim().replace('.', "_")
}

/// Converts a French-locale numeric cell (comma decimal separator) to `f64`.
/// Blank or unparsable cells become `None`, never errors.
fn parse_french_number(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().trim_matches('"').replace(',', ".");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

fn parse_rent_csv(path: &Path, type_bien: &str) -> Result<Vec<RentRecord>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let text = decode_candidates(&bytes, ENCODING_CANDIDATES, path)?;

    let header_line = text.lines().next().unwrap_or_default();
    let delimiter = sniff_delimiter(header_line);

    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: HashMap<String, usize> = rdr
        .headers()
        .with_context(|| format!("reading headers of {}", path.display()))?
        .iter()
        .enumerate()
        .map(|(i, name)| (normalize_header(name), i))
        .collect();

    if !headers.contains_key("loypredm2") {
        return Err(PipelineError::MissingColumn("loypredm2").into());
    }

    let text_field = |record: &csv::StringRecord, name: &str| -> Option<String> {
        let idx = *headers.get(name)?;
        let value = record.get(idx)?.trim().trim_matches('"').trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    };
    let num_field = |record: &csv::StringRecord, name: &str| -> Option<f64> {
        let idx = *headers.get(name)?;
        parse_french_number(record.get(idx)?)
    };

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;

        rows.push(RentRecord {
            id_zone: text_field(&record, "id_zone"),
            insee_code: text_field(&record, "INSEE_C"),
            commune: text_field(&record, "LIBGEO"),
            epci: text_field(&record, "EPCI"),
            departement: text_field(&record, "DEP"),
            region: text_field(&record, "REG"),
            loypredm2: num_field(&record, "loypredm2"),
            lwr_ipm2: num_field(&record, "lwr_IPm2"),
            upr_ipm2: num_field(&record, "upr_IPm2"),
            typpred: text_field(&record, "TYPPRED"),
            nbobs_com: num_field(&record, "nbobs_com").map(|v| v as u32),
            nbobs_mail: num_field(&record, "nbobs_mail").map(|v| v as u32),
            r2_adj: num_field(&record, "R2_adj"),
            type_bien: type_bien.to_string(),
        });
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn test_config(name: &str) -> Config {
        let root = env::temp_dir().join(format!("rent_dl_{name}"));
        let _ = fs::remove_dir_all(&root);
        let config = Config::defaults(&root);
        fs::create_dir_all(&config.raw_data_dir).unwrap();
        config
    }

    fn cleanup(config: &Config) {
        let root = config.raw_data_dir.parent().unwrap().parent().unwrap();
        let _ = fs::remove_dir_all(root);
    }

    const HEADER: &str = "id_zone;INSEE_C;LIBGEO;EPCI;DEP;REG;loypredm2;lwr_IPm2;upr_IPm2;TYPPRED;nbobs_com;nbobs_mail;R2_adj";

    #[test]
    fn test_parse_french_number() {
        assert_eq!(parse_french_number("28,5"), Some(28.5));
        assert_eq!(parse_french_number("\"0,62\""), Some(0.62));
        assert_eq!(parse_french_number("150"), Some(150.0));
        assert_eq!(parse_french_number(""), None);
        assert_eq!(parse_french_number("n/a"), None);
    }

    #[test]
    fn test_normalize_header() {
        assert_eq!(normalize_header("\"R2.adj\""), "R2_adj");
        assert_eq!(normalize_header(" lwr.IPm2 "), "lwr_IPm2");
        assert_eq!(normalize_header("LIBGEO"), "LIBGEO");
    }

    #[test]
    fn test_sniff_delimiter() {
        assert_eq!(sniff_delimiter("a;b;c"), b';');
        assert_eq!(sniff_delimiter("a,b,c"), b',');
        assert_eq!(sniff_delimiter("\"a\";\"b,c\";\"d\""), b';');
    }

    #[test]
    fn test_decode_ladder_accepts_latin1_accents() {
        let config = test_config("latin1");
        let path = config.raw_data_dir.join("latin1.csv");
        // "Créteil" with é as the single Latin-1 byte 0xE9: invalid UTF-8.
        let mut bytes = b"LIBGEO;loypredm2\nCr".to_vec();
        bytes.push(0xE9);
        bytes.extend_from_slice(b"teil;22,3\n");
        fs::write(&path, &bytes).unwrap();

        let rows = parse_rent_csv(&path, TYPE_ALL).unwrap();
        assert_eq!(rows[0].commune.as_deref(), Some("Créteil"));
        assert_eq!(rows[0].loypredm2, Some(22.3));
        cleanup(&config);
    }

    #[test]
    fn test_encoding_exhaustion_is_a_hard_error() {
        let config = test_config("exhausted");
        let path = config.raw_data_dir.join("bad.csv");
        let err =
            decode_candidates(&[0xFF, 0xFE, 0x00], &[encoding_rs::UTF_8], &path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::EncodingExhausted { .. })
        ));
        cleanup(&config);
    }

    #[test]
    fn test_parse_full_row() {
        let config = test_config("full_row");
        let path = config.raw_data_dir.join("rent.csv");
        fs::write(
            &path,
            format!("{HEADER}\nZ1;75056;Paris;200054781;75;11;28,5;26,1;30,9;maille;150;320;0,75\n"),
        )
        .unwrap();

        let rows = parse_rent_csv(&path, TYPE_APARTMENTS).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.insee_code.as_deref(), Some("75056"));
        assert_eq!(row.commune.as_deref(), Some("Paris"));
        assert_eq!(row.departement.as_deref(), Some("75"));
        assert_eq!(row.loypredm2, Some(28.5));
        assert_eq!(row.lwr_ipm2, Some(26.1));
        assert_eq!(row.upr_ipm2, Some(30.9));
        assert_eq!(row.nbobs_com, Some(150));
        assert_eq!(row.nbobs_mail, Some(320));
        assert_eq!(row.r2_adj, Some(0.75));
        assert_eq!(row.type_bien, TYPE_APARTMENTS);
        cleanup(&config);
    }

    #[test]
    fn test_missing_rent_column_is_contract_violation() {
        let config = test_config("no_loypred");
        let path = config.raw_data_dir.join("rent.csv");
        fs::write(&path, "LIBGEO;DEP\nParis;75\n").unwrap();

        let err = parse_rent_csv(&path, TYPE_ALL).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingColumn("loypredm2"))
        ));
        cleanup(&config);
    }

    #[test]
    fn test_load_prefers_split_files_and_tags_types() {
        let config = test_config("split");
        let downloader = RentDownloader::new(&config);

        fs::write(
            downloader.typed_path(2024, TYPE_APARTMENTS),
            format!("{HEADER}\nZ1;75056;Paris;E1;75;11;28,5;26,1;30,9;commune;150;320;0,75\n"),
        )
        .unwrap();
        fs::write(
            downloader.typed_path(2024, TYPE_HOUSES),
            format!("{HEADER}\nZ2;77288;Meaux;E2;77;11;13,2;11,8;14,7;commune;45;90;0,61\n"),
        )
        .unwrap();

        let rows = downloader.load(2024, None).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].type_bien, TYPE_APARTMENTS);
        assert_eq!(rows[1].type_bien, TYPE_HOUSES);

        let houses_only = downloader.load(2024, Some(TYPE_HOUSES)).unwrap();
        assert_eq!(houses_only.len(), 1);
        assert_eq!(houses_only[0].commune.as_deref(), Some("Meaux"));
        cleanup(&config);
    }

    #[test]
    fn test_load_requested_type_missing_file() {
        let config = test_config("type_missing");
        let downloader = RentDownloader::new(&config);

        fs::write(
            downloader.typed_path(2024, TYPE_APARTMENTS),
            format!("{HEADER}\nZ1;75056;Paris;E1;75;11;28,5;;;commune;;;\n"),
        )
        .unwrap();

        let err = downloader.load(2024, Some(TYPE_HOUSES)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingData { .. })
        ));
        cleanup(&config);
    }

    #[test]
    fn test_load_nothing_cached_is_missing_data() {
        let config = test_config("nothing");
        let downloader = RentDownloader::new(&config);

        let err = downloader.load(2024, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingData { year: 2024, .. })
        ));
        cleanup(&config);
    }

    #[test]
    fn test_filter_region() {
        let config = test_config("filter");
        let downloader = RentDownloader::new(&config);

        let row = |dep: Option<&str>| RentRecord {
            id_zone: None,
            insee_code: None,
            commune: None,
            epci: None,
            departement: dep.map(String::from),
            region: None,
            loypredm2: Some(10.0),
            lwr_ipm2: None,
            upr_ipm2: None,
            typpred: None,
            nbobs_com: None,
            nbobs_mail: None,
            r2_adj: None,
            type_bien: TYPE_ALL.to_string(),
        };

        let filtered =
            downloader.filter_region(vec![row(Some("75")), row(Some("69")), row(Some("94"))]);
        assert_eq!(filtered.len(), 2);

        // No department information at all: passthrough, not an empty table.
        let passthrough = downloader.filter_region(vec![row(None), row(None)]);
        assert_eq!(passthrough.len(), 2);
        cleanup(&config);
    }

    #[tokio::test]
    async fn test_download_unconfigured_year_reports_config_error() {
        let config = test_config("nourl");
        let downloader = RentDownloader::new(&config);

        let err = downloader.download(2099, None, false).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NoUrlConfigured(2099))
        ));
        cleanup(&config);
    }

    #[tokio::test]
    async fn test_download_reuses_cached_single_file() {
        let config = test_config("cached_single");
        let downloader = RentDownloader::new(&config);

        let cached = downloader.single_path(2018);
        fs::write(&cached, "LIBGEO;loypredm2\n").unwrap();

        let result = downloader.download(2018, None, false).await.unwrap();
        assert_eq!(result, DownloadedRent::Single(cached));
        cleanup(&config);
    }
}
