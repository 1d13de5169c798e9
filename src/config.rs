//! Project configuration: business constants, directory layout, and
//! per-year download URLs.
//!
//! A [`Config`] is built once at startup with [`Config::load`] and passed by
//! reference to every downloader and analyzer. It is never mutated after
//! construction; an optional `config_urls.json` at the project root is merged
//! in exactly once (override wins, absent file is a silent no-op).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Lower bound of the accepted price band, in EUR per m².
pub const MIN_PRICE_M2: f64 = 500.0;
/// Upper bound of the accepted price band, in EUR per m².
pub const MAX_PRICE_M2: f64 = 25_000.0;
/// Minimum built surface in m² (legal minimum habitable surface).
pub const MIN_SURFACE: f64 = 9.0;

/// Mutation natures retained by the cleaner. Only final sales.
pub const VALID_MUTATION_TYPES: &[&str] = &["Vente"];

/// A rent indicator is reliable only above this adjusted R².
pub const MIN_RELIABLE_R2: f64 = 0.5;
/// A rent indicator is reliable only with at least this many commune-level
/// observations.
pub const MIN_RELIABLE_OBSERVATIONS: u32 = 30;

pub const DVF_BASE_URL: &str = "https://files.data.gouv.fr/geo-dvf/latest/csv";

/// Île-de-France department codes and names.
pub static IDF_DEPARTMENTS: &[(&str, &str)] = &[
    ("75", "Paris"),
    ("77", "Seine-et-Marne"),
    ("78", "Yvelines"),
    ("91", "Essonne"),
    ("92", "Hauts-de-Seine"),
    ("93", "Seine-Saint-Denis"),
    ("94", "Val-de-Marne"),
    ("95", "Val-d'Oise"),
];

pub fn is_idf_department(code: &str) -> bool {
    IDF_DEPARTMENTS.iter().any(|(c, _)| *c == code)
}

/// Per-year DVF URL override: either a template containing a `{dept}`
/// placeholder, or an explicit per-department map.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DvfUrlSource {
    Template(String),
    PerDepartment(BTreeMap<String, String>),
}

impl DvfUrlSource {
    /// Resolves the download URL for one department, or `None` when a
    /// per-department map has no entry for it.
    pub fn url_for(&self, dept: &str) -> Option<String> {
        match self {
            DvfUrlSource::Template(template) => Some(template.replace("{dept}", dept)),
            DvfUrlSource::PerDepartment(map) => map.get(dept).cloned(),
        }
    }
}

/// Per-year rent URL source: one CSV for the whole vintage (older format) or
/// one CSV per property type (newer format).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RentUrlSource {
    Single(String),
    PerType(BTreeMap<String, String>),
}

/// Shape of the optional `config_urls.json` override file.
#[derive(Debug, Default, Deserialize)]
struct UrlOverrides {
    #[serde(default)]
    dvf: BTreeMap<u16, DvfUrlSource>,
    #[serde(default)]
    rent: BTreeMap<u16, RentUrlSource>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub raw_data_dir: PathBuf,
    pub processed_data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub dvf_urls: BTreeMap<u16, DvfUrlSource>,
    pub rent_urls: BTreeMap<u16, RentUrlSource>,
}

impl Config {
    /// Builds the configuration rooted at `root`, merging `config_urls.json`
    /// if present, and creates the data directories.
    pub fn load(root: &Path) -> Result<Self> {
        let mut config = Self::defaults(root);

        let override_path = root.join("config_urls.json");
        if override_path.exists() {
            let content = std::fs::read_to_string(&override_path)
                .with_context(|| format!("reading {}", override_path.display()))?;
            let overrides: UrlOverrides = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", override_path.display()))?;

            for (year, source) in overrides.dvf {
                config.dvf_urls.insert(year, source);
            }
            for (year, source) in overrides.rent {
                config.rent_urls.insert(year, source);
            }
            info!(path = %override_path.display(), "Custom URL configuration merged");
        }

        for dir in [
            &config.raw_data_dir,
            &config.processed_data_dir,
            &config.reports_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }

        Ok(config)
    }

    /// Built-in defaults, without touching the filesystem.
    pub fn defaults(root: &Path) -> Self {
        let data_dir = root.join("data");

        let mut rent_urls = BTreeMap::new();
        // Older vintages ship one commune-level CSV.
        rent_urls.insert(
            2018,
            RentUrlSource::Single(
                "https://static.data.gouv.fr/resources/carte-des-loyers-indicateurs-de-loyers-dannonce-par-commune-en-2018/indicateurs-loyers-communes.csv"
                    .to_string(),
            ),
        );
        // Since 2023 the dataset is split by property type.
        rent_urls.insert(
            2024,
            RentUrlSource::PerType(BTreeMap::from([
                (
                    "appartements".to_string(),
                    "https://static.data.gouv.fr/resources/carte-des-loyers-indicateurs-de-loyers-dannonce-par-commune-en-2024/indicateurs-loyers-appartements.csv"
                        .to_string(),
                ),
                (
                    "maisons".to_string(),
                    "https://static.data.gouv.fr/resources/carte-des-loyers-indicateurs-de-loyers-dannonce-par-commune-en-2024/indicateurs-loyers-maisons.csv"
                        .to_string(),
                ),
            ])),
        );

        Config {
            raw_data_dir: data_dir.join("raw"),
            processed_data_dir: data_dir.join("processed"),
            reports_dir: root.join("outputs").join("reports"),
            dvf_urls: BTreeMap::new(),
            rent_urls,
        }
    }

    /// Resolves the DVF URL for a department and year: per-year override
    /// first, then the built-in pattern.
    pub fn dvf_url(&self, dept: &str, year: u16) -> Option<String> {
        if let Some(source) = self.dvf_urls.get(&year) {
            return source.url_for(dept);
        }
        Some(format!("{DVF_BASE_URL}/{year}/departements/{dept}.csv.gz"))
    }

    pub fn rent_url(&self, year: u16) -> Option<&RentUrlSource> {
        self.rent_urls.get(&year)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn temp_root(name: &str) -> PathBuf {
        let root = env::temp_dir().join(format!("dvf_analyzer_{name}"));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn test_default_dvf_url_pattern() {
        let config = Config::defaults(Path::new("/tmp/x"));
        assert_eq!(
            config.dvf_url("75", 2023).unwrap(),
            "https://files.data.gouv.fr/geo-dvf/latest/csv/2023/departements/75.csv.gz"
        );
    }

    #[test]
    fn test_template_override_replaces_dept_placeholder() {
        let source = DvfUrlSource::Template("https://mirror.example/dvf/{dept}.csv.gz".into());
        assert_eq!(
            source.url_for("92").unwrap(),
            "https://mirror.example/dvf/92.csv.gz"
        );
    }

    #[test]
    fn test_per_department_override_misses_unlisted_departments() {
        let source = DvfUrlSource::PerDepartment(BTreeMap::from([(
            "75".to_string(),
            "https://mirror.example/paris.csv.gz".to_string(),
        )]));
        assert_eq!(
            source.url_for("75").as_deref(),
            Some("https://mirror.example/paris.csv.gz")
        );
        assert_eq!(source.url_for("92"), None);
    }

    #[test]
    fn test_load_without_override_file_is_a_no_op() {
        let root = temp_root("no_override");
        let config = Config::load(&root).unwrap();
        assert!(config.dvf_urls.is_empty());
        assert!(config.raw_data_dir.exists());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_load_merges_override_file_with_priority() {
        let root = temp_root("override");
        fs::write(
            root.join("config_urls.json"),
            r#"{
                "dvf": { "2023": "https://mirror.example/dvf/2023/{dept}.csv.gz" },
                "rent": {
                    "2024": "https://mirror.example/loyers_2024.csv",
                    "2025": { "appartements": "https://mirror.example/appart_2025.csv" }
                }
            }"#,
        )
        .unwrap();

        let config = Config::load(&root).unwrap();

        assert_eq!(
            config.dvf_url("78", 2023).unwrap(),
            "https://mirror.example/dvf/2023/78.csv.gz"
        );
        // 2024 built-in PerType default is replaced by the Single override.
        assert_eq!(
            config.rent_url(2024),
            Some(&RentUrlSource::Single(
                "https://mirror.example/loyers_2024.csv".to_string()
            ))
        );
        assert!(matches!(
            config.rent_url(2025),
            Some(RentUrlSource::PerType(_))
        ));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_unconfigured_rent_year_returns_none() {
        let config = Config::defaults(Path::new("/tmp/x"));
        assert!(config.rent_url(2099).is_none());
    }

    #[test]
    fn test_idf_department_table() {
        assert_eq!(IDF_DEPARTMENTS.len(), 8);
        assert!(is_idf_department("75"));
        assert!(!is_idf_department("69"));
    }
}
