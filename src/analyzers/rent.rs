//! Rent-indicator statistics per commune and department.

use anyhow::Result;
use serde::Serialize;
use std::cell::OnceCell;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::config::{Config, IDF_DEPARTMENTS, MIN_RELIABLE_OBSERVATIONS, MIN_RELIABLE_R2};
use crate::download::rent::{RentDownloader, RentRecord, TYPE_ALL};

/// Commune selector for rent lookups. The enum makes "neither criterion" and
/// "both criteria" unrepresentable.
#[derive(Debug, Clone, Copy)]
pub enum CityQuery<'a> {
    /// Case-insensitive exact commune name.
    Name(&'a str),
    /// Exact INSEE code.
    Insee(&'a str),
}

/// Rent indicators for one commune (× property type).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RentStats {
    /// Predicted rent in EUR per m² per month.
    pub loyer_moyen_m2: Option<f64>,
    pub loyer_bas_m2: Option<f64>,
    pub loyer_haut_m2: Option<f64>,
    pub type_prediction: Option<String>,
    pub nb_observations_commune: Option<u32>,
    pub nb_observations_maille: Option<u32>,
    pub r2_ajuste: Option<f64>,
    pub id_maille: Option<String>,
}

impl RentStats {
    pub fn from_record(record: &RentRecord) -> Self {
        RentStats {
            loyer_moyen_m2: record.loypredm2,
            loyer_bas_m2: record.lwr_ipm2,
            loyer_haut_m2: record.upr_ipm2,
            type_prediction: record.typpred.clone(),
            nb_observations_commune: record.nbobs_com,
            nb_observations_maille: record.nbobs_mail,
            r2_ajuste: record.r2_adj,
            id_maille: record.id_zone.clone(),
        }
    }

    /// The indicator is reliable only with a good enough regression fit and
    /// enough commune-level observations. Recomputed from the stored fields
    /// on every call; a missing value on either side is unreliable.
    pub fn is_reliable(&self) -> bool {
        match (self.r2_ajuste, self.nb_observations_commune) {
            (Some(r2), Some(obs)) => r2 >= MIN_RELIABLE_R2 && obs >= MIN_RELIABLE_OBSERVATIONS,
            _ => false,
        }
    }
}

/// Lookup result shape: single-file vintages yield one stats object, split
/// vintages one per property type present for the commune.
#[derive(Debug, Clone, PartialEq)]
pub enum RentLookup {
    Single(RentStats),
    ByPropertyType(BTreeMap<String, RentStats>),
}

/// Rent aggregate over the communes of one department.
#[derive(Debug, Clone, Serialize)]
pub struct DepartmentRentStats {
    pub nb_communes: usize,
    pub loyer_moyen: f64,
    pub loyer_median: f64,
    pub loyer_min: f64,
    pub loyer_max: f64,
    pub loyer_bas_moyen: f64,
    pub loyer_haut_moyen: f64,
}

/// One row of the region rollup.
#[derive(Debug, Clone, Serialize)]
pub struct RegionRentRow {
    pub department_code: String,
    pub department_name: String,
    #[serde(flatten)]
    pub stats: DepartmentRentStats,
}

/// One row of a multi-city comparison.
#[derive(Debug, Clone, Serialize)]
pub struct CityRentComparison {
    pub commune: String,
    pub loyer_moyen_m2: Option<f64>,
    pub loyer_bas_m2: Option<f64>,
    pub loyer_haut_m2: Option<f64>,
    pub type_prediction: Option<String>,
    pub fiable: bool,
    pub nb_observations: Option<u32>,
}

pub struct RentAnalyzer<'a> {
    year: u16,
    downloader: RentDownloader<'a>,
    data: OnceCell<Vec<RentRecord>>,
}

impl<'a> RentAnalyzer<'a> {
    pub fn new(config: &'a Config, year: u16) -> Self {
        Self {
            year,
            downloader: RentDownloader::new(config),
            data: OnceCell::new(),
        }
    }

    /// Analyzer over an in-memory table (already region-filtered).
    pub fn with_data(config: &'a Config, year: u16, data: Vec<RentRecord>) -> Self {
        Self {
            year,
            downloader: RentDownloader::new(config),
            data: OnceCell::from(data),
        }
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    /// The Île-de-France rent table, loaded lazily on first access and
    /// cached for this instance's lifetime.
    pub fn table(&self) -> Result<&[RentRecord]> {
        if let Some(rows) = self.data.get() {
            return Ok(rows);
        }

        let rows = self.downloader.load(self.year, None)?;
        let idf = self.downloader.filter_region(rows);
        info!(year = self.year, communes = idf.len(), "Rent data loaded");
        Ok(self.data.get_or_init(move || idf))
    }

    /// Rent statistics for one commune. `None` when nothing matches.
    pub fn city_rent_stats(&self, query: CityQuery<'_>) -> Result<Option<RentLookup>> {
        let table = self.table()?;

        let matches: Vec<&RentRecord> = table.iter().filter(|r| query_matches(r, query)).collect();

        if matches.is_empty() {
            warn!(?query, "No rent data found");
            return Ok(None);
        }

        // Single-file vintages carry the pooled tag: one stats object.
        if matches[0].type_bien == TYPE_ALL {
            return Ok(Some(RentLookup::Single(RentStats::from_record(matches[0]))));
        }

        let by_type: BTreeMap<String, RentStats> = matches
            .iter()
            .map(|r| (r.type_bien.clone(), RentStats::from_record(r)))
            .collect();
        Ok(Some(RentLookup::ByPropertyType(by_type)))
    }

    /// Aggregate over one department's communes. `None` when the department
    /// has no rows — expected, not an error.
    pub fn department_statistics(&self, dept_code: &str) -> Result<Option<DepartmentRentStats>> {
        let table = self.table()?;

        let dept_rows: Vec<&RentRecord> = table
            .iter()
            .filter(|r| r.departement.as_deref() == Some(dept_code))
            .collect();

        if dept_rows.is_empty() {
            warn!(dept = dept_code, "No rent data for department");
            return Ok(None);
        }

        Ok(Some(aggregate_department(&dept_rows)))
    }

    /// The department aggregate for every Île-de-France department that has
    /// data.
    pub fn region_statistics(&self) -> Result<Vec<RegionRentRow>> {
        let mut results = Vec::new();
        for (code, name) in IDF_DEPARTMENTS {
            if let Some(stats) = self.department_statistics(code)? {
                results.push(RegionRentRow {
                    department_code: (*code).to_string(),
                    department_name: (*name).to_string(),
                    stats,
                });
            }
        }
        Ok(results)
    }

    /// The `n` communes with the highest (or lowest, `ascending`) predicted
    /// rent, optionally restricted to one department. Ties are broken by
    /// commune name so the order is a total one.
    pub fn top_cities(
        &self,
        n: usize,
        department_code: Option<&str>,
        ascending: bool,
    ) -> Result<Vec<RentRecord>> {
        let table = self.table()?;

        let mut eligible: Vec<&RentRecord> = table
            .iter()
            .filter(|r| r.loypredm2.is_some())
            .filter(|r| {
                department_code.is_none_or(|dept| r.departement.as_deref() == Some(dept))
            })
            .collect();

        eligible.sort_by(|a, b| {
            let key_a = (a.loypredm2.unwrap_or_default(), a.commune.as_deref().unwrap_or(""));
            let key_b = (b.loypredm2.unwrap_or_default(), b.commune.as_deref().unwrap_or(""));
            let ordering = key_a.0.total_cmp(&key_b.0).then(key_a.1.cmp(key_b.1));
            if ascending { ordering } else { ordering.reverse() }
        });

        Ok(eligible.into_iter().take(n).cloned().collect())
    }

    /// One comparison row per found commune, in descending-rent order.
    /// Unmatched names are silently dropped.
    pub fn compare_cities(&self, city_names: &[&str]) -> Result<Vec<CityRentComparison>> {
        let table = self.table()?;

        let mut comparisons = Vec::new();
        for name in city_names {
            let needle = name.to_uppercase();
            let Some(record) = table
                .iter()
                .find(|r| r.commune.as_deref().is_some_and(|c| c.to_uppercase() == needle))
            else {
                continue;
            };

            let stats = RentStats::from_record(record);
            comparisons.push(CityRentComparison {
                commune: (*name).to_string(),
                loyer_moyen_m2: stats.loyer_moyen_m2,
                loyer_bas_m2: stats.loyer_bas_m2,
                loyer_haut_m2: stats.loyer_haut_m2,
                type_prediction: stats.type_prediction.clone(),
                fiable: stats.is_reliable(),
                nb_observations: stats.nb_observations_commune,
            });
        }

        comparisons.sort_by(|a, b| {
            b.loyer_moyen_m2
                .unwrap_or_default()
                .total_cmp(&a.loyer_moyen_m2.unwrap_or_default())
        });
        Ok(comparisons)
    }
}

fn query_matches(record: &RentRecord, query: CityQuery<'_>) -> bool {
    match query {
        CityQuery::Name(name) => record
            .commune
            .as_deref()
            .is_some_and(|c| c.to_uppercase() == name.to_uppercase()),
        CityQuery::Insee(code) => record.insee_code.as_deref() == Some(code),
    }
}

fn aggregate_department(rows: &[&RentRecord]) -> DepartmentRentStats {
    use crate::analyzers::utility::{max, mean, median, min};

    let rents: Vec<f64> = rows.iter().filter_map(|r| r.loypredm2).collect();
    let lower: Vec<f64> = rows.iter().filter_map(|r| r.lwr_ipm2).collect();
    let upper: Vec<f64> = rows.iter().filter_map(|r| r.upr_ipm2).collect();

    DepartmentRentStats {
        nb_communes: rows.len(),
        loyer_moyen: mean(&rents),
        loyer_median: median(&rents).unwrap_or_default(),
        loyer_min: min(&rents).unwrap_or_default(),
        loyer_max: max(&rents).unwrap_or_default(),
        loyer_bas_moyen: mean(&lower),
        loyer_haut_moyen: mean(&upper),
    }
}
