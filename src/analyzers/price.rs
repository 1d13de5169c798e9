//! Sale-price statistics per commune and department.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::analyzers::utility::{max, mean, median, min};
use crate::cleaner::DataCleaner;
use crate::config::Config;
use crate::records::CleanTransaction;

/// Transaction counts by room count. Bucket boundaries are fixed business
/// constants: exactly 1–4 rooms, then 5 or more.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoomBuckets {
    pub une_piece: usize,
    pub deux_pieces: usize,
    pub trois_pieces: usize,
    pub quatre_pieces: usize,
    pub cinq_pieces_et_plus: usize,
}

impl RoomBuckets {
    fn count(rows: &[&CleanTransaction]) -> Self {
        let mut buckets = RoomBuckets::default();
        for row in rows {
            match row.nombre_pieces_principales {
                Some(1) => buckets.une_piece += 1,
                Some(2) => buckets.deux_pieces += 1,
                Some(3) => buckets.trois_pieces += 1,
                Some(4) => buckets.quatre_pieces += 1,
                Some(n) if n >= 5 => buckets.cinq_pieces_et_plus += 1,
                _ => {}
            }
        }
        buckets
    }
}

/// Statistics for one property-type subset (apartments or houses).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyTypeStats {
    pub prix_moyen_m2: f64,
    pub prix_min_m2: f64,
    pub prix_max_m2: f64,
    pub nombre_transactions: usize,
    pub surface_moyenne: f64,
}

/// Sale statistics for one commune, recomputed on every query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CityStats {
    pub prix_moyen_m2: f64,
    pub prix_median_m2: f64,
    pub prix_min_m2: f64,
    pub prix_max_m2: f64,
    pub nombre_transactions: usize,
    pub surface_moyenne: f64,
    pub pieces: RoomBuckets,
    /// Present only when the commune has apartment sales.
    pub appartements: Option<PropertyTypeStats>,
    /// Present only when the commune has house sales.
    pub maisons: Option<PropertyTypeStats>,
}

/// One row of the all-cities (or per-department) result table.
#[derive(Debug, Clone, Serialize)]
pub struct CityPriceRow {
    pub ville: String,
    pub code_departement: String,
    #[serde(flatten)]
    pub stats: CityStats,
}

pub struct PriceAnalyzer<'a> {
    cleaner: DataCleaner<'a>,
    data: Option<Vec<CleanTransaction>>,
}

impl<'a> PriceAnalyzer<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            cleaner: DataCleaner::new(config),
            data: None,
        }
    }

    /// Analyzer over an already-cleaned in-memory table.
    pub fn with_data(config: &'a Config, data: Vec<CleanTransaction>) -> Self {
        Self {
            cleaner: DataCleaner::new(config),
            data: Some(data),
        }
    }

    /// Loads the cleaned snapshot for a year into this instance.
    pub fn load_data(&mut self, year: u16) -> Result<()> {
        self.data = Some(self.cleaner.load_cleaned(year)?);
        Ok(())
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    fn data(&self) -> Result<&[CleanTransaction]> {
        self.data
            .as_deref()
            .context("no data loaded; call load_data() first")
    }

    /// Statistics for one commune, matched by case-insensitive exact name.
    /// `None` when the commune has no transactions — an expected outcome,
    /// not an error.
    pub fn city_stats(&self, city_name: &str) -> Result<Option<CityStats>> {
        let data = self.data()?;
        let needle = city_name.to_uppercase();

        let rows: Vec<&CleanTransaction> = data
            .iter()
            .filter(|r| r.nom_commune.to_uppercase() == needle)
            .collect();

        if rows.is_empty() {
            warn!(city = city_name, "No transactions found");
            return Ok(None);
        }

        Ok(Some(compute_city_stats(&rows)))
    }

    /// Per-commune statistics over the whole table, sorted descending by
    /// mean price per m². The department code is taken from the commune's
    /// first row (communes belong to exactly one department in this data).
    pub fn analyze_all_cities(&self) -> Result<Vec<CityPriceRow>> {
        let data = self.data()?;
        info!("Analyzing all cities");

        let results = per_city_rows(data);
        info!(cities = results.len(), "City analysis finished");
        Ok(results)
    }

    /// Per-commune statistics restricted to one department. Empty when the
    /// department has no rows.
    pub fn department_stats(&self, dept_code: &str) -> Result<Vec<CityPriceRow>> {
        let data = self.data()?;

        let dept_rows: Vec<CleanTransaction> = data
            .iter()
            .filter(|r| r.code_departement == dept_code)
            .cloned()
            .collect();

        if dept_rows.is_empty() {
            warn!(dept = dept_code, "No transactions for department");
            return Ok(Vec::new());
        }

        Ok(per_city_rows(&dept_rows))
    }
}

fn per_city_rows(data: &[CleanTransaction]) -> Vec<CityPriceRow> {
    let mut seen = HashSet::new();
    let mut results = Vec::new();

    for row in data {
        if !seen.insert(row.nom_commune.to_uppercase()) {
            continue;
        }

        let needle = row.nom_commune.to_uppercase();
        let city_rows: Vec<&CleanTransaction> = data
            .iter()
            .filter(|r| r.nom_commune.to_uppercase() == needle)
            .collect();

        results.push(CityPriceRow {
            ville: row.nom_commune.clone(),
            code_departement: row.code_departement.clone(),
            stats: compute_city_stats(&city_rows),
        });
    }

    results.sort_by(|a, b| b.stats.prix_moyen_m2.total_cmp(&a.stats.prix_moyen_m2));
    results
}

fn compute_city_stats(rows: &[&CleanTransaction]) -> CityStats {
    let prices: Vec<f64> = rows.iter().map(|r| r.prix_m2).collect();
    let surfaces: Vec<f64> = rows.iter().map(|r| r.surface_reelle_bati).collect();

    let apartments: Vec<&CleanTransaction> =
        rows.iter().copied().filter(|r| r.is_apartment()).collect();
    let houses: Vec<&CleanTransaction> =
        rows.iter().copied().filter(|r| r.is_house()).collect();

    CityStats {
        prix_moyen_m2: mean(&prices),
        prix_median_m2: median(&prices).unwrap_or_default(),
        prix_min_m2: min(&prices).unwrap_or_default(),
        prix_max_m2: max(&prices).unwrap_or_default(),
        nombre_transactions: rows.len(),
        surface_moyenne: mean(&surfaces),
        pieces: RoomBuckets::count(rows),
        appartements: property_type_stats(&apartments),
        maisons: property_type_stats(&houses),
    }
}

fn property_type_stats(rows: &[&CleanTransaction]) -> Option<PropertyTypeStats> {
    if rows.is_empty() {
        return None;
    }
    let prices: Vec<f64> = rows.iter().map(|r| r.prix_m2).collect();
    let surfaces: Vec<f64> = rows.iter().map(|r| r.surface_reelle_bati).collect();

    Some(PropertyTypeStats {
        prix_moyen_m2: mean(&prices),
        prix_min_m2: min(&prices).unwrap_or_default(),
        prix_max_m2: max(&prices).unwrap_or_default(),
        nombre_transactions: rows.len(),
        surface_moyenne: mean(&surfaces),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{APARTMENT_LABEL, HOUSE_LABEL};
    use std::env;
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config::defaults(&PathBuf::from(env::temp_dir()).join("price_analyzer"))
    }

    fn tx(
        commune: &str,
        dept: &str,
        prix_m2: f64,
        surface: f64,
        type_local: &str,
        rooms: Option<u32>,
    ) -> CleanTransaction {
        CleanTransaction {
            date_mutation: None,
            nature_mutation: "Vente".to_string(),
            valeur_fonciere: prix_m2 * surface,
            code_commune: String::new(),
            nom_commune: commune.to_string(),
            code_departement: dept.to_string(),
            type_local: Some(type_local.to_string()),
            surface_reelle_bati: surface,
            nombre_pieces_principales: rooms,
            prix_m2,
        }
    }

    fn sample() -> Vec<CleanTransaction> {
        vec![
            tx("Paris", "75", 10_000.0, 50.0, APARTMENT_LABEL, Some(2)),
            tx("Paris", "75", 12_000.0, 60.0, APARTMENT_LABEL, Some(3)),
            tx("Versailles", "78", 8_000.0, 80.0, HOUSE_LABEL, Some(4)),
            tx("Versailles", "78", 9_000.0, 90.0, HOUSE_LABEL, Some(6)),
        ]
    }

    #[test]
    fn test_city_stats_paris() {
        let config = test_config();
        let analyzer = PriceAnalyzer::with_data(&config, sample());

        let stats = analyzer.city_stats("Paris").unwrap().unwrap();
        assert_eq!(stats.prix_moyen_m2, 11_000.0);
        assert_eq!(stats.prix_min_m2, 10_000.0);
        assert_eq!(stats.prix_max_m2, 12_000.0);
        assert_eq!(stats.nombre_transactions, 2);
        assert_eq!(stats.surface_moyenne, 55.0);
    }

    #[test]
    fn test_city_stats_is_case_insensitive() {
        let config = test_config();
        let analyzer = PriceAnalyzer::with_data(&config, sample());

        let lower = analyzer.city_stats("paris").unwrap().unwrap();
        let upper = analyzer.city_stats("PARIS").unwrap().unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn test_city_stats_unknown_city_is_none() {
        let config = test_config();
        let analyzer = PriceAnalyzer::with_data(&config, sample());
        assert!(analyzer.city_stats("Unknown").unwrap().is_none());
    }

    #[test]
    fn test_stats_ordering_invariants() {
        let config = test_config();
        let analyzer = PriceAnalyzer::with_data(&config, sample());

        for city in ["Paris", "Versailles"] {
            let stats = analyzer.city_stats(city).unwrap().unwrap();
            assert!(stats.prix_min_m2 <= stats.prix_median_m2);
            assert!(stats.prix_median_m2 <= stats.prix_max_m2);
            assert!(stats.prix_min_m2 <= stats.prix_moyen_m2);
            assert!(stats.prix_moyen_m2 <= stats.prix_max_m2);
        }
    }

    #[test]
    fn test_room_buckets() {
        let config = test_config();
        let mut data = sample();
        data.push(tx("Paris", "75", 11_000.0, 20.0, APARTMENT_LABEL, Some(1)));
        data.push(tx("Paris", "75", 11_500.0, 150.0, APARTMENT_LABEL, Some(5)));
        data.push(tx("Paris", "75", 10_500.0, 45.0, APARTMENT_LABEL, None));
        let analyzer = PriceAnalyzer::with_data(&config, data);

        let stats = analyzer.city_stats("Paris").unwrap().unwrap();
        assert_eq!(stats.pieces.une_piece, 1);
        assert_eq!(stats.pieces.deux_pieces, 1);
        assert_eq!(stats.pieces.trois_pieces, 1);
        assert_eq!(stats.pieces.quatre_pieces, 0);
        assert_eq!(stats.pieces.cinq_pieces_et_plus, 1);

        let versailles = analyzer.city_stats("Versailles").unwrap().unwrap();
        assert_eq!(versailles.pieces.quatre_pieces, 1);
        assert_eq!(versailles.pieces.cinq_pieces_et_plus, 1);
    }

    #[test]
    fn test_property_type_subsets() {
        let config = test_config();
        let mut data = sample();
        data.push(tx("Paris", "75", 9_000.0, 110.0, HOUSE_LABEL, Some(5)));
        let analyzer = PriceAnalyzer::with_data(&config, data);

        let paris = analyzer.city_stats("Paris").unwrap().unwrap();
        let apparts = paris.appartements.unwrap();
        assert_eq!(apparts.nombre_transactions, 2);
        assert_eq!(apparts.prix_moyen_m2, 11_000.0);
        let maisons = paris.maisons.unwrap();
        assert_eq!(maisons.nombre_transactions, 1);

        // Versailles has no apartment sales: that subset is absent.
        let versailles = analyzer.city_stats("Versailles").unwrap().unwrap();
        assert!(versailles.appartements.is_none());
        assert!(versailles.maisons.is_some());
    }

    #[test]
    fn test_analyze_all_cities_sorted_descending_with_departments() {
        let config = test_config();
        let analyzer = PriceAnalyzer::with_data(&config, sample());

        let rows = analyzer.analyze_all_cities().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ville, "Paris");
        assert_eq!(rows[0].code_departement, "75");
        assert_eq!(rows[1].ville, "Versailles");
        assert_eq!(rows[1].code_departement, "78");
        assert!(rows[0].stats.prix_moyen_m2 >= rows[1].stats.prix_moyen_m2);
    }

    #[test]
    fn test_department_stats_restricts_and_empty_is_ok() {
        let config = test_config();
        let analyzer = PriceAnalyzer::with_data(&config, sample());

        let dept78 = analyzer.department_stats("78").unwrap();
        assert_eq!(dept78.len(), 1);
        assert_eq!(dept78[0].ville, "Versailles");

        assert!(analyzer.department_stats("93").unwrap().is_empty());
    }

    #[test]
    fn test_unloaded_analyzer_errors() {
        let config = test_config();
        let analyzer = PriceAnalyzer::new(&config);
        assert!(analyzer.city_stats("Paris").is_err());
    }
}
