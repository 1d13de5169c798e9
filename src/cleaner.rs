//! DVF data cleaning.
//!
//! Turns the raw transaction table into the analysis-ready one through a
//! fixed stage order. Each stage narrows the row set used by the next, and
//! the remaining row count is logged after every stage so an empty result
//! can be traced to the stage that emptied it.

use anyhow::Result;
use chrono::NaiveDate;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::config::{
    Config, MAX_PRICE_M2, MIN_PRICE_M2, MIN_SURFACE, VALID_MUTATION_TYPES,
};
use crate::error::PipelineError;
use crate::records::{CleanTransaction, RawTransaction};

pub struct DataCleaner<'a> {
    config: &'a Config,
}

impl<'a> DataCleaner<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Cleans a raw transaction table. Malformed individual rows are
    /// filtered out by the stage whose predicate they fail, never raised on;
    /// the only error is a required column missing from the whole input.
    pub fn clean(&self, rows: Vec<RawTransaction>) -> Result<Vec<CleanTransaction>> {
        let initial_count = rows.len();
        info!(rows = initial_count, "Cleaning transaction data");

        if !rows.is_empty() {
            for (name, absent) in [
                ("nature_mutation", rows.iter().all(|r| r.nature_mutation.is_none())),
                ("valeur_fonciere", rows.iter().all(|r| r.valeur_fonciere.is_none())),
                (
                    "surface_reelle_bati",
                    rows.iter().all(|r| r.surface_reelle_bati.is_none()),
                ),
            ] {
                if absent {
                    return Err(PipelineError::MissingColumn(name).into());
                }
            }
        }

        // 1. Mutation type: final sales only.
        let rows: Vec<RawTransaction> = rows
            .into_iter()
            .filter(|r| {
                r.nature_mutation
                    .as_deref()
                    .is_some_and(|n| VALID_MUTATION_TYPES.contains(&n))
            })
            .collect();
        info!(rows = rows.len(), "After mutation-type filter");

        // 2. Monetary value present and strictly positive.
        let rows: Vec<RawTransaction> = rows
            .into_iter()
            .filter(|r| r.valeur_fonciere.is_some_and(|v| v > 0.0))
            .collect();
        info!(rows = rows.len(), "After monetary-value filter");

        // 3. Built surface present and above the legal minimum. Also
        // guarantees a non-zero denominator for the next stage.
        let rows: Vec<RawTransaction> = rows
            .into_iter()
            .filter(|r| r.surface_reelle_bati.is_some_and(|s| s >= MIN_SURFACE))
            .collect();
        info!(rows = rows.len(), min_surface = MIN_SURFACE, "After surface filter");

        // 4. + 5. Derive price per m² and drop data-entry outliers.
        // 6. + 7. + 8. Project onto the retained column set, parse the date
        // (unparsable → None), normalize the commune name.
        let mut cleaned: Vec<CleanTransaction> = rows
            .into_iter()
            .filter_map(|r| {
                let valeur = r.valeur_fonciere?;
                let surface = r.surface_reelle_bati?;
                let prix_m2 = valeur / surface;
                if !(MIN_PRICE_M2..=MAX_PRICE_M2).contains(&prix_m2) {
                    return None;
                }
                Some(CleanTransaction {
                    date_mutation: r.date_mutation.as_deref().and_then(parse_date),
                    nature_mutation: r.nature_mutation.unwrap_or_default(),
                    valeur_fonciere: valeur,
                    code_commune: r.code_commune.unwrap_or_default(),
                    nom_commune: title_case(r.nom_commune.as_deref().unwrap_or_default()),
                    code_departement: r.code_departement.unwrap_or_default(),
                    type_local: r.type_local,
                    surface_reelle_bati: surface,
                    nombre_pieces_principales: r.nombre_pieces_principales,
                    prix_m2,
                })
            })
            .collect();
        info!(
            rows = cleaned.len(),
            min = MIN_PRICE_M2,
            max = MAX_PRICE_M2,
            "After price-band filter"
        );

        // 9. Exact-duplicate removal over all retained columns.
        let mut seen = HashSet::new();
        cleaned.retain(|r| seen.insert(r.dedup_key()));

        let removed = initial_count.saturating_sub(cleaned.len());
        let removed_pct = if initial_count == 0 {
            0.0
        } else {
            removed as f64 / initial_count as f64 * 100.0
        };
        info!(kept = cleaned.len(), removed, removed_pct, "Cleaning finished");

        Ok(cleaned)
    }

    fn cleaned_path(&self, year: u16) -> std::path::PathBuf {
        self.config
            .processed_data_dir
            .join(format!("dvf_{year}_idf_clean.csv"))
    }

    /// Persists the cleaned snapshot for a year. Re-derivable at any time
    /// from the raw cache, never hand-edited.
    pub fn save_cleaned(&self, rows: &[CleanTransaction], year: u16) -> Result<()> {
        let path = self.cleaned_path(year);
        let mut writer = csv::Writer::from_path(&path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        info!(path = %path.display(), rows = rows.len(), "Cleaned data saved");
        Ok(())
    }

    /// Loads the cleaned snapshot for a year; absence is the catchable
    /// missing-input condition.
    pub fn load_cleaned(&self, year: u16) -> Result<Vec<CleanTransaction>> {
        let path = self.cleaned_path(year);
        if !path.exists() {
            warn!(path = %path.display(), "Cleaned file not found");
            return Err(PipelineError::missing_data(
                "cleaned DVF",
                year,
                format!("run `dvf_analyzer clean --year {year}` first"),
            )
            .into());
        }

        let mut rdr = csv::Reader::from_path(&path)?;
        let mut rows = Vec::new();
        for result in rdr.deserialize() {
            let record: CleanTransaction = result?;
            rows.push(record);
        }
        info!(rows = rows.len(), "Cleaned data loaded");
        Ok(rows)
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// Title-cases a commune name after trimming: every alphabetic run starts
/// with an uppercase letter ("saint-denis" → "Saint-Denis", "L'HAŸ-LES-ROSES"
/// → "L'Haÿ-Les-Roses").
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_alphabetic = false;
    for c in name.trim().chars() {
        if c.is_alphabetic() {
            if prev_alphabetic {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alphabetic = true;
        } else {
            out.push(c);
            prev_alphabetic = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn test_config(name: &str) -> Config {
        let root = env::temp_dir().join(format!("cleaner_{name}"));
        let _ = fs::remove_dir_all(&root);
        let config = Config::defaults(&root);
        fs::create_dir_all(&config.processed_data_dir).unwrap();
        config
    }

    fn cleanup(config: &Config) {
        let root = config.processed_data_dir.parent().unwrap().parent().unwrap();
        let _ = fs::remove_dir_all(root);
    }

    fn raw(
        nature: &str,
        valeur: Option<f64>,
        surface: Option<f64>,
        commune: &str,
    ) -> RawTransaction {
        RawTransaction {
            date_mutation: Some("2023-06-15".to_string()),
            nature_mutation: Some(nature.to_string()),
            valeur_fonciere: valeur,
            code_commune: Some("75056".to_string()),
            nom_commune: Some(commune.to_string()),
            code_departement: Some("75".to_string()),
            type_local: Some("Appartement".to_string()),
            surface_reelle_bati: surface,
            nombre_pieces_principales: Some(2),
        }
    }

    #[test]
    fn test_clean_enforces_band_and_surface_invariants() {
        let config = test_config("invariants");
        let cleaner = DataCleaner::new(&config);

        let rows = vec![
            raw("Vente", Some(500_000.0), Some(50.0), "Paris"), // 10 000 €/m²: kept
            raw("Vente", Some(1.0), Some(50.0), "Paris"),       // 0.02 €/m²: outlier
            raw("Vente", Some(5_000_000.0), Some(50.0), "Paris"), // 100 000 €/m²: outlier
            raw("Vente", Some(300_000.0), Some(8.0), "Paris"),  // below MIN_SURFACE
            raw("Échange", Some(500_000.0), Some(50.0), "Paris"), // wrong mutation type
            raw("Vente", None, Some(50.0), "Paris"),            // no value
            raw("Vente", Some(-10.0), Some(50.0), "Paris"),     // non-positive value
            raw("Vente", Some(400_000.0), None, "Paris"),       // no surface
        ];

        let cleaned = cleaner.clean(rows).unwrap();
        assert_eq!(cleaned.len(), 1);
        for row in &cleaned {
            assert!(row.prix_m2 >= MIN_PRICE_M2 && row.prix_m2 <= MAX_PRICE_M2);
            assert!(row.surface_reelle_bati >= MIN_SURFACE);
        }
        cleanup(&config);
    }

    #[test]
    fn test_clean_removes_exact_duplicates() {
        let config = test_config("dedup");
        let cleaner = DataCleaner::new(&config);

        let rows = vec![
            raw("Vente", Some(500_000.0), Some(50.0), "Paris"),
            raw("Vente", Some(500_000.0), Some(50.0), "Paris"),
            raw("Vente", Some(510_000.0), Some(50.0), "Paris"),
        ];

        let cleaned = cleaner.clean(rows).unwrap();
        assert_eq!(cleaned.len(), 2);

        let mut keys: Vec<_> = cleaned.iter().map(|r| r.dedup_key()).collect();
        keys.dedup();
        assert_eq!(keys.len(), 2);
        cleanup(&config);
    }

    #[test]
    fn test_clean_is_idempotent() {
        let config = test_config("idempotent");
        let cleaner = DataCleaner::new(&config);

        let rows = vec![
            raw("Vente", Some(500_000.0), Some(50.0), "paris"),
            raw("Vente", Some(640_000.0), Some(80.0), "VERSAILLES"),
        ];
        let once = cleaner.clean(rows).unwrap();

        // Re-run the pipeline on its own output, reconstructed as raw rows.
        let again_input: Vec<RawTransaction> = once
            .iter()
            .map(|c| RawTransaction {
                date_mutation: c.date_mutation.map(|d| d.format("%Y-%m-%d").to_string()),
                nature_mutation: Some(c.nature_mutation.clone()),
                valeur_fonciere: Some(c.valeur_fonciere),
                code_commune: Some(c.code_commune.clone()),
                nom_commune: Some(c.nom_commune.clone()),
                code_departement: Some(c.code_departement.clone()),
                type_local: c.type_local.clone(),
                surface_reelle_bati: Some(c.surface_reelle_bati),
                nombre_pieces_principales: c.nombre_pieces_principales,
            })
            .collect();
        let twice = cleaner.clean(again_input).unwrap();

        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.dedup_key(), b.dedup_key());
        }
        cleanup(&config);
    }

    #[test]
    fn test_unparsable_date_becomes_none() {
        let config = test_config("bad_date");
        let cleaner = DataCleaner::new(&config);

        let mut row = raw("Vente", Some(500_000.0), Some(50.0), "Paris");
        row.date_mutation = Some("not-a-date".to_string());

        let cleaned = cleaner.clean(vec![row]).unwrap();
        assert_eq!(cleaned.len(), 1);
        assert!(cleaned[0].date_mutation.is_none());
        cleanup(&config);
    }

    #[test]
    fn test_commune_names_are_title_cased() {
        assert_eq!(title_case("  PARIS "), "Paris");
        assert_eq!(title_case("saint-denis"), "Saint-Denis");
        assert_eq!(title_case("L'HAŸ-LES-ROSES"), "L'Haÿ-Les-Roses");
        assert_eq!(title_case("le perreux-sur-marne"), "Le Perreux-Sur-Marne");
    }

    #[test]
    fn test_entirely_absent_required_column_is_an_error() {
        let config = test_config("no_column");
        let cleaner = DataCleaner::new(&config);

        let rows: Vec<RawTransaction> = (0..3)
            .map(|_| {
                let mut r = raw("Vente", Some(500_000.0), Some(50.0), "Paris");
                r.nature_mutation = None;
                r
            })
            .collect();

        let err = cleaner.clean(rows).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingColumn("nature_mutation"))
        ));
        cleanup(&config);
    }

    #[test]
    fn test_empty_input_is_fine() {
        let config = test_config("empty");
        let cleaner = DataCleaner::new(&config);
        assert!(cleaner.clean(Vec::new()).unwrap().is_empty());
        cleanup(&config);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let config = test_config("round_trip");
        let cleaner = DataCleaner::new(&config);

        let cleaned = cleaner
            .clean(vec![
                raw("Vente", Some(500_000.0), Some(50.0), "Paris"),
                raw("Vente", Some(640_000.0), Some(80.0), "Versailles"),
            ])
            .unwrap();

        cleaner.save_cleaned(&cleaned, 2023).unwrap();
        let loaded = cleaner.load_cleaned(2023).unwrap();

        assert_eq!(loaded.len(), cleaned.len());
        assert_eq!(loaded[0].nom_commune, "Paris");
        assert_eq!(loaded[0].prix_m2, 10_000.0);
        assert_eq!(loaded[0].date_mutation, cleaned[0].date_mutation);
        cleanup(&config);
    }

    #[test]
    fn test_load_cleaned_missing_year() {
        let config = test_config("load_missing");
        let cleaner = DataCleaner::new(&config);

        let err = cleaner.load_cleaned(1999).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingData { year: 1999, .. })
        ));
        cleanup(&config);
    }
}
