//! Row types for the DVF transaction tables.
//!
//! `RawTransaction` mirrors the column names of the published DVF CSV export;
//! extra columns in the source files are ignored by the CSV reader.
//! `CleanTransaction` is the projected, derived shape the analyzers consume.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

pub const APARTMENT_LABEL: &str = "Appartement";
pub const HOUSE_LABEL: &str = "Maison";

/// One raw sale row as published. Numeric fields are optional because the
/// export leaves them blank for many mutation rows; the cleaner filters on
/// presence rather than failing the whole file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTransaction {
    #[serde(default)]
    pub date_mutation: Option<String>,
    #[serde(default)]
    pub nature_mutation: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub valeur_fonciere: Option<f64>,
    #[serde(default)]
    pub code_commune: Option<String>,
    #[serde(default)]
    pub nom_commune: Option<String>,
    #[serde(default)]
    pub code_departement: Option<String>,
    #[serde(default)]
    pub type_local: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub surface_reelle_bati: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_rooms")]
    pub nombre_pieces_principales: Option<u32>,
}

/// One cleaned, analysis-ready sale row. Persisted as the per-year cleaned
/// snapshot and re-derivable from the raw cache at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanTransaction {
    pub date_mutation: Option<NaiveDate>,
    pub nature_mutation: String,
    pub valeur_fonciere: f64,
    pub code_commune: String,
    pub nom_commune: String,
    pub code_departement: String,
    pub type_local: Option<String>,
    pub surface_reelle_bati: f64,
    pub nombre_pieces_principales: Option<u32>,
    pub prix_m2: f64,
}

impl CleanTransaction {
    /// Exact-duplicate identity over all retained columns. Floats compare by
    /// bit pattern: two rows are duplicates only when byte-identical.
    pub fn dedup_key(&self) -> (Option<NaiveDate>, String, u64, String, String, String, Option<String>, u64, Option<u32>, u64)
    {
        (
            self.date_mutation,
            self.nature_mutation.clone(),
            self.valeur_fonciere.to_bits(),
            self.code_commune.clone(),
            self.nom_commune.clone(),
            self.code_departement.clone(),
            self.type_local.clone(),
            self.surface_reelle_bati.to_bits(),
            self.nombre_pieces_principales,
            self.prix_m2.to_bits(),
        )
    }

    pub fn is_apartment(&self) -> bool {
        self.type_local.as_deref() == Some(APARTMENT_LABEL)
    }

    pub fn is_house(&self) -> bool {
        self.type_local.as_deref() == Some(HOUSE_LABEL)
    }
}

/// Accepts blanks and malformed numerics as `None`.
fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.trim().parse::<f64>().ok()))
}

/// Room counts arrive as "3" or "3.0" depending on the export vintage.
fn de_opt_rooms<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.trim().parse::<f64>().ok()).map(|v| v as u32))
}
