//! Joined price + rent analysis and gross rental yield.
//!
//! The two domains join on uppercased commune-name equality only. There is
//! deliberately no accent or whitespace normalization beyond the cleaner's
//! trim: a commune spelled inconsistently across the two datasets does not
//! join and gets a null yield.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::analyzers::price::{CityStats, PriceAnalyzer};
use crate::analyzers::rent::{CityQuery, RentAnalyzer, RentLookup, RentStats};
use crate::analyzers::utility::mean;
use crate::config::Config;

/// Gross rental yield in percent: annualized rent over purchase price.
/// Undefined for a missing or non-positive price — a commune without
/// transactions is a legitimate degenerate input, not a division to crash on.
pub fn gross_yield(monthly_rent_m2: f64, price_m2: f64) -> Option<f64> {
    if price_m2 <= 0.0 {
        return None;
    }
    Some(monthly_rent_m2 * 12.0 / price_m2 * 100.0)
}

/// Both sides of the join for one commune; either may be absent.
#[derive(Debug, Clone)]
pub struct CombinedCityStats {
    pub commune: Option<String>,
    pub code_insee: Option<String>,
    pub loyers: Option<RentLookup>,
    pub prix_vente: Option<CityStats>,
}

/// Yield details for one commune.
#[derive(Debug, Clone, Serialize)]
pub struct YieldBreakdown {
    pub commune: String,
    pub loyer_mensuel_m2: f64,
    pub loyer_annuel_m2: f64,
    pub prix_achat_m2: Option<f64>,
    pub rendement_brut_pct: Option<f64>,
    pub rendement_bas_pct: Option<f64>,
    pub rendement_haut_pct: Option<f64>,
    pub fiable: bool,
}

/// One row of the all-cities combined table: rent side always present (the
/// iteration is rent-driven), price side and yield null when unmatched.
#[derive(Debug, Clone, Serialize)]
pub struct CombinedCityRow {
    pub commune: String,
    pub code_insee: Option<String>,
    pub departement: Option<String>,
    pub type_bien: String,
    pub loyer_moyen_m2: Option<f64>,
    pub loyer_bas_m2: Option<f64>,
    pub loyer_haut_m2: Option<f64>,
    pub nb_obs_loyers: Option<u32>,
    pub r2_loyers: Option<f64>,
    pub prix_moyen_m2: Option<f64>,
    pub prix_min_m2: Option<f64>,
    pub prix_max_m2: Option<f64>,
    pub nb_transactions: Option<usize>,
    pub rendement_brut_pct: Option<f64>,
    pub rendement_bas_pct: Option<f64>,
    pub rendement_haut_pct: Option<f64>,
}

/// Per-department averages over communes where both sides joined.
#[derive(Debug, Clone, Serialize)]
pub struct DepartmentYieldRow {
    pub departement: String,
    pub nb_communes: usize,
    pub prix_moyen_m2: f64,
    pub loyer_moyen_m2: f64,
    pub rendement_moyen_pct: f64,
}

pub struct CombinedAnalyzer<'a> {
    dvf_year: u16,
    price: PriceAnalyzer<'a>,
    rent: RentAnalyzer<'a>,
}

impl<'a> CombinedAnalyzer<'a> {
    /// Builds the combined analyzer. Missing cleaned DVF data for the year
    /// is tolerated with a warning: rent-side queries still work, every
    /// price side is null.
    pub fn new(config: &'a Config, dvf_year: u16, rent_year: u16) -> Self {
        let mut price = PriceAnalyzer::new(config);
        match price.load_data(dvf_year) {
            Ok(()) => info!(year = dvf_year, "DVF data loaded"),
            Err(e) => {
                warn!(year = dvf_year, error = %e, "DVF data unavailable; price sides will be empty");
            }
        }

        Self {
            dvf_year,
            price,
            rent: RentAnalyzer::new(config, rent_year),
        }
    }

    /// Analyzer over preloaded parts, for callers that already hold tables.
    pub fn from_parts(dvf_year: u16, price: PriceAnalyzer<'a>, rent: RentAnalyzer<'a>) -> Self {
        Self {
            dvf_year,
            price,
            rent,
        }
    }

    pub fn dvf_year(&self) -> u16 {
        self.dvf_year
    }

    pub fn rent_analyzer(&self) -> &RentAnalyzer<'a> {
        &self.rent
    }

    /// Price statistics for a commune name; any miss (no data loaded, no
    /// matching rows) is a null price side, never an abort.
    fn price_side(&self, commune: &str) -> Option<CityStats> {
        if !self.price.has_data() {
            return None;
        }
        self.price.city_stats(commune).ok().flatten()
    }

    /// Resolves the commune label for a query, from the rent table when
    /// queried by INSEE code.
    fn resolve_name(&self, query: CityQuery<'_>) -> Result<Option<String>> {
        match query {
            CityQuery::Name(name) => Ok(Some(name.to_string())),
            CityQuery::Insee(code) => {
                let table = self.rent.table()?;
                Ok(table
                    .iter()
                    .find(|r| r.insee_code.as_deref() == Some(code))
                    .and_then(|r| r.commune.clone()))
            }
        }
    }

    /// Both sides of the join for one commune.
    pub fn city_complete_stats(&self, query: CityQuery<'_>) -> Result<CombinedCityStats> {
        let loyers = self.rent.city_rent_stats(query)?;
        let commune = self.resolve_name(query)?;

        let prix_vente = commune.as_deref().and_then(|name| self.price_side(name));

        let code_insee = match query {
            CityQuery::Insee(code) => Some(code.to_string()),
            CityQuery::Name(_) => None,
        };

        Ok(CombinedCityStats {
            commune,
            code_insee,
            loyers,
            prix_vente,
        })
    }

    /// Gross yield for one commune. `price_override` substitutes the DVF
    /// mean price (e.g. a hypothetical purchase price). `None` when the
    /// commune has no rent value.
    pub fn rental_yield(
        &self,
        query: CityQuery<'_>,
        price_override: Option<f64>,
    ) -> Result<Option<YieldBreakdown>> {
        let Some(lookup) = self.rent.city_rent_stats(query)? else {
            warn!(?query, "No rent data; yield undefined");
            return Ok(None);
        };
        let rent_stats = primary_rent(&lookup).clone();
        let Some(monthly_rent) = rent_stats.loyer_moyen_m2 else {
            warn!(?query, "Rent value missing; yield undefined");
            return Ok(None);
        };

        let commune_name = self.resolve_name(query)?;
        let price_m2 = match price_override {
            Some(price) => Some(price),
            None => commune_name
                .as_deref()
                .and_then(|name| self.price_side(name))
                .map(|stats| stats.prix_moyen_m2),
        };

        let commune = commune_name.unwrap_or_default();
        let breakdown = match price_m2 {
            Some(price) => YieldBreakdown {
                commune,
                loyer_mensuel_m2: monthly_rent,
                loyer_annuel_m2: monthly_rent * 12.0,
                prix_achat_m2: Some(price),
                rendement_brut_pct: gross_yield(monthly_rent, price),
                rendement_bas_pct: rent_stats
                    .loyer_bas_m2
                    .and_then(|low| gross_yield(low, price)),
                rendement_haut_pct: rent_stats
                    .loyer_haut_m2
                    .and_then(|high| gross_yield(high, price)),
                fiable: rent_stats.is_reliable(),
            },
            None => YieldBreakdown {
                commune,
                loyer_mensuel_m2: monthly_rent,
                loyer_annuel_m2: monthly_rent * 12.0,
                prix_achat_m2: None,
                rendement_brut_pct: None,
                rendement_bas_pct: None,
                rendement_haut_pct: None,
                fiable: rent_stats.is_reliable(),
            },
        };

        Ok(Some(breakdown))
    }

    /// The combined table, one row per rent-table row. Each commune's price
    /// lookup is attempted independently: a miss nulls that row's price side
    /// only and never aborts the batch.
    pub fn all_cities_combined(&self, department_code: Option<&str>) -> Result<Vec<CombinedCityRow>> {
        info!("Building combined statistics for all cities");
        let table = self.rent.table()?;

        let mut results = Vec::new();
        for record in table {
            if department_code.is_some_and(|d| record.departement.as_deref() != Some(d)) {
                continue;
            }

            let commune = record.commune.clone().unwrap_or_default();
            let price_stats = self.price_side(&commune);

            let monthly_rent = record.loypredm2;
            let price_mean = price_stats.as_ref().map(|p| p.prix_moyen_m2);

            let rendement_brut_pct = match (monthly_rent, price_mean) {
                (Some(rent), Some(price)) => gross_yield(rent, price),
                _ => None,
            };
            let rendement_bas_pct = match (record.lwr_ipm2, price_mean) {
                (Some(low), Some(price)) => gross_yield(low, price),
                _ => None,
            };
            let rendement_haut_pct = match (record.upr_ipm2, price_mean) {
                (Some(high), Some(price)) => gross_yield(high, price),
                _ => None,
            };

            results.push(CombinedCityRow {
                commune,
                code_insee: record.insee_code.clone(),
                departement: record.departement.clone(),
                type_bien: record.type_bien.clone(),
                loyer_moyen_m2: monthly_rent,
                loyer_bas_m2: record.lwr_ipm2,
                loyer_haut_m2: record.upr_ipm2,
                nb_obs_loyers: record.nbobs_com,
                r2_loyers: record.r2_adj,
                prix_moyen_m2: price_mean,
                prix_min_m2: price_stats.as_ref().map(|p| p.prix_min_m2),
                prix_max_m2: price_stats.as_ref().map(|p| p.prix_max_m2),
                nb_transactions: price_stats.as_ref().map(|p| p.nombre_transactions),
                rendement_brut_pct,
                rendement_bas_pct,
                rendement_haut_pct,
            });
        }

        let with_yield = results
            .iter()
            .filter(|r| r.rendement_brut_pct.is_some())
            .count();
        info!(cities = results.len(), with_yield, "Combined statistics built");
        Ok(results)
    }

    /// The `n` communes with the best defined yields, descending.
    pub fn best_yield_cities(
        &self,
        n: usize,
        department_code: Option<&str>,
    ) -> Result<Vec<CombinedCityRow>> {
        let mut rows: Vec<CombinedCityRow> = self
            .all_cities_combined(department_code)?
            .into_iter()
            .filter(|r| r.rendement_brut_pct.is_some())
            .collect();

        if rows.is_empty() {
            warn!("No city with a computable yield");
            return Ok(rows);
        }

        rows.sort_by(|a, b| {
            b.rendement_brut_pct
                .unwrap_or_default()
                .total_cmp(&a.rendement_brut_pct.unwrap_or_default())
        });
        rows.truncate(n);
        Ok(rows)
    }

    /// Mean price, rent, and yield per department over communes where both
    /// sides joined.
    pub fn department_aggregates(&self) -> Result<Vec<DepartmentYieldRow>> {
        let rows = self.all_cities_combined(None)?;

        let mut by_dept: BTreeMap<String, Vec<&CombinedCityRow>> = BTreeMap::new();
        for row in &rows {
            if row.rendement_brut_pct.is_none() {
                continue;
            }
            let Some(dept) = row.departement.clone() else {
                continue;
            };
            by_dept.entry(dept).or_default().push(row);
        }

        Ok(by_dept
            .into_iter()
            .map(|(departement, dept_rows)| {
                let prices: Vec<f64> = dept_rows.iter().filter_map(|r| r.prix_moyen_m2).collect();
                let rents: Vec<f64> = dept_rows.iter().filter_map(|r| r.loyer_moyen_m2).collect();
                let yields: Vec<f64> =
                    dept_rows.iter().filter_map(|r| r.rendement_brut_pct).collect();
                DepartmentYieldRow {
                    departement,
                    nb_communes: dept_rows.len(),
                    prix_moyen_m2: mean(&prices),
                    loyer_moyen_m2: mean(&rents),
                    rendement_moyen_pct: mean(&yields),
                }
            })
            .collect())
    }
}

/// Representative rent side for yield computations. Split vintages use the
/// first property type in map order (apartments before houses), mirroring
/// the concatenation order of the loaded table.
fn primary_rent(lookup: &RentLookup) -> &RentStats {
    match lookup {
        RentLookup::Single(stats) => stats,
        RentLookup::ByPropertyType(map) => map
            .values()
            .next()
            .expect("ByPropertyType lookups are built from at least one row"),
    }
}
