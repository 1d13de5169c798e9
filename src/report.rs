//! Spreadsheet report export.
//!
//! One workbook per report, written into the reports directory. Column
//! headers are the human-readable French labels of the published datasets.

use anyhow::{Result, anyhow};
use std::path::PathBuf;
use tracing::info;
use umya_spreadsheet::{Spreadsheet, Worksheet};

use crate::analyzers::combined::CombinedAnalyzer;
use crate::analyzers::price::CityPriceRow;
use crate::analyzers::rent::RentAnalyzer;
use crate::config::Config;

/// All-cities price report: `analyse_idf_{year}.xlsx`.
pub fn export_price_report(
    config: &Config,
    rows: &[CityPriceRow],
    year: u16,
) -> Result<PathBuf> {
    let mut book = new_workbook("Analyse des villes")?;
    let sheet = sheet_mut(&mut book, "Analyse des villes")?;

    write_header(
        sheet,
        &[
            "Ville",
            "Département",
            "Prix moyen (€/m²)",
            "Prix médian (€/m²)",
            "Prix min (€/m²)",
            "Prix max (€/m²)",
            "Transactions",
            "Surface moyenne (m²)",
            "T1",
            "T2",
            "T3",
            "T4",
            "T5+",
            "Appart. prix moyen (€/m²)",
            "Appart. transactions",
            "Maison prix moyen (€/m²)",
            "Maison transactions",
        ],
    );

    for (i, row) in rows.iter().enumerate() {
        let r = i as u32 + 2;
        sheet.get_cell_mut((1, r)).set_value(row.ville.clone());
        sheet
            .get_cell_mut((2, r))
            .set_value(row.code_departement.clone());
        sheet
            .get_cell_mut((3, r))
            .set_value_number(row.stats.prix_moyen_m2);
        sheet
            .get_cell_mut((4, r))
            .set_value_number(row.stats.prix_median_m2);
        sheet
            .get_cell_mut((5, r))
            .set_value_number(row.stats.prix_min_m2);
        sheet
            .get_cell_mut((6, r))
            .set_value_number(row.stats.prix_max_m2);
        sheet
            .get_cell_mut((7, r))
            .set_value_number(row.stats.nombre_transactions as f64);
        sheet
            .get_cell_mut((8, r))
            .set_value_number(row.stats.surface_moyenne);
        sheet
            .get_cell_mut((9, r))
            .set_value_number(row.stats.pieces.une_piece as f64);
        sheet
            .get_cell_mut((10, r))
            .set_value_number(row.stats.pieces.deux_pieces as f64);
        sheet
            .get_cell_mut((11, r))
            .set_value_number(row.stats.pieces.trois_pieces as f64);
        sheet
            .get_cell_mut((12, r))
            .set_value_number(row.stats.pieces.quatre_pieces as f64);
        sheet
            .get_cell_mut((13, r))
            .set_value_number(row.stats.pieces.cinq_pieces_et_plus as f64);
        if let Some(apparts) = &row.stats.appartements {
            sheet
                .get_cell_mut((14, r))
                .set_value_number(apparts.prix_moyen_m2);
            sheet
                .get_cell_mut((15, r))
                .set_value_number(apparts.nombre_transactions as f64);
        }
        if let Some(maisons) = &row.stats.maisons {
            sheet
                .get_cell_mut((16, r))
                .set_value_number(maisons.prix_moyen_m2);
            sheet
                .get_cell_mut((17, r))
                .set_value_number(maisons.nombre_transactions as f64);
        }
    }

    let path = config.reports_dir.join(format!("analyse_idf_{year}.xlsx"));
    write_workbook(&book, &path)?;
    Ok(path)
}

/// Rent report: detailed table, per-department aggregates, top-20 highest
/// and lowest rents.
pub fn export_rent_report(
    config: &Config,
    analyzer: &RentAnalyzer<'_>,
    department_code: Option<&str>,
) -> Result<PathBuf> {
    let mut book = new_workbook("Données détaillées")?;

    let detail_headers = [
        "Commune",
        "Code INSEE",
        "Département",
        "EPCI",
        "Loyer moyen (€/m²)",
        "Loyer bas (€/m²)",
        "Loyer haut (€/m²)",
        "Type prédiction",
        "Nb obs. commune",
        "Nb obs. maille",
        "R² ajusté",
        "Type de bien",
    ];

    {
        let sheet = sheet_mut(&mut book, "Données détaillées")?;
        write_header(sheet, &detail_headers);

        let table = analyzer.table()?;
        let mut r = 2u32;
        for record in table {
            if department_code.is_some_and(|d| record.departement.as_deref() != Some(d)) {
                continue;
            }
            write_rent_record_row(sheet, r, record);
            r += 1;
        }
    }

    if department_code.is_none() {
        let stats = analyzer.region_statistics()?;
        let sheet = add_sheet(&mut book, "Stats par département")?;
        write_header(
            sheet,
            &[
                "Département",
                "Nom",
                "Nb communes",
                "Loyer moyen (€/m²)",
                "Loyer médian (€/m²)",
                "Loyer min (€/m²)",
                "Loyer max (€/m²)",
                "Loyer bas moyen (€/m²)",
                "Loyer haut moyen (€/m²)",
            ],
        );
        for (i, row) in stats.iter().enumerate() {
            let r = i as u32 + 2;
            sheet.get_cell_mut((1, r)).set_value(row.department_code.clone());
            sheet.get_cell_mut((2, r)).set_value(row.department_name.clone());
            sheet
                .get_cell_mut((3, r))
                .set_value_number(row.stats.nb_communes as f64);
            sheet.get_cell_mut((4, r)).set_value_number(row.stats.loyer_moyen);
            sheet.get_cell_mut((5, r)).set_value_number(row.stats.loyer_median);
            sheet.get_cell_mut((6, r)).set_value_number(row.stats.loyer_min);
            sheet.get_cell_mut((7, r)).set_value_number(row.stats.loyer_max);
            sheet
                .get_cell_mut((8, r))
                .set_value_number(row.stats.loyer_bas_moyen);
            sheet
                .get_cell_mut((9, r))
                .set_value_number(row.stats.loyer_haut_moyen);
        }
    }

    for (sheet_name, ascending) in [
        ("Top 20 loyers élevés", false),
        ("Top 20 loyers bas", true),
    ] {
        let top = analyzer.top_cities(20, department_code, ascending)?;
        let sheet = add_sheet(&mut book, sheet_name)?;
        write_header(sheet, &detail_headers);
        for (i, record) in top.iter().enumerate() {
            write_rent_record_row(sheet, i as u32 + 2, record);
        }
    }

    let dept_suffix = department_code.map(|d| format!("_{d}")).unwrap_or_default();
    let path = config
        .reports_dir
        .join(format!("loyers_{}{dept_suffix}.xlsx", analyzer.year()));
    write_workbook(&book, &path)?;
    Ok(path)
}

/// Combined report: full joined table, top-30 yields, per-department rent
/// aggregates, top-30 rents.
pub fn export_combined_report(
    config: &Config,
    analyzer: &CombinedAnalyzer<'_>,
    department_code: Option<&str>,
) -> Result<PathBuf> {
    let combined = analyzer.all_cities_combined(department_code)?;

    let mut book = new_workbook("Données combinées")?;

    let combined_headers = [
        "Commune",
        "Code INSEE",
        "Département",
        "Type de bien",
        "Prix vente moyen (€/m²)",
        "Prix vente min (€/m²)",
        "Prix vente max (€/m²)",
        "Nb transactions DVF",
        "Loyer moyen (€/m²/mois)",
        "Loyer bas (€/m²/mois)",
        "Loyer haut (€/m²/mois)",
        "Nb obs. loyers",
        "Rendement brut (%)",
        "Rendement bas (%)",
        "Rendement haut (%)",
        "R² ajusté loyers",
    ];

    {
        let sheet = sheet_mut(&mut book, "Données combinées")?;
        write_header(sheet, &combined_headers);
        for (i, row) in combined.iter().enumerate() {
            write_combined_row(sheet, i as u32 + 2, row);
        }
    }

    {
        let top_yield = analyzer.best_yield_cities(30, department_code)?;
        let sheet = add_sheet(&mut book, "Top 30 rendements")?;
        write_header(sheet, &combined_headers);
        for (i, row) in top_yield.iter().enumerate() {
            write_combined_row(sheet, i as u32 + 2, row);
        }
    }

    if department_code.is_none() {
        let stats = analyzer.rent_analyzer().region_statistics()?;
        let sheet = add_sheet(&mut book, "Stats départements")?;
        write_header(
            sheet,
            &[
                "Département",
                "Nom",
                "Nb communes",
                "Loyer moyen (€/m²)",
                "Loyer annuel moyen (€/m²)",
                "Loyer médian (€/m²)",
            ],
        );
        for (i, row) in stats.iter().enumerate() {
            let r = i as u32 + 2;
            sheet.get_cell_mut((1, r)).set_value(row.department_code.clone());
            sheet.get_cell_mut((2, r)).set_value(row.department_name.clone());
            sheet
                .get_cell_mut((3, r))
                .set_value_number(row.stats.nb_communes as f64);
            sheet.get_cell_mut((4, r)).set_value_number(row.stats.loyer_moyen);
            sheet
                .get_cell_mut((5, r))
                .set_value_number(row.stats.loyer_moyen * 12.0);
            sheet.get_cell_mut((6, r)).set_value_number(row.stats.loyer_median);
        }
    }

    {
        let top_rent = analyzer.rent_analyzer().top_cities(30, department_code, false)?;
        let sheet = add_sheet(&mut book, "Top 30 loyers")?;
        write_header(
            sheet,
            &["Commune", "Code INSEE", "Département", "Loyer moyen (€/m²)"],
        );
        for (i, record) in top_rent.iter().enumerate() {
            let r = i as u32 + 2;
            set_opt_text(sheet, 1, r, record.commune.as_deref());
            set_opt_text(sheet, 2, r, record.insee_code.as_deref());
            set_opt_text(sheet, 3, r, record.departement.as_deref());
            set_opt_number(sheet, 4, r, record.loypredm2);
        }
    }

    let dept_suffix = department_code.map(|d| format!("_{d}")).unwrap_or_default();
    let path = config.reports_dir.join(format!(
        "analyse_complete_dvf{}_loyers{}{dept_suffix}.xlsx",
        analyzer.dvf_year(),
        analyzer.rent_analyzer().year(),
    ));
    write_workbook(&book, &path)?;
    Ok(path)
}

fn write_rent_record_row(
    sheet: &mut Worksheet,
    r: u32,
    record: &crate::download::rent::RentRecord,
) {
    set_opt_text(sheet, 1, r, record.commune.as_deref());
    set_opt_text(sheet, 2, r, record.insee_code.as_deref());
    set_opt_text(sheet, 3, r, record.departement.as_deref());
    set_opt_text(sheet, 4, r, record.epci.as_deref());
    set_opt_number(sheet, 5, r, record.loypredm2);
    set_opt_number(sheet, 6, r, record.lwr_ipm2);
    set_opt_number(sheet, 7, r, record.upr_ipm2);
    set_opt_text(sheet, 8, r, record.typpred.as_deref());
    set_opt_number(sheet, 9, r, record.nbobs_com.map(f64::from));
    set_opt_number(sheet, 10, r, record.nbobs_mail.map(f64::from));
    set_opt_number(sheet, 11, r, record.r2_adj);
    sheet.get_cell_mut((12, r)).set_value(record.type_bien.clone());
}

fn write_combined_row(
    sheet: &mut Worksheet,
    r: u32,
    row: &crate::analyzers::combined::CombinedCityRow,
) {
    sheet.get_cell_mut((1, r)).set_value(row.commune.clone());
    set_opt_text(sheet, 2, r, row.code_insee.as_deref());
    set_opt_text(sheet, 3, r, row.departement.as_deref());
    sheet.get_cell_mut((4, r)).set_value(row.type_bien.clone());
    set_opt_number(sheet, 5, r, row.prix_moyen_m2);
    set_opt_number(sheet, 6, r, row.prix_min_m2);
    set_opt_number(sheet, 7, r, row.prix_max_m2);
    set_opt_number(sheet, 8, r, row.nb_transactions.map(|n| n as f64));
    set_opt_number(sheet, 9, r, row.loyer_moyen_m2);
    set_opt_number(sheet, 10, r, row.loyer_bas_m2);
    set_opt_number(sheet, 11, r, row.loyer_haut_m2);
    set_opt_number(sheet, 12, r, row.nb_obs_loyers.map(f64::from));
    set_opt_number(sheet, 13, r, row.rendement_brut_pct);
    set_opt_number(sheet, 14, r, row.rendement_bas_pct);
    set_opt_number(sheet, 15, r, row.rendement_haut_pct);
    set_opt_number(sheet, 16, r, row.r2_loyers);
}

fn new_workbook(first_sheet_name: &str) -> Result<Spreadsheet> {
    let mut book = umya_spreadsheet::new_file();
    book.get_sheet_mut(&0)
        .ok_or_else(|| anyhow!("new workbook has no default sheet"))?
        .set_name(first_sheet_name);
    Ok(book)
}

fn sheet_mut<'b>(book: &'b mut Spreadsheet, name: &str) -> Result<&'b mut Worksheet> {
    book.get_sheet_by_name_mut(name)
        .ok_or_else(|| anyhow!("worksheet '{name}' not found"))
}

fn add_sheet<'b>(book: &'b mut Spreadsheet, name: &str) -> Result<&'b mut Worksheet> {
    book.new_sheet(name)
        .map_err(|e| anyhow!("creating worksheet '{name}': {e}"))
}

fn write_header(sheet: &mut Worksheet, headers: &[&str]) {
    for (i, header) in headers.iter().enumerate() {
        sheet
            .get_cell_mut((i as u32 + 1, 1))
            .set_value((*header).to_string());
    }
}

fn set_opt_number(sheet: &mut Worksheet, col: u32, row: u32, value: Option<f64>) {
    if let Some(v) = value {
        sheet.get_cell_mut((col, row)).set_value_number(v);
    }
}

fn set_opt_text(sheet: &mut Worksheet, col: u32, row: u32, value: Option<&str>) {
    if let Some(v) = value {
        sheet.get_cell_mut((col, row)).set_value(v.to_string());
    }
}

fn write_workbook(book: &Spreadsheet, path: &PathBuf) -> Result<()> {
    umya_spreadsheet::writer::xlsx::write(book, path)
        .map_err(|e| anyhow!("writing {}: {e:?}", path.display()))?;
    info!(path = %path.display(), "Report written");
    Ok(())
}
