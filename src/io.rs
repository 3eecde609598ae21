// src/io.rs

//! Tab-separated import and export.
//!
//! View matrices are read with features as rows: the first column holds feature ids
//! and the header row holds sample ids. Covariate tables have one row per sample.
//! `NA`, `NaN`, `null` and empty cells are read as missing.

use crate::association::{neg_log10, AssociationTable, CovariateKind};
use crate::data::{CovariateTable, View};
use crate::error::{GfaError, Result};
use crate::likelihood::Likelihood;
use crate::model::TrainedModel;
use crate::variance::VarianceExplained;
use log::info;
use ndarray::Array2;
use std::path::Path;

fn is_missing(cell: &str) -> bool {
    matches!(
        cell.trim().to_ascii_lowercase().as_str(),
        "" | "na" | "nan" | "null" | "none"
    )
}

fn parse_value(cell: &str) -> Option<f64> {
    if is_missing(cell) {
        return Some(f64::NAN);
    }
    cell.trim().parse::<f64>().ok()
}

fn tsv_reader<P: AsRef<Path>>(path: P) -> Result<csv::Reader<std::fs::File>> {
    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)?)
}

fn tsv_writer<P: AsRef<Path>>(path: P) -> Result<csv::Writer<std::fs::File>> {
    Ok(csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?)
}

/// Reads one view (features × samples) from a TSV file.
pub fn read_view_tsv<P: AsRef<Path>>(path: P, name: &str, likelihood: Likelihood) -> Result<View> {
    let path = path.as_ref();
    let mut rdr = tsv_reader(path)?;
    let headers = rdr.headers()?.clone();
    if headers.len() < 2 {
        return Err(GfaError::InvalidInput(format!(
            "{}: a view file needs a feature id column and at least one sample column.",
            path.display()
        )));
    }
    let sample_ids: Vec<String> = headers.iter().skip(1).map(|s| s.trim().to_string()).collect();

    let mut feature_ids = Vec::new();
    let mut values = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        if record.len() != headers.len() {
            return Err(GfaError::dimension_mismatch(
                name,
                format!(
                    "row {} of {} has {} cells, header has {}",
                    line + 2,
                    path.display(),
                    record.len(),
                    headers.len()
                ),
            ));
        }
        feature_ids.push(record[0].trim().to_string());
        for cell in record.iter().skip(1) {
            let value = parse_value(cell).ok_or_else(|| {
                GfaError::InvalidInput(format!(
                    "View '{}': cannot parse '{}' on row {} as a number.",
                    name,
                    cell,
                    line + 2
                ))
            })?;
            values.push(value);
        }
    }

    let data = Array2::from_shape_vec((feature_ids.len(), sample_ids.len()), values)
        .map_err(|e| GfaError::dimension_mismatch(name, e.to_string()))?;
    info!(
        "Read view '{}' from {}: {} features x {} samples",
        name,
        path.display(),
        data.nrows(),
        data.ncols()
    );
    View::new(name, feature_ids, sample_ids, data, likelihood)
}

/// Reads a covariate table (samples × covariates) from a TSV file.
///
/// A column whose non-missing cells all parse as numbers is continuous; any other
/// column is categorical.
pub fn read_covariates_tsv<P: AsRef<Path>>(path: P) -> Result<CovariateTable> {
    let path = path.as_ref();
    let mut rdr = tsv_reader(path)?;
    let headers = rdr.headers()?.clone();
    if headers.is_empty() {
        return Err(GfaError::InvalidInput(format!(
            "{}: the covariate file has no header.",
            path.display()
        )));
    }
    let names: Vec<String> = headers.iter().skip(1).map(|s| s.trim().to_string()).collect();

    let mut sample_ids = Vec::new();
    let mut cells: Vec<Vec<String>> = vec![Vec::new(); names.len()];
    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        if record.len() != headers.len() {
            return Err(GfaError::dimension_mismatch(
                "covariates",
                format!(
                    "row {} of {} has {} cells, header has {}",
                    line + 2,
                    path.display(),
                    record.len(),
                    headers.len()
                ),
            ));
        }
        sample_ids.push(record[0].trim().to_string());
        for (column, cell) in cells.iter_mut().zip(record.iter().skip(1)) {
            column.push(cell.trim().to_string());
        }
    }

    let mut table = CovariateTable::new(sample_ids)?;
    for (name, column) in names.into_iter().zip(cells) {
        let numeric: Option<Vec<f64>> = column.iter().map(|cell| parse_value(cell)).collect();
        table = match numeric {
            Some(values) => table.with_continuous(name, values)?,
            None => table.with_categorical(
                name,
                column
                    .into_iter()
                    .map(|cell| if is_missing(&cell) { None } else { Some(cell) })
                    .collect(),
            )?,
        };
    }
    info!(
        "Read {} covariates for {} samples from {}",
        table.columns().len(),
        table.sample_ids().len(),
        path.display()
    );
    Ok(table)
}

/// Writes factor scores, one row per sample.
pub fn write_factors_tsv<P: AsRef<Path>>(path: P, model: &TrainedModel) -> Result<()> {
    let mut wtr = tsv_writer(path)?;
    let mut header = vec!["sample_id".to_string()];
    header.extend(model.factor_names().iter().cloned());
    wtr.write_record(&header)?;
    for (sample, row) in model.sample_ids().iter().zip(model.factor_scores().rows()) {
        let mut record = vec![sample.clone()];
        record.extend(row.iter().map(|v| v.to_string()));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes the loadings of one view, one row per feature.
pub fn write_loadings_tsv<P: AsRef<Path>>(path: P, model: &TrainedModel, view: &str) -> Result<()> {
    let loadings = model.view(view)?;
    let mut wtr = tsv_writer(path)?;
    let mut header = vec!["feature_id".to_string()];
    header.extend(model.factor_names().iter().cloned());
    wtr.write_record(&header)?;
    for (feature, row) in loadings.feature_ids().iter().zip(loadings.loadings().rows()) {
        let mut record = vec![feature.clone()];
        record.extend(row.iter().map(|v| v.to_string()));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes the variance-explained table (percent), one row per view.
pub fn write_variance_explained_tsv<P: AsRef<Path>>(path: P, table: &VarianceExplained) -> Result<()> {
    let mut wtr = tsv_writer(path)?;
    let mut header = vec!["view".to_string()];
    header.extend(table.factor_names().iter().cloned());
    header.push("total".to_string());
    wtr.write_record(&header)?;
    for ((view, row), total) in table
        .view_names()
        .iter()
        .zip(table.per_factor().rows())
        .zip(table.totals().iter())
    {
        let mut record = vec![view.clone()];
        record.extend(row.iter().map(|v| v.to_string()));
        record.push(total.to_string());
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes the association table in long format, one row per (factor, covariate).
pub fn write_association_tsv<P: AsRef<Path>>(path: P, table: &AssociationTable) -> Result<()> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record([
        "factor",
        "covariate",
        "test",
        "statistic",
        "p_value",
        "neg_log10_p",
        "adjusted_p_value",
        "num_samples",
    ])?;
    for entry in table.entries() {
        let test = match entry.kind {
            CovariateKind::Continuous => "pearson",
            CovariateKind::Categorical => "anova",
        };
        wtr.write_record(&[
            entry.factor,
            entry.covariate,
            test.to_string(),
            entry.statistic.to_string(),
            entry.p_value.to_string(),
            neg_log10(entry.p_value).to_string(),
            entry
                .adjusted_p_value
                .map(|p| p.to_string())
                .unwrap_or_else(|| "NA".to_string()),
            entry.num_samples.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
