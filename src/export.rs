use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::PublicAppConfig;
use crate::dataset::DatasetProfile;
use crate::errors::AppResult;
use crate::filters::{FilterSelection, FilteredView};
use crate::reconcile::{GeocodeRun, GeocodeRunStats, NOT_ATTEMPTED};
use crate::summary::DashboardSummary;

pub const FILTERED_CSV: &str = "filtered.csv";
pub const UNRESOLVED_CSV: &str = "unresolved.csv";
pub const SUMMARY_JSON: &str = "summary.json";
pub const MANIFEST_JSON: &str = "manifest.json";

const GEOCODE_HEADERS: [&str; 3] = ["Latitude", "Longitude", "Geocode Status"];

#[derive(Debug, Serialize)]
pub struct SummaryDocument<'a> {
    pub filters: &'a FilterSelection,
    pub summary: &'a DashboardSummary,
}

#[derive(Debug, Serialize)]
pub struct ReportManifest {
    pub generated_at: DateTime<Utc>,
    pub version: &'static str,
    pub dataset: DatasetProfile,
    pub filtered_rows: usize,
    pub geocoding: Option<GeocodeRunStats>,
    pub config: Option<PublicAppConfig>,
    pub artifacts: Vec<String>,
}

impl ReportManifest {
    pub fn new(dataset: DatasetProfile, filtered_rows: usize) -> Self {
        Self {
            generated_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
            dataset,
            filtered_rows,
            geocoding: None,
            config: None,
            artifacts: Vec::new(),
        }
    }
}

pub fn ensure_out_dir(dir: &Path) -> AppResult<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

pub fn write_filtered_csv(
    view: &FilteredView<'_>,
    run: Option<&GeocodeRun>,
    path: &Path,
) -> AppResult<PathBuf> {
    let dataset = view.dataset();
    let mut writer = csv::Writer::from_path(path)?;

    let mut headers: Vec<&str> = dataset.columns().iter().map(String::as_str).collect();
    if run.is_some() {
        headers.extend(GEOCODE_HEADERS);
    }
    writer.write_record(&headers)?;

    for row in view.rows() {
        let mut record: Vec<String> = dataset.row(*row).map(<[String]>::to_vec).unwrap_or_default();
        if let Some(run) = run {
            match run.result_for(*row) {
                Some(result) => {
                    record.push(format_coordinate(result.latitude()));
                    record.push(format_coordinate(result.longitude()));
                    record.push(result.status().as_str().to_string());
                }
                None => {
                    record.extend([String::new(), String::new(), NOT_ATTEMPTED.to_string()]);
                }
            }
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    info!(target: "export", path = %path.display(), rows = view.len(), "wrote filtered rows");
    Ok(path.to_path_buf())
}

pub fn write_unresolved_csv(run: &GeocodeRun, path: &Path) -> AppResult<PathBuf> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["Linha", "Endereco", "Status", "Detalhe"])?;
    let unresolved = run.unresolved();
    for entry in &unresolved {
        writer.write_record([
            (entry.row + 1).to_string(),
            entry.address.clone(),
            entry.status.clone(),
            entry.detail.clone().unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    info!(target: "export", path = %path.display(), rows = unresolved.len(), "wrote unresolved addresses");
    Ok(path.to_path_buf())
}

pub fn write_json<T: Serialize>(value: &T, path: &Path) -> AppResult<PathBuf> {
    let serialized = serde_json::to_string_pretty(value)?;
    fs::write(path, serialized)?;
    Ok(path.to_path_buf())
}

fn format_coordinate(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.6}")).unwrap_or_default()
}
