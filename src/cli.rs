use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::config::{AppConfig, ProviderKind};
use crate::dataset::Dataset;
use crate::export::{
    ensure_out_dir, write_filtered_csv, write_json, write_unresolved_csv, ReportManifest,
    SummaryDocument, FILTERED_CSV, MANIFEST_JSON, SUMMARY_JSON, UNRESOLVED_CSV,
};
use crate::filters::{filter_options, FilterSelection, FilteredView};
use crate::providers::build_provider;
use crate::reconcile::{GeocodeProgress, GeocodeRun, GeocodeSession};
use crate::report::{write_map, write_report, ReportInput, MAP_HTML, REPORT_HTML};
use crate::summary::summarize;

const PROGRESS_EVERY: usize = 25;
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "registry-report")]
#[command(about = "Filter, summarize, geocode and export business registrations", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the selectable values of each filter column as JSON
    Values {
        /// Registry export (.csv, or .xlsx read from its ORIGINAL sheet)
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Filter the dataset and write the report artifacts
    Report {
        /// Registry export (.csv, or .xlsx read from its ORIGINAL sheet)
        #[arg(short, long)]
        input: PathBuf,

        /// Directory receiving the artifacts
        #[arg(short, long, default_value = "report")]
        out_dir: PathBuf,

        /// Keep rows with this registration status (repeatable)
        #[arg(long, value_delimiter = ',')]
        situacao: Vec<String>,

        /// Keep rows with this company size (repeatable)
        #[arg(long, value_delimiter = ',')]
        porte: Vec<String>,

        /// Keep rows with this Simples opt-in value (repeatable)
        #[arg(long, value_delimiter = ',')]
        simples: Vec<String>,

        /// Geocode the filtered rows and write the marker map
        #[arg(long)]
        geocode: bool,

        /// Geocoding provider, overrides GEOCODER_PROVIDER
        #[arg(long)]
        provider: Option<String>,

        /// Locality used when a row has no municipality, overrides DEFAULT_LOCALITY
        #[arg(long)]
        locality: Option<String>,

        /// Concurrent geocoding workers, overrides GEOCODER_WORKERS
        #[arg(long)]
        workers: Option<usize>,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Values { input } => print_values(&input),
        Commands::Report {
            input,
            out_dir,
            situacao,
            porte,
            simples,
            geocode,
            provider,
            locality,
            workers,
        } => {
            let mut config = AppConfig::from_env();
            if let Some(provider) = provider {
                config.provider = ProviderKind::parse(&provider)?;
            }
            if locality.is_some() {
                config.default_locality = locality;
            }
            if let Some(workers) = workers {
                config = config.with_workers(workers);
            }
            let selection = FilterSelection {
                situacao,
                porte,
                simples,
            };
            let written = build_report(&input, &out_dir, &selection, geocode, &config).await?;
            for path in written {
                println!("{}", path.display());
            }
            Ok(())
        }
    }
}

fn load_dataset(input: &Path) -> Result<Dataset> {
    let dataset = Dataset::from_path(input)
        .with_context(|| format!("failed to read dataset {}", input.display()))?;
    dataset.validate()?;
    Ok(dataset)
}

fn print_values(input: &Path) -> Result<()> {
    let dataset = load_dataset(input)?;
    let options = filter_options(&dataset);
    println!("{}", serde_json::to_string_pretty(&options)?);
    Ok(())
}

pub async fn build_report(
    input: &Path,
    out_dir: &Path,
    selection: &FilterSelection,
    geocode: bool,
    config: &AppConfig,
) -> Result<Vec<PathBuf>> {
    let dataset = load_dataset(input)?;
    let view = selection.apply(&dataset);
    let summary = summarize(&view);
    info!(
        rows = dataset.len(),
        filtered = view.len(),
        active = summary.indicators.active,
        "dataset filtered"
    );

    ensure_out_dir(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let run = if !geocode {
        None
    } else if let Err(err) = dataset.validate_address_columns() {
        warn!(target: "geocoding", %err, "skipping geocoding");
        None
    } else {
        Some(geocode_rows(&view, config).await?)
    };

    let mut written = vec![
        write_filtered_csv(&view, run.as_ref(), &out_dir.join(FILTERED_CSV))?,
        write_json(
            &SummaryDocument {
                filters: selection,
                summary: &summary,
            },
            &out_dir.join(SUMMARY_JSON),
        )?,
        write_report(
            &ReportInput {
                title: "Cadastro de Empresas",
                filters: selection,
                summary: &summary,
                view: &view,
                geocoding: run.as_ref(),
            },
            &out_dir.join(REPORT_HTML),
        )?,
    ];
    if let Some(run) = &run {
        written.push(write_unresolved_csv(run, &out_dir.join(UNRESOLVED_CSV))?);
        written.push(write_map(
            &run.markers(&dataset),
            "Mapa de Empresas",
            &out_dir.join(MAP_HTML),
        )?);
    }

    let mut manifest = ReportManifest::new(dataset.profile(), view.len());
    manifest.geocoding = run.as_ref().map(|r| r.stats.clone());
    manifest.config = Some(config.public_profile());
    manifest.artifacts = written
        .iter()
        .filter_map(|path| path.file_name())
        .map(|name| name.to_string_lossy().to_string())
        .collect();
    written.push(write_json(&manifest, &out_dir.join(MANIFEST_JSON))?);

    info!(out_dir = %out_dir.display(), artifacts = written.len(), "report written");
    Ok(written)
}

async fn geocode_rows(
    view: &FilteredView<'_>,
    config: &AppConfig,
) -> Result<GeocodeRun> {
    let provider = build_provider(config)?;
    let session = GeocodeSession::new(provider, config);

    let cancel_flag = Arc::new(AtomicBool::new(false));
    let signal_flag = cancel_flag.clone();
    // Stays installed for the rest of the process; once geocoding is over the
    // flag is already set, so the next interrupt exits.
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt_escalates(&signal_flag) {
                warn!("interrupted again; exiting");
                std::process::exit(INTERRUPTED_EXIT_CODE);
            }
            warn!(
                target: "geocoding",
                "interrupt received; finishing in-flight rows (Ctrl-C again to exit)"
            );
        }
    });

    let observer: Arc<dyn Fn(GeocodeProgress) + Send + Sync> =
        Arc::new(|progress: GeocodeProgress| {
            if progress.processed % PROGRESS_EVERY == 0 || progress.processed == progress.total_rows
            {
                info!(
                    target: "geocoding",
                    processed = progress.processed,
                    total = progress.total_rows,
                    resolved = progress.resolved,
                    "geocoding progress"
                );
            }
        });

    let run = session
        .geocode_view(view, Some(observer), Some(cancel_flag.clone()))
        .await;
    cancel_flag.store(true, Ordering::SeqCst);
    Ok(run?)
}

fn interrupt_escalates(cancel_flag: &AtomicBool) -> bool {
    cancel_flag.swap(true, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_report_arguments() {
        let cli = Cli::try_parse_from([
            "registry-report",
            "-v",
            "report",
            "--input",
            "empresas.csv",
            "--situacao",
            "ATIVA,INAPTA",
            "--porte",
            "ME",
            "--porte",
            "EPP",
            "--geocode",
            "--workers",
            "4",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Report {
                situacao,
                porte,
                simples,
                geocode,
                workers,
                out_dir,
                ..
            } => {
                assert_eq!(situacao, vec!["ATIVA", "INAPTA"]);
                assert_eq!(porte, vec!["ME", "EPP"]);
                assert!(simples.is_empty());
                assert!(geocode);
                assert_eq!(workers, Some(4));
                assert_eq!(out_dir, PathBuf::from("report"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn second_interrupt_escalates() {
        let flag = AtomicBool::new(false);
        assert!(!interrupt_escalates(&flag));
        assert!(flag.load(Ordering::SeqCst));
        assert!(interrupt_escalates(&flag));
    }

    #[tokio::test]
    async fn writes_artifacts_without_geocoding() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("empresas.csv");
        std::fs::write(
            &input,
            "Razao Social;Situacao Cadastral;Porte da Empresa;Optante Simples\nPadaria Sol;ATIVA;ME;Sim\nOficina;BAIXADA;EPP;Nao\n",
        )
        .unwrap();
        let out_dir = dir.path().join("out");
        let selection = FilterSelection {
            situacao: vec!["ATIVA".into()],
            ..Default::default()
        };

        let written = build_report(&input, &out_dir, &selection, true, &AppConfig::default())
            .await
            .unwrap();

        let names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![FILTERED_CSV, SUMMARY_JSON, REPORT_HTML, MANIFEST_JSON]
        );
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out_dir.join(MANIFEST_JSON)).unwrap())
                .unwrap();
        assert_eq!(manifest["filtered_rows"], 1);
        assert_eq!(manifest["dataset"]["geocodable"], false);
        assert_eq!(manifest["artifacts"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rejects_dataset_missing_required_column() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("empresas.csv");
        std::fs::write(&input, "Porte da Empresa,Optante Simples\nME,Sim\n").unwrap();
        let out_dir = dir.path().join("out");

        let err = build_report(
            &input,
            &out_dir,
            &FilterSelection::default(),
            false,
            &AppConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Situacao Cadastral"));
        assert!(!out_dir.exists());
    }
}
