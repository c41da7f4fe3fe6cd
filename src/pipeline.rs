//! Feature-engineering step driver: runs every stage for one execution and owns
//! the terminal status transition.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{info, warn};

use crate::arima::{add_arima_features, ArimaError};
use crate::autoencoder::{add_autoencoder_features, RepresentationError};
use crate::charts::Chart;
use crate::config::{ConfigError, RuntimeConfig, Template};
use crate::importance::{compute_importance, ImportanceError, ImportanceReport};
use crate::indicators::{add_technical_indicators, IndicatorError};
use crate::loader::{
    filter_loaded, load_aligned_table, resolve_universe, spectral_tickers, AssetCatalog,
    AssetMetadata, LoadError, PriceSource,
};
use crate::observability::RunLog;
use crate::spectral::{add_spectral_features, autocorrelation, centered_magnitudes, SpectralError};
use crate::table::{FeatureTable, TableError};
use crate::tracking::{
    ArtifactError, ArtifactSink, ExecutionStatus, ImportanceSink, StatusSink, TemplateStore,
    TrackingError,
};
use crate::windower::{build_datasets, to_ndjson, WindowError, WindowSpec};

pub const FEATURES_KEY: &str = "training/features.csv";
pub const TRAIN_KEY: &str = "data/train/train.json";
pub const TEST_KEY: &str = "data/test/test.json";

#[derive(Debug, Error)]
pub enum StepError {
    #[error("execution id must not be empty")]
    MissingExecutionId,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tracking(#[from] TrackingError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Indicator(#[from] IndicatorError),
    #[error(transparent)]
    Arima(#[from] ArimaError),
    #[error(transparent)]
    Spectral(#[from] SpectralError),
    #[error(transparent)]
    Importance(#[from] ImportanceError),
    #[error(transparent)]
    Representation(#[from] RepresentationError),
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("artifact upload failed: {0}")]
    Artifact(#[from] ArtifactError),
}

/// External systems the step reads from and reports to.
pub struct Collaborators<'a> {
    pub catalog: &'a dyn AssetCatalog,
    pub prices: &'a dyn PriceSource,
    pub templates: &'a dyn TemplateStore,
    pub status: &'a dyn StatusSink,
    pub importance: &'a dyn ImportanceSink,
    pub artifacts: &'a dyn ArtifactSink,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub exec_id: String,
    pub rows: usize,
    pub columns: Vec<String>,
    pub fingerprint: String,
    pub missing_tickers: Vec<String>,
    pub importance: ImportanceReport,
    pub train_records: usize,
    pub test_records: usize,
}

/// Runs the step for `exec_id`. On failure the execution is marked FAILED with
/// the accumulated logs and the stage error is returned unchanged.
pub fn run_step(
    exec_id: &str,
    collaborators: &Collaborators<'_>,
    runtime: &RuntimeConfig,
) -> Result<RunSummary, StepError> {
    if exec_id.trim().is_empty() {
        return Err(StepError::MissingExecutionId);
    }

    let mut log = RunLog::new(exec_id);
    match run_stages(exec_id, collaborators, runtime, &mut log) {
        Ok(summary) => Ok(summary),
        Err(err) => {
            log.error(format!("Error while executing step: {err}"));
            if let Err(status_err) =
                collaborators
                    .status
                    .update_status(exec_id, ExecutionStatus::Failed, log.entries())
            {
                warn!(
                    component = "pipeline",
                    event = "pipeline.failed_status_not_recorded",
                    exec_id,
                    error = %status_err
                );
            }
            Err(err)
        }
    }
}

fn run_stages(
    exec_id: &str,
    c: &Collaborators<'_>,
    runtime: &RuntimeConfig,
    log: &mut RunLog,
) -> Result<RunSummary, StepError> {
    log.info(format!("Feature engineering step started for execution {exec_id}"));
    c.status
        .update_status(exec_id, ExecutionStatus::Running, log.entries())?;

    let template: Template = c.templates.template_for(exec_id)?;
    template.validate()?;
    let predicted = template.predicted_asset.as_str();
    let fe = &template.fe_meta;
    log.info(format!("Template loaded, predicted asset {predicted}"));

    let catalog = c.catalog.assets()?;
    let universe = resolve_universe(fe, &catalog, predicted);
    log.info(format!("{} assets requested", universe.len()));

    let outcome = load_aligned_table(&universe, c.prices, predicted, log)?;
    let loaded = outcome.loaded;
    let mut table = outcome.table;
    upload_chart(c, exec_id, &assets_per_class_chart(&catalog, &loaded))?;
    c.status
        .update_status(exec_id, ExecutionStatus::Running, log.entries())?;

    if fe.ta_settings.enabled {
        let tickers = filter_loaded("technical indicators", &fe.ta_settings.assets, &loaded, log);
        let added = add_technical_indicators(&mut table, &tickers, &fe.ta_settings)?;
        log.info(format!(
            "Technical indicators added: {added} columns for {} assets",
            tickers.len()
        ));
    } else {
        log.info("Technical indicators disabled");
    }

    if fe.arima_settings.enabled {
        let tickers = filter_loaded("ARIMA", &fe.arima_settings.assets, &loaded, log);
        let added = add_arima_features(&mut table, &tickers, &fe.arima_settings)?;
        log.info(format!("ARIMA features added for {added} assets"));
    } else {
        log.info("ARIMA features disabled");
    }

    if fe.fft_settings.enabled {
        let requested = spectral_tickers(&catalog, &fe.fft_settings.asset_classes);
        let tickers = filter_loaded("Fourier transforms", &requested, &loaded, log);
        let spectral = add_spectral_features(&mut table, &tickers, &fe.fft_settings.num_steps)?;
        log.info(format!(
            "Fourier transforms added: {} columns for {} assets",
            spectral.columns_added,
            tickers.len()
        ));
        if let Some((ticker, magnitudes)) = spectral.last_spectrum {
            let chart = Chart::stem(
                "fft-components",
                format!("Fourier components of {ticker}"),
                centered_magnitudes(&magnitudes),
            );
            upload_chart(c, exec_id, &chart)?;
        }
    } else {
        log.info("Fourier transforms disabled");
    }

    if let Some(target) = table.base_values(predicted) {
        upload_chart(c, exec_id, &autocorrelation_chart(predicted, target))?;
    }
    c.status
        .update_status(exec_id, ExecutionStatus::Running, log.entries())?;

    let importance = compute_importance(&table, &catalog, predicted, log)?;
    c.importance.put_importance(exec_id, &importance)?;
    for chart in importance.charts() {
        upload_chart(c, exec_id, &chart)?;
    }
    log.info(format!(
        "Feature importance stored for {} features",
        importance.feature_importance.len()
    ));
    c.status
        .update_status(exec_id, ExecutionStatus::Running, log.entries())?;

    let ae = &fe.auto_encoder_settings;
    if ae.enabled {
        let verbose = runtime.autoencoder_verbose.unwrap_or(ae.verbose);
        let representation = add_autoencoder_features(&mut table, predicted, ae, verbose)?;
        upload_chart(c, exec_id, &representation.history.validation_chart())?;
        log.info(format!(
            "Number of synthetic features (AE): {}",
            representation.columns_added
        ));
    } else {
        log.info("Autoencoder disabled");
    }

    let fingerprint = table.fingerprint();
    log.info(format!(
        "Total number of features: {} over {} rows (fingerprint {fingerprint})",
        table.columns().len(),
        table.row_count()
    ));
    c.artifacts
        .upload(exec_id, FEATURES_KEY, &table.to_csv_bytes()?)?;
    log.info(format!("Features CSV uploaded to {FEATURES_KEY}"));

    let (train_records, test_records) = upload_datasets(c, exec_id, &table, &template, log)?;

    c.status
        .update_status(exec_id, ExecutionStatus::Finished, log.entries())?;
    info!(
        component = "pipeline",
        event = "pipeline.finish",
        exec_id,
        rows = table.row_count(),
        columns = table.columns().len(),
        fingerprint = %fingerprint
    );

    Ok(RunSummary {
        exec_id: exec_id.to_string(),
        rows: table.row_count(),
        columns: table.column_names(),
        fingerprint,
        missing_tickers: outcome.missing,
        importance,
        train_records,
        test_records,
    })
}

fn upload_datasets(
    c: &Collaborators<'_>,
    exec_id: &str,
    table: &FeatureTable,
    template: &Template,
    log: &mut RunLog,
) -> Result<(usize, usize), StepError> {
    let spec = WindowSpec::from_meta(&template.deep_ar_meta)?;
    let datasets = build_datasets(table, &spec);
    log.info(format!(
        "Training data generated. Data length={}",
        datasets.train.len()
    ));
    log.info(format!(
        "Test data generated. Test data length={}",
        datasets.test.len()
    ));

    c.artifacts
        .upload(exec_id, TRAIN_KEY, &to_ndjson(&datasets.train)?)?;
    log.info(format!("Training data uploaded to {TRAIN_KEY}"));
    c.artifacts
        .upload(exec_id, TEST_KEY, &to_ndjson(&datasets.test)?)?;
    log.info(format!("Test data uploaded to {TEST_KEY}"));

    Ok((datasets.train.len(), datasets.test.len()))
}

fn upload_chart(c: &Collaborators<'_>, exec_id: &str, chart: &Chart) -> Result<(), StepError> {
    c.artifacts
        .upload(exec_id, &chart.artifact_key(), chart.render_svg().as_bytes())?;
    Ok(())
}

/// Number of loaded assets per catalog class.
fn assets_per_class_chart(catalog: &[AssetMetadata], loaded: &[String]) -> Chart {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for ticker in loaded {
        let class = catalog
            .iter()
            .find(|asset| asset.ticker.trim() == ticker.trim())
            .map(|asset| asset.asset_class.trim())
            .unwrap_or("Unknown");
        *counts.entry(class).or_insert(0) += 1;
    }
    Chart::horizontal_bars(
        "assets-per-class",
        "Assets per class",
        counts.keys().map(|class| class.to_string()).collect(),
        counts.values().map(|count| *count as f64).collect(),
    )
}

/// Autocorrelation with the 95% and 99% confidence bands.
fn autocorrelation_chart(ticker: &str, series: &[f64]) -> Chart {
    let n = series.len().max(1) as f64;
    let z95 = 1.959_963_984_540_054 / n.sqrt();
    let z99 = 2.575_829_303_548_901 / n.sqrt();
    Chart::line(
        "autocorrelation",
        format!("Autocorrelation of {ticker}"),
        autocorrelation(series),
    )
    .with_x_label("Lag")
    .with_guides(vec![z99, z95, -z95, -z99])
}
