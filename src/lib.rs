//! Northstar feature-engineering core.
//!
//! Turns end-of-day asset price series into a model-ready feature table,
//! ranks feature importance for a predicted asset and emits windowed
//! training/test datasets for a sequence forecaster.

mod arima;
#[cfg(feature = "asset-sync")]
mod asset_sync;
mod autoencoder;
mod charts;
mod config;
mod gbt;
mod importance;
mod indicators;
mod loader;
mod observability;
mod pipeline;
mod server;
mod spectral;
mod table;
mod tracking;
mod windower;

pub use arima::{add_arima_features, walk_forward, ArimaError, ArimaModel, AR_ORDER};
#[cfg(feature = "asset-sync")]
pub use asset_sync::{AssetSyncConfig, AssetSyncError, RemoteCsvSource};
pub use autoencoder::{
    add_autoencoder_features, Activation, Autoencoder, RepresentationError,
    RepresentationOutcome, TrainingHistory,
};
pub use charts::{Chart, ChartKind};
pub use config::{
    runtime_config_from_env, ArimaSettings, AutoEncoderSettings, BaseAssets, BollingerSettings,
    ConfigError, DeepArMeta, FeMeta, FftSettings, Frequency, LossKind, OptimizerKind,
    RuntimeConfig, TaSettings, Template, WindowSettings,
};
pub use gbt::{
    rmse, BoosterParams, GbtError, GradientBoostedTrees, RegressionNode, RegressionTree,
    RoundMetrics,
};
pub use importance::{
    compute_importance, forward_lags, lag_column_name, ClassImportance, FeatureImportance,
    ImportanceError, ImportanceReport, LAG_COUNT,
};
pub use indicators::{add_technical_indicators, backfill, bollinger, rsi, sma, IndicatorError};
pub use loader::{
    filter_loaded, load_aligned_table, resolve_universe, spectral_tickers, AssetCatalog,
    AssetMetadata, CsvDirectorySource, LoadError, LoadOutcome, PriceSeries, PriceSource,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, logging_config_from_env, LogEntry, LogFormat,
    LogLevel, LoggingConfig, LoggingInitError, RunLog,
};
pub use pipeline::{
    run_step, Collaborators, RunSummary, StepError, FEATURES_KEY, TEST_KEY, TRAIN_KEY,
};
pub use server::tracking_router;
pub use spectral::{
    add_spectral_features, autocorrelation, centered_magnitudes, SpectralError, SpectralOutcome,
    SpectralTransformer,
};
pub use table::{Column, FeatureKind, FeatureTable, Provenance, TableError, DATE_COLUMN, SEPARATOR};
pub use tracking::{
    ArtifactError, ArtifactSink, ExecutionReader, ExecutionRecord, ExecutionStatus,
    ImportanceSink, LocalArtifactStore, SqliteTrackingStore, StatusSink, TemplateStore,
    TrackingError,
};
pub use windower::{
    build_datasets, to_ndjson, Datasets, SeriesRecord, WindowError, WindowSpec,
};
