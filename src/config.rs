//! Typed training template and process runtime configuration.
//!
//! The template mirrors the JSON document stored per training template
//! (camelCase keys, `feMeta` / `deepARMeta` groups). Every field has a default
//! so partial documents deserialize, and `Template::validate` is run once at
//! pipeline entry.

use std::env;
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::observability::parse_bool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid template setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
    #[error("unsupported frequency: {0}")]
    UnsupportedFrequency(String),
    #[error("malformed template document: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Template {
    pub predicted_asset: String,
    pub fe_meta: FeMeta,
    #[serde(rename = "deepARMeta")]
    pub deep_ar_meta: DeepArMeta,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            predicted_asset: "B10YR".to_string(),
            fe_meta: FeMeta::default(),
            deep_ar_meta: DeepArMeta::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeMeta {
    pub base_assets: BaseAssets,
    pub ta_settings: TaSettings,
    pub arima_settings: ArimaSettings,
    pub fft_settings: FftSettings,
    pub auto_encoder_settings: AutoEncoderSettings,
}

/// Base ticker universe: the keyword `"all"` or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawBaseAssets", into = "RawBaseAssets")]
pub enum BaseAssets {
    #[default]
    All,
    Tickers(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawBaseAssets {
    Keyword(String),
    Tickers(Vec<String>),
}

impl TryFrom<RawBaseAssets> for BaseAssets {
    type Error = String;

    fn try_from(raw: RawBaseAssets) -> Result<Self, Self::Error> {
        match raw {
            RawBaseAssets::Keyword(word) if word.trim().eq_ignore_ascii_case("all") => {
                Ok(Self::All)
            }
            RawBaseAssets::Keyword(other) => Err(format!(
                "baseAssets must be \"all\" or a list of tickers, got \"{other}\""
            )),
            RawBaseAssets::Tickers(tickers) => Ok(Self::Tickers(tickers)),
        }
    }
}

impl From<BaseAssets> for RawBaseAssets {
    fn from(value: BaseAssets) -> Self {
        match value {
            BaseAssets::All => Self::Keyword("all".to_string()),
            BaseAssets::Tickers(tickers) => Self::Tickers(tickers),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaSettings {
    pub assets: Vec<String>,
    pub enabled: bool,
    pub bollinger_band: BollingerSettings,
    pub rsi: WindowSettings,
    pub sma: WindowSettings,
}

impl Default for TaSettings {
    fn default() -> Self {
        Self {
            assets: [
                "DJIA",
                "NASDAQ",
                "SPX",
                "USDJPY",
                "DJIA1MFutures",
                "B10YR",
                "B20Y",
                "EURUSD",
                "EuroBund",
                "GBPUSD",
                "AMERIBOR",
                "gold",
                "oil",
                "LIBORUSD",
                "LIBOREUR",
                "LIBORUK",
            ]
            .iter()
            .map(|t| t.to_string())
            .collect(),
            enabled: true,
            bollinger_band: BollingerSettings::default(),
            rsi: WindowSettings { window: 14 },
            sma: WindowSettings { window: 7 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BollingerSettings {
    pub window: usize,
    #[serde(alias = "windowDev")]
    pub window_dev: f64,
}

impl Default for BollingerSettings {
    fn default() -> Self {
        Self {
            window: 20,
            window_dev: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSettings {
    pub window: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArimaSettings {
    pub assets: Vec<String>,
    pub enabled: bool,
    pub train_set_size: f64,
}

impl Default for ArimaSettings {
    fn default() -> Self {
        Self {
            assets: ["EURUSD", "GBPUSD", "gold", "NASDAQ", "DJIA", "B10YR"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            enabled: true,
            train_set_size: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FftSettings {
    pub asset_classes: Vec<String>,
    pub enabled: bool,
    #[serde(rename = "num_steps", alias = "numSteps")]
    pub num_steps: Vec<usize>,
}

impl Default for FftSettings {
    fn default() -> Self {
        Self {
            asset_classes: ["FX", "Index", "Commodity", "Futures", "Fixed Income"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            enabled: true,
            num_steps: vec![3, 6, 9, 100],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam,
    Sgd,
    Rmsprop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    #[serde(alias = "mse")]
    MeanSquaredError,
    #[serde(alias = "mae")]
    MeanAbsoluteError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoEncoderSettings {
    pub enabled: bool,
    pub optimizer: OptimizerKind,
    pub loss: LossKind,
    pub fit_epoch: usize,
    pub fit_batch_size: usize,
    pub fit_shuffle: bool,
    pub verbose: u8,
    pub seed: u64,
}

impl Default for AutoEncoderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            optimizer: OptimizerKind::Adam,
            loss: LossKind::MeanSquaredError,
            fit_epoch: 460,
            fit_batch_size: 256,
            fit_shuffle: false,
            verbose: 0,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeepArMeta {
    pub freq: String,
    pub prediction_length: usize,
    #[serde(with = "date_or_epoch_ms")]
    pub start_dataset: NaiveDate,
    #[serde(with = "date_or_epoch_ms")]
    pub end_training: NaiveDate,
    pub test_windows: usize,
}

impl Default for DeepArMeta {
    fn default() -> Self {
        Self {
            freq: "1D".to_string(),
            prediction_length: 7,
            start_dataset: NaiveDate::from_ymd_opt(2010, 1, 1).unwrap_or_default(),
            end_training: NaiveDate::from_ymd_opt(2018, 1, 1).unwrap_or_default(),
            test_windows: 4,
        }
    }
}

impl DeepArMeta {
    pub fn frequency(&self) -> Result<Frequency, ConfigError> {
        Frequency::parse(&self.freq)
    }
}

/// Sampling step of the forecasting dataset, in whole days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frequency {
    step_days: i64,
}

impl Frequency {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        let unsupported = || ConfigError::UnsupportedFrequency(raw.to_string());
        let unit = trimmed.chars().last().ok_or_else(unsupported)?;
        let count_text = &trimmed[..trimmed.len() - unit.len_utf8()];
        let count: i64 = if count_text.is_empty() {
            1
        } else {
            count_text.parse().map_err(|_| unsupported())?
        };
        if count <= 0 {
            return Err(unsupported());
        }

        let days_per_unit = match unit.to_ascii_uppercase() {
            'D' => 1,
            'W' => 7,
            _ => return Err(unsupported()),
        };

        Ok(Self {
            step_days: count * days_per_unit,
        })
    }

    pub fn step(&self) -> ChronoDuration {
        ChronoDuration::days(self.step_days)
    }

    pub fn steps(&self, count: usize) -> ChronoDuration {
        ChronoDuration::days(self.step_days.saturating_mul(count as i64))
    }
}

impl Template {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.predicted_asset.trim().is_empty() {
            return Err(invalid("predictedAsset", "must not be empty"));
        }

        let ta = &self.fe_meta.ta_settings;
        if ta.bollinger_band.window == 0 {
            return Err(invalid("taSettings.bollingerBand.window", "must be > 0"));
        }
        if !ta.bollinger_band.window_dev.is_finite() || ta.bollinger_band.window_dev < 0.0 {
            return Err(invalid(
                "taSettings.bollingerBand.window_dev",
                "must be a finite value >= 0",
            ));
        }
        if ta.rsi.window == 0 {
            return Err(invalid("taSettings.rsi.window", "must be > 0"));
        }
        if ta.sma.window == 0 {
            return Err(invalid("taSettings.sma.window", "must be > 0"));
        }

        let arima = &self.fe_meta.arima_settings;
        if !(arima.train_set_size > 0.0 && arima.train_set_size < 1.0) {
            return Err(invalid(
                "arimaSettings.trainSetSize",
                "must be strictly between 0 and 1",
            ));
        }

        if self.fe_meta.fft_settings.num_steps.iter().any(|k| *k == 0) {
            return Err(invalid("fftSettings.num_steps", "entries must be > 0"));
        }

        let ae = &self.fe_meta.auto_encoder_settings;
        if ae.enabled {
            if ae.fit_epoch == 0 {
                return Err(invalid("autoEncoderSettings.fitEpoch", "must be > 0"));
            }
            if ae.fit_batch_size == 0 {
                return Err(invalid("autoEncoderSettings.fitBatchSize", "must be > 0"));
            }
        }

        let deep_ar = &self.deep_ar_meta;
        deep_ar.frequency()?;
        if deep_ar.prediction_length == 0 {
            return Err(invalid("deepARMeta.predictionLength", "must be > 0"));
        }
        if deep_ar.test_windows == 0 {
            return Err(invalid("deepARMeta.testWindows", "must be > 0"));
        }
        if deep_ar.end_training <= deep_ar.start_dataset {
            return Err(invalid(
                "deepARMeta.endTraining",
                "must be after startDataset",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        field,
        reason: reason.to_string(),
    }
}

/// Dates stored either as epoch milliseconds (UTC) or as `YYYY-MM-DD`.
mod date_or_epoch_ms {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDate {
        Millis(i64),
        FloatMillis(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or_default();
        serializer.serialize_i64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let raw = RawDate::deserialize(deserializer)?;
        let millis = match raw {
            RawDate::Millis(ms) => ms,
            RawDate::FloatMillis(ms) => ms as i64,
            RawDate::Text(text) => {
                return NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
                    .map_err(serde::de::Error::custom)
            }
        };
        DateTime::from_timestamp_millis(millis)
            .map(|dt| dt.date_naive())
            .ok_or_else(|| serde::de::Error::custom(format!("invalid epoch millis {millis}")))
    }
}

/// Process-level settings for the step binaries and adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub assets_dir: PathBuf,
    pub artifact_root: PathBuf,
    pub store_path: PathBuf,
    pub autoencoder_verbose: Option<u8>,
    pub assets_base_url: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            assets_dir: PathBuf::from("data/assets"),
            artifact_root: PathBuf::from("data/output"),
            store_path: PathBuf::from("data/tracking.sqlite"),
            autoencoder_verbose: None,
            assets_base_url: None,
        }
    }
}

pub fn runtime_config_from_env() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();

    if let Some(dir) = non_empty_env("NSFE_ASSETS_DIR") {
        config.assets_dir = PathBuf::from(dir);
    }
    if let Some(dir) = non_empty_env("NSFE_ARTIFACT_ROOT") {
        config.artifact_root = PathBuf::from(dir);
    }
    if let Some(path) = non_empty_env("NSFE_STORE_PATH") {
        config.store_path = PathBuf::from(path);
    }
    if let Some(raw) = non_empty_env("NSFE_AUTOENCODER_VERBOSE") {
        config.autoencoder_verbose = raw
            .parse::<u8>()
            .ok()
            .or_else(|| parse_bool(&raw).map(u8::from));
    }
    config.assets_base_url = non_empty_env("NSFE_ASSETS_BASE_URL");

    config
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
