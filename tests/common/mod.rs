#![allow(dead_code)]

use std::fs;
use std::path::Path;

use chrono::{Duration, NaiveDate};
use northstar_fe::{
    AssetMetadata, Collaborators, CsvDirectorySource, LocalArtifactStore, RuntimeConfig,
    SqliteTrackingStore,
};
use serde_json::{json, Value};

pub const ROWS: usize = 100;

/// Tickers, asset classes and a deterministic price path per ticker.
pub const ASSETS: [(&str, &str); 3] = [("A", "Index"), ("B", "FX"), ("C", "Commodity")];

pub fn price(ticker_idx: usize, row: usize) -> f64 {
    let t = row as f64;
    let k = ticker_idx as f64 + 1.0;
    let jitter = ((row * 7919 + ticker_idx * 104_729) % 13) as f64 * 0.03;
    100.0 * k + 5.0 * (0.3 * t / k).sin() + 2.0 * (1.7 * t + k).cos() + 0.05 * t + jitter
}

pub fn write_price_files(dir: &Path) {
    let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
    for (idx, (ticker, _)) in ASSETS.iter().enumerate() {
        let mut body = String::from("Date,Close\n");
        for row in 0..ROWS {
            let date = start + Duration::days(row as i64);
            body.push_str(&format!("{date},{}\n", price(idx, row)));
        }
        fs::write(dir.join(format!("{ticker}.csv")), body).unwrap();
    }
}

pub struct Stages {
    pub indicators: bool,
    pub arima: bool,
    pub fft: bool,
    pub autoencoder_epochs: Option<usize>,
}

pub fn template(predicted: &str, stages: &Stages) -> Value {
    json!({
        "predictedAsset": predicted,
        "feMeta": {
            "baseAssets": ["A", "B", "C"],
            "taSettings": {
                "assets": ["A", "B", "C"],
                "enabled": stages.indicators,
                "bollingerBand": { "window": 5, "window_dev": 2 },
                "rsi": { "window": 5 },
                "sma": { "window": 5 }
            },
            "arimaSettings": {
                "assets": ["A", "B"],
                "enabled": stages.arima,
                "trainSetSize": 0.8
            },
            "fftSettings": {
                "assetClasses": ["FX", "Commodity"],
                "enabled": stages.fft,
                "num_steps": [3, 6]
            },
            "autoEncoderSettings": {
                "enabled": stages.autoencoder_epochs.is_some(),
                "optimizer": "adam",
                "loss": "mean_squared_error",
                "fitEpoch": stages.autoencoder_epochs.unwrap_or(0),
                "fitBatchSize": 32,
                "fitShuffle": true,
                "verbose": 0,
                "seed": 3
            }
        },
        "deepARMeta": {
            "freq": "1D",
            "predictionLength": 7,
            "startDataset": "2020-01-01",
            "endTraining": "2020-03-01",
            "testWindows": 4
        }
    })
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: SqliteTrackingStore,
    pub prices: CsvDirectorySource,
    pub artifacts: LocalArtifactStore,
    pub runtime: RuntimeConfig,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let assets_dir = dir.path().join("assets");
        let artifact_root = dir.path().join("output");
        fs::create_dir_all(&assets_dir).unwrap();
        write_price_files(&assets_dir);

        let store = SqliteTrackingStore::open(&dir.path().join("tracking.sqlite")).unwrap();
        for (ticker, class) in ASSETS {
            store
                .upsert_asset(&AssetMetadata {
                    ticker: ticker.to_string(),
                    asset_class: class.to_string(),
                    company: String::new(),
                    bucket_key: None,
                })
                .unwrap();
        }

        let runtime = RuntimeConfig {
            assets_dir: assets_dir.clone(),
            artifact_root: artifact_root.clone(),
            store_path: dir.path().join("tracking.sqlite"),
            autoencoder_verbose: None,
            assets_base_url: None,
        };

        Self {
            prices: CsvDirectorySource::new(assets_dir),
            artifacts: LocalArtifactStore::new(artifact_root),
            store,
            runtime,
            dir,
        }
    }

    pub fn register(&self, exec_id: &str, template: &Value) {
        self.store
            .put_template(exec_id, &template.to_string())
            .unwrap();
        self.store.create_execution(exec_id, exec_id).unwrap();
    }

    pub fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            catalog: &self.store,
            prices: &self.prices,
            templates: &self.store,
            status: &self.store,
            importance: &self.store,
            artifacts: &self.artifacts,
        }
    }

    pub fn artifact(&self, exec_id: &str, key: &str) -> Vec<u8> {
        fs::read(self.runtime.artifact_root.join("execution").join(exec_id).join(key)).unwrap()
    }
}
