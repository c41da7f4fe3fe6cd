//! Price source that mirrors remote per-asset CSV objects into the local assets directory.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

use crate::loader::{AssetMetadata, CsvDirectorySource, LoadError, PriceSeries, PriceSource};
use crate::tracking::{write_atomic, ArtifactError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSyncConfig {
    pub base_url: String,
    pub assets_dir: PathBuf,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl AssetSyncConfig {
    pub fn new(base_url: impl Into<String>, assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            assets_dir: assets_dir.into(),
            timeout_ms: 30_000,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }

    /// `{base_url}/{bucket_key}`, defaulting the key to `{ticker}.csv`.
    pub fn url_for(&self, ticker: &str, bucket_key: Option<&str>) -> String {
        let key = bucket_key
            .map(str::to_string)
            .unwrap_or_else(|| format!("{ticker}.csv"));
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Error)]
pub enum AssetSyncError {
    #[error("failed to build HTTP client: {0}")]
    HttpClientBuild(String),
    #[error("request to {url} failed: {message}")]
    HttpRequest { url: String, message: String },
    #[error("failed to store downloaded asset: {0}")]
    Store(#[from] ArtifactError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) trait HttpFetcher {
    /// `Ok(None)` when the object does not exist.
    fn get_bytes(&self, url: &str) -> Result<Option<Vec<u8>>, AssetSyncError>;
}

struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    fn new(timeout_ms: u64) -> Result<Self, AssetSyncError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| AssetSyncError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Option<Vec<u8>>, AssetSyncError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| AssetSyncError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(AssetSyncError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .map(|bytes| Some(bytes.to_vec()))
            .map_err(|err| AssetSyncError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

/// Downloads a ticker's CSV on first use, then reads it like [`CsvDirectorySource`].
///
/// Files already present locally are never re-fetched. A remote 404 is reported
/// as a missing series so the loader treats it as missing data.
pub struct RemoteCsvSource {
    cfg: AssetSyncConfig,
    catalog: Vec<AssetMetadata>,
    local: CsvDirectorySource,
    fetcher: Box<dyn HttpFetcher>,
}

impl RemoteCsvSource {
    pub fn new(cfg: AssetSyncConfig, catalog: Vec<AssetMetadata>) -> Result<Self, AssetSyncError> {
        let fetcher = ReqwestBlockingFetcher::new(cfg.timeout_ms)?;
        Ok(Self::with_fetcher(cfg, catalog, Box::new(fetcher)))
    }

    pub(crate) fn with_fetcher(
        cfg: AssetSyncConfig,
        catalog: Vec<AssetMetadata>,
        fetcher: Box<dyn HttpFetcher>,
    ) -> Self {
        let local = CsvDirectorySource::new(cfg.assets_dir.clone());
        Self {
            cfg,
            catalog,
            local,
            fetcher,
        }
    }

    /// Returns `Ok(false)` when the remote object does not exist.
    fn ensure_local(&self, ticker: &str) -> Result<bool, AssetSyncError> {
        let csv_path = self.cfg.assets_dir.join(format!("{ticker}.csv"));
        let zip_path = self.cfg.assets_dir.join(format!("{ticker}.zip"));
        if csv_path.is_file() || zip_path.is_file() {
            info!(
                component = "asset_sync",
                event = "asset_sync.file.cached",
                ticker,
                path = %csv_path.display()
            );
            return Ok(true);
        }

        let bucket_key = self
            .catalog
            .iter()
            .find(|asset| asset.ticker.trim() == ticker)
            .and_then(|asset| asset.bucket_key.as_deref());
        let url = self.cfg.url_for(ticker, bucket_key);
        let local_path = match bucket_key {
            Some(key) if key.to_ascii_lowercase().ends_with(".zip") => zip_path,
            _ => csv_path,
        };

        match retry(&self.cfg, || self.fetcher.get_bytes(&url))? {
            Some(bytes) => {
                std::fs::create_dir_all(&self.cfg.assets_dir)?;
                write_atomic(&local_path, &bytes)?;
                info!(
                    component = "asset_sync",
                    event = "asset_sync.file.downloaded",
                    ticker,
                    url = %url,
                    path = %local_path.display(),
                    bytes = bytes.len()
                );
                Ok(true)
            }
            None => {
                warn!(
                    component = "asset_sync",
                    event = "asset_sync.file.missing",
                    ticker,
                    url = %url
                );
                Ok(false)
            }
        }
    }
}

impl PriceSource for RemoteCsvSource {
    fn fetch(&self, ticker: &str) -> Result<Option<PriceSeries>, LoadError> {
        let present = self
            .ensure_local(ticker)
            .map_err(|err| LoadError::Source {
                ticker: ticker.to_string(),
                message: err.to_string(),
            })?;
        if !present {
            return Ok(None);
        }
        self.local.fetch(ticker)
    }
}

fn retry<T>(
    cfg: &AssetSyncConfig,
    mut f: impl FnMut() -> Result<T, AssetSyncError>,
) -> Result<T, AssetSyncError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= cfg.max_retries => return Err(err),
            Err(_) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(1u64 << shift);
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use std::rc::Rc;
    use tempfile::tempdir;

    const GOLD_URL: &str = "https://assets.test/prices/commodities/gold.csv";
    const GOLD_CSV: &str = "Date,Close\n2020-01-01,1500\n2020-01-02,1510.5\n";

    #[derive(Default)]
    struct MockFetcher {
        responses: HashMap<String, Vec<u8>>,
        failures_before_success: Cell<u32>,
        calls: Rc<Cell<u32>>,
    }

    impl MockFetcher {
        fn with(mut self, url: &str, body: &[u8]) -> Self {
            self.responses.insert(url.to_string(), body.to_vec());
            self
        }

        fn failing(self, times: u32) -> Self {
            self.failures_before_success.set(times);
            self
        }
    }

    impl HttpFetcher for MockFetcher {
        fn get_bytes(&self, url: &str) -> Result<Option<Vec<u8>>, AssetSyncError> {
            self.calls.set(self.calls.get() + 1);
            let remaining = self.failures_before_success.get();
            if remaining > 0 {
                self.failures_before_success.set(remaining - 1);
                return Err(AssetSyncError::HttpRequest {
                    url: url.to_string(),
                    message: "connection reset".to_string(),
                });
            }
            Ok(self.responses.get(url).cloned())
        }
    }

    fn remote_source(dir: &Path, fetcher: MockFetcher) -> (RemoteCsvSource, Rc<Cell<u32>>) {
        let calls = Rc::clone(&fetcher.calls);
        let cfg = AssetSyncConfig {
            retry_backoff_ms: 0,
            ..AssetSyncConfig::new("https://assets.test/prices/", dir)
        };
        let catalog = vec![AssetMetadata {
            ticker: "gold ".to_string(),
            asset_class: "Commodity".to_string(),
            company: String::new(),
            bucket_key: Some("commodities/gold.csv".to_string()),
        }];
        (
            RemoteCsvSource::with_fetcher(cfg, catalog, Box::new(fetcher)),
            calls,
        )
    }

    #[test]
    fn downloads_by_bucket_key_then_parses_the_local_copy() {
        let temp = tempdir().unwrap();
        let (source, _) = remote_source(
            temp.path(),
            MockFetcher::default().with(GOLD_URL, GOLD_CSV.as_bytes()),
        );

        let series = source.fetch("gold").unwrap().unwrap();
        assert_eq!(series.closes(), &[1500.0, 1510.5]);
        assert_eq!(
            fs::read_to_string(temp.path().join("gold.csv")).unwrap(),
            GOLD_CSV
        );
    }

    #[test]
    fn missing_objects_are_missing_series() {
        let temp = tempdir().unwrap();
        let (source, calls) = remote_source(temp.path(), MockFetcher::default());
        assert!(source.fetch("oil").unwrap().is_none());
        assert_eq!(calls.get(), 1);
        assert!(!temp.path().join("oil.csv").exists());
    }

    #[test]
    fn cached_files_are_not_fetched() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("gold.csv"), GOLD_CSV).unwrap();
        let (source, calls) = remote_source(temp.path(), MockFetcher::default());

        assert_eq!(source.fetch("gold").unwrap().unwrap().len(), 2);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn transient_failures_are_retried_until_the_limit() {
        let temp = tempdir().unwrap();
        let (source, calls) = remote_source(
            temp.path(),
            MockFetcher::default()
                .with(GOLD_URL, GOLD_CSV.as_bytes())
                .failing(2),
        );
        assert!(source.fetch("gold").unwrap().is_some());
        assert_eq!(calls.get(), 3);

        let other = tempdir().unwrap();
        let (source, calls) = remote_source(
            other.path(),
            MockFetcher::default()
                .with(GOLD_URL, GOLD_CSV.as_bytes())
                .failing(10),
        );
        let err = source.fetch("gold").unwrap_err();
        assert!(matches!(err, LoadError::Source { .. }));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn zip_bucket_keys_are_stored_as_zip_archives() {
        use std::io::{Cursor, Write};
        use zip::write::SimpleFileOptions;

        let mut archive = zip::ZipWriter::new(Cursor::new(Vec::new()));
        archive
            .start_file("EURUSD.csv", SimpleFileOptions::default())
            .unwrap();
        archive.write_all(GOLD_CSV.as_bytes()).unwrap();
        let body = archive.finish().unwrap().into_inner();

        let temp = tempdir().unwrap();
        let cfg = AssetSyncConfig {
            retry_backoff_ms: 0,
            ..AssetSyncConfig::new("https://assets.test/prices", temp.path())
        };
        let catalog = vec![AssetMetadata {
            ticker: "EURUSD".to_string(),
            asset_class: "FX".to_string(),
            company: String::new(),
            bucket_key: Some("fx/EURUSD.zip".to_string()),
        }];
        let fetcher =
            MockFetcher::default().with("https://assets.test/prices/fx/EURUSD.zip", &body);
        let source = RemoteCsvSource::with_fetcher(cfg, catalog, Box::new(fetcher));

        let series = source.fetch("EURUSD").unwrap().unwrap();
        assert_eq!(series.closes(), &[1500.0, 1510.5]);
        assert!(temp.path().join("EURUSD.zip").is_file());
        assert!(!temp.path().join("EURUSD.csv").exists());
    }

    #[test]
    fn url_defaults_to_ticker_csv() {
        let cfg = AssetSyncConfig::new("https://assets.test/", "/tmp/unused");
        assert_eq!(cfg.url_for("EURUSD", None), "https://assets.test/EURUSD.csv");
        assert_eq!(
            cfg.url_for("gold", Some("/a/gold.csv")),
            "https://assets.test/a/gold.csv"
        );
    }
}
