//! Asset universe resolution, price series ingestion and the inner-join merge.

use std::collections::BTreeSet;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::config::{BaseAssets, FeMeta};
use crate::observability::RunLog;
use crate::table::{Column, FeatureTable, TableError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMetadata {
    pub ticker: String,
    pub asset_class: String,
    #[serde(default)]
    pub company: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceSeries {
    ticker: String,
    dates: Vec<NaiveDate>,
    closes: Vec<f64>,
}

impl PriceSeries {
    pub fn new(
        ticker: impl Into<String>,
        dates: Vec<NaiveDate>,
        closes: Vec<f64>,
    ) -> Result<Self, LoadError> {
        let ticker = ticker.into();
        if dates.len() != closes.len() {
            return Err(LoadError::MalformedSeries {
                ticker,
                reason: format!("{} dates but {} closes", dates.len(), closes.len()),
            });
        }
        if let Some(pair) = dates.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(LoadError::MalformedSeries {
                ticker,
                reason: format!("dates not strictly increasing at {}", pair[1]),
            });
        }
        Ok(Self {
            ticker,
            dates,
            closes,
        })
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn closes(&self) -> &[f64] {
        &self.closes
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("asset catalog unavailable: {0}")]
    Catalog(String),
    #[error("price source unavailable for {ticker}: {message}")]
    Source { ticker: String, message: String },
    #[error("malformed price series for {ticker}: {reason}")]
    MalformedSeries { ticker: String, reason: String },
    #[error("failed to parse field {field} value '{value}' in {path}")]
    ParseField {
        path: PathBuf,
        field: &'static str,
        value: String,
    },
    #[error("price record in {path} has {found} columns, expected at least 2")]
    InvalidRecordColumns { path: PathBuf, found: usize },
    #[error("archive at {path} has no CSV entry")]
    MissingCsvEntry { path: PathBuf },
    #[error("predicted asset {0} could not be loaded")]
    PredictedAssetMissing(String),
    #[error("no rows remain after aligning {0} tickers")]
    EmptyIntersection(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Table(#[from] TableError),
}

pub trait AssetCatalog {
    fn assets(&self) -> Result<Vec<AssetMetadata>, LoadError>;
}

pub trait PriceSource {
    /// `Ok(None)` when no series exists for the ticker.
    fn fetch(&self, ticker: &str) -> Result<Option<PriceSeries>, LoadError>;
}

/// Reads `{ticker}.csv`, or `{ticker}.zip` holding one CSV entry, from a directory.
#[derive(Debug, Clone)]
pub struct CsvDirectorySource {
    root: PathBuf,
}

impl CsvDirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PriceSource for CsvDirectorySource {
    fn fetch(&self, ticker: &str) -> Result<Option<PriceSeries>, LoadError> {
        let csv_path = self.root.join(format!("{ticker}.csv"));
        if csv_path.is_file() {
            let bytes = fs::read(&csv_path)?;
            return parse_price_csv(ticker, &csv_path, &bytes).map(Some);
        }

        let zip_path = self.root.join(format!("{ticker}.zip"));
        if zip_path.is_file() {
            let bytes = read_zip_csv_entry(&zip_path)?;
            return parse_price_csv(ticker, &zip_path, &bytes).map(Some);
        }

        debug!(
            component = "loader",
            event = "loader.source.missing",
            ticker,
            root = %self.root.display()
        );
        Ok(None)
    }
}

fn read_zip_csv_entry(path: &Path) -> Result<Vec<u8>, LoadError> {
    let file = fs::File::open(path)?;
    let mut zip = ZipArchive::new(file)?;

    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx)?;
        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".csv") {
            continue;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        return Ok(buf);
    }

    Err(LoadError::MissingCsvEntry {
        path: path.to_path_buf(),
    })
}

fn parse_price_csv(ticker: &str, path: &Path, bytes: &[u8]) -> Result<PriceSeries, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(Cursor::new(bytes));

    let mut dates = Vec::new();
    let mut closes = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        if record.len() < 2 {
            return Err(LoadError::InvalidRecordColumns {
                path: path.to_path_buf(),
                found: record.len(),
            });
        }
        dates.push(parse_date(&record, path)?);
        closes.push(parse_close(&record, path)?);
    }

    PriceSeries::new(ticker, dates, closes)
}

fn parse_date(record: &StringRecord, path: &Path) -> Result<NaiveDate, LoadError> {
    let raw = record.get(0).unwrap_or_default();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|dt| dt.date()))
        .map_err(|_| LoadError::ParseField {
            path: path.to_path_buf(),
            field: "date",
            value: raw.to_string(),
        })
}

fn parse_close(record: &StringRecord, path: &Path) -> Result<f64, LoadError> {
    let raw = record.get(1).unwrap_or_default();
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| LoadError::ParseField {
            path: path.to_path_buf(),
            field: "close",
            value: raw.to_string(),
        })
}

/// Tickers to load for a template.
///
/// `all` keeps catalog order. An explicit list is unioned with the indicator
/// and autoregressive groups and every catalog ticker of a spectral asset
/// class, then sorted. The predicted asset is always requested.
pub fn resolve_universe(
    fe_meta: &FeMeta,
    catalog: &[AssetMetadata],
    predicted_asset: &str,
) -> Vec<String> {
    let mut tickers = match &fe_meta.base_assets {
        BaseAssets::All => {
            let mut seen = BTreeSet::new();
            catalog
                .iter()
                .map(|asset| asset.ticker.trim().to_string())
                .filter(|ticker| seen.insert(ticker.clone()))
                .collect::<Vec<_>>()
        }
        BaseAssets::Tickers(list) => {
            let union: BTreeSet<String> = list
                .iter()
                .chain(&fe_meta.ta_settings.assets)
                .chain(&fe_meta.arima_settings.assets)
                .cloned()
                .chain(spectral_tickers(
                    catalog,
                    &fe_meta.fft_settings.asset_classes,
                ))
                .collect();
            union.into_iter().collect()
        }
    };

    if !tickers.iter().any(|ticker| ticker == predicted_asset) {
        tickers.push(predicted_asset.to_string());
    }
    tickers
}

/// Catalog tickers whose asset class is one of `classes`, both sides trimmed.
pub fn spectral_tickers(catalog: &[AssetMetadata], classes: &[String]) -> Vec<String> {
    catalog
        .iter()
        .filter(|asset| {
            classes
                .iter()
                .any(|class| class.trim() == asset.asset_class.trim())
        })
        .map(|asset| asset.ticker.trim().to_string())
        .collect()
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub table: FeatureTable,
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
}

/// Loads every ticker and inner-joins them on date in request order.
pub fn load_aligned_table(
    tickers: &[String],
    source: &dyn PriceSource,
    predicted_asset: &str,
    log: &mut RunLog,
) -> Result<LoadOutcome, LoadError> {
    info!(
        component = "loader",
        event = "loader.start",
        requested = tickers.len(),
        predicted_asset
    );

    let mut merged: Option<Merged> = None;
    let mut loaded = Vec::new();
    let mut missing = Vec::new();

    for ticker in tickers {
        let Some(series) = source.fetch(ticker)? else {
            missing.push(ticker.clone());
            continue;
        };

        merged = Some(match merged {
            None => Merged::from_series(series),
            Some(acc) => acc.inner_join(series),
        });
        loaded.push(ticker.clone());
    }

    if !missing.is_empty() {
        log.warning(format!(
            "{} assets have no price data and were skipped: {}",
            missing.len(),
            missing.join(", ")
        ));
    }

    if !loaded.iter().any(|ticker| ticker == predicted_asset) {
        return Err(LoadError::PredictedAssetMissing(predicted_asset.to_string()));
    }

    let merged = merged.ok_or_else(|| LoadError::PredictedAssetMissing(predicted_asset.to_string()))?;
    if merged.dates.is_empty() {
        return Err(LoadError::EmptyIntersection(loaded.len()));
    }

    let mut table = FeatureTable::new(merged.dates);
    for (ticker, values) in merged.columns {
        table.push_column(Column::base(ticker, values))?;
    }

    log.info(format!(
        "{} assets loaded into aligned table: {} rows from {} to {}",
        loaded.len(),
        table.row_count(),
        table.dates()[0],
        table.dates()[table.row_count() - 1]
    ));
    info!(
        component = "loader",
        event = "loader.finish",
        loaded = loaded.len(),
        missing = missing.len(),
        rows = table.row_count()
    );

    Ok(LoadOutcome {
        table,
        loaded,
        missing,
    })
}

/// Keeps the group tickers that were loaded, warning about the rest.
pub fn filter_loaded(
    group: &str,
    requested: &[String],
    loaded: &[String],
    log: &mut RunLog,
) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut kept = Vec::new();
    let mut dropped = Vec::new();

    for ticker in requested {
        if !seen.insert(ticker.as_str()) {
            continue;
        }
        if loaded.iter().any(|candidate| candidate == ticker) {
            kept.push(ticker.clone());
        } else {
            dropped.push(ticker.as_str());
        }
    }

    if !dropped.is_empty() {
        log.warning(format!(
            "{group}: skipping assets without data: {}",
            dropped.join(", ")
        ));
    }
    kept
}

#[derive(Debug)]
struct Merged {
    dates: Vec<NaiveDate>,
    columns: Vec<(String, Vec<f64>)>,
}

impl Merged {
    fn from_series(series: PriceSeries) -> Self {
        Self {
            dates: series.dates,
            columns: vec![(series.ticker, series.closes)],
        }
    }

    /// Sorted-merge intersection; both sides are strictly increasing.
    fn inner_join(self, series: PriceSeries) -> Self {
        let mut keep_left = Vec::new();
        let mut keep_right = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.dates.len() && j < series.dates.len() {
            match self.dates[i].cmp(&series.dates[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    keep_left.push(i);
                    keep_right.push(j);
                    i += 1;
                    j += 1;
                }
            }
        }

        let dates = keep_left.iter().map(|&idx| self.dates[idx]).collect();
        let mut columns: Vec<(String, Vec<f64>)> = self
            .columns
            .into_iter()
            .map(|(name, values)| (name, keep_left.iter().map(|&idx| values[idx]).collect()))
            .collect();
        columns.push((
            series.ticker,
            keep_right.iter().map(|&idx| series.closes[idx]).collect(),
        ));

        Self { dates, columns }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Template;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    #[derive(Default)]
    struct MemorySource {
        series: HashMap<String, PriceSeries>,
    }

    impl MemorySource {
        fn with(mut self, ticker: &str, days: &[u32], closes: &[f64]) -> Self {
            let dates = days
                .iter()
                .map(|day| NaiveDate::from_ymd_opt(2021, 3, *day).unwrap())
                .collect();
            self.series.insert(
                ticker.to_string(),
                PriceSeries::new(ticker, dates, closes.to_vec()).unwrap(),
            );
            self
        }
    }

    impl PriceSource for MemorySource {
        fn fetch(&self, ticker: &str) -> Result<Option<PriceSeries>, LoadError> {
            Ok(self.series.get(ticker).cloned())
        }
    }

    fn asset(ticker: &str, class: &str) -> AssetMetadata {
        AssetMetadata {
            ticker: ticker.to_string(),
            asset_class: class.to_string(),
            company: String::new(),
            bucket_key: None,
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn price_series_rejects_non_increasing_dates() {
        let d = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        let err = PriceSeries::new("A", vec![d, d], vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, LoadError::MalformedSeries { .. }));
    }

    #[test]
    fn explicit_universe_is_sorted_union_of_groups_and_spectral_classes() {
        let mut fe_meta = Template::default().fe_meta;
        fe_meta.base_assets = BaseAssets::Tickers(strings(&["oil", "DJIA"]));
        fe_meta.ta_settings.assets = strings(&["DJIA", "gold"]);
        fe_meta.arima_settings.assets = strings(&["EURUSD"]);
        fe_meta.fft_settings.asset_classes = strings(&["Crypto"]);
        let catalog = vec![asset("BTC", "Crypto"), asset("ETH", "Crypto"), asset("SPX", "Index")];

        let universe = resolve_universe(&fe_meta, &catalog, "gold");
        assert_eq!(
            universe,
            strings(&["BTC", "DJIA", "ETH", "EURUSD", "gold", "oil"])
        );
    }

    #[test]
    fn all_universe_keeps_catalog_order_and_appends_predicted_asset() {
        let fe_meta = Template::default().fe_meta;
        let catalog = vec![asset("SPX", "Index"), asset("gold", "Commodity")];
        assert_eq!(
            resolve_universe(&fe_meta, &catalog, "B10YR"),
            strings(&["SPX", "gold", "B10YR"])
        );
    }

    #[test]
    fn padded_catalog_entries_resolve_like_trimmed_ones() {
        let mut fe_meta = Template::default().fe_meta;
        fe_meta.base_assets = BaseAssets::Tickers(strings(&["A"]));
        fe_meta.ta_settings.assets = Vec::new();
        fe_meta.arima_settings.assets = Vec::new();
        fe_meta.fft_settings.asset_classes = strings(&["FX"]);
        let catalog = vec![
            asset("A", "Index"),
            asset(" B", "FX "),
            asset("C", "FX"),
        ];

        assert_eq!(
            spectral_tickers(&catalog, &fe_meta.fft_settings.asset_classes),
            strings(&["B", "C"])
        );
        assert_eq!(
            resolve_universe(&fe_meta, &catalog, "A"),
            strings(&["A", "B", "C"])
        );

        fe_meta.base_assets = BaseAssets::All;
        assert_eq!(
            resolve_universe(&fe_meta, &catalog, "A"),
            strings(&["A", "B", "C"])
        );
    }

    #[test]
    fn merge_keeps_exact_date_intersection_and_records_missing() {
        let source = MemorySource::default()
            .with("A", &[1, 2, 3, 4, 5], &[1.0, 2.0, 3.0, 4.0, 5.0])
            .with("B", &[2, 3, 5, 6], &[20.0, 30.0, 50.0, 60.0])
            .with("C", &[1, 3, 5], &[100.0, 300.0, 500.0]);
        let mut log = RunLog::new("exec");

        let outcome = load_aligned_table(
            &strings(&["A", "B", "Z", "C"]),
            &source,
            "A",
            &mut log,
        )
        .unwrap();

        let days: Vec<u32> = outcome
            .table
            .dates()
            .iter()
            .map(|d| chrono::Datelike::day(d))
            .collect();
        assert_eq!(days, vec![3, 5]);
        assert_eq!(outcome.table.base_values("A"), Some(&[3.0, 5.0][..]));
        assert_eq!(outcome.table.base_values("B"), Some(&[30.0, 50.0][..]));
        assert_eq!(outcome.table.base_values("C"), Some(&[300.0, 500.0][..]));
        assert_eq!(outcome.missing, strings(&["Z"]));
        assert_eq!(outcome.loaded, strings(&["A", "B", "C"]));
        assert!(!log.has_errors());
        assert!(log.entries().iter().any(|e| e.msg.contains("Z")));
    }

    #[test]
    fn missing_predicted_asset_is_fatal() {
        let source = MemorySource::default().with("A", &[1, 2], &[1.0, 2.0]);
        let mut log = RunLog::new("exec");
        let err = load_aligned_table(&strings(&["A", "P"]), &source, "P", &mut log).unwrap_err();
        assert!(matches!(err, LoadError::PredictedAssetMissing(ticker) if ticker == "P"));
    }

    #[test]
    fn group_filter_warns_about_unloaded_tickers() {
        let mut log = RunLog::new("exec");
        let kept = filter_loaded(
            "technical indicators",
            &strings(&["A", "X", "A", "B"]),
            &strings(&["A", "B"]),
            &mut log,
        );
        assert_eq!(kept, strings(&["A", "B"]));
        assert_eq!(log.entries().len(), 1);
        assert!(log.entries()[0].msg.contains("X"));
    }

    #[test]
    fn directory_source_reads_csv_then_zip_and_reports_absent() {
        let temp = tempdir().unwrap();
        fs::write(
            temp.path().join("A.csv"),
            "Date,Close\n2021-03-01,1.5\n2021-03-02,1.75\n",
        )
        .unwrap();

        let zip_file = fs::File::create(temp.path().join("B.zip")).unwrap();
        let mut zip = zip::ZipWriter::new(zip_file);
        zip.start_file("B.csv", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"Date,Close\n2021-03-02,10\n").unwrap();
        zip.finish().unwrap();

        let source = CsvDirectorySource::new(temp.path());
        let a = source.fetch("A").unwrap().unwrap();
        assert_eq!(a.closes(), &[1.5, 1.75]);
        let b = source.fetch("B").unwrap().unwrap();
        assert_eq!(b.len(), 1);
        assert!(source.fetch("C").unwrap().is_none());
    }

    #[test]
    fn malformed_file_is_fatal_not_missing() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("A.csv"), "Date,Close\n2021-03-01,abc\n").unwrap();
        fs::write(
            temp.path().join("B.csv"),
            "Date,Close\n2021-03-02,1\n2021-03-01,2\n",
        )
        .unwrap();

        let source = CsvDirectorySource::new(temp.path());
        assert!(matches!(
            source.fetch("A").unwrap_err(),
            LoadError::ParseField { field: "close", .. }
        ));
        assert!(matches!(
            source.fetch("B").unwrap_err(),
            LoadError::MalformedSeries { .. }
        ));
    }
}
