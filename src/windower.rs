//! Expanding-window train/test series records for a sequence forecaster.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, DeepArMeta, Frequency};
use crate::table::FeatureTable;

#[derive(Debug, Error)]
pub enum WindowError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to serialise window record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Date boundaries of the forecasting dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    pub start: NaiveDate,
    pub end_training: NaiveDate,
    pub frequency: Frequency,
    pub prediction_length: usize,
    pub test_windows: usize,
}

impl WindowSpec {
    pub fn from_meta(meta: &DeepArMeta) -> Result<Self, WindowError> {
        Ok(Self {
            start: meta.start_dataset,
            end_training: meta.end_training,
            frequency: meta.frequency()?,
            prediction_length: meta.prediction_length,
            test_windows: meta.test_windows,
        })
    }

    /// Last date of the training target; the training-end date itself is excluded.
    pub fn training_upper(&self) -> NaiveDate {
        self.end_training - self.frequency.step()
    }

    /// Last date of the `k`-th expanding test window, `k` starting at 1.
    pub fn test_upper(&self, k: usize) -> NaiveDate {
        self.end_training + self.frequency.steps(k * self.prediction_length)
    }

    fn start_label(&self) -> String {
        self.start.format("%Y-%m-%d 00:00:00").to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub start: String,
    pub target: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Datasets {
    pub train: Vec<SeriesRecord>,
    pub test: Vec<SeriesRecord>,
}

struct TrimmedSeries<'a> {
    dates: &'a [NaiveDate],
    values: &'a [f64],
}

impl TrimmedSeries<'_> {
    fn slice(&self, from: NaiveDate, to: NaiveDate) -> Vec<f64> {
        self.dates
            .iter()
            .zip(self.values)
            .filter(|(date, _)| **date >= from && **date <= to)
            .map(|(_, value)| *value)
            .collect()
    }
}

/// Leading observations equal to zero mark a series that has not started yet.
fn trim_leading_zeros<'a>(dates: &'a [NaiveDate], values: &'a [f64]) -> TrimmedSeries<'a> {
    let first = values
        .iter()
        .position(|v| *v != 0.0)
        .unwrap_or(values.len());
    TrimmedSeries {
        dates: &dates[first..],
        values: &values[first..],
    }
}

/// One training record per column, then `test_windows` expanding records per column
/// ordered window-major.
pub fn build_datasets(table: &FeatureTable, spec: &WindowSpec) -> Datasets {
    let series: Vec<TrimmedSeries<'_>> = table
        .columns()
        .iter()
        .map(|column| trim_leading_zeros(table.dates(), &column.values))
        .collect();
    let start = spec.start_label();

    let train: Vec<SeriesRecord> = series
        .iter()
        .map(|s| SeriesRecord {
            start: start.clone(),
            target: s.slice(spec.start, spec.training_upper()),
        })
        .collect();

    let test: Vec<SeriesRecord> = (1..=spec.test_windows)
        .flat_map(|k| {
            let upper = spec.test_upper(k);
            series.iter().map(move |s| (upper, s))
        })
        .map(|(upper, s)| SeriesRecord {
            start: start.clone(),
            target: s.slice(spec.start, upper),
        })
        .collect();

    info!(
        component = "windower",
        event = "windower.finish",
        series = series.len(),
        train_records = train.len(),
        test_records = test.len(),
        start = %spec.start,
        end_training = %spec.end_training
    );

    Datasets { train, test }
}

/// Newline-delimited JSON, one record per line.
pub fn to_ndjson(records: &[SeriesRecord]) -> Result<Vec<u8>, WindowError> {
    let mut out = Vec::new();
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.push(b'\n');
    }
    Ok(out)
}
