//! ARIMA(5,1,0) walk-forward feature.
//!
//! The model is fitted once on the train prefix by conditional least squares
//! over first differences (no constant). Each test step forecasts one point
//! ahead, then the *observed* value joins the history. The observed values
//! make the feature leak the realised path into later forecasts, which is
//! acceptable offline but not for live scoring.

use thiserror::Error;
use tracing::{debug, info};

use crate::config::ArimaSettings;
use crate::table::{Column, FeatureKind, FeatureTable, TableError};

pub const AR_ORDER: usize = 5;
const DIFF_ORDER: usize = 1;
const PIVOT_EPSILON: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum ArimaError {
    #[error("ARIMA fit for {ticker} needs at least {required} training points, got {actual}")]
    InsufficientData {
        ticker: String,
        required: usize,
        actual: usize,
    },
    #[error("ARIMA normal equations are singular for {0}")]
    Singular(String),
    #[error("ticker {0} is not in the feature table")]
    UnknownTicker(String),
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArimaModel {
    coefficients: [f64; AR_ORDER],
}

impl ArimaModel {
    /// Smallest train prefix that leaves at least `AR_ORDER` regression rows.
    pub const MIN_TRAIN_POINTS: usize = 2 * AR_ORDER + DIFF_ORDER;

    pub fn fit(ticker: &str, train: &[f64]) -> Result<Self, ArimaError> {
        if train.len() < Self::MIN_TRAIN_POINTS {
            return Err(ArimaError::InsufficientData {
                ticker: ticker.to_string(),
                required: Self::MIN_TRAIN_POINTS,
                actual: train.len(),
            });
        }

        let diffs = difference(train);
        let mut xtx = [[0.0; AR_ORDER]; AR_ORDER];
        let mut xty = [0.0; AR_ORDER];
        for t in AR_ORDER..diffs.len() {
            let lags = lag_vector(&diffs[..t]);
            for i in 0..AR_ORDER {
                xty[i] += lags[i] * diffs[t];
                for j in 0..AR_ORDER {
                    xtx[i][j] += lags[i] * lags[j];
                }
            }
        }

        let coefficients =
            solve(xtx, xty).ok_or_else(|| ArimaError::Singular(ticker.to_string()))?;
        debug!(
            component = "arima",
            event = "arima.fit",
            ticker,
            coefficients = ?coefficients
        );
        Ok(Self { coefficients })
    }

    pub fn coefficients(&self) -> &[f64; AR_ORDER] {
        &self.coefficients
    }

    /// One-step forecast in levels from the level history.
    pub fn forecast_next(&self, history: &[f64]) -> f64 {
        let Some(&last) = history.last() else {
            return f64::NAN;
        };
        let tail_start = history.len().saturating_sub(AR_ORDER + 1);
        let diffs = difference(&history[tail_start..]);
        let lags = lag_vector(&diffs);
        let step: f64 = self
            .coefficients
            .iter()
            .zip(lags.iter())
            .map(|(coef, lag)| coef * lag)
            .sum();
        last + step
    }
}

/// Train prefix followed by one forecast per test point; same length as `series`.
pub fn walk_forward(ticker: &str, series: &[f64], train_set_size: f64) -> Result<Vec<f64>, ArimaError> {
    let size = ((series.len() as f64) * train_set_size).floor() as usize;
    let size = size.min(series.len());
    let (train, test) = series.split_at(size);
    let model = ArimaModel::fit(ticker, train)?;

    let mut history = train.to_vec();
    let mut feature = train.to_vec();
    for &observed in test {
        feature.push(model.forecast_next(&history));
        history.push(observed);
    }
    Ok(feature)
}

pub fn add_arima_features(
    table: &mut FeatureTable,
    tickers: &[String],
    settings: &ArimaSettings,
) -> Result<usize, ArimaError> {
    for ticker in tickers {
        let series = table
            .base_values(ticker)
            .ok_or_else(|| ArimaError::UnknownTicker(ticker.clone()))?
            .to_vec();
        let feature = walk_forward(ticker, &series, settings.train_set_size)?;
        table.push_column(Column::derived(ticker.as_str(), FeatureKind::Arima, feature))?;
    }

    info!(
        component = "arima",
        event = "arima.finish",
        tickers = tickers.len(),
        train_set_size = settings.train_set_size
    );
    Ok(tickers.len())
}

fn difference(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|pair| pair[1] - pair[0]).collect()
}

/// Most recent `AR_ORDER` values, newest first, zero-padded when short.
fn lag_vector(values: &[f64]) -> [f64; AR_ORDER] {
    let mut lags = [0.0; AR_ORDER];
    for (slot, value) in lags.iter_mut().zip(values.iter().rev()) {
        *slot = *value;
    }
    lags
}

/// Gaussian elimination with partial pivoting.
fn solve(
    mut a: [[f64; AR_ORDER]; AR_ORDER],
    mut b: [f64; AR_ORDER],
) -> Option<[f64; AR_ORDER]> {
    let scale = a
        .iter()
        .flat_map(|row| row.iter())
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }

    for col in 0..AR_ORDER {
        let pivot_row = (col..AR_ORDER).max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))?;
        if a[pivot_row][col].abs() <= PIVOT_EPSILON * scale {
            return None;
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        for row in col + 1..AR_ORDER {
            let factor = a[row][col] / a[col][col];
            for k in col..AR_ORDER {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; AR_ORDER];
    for row in (0..AR_ORDER).rev() {
        let tail: f64 = (row + 1..AR_ORDER).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ar_process(n: usize) -> Vec<f64> {
        // Levels whose differences follow d_t = 0.5 d_{t-1} - 0.2 d_{t-2} + e_t.
        let mut state: u64 = 7;
        let mut noise = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as f64 / (1u64 << 31) as f64) - 0.5
        };
        let mut diffs = vec![0.0, 0.0];
        for t in 2..n {
            let d = 0.5 * diffs[t - 1] - 0.2 * diffs[t - 2] + noise();
            diffs.push(d);
        }
        let mut level = 100.0;
        diffs
            .iter()
            .map(|d| {
                level += d;
                level
            })
            .collect()
    }

    #[test]
    fn output_length_equals_input_and_prefix_is_untouched() {
        let series = ar_process(120);
        let feature = walk_forward("X", &series, 0.8).unwrap();
        assert_eq!(feature.len(), series.len());
        assert_eq!(&feature[..96], &series[..96]);
        assert!(feature[96..].iter().all(|v| v.is_finite()));
    }

    #[test]
    fn fit_recovers_dominant_coefficients() {
        let series = ar_process(3000);
        let model = ArimaModel::fit("X", &series).unwrap();
        let coef = model.coefficients();
        assert!((coef[0] - 0.5).abs() < 0.1, "{coef:?}");
        assert!((coef[1] + 0.2).abs() < 0.1, "{coef:?}");
    }

    #[test]
    fn forecasts_use_observed_history() {
        let series = ar_process(200);
        let model = ArimaModel::fit("X", &series[..160]).unwrap();
        let feature = walk_forward("X", &series, 0.8).unwrap();
        assert_eq!(feature[160], model.forecast_next(&series[..160]));
        assert_eq!(feature[170], model.forecast_next(&series[..170]));
    }

    #[test]
    fn short_or_flat_series_fail_to_fit() {
        let err = walk_forward("X", &[1.0, 2.0, 3.0], 0.8).unwrap_err();
        assert!(matches!(err, ArimaError::InsufficientData { .. }));

        let flat = vec![5.0; 50];
        let err = walk_forward("FLAT", &flat, 0.8).unwrap_err();
        assert!(matches!(err, ArimaError::Singular(ticker) if ticker == "FLAT"));
    }
}
