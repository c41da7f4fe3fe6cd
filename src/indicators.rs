//! Rolling technical indicators: Bollinger bands, RSI and SMA.
//!
//! Leading rows without enough history are back-filled from the first defined
//! value. This biases the earliest observations and is kept so that no row is
//! lost before the alignment-sensitive stages that follow.

use thiserror::Error;
use tracing::info;

use crate::config::TaSettings;
use crate::table::{Column, FeatureKind, FeatureTable, TableError};

#[derive(Debug, Error)]
pub enum IndicatorError {
    #[error("{indicator} window {window} exceeds the {rows} available rows for {ticker}")]
    WindowTooLong {
        ticker: String,
        indicator: &'static str,
        window: usize,
        rows: usize,
    },
    #[error("ticker {0} is not in the feature table")]
    UnknownTicker(String),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Appends `BB_Up`, `BB_Low`, `BB_MA`, `RSI` and `SMA` columns for each ticker.
pub fn add_technical_indicators(
    table: &mut FeatureTable,
    tickers: &[String],
    settings: &TaSettings,
) -> Result<usize, IndicatorError> {
    let mut added = 0;
    for ticker in tickers {
        let closes = table
            .base_values(ticker)
            .ok_or_else(|| IndicatorError::UnknownTicker(ticker.clone()))?
            .to_vec();

        let bb = &settings.bollinger_band;
        let (upper, lower, middle) = bollinger(&closes, bb.window, bb.window_dev);
        let columns = [
            (FeatureKind::BollingerUpper, "bollinger", bb.window, upper),
            (FeatureKind::BollingerLower, "bollinger", bb.window, lower),
            (FeatureKind::BollingerMiddle, "bollinger", bb.window, middle),
            (FeatureKind::Rsi, "rsi", settings.rsi.window, rsi(&closes, settings.rsi.window)),
            (FeatureKind::Sma, "sma", settings.sma.window, sma(&closes, settings.sma.window)),
        ];

        for (kind, indicator, window, mut values) in columns {
            if !backfill(&mut values) {
                return Err(IndicatorError::WindowTooLong {
                    ticker: ticker.clone(),
                    indicator,
                    window,
                    rows: closes.len(),
                });
            }
            table.push_column(Column::derived(ticker.as_str(), kind, values))?;
            added += 1;
        }
    }

    info!(
        component = "indicators",
        event = "indicators.finish",
        tickers = tickers.len(),
        columns_added = added
    );
    Ok(added)
}

/// Rolling mean plus and minus `window_dev` population standard deviations.
pub fn bollinger(closes: &[f64], window: usize, window_dev: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = closes.len();
    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    let mut middle = vec![f64::NAN; n];
    if window == 0 || window > n {
        return (upper, lower, middle);
    }

    for end in window - 1..n {
        let slice = &closes[end + 1 - window..=end];
        let mean = slice.iter().sum::<f64>() / window as f64;
        let variance = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window as f64;
        let std = variance.sqrt();
        middle[end] = mean;
        upper[end] = mean + window_dev * std;
        lower[end] = mean - window_dev * std;
    }

    (upper, lower, middle)
}

/// Wilder RSI as an adjust-free exponential average with `alpha = 1 / window`.
///
/// The first row counts as zero movement, so the first defined value is at
/// row `window - 1`.
pub fn rsi(closes: &[f64], window: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 || window > n {
        return out;
    }

    let alpha = 1.0 / window as f64;
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 0..n {
        let change = if i == 0 { 0.0 } else { closes[i] - closes[i - 1] };
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        if i == 0 {
            avg_gain = gain;
            avg_loss = loss;
        } else {
            avg_gain = (1.0 - alpha) * avg_gain + alpha * gain;
            avg_loss = (1.0 - alpha) * avg_loss + alpha * loss;
        }

        if i + 1 >= window {
            out[i] = if avg_loss == 0.0 {
                100.0
            } else {
                100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
            };
        }
    }

    out
}

pub fn sma(closes: &[f64], window: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 || window > n {
        return out;
    }

    let mut sum: f64 = closes[..window].iter().sum();
    out[window - 1] = sum / window as f64;
    for end in window..n {
        sum += closes[end] - closes[end - window];
        out[end] = sum / window as f64;
    }
    out
}

/// Replaces leading NaNs with the first defined value. Returns false if none exists.
pub fn backfill(values: &mut [f64]) -> bool {
    let Some(first) = values.iter().position(|v| !v.is_nan()) else {
        return values.is_empty();
    };
    let fill = values[first];
    for value in &mut values[..first] {
        *value = fill;
    }
    true
}
