//! Fourier low-pass reconstructions and the series diagnostics charted next to them.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use thiserror::Error;
use tracing::info;

use crate::table::{Column, FeatureKind, FeatureTable, TableError};

#[derive(Debug, Error)]
pub enum SpectralError {
    #[error("ticker {0} is not in the feature table")]
    UnknownTicker(String),
    #[error("component count must be positive")]
    ZeroComponents,
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpectralOutcome {
    pub columns_added: usize,
    /// Magnitude spectrum of the last processed ticker.
    pub last_spectrum: Option<(String, Vec<f64>)>,
}

/// Stateful transformer so plans are reused across tickers of equal length.
pub struct SpectralTransformer {
    planner: FftPlanner<f64>,
}

impl Default for SpectralTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectralTransformer {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
        }
    }

    pub fn forward(&mut self, series: &[f64]) -> Vec<Complex<f64>> {
        let mut buffer: Vec<Complex<f64>> =
            series.iter().map(|&x| Complex::new(x, 0.0)).collect();
        if buffer.is_empty() {
            return buffer;
        }
        let fft = self.planner.plan_fft_forward(buffer.len());
        fft.process(&mut buffer);
        buffer
    }

    /// Keeps the first and last `components` coefficients and returns the real
    /// part of the inverse transform.
    pub fn low_pass(&mut self, spectrum: &[Complex<f64>], components: usize) -> Vec<f64> {
        let n = spectrum.len();
        if n == 0 {
            return Vec::new();
        }

        let mut buffer = spectrum.to_vec();
        if components.saturating_mul(2) < n {
            for coefficient in &mut buffer[components..n - components] {
                *coefficient = Complex::new(0.0, 0.0);
            }
        }

        let ifft = self.planner.plan_fft_inverse(n);
        ifft.process(&mut buffer);
        let scale = 1.0 / n as f64;
        buffer.iter().map(|c| c.re * scale).collect()
    }
}

/// Appends one `{T}_FT_{K}` column per ticker and component count.
pub fn add_spectral_features(
    table: &mut FeatureTable,
    tickers: &[String],
    num_steps: &[usize],
) -> Result<SpectralOutcome, SpectralError> {
    if num_steps.iter().any(|k| *k == 0) {
        return Err(SpectralError::ZeroComponents);
    }

    let mut transformer = SpectralTransformer::new();
    let mut columns_added = 0;
    let mut last_spectrum = None;

    for ticker in tickers {
        let series = table
            .base_values(ticker)
            .ok_or_else(|| SpectralError::UnknownTicker(ticker.clone()))?
            .to_vec();
        let spectrum = transformer.forward(&series);

        for &components in num_steps {
            let values = transformer.low_pass(&spectrum, components);
            table.push_column(Column::derived(
                ticker.as_str(),
                FeatureKind::Fourier(components),
                values,
            ))?;
            columns_added += 1;
        }

        last_spectrum = Some((
            ticker.clone(),
            spectrum.iter().map(|c| c.norm()).collect(),
        ));
    }

    info!(
        component = "spectral",
        event = "spectral.finish",
        tickers = tickers.len(),
        num_steps = ?num_steps,
        columns_added
    );

    Ok(SpectralOutcome {
        columns_added,
        last_spectrum,
    })
}

/// Rotates right by `floor(n / 2)` so the zero frequency sits mid-chart.
pub fn centered_magnitudes(magnitudes: &[f64]) -> Vec<f64> {
    let mut rotated = magnitudes.to_vec();
    let shift = rotated.len() / 2;
    rotated.rotate_right(shift);
    rotated
}

/// Sample autocorrelation for lags `1..=n`, normalised by the lag-zero autocovariance.
pub fn autocorrelation(series: &[f64]) -> Vec<f64> {
    let n = series.len();
    if n == 0 {
        return Vec::new();
    }
    let mean = series.iter().sum::<f64>() / n as f64;
    let c0 = series.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    if c0 == 0.0 {
        return vec![0.0; n];
    }

    (1..=n)
        .map(|lag| {
            let cov: f64 = (0..n - lag)
                .map(|i| (series[i] - mean) * (series[i + lag] - mean))
                .sum::<f64>()
                / n as f64;
            cov / c0
        })
        .collect()
}
