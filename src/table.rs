//! Date-indexed feature table with per-column provenance.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Separator used when a column's provenance is rendered as a name.
pub const SEPARATOR: &str = "_";
pub const DATE_COLUMN: &str = "Date";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    BollingerUpper,
    BollingerLower,
    BollingerMiddle,
    Rsi,
    Sma,
    Arima,
    Fourier(usize),
}

impl FeatureKind {
    pub fn suffix(self) -> String {
        match self {
            Self::BollingerUpper => "BB_Up".to_string(),
            Self::BollingerLower => "BB_Low".to_string(),
            Self::BollingerMiddle => "BB_MA".to_string(),
            Self::Rsi => "RSI".to_string(),
            Self::Sma => "SMA".to_string(),
            Self::Arima => "ARIMA".to_string(),
            Self::Fourier(components) => format!("FT{SEPARATOR}{components}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Provenance {
    /// Raw close series of a loaded ticker.
    Base { ticker: String },
    Derived { base: String, kind: FeatureKind },
    /// Autoencoder output unit, numbered from zero.
    Learned(usize),
}

impl Provenance {
    pub fn base_ticker(&self) -> Option<&str> {
        match self {
            Self::Base { ticker } => Some(ticker),
            Self::Derived { base, .. } => Some(base),
            Self::Learned(_) => None,
        }
    }

    pub fn is_learned(&self) -> bool {
        matches!(self, Self::Learned(_))
    }

    pub fn column_name(&self) -> String {
        match self {
            Self::Base { ticker } => ticker.clone(),
            Self::Derived { base, kind } => format!("{base}{SEPARATOR}{}", kind.suffix()),
            Self::Learned(index) => index.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub provenance: Provenance,
    pub values: Vec<f64>,
}

impl Column {
    pub fn base(ticker: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            provenance: Provenance::Base {
                ticker: ticker.into(),
            },
            values,
        }
    }

    pub fn derived(base: impl Into<String>, kind: FeatureKind, values: Vec<f64>) -> Self {
        Self {
            provenance: Provenance::Derived {
                base: base.into(),
                kind,
            },
            values,
        }
    }

    pub fn name(&self) -> String {
        self.provenance.column_name()
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("column {name} has {found} rows, table has {expected}")]
    LengthMismatch {
        name: String,
        found: usize,
        expected: usize,
    },
    #[error("duplicate column {0}")]
    DuplicateColumn(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV buffer error: {0}")]
    CsvBuffer(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureTable {
    dates: Vec<NaiveDate>,
    columns: Vec<Column>,
}

impl FeatureTable {
    pub fn new(dates: Vec<NaiveDate>) -> Self {
        Self {
            dates,
            columns: Vec::new(),
        }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.dates.len()
    }

    pub fn push_column(&mut self, column: Column) -> Result<(), TableError> {
        let name = column.name();
        if column.values.len() != self.dates.len() {
            return Err(TableError::LengthMismatch {
                name,
                found: column.values.len(),
                expected: self.dates.len(),
            });
        }
        if self.columns.iter().any(|existing| existing.provenance == column.provenance) {
            return Err(TableError::DuplicateColumn(name));
        }
        self.columns.push(column);
        Ok(())
    }

    /// Close series of a loaded ticker.
    pub fn base_values(&self, ticker: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|column| {
                matches!(&column.provenance, Provenance::Base { ticker: t } if t == ticker)
            })
            .map(|column| column.values.as_slice())
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(Column::name).collect()
    }

    /// Renders `Date` followed by every column, in insertion order.
    pub fn to_csv_bytes(&self) -> Result<Vec<u8>, TableError> {
        let mut writer = csv::Writer::from_writer(Vec::new());

        let mut header = Vec::with_capacity(self.columns.len() + 1);
        header.push(DATE_COLUMN.to_string());
        header.extend(self.column_names());
        writer.write_record(&header)?;

        for (row, date) in self.dates.iter().enumerate() {
            let mut record = Vec::with_capacity(self.columns.len() + 1);
            record.push(date.format("%Y-%m-%d").to_string());
            for column in &self.columns {
                record.push(column.values[row].to_string());
            }
            writer.write_record(&record)?;
        }

        writer
            .into_inner()
            .map_err(|err| TableError::CsvBuffer(err.to_string()))
    }

    /// SHA-256 over the row count and ordered column names.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("rows:{};", self.dates.len()));
        hasher.update("columns:");
        for column in &self.columns {
            hasher.update(column.name().as_bytes());
            hasher.update(";");
        }
        hex::encode(hasher.finalize())
    }
}
