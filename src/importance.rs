//! Feature importance of every non-target feature for the predicted asset.

use std::collections::{BTreeMap, HashMap};

use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::charts::Chart;
use crate::gbt::{BoosterParams, GbtError, GradientBoostedTrees};
use crate::loader::AssetMetadata;
use crate::observability::RunLog;
use crate::table::FeatureTable;

pub const LAG_COUNT: usize = 11;
const TRAIN_FRACTION: f64 = 0.8;
const TOP_FEATURES_CHARTED: usize = 20;

#[derive(Debug, Error)]
pub enum ImportanceError {
    #[error("predicted asset {0} is not in the feature table")]
    UnknownTarget(String),
    #[error("{rows} rows leave no training data after dropping {LAG_COUNT} lag rows")]
    InsufficientRows { rows: usize },
    #[error("no input features remain after excluding {0} and its derived columns")]
    NoInputFeatures(String),
    #[error("gradient boosting failed: {0}")]
    Model(#[from] GbtError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassImportance {
    pub asset_class: String,
    pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportanceReport {
    pub feature_importance: Vec<FeatureImportance>,
    pub by_asset_class: Vec<ClassImportance>,
}

impl ImportanceReport {
    /// Top-N individual features and per-class averages.
    pub fn charts(&self) -> [Chart; 2] {
        let top: Vec<&FeatureImportance> = self
            .feature_importance
            .iter()
            .take(TOP_FEATURES_CHARTED)
            .collect();
        [
            Chart::horizontal_bars(
                "feat_imp_individual",
                format!("Feature importance (top {TOP_FEATURES_CHARTED})"),
                top.iter().map(|f| f.feature.clone()).collect(),
                top.iter().map(|f| f.importance).collect(),
            ),
            Chart::horizontal_bars(
                "feat_imp_by_class",
                "Feature importance (by asset class)",
                self.by_asset_class
                    .iter()
                    .map(|c| c.asset_class.clone())
                    .collect(),
                self.by_asset_class.iter().map(|c| c.importance).collect(),
            ),
        ]
    }
}

/// Forward-shifted copies of the target: lag `i` holds the value `i` rows ahead.
pub fn forward_lags(target: &[f64]) -> Vec<Vec<f64>> {
    (1..=LAG_COUNT)
        .map(|lag| {
            (0..target.len())
                .map(|row| target.get(row + lag).copied().unwrap_or(f64::NAN))
                .collect()
        })
        .collect()
}

pub fn lag_column_name(lag: usize, predicted_asset: &str) -> String {
    format!("day_{lag}_lag_of_{predicted_asset}")
}

/// Ranks the contribution of every column not derived from `predicted_asset`.
pub fn compute_importance(
    table: &FeatureTable,
    catalog: &[AssetMetadata],
    predicted_asset: &str,
    log: &mut RunLog,
) -> Result<ImportanceReport, ImportanceError> {
    let target = table
        .base_values(predicted_asset)
        .ok_or_else(|| ImportanceError::UnknownTarget(predicted_asset.to_string()))?;

    let lags = forward_lags(target);
    let complete_rows = (0..table.row_count())
        .take_while(|&row| lags.iter().all(|lag| !lag[row].is_nan()))
        .count();
    let train_rows = (complete_rows as f64 * TRAIN_FRACTION).floor() as usize;
    if train_rows == 0 {
        return Err(ImportanceError::InsufficientRows {
            rows: table.row_count(),
        });
    }
    let lag_names: Vec<String> = (1..=LAG_COUNT)
        .map(|lag| lag_column_name(lag, predicted_asset))
        .collect();
    debug!(
        component = "importance",
        event = "importance.lags",
        lags = ?lag_names,
        complete_rows
    );

    let inputs: Vec<(String, &[f64])> = table
        .columns()
        .iter()
        .filter(|column| column.provenance.base_ticker() != Some(predicted_asset))
        .map(|column| (column.name(), column.values.as_slice()))
        .collect();
    if inputs.is_empty() {
        return Err(ImportanceError::NoInputFeatures(predicted_asset.to_string()));
    }

    let x = Array2::from_shape_fn((complete_rows, inputs.len()), |(row, col)| inputs[col].1[row]);
    let y = Array1::from_iter(target[..complete_rows].iter().copied());
    let (x_train, x_test) = (x.slice(s![..train_rows, ..]), x.slice(s![train_rows.., ..]));
    let (y_train, y_test) = (y.slice(s![..train_rows]), y.slice(s![train_rows..]));

    log.info(format!(
        "feature importance: train shape ({}, {}), test shape ({}, {})",
        x_train.nrows(),
        x_train.ncols(),
        x_test.nrows(),
        x_test.ncols()
    ));

    let eval = (x_test.nrows() > 0).then_some((x_test, y_test));
    let (model, history) =
        GradientBoostedTrees::fit(&BoosterParams::default(), x_train, y_train, eval)?;
    for metrics in &history {
        debug!(
            component = "importance",
            event = "importance.round",
            round = metrics.round,
            train_rmse = metrics.train_rmse,
            test_rmse = ?metrics.eval_rmse
        );
    }
    if let Some(last) = history.last() {
        log.info(format!(
            "feature importance: model trained, train rmse {:.6}, test rmse {}",
            last.train_rmse,
            last.eval_rmse
                .map(|v| format!("{v:.6}"))
                .unwrap_or_else(|| "n/a".to_string())
        ));
    }

    let mut ranked: Vec<FeatureImportance> = inputs
        .iter()
        .zip(model.feature_importances())
        .map(|((feature, _), importance)| FeatureImportance {
            feature: feature.clone(),
            importance,
        })
        .collect();
    ranked.sort_by(|a, b| b.importance.total_cmp(&a.importance));

    let by_asset_class = aggregate_by_class(table, catalog, &ranked);

    info!(
        component = "importance",
        event = "importance.finish",
        features = ranked.len(),
        classes = by_asset_class.len(),
        train_rows,
        test_rows = complete_rows - train_rows
    );

    Ok(ImportanceReport {
        feature_importance: ranked,
        by_asset_class,
    })
}

fn aggregate_by_class(
    table: &FeatureTable,
    catalog: &[AssetMetadata],
    ranked: &[FeatureImportance],
) -> Vec<ClassImportance> {
    let class_of: HashMap<&str, &str> = catalog
        .iter()
        .map(|asset| (asset.ticker.trim(), asset.asset_class.trim()))
        .collect();
    let base_of: HashMap<String, &str> = table
        .columns()
        .iter()
        .filter_map(|column| {
            column
                .provenance
                .base_ticker()
                .map(|base| (column.name(), base))
        })
        .collect();

    let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for entry in ranked {
        let Some(class) = base_of
            .get(&entry.feature)
            .and_then(|base| class_of.get(base))
        else {
            continue;
        };
        let slot = sums.entry(*class).or_insert((0.0, 0));
        slot.0 += entry.importance;
        slot.1 += 1;
    }

    sums.into_iter()
        .map(|(class, (sum, count))| ClassImportance {
            asset_class: class.to_string(),
            importance: sum / count as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Column, FeatureKind};
    use chrono::NaiveDate;

    fn asset(ticker: &str, class: &str) -> AssetMetadata {
        AssetMetadata {
            ticker: ticker.to_string(),
            asset_class: class.to_string(),
            company: String::new(),
            bucket_key: None,
        }
    }

    fn table(rows: usize) -> FeatureTable {
        let start = NaiveDate::from_ymd_opt(2019, 1, 1).unwrap();
        let dates = (0..rows)
            .map(|i| start + chrono::Duration::days(i as i64))
            .collect();
        let driver: Vec<f64> = (0..rows).map(|i| (i as f64 * 0.3).sin() * 10.0).collect();
        let target: Vec<f64> = driver.iter().map(|d| 2.0 * d + 1.0).collect();
        let noise: Vec<f64> = (0..rows).map(|i| ((i * 17) % 7) as f64).collect();

        let mut table = FeatureTable::new(dates);
        table.push_column(Column::base("P", target.clone())).unwrap();
        table.push_column(Column::base("B", driver)).unwrap();
        table.push_column(Column::base("C", noise)).unwrap();
        table
            .push_column(Column::derived("P", FeatureKind::Sma, target))
            .unwrap();
        table
    }

    #[test]
    fn lags_look_ahead_and_leave_trailing_gaps() {
        let lags = forward_lags(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        assert_eq!(lags.len(), LAG_COUNT);
        assert_eq!(lags[0][0], 1.0);
        assert_eq!(lags[10][1], 12.0);
        assert!(lags[10][2].is_nan());
        assert_eq!(lag_column_name(3, "gold"), "day_3_lag_of_gold");
    }

    #[test]
    fn excludes_target_derived_columns_and_ranks_the_driver_first() {
        let table = table(120);
        let catalog = vec![asset("P", "Index"), asset("B", " FX "), asset("C", "Commodity")];
        let mut log = RunLog::new("exec");

        let report = compute_importance(&table, &catalog, "P", &mut log).unwrap();

        let features: Vec<&str> = report
            .feature_importance
            .iter()
            .map(|f| f.feature.as_str())
            .collect();
        assert_eq!(features.len(), 2);
        assert!(!features.iter().any(|f| *f == "P" || f.starts_with("P_")));
        assert_eq!(features[0], "B");
        assert!(report
            .feature_importance
            .windows(2)
            .all(|w| w[0].importance >= w[1].importance));

        let classes: Vec<&str> = report
            .by_asset_class
            .iter()
            .map(|c| c.asset_class.as_str())
            .collect();
        assert_eq!(classes, vec!["Commodity", "FX"]);
        assert!(log.entries().iter().any(|e| e.msg.contains("train shape (87, 2)")));
    }

    #[test]
    fn results_are_deterministic() {
        let table = table(80);
        let catalog = vec![asset("B", "FX")];
        let a = compute_importance(&table, &catalog, "P", &mut RunLog::new("a")).unwrap();
        let b = compute_importance(&table, &catalog, "P", &mut RunLog::new("b")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.by_asset_class.len(), 1);
    }

    #[test]
    fn short_tables_and_target_only_tables_fail() {
        let err = compute_importance(&table(11), &[], "P", &mut RunLog::new("x")).unwrap_err();
        assert!(matches!(err, ImportanceError::InsufficientRows { rows: 11 }));

        let start = NaiveDate::from_ymd_opt(2019, 1, 1).unwrap();
        let mut only_target = FeatureTable::new(
            (0..40).map(|i| start + chrono::Duration::days(i)).collect(),
        );
        only_target
            .push_column(Column::base("P", (0..40).map(|i| i as f64).collect()))
            .unwrap();
        let err =
            compute_importance(&only_target, &[], "P", &mut RunLog::new("x")).unwrap_err();
        assert!(matches!(err, ImportanceError::NoInputFeatures(_)));
    }

    #[test]
    fn charts_cover_top_features_and_classes() {
        let report = ImportanceReport {
            feature_importance: (0..25)
                .map(|i| FeatureImportance {
                    feature: format!("F{i}"),
                    importance: 1.0 / (i + 1) as f64,
                })
                .collect(),
            by_asset_class: vec![ClassImportance {
                asset_class: "FX".to_string(),
                importance: 0.5,
            }],
        };
        let [individual, by_class] = report.charts();
        assert_eq!(individual.artifact_key(), "plots/feat_imp_individual.svg");
        assert_eq!(individual.render_svg().matches("<rect x=").count(), 20);
        assert_eq!(by_class.name(), "feat_imp_by_class");
    }
}
