//! Dense autoencoder producing learned feature columns.

use ndarray::{s, Array, Array1, Array2, ArrayView2, Axis, Dimension, Zip};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, info};

use crate::charts::Chart;
use crate::config::{AutoEncoderSettings, LossKind, OptimizerKind};
use crate::table::{Column, FeatureTable, Provenance, TableError};

const OUTER_WIDTH: usize = 600;
const INNER_WIDTH: usize = 330;
const TRAIN_FRACTION: f64 = 0.7;

#[derive(Debug, Error)]
pub enum RepresentationError {
    #[error("no input features remain after excluding {0}")]
    NoInputFeatures(String),
    #[error("table has {0} rows, too few to train")]
    InsufficientRows(usize),
    #[error("non-finite value in autoencoder input column {0}")]
    NonFinite(String),
    #[error("autoencoder produced {predicted} rows for a table of {expected}")]
    RowCountMismatch { predicted: usize, expected: usize },
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Sigmoid,
}

impl Activation {
    fn forward(self, x: f64) -> f64 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }

    /// Derivative expressed through the activation output.
    fn derivative(self, activated: f64) -> f64 {
        match self {
            Self::Relu => {
                if activated > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Sigmoid => activated * (1.0 - activated),
        }
    }
}

#[derive(Debug, Clone)]
struct DenseLayer {
    weights: Array2<f64>,
    biases: Array1<f64>,
    activation: Activation,
    moments: Moments,
}

#[derive(Debug, Clone)]
struct Moments {
    first_w: Array2<f64>,
    second_w: Array2<f64>,
    first_b: Array1<f64>,
    second_b: Array1<f64>,
}

impl DenseLayer {
    /// Glorot-uniform weights, zero biases.
    fn new(inputs: usize, outputs: usize, activation: Activation, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (inputs + outputs) as f64).sqrt();
        let uniform = Uniform::new_inclusive(-limit, limit);
        let weights = Array2::from_shape_fn((inputs, outputs), |_| uniform.sample(rng));
        Self {
            weights,
            biases: Array1::zeros(outputs),
            activation,
            moments: Moments {
                first_w: Array2::zeros((inputs, outputs)),
                second_w: Array2::zeros((inputs, outputs)),
                first_b: Array1::zeros(outputs),
                second_b: Array1::zeros(outputs),
            },
        }
    }

    fn forward(&self, input: ArrayView2<f64>) -> Array2<f64> {
        let activation = self.activation;
        let mut z = input.dot(&self.weights) + &self.biases;
        z.mapv_inplace(|v| activation.forward(v));
        z
    }
}

#[derive(Debug, Clone, Copy)]
struct Optimizer {
    kind: OptimizerKind,
    step: i32,
}

impl Optimizer {
    fn learning_rate(self) -> f64 {
        match self.kind {
            OptimizerKind::Adam | OptimizerKind::Rmsprop => 0.001,
            OptimizerKind::Sgd => 0.01,
        }
    }

    fn update<D: Dimension>(
        self,
        param: &mut Array<f64, D>,
        grad: &Array<f64, D>,
        first: &mut Array<f64, D>,
        second: &mut Array<f64, D>,
    ) {
        const EPSILON: f64 = 1e-7;
        let lr = self.learning_rate();
        match self.kind {
            OptimizerKind::Sgd => {
                Zip::from(param).and(grad).for_each(|p, &g| *p -= lr * g);
            }
            OptimizerKind::Rmsprop => {
                const RHO: f64 = 0.9;
                Zip::from(param)
                    .and(grad)
                    .and(second)
                    .for_each(|p, &g, v| {
                        *v = RHO * *v + (1.0 - RHO) * g * g;
                        *p -= lr * g / (v.sqrt() + EPSILON);
                    });
            }
            OptimizerKind::Adam => {
                const BETA1: f64 = 0.9;
                const BETA2: f64 = 0.999;
                let t = self.step;
                let lr_t = lr * (1.0 - BETA2.powi(t)).sqrt() / (1.0 - BETA1.powi(t));
                Zip::from(param)
                    .and(grad)
                    .and(first)
                    .and(second)
                    .for_each(|p, &g, m, v| {
                        *m = BETA1 * *m + (1.0 - BETA1) * g;
                        *v = BETA2 * *v + (1.0 - BETA2) * g * g;
                        *p -= lr_t * *m / (v.sqrt() + EPSILON);
                    });
            }
        }
    }
}

/// input -> 600 -> 330 -> input -> 330 -> 600 -> input.
#[derive(Debug, Clone)]
pub struct Autoencoder {
    layers: Vec<DenseLayer>,
    loss: LossKind,
    optimizer: Optimizer,
}

impl Autoencoder {
    pub fn new(width: usize, optimizer: OptimizerKind, loss: LossKind, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let shape = [
            (width, OUTER_WIDTH, Activation::Sigmoid),
            (OUTER_WIDTH, INNER_WIDTH, Activation::Relu),
            (INNER_WIDTH, width, Activation::Relu),
            (width, INNER_WIDTH, Activation::Relu),
            (INNER_WIDTH, OUTER_WIDTH, Activation::Relu),
            (OUTER_WIDTH, width, Activation::Sigmoid),
        ];
        let layers = shape
            .iter()
            .map(|&(inputs, outputs, activation)| DenseLayer::new(inputs, outputs, activation, &mut rng))
            .collect();

        Self {
            layers,
            loss,
            optimizer: Optimizer {
                kind: optimizer,
                step: 0,
            },
        }
    }

    pub fn predict(&self, input: ArrayView2<f64>) -> Array2<f64> {
        let mut current = input.to_owned();
        for layer in &self.layers {
            current = layer.forward(current.view());
        }
        current
    }

    pub fn evaluate(&self, input: ArrayView2<f64>) -> f64 {
        loss_value(self.loss, self.predict(input).view(), input)
    }

    /// One optimizer step on a batch; returns the batch loss before the step.
    fn train_batch(&mut self, batch: ArrayView2<f64>) -> f64 {
        let mut activations = vec![batch.to_owned()];
        for layer in &self.layers {
            let next = layer.forward(activations[activations.len() - 1].view());
            activations.push(next);
        }
        let output = &activations[activations.len() - 1];
        let batch_loss = loss_value(self.loss, output.view(), batch);
        let mut grad = loss_gradient(self.loss, output.view(), batch);

        self.optimizer.step += 1;
        let optimizer = self.optimizer;
        for (idx, layer) in self.layers.iter_mut().enumerate().rev() {
            let activated = &activations[idx + 1];
            let activation = layer.activation;
            Zip::from(&mut grad)
                .and(activated)
                .for_each(|g, &a| *g *= activation.derivative(a));

            let grad_w = activations[idx].t().dot(&grad);
            let grad_b = grad.sum_axis(Axis(0));
            let grad_prev = grad.dot(&layer.weights.t());

            let moments = &mut layer.moments;
            optimizer.update(
                &mut layer.weights,
                &grad_w,
                &mut moments.first_w,
                &mut moments.second_w,
            );
            optimizer.update(
                &mut layer.biases,
                &grad_b,
                &mut moments.first_b,
                &mut moments.second_b,
            );
            grad = grad_prev;
        }

        batch_loss
    }

    pub fn fit(
        &mut self,
        train: ArrayView2<f64>,
        validation: ArrayView2<f64>,
        settings: &AutoEncoderSettings,
        verbose: u8,
    ) -> TrainingHistory {
        let mut rng = StdRng::seed_from_u64(settings.seed.wrapping_add(1));
        let mut order: Vec<usize> = (0..train.nrows()).collect();
        let mut history = TrainingHistory::default();

        for epoch in 0..settings.fit_epoch {
            if settings.fit_shuffle {
                order.shuffle(&mut rng);
            }

            let mut weighted_loss = 0.0;
            for chunk in order.chunks(settings.fit_batch_size) {
                let batch = train.select(Axis(0), chunk);
                weighted_loss += self.train_batch(batch.view()) * chunk.len() as f64;
            }
            let train_loss = weighted_loss / train.nrows().max(1) as f64;
            let val_loss = if validation.nrows() > 0 {
                self.evaluate(validation)
            } else {
                f64::NAN
            };
            history.loss.push(train_loss);
            history.val_loss.push(val_loss);

            if verbose > 0 {
                info!(
                    component = "autoencoder",
                    event = "autoencoder.epoch",
                    epoch = epoch + 1,
                    loss = train_loss,
                    val_loss
                );
            } else {
                debug!(
                    component = "autoencoder",
                    event = "autoencoder.epoch",
                    epoch = epoch + 1,
                    loss = train_loss,
                    val_loss
                );
            }
        }

        history
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    pub loss: Vec<f64>,
    pub val_loss: Vec<f64>,
}

impl TrainingHistory {
    pub fn validation_chart(&self) -> Chart {
        Chart::line(
            "validation-loss-autoencoder",
            "Validation loss of Autoencoders",
            self.val_loss.clone(),
        )
        .with_x_label("Epoch")
    }
}

fn loss_value(kind: LossKind, predicted: ArrayView2<f64>, target: ArrayView2<f64>) -> f64 {
    let count = predicted.len().max(1) as f64;
    let total: f64 = match kind {
        LossKind::MeanSquaredError => Zip::from(predicted)
            .and(target)
            .fold(0.0, |acc, &p, &t| acc + (p - t).powi(2)),
        LossKind::MeanAbsoluteError => Zip::from(predicted)
            .and(target)
            .fold(0.0, |acc, &p, &t| acc + (p - t).abs()),
    };
    total / count
}

fn loss_gradient(kind: LossKind, predicted: ArrayView2<f64>, target: ArrayView2<f64>) -> Array2<f64> {
    let count = predicted.len().max(1) as f64;
    let mut grad = Array2::zeros(predicted.raw_dim());
    Zip::from(&mut grad)
        .and(predicted)
        .and(target)
        .for_each(|g, &p, &t| {
            *g = match kind {
                LossKind::MeanSquaredError => 2.0 * (p - t) / count,
                LossKind::MeanAbsoluteError => (p - t).signum() * f64::from(p != t) / count,
            };
        });
    grad
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepresentationOutcome {
    pub columns_added: usize,
    pub history: TrainingHistory,
}

/// Trains on the leading 70% of rows (plus one) and appends `0..width` columns.
pub fn add_autoencoder_features(
    table: &mut FeatureTable,
    predicted_asset: &str,
    settings: &AutoEncoderSettings,
    verbose: u8,
) -> Result<RepresentationOutcome, RepresentationError> {
    let inputs: Vec<&Column> = table
        .columns()
        .iter()
        .filter(|column| {
            !column.provenance.is_learned()
                && !matches!(&column.provenance, Provenance::Base { ticker } if ticker == predicted_asset)
        })
        .collect();
    if inputs.is_empty() {
        return Err(RepresentationError::NoInputFeatures(predicted_asset.to_string()));
    }
    if let Some(column) = inputs
        .iter()
        .find(|column| column.values.iter().any(|v| !v.is_finite()))
    {
        return Err(RepresentationError::NonFinite(column.name()));
    }

    let rows = table.row_count();
    let width = inputs.len();
    let train_rows = ((rows as f64 * TRAIN_FRACTION).floor() as usize + 1).min(rows);
    if rows < 2 {
        return Err(RepresentationError::InsufficientRows(rows));
    }
    let x = Array2::from_shape_fn((rows, width), |(row, col)| inputs[col].values[row]);
    let (train, validation) = (x.slice(s![..train_rows, ..]), x.slice(s![train_rows.., ..]));

    info!(
        component = "autoencoder",
        event = "autoencoder.start",
        width,
        train_rows,
        validation_rows = rows - train_rows,
        epochs = settings.fit_epoch,
        batch_size = settings.fit_batch_size,
        optimizer = ?settings.optimizer,
        loss = ?settings.loss
    );

    let mut model = Autoencoder::new(width, settings.optimizer, settings.loss, settings.seed);
    let history = model.fit(train, validation, settings, verbose);
    let predictions = model.predict(x.view());

    if predictions.nrows() != rows {
        return Err(RepresentationError::RowCountMismatch {
            predicted: predictions.nrows(),
            expected: rows,
        });
    }

    for (idx, column) in predictions.axis_iter(Axis(1)).enumerate() {
        table.push_column(Column {
            provenance: Provenance::Learned(idx),
            values: column.to_vec(),
        })?;
    }

    info!(
        component = "autoencoder",
        event = "autoencoder.finish",
        columns_added = width,
        final_val_loss = history.val_loss.last().copied().unwrap_or(f64::NAN)
    );

    Ok(RepresentationOutcome {
        columns_added: width,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn settings(optimizer: OptimizerKind, loss: LossKind, epochs: usize) -> AutoEncoderSettings {
        AutoEncoderSettings {
            enabled: true,
            optimizer,
            loss,
            fit_epoch: epochs,
            fit_batch_size: 8,
            fit_shuffle: false,
            verbose: 0,
            seed: 7,
        }
    }

    fn unit_table(rows: usize) -> FeatureTable {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let dates = (0..rows)
            .map(|i| start + chrono::Duration::days(i as i64))
            .collect();
        let mut table = FeatureTable::new(dates);
        let wave = |phase: f64| -> Vec<f64> {
            (0..rows)
                .map(|i| 0.5 + 0.4 * ((i as f64) * 0.2 + phase).sin())
                .collect()
        };
        table.push_column(Column::base("P", wave(0.0))).unwrap();
        table.push_column(Column::base("A", wave(1.0))).unwrap();
        table.push_column(Column::base("B", wave(2.0))).unwrap();
        table
    }

    #[test]
    fn appends_one_learned_column_per_input_and_keeps_rows() {
        let mut table = unit_table(30);
        let outcome = add_autoencoder_features(
            &mut table,
            "P",
            &settings(OptimizerKind::Adam, LossKind::MeanSquaredError, 3),
            0,
        )
        .unwrap();

        assert_eq!(outcome.columns_added, 2);
        assert_eq!(table.column_names(), vec!["P", "A", "B", "0", "1"]);
        assert!(table.columns().iter().all(|c| c.values.len() == 30));
        assert_eq!(outcome.history.val_loss.len(), 3);
        assert!(outcome.history.val_loss.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn training_reduces_loss_for_each_optimizer() {
        let table = unit_table(40);
        let x = Array2::from_shape_fn((40, 2), |(row, col)| table.columns()[col + 1].values[row]);
        for optimizer in [OptimizerKind::Adam, OptimizerKind::Rmsprop, OptimizerKind::Sgd] {
            let cfg = settings(optimizer, LossKind::MeanSquaredError, 40);
            let mut model = Autoencoder::new(2, optimizer, cfg.loss, cfg.seed);
            let before = model.evaluate(x.view());
            let history = model.fit(x.view(), x.view(), &cfg, 0);
            let after = history.val_loss[history.val_loss.len() - 1];
            assert!(after < before, "{optimizer:?}: {before} -> {after}");
        }
    }

    #[test]
    fn seeded_models_are_reproducible_and_mae_is_supported() {
        let table = unit_table(20);
        let x = Array2::from_shape_fn((20, 2), |(row, col)| table.columns()[col + 1].values[row]);
        let cfg = settings(OptimizerKind::Adam, LossKind::MeanAbsoluteError, 2);

        let mut a = Autoencoder::new(2, cfg.optimizer, cfg.loss, cfg.seed);
        let mut b = Autoencoder::new(2, cfg.optimizer, cfg.loss, cfg.seed);
        assert_eq!(a.fit(x.view(), x.view(), &cfg, 0), b.fit(x.view(), x.view(), &cfg, 0));
        assert_eq!(a.predict(x.view()), b.predict(x.view()));
    }

    #[test]
    fn target_only_table_has_no_inputs() {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let mut table = FeatureTable::new(vec![start, start.succ_opt().unwrap()]);
        table.push_column(Column::base("P", vec![1.0, 2.0])).unwrap();
        let err = add_autoencoder_features(
            &mut table,
            "P",
            &settings(OptimizerKind::Adam, LossKind::MeanSquaredError, 1),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, RepresentationError::NoInputFeatures(_)));
    }

    #[test]
    fn validation_chart_is_a_line_over_epochs() {
        let history = TrainingHistory {
            loss: vec![0.3, 0.2],
            val_loss: vec![0.4, 0.25],
        };
        let chart = history.validation_chart();
        assert_eq!(chart.artifact_key(), "plots/validation-loss-autoencoder.svg");
        assert!(chart.render_svg().contains("Epoch"));
    }
}
