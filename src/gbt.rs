//! Gradient-boosted regression trees with exact greedy, level-wise splitting.
//!
//! Squared-error objective (unit hessian), L2 leaf regularisation and a
//! minimum child hessian. Each feature is pre-sorted once; every depth level
//! is then one pass over the sorted order per feature.

use ndarray::{Array1, ArrayView1, ArrayView2};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoosterParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub lambda: f64,
    pub min_child_weight: f64,
}

impl Default for BoosterParams {
    fn default() -> Self {
        Self {
            n_estimators: 10,
            max_depth: 5,
            learning_rate: 0.3,
            lambda: 1.0,
            min_child_weight: 1.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum GbtError {
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("design matrix has {rows} rows but target has {targets}")]
    ShapeMismatch { rows: usize, targets: usize },
    #[error("evaluation matrix has {found} features, model expects {expected}")]
    FeatureCountMismatch { found: usize, expected: usize },
    #[error("non-finite value in training data")]
    NonFinite,
}

/// One node of a fitted tree; leaves carry the shrunken output value.
#[derive(Debug, Clone, PartialEq)]
pub enum RegressionNode {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionTree {
    nodes: Vec<RegressionNode>,
}

impl RegressionTree {
    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                RegressionNode::Leaf { value } => return *value,
                RegressionNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] < *threshold { *left } else { *right };
                }
            }
        }
    }

    pub fn nodes(&self) -> &[RegressionNode] {
        &self.nodes
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundMetrics {
    pub round: usize,
    pub train_rmse: f64,
    pub eval_rmse: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradientBoostedTrees {
    base_score: f64,
    trees: Vec<RegressionTree>,
    n_features: usize,
    gain_sum: Vec<f64>,
    split_count: Vec<usize>,
}

impl GradientBoostedTrees {
    pub fn fit(
        params: &BoosterParams,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        eval: Option<(ArrayView2<f64>, ArrayView1<f64>)>,
    ) -> Result<(Self, Vec<RoundMetrics>), GbtError> {
        let (rows, n_features) = x.dim();
        if rows == 0 {
            return Err(GbtError::EmptyTrainingSet);
        }
        if y.len() != rows {
            return Err(GbtError::ShapeMismatch {
                rows,
                targets: y.len(),
            });
        }
        if let Some((ex, ey)) = &eval {
            if ex.ncols() != n_features {
                return Err(GbtError::FeatureCountMismatch {
                    found: ex.ncols(),
                    expected: n_features,
                });
            }
            if ex.nrows() != ey.len() {
                return Err(GbtError::ShapeMismatch {
                    rows: ex.nrows(),
                    targets: ey.len(),
                });
            }
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(GbtError::NonFinite);
        }

        let base_score = y.sum() / rows as f64;
        let mut model = Self {
            base_score,
            trees: Vec::with_capacity(params.n_estimators),
            n_features,
            gain_sum: vec![0.0; n_features],
            split_count: vec![0; n_features],
        };

        let sorted = presort(x);
        let mut train_pred = Array1::from_elem(rows, base_score);
        let mut eval_pred = eval
            .as_ref()
            .map(|(ex, _)| Array1::from_elem(ex.nrows(), base_score));
        let mut history = Vec::with_capacity(params.n_estimators);

        for round in 0..params.n_estimators {
            let gradients: Vec<f64> = train_pred
                .iter()
                .zip(y.iter())
                .map(|(pred, target)| pred - target)
                .collect();
            let tree = model.grow_tree(params, x, &sorted, &gradients);

            for (r, pred) in train_pred.iter_mut().enumerate() {
                *pred += tree.predict_row(x.row(r));
            }
            if let (Some((ex, _)), Some(preds)) = (&eval, eval_pred.as_mut()) {
                for (r, pred) in preds.iter_mut().enumerate() {
                    *pred += tree.predict_row(ex.row(r));
                }
            }
            model.trees.push(tree);

            history.push(RoundMetrics {
                round,
                train_rmse: rmse(train_pred.view(), y),
                eval_rmse: eval
                    .as_ref()
                    .zip(eval_pred.as_ref())
                    .map(|((_, ey), preds)| rmse(preds.view(), *ey)),
            });
        }

        Ok((model, history))
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.rows()
            .into_iter()
            .map(|row| {
                self.base_score
                    + self
                        .trees
                        .iter()
                        .map(|tree| tree.predict_row(row))
                        .sum::<f64>()
            })
            .collect()
    }

    /// Mean split gain per feature, normalised to sum to one.
    pub fn feature_importances(&self) -> Vec<f64> {
        let mean_gain: Vec<f64> = self
            .gain_sum
            .iter()
            .zip(&self.split_count)
            .map(|(gain, count)| if *count == 0 { 0.0 } else { gain / *count as f64 })
            .collect();
        let total: f64 = mean_gain.iter().sum();
        if total <= 0.0 {
            return vec![0.0; self.n_features];
        }
        mean_gain.iter().map(|gain| gain / total).collect()
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    pub fn base_score(&self) -> f64 {
        self.base_score
    }

    fn grow_tree(
        &mut self,
        params: &BoosterParams,
        x: ArrayView2<f64>,
        sorted: &[Vec<usize>],
        gradients: &[f64],
    ) -> RegressionTree {
        let rows = gradients.len();
        let mut nodes: Vec<Option<RegressionNode>> = vec![None];
        let mut position: Vec<Option<usize>> = vec![Some(0); rows];
        let mut open: Vec<OpenNode> = vec![OpenNode {
            id: 0,
            grad: gradients.iter().sum(),
            hess: rows as f64,
        }];

        for _depth in 0..params.max_depth {
            if open.is_empty() {
                break;
            }
            let slot_of = |id: usize, open: &[OpenNode]| open.iter().position(|n| n.id == id);
            let mut best: Vec<Option<Candidate>> = vec![None; open.len()];

            for (feature, order) in sorted.iter().enumerate() {
                let mut scans: Vec<Scan> = vec![Scan::default(); open.len()];
                for &r in order {
                    let Some(id) = position[r] else { continue };
                    let Some(slot) = slot_of(id, &open) else { continue };
                    let value = x[[r, feature]];
                    let node = open[slot];
                    let scan = &mut scans[slot];

                    if let Some(last) = scan.last_value {
                        if value > last {
                            let gain = split_gain(params, node, scan.grad, scan.hess);
                            if let Some(gain) = gain {
                                let better = best[slot].map_or(true, |current| gain > current.gain);
                                if better {
                                    best[slot] = Some(Candidate {
                                        feature,
                                        threshold: split_threshold(last, value),
                                        gain,
                                    });
                                }
                            }
                        }
                    }
                    scan.grad += gradients[r];
                    scan.hess += 1.0;
                    scan.last_value = Some(value);
                }
            }

            let mut next_open = Vec::new();
            let mut split_of: Vec<Option<(Candidate, usize, usize)>> = vec![None; open.len()];
            for (slot, node) in open.iter().enumerate() {
                match best[slot] {
                    Some(candidate) => {
                        let left = nodes.len();
                        let right = left + 1;
                        nodes.push(None);
                        nodes.push(None);
                        nodes[node.id] = Some(RegressionNode::Split {
                            feature: candidate.feature,
                            threshold: candidate.threshold,
                            left,
                            right,
                        });
                        self.gain_sum[candidate.feature] += candidate.gain;
                        self.split_count[candidate.feature] += 1;
                        split_of[slot] = Some((candidate, left, right));
                        next_open.push(OpenNode {
                            id: left,
                            grad: 0.0,
                            hess: 0.0,
                        });
                        next_open.push(OpenNode {
                            id: right,
                            grad: 0.0,
                            hess: 0.0,
                        });
                    }
                    None => {
                        nodes[node.id] = Some(leaf(params, *node));
                    }
                }
            }

            for r in 0..rows {
                let Some(id) = position[r] else { continue };
                let Some(slot) = slot_of(id, &open) else { continue };
                position[r] = match split_of[slot] {
                    Some((candidate, left, right)) => {
                        let child = if x[[r, candidate.feature]] < candidate.threshold {
                            left
                        } else {
                            right
                        };
                        if let Some(next) = next_open.iter_mut().find(|n| n.id == child) {
                            next.grad += gradients[r];
                            next.hess += 1.0;
                        }
                        Some(child)
                    }
                    None => None,
                };
            }

            open = next_open;
        }

        for node in &open {
            nodes[node.id] = Some(leaf(params, *node));
        }

        RegressionTree {
            nodes: nodes
                .into_iter()
                .map(|node| node.unwrap_or(RegressionNode::Leaf { value: 0.0 }))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenNode {
    id: usize,
    grad: f64,
    hess: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Scan {
    grad: f64,
    hess: f64,
    last_value: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

fn leaf(params: &BoosterParams, node: OpenNode) -> RegressionNode {
    RegressionNode::Leaf {
        value: -node.grad / (node.hess + params.lambda) * params.learning_rate,
    }
}

fn split_gain(params: &BoosterParams, node: OpenNode, left_grad: f64, left_hess: f64) -> Option<f64> {
    let right_grad = node.grad - left_grad;
    let right_hess = node.hess - left_hess;
    if left_hess < params.min_child_weight || right_hess < params.min_child_weight {
        return None;
    }
    let score = |g: f64, h: f64| g * g / (h + params.lambda);
    let gain = 0.5
        * (score(left_grad, left_hess) + score(right_grad, right_hess)
            - score(node.grad, node.hess));
    (gain > 0.0).then_some(gain)
}

fn presort(x: ArrayView2<f64>) -> Vec<Vec<usize>> {
    (0..x.ncols())
        .map(|feature| {
            let mut order: Vec<usize> = (0..x.nrows()).collect();
            order.sort_by(|&a, &b| x[[a, feature]].total_cmp(&x[[b, feature]]));
            order
        })
        .collect()
}

/// Midpoint between adjacent sorted values, or `value` when the midpoint
/// rounds back onto `last`. Rows `<= last` must route left under `x < threshold`.
fn split_threshold(last: f64, value: f64) -> f64 {
    let mid = (last + value) / 2.0;
    if mid > last {
        mid
    } else {
        value
    }
}

pub fn rmse(pred: ArrayView1<f64>, target: ArrayView1<f64>) -> f64 {
    if pred.is_empty() {
        return f64::NAN;
    }
    let mse = pred
        .iter()
        .zip(target.iter())
        .map(|(p, t)| (p - t).powi(2))
        .sum::<f64>()
        / pred.len() as f64;
    mse.sqrt()
}
