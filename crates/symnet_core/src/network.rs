use crate::dataset::Dataset;
use crate::error::{config_err, Result, SymNetError};
use crate::layer::{GatedLinear, LinearCache, SymbolicCache, SymbolicLayer};
use crate::optim::Gradients;
use crate::primitives::Catalogue;
use crate::regularization::{GateMatrix, HardConcreteParams, Mode};
use crate::traits::{NoiseSource, Scalar};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Gated weights (`W ∘ z_eval`) of every layer, hidden layers first, readout last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub layers: Vec<DMatrix<f64>>,
}

impl WeightSnapshot {
    /// Checks that the snapshot is a valid chain for `catalogue` with `in_dim` inputs.
    pub fn validate(&self, catalogue: &Catalogue, in_dim: usize) -> Result<()> {
        let (readout, hidden) = self
            .layers
            .split_last()
            .ok_or_else(|| config_err("weight snapshot has no layers"))?;
        let mut rows = in_dim;
        for (index, layer) in hidden.iter().enumerate() {
            let expected = (rows, catalogue.n_slots());
            if layer.shape() != expected {
                return Err(config_err(format!(
                    "layer {index} has shape {:?}, expected {:?}",
                    layer.shape(),
                    expected
                )));
            }
            rows = catalogue.width();
        }
        if readout.shape() != (rows, 1) {
            return Err(config_err(format!(
                "output layer has shape {:?}, expected {:?}",
                readout.shape(),
                (rows, 1)
            )));
        }
        Ok(())
    }

    /// Evaluates the frozen network on one sample. Generic so it can run on dual numbers.
    pub fn predict<T: Scalar>(&self, catalogue: &Catalogue, x: &[T]) -> T {
        let Some((readout, hidden)) = self.layers.split_last() else {
            return T::zero();
        };
        let mut h = x.to_vec();
        for layer in hidden {
            let slots = combine(layer, &h);
            h = catalogue.apply_row(&slots);
        }
        let out = combine(readout, &h);
        out.first().copied().unwrap_or_else(T::zero)
    }

    /// Number of non-zero entries across all layers.
    pub fn active_weights(&self) -> usize {
        self.layers
            .iter()
            .map(|layer| layer.iter().filter(|&&w| w != 0.0).count())
            .sum()
    }
}

fn combine<T: Scalar>(weights: &DMatrix<f64>, h: &[T]) -> Vec<T> {
    (0..weights.ncols())
        .map(|j| {
            h.iter()
                .enumerate()
                .fold(T::zero(), |acc, (i, &v)| acc + v * T::constant(weights[(i, j)]))
        })
        .collect()
}

struct ForwardCache {
    hidden: Vec<SymbolicCache>,
    output: LinearCache,
}

/// Stack of symbolic layers followed by a gated linear readout to one output.
pub struct SymbolicNetwork {
    in_dim: usize,
    catalogue: Arc<Catalogue>,
    hidden: Vec<SymbolicLayer>,
    output: GatedLinear,
    cache: Option<ForwardCache>,
}

impl SymbolicNetwork {
    /// Builds a network whose gate logits all sit at the initialization mean.
    ///
    /// `initial_weights` holds `n_layers + 1` matrices: `(in_dim, n_slots)` for the first
    /// hidden layer, `(width, n_slots)` for the others and `(width, 1)` for the readout.
    pub fn new(
        n_layers: usize,
        in_dim: usize,
        catalogue: Arc<Catalogue>,
        initial_weights: Vec<DMatrix<f64>>,
        gate_params: HardConcreteParams,
    ) -> Result<Self> {
        gate_params.validate()?;
        let mean = gate_params.initial_logit_mean();
        let logits = initial_weights
            .iter()
            .map(|w| DMatrix::from_element(w.nrows(), w.ncols(), mean))
            .collect();
        Self::from_parts(n_layers, in_dim, catalogue, initial_weights, logits, gate_params)
    }

    /// Builds a network from explicit weights and gate logits (same shapes, same order).
    pub fn from_parts(
        n_layers: usize,
        in_dim: usize,
        catalogue: Arc<Catalogue>,
        initial_weights: Vec<DMatrix<f64>>,
        logits: Vec<DMatrix<f64>>,
        gate_params: HardConcreteParams,
    ) -> Result<Self> {
        if in_dim == 0 {
            return Err(config_err("network needs at least one input"));
        }
        if initial_weights.len() != n_layers + 1 {
            return Err(config_err(format!(
                "expected {} weight matrices ({} hidden + output), got {}",
                n_layers + 1,
                n_layers,
                initial_weights.len()
            )));
        }
        if logits.len() != initial_weights.len() {
            return Err(config_err(format!(
                "expected {} gate logit matrices, got {}",
                initial_weights.len(),
                logits.len()
            )));
        }

        let mut pairs = initial_weights.into_iter().zip(logits);
        let mut hidden = Vec::with_capacity(n_layers);
        let mut rows = in_dim;
        for _ in 0..n_layers {
            let (weights, logits) = pairs
                .next()
                .ok_or_else(|| config_err("missing hidden layer weights"))?;
            let gates = GateMatrix::new(logits, gate_params);
            hidden.push(SymbolicLayer::new(rows, weights, gates, catalogue.clone())?);
            rows = catalogue.width();
        }

        let (weights, logits) = pairs
            .next()
            .ok_or_else(|| config_err("missing output layer weights"))?;
        if weights.shape() != (rows, 1) {
            return Err(config_err(format!(
                "output layer expects weights of shape {:?}, got {:?}",
                (rows, 1),
                weights.shape()
            )));
        }
        let output = GatedLinear::new(weights, GateMatrix::new(logits, gate_params))?;

        Ok(Self {
            in_dim,
            catalogue,
            hidden,
            output,
            cache: None,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn n_layers(&self) -> usize {
        self.hidden.len()
    }

    pub fn catalogue(&self) -> &Arc<Catalogue> {
        &self.catalogue
    }

    pub fn check_dataset(&self, data: &Dataset) -> Result<()> {
        if data.x_dim() != self.in_dim {
            return Err(SymNetError::DatasetShape {
                expected: self.in_dim,
                found: data.x_dim(),
            });
        }
        Ok(())
    }

    /// Runs a batch `(n, in_dim)` through the network and caches activations for `backward`.
    pub fn forward(
        &mut self,
        inputs: &DMatrix<f64>,
        mode: Mode,
        noise: &mut dyn NoiseSource,
    ) -> Result<DVector<f64>> {
        if inputs.ncols() != self.in_dim {
            return Err(SymNetError::DatasetShape {
                expected: self.in_dim,
                found: inputs.ncols(),
            });
        }
        let mut h = inputs.clone();
        let mut hidden = Vec::with_capacity(self.hidden.len());
        for layer in &self.hidden {
            let (out, cache) = layer.forward(&h, mode, noise);
            hidden.push(cache);
            h = out;
        }
        let (out, output) = self.output.forward(&h, mode, noise);
        self.cache = Some(ForwardCache { hidden, output });
        Ok(out.column(0).into_owned())
    }

    /// Sum of every layer's expected active-gate count, readout included.
    pub fn penalty(&self) -> f64 {
        self.hidden.iter().map(SymbolicLayer::penalty).sum::<f64>() + self.output.penalty()
    }

    /// Accumulates gradients of `fit + reg_weight * penalty` into `grads`, given
    /// `∂fit/∂prediction` for the most recent forward batch.
    pub fn backward(
        &self,
        grad_pred: &DVector<f64>,
        reg_weight: f64,
        grads: &mut Gradients,
    ) -> Result<()> {
        let cache = self.cache.as_ref().ok_or(SymNetError::MissingForward)?;
        if grads.len() != 2 * (self.hidden.len() + 1) {
            return Err(config_err(format!(
                "gradient buffer holds {} tensors, network has {}",
                grads.len(),
                2 * (self.hidden.len() + 1)
            )));
        }

        let upstream = DMatrix::from_column_slice(grad_pred.len(), 1, grad_pred.as_slice());
        let out_grads = self.output.backward(&cache.output, &upstream, reg_weight);
        let tensors = grads.tensors_mut();
        let last = 2 * self.hidden.len();
        tensors[last] += &out_grads.weights;
        tensors[last + 1] += &out_grads.logits;

        let mut upstream = out_grads.input;
        for (index, (layer, layer_cache)) in self.hidden.iter().zip(&cache.hidden).enumerate().rev() {
            let layer_grads = layer.backward(layer_cache, &upstream, reg_weight);
            tensors[2 * index] += &layer_grads.weights;
            tensors[2 * index + 1] += &layer_grads.logits;
            upstream = layer_grads.input;
        }
        Ok(())
    }

    /// Shapes of the parameter matrices in [`parameters_mut`](Self::parameters_mut) order.
    pub fn parameter_shapes(&self) -> Vec<(usize, usize)> {
        self.hidden
            .iter()
            .map(|layer| layer.linear().shape())
            .chain(std::iter::once(self.output.shape()))
            .flat_map(|shape| [shape, shape])
            .collect()
    }

    /// Weights and logits of every layer: `[W0, a0, W1, a1, ..., W_out, a_out]`.
    pub fn parameters_mut(&mut self) -> Vec<&mut DMatrix<f64>> {
        let mut params = Vec::with_capacity(2 * (self.hidden.len() + 1));
        for layer in &mut self.hidden {
            params.extend(layer.parameters_mut());
        }
        params.extend(self.output.parameters_mut());
        params
    }

    /// True when every weight and gate logit is finite.
    pub fn is_finite(&self) -> bool {
        self.hidden
            .iter()
            .map(SymbolicLayer::linear)
            .chain(std::iter::once(&self.output))
            .all(|layer| {
                layer
                    .weights()
                    .iter()
                    .chain(layer.gates().logits().iter())
                    .all(|v| v.is_finite())
            })
    }

    pub fn weight_snapshot(&self) -> WeightSnapshot {
        let layers = self
            .hidden
            .iter()
            .map(|layer| layer.linear().effective_weights())
            .chain(std::iter::once(self.output.effective_weights()))
            .collect();
        WeightSnapshot { layers }
    }

    /// Evaluation-mode prediction for one sample.
    pub fn predict<T: Scalar>(&self, x: &[T]) -> T {
        self.weight_snapshot().predict(&self.catalogue, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;
    use crate::primitives::Primitive;
    use crate::regularization::{ConstantNoise, SeededNoise};

    fn catalogue() -> Arc<Catalogue> {
        Arc::new(
            Catalogue::new(vec![
                Primitive::Constant,
                Primitive::Identity,
                Primitive::Square,
                Primitive::Exp,
                Primitive::product(),
            ])
            .unwrap(),
        )
    }

    fn weights(n_layers: usize, in_dim: usize, catalogue: &Catalogue) -> Vec<DMatrix<f64>> {
        let mut out = Vec::new();
        let mut rows = in_dim;
        for layer in 0..n_layers {
            out.push(DMatrix::from_fn(rows, catalogue.n_slots(), |i, j| {
                0.1 * ((i + 2 * j + layer) % 5) as f64 - 0.2
            }));
            rows = catalogue.width();
        }
        out.push(DMatrix::from_fn(rows, 1, |i, _| 0.3 - 0.1 * i as f64));
        out
    }

    fn network(n_layers: usize, in_dim: usize) -> SymbolicNetwork {
        let catalogue = catalogue();
        let w = weights(n_layers, in_dim, &catalogue);
        SymbolicNetwork::new(n_layers, in_dim, catalogue, w, HardConcreteParams::default()).unwrap()
    }

    #[test]
    fn construction_rejects_wrong_shapes_and_counts() {
        let catalogue = catalogue();
        let mut w = weights(2, 1, &catalogue);
        w[1] = DMatrix::zeros(5, 5);
        let err = SymbolicNetwork::new(2, 1, catalogue.clone(), w, HardConcreteParams::default())
            .err()
            .expect("bad hidden shape");
        assert!(matches!(err, SymNetError::Configuration(_)));

        let w = weights(1, 1, &catalogue);
        assert!(SymbolicNetwork::new(2, 1, catalogue.clone(), w, HardConcreteParams::default()).is_err());

        let mut w = weights(1, 1, &catalogue);
        w[1] = DMatrix::zeros(5, 2);
        assert!(SymbolicNetwork::new(1, 1, catalogue, w, HardConcreteParams::default()).is_err());
    }

    #[test]
    fn forward_rejects_wrong_input_width() {
        let mut net = network(1, 2);
        let err = net
            .forward(&DMatrix::zeros(4, 3), Mode::Eval, &mut ConstantNoise(0.5))
            .expect_err("width mismatch");
        assert!(matches!(err, SymNetError::DatasetShape { expected: 2, found: 3 }));
    }

    #[test]
    fn backward_without_forward_fails() {
        let net = network(1, 1);
        let mut grads = Gradients::zeros(&net.parameter_shapes());
        let err = net
            .backward(&DVector::zeros(3), 0.0, &mut grads)
            .expect_err("no cache");
        assert!(matches!(err, SymNetError::MissingForward));
    }

    #[test]
    fn eval_forward_matches_snapshot_prediction() {
        let mut net = network(2, 2);
        let inputs = DMatrix::from_row_slice(3, 2, &[0.3, -0.2, 1.0, 0.5, -0.8, 0.1]);
        let out = net
            .forward(&inputs, Mode::Eval, &mut SeededNoise::new(Some(0)))
            .unwrap();
        let again = net
            .forward(&inputs, Mode::Eval, &mut SeededNoise::new(Some(99)))
            .unwrap();
        assert_eq!(out, again);
        for n in 0..3 {
            let x = [inputs[(n, 0)], inputs[(n, 1)]];
            assert!((net.predict(&x) - out[n]).abs() < 1e-12);
        }
    }

    #[test]
    fn training_forward_depends_on_noise() {
        let mut net = network(1, 1);
        let inputs = DMatrix::from_column_slice(4, 1, &[0.1, 0.4, -0.3, 0.9]);
        let mut noise = SeededNoise::new(Some(7));
        let a = net.forward(&inputs, Mode::Train, &mut noise).unwrap();
        let b = net.forward(&inputs, Mode::Train, &mut noise).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn penalty_counts_every_layer() {
        let net = network(2, 1);
        let shapes = net.parameter_shapes();
        let total: usize = shapes.iter().step_by(2).map(|(r, c)| r * c).sum();
        let per_gate: f64 =
            crate::regularization::expected_nonzero(0.0, &HardConcreteParams::default());
        assert!((net.penalty() - total as f64 * per_gate).abs() < 1e-9);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut net = network(2, 1);
        let inputs = DMatrix::from_column_slice(4, 1, &[0.2, -0.6, 0.9, 0.4]);
        let targets = DVector::from_column_slice(&[0.5, 0.1, -0.3, 0.8]);
        let reg_weight = 0.05;

        let loss = |net: &mut SymbolicNetwork| {
            let pred = net
                .forward(&inputs, Mode::Train, &mut ConstantNoise(0.35))
                .unwrap();
            let residual = pred - &targets;
            residual.norm_squared() / targets.len() as f64 + reg_weight * net.penalty()
        };

        let pred = net
            .forward(&inputs, Mode::Train, &mut ConstantNoise(0.35))
            .unwrap();
        let grad_pred = (pred - &targets) * (2.0 / targets.len() as f64);
        let mut grads = Gradients::zeros(&net.parameter_shapes());
        net.backward(&grad_pred, reg_weight, &mut grads).unwrap();

        let h = 1e-6;
        for (p, analytic) in grads.tensors().iter().enumerate() {
            for idx in 0..analytic.len() {
                net.parameters_mut()[p][idx] += h;
                let up = loss(&mut net);
                net.parameters_mut()[p][idx] -= 2.0 * h;
                let down = loss(&mut net);
                net.parameters_mut()[p][idx] += h;
                let fd = (up - down) / (2.0 * h);
                assert!(
                    (analytic[idx] - fd).abs() < 1e-5 * (1.0 + fd.abs()),
                    "tensor {p} entry {idx}: analytic {} vs numeric {fd}",
                    analytic[idx]
                );
            }
        }
    }

    #[test]
    fn dual_prediction_gives_input_sensitivity() {
        let net = network(1, 1);
        let x = 0.37;
        let out = net.predict(&[Dual::variable(x)]);
        let h = 1e-6;
        let fd = (net.predict(&[x + h]) - net.predict(&[x - h])) / (2.0 * h);
        assert!((out.val - net.predict(&[x])).abs() < 1e-12);
        assert!((out.eps - fd).abs() < 1e-6);
    }

    #[test]
    fn non_finite_logits_are_detected_even_when_gates_hide_them() {
        let mut net = network(1, 1);
        assert!(net.is_finite());
        let last = net.parameter_shapes().len() - 1;
        net.parameters_mut()[last][(0, 0)] = f64::NAN;
        // A NaN logit clamps to a closed gate, so the snapshot alone looks healthy.
        assert!(net.weight_snapshot().layers.iter().all(|l| l.iter().all(|w| w.is_finite())));
        assert!(!net.is_finite());
    }

    #[test]
    fn check_dataset_reports_shape_error() {
        let net = network(1, 2);
        let data = Dataset::new(DMatrix::zeros(3, 1), DVector::zeros(3)).unwrap();
        let err = net.check_dataset(&data).expect_err("width mismatch");
        assert!(format!("{err}").contains("1 input column(s) but the network expects 2"));
    }
}
