use crate::error::{config_err, Result};
use crate::primitives::Catalogue;
use crate::regularization::{GateMatrix, Mode, RealizedGates};
use crate::traits::NoiseSource;
use nalgebra::DMatrix;
use std::sync::Arc;

/// Gradients produced by one layer's backward pass.
#[derive(Debug, Clone)]
pub struct LayerGradients {
    pub input: DMatrix<f64>,
    pub weights: DMatrix<f64>,
    pub logits: DMatrix<f64>,
}

/// Activations kept from a forward pass of a [`GatedLinear`].
#[derive(Debug, Clone)]
pub struct LinearCache {
    input: DMatrix<f64>,
    gates: RealizedGates,
    effective: DMatrix<f64>,
}

/// `x · (W ∘ z)` where `z` are the L0 gates of `W`.
#[derive(Debug, Clone)]
pub struct GatedLinear {
    weights: DMatrix<f64>,
    gates: GateMatrix,
}

impl GatedLinear {
    pub fn new(weights: DMatrix<f64>, gates: GateMatrix) -> Result<Self> {
        if weights.shape() != gates.logits().shape() {
            return Err(config_err(format!(
                "weight shape {:?} does not match gate shape {:?}",
                weights.shape(),
                gates.logits().shape()
            )));
        }
        Ok(Self { weights, gates })
    }

    pub fn weights(&self) -> &DMatrix<f64> {
        &self.weights
    }

    pub fn gates(&self) -> &GateMatrix {
        &self.gates
    }

    pub fn shape(&self) -> (usize, usize) {
        self.weights.shape()
    }

    /// Mutable views of (weights, logits), in that order.
    pub fn parameters_mut(&mut self) -> [&mut DMatrix<f64>; 2] {
        [&mut self.weights, self.gates.logits_mut()]
    }

    pub fn forward(
        &self,
        input: &DMatrix<f64>,
        mode: Mode,
        noise: &mut dyn NoiseSource,
    ) -> (DMatrix<f64>, LinearCache) {
        let gates = self.gates.realize(mode, noise);
        let effective = self.weights.component_mul(&gates.values);
        let output = input * &effective;
        let cache = LinearCache {
            input: input.clone(),
            gates,
            effective,
        };
        (output, cache)
    }

    /// Back-propagates `grad_out` (batch × out) and adds `reg_weight` times the penalty
    /// gradient to the logit gradient.
    pub fn backward(
        &self,
        cache: &LinearCache,
        grad_out: &DMatrix<f64>,
        reg_weight: f64,
    ) -> LayerGradients {
        let grad_effective = cache.input.transpose() * grad_out;
        let weights = grad_effective.component_mul(&cache.gates.values);
        let mut logits = grad_effective
            .component_mul(&self.weights)
            .component_mul(&cache.gates.slopes);
        logits += self.gates.penalty_gradient() * reg_weight;
        let input = grad_out * cache.effective.transpose();
        LayerGradients {
            input,
            weights,
            logits,
        }
    }

    /// `W ∘ z` with deterministic gates.
    pub fn effective_weights(&self) -> DMatrix<f64> {
        self.weights.component_mul(&self.gates.eval_gates())
    }

    pub fn penalty(&self) -> f64 {
        self.gates.penalty()
    }
}

/// Activations kept from a forward pass of a [`SymbolicLayer`].
#[derive(Debug, Clone)]
pub struct SymbolicCache {
    linear: LinearCache,
    slots: DMatrix<f64>,
}

/// A gated linear map into `width + n_binary` slots followed by one primitive per unit.
#[derive(Debug, Clone)]
pub struct SymbolicLayer {
    linear: GatedLinear,
    catalogue: Arc<Catalogue>,
}

impl SymbolicLayer {
    /// Fails if `weights` is not `(in_dim, catalogue.n_slots())`.
    pub fn new(
        in_dim: usize,
        weights: DMatrix<f64>,
        gates: GateMatrix,
        catalogue: Arc<Catalogue>,
    ) -> Result<Self> {
        let expected = (in_dim, catalogue.n_slots());
        if weights.shape() != expected {
            return Err(config_err(format!(
                "symbolic layer expects weights of shape {:?} ({} units + {} binary), got {:?}",
                expected,
                catalogue.width(),
                catalogue.n_binary(),
                weights.shape()
            )));
        }
        let linear = GatedLinear::new(weights, gates)?;
        Ok(Self { linear, catalogue })
    }

    pub fn linear(&self) -> &GatedLinear {
        &self.linear
    }

    pub fn parameters_mut(&mut self) -> [&mut DMatrix<f64>; 2] {
        self.linear.parameters_mut()
    }

    pub fn in_dim(&self) -> usize {
        self.linear.shape().0
    }

    pub fn width(&self) -> usize {
        self.catalogue.width()
    }

    pub fn forward(
        &self,
        input: &DMatrix<f64>,
        mode: Mode,
        noise: &mut dyn NoiseSource,
    ) -> (DMatrix<f64>, SymbolicCache) {
        let (slots, linear) = self.linear.forward(input, mode, noise);
        let ranges = self.catalogue.slot_ranges();
        let units = self.catalogue.units();
        let output = DMatrix::from_fn(slots.nrows(), units.len(), |n, i| {
            let start = ranges[i].start;
            let b = if units[i].arity() == 2 {
                slots[(n, start + 1)]
            } else {
                0.0
            };
            units[i].apply(slots[(n, start)], b)
        });
        (output, SymbolicCache { linear, slots })
    }

    pub fn backward(
        &self,
        cache: &SymbolicCache,
        grad_out: &DMatrix<f64>,
        reg_weight: f64,
    ) -> LayerGradients {
        let ranges = self.catalogue.slot_ranges();
        let mut grad_slots = DMatrix::zeros(cache.slots.nrows(), cache.slots.ncols());
        for (i, unit) in self.catalogue.units().iter().enumerate() {
            let start = ranges[i].start;
            for n in 0..cache.slots.nrows() {
                let upstream = grad_out[(n, i)];
                if upstream == 0.0 {
                    continue;
                }
                let a = cache.slots[(n, start)];
                if unit.arity() == 2 {
                    let (_, da, db) = unit.partials(a, cache.slots[(n, start + 1)]);
                    grad_slots[(n, start)] += upstream * da;
                    grad_slots[(n, start + 1)] += upstream * db;
                } else {
                    let (_, da, _) = unit.partials(a, 0.0);
                    grad_slots[(n, start)] += upstream * da;
                }
            }
        }
        self.linear.backward(&cache.linear, &grad_slots, reg_weight)
    }

    pub fn penalty(&self) -> f64 {
        self.linear.penalty()
    }
}
