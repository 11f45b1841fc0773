use crate::autodiff::{derivative, Dual};
use crate::error::{config_err, Result};
use crate::traits::{NoiseSource, Scalar};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Whether gates are sampled (training) or taken deterministically (evaluation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardConcreteParams {
    /// Concrete temperature (beta).
    pub temperature: f64,
    /// Lower end of the stretch interval, must be negative.
    pub gamma: f64,
    /// Upper end of the stretch interval, must exceed 1.
    pub zeta: f64,
    /// Uniform noise is drawn from `[epsilon, 1 - epsilon]`.
    pub epsilon: f64,
    /// Initial probability that a gate is closed; sets the mean of the logit initialization.
    pub drop_rate_init: f64,
    /// Standard deviation of the logit initialization.
    pub logit_init_sd: f64,
}

impl Default for HardConcreteParams {
    fn default() -> Self {
        Self {
            temperature: 2.0 / 3.0,
            gamma: -0.1,
            zeta: 1.1,
            epsilon: 1e-6,
            drop_rate_init: 0.5,
            logit_init_sd: 1e-2,
        }
    }
}

impl HardConcreteParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) {
            return Err(config_err("gate temperature must be positive"));
        }
        if !(self.gamma < 0.0) || !(self.zeta > 1.0) {
            return Err(config_err(format!(
                "gate stretch interval ({}, {}) must strictly contain [0, 1]",
                self.gamma, self.zeta
            )));
        }
        if !(self.epsilon > 0.0 && self.epsilon < 0.5) {
            return Err(config_err("gate noise epsilon must lie in (0, 0.5)"));
        }
        if !(self.drop_rate_init > 0.0 && self.drop_rate_init < 1.0) {
            return Err(config_err("initial drop rate must lie in (0, 1)"));
        }
        if !(self.logit_init_sd >= 0.0) {
            return Err(config_err("logit initialization sd must be non-negative"));
        }
        Ok(())
    }

    pub fn initial_logit_mean(&self) -> f64 {
        (1.0 - self.drop_rate_init).ln() - self.drop_rate_init.ln()
    }

    fn stretch<T: Scalar>(&self, s: T) -> T {
        clamp_unit(s * T::constant(self.zeta - self.gamma) + T::constant(self.gamma))
    }
}

fn clamp_unit<T: Scalar>(x: T) -> T {
    x.max(T::zero()).min(T::one())
}

/// Training-mode gate for one weight, given its logit and a uniform sample `u`.
pub fn sample_gate<T: Scalar>(logit: T, u: f64, params: &HardConcreteParams) -> T {
    let noise = T::constant(u.ln() - (1.0 - u).ln());
    let s = ((noise + logit) / T::constant(params.temperature)).sigmoid();
    params.stretch(s)
}

/// Evaluation-mode gate: no sampling, same stretch and clip.
pub fn deterministic_gate<T: Scalar>(logit: T, params: &HardConcreteParams) -> T {
    params.stretch(logit.sigmoid())
}

/// Closed-form probability that the sampled gate is strictly positive.
pub fn expected_nonzero<T: Scalar>(logit: T, params: &HardConcreteParams) -> T {
    let shift = params.temperature * (-params.gamma / params.zeta).ln();
    (logit - T::constant(shift)).sigmoid()
}

/// Gates realized for one forward pass, with their derivatives w.r.t. the logits.
#[derive(Debug, Clone)]
pub struct RealizedGates {
    pub values: DMatrix<f64>,
    pub slopes: DMatrix<f64>,
}

/// Gate logits for one weight matrix.
///
/// In training mode each gate is a clipped, stretched concrete sample
///
/// ```text
/// s = sigmoid((ln u - ln(1 - u) + a) / beta),   u ~ U(eps, 1 - eps)
/// z = clamp(s * (zeta - gamma) + gamma, 0, 1)
/// ```
///
/// and in evaluation mode it is `clamp(sigmoid(a) * (zeta - gamma) + gamma, 0, 1)`.
/// The penalty is the expected number of non-zero gates, `sum sigmoid(a - beta * ln(-gamma / zeta))`.
#[derive(Debug, Clone)]
pub struct GateMatrix {
    logits: DMatrix<f64>,
    params: HardConcreteParams,
}

impl GateMatrix {
    pub fn new(logits: DMatrix<f64>, params: HardConcreteParams) -> Self {
        Self { logits, params }
    }

    /// Draws logits from `N(ln(1 - p) - ln p, logit_init_sd)`.
    pub fn initialize<R: Rng>(
        rows: usize,
        cols: usize,
        params: HardConcreteParams,
        rng: &mut R,
    ) -> Result<Self> {
        params.validate()?;
        let mean = params.initial_logit_mean();
        let normal = Normal::new(mean, params.logit_init_sd)
            .map_err(|err| config_err(format!("invalid logit initialization: {err}")))?;
        let logits = DMatrix::from_fn(rows, cols, |_, _| normal.sample(&mut *rng));
        Ok(Self::new(logits, params))
    }

    pub fn logits(&self) -> &DMatrix<f64> {
        &self.logits
    }

    pub fn into_logits(self) -> DMatrix<f64> {
        self.logits
    }

    pub fn logits_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.logits
    }

    pub fn params(&self) -> &HardConcreteParams {
        &self.params
    }

    /// Realizes the gates. Training mode draws one noise sample per element (column-major).
    pub fn realize(&self, mode: Mode, noise: &mut dyn NoiseSource) -> RealizedGates {
        let (rows, cols) = self.logits.shape();
        let mut values = DMatrix::zeros(rows, cols);
        let mut slopes = DMatrix::zeros(rows, cols);
        let low = self.params.epsilon;
        let high = 1.0 - self.params.epsilon;
        for j in 0..cols {
            for i in 0..rows {
                let logit = Dual::variable(self.logits[(i, j)]);
                let gate = match mode {
                    Mode::Train => {
                        let u = noise.uniform(low, high);
                        sample_gate(logit, u, &self.params)
                    }
                    Mode::Eval => deterministic_gate(logit, &self.params),
                };
                values[(i, j)] = gate.val;
                slopes[(i, j)] = gate.eps;
            }
        }
        RealizedGates { values, slopes }
    }

    /// Deterministic gates only.
    pub fn eval_gates(&self) -> DMatrix<f64> {
        self.logits
            .map(|logit| deterministic_gate(logit, &self.params))
    }

    /// Expected number of active weights in this matrix.
    pub fn penalty(&self) -> f64 {
        self.logits
            .iter()
            .map(|&logit| expected_nonzero(logit, &self.params))
            .sum()
    }

    /// Derivative of [`penalty`](Self::penalty) with respect to every logit.
    pub fn penalty_gradient(&self) -> DMatrix<f64> {
        self.logits
            .map(|logit| derivative(|a| expected_nonzero(a, &self.params), logit).1)
    }
}

/// Uniform noise from a seeded `StdRng`.
#[derive(Debug, Clone)]
pub struct SeededNoise {
    rng: StdRng,
}

impl SeededNoise {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl NoiseSource for SeededNoise {
    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        self.rng.gen_range(low..high)
    }
}

/// Returns the same value every time (clamped into the requested range).
#[derive(Debug, Clone, Copy)]
pub struct ConstantNoise(pub f64);

impl NoiseSource for ConstantNoise {
    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        self.0.clamp(low, high)
    }
}
