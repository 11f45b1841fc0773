use crate::error::{config_err, Result};
use nalgebra::{DMatrix, DVector};
use rand::Rng;

/// Paired samples: one row of `inputs` per entry of `targets`.
#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: DMatrix<f64>,
    targets: DVector<f64>,
}

impl Dataset {
    pub fn new(inputs: DMatrix<f64>, targets: DVector<f64>) -> Result<Self> {
        if inputs.nrows() != targets.len() {
            return Err(config_err(format!(
                "dataset has {} input rows but {} targets",
                inputs.nrows(),
                targets.len()
            )));
        }
        if inputs.nrows() == 0 || inputs.ncols() == 0 {
            return Err(config_err("dataset must contain at least one sample and one input"));
        }
        Ok(Self { inputs, targets })
    }

    /// Samples `n` points uniformly from `domain` in every input and labels them with `f`.
    pub fn from_fn<F, R>(f: F, x_dim: usize, n: usize, domain: (f64, f64), rng: &mut R) -> Result<Self>
    where
        F: Fn(&[f64]) -> f64,
        R: Rng,
    {
        let (low, high) = domain;
        if !(low < high) {
            return Err(config_err(format!("invalid sampling domain ({low}, {high})")));
        }
        let inputs = DMatrix::from_fn(n, x_dim, |_, _| rng.gen_range(low..high));
        let targets = DVector::from_fn(n, |row, _| {
            let x: Vec<f64> = inputs.row(row).iter().copied().collect();
            f(&x)
        });
        Self::new(inputs, targets)
    }

    pub fn inputs(&self) -> &DMatrix<f64> {
        &self.inputs
    }

    pub fn targets(&self) -> &DVector<f64> {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn x_dim(&self) -> usize {
        self.inputs.ncols()
    }

    pub fn row(&self, index: usize) -> Vec<f64> {
        self.inputs.row(index).iter().copied().collect()
    }
}
