use crate::error::{config_err, Result};
use nalgebra::DMatrix;

/// Gradient buffers, one per parameter matrix, in the network's parameter order.
#[derive(Debug, Clone)]
pub struct Gradients {
    tensors: Vec<DMatrix<f64>>,
}

impl Gradients {
    pub fn zeros(shapes: &[(usize, usize)]) -> Self {
        let tensors = shapes
            .iter()
            .map(|&(rows, cols)| DMatrix::zeros(rows, cols))
            .collect();
        Self { tensors }
    }

    /// Resets every buffer to zero without reallocating.
    pub fn zero(&mut self) {
        for tensor in &mut self.tensors {
            tensor.fill(0.0);
        }
    }

    pub fn tensors(&self) -> &[DMatrix<f64>] {
        &self.tensors
    }

    pub fn tensors_mut(&mut self) -> &mut [DMatrix<f64>] {
        &mut self.tensors
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

fn check_shapes(params: &[&mut DMatrix<f64>], grads: &Gradients) -> Result<()> {
    if params.len() != grads.len() {
        return Err(config_err(format!(
            "optimizer received {} parameters but {} gradients",
            params.len(),
            grads.len()
        )));
    }
    for (index, (param, grad)) in params.iter().zip(grads.tensors()).enumerate() {
        if param.shape() != grad.shape() {
            return Err(config_err(format!(
                "parameter {index} has shape {:?} but its gradient has shape {:?}",
                param.shape(),
                grad.shape()
            )));
        }
    }
    Ok(())
}

/// A stateful first-order optimizer with an adjustable learning rate.
pub trait Optimizer {
    /// Updates `params` in place from `grads`. Both must use the same order and shapes.
    fn step(&mut self, params: &mut [&mut DMatrix<f64>], grads: &Gradients) -> Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}

/// RMSProp without momentum.
///
/// ```text
/// v = rho * v + (1 - rho) * g^2
/// p = p - lr * g / (sqrt(v) + eps)
/// ```
#[derive(Debug, Clone)]
pub struct RmsProp {
    lr: f64,
    rho: f64,
    epsilon: f64,
    square_avg: Vec<DMatrix<f64>>,
}

impl RmsProp {
    /// Defaults: rho = 0.99, eps = 1e-8.
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            rho: 0.99,
            epsilon: 1e-8,
            square_avg: Vec::new(),
        }
    }

    pub fn with_rho(mut self, rho: f64) -> Self {
        self.rho = rho;
        self
    }

    pub fn with_eps(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn rho(&self) -> f64 {
        self.rho
    }
}

impl Optimizer for RmsProp {
    fn step(&mut self, params: &mut [&mut DMatrix<f64>], grads: &Gradients) -> Result<()> {
        check_shapes(params, grads)?;
        if self.square_avg.len() != params.len() {
            self.square_avg = params
                .iter()
                .map(|p| DMatrix::zeros(p.nrows(), p.ncols()))
                .collect();
        }

        let (lr, rho, epsilon) = (self.lr, self.rho, self.epsilon);
        for ((param, grad), avg) in params
            .iter_mut()
            .zip(grads.tensors())
            .zip(self.square_avg.iter_mut())
        {
            for ((p, &g), v) in param.iter_mut().zip(grad.iter()).zip(avg.iter_mut()) {
                *v = rho * *v + (1.0 - rho) * g * g;
                *p -= lr * g / (v.sqrt() + epsilon);
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Plain gradient descent.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [&mut DMatrix<f64>], grads: &Gradients) -> Result<()> {
        check_shapes(params, grads)?;
        for (param, grad) in params.iter_mut().zip(grads.tensors()) {
            **param -= grad * self.lr;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}
