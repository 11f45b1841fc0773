pub mod autodiff;
pub mod config;
pub mod dataset;
pub mod equation_engine;
pub mod error;
pub mod expression;
pub mod layer;
pub mod network;
pub mod optim;
pub mod primitives;
pub mod regularization;
/// The `symnet_core` crate learns closed-form equations from data with a sparse symbolic
/// network: each unit applies a primitive (identity, square, sin, exp, sigmoid, product, ...)
/// to a linear combination of the previous layer, and hard-concrete L0 gates prune the weights
/// until a short formula remains.
///
/// Key components:
/// - **Primitives**: the closed catalogue of unit functions and their slot layout.
/// - **Network**: gated symbolic layers with an explicit reverse pass; `Dual` numbers supply
///   primitive and gate derivatives.
/// - **Training**: staged RMSProp schedule with bounded restarts on divergence.
/// - **Expression / Equation Engine**: read the trained weights off as a formula string and
///   evaluate such strings with a bytecode VM.
pub mod traits;
pub mod training;

pub use config::TrainConfig;
pub use error::{Result, SymNetError};
pub use network::{SymbolicNetwork, WeightSnapshot};
pub use training::{run_trials, train, train_trial, TrialResult};
