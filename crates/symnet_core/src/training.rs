use crate::config::{InitConfig, TrainConfig};
use crate::dataset::Dataset;
use crate::error::{config_err, Result, SymNetError};
use crate::expression::{extract_with, ExtractOptions};
use crate::network::{SymbolicNetwork, WeightSnapshot};
use crate::optim::{Gradients, Optimizer, RmsProp};
use crate::primitives::Catalogue;
use crate::regularization::{GateMatrix, HardConcreteParams, Mode, SeededNoise};
use crate::traits::NoiseSource;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Initial epochs at the configured learning rate.
    Warmup,
    /// After the one-off learning-rate decay.
    Decay,
    FineTune,
}

/// Metrics recorded every `summary_step` epochs and on the last epoch of each stage.
/// `epoch` counts from the start of the attempt, across stages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stage: Stage,
    pub epoch: usize,
    pub error: f64,
    pub penalty: f64,
    pub loss: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    pub snapshot: WeightSnapshot,
    /// Checkpoints of the successful attempt only.
    pub history: Vec<Checkpoint>,
    pub runtime: Duration,
    pub expression: String,
    pub restarts: usize,
    /// Evaluation-mode MSE on the held-out set, when one was given.
    pub test_error: Option<f64>,
}

impl TrialResult {
    pub fn errors(&self) -> Vec<f64> {
        self.history.iter().map(|c| c.error).collect()
    }

    pub fn penalties(&self) -> Vec<f64> {
        self.history.iter().map(|c| c.penalty).collect()
    }

    pub fn losses(&self) -> Vec<f64> {
        self.history.iter().map(|c| c.loss).collect()
    }

    /// Summary row: expression, errors, restart count and runtime, plus the metric series.
    pub fn to_record(&self) -> BTreeMap<String, serde_json::Value> {
        let mut record = BTreeMap::new();
        record.insert("expr".to_string(), serde_json::json!(self.expression));
        record.insert("error_test".to_string(), serde_json::json!(self.test_error));
        record.insert("restarts".to_string(), serde_json::json!(self.restarts));
        record.insert(
            "runtime_secs".to_string(),
            serde_json::json!(self.runtime.as_secs_f64()),
        );
        record.insert("errors".to_string(), serde_json::json!(self.errors()));
        record.insert("penalties".to_string(), serde_json::json!(self.penalties()));
        record.insert("losses".to_string(), serde_json::json!(self.losses()));
        record.insert(
            "active_weights".to_string(),
            serde_json::json!(self.snapshot.active_weights()),
        );
        record
    }
}

/// Samples `fmod(N(0, sd), 2)`, i.e. a normal folded into `(-2, 2)`.
fn truncated_normal<R: Rng>(rows: usize, cols: usize, sd: f64, rng: &mut R) -> Result<DMatrix<f64>> {
    let normal = Normal::new(0.0, sd)
        .map_err(|err| config_err(format!("invalid weight initialization sd {sd}: {err}")))?;
    Ok(DMatrix::from_fn(rows, cols, |_, _| normal.sample(&mut *rng) % 2.0))
}

/// Fresh weights and gate logits for a network with `n_layers` hidden layers.
pub fn initialize_parameters<R: Rng>(
    n_layers: usize,
    in_dim: usize,
    catalogue: &Catalogue,
    init: &InitConfig,
    gate: HardConcreteParams,
    rng: &mut R,
) -> Result<(Vec<DMatrix<f64>>, Vec<DMatrix<f64>>)> {
    let mut weights = Vec::with_capacity(n_layers + 1);
    let mut logits = Vec::with_capacity(n_layers + 1);
    let mut rows = in_dim;
    for layer in 0..=n_layers {
        let (cols, sd) = if layer == n_layers {
            (1, init.sd_last)
        } else if layer == 0 {
            (catalogue.n_slots(), init.sd_first)
        } else {
            (catalogue.n_slots(), init.sd_middle)
        };
        weights.push(truncated_normal(rows, cols, sd, rng)?);
        logits.push(GateMatrix::initialize(rows, cols, gate, rng)?.into_logits());
        rows = catalogue.width();
    }
    Ok((weights, logits))
}

enum Attempt {
    Finished(Vec<Checkpoint>),
    Diverged { stage: Stage, epoch: usize },
}

fn mse(prediction: &DVector<f64>, targets: &DVector<f64>) -> f64 {
    (prediction - targets).norm_squared() / targets.len() as f64
}

fn run_schedule<O: Optimizer>(
    config: &TrainConfig,
    net: &mut SymbolicNetwork,
    optimizer: &mut O,
    data: &Dataset,
    noise: &mut dyn NoiseSource,
) -> Result<Attempt> {
    let schedule = [
        (Stage::Warmup, config.warmup_epochs, 1.0),
        (Stage::Decay, config.n_epochs1, config.decay_factor),
        (Stage::FineTune, config.n_epochs2, config.fine_tune_factor),
    ];
    let scale = 2.0 / data.len() as f64;
    let mut grads = Gradients::zeros(&net.parameter_shapes());
    let mut history = Vec::new();
    let mut epoch = 0;
    let mut last_stage = Stage::Warmup;

    for (stage, epochs, factor) in schedule {
        optimizer.set_learning_rate(optimizer.learning_rate() * factor);
        if epochs == 0 {
            continue;
        }
        info!(
            "{stage:?}: {epochs} epochs at learning rate {}",
            optimizer.learning_rate()
        );
        last_stage = stage;

        for step in 0..epochs {
            grads.zero();
            let prediction = net.forward(data.inputs(), Mode::Train, noise)?;
            let residual = &prediction - data.targets();

            if step % config.summary_step == 0 || step + 1 == epochs {
                let error = residual.norm_squared() / data.len() as f64;
                let penalty = net.penalty();
                let loss = error + config.reg_weight * penalty;
                if !loss.is_finite() {
                    return Ok(Attempt::Diverged { stage, epoch });
                }
                info!("epoch {epoch}: loss {loss:.6e} error {error:.6e} penalty {penalty:.3}");
                history.push(Checkpoint {
                    stage,
                    epoch,
                    error,
                    penalty,
                    loss,
                });
            }

            net.backward(&(residual * scale), config.reg_weight, &mut grads)?;
            optimizer.step(&mut net.parameters_mut(), &grads)?;
            epoch += 1;
        }
    }

    // The update after the last checkpoint has not been looked at yet.
    if !net.is_finite() {
        return Ok(Attempt::Diverged {
            stage: last_stage,
            epoch,
        });
    }
    Ok(Attempt::Finished(history))
}

/// Trains one network from scratch.
///
/// `make_optimizer` is called with `config.learning_rate` at the start of every attempt, so a
/// restart never inherits optimizer state from a diverged run.
pub fn train_trial<O, F>(
    config: &TrainConfig,
    train: &Dataset,
    test: Option<&Dataset>,
    mut make_optimizer: F,
) -> Result<TrialResult>
where
    O: Optimizer,
    F: FnMut(f64) -> O,
{
    config.validate()?;
    let in_dim = train.x_dim();
    if config.var_names.len() < in_dim {
        return Err(config_err(format!(
            "{} variable name(s) configured for {in_dim} input(s)",
            config.var_names.len()
        )));
    }
    if let Some(test) = test {
        if test.x_dim() != in_dim {
            return Err(SymNetError::DatasetShape {
                expected: in_dim,
                found: test.x_dim(),
            });
        }
    }

    let started = Instant::now();
    let catalogue = Arc::new(config.catalogue.clone());
    let (mut rng, mut noise) = match config.seed {
        Some(seed) => (
            StdRng::seed_from_u64(seed),
            SeededNoise::new(Some(seed.wrapping_add(1))),
        ),
        None => (StdRng::from_entropy(), SeededNoise::new(None)),
    };

    let attempts = config.max_restarts + 1;
    for attempt in 0..attempts {
        debug!("attempt {} of {attempts}", attempt + 1);
        let (weights, logits) = initialize_parameters(
            config.n_layers,
            in_dim,
            &catalogue,
            &config.init,
            config.gate,
            &mut rng,
        )?;
        let mut net = SymbolicNetwork::from_parts(
            config.n_layers,
            in_dim,
            catalogue.clone(),
            weights,
            logits,
            config.gate,
        )?;
        net.check_dataset(train)?;
        let mut optimizer = make_optimizer(config.learning_rate);

        let history = match run_schedule(config, &mut net, &mut optimizer, train, &mut noise)? {
            Attempt::Finished(history) => history,
            Attempt::Diverged { stage, epoch } => {
                warn!(
                    "loss became non-finite at epoch {epoch} ({stage:?}) on attempt {}; restarting",
                    attempt + 1
                );
                continue;
            }
        };

        let snapshot = net.weight_snapshot();
        let expression = extract_with(
            &snapshot,
            &catalogue,
            &config.var_names[..in_dim],
            ExtractOptions {
                prune_threshold: config.prune_threshold,
            },
        )?;
        let test_error = match test {
            Some(test) => {
                let prediction = net.forward(test.inputs(), Mode::Eval, &mut noise)?;
                Some(mse(&prediction, test.targets()))
            }
            None => None,
        };
        info!("learned expression: {expression}");
        if let Some(error) = test_error {
            info!("test error: {error:.6e}");
        }

        return Ok(TrialResult {
            snapshot,
            history,
            runtime: started.elapsed(),
            expression,
            restarts: attempt,
            test_error,
        });
    }

    Err(SymNetError::Diverged { attempts })
}

/// [`train_trial`] with RMSProp.
pub fn train(config: &TrainConfig, train: &Dataset, test: Option<&Dataset>) -> Result<TrialResult> {
    train_trial(config, train, test, RmsProp::new)
}

/// Runs `trials` independent trials and returns them ordered by test error (best first).
/// Trial `k` uses seed `seed + k` when the config is seeded.
pub fn run_trials(
    config: &TrainConfig,
    train_set: &Dataset,
    test: Option<&Dataset>,
    trials: usize,
) -> Result<Vec<TrialResult>> {
    let mut results = Vec::with_capacity(trials);
    for trial in 0..trials {
        info!("trial {} of {trials}", trial + 1);
        let mut trial_config = config.clone();
        trial_config.seed = config.seed.map(|seed| seed.wrapping_add(trial as u64));
        results.push(train(&trial_config, train_set, test)?);
    }
    results.sort_by(|a, b| {
        let a = a.test_error.unwrap_or(f64::INFINITY);
        let b = b.test_error.unwrap_or(f64::INFINITY);
        a.total_cmp(&b)
    });
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::Formula;
    use crate::optim::Sgd;
    use crate::primitives::Primitive;

    fn catalogue() -> Catalogue {
        Catalogue::new(vec![
            Primitive::Constant,
            Primitive::Identity,
            Primitive::Square,
            Primitive::Sin,
        ])
        .unwrap()
    }

    fn quick_config() -> TrainConfig {
        TrainConfig {
            n_layers: 1,
            catalogue: catalogue(),
            warmup_epochs: 20,
            n_epochs1: 30,
            n_epochs2: 20,
            summary_step: 10,
            seed: Some(5),
            ..TrainConfig::default()
        }
    }

    fn linear_data(seed: u64, n: usize) -> Dataset {
        Dataset::from_fn(|x| x[0], 1, n, (-1.0, 1.0), &mut StdRng::seed_from_u64(seed)).unwrap()
    }

    /// RMSProp that writes NaN into the first weight matrix from step `poison_from` on.
    struct Poisoned {
        inner: RmsProp,
        poison_from: Option<usize>,
        steps: usize,
    }

    impl Poisoned {
        fn new(lr: f64, poison_from: Option<usize>) -> Self {
            Self {
                inner: RmsProp::new(lr),
                poison_from,
                steps: 0,
            }
        }
    }

    impl Optimizer for Poisoned {
        fn step(&mut self, params: &mut [&mut DMatrix<f64>], grads: &Gradients) -> Result<()> {
            let step = self.steps;
            self.steps += 1;
            if self.poison_from.is_some_and(|from| step >= from) {
                params[0].fill(f64::NAN);
                return Ok(());
            }
            self.inner.step(params, grads)
        }

        fn learning_rate(&self) -> f64 {
            self.inner.learning_rate()
        }

        fn set_learning_rate(&mut self, lr: f64) {
            self.inner.set_learning_rate(lr);
        }
    }

    #[test]
    fn initialization_folds_weights_into_open_interval() {
        let catalogue = Catalogue::standard();
        let init = InitConfig {
            sd_first: 5.0,
            sd_middle: 5.0,
            sd_last: 5.0,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let (weights, logits) = initialize_parameters(
            2,
            3,
            &catalogue,
            &init,
            HardConcreteParams::default(),
            &mut rng,
        )
        .unwrap();
        let shapes: Vec<_> = weights.iter().map(|w| w.shape()).collect();
        assert_eq!(shapes, vec![(3, 20), (18, 20), (18, 1)]);
        assert_eq!(shapes, logits.iter().map(|l| l.shape()).collect::<Vec<_>>());
        assert!(weights.iter().flat_map(|w| w.iter()).all(|w| w.abs() < 2.0));
        assert!(logits.iter().flat_map(|l| l.iter()).all(|a| a.abs() < 0.1));
    }

    #[test_log::test]
    fn schedule_records_checkpoints_per_stage() {
        let config = quick_config();
        let result = train(&config, &linear_data(0, 64), None).unwrap();

        let stages: Vec<_> = result.history.iter().map(|c| (c.stage, c.epoch)).collect();
        assert_eq!(
            stages,
            vec![
                (Stage::Warmup, 0),
                (Stage::Warmup, 10),
                (Stage::Warmup, 19),
                (Stage::Decay, 20),
                (Stage::Decay, 30),
                (Stage::Decay, 40),
                (Stage::Decay, 49),
                (Stage::FineTune, 50),
                (Stage::FineTune, 60),
                (Stage::FineTune, 69),
            ]
        );
        assert_eq!(result.restarts, 0);
        assert!(result.test_error.is_none());
        for c in &result.history {
            assert!((c.loss - (c.error + config.reg_weight * c.penalty)).abs() < 1e-12);
        }
        assert_eq!(result.errors().len(), result.history.len());
    }

    #[test_log::test]
    fn learning_rate_follows_stage_factors() {
        let mut config = quick_config();
        config.learning_rate = 0.2;
        config.decay_factor = 0.5;
        config.fine_tune_factor = 0.1;
        let mut rates = Vec::new();
        train_trial(&config, &linear_data(1, 16), None, |lr| {
            rates.push(lr);
            RmsProp::new(lr)
        })
        .unwrap();
        assert_eq!(rates, vec![0.2]);

        let (weights, logits) = initialize_parameters(
            1,
            1,
            &config.catalogue,
            &config.init,
            config.gate,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();
        let mut net = SymbolicNetwork::from_parts(
            1,
            1,
            Arc::new(config.catalogue.clone()),
            weights,
            logits,
            config.gate,
        )
        .unwrap();
        let mut net_rate = RmsProp::new(config.learning_rate);
        run_schedule(
            &config,
            &mut net,
            &mut net_rate,
            &linear_data(1, 16),
            &mut SeededNoise::new(Some(0)),
        )
        .unwrap();
        assert!((net_rate.learning_rate() - 0.2 * 0.5 * 0.1).abs() < 1e-15);
    }

    #[test_log::test]
    fn diverged_attempt_is_restarted_with_fresh_state() {
        let config = quick_config();
        let mut created = 0;
        let result = train_trial(&config, &linear_data(2, 32), None, |lr| {
            created += 1;
            Poisoned::new(lr, (created == 1).then_some(0))
        })
        .unwrap();
        assert_eq!(created, 2);
        assert_eq!(result.restarts, 1);
        assert!(result.errors().iter().all(|e| e.is_finite()));
        assert_eq!(result.history.first().map(|c| c.epoch), Some(0));
        assert!(result
            .snapshot
            .layers
            .iter()
            .all(|layer| layer.iter().all(|w| w.is_finite())));
    }

    #[test_log::test]
    fn update_after_last_checkpoint_is_checked() {
        let config = quick_config();
        let last_step = config.warmup_epochs + config.n_epochs1 + config.n_epochs2 - 1;
        let mut created = 0;
        let result = train_trial(&config, &linear_data(8, 32), None, |lr| {
            created += 1;
            Poisoned::new(lr, (created == 1).then_some(last_step))
        })
        .unwrap();
        assert_eq!(created, 2);
        assert_eq!(result.restarts, 1);
        assert!(result
            .snapshot
            .layers
            .iter()
            .all(|layer| layer.iter().all(|w| w.is_finite())));

        let mut strict = quick_config();
        strict.max_restarts = 0;
        let err = train_trial(&strict, &linear_data(8, 32), None, |lr| {
            Poisoned::new(lr, Some(last_step))
        })
        .expect_err("final update is non-finite");
        assert!(matches!(err, SymNetError::Diverged { attempts: 1 }));
    }

    #[test_log::test]
    fn divergence_from_the_first_update_restarts_cleanly() {
        let mut config = quick_config();
        config.summary_step = 1;
        let total = config.warmup_epochs + config.n_epochs1 + config.n_epochs2;
        let mut created = 0;
        let result = train_trial(&config, &linear_data(9, 32), None, |lr| {
            created += 1;
            Poisoned::new(lr, (created == 1).then_some(0))
        })
        .unwrap();
        assert_eq!(result.restarts, 1);
        assert_eq!(result.history.len(), total);
        assert_eq!(result.history[0].epoch, 0);
        assert!(result.errors().iter().all(|e| e.is_finite()));
    }

    #[test_log::test]
    fn absurd_learning_rate_diverges_then_recovers() {
        let mut config = quick_config();
        config.summary_step = 1;
        let mut created = 0;
        let result = train_trial(&config, &linear_data(10, 32), None, |lr| {
            created += 1;
            Sgd::new(if created == 1 { 1e300 } else { lr })
        })
        .unwrap();
        assert_eq!(created, 2);
        assert_eq!(result.restarts, 1);
        assert!(result.losses().iter().all(|l| l.is_finite()));
    }

    #[test_log::test]
    fn restart_budget_is_bounded() {
        let mut config = quick_config();
        config.max_restarts = 2;
        let mut created = 0;
        let err = train_trial(&config, &linear_data(3, 32), None, |lr| {
            created += 1;
            Poisoned::new(lr, Some(0))
        })
        .expect_err("every attempt diverges");
        assert!(matches!(err, SymNetError::Diverged { attempts: 3 }));
        assert_eq!(created, 3);
    }

    #[test]
    fn too_few_variable_names_is_a_configuration_error() {
        let mut config = quick_config();
        config.var_names = vec!["x".into()];
        let data = Dataset::from_fn(|x| x[0] + x[1], 2, 8, (-1.0, 1.0), &mut StdRng::seed_from_u64(0))
            .unwrap();
        let err = train(&config, &data, None).expect_err("one name for two inputs");
        assert!(matches!(err, SymNetError::Configuration(_)));
    }

    #[test]
    fn test_set_width_must_match() {
        let config = quick_config();
        let test = Dataset::from_fn(|x| x[0] + x[1], 2, 8, (-1.0, 1.0), &mut StdRng::seed_from_u64(0))
            .unwrap();
        let err = train(&config, &linear_data(0, 8), Some(&test)).expect_err("width mismatch");
        assert!(matches!(err, SymNetError::DatasetShape { expected: 1, found: 2 }));
    }

    #[test_log::test]
    fn recovers_identity_function() {
        let config = TrainConfig {
            n_layers: 1,
            catalogue: Catalogue::new(vec![
                Primitive::Constant,
                Primitive::Identity,
                Primitive::Square,
            ])
            .unwrap(),
            warmup_epochs: 1000,
            n_epochs1: 3000,
            n_epochs2: 2000,
            fine_tune_factor: 0.1,
            summary_step: 500,
            seed: Some(11),
            ..TrainConfig::default()
        };
        let train_set = linear_data(4, 256);
        let test_set = linear_data(5, 256);
        let result = train(&config, &train_set, Some(&test_set)).unwrap();

        let test_error = result.test_error.unwrap();
        assert!(test_error < 1e-3, "test error {test_error}, expression {}", result.expression);
        let first = result.history.first().unwrap().loss;
        let last = result.history.last().unwrap().loss;
        assert!(last < first);

        let formula = Formula::compile(&result.expression, &["x".to_string()]).unwrap();
        let formula_error = formula.mse(&test_set).unwrap();
        assert!((formula_error - test_error).abs() < 1e-9 * (1.0 + test_error));

        let wide = Dataset::from_fn(|x| x[0], 1, 256, (-2.0, 2.0), &mut StdRng::seed_from_u64(6))
            .unwrap();
        let wide_error = formula.mse(&wide).unwrap();
        assert!(wide_error < 1e-3, "extrapolation error {wide_error}, expression {}", result.expression);
    }

    #[test_log::test]
    fn trials_are_sorted_by_test_error() {
        let config = quick_config();
        let results = run_trials(&config, &linear_data(6, 32), Some(&linear_data(7, 32)), 3).unwrap();
        assert_eq!(results.len(), 3);
        let errors: Vec<f64> = results.iter().map(|r| r.test_error.unwrap()).collect();
        assert!(errors.windows(2).all(|w| w[0] <= w[1]));

        let record = results[0].to_record();
        assert_eq!(record["restarts"], serde_json::json!(0));
        assert_eq!(record["expr"], serde_json::json!(results[0].expression));
        assert_eq!(
            record["losses"].as_array().map(Vec::len),
            Some(results[0].history.len())
        );
    }
}
