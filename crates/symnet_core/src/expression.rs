use crate::error::{config_err, Result};
use crate::network::WeightSnapshot;
use crate::primitives::Catalogue;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractOptions {
    /// Coefficients with `|w| <= prune_threshold` are left out. Zero keeps every non-zero weight.
    pub prune_threshold: f64,
}

/// Reads the network described by `snapshot` off as a formula by substituting symbolic
/// expressions through the layers. Keeps every non-zero coefficient.
pub fn extract(snapshot: &WeightSnapshot, catalogue: &Catalogue, var_names: &[String]) -> Result<String> {
    extract_with(snapshot, catalogue, var_names, ExtractOptions::default())
}

pub fn extract_with(
    snapshot: &WeightSnapshot,
    catalogue: &Catalogue,
    var_names: &[String],
    options: ExtractOptions,
) -> Result<String> {
    if !(options.prune_threshold >= 0.0) {
        return Err(config_err("prune threshold must be non-negative"));
    }
    snapshot.validate(catalogue, var_names.len())?;
    let (readout, hidden) = snapshot
        .layers
        .split_last()
        .ok_or_else(|| config_err("weight snapshot has no layers"))?;

    let ranges = catalogue.slot_ranges();
    let mut exprs: Vec<String> = var_names.to_vec();
    for layer in hidden {
        let slots = linear_combinations(layer, &exprs, options.prune_threshold);
        exprs = catalogue
            .units()
            .iter()
            .zip(&ranges)
            .map(|(unit, range)| {
                let b = if unit.arity() == 2 {
                    slots[range.start + 1].as_str()
                } else {
                    ""
                };
                unit.format(&slots[range.start], b)
            })
            .collect();
    }

    let mut out = linear_combinations(readout, &exprs, options.prune_threshold);
    out.pop()
        .ok_or_else(|| config_err("output layer has no columns"))
}

/// One string per column of `weights`: `Σ_i w_ij * exprs[i]`.
fn linear_combinations(weights: &DMatrix<f64>, exprs: &[String], threshold: f64) -> Vec<String> {
    (0..weights.ncols())
        .map(|j| {
            let mut text = String::new();
            for (i, expr) in exprs.iter().enumerate() {
                let w = weights[(i, j)];
                if w == 0.0 || w.abs() <= threshold {
                    continue;
                }
                let term = scaled(w.abs(), expr);
                if text.is_empty() {
                    if w < 0.0 {
                        text.push('-');
                    }
                    text.push_str(&term);
                } else {
                    text.push_str(if w < 0.0 { " - " } else { " + " });
                    text.push_str(&term);
                }
            }
            if text.is_empty() {
                text.push('0');
            }
            text
        })
        .collect()
}

fn scaled(magnitude: f64, expr: &str) -> String {
    if expr == "1" {
        format!("{magnitude}")
    } else {
        format!("{magnitude}*({expr})")
    }
}
