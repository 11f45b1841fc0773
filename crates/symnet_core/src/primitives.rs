use crate::autodiff::{partials2, Dual};
use crate::error::{config_err, Result, SymNetError};
use crate::traits::Scalar;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// One primitive function. The set is closed: every unit of a symbolic layer is one of these.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Primitive {
    /// Ignores its slot and emits 1. The next layer's weight on it is the learned constant.
    Constant,
    Identity,
    Square,
    Sin,
    Exp,
    Sigmoid,
    /// `a * b / norm`
    Product { norm: f64 },
}

impl Primitive {
    pub fn product() -> Self {
        Primitive::Product { norm: 1.0 }
    }

    pub fn arity(&self) -> usize {
        match self {
            Primitive::Product { .. } => 2,
            _ => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Constant => "constant",
            Primitive::Identity => "identity",
            Primitive::Square => "square",
            Primitive::Sin => "sin",
            Primitive::Exp => "exp",
            Primitive::Sigmoid => "sigmoid",
            Primitive::Product { .. } => "product",
        }
    }

    /// Applies the primitive. `b` is ignored by unary primitives.
    pub fn apply<T: Scalar>(&self, a: T, b: T) -> T {
        match self {
            Primitive::Constant => T::one(),
            Primitive::Identity => a,
            Primitive::Square => a * a,
            Primitive::Sin => a.sin(),
            Primitive::Exp => a.exp(),
            Primitive::Sigmoid => a.sigmoid(),
            Primitive::Product { norm } => a * b / T::constant(*norm),
        }
    }

    /// Value and partial derivatives `(f, ∂f/∂a, ∂f/∂b)` at `(a, b)`.
    pub fn partials(&self, a: f64, b: f64) -> (f64, f64, f64) {
        partials2(|x: Dual, y: Dual| self.apply(x, y), a, b)
    }

    /// Fills the print template with the argument expression(s).
    pub fn format(&self, a: &str, b: &str) -> String {
        match self {
            Primitive::Constant => "1".to_string(),
            Primitive::Identity => a.to_string(),
            Primitive::Square => format!("({a})^2"),
            Primitive::Sin => format!("sin({a})"),
            Primitive::Exp => format!("exp({a})"),
            Primitive::Sigmoid => format!("sigmoid({a})"),
            Primitive::Product { norm } => {
                if *norm == 1.0 {
                    format!("({a})*({b})")
                } else {
                    format!("({a})*({b})/{norm}")
                }
            }
        }
    }
}

/// Ordered list of primitives making up one hidden layer.
///
/// Unit `i` reads the slots in `slot_ranges()[i]`: one slot, or two consecutive slots for
/// binary primitives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Primitive>", into = "Vec<Primitive>")]
pub struct Catalogue {
    units: Vec<Primitive>,
}

impl TryFrom<Vec<Primitive>> for Catalogue {
    type Error = SymNetError;

    fn try_from(units: Vec<Primitive>) -> Result<Self> {
        Self::new(units)
    }
}

impl From<Catalogue> for Vec<Primitive> {
    fn from(catalogue: Catalogue) -> Self {
        catalogue.units
    }
}

impl Catalogue {
    pub fn new(units: Vec<Primitive>) -> Result<Self> {
        if units.is_empty() {
            return Err(config_err("catalogue must contain at least one primitive"));
        }
        for unit in &units {
            if let Primitive::Product { norm } = unit {
                if *norm == 0.0 || !norm.is_finite() {
                    return Err(config_err(format!(
                        "product normalization must be finite and non-zero, got {norm}"
                    )));
                }
            }
        }
        Ok(Self { units })
    }

    /// Builds a catalogue from `(primitive, repeat count)` groups, in order.
    pub fn from_counts(groups: &[(Primitive, usize)]) -> Result<Self> {
        let units = groups
            .iter()
            .flat_map(|&(primitive, count)| std::iter::repeat(primitive).take(count))
            .collect();
        Self::new(units)
    }

    /// The reference mix: 2 constant, 4 identity, 4 square, 2 sin, 2 exp, 2 sigmoid, 2 product.
    pub fn standard() -> Self {
        let units = [
            (Primitive::Constant, 2),
            (Primitive::Identity, 4),
            (Primitive::Square, 4),
            (Primitive::Sin, 2),
            (Primitive::Exp, 2),
            (Primitive::Sigmoid, 2),
            (Primitive::product(), 2),
        ]
        .iter()
        .flat_map(|&(primitive, count)| std::iter::repeat(primitive).take(count))
        .collect();
        Self { units }
    }

    pub fn units(&self) -> &[Primitive] {
        &self.units
    }

    /// Number of units, i.e. the layer's output width.
    pub fn width(&self) -> usize {
        self.units.len()
    }

    pub fn n_binary(&self) -> usize {
        self.units.iter().filter(|p| p.arity() == 2).count()
    }

    /// Number of linear combinations a layer must produce.
    pub fn n_slots(&self) -> usize {
        self.width() + self.n_binary()
    }

    /// Slot range consumed by each unit, in unit order.
    pub fn slot_ranges(&self) -> Vec<Range<usize>> {
        let mut start = 0;
        self.units
            .iter()
            .map(|unit| {
                let range = start..start + unit.arity();
                start = range.end;
                range
            })
            .collect()
    }

    /// Applies every unit to one row of slot values.
    pub fn apply_row<T: Scalar>(&self, slots: &[T]) -> Vec<T> {
        self.units
            .iter()
            .zip(self.slot_ranges())
            .map(|(unit, range)| {
                let a = slots[range.start];
                let b = if unit.arity() == 2 {
                    slots[range.start + 1]
                } else {
                    T::zero()
                };
                unit.apply(a, b)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Catalogue, Primitive};

    #[test]
    fn standard_catalogue_counts() {
        let catalogue = Catalogue::standard();
        assert_eq!(catalogue.width(), 18);
        assert_eq!(catalogue.n_binary(), 2);
        assert_eq!(catalogue.n_slots(), 20);
    }

    #[test]
    fn slot_ranges_give_binary_units_two_consecutive_slots() {
        let catalogue = Catalogue::new(vec![
            Primitive::Identity,
            Primitive::product(),
            Primitive::Sin,
            Primitive::product(),
        ])
        .unwrap();
        let ranges = catalogue.slot_ranges();
        assert_eq!(ranges, vec![0..1, 1..3, 3..4, 4..6]);
        assert_eq!(catalogue.n_slots(), 6);
    }

    #[test]
    fn apply_row_uses_slot_layout() {
        let catalogue = Catalogue::new(vec![
            Primitive::Constant,
            Primitive::product(),
            Primitive::Square,
        ])
        .unwrap();
        let out = catalogue.apply_row(&[9.0_f64, 2.0, 3.0, -4.0]);
        assert_eq!(out, vec![1.0, 6.0, 16.0]);
    }

    #[test]
    fn empty_catalogue_is_rejected() {
        assert!(Catalogue::new(Vec::new()).is_err());
        assert!(Catalogue::new(vec![Primitive::Product { norm: 0.0 }]).is_err());
    }

    #[test]
    fn partials_match_closed_forms() {
        let (v, da, _) = Primitive::Square.partials(3.0, 0.0);
        assert_eq!((v, da), (9.0, 6.0));

        let (v, da, _) = Primitive::Sigmoid.partials(0.0, 0.0);
        assert!((v - 0.5).abs() < 1e-15);
        assert!((da - 0.25).abs() < 1e-15);

        let (_, da, db) = Primitive::Product { norm: 2.0 }.partials(3.0, 5.0);
        assert!((da - 2.5).abs() < 1e-15);
        assert!((db - 1.5).abs() < 1e-15);

        let (v, da, db) = Primitive::Constant.partials(7.0, 1.0);
        assert_eq!((v, da, db), (1.0, 0.0, 0.0));
    }

    #[test]
    fn saturated_sigmoid_has_finite_partials() {
        for (a, expected) in [(-800.0, 0.0), (800.0, 1.0)] {
            let (value, da, db) = Primitive::Sigmoid.partials(a, 0.0);
            assert_eq!(value, expected);
            assert_eq!(da, 0.0, "slope at {a}");
            assert_eq!(db, 0.0);
        }
        let (_, da, _) = Primitive::Sigmoid.partials(-3.0, 0.0);
        let s = 1.0 / (1.0 + 3.0_f64.exp());
        assert!((da - s * (1.0 - s)).abs() < 1e-15);
    }

    #[test]
    fn format_templates() {
        assert_eq!(Primitive::Square.format("x", ""), "(x)^2");
        assert_eq!(Primitive::product().format("x", "y"), "(x)*(y)");
        assert_eq!(Primitive::Constant.format("x", ""), "1");
    }

    #[test]
    fn catalogue_serializes_by_kind() {
        let catalogue = Catalogue::new(vec![Primitive::Sin, Primitive::product()]).unwrap();
        let json = serde_json::to_string(&catalogue).unwrap();
        assert_eq!(json, r#"[{"kind":"sin"},{"kind":"product","norm":1.0}]"#);
        let back: Catalogue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, catalogue);
    }
}
