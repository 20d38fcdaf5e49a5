//! The pyramiding ladder: ordered phases and the price/share targets they imply.

use std::collections::HashSet;

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Position of a phase in the ladder. Holdings are ordered by this, never by name.
pub type PhaseIndex = usize;

/// One rung of the pyramid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyramidPhase {
    pub name: String,

    /// Shares of the next phase relative to this one
    pub shares_incremental_ratio: Decimal,

    /// Entry price of the next phase relative to this one
    pub price_incremental_ratio: Decimal,

    /// Stop-loss price relative to this phase's entry price
    pub cut_loss_ratio: Decimal,
}

impl PyramidPhase {
    fn new(name: &str, shares: Decimal, price: Decimal, cut_loss: Decimal) -> Self {
        Self {
            name: name.to_string(),
            shares_incremental_ratio: shares,
            price_incremental_ratio: price,
            cut_loss_ratio: cut_loss,
        }
    }
}

/// Entry price, size and stop-loss of one phase for the current trading cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseTarget {
    pub price: Decimal,
    pub shares: Decimal,
    pub stop_loss_price: Decimal,
}

/// Ordered table of pyramiding phases. Only built through `standard` or the validating `new`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PyramidModel {
    phases: Vec<PyramidPhase>,
}

impl PyramidModel {
    /// BASE, PYRAMIDING_1, PYRAMIDING_2.
    ///
    /// The last phase has nothing after it, so its incremental ratios are zero.
    pub fn standard() -> Self {
        Self {
            phases: vec![
                PyramidPhase::new("BASE", dec!(3) / dec!(5), dec!(1.02), dec!(0.92)),
                PyramidPhase::new(
                    "PYRAMIDING_1",
                    dec!(2) / dec!(3),
                    dec!(1.05) / dec!(1.02),
                    dec!(0.99),
                ),
                PyramidPhase::new("PYRAMIDING_2", Decimal::ZERO, Decimal::ZERO, dec!(0.99)),
            ],
        }
    }

    /// Build a custom ladder. An invalid table is a configuration error.
    pub fn new(phases: Vec<PyramidPhase>) -> Result<Self> {
        if phases.is_empty() {
            bail!("pyramid model needs at least one phase");
        }

        let mut seen = HashSet::new();
        for phase in &phases {
            if phase.name.is_empty() {
                bail!("pyramid phase name must not be empty");
            }
            if !seen.insert(phase.name.as_str()) {
                bail!("duplicate pyramid phase {}", phase.name);
            }
            if phase.shares_incremental_ratio < Decimal::ZERO
                || phase.price_incremental_ratio < Decimal::ZERO
            {
                bail!("phase {} has a negative incremental ratio", phase.name);
            }
            if phase.cut_loss_ratio <= Decimal::ZERO || phase.cut_loss_ratio > Decimal::ONE {
                bail!(
                    "phase {} cut-loss ratio {} must be in (0, 1]",
                    phase.name,
                    phase.cut_loss_ratio
                );
            }
        }

        Ok(Self { phases })
    }

    pub fn phases(&self) -> &[PyramidPhase] {
        &self.phases
    }

    pub fn last_index(&self) -> PhaseIndex {
        self.phases.len() - 1
    }

    pub fn name_of(&self, index: PhaseIndex) -> Option<&str> {
        self.phases.get(index).map(|p| p.name.as_str())
    }

    /// Look up a phase by name. `None` means the name is not part of this model.
    pub fn index_of(&self, name: &str) -> Option<PhaseIndex> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// Targets of every phase for a pyramid opened at `base_price` with `base_shares`.
    ///
    /// `None` when a target does not fit in a `Decimal`.
    pub fn phase_targets(&self, base_price: Decimal, base_shares: Decimal) -> Option<Vec<PhaseTarget>> {
        let mut targets: Vec<PhaseTarget> = Vec::with_capacity(self.phases.len());

        for (i, phase) in self.phases.iter().enumerate() {
            let (price, shares) = match targets.last() {
                None => (base_price, base_shares),
                Some(prev) => {
                    let prev_phase = &self.phases[i - 1];
                    (
                        prev.price.checked_mul(prev_phase.price_incremental_ratio)?,
                        prev.shares.checked_mul(prev_phase.shares_incremental_ratio)?,
                    )
                }
            };

            targets.push(PhaseTarget {
                price,
                shares,
                stop_loss_price: price.checked_mul(phase.cut_loss_ratio)?,
            });
        }

        Some(targets)
    }
}

impl Default for PyramidModel {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_model_order() {
        let model = PyramidModel::standard();
        assert_eq!(model.phases().len(), 3);
        assert_eq!(model.index_of("BASE"), Some(0));
        assert_eq!(model.index_of("PYRAMIDING_1"), Some(1));
        assert_eq!(model.index_of("PYRAMIDING_2"), Some(2));
        assert_eq!(model.index_of("PYRAMIDING_3"), None);
        assert_eq!(model.last_index(), 2);
    }

    #[test]
    fn test_phase_targets() {
        let model = PyramidModel::standard();
        let targets = model.phase_targets(dec!(100), dec!(10)).unwrap();

        assert_eq!(targets[0].price, dec!(100));
        assert_eq!(targets[0].shares, dec!(10));
        assert_eq!(targets[0].stop_loss_price, dec!(92));

        assert_eq!(targets[1].price, dec!(102));
        assert_eq!(targets[1].shares, dec!(6));
        assert_eq!(targets[1].stop_loss_price, dec!(100.98));

        // 102 * (1.05 / 1.02) is 105 up to Decimal rounding
        assert!((targets[2].price - dec!(105)).abs() < dec!(0.000001));
        assert_eq!(targets[2].shares.round_dp(6), dec!(4));
        assert_eq!(
            targets[2].stop_loss_price,
            targets[2].price * dec!(0.99)
        );
    }

    #[test]
    fn test_invalid_models_rejected() {
        assert!(PyramidModel::new(vec![]).is_err());

        let dup = vec![
            PyramidPhase::new("BASE", dec!(0.5), dec!(1.1), dec!(0.9)),
            PyramidPhase::new("BASE", dec!(0), dec!(0), dec!(0.9)),
        ];
        assert!(PyramidModel::new(dup).is_err());

        let bad_cut = vec![PyramidPhase::new("BASE", dec!(0), dec!(0), dec!(1.5))];
        assert!(PyramidModel::new(bad_cut).is_err());

        let negative = vec![PyramidPhase::new("BASE", dec!(-1), dec!(1.1), dec!(0.9))];
        assert!(PyramidModel::new(negative).is_err());

        let ok = vec![PyramidPhase::new("ONLY", dec!(0), dec!(0), dec!(0.9))];
        assert_eq!(PyramidModel::new(ok).unwrap().last_index(), 0);
    }

    #[test]
    fn test_ladder_out_of_range() {
        let model = PyramidModel::standard();

        // Fits as a base price, but the next phase does not
        assert!(model
            .phase_targets(dec!(78000000000000000000000000000), dec!(1))
            .is_none());
        assert!(model
            .phase_targets(dec!(70000000000000000000000000000), dec!(1))
            .is_some());
    }
}
