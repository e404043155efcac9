//! Proportional division of an integer amount across weighted entities.
//!
//! Each entity's share is its weight relative to the sum of all weights,
//! not relative to the amount being divided. Shares are rounded half-up
//! individually, so the rounded shares rarely sum to the amount; whatever is
//! left (positive or negative) comes back as `excess` for the caller to
//! route. Nothing is ever silently dropped.

use crate::amount::{round_half_up, Amount};
use crate::error::{EngineError, Result};
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;

/// Outcome of [`apportion`].
///
/// # Invariants
///
/// - `shares.values().sum() + excess == amount` for the amount divided
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Apportionment {
    /// Share per entity id, in the same key order as the weights.
    pub shares: BTreeMap<String, Amount>,

    /// Rounding remainder: `amount - sum(shares)`.
    pub excess: Amount,
}

impl Apportionment {
    /// Sum of every share, excluding the excess.
    pub fn apportioned(&self) -> Amount {
        self.shares.values().sum()
    }
}

/// Divides `amount` across `weights` in proportion to each weight.
///
/// An empty weight map (or one whose weights sum to zero) leaves the whole
/// amount as excess. Negative weights are rejected.
pub fn apportion(amount: Amount, weights: &BTreeMap<String, Amount>) -> Result<Apportionment> {
    for (entity_id, weight) in weights {
        if weight.is_negative() {
            return Err(EngineError::NegativeWeight {
                entity_id: entity_id.clone(),
                weight: weight.value(),
            });
        }
    }

    let total_weight = weights
        .values()
        .try_fold(Amount::ZERO, |acc, weight| acc.checked_add(*weight))?;
    if total_weight.is_zero() {
        debug!(
            "Nothing to weigh {} against across {} entities, all excess",
            amount,
            weights.len()
        );
        return Ok(Apportionment {
            shares: weights.keys().map(|id| (id.clone(), Amount::ZERO)).collect(),
            excess: amount,
        });
    }

    let to_share = amount.to_decimal();
    let divisor = total_weight.to_decimal();

    let mut shares = BTreeMap::new();
    for (entity_id, weight) in weights {
        let scaled = to_share
            .checked_mul(weight.to_decimal())
            .and_then(|product| product.checked_div(divisor))
            .ok_or(EngineError::Overflow {
                context: "apportionment",
            })?;
        shares.insert(entity_id.clone(), round_half_up(scaled)?);
    }

    let apportioned: Amount = shares.values().sum();
    let excess = amount - apportioned;

    debug!(
        "Finished apportioning, handed {} to divide, divided up {}, left with {} excess",
        amount, apportioned, excess
    );

    Ok(Apportionment { shares, excess })
}
