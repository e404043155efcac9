//! Unit scale and the enumerated vocabulary shared by every pipeline.

use crate::amount::Amount;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Denomination of a stored amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Unit {
    /// One ten-thousandth of the currency; the engine's base unit.
    #[default]
    HundredthCent,
    WholeCent,
    WholeCurrency,
}

impl Unit {
    /// The unit every computation is carried out in.
    pub const BASE: Unit = Unit::HundredthCent;

    /// Number of base units in one of this unit.
    pub fn multiplier(self) -> i64 {
        match self {
            Unit::HundredthCent => 1,
            Unit::WholeCent => 100,
            Unit::WholeCurrency => 10_000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Unit::HundredthCent => "HUNDREDTH_CENT",
            Unit::WholeCent => "WHOLE_CENT",
            Unit::WholeCurrency => "WHOLE_CURRENCY",
        }
    }

    /// Re-expresses `amount` (given in `self`) in `target`.
    ///
    /// Converting to a coarser unit must divide evenly.
    pub fn convert(self, amount: Amount, target: Unit) -> Result<Amount> {
        let in_base = amount.checked_mul(self.multiplier())?;
        let divisor = target.multiplier();
        if in_base.value() % divisor != 0 {
            return Err(EngineError::UnitConversion {
                amount: amount.value(),
                from: self.to_string(),
                to: target.to_string(),
            });
        }
        Ok(Amount::new(in_base.value() / divisor))
    }

    /// Shorthand for converting into [`Unit::BASE`].
    pub fn to_base(self, amount: Amount) -> Result<Amount> {
        self.convert(amount, Unit::BASE)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a ledger row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Accrual,
    Allocation,
    Deposit,
    Withdrawal,
    Capitalization,
}

/// The kind of entity an amount is allocated to or derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    FloatItself,
    BonusPool,
    CompanyShare,
    EndUserAccount,
    AccrualEvent,
    CapitalizationEvent,
    AdminInstruction,
}

impl EntityType {
    /// Bonus pool and company share are tracked as pseudo-accounts on the float.
    pub fn is_bonus_or_company(self) -> bool {
        matches!(self, EntityType::BonusPool | EntityType::CompanyShare)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::FloatItself => "FLOAT_ITSELF",
            EntityType::BonusPool => "BONUS_POOL",
            EntityType::CompanyShare => "COMPANY_SHARE",
            EntityType::EndUserAccount => "END_USER_ACCOUNT",
            EntityType::AccrualEvent => "ACCRUAL_EVENT",
            EntityType::CapitalizationEvent => "CAPITALIZATION_EVENT",
            EntityType::AdminInstruction => "ADMIN_INSTRUCTION",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a float ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Pending,
    #[default]
    Settled,
    Superceded,
}

/// Lifecycle of the account-side mirror of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    #[default]
    Accrued,
    Settled,
    Superceded,
}

/// Grouping of the rows written by one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    WholeFloatAccrual,
    CapitalizationEvent,
    AdminBalanceRecon,
}
