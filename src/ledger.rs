//! Ledger records and the store interface the pipelines write through.
//!
//! The store is append-only. Pipelines never edit an amount; the only
//! mutation is moving accrual rows from `SETTLED` to `SUPERCEDED` when a
//! capitalization settles them.

use crate::amount::Amount;
use crate::error::Result;
use crate::units::{EntityType, LogType, SettlementStatus, TransactionState, TransactionType, Unit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One row of the float ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub transaction_id: String,
    pub client_id: String,
    pub float_id: String,
    pub transaction_type: TransactionType,
    pub transaction_state: TransactionState,
    pub currency: String,
    pub unit: Unit,
    /// Signed amount in `unit`.
    pub amount: Amount,
    pub allocated_to_type: EntityType,
    pub allocated_to_id: String,
    pub related_entity_type: Option<EntityType>,
    pub related_entity_id: Option<String>,
    pub log_id: Option<String>,
    pub creation_time: DateTime<Utc>,
}

/// Groups the rows written by one logical operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLog {
    pub log_id: String,
    pub client_id: String,
    pub float_id: String,
    pub log_type: LogType,
    pub reference_time: DateTime<Utc>,
    pub creation_time: DateTime<Utc>,
}

/// User-facing mirror of a ledger row allocated to an end-user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEntry {
    pub transaction_id: String,
    pub account_id: String,
    pub client_id: String,
    pub float_id: String,
    pub transaction_type: TransactionType,
    pub settlement_status: SettlementStatus,
    pub amount: Amount,
    pub currency: String,
    pub unit: Unit,
    /// Transaction id of the float-side row this mirrors.
    pub float_tx_id: String,
    /// `<relatedEntityType>::<relatedEntityId>` references.
    pub tags: Vec<String>,
    pub log_id: Option<String>,
    pub creation_time: DateTime<Utc>,
    pub settlement_time: Option<DateTime<Utc>>,
}

/// Request to change the float's own balance.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatAdjustment {
    pub client_id: String,
    pub float_id: String,
    pub transaction_type: TransactionType,
    pub amount: Amount,
    pub currency: String,
    pub unit: Unit,
    pub backing_entity_type: Option<EntityType>,
    pub backing_entity_id: Option<String>,
    /// When set, a new operation log of this type is opened for the adjustment.
    pub log_type: Option<LogType>,
    pub reference_time: Option<DateTime<Utc>>,
}

/// Result of [`LedgerStore::add_or_subtract_float`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloatAdjustmentResult {
    pub transaction_id: String,
    pub log_id: Option<String>,
    /// Balance after the adjustment, in the base unit.
    pub updated_balance: Amount,
    pub unit: Unit,
}

/// Allocation to a non-user entity (bonus pool, company share).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityAllocation {
    /// Caller-side name used to find the resulting transaction id.
    pub label: Option<String>,
    pub amount: Amount,
    pub currency: String,
    pub unit: Unit,
    pub transaction_type: TransactionType,
    pub transaction_state: TransactionState,
    pub allocated_to_type: EntityType,
    pub allocated_to_id: String,
    pub related_entity_type: Option<EntityType>,
    pub related_entity_id: Option<String>,
    pub log_id: Option<String>,
}

/// Transaction id assigned to one [`EntityAllocation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelledTransaction {
    pub label: Option<String>,
    pub transaction_id: String,
}

/// Allocation to an end-user account, written to both ledgers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAllocation {
    pub account_id: String,
    pub amount: Amount,
    pub currency: String,
    pub unit: Unit,
    pub transaction_type: TransactionType,
    pub transaction_state: TransactionState,
    pub settlement_status: SettlementStatus,
    pub related_entity_type: Option<EntityType>,
    pub related_entity_id: Option<String>,
    pub log_id: Option<String>,
}

/// Transaction ids produced by [`LedgerStore::allocate_to_users`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAllocationIds {
    pub float_tx_ids: Vec<String>,
    pub account_tx_ids: Vec<String>,
}

/// Float balance in the base unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloatBalance {
    pub balance: Amount,
    pub unit: Unit,
}

/// Creation-time window `start < t <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        time > self.start && time <= self.end
    }
}

/// Accrued-but-unsettled total for one entity over a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccrualSummary {
    pub entity_id: String,
    pub entity_type: EntityType,
    /// Sum of accrual rows in the period, in the base unit.
    pub amount_accrued: Amount,
    /// Settled non-accrual balance before the period, in the base unit.
    pub prior_settled_balance: Amount,
    pub human_ref: Option<String>,
}

/// The relational ledger store.
///
/// Every batch call must be atomic at the store level: either all rows of
/// the batch commit or none do. Sums are returned in [`Unit::BASE`] and
/// exclude superseded rows.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Appends one balance-changing row allocated to the float itself.
    async fn add_or_subtract_float(&self, request: FloatAdjustment) -> Result<FloatAdjustmentResult>;

    /// Batch-inserts allocations to non-user entities.
    async fn allocate_float(
        &self,
        client_id: &str,
        float_id: &str,
        allocations: Vec<EntityAllocation>,
    ) -> Result<Vec<LabelledTransaction>>;

    /// Batch-inserts paired float and account rows for end-user allocations.
    async fn allocate_to_users(
        &self,
        client_id: &str,
        float_id: &str,
        allocations: Vec<UserAllocation>,
    ) -> Result<UserAllocationIds>;

    /// Sums the float's own rows, optionally within a period.
    async fn calculate_float_balance(
        &self,
        float_id: &str,
        currency: &str,
        period: Option<Period>,
    ) -> Result<FloatBalance>;

    /// Sums prior allocations to each of the given entity ids.
    ///
    /// Every requested id is present in the result, zero if it has no rows.
    async fn prior_allocation_balances(
        &self,
        client_id: &str,
        float_id: &str,
        currency: &str,
        entity_ids: &[String],
    ) -> Result<HashMap<String, Amount>>;

    /// Sums prior allocations to every open account of `entity_type` on the float.
    async fn accounts_with_prior_allocations(
        &self,
        float_id: &str,
        currency: &str,
        entity_type: EntityType,
    ) -> Result<BTreeMap<String, Amount>>;

    /// Most recent log of `log_type` referenced at or before `before`.
    async fn fetch_last_log(
        &self,
        client_id: &str,
        float_id: &str,
        log_type: LogType,
        before: DateTime<Utc>,
    ) -> Result<Option<OperationLog>>;

    /// Accrual totals in the period, grouped by allocated entity.
    async fn fetch_accruals_in_period(
        &self,
        client_id: &str,
        float_id: &str,
        currency: &str,
        period: Period,
    ) -> Result<Vec<AccrualSummary>>;

    /// Marks every accrual row in the period, and its account mirror, superseded.
    ///
    /// Returns the number of float ledger rows transitioned.
    async fn supercede_accruals(&self, client_id: &str, float_id: &str, period: Period) -> Result<usize>;

    /// Every ledger row written under `log_id`.
    async fn fetch_records_for_log(&self, log_id: &str) -> Result<Vec<LedgerEntry>>;
}
