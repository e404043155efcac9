//! Allocate an amount across every end-user account on a float.
//!
//! Each account receives a share proportional to its prior tracked balance.
//! The rounding excess either goes to a nominated bonus pool or stays
//! unallocated in the float.

use crate::amount::Amount;
use crate::apportion::apportion;
use crate::engine::FloatEngine;
use crate::error::{EngineError, Result};
use crate::fingerprint::Fingerprint;
use crate::ledger::{EntityAllocation, UserAllocation, UserAllocationIds};
use crate::units::{EntityType, SettlementStatus, TransactionState, TransactionType, Unit};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label on the ledger row that routes a rounding excess to the bonus pool.
pub const BONUS_EXCESS: &str = "BONUS_EXCESS";

fn default_transaction_type() -> TransactionType {
    TransactionType::Accrual
}

/// Request to spread `total_amount` over all accounts of a float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequest {
    pub client_id: String,
    pub float_id: String,
    pub currency: String,
    #[serde(default)]
    pub unit: Unit,
    pub total_amount: Amount,
    #[serde(default = "default_transaction_type")]
    pub transaction_type: TransactionType,
    #[serde(default)]
    pub transaction_state: TransactionState,
    #[serde(default)]
    pub settlement_status: SettlementStatus,
    #[serde(default)]
    pub backing_entity_type: Option<EntityType>,
    #[serde(default)]
    pub backing_entity_identifier: Option<String>,
    /// Bonus pool that absorbs the rounding excess, if any.
    #[serde(default)]
    pub bonus_pool_id_for_excess: Option<String>,
    #[serde(default)]
    pub log_id: Option<String>,
}

impl AllocationRequest {
    fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() || self.float_id.is_empty() {
            return Err(EngineError::InvalidRequest(
                "allocation needs a client id and float id".to_string(),
            ));
        }
        if self.currency.is_empty() {
            return Err(EngineError::InvalidRequest(
                "allocation needs a currency".to_string(),
            ));
        }
        self.unit.to_base(self.total_amount)?;
        Ok(())
    }
}

/// Excess amount routed to the bonus pool and the row that recorded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BonusExcess {
    pub amount: Amount,
    pub transaction_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    pub float_tx_ids: Vec<String>,
    pub account_tx_ids: Vec<String>,
    pub bonus_excess: Option<BonusExcess>,
}

impl FloatEngine {
    /// Allocates across all accounts, at most once per identical request.
    pub async fn allocate(&self, request: AllocationRequest) -> Result<AllocationResult> {
        request.validate()?;
        let fingerprint = Fingerprint::of("allocation", &request)?;
        self.guard
            .run(&fingerprint, self.allocate_to_all_users(&request))
            .await
    }

    /// Unguarded allocation, for pipelines that already hold a guard.
    pub(crate) async fn allocate_to_all_users(&self, request: &AllocationRequest) -> Result<AllocationResult> {
        let weights = self
            .ledger
            .accounts_with_prior_allocations(&request.float_id, &request.currency, EntityType::EndUserAccount)
            .await?;
        self.distribute(request, &weights).await
    }

    /// Apportions the request's amount over `weights` and persists the rows.
    pub(crate) async fn distribute(
        &self,
        request: &AllocationRequest,
        weights: &BTreeMap<String, Amount>,
    ) -> Result<AllocationResult> {
        let amount = request.unit.to_base(request.total_amount)?;
        let apportionment = apportion(amount, weights)?;
        debug!(
            "Allocating {} over {} accounts on float {}, excess {}",
            amount,
            weights.len(),
            request.float_id,
            apportionment.excess
        );

        let user_rows: Vec<UserAllocation> = apportionment
            .shares
            .iter()
            .filter(|(_, share)| !share.is_zero())
            .map(|(account_id, share)| UserAllocation {
                account_id: account_id.clone(),
                amount: *share,
                currency: request.currency.clone(),
                unit: Unit::BASE,
                transaction_type: request.transaction_type,
                transaction_state: request.transaction_state,
                settlement_status: request.settlement_status,
                related_entity_type: request.backing_entity_type,
                related_entity_id: request.backing_entity_identifier.clone(),
                log_id: request.log_id.clone(),
            })
            .collect();

        let ids = if user_rows.is_empty() {
            UserAllocationIds::default()
        } else {
            self.ledger
                .allocate_to_users(&request.client_id, &request.float_id, user_rows)
                .await?
        };

        let bonus_excess = if apportionment.excess.is_zero() {
            None
        } else {
            match &request.bonus_pool_id_for_excess {
                Some(bonus_pool_id) => {
                    Some(self.allocate_excess(request, bonus_pool_id, apportionment.excess).await?)
                }
                None => {
                    warn!(
                        "Excess of {} left unallocated in float {}",
                        apportionment.excess, request.float_id
                    );
                    None
                }
            }
        };

        info!(
            "Allocated {} to {} accounts on float {}",
            apportionment.apportioned(),
            ids.account_tx_ids.len(),
            request.float_id
        );
        Ok(AllocationResult {
            float_tx_ids: ids.float_tx_ids,
            account_tx_ids: ids.account_tx_ids,
            bonus_excess,
        })
    }

    async fn allocate_excess(
        &self,
        request: &AllocationRequest,
        bonus_pool_id: &str,
        excess: Amount,
    ) -> Result<BonusExcess> {
        let row = EntityAllocation {
            label: Some(BONUS_EXCESS.to_string()),
            amount: excess,
            currency: request.currency.clone(),
            unit: Unit::BASE,
            transaction_type: request.transaction_type,
            transaction_state: request.transaction_state,
            allocated_to_type: EntityType::BonusPool,
            allocated_to_id: bonus_pool_id.to_string(),
            related_entity_type: request.backing_entity_type,
            related_entity_id: request.backing_entity_identifier.clone(),
            log_id: request.log_id.clone(),
        };
        let written = self
            .ledger
            .allocate_float(&request.client_id, &request.float_id, vec![row])
            .await?;
        let transaction_id = written
            .into_iter()
            .next()
            .map(|tx| tx.transaction_id)
            .ok_or_else(|| EngineError::Persistence("bonus excess insert returned no id".to_string()))?;
        Ok(BonusExcess {
            amount: excess,
            transaction_id,
        })
    }
}
