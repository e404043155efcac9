//! Accrual pipeline: book one interest event against a float and spread it.
//!
//! The split happens in three layers. First the bonus pool and client
//! company take their configured fees off the top. Then they take a share of
//! what is left in proportion to their existing stake in the float. The
//! remainder is apportioned over end-user accounts by prior balance, and the
//! rounding excess of that last step goes to the bonus pool, so the whole
//! accrual is always accounted for.

use crate::allocation::{AllocationRequest, BONUS_EXCESS};
use crate::amount::{calculate_share, proportional_share, Amount};
use crate::archive::AuditRow;
use crate::config::FloatConfig;
use crate::engine::FloatEngine;
use crate::error::{EngineError, Result};
use crate::fingerprint::Fingerprint;
use crate::ledger::{EntityAllocation, FloatAdjustment, UserAllocationIds};
use crate::units::{EntityType, LogType, SettlementStatus, TransactionState, TransactionType, Unit};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const BONUS_FEE: &str = "BONUS_FEE";
pub const CLIENT_FEE: &str = "CLIENT_FEE";
pub const BONUS_SHARE: &str = "BONUS_SHARE";
pub const CLIENT_SHARE: &str = "CLIENT_SHARE";

/// One interest event on a float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccrualRequest {
    pub client_id: String,
    pub float_id: String,
    pub accrual_amount: Amount,
    /// Defaults to the float's configured currency.
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub unit: Unit,
    #[serde(default)]
    pub reference_time: Option<DateTime<Utc>>,
    /// Upstream identifier of the event; one effective accrual per value.
    pub backing_entity_identifier: String,
}

impl AccrualRequest {
    /// Checks the request and returns the accrual in the base unit.
    fn validate(&self) -> Result<Amount> {
        if self.client_id.is_empty() || self.float_id.is_empty() {
            return Err(EngineError::InvalidRequest(
                "accrual needs a client id and float id".to_string(),
            ));
        }
        if self.backing_entity_identifier.is_empty() {
            return Err(EngineError::InvalidRequest(
                "accrual needs a backing entity identifier".to_string(),
            ));
        }
        self.unit.to_base(self.accrual_amount)
    }
}

/// How an accrual divides before the per-account step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccrualSplit {
    pub bonus_fee: Amount,
    pub client_fee: Amount,
    pub bonus_share: Amount,
    pub client_share: Amount,
    /// What is left for end-user accounts.
    pub remaining: Amount,
}

/// Computes fees and prior-stake shares for an accrual of `amount`.
///
/// `prior_float_balance` is the float balance before this accrual;
/// `bonus_prior` and `client_prior` are the entities' tracked balances.
pub fn split_accrual(
    amount: Amount,
    config: &FloatConfig,
    prior_float_balance: Amount,
    bonus_prior: Amount,
    client_prior: Amount,
) -> Result<AccrualSplit> {
    let bonus_fee = calculate_share(amount.to_decimal(), config.bonus_pool_share, true)?;
    let client_fee = calculate_share(amount.to_decimal(), config.client_co_share, true)?;
    let gross = amount - bonus_fee - client_fee;

    let bonus_share = proportional_share(gross, bonus_prior, prior_float_balance)?;
    let client_share = proportional_share(gross, client_prior, prior_float_balance)?;

    let remaining = amount - bonus_fee - client_fee - bonus_share - client_share;
    debug!(
        "Accrual {} split: fees {}/{}, shares {}/{}, remaining {}",
        amount, bonus_fee, client_fee, bonus_share, client_share, remaining
    );
    Ok(AccrualSplit {
        bonus_fee,
        client_fee,
        bonus_share,
        client_share,
        remaining,
    })
}

/// Amount and row written for one non-user allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRecord {
    pub amount: Amount,
    pub transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccrualResult {
    /// Float balance after the accrual, in the base unit.
    pub new_balance: Amount,
    /// Keyed by `BONUS_FEE`, `CLIENT_FEE`, `BONUS_SHARE`, `CLIENT_SHARE`
    /// and, when there was one, `BONUS_EXCESS`.
    pub entity_allocations: BTreeMap<String, AllocationRecord>,
    pub user_allocation_transactions: UserAllocationIds,
    /// Where the audit CSV went; absent when export is off or failed.
    pub audit_location: Option<String>,
}

impl FloatEngine {
    /// Books an accrual, at most once per backing entity identifier.
    pub async fn accrue(&self, request: AccrualRequest) -> Result<AccrualResult> {
        let amount = request.validate()?;
        let fingerprint = Fingerprint::of(
            "accrual",
            &[
                &request.client_id,
                &request.float_id,
                &request.backing_entity_identifier,
            ],
        )?;
        self.guard
            .run(&fingerprint, self.run_accrual(&request, amount))
            .await
    }

    async fn run_accrual(&self, request: &AccrualRequest, amount: Amount) -> Result<AccrualResult> {
        let config = self
            .config
            .fetch_float_config(&request.client_id, &request.float_id)
            .await?;
        let currency = request
            .currency
            .clone()
            .unwrap_or_else(|| config.currency.clone());

        let trackers = [
            config.bonus_pool_tracker.clone(),
            config.client_co_share_tracker.clone(),
        ];
        let (balance, priors, weights) = tokio::join!(
            self.ledger
                .calculate_float_balance(&request.float_id, &currency, None),
            self.ledger.prior_allocation_balances(
                &request.client_id,
                &request.float_id,
                &currency,
                &trackers,
            ),
            self.ledger.accounts_with_prior_allocations(
                &request.float_id,
                &currency,
                EntityType::EndUserAccount,
            ),
        );
        let prior_balance = balance?.balance;
        let priors = priors?;
        let weights = weights?;

        let bonus_prior = priors
            .get(&config.bonus_pool_tracker)
            .copied()
            .unwrap_or(Amount::ZERO);
        let client_prior = priors
            .get(&config.client_co_share_tracker)
            .copied()
            .unwrap_or(Amount::ZERO);

        let split = split_accrual(amount, &config, prior_balance, bonus_prior, client_prior)?;

        let adjustment = self
            .ledger
            .add_or_subtract_float(FloatAdjustment {
                client_id: request.client_id.clone(),
                float_id: request.float_id.clone(),
                transaction_type: TransactionType::Accrual,
                amount,
                currency: currency.clone(),
                unit: Unit::BASE,
                backing_entity_type: Some(EntityType::AccrualEvent),
                backing_entity_id: Some(request.backing_entity_identifier.clone()),
                log_type: Some(LogType::WholeFloatAccrual),
                reference_time: request.reference_time,
            })
            .await?;
        let log_id = adjustment.log_id.clone();

        let entity_row = |label: &str, amount: Amount, to_type: EntityType, to_id: &str| EntityAllocation {
            label: Some(label.to_string()),
            amount,
            currency: currency.clone(),
            unit: Unit::BASE,
            transaction_type: TransactionType::Accrual,
            transaction_state: TransactionState::Settled,
            allocated_to_type: to_type,
            allocated_to_id: to_id.to_string(),
            related_entity_type: Some(EntityType::AccrualEvent),
            related_entity_id: Some(request.backing_entity_identifier.clone()),
            log_id: log_id.clone(),
        };
        let rows = vec![
            entity_row(BONUS_FEE, split.bonus_fee, EntityType::BonusPool, &config.bonus_pool_tracker),
            entity_row(CLIENT_FEE, split.client_fee, EntityType::CompanyShare, &config.client_co_share_tracker),
            entity_row(BONUS_SHARE, split.bonus_share, EntityType::BonusPool, &config.bonus_pool_tracker),
            entity_row(CLIENT_SHARE, split.client_share, EntityType::CompanyShare, &config.client_co_share_tracker),
        ];
        let amounts: HashMap<Option<String>, Amount> =
            rows.iter().map(|row| (row.label.clone(), row.amount)).collect();

        let written = self
            .ledger
            .allocate_float(&request.client_id, &request.float_id, rows)
            .await?;
        let mut entity_allocations = BTreeMap::new();
        for tx in written {
            let amount = amounts.get(&tx.label).copied().unwrap_or(Amount::ZERO);
            if let Some(label) = tx.label {
                entity_allocations.insert(
                    label,
                    AllocationRecord {
                        amount,
                        transaction_id: tx.transaction_id,
                    },
                );
            }
        }

        let users = self
            .distribute(
                &AllocationRequest {
                    client_id: request.client_id.clone(),
                    float_id: request.float_id.clone(),
                    currency: currency.clone(),
                    unit: Unit::BASE,
                    total_amount: split.remaining,
                    transaction_type: TransactionType::Accrual,
                    transaction_state: TransactionState::Settled,
                    settlement_status: SettlementStatus::Accrued,
                    backing_entity_type: Some(EntityType::AccrualEvent),
                    backing_entity_identifier: Some(request.backing_entity_identifier.clone()),
                    bonus_pool_id_for_excess: Some(config.bonus_pool_tracker.clone()),
                    log_id: log_id.clone(),
                },
                &weights,
            )
            .await?;
        if let Some(excess) = users.bonus_excess {
            entity_allocations.insert(
                BONUS_EXCESS.to_string(),
                AllocationRecord {
                    amount: excess.amount,
                    transaction_id: excess.transaction_id,
                },
            );
        }

        let audit_location = match &log_id {
            Some(log_id) => {
                let mut prior_balances: HashMap<String, Amount> = weights.into_iter().collect();
                prior_balances.insert(config.bonus_pool_tracker.clone(), bonus_prior);
                prior_balances.insert(config.client_co_share_tracker.clone(), client_prior);
                prior_balances.insert(request.float_id.clone(), prior_balance);
                self.export_audit(log_id, "accrual", &prior_balances).await
            }
            None => None,
        };

        info!(
            "Accrued {} on float {} for {}, new balance {}",
            amount, request.float_id, request.backing_entity_identifier, adjustment.updated_balance
        );
        Ok(AccrualResult {
            new_balance: adjustment.updated_balance,
            entity_allocations,
            user_allocation_transactions: UserAllocationIds {
                float_tx_ids: users.float_tx_ids,
                account_tx_ids: users.account_tx_ids,
            },
            audit_location,
        })
    }

    /// Exports every row under `log_id`, annotated with prior balances.
    ///
    /// Never fails the pipeline; problems are logged and yield `None`.
    pub(crate) async fn export_audit(
        &self,
        log_id: &str,
        name_prefix: &str,
        prior_balances: &HashMap<String, Amount>,
    ) -> Option<String> {
        let archive = self.archive.as_ref()?;
        let entries = match self.ledger.fetch_records_for_log(log_id).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not read rows for audit of log {}: {}", log_id, e);
                return None;
            }
        };

        let rows: Vec<AuditRow> = entries
            .into_iter()
            .map(|entry| {
                let prior = prior_balances.get(&entry.allocated_to_id).copied();
                AuditRow::from_entry(entry, prior)
            })
            .collect();
        archive
            .export(rows, log_id, name_prefix)
            .await
            .location()
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{float_config, memory_engine, memory_engine_with, CLIENT, FLOAT};
    use crate::ledger::LedgerStore;
    use crate::memory::{LedgerOp, MemoryLedger};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn seeded_ledger(ledger: &MemoryLedger) {
        let seed = |kind, id: &str, amount| {
            ledger.seed(
                CLIENT,
                FLOAT,
                TransactionType::Allocation,
                kind,
                id,
                Amount::new(amount),
                "ZAR",
                Unit::HundredthCent,
            )
        };
        seed(EntityType::FloatItself, FLOAT, 1_000);
        seed(EntityType::BonusPool, "bonus_pool", 10);
        seed(EntityType::CompanyShare, "client_share", 5);
        for (account, amount) in [("acc-1", 500), ("acc-2", 300), ("acc-3", 185)] {
            ledger.open_account(account, Some(account));
            seed(EntityType::EndUserAccount, account, amount);
        }
    }

    fn request(backing: &str, amount: i64) -> AccrualRequest {
        AccrualRequest {
            client_id: CLIENT.to_string(),
            float_id: FLOAT.to_string(),
            accrual_amount: Amount::new(amount),
            currency: Some("ZAR".to_string()),
            unit: Unit::HundredthCent,
            reference_time: None,
            backing_entity_identifier: backing.to_string(),
        }
    }

    fn accrued_total(ledger: &MemoryLedger) -> Amount {
        ledger
            .entries()
            .iter()
            .filter(|e| {
                e.transaction_type == TransactionType::Accrual
                    && e.allocated_to_type != EntityType::FloatItself
            })
            .map(|e| e.amount)
            .sum()
    }

    #[test]
    fn test_split_of_million_conserves() {
        let mut config = float_config();
        config.bonus_pool_share = Decimal::ONE / dec("7.25");
        config.client_co_share = dec("0.25") / dec("7.25");

        let amount = Amount::new(1_000_000);
        let split = split_accrual(amount, &config, Amount::new(1_000), Amount::new(10), Amount::new(5)).unwrap();

        assert_eq!(split.bonus_fee, Amount::new(137_931));
        assert_eq!(split.client_fee, Amount::new(34_483));
        assert_eq!(
            split.bonus_fee + split.client_fee + split.bonus_share + split.client_share + split.remaining,
            amount
        );
    }

    #[test]
    fn test_split_with_empty_float_takes_no_share() {
        let split = split_accrual(
            Amount::new(1_000),
            &float_config(),
            Amount::ZERO,
            Amount::ZERO,
            Amount::ZERO,
        )
        .unwrap();
        assert_eq!(split.bonus_share, Amount::ZERO);
        assert_eq!(split.client_share, Amount::ZERO);
    }

    #[test]
    fn test_prior_share_on_exact_half_rounds_up() {
        let mut config = float_config();
        config.bonus_pool_share = Decimal::ZERO;
        config.client_co_share = Decimal::ZERO;

        // bonus pool holds 5 of 6, so its share of 3 is exactly 2.5
        let split = split_accrual(Amount::new(3), &config, Amount::new(6), Amount::new(5), Amount::ZERO).unwrap();
        assert_eq!(split.bonus_share, Amount::new(3));
        assert_eq!(split.remaining, Amount::ZERO);
    }

    #[test]
    fn test_prior_stake_above_float_balance_rejected() {
        let result = split_accrual(
            Amount::new(100),
            &float_config(),
            Amount::new(10),
            Amount::new(11),
            Amount::ZERO,
        );
        assert!(matches!(result, Err(EngineError::ShareOutOfRange { .. })));
    }

    #[tokio::test]
    async fn test_million_accrual_fully_allocated() {
        let mut config = float_config();
        config.bonus_pool_share = Decimal::ONE / dec("7.25");
        config.client_co_share = dec("0.25") / dec("7.25");
        let (engine, ledger) = memory_engine_with(config);
        seeded_ledger(&ledger);

        let result = engine.accrue(request("interest-1", 1_000_000)).await.unwrap();

        assert_eq!(result.new_balance, Amount::new(1_001_000));
        assert_eq!(result.user_allocation_transactions.account_tx_ids.len(), 3);
        assert_eq!(accrued_total(&ledger), Amount::new(1_000_000));

        let entity_total: Amount = result.entity_allocations.values().map(|a| a.amount).sum();
        let user_total: Amount = ledger.account_entries().iter().map(|a| a.amount).sum();
        assert_eq!(entity_total + user_total, Amount::new(1_000_000));
    }

    #[tokio::test]
    async fn test_duplicate_accruals_write_once() {
        let (engine, ledger) = memory_engine();
        seeded_ledger(&ledger);

        let (first, second) = tokio::join!(
            engine.accrue(request("interest-2", 50_000)),
            engine.accrue(request("interest-2", 50_000))
        );
        assert_eq!(first.unwrap(), second.unwrap());

        let float_rows = ledger
            .entries()
            .into_iter()
            .filter(|e| {
                e.transaction_type == TransactionType::Accrual
                    && e.allocated_to_type == EntityType::FloatItself
            })
            .count();
        assert_eq!(float_rows, 1);
        assert_eq!(accrued_total(&ledger), Amount::new(50_000));
    }

    #[tokio::test]
    async fn test_account_mirrors_are_accrued_and_tagged() {
        let (engine, ledger) = memory_engine();
        seeded_ledger(&ledger);

        engine.accrue(request("interest-3", 10_000)).await.unwrap();

        for mirror in ledger.account_entries() {
            assert_eq!(mirror.settlement_status, SettlementStatus::Accrued);
            assert_eq!(mirror.tags, vec!["ACCRUAL_EVENT::interest-3".to_string()]);
            assert!(mirror.log_id.is_some());
        }
    }

    #[tokio::test]
    async fn test_missing_backing_identifier_rejected_before_writes() {
        let (engine, ledger) = memory_engine();
        let mut req = request("interest-4", 15);
        req.backing_entity_identifier.clear();

        assert!(matches!(
            engine.accrue(req).await,
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(ledger.entries().is_empty());
    }

    #[test]
    fn test_fractional_amount_rejected_at_parse() {
        let json = r#"{"clientId":"c","floatId":"f","accrualAmount":12.5,"backingEntityIdentifier":"b"}"#;
        assert!(serde_json::from_str::<AccrualRequest>(json).is_err());
    }

    #[tokio::test]
    async fn test_coarse_unit_converted_to_base() {
        let (engine, ledger) = memory_engine();
        seeded_ledger(&ledger);
        let mut req = request("interest-8", 3);
        req.unit = Unit::WholeCurrency;

        let result = engine.accrue(req).await.unwrap();
        assert_eq!(result.new_balance, Amount::new(31_000));
        assert_eq!(accrued_total(&ledger), Amount::new(30_000));
    }

    #[tokio::test]
    async fn test_unknown_float_is_rule_violation() {
        let (engine, ledger) = memory_engine();
        let mut req = request("interest-5", 100);
        req.float_id = "other_float".to_string();

        assert!(matches!(
            engine.accrue(req).await,
            Err(EngineError::FloatNotConfigured { .. })
        ));
        assert!(ledger.entries().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_releases_guard_for_retry() {
        let (engine, ledger) = memory_engine();
        seeded_ledger(&ledger);
        ledger.fail_on(LedgerOp::AllocateFloat);

        assert!(matches!(
            engine.accrue(request("interest-6", 1_000)).await,
            Err(EngineError::Persistence(_))
        ));

        ledger.clear_failures();
        let retried = engine.accrue(request("interest-6", 1_000)).await.unwrap();
        assert!(retried.entity_allocations.contains_key(BONUS_FEE));
    }

    #[tokio::test]
    async fn test_audit_export_includes_prior_balances() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, ledger) = memory_engine();
        let engine = engine.with_archive(std::sync::Arc::new(crate::archive::CsvArchive::new(dir.path())));
        seeded_ledger(&ledger);

        let result = engine.accrue(request("interest-7", 20_000)).await.unwrap();
        let location = result.audit_location.unwrap();
        let text = std::fs::read_to_string(location).unwrap();
        assert!(text.lines().next().unwrap().ends_with("prior_balance"));
        assert!(text.contains("acc-1"));

        let balances = ledger
            .prior_allocation_balances(CLIENT, FLOAT, "ZAR", &["acc-1".to_string()])
            .await
            .unwrap();
        assert!(balances["acc-1"] > Amount::new(500));
    }
}
