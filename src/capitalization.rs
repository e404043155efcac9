//! Capitalization: settle a period's accruals against the yield actually paid.
//!
//! Accruals are estimates. When the real yield for a period arrives, every
//! entity is credited its accrued amount plus a pro-rata cut of any surplus.
//! A shortfall is absorbed by the bonus pool, and any rounding residue lands
//! there too, so the credits always sum to the yield paid. Confirming then
//! supersedes the period's accrual rows so they are never counted again.

use crate::amount::{round_half_up, Amount};
use crate::engine::FloatEngine;
use crate::error::{EngineError, Result};
use crate::fingerprint::Fingerprint;
use crate::ledger::{AccrualSummary, EntityAllocation, FloatAdjustment, Period, UserAllocation};
use crate::units::{EntityType, LogType, SettlementStatus, TransactionState, TransactionType, Unit};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const PERMITTED_ROLES: [&str; 2] = ["ADMIN", "SYSTEM_ADMIN"];

/// Identity of whoever invoked an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caller {
    #[serde(default)]
    pub system_wide_user_id: Option<String>,
    pub role: String,
}

impl Caller {
    pub fn new(role: impl Into<String>) -> Self {
        Caller {
            system_wide_user_id: None,
            role: role.into(),
        }
    }

    fn require_admin(&self) -> Result<()> {
        if PERMITTED_ROLES.contains(&self.role.as_str()) {
            Ok(())
        } else {
            Err(EngineError::Unauthorized {
                role: self.role.clone(),
                operation: "capitalization",
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapitalizationRequest {
    pub client_id: String,
    pub float_id: String,
    pub date_time_paid: DateTime<Utc>,
    pub yield_paid: Amount,
    #[serde(default)]
    pub unit: Unit,
    pub currency: String,
}

impl CapitalizationRequest {
    fn validate(&self) -> Result<Amount> {
        if self.client_id.is_empty() || self.float_id.is_empty() || self.currency.is_empty() {
            return Err(EngineError::InvalidRequest(
                "capitalization needs a client id, float id and currency".to_string(),
            ));
        }
        self.unit.to_base(self.yield_paid)
    }
}

/// One entity's line in a capitalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditLine {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub human_ref: Option<String>,
    pub prior_settled_balance: Amount,
    pub amount_accrued: Amount,
    pub amount_to_credit: Amount,
}

/// Outcome of [`divide_capitalization`]. Lines are ordered by entity id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapitalizationDivision {
    pub lines: Vec<CreditLine>,
    pub total_accrued: Amount,
    /// `yield_paid - total_accrued`; negative on a shortfall.
    pub remainder: Amount,
}

impl CapitalizationDivision {
    fn credited(&self, entity_type: EntityType) -> Amount {
        self.lines
            .iter()
            .filter(|line| line.entity_type == entity_type)
            .map(|line| line.amount_to_credit)
            .sum()
    }
}

/// Divides `yield_paid` over the period's accruals.
///
/// The bonus pool and company share always get a line. Credits sum to
/// `yield_paid` exactly.
pub fn divide_capitalization(
    yield_paid: Amount,
    accrued: Vec<AccrualSummary>,
    bonus_pool_id: &str,
    company_share_id: &str,
) -> Result<CapitalizationDivision> {
    let mut by_entity: BTreeMap<String, AccrualSummary> = accrued
        .into_iter()
        .map(|summary| (summary.entity_id.clone(), summary))
        .collect();
    for (entity_id, entity_type) in [
        (bonus_pool_id, EntityType::BonusPool),
        (company_share_id, EntityType::CompanyShare),
    ] {
        by_entity
            .entry(entity_id.to_string())
            .or_insert_with(|| AccrualSummary {
                entity_id: entity_id.to_string(),
                entity_type,
                amount_accrued: Amount::ZERO,
                prior_settled_balance: Amount::ZERO,
                human_ref: None,
            });
    }

    let total_accrued: Amount = by_entity.values().map(|s| s.amount_accrued).sum();
    let remainder = yield_paid - total_accrued;

    let mut lines = Vec::with_capacity(by_entity.len());
    for summary in by_entity.into_values() {
        let mut amount_to_credit = summary.amount_accrued;
        if remainder > Amount::ZERO && !total_accrued.is_zero() {
            let cut = remainder
                .to_decimal()
                .checked_mul(summary.amount_accrued.to_decimal())
                .and_then(|product| product.checked_div(total_accrued.to_decimal()))
                .ok_or(EngineError::Overflow {
                    context: "capitalization share",
                })?;
            amount_to_credit += round_half_up(cut)?;
        }
        lines.push(CreditLine {
            entity_id: summary.entity_id,
            entity_type: summary.entity_type,
            human_ref: summary.human_ref,
            prior_settled_balance: summary.prior_settled_balance,
            amount_accrued: summary.amount_accrued,
            amount_to_credit,
        });
    }

    let credited: Amount = lines.iter().map(|line| line.amount_to_credit).sum();
    let residual = yield_paid - credited;
    if !residual.is_zero() {
        debug!("Capitalization residual {} goes to bonus pool {}", residual, bonus_pool_id);
        if let Some(bonus) = lines.iter_mut().find(|line| line.entity_id == bonus_pool_id) {
            bonus.amount_to_credit += residual;
        }
    }

    Ok(CapitalizationDivision {
        lines,
        total_accrued,
        remainder,
    })
}

/// One account row in a preview sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCredit {
    pub account_id: String,
    pub account_name: Option<String>,
    pub unit: Unit,
    pub currency: String,
    pub prior_balance: Amount,
    pub prior_accrued: Amount,
    pub amount_to_credit: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapitalizationSummary {
    pub number_accounts_to_be_credited: usize,
    pub amount_to_credit_client: Amount,
    pub amount_to_credit_bonus_pool: Amount,
    pub excess_over_past_accrual: Amount,
    pub unit: Unit,
    pub currency: String,
    pub sample_of_transactions: Vec<AccountCredit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapitalizationResult {
    #[serde(flatten)]
    pub summary: CapitalizationSummary,
    pub log_id: Option<String>,
    pub new_balance: Amount,
    /// Keyed by allocated entity id.
    pub entity_transaction_ids: BTreeMap<String, String>,
    pub float_tx_ids: Vec<String>,
    pub account_tx_ids: Vec<String>,
    pub superceded_count: usize,
    pub audit_location: Option<String>,
}

/// Division plus the window it was computed over.
struct Assessment {
    period: Period,
    division: CapitalizationDivision,
}

impl FloatEngine {
    /// Shows what a capitalization would credit, without writing anything.
    pub async fn capitalization_preview(
        &self,
        caller: &Caller,
        request: CapitalizationRequest,
    ) -> Result<CapitalizationSummary> {
        caller.require_admin()?;
        let yield_paid = request.validate()?;
        let assessment = self.assess(&request, yield_paid).await?;
        Ok(self.summarize(&request, &assessment.division))
    }

    /// Commits a capitalization, at most once per float and payment time.
    pub async fn capitalization_confirm(
        &self,
        caller: &Caller,
        request: CapitalizationRequest,
    ) -> Result<CapitalizationResult> {
        caller.require_admin()?;
        let yield_paid = request.validate()?;
        let fingerprint = Fingerprint::of(
            "capitalization",
            &(&request.client_id, &request.float_id, request.date_time_paid),
        )?;
        self.guard
            .run(&fingerprint, self.run_capitalization(&request, yield_paid))
            .await
    }

    async fn assess(&self, request: &CapitalizationRequest, yield_paid: Amount) -> Result<Assessment> {
        let config = self
            .config
            .fetch_float_config(&request.client_id, &request.float_id)
            .await?;

        let last = self
            .ledger
            .fetch_last_log(
                &request.client_id,
                &request.float_id,
                LogType::CapitalizationEvent,
                request.date_time_paid,
            )
            .await?;
        let period = Period {
            start: last.map_or(DateTime::<Utc>::UNIX_EPOCH, |log| log.reference_time),
            end: request.date_time_paid,
        };
        debug!(
            "Capitalization window for float {}: {} to {}",
            request.float_id, period.start, period.end
        );

        let accrued = self
            .ledger
            .fetch_accruals_in_period(&request.client_id, &request.float_id, &request.currency, period)
            .await?;
        let division = divide_capitalization(
            yield_paid,
            accrued,
            &config.bonus_pool_tracker,
            &config.client_co_share_tracker,
        )?;
        Ok(Assessment { period, division })
    }

    fn summarize(&self, request: &CapitalizationRequest, division: &CapitalizationDivision) -> CapitalizationSummary {
        let accounts: Vec<&CreditLine> = division
            .lines
            .iter()
            .filter(|line| line.entity_type == EntityType::EndUserAccount)
            .collect();

        let mut rng = rand::thread_rng();
        let sample_of_transactions = accounts
            .choose_multiple(&mut rng, self.settings.preview_sample_size)
            .map(|line| AccountCredit {
                account_id: line.entity_id.clone(),
                account_name: line.human_ref.clone(),
                unit: Unit::BASE,
                currency: request.currency.clone(),
                prior_balance: line.prior_settled_balance,
                prior_accrued: line.amount_accrued,
                amount_to_credit: line.amount_to_credit,
            })
            .collect();

        CapitalizationSummary {
            number_accounts_to_be_credited: accounts.len(),
            amount_to_credit_client: division.credited(EntityType::CompanyShare),
            amount_to_credit_bonus_pool: division.credited(EntityType::BonusPool),
            excess_over_past_accrual: division.remainder,
            unit: Unit::BASE,
            currency: request.currency.clone(),
            sample_of_transactions,
        }
    }

    async fn run_capitalization(
        &self,
        request: &CapitalizationRequest,
        yield_paid: Amount,
    ) -> Result<CapitalizationResult> {
        let Assessment { period, division } = self.assess(request, yield_paid).await?;
        let summary = self.summarize(request, &division);

        let adjustment = self
            .ledger
            .add_or_subtract_float(FloatAdjustment {
                client_id: request.client_id.clone(),
                float_id: request.float_id.clone(),
                transaction_type: TransactionType::Capitalization,
                amount: yield_paid,
                currency: request.currency.clone(),
                unit: Unit::BASE,
                backing_entity_type: Some(EntityType::CapitalizationEvent),
                backing_entity_id: None,
                log_type: Some(LogType::CapitalizationEvent),
                reference_time: Some(request.date_time_paid),
            })
            .await?;
        let log_id = adjustment.log_id.clone();

        let mut entity_rows = Vec::new();
        let mut user_rows = Vec::new();
        for line in division.lines.iter().filter(|line| !line.amount_to_credit.is_zero()) {
            if line.entity_type == EntityType::EndUserAccount {
                user_rows.push(UserAllocation {
                    account_id: line.entity_id.clone(),
                    amount: line.amount_to_credit,
                    currency: request.currency.clone(),
                    unit: Unit::BASE,
                    transaction_type: TransactionType::Capitalization,
                    transaction_state: TransactionState::Settled,
                    settlement_status: SettlementStatus::Settled,
                    related_entity_type: Some(EntityType::CapitalizationEvent),
                    related_entity_id: log_id.clone(),
                    log_id: log_id.clone(),
                });
            } else {
                entity_rows.push(EntityAllocation {
                    label: Some(line.entity_id.clone()),
                    amount: line.amount_to_credit,
                    currency: request.currency.clone(),
                    unit: Unit::BASE,
                    transaction_type: TransactionType::Capitalization,
                    transaction_state: TransactionState::Settled,
                    allocated_to_type: line.entity_type,
                    allocated_to_id: line.entity_id.clone(),
                    related_entity_type: Some(EntityType::CapitalizationEvent),
                    related_entity_id: log_id.clone(),
                    log_id: log_id.clone(),
                });
            }
        }

        let mut entity_transaction_ids = BTreeMap::new();
        if !entity_rows.is_empty() {
            let written = self
                .ledger
                .allocate_float(&request.client_id, &request.float_id, entity_rows)
                .await?;
            for tx in written {
                if let Some(label) = tx.label {
                    entity_transaction_ids.insert(label, tx.transaction_id);
                }
            }
        }

        let user_ids = if user_rows.is_empty() {
            Default::default()
        } else {
            self.ledger
                .allocate_to_users(&request.client_id, &request.float_id, user_rows)
                .await?
        };

        let superceded_count = self
            .ledger
            .supercede_accruals(&request.client_id, &request.float_id, period)
            .await?;

        let audit_location = match &log_id {
            Some(log_id) => {
                let prior_balances: HashMap<String, Amount> = division
                    .lines
                    .iter()
                    .map(|line| (line.entity_id.clone(), line.prior_settled_balance))
                    .collect();
                self.export_audit(log_id, "capitalization", &prior_balances).await
            }
            None => None,
        };

        info!(
            "Capitalized {} on float {} at {}, {} accrual rows superseded",
            yield_paid, request.float_id, request.date_time_paid, superceded_count
        );
        Ok(CapitalizationResult {
            summary,
            log_id,
            new_balance: adjustment.updated_balance,
            entity_transaction_ids,
            float_tx_ids: user_ids.float_tx_ids,
            account_tx_ids: user_ids.account_tx_ids,
            superceded_count,
            audit_location,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accrual::AccrualRequest;
    use crate::engine::tests::{memory_engine, CLIENT, FLOAT};
    use crate::ledger::LedgerStore;
    use crate::memory::MemoryLedger;

    const BONUS: &str = "bonus_pool";
    const COMPANY: &str = "client_share";

    fn summary(id: &str, entity_type: EntityType, accrued: i64) -> AccrualSummary {
        AccrualSummary {
            entity_id: id.to_string(),
            entity_type,
            amount_accrued: Amount::new(accrued),
            prior_settled_balance: Amount::ZERO,
            human_ref: None,
        }
    }

    fn accrued_map() -> Vec<AccrualSummary> {
        vec![
            summary(BONUS, EntityType::BonusPool, 40),
            summary(COMPANY, EntityType::CompanyShare, 17),
            summary("acc-1", EntityType::EndUserAccount, 333),
            summary("acc-2", EntityType::EndUserAccount, 111),
            summary("acc-3", EntityType::EndUserAccount, 499),
        ]
    }

    fn credit_of(division: &CapitalizationDivision, id: &str) -> Amount {
        division
            .lines
            .iter()
            .find(|line| line.entity_id == id)
            .map(|line| line.amount_to_credit)
            .unwrap()
    }

    #[test]
    fn test_residue_conserved_for_signed_remainder() {
        let total = Amount::new(1_000);
        for remainder in [-40, -7, 0, 1, 3, 17, 999, 12_345] {
            let yield_paid = total + Amount::new(remainder);
            let division = divide_capitalization(yield_paid, accrued_map(), BONUS, COMPANY).unwrap();
            let credited: Amount = division.lines.iter().map(|l| l.amount_to_credit).sum();
            assert_eq!(credited, yield_paid, "remainder {}", remainder);
            assert_eq!(division.remainder, Amount::new(remainder));
        }
    }

    #[test]
    fn test_bonus_pool_alone_absorbs_shortfall() {
        let division = divide_capitalization(Amount::new(990), accrued_map(), BONUS, COMPANY).unwrap();
        assert_eq!(credit_of(&division, BONUS), Amount::new(30));
        assert_eq!(credit_of(&division, COMPANY), Amount::new(17));
        assert_eq!(credit_of(&division, "acc-1"), Amount::new(333));
    }

    #[test]
    fn test_bonus_and_company_always_present() {
        let accrued = vec![summary("acc-1", EntityType::EndUserAccount, 100)];
        let division = divide_capitalization(Amount::new(150), accrued, BONUS, COMPANY).unwrap();
        assert_eq!(division.lines.len(), 3);
        assert_eq!(credit_of(&division, "acc-1"), Amount::new(150));
        assert_eq!(credit_of(&division, COMPANY), Amount::ZERO);
    }

    #[test]
    fn test_nothing_accrued_goes_to_bonus() {
        let division = divide_capitalization(Amount::new(75), Vec::new(), BONUS, COMPANY).unwrap();
        assert_eq!(credit_of(&division, BONUS), Amount::new(75));
    }

    fn admin() -> Caller {
        Caller::new("SYSTEM_ADMIN")
    }

    fn seed_accounts(ledger: &MemoryLedger) {
        for (account, amount) in [("acc-1", 6_000), ("acc-2", 4_000)] {
            ledger.open_account(account, Some(account.to_uppercase().as_str()));
            ledger.seed(
                CLIENT,
                FLOAT,
                TransactionType::Allocation,
                EntityType::EndUserAccount,
                account,
                Amount::new(amount),
                "ZAR",
                Unit::HundredthCent,
            );
        }
        ledger.seed(
            CLIENT,
            FLOAT,
            TransactionType::Deposit,
            EntityType::FloatItself,
            FLOAT,
            Amount::new(10_000),
            "ZAR",
            Unit::HundredthCent,
        );
    }

    async fn accrue(engine: &FloatEngine, backing: &str, amount: i64) {
        engine
            .accrue(AccrualRequest {
                client_id: CLIENT.to_string(),
                float_id: FLOAT.to_string(),
                accrual_amount: Amount::new(amount),
                currency: None,
                unit: Unit::HundredthCent,
                reference_time: None,
                backing_entity_identifier: backing.to_string(),
            })
            .await
            .unwrap();
    }

    fn request(yield_paid: i64) -> CapitalizationRequest {
        CapitalizationRequest {
            client_id: CLIENT.to_string(),
            float_id: FLOAT.to_string(),
            date_time_paid: Utc::now(),
            yield_paid: Amount::new(yield_paid),
            unit: Unit::HundredthCent,
            currency: "ZAR".to_string(),
        }
    }

    #[tokio::test]
    async fn test_preview_writes_nothing() {
        let (engine, ledger) = memory_engine();
        seed_accounts(&ledger);
        accrue(&engine, "int-1", 1_000).await;
        let before = ledger.entries().len();

        let summary = engine.capitalization_preview(&admin(), request(1_100)).await.unwrap();
        assert_eq!(summary.number_accounts_to_be_credited, 2);
        assert_eq!(summary.excess_over_past_accrual, Amount::new(100));
        assert_eq!(summary.sample_of_transactions.len(), 2);
        assert!(summary.sample_of_transactions.iter().all(|s| s.account_name.is_some()));
        assert_eq!(ledger.entries().len(), before);
    }

    #[tokio::test]
    async fn test_ordinary_user_is_refused() {
        let (engine, _ledger) = memory_engine();
        let result = engine
            .capitalization_preview(&Caller::new("ORDINARY_USER"), request(1))
            .await;
        assert!(matches!(result, Err(EngineError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn test_confirm_supersedes_and_is_not_recounted() {
        let (engine, ledger) = memory_engine();
        seed_accounts(&ledger);
        accrue(&engine, "int-1", 1_000).await;
        accrue(&engine, "int-2", 500).await;

        let first = engine.capitalization_confirm(&admin(), request(1_600)).await.unwrap();
        assert!(first.superceded_count > 0);
        assert_eq!(first.account_tx_ids.len(), 2);

        for entry in ledger.entries() {
            if entry.transaction_type == TransactionType::Accrual {
                assert_eq!(entry.transaction_state, TransactionState::Superceded);
            }
        }
        for mirror in ledger.account_entries() {
            match mirror.transaction_type {
                TransactionType::Accrual => assert_eq!(mirror.settlement_status, SettlementStatus::Superceded),
                _ => assert_eq!(mirror.settlement_status, SettlementStatus::Settled),
            }
        }

        // float holds deposit plus the yield; the estimates are gone
        let balance = ledger.calculate_float_balance(FLOAT, "ZAR", None).await.unwrap();
        assert_eq!(balance.balance, Amount::new(11_600));

        // a later, overlapping confirm sees nothing left to settle
        let second = engine.capitalization_confirm(&admin(), request(0)).await.unwrap();
        assert_eq!(second.superceded_count, 0);
        assert_eq!(second.summary.number_accounts_to_be_credited, 0);
        assert!(second.account_tx_ids.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_confirm_replays_result() {
        let (engine, ledger) = memory_engine();
        seed_accounts(&ledger);
        accrue(&engine, "int-1", 1_000).await;

        let req = request(1_000);
        let first = engine.capitalization_confirm(&admin(), req.clone()).await.unwrap();
        let rows_after_first = ledger.entries().len();
        let second = engine.capitalization_confirm(&admin(), req).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.entries().len(), rows_after_first);
    }
}
