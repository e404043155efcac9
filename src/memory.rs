//! In-memory collaborators.
//!
//! These back the test suite and the command-line dry run. They honour the
//! same contracts as the production stores: batch calls are all-or-nothing,
//! sums are in the base unit and skip superseded rows.

use crate::amount::Amount;
use crate::cache::CacheStore;
use crate::config::{ConfigStore, FloatConfig};
use crate::error::{EngineError, Result};
use crate::ledger::{
    AccountEntry, AccrualSummary, EntityAllocation, FloatAdjustment, FloatAdjustmentResult,
    FloatBalance, LabelledTransaction, LedgerEntry, LedgerStore, OperationLog, Period,
    UserAllocation, UserAllocationIds,
};
use crate::units::{
    EntityType, LogType, SettlementStatus, TransactionState, TransactionType, Unit,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, Trim};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Ledger operations that can be made to fail, for exercising error paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    AddOrSubtractFloat,
    AllocateFloat,
    AllocateToUsers,
    CalculateFloatBalance,
    PriorAllocationBalances,
    AccountsWithPriorAllocations,
    FetchLastLog,
    FetchAccrualsInPeriod,
    SupercedeAccruals,
    FetchRecordsForLog,
}

#[derive(Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    account_entries: Vec<AccountEntry>,
    logs: Vec<OperationLog>,
    /// Open accounts and their human-readable reference.
    accounts: BTreeMap<String, Option<String>>,
    failing: HashSet<LedgerOp>,
}

impl LedgerState {
    fn check(&self, op: LedgerOp) -> Result<()> {
        if self.failing.contains(&op) {
            return Err(EngineError::Persistence(format!("{:?} failed", op)));
        }
        Ok(())
    }

    fn float_balance(&self, float_id: &str, currency: &str, period: Option<Period>) -> Result<Amount> {
        let mut balance = Amount::ZERO;
        for entry in self.entries.iter().filter(|e| {
            e.float_id == float_id
                && e.currency == currency
                && e.allocated_to_type == EntityType::FloatItself
                && e.transaction_state != TransactionState::Superceded
                && period.map_or(true, |p| p.contains(e.creation_time))
        }) {
            balance += entry.unit.to_base(entry.amount)?;
        }
        Ok(balance)
    }

    fn open_log(
        &mut self,
        client_id: &str,
        float_id: &str,
        log_type: LogType,
        reference_time: DateTime<Utc>,
    ) -> String {
        let log_id = Uuid::new_v4().to_string();
        self.logs.push(OperationLog {
            log_id: log_id.clone(),
            client_id: client_id.to_string(),
            float_id: float_id.to_string(),
            log_type,
            reference_time,
            creation_time: Utc::now(),
        });
        log_id
    }
}

/// Seed row for [`MemoryLedger::load_csv`].
#[derive(Debug, Deserialize)]
struct SeedRecord {
    client_id: String,
    float_id: String,
    transaction_type: TransactionType,
    currency: String,
    unit: Unit,
    amount: Amount,
    allocated_to_type: EntityType,
    allocated_to_id: String,
    human_ref: Option<String>,
}

/// Ledger store held in process memory.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an end-user account so it takes part in user apportionment.
    pub fn open_account(&self, account_id: &str, human_ref: Option<&str>) {
        self.state
            .lock()
            .accounts
            .insert(account_id.to_string(), human_ref.map(str::to_string));
    }

    /// Appends a pre-built row, registering its account if it has one.
    pub fn insert_entry(&self, entry: LedgerEntry) {
        let mut state = self.state.lock();
        if entry.allocated_to_type == EntityType::EndUserAccount {
            state
                .accounts
                .entry(entry.allocated_to_id.clone())
                .or_insert(None);
        }
        state.entries.push(entry);
    }

    /// Records a settled row without going through a pipeline.
    #[allow(clippy::too_many_arguments)]
    pub fn seed(
        &self,
        client_id: &str,
        float_id: &str,
        transaction_type: TransactionType,
        allocated_to_type: EntityType,
        allocated_to_id: &str,
        amount: Amount,
        currency: &str,
        unit: Unit,
    ) {
        self.insert_entry(LedgerEntry {
            transaction_id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            float_id: float_id.to_string(),
            transaction_type,
            transaction_state: TransactionState::Settled,
            currency: currency.to_string(),
            unit,
            amount,
            allocated_to_type,
            allocated_to_id: allocated_to_id.to_string(),
            related_entity_type: None,
            related_entity_id: None,
            log_id: None,
            creation_time: Utc::now(),
        });
    }

    /// Seeds the ledger from CSV with header
    /// `client_id,float_id,transaction_type,currency,unit,amount,allocated_to_type,allocated_to_id,human_ref`.
    ///
    /// Invalid rows are logged at warn level and skipped. Returns the number
    /// of rows loaded.
    pub fn load_csv<R: Read>(&self, reader: R) -> Result<usize> {
        let mut csv_reader = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(reader);

        let mut loaded = 0;
        for (row_idx, result) in csv_reader.deserialize::<SeedRecord>().enumerate() {
            let row_num = row_idx + 2; // 1-indexed, accounting for header row

            match result {
                Ok(record) => {
                    if record.allocated_to_type == EntityType::EndUserAccount {
                        if let Some(human_ref) = record.human_ref.as_deref() {
                            self.open_account(&record.allocated_to_id, Some(human_ref));
                        }
                    }
                    self.seed(
                        &record.client_id,
                        &record.float_id,
                        record.transaction_type,
                        record.allocated_to_type,
                        &record.allocated_to_id,
                        record.amount,
                        &record.currency,
                        record.unit,
                    );
                    loaded += 1;
                }
                Err(e) => {
                    warn!("Row {}: CSV parse error: {}", row_num, e);
                }
            }
        }

        debug!("Seeded ledger with {} rows", loaded);
        Ok(loaded)
    }

    /// Makes every subsequent call of `op` fail with a persistence error.
    pub fn fail_on(&self, op: LedgerOp) {
        self.state.lock().failing.insert(op);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().entries.clone()
    }

    pub fn account_entries(&self) -> Vec<AccountEntry> {
        self.state.lock().account_entries.clone()
    }

    pub fn logs(&self) -> Vec<OperationLog> {
        self.state.lock().logs.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn add_or_subtract_float(&self, request: FloatAdjustment) -> Result<FloatAdjustmentResult> {
        let mut state = self.state.lock();
        state.check(LedgerOp::AddOrSubtractFloat)?;

        let log_id = request.log_type.map(|log_type| {
            let reference_time = request.reference_time.unwrap_or_else(Utc::now);
            state.open_log(&request.client_id, &request.float_id, log_type, reference_time)
        });

        let transaction_id = Uuid::new_v4().to_string();
        state.entries.push(LedgerEntry {
            transaction_id: transaction_id.clone(),
            client_id: request.client_id.clone(),
            float_id: request.float_id.clone(),
            transaction_type: request.transaction_type,
            transaction_state: TransactionState::Settled,
            currency: request.currency.clone(),
            unit: request.unit,
            amount: request.amount,
            allocated_to_type: EntityType::FloatItself,
            allocated_to_id: request.float_id.clone(),
            related_entity_type: request.backing_entity_type,
            related_entity_id: request.backing_entity_id.clone(),
            log_id: log_id.clone(),
            creation_time: Utc::now(),
        });

        let updated_balance = state.float_balance(&request.float_id, &request.currency, None)?;
        Ok(FloatAdjustmentResult {
            transaction_id,
            log_id,
            updated_balance,
            unit: Unit::BASE,
        })
    }

    async fn allocate_float(
        &self,
        client_id: &str,
        float_id: &str,
        allocations: Vec<EntityAllocation>,
    ) -> Result<Vec<LabelledTransaction>> {
        let mut state = self.state.lock();
        state.check(LedgerOp::AllocateFloat)?;

        let now = Utc::now();
        let mut labelled = Vec::with_capacity(allocations.len());
        for allocation in allocations {
            let transaction_id = Uuid::new_v4().to_string();
            state.entries.push(LedgerEntry {
                transaction_id: transaction_id.clone(),
                client_id: client_id.to_string(),
                float_id: float_id.to_string(),
                transaction_type: allocation.transaction_type,
                transaction_state: allocation.transaction_state,
                currency: allocation.currency,
                unit: allocation.unit,
                amount: allocation.amount,
                allocated_to_type: allocation.allocated_to_type,
                allocated_to_id: allocation.allocated_to_id,
                related_entity_type: allocation.related_entity_type,
                related_entity_id: allocation.related_entity_id,
                log_id: allocation.log_id,
                creation_time: now,
            });
            labelled.push(LabelledTransaction {
                label: allocation.label,
                transaction_id,
            });
        }
        Ok(labelled)
    }

    async fn allocate_to_users(
        &self,
        client_id: &str,
        float_id: &str,
        allocations: Vec<UserAllocation>,
    ) -> Result<UserAllocationIds> {
        let mut state = self.state.lock();
        state.check(LedgerOp::AllocateToUsers)?;

        let now = Utc::now();
        let mut ids = UserAllocationIds::default();
        for allocation in allocations {
            let float_tx_id = Uuid::new_v4().to_string();
            let account_tx_id = Uuid::new_v4().to_string();
            let tags = match (&allocation.related_entity_type, &allocation.related_entity_id) {
                (Some(kind), Some(id)) => vec![format!("{}::{}", kind, id)],
                _ => Vec::new(),
            };
            let settlement_time = match allocation.settlement_status {
                SettlementStatus::Settled => Some(now),
                _ => None,
            };

            state
                .accounts
                .entry(allocation.account_id.clone())
                .or_insert(None);
            state.entries.push(LedgerEntry {
                transaction_id: float_tx_id.clone(),
                client_id: client_id.to_string(),
                float_id: float_id.to_string(),
                transaction_type: allocation.transaction_type,
                transaction_state: allocation.transaction_state,
                currency: allocation.currency.clone(),
                unit: allocation.unit,
                amount: allocation.amount,
                allocated_to_type: EntityType::EndUserAccount,
                allocated_to_id: allocation.account_id.clone(),
                related_entity_type: allocation.related_entity_type,
                related_entity_id: allocation.related_entity_id.clone(),
                log_id: allocation.log_id.clone(),
                creation_time: now,
            });
            state.account_entries.push(AccountEntry {
                transaction_id: account_tx_id.clone(),
                account_id: allocation.account_id,
                client_id: client_id.to_string(),
                float_id: float_id.to_string(),
                transaction_type: allocation.transaction_type,
                settlement_status: allocation.settlement_status,
                amount: allocation.amount,
                currency: allocation.currency,
                unit: allocation.unit,
                float_tx_id: float_tx_id.clone(),
                tags,
                log_id: allocation.log_id,
                creation_time: now,
                settlement_time,
            });
            ids.float_tx_ids.push(float_tx_id);
            ids.account_tx_ids.push(account_tx_id);
        }
        Ok(ids)
    }

    async fn calculate_float_balance(
        &self,
        float_id: &str,
        currency: &str,
        period: Option<Period>,
    ) -> Result<FloatBalance> {
        let state = self.state.lock();
        state.check(LedgerOp::CalculateFloatBalance)?;
        Ok(FloatBalance {
            balance: state.float_balance(float_id, currency, period)?,
            unit: Unit::BASE,
        })
    }

    async fn prior_allocation_balances(
        &self,
        client_id: &str,
        float_id: &str,
        currency: &str,
        entity_ids: &[String],
    ) -> Result<HashMap<String, Amount>> {
        let state = self.state.lock();
        state.check(LedgerOp::PriorAllocationBalances)?;

        let mut balances: HashMap<String, Amount> =
            entity_ids.iter().map(|id| (id.clone(), Amount::ZERO)).collect();
        for entry in state.entries.iter().filter(|e| {
            e.client_id == client_id
                && e.float_id == float_id
                && e.currency == currency
                && e.allocated_to_type != EntityType::FloatItself
                && e.transaction_state != TransactionState::Superceded
        }) {
            if let Some(balance) = balances.get_mut(&entry.allocated_to_id) {
                *balance += entry.unit.to_base(entry.amount)?;
            }
        }
        Ok(balances)
    }

    async fn accounts_with_prior_allocations(
        &self,
        float_id: &str,
        currency: &str,
        entity_type: EntityType,
    ) -> Result<BTreeMap<String, Amount>> {
        let state = self.state.lock();
        state.check(LedgerOp::AccountsWithPriorAllocations)?;

        let mut totals = BTreeMap::new();
        for entry in state.entries.iter().filter(|e| {
            e.float_id == float_id
                && e.currency == currency
                && e.allocated_to_type == entity_type
                && e.transaction_state != TransactionState::Superceded
        }) {
            // only open accounts take part, mirroring a join on the accounts table
            if entity_type == EntityType::EndUserAccount
                && !state.accounts.contains_key(&entry.allocated_to_id)
            {
                continue;
            }
            *totals
                .entry(entry.allocated_to_id.clone())
                .or_insert(Amount::ZERO) += entry.unit.to_base(entry.amount)?;
        }
        Ok(totals)
    }

    async fn fetch_last_log(
        &self,
        client_id: &str,
        float_id: &str,
        log_type: LogType,
        before: DateTime<Utc>,
    ) -> Result<Option<OperationLog>> {
        let state = self.state.lock();
        state.check(LedgerOp::FetchLastLog)?;
        Ok(state
            .logs
            .iter()
            .filter(|l| {
                l.client_id == client_id
                    && l.float_id == float_id
                    && l.log_type == log_type
                    && l.reference_time <= before
            })
            .max_by_key(|l| l.reference_time)
            .cloned())
    }

    async fn fetch_accruals_in_period(
        &self,
        client_id: &str,
        float_id: &str,
        currency: &str,
        period: Period,
    ) -> Result<Vec<AccrualSummary>> {
        let state = self.state.lock();
        state.check(LedgerOp::FetchAccrualsInPeriod)?;

        let on_float = |e: &&LedgerEntry| {
            e.client_id == client_id
                && e.float_id == float_id
                && e.currency == currency
                && e.allocated_to_type != EntityType::FloatItself
                && e.transaction_state == TransactionState::Settled
        };

        let mut summaries: BTreeMap<String, AccrualSummary> = BTreeMap::new();
        for entry in state.entries.iter().filter(on_float).filter(|e| {
            e.transaction_type == TransactionType::Accrual && period.contains(e.creation_time)
        }) {
            let summary = summaries
                .entry(entry.allocated_to_id.clone())
                .or_insert_with(|| AccrualSummary {
                    entity_id: entry.allocated_to_id.clone(),
                    entity_type: entry.allocated_to_type,
                    amount_accrued: Amount::ZERO,
                    prior_settled_balance: Amount::ZERO,
                    human_ref: state.accounts.get(&entry.allocated_to_id).cloned().flatten(),
                });
            summary.amount_accrued += entry.unit.to_base(entry.amount)?;
        }

        for entry in state.entries.iter().filter(on_float).filter(|e| {
            e.transaction_type != TransactionType::Accrual && e.creation_time <= period.end
        }) {
            if let Some(summary) = summaries.get_mut(&entry.allocated_to_id) {
                summary.prior_settled_balance += entry.unit.to_base(entry.amount)?;
            }
        }

        Ok(summaries.into_values().collect())
    }

    async fn supercede_accruals(&self, client_id: &str, float_id: &str, period: Period) -> Result<usize> {
        let mut state = self.state.lock();
        state.check(LedgerOp::SupercedeAccruals)?;

        let mut superceded = HashSet::new();
        for entry in state.entries.iter_mut().filter(|e| {
            e.client_id == client_id
                && e.float_id == float_id
                && e.transaction_type == TransactionType::Accrual
                && e.transaction_state == TransactionState::Settled
                && period.contains(e.creation_time)
        }) {
            entry.transaction_state = TransactionState::Superceded;
            superceded.insert(entry.transaction_id.clone());
        }

        for mirror in state
            .account_entries
            .iter_mut()
            .filter(|a| superceded.contains(&a.float_tx_id))
        {
            mirror.settlement_status = SettlementStatus::Superceded;
        }

        Ok(superceded.len())
    }

    async fn fetch_records_for_log(&self, log_id: &str) -> Result<Vec<LedgerEntry>> {
        let state = self.state.lock();
        state.check(LedgerOp::FetchRecordsForLog)?;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.log_id.as_deref() == Some(log_id))
            .cloned()
            .collect())
    }
}

/// Config store backed by a fixed set of float configs.
#[derive(Default)]
pub struct MemoryConfigStore {
    floats: Mutex<HashMap<(String, String), FloatConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: impl IntoIterator<Item = FloatConfig>) -> Self {
        let store = Self::new();
        for config in configs {
            store.insert(config);
        }
        store
    }

    pub fn insert(&self, config: FloatConfig) {
        self.floats
            .lock()
            .insert((config.client_id.clone(), config.float_id.clone()), config);
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn fetch_float_config(&self, client_id: &str, float_id: &str) -> Result<FloatConfig> {
        self.floats
            .lock()
            .get(&(client_id.to_string(), float_id.to_string()))
            .cloned()
            .ok_or_else(|| EngineError::FloatNotConfigured {
                client_id: client_id.to_string(),
                float_id: float_id.to_string(),
            })
    }
}

/// Expiring key-value cache; can be switched off to simulate an outage.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    available: AtomicBool,
}

impl Default for MemoryCache {
    fn default() -> Self {
        MemoryCache {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::CacheUnavailable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.ensure_available()?;
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.ensure_available()?;
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if let Some((_, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn replace_if(&self, key: &str, expected: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.ensure_available()?;
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some((current, expires)) if *expires > now && current == expected => {
                entries.insert(key.to_string(), (value.to_string(), now + ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
