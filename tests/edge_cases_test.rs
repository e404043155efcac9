//! Edge case tests driving the engine through its library API.

use chrono::Utc;
use float_engine::memory::{MemoryCache, MemoryConfigStore, MemoryLedger};
use float_engine::{
    apportion, AccrualRequest, Amount, Caller, CapitalizationRequest, EngineError, EngineSettings, EntityType,
    FloatConfig, FloatEngine, LedgerStore, TransactionState, TransactionType, Unit,
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

const CLIENT: &str = "some_client";
const FLOAT: &str = "zar_mmkt";

fn float_config() -> FloatConfig {
    FloatConfig {
        client_id: CLIENT.to_string(),
        float_id: FLOAT.to_string(),
        bonus_pool_share: Decimal::from_str("0.1").unwrap(),
        bonus_pool_tracker: "bonus_pool".to_string(),
        client_co_share: Decimal::from_str("0.05").unwrap(),
        client_co_share_tracker: "client_share".to_string(),
        currency: "ZAR".to_string(),
        unit: Unit::HundredthCent,
    }
}

fn settings() -> EngineSettings {
    EngineSettings {
        cache_ttl_seconds: 5,
        poll_interval_millis: 5,
        ..EngineSettings::default()
    }
}

fn engine_on(ledger: Arc<MemoryLedger>, cache: Arc<MemoryCache>) -> FloatEngine {
    FloatEngine::new(
        ledger,
        Arc::new(MemoryConfigStore::from_configs([float_config()])),
        cache,
        settings(),
    )
}

fn seed_accounts(ledger: &MemoryLedger, balances: &[i64]) {
    ledger.seed(
        CLIENT,
        FLOAT,
        TransactionType::Deposit,
        EntityType::FloatItself,
        FLOAT,
        Amount::new(balances.iter().sum()),
        "ZAR",
        Unit::HundredthCent,
    );
    for (idx, balance) in balances.iter().enumerate() {
        let account = format!("acc-{:03}", idx);
        ledger.open_account(&account, None);
        ledger.seed(
            CLIENT,
            FLOAT,
            TransactionType::Deposit,
            EntityType::EndUserAccount,
            &account,
            Amount::new(*balance),
            "ZAR",
            Unit::HundredthCent,
        );
    }
}

fn accrual(backing: &str, amount: i64) -> AccrualRequest {
    AccrualRequest {
        client_id: CLIENT.to_string(),
        float_id: FLOAT.to_string(),
        accrual_amount: Amount::new(amount),
        currency: None,
        unit: Unit::HundredthCent,
        reference_time: None,
        backing_entity_identifier: backing.to_string(),
    }
}

fn accrued_allocations(ledger: &MemoryLedger) -> Amount {
    ledger
        .entries()
        .iter()
        .filter(|e| {
            e.transaction_type == TransactionType::Accrual
                && e.transaction_state == TransactionState::Settled
                && e.allocated_to_type != EntityType::FloatItself
        })
        .map(|e| e.amount)
        .sum()
}

#[test]
fn test_apportion_many_uneven_weights_conserves() {
    let weights: BTreeMap<String, Amount> = (1..=97)
        .map(|i| (format!("acc-{}", i), Amount::new(i * 7 + 3)))
        .collect();
    for amount in [1, 99, 1_000_003, -12_345] {
        let result = apportion(Amount::new(amount), &weights).unwrap();
        assert_eq!(result.apportioned() + result.excess, Amount::new(amount));
    }
}

#[test]
fn test_apportion_half_rounds_away_from_zero() {
    let weights: BTreeMap<String, Amount> = [("a", 1), ("b", 1)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), Amount::new(v)))
        .collect();
    let result = apportion(Amount::new(-5), &weights).unwrap();
    assert_eq!(result.shares["a"], Amount::new(-3));
    assert_eq!(result.excess, Amount::new(1));
}

#[tokio::test]
async fn test_accrual_conserves_over_many_accounts() {
    let ledger = Arc::new(MemoryLedger::new());
    let balances: Vec<i64> = (0..250).map(|i| 1_000 + i * 37 % 911).collect();
    seed_accounts(&ledger, &balances);
    let engine = engine_on(ledger.clone(), Arc::new(MemoryCache::new()));

    engine.accrue(accrual("interest-1", 987_654_321)).await.unwrap();

    assert_eq!(accrued_allocations(&ledger), Amount::new(987_654_321));
}

#[tokio::test]
async fn test_engines_sharing_cache_apply_once() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_accounts(&ledger, &[400, 600]);
    let cache = Arc::new(MemoryCache::new());
    let first = engine_on(ledger.clone(), cache.clone());
    let second = engine_on(ledger.clone(), cache.clone());

    let (a, b) = tokio::join!(
        first.accrue(accrual("interest-dup", 5_000)),
        second.accrue(accrual("interest-dup", 5_000))
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(accrued_allocations(&ledger), Amount::new(5_000));
}

#[tokio::test]
async fn test_cache_outage_still_accrues() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_accounts(&ledger, &[400, 600]);
    let cache = Arc::new(MemoryCache::new());
    cache.set_available(false);
    let engine = engine_on(ledger.clone(), cache);

    let result = engine.accrue(accrual("interest-outage", 2_000)).await.unwrap();
    assert_eq!(result.new_balance, Amount::new(3_000));
}

#[tokio::test]
async fn test_accrue_capitalize_accrue_cycle() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_accounts(&ledger, &[3_000, 7_000]);
    let engine = engine_on(ledger.clone(), Arc::new(MemoryCache::new()));
    let admin = Caller::new("ADMIN");

    engine.accrue(accrual("day-1", 1_200)).await.unwrap();
    engine.accrue(accrual("day-2", 1_300)).await.unwrap();

    let paid_at = Utc::now();
    let result = engine
        .capitalization_confirm(
            &admin,
            CapitalizationRequest {
                client_id: CLIENT.to_string(),
                float_id: FLOAT.to_string(),
                date_time_paid: paid_at,
                yield_paid: Amount::new(2_450),
                unit: Unit::HundredthCent,
                currency: "ZAR".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(result.summary.excess_over_past_accrual, Amount::new(-50));
    assert_eq!(accrued_allocations(&ledger), Amount::ZERO);

    let capitalized: Amount = ledger
        .entries()
        .iter()
        .filter(|e| {
            e.transaction_type == TransactionType::Capitalization && e.allocated_to_type != EntityType::FloatItself
        })
        .map(|e| e.amount)
        .sum();
    assert_eq!(capitalized, Amount::new(2_450));

    // accruals after the payment belong to the next period
    engine.accrue(accrual("day-3", 900)).await.unwrap();
    assert_eq!(accrued_allocations(&ledger), Amount::new(900));

    let balance = ledger.calculate_float_balance(FLOAT, "ZAR", None).await.unwrap();
    assert_eq!(balance.balance, Amount::new(10_000 + 2_450 + 900));
}

#[tokio::test]
async fn test_fraction_share_out_of_range_in_config() {
    let ledger = Arc::new(MemoryLedger::new());
    let mut config = float_config();
    config.bonus_pool_share = Decimal::from_str("1.5").unwrap();
    let engine = FloatEngine::new(
        ledger.clone(),
        Arc::new(MemoryConfigStore::from_configs([config])),
        Arc::new(MemoryCache::new()),
        settings(),
    );

    let result = engine.accrue(accrual("interest-bad-config", 100)).await;
    assert!(matches!(result, Err(EngineError::ShareOutOfRange { .. })));
    assert!(ledger.entries().is_empty());
}
