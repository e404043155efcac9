//! # Float Engine
//!
//! Proportional accrual, capitalization and allocation for a pooled,
//! interest-bearing cash float that backs many end-user savings accounts.
//!
//! ## Design Principles
//!
//! - **Integer amounts**: every amount is a whole number of the base unit
//!   (hundredths of a cent); fractions live only in `rust_decimal`
//!   intermediates and round half-up
//! - **Exact conservation**: every division returns its rounding excess,
//!   which is always routed somewhere explicit
//! - **At most once**: each top-level operation runs under a cache-backed
//!   fingerprint lock, so retries and concurrent duplicates replay the first
//!   result instead of writing again
//! - **Collaborators behind traits**: ledger, config, cache and archive are
//!   async traits with in-memory implementations for tests and dry runs
//!
//! ## Example
//!
//! ```no_run
//! use float_engine::{AccrualRequest, Amount, EngineSettings, FloatEngine, Unit};
//! use float_engine::memory::{MemoryCache, MemoryConfigStore, MemoryLedger};
//! use std::sync::Arc;
//!
//! # async fn demo() -> float_engine::Result<()> {
//! let settings = EngineSettings::default();
//! let engine = FloatEngine::new(
//!     Arc::new(MemoryLedger::new()),
//!     Arc::new(MemoryConfigStore::from_configs(settings.floats.clone())),
//!     Arc::new(MemoryCache::new()),
//!     settings,
//! );
//! let result = engine
//!     .accrue(AccrualRequest {
//!         client_id: "some_client".to_string(),
//!         float_id: "zar_mmkt".to_string(),
//!         accrual_amount: Amount::new(1_000_000),
//!         currency: None,
//!         unit: Unit::HundredthCent,
//!         reference_time: None,
//!         backing_entity_identifier: "interest-2024-01-31".to_string(),
//!     })
//!     .await?;
//! println!("float balance now {}", result.new_balance);
//! # Ok(())
//! # }
//! ```

pub mod accrual;
pub mod allocation;
pub mod amount;
pub mod apportion;
pub mod archive;
pub mod cache;
pub mod capitalization;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod guard;
pub mod ledger;
pub mod memory;
pub mod transfer;
pub mod units;

pub use crate::accrual::{split_accrual, AccrualRequest, AccrualResult, AccrualSplit};
pub use crate::allocation::{AllocationRequest, AllocationResult};
pub use crate::amount::{calculate_share, round_half_up, Amount};
pub use crate::apportion::{apportion, Apportionment};
pub use crate::archive::{Archive, ArchiveOutcome, AuditRow, CsvArchive};
pub use crate::cache::CacheStore;
pub use crate::capitalization::{
    divide_capitalization, Caller, CapitalizationRequest, CapitalizationResult, CapitalizationSummary,
};
pub use crate::config::{ConfigStore, EngineSettings, FloatConfig};
pub use crate::engine::{EngineRequest, EngineResponse, FloatEngine, Operation};
pub use crate::error::{EngineError, ErrorKind, Result};
pub use crate::fingerprint::Fingerprint;
pub use crate::guard::{Admission, IdempotencyGuard, LockRecord};
pub use crate::ledger::{LedgerEntry, LedgerStore, Period};
pub use crate::transfer::{TransferInstruction, TransferRecipient, TransferResult, TransferStatus};
pub use crate::units::{EntityType, LogType, SettlementStatus, TransactionState, TransactionType, Unit};
