//! Audit export of the rows written by one operation.

use crate::amount::Amount;
use crate::error::{EngineError, Result};
use crate::ledger::LedgerEntry;
use crate::units::{EntityType, TransactionState, TransactionType, Unit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

/// Flat CSV row: a ledger entry plus the allocated entity's prior balance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRow {
    pub transaction_id: String,
    pub client_id: String,
    pub float_id: String,
    pub transaction_type: TransactionType,
    pub transaction_state: TransactionState,
    pub currency: String,
    pub unit: Unit,
    pub amount: Amount,
    pub allocated_to_type: EntityType,
    pub allocated_to_id: String,
    pub related_entity_type: Option<EntityType>,
    pub related_entity_id: Option<String>,
    pub log_id: Option<String>,
    pub creation_time: DateTime<Utc>,
    pub prior_balance: Option<Amount>,
}

impl AuditRow {
    pub fn from_entry(entry: LedgerEntry, prior_balance: Option<Amount>) -> Self {
        AuditRow {
            transaction_id: entry.transaction_id,
            client_id: entry.client_id,
            float_id: entry.float_id,
            transaction_type: entry.transaction_type,
            transaction_state: entry.transaction_state,
            currency: entry.currency,
            unit: entry.unit,
            amount: entry.amount,
            allocated_to_type: entry.allocated_to_type,
            allocated_to_id: entry.allocated_to_id,
            related_entity_type: entry.related_entity_type,
            related_entity_id: entry.related_entity_id,
            log_id: entry.log_id,
            creation_time: entry.creation_time,
            prior_balance,
        }
    }
}

/// Result of an export attempt. Export never fails its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Stored(String),
    Failed,
}

impl ArchiveOutcome {
    pub fn location(&self) -> Option<&str> {
        match self {
            ArchiveOutcome::Stored(location) => Some(location),
            ArchiveOutcome::Failed => None,
        }
    }
}

/// Object storage for audit artifacts.
#[async_trait]
pub trait Archive: Send + Sync {
    async fn export(&self, rows: Vec<AuditRow>, log_id: &str, name_prefix: &str) -> ArchiveOutcome;
}

/// Writes audit CSVs beneath a local directory as
/// `<root>/<prefix>/<prefix>.<date>.<log_id>.csv`.
pub struct CsvArchive {
    root: PathBuf,
}

impl CsvArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CsvArchive { root: root.into() }
    }

    fn write(&self, rows: &[AuditRow], log_id: &str, name_prefix: &str) -> Result<String> {
        let dir = self.root.join(name_prefix);
        fs::create_dir_all(&dir)?;

        let file_name = format!(
            "{}.{}.{}.csv",
            name_prefix,
            Utc::now().format("%Y-%m-%d"),
            log_id
        );
        let path = dir.join(file_name);

        let mut writer = csv::Writer::from_path(&path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;

        path.to_str()
            .map(str::to_string)
            .ok_or_else(|| EngineError::Archive(format!("non UTF-8 path {:?}", path)))
    }
}

#[async_trait]
impl Archive for CsvArchive {
    async fn export(&self, rows: Vec<AuditRow>, log_id: &str, name_prefix: &str) -> ArchiveOutcome {
        match self.write(&rows, log_id, name_prefix) {
            Ok(location) => {
                debug!("Archived {} rows for log {} to {}", rows.len(), log_id, location);
                ArchiveOutcome::Stored(location)
            }
            Err(e) => {
                error!("Audit export for log {} failed: {}", log_id, e);
                ArchiveOutcome::Failed
            }
        }
    }
}
