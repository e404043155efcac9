//! Allocation dispatcher: apply batches of explicit transfer instructions.
//!
//! An instruction moves money from one source (the float's unallocated
//! balance, a pseudo-account or a user account) to one or more recipients.
//! Instructions in a batch are independent: each is guarded on its own
//! content and one failure does not stop the others.

use crate::allocation::AllocationRequest;
use crate::amount::Amount;
use crate::engine::FloatEngine;
use crate::error::{EngineError, Result};
use crate::fingerprint::Fingerprint;
use crate::ledger::{EntityAllocation, FloatAdjustment, UserAllocation};
use crate::units::{EntityType, LogType, SettlementStatus, TransactionState, TransactionType, Unit};
use futures_util::future::join_all;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Who receives part of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipientType {
    EndUserAccount,
    BonusPool,
    CompanyShare,
    FloatItself,
    AllUsers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecipient {
    pub recipient_type: RecipientType,
    #[serde(default)]
    pub recipient_id: Option<String>,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInstruction {
    pub identifier: String,
    pub client_id: String,
    pub float_id: String,
    pub currency: String,
    #[serde(default)]
    pub unit: Unit,
    pub transaction_type: TransactionType,
    #[serde(default)]
    pub settlement_status: SettlementStatus,
    #[serde(default)]
    pub related_entity_type: Option<EntityType>,
    #[serde(default)]
    pub related_entity_id: Option<String>,
    #[serde(default)]
    pub log_type: Option<LogType>,
    /// Absent means the float's own unallocated balance.
    #[serde(default)]
    pub from_type: Option<EntityType>,
    #[serde(default)]
    pub from_id: Option<String>,
    pub recipients: Vec<TransferRecipient>,
}

/// Row ids written for one instruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionIds {
    pub float_tx_ids: Vec<String>,
    pub account_tx_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub result: TransferStatus,
    pub float_tx_ids: Vec<String>,
    pub account_tx_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Debit side of an instruction.
#[derive(Debug, Clone, PartialEq)]
enum Source {
    Float,
    Entity(EntityType, String),
    User(String),
}

impl TransferInstruction {
    fn rejected(&self, message: impl Into<String>) -> EngineError {
        EngineError::InvalidInstruction {
            identifier: self.identifier.clone(),
            message: message.into(),
        }
    }

    fn source(&self) -> Result<Source> {
        let from_id = || {
            self.from_id
                .clone()
                .filter(|id| !id.is_empty())
                .ok_or_else(|| self.rejected("debit source needs a from id"))
        };
        match self.from_type {
            None | Some(EntityType::FloatItself) => Ok(Source::Float),
            Some(EntityType::EndUserAccount) => Ok(Source::User(from_id()?)),
            Some(kind) if kind.is_bonus_or_company() => Ok(Source::Entity(kind, from_id()?)),
            Some(kind) => Err(EngineError::UnsupportedFromType {
                identifier: self.identifier.clone(),
                from_type: kind.to_string(),
            }),
        }
    }

    fn validate(&self) -> Result<Source> {
        if self.identifier.is_empty() {
            return Err(EngineError::InvalidRequest(
                "instruction needs an identifier".to_string(),
            ));
        }
        if self.recipients.is_empty() {
            return Err(self.rejected("no recipients"));
        }
        for recipient in &self.recipients {
            self.unit.to_base(recipient.amount)?;
            let needs_id = matches!(
                recipient.recipient_type,
                RecipientType::EndUserAccount | RecipientType::BonusPool | RecipientType::CompanyShare
            );
            if needs_id && recipient.recipient_id.as_deref().map_or(true, str::is_empty) {
                return Err(self.rejected("recipient needs an id"));
            }
        }
        self.source()
    }

    fn recipient_id(recipient: &TransferRecipient) -> String {
        recipient.recipient_id.clone().unwrap_or_default()
    }

    /// Rows point back at the instruction when no other related entity is named.
    fn related_id(&self) -> String {
        self.related_entity_id.clone().unwrap_or_else(|| self.identifier.clone())
    }

    fn entity_row(&self, amount: Amount, to_type: EntityType, to_id: String) -> EntityAllocation {
        EntityAllocation {
            label: Some(to_id.clone()),
            amount,
            currency: self.currency.clone(),
            unit: self.unit,
            transaction_type: self.transaction_type,
            transaction_state: TransactionState::Settled,
            allocated_to_type: to_type,
            allocated_to_id: to_id,
            related_entity_type: self.related_entity_type,
            related_entity_id: Some(self.related_id()),
            log_id: None,
        }
    }

    fn user_row(&self, amount: Amount, account_id: String) -> UserAllocation {
        UserAllocation {
            account_id,
            amount,
            currency: self.currency.clone(),
            unit: self.unit,
            transaction_type: self.transaction_type,
            transaction_state: TransactionState::Settled,
            settlement_status: self.settlement_status,
            related_entity_type: self.related_entity_type,
            related_entity_id: Some(self.related_id()),
            log_id: None,
        }
    }
}

impl FloatEngine {
    /// Applies every instruction concurrently; results are keyed by identifier.
    pub async fn transfer(&self, instructions: Vec<TransferInstruction>) -> Result<BTreeMap<String, TransferResult>> {
        let mut seen = HashSet::new();
        for instruction in &instructions {
            if !seen.insert(instruction.identifier.as_str()) {
                return Err(EngineError::InvalidRequest(format!(
                    "duplicate instruction identifier {}",
                    instruction.identifier
                )));
            }
        }

        let outcomes = join_all(instructions.iter().map(|instruction| self.run_instruction(instruction))).await;

        let mut results = BTreeMap::new();
        for (instruction, outcome) in instructions.iter().zip(outcomes) {
            let result = match outcome {
                Ok(ids) => TransferResult {
                    result: TransferStatus::Success,
                    float_tx_ids: ids.float_tx_ids,
                    account_tx_ids: ids.account_tx_ids,
                    message: None,
                },
                Err(e) => {
                    warn!("Instruction {} failed: {}", instruction.identifier, e);
                    TransferResult {
                        result: TransferStatus::Error,
                        float_tx_ids: Vec::new(),
                        account_tx_ids: Vec::new(),
                        message: Some(e.to_string()),
                    }
                }
            };
            results.insert(instruction.identifier.clone(), result);
        }
        Ok(results)
    }

    async fn run_instruction(&self, instruction: &TransferInstruction) -> Result<InstructionIds> {
        let source = instruction.validate()?;
        let fingerprint = Fingerprint::of("transfer", instruction)?;
        self.guard
            .run(&fingerprint, self.handle_instruction(instruction, source))
            .await
    }

    async fn handle_instruction(&self, instruction: &TransferInstruction, source: Source) -> Result<InstructionIds> {
        if let [single] = instruction.recipients.as_slice() {
            match single.recipient_type {
                RecipientType::FloatItself | RecipientType::AllUsers if source != Source::Float => {
                    return Err(instruction.rejected("float and all-user credits must come from the float"));
                }
                RecipientType::FloatItself => return self.adjust_float(instruction, single.amount).await,
                RecipientType::AllUsers => return self.credit_all_users(instruction, single.amount).await,
                _ => {}
            }
        } else if instruction
            .recipients
            .iter()
            .any(|r| matches!(r.recipient_type, RecipientType::FloatItself | RecipientType::AllUsers))
        {
            return Err(instruction.rejected("float and all-user credits take a single recipient"));
        }

        let total: Amount = instruction.recipients.iter().map(|r| r.amount).sum();

        let mut entity_debits = Vec::new();
        let mut user_debits = Vec::new();
        match &source {
            Source::Float => {}
            Source::Entity(kind, id) => entity_debits.push(instruction.entity_row(-total, *kind, id.clone())),
            Source::User(id) => user_debits.push(instruction.user_row(-total, id.clone())),
        }

        let mut entity_credits = Vec::new();
        let mut user_credits = Vec::new();
        for recipient in &instruction.recipients {
            let to_id = TransferInstruction::recipient_id(recipient);
            match recipient.recipient_type {
                RecipientType::EndUserAccount => user_credits.push(instruction.user_row(recipient.amount, to_id)),
                RecipientType::BonusPool => {
                    entity_credits.push(instruction.entity_row(recipient.amount, EntityType::BonusPool, to_id))
                }
                RecipientType::CompanyShare => {
                    entity_credits.push(instruction.entity_row(recipient.amount, EntityType::CompanyShare, to_id))
                }
                RecipientType::FloatItself | RecipientType::AllUsers => {}
            }
        }

        let entity_rows: Vec<EntityAllocation> = entity_debits.into_iter().chain(entity_credits).collect();
        let user_rows: Vec<UserAllocation> = user_debits.into_iter().chain(user_credits).collect();

        let mut ids = InstructionIds::default();
        if !entity_rows.is_empty() {
            let written = self
                .ledger
                .allocate_float(&instruction.client_id, &instruction.float_id, entity_rows)
                .await?;
            ids.float_tx_ids
                .extend(written.into_iter().map(|tx| tx.transaction_id));
        }
        if !user_rows.is_empty() {
            let written = self
                .ledger
                .allocate_to_users(&instruction.client_id, &instruction.float_id, user_rows)
                .await?;
            ids.float_tx_ids.extend(written.float_tx_ids);
            ids.account_tx_ids.extend(written.account_tx_ids);
        }

        info!(
            "Instruction {} moved {} across {} recipients",
            instruction.identifier,
            total,
            instruction.recipients.len()
        );
        Ok(ids)
    }

    async fn adjust_float(&self, instruction: &TransferInstruction, amount: Amount) -> Result<InstructionIds> {
        let adjustment = self
            .ledger
            .add_or_subtract_float(FloatAdjustment {
                client_id: instruction.client_id.clone(),
                float_id: instruction.float_id.clone(),
                transaction_type: instruction.transaction_type,
                amount,
                currency: instruction.currency.clone(),
                unit: instruction.unit,
                backing_entity_type: instruction.related_entity_type,
                backing_entity_id: instruction.related_entity_id.clone(),
                log_type: instruction.log_type,
                reference_time: None,
            })
            .await?;
        info!(
            "Instruction {} adjusted float {} by {}, balance now {}",
            instruction.identifier, instruction.float_id, amount, adjustment.updated_balance
        );
        Ok(InstructionIds {
            float_tx_ids: vec![adjustment.transaction_id],
            account_tx_ids: Vec::new(),
        })
    }

    async fn credit_all_users(&self, instruction: &TransferInstruction, amount: Amount) -> Result<InstructionIds> {
        let result = self
            .allocate_to_all_users(&AllocationRequest {
                client_id: instruction.client_id.clone(),
                float_id: instruction.float_id.clone(),
                currency: instruction.currency.clone(),
                unit: instruction.unit,
                total_amount: amount,
                transaction_type: instruction.transaction_type,
                transaction_state: TransactionState::Settled,
                settlement_status: instruction.settlement_status,
                backing_entity_type: instruction.related_entity_type,
                backing_entity_identifier: instruction.related_entity_id.clone(),
                bonus_pool_id_for_excess: None,
                log_id: None,
            })
            .await?;
        Ok(InstructionIds {
            float_tx_ids: result.float_tx_ids,
            account_tx_ids: result.account_tx_ids,
        })
    }
}
