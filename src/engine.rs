//! Engine facade and request envelope.
//!
//! [`FloatEngine`] holds the collaborators every pipeline needs. The
//! pipelines themselves live in their own modules as `impl FloatEngine`
//! blocks; this module only wires them up and maps envelopes onto them.

use crate::accrual::AccrualRequest;
use crate::allocation::AllocationRequest;
use crate::archive::{Archive, CsvArchive};
use crate::cache::CacheStore;
use crate::capitalization::{CapitalizationRequest, Caller};
use crate::config::{ConfigStore, EngineSettings};
use crate::error::{EngineError, ErrorKind, Result};
use crate::guard::IdempotencyGuard;
use crate::ledger::LedgerStore;
use crate::transfer::TransferInstruction;
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// The float allocation engine.
///
/// Stateless apart from its collaborators: any number of engines may share
/// one ledger and one cache, and the cache-backed guard keeps them from
/// applying the same operation twice.
pub struct FloatEngine {
    pub(crate) ledger: Arc<dyn LedgerStore>,
    pub(crate) config: Arc<dyn ConfigStore>,
    pub(crate) guard: IdempotencyGuard,
    pub(crate) archive: Option<Arc<dyn Archive>>,
    pub(crate) settings: EngineSettings,
}

impl FloatEngine {
    /// Creates an engine. A CSV archive is attached when the settings name
    /// an archive directory.
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        config: Arc<dyn ConfigStore>,
        cache: Arc<dyn CacheStore>,
        settings: EngineSettings,
    ) -> Self {
        let guard = IdempotencyGuard::new(cache, settings.cache_key_prefix.clone())
            .with_timing(settings.lock_ttl(), settings.poll_interval());
        let archive = settings
            .archive_dir
            .clone()
            .map(|dir| Arc::new(CsvArchive::new(dir)) as Arc<dyn Archive>);

        FloatEngine {
            ledger,
            config,
            guard,
            archive,
            settings,
        }
    }

    /// Replaces the audit archive.
    pub fn with_archive(mut self, archive: Arc<dyn Archive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

/// Operation named by an [`EngineRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Accrue,
    Allocate,
    CapitalizationPreview,
    CapitalizationConfirm,
    Transfer,
}

/// Transport-neutral request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineRequest {
    pub operation: Operation,
    #[serde(default)]
    pub caller: Option<Caller>,
    pub payload: Value,
}

/// Transport-neutral response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineResponse {
    pub status_code: u16,
    pub body: Value,
}

impl EngineResponse {
    fn ok<T: Serialize>(body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => EngineResponse { status_code: 200, body },
            Err(e) => Self::from_error(&EngineError::Json(e)),
        }
    }

    fn from_error(err: &EngineError) -> Self {
        let status_code = match err.kind() {
            ErrorKind::Validation | ErrorKind::BusinessRule => 400,
            ErrorKind::Unauthorized => 403,
            ErrorKind::Unexpected => 500,
        };
        EngineResponse {
            status_code,
            body: json!({ "message": err.to_string() }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

fn parse_payload<T: DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| EngineError::InvalidRequest(e.to_string()))
}

impl FloatEngine {
    /// Dispatches an envelope and maps the outcome onto a status code.
    pub async fn handle(&self, request: EngineRequest) -> EngineResponse {
        debug!("Handling {:?}", request.operation);
        let outcome = self.dispatch(request).await;
        match outcome {
            Ok(response) => response,
            Err(e) => {
                let response = EngineResponse::from_error(&e);
                if response.status_code == 500 {
                    error!("Operation failed: {}", e);
                } else {
                    warn!("Operation rejected: {}", e);
                }
                response
            }
        }
    }

    /// Parses a raw JSON envelope, then dispatches it.
    pub async fn handle_json(&self, raw: &str) -> EngineResponse {
        match serde_json::from_str::<EngineRequest>(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => EngineResponse::from_error(&EngineError::InvalidRequest(e.to_string())),
        }
    }

    async fn dispatch(&self, request: EngineRequest) -> Result<EngineResponse> {
        let caller = || {
            request.caller.clone().ok_or(EngineError::Unauthorized {
                role: "ANONYMOUS".to_string(),
                operation: "capitalization",
            })
        };

        let response = match request.operation {
            Operation::Accrue => {
                let payload: AccrualRequest = parse_payload(request.payload.clone())?;
                EngineResponse::ok(&self.accrue(payload).await?)
            }
            Operation::Allocate => {
                let payload: AllocationRequest = parse_payload(request.payload.clone())?;
                EngineResponse::ok(&self.allocate(payload).await?)
            }
            Operation::CapitalizationPreview => {
                let caller = caller()?;
                let payload: CapitalizationRequest = parse_payload(request.payload.clone())?;
                EngineResponse::ok(&self.capitalization_preview(&caller, payload).await?)
            }
            Operation::CapitalizationConfirm => {
                let caller = caller()?;
                let payload: CapitalizationRequest = parse_payload(request.payload.clone())?;
                EngineResponse::ok(&self.capitalization_confirm(&caller, payload).await?)
            }
            Operation::Transfer => {
                let payload: Vec<TransferInstruction> = parse_payload(request.payload.clone())?;
                EngineResponse::ok(&self.transfer(payload).await?)
            }
        };
        Ok(response)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::FloatConfig;
    use crate::memory::{LedgerOp, MemoryCache, MemoryConfigStore, MemoryLedger};
    use crate::units::Unit;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    pub(crate) const CLIENT: &str = "some_client";
    pub(crate) const FLOAT: &str = "zar_mmkt";

    pub(crate) fn float_config() -> FloatConfig {
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

    pub(crate) fn memory_engine_with(config: FloatConfig) -> (FloatEngine, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let settings = EngineSettings {
            cache_ttl_seconds: 5,
            poll_interval_millis: 5,
            ..EngineSettings::default()
        };
        let engine = FloatEngine::new(
            ledger.clone(),
            Arc::new(MemoryConfigStore::from_configs([config])),
            Arc::new(MemoryCache::new()),
            settings,
        );
        (engine, ledger)
    }

    pub(crate) fn memory_engine() -> (FloatEngine, Arc<MemoryLedger>) {
        memory_engine_with(float_config())
    }

    fn accrual_envelope(backing: &str) -> EngineRequest {
        EngineRequest {
            operation: Operation::Accrue,
            caller: None,
            payload: json!({
                "clientId": CLIENT,
                "floatId": FLOAT,
                "accrualAmount": 1000,
                "backingEntityIdentifier": backing,
            }),
        }
    }

    #[tokio::test]
    async fn test_handle_accrual_succeeds() {
        let (engine, _ledger) = memory_engine();
        let response = engine.handle(accrual_envelope("tx-1")).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body["newBalance"], json!(1000));
    }

    #[tokio::test]
    async fn test_handle_maps_statuses() {
        let (engine, ledger) = memory_engine();

        let bad_payload = EngineRequest {
            operation: Operation::Accrue,
            caller: None,
            payload: json!({ "clientId": CLIENT, "accrualAmount": 10.5 }),
        };
        assert_eq!(engine.handle(bad_payload).await.status_code, 400);

        let anonymous = EngineRequest {
            operation: Operation::CapitalizationPreview,
            caller: None,
            payload: json!({}),
        };
        assert_eq!(engine.handle(anonymous).await.status_code, 403);

        ledger.fail_on(LedgerOp::AddOrSubtractFloat);
        let response = engine.handle(accrual_envelope("tx-2")).await;
        assert_eq!(response.status_code, 500);
        assert!(response.body["message"]
            .as_str()
            .unwrap()
            .starts_with("Persistence error"));
    }

    #[tokio::test]
    async fn test_handle_json_rejects_garbage() {
        let (engine, _ledger) = memory_engine();
        let response = engine.handle_json("{not json").await;
        assert_eq!(response.status_code, 400);
        assert!(!response.is_success());
    }
}
