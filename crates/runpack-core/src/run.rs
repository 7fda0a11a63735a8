use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoneyState {
    None,
    Reserved,
    Settled,
    Refunded,
    AuditRequired,
}

impl MoneyState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Reserved => "RESERVED",
            Self::Settled => "SETTLED",
            Self::Refunded => "REFUNDED",
            Self::AuditRequired => "AUDIT_REQUIRED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalizeStage {
    Unclaimed,
    Claimed,
    Committed,
}

impl FinalizeStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unclaimed => "UNCLAIMED",
            Self::Claimed => "CLAIMED",
            Self::Committed => "COMMITTED",
        }
    }
}

/// A single asynchronous job instance with a stable identifier.
///
/// Mutated exclusively through [`crate::run_store::RunStore::cas_update`]
/// after [`crate::run_store::RunStore::create`] — see spec.md §3/§4.1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub tenant_id: String,
    pub version: i64,
    pub status: RunStatus,
    pub money_state: MoneyState,
    pub finalize_stage: FinalizeStage,
    pub finalize_token: Option<String>,
    pub finalize_claimed_at: Option<DateTime<Utc>>,
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub reservation_max_cost: Money,
    pub actual_cost: Option<Money>,
    pub minimum_fee: Money,
    pub result_key: Option<String>,
    pub result_hash: Option<String>,
    pub last_error_reason_code: Option<String>,
    pub idempotency_key: Option<String>,
    pub pack_spec: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    #[must_use]
    pub fn new(
        run_id: String,
        tenant_id: String,
        pack_spec: serde_json::Value,
        reservation_max_cost: Money,
        minimum_fee: Money,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            tenant_id,
            version: 1,
            status: RunStatus::Queued,
            money_state: MoneyState::Reserved,
            finalize_stage: FinalizeStage::Unclaimed,
            finalize_token: None,
            finalize_claimed_at: None,
            lease_token: None,
            lease_expires_at: None,
            reservation_max_cost,
            actual_cost: None,
            minimum_fee,
            result_key: None,
            result_hash: None,
            last_error_reason_code: None,
            idempotency_key,
            pack_spec,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-`(tenant_id, run_id)` field updates applied by a single CAS operation.
/// `None` means "leave unchanged".
#[derive(Debug, Clone, Default)]
pub struct RunFieldUpdates {
    pub status: Option<RunStatus>,
    pub money_state: Option<MoneyState>,
    pub finalize_stage: Option<FinalizeStage>,
    pub finalize_token: Option<Option<String>>,
    pub finalize_claimed_at: Option<Option<DateTime<Utc>>>,
    pub lease_token: Option<Option<String>>,
    pub lease_expires_at: Option<Option<DateTime<Utc>>>,
    pub actual_cost: Option<Option<Money>>,
    pub result_key: Option<Option<String>>,
    pub result_hash: Option<Option<String>>,
    pub last_error_reason_code: Option<Option<String>>,
}

/// Equality predicates on fields other than `version`, evaluated as part of
/// the same atomic CAS attempt (spec.md §4.1, §4.4 Case A/B scoped commits).
#[derive(Debug, Clone, Default)]
pub struct RunExtraConditions {
    pub status: Option<RunStatus>,
    pub finalize_stage: Option<FinalizeStage>,
    pub finalize_token: Option<String>,
    pub money_state: Option<MoneyState>,
    pub finalize_claimed_before: Option<DateTime<Utc>>,
}
