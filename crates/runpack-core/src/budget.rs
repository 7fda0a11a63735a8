use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::money::Money;

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("balance insufficient for reservation")]
    Insufficient,
    #[error("reservation exists for this run with a different amount")]
    Duplicate,
    #[error("no reservation exists for this run")]
    NoReserve,
    #[error("ledger error: {0}")]
    Ledger(String),
}

#[derive(Debug, Clone, Copy)]
pub struct SettleOutcome {
    pub charge: Money,
    pub refund: Money,
    pub new_balance: Money,
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub tenant_id: String,
    pub run_id: String,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Fast atomic ledger. Every method here corresponds to exactly one
/// atomic script against the underlying store — no partial application of
/// a reserve/settle/refund is ever observable (spec.md §4.2).
#[async_trait]
pub trait BudgetEngine: Send + Sync {
    async fn reserve(
        &self,
        tenant_id: &str,
        run_id: &str,
        amount: Money,
        soft_limit: Money,
    ) -> Result<SettleOutcome, BudgetError>;

    /// NOT idempotent: the second caller racing to settle the same run
    /// MUST observe [`BudgetError::NoReserve`]. The Finalize Protocol relies
    /// on this to detect and abort the losing side of a race.
    async fn settle(
        &self,
        tenant_id: &str,
        run_id: &str,
        actual_amount: Money,
    ) -> Result<SettleOutcome, BudgetError>;

    async fn refund(
        &self,
        tenant_id: &str,
        run_id: &str,
        minimum_fee: Money,
    ) -> Result<SettleOutcome, BudgetError> {
        self.settle(tenant_id, run_id, minimum_fee).await
    }

    async fn get_reservation(
        &self,
        tenant_id: &str,
        run_id: &str,
    ) -> Result<Option<Reservation>, BudgetError>;
}

#[must_use]
pub fn memory(reservation_ttl: Duration) -> MemoryBudgetEngine {
    MemoryBudgetEngine::new(reservation_ttl)
}

pub struct MemoryBudgetEngine {
    reservation_ttl: Duration,
    inner: Mutex<MemoryBudgetInner>,
}

#[derive(Default)]
struct MemoryBudgetInner {
    accounts: HashMap<String, LedgerAccountState>,
    reservations: HashMap<(String, String), Reservation>,
}

struct LedgerAccountState {
    balance: Money,
}

impl MemoryBudgetEngine {
    #[must_use]
    pub fn new(reservation_ttl: Duration) -> Self {
        Self {
            reservation_ttl,
            inner: Mutex::new(MemoryBudgetInner::default()),
        }
    }

    /// Test/bootstrap helper: seeds a tenant's starting balance.
    pub async fn credit(&self, tenant_id: &str, amount: Money) {
        let mut inner = self.inner.lock().await;
        let account = inner
            .accounts
            .entry(tenant_id.to_string())
            .or_insert(LedgerAccountState {
                balance: Money::ZERO,
            });
        account.balance = account
            .balance
            .checked_add(amount)
            .unwrap_or(account.balance);
    }

    pub async fn balance(&self, tenant_id: &str) -> Money {
        let inner = self.inner.lock().await;
        inner
            .accounts
            .get(tenant_id)
            .map_or(Money::ZERO, |a| a.balance)
    }
}

#[async_trait]
impl BudgetEngine for MemoryBudgetEngine {
    async fn reserve(
        &self,
        tenant_id: &str,
        run_id: &str,
        amount: Money,
        soft_limit: Money,
    ) -> Result<SettleOutcome, BudgetError> {
        let mut inner = self.inner.lock().await;
        let key = (tenant_id.to_string(), run_id.to_string());

        if let Some(existing) = inner.reservations.get(&key) {
            if existing.amount == amount {
                let balance = inner
                    .accounts
                    .get(tenant_id)
                    .map_or(Money::ZERO, |a| a.balance);
                return Ok(SettleOutcome {
                    charge: Money::ZERO,
                    refund: Money::ZERO,
                    new_balance: balance,
                });
            }
            return Err(BudgetError::Duplicate);
        }

        let account = inner
            .accounts
            .entry(tenant_id.to_string())
            .or_insert(LedgerAccountState {
                balance: Money::ZERO,
            });
        let candidate = account
            .balance
            .checked_sub(amount)
            .ok_or_else(|| BudgetError::Ledger("balance underflow".to_string()))?;
        if candidate < soft_limit {
            return Err(BudgetError::Insufficient);
        }
        account.balance = candidate;
        let new_balance = account.balance;

        let now = Utc::now();
        inner.reservations.insert(
            key,
            Reservation {
                tenant_id: tenant_id.to_string(),
                run_id: run_id.to_string(),
                amount,
                created_at: now,
                expires_at: now + self.reservation_ttl,
            },
        );
        Ok(SettleOutcome {
            charge: Money::ZERO,
            refund: Money::ZERO,
            new_balance,
        })
    }

    async fn settle(
        &self,
        tenant_id: &str,
        run_id: &str,
        actual_amount: Money,
    ) -> Result<SettleOutcome, BudgetError> {
        let mut inner = self.inner.lock().await;
        let key = (tenant_id.to_string(), run_id.to_string());
        let Some(reservation) = inner.reservations.remove(&key) else {
            return Err(BudgetError::NoReserve);
        };

        let charge = actual_amount.min(reservation.amount);
        let refund = reservation
            .amount
            .checked_sub(charge)
            .ok_or_else(|| BudgetError::Ledger("refund underflow".to_string()))?;

        let account = inner
            .accounts
            .entry(tenant_id.to_string())
            .or_insert(LedgerAccountState {
                balance: Money::ZERO,
            });
        account.balance = account
            .balance
            .checked_add(refund)
            .ok_or_else(|| BudgetError::Ledger("balance overflow on refund credit".to_string()))?;

        Ok(SettleOutcome {
            charge,
            refund,
            new_balance: account.balance,
        })
    }

    async fn get_reservation(
        &self,
        tenant_id: &str,
        run_id: &str,
    ) -> Result<Option<Reservation>, BudgetError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .reservations
            .get(&(tenant_id.to_string(), run_id.to_string()))
            .cloned())
    }
}
