use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use engage_core::error::{EngageError, Result};
use engage_core::types::TenantId;

/// A billable account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub parent_id: Option<TenantId>,
    /// Depth in the hierarchy; roots are level 0.
    pub level: u32,
    /// Materialized balance. Always equal to the sum of the tenant's log.
    pub balance: Decimal,
    pub currency: String,
    pub low_balance_threshold: Decimal,
    pub active: bool,
    /// Sequence number of the last transaction posted.
    pub last_seq: i64,
    pub created_at: DateTime<Utc>,
}

/// Parameters for onboarding a tenant.
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub id: TenantId,
    pub parent_id: Option<TenantId>,
    pub currency: String,
    pub low_balance_threshold: Decimal,
}

impl NewTenant {
    pub fn root(id: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            id: TenantId(id.into()),
            parent_id: None,
            currency: currency.into(),
            low_balance_threshold: Decimal::ZERO,
        }
    }

    pub fn child_of(mut self, parent: &TenantId) -> Self {
        self.parent_id = Some(parent.clone());
        self
    }

    pub fn with_threshold(mut self, threshold: Decimal) -> Self {
        self.low_balance_threshold = threshold;
        self
    }
}

/// Why a transaction was posted.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Topup,
    MessageCost,
    Refund,
    Adjustment,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Topup => "topup",
            Reason::MessageCost => "message_cost",
            Reason::Refund => "refund",
            Reason::Adjustment => "adjustment",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Reason {
    type Err = EngageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "topup" => Ok(Reason::Topup),
            "message_cost" => Ok(Reason::MessageCost),
            "refund" => Ok(Reason::Refund),
            "adjustment" => Ok(Reason::Adjustment),
            other => Err(EngageError::Database(format!("unknown ledger reason '{}'", other))),
        }
    }
}

/// An immutable ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: String,
    pub tenant_id: TenantId,
    /// Per-tenant commit order, starting at 1.
    pub seq: i64,
    /// Signed: credits positive, debits negative.
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub reason: Reason,
    /// Run/step/attempt key, or a payment reference for top-ups.
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn is_debit(&self) -> bool {
        self.amount.is_sign_negative()
    }
}

/// Balance as exposed to the billing UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceView {
    pub amount: Decimal,
    pub currency: String,
}
