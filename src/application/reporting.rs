use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CreditType, Credits, MemberRole, RuleId, TransactionId};

/// Allocated vs consumed credits for one organization over one calendar
/// period. Pure projection over the transaction log; reads may lag writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub organization_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub allocated: Credits,
    pub consumed: Credits,
    pub net: Credits,
    pub by_credit_type: Vec<CreditTypeUsage>,
    pub by_role: Vec<RoleUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTypeUsage {
    pub credit_type: CreditType,
    pub allocated: Credits,
    pub consumed: Credits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleUsage {
    pub role: MemberRole,
    pub allocated: Credits,
    pub consumed: Credits,
}

// Helper struct for repository aggregation
#[derive(Debug, Clone)]
pub struct UsageTotals {
    pub allocated: Credits,
    pub consumed: Credits,
}

/// Outcome of one allocation run. Per-member failures are collected here
/// rather than aborting the batch, so operators can see who was skipped
/// and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRunReport {
    pub ran_at: DateTime<Utc>,
    pub granted: Vec<AllocationGrant>,
    /// Members whose wallet already held this period's grant tag.
    pub already_granted: u64,
    pub failures: Vec<AllocationFailure>,
}

impl AllocationRunReport {
    pub fn new(ran_at: DateTime<Utc>) -> Self {
        Self {
            ran_at,
            granted: Vec::new(),
            already_granted: 0,
            failures: Vec::new(),
        }
    }

    /// Total credits handed out by this run.
    pub fn granted_total(&self) -> Credits {
        self.granted.iter().map(|g| g.amount).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationGrant {
    pub rule_id: RuleId,
    pub organization_id: String,
    pub user_id: String,
    pub credit_type: CreditType,
    pub amount: Credits,
    pub transaction_id: TransactionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationFailure {
    pub rule_id: RuleId,
    pub organization_id: String,
    pub user_id: String,
    pub error: String,
}
