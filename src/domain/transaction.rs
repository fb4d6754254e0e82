use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Credits, WalletId};

pub type TransactionId = Uuid;

/// An immutable ledger entry recording a balance delta and its cause.
/// Transactions are append-only - corrections are made by writing a
/// compensating entry, never by editing history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: TransactionId,
    /// Owning wallet
    pub wallet_id: WalletId,
    /// Signed amount: positive = credit, negative = debit. Never zero.
    pub delta: Credits,
    /// Free-text classification ("signup bonus", "booking", allocation tags)
    pub reason: String,
    /// Correlates a debit to the booking that consumed the credit
    pub booking_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Acting user, absent for system-generated allocations
    pub created_by: Option<String>,
}

impl CreditTransaction {
    pub fn new(wallet_id: WalletId, delta: Credits, reason: impl Into<String>) -> Self {
        assert!(delta != 0, "Transaction delta must be nonzero");
        Self {
            id: Uuid::new_v4(),
            wallet_id,
            delta,
            reason: reason.into(),
            booking_id: None,
            created_at: Utc::now(),
            created_by: None,
        }
    }

    pub fn with_booking_id(mut self, booking_id: impl Into<String>) -> Self {
        self.booking_id = Some(booking_id.into());
        self
    }

    pub fn with_created_by(mut self, actor: impl Into<String>) -> Self {
        self.created_by = Some(actor.into());
        self
    }

    pub fn is_credit(&self) -> bool {
        self.delta > 0
    }

    pub fn is_debit(&self) -> bool {
        self.delta < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_credit_entry() {
        let wallet_id = Uuid::new_v4();
        let tx = CreditTransaction::new(wallet_id, 5, "signup bonus").with_created_by("admin-1");

        assert_eq!(tx.wallet_id, wallet_id);
        assert_eq!(tx.delta, 5);
        assert_eq!(tx.reason, "signup bonus");
        assert_eq!(tx.created_by, Some("admin-1".to_string()));
        assert!(tx.is_credit());
        assert!(!tx.is_debit());
    }

    #[test]
    fn test_create_debit_entry_with_booking() {
        let tx = CreditTransaction::new(Uuid::new_v4(), -1, "booking").with_booking_id("bk-42");

        assert_eq!(tx.delta, -1);
        assert_eq!(tx.booking_id, Some("bk-42".to_string()));
        assert!(tx.is_debit());
    }

    #[test]
    #[should_panic(expected = "Transaction delta must be nonzero")]
    fn test_transaction_requires_nonzero_delta() {
        CreditTransaction::new(Uuid::new_v4(), 0, "noop");
    }
}
