use std::collections::HashMap;

use super::{CreditTransaction, Credits, WalletId};

/// Compute the balance for a single wallet from its transaction log.
/// The materialized balance column must always equal this sum.
pub fn sum_deltas(wallet_id: WalletId, transactions: &[CreditTransaction]) -> Credits {
    transactions
        .iter()
        .filter(|tx| tx.wallet_id == wallet_id)
        .map(|tx| tx.delta)
        .sum()
}

/// Compute log-derived balances for every wallet appearing in the list.
pub fn sum_all_deltas(transactions: &[CreditTransaction]) -> HashMap<WalletId, Credits> {
    let mut balances: HashMap<WalletId, Credits> = HashMap::new();
    for tx in transactions {
        *balances.entry(tx.wallet_id).or_insert(0) += tx.delta;
    }
    balances
}

/// One wallet whose materialized balance disagrees with its transaction log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceDrift {
    pub wallet_id: WalletId,
    pub materialized: Credits,
    pub ledger_sum: Credits,
}

/// Integrity report over the whole ledger. The materialized balance column
/// is a cache of the append-only log; a correctness audit recomputes and
/// compares rather than trusting it.
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub wallet_count: i64,
    pub transaction_count: i64,
    pub drifted: Vec<BalanceDrift>,
    pub negative_balances: i64,
    pub zero_deltas: i64,
    pub orphaned_transactions: i64,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.drifted.is_empty()
            && self.negative_balances == 0
            && self.zero_deltas == 0
            && self.orphaned_transactions == 0
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn entry(wallet_id: WalletId, delta: Credits) -> CreditTransaction {
        CreditTransaction::new(wallet_id, delta, "test")
    }

    #[test]
    fn test_sum_deltas_empty() {
        let wallet = Uuid::new_v4();
        assert_eq!(sum_deltas(wallet, &[]), 0);
    }

    #[test]
    fn test_sum_deltas_mixed() {
        let wallet = Uuid::new_v4();
        let other = Uuid::new_v4();
        let txs = vec![
            entry(wallet, 10),
            entry(wallet, -3),
            entry(other, 7),
            entry(wallet, -2),
        ];

        assert_eq!(sum_deltas(wallet, &txs), 5);
        assert_eq!(sum_deltas(other, &txs), 7);
    }

    #[test]
    fn test_sum_all_deltas() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let txs = vec![entry(a, 4), entry(b, 2), entry(a, -1)];

        let balances = sum_all_deltas(&txs);
        assert_eq!(balances.get(&a), Some(&3));
        assert_eq!(balances.get(&b), Some(&2));
    }

    #[test]
    fn test_clean_report() {
        let report = IntegrityReport {
            wallet_count: 3,
            transaction_count: 12,
            drifted: vec![],
            negative_balances: 0,
            zero_deltas: 0,
            orphaned_transactions: 0,
        };
        assert!(report.is_clean());
    }

    #[test]
    fn test_drift_flags_report() {
        let report = IntegrityReport {
            wallet_count: 1,
            transaction_count: 2,
            drifted: vec![BalanceDrift {
                wallet_id: Uuid::new_v4(),
                materialized: 5,
                ledger_sum: 4,
            }],
            negative_balances: 0,
            zero_deltas: 0,
            orphaned_transactions: 0,
        };
        assert!(!report.is_clean());
    }
}
