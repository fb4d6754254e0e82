use thiserror::Error;

use crate::domain::{Credits, OwnerRef};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid owner: {0}")]
    InvalidOwner(String),

    #[error("Invalid history cursor: {0}")]
    InvalidCursor(String),

    #[error("Insufficient balance for {owner}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        owner: OwnerRef,
        balance: Credits,
        requested: Credits,
    },

    #[error("Concurrent balance updates did not settle after {attempts} attempts")]
    TransientConflict { attempts: u32 },

    #[error("Allocation rule not found: {0}")]
    RuleNotFound(String),

    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}
