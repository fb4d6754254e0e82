use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::application::CreditLedgerService;
use crate::domain::{CreditAllocationRule, CreditTransaction, CreditWallet, OrgMember};

/// Database snapshot for full export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub wallets: Vec<CreditWallet>,
    pub transactions: Vec<CreditTransaction>,
    pub rules: Vec<CreditAllocationRule>,
    pub members: Vec<OrgMember>,
}

/// Exporter for converting ledger data to various formats
pub struct Exporter<'a> {
    service: &'a CreditLedgerService,
}

impl<'a> Exporter<'a> {
    pub fn new(service: &'a CreditLedgerService) -> Self {
        Self { service }
    }

    /// Export the full transaction log to CSV format
    pub async fn export_transactions_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let transactions = self.service.list_all_transactions().await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        // Write header
        csv_writer.write_record([
            "id",
            "wallet_id",
            "delta",
            "reason",
            "booking_id",
            "created_by",
            "created_at",
        ])?;

        let mut count = 0;
        for tx in &transactions {
            csv_writer.write_record([
                tx.id.to_string(),
                tx.wallet_id.to_string(),
                tx.delta.to_string(),
                tx.reason.clone(),
                tx.booking_id.clone().unwrap_or_default(),
                tx.created_by.clone().unwrap_or_default(),
                tx.created_at.to_rfc3339(),
            ])?;
            count += 1;
        }

        csv_writer.flush()?;
        Ok(count)
    }

    /// Export wallet balances to CSV format
    pub async fn export_wallets_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let wallets = self.service.list_all_wallets().await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        // Write header
        csv_writer.write_record(["owner_type", "owner_id", "credit_type", "balance", "expires_at"])?;

        let mut count = 0;
        for wallet in &wallets {
            csv_writer.write_record([
                wallet.owner.owner_type.as_str().to_string(),
                wallet.owner.owner_id.clone(),
                wallet.credit_type.as_str().to_string(),
                wallet.balance.to_string(),
                wallet
                    .expires_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_default(),
            ])?;
            count += 1;
        }

        csv_writer.flush()?;
        Ok(count)
    }

    /// Export full database as JSON snapshot
    pub async fn export_full_json<W: Write>(&self, mut writer: W) -> Result<DatabaseSnapshot> {
        let wallets = self.service.list_all_wallets().await?;
        let transactions = self.service.list_all_transactions().await?;
        let rules = self.service.list_rules(None).await?;
        let members = self.service.list_all_members().await?;

        let snapshot = DatabaseSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: Utc::now(),
            wallets,
            transactions,
            rules,
            members,
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        writer.write_all(json.as_bytes())?;
        writer.flush()?;

        Ok(snapshot)
    }
}
