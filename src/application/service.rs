use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::domain::{
    allocation_reason, CreditAllocationRule, CreditBalance, CreditTransaction, CreditType,
    CreditWallet, Credits, Frequency, IntegrityReport, OrgMember, OwnerRef, RuleId, TargetRole,
    TransactionId,
};
use crate::storage::{DeltaOutcome, Repository};

use super::reporting::{AllocationFailure, AllocationGrant, AllocationRunReport, UsageReport};
use super::LedgerError;

/// Largest history page a single call will return.
const MAX_PAGE_SIZE: u32 = 500;

/// Application service providing the ledger, allocation and reporting
/// operations. This is the primary interface for any client (CLI, API,
/// scheduler) and the only mutation path to balances.
pub struct CreditLedgerService {
    repo: Repository,
}

/// One page of a wallet's history, newest first, restartable via the
/// opaque cursor.
#[derive(Debug, Clone)]
pub struct TransactionPage {
    pub transactions: Vec<CreditTransaction>,
    pub next_cursor: Option<String>,
}

fn encode_cursor(tx: &CreditTransaction) -> String {
    format!(
        "{}|{}",
        tx.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        tx.id
    )
}

fn decode_cursor(cursor: &str) -> Option<(DateTime<Utc>, TransactionId)> {
    let (ts, id) = cursor.split_once('|')?;
    let created_at = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
    let id = Uuid::parse_str(id).ok()?;
    Some((created_at, id))
}

impl CreditLedgerService {
    /// Create a new service with the given repository.
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Initialize a new database at the given path.
    pub async fn init(database_path: &str) -> Result<Self, LedgerError> {
        let db_url = format!("sqlite:{}?mode=rwc", database_path);
        let repo = Repository::init(&db_url).await?;
        Ok(Self::new(repo))
    }

    /// Connect to an existing database.
    pub async fn connect(database_path: &str) -> Result<Self, LedgerError> {
        let db_url = format!("sqlite:{}", database_path);
        let repo = Repository::connect(&db_url).await?;
        Ok(Self::new(repo))
    }

    fn validate_amount(amount: Credits) -> Result<(), LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "amount must be positive, got {}",
                amount
            )));
        }
        Ok(())
    }

    fn validate_owner(owner: &OwnerRef) -> Result<(), LedgerError> {
        if owner.owner_id.trim().is_empty() {
            return Err(LedgerError::InvalidOwner(
                "owner id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn map_outcome(
        owner: &OwnerRef,
        requested: Credits,
        outcome: DeltaOutcome,
    ) -> Result<CreditTransaction, LedgerError> {
        match outcome {
            DeltaOutcome::Applied(tx) => Ok(tx),
            DeltaOutcome::Insufficient { balance } => Err(LedgerError::InsufficientBalance {
                owner: owner.clone(),
                balance,
                requested,
            }),
            // Lapsed credits are no longer redeemable
            DeltaOutcome::Lapsed { .. } => Err(LedgerError::InsufficientBalance {
                owner: owner.clone(),
                balance: 0,
                requested,
            }),
            DeltaOutcome::Conflicted { attempts } => {
                Err(LedgerError::TransientConflict { attempts })
            }
        }
    }

    // ========================
    // Ledger operations
    // ========================

    /// Balance for one owner and credit type. A missing wallet reads as
    /// zero, not as an error.
    pub async fn balance(
        &self,
        owner: &OwnerRef,
        credit_type: CreditType,
    ) -> Result<CreditBalance, LedgerError> {
        Self::validate_owner(owner)?;
        Ok(self
            .repo
            .get_wallet(owner, credit_type)
            .await?
            .map(|wallet| wallet.projection())
            .unwrap_or_else(|| CreditBalance::empty(credit_type)))
    }

    /// Balances for every wallet held by one owner.
    pub async fn balances(&self, owner: &OwnerRef) -> Result<Vec<CreditBalance>, LedgerError> {
        Self::validate_owner(owner)?;
        let wallets = self.repo.list_wallets_for_owner(owner).await?;
        Ok(wallets.iter().map(CreditWallet::projection).collect())
    }

    /// Grant credits to an owner. Creates the wallet on first touch;
    /// appends the transaction and moves the balance atomically.
    pub async fn credit(
        &self,
        owner: &OwnerRef,
        credit_type: CreditType,
        amount: Credits,
        reason: &str,
        created_by: Option<&str>,
    ) -> Result<CreditTransaction, LedgerError> {
        Self::validate_owner(owner)?;
        Self::validate_amount(amount)?;
        let outcome = self
            .repo
            .apply_delta(owner, credit_type, amount, reason, None, created_by)
            .await?;
        Self::map_outcome(owner, amount, outcome)
    }

    /// Consume credits, typically when a booking is confirmed. Fails with
    /// `InsufficientBalance` rather than ever driving a balance negative.
    pub async fn debit(
        &self,
        owner: &OwnerRef,
        credit_type: CreditType,
        amount: Credits,
        reason: &str,
        booking_id: Option<&str>,
        created_by: Option<&str>,
    ) -> Result<CreditTransaction, LedgerError> {
        Self::validate_owner(owner)?;
        Self::validate_amount(amount)?;
        let outcome = self
            .repo
            .apply_delta(owner, credit_type, -amount, reason, booking_id, created_by)
            .await?;
        Self::map_outcome(owner, amount, outcome)
    }

    /// One page of an owner's transaction history, newest first. Pass the
    /// returned cursor back in to continue where the page ended.
    pub async fn history(
        &self,
        owner: &OwnerRef,
        credit_type: CreditType,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<TransactionPage, LedgerError> {
        Self::validate_owner(owner)?;
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let before = cursor
            .map(|c| decode_cursor(c).ok_or_else(|| LedgerError::InvalidCursor(c.to_string())))
            .transpose()?;

        let Some(wallet) = self.repo.get_wallet(owner, credit_type).await? else {
            return Ok(TransactionPage {
                transactions: Vec::new(),
                next_cursor: None,
            });
        };

        let transactions = self
            .repo
            .page_transactions(wallet.id, before, limit as i64)
            .await?;
        let next_cursor = if transactions.len() as u32 == limit {
            transactions.last().map(encode_cursor)
        } else {
            None
        };

        Ok(TransactionPage {
            transactions,
            next_cursor,
        })
    }

    /// Set or clear the soft expiry on an existing wallet.
    pub async fn set_expiry(
        &self,
        owner: &OwnerRef,
        credit_type: CreditType,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<CreditWallet, LedgerError> {
        Self::validate_owner(owner)?;
        self.repo
            .set_wallet_expiry(owner, credit_type, expires_at)
            .await?
            .ok_or_else(|| LedgerError::WalletNotFound(format!("{}/{}", owner, credit_type)))
    }

    // ========================
    // Allocation rules
    // ========================

    /// Create a standing allocation rule for an organization.
    pub async fn create_rule(
        &self,
        organization_id: &str,
        credit_type: CreditType,
        amount: Credits,
        frequency: Frequency,
        target_role: TargetRole,
    ) -> Result<CreditAllocationRule, LedgerError> {
        if organization_id.trim().is_empty() {
            return Err(LedgerError::InvalidOwner(
                "organization id must not be empty".to_string(),
            ));
        }
        Self::validate_amount(amount)?;

        let rule =
            CreditAllocationRule::new(organization_id, credit_type, amount, frequency, target_role);
        self.repo.save_rule(&rule).await?;
        Ok(rule)
    }

    /// Get a rule by id.
    pub async fn get_rule(&self, id: RuleId) -> Result<CreditAllocationRule, LedgerError> {
        self.repo
            .get_rule(id)
            .await?
            .ok_or_else(|| LedgerError::RuleNotFound(id.to_string()))
    }

    /// List rules, optionally restricted to one organization.
    pub async fn list_rules(
        &self,
        organization_id: Option<&str>,
    ) -> Result<Vec<CreditAllocationRule>, LedgerError> {
        Ok(self.repo.list_rules(organization_id).await?)
    }

    /// Stop a rule's future runs. Past grants stand.
    pub async fn deactivate_rule(&self, id: RuleId) -> Result<(), LedgerError> {
        if !self.repo.set_rule_active(id, false).await? {
            return Err(LedgerError::RuleNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Apply every active rule whose current period has not been granted
    /// yet. Grants are keyed by a deterministic reason tag per (rule,
    /// period), so re-runs and interrupted batches only backfill what is
    /// missing. A failure for one member never aborts the rest of the run.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<AllocationRunReport, LedgerError> {
        let rules = self.repo.list_active_rules().await?;
        let mut report = AllocationRunReport::new(now);

        for rule in rules {
            let period_start = rule.frequency.period_start(now);
            let tag = allocation_reason(rule.id, period_start);
            let members = self.repo.list_members(&rule.organization_id).await?;

            for member in members {
                if !member.is_active || !rule.target_role.matches(member.role) {
                    continue;
                }
                let owner = OwnerRef::user(member.user_id.clone());

                match self.grant_once(&rule, &owner, &tag).await {
                    Ok(Some(tx)) => report.granted.push(AllocationGrant {
                        rule_id: rule.id,
                        organization_id: rule.organization_id.clone(),
                        user_id: member.user_id,
                        credit_type: rule.credit_type,
                        amount: rule.amount,
                        transaction_id: tx.id,
                    }),
                    Ok(None) => report.already_granted += 1,
                    Err(err) => {
                        tracing::warn!(
                            rule_id = %rule.id,
                            user_id = %member.user_id,
                            error = %err,
                            "allocation grant failed"
                        );
                        report.failures.push(AllocationFailure {
                            rule_id: rule.id,
                            organization_id: rule.organization_id.clone(),
                            user_id: member.user_id,
                            error: err.to_string(),
                        });
                    }
                }
            }

            self.repo.touch_rule_run(rule.id, now).await?;
        }

        tracing::info!(
            granted = report.granted.len(),
            already_granted = report.already_granted,
            failed = report.failures.len(),
            "allocation run complete"
        );
        Ok(report)
    }

    /// Grant one rule's amount to one member unless this period's tag is
    /// already present on the wallet.
    async fn grant_once(
        &self,
        rule: &CreditAllocationRule,
        owner: &OwnerRef,
        tag: &str,
    ) -> Result<Option<CreditTransaction>, LedgerError> {
        if self.repo.reason_exists(owner, rule.credit_type, tag).await? {
            return Ok(None);
        }
        let tx = self
            .credit(owner, rule.credit_type, rule.amount, tag, None)
            .await?;
        Ok(Some(tx))
    }

    // ========================
    // Organization members
    // ========================

    /// Mirror a membership row from the organization directory. Content is
    /// trusted as given; the ledger never re-authenticates.
    pub async fn upsert_member(&self, member: &OrgMember) -> Result<(), LedgerError> {
        Ok(self.repo.upsert_member(member).await?)
    }

    /// List an organization's members.
    pub async fn list_members(&self, organization_id: &str) -> Result<Vec<OrgMember>, LedgerError> {
        Ok(self.repo.list_members(organization_id).await?)
    }

    // ========================
    // Reporting
    // ========================

    /// Allocated vs consumed for the organization's current calendar
    /// period, with per-credit-type and per-role breakdowns.
    pub async fn usage_report(
        &self,
        organization_id: &str,
        frequency: Frequency,
        now: DateTime<Utc>,
    ) -> Result<UsageReport, LedgerError> {
        let period_start = frequency.period_start(now);
        let period_end = frequency.period_end(now);

        let totals = self
            .repo
            .sum_usage(organization_id, period_start, period_end)
            .await?;
        let by_credit_type = self
            .repo
            .usage_by_credit_type(organization_id, period_start, period_end)
            .await?;
        let by_role = self
            .repo
            .usage_by_role(organization_id, period_start, period_end)
            .await?;

        Ok(UsageReport {
            organization_id: organization_id.to_string(),
            period_start,
            period_end,
            allocated: totals.allocated,
            consumed: totals.consumed,
            net: totals.allocated - totals.consumed,
            by_credit_type,
            by_role,
        })
    }

    // ========================
    // Integrity
    // ========================

    /// Recompute balances from the transaction log and report any drift
    /// from the materialized column.
    pub async fn verify_integrity(&self) -> Result<IntegrityReport, LedgerError> {
        Ok(self.repo.integrity_report().await?)
    }

    // ========================
    // Export surface
    // ========================

    pub async fn list_all_wallets(&self) -> Result<Vec<CreditWallet>, LedgerError> {
        Ok(self.repo.list_all_wallets().await?)
    }

    pub async fn list_all_transactions(&self) -> Result<Vec<CreditTransaction>, LedgerError> {
        Ok(self.repo.list_all_transactions().await?)
    }

    pub async fn list_all_members(&self) -> Result<Vec<OrgMember>, LedgerError> {
        Ok(self.repo.list_all_members().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip() {
        let tx = CreditTransaction::new(Uuid::new_v4(), 3, "test");
        let encoded = encode_cursor(&tx);
        let (created_at, id) = decode_cursor(&encoded).unwrap();
        assert_eq!(id, tx.id);
        // The cursor carries microsecond precision
        assert_eq!(created_at.timestamp_micros(), tx.created_at.timestamp_micros());
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(decode_cursor("not-a-cursor").is_none());
        assert!(decode_cursor("2024-01-01T00:00:00Z|not-a-uuid").is_none());
    }
}
