use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::application::reporting::{CreditTypeUsage, RoleUsage, UsageTotals};
use crate::domain::{
    BalanceDrift, CreditAllocationRule, CreditTransaction, CreditType, CreditWallet, Credits,
    Frequency, IntegrityReport, MemberRole, OrgMember, OwnerRef, OwnerType, RuleId, TargetRole,
    TransactionId, WalletId,
};

use super::{MIGRATION_001_INITIAL, MIGRATION_002_ALLOCATION_RULES, MIGRATION_003_MEMBERS};

/// Upper bound on read-check-write retries for one balance mutation.
const MAX_DELTA_ATTEMPTS: u32 = 5;

/// Applied to pool acquisition and to SQLite's busy handler. An expired
/// timeout surfaces as a retryable failure, never as a silent no-op.
const STORAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one balance mutation attempt. The service layer maps these
/// onto its error taxonomy.
#[derive(Debug)]
pub enum DeltaOutcome {
    /// Committed: transaction row written and balance updated together.
    Applied(CreditTransaction),
    /// Debit would drive the balance below zero.
    Insufficient { balance: Credits },
    /// Debit against a wallet whose credits have lapsed.
    Lapsed { balance: Credits },
    /// Optimistic retries exhausted under concurrent writers.
    Conflicted { attempts: u32 },
}

/// Repository for wallets, transactions, allocation rules and members.
/// Sole writer of balances: every mutation goes through `apply_delta`.
pub struct Repository {
    pool: SqlitePool,
}

/// Fixed-width timestamps keep lexicographic order aligned with
/// chronological order in SQL comparisons.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .context("Invalid timestamp")?
        .with_timezone(&Utc))
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        // SQLITE_BUSY, SQLITE_LOCKED, SQLITE_BUSY_SNAPSHOT
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5" | "6" | "517")),
        _ => false,
    }
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database at the given URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid database URL")?
            .busy_timeout(STORAGE_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .acquire_timeout(STORAGE_TIMEOUT)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;

        sqlx::query(MIGRATION_002_ALLOCATION_RULES)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 002")?;

        sqlx::query(MIGRATION_003_MEMBERS)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 003")?;

        Ok(())
    }

    /// Initialize a new database (connect + migrate).
    pub async fn init(database_url: &str) -> Result<Self> {
        let repo = Self::connect(database_url).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    // ========================
    // Wallet operations
    // ========================

    /// Get the wallet for an owner/credit-type pair.
    pub async fn get_wallet(
        &self,
        owner: &OwnerRef,
        credit_type: CreditType,
    ) -> Result<Option<CreditWallet>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_type, owner_id, credit_type, balance, expires_at, created_at, updated_at
            FROM credit_wallets
            WHERE owner_type = ? AND owner_id = ? AND credit_type = ?
            "#,
        )
        .bind(owner.owner_type.as_str())
        .bind(&owner.owner_id)
        .bind(credit_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch wallet")?;

        match row {
            Some(row) => Ok(Some(Self::row_to_wallet(&row)?)),
            None => Ok(None),
        }
    }

    /// List every wallet held by one owner.
    pub async fn list_wallets_for_owner(&self, owner: &OwnerRef) -> Result<Vec<CreditWallet>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_type, owner_id, credit_type, balance, expires_at, created_at, updated_at
            FROM credit_wallets
            WHERE owner_type = ? AND owner_id = ?
            ORDER BY credit_type
            "#,
        )
        .bind(owner.owner_type.as_str())
        .bind(&owner.owner_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list wallets")?;

        rows.iter().map(Self::row_to_wallet).collect()
    }

    /// List all wallets (export/audit surface).
    pub async fn list_all_wallets(&self) -> Result<Vec<CreditWallet>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_type, owner_id, credit_type, balance, expires_at, created_at, updated_at
            FROM credit_wallets
            ORDER BY owner_type, owner_id, credit_type
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list all wallets")?;

        rows.iter().map(Self::row_to_wallet).collect()
    }

    /// Set or clear a wallet's soft expiry. Returns the updated wallet, or
    /// None when no wallet exists for the tuple.
    pub async fn set_wallet_expiry(
        &self,
        owner: &OwnerRef,
        credit_type: CreditType,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Option<CreditWallet>> {
        let updated = sqlx::query(
            r#"
            UPDATE credit_wallets
            SET expires_at = ?, updated_at = ?
            WHERE owner_type = ? AND owner_id = ? AND credit_type = ?
            "#,
        )
        .bind(expires_at.map(fmt_ts))
        .bind(fmt_ts(Utc::now()))
        .bind(owner.owner_type.as_str())
        .bind(&owner.owner_id)
        .bind(credit_type.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to set wallet expiry")?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_wallet(owner, credit_type).await
    }

    // ========================
    // Balance mutation
    // ========================

    /// Apply a signed delta to an owner's wallet: append one transaction row
    /// and move the materialized balance, atomically. The wallet row is
    /// created lazily (also on a debit attempt, which then fails against a
    /// zero balance). Retries the read-check-write cycle on guard misses and
    /// busy storage, bounded by `MAX_DELTA_ATTEMPTS`.
    pub async fn apply_delta(
        &self,
        owner: &OwnerRef,
        credit_type: CreditType,
        delta: Credits,
        reason: &str,
        booking_id: Option<&str>,
        created_by: Option<&str>,
    ) -> Result<DeltaOutcome> {
        for attempt in 1..=MAX_DELTA_ATTEMPTS {
            match self
                .try_apply_delta(owner, credit_type, delta, reason, booking_id, created_by)
                .await
            {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {
                    tracing::warn!(%owner, %credit_type, attempt, "balance changed under us, retrying");
                }
                Err(err) if is_busy(&err) => {
                    tracing::warn!(%owner, %credit_type, attempt, "storage busy, retrying");
                }
                Err(err) => {
                    return Err(err).context("Failed to apply balance delta");
                }
            }
            if attempt < MAX_DELTA_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
            }
        }
        Ok(DeltaOutcome::Conflicted {
            attempts: MAX_DELTA_ATTEMPTS,
        })
    }

    /// One attempt at the read-check-write cycle. Returns Ok(None) when the
    /// guarded update missed and the cycle should be retried.
    async fn try_apply_delta(
        &self,
        owner: &OwnerRef,
        credit_type: CreditType,
        delta: Credits,
        reason: &str,
        booking_id: Option<&str>,
        created_by: Option<&str>,
    ) -> std::result::Result<Option<DeltaOutcome>, sqlx::Error> {
        let now = Utc::now();
        let now_str = fmt_ts(now);
        let mut tx = self.pool.begin().await?;

        // The first statement writes, so the transaction holds the write
        // lock across the whole read-check-write cycle.
        sqlx::query(
            r#"
            INSERT INTO credit_wallets (id, owner_type, owner_id, credit_type, balance, expires_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, NULL, ?, ?)
            ON CONFLICT (owner_type, owner_id, credit_type) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(owner.owner_type.as_str())
        .bind(&owner.owner_id)
        .bind(credit_type.as_str())
        .bind(&now_str)
        .bind(&now_str)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT id, balance,
                   (expires_at IS NOT NULL AND expires_at <= ?) AS lapsed
            FROM credit_wallets
            WHERE owner_type = ? AND owner_id = ? AND credit_type = ?
            "#,
        )
        .bind(&now_str)
        .bind(owner.owner_type.as_str())
        .bind(&owner.owner_id)
        .bind(credit_type.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let wallet_id_str: String = row.get("id");
        let balance: Credits = row.get("balance");
        let lapsed = row.get::<i64, _>("lapsed") != 0;

        if delta < 0 {
            if lapsed {
                tx.rollback().await?;
                return Ok(Some(DeltaOutcome::Lapsed { balance }));
            }
            if balance + delta < 0 {
                tx.rollback().await?;
                return Ok(Some(DeltaOutcome::Insufficient { balance }));
            }
        }

        // Guarded against the balance read above; a miss means another
        // writer got in between and the cycle restarts.
        let updated = sqlx::query(
            r#"
            UPDATE credit_wallets
            SET balance = ?, updated_at = ?
            WHERE id = ? AND balance = ?
            "#,
        )
        .bind(balance + delta)
        .bind(&now_str)
        .bind(&wallet_id_str)
        .bind(balance)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let entry = CreditTransaction {
            id: Uuid::new_v4(),
            wallet_id: Uuid::parse_str(&wallet_id_str)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            delta,
            reason: reason.to_string(),
            booking_id: booking_id.map(str::to_string),
            created_at: now,
            created_by: created_by.map(str::to_string),
        };

        sqlx::query(
            r#"
            INSERT INTO credit_transactions (id, wallet_id, delta, reason, booking_id, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(&wallet_id_str)
        .bind(entry.delta)
        .bind(&entry.reason)
        .bind(&entry.booking_id)
        .bind(&entry.created_by)
        .bind(&now_str)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(%owner, %credit_type, delta, reason, "applied balance delta");
        Ok(Some(DeltaOutcome::Applied(entry)))
    }

    // ========================
    // Transaction queries
    // ========================

    /// Keyset page of a wallet's transactions, newest first, strictly before
    /// the cursor position. Ordering is (created_at, id) so pages restart
    /// stably across equal timestamps.
    pub async fn page_transactions(
        &self,
        wallet_id: WalletId,
        before: Option<(DateTime<Utc>, TransactionId)>,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>> {
        let rows = match before {
            Some((created_at, id)) => {
                let before_ts = fmt_ts(created_at);
                sqlx::query(
                    r#"
                    SELECT id, wallet_id, delta, reason, booking_id, created_by, created_at
                    FROM credit_transactions
                    WHERE wallet_id = ?
                      AND (created_at < ? OR (created_at = ? AND id < ?))
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?
                    "#,
                )
                .bind(wallet_id.to_string())
                .bind(&before_ts)
                .bind(&before_ts)
                .bind(id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, wallet_id, delta, reason, booking_id, created_by, created_at
                    FROM credit_transactions
                    WHERE wallet_id = ?
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?
                    "#,
                )
                .bind(wallet_id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to page transactions")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    /// Whether the owner's wallet already holds a transaction with the given
    /// reason. Allocation idempotency checks run through this.
    pub async fn reason_exists(
        &self,
        owner: &OwnerRef,
        credit_type: CreditType,
        reason: &str,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM credit_transactions t
                JOIN credit_wallets w ON w.id = t.wallet_id
                WHERE w.owner_type = ? AND w.owner_id = ? AND w.credit_type = ?
                  AND t.reason = ?
            ) AS present
            "#,
        )
        .bind(owner.owner_type.as_str())
        .bind(&owner.owner_id)
        .bind(credit_type.as_str())
        .bind(reason)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check reason tag")?;

        Ok(row.get::<i64, _>("present") != 0)
    }

    /// List all transactions (export/audit surface), oldest first.
    pub async fn list_all_transactions(&self) -> Result<Vec<CreditTransaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, wallet_id, delta, reason, booking_id, created_by, created_at
            FROM credit_transactions
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list all transactions")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    // ========================
    // Allocation rules
    // ========================

    /// Save a new allocation rule.
    pub async fn save_rule(&self, rule: &CreditAllocationRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO allocation_rules (id, organization_id, credit_type, amount, frequency, target_role, is_active, last_run_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(rule.id.to_string())
        .bind(&rule.organization_id)
        .bind(rule.credit_type.as_str())
        .bind(rule.amount)
        .bind(rule.frequency.as_str())
        .bind(rule.target_role.as_str())
        .bind(rule.is_active)
        .bind(rule.last_run_at.map(fmt_ts))
        .bind(fmt_ts(rule.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to save allocation rule")?;
        Ok(())
    }

    /// Get a rule by id.
    pub async fn get_rule(&self, id: RuleId) -> Result<Option<CreditAllocationRule>> {
        let row = sqlx::query(
            r#"
            SELECT id, organization_id, credit_type, amount, frequency, target_role, is_active, last_run_at, created_at
            FROM allocation_rules
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch allocation rule")?;

        match row {
            Some(row) => Ok(Some(Self::row_to_rule(&row)?)),
            None => Ok(None),
        }
    }

    /// List rules, optionally restricted to one organization.
    pub async fn list_rules(&self, organization_id: Option<&str>) -> Result<Vec<CreditAllocationRule>> {
        let rows = match organization_id {
            Some(org) => {
                sqlx::query(
                    r#"
                    SELECT id, organization_id, credit_type, amount, frequency, target_role, is_active, last_run_at, created_at
                    FROM allocation_rules
                    WHERE organization_id = ?
                    ORDER BY created_at, id
                    "#,
                )
                .bind(org)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, organization_id, credit_type, amount, frequency, target_role, is_active, last_run_at, created_at
                    FROM allocation_rules
                    ORDER BY created_at, id
                    "#,
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to list allocation rules")?;

        rows.iter().map(Self::row_to_rule).collect()
    }

    /// List active rules across all organizations, in creation order.
    pub async fn list_active_rules(&self) -> Result<Vec<CreditAllocationRule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, organization_id, credit_type, amount, frequency, target_role, is_active, last_run_at, created_at
            FROM allocation_rules
            WHERE is_active = 1
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list active rules")?;

        rows.iter().map(Self::row_to_rule).collect()
    }

    /// Flip a rule's active flag. Returns false when the rule is unknown.
    pub async fn set_rule_active(&self, id: RuleId, is_active: bool) -> Result<bool> {
        let updated = sqlx::query("UPDATE allocation_rules SET is_active = ? WHERE id = ?")
            .bind(is_active)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update allocation rule")?;
        Ok(updated.rows_affected() > 0)
    }

    /// Record when a rule was last visited by an allocation run.
    pub async fn touch_rule_run(&self, id: RuleId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE allocation_rules SET last_run_at = ? WHERE id = ?")
            .bind(fmt_ts(at))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to record rule run")?;
        Ok(())
    }

    // ========================
    // Organization members
    // ========================

    /// Insert or update a membership row mirrored from the directory.
    pub async fn upsert_member(&self, member: &OrgMember) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO org_members (organization_id, user_id, role, is_active, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (organization_id, user_id)
            DO UPDATE SET role = excluded.role, is_active = excluded.is_active
            "#,
        )
        .bind(&member.organization_id)
        .bind(&member.user_id)
        .bind(member.role.as_str())
        .bind(member.is_active)
        .bind(fmt_ts(member.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to upsert member")?;
        Ok(())
    }

    /// List an organization's members.
    pub async fn list_members(&self, organization_id: &str) -> Result<Vec<OrgMember>> {
        let rows = sqlx::query(
            r#"
            SELECT organization_id, user_id, role, is_active, created_at
            FROM org_members
            WHERE organization_id = ?
            ORDER BY user_id
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list members")?;

        rows.iter().map(Self::row_to_member).collect()
    }

    /// List all membership rows (export surface).
    pub async fn list_all_members(&self) -> Result<Vec<OrgMember>> {
        let rows = sqlx::query(
            r#"
            SELECT organization_id, user_id, role, is_active, created_at
            FROM org_members
            ORDER BY organization_id, user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list all members")?;

        rows.iter().map(Self::row_to_member).collect()
    }

    // ========================
    // Reporting aggregation
    // ========================

    /// Allocated vs consumed totals for an organization within a window.
    /// Covers the org's own pool wallets plus user wallets of its active
    /// members.
    pub async fn sum_usage(
        &self,
        organization_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageTotals> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN t.delta > 0 THEN t.delta ELSE 0 END), 0) AS allocated,
                COALESCE(SUM(CASE WHEN t.delta < 0 THEN -t.delta ELSE 0 END), 0) AS consumed
            FROM credit_transactions t
            JOIN credit_wallets w ON w.id = t.wallet_id
            WHERE t.created_at >= ? AND t.created_at < ?
              AND (
                    (w.owner_type = 'org' AND w.owner_id = ?)
                 OR (w.owner_type = 'user' AND w.owner_id IN (
                        SELECT user_id FROM org_members
                        WHERE organization_id = ? AND is_active = 1))
              )
            "#,
        )
        .bind(fmt_ts(from))
        .bind(fmt_ts(to))
        .bind(organization_id)
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to sum usage")?;

        Ok(UsageTotals {
            allocated: row.get("allocated"),
            consumed: row.get("consumed"),
        })
    }

    /// Usage split per credit type for an organization within a window.
    pub async fn usage_by_credit_type(
        &self,
        organization_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CreditTypeUsage>> {
        let rows = sqlx::query(
            r#"
            SELECT
                w.credit_type AS credit_type,
                COALESCE(SUM(CASE WHEN t.delta > 0 THEN t.delta ELSE 0 END), 0) AS allocated,
                COALESCE(SUM(CASE WHEN t.delta < 0 THEN -t.delta ELSE 0 END), 0) AS consumed
            FROM credit_transactions t
            JOIN credit_wallets w ON w.id = t.wallet_id
            WHERE t.created_at >= ? AND t.created_at < ?
              AND (
                    (w.owner_type = 'org' AND w.owner_id = ?)
                 OR (w.owner_type = 'user' AND w.owner_id IN (
                        SELECT user_id FROM org_members
                        WHERE organization_id = ? AND is_active = 1))
              )
            GROUP BY w.credit_type
            ORDER BY w.credit_type
            "#,
        )
        .bind(fmt_ts(from))
        .bind(fmt_ts(to))
        .bind(organization_id)
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to aggregate usage by credit type")?;

        rows.iter()
            .map(|row| {
                let credit_type_str: String = row.get("credit_type");
                Ok(CreditTypeUsage {
                    credit_type: CreditType::from_str(&credit_type_str).ok_or_else(|| {
                        anyhow::anyhow!("Invalid credit type: {}", credit_type_str)
                    })?,
                    allocated: row.get("allocated"),
                    consumed: row.get("consumed"),
                })
            })
            .collect()
    }

    /// Usage split per member role for an organization within a window.
    /// Only user wallets carry a role; the org pool is excluded here.
    pub async fn usage_by_role(
        &self,
        organization_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RoleUsage>> {
        let rows = sqlx::query(
            r#"
            SELECT
                m.role AS role,
                COALESCE(SUM(CASE WHEN t.delta > 0 THEN t.delta ELSE 0 END), 0) AS allocated,
                COALESCE(SUM(CASE WHEN t.delta < 0 THEN -t.delta ELSE 0 END), 0) AS consumed
            FROM credit_transactions t
            JOIN credit_wallets w ON w.id = t.wallet_id AND w.owner_type = 'user'
            JOIN org_members m ON m.user_id = w.owner_id AND m.organization_id = ? AND m.is_active = 1
            WHERE t.created_at >= ? AND t.created_at < ?
            GROUP BY m.role
            ORDER BY m.role
            "#,
        )
        .bind(organization_id)
        .bind(fmt_ts(from))
        .bind(fmt_ts(to))
        .fetch_all(&self.pool)
        .await
        .context("Failed to aggregate usage by role")?;

        rows.iter()
            .map(|row| {
                let role_str: String = row.get("role");
                Ok(RoleUsage {
                    role: MemberRole::from_str(&role_str)
                        .ok_or_else(|| anyhow::anyhow!("Invalid member role: {}", role_str))?,
                    allocated: row.get("allocated"),
                    consumed: row.get("consumed"),
                })
            })
            .collect()
    }

    // ========================
    // Integrity
    // ========================

    /// Recompute every balance from the transaction log and compare with
    /// the materialized column. The cached balance is never trusted on its
    /// own in an audit.
    pub async fn integrity_report(&self) -> Result<IntegrityReport> {
        let wallet_count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM credit_wallets")
            .fetch_one(&self.pool)
            .await?
            .get("count");

        let transaction_count: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM credit_transactions")
                .fetch_one(&self.pool)
                .await?
                .get("count");

        let drift_rows = sqlx::query(
            r#"
            SELECT w.id AS wallet_id, w.balance AS materialized, COALESCE(SUM(t.delta), 0) AS ledger_sum
            FROM credit_wallets w
            LEFT JOIN credit_transactions t ON t.wallet_id = w.id
            GROUP BY w.id, w.balance
            HAVING w.balance != COALESCE(SUM(t.delta), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to compute balance drift")?;

        let drifted = drift_rows
            .iter()
            .map(|row| {
                let wallet_id_str: String = row.get("wallet_id");
                Ok(BalanceDrift {
                    wallet_id: Uuid::parse_str(&wallet_id_str).context("Invalid wallet ID")?,
                    materialized: row.get("materialized"),
                    ledger_sum: row.get("ledger_sum"),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let negative_balances: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM credit_wallets WHERE balance < 0")
                .fetch_one(&self.pool)
                .await?
                .get("count");

        let zero_deltas: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM credit_transactions WHERE delta = 0")
                .fetch_one(&self.pool)
                .await?
                .get("count");

        let orphaned_transactions: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM credit_transactions t
            WHERE NOT EXISTS (SELECT 1 FROM credit_wallets w WHERE w.id = t.wallet_id)
            "#,
        )
        .fetch_one(&self.pool)
        .await?
        .get("count");

        Ok(IntegrityReport {
            wallet_count,
            transaction_count,
            drifted,
            negative_balances,
            zero_deltas,
            orphaned_transactions,
        })
    }

    // ========================
    // Row mappers
    // ========================

    fn row_to_wallet(row: &sqlx::sqlite::SqliteRow) -> Result<CreditWallet> {
        let id_str: String = row.get("id");
        let owner_type_str: String = row.get("owner_type");
        let credit_type_str: String = row.get("credit_type");
        let expires_at_str: Option<String> = row.get("expires_at");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(CreditWallet {
            id: Uuid::parse_str(&id_str).context("Invalid wallet ID")?,
            owner: OwnerRef {
                owner_type: OwnerType::from_str(&owner_type_str)
                    .ok_or_else(|| anyhow::anyhow!("Invalid owner type: {}", owner_type_str))?,
                owner_id: row.get("owner_id"),
            },
            credit_type: CreditType::from_str(&credit_type_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid credit type: {}", credit_type_str))?,
            balance: row.get("balance"),
            expires_at: expires_at_str.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&created_at_str)?,
            updated_at: parse_ts(&updated_at_str)?,
        })
    }

    fn row_to_transaction(row: &sqlx::sqlite::SqliteRow) -> Result<CreditTransaction> {
        let id_str: String = row.get("id");
        let wallet_id_str: String = row.get("wallet_id");
        let created_at_str: String = row.get("created_at");

        Ok(CreditTransaction {
            id: Uuid::parse_str(&id_str).context("Invalid transaction ID")?,
            wallet_id: Uuid::parse_str(&wallet_id_str).context("Invalid wallet ID")?,
            delta: row.get("delta"),
            reason: row.get("reason"),
            booking_id: row.get("booking_id"),
            created_at: parse_ts(&created_at_str)?,
            created_by: row.get("created_by"),
        })
    }

    fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> Result<CreditAllocationRule> {
        let id_str: String = row.get("id");
        let credit_type_str: String = row.get("credit_type");
        let frequency_str: String = row.get("frequency");
        let target_role_str: String = row.get("target_role");
        let last_run_at_str: Option<String> = row.get("last_run_at");
        let created_at_str: String = row.get("created_at");

        Ok(CreditAllocationRule {
            id: Uuid::parse_str(&id_str).context("Invalid rule ID")?,
            organization_id: row.get("organization_id"),
            credit_type: CreditType::from_str(&credit_type_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid credit type: {}", credit_type_str))?,
            amount: row.get("amount"),
            frequency: Frequency::from_str(&frequency_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid frequency: {}", frequency_str))?,
            target_role: TargetRole::from_str(&target_role_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid target role: {}", target_role_str))?,
            is_active: row.get::<i64, _>("is_active") != 0,
            last_run_at: last_run_at_str.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&created_at_str)?,
        })
    }

    fn row_to_member(row: &sqlx::sqlite::SqliteRow) -> Result<OrgMember> {
        let role_str: String = row.get("role");
        let created_at_str: String = row.get("created_at");

        Ok(OrgMember {
            organization_id: row.get("organization_id"),
            user_id: row.get("user_id"),
            role: MemberRole::from_str(&role_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid member role: {}", role_str))?,
            is_active: row.get::<i64, _>("is_active") != 0,
            created_at: parse_ts(&created_at_str)?,
        })
    }
}
