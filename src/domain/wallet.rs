use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type WalletId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    /// Organization-level pool shared by a whole company
    Org,
    /// Personal wallet of a single member
    User,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::Org => "org",
            OwnerType::User => "user",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "org" => Some(OwnerType::Org),
            "user" => Some(OwnerType::User),
            _ => None,
        }
    }
}

impl std::fmt::Display for OwnerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditType {
    /// One-on-one coaching session
    #[serde(rename = "session_1_1")]
    Session1on1,
    /// Webinar seat
    Webinar,
}

impl CreditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditType::Session1on1 => "session_1_1",
            CreditType::Webinar => "webinar",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "session_1_1" => Some(CreditType::Session1on1),
            "webinar" => Some(CreditType::Webinar),
            _ => None,
        }
    }

    pub const ALL: [CreditType; 2] = [CreditType::Session1on1, CreditType::Webinar];
}

impl std::fmt::Display for CreditType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Number of redeemable credits. Whole counts, never fractional.
pub type Credits = i64;

/// Identifies the holder of a wallet: an organization pool or a single user.
/// Owner ids are opaque strings issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub owner_type: OwnerType,
    pub owner_id: String,
}

impl OwnerRef {
    pub fn new(owner_type: OwnerType, owner_id: impl Into<String>) -> Self {
        Self {
            owner_type,
            owner_id: owner_id.into(),
        }
    }

    pub fn org(owner_id: impl Into<String>) -> Self {
        Self::new(OwnerType::Org, owner_id)
    }

    pub fn user(owner_id: impl Into<String>) -> Self {
        Self::new(OwnerType::User, owner_id)
    }
}

impl std::fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.owner_type, self.owner_id)
    }
}

/// A balance bucket for one owner and one credit type.
/// At most one wallet exists per (owner_type, owner_id, credit_type).
/// Balance is a materialized sum of the wallet's transaction deltas and is
/// only ever mutated together with a transaction row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditWallet {
    pub id: WalletId,
    pub owner: OwnerRef,
    pub credit_type: CreditType,
    pub balance: Credits,
    /// Credits lapse for redemption after this instant. Wallets are never
    /// hard-deleted.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditWallet {
    pub fn new(owner: OwnerRef, credit_type: CreditType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner,
            credit_type,
            balance: 0,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// A lapsed wallet still reads, but its credits can no longer be redeemed.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn projection(&self) -> CreditBalance {
        CreditBalance {
            credit_type: self.credit_type,
            balance: self.balance,
            expires_at: self.expires_at,
        }
    }
}

/// Per-owner, per-type summary view. Not separately persisted; a missing
/// wallet projects as a zero balance rather than an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditBalance {
    pub credit_type: CreditType,
    pub balance: Credits,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CreditBalance {
    pub fn empty(credit_type: CreditType) -> Self {
        Self {
            credit_type,
            balance: 0,
            expires_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_owner_type_roundtrip() {
        for ot in [OwnerType::Org, OwnerType::User] {
            let parsed = OwnerType::from_str(ot.as_str()).unwrap();
            assert_eq!(ot, parsed);
        }
    }

    #[test]
    fn test_credit_type_roundtrip() {
        for ct in CreditType::ALL {
            let parsed = CreditType::from_str(ct.as_str()).unwrap();
            assert_eq!(ct, parsed);
        }
    }

    #[test]
    fn test_credit_type_rejects_unknown() {
        assert_eq!(CreditType::from_str("group_session"), None);
    }

    #[test]
    fn test_new_wallet_starts_empty() {
        let wallet = CreditWallet::new(OwnerRef::org("acme"), CreditType::Webinar);
        assert_eq!(wallet.balance, 0);
        assert!(wallet.expires_at.is_none());
    }

    #[test]
    fn test_lapsed_wallet() {
        let now = Utc::now();
        let wallet = CreditWallet::new(OwnerRef::user("u-1"), CreditType::Session1on1)
            .with_expiry(now - Duration::days(1));
        assert!(wallet.is_lapsed(now));

        let fresh = CreditWallet::new(OwnerRef::user("u-1"), CreditType::Session1on1)
            .with_expiry(now + Duration::days(30));
        assert!(!fresh.is_lapsed(now));
    }

    #[test]
    fn test_missing_wallet_projects_as_zero() {
        let projection = CreditBalance::empty(CreditType::Session1on1);
        assert_eq!(projection.balance, 0);
        assert!(projection.expires_at.is_none());
    }
}
