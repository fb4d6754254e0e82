use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of an organization member. Closed set: dashboards, allocation
/// targeting and reporting all branch exhaustively on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Admin,
    Hr,
    Employee,
    Coach,
    Individual,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Admin => "admin",
            MemberRole::Hr => "hr",
            MemberRole::Employee => "employee",
            MemberRole::Coach => "coach",
            MemberRole::Individual => "individual",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "admin" => Some(MemberRole::Admin),
            "hr" => Some(MemberRole::Hr),
            "employee" => Some(MemberRole::Employee),
            "coach" => Some(MemberRole::Coach),
            "individual" => Some(MemberRole::Individual),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Membership row mirrored from the organization directory. The ledger
/// trusts these as given and never re-authenticates; the allocation engine
/// resolves rule targets from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgMember {
    pub organization_id: String,
    pub user_id: String,
    pub role: MemberRole,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl OrgMember {
    pub fn new(
        organization_id: impl Into<String>,
        user_id: impl Into<String>,
        role: MemberRole,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            user_id: user_id.into(),
            role,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_role_roundtrip() {
        for role in [
            MemberRole::Admin,
            MemberRole::Hr,
            MemberRole::Employee,
            MemberRole::Coach,
            MemberRole::Individual,
        ] {
            let parsed = MemberRole::from_str(role.as_str()).unwrap();
            assert_eq!(role, parsed);
        }
    }

    #[test]
    fn test_member_role_rejects_unknown() {
        assert_eq!(MemberRole::from_str("superuser"), None);
    }

    #[test]
    fn test_new_member_is_active() {
        let member = OrgMember::new("org-1", "u-1", MemberRole::Employee);
        assert!(member.is_active);
        assert!(!member.deactivated().is_active);
    }
}
