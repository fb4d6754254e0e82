use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CreditType, Credits, MemberRole};

pub type RuleId = Uuid;

/// How often a rule grants credits. Periods are calendar-aligned: a rule is
/// due once per calendar month, quarter or year, regardless of when the
/// scheduler happens to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Monthly,
    Quarterly,
    Yearly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
            Frequency::Yearly => "yearly",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "monthly" => Some(Frequency::Monthly),
            "quarterly" => Some(Frequency::Quarterly),
            "yearly" => Some(Frequency::Yearly),
            _ => None,
        }
    }

    /// Start of the calendar period containing `now`.
    pub fn period_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.date_naive();
        let start = match self {
            Frequency::Monthly => date.with_day(1).unwrap(),
            Frequency::Quarterly => {
                let quarter_month = ((date.month() - 1) / 3) * 3 + 1;
                date.with_day(1).unwrap().with_month(quarter_month).unwrap()
            }
            Frequency::Yearly => date.with_day(1).unwrap().with_month(1).unwrap(),
        };
        start.and_hms_opt(0, 0, 0).unwrap().and_utc()
    }

    /// Start of the period following the one containing `now`.
    pub fn period_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.period_start(now).date_naive();
        let end = match self {
            Frequency::Monthly => {
                if start.month() == 12 {
                    start.with_year(start.year() + 1).unwrap().with_month(1).unwrap()
                } else {
                    start.with_month(start.month() + 1).unwrap()
                }
            }
            Frequency::Quarterly => {
                if start.month() == 10 {
                    start.with_year(start.year() + 1).unwrap().with_month(1).unwrap()
                } else {
                    start.with_month(start.month() + 3).unwrap()
                }
            }
            Frequency::Yearly => start.with_year(start.year() + 1).unwrap(),
        };
        end.and_hms_opt(0, 0, 0).unwrap().and_utc()
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which members of the organization a rule grants to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetRole {
    /// Members with role employee only
    Employee,
    /// Every active member regardless of role
    All,
}

impl TargetRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetRole::Employee => "employee",
            TargetRole::All => "all",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "employee" => Some(TargetRole::Employee),
            "all" => Some(TargetRole::All),
            _ => None,
        }
    }

    pub fn matches(&self, role: MemberRole) -> bool {
        match self {
            TargetRole::Employee => role == MemberRole::Employee,
            TargetRole::All => true,
        }
    }
}

impl std::fmt::Display for TargetRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A standing policy that periodically grants credits to members of an
/// organization. Deactivating a rule stops future runs; past grants stand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditAllocationRule {
    pub id: RuleId,
    pub organization_id: String,
    pub credit_type: CreditType,
    pub amount: Credits,
    pub frequency: Frequency,
    pub target_role: TargetRole,
    pub is_active: bool,
    /// Informational watermark; idempotency is carried by the reason tag,
    /// not by this field.
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CreditAllocationRule {
    pub fn new(
        organization_id: impl Into<String>,
        credit_type: CreditType,
        amount: Credits,
        frequency: Frequency,
        target_role: TargetRole,
    ) -> Self {
        assert!(amount > 0, "Allocation amount must be positive");
        Self {
            id: Uuid::new_v4(),
            organization_id: organization_id.into(),
            credit_type,
            amount,
            frequency,
            target_role,
            is_active: true,
            last_run_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Deterministic reason tag for one rule in one period. Grants carry this
/// tag so that re-running a period can detect prior grants instead of
/// relying on timing.
pub fn allocation_reason(rule_id: RuleId, period_start: DateTime<Utc>) -> String {
    format!("allocation:{}:{}", rule_id, period_start.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_date(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&format!("{}T15:30:00Z", s))
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_frequency_roundtrip() {
        for freq in [Frequency::Monthly, Frequency::Quarterly, Frequency::Yearly] {
            let parsed = Frequency::from_str(freq.as_str()).unwrap();
            assert_eq!(freq, parsed);
        }
    }

    #[test]
    fn test_target_role_roundtrip() {
        for target in [TargetRole::Employee, TargetRole::All] {
            let parsed = TargetRole::from_str(target.as_str()).unwrap();
            assert_eq!(target, parsed);
        }
    }

    #[test]
    fn test_monthly_period() {
        let now = parse_date("2024-06-17");
        let start = Frequency::Monthly.period_start(now);
        let end = Frequency::Monthly.period_end(now);
        assert_eq!(start.date_naive().to_string(), "2024-06-01");
        assert_eq!(end.date_naive().to_string(), "2024-07-01");
    }

    #[test]
    fn test_monthly_period_december_rollover() {
        let now = parse_date("2024-12-31");
        let end = Frequency::Monthly.period_end(now);
        assert_eq!(end.date_naive().to_string(), "2025-01-01");
    }

    #[test]
    fn test_quarterly_period_starts() {
        let cases = [
            ("2024-01-15", "2024-01-01", "2024-04-01"),
            ("2024-05-02", "2024-04-01", "2024-07-01"),
            ("2024-09-30", "2024-07-01", "2024-10-01"),
            ("2024-11-11", "2024-10-01", "2025-01-01"),
        ];
        for (now, expected_start, expected_end) in cases {
            let now = parse_date(now);
            assert_eq!(
                Frequency::Quarterly.period_start(now).date_naive().to_string(),
                expected_start
            );
            assert_eq!(
                Frequency::Quarterly.period_end(now).date_naive().to_string(),
                expected_end
            );
        }
    }

    #[test]
    fn test_yearly_period() {
        let now = parse_date("2024-08-09");
        assert_eq!(
            Frequency::Yearly.period_start(now).date_naive().to_string(),
            "2024-01-01"
        );
        assert_eq!(
            Frequency::Yearly.period_end(now).date_naive().to_string(),
            "2025-01-01"
        );
    }

    #[test]
    fn test_period_start_is_stable_within_period() {
        // Any two instants inside the same month map to the same tag input
        let early = parse_date("2024-03-01");
        let late = parse_date("2024-03-31");
        assert_eq!(
            Frequency::Monthly.period_start(early),
            Frequency::Monthly.period_start(late)
        );
    }

    #[test]
    fn test_target_role_matching() {
        assert!(TargetRole::Employee.matches(MemberRole::Employee));
        assert!(!TargetRole::Employee.matches(MemberRole::Hr));
        assert!(TargetRole::All.matches(MemberRole::Coach));
        assert!(TargetRole::All.matches(MemberRole::Employee));
    }

    #[test]
    fn test_allocation_reason_is_deterministic() {
        let rule_id = Uuid::new_v4();
        let a = allocation_reason(rule_id, Frequency::Monthly.period_start(parse_date("2024-05-03")));
        let b = allocation_reason(rule_id, Frequency::Monthly.period_start(parse_date("2024-05-28")));
        assert_eq!(a, b);

        let next = allocation_reason(rule_id, Frequency::Monthly.period_start(parse_date("2024-06-01")));
        assert_ne!(a, next);
    }

    #[test]
    #[should_panic(expected = "Allocation amount must be positive")]
    fn test_rule_requires_positive_amount() {
        CreditAllocationRule::new(
            "org-1",
            CreditType::Session1on1,
            0,
            Frequency::Monthly,
            TargetRole::All,
        );
    }
}
