// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use creditum::application::CreditLedgerService;
use creditum::domain::{MemberRole, OrgMember};
use tempfile::TempDir;

/// Helper to create a test service with a temporary database
pub async fn test_service() -> Result<(CreditLedgerService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let service = CreditLedgerService::init(db_path.to_str().unwrap()).await?;
    Ok((service, temp_dir))
}

/// Helper to parse a date string into DateTime<Utc>
pub fn parse_date(date_str: &str) -> DateTime<Utc> {
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
}

/// Test fixture: one organization with a small member directory
pub struct StandardOrg;

impl StandardOrg {
    pub const ORG: &'static str = "acme";
    pub const EMPLOYEES: [&'static str; 3] = ["emp-1", "emp-2", "emp-3"];
    pub const HR: &'static str = "hr-1";
    pub const COACH: &'static str = "coach-1";

    /// Three employees, one HR, one coach - all active
    pub async fn create(service: &CreditLedgerService) -> Result<()> {
        for user in Self::EMPLOYEES {
            service
                .upsert_member(&OrgMember::new(Self::ORG, user, MemberRole::Employee))
                .await?;
        }
        service
            .upsert_member(&OrgMember::new(Self::ORG, Self::HR, MemberRole::Hr))
            .await?;
        service
            .upsert_member(&OrgMember::new(Self::ORG, Self::COACH, MemberRole::Coach))
            .await?;
        Ok(())
    }

    /// Like `create`, plus one deactivated employee
    pub async fn create_with_inactive(service: &CreditLedgerService) -> Result<()> {
        Self::create(service).await?;
        service
            .upsert_member(
                &OrgMember::new(Self::ORG, "emp-gone", MemberRole::Employee).deactivated(),
            )
            .await?;
        Ok(())
    }
}
