mod common;

use anyhow::Result;
use chrono::Utc;
use common::{test_service, StandardOrg};
use creditum::domain::{CreditType, Frequency, MemberRole, OrgMember, OwnerRef};

#[tokio::test]
async fn test_usage_report_totals() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardOrg::create(&service).await?;

    let org = OwnerRef::org(StandardOrg::ORG);
    let emp = OwnerRef::user("emp-1");

    service
        .credit(&org, CreditType::Session1on1, 20, "pool top-up", None)
        .await?;
    service
        .credit(&emp, CreditType::Session1on1, 4, "grant", None)
        .await?;
    service
        .debit(&emp, CreditType::Session1on1, 1, "booking", Some("bk-1"), None)
        .await?;
    service
        .debit(&org, CreditType::Session1on1, 2, "booking", Some("bk-2"), None)
        .await?;

    let report = service
        .usage_report(StandardOrg::ORG, Frequency::Monthly, Utc::now())
        .await?;

    assert_eq!(report.allocated, 24);
    assert_eq!(report.consumed, 3);
    assert_eq!(report.net, 21);

    Ok(())
}

#[tokio::test]
async fn test_usage_breakdown_by_credit_type() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardOrg::create(&service).await?;

    let org = OwnerRef::org(StandardOrg::ORG);
    service
        .credit(&org, CreditType::Session1on1, 10, "pool", None)
        .await?;
    service
        .credit(&org, CreditType::Webinar, 6, "pool", None)
        .await?;
    service
        .debit(&org, CreditType::Webinar, 2, "booking", None, None)
        .await?;

    let report = service
        .usage_report(StandardOrg::ORG, Frequency::Monthly, Utc::now())
        .await?;

    assert_eq!(report.by_credit_type.len(), 2);

    let sessions = report
        .by_credit_type
        .iter()
        .find(|u| u.credit_type == CreditType::Session1on1)
        .unwrap();
    assert_eq!(sessions.allocated, 10);
    assert_eq!(sessions.consumed, 0);

    let webinars = report
        .by_credit_type
        .iter()
        .find(|u| u.credit_type == CreditType::Webinar)
        .unwrap();
    assert_eq!(webinars.allocated, 6);
    assert_eq!(webinars.consumed, 2);

    Ok(())
}

#[tokio::test]
async fn test_usage_breakdown_by_role() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardOrg::create(&service).await?;

    let emp = OwnerRef::user("emp-1");
    let hr = OwnerRef::user(StandardOrg::HR);

    service
        .credit(&emp, CreditType::Session1on1, 2, "grant", None)
        .await?;
    service
        .credit(&hr, CreditType::Session1on1, 5, "grant", None)
        .await?;
    service
        .debit(&hr, CreditType::Session1on1, 1, "booking", None, None)
        .await?;

    let report = service
        .usage_report(StandardOrg::ORG, Frequency::Monthly, Utc::now())
        .await?;

    let employee = report
        .by_role
        .iter()
        .find(|u| u.role == MemberRole::Employee)
        .unwrap();
    assert_eq!(employee.allocated, 2);
    assert_eq!(employee.consumed, 0);

    let hr_usage = report
        .by_role
        .iter()
        .find(|u| u.role == MemberRole::Hr)
        .unwrap();
    assert_eq!(hr_usage.allocated, 5);
    assert_eq!(hr_usage.consumed, 1);

    Ok(())
}

#[tokio::test]
async fn test_usage_excludes_other_organizations() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardOrg::create(&service).await?;
    service
        .upsert_member(&OrgMember::new("globex", "ext-1", MemberRole::Employee))
        .await?;

    let outsider = OwnerRef::user("ext-1");
    service
        .credit(&outsider, CreditType::Session1on1, 9, "grant", None)
        .await?;
    let other_org = OwnerRef::org("globex");
    service
        .credit(&other_org, CreditType::Session1on1, 9, "pool", None)
        .await?;

    let report = service
        .usage_report(StandardOrg::ORG, Frequency::Monthly, Utc::now())
        .await?;
    assert_eq!(report.allocated, 0);
    assert_eq!(report.consumed, 0);
    assert!(report.by_role.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_usage_report_empty_org() -> Result<()> {
    let (service, _temp) = test_service().await?;

    let report = service
        .usage_report("nobody", Frequency::Yearly, Utc::now())
        .await?;

    assert_eq!(report.allocated, 0);
    assert_eq!(report.consumed, 0);
    assert_eq!(report.net, 0);
    assert!(report.by_credit_type.is_empty());
    assert!(report.by_role.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_report_period_bounds_follow_frequency() -> Result<()> {
    let (service, _temp) = test_service().await?;

    let now = Utc::now();
    let report = service
        .usage_report("acme", Frequency::Quarterly, now)
        .await?;

    assert!(report.period_start <= now);
    assert!(report.period_end > now);
    assert_eq!(report.period_start, Frequency::Quarterly.period_start(now));
    assert_eq!(report.period_end, Frequency::Quarterly.period_end(now));

    Ok(())
}
