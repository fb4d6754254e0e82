mod repository;

pub use repository::*;

/// SQL migration for wallets and the transaction log
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");

/// SQL migration for allocation rules
pub const MIGRATION_002_ALLOCATION_RULES: &str = include_str!("migrations/002_allocation_rules.sql");

/// SQL migration for the organization member mirror
pub const MIGRATION_003_MEMBERS: &str = include_str!("migrations/003_members.sql");
