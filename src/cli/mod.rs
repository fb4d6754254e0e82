use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::application::CreditLedgerService;
use crate::domain::{
    CreditBalance, CreditType, Frequency, MemberRole, OrgMember, OwnerRef, OwnerType, TargetRole,
};

/// Creditum - Credit Ledger & Entitlement Service
#[derive(Parser)]
#[command(name = "creditum")]
#[command(about = "A credit ledger for session and webinar entitlements")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "creditum.db")]
    pub database: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Organization member directory commands
    #[command(subcommand)]
    Member(MemberCommands),

    /// Allocation rule commands
    #[command(subcommand)]
    Rule(RuleCommands),

    /// Grant credits to an owner
    Credit {
        /// Number of credits to grant
        amount: i64,

        /// Owner as type:id (e.g. "org:acme" or "user:u-17")
        #[arg(long)]
        owner: String,

        /// Credit type: session_1_1, webinar
        #[arg(short = 't', long = "type")]
        credit_type: String,

        /// Reason recorded on the transaction
        #[arg(short, long)]
        reason: String,

        /// Acting user id
        #[arg(long)]
        actor: Option<String>,
    },

    /// Consume credits from an owner
    Debit {
        /// Number of credits to consume
        amount: i64,

        /// Owner as type:id (e.g. "org:acme" or "user:u-17")
        #[arg(long)]
        owner: String,

        /// Credit type: session_1_1, webinar
        #[arg(short = 't', long = "type")]
        credit_type: String,

        /// Reason recorded on the transaction
        #[arg(short, long)]
        reason: String,

        /// Booking id that consumed the credit
        #[arg(long)]
        booking: Option<String>,

        /// Acting user id
        #[arg(long)]
        actor: Option<String>,
    },

    /// Show balances for an owner
    Balance {
        /// Owner as type:id
        owner: String,

        /// Credit type (omit for all types)
        #[arg(short = 't', long = "type")]
        credit_type: Option<String>,
    },

    /// Show transaction history for an owner's wallet
    History {
        /// Owner as type:id
        owner: String,

        /// Credit type: session_1_1, webinar
        #[arg(short = 't', long = "type")]
        credit_type: String,

        /// Maximum number of entries per page
        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Resume from a cursor printed by a previous page
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Set or clear a wallet's expiry date
    Expire {
        /// Owner as type:id
        owner: String,

        /// Credit type: session_1_1, webinar
        #[arg(short = 't', long = "type")]
        credit_type: String,

        /// Expiry date (YYYY-MM-DD, omit to clear)
        #[arg(long)]
        date: Option<String>,
    },

    /// Apply every active allocation rule due for the current period
    RunDue {
        /// Treat this date as now (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        now: Option<String>,
    },

    /// Organization usage report for the current period
    Report {
        /// Organization id
        org: String,

        /// Period: monthly, quarterly, yearly
        #[arg(short, long, default_value = "monthly")]
        period: String,

        /// Output format: text, json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify ledger integrity
    Check,

    /// Export data to CSV or JSON
    Export {
        /// What to export: transactions, wallets, full
        export_type: String,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum MemberCommands {
    /// Add or update a member in the directory mirror
    Add {
        /// Organization id
        org: String,

        /// User id
        user: String,

        /// Role: admin, hr, employee, coach, individual
        #[arg(short, long, default_value = "employee")]
        role: String,

        /// Mark the member inactive
        #[arg(long)]
        inactive: bool,
    },

    /// List an organization's members
    List {
        /// Organization id
        org: String,
    },
}

#[derive(Subcommand)]
pub enum RuleCommands {
    /// Create an allocation rule
    Add {
        /// Organization id
        org: String,

        /// Credit type: session_1_1, webinar
        #[arg(short = 't', long = "type")]
        credit_type: String,

        /// Credits granted per member per period
        #[arg(short, long)]
        amount: i64,

        /// Frequency: monthly, quarterly, yearly
        #[arg(short, long)]
        frequency: String,

        /// Target: employee, all
        #[arg(long, default_value = "all")]
        target: String,
    },

    /// List allocation rules
    List {
        /// Restrict to one organization
        #[arg(long)]
        org: Option<String>,
    },

    /// Stop a rule's future runs
    Deactivate {
        /// Rule ID
        id: String,
    },
}

/// Parse an owner given as "org:acme" or "user:u-17".
fn parse_owner(input: &str) -> Result<OwnerRef> {
    let (owner_type, owner_id) = input
        .split_once(':')
        .context("Invalid owner format. Use 'org:<id>' or 'user:<id>'")?;
    let owner_type = OwnerType::from_str(owner_type)
        .with_context(|| format!("Invalid owner type '{}'. Use 'org' or 'user'", owner_type))?;
    Ok(OwnerRef::new(owner_type, owner_id))
}

fn parse_credit_type(input: &str) -> Result<CreditType> {
    CreditType::from_str(input).with_context(|| {
        format!(
            "Invalid credit type '{}'. Valid types: session_1_1, webinar",
            input
        )
    })
}

/// Parse a YYYY-MM-DD date into a UTC midnight timestamp.
fn parse_date(input: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .with_context(|| format!("Invalid date format '{}'. Use YYYY-MM-DD", input))?;
    Ok(date.and_hms_opt(0, 0, 0).unwrap().and_utc())
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        if self.verbose {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("creditum=debug")),
                )
                .init();
        }

        match self.command {
            Commands::Init => {
                CreditLedgerService::init(&self.database).await?;
                println!("Database initialized: {}", self.database);
            }

            Commands::Member(member_cmd) => {
                let service = CreditLedgerService::connect(&self.database).await?;
                run_member_command(&service, member_cmd).await?;
            }

            Commands::Rule(rule_cmd) => {
                let service = CreditLedgerService::connect(&self.database).await?;
                run_rule_command(&service, rule_cmd).await?;
            }

            Commands::Credit {
                amount,
                owner,
                credit_type,
                reason,
                actor,
            } => {
                let service = CreditLedgerService::connect(&self.database).await?;
                let owner = parse_owner(&owner)?;
                let credit_type = parse_credit_type(&credit_type)?;

                let tx = service
                    .credit(&owner, credit_type, amount, &reason, actor.as_deref())
                    .await?;
                println!(
                    "Credited {} {} to {} ({})",
                    amount, credit_type, owner, tx.id
                );
            }

            Commands::Debit {
                amount,
                owner,
                credit_type,
                reason,
                booking,
                actor,
            } => {
                let service = CreditLedgerService::connect(&self.database).await?;
                let owner = parse_owner(&owner)?;
                let credit_type = parse_credit_type(&credit_type)?;

                let tx = service
                    .debit(
                        &owner,
                        credit_type,
                        amount,
                        &reason,
                        booking.as_deref(),
                        actor.as_deref(),
                    )
                    .await?;
                println!(
                    "Debited {} {} from {} ({})",
                    amount, credit_type, owner, tx.id
                );
            }

            Commands::Balance { owner, credit_type } => {
                let service = CreditLedgerService::connect(&self.database).await?;
                let owner = parse_owner(&owner)?;
                run_balance_command(&service, &owner, credit_type.as_deref()).await?;
            }

            Commands::History {
                owner,
                credit_type,
                limit,
                cursor,
            } => {
                let service = CreditLedgerService::connect(&self.database).await?;
                let owner = parse_owner(&owner)?;
                let credit_type = parse_credit_type(&credit_type)?;
                run_history_command(&service, &owner, credit_type, limit, cursor.as_deref())
                    .await?;
            }

            Commands::Expire {
                owner,
                credit_type,
                date,
            } => {
                let service = CreditLedgerService::connect(&self.database).await?;
                let owner = parse_owner(&owner)?;
                let credit_type = parse_credit_type(&credit_type)?;
                let expires_at = date.as_deref().map(parse_date).transpose()?;

                let wallet = service.set_expiry(&owner, credit_type, expires_at).await?;
                match wallet.expires_at {
                    Some(at) => println!(
                        "Wallet {}/{} expires {}",
                        owner,
                        credit_type,
                        at.format("%Y-%m-%d")
                    ),
                    None => println!("Wallet {}/{} expiry cleared", owner, credit_type),
                }
            }

            Commands::RunDue { now } => {
                let service = CreditLedgerService::connect(&self.database).await?;
                let now = match now {
                    Some(date_str) => parse_date(&date_str)?,
                    None => Utc::now(),
                };
                run_due_command(&service, now).await?;
            }

            Commands::Report {
                org,
                period,
                format,
            } => {
                let service = CreditLedgerService::connect(&self.database).await?;
                let frequency = Frequency::from_str(&period).with_context(|| {
                    format!(
                        "Invalid period '{}'. Valid periods: monthly, quarterly, yearly",
                        period
                    )
                })?;
                run_report_command(&service, &org, frequency, &format).await?;
            }

            Commands::Check => {
                let service = CreditLedgerService::connect(&self.database).await?;
                run_check_command(&service).await?;
            }

            Commands::Export {
                export_type,
                output,
            } => {
                let service = CreditLedgerService::connect(&self.database).await?;
                run_export_command(&service, &export_type, output.as_deref()).await?;
            }
        }
        Ok(())
    }
}

async fn run_member_command(service: &CreditLedgerService, cmd: MemberCommands) -> Result<()> {
    match cmd {
        MemberCommands::Add {
            org,
            user,
            role,
            inactive,
        } => {
            let role = MemberRole::from_str(&role).with_context(|| {
                format!(
                    "Invalid role '{}'. Valid roles: admin, hr, employee, coach, individual",
                    role
                )
            })?;

            let mut member = OrgMember::new(&org, &user, role);
            if inactive {
                member = member.deactivated();
            }
            service.upsert_member(&member).await?;
            println!("Member {} added to {} as {}", user, org, role);
        }

        MemberCommands::List { org } => {
            let members = service.list_members(&org).await?;
            if members.is_empty() {
                println!("No members found.");
            } else {
                println!("{:<24} {:<12} {:<8}", "USER", "ROLE", "ACTIVE");
                println!("{}", "-".repeat(46));
                for member in members {
                    println!(
                        "{:<24} {:<12} {:<8}",
                        member.user_id,
                        member.role.as_str(),
                        if member.is_active { "yes" } else { "no" }
                    );
                }
            }
        }
    }
    Ok(())
}

async fn run_rule_command(service: &CreditLedgerService, cmd: RuleCommands) -> Result<()> {
    match cmd {
        RuleCommands::Add {
            org,
            credit_type,
            amount,
            frequency,
            target,
        } => {
            let credit_type = parse_credit_type(&credit_type)?;
            let frequency = Frequency::from_str(&frequency).with_context(|| {
                format!(
                    "Invalid frequency '{}'. Valid frequencies: monthly, quarterly, yearly",
                    frequency
                )
            })?;
            let target_role = TargetRole::from_str(&target).with_context(|| {
                format!("Invalid target '{}'. Valid targets: employee, all", target)
            })?;

            let rule = service
                .create_rule(&org, credit_type, amount, frequency, target_role)
                .await?;
            println!(
                "Created rule {}: {} x {} {} to {} members of {}",
                rule.id, frequency, rule.amount, credit_type, target_role, org
            );
        }

        RuleCommands::List { org } => {
            let rules = service.list_rules(org.as_deref()).await?;
            if rules.is_empty() {
                println!("No rules found.");
            } else {
                println!(
                    "{:<38} {:<14} {:<12} {:>7} {:<10} {:<9} {:<8}",
                    "ID", "ORG", "TYPE", "AMOUNT", "FREQUENCY", "TARGET", "ACTIVE"
                );
                println!("{}", "-".repeat(102));
                for rule in rules {
                    println!(
                        "{:<38} {:<14} {:<12} {:>7} {:<10} {:<9} {:<8}",
                        rule.id,
                        rule.organization_id,
                        rule.credit_type.as_str(),
                        rule.amount,
                        rule.frequency.as_str(),
                        rule.target_role.as_str(),
                        if rule.is_active { "yes" } else { "no" }
                    );
                }
            }
        }

        RuleCommands::Deactivate { id } => {
            let rule_id =
                Uuid::parse_str(&id).context("Invalid rule ID format (expected UUID)")?;
            service.deactivate_rule(rule_id).await?;
            println!("Rule {} deactivated", rule_id);
        }
    }
    Ok(())
}

async fn run_balance_command(
    service: &CreditLedgerService,
    owner: &OwnerRef,
    credit_type: Option<&str>,
) -> Result<()> {
    match credit_type {
        Some(ct) => {
            let credit_type = parse_credit_type(ct)?;
            let balance = service.balance(owner, credit_type).await?;
            print_balance_line(owner, &balance);
        }
        None => {
            let balances = service.balances(owner).await?;
            if balances.is_empty() {
                println!("{}: no wallets", owner);
            } else {
                for balance in balances {
                    print_balance_line(owner, &balance);
                }
            }
        }
    }
    Ok(())
}

fn print_balance_line(owner: &OwnerRef, balance: &CreditBalance) {
    match balance.expires_at {
        Some(at) => println!(
            "{} {}: {} (expires {})",
            owner,
            balance.credit_type,
            balance.balance,
            at.format("%Y-%m-%d")
        ),
        None => println!("{} {}: {}", owner, balance.credit_type, balance.balance),
    }
}

async fn run_history_command(
    service: &CreditLedgerService,
    owner: &OwnerRef,
    credit_type: CreditType,
    limit: u32,
    cursor: Option<&str>,
) -> Result<()> {
    let page = service.history(owner, credit_type, limit, cursor).await?;

    if page.transactions.is_empty() {
        println!("No transactions found.");
        return Ok(());
    }

    println!(
        "{:<12} {:>7} {:<30} {:<14} ACTOR",
        "DATE", "DELTA", "REASON", "BOOKING"
    );
    println!("{}", "-".repeat(78));
    for tx in &page.transactions {
        println!(
            "{:<12} {:>+7} {:<30} {:<14} {}",
            tx.created_at.format("%Y-%m-%d"),
            tx.delta,
            truncate(&tx.reason, 30),
            tx.booking_id.as_deref().unwrap_or(""),
            tx.created_by.as_deref().unwrap_or("system")
        );
    }

    if let Some(cursor) = page.next_cursor {
        println!("\nNext page: --cursor '{}'", cursor);
    }
    Ok(())
}

async fn run_due_command(service: &CreditLedgerService, now: DateTime<Utc>) -> Result<()> {
    let report = service.run_due(now).await?;

    println!(
        "Allocation run at {}: {} granted, {} already granted, {} failed",
        report.ran_at.format("%Y-%m-%d"),
        report.granted.len(),
        report.already_granted,
        report.failures.len()
    );

    for grant in &report.granted {
        println!(
            "  +{} {} to user:{} (rule {})",
            grant.amount, grant.credit_type, grant.user_id, grant.rule_id
        );
    }

    if !report.failures.is_empty() {
        println!("\nFailures:");
        for failure in &report.failures {
            println!(
                "  user:{} (rule {}): {}",
                failure.user_id, failure.rule_id, failure.error
            );
        }
    }
    Ok(())
}

async fn run_report_command(
    service: &CreditLedgerService,
    organization_id: &str,
    frequency: Frequency,
    format: &str,
) -> Result<()> {
    let report = service
        .usage_report(organization_id, frequency, Utc::now())
        .await?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "text" => {
            println!(
                "Usage for {} ({} - {})",
                report.organization_id,
                report.period_start.format("%Y-%m-%d"),
                report.period_end.format("%Y-%m-%d")
            );
            println!("  Allocated: {}", report.allocated);
            println!("  Consumed:  {}", report.consumed);
            println!("  Net:       {}", report.net);

            if !report.by_credit_type.is_empty() {
                println!("\nBy credit type:");
                for usage in &report.by_credit_type {
                    println!(
                        "  {:<14} allocated {:>6}, consumed {:>6}",
                        usage.credit_type.as_str(),
                        usage.allocated,
                        usage.consumed
                    );
                }
            }

            if !report.by_role.is_empty() {
                println!("\nBy role:");
                for usage in &report.by_role {
                    println!(
                        "  {:<14} allocated {:>6}, consumed {:>6}",
                        usage.role.as_str(),
                        usage.allocated,
                        usage.consumed
                    );
                }
            }
        }
        _ => {
            anyhow::bail!("Invalid format '{}'. Valid formats: text, json", format);
        }
    }
    Ok(())
}

async fn run_check_command(service: &CreditLedgerService) -> Result<()> {
    println!("Checking ledger integrity...\n");

    let report = service.verify_integrity().await?;

    println!("Wallets:      {}", report.wallet_count);
    println!("Transactions: {}", report.transaction_count);
    println!();

    if report.is_clean() {
        println!("Ledger is consistent.");
        return Ok(());
    }

    println!("Issues found:");
    for drift in &report.drifted {
        println!(
            "  - wallet {} balance {} != ledger sum {}",
            drift.wallet_id, drift.materialized, drift.ledger_sum
        );
    }
    if report.negative_balances > 0 {
        println!("  - {} wallets with negative balance", report.negative_balances);
    }
    if report.zero_deltas > 0 {
        println!("  - {} transactions with zero delta", report.zero_deltas);
    }
    if report.orphaned_transactions > 0 {
        println!(
            "  - {} transactions without a wallet",
            report.orphaned_transactions
        );
    }
    anyhow::bail!("Ledger integrity check failed");
}

async fn run_export_command(
    service: &CreditLedgerService,
    export_type: &str,
    output: Option<&str>,
) -> Result<()> {
    use crate::io::Exporter;
    use std::fs::File;
    use std::io::{stdout, Write};

    let exporter = Exporter::new(service);

    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    match export_type {
        "transactions" => {
            let count = exporter.export_transactions_csv(writer).await?;
            eprintln!("Exported {} transactions", count);
        }
        "wallets" => {
            let count = exporter.export_wallets_csv(writer).await?;
            eprintln!("Exported {} wallets", count);
        }
        "full" => {
            let snapshot = exporter.export_full_json(writer).await?;
            eprintln!(
                "Exported {} wallets, {} transactions, {} rules, {} members",
                snapshot.wallets.len(),
                snapshot.transactions.len(),
                snapshot.rules.len(),
                snapshot.members.len()
            );
        }
        _ => {
            anyhow::bail!(
                "Invalid export type '{}'. Valid types: transactions, wallets, full",
                export_type
            );
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max.saturating_sub(3)])
    }
}
