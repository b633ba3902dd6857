use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};

use donation_payments::{
    bootstrap,
    config::{self, AppConfig},
    events::process_events,
    gateways::GatewayClients,
    models::{CurrencySupport, GatewayProfile},
    services::{CallerContext, GatewayConfigInput},
    PaymentCore,
};

#[derive(Parser)]
#[command(
    name = "payments-admin",
    about = "Gateway configuration and audit tooling for donation payments",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update the gateway for a provider and mode
    Configure(ConfigureArgs),
    /// Activate a configured gateway
    Activate { id: i64 },
    /// Deactivate a gateway
    Deactivate { id: i64 },
    /// List active gateways in selection order
    ListActive,
    /// Show the gateway that would be chosen for an amount
    BestGateway {
        amount: Decimal,
        currency: String,
    },
    /// Attempt statistics for a window
    AuditReport(WindowArgs),
    /// Statistics plus gateway performance and fraud summary
    ComplianceReport(WindowArgs),
    /// Delete attempts older than the retention period
    PurgeAttempts {
        /// Overrides `audit.retention_days`
        #[arg(long)]
        days: Option<i64>,
    },
}

#[derive(Args)]
struct ConfigureArgs {
    /// mollie, stripe or paypal
    provider: String,
    #[arg(long, action = ArgAction::SetTrue)]
    test_mode: bool,
    #[arg(long)]
    name: Option<String>,
    #[arg(long, env = "GATEWAY_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, env = "GATEWAY_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,
    /// Extra settings as key=value, e.g. client_id=AZ...
    #[arg(long = "setting", value_parser = parse_setting)]
    settings: Vec<(String, String)>,
    #[arg(long)]
    priority: Option<i32>,
    #[arg(long)]
    min_amount: Option<Decimal>,
    #[arg(long)]
    max_amount: Option<Decimal>,
    /// Supported currency codes, replacing the stored list
    #[arg(long = "currency")]
    currencies: Vec<String>,
}

#[derive(Args)]
struct WindowArgs {
    /// RFC 3339 start, defaults to 30 days ago
    #[arg(long)]
    from: Option<DateTime<Utc>>,
    /// RFC 3339 end, defaults to now
    #[arg(long)]
    to: Option<DateTime<Utc>>,
}

impl WindowArgs {
    fn resolve(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let to = self.to.unwrap_or_else(Utc::now);
        let from = self.from.unwrap_or(to - Duration::days(30));
        (from, to)
    }
}

fn parse_setting(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

impl From<ConfigureArgs> for GatewayConfigInput {
    fn from(args: ConfigureArgs) -> Self {
        let settings = (!args.settings.is_empty()).then(|| {
            args.settings
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect::<Map<String, Value>>()
        });
        let currencies = (!args.currencies.is_empty())
            .then(|| args.currencies.into_iter().map(CurrencySupport::new).collect());

        GatewayConfigInput {
            provider: args.provider,
            name: args.name,
            test_mode: args.test_mode,
            api_key: args.api_key,
            webhook_secret: args.webhook_secret,
            settings,
            priority: args.priority,
            min_amount: args.min_amount,
            max_amount: args.max_amount,
            currencies,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config().context("failed to load application config")?;
    config::init_tracing(config.log_level(), config.log_json);

    let core = initialize(&config).await?;
    let caller = CallerContext::user(whoami());
    run(&core, &config, cli.command, &caller, cli.json).await
}

async fn initialize(config: &AppConfig) -> Result<PaymentCore> {
    let clients = GatewayClients::new(config.gateway_timeout());
    let (core, event_rx) = bootstrap(config, clients)
        .await
        .context("failed to initialize payment core")?;
    tokio::spawn(process_events(event_rx, None));
    Ok(core)
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "payments-admin".to_string())
}

async fn run(
    core: &PaymentCore,
    config: &AppConfig,
    command: Commands,
    caller: &CallerContext,
    json: bool,
) -> Result<()> {
    match command {
        Commands::Configure(args) => {
            let profile = core
                .gateways
                .configure_gateway(args.into(), caller)
                .await
                .context("failed to configure gateway")?;
            render(&profile, json, || print_profile(&profile))?;
        }
        Commands::Activate { id } => {
            let gateway = core.gateways.activate_gateway(id, caller).await?;
            render(&gateway, json, || println!("Gateway {} ({}) is active", gateway.id, gateway.name))?;
        }
        Commands::Deactivate { id } => {
            let gateway = core.gateways.deactivate_gateway(id, caller).await?;
            render(&gateway, json, || println!("Gateway {} ({}) is inactive", gateway.id, gateway.name))?;
        }
        Commands::ListActive => {
            let profiles = core.gateways.get_active_gateways().await?;
            render(&profiles, json, || {
                if profiles.is_empty() {
                    println!("No active gateways");
                }
                profiles.iter().for_each(print_profile);
            })?;
        }
        Commands::BestGateway { amount, currency } => {
            let best = core.gateways.find_best_gateway(amount, &currency).await?;
            render(&best, json, || match &best {
                Some(profile) => print_profile(profile),
                None => println!("No gateway can process {} {}", amount, currency),
            })?;
        }
        Commands::AuditReport(window) => {
            let (from, to) = window.resolve();
            let report = core.audit.generate_audit_report(from, to).await?;
            render(&report, json, || {
                println!("Attempts {} .. {}", report.from, report.to);
                println!(
                    "  total {}  successful {}  failed {}  success rate {}%",
                    report.totals.total,
                    report.totals.successful,
                    report.totals.failed,
                    report.totals.success_rate
                );
                for (gateway, stats) in &report.by_gateway {
                    println!("  {:<8} {} attempts, {}% success", gateway, stats.total, stats.success_rate);
                }
                for code in &report.top_error_codes {
                    println!("  {:<24} {}", code.code, code.count);
                }
            })?;
        }
        Commands::ComplianceReport(window) => {
            let (from, to) = window.resolve();
            let report = core.audit.get_compliance_report(from, to).await?;
            // no compact text form for this one
            print_json(&report)?;
        }
        Commands::PurgeAttempts { days } => {
            let days = days.unwrap_or(config.audit.retention_days);
            let removed = core.trail.purge_older_than(days).await?;
            render(&removed, json, || {
                println!("Removed {} attempts older than {} days", removed, days)
            })?;
        }
    }
    Ok(())
}

fn print_profile(profile: &GatewayProfile) {
    let gateway = &profile.gateway;
    let currencies: Vec<&str> = profile
        .currencies
        .iter()
        .filter(|c| c.is_active)
        .map(|c| c.currency.as_str())
        .collect();
    println!(
        "#{:<4} {:<20} {:<7} prio {:<3} {}-{} [{}]{}{}",
        gateway.id,
        gateway.name,
        gateway.provider,
        gateway.priority,
        gateway.min_amount,
        gateway.max_amount,
        currencies.join(","),
        if gateway.test_mode { " test" } else { "" },
        if gateway.is_active { " active" } else { "" },
    );
}

fn render<T: Serialize>(value: &T, json: bool, text: impl FnOnce()) -> Result<()> {
    if json {
        print_json(value)
    } else {
        text();
        Ok(())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
