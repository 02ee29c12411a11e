// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CLI for converging a declared VM fleet toward its desired state
//!
//! Three verbs: `plan` computes the diff and mutates nothing, `apply`
//! executes it (exiting nonzero if any key failed), and `destroy` removes
//! every VM tracked by the desired state.

use anyhow::bail;
use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use flotilla_common::fleet::FleetDescription;
use flotilla_common::fleet::ProviderMode;
use flotilla_provider::SimProvider;
use flotilla_reconciler::FleetReport;
use flotilla_reconciler::Plan;
use flotilla_reconciler::Reconciler;
use flotilla_reconciler::ReconcilerConfig;
use flotilla_reconciler::DEFAULT_MAX_CONCURRENCY;
use serde::Serialize;
use slog::Drain;
use slog::Logger;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tabled::Tabled;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Flotilla::parse();
    let log = init_logger();

    match args.command {
        FlotillaCommand::Plan(cmd) => cmd_plan(&log, cmd).await,
        FlotillaCommand::Apply(cmd) => cmd_apply(&log, cmd).await,
        FlotillaCommand::Destroy(cmd) => cmd_destroy(&log, cmd).await,
    }
}

/// Declarative batch-VM provisioner
#[derive(Debug, Parser)]
#[command(name = "flotilla", version)]
struct Flotilla {
    #[command(subcommand)]
    command: FlotillaCommand,
}

#[derive(Debug, Subcommand)]
enum FlotillaCommand {
    /// Compute what apply would do, mutating nothing
    Plan(PlanArgs),
    /// Converge the fleet toward the desired state
    Apply(ApplyArgs),
    /// Destroy every VM tracked by the desired state
    Destroy(DestroyArgs),
}

#[derive(Debug, Args)]
struct FleetArgs {
    /// Path to the fleet description (TOML)
    #[arg(long, short = 'c')]
    config: Utf8PathBuf,

    /// Emit machine-readable JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[command(flatten)]
    fleet: FleetArgs,

    /// Also plan destruction of VMs absent from the desired state
    #[arg(long)]
    prune: bool,
}

#[derive(Debug, Args)]
struct ApplyArgs {
    #[command(flatten)]
    fleet: FleetArgs,

    /// Destroy VMs absent from the desired state (default: leave them)
    #[arg(long)]
    prune: bool,

    /// Bound on concurrently in-flight per-VM operations
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENCY)]
    max_concurrency: usize,
}

#[derive(Debug, Args)]
struct DestroyArgs {
    #[command(flatten)]
    fleet: FleetArgs,

    /// Bound on concurrently in-flight per-VM operations
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENCY)]
    max_concurrency: usize,
}

fn init_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).chan_size(0x2000).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

/// Load the fleet description and open the provider it names.
fn load_fleet(
    log: &Logger,
    config: &Utf8PathBuf,
) -> Result<(FleetDescription, Arc<SimProvider>), anyhow::Error> {
    let fleet = FleetDescription::from_file(config)?;
    let provider = match fleet.provider.mode {
        ProviderMode::Sim => SimProvider::open(
            log.clone(),
            &fleet.infrastructure,
            fleet.provider.state_path.as_deref(),
        )
        .context("opening simulated provider")?,
    };
    Ok((fleet, Arc::new(provider)))
}

fn reconciler(
    log: &Logger,
    provider: Arc<SimProvider>,
    max_concurrency: usize,
    prune: bool,
) -> Reconciler<SimProvider> {
    Reconciler::new(
        provider,
        ReconcilerConfig { max_concurrency, prune },
        log,
    )
}

async fn cmd_plan(log: &Logger, cmd: PlanArgs) -> Result<(), anyhow::Error> {
    let (fleet, provider) = load_fleet(log, &cmd.fleet.config)?;
    let reconciler = reconciler(
        log,
        provider,
        DEFAULT_MAX_CONCURRENCY,
        cmd.prune,
    );
    let plan = reconciler.plan(&fleet).await?;

    if cmd.fleet.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_plan(&fleet, &plan);
    }
    Ok(())
}

async fn cmd_apply(log: &Logger, cmd: ApplyArgs) -> Result<(), anyhow::Error> {
    let (fleet, provider) = load_fleet(log, &cmd.fleet.config)?;
    let reconciler =
        reconciler(log, provider, cmd.max_concurrency, cmd.prune);
    let report = reconciler.apply(&fleet).await?;

    print_report(&report, cmd.fleet.json)?;
    if report.has_failures() {
        bail!("apply failed for vms: {}", report.failed_keys().join(", "));
    }
    Ok(())
}

async fn cmd_destroy(
    log: &Logger,
    cmd: DestroyArgs,
) -> Result<(), anyhow::Error> {
    let (fleet, provider) = load_fleet(log, &cmd.fleet.config)?;
    let reconciler =
        reconciler(log, provider, cmd.max_concurrency, false);
    let report = reconciler.destroy(&fleet).await?;

    print_report(&report, cmd.fleet.json)?;
    if report.has_failures() {
        bail!(
            "destroy failed for vms: {}",
            report.failed_keys().join(", ")
        );
    }
    Ok(())
}

#[derive(Tabled)]
#[tabled(rename_all = "SCREAMING_SNAKE_CASE")]
struct PlanRow {
    key: String,
    action: &'static str,
    name: String,
    ip: String,
}

fn print_plan(fleet: &FleetDescription, plan: &Plan) {
    let row = |key: &String, action: &'static str| {
        let (name, ip) = match fleet.vms.get(key) {
            Some(spec) => (spec.name.clone(), spec.ipv4_address.clone()),
            None => ("-".to_string(), "-".to_string()),
        };
        PlanRow { key: key.clone(), action, name, ip }
    };
    let rows = plan
        .to_create
        .iter()
        .map(|key| row(key, "create"))
        .chain(plan.to_destroy.iter().map(|key| row(key, "destroy")))
        .chain(plan.unchanged.iter().map(|key| row(key, "unchanged")))
        .collect::<Vec<_>>();
    println!("{}", table(rows));
    if plan.is_noop() {
        println!("\nnothing to do");
    } else {
        println!(
            "\nplan: {} to create, {} to destroy",
            plan.to_create.len(),
            plan.to_destroy.len()
        );
    }
}

#[derive(Tabled)]
#[tabled(rename_all = "SCREAMING_SNAKE_CASE")]
struct ReportRow {
    key: String,
    status: String,
    name: String,
    ip: String,
    error: String,
}

/// JSON form of the apply/destroy output: the two keyed maps callers
/// correlate against the desired state, plus the full report.
#[derive(Serialize)]
struct ReportOutput<'a> {
    ip_addresses: BTreeMap<String, Option<Ipv4Addr>>,
    vm_names: BTreeMap<String, Option<String>>,
    report: &'a FleetReport,
}

fn print_report(
    report: &FleetReport,
    json: bool,
) -> Result<(), anyhow::Error> {
    if json {
        let output = ReportOutput {
            ip_addresses: report.ip_addresses(),
            vm_names: report.vm_names(),
            report,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let dash = || "-".to_string();
    let rows = report
        .results
        .values()
        .chain(report.pruned.values())
        .map(|result| ReportRow {
            key: result.key.clone(),
            status: result.status.to_string(),
            name: result
                .observed
                .as_ref()
                .map(|vm| vm.name.clone())
                .unwrap_or_else(dash),
            ip: result
                .observed
                .as_ref()
                .and_then(|vm| vm.guest_ip)
                .map(|ip| ip.to_string())
                .unwrap_or_else(dash),
            error: result.error.clone().unwrap_or_else(dash),
        })
        .collect::<Vec<_>>();
    println!("{}", table(rows));
    Ok(())
}

fn table<R: Tabled>(rows: Vec<R>) -> String {
    tabled::Table::new(rows)
        .with(tabled::settings::Style::empty())
        .with(tabled::settings::Padding::new(0, 1, 0, 0))
        .to_string()
}
