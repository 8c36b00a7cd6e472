use std::str::FromStr;

use anyhow::{Context, Result};
use census_api::{enumerate, spawn_signal_listener, EngineConfig, Enumerator, RunReport};
use census_core::{NormalizedRecord, RunStatus, RunSummary};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "censusctl", version, about = "Enumerate every listable resource in a Kubernetes cluster")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig context (default: current context, then in-cluster config)
    #[arg(long = "context", global = true, env = "CENSUS_CONTEXT")]
    context: Option<String>,

    /// Restrict namespaced types to one namespace
    #[arg(long = "ns", global = true, env = "CENSUS_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the resource types the server lets us list
    Discover,
    /// Resolve a kind or resource name (plural, singular, short, plural.group)
    Resolve {
        name: String,
    },
    /// Enumerate one resource type, or everything
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Only this kind or resource name
    #[arg(long = "resource-type", env = "CENSUS_RESOURCE_TYPE")]
    resource_type: Option<String>,
    /// Page size; 0 lists each type in a single request
    #[arg(long = "limit", env = "CENSUS_LIMIT")]
    limit: Option<i64>,
    /// Print records as they arrive instead of after the run
    #[arg(long = "stream", action = ArgAction::SetTrue)]
    stream: bool,
    #[arg(long = "include-status", action = ArgAction::SetTrue)]
    include_status: bool,
    #[arg(long = "include-metadata", action = ArgAction::SetTrue)]
    include_metadata: bool,
    /// Hard deadline for the whole run; 0 disables it
    #[arg(long = "deadline-secs", env = "CENSUS_HARD_DEADLINE_SECS")]
    deadline_secs: Option<u64>,
    /// Stop when no page completes for this long
    #[arg(long = "idle-secs", env = "CENSUS_IDLE_TIMEOUT_SECS")]
    idle_secs: Option<u64>,
    #[arg(long = "qps", env = "CENSUS_QPS")]
    qps: Option<f32>,
    #[arg(long = "burst", env = "CENSUS_BURST")]
    burst: Option<u32>,
}

fn init_tracing() {
    let env = std::env::var("CENSUS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries records; logs go to stderr
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CENSUS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CENSUS_METRICS_ADDR; expected host:port");
        }
    }
}

fn engine_config(cli: &Cli, args: Option<&RunArgs>) -> EngineConfig {
    let mut c = EngineConfig::from_env();
    if cli.context.is_some() { c.context = cli.context.clone(); }
    if cli.namespace.is_some() { c.namespace = cli.namespace.clone(); }
    let Some(a) = args else { return c };
    if a.resource_type.is_some() { c.resource_type = a.resource_type.clone(); }
    if let Some(v) = a.limit { c.limit = v; }
    if let Some(v) = a.deadline_secs { c.hard_deadline_secs = (v > 0).then_some(v); }
    if let Some(v) = a.idle_secs { c.idle_timeout_secs = v; }
    if let Some(v) = a.qps { c.qps = v; }
    if let Some(v) = a.burst { c.burst = v; }
    c.stream |= a.stream;
    c.include_status |= a.include_status;
    c.include_metadata |= a.include_metadata;
    c
}

fn exit_code(summary: &RunSummary) -> i32 {
    if summary.is_success() {
        return 0;
    }
    match summary.status {
        RunStatus::PartialFailure => 2,
        RunStatus::Interrupted => 3,
        RunStatus::Failed | RunStatus::Completed => 1,
    }
}

fn print_record(output: Output, rec: &NormalizedRecord) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string(rec)?),
        Output::Human => {
            let name = if rec.namespace.is_empty() { rec.object_name.clone() } else { format!("{}/{}", rec.namespace, rec.object_name) };
            println!("{} • {} • {} • {}", rec.table, rec.kind, name, rec.uid);
        }
    }
    Ok(())
}

fn print_summary(output: Output, s: &RunSummary, ndjson: bool) -> Result<()> {
    match output {
        Output::Json if ndjson => println!("{}", serde_json::json!({ "summary": s })),
        Output::Json => println!("{}", serde_json::to_string_pretty(s)?),
        Output::Human => {
            println!("status: {}  items: {}  types: {}  took: {}ms", s.status, s.total_items, s.resource_results.len(), s.elapsed_ms);
            for (table, n) in &s.per_table_counts {
                println!("  {:<32} {}", table, n);
            }
            if !s.failed_type_names.is_empty() {
                println!("failed: {}", s.failed_type_names.join(", "));
            }
            if !s.degraded_groups.is_empty() {
                println!("degraded groups: {}", s.degraded_groups.join(", "));
            }
            if !s.reason.is_empty() {
                println!("reason: {}", s.reason);
            }
        }
    }
    Ok(())
}

async fn connect(config: &EngineConfig) -> Result<Enumerator> {
    Enumerator::connect(config.clone()).await.context("connecting to cluster")
}

async fn run(output: Output, config: EngineConfig) -> Result<RunSummary> {
    let ctx = config.run_context();
    spawn_signal_listener(ctx.clone());

    if !config.stream {
        let RunReport { records, summary } = enumerate(config, &ctx, None).await;
        if output == Output::Json {
            println!("{}", serde_json::json!({ "records": records, "summary": summary }));
        } else {
            for rec in &records {
                print_record(output, rec)?;
            }
            print_summary(output, &summary, false)?;
        }
        return Ok(summary);
    }

    let (tx, mut rx) = mpsc::channel::<NormalizedRecord>(1024);
    let printer = tokio::spawn(async move {
        let mut printed = 0u64;
        while let Some(rec) = rx.recv().await {
            if let Err(e) = print_record(output, &rec) {
                error!(error = %e, "cannot print record");
                break;
            }
            printed += 1;
        }
        printed
    });
    let report = enumerate(config, &ctx, Some(tx)).await;
    let printed = printer.await.context("record printer")?;
    info!(printed, "stream drained");
    print_summary(output, &report.summary, true)?;
    Ok(report.summary)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Discover => {
            let config = engine_config(&cli, None);
            let ctx = config.run_context();
            let types = connect(&config).await?.discover(&ctx).await.context("discover")?;
            info!(types = types.len(), "discover ok");
            match cli.output {
                Output::Human => {
                    for t in &types {
                        let scope = if t.descriptor.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {} • {}", t.descriptor.api_version(), t.descriptor.resource, t.descriptor.kind, scope);
                    }
                }
                Output::Json => {
                    let descriptors: Vec<_> = types.iter().map(|t| &t.descriptor).collect();
                    println!("{}", serde_json::to_string_pretty(&descriptors)?);
                }
            }
        }
        Commands::Resolve { name } => {
            let config = engine_config(&cli, None);
            let ctx = config.run_context();
            let rt = connect(&config).await?.resolve(&ctx, name).await.with_context(|| format!("resolve {}", name))?;
            match cli.output {
                Output::Human => println!(
                    "{} • {} • {} • {}",
                    rt.api_version(),
                    rt.resource,
                    rt.kind,
                    if rt.namespaced { "namespaced" } else { "cluster" }
                ),
                Output::Json => println!("{}", serde_json::to_string_pretty(&rt)?),
            }
        }
        Commands::Run(args) => {
            let config = engine_config(&cli, Some(args));
            let summary = run(cli.output, config).await?;
            let code = exit_code(&summary);
            if code != 0 {
                std::process::exit(code);
            }
        }
    }
    Ok(())
}
