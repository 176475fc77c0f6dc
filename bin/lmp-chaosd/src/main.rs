//! ---
//! lmp_section: "01-core-functionality"
//! lmp_subsection: "binary"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Binary entrypoint for the chaos daemon."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use lmp_api::{spawn_api_server, ApiServer, ApiState};
use lmp_chaos::{
    ChaosEngine, ChaosMetrics, IncidentFilter, IncidentLog, InjectionOutcome, InjectionRecord,
    ScenarioCategory, ScenarioRegistry, Scheduler,
};
use lmp_cluster::LiveCluster;
use lmp_common::config::AppConfig;
use lmp_common::logging::init_tracing;
use lmp_metrics::{new_registry, spawn_http_server, DaemonMetrics, SharedRegistry};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use tokio::signal;
use tracing::{info, warn};

mod version;

use version::VersionInfo;

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Chaos engine daemon for the Log Management Platform",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print extended version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the scheduler, operator API and metrics exporter")]
    Run,
    #[command(about = "List configured scenarios")]
    Scenarios,
    #[command(about = "Query the incident log")]
    Incidents(IncidentArgs),
    #[command(about = "Trigger a scenario on the running daemon and wait for it to resolve")]
    Trigger {
        #[arg(value_name = "SCENARIO")]
        id: String,
        #[arg(
            long,
            value_name = "URL",
            help = "Daemon API base URL; defaults to the configured api.listen address"
        )]
        api: Option<Url>,
    },
}

#[derive(Debug, Args)]
struct IncidentArgs {
    #[arg(long, help = "Only incidents of this category (e.g. node-failure)")]
    category: Option<ScenarioCategory>,
    #[arg(long, help = "Only incidents with this outcome (e.g. failed-to-recover)")]
    outcome: Option<InjectionOutcome>,
    #[arg(long, help = "Only incidents of this scenario")]
    scenario: Option<String>,
    #[arg(long, help = "Started at or after this RFC 3339 time")]
    since: Option<DateTime<Utc>>,
    #[arg(long, help = "Started before this RFC 3339 time")]
    until: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = lmp_chaos::incident_log::DEFAULT_QUERY_LIMIT)]
    limit: usize,
    #[arg(long, help = "Print one JSON record per line")]
    json: bool,
}

impl IncidentArgs {
    fn filter(&self) -> IncidentFilter {
        let mut filter = IncidentFilter::new()
            .between(self.since, self.until)
            .limit(self.limit);
        if let Some(category) = self.category {
            filter = filter.category(category);
        }
        if let Some(outcome) = self.outcome {
            filter = filter.outcome(outcome);
        }
        if let Some(scenario) = &self.scenario {
            filter = filter.scenario(scenario.clone());
        }
        filter.paged()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let version = VersionInfo::current();
    if cli.version {
        println!("{}", version.extended());
        return Ok(());
    }
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/chaosd.toml"));
    candidates.push(PathBuf::from("configs/chaosd.example.toml"));

    let load_started = Instant::now();
    let loaded_config = AppConfig::load_with_source(&candidates)?;
    let config = loaded_config.config;
    let load_duration = load_started.elapsed();

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(&metrics_registry)?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.set_build_info(&version.semver, &version.build_timestamp, &version.target);

    init_tracing("lmp-chaosd", &config.logging)?;
    info!(
        config_path = %loaded_config.source.display(),
        scenarios = config.chaos.scenarios.len(),
        "configuration loaded"
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            daemon_metrics.inc_start();
            run_daemon(config, metrics_registry, version).await?
        }
        Commands::Scenarios => print_scenarios(&config)?,
        Commands::Incidents(args) => print_incidents(&config, &args)?,
        Commands::Trigger { id, api } => {
            let base = match api {
                Some(base) => base,
                None => api_base(config.api.listen)?,
            };
            trigger_remote(&base, &id, config.chaos.poll_interval).await?;
        }
    }

    Ok(())
}

fn build_engine(config: &AppConfig, metrics: ChaosMetrics) -> Result<Arc<ChaosEngine>> {
    let registry = ScenarioRegistry::from_config(&config.chaos.scenarios)
        .context("failed to register configured scenarios")?;
    let cluster = LiveCluster::from_config(&config.cluster)?.into_control();
    let incidents = match &config.chaos.incident_log {
        Some(path) => IncidentLog::open(path)
            .with_context(|| format!("failed to open incident log {}", path.display()))?,
        None => IncidentLog::in_memory(),
    };
    Ok(ChaosEngine::builder(registry, cluster)
        .config(&config.chaos)
        .incident_log(Arc::new(incidents))
        .metrics(metrics)
        .build())
}

async fn run_daemon(config: AppConfig, metrics_registry: SharedRegistry, version: VersionInfo) -> Result<()> {
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(metrics_registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let chaos_metrics = ChaosMetrics::new(metrics_registry).context("failed to register chaos metrics")?;
    let engine = build_engine(&config, chaos_metrics)?;
    let scheduler = Scheduler::start(Arc::clone(&engine));
    info!(
        scenarios = engine.registry().len(),
        periodic = scheduler.periodic_loops(),
        incidents = engine.incidents().len(),
        "chaos engine started"
    );

    let mut api_server: Option<ApiServer> = None;
    if config.api.enabled {
        let state = Arc::new(ApiState::new(
            Arc::clone(&engine),
            config.api.title.clone(),
            version.semver.clone(),
        ));
        match spawn_api_server(state, config.api.listen, &config.api.cors_allow_origins) {
            Ok(server) => {
                info!(address = %server.addr(), "api server listening");
                api_server = Some(server);
            }
            Err(err) => {
                warn!(error = %err, "failed to start api server");
            }
        }
    } else {
        info!("api server disabled by configuration");
    }

    info!(banner = %version.banner(), "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; rolling back open injections");
    scheduler.shutdown().await;

    if let Some(server) = api_server {
        server.shutdown().await?;
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}

fn print_scenarios(config: &AppConfig) -> Result<()> {
    let registry = ScenarioRegistry::from_config(&config.chaos.scenarios)
        .context("failed to register configured scenarios")?;
    println!(
        "{:<28} {:<20} {:<16} {:<10} {}",
        "ID", "CATEGORY", "TARGET", "SEVERITY", "INTERVAL"
    );
    for scenario in registry.list() {
        let interval = scenario
            .interval
            .map(|every| format!("{}s", every.as_secs()))
            .unwrap_or_else(|| "on-demand".to_string());
        println!(
            "{:<28} {:<20} {:<16} {:<10} {}",
            scenario.id,
            scenario.category,
            scenario.target,
            scenario.effect.severity,
            interval
        );
    }
    Ok(())
}

fn print_incidents(config: &AppConfig, args: &IncidentArgs) -> Result<()> {
    let path = config
        .chaos
        .incident_log
        .as_ref()
        .ok_or_else(|| anyhow!("chaos.incident_log is not configured; incidents are kept in memory only"))?;
    let log = IncidentLog::open_read_only(path)
        .with_context(|| format!("failed to read incident log {}", path.display()))?;
    for record in log.query(args.filter()) {
        if args.json {
            println!("{}", serde_json::to_string(&record)?);
        } else {
            println!("{}", incident_line(&record));
        }
    }
    Ok(())
}

/// Base URL for reaching the local daemon's API.
fn api_base(listen: SocketAddr) -> Result<Url> {
    let host = match listen.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    let addr = SocketAddr::new(host, listen.port());
    Url::parse(&format!("http://{addr}/")).with_context(|| format!("invalid api address {addr}"))
}

/// Trigger through the daemon's API and follow the incident until it is
/// finalized. Ctrl-C asks the daemon to abort, which rolls the effect back.
async fn trigger_remote(base: &Url, scenario_id: &str, poll: Duration) -> Result<InjectionRecord> {
    let client = reqwest::Client::new();
    let response = client
        .post(base.join(&format!("api/scenarios/{scenario_id}/trigger"))?)
        .send()
        .await
        .with_context(|| format!("chaos daemon unreachable at {base}"))?;
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .context("daemon sent an unreadable response")?;
    if status != StatusCode::ACCEPTED {
        let message = body["message"].as_str().unwrap_or("no detail");
        bail!("trigger of {scenario_id} refused ({status}): {message}");
    }
    let id = body["incident_id"]
        .as_str()
        .ok_or_else(|| anyhow!("daemon accepted the trigger without an incident id"))?
        .to_string();
    println!("triggered {scenario_id} as incident {id}; waiting for recovery (ctrl-c aborts)");

    let incident = base.join(&format!("api/incidents/{id}"))?;
    let abort = base.join(&format!("api/incidents/{id}/abort"))?;
    let mut ticker = tokio::time::interval(poll);
    let interrupted = signal::ctrl_c();
    tokio::pin!(interrupted);
    let mut aborting = false;
    loop {
        tokio::select! {
            result = &mut interrupted, if !aborting => {
                result?;
                aborting = true;
                warn!(incident = %id, "interrupted; asking the daemon to abort");
                let response = client.post(abort.clone()).send().await?;
                if !matches!(response.status(), StatusCode::ACCEPTED | StatusCode::CONFLICT) {
                    bail!("abort of incident {id} failed with {}", response.status());
                }
            }
            _ = ticker.tick() => {
                let record: InjectionRecord = client
                    .get(incident.clone())
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                if record.is_finalized() {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                    return Ok(record);
                }
            }
        }
    }
}

fn incident_line(record: &InjectionRecord) -> String {
    let outcome = record
        .outcome
        .map(|outcome| outcome.as_str())
        .unwrap_or("open");
    let recovery = record
        .recovery
        .map(|recovery| format!("{:.1}s", recovery.as_secs_f64()))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} {} {:<28} {:<16} {:<18} {}",
        record.started_at.to_rfc3339(),
        record.id,
        record.scenario_id,
        record.target,
        outcome,
        recovery
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmp_testharness::{engine_with, scenario, ScriptedCluster};

    #[test]
    fn incident_filters_parse_from_the_command_line() {
        let cli = Cli::parse_from([
            "lmp-chaosd",
            "incidents",
            "--category",
            "node-failure",
            "--outcome",
            "failed-to-recover",
            "--since",
            "2026-01-01T00:00:00Z",
            "--limit",
            "5000",
        ]);
        let Some(Commands::Incidents(args)) = cli.command else {
            panic!("expected incidents subcommand");
        };
        let filter = args.filter();
        assert_eq!(filter.category, Some(ScenarioCategory::NodeFailure));
        assert_eq!(filter.outcome, Some(InjectionOutcome::FailedToRecover));
        assert!(filter.since.is_some());
        assert_eq!(filter.limit, Some(lmp_chaos::incident_log::MAX_QUERY_LIMIT));
    }

    #[test]
    fn run_is_the_default_command() {
        let cli = Cli::parse_from(["lmp-chaosd", "--config", "configs/chaosd.example.toml"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, Some(PathBuf::from("configs/chaosd.example.toml")));
    }

    #[test]
    fn example_configuration_is_valid() {
        let config: AppConfig = include_str!("../../../configs/chaosd.example.toml")
            .parse()
            .unwrap();
        let registry = ScenarioRegistry::from_config(&config.chaos.scenarios).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.periodic().count(), 1);
        assert_eq!(config.cluster.commands.len(), 4);
    }

    #[test]
    fn unspecified_listen_address_maps_to_loopback() {
        let base = api_base("0.0.0.0:8000".parse().unwrap()).unwrap();
        assert_eq!(base.as_str(), "http://127.0.0.1:8000/");
        let v6 = api_base("[::]:8000".parse().unwrap()).unwrap();
        assert_eq!(v6.as_str(), "http://[::1]:8000/");
    }

    #[tokio::test]
    async fn trigger_follows_the_daemon_incident_to_resolution() {
        let cluster = ScriptedCluster::new();
        cluster.unhealthy_for("es1", 2);
        let engine = engine_with(&cluster, &[scenario("node-down-es1", "es1")]);
        let state = Arc::new(ApiState::new(Arc::clone(&engine), "LMP", "test"));
        let server =
            spawn_api_server(state, "127.0.0.1:0".parse().unwrap(), &["*".to_string()]).unwrap();
        let base = api_base(server.addr()).unwrap();

        let record = trigger_remote(&base, "node-down-es1", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(record.outcome, Some(InjectionOutcome::Success));
        assert_eq!(cluster.apply_calls(), 1);
        assert_eq!(cluster.revert_calls(), 1);
        assert_eq!(engine.query(IncidentFilter::new()).count(), 1);

        let err = trigger_remote(&base, "no-such-scenario", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"), "{err}");
        server.shutdown().await.unwrap();
    }
}
