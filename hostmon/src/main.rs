//! The hostmon agent binary.
//!
//! Wires the subsystems together: settings and logging first, then the
//! crash report manager, the metric store with its garbage collector, the
//! protocol servers, the periodic checks and the uplink pipeline. One root
//! cancellation token drives graceful shutdown on ctrl-c.

use anyhow::Context as _;
use hostmon::check;
use hostmon::cli::Cli;
use hostmon::crashreport::CrashReporter;
use hostmon::queue::Queue;
use hostmon::settings::AgentSettings;
use hostmon::state::AgentState;
use hostmon::store::{MetricPoint, Store};
use hostmon::telemetry::log;
use hostmon::uplink::{self, forwarder};
use hostmon::{api, nrpe, service_info, zabbix, BootstrapResult, ServiceInfo};
use rand::Rng as _;
use rand::distr::Alphanumeric;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn main() -> BootstrapResult<()> {
    let service_info = service_info!();
    let cli = Cli::new(&service_info)?;

    if running_as_root() && !cli.allow_root() {
        anyhow::bail!("refusing to run as root; pass --yes-run-as-root to override");
    }

    let mut settings = cli.settings;

    if let Ok(port) = std::env::var("PORT") {
        settings.api.port = port
            .parse()
            .with_context(|| format!("invalid PORT environment variable {port:?}"))?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(run(service_info, settings))
}

async fn run(service_info: ServiceInfo, settings: AgentSettings) -> BootstrapResult<()> {
    hostmon::telemetry::log::init(&service_info, &settings.logging)?;

    std::fs::create_dir_all(&settings.state_dir).with_context(|| {
        format!("creating state directory {}", settings.state_dir.display())
    })?;

    let crash_reporter = Arc::new(CrashReporter::new());
    crash_reporter.set_options(settings.crash_report.enabled, &settings.state_dir, None);
    crash_reporter.setup_stderr_redirection()?;

    let store = Arc::new(Store::new(
        Duration::from_secs(settings.store.max_points_age_secs),
        Duration::from_secs(settings.store.max_metrics_age_secs),
    ));

    // Re-arm the manager with a diagnostic that snapshots the live agent.
    {
        let store = Arc::clone(&store);
        let version = service_info.version;

        crash_reporter.set_options(
            settings.crash_report.enabled,
            &settings.state_dir,
            Some(Arc::new(move |dir: &std::path::Path| {
                let snapshot = serde_json::json!({
                    "version": version,
                    "pid": std::process::id(),
                    "metrics_count": store.metrics_count(),
                });

                std::fs::write(dir.join("agent.json"), snapshot.to_string())?;

                Ok(())
            })),
        );
    }

    if crash_reporter
        .bundle_crash_report(settings.crash_report.max_reports)
        .await
        .is_some()
    {
        log::info!("previous run crashed, report bundled for upload");
    }

    let token = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(Arc::clone(&store).run_gc(
        Duration::from_secs(settings.store.gc_interval_secs),
        token.clone(),
    )));

    if settings.api.enabled {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.api.port));
        let server = api::ApiServer::bind(addr, Arc::clone(&store))
            .with_context(|| format!("starting HTTP API on {addr}"))?;

        log::info!("HTTP API listening"; "addr" => %server.local_addr());
        tasks.push(tokio::spawn(server.run(token.clone())));
    }

    if settings.nrpe.enabled {
        let addr: SocketAddr = settings
            .nrpe
            .listen
            .parse()
            .with_context(|| format!("invalid NRPE listen address {:?}", settings.nrpe.listen))?;

        let callback = nrpe::command_registry(settings.nrpe.commands.clone(), service_info.version);
        let server = nrpe::NrpeServer::bind(addr, callback)
            .with_context(|| format!("starting NRPE server on {addr}"))?;

        log::info!("NRPE server listening"; "addr" => %server.local_addr());
        tasks.push(tokio::spawn(server.run(token.clone())));
    }

    if settings.zabbix.enabled {
        let addr: SocketAddr = settings.zabbix.listen.parse().with_context(|| {
            format!("invalid Zabbix listen address {:?}", settings.zabbix.listen)
        })?;

        let server = zabbix::ZabbixServer::bind(addr, zabbix::key_registry(service_info.version))
            .with_context(|| format!("starting Zabbix server on {addr}"))?;

        log::info!("Zabbix server listening"; "addr" => %server.local_addr());
        tasks.push(tokio::spawn(server.run(token.clone())));
    }

    for check_settings in settings.checks.clone() {
        tasks.push(tokio::spawn(check::run_scheduled(
            check_settings,
            Arc::clone(&store),
            token.clone(),
        )));
    }

    let mut uplink_queue: Option<Arc<Queue<Vec<MetricPoint>>>> = None;

    if settings.uplink.enabled {
        match start_uplink(&settings, &store, &token).await {
            Ok((queue, task)) => {
                tasks.push(task);
                uplink_queue = Some(queue);
            }
            Err(err) => {
                log::error!("uplink disabled for this run"; "error" => %err);
            }
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    log::info!("shutting down");
    token.cancel();

    if let Some(queue) = uplink_queue {
        queue.close();
    }

    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

type UplinkHandle = (
    Arc<Queue<Vec<MetricPoint>>>,
    tokio::task::JoinHandle<()>,
);

async fn start_uplink(
    settings: &AgentSettings,
    store: &Arc<Store>,
    token: &CancellationToken,
) -> BootstrapResult<UplinkHandle> {
    let state = AgentState::load(settings.state_file())?;

    let client = uplink::Client::new(
        settings.uplink.base_url.clone(),
        state.agent_uuid().unwrap_or_default(),
        state.password().unwrap_or_default(),
        settings.uplink.tls_insecure,
    )?;

    if state.agent_uuid().is_none() {
        anyhow::ensure!(
            !settings.uplink.registration_key.is_empty(),
            "no stored identity and no registration key configured"
        );

        let password: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(20)
            .map(char::from)
            .collect();

        let agent = client
            .register(
                &settings.uplink.account_id,
                &settings.uplink.registration_key,
                &display_name(),
                &password,
            )
            .await
            .context("registering agent with the vendor API")?;

        state
            .set_identity(&agent.id, &password)
            .context("persisting agent identity")?;
        client.set_credentials(agent.id.clone(), password).await;

        log::info!("agent registered"; "agent_uuid" => agent.id);
    }

    let queue = Arc::new(Queue::new(settings.uplink.queue_size));
    forwarder::attach(store, Arc::clone(&queue));

    let task = tokio::spawn(forwarder::run(
        Arc::clone(&queue),
        Arc::new(client),
        token.clone(),
    ));

    Ok((queue, task))
}

fn display_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "hostmon-agent".to_owned())
}

#[cfg(unix)]
fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}
