//! edr_agent entrypoint: load config, start the poller, push channel and event producer,
//! then wait for Ctrl-C and shut everything down in order.

use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use edr_agent::cli::{parse_args, usage, CliArgs};
use edr_agent::config::{
    load_config, resolve_config_path, resolve_token, AgentConfig, EventSourceKind, TOKEN_ENV,
};
use edr_agent::dispatch::Dispatcher;
use edr_agent::error::ConfigError;
use edr_agent::events::{EventFactory, ProcessWatcher};
use edr_agent::executor::{LocalExecutor, ResponseActions};
use edr_agent::host::{self, SysinfoHost, SystemInfoSource};
use edr_agent::http::HttpTransport;
use edr_agent::poller::CommandPoller;
use edr_agent::producer::EventProducer;
use edr_agent::push::PushChannel;
use edr_agent::telemetry::TelemetryPipeline;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match parse_args(env::args()) {
        Ok(a) => a,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };
    if args.help {
        println!("{}", usage("edr_agent"));
        return Ok(());
    }
    init_tracing();
    run(args).await
}

async fn run(args: CliArgs) -> Result<()> {
    let path = resolve_config_path(args.config.as_deref());
    let cfg = load_config(&path).context("loading configuration")?;
    cfg.validate().context("validating configuration")?;
    let (token, token_source) = resolve_token(&cfg, &path, env::var(TOKEN_ENV).ok())
        .ok_or(ConfigError::MissingToken)
        .context("resolving auth token")?;

    if args.check {
        print_summary(&cfg, &path, token_source);
        return Ok(());
    }

    let agent_id = host::hostname();
    info!(agent_id, server = %cfg.base_url(), "starting edr_agent");

    let transport = Arc::new(HttpTransport::from_config(&cfg, &token, &agent_id));
    let actions: Arc<dyn ResponseActions> = Arc::new(LocalExecutor::from_config(&cfg));
    let sysinfo: Arc<dyn SystemInfoSource> = Arc::new(SysinfoHost);
    let dispatcher = Dispatcher::new(actions, sysinfo);

    let poller = if cfg.disable_http_polling || args.no_poll {
        info!("HTTP command polling disabled");
        None
    } else {
        Some(
            CommandPoller::start(Arc::clone(&transport), dispatcher.clone(), cfg.poll_interval())
                .context("starting command poller")?,
        )
    };

    let push = match cfg.uri.as_deref().filter(|_| cfg.has_push_config()) {
        Some(uri) => {
            let channel = PushChannel::new(dispatcher.clone(), cfg.reconnect.clone(), cfg.heartbeat());
            channel
                .connect(uri)
                .with_context(|| format!("starting push channel to {uri}"))?;
            Some(channel)
        }
        None => None,
    };

    let producer = if cfg.event_sources.contains(&EventSourceKind::Process) {
        let watcher = ProcessWatcher::new(EventFactory::local(agent_id.clone()));
        let pipeline = TelemetryPipeline::new(Arc::clone(&transport), cfg.batch_size);
        Some(
            EventProducer::start(watcher, pipeline, cfg.process_scan_interval())
                .context("starting event producer")?,
        )
    } else {
        warn!("no supported event source configured; telemetry disabled");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown requested");

    // joins block; keep them off the async runtime
    tokio::task::spawn_blocking(move || {
        if let Some(p) = producer {
            let last = p.stop();
            info!(?last, "event producer drained");
        }
        if let Some(p) = poller {
            p.stop();
        }
        if let Some(c) = push {
            c.close();
        }
    })
    .await
    .context("shutting down workers")?;
    info!("edr_agent stopped");
    Ok(())
}

fn print_summary(
    cfg: &AgentConfig,
    path: &std::path::Path,
    token_source: edr_agent::config::TokenSource,
) {
    println!("config: {}", path.display());
    println!("server: {}", cfg.base_url());
    println!("telemetry: {}{}", cfg.base_url(), cfg.api_path);
    println!(
        "push channel: {}",
        cfg.uri.as_deref().filter(|_| cfg.has_push_config()).unwrap_or("disabled")
    );
    println!("polling: {}", if cfg.disable_http_polling { "disabled" } else { "enabled" });
    println!("batch size: {}", cfg.batch_size);
    let cc = cfg.control_channel();
    println!("control channel: {}:{}", cc.address, cc.port);
    println!("token source: {token_source:?}");
}
