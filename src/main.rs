use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use approval_pipeline::app::{AppState, Backends};
use approval_pipeline::store::postgres::PgStore;
use approval_pipeline::store::{TenantSource, YamlTenantSource};
use approval_pipeline::tenant::StrategyRegistry;
use approval_pipeline::{api, config, jobs};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export only when an endpoint is configured; plain logs otherwise.
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "approval-pipeline"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "approval_pipeline=debug,approvald=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port, no_workers }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port, !no_workers).await
        }
        Some(cli::Commands::Worker { workers }) => {
            let workers = workers.unwrap_or(cfg.worker_count);
            run_workers(cfg, workers).await
        }
        Some(cli::Commands::Tenant { command }) => handle_tenant_command(&cfg, command).await,
        Some(cli::Commands::DeadLetter { command }) => {
            handle_dead_letter_command(&cfg, command).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port, true).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    opentelemetry::global::shutdown_tracer_provider();
    result
}

async fn build_state(cfg: &config::Config) -> anyhow::Result<Arc<AppState>> {
    let backends = Backends::connect(cfg).await?;
    let state = Arc::new(AppState::from_config(backends, cfg));
    let tenants = state.load_tenants().await?;
    tracing::info!(tenants, "tenant catalog loaded");
    Ok(state)
}

/// Flip the shutdown channel on Ctrl-C.
fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    let signal_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            let _ = signal_tx.send(true);
        }
    });
    (tx, rx)
}

fn spawn_background(
    state: &Arc<AppState>,
    cfg: &config::Config,
    workers: usize,
    shutdown: &watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = vec![jobs::registry_refresh::spawn(
        state.registry.clone(),
        state.tenant_source.clone(),
        state.strategies.clone(),
        cfg.tenant_refresh_interval(),
        shutdown.clone(),
    )];
    if let Some(cache) = &state.identity_cache {
        handles.push(jobs::identity_cache::spawn(
            cache.clone(),
            cfg.identity_cache_ttl(),
            shutdown.clone(),
        ));
    }
    if workers > 0 {
        let pool = Arc::new(
            state
                .worker_pool(workers)
                .with_batch_size(cfg.worker_batch_size)
                .with_idle_wait(cfg.worker_idle_wait())
                .with_redelivery(cfg.redelivery_policy()),
        );
        handles.extend(pool.spawn(shutdown.clone()));
        tracing::info!(workers, "workers started");
    }
    handles
}

async fn run_server(cfg: config::Config, port: u16, with_workers: bool) -> anyhow::Result<()> {
    let state = build_state(&cfg).await?;
    let (_tx, shutdown) = shutdown_channel();

    let workers = if with_workers { cfg.worker_count } else { 0 };
    let background = spawn_background(&state, &cfg, workers, &shutdown);

    let app = api::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("approvald listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let mut server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    for handle in background {
        let _ = handle.await;
    }
    Ok(())
}

async fn run_workers(cfg: config::Config, workers: usize) -> anyhow::Result<()> {
    if cfg.redis_url.is_empty() {
        tracing::warn!("worker started without REDIS_URL; it only sees messages published by this process");
    }
    let state = build_state(&cfg).await?;
    let (_tx, shutdown) = shutdown_channel();

    let background = spawn_background(&state, &cfg, workers.max(1), &shutdown);
    for handle in background {
        let _ = handle.await;
    }
    Ok(())
}

async fn handle_tenant_command(
    cfg: &config::Config,
    command: cli::TenantCommands,
) -> anyhow::Result<()> {
    match command {
        cli::TenantCommands::List => {
            let state = build_state(cfg).await?;
            let snapshot = state.registry.snapshot().await;
            println!(
                "{:<38} {:<24} {:<10} {:<10} {:<8} DOC TYPE",
                "TENANT", "NAME", "STRATEGY", "RULES", "ENABLED"
            );
            for tenant in snapshot.tenants() {
                println!(
                    "{:<38} {:<24} {:<10} {:<10} {:<8} {}",
                    tenant.tenant_id,
                    tenant.name,
                    tenant.strategy_tag,
                    tenant.validation_tag,
                    tenant.enabled,
                    tenant.doc_type_id
                );
            }
            for problem in state.strategies.unresolved_tags(&snapshot.tenants()) {
                println!("warning: {}", problem);
            }
        }
        cli::TenantCommands::Import { file } => {
            if cfg.database_url.is_empty() {
                anyhow::bail!("DATABASE_URL must be set to import tenants");
            }
            let tenants = YamlTenantSource::new(&file).load_tenants().await?;

            let strategies = StrategyRegistry::builtin();
            let catalog: Vec<_> = tenants.iter().cloned().map(Arc::new).collect();
            let problems = strategies.unresolved_tags(&catalog);
            if !problems.is_empty() {
                anyhow::bail!("refusing to import: {}", problems.join("; "));
            }

            let db = PgStore::connect(&cfg.database_url).await?;
            db.migrate().await?;
            for tenant in &tenants {
                db.upsert_tenant(tenant).await?;
            }
            println!("Imported {} tenants from {}", tenants.len(), file.display());
        }
    }
    Ok(())
}

async fn handle_dead_letter_command(
    cfg: &config::Config,
    command: cli::DeadLetterCommands,
) -> anyhow::Result<()> {
    let state = build_state(cfg).await?;
    match command {
        cli::DeadLetterCommands::List { limit } => {
            let entries = state.dead_letters.list(limit).await?;
            if entries.is_empty() {
                println!("No dead-lettered messages.");
            }
            for entry in entries {
                println!(
                    "{}  original={}  tenant={}  reason={}  attempts={}  at={}\n    {}",
                    entry.message_id,
                    entry.record.original_message_id,
                    entry.record.tenant_id,
                    entry.record.reason.as_str(),
                    entry.record.attempt_count,
                    entry.record.dead_lettered_at,
                    entry.record.error
                );
            }
        }
        cli::DeadLetterCommands::Replay { message_id, scan } => {
            match state.dead_letters.replay(message_id, scan).await? {
                Some(new_id) => println!("Replayed {} as {}", message_id, new_id),
                None => anyhow::bail!("no dead-lettered message {} in the first {} entries", message_id, scan),
            }
        }
    }
    Ok(())
}
