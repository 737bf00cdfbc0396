use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use service_gateway::config::{self, Config, Overrides};
use service_gateway::migrations::Migrator;
use service_gateway::middleware::rate_limit::RateLimiter;
use service_gateway::models::service::{ApiKey, ServicePatch};
use service_gateway::proxy::gateway::InvocationGateway;
use service_gateway::proxy::session::SessionManager;
use service_gateway::proxy::upstream::HttpDispatcher;
use service_gateway::rotation::{self, KeySync};
use service_gateway::store::{MemoryStore, PgStore, RegistryStore};
use service_gateway::{app_router, jobs, AppState};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;
    init_tracing(cfg.log_json)?;

    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Migrate) => {
            let store = open_store(&cfg).await?;
            run_migrations(store.as_ref(), &cfg).await
        }
        Some(cli::Commands::Service { command }) => {
            let url = cfg
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to manage services from the CLI")?;
            let db = PgStore::connect(url).await?;
            db.bootstrap().await?;
            handle_service_command(command, &db).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export only when an endpoint is configured.
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "service-gateway"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "service_gateway=debug,svcgw=debug,tower_http=debug".into()),
        ))
        .with(fmt_layer)
        .with(telemetry_layer)
        .init();
    Ok(())
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn RegistryStore>> {
    match &cfg.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            Ok(Arc::new(PgStore::connect(url).await?))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; registry is in-memory and lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn open_limiter(cfg: &Config) -> anyhow::Result<RateLimiter> {
    match &cfg.redis_url {
        Some(url) => {
            tracing::info!("Connecting to Redis...");
            let client = redis::Client::open(url.as_str())?;
            let conn = redis::aio::ConnectionManager::new(client).await?;
            Ok(RateLimiter::redis(conn, cfg.rate_window))
        }
        None => Ok(RateLimiter::local(cfg.rate_window)),
    }
}

async fn run_migrations(store: &dyn RegistryStore, cfg: &Config) -> anyhow::Result<()> {
    tracing::info!("Running migrations...");
    let overrides = Overrides::from_env(cfg.production);
    let report = Migrator::builtin()?
        .run(store, &overrides)
        .await
        .context("migrations failed; refusing to start")?;
    for step in report {
        tracing::info!(migration = %step.name, outcome = ?step.outcome, "migration step");
    }
    Ok(())
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let store = open_store(&cfg).await?;
    run_migrations(store.as_ref(), &cfg).await?;

    let limiter = open_limiter(&cfg).await?;
    let dispatcher = Arc::new(HttpDispatcher::new(
        cfg.upstream_timeout,
        cfg.upstream_max_retries,
    )?);
    let sessions = SessionManager::with_buffer(cfg.session_buffer);
    let gateway = InvocationGateway::new(store.clone(), limiter, dispatcher.clone(), sessions.clone());

    if let Some(every) = cfg.health_interval {
        jobs::health_check::spawn(store.clone(), dispatcher, every);
        tracing::info!(every_secs = every.as_secs(), "Background health checker started");
    }
    jobs::session_reaper::spawn(sessions, cfg.session_ttl);

    let state = Arc::new(AppState::new(cfg, gateway));
    let app = app_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("service gateway listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn handle_service_command(
    cmd: cli::ServiceCommands,
    db: &PgStore,
) -> anyhow::Result<()> {
    match cmd {
        cli::ServiceCommands::List => {
            let services = db.list().await?;
            if services.is_empty() {
                println!("No services registered.");
                return Ok(());
            }
            println!(
                "{:<28} {:<8} {:<10} {:<6} {:<8} ENDPOINT",
                "NAME", "ENABLED", "HEALTH", "RATE", "KEY"
            );
            for s in services {
                println!(
                    "{:<28} {:<8} {:<10} {:<6} {:<8} {}",
                    s.name,
                    s.enabled,
                    s.health_status.as_str(),
                    s.rate_limit,
                    if s.api_key.is_some() { "set" } else { "-" },
                    s.endpoint.as_deref().unwrap_or("-"),
                );
            }
        }
        cli::ServiceCommands::SetKey { name, key } => {
            let patch = ServicePatch {
                api_key: Some(Some(ApiKey::new(key))),
                ..Default::default()
            };
            let updated = db.update(&name, patch).await?;
            println!("API key updated for {}.", updated.name);
        }
        cli::ServiceCommands::ClearKey { name } => {
            let patch = ServicePatch {
                api_key: Some(None),
                ..Default::default()
            };
            let updated = db.update(&name, patch).await?;
            println!("API key removed for {}.", updated.name);
        }
        cli::ServiceCommands::SyncKeys { env_file } => {
            let overrides = match env_file {
                Some(path) => rotation::overrides_from_file(&path)?,
                None => Overrides::from_env(false),
            };
            let report = rotation::sync_keys(db, &overrides).await?;
            for (name, outcome) in &report.results {
                match outcome {
                    KeySync::Rotated => println!("  {:<28} rotated", name),
                    KeySync::Unchanged => println!("  {:<28} unchanged", name),
                    KeySync::Missing => println!("  {:<28} no {} set", name, rotation::key_var(name)),
                    KeySync::Failed(e) => println!("  {:<28} FAILED: {}", name, e),
                }
            }
            println!(
                "{} rotated, {} failed, {} services total.",
                report.rotated(),
                report.failed(),
                report.results.len()
            );
            if report.failed() > 0 {
                anyhow::bail!("{} service(s) failed to sync", report.failed());
            }
        }
        cli::ServiceCommands::Enable { name } => {
            set_enabled(db, &name, true).await?;
            println!("Service {} enabled.", name);
        }
        cli::ServiceCommands::Disable { name } => {
            set_enabled(db, &name, false).await?;
            println!("Service {} disabled.", name);
        }
    }
    Ok(())
}

async fn set_enabled(db: &PgStore, name: &str, enabled: bool) -> anyhow::Result<()> {
    let patch = ServicePatch {
        enabled: Some(enabled),
        ..Default::default()
    };
    db.update(name, patch).await?;
    Ok(())
}
