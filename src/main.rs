//! ampshare: OCPP 1.6 CSMS / local controller with smart charging.
//!
//! Exit codes: 0 clean shutdown, 1 unrecoverable startup error (bad
//! config or CSV), 2 port bind failure.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tracing::{error, info, warn};

use ampshare::allocator::AllocatorRunner;
use ampshare::api::{ApiContext, UserStore};
use ampshare::config::AppConfig;
use ampshare::model::{store, ModelRegistry, RegistrySettings, SessionHistoryWriter};
use ampshare::ocpp::{CommandSender, ConnectionRegistry, OcppServer};
use ampshare::support::audit::AuditLog;
use ampshare::support::shutdown::{listen_for_shutdown_signals, ShutdownSignal};
use ampshare::watchdog;

const DEFAULT_CONFIG: &str = "config/ampshare.toml";

fn config_path() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    PathBuf::from(DEFAULT_CONFIG)
}

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = config_path();
    let config = match AppConfig::load(&config_path) {
        Ok(config) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
                )
                .init();
            info!("Configuration loaded from {}", config_path.display());
            Arc::new(config)
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .init();
            error!("Failed to load configuration: {}", e);
            return ExitCode::from(1);
        }
    };

    info!("Starting ampshare...");

    // ── Model ──────────────────────────────────────────────────
    let settings = RegistrySettings {
        default_priority: config.allocator.default_priority,
        default_conn_max: config.allocator.default_max_allocation,
        usage_window: ChronoDuration::seconds(config.allocator.usage_monitoring_interval as i64),
        allow_concurrent_tag: config.csms.allow_concurrent_tag,
        charger_autoregister: config.model.charger_autoregister,
        charger_autoregister_group: config.model.charger_autoregister_group.clone(),
    };
    let registry = Arc::new(ModelRegistry::new(settings));

    let firmware_csv = (!config.model.firmware_csv.is_empty())
        .then(|| PathBuf::from(&config.model.firmware_csv));
    let model = match store::load_model(
        Path::new(&config.model.groups_csv),
        Path::new(&config.model.chargers_csv),
        Path::new(&config.model.tags_csv),
        firmware_csv.as_deref(),
        config.allocator.default_max_allocation,
    ) {
        Ok(model) => model,
        Err(e) => {
            error!("Failed to load model CSVs: {}", e);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = registry.install(model) {
        error!("Model rejected: {}", e);
        return ExitCode::from(1);
    }

    if !config.history.session_csv.is_empty() {
        match SessionHistoryWriter::open(Path::new(&config.history.session_csv)) {
            Ok(writer) => registry.set_history_writer(writer),
            Err(e) => {
                error!("Cannot open session history: {}", e);
                return ExitCode::from(1);
            }
        }
    }

    // ── API users + audit trail ────────────────────────────────
    let users = match UserStore::load(Path::new(&config.api.users_csv)) {
        Ok(users) => Arc::new(users),
        Err(e) => {
            error!("Failed to load users: {}", e);
            return ExitCode::from(1);
        }
    };
    let audit = match AuditLog::open(Path::new(&config.history.audit_file)) {
        Ok(audit) => Arc::new(audit),
        Err(e) => {
            warn!("Audit log unavailable ({}), continuing without", e);
            Arc::new(AuditLog::disabled())
        }
    };

    // ── Shared plumbing ────────────────────────────────────────
    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            listen_for_shutdown_signals(shutdown).await;
        });
    }

    let connections = ConnectionRegistry::shared();
    // A charger that times out cools off for roughly one allocator cycle.
    let commands = CommandSender::shared(
        connections.clone(),
        std::time::Duration::from_secs(config.host.ping_timeout),
        std::time::Duration::from_secs(config.allocator.run_interval.max(1)),
    );

    let api_context = Arc::new(ApiContext {
        registry: registry.clone(),
        connections: connections.clone(),
        commands: commands.clone(),
        users: users.clone(),
        audit,
        config: config.clone(),
    });

    // ── Background tasks ───────────────────────────────────────
    watchdog::spawn(registry.clone(), config.csms.clone(), shutdown.clone());

    if config.allocator.run_interval == 0 {
        info!("Smart charging disabled by configuration");
    } else {
        let runner = Arc::new(AllocatorRunner::new(
            registry.clone(),
            commands.clone(),
            config.allocator.clone(),
            shutdown.clone(),
        ));
        runner.spawn_all();
    }

    // ── Server ─────────────────────────────────────────────────
    let server = OcppServer::new(
        config.clone(),
        registry.clone(),
        connections,
        commands,
        api_context,
        shutdown.clone(),
    );
    if let Err(e) = server.run().await {
        error!("{}", e);
        return ExitCode::from(2);
    }

    // ── Flush on shutdown ──────────────────────────────────────
    info!("Flushing model to CSV...");
    let flush = registry.with_model(|model| {
        store::write_groups(Path::new(&config.model.groups_csv), &model.groups)
            .and_then(|_| {
                store::write_chargers(Path::new(&config.model.chargers_csv), &model.chargers)
            })
            .and_then(|_| store::write_tags(Path::new(&config.model.tags_csv), &model.tags))
    });
    if let Err(e) = flush {
        warn!("CSV flush failed: {}", e);
    }
    if let Err(e) = users.write(Path::new(&config.api.users_csv)) {
        warn!("Users flush failed: {}", e);
    }

    info!("ampshare shutdown complete");
    ExitCode::SUCCESS
}
