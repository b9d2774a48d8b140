use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use bor_domain::config::{ConfigSeverity, ServerConfig};
use bor_server::api;
use bor_server::enrollment::{EnrollmentService, TokenRegistry};
use bor_server::hub::PolicyHub;
use bor_server::query::PolicyQueryService;
use bor_server::service::PolicyService;
use bor_server::state::AppState;
use bor_server::store::SqliteStore;
use bor_server::tls;

#[derive(Parser)]
#[command(name = "bord", about = "Bor desktop-policy server", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/bor/config.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default).
    Serve,
    /// Configuration tooling.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Check the configuration file and exit non-zero on errors.
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = ServerConfig::load(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config {
            command: ConfigCommand::Validate,
        }) => {
            let config = ServerConfig::load(&cli.config)?;
            let issues = config.validate();
            for issue in &issues {
                eprintln!("{issue}");
            }
            if ServerConfig::has_errors(&issues) {
                std::process::exit(1);
            }
            println!("configuration OK");
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bor_server=debug")),
        )
        .init();
}

async fn run_server(config: Arc<ServerConfig>) -> anyhow::Result<()> {
    tracing::info!("bord starting");

    // Several rustls crypto providers may be linked; pick one explicitly.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if ServerConfig::has_errors(&issues) {
        anyhow::bail!("config validation failed");
    }

    // ── PKI ──────────────────────────────────────────────────────────
    let (ca_cert_path, ca_key_path) =
        bor_pki::ensure_ca(&config.pki.dir).context("bootstrapping CA")?;
    let ca = Arc::new(
        bor_pki::load_ca(&ca_cert_path, &ca_key_path).context("loading CA")?,
    );
    let (server_cert_path, server_key_path) = bor_pki::ensure_server_cert(
        &config.pki.dir,
        Some(&ca),
        &config.server.extra_hostnames,
    )
    .context("ensuring transport certificate")?;
    let client_roots =
        bor_pki::load_ca_cert_pool(&ca_cert_path).context("loading trust anchors")?;
    tracing::info!(dir = %config.pki.dir.display(), "PKI ready");

    // ── Storage ──────────────────────────────────────────────────────
    let store = SqliteStore::open(&config.storage.db_path)
        .with_context(|| format!("opening {}", config.storage.db_path.display()))?;
    tracing::info!(path = %config.storage.db_path.display(), "store ready");

    // ── Hub ──────────────────────────────────────────────────────────
    let hub = PolicyHub::new(config.hub.event_log_capacity);
    tracing::info!(
        capacity = config.hub.event_log_capacity,
        "policy hub ready"
    );

    // ── Services ─────────────────────────────────────────────────────
    let tokens = TokenRegistry::new();
    let enrollment = Arc::new(EnrollmentService::new(
        tokens,
        ca,
        store.clone(),
        store.clone(),
    ));
    let query = Arc::new(PolicyQueryService::new(store.clone(), store.clone()));
    let service = Arc::new(PolicyService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        hub.clone(),
    ));
    tracing::info!("services ready");

    // ── Admin token (read once, hash for constant-time comparison) ──
    let admin_token_hash = match std::env::var(&config.server.admin_token_env) {
        Ok(token) if !token.is_empty() => {
            tracing::info!("admin token auth enabled");
            Some(Sha256::digest(token.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(
                env_var = %config.server.admin_token_env,
                "admin token unset — admin RPCs are disabled"
            );
            None
        }
    };

    // ── Shutdown signal ──────────────────────────────────────────────
    // One token for the whole process: ctrl-c cancels it, the accept
    // loop and every open policy stream watch it.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    let state = AppState {
        config: config.clone(),
        hub,
        query,
        service,
        enrollment,
        policies: store.clone(),
        bindings: store.clone(),
        groups: store.clone(),
        nodes: store,
        admin_token_hash,
        shutdown: shutdown.clone(),
    };
    let app = api::router(state).layer(TraceLayer::new_for_http());

    // ── TLS listener ─────────────────────────────────────────────────
    let tls_config = tls::build_tls_config(&server_cert_path, &server_key_path, client_roots)
        .context("building TLS config")?;
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "bord listening");

    tls::serve(listener, tls_config, app, shutdown)
        .await
        .context("TLS server error")?;
    tracing::info!("bord stopped");
    Ok(())
}
