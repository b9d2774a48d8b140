use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use bor_agent::client::PolicyClient;
use bor_agent::enroll::{resolve_client_id, run_enrollment};
use bor_agent::materialize::{
    ChromiumMaterializer, FirefoxMaterializer, KconfigMaterializer, PolicyApplier,
};
use bor_agent::notify::{LogNotifier, NotifyDebouncer};
use bor_agent::rpc::ServerRpc;
use bor_agent::facts;
use bor_domain::config::{AgentConfig, ConfigSeverity};
use bor_protocol::PolicyUpdate;

#[derive(Parser)]
#[command(name = "bor-agent", about = "Bor workstation policy agent", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "/etc/bor/agent.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enroll this workstation using a one-shot token.
    Enroll {
        /// Enrollment token issued by the server administrator.
        #[arg(long)]
        token: String,
    },
    /// Run the policy subscription and keep managed files in sync.
    Run,
    /// Restore every managed file to its pre-management state.
    Restore,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bor_agent=debug")),
        )
        .init();
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();
    let config = AgentConfig::load(&cli.config)?;
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error)
    {
        anyhow::bail!("config validation failed");
    }

    match cli.command {
        Command::Enroll { token } => {
            run_enrollment(&config, &token)
                .await
                .context("enrollment failed")?;
            Ok(())
        }
        Command::Run => run_agent(config).await,
        Command::Restore => restore_all(&config),
    }
}

async fn run_agent(config: AgentConfig) -> anyhow::Result<()> {
    if !config.cert_path().exists() || !config.key_path().exists() {
        anyhow::bail!(
            "not enrolled: run `bor-agent enroll --token <token>` first \
             (expected materials under {})",
            config.data_dir.display()
        );
    }
    let client_id = resolve_client_id(&config);
    let rpc = Arc::new(ServerRpc::authenticated(&config).context("building RPC client")?);

    // ── Shutdown signal ──────────────────────────────────────────────
    // One token for the whole process: ctrl-c cancels it, the stream
    // client, the heartbeat task, and in-flight reports all watch it.
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

    // ── Notification settings from the server ────────────────────────
    let agent_config = match rpc.agent_config().await {
        Ok(remote) => remote,
        Err(e) => {
            tracing::warn!(error = %e, "agent-config fetch failed, using defaults");
            bor_protocol::AgentConfigResponse {
                notify_users: true,
                notify_cooldown_seconds: 30,
                apply_message: "Your workstation configuration has been updated.".into(),
                restore_message: "A managed configuration has been removed.".into(),
                error_message: "A managed configuration could not be applied.".into(),
            }
        }
    };
    let notifier = agent_config.notify_users.then(|| {
        NotifyDebouncer::new(
            Duration::from_secs(agent_config.notify_cooldown_seconds),
            Arc::new(LogNotifier),
        )
    });

    // ── Heartbeat task ───────────────────────────────────────────────
    {
        let rpc = rpc.clone();
        let client_id = client_id.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(config.heartbeat_interval_secs.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = rpc.heartbeat(&client_id, facts::gather()).await {
                            tracing::warn!(error = %e, "heartbeat failed");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    // ── Stream + materialisation loop ────────────────────────────────
    let mut applier = PolicyApplier::new(config.targets.clone());
    let (tx, mut rx) = mpsc::channel::<PolicyUpdate>(64);
    let client = PolicyClient::new(config.clone(), client_id.clone());
    let stream_task = tokio::spawn(client.run(tx, shutdown.clone()));

    loop {
        let update = tokio::select! {
            update = rx.recv() => match update {
                Some(update) => update,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        match applier.handle(&update) {
            Ok(outcome) => {
                if outcome.metadata_requested {
                    if let Err(e) = rpc.heartbeat(&client_id, facts::gather()).await {
                        tracing::warn!(error = %e, "requested metadata refresh failed");
                    }
                }
                if !outcome.changed_kinds.is_empty() {
                    if let Some(notifier) = &notifier {
                        let anything_left = outcome
                            .changed_kinds
                            .iter()
                            .any(|kind| !applier.policies_of_kind(*kind).is_empty());
                        let message = if anything_left {
                            agent_config.apply_message.clone()
                        } else {
                            agent_config.restore_message.clone()
                        };
                        notifier.request(message);
                    }
                    for kind in outcome.changed_kinds {
                        for policy in applier.policies_of_kind(kind) {
                            let policy_id = policy.id.clone();
                            let rpc = rpc.clone();
                            let client_id = client_id.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    result = rpc.report_compliance(
                                        &client_id, &policy_id, true, "",
                                    ) => {
                                        if let Err(e) = result {
                                            tracing::debug!(error = %e, "compliance report failed");
                                        }
                                    }
                                    _ = shutdown.cancelled() => {}
                                }
                            });
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to materialise policy update");
                if let Some(notifier) = &notifier {
                    notifier.request(agent_config.error_message.clone());
                }
            }
        }
    }

    stream_task.await?.context("policy stream terminated")?;
    tracing::info!("bor-agent stopped");
    Ok(())
}

fn restore_all(config: &AgentConfig) -> anyhow::Result<()> {
    tracing::info!("restoring all managed files");
    FirefoxMaterializer::new(config.targets.firefox.clone()).apply(&[])?;
    ChromiumMaterializer::new(config.targets.chromium.clone()).apply(&[])?;
    KconfigMaterializer::new(config.targets.kconfig.clone()).apply(&[])?;
    tracing::info!("restore complete");
    Ok(())
}
