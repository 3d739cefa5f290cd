//! Tara CLI entry point.

use anyhow::Context as _;
use clap::{CommandFactory as _, Parser};
use futures::StreamExt as _;
use std::sync::Arc;

use tara::agent::{Channel, PersonaAgent};
use tara::coalesce::Coalescer;
use tara::config::{Config, RuntimeConfig};
use tara::messaging::MessagingManager;
use tara::messaging::telegram::TelegramAdapter;
use tara::messaging::terminal::TerminalAdapter;
use tara::messaging::whatsapp::WhatsAppAdapter;

#[derive(Parser)]
#[command(name = "tara")]
#[command(about = "Tara, a friendly financial guide on your terminal, Telegram and WhatsApp")]
struct Cli {
    /// Chat in this terminal
    #[arg(long, conflicts_with_all = ["telegram", "whatsapp"])]
    terminal: bool,

    /// Serve the Telegram bot
    #[arg(long)]
    telegram: bool,

    /// Serve the WhatsApp webhook
    #[arg(long)]
    whatsapp: bool,

    /// WhatsApp webhook bind address (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// WhatsApp webhook port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if !cli.terminal && !cli.telegram && !cli.whatsapp {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    }

    dotenvy::dotenv().ok();
    let _ = rustls::crypto::ring::default_provider().install_default();

    if !cli.terminal {
        tara::logging::init_foreground_tracing(cli.debug)?;
    }

    let mut config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::load().context("failed to load configuration")?
    };

    let _log_guard = if cli.terminal {
        Some(tara::logging::init_file_tracing(&config.log_dir(), cli.debug)?)
    } else {
        None
    };

    if let Some(whatsapp) = config.messaging.whatsapp.as_mut() {
        if let Some(host) = &cli.host {
            whatsapp.bind = host.clone();
        }
        if let Some(port) = cli.port {
            whatsapp.port = port;
        }
    }

    tracing::info!(instance_dir = %config.instance_dir.display(), "configuration loaded");

    let runtime_config = Arc::new(RuntimeConfig::new(&config));
    let agent = Arc::new(PersonaAgent::new(&config).context("failed to initialize agent")?);
    let messaging = Arc::new(MessagingManager::new());

    if cli.terminal {
        let terminal = TerminalAdapter::new(&config.messaging.terminal, &config.agent.name);
        terminal.greet(&config.agent.greeting).await?;
        messaging.register(terminal).await;
    }

    if cli.telegram {
        let telegram = config
            .messaging
            .telegram
            .as_ref()
            .context("telegram requested but no bot token is configured (TELEGRAM_BOT_TOKEN)")?;
        messaging
            .register(TelegramAdapter::new(
                telegram,
                &config.agent.greeting,
                config.messaging.max_attachment_bytes,
            ))
            .await;
    }

    if cli.whatsapp {
        let whatsapp = config.messaging.whatsapp.as_ref().context(
            "whatsapp requested but it is not configured (WHATSAPP_TOKEN, WHATSAPP_PHONE_NUMBER_ID)",
        )?;
        messaging
            .register(WhatsAppAdapter::new(
                whatsapp,
                config.messaging.max_attachment_bytes,
            )?)
            .await;
    }

    let channel = Arc::new(Channel::new(
        agent,
        messaging.clone(),
        runtime_config.clone(),
    ));
    let coalescer = Coalescer::new(channel, runtime_config);

    let mut inbound = messaging
        .start()
        .await
        .context("failed to start messaging adapters")?;

    for (adapter, error) in messaging.health_check().await {
        tracing::warn!(adapter = %adapter, %error, "messaging adapter failed health check");
    }

    tracing::info!("tara started");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            message = inbound.next() => match message {
                Some(message) => {
                    tracing::debug!(
                        source = %message.source,
                        sender_id = %message.sender_id,
                        "inbound message"
                    );
                    coalescer.submit(message.user_key(), message).await;
                }
                None => {
                    tracing::info!("all inbound streams ended");
                    break;
                }
            },
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    coalescer.shutdown().await;
    messaging.shutdown().await;

    tracing::info!("tara stopped");
    Ok(())
}
