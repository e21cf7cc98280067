//! Main Entrypoint for the Sitegen Client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Wiring the studio session (channel, fallback client, history source).
//! 4. Logging in, opening a project and running one generation.
//! 5. Printing every session change until the generation settles.

use anyhow::Context;
use clap::Parser;
use sitegen_client::{config::Config, studio::StudioSession, ws::Identity};
use sitegen_client::ws::transport::WebSocketConnector;
use sitegen_core::{
    fallback::{FallbackClient, HttpFallbackClient},
    history_source::{EmptyHistorySource, HistorySource, HttpHistorySource},
    session::GenerationState,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sitegen")]
#[command(about = "Run a website generation against the generation service", long_about = None)]
#[command(version)]
struct Cli {
    /// User id sent in the channel handshake
    #[arg(short, long)]
    user: String,

    /// Project to open
    #[arg(short, long)]
    project: String,

    /// What to generate
    prompt: String,

    /// Upper bound for a fallback generation, in seconds
    #[arg(long, default_value = "120")]
    fallback_timeout: u64,

    /// Print the conversation history as JSON when done
    #[arg(long)]
    export: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing studio session...");

    // --- 3. Initialize Collaborators ---
    let fallback: Arc<dyn FallbackClient> = Arc::new(
        HttpFallbackClient::new(
            config.fallback_url.clone(),
            config.auth_token.clone(),
            Duration::from_secs(cli.fallback_timeout),
        )
        .context("Failed to build the fallback client")?,
    );
    let history_source: Arc<dyn HistorySource> = match &config.history_url {
        Some(url) => Arc::new(HttpHistorySource::new(url.clone(), config.auth_token.clone())),
        None => {
            info!("HISTORY_URL not set; projects open with an empty history.");
            Arc::new(EmptyHistorySource)
        }
    };
    let mut identity = Identity::new(cli.user.clone());
    if let Some(token) = &config.auth_token {
        identity = identity.with_token(token.clone());
    }

    let studio = StudioSession::new(
        config,
        Arc::new(WebSocketConnector),
        fallback,
        history_source,
    );

    // --- 4. Log In and Open the Project ---
    if let Err(e) = studio.login(identity).await {
        warn!(error = %e, "Channel unavailable; generations will use the fallback path.");
    }
    let turns = studio
        .open_project(&cli.project)
        .await
        .context("Failed to open project")?;
    info!(project_id = %cli.project, turns, "Project opened.");

    // --- 5. Generate and Follow the Session ---
    let mut updates = studio.generation().subscribe();
    let session = studio
        .generate(&cli.project, &cli.prompt)
        .await
        .context("Generation failed")?;
    let generation_id = session.generation_id;

    let mut settled = session.is_terminal().then_some(session);
    while settled.is_none() {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(session) if session.generation_id == generation_id => {
                    println!(
                        "[{:?}] {:>3}% {}",
                        session.state,
                        session.progress,
                        session.stage.as_deref().unwrap_or("")
                    );
                    if session.is_terminal() {
                        settled = Some(session);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed session updates."),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; cancelling the generation.");
                if let Err(e) = studio.generation().cancel_generation(&cli.project).await {
                    warn!(error = %e, "Cancel failed.");
                }
                break;
            }
        }
    }

    if let Some(session) = &settled {
        match session.state {
            GenerationState::Complete => {
                if let Some(result) = &session.result {
                    println!("{}", result.conversational_response);
                    info!(
                        tokens = result.tokens_used,
                        response_time_ms = result.response_time_ms,
                        "Generation complete."
                    );
                }
            }
            GenerationState::Error => {
                warn!(error = session.error.as_deref().unwrap_or("unknown"), "Generation failed.");
            }
            state => info!(?state, "Generation ended."),
        }
    }

    if cli.export {
        let snapshot = studio.export_history();
        println!("{}", snapshot.to_json().context("Failed to export history")?);
    }

    studio.logout().await;
    Ok(())
}
