//! Run a handful of simulated users through the matchmaking flow.
//!
//! Every user joins, paired users exchange a greeting and leave, and the
//! resulting store contents are printed as JSON.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use matchroom::store::{DocumentStore, InMemoryStore};
use matchroom::{AnonymousIdentity, ChatClient, ClientStatus, JoinOutcome, MatchConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "simulate")]
#[command(about = "Simulate anonymous users pairing up against an in-memory store")]
struct Cli {
    /// Number of simulated users
    #[arg(long, default_value_t = 6)]
    users: usize,

    /// Message each paired user sends
    #[arg(long, default_value = "hello!")]
    message: String,

    /// Leave the sessions open instead of leaving after the greeting
    #[arg(long)]
    stay: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,matchroom=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let cli = Cli::parse();
    if cli.users == 0 {
        bail!("--users must be at least 1");
    }

    let config = MatchConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(?config, users = cli.users, "starting simulation");

    let store = InMemoryStore::new();
    let shared: Arc<dyn DocumentStore> = Arc::new(store.clone());

    let mut clients = Vec::with_capacity(cli.users);
    for _ in 0..cli.users {
        let identity = AnonymousIdentity::new();
        let client = ChatClient::connect(&identity, Arc::clone(&shared), config.clone())
            .await
            .context("Failed to connect simulated user")?;
        clients.push(client);
    }

    for client in &clients {
        match client.join().await.context("Join failed")? {
            JoinOutcome::Paired { session_id, partner } => {
                tracing::info!(user_id = %client.user_id(), %partner, %session_id, "claimed a waiter");
            }
            JoinOutcome::Waiting => {
                tracing::info!(user_id = %client.user_id(), "waiting");
            }
        }
    }

    // Claimed users learn about their session through the match listener.
    tokio::time::sleep(Duration::from_millis(100)).await;

    for client in &clients {
        if client.view().status == ClientStatus::Chatting {
            client
                .send_message(&cli.message)
                .await
                .context("Send failed")?;
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    for client in &clients {
        let view = client.view();
        tracing::info!(
            user_id = %view.user_id,
            status = %view.status,
            partner = %view.partner_display().unwrap_or_default(),
            messages = view.messages.len(),
            "client state"
        );
    }

    if !cli.stay {
        for client in &clients {
            client.leave().await.context("Leave failed")?;
        }
        for client in &clients {
            client.shutdown().await;
        }
    }

    let dump = store.export().context("Failed to export store")?;
    println!("{}", serde_json::to_string_pretty(&dump)?);

    Ok(())
}
