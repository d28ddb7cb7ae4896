use anyhow::{anyhow, Result};
use clap::Parser;
use log::info;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use palaver::api::HttpApi;
use palaver::config::{load_config, save_config, Config};
use palaver::models::{DeliveryState, SendPayload};
use palaver::sync::channel::{InProcessConnector, ReconnectingConnector};
use palaver::sync::SyncEngine;

/// Command line arguments for palaver
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "palaver: a real-time chat client.",
    long_about = "palaver keeps per-contact conversations in sync across \
    message history, live push events, and optimistic local sends.\n\n\
    The server URL is persisted after first use; pass --server to change it."
)]
struct Args {
    /// Chat server base URL (e.g. https://chat.example.com)
    #[arg(long, value_name = "URL")]
    server: Option<String>,
}

fn resolve_config(args: &Args) -> Result<Config> {
    if let Some(server) = &args.server {
        let config = Config::new(server);
        save_config(&config)?;
        return Ok(config);
    }
    load_config()?.ok_or_else(|| anyhow!("No server configured; pass --server <URL> once"))
}

fn print_help() {
    println!("Commands:");
    println!("  contacts          list contacts, newest conversation first");
    println!("  search <term>     filter contacts by name");
    println!("  open <id>         open the conversation with a contact");
    println!("  send <id> <text>  send a message");
    println!("  retry <key>       resend a failed message");
    println!("  refresh           refetch the contact list");
    println!("  logout            sign out and quit");
    println!("  quit              quit without signing out");
}

fn state_marker(state: DeliveryState) -> &'static str {
    match state {
        DeliveryState::Pending => "…",
        DeliveryState::Sent => "✓",
        DeliveryState::Failed => "✗",
    }
}

async fn print_conversation(engine: &SyncEngine, contact_id: &str) {
    let me = engine.current_identity().await.map(|i| i.id);
    for message in engine.messages(contact_id).await {
        let direction = if me.as_deref() == Some(message.sender_id.as_str()) {
            "me"
        } else {
            "them"
        };
        let body = message.preview();
        println!(
            "  [{}] {:>4}: {} {}",
            message.created_at.format("%H:%M:%S"),
            direction,
            body,
            state_marker(message.delivery_state)
        );
        if message.delivery_state == DeliveryState::Failed {
            println!("        (retry with: retry {})", message.local_key);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = resolve_config(&args)?;
    info!("Using chat server {}", config.server_url);

    let api = Arc::new(HttpApi::new(&config.server_url)?);
    // The push transport is pluggable; the bundled loopback connector
    // carries no remote events, so this binary is REST-driven.
    let (connector, _hub) = InProcessConnector::pair();
    let connector = Arc::new(ReconnectingConnector::new(connector, 3));
    let engine = SyncEngine::new(api, connector);

    let identity = match engine.sign_in().await {
        Ok(identity) => identity,
        Err(e) => {
            return Err(anyhow!(
                "Sign-in failed ({}). Is a session cookie available for {}?",
                e,
                config.server_url
            ))
        }
    };
    println!("Signed in as {} ({})", identity.display_name, identity.id);
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        let (command, rest) = match line.split_once(' ') {
            Some((c, r)) => (c, r.trim()),
            None => (line, ""),
        };

        match command {
            "" => {}
            "contacts" => {
                for entry in engine.directory_entries().await {
                    let presence = if entry.is_online { "online" } else { "offline" };
                    let preview = entry.last_message_preview.unwrap_or_default();
                    println!(
                        "  {:<24} [{}] {:>8}  {}",
                        entry.contact.display_name, entry.contact.id, presence, preview
                    );
                }
            }
            "search" => {
                for entry in engine.search_contacts(rest).await {
                    println!("  {:<24} [{}]", entry.contact.display_name, entry.contact.id);
                }
            }
            "open" => match engine.select_contact(rest).await {
                Ok(()) => print_conversation(&engine, rest).await,
                Err(e) => println!("Could not load history: {}", e),
            },
            "send" => {
                let Some((contact_id, text)) = rest.split_once(' ') else {
                    println!("Usage: send <id> <text>");
                    continue;
                };
                match engine.send(contact_id, SendPayload::text(text.trim())).await {
                    Ok(key) => println!("Queued as {}", key),
                    Err(e) => println!("Send failed: {}", e),
                }
            }
            "retry" => match engine.retry_send(rest).await {
                Ok(true) => println!("Resending {}", rest),
                Ok(false) => println!("Nothing to retry for {}", rest),
                Err(e) => println!("Retry failed: {}", e),
            },
            "refresh" => match engine.refresh_contacts().await {
                Ok(count) => println!("{} contacts", count),
                Err(e) => println!("Refresh failed: {}", e),
            },
            "logout" => {
                engine.sign_out().await;
                println!("Signed out");
                break;
            }
            "quit" => break,
            _ => print_help(),
        }
    }

    Ok(())
}
