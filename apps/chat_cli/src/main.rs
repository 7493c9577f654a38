use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{load_settings, ChatClient, ChatView, DeliveryState, MessageKey};
use shared::domain::{ConversationId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    conversation: Uuid,
    /// Own user id, so echoes of our sends are matched to the local user.
    #[arg(long)]
    user_id: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(token) = args.token {
        settings.access_token = Some(token);
    }
    if let Some(user_id) = args.user_id {
        settings.local_user_id = Some(UserId(user_id));
    }

    let client = ChatClient::new(settings);
    let conversation_id = ConversationId(args.conversation);
    if let Err(error) = client.open(conversation_id).await {
        warn!(%error, "conversation opened without history");
    }

    let printer = tokio::spawn(print_views(WatchStream::new(client.subscribe_view())));
    println!("commands: /typing on|off, /read, /older N, /close, /quit; anything else is sent");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if !run_command(&client, line.trim()).await {
            break;
        }
    }

    client.close();
    printer.abort();
    Ok(())
}

/// Returns `false` when the session should end.
async fn run_command(client: &Arc<ChatClient>, line: &str) -> bool {
    let result = match line.split_once(' ').unwrap_or((line, "")) {
        ("/quit", _) => return false,
        ("/typing", arg) => client.set_typing(arg.trim() != "off"),
        ("/read", _) => client.mark_read(),
        ("/older", arg) => match arg.trim().parse::<u32>() {
            Ok(page) => client.load_older(page).await.map(|loaded| {
                println!("loaded {loaded} older messages");
            }),
            Err(_) => {
                println!("usage: /older <page>");
                Ok(())
            }
        },
        ("/close", _) => client.close_conversation().await,
        _ if line.is_empty() => Ok(()),
        _ => client.send(line).map(|_| ()),
    };
    if let Err(error) = result {
        println!("! {error}");
    }
    true
}

async fn print_views(mut views: WatchStream<ChatView>) {
    while let Some(view) = views.next().await {
        render(&view);
    }
}

fn render(view: &ChatView) {
    let status = match (view.is_closed, view.is_connected) {
        (true, _) => "closed",
        (false, true) => "connected",
        (false, false) => "disconnected",
    };
    println!("--- [{status}] {} messages ---", view.messages.len());
    for message in &view.messages {
        let sender = message
            .sender
            .as_ref()
            .map(|sender| sender.username.as_str())
            .unwrap_or("me");
        let marker = match (message.key, message.delivery) {
            (MessageKey::Temp(_), DeliveryState::Unconfirmed) => " (unconfirmed)",
            (MessageKey::Temp(_), _) => " (sending)",
            _ => "",
        };
        println!(
            "{} {sender}: {}{marker}",
            message.created_at.format("%H:%M:%S"),
            message.content
        );
    }
    if !view.typing_users.is_empty() {
        let names: Vec<&str> = view
            .typing_users
            .iter()
            .map(|user| user.username.as_str())
            .collect();
        println!("typing: {}", names.join(", "));
    }
    let online: Vec<&str> = view
        .presence
        .values()
        .filter(|entry| entry.is_online)
        .map(|entry| entry.username.as_str())
        .collect();
    if !online.is_empty() {
        println!("online: {}", online.join(", "));
    }
}
