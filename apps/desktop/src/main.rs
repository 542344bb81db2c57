use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::{
    HttpBackend, LocalState, ReconnectPolicy, SessionController, SessionEvent, WsConnector,
};
use futures::StreamExt;
use shared::{
    domain::{MessageId, UserId},
    protocol::MessagePayload,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    username: String,
    /// First reconnect delay in milliseconds.
    #[arg(long, default_value_t = 500)]
    reconnect_initial_ms: u64,
    /// Reconnect delay cap in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    reconnect_max_ms: u64,
    /// Seconds without any traffic, server pings included, before the push
    /// channel is considered lost.
    #[arg(long, default_value_t = 60)]
    idle_timeout_secs: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Open(UserId),
    Close,
    Conversations,
    Online,
    Delete(MessageId),
    SendTo(UserId, String),
    Say(String),
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    if let Some(rest) = line.strip_prefix('@') {
        let (target, text) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| anyhow!("usage: @<user_id> <message>"))?;
        let user_id = target
            .parse()
            .map_err(|_| anyhow!("invalid user id: {target}"))?;
        return Ok(Some(Command::SendTo(UserId(user_id), text.trim().to_string())));
    }

    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };
    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next();
    let id_arg = |what: &str| -> Result<i64> {
        arg.ok_or_else(|| anyhow!("usage: /{name} <{what}>"))?
            .parse()
            .map_err(|_| anyhow!("invalid {what}"))
    };

    let command = match name {
        "open" => Command::Open(UserId(id_arg("user_id")?)),
        "close" => Command::Close,
        "list" => Command::Conversations,
        "online" => Command::Online,
        "delete" => Command::Delete(MessageId(id_arg("message_id")?)),
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(anyhow!("unknown command /{other}; try /help")),
    };
    Ok(Some(command))
}

fn format_message(me: UserId, message: &MessagePayload) -> String {
    let status = if message.sender_id() == me {
        if message.is_seen_by_receiver() {
            " (seen)"
        } else {
            " (sent)"
        }
    } else {
        ""
    };
    format!(
        "[{}] #{} {}: {}{status}",
        message.created_at.format("%H:%M:%S"),
        message.message_id,
        message.sender.username,
        message.content
    )
}

fn print_conversations(local: &LocalState) {
    if local.conversations.is_empty() {
        println!("no conversations yet");
        return;
    }
    for conversation in &local.conversations {
        let online = if local.online.contains(&conversation.counterpart.user_id) {
            "*"
        } else {
            " "
        };
        println!(
            "{online} {} (id {}) unread={} last: {}",
            conversation.counterpart.username,
            conversation.counterpart.user_id,
            conversation.unread_count,
            conversation.last_message.content
        );
    }
}

fn print_help() {
    println!("/open <user_id>     open a thread (marks it read)");
    println!("/close              close the open thread");
    println!("/list               list conversations");
    println!("/online             show reachable users");
    println!("/delete <msg_id>    delete a message");
    println!("@<user_id> <text>   send to a user");
    println!("<text>              send to the open thread");
    println!("/quit               log out");
}

async fn execute(controller: &SessionController, command: Command) -> Result<bool> {
    let me = controller.user_id();
    match command {
        Command::Open(counterpart) => {
            for message in controller.open_thread(counterpart).await? {
                println!("{}", format_message(me, &message));
            }
        }
        Command::Close => controller.close_thread().await,
        Command::Conversations => print_conversations(&controller.snapshot().await),
        Command::Online => {
            let online: Vec<String> = controller
                .snapshot()
                .await
                .online
                .iter()
                .map(ToString::to_string)
                .collect();
            println!("online: {}", online.join(", "));
        }
        Command::Delete(message_id) => {
            controller.delete(message_id).await?;
            println!("deleted #{message_id}");
        }
        Command::SendTo(receiver, text) => {
            let message = controller.send(receiver, &text).await?;
            println!("{}", format_message(me, &message));
        }
        Command::Say(text) => {
            let receiver = controller
                .snapshot()
                .await
                .open_counterpart()
                .ok_or_else(|| anyhow!("no open thread; use /open <user_id> or @<user_id>"))?;
            let message = controller.send(receiver, &text).await?;
            println!("{}", format_message(me, &message));
        }
        Command::Help => print_help(),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    let args = Args::parse();

    let policy = ReconnectPolicy {
        initial_delay: Duration::from_millis(args.reconnect_initial_ms),
        max_delay: Duration::from_millis(args.reconnect_max_ms),
        idle_timeout: Duration::from_secs(args.idle_timeout_secs.max(1)),
        ..ReconnectPolicy::default()
    };
    let controller = SessionController::login(
        &args.username,
        Arc::new(HttpBackend::new(&args.server_url)),
        Arc::new(WsConnector::new(&args.server_url)),
        policy,
    )
    .await?;
    let me = controller.user_id();
    println!("logged in as {} (user id {me}); /help for commands", args.username);

    let mut events = controller.event_stream();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                SessionEvent::StateChanged(state) => println!("-- {state}"),
                SessionEvent::Resynced { conversations } => {
                    println!("-- synced {conversations} conversation(s)")
                }
                SessionEvent::MessageReceived(message) => {
                    println!("{}", format_message(me, &message))
                }
                SessionEvent::MessageRead(read) => {
                    println!("-- #{} seen by {}", read.message_id, read.reader_id)
                }
                SessionEvent::PresenceChanged(_) => {}
                SessionEvent::Error(error) => eprintln!("!! {error}"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(error) => {
                eprintln!("!! {error}");
                continue;
            }
        };
        match execute(&controller, command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(error) => eprintln!("!! {error}"),
        }
    }

    controller.logout().await;
    printer.abort();
    Ok(())
}
