use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::{
    domain::UserId,
    protocol::{Pagination, DEFAULT_PAGE_LIMIT},
};
use storage::Storage;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a user, or print the id of an existing one.
    CreateUser { username: String },
    ListUsers,
    /// Conversation list for one user, most recent first.
    Conversations { user_id: i64 },
    /// One page of the thread between two users, oldest first.
    Thread {
        user_id: i64,
        other_user_id: i64,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser { username } => {
            let username = username.trim();
            if username.is_empty() {
                bail!("username cannot be empty");
            }
            let user_id = storage.create_user(username).await?;
            println!("user_id={user_id} username={username}");
        }
        Command::ListUsers => {
            for user in storage.list_users().await? {
                println!("{}\t{}", user.user_id, user.username);
            }
        }
        Command::Conversations { user_id } => {
            let user_id = UserId(user_id);
            for head in storage.list_conversations(user_id).await? {
                let name = storage
                    .username_for_user(head.counterpart_id)
                    .await?
                    .unwrap_or_else(|| format!("user-{}", head.counterpart_id));
                println!(
                    "{name} (id {})\tunread={}\tlast=#{} {}\t{}",
                    head.counterpart_id,
                    head.unread_count,
                    head.last_message.message_id,
                    head.last_message.created_at.to_rfc3339(),
                    head.last_message.content
                );
            }
        }
        Command::Thread {
            user_id,
            other_user_id,
            page,
            limit,
        } => {
            let (page, limit) = Pagination {
                page: Some(page),
                limit: Some(limit),
            }
            .resolve();
            let (a, b) = (UserId(user_id), UserId(other_user_id));
            let total = storage.count_messages_between(a, b).await?;
            let offset = u64::from(page - 1) * u64::from(limit);
            for message in storage.list_messages_between(a, b, limit, offset).await? {
                let readers: Vec<String> = message
                    .read_by
                    .iter()
                    .map(|r| r.reader_id.to_string())
                    .collect();
                println!(
                    "#{}\t{}\t{} -> {}\tread_by=[{}]\t{}",
                    message.message_id,
                    message.created_at.to_rfc3339(),
                    message.sender_id,
                    message.receiver_id,
                    readers.join(","),
                    message.content
                );
            }
            println!("page {page} of {} ({total} messages)", total.div_ceil(u64::from(limit)).max(1));
        }
    }

    Ok(())
}
