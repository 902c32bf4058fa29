use anyhow::Result;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use session_engine::{run_sweep, EngineContext, LifecycleWindows, MediaGrantConfig};
use shared::domain::{ConversationId, UserId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/calls.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Grants a user access to a conversation's calls.
    AddMember {
        conversation_id: i64,
        user_id: i64,
    },
    /// Prints the live call of a conversation, if any.
    Live {
        conversation_id: i64,
    },
    /// Runs one cleanup pass against the database and prints its report.
    Sweep {
        #[arg(long, default_value_t = 60)]
        ringing_secs: i64,
        #[arg(long, default_value_t = 60)]
        cooldown_secs: i64,
        #[arg(long, default_value_t = 7 * 24 * 60 * 60)]
        retention_secs: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::AddMember {
            conversation_id,
            user_id,
        } => {
            storage
                .add_conversation_member(ConversationId(conversation_id), UserId(user_id), Utc::now())
                .await?;
            println!("added user_id={user_id} to conversation_id={conversation_id}");
        }
        Command::Live { conversation_id } => {
            match storage
                .latest_live_session(ConversationId(conversation_id))
                .await?
            {
                Some(session) => {
                    let view = storage.load_view(session.session_id).await?;
                    println!("{}", serde_json::to_string_pretty(&view)?);
                }
                None => println!("no live call in conversation_id={conversation_id}"),
            }
        }
        Command::Sweep {
            ringing_secs,
            cooldown_secs,
            retention_secs,
        } => {
            // The sweep never mints media grants, so no credentials are needed.
            let engine = EngineContext::new(
                storage,
                MediaGrantConfig {
                    api_key: String::new(),
                    api_secret: String::new(),
                    ttl_seconds: 0,
                },
            )
            .with_windows(LifecycleWindows {
                ringing: Duration::seconds(ringing_secs),
                cooldown: Duration::seconds(cooldown_secs),
                retention: Duration::seconds(retention_secs),
            });
            let report = run_sweep(&engine).await;
            println!("{}", serde_json::to_string(&report)?);
        }
    }

    Ok(())
}
