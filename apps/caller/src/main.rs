use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{CallSessionClient, ClientSettings};
use futures::StreamExt;
use media_integration::SignalOnlyMediaConnector;
use shared::domain::{CallType, ConversationId, InitiatorMode, SessionId, UserId};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    user_id: i64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Starts a call and stays in it until it ends or Ctrl-C.
    Start {
        conversation_id: i64,
        #[arg(long, default_value = "audio")]
        call_type: CallType,
        #[arg(long = "invite", value_delimiter = ',')]
        invitees: Vec<i64>,
        /// Ring the invitees without joining yourself.
        #[arg(long)]
        self_join: bool,
    },
    /// Joins a call and stays in it until it ends or Ctrl-C.
    Join { session_id: SessionId },
    Reject { session_id: SessionId },
    Leave {
        session_id: SessionId,
        #[arg(long)]
        skip_cooldown: bool,
    },
    End { session_id: SessionId },
    Invite {
        session_id: SessionId,
        #[arg(value_delimiter = ',')]
        invitees: Vec<i64>,
    },
    /// Prints the conversation's live call, if any.
    Live { conversation_id: i64 },
    /// Prints one JSON snapshot per change until the call ends.
    Watch { session_id: SessionId },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let settings = ClientSettings {
        server_url: args.server_url,
        ..ClientSettings::default()
    };
    let client = CallSessionClient::connect(
        UserId(args.user_id),
        settings,
        Arc::new(SignalOnlyMediaConnector),
    );

    match args.command {
        Command::Start {
            conversation_id,
            call_type,
            invitees,
            self_join,
        } => {
            let mode = if self_join {
                InitiatorMode::SelfJoin
            } else {
                InitiatorMode::AutoJoin
            };
            let session_id = client
                .create_session(
                    ConversationId(conversation_id),
                    call_type,
                    invitees.into_iter().map(UserId).collect(),
                    mode,
                )
                .await?;
            println!("session_id={session_id}");
            if mode == InitiatorMode::AutoJoin {
                stay_in_call(&client, session_id).await?;
            }
        }
        Command::Join { session_id } => {
            let view = client.join_session(session_id).await?;
            println!("joined session_id={session_id} joined_count={}", view.joined_count());
            stay_in_call(&client, session_id).await?;
        }
        Command::Reject { session_id } => {
            client.reject_session(session_id).await?;
            println!("rejected session_id={session_id}");
        }
        Command::Leave {
            session_id,
            skip_cooldown,
        } => {
            if skip_cooldown {
                client.leave_session_now(session_id).await?;
            } else {
                client.leave_session(session_id).await?;
            }
            println!("left session_id={session_id}");
        }
        Command::End { session_id } => {
            let view = client.end_session(session_id).await?;
            println!("session_id={session_id} state={}", view.state().as_str());
        }
        Command::Invite {
            session_id,
            invitees,
        } => {
            let view = client
                .invite(session_id, invitees.into_iter().map(UserId).collect())
                .await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::Live { conversation_id } => {
            match client.live_session(ConversationId(conversation_id)).await? {
                Some(view) => println!("{}", serde_json::to_string_pretty(&view)?),
                None => println!("no live call in conversation_id={conversation_id}"),
            }
        }
        Command::Watch { session_id } => {
            let mut snapshots = client.observe_session(session_id).await?;
            while let Some(view) = snapshots.next().await {
                println!("{}", serde_json::to_string(&view)?);
                if view.is_ended() {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Prints snapshots until the call ends; Ctrl-C leaves it.
async fn stay_in_call(client: &Arc<CallSessionClient>, session_id: SessionId) -> Result<()> {
    let mut snapshots = client.observe_session(session_id).await?;
    loop {
        tokio::select! {
            next = snapshots.next() => match next {
                Some(view) => {
                    info!(
                        %session_id,
                        state = view.state().as_str(),
                        joined = view.joined_count(),
                        "call updated"
                    );
                    if view.is_ended() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                client.leave_session(session_id).await?;
                println!("left session_id={session_id}");
                return Ok(());
            }
        }
    }
}
