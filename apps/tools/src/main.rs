use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{
    ChatSession, HttpPersistence, Message, PersistenceApi, SessionEvent, WsChannel,
};
use shared::domain::{ConversationId, MessageId, UserId};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    conversation_id: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the conversation, then follow live updates until interrupted.
    Tail,
    /// Send one message and report its durable id.
    Send {
        text: String,
        #[arg(long)]
        reply_to: Option<String>,
        #[arg(long)]
        attachment: Vec<String>,
    },
    /// Print per-message read receipts.
    Receipts,
    /// Move this user's read marker to now.
    MarkRead,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    let persistence = Arc::new(HttpPersistence::new(cli.server_url.clone()));
    let channel = Arc::new(WsChannel::new(cli.server_url));
    let session = ChatSession::new(
        UserId::new(cli.user_id),
        persistence.clone(),
        channel,
    );

    let conversation = persistence
        .get_conversation(&ConversationId::new(cli.conversation_id))
        .await?;
    let mut events = session.subscribe_events();
    session.open(conversation).await?;

    match cli.command {
        Command::Tail => {
            for message in session.messages().await {
                print_message(&message);
            }
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(SessionEvent::MessagesChanged { messages }) => {
                            if let Some(last) = messages.last() {
                                print_message(last);
                            }
                        }
                        Ok(SessionEvent::ConnectionChanged(state)) => {
                            eprintln!("connection: {state:?}");
                        }
                        Ok(SessionEvent::SendFailed { reason, .. }) => {
                            eprintln!("send failed: {reason}");
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    },
                }
            }
        }
        Command::Send {
            text,
            reply_to,
            attachment,
        } => {
            session
                .send_message(&text, attachment, reply_to.map(MessageId::new))
                .await?;
            if let Some(message) = session.messages().await.last() {
                println!("sent {}", message.id);
            }
        }
        Command::Receipts => {
            for receipt in session.read_receipts().await {
                println!(
                    "{} read_by_others={} fully_read={}",
                    receipt.message_id, receipt.read_by_others, receipt.fully_read
                );
            }
        }
        Command::MarkRead => {
            session.mark_read().await?;
            println!("read marker moved");
        }
    }

    session.close().await;
    Ok(())
}

fn print_message(message: &Message) {
    let marker = if message.is_provisional { "~" } else { " " };
    println!(
        "{marker}[{}] {}: {}",
        message.created_at.format("%H:%M:%S"),
        message.sender_id,
        message.content
    );
}
