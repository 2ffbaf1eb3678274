//! GrantBot terminal client
//!
//! Reference front end for the widget core: chat with the backend from a
//! terminal, or print a grant report.

use std::collections::HashSet;

use anyhow::Context;
use clap::{Parser, Subcommand};
use grantbot_widget::config::Config;
use grantbot_widget::report::{format_amount, format_report_date};
use grantbot_widget::{
    ChatError, ChatSession, FileStore, HttpConversationApi, ReportClient, ReportOutcome,
};
use shared_types::{ChatSnapshot, MessageId, NoticeKind, Report, Sender};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "grantbot")]
#[command(about = "GrantBot - find grant opportunities from the terminal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with GrantBot
    Chat {
        /// Identify by email instead of an anonymous session
        #[arg(long)]
        email: Option<String>,
    },
    /// Print a grant report
    Report {
        report_id: String,
        /// Sent as X-User-Email
        #[arg(long)]
        email: Option<String>,
    },
}

fn load_env_file() {
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!(error = %e, "Could not determine current directory for .env lookup");
            return;
        }
    };

    let mut current = cwd.clone();
    loop {
        let candidate = current.join(".env");
        if candidate.exists() {
            if let Err(e) = dotenvy::from_path(&candidate) {
                tracing::warn!(path = %candidate.display(), error = %e, "Failed to load .env file");
            }
            return;
        }
        if !current.pop() {
            break;
        }
    }
    tracing::debug!(cwd = %cwd.display(), "No .env file found; using process environment only");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("grantbot_widget=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    load_env_file();
    let config = Config::from_env()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Chat { email } => chat(config, email).await,
        Commands::Report { report_id, email } => report(config, report_id, email).await,
    }
}

// ============ Chat ============

async fn chat(config: Config, email: Option<String>) -> anyhow::Result<()> {
    let store = FileStore::open(&config.state_file)
        .with_context(|| format!("Failed to open state file {}", config.state_file.display()))?;
    let api = HttpConversationApi::new(&config.api_base, config.http_timeout)?;
    let session = ChatSession::new(api, store, config.session_options());

    session.restore(email.as_deref()).await?;
    let renderer = tokio::spawn(render(session.subscribe()));

    if let Err(e) = session.open_chat().await {
        tracing::error!(error = %e, "Could not open chat");
        println!("An error occurred. Please try again.");
        renderer.abort();
        return Ok(());
    }
    println!("Type a message, or /like N, /dislike N <reason>, /refresh, /email, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let Some(command) = line.strip_prefix('/') else {
            // Sends run concurrently so the prompt stays responsive while polling.
            let session = session.clone();
            let text = line.to_string();
            tokio::spawn(async move { report_failure(session.send(&text).await) });
            continue;
        };

        let mut parts = command.splitn(3, ' ');
        let result = match (parts.next(), parts.next(), parts.next()) {
            (Some("quit"), _, _) => break,
            (Some("like"), Some(n), _) => match n.parse() {
                Ok(index) => session.like(index).await,
                Err(_) => Err(ChatError::Validation("expected a message number")),
            },
            (Some("dislike"), Some(n), reason) => match n.parse() {
                Ok(index) => dislike(&session, index, reason.unwrap_or_default()).await,
                Err(_) => Err(ChatError::Validation("expected a message number")),
            },
            (Some("refresh"), _, _) => session.refresh().await,
            (Some("email"), _, _) => session.email_transcript().await,
            _ => Err(ChatError::Validation("unknown command")),
        };
        if let Err(ChatError::Validation(reason)) = &result {
            println!("({reason})");
        }
        report_failure(result);
    }

    renderer.abort();
    Ok(())
}

async fn dislike<A, S>(
    session: &ChatSession<A, S>,
    index: usize,
    reason: &str,
) -> Result<(), ChatError>
where
    A: grantbot_widget::ConversationApi + 'static,
    S: grantbot_widget::KeyValueStore + 'static,
{
    session.dislike(index).await?;
    session.edit_feedback(reason).await?;
    let result = session.submit_feedback().await;
    if result.is_err() {
        session.cancel_feedback().await;
    }
    result
}

fn report_failure(result: Result<(), ChatError>) {
    if let Err(e) = result {
        if !e.is_silent() {
            tracing::warn!(error = %e, "Chat operation failed");
        }
    }
}

/// Print bot rows as they appear, plus typing and notice changes.
async fn render(mut updates: watch::Receiver<ChatSnapshot>) {
    let mut printed: HashSet<MessageId> = HashSet::new();
    let mut conversation: Option<String> = None;
    let mut typing = false;
    let mut notice = None;

    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();

        if snapshot.conversation_id != conversation {
            conversation = snapshot.conversation_id.clone();
            printed.clear();
        }
        for (index, message) in snapshot.messages.iter().enumerate() {
            if message.sender != Sender::Bot || !printed.insert(message.id.clone()) {
                continue;
            }
            println!("[{index}] {} GrantBot: {}", message.time, message.text);
            if let Some(url) = &message.url {
                println!("      {url}");
            }
        }
        if snapshot.typing && !typing {
            println!("GrantBot is typing...");
        }
        typing = snapshot.typing;

        if snapshot.notice != notice {
            if let Some(n) = &snapshot.notice {
                let tag = match n.kind {
                    NoticeKind::Success => "ok",
                    NoticeKind::Error => "error",
                };
                println!("[{tag}] {}", n.text);
            }
            notice = snapshot.notice.clone();
        }
        if let Some(banner) = &snapshot.banner {
            println!("{banner}");
        }
    }
}

// ============ Report ============

async fn report(config: Config, report_id: String, email: Option<String>) -> anyhow::Result<()> {
    let client = ReportClient::new(&config.report_url, config.http_timeout)?;
    match client.fetch_report(Some(&report_id), email.as_deref()).await {
        ReportOutcome::Found(report) => print_report(&report),
        ReportOutcome::NotFound => println!("No report found."),
    }
    Ok(())
}

fn print_report(report: &Report) {
    if let Some(email) = &report.customer_email {
        println!("Prepared for: {email}");
    }
    if let Some(created_at) = &report.created_at {
        println!("Created: {}", format_report_date(created_at));
    }
    println!();
    println!(
        "{:<40} {:<18} {:<18} {:<20}",
        "Opportunity", "Amount (low)", "Amount (high)", "Deadline"
    );
    for grant in &report.report {
        let amount = |v: &Option<serde_json::Value>| v.as_ref().map(format_amount).unwrap_or_default();
        println!(
            "{:<40} {:<18} {:<18} {:<20}",
            grant.opportunity_title.as_deref().unwrap_or("-"),
            amount(&grant.amount_low),
            amount(&grant.amount_high),
            grant
                .deadline
                .as_deref()
                .map(format_report_date)
                .unwrap_or_default(),
        );
        if !grant.interests.is_empty() {
            println!("    Interests: {}", grant.interests.join(", "));
        }
        if !grant.eligibilities.is_empty() {
            println!("    Eligibility: {}", grant.eligibilities.join(", "));
        }
        if let Some(url) = &grant.url {
            println!("    {url}");
        }
    }
}
