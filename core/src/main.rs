/// AgeBridge terminal client - Main entry point
use agebridge_core::{AnnotationState, ChatSession, Config, Message, SessionEvent, StoreEvent};
use colored::*;
use std::env;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let session = ChatSession::start(config)
        .await
        .map_err(|e| anyhow::anyhow!("Session error: {}", e))?;
    info!("Starting AgeBridge client");
    info!("   Local ID: {}", session.identity().local_id());
    info!("   Peer ID: {}", session.identity().peer_id());

    print_help();

    let printer = tokio::spawn(print_events(session.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !handle_command(&session, line).await {
            break;
        }
    }

    session.shutdown();
    printer.abort();
    Ok(())
}

/// Returns false when the user asked to quit
async fn handle_command(session: &ChatSession, line: &str) -> bool {
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "/quit" | "/exit" => return false,
        "/help" => print_help(),
        "/list" => {
            let messages = session.messages().await;
            if messages.is_empty() {
                println!("{}", "No messages yet".yellow());
            }
            for message in &messages {
                print_message(message);
            }
        }
        "/image" => match session.send_image_path(Path::new(rest)).await {
            Ok(message) => println!("{} Image sent! ID: {}", "✓".green().bold(), message.id.cyan()),
            Err(e) => report_error(&e.to_string()),
        },
        "/emoji" => match session.send_emoji(rest).await {
            Ok(message) => println!("{} Emoji sent! ID: {}", "✓".green().bold(), message.id.cyan()),
            Err(e) => report_error(&e.to_string()),
        },
        "/suggest" => match session.suggest_emojis(rest).await {
            Ok(emojis) if emojis.is_empty() => println!("{}", "No emoji suggestions".yellow()),
            Ok(emojis) => {
                for url in emojis {
                    println!("  {}", url.cyan());
                }
            }
            Err(e) => report_error(&e.to_string()),
        },
        "/analyze" => match session.request_annotation(rest).await {
            Ok(true) => println!("{} Analysis requested for {}", "…".yellow(), rest.cyan()),
            Ok(false) => println!("{}", "Analysis already in progress".yellow()),
            Err(e) => report_error(&e.to_string()),
        },
        _ if command.starts_with('/') => report_error(&format!("Unknown command: {}", command)),
        _ => {
            if let Err(e) = session.send_text(line).await {
                report_error(&e.to_string());
            }
        }
    }
    true
}

async fn print_events(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => print_event(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Display lagged {} events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Connected { .. } => println!("{}", "● Connected".green().bold()),
        SessionEvent::Disconnected { .. } => println!("{}", "○ Disconnected, reconnecting".yellow()),
        SessionEvent::ConnectionError { message } => println!("{} {}", "○".yellow(), message.dimmed()),
        SessionEvent::HistoryLoaded { count, .. } => {
            println!("{}", format!("Loaded {} messages", count).dimmed())
        }
        SessionEvent::HistoryFailed { error, .. } => report_error(&format!("History unavailable: {}", error)),
        SessionEvent::Store { event } => match event {
            StoreEvent::Appended { message } => print_message(message),
            StoreEvent::Updated { message } => match message.annotation.state {
                AnnotationState::Result | AnnotationState::Error => print_annotation(message),
                _ => {}
            },
            StoreEvent::Replaced { .. } => {}
        },
    }
}

fn print_message(message: &Message) {
    println!(
        "{} {} {}  {}",
        message.received_at.format("%H:%M").to_string().dimmed(),
        message.from.bright_white().bold(),
        message.preview(),
        message.id.dimmed()
    );
}

fn print_annotation(message: &Message) {
    match message.annotation.state {
        AnnotationState::Result => println!(
            "  {} {}",
            "✦".bright_cyan(),
            message.annotation.content.as_deref().unwrap_or_default().bright_cyan()
        ),
        AnnotationState::Error => println!(
            "  {} {}",
            "✗".red().bold(),
            message.annotation.error_message.as_deref().unwrap_or_default().red()
        ),
        _ => {}
    }
}

fn report_error(error: &str) {
    eprintln!("{} Error: {}", "✗".red().bold(), error.red());
}

fn print_help() {
    println!("{}", "⚡ AgeBridge".bright_cyan().bold());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}        Send a text message", "<text>".cyan());
    println!("  {}  Upload and send an image", "/image <path>".cyan());
    println!("  {}    Send an emoji image", "/emoji <url>".cyan());
    println!("  {} Suggest emojis for a draft", "/suggest <text>".cyan());
    println!("  {}  Analyze a message", "/analyze <id>".cyan());
    println!("  {}           Show the conversation", "/list".cyan());
    println!("  {}           Exit", "/quit".cyan());
    println!();
}
