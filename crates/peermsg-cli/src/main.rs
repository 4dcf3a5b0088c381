//! PeerMessenger CLI
//!
//! Thin wrapper around peermsg-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! peermsg info
//!
//! # Show this node's identity
//! peermsg identity show
//!
//! # List paired friends
//! peermsg friends list
//!
//! # Show the most recent messages
//! peermsg messages list --limit 20
//!
//! # Show or persist the effective configuration
//! peermsg config show
//! peermsg --relay ws://127.0.0.1:8787 config save
//!
//! # Run an interactive node
//! peermsg --name Alice chat
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peermsg_core::logging::JsonlLayer;
use peermsg_core::{
    short_fingerprint, ChannelState, Config, Message, Messenger, PeerError, PeerEvent,
};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::prelude::*;

/// PeerMessenger - serverless encrypted messaging
#[derive(Parser)]
#[command(name = "peermsg")]
#[command(version = "0.1.0")]
#[command(about = "PeerMessenger - serverless encrypted messaging")]
#[command(
    long_about = "Pair with friends by exchanging codes, then chat over direct encrypted links. Messages replicate between every friend that is online."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.peermsg/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Also write JSONL logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Signaling relay URL (overrides config.json)
    #[arg(long, global = true)]
    relay: Option<String>,

    /// Listen address for direct links (overrides config.json)
    #[arg(long, global = true)]
    listen: Option<String>,

    /// Display name announced in invites (overrides config.json)
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Friend management
    Friends {
        #[command(subcommand)]
        action: FriendsAction,
    },

    /// Message history
    Messages {
        #[command(subcommand)]
        action: MessagesAction,
    },

    /// Configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run an interactive node
    Chat,
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Show fingerprint and public key
    Show,
}

#[derive(Subcommand)]
enum FriendsAction {
    /// List paired friends
    List,
}

#[derive(Subcommand)]
enum MessagesAction {
    /// List the most recent messages, oldest first
    List {
        /// How many messages to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as JSON
    Show,
    /// Write the effective configuration to config.json
    Save,
}

fn setup_logging(verbosity: u8, log_dir: Option<&Path>, instance: &str) -> Result<()> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let jsonl = match log_dir {
        Some(dir) => Some(
            JsonlLayer::new(dir, instance)
                .with_context(|| format!("Failed to open log directory {}", dir.display()))?,
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(jsonl)
        .init();
    Ok(())
}

/// Get the default data directory (~/.peermsg/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peermsg")
        .join("data")
}

/// Log file stem derived from the display name
fn log_instance(config: &Config) -> String {
    let stem: String = config
        .display_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect();
    if stem.is_empty() {
        "peermsg".to_string()
    } else {
        stem.to_lowercase()
    }
}

/// Load config.json and apply command-line overrides
fn effective_config(cli: &Cli, data_dir: &Path) -> Result<Config> {
    let mut config = Config::load(data_dir)?;
    if let Some(relay) = &cli.relay {
        config.signaling_url = Some(relay.clone());
    }
    if let Some(listen) = &cli.listen {
        config.listen_addr = listen.clone();
    }
    if let Some(name) = &cli.name {
        config.display_name = name.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Open the node in `data_dir`. The store is locked while a `chat` node runs.
async fn open_node(data_dir: &Path, config: Config) -> Result<Messenger> {
    match Messenger::open(data_dir, config).await {
        Ok(messenger) => Ok(messenger),
        Err(PeerError::InUse(_)) => anyhow::bail!(
            "A peermsg node is already running on {}. Use its chat commands, or /quit it first.",
            data_dir.display()
        ),
        Err(e) => Err(e.into()),
    }
}

/// Open a node that never touches the network
async fn open_local(data_dir: &Path, config: &Config) -> Result<Messenger> {
    let offline = Config {
        signaling_url: None,
        ..config.clone()
    };
    open_node(data_dir, offline).await
}

fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| "?".to_string())
}

/// Display name for a fingerprint
fn name_for(messenger: &Messenger, fingerprint: &str) -> String {
    if fingerprint == messenger.fingerprint() {
        return "you".to_string();
    }
    messenger
        .friends()
        .ok()
        .and_then(|friends| {
            friends
                .into_iter()
                .find(|f| f.fingerprint == fingerprint)
                .map(|f| f.display_name)
        })
        .unwrap_or_else(|| short_fingerprint(fingerprint))
}

fn print_message(messenger: &Messenger, message: &Message) {
    println!(
        "[{}] {}: {}",
        format_time(message.timestamp),
        name_for(messenger, &message.sender_fingerprint),
        message.text
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let config = effective_config(&cli, &data_dir)?;

    setup_logging(cli.verbose, cli.log_dir.as_deref(), &log_instance(&config))?;

    match cli.command {
        Commands::Info => {
            let messenger = open_local(&data_dir, &config).await?;
            let info = messenger.node_info()?;

            println!("PeerMessenger v0.1.0");
            println!();
            println!("Identity:");
            println!("  Fingerprint: {}", info.fingerprint);
            println!("  Name: {}", config.display_name);
            println!();
            println!("Data directory: {}", data_dir.display());
            println!("Friends: {}", info.friends);
            println!("Messages: {}", info.messages);
            match &config.signaling_url {
                Some(url) => println!("Relay: {}", url),
                None => println!("Relay: (none, reconnection disabled)"),
            }
        }

        Commands::Identity { action } => match action {
            IdentityAction::Show => {
                let messenger = open_local(&data_dir, &config).await?;
                let identity = messenger.identity();
                println!("Identity:");
                println!("  Fingerprint: {}", identity.fingerprint());
                println!("  Short: {}", short_fingerprint(identity.fingerprint()));
                println!("  Public key: {}", identity.public_key_b64());
            }
        },

        Commands::Friends { action } => match action {
            FriendsAction::List => {
                let messenger = open_local(&data_dir, &config).await?;
                let friends = messenger.friends()?;
                if friends.is_empty() {
                    println!("No friends yet. Pair with `/invite` in `peermsg chat`.");
                } else {
                    println!("Friends ({}):", friends.len());
                    println!();
                    for friend in friends {
                        println!(
                            "  [{}] {}  {}  last seen {}",
                            friend.initials(),
                            friend.display_name,
                            short_fingerprint(&friend.fingerprint),
                            format_time(friend.last_seen)
                        );
                    }
                }
            }
        },

        Commands::Messages { action } => match action {
            MessagesAction::List { limit } => {
                let messenger = open_local(&data_dir, &config).await?;
                let messages = messenger.messages(limit)?;
                if messages.is_empty() {
                    println!("No messages.");
                } else {
                    for message in &messages {
                        print_message(&messenger, message);
                    }
                }
            }
        },

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Save => {
                config.save(&data_dir)?;
                let path = data_dir.join(peermsg_core::config::CONFIG_FILE_NAME);
                println!("Saved {}", path.display());
            }
        },

        Commands::Chat => run_chat(&data_dir, config).await?,
    }

    Ok(())
}

const CHAT_HELP: &str = "\
Commands:
  /invite            create an invite code for a friend
  /complete <code>   finish an invite with the friend's answer code
  /accept <code>     accept a friend's invite and print the answer code
  /friends           list friends
  /peers             show channel states
  /history [n]       show the last n messages (default 20)
  /help              show this help
  /quit              leave
Any other line is sent as a message.";

async fn run_chat(data_dir: &Path, config: Config) -> Result<()> {
    let messenger = open_node(data_dir, config).await?;
    let mut events = messenger.subscribe();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    println!("PeerMessenger chat");
    println!(
        "  You: {} ({})",
        messenger.config().display_name,
        short_fingerprint(messenger.fingerprint())
    );
    println!("  Friends: {}", messenger.friends()?.len());
    println!();
    println!("Type /help for commands.");
    println!();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&messenger, line.trim()).await {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&messenger, event),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Event display fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!("Shutting down...");
    messenger.shutdown();
    Ok(())
}

/// Run one line of input. Returns `false` to leave.
async fn handle_line(messenger: &Messenger, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let (command, arg) = match line.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };

    let result: Result<()> = async {
        match command {
            "/quit" | "/exit" => return Ok(()),
            "/help" => println!("{}", CHAT_HELP),
            "/invite" => {
                let code = messenger.create_invite().await?;
                println!("Send this invite to your friend:");
                println!();
                println!("{}", code);
                println!();
                println!("Then paste their answer with /complete <code>");
            }
            "/complete" => {
                let friend = messenger.complete_invite(arg).await?;
                println!("Paired with {}. Connecting...", friend.display_name);
            }
            "/accept" => {
                let answer = messenger.accept_invite(arg).await?;
                println!("Send this answer back to your friend:");
                println!();
                println!("{}", answer);
                println!();
            }
            "/friends" => {
                for friend in messenger.friends()? {
                    println!(
                        "  {}  {}",
                        friend.display_name,
                        short_fingerprint(&friend.fingerprint)
                    );
                }
            }
            "/peers" => {
                for peer in messenger.peers() {
                    println!("  {}  {:?}", peer.display_name, peer.state);
                }
            }
            "/history" => {
                let limit = if arg.is_empty() { 20 } else { arg.parse()? };
                for message in messenger.messages(limit)? {
                    print_message(messenger, &message);
                }
            }
            c if c.starts_with('/') => println!("Unknown command {}. Type /help.", c),
            _ => {
                let message = messenger.send_text(line)?;
                let open = messenger.supervisor().open_peers().len();
                if open == 0 {
                    println!("(stored; no friend online, it will sync later)");
                }
                tracing::debug!(id = %message.id, open, "Sent");
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        println!("Error: {}", e);
    }
    !matches!(command, "/quit" | "/exit")
}

fn print_event(messenger: &Messenger, event: PeerEvent) {
    match event {
        PeerEvent::MessageStored {
            message,
            from: Some(_),
        } => print_message(messenger, &message),
        PeerEvent::ChannelOpened { peer } => {
            println!("* {} is online", name_for(messenger, &peer));
        }
        PeerEvent::ChannelClosed { peer } => {
            println!("* {} went offline", name_for(messenger, &peer));
        }
        PeerEvent::StateChanged {
            peer,
            state: ChannelState::Failed,
        } => {
            tracing::info!(%peer, "Connection attempt failed, retrying");
        }
        _ => {}
    }
}
