//! Command line interface for the chat client. Supports initialization,
//! key generation, and an interactive chat session with encrypted direct
//! messages and zap payments over a single relay.

mod cipher;
mod config;
mod error;
mod event;
mod identity;
mod relay;
mod session;
mod zap;

use std::{fs, path::Path};

use clap::{Parser, Subcommand};
use config::Settings;
use identity::Identity;
use session::Session;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::warn;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "zapchat",
    author,
    version,
    about = "Encrypted Nostr direct messages with zaps",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Write a default `.env` configuration file.
    Init,
    /// Generate a fresh identity and print its keys.
    Keygen,
    /// Log in and chat interactively.
    Chat {
        /// Secret key in nsec form. Falls back to `NSEC`, then prompts.
        #[arg(long)]
        nsec: Option<String>,
    },
}

/// Parsed chat input line.
#[derive(Debug, PartialEq)]
enum Command {
    /// Select the counterparty to talk to.
    Peer(String),
    /// Zap the current peer this many sats.
    Zap(u64),
    /// End the session.
    Quit,
    /// Anything else is a message to the current peer.
    Message(String),
}

/// Parse one line of chat input. Slash commands are recognized by prefix;
/// malformed ones come back as `Err` with a usage hint.
fn parse_line(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("/peer") {
        let pk = rest.trim();
        if pk.is_empty() {
            return Err("usage: /peer <hex pubkey>".into());
        }
        return Ok(Command::Peer(pk.to_string()));
    }
    if let Some(rest) = line.strip_prefix("/zap") {
        return rest
            .trim()
            .parse()
            .map(Command::Zap)
            .map_err(|_| "usage: /zap <sats>".into());
    }
    if line == "/quit" {
        return Ok(Command::Quit);
    }
    Ok(Command::Message(line.to_string()))
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Init => {
            ensure_env_file(&cli.env)?;
        }
        Commands::Keygen => {
            let (id, nsec) = Identity::generate()?;
            println!("secret key: {nsec}");
            println!("public key: {}", id.public_key());
        }
        Commands::Chat { nsec } => {
            ensure_env_file(&cli.env)?;
            let cfg = Settings::from_env(&cli.env)?;
            let mut stdin = BufReader::new(tokio::io::stdin());
            let nsec = match nsec.or_else(|| std::env::var("NSEC").ok().filter(|s| !s.is_empty()))
            {
                Some(n) => n,
                None => prompt_nsec(&mut stdin).await?,
            };
            let session = Session::login(cfg, nsec.trim()).await?;
            println!("logged in as {}", session.public_key());
            println!("/peer <hex pubkey> to pick a peer, /zap <sats>, /quit");
            chat_loop(session, stdin).await?;
        }
    }
    Ok(())
}

/// Read the secret key from the input stream.
async fn prompt_nsec<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<String> {
    println!("secret key (nsec):");
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(line)
}

/// Interleave user input with incoming display lines until `/quit` or EOF.
/// A failed send or zap reports and keeps the session alive.
async fn chat_loop<R: AsyncBufRead + Unpin>(
    mut session: Session,
    reader: R,
) -> anyhow::Result<()> {
    let mut lines = reader.lines();
    let mut peer: Option<String> = None;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Ok(Command::Quit) => break,
                    Ok(Command::Peer(pk)) => {
                        println!("peer set to {pk}");
                        peer = Some(pk);
                    }
                    Ok(Command::Zap(sats)) => {
                        let Some(pk) = &peer else {
                            println!("no peer selected; /peer <hex pubkey> first");
                            continue;
                        };
                        if let Err(e) = session.send_zap(pk, sats).await {
                            warn!("zap failed: {e}");
                            println!("zap failed: {e}");
                        }
                    }
                    Ok(Command::Message(text)) => {
                        let Some(pk) = &peer else {
                            println!("no peer selected; /peer <hex pubkey> first");
                            continue;
                        };
                        if let Err(e) = session.send_message(pk, &text).await {
                            warn!("send failed: {e}");
                            println!("send failed: {e}");
                        }
                    }
                    Err(usage) => println!("{usage}"),
                }
            }
            line = session.next_line() => {
                match line {
                    Some(l) => println!("{l}"),
                    None => break,
                }
            }
        }
    }
    session.logout().await;
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut content = String::new();
    content.push_str("RELAY_URL=wss://relay.damus.io\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("ZAP_RELAYS=\n");
    content.push_str("ZAP_COMMENT=Zap!\n");
    content.push_str("QUERY_TIMEOUT_SECS=10\n");
    content.push_str("HTTP_TIMEOUT_SECS=10\n");
    content.push_str("CONNECT_TIMEOUT_SECS=10\n");
    fs::write(env_path, content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    run(cli).await
}
