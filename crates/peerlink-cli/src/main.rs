//! PeerLink CLI
//!
//! Identity management and a loopback demonstration of the negotiation and
//! secure channel stack.

mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use peerlink_core::config::NodeConfig;
use peerlink_core::programs::{
    ChatLog, ChatProgram, HeartbeatProgram, ProgramRegistry, send_message,
};
use peerlink_core::{
    ConnectionManager, ContactDescriptor, Identity, LinkConditions, MemoryContactStore,
    MemoryNetwork,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

use config::Config;
use progress::{format_elapsed, short_id};

/// Environment variable read before prompting for a passphrase
const PASSPHRASE_ENV: &str = "PEERLINK_PASSPHRASE";

/// Upper bound on waiting for loopback delivery
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// PeerLink - authenticated, encrypted peer-to-peer channels
#[derive(Parser)]
#[command(name = "peerlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity and seal it with a passphrase
    Keygen {
        /// Display name shared with contacts
        #[arg(short, long)]
        username: String,

        /// Output file (defaults to the configured identity file)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing identity file
        #[arg(long)]
        force: bool,
    },

    /// Show the address and contact descriptor of a sealed identity
    Show {
        /// Identity file (defaults to the configured identity file)
        #[arg(short, long)]
        identity: Option<PathBuf>,

        /// Print the full address id
        #[arg(long)]
        full: bool,
    },

    /// Inspect a contact descriptor shared by a peer
    Inspect {
        /// Base64 descriptor
        #[arg(required = true)]
        descriptor: String,
    },

    /// Negotiate two in-process peers over a simulated link and exchange chat messages
    Loopback {
        /// One-way link latency in milliseconds
        #[arg(long, default_value_t = 50)]
        latency_ms: u64,

        /// Probability that a frame is delivered twice
        #[arg(long, default_value_t = 0.01)]
        duplicate_rate: f64,

        /// Number of chat messages to send
        #[arg(short, long, default_value_t = 20)]
        messages: usize,
    },

    /// Manage the configuration file
    Config {
        /// Write a default configuration file
        #[arg(long)]
        init: bool,

        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = if cli.config.is_some() {
        Config::load(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?
    } else {
        Config::load_or_default()?
    };

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    config.validate()?;

    match cli.command {
        Commands::Keygen {
            username,
            output,
            force,
        } => {
            generate_identity(username, output, force, &config).await?;
        }
        Commands::Show { identity, full } => {
            show_identity(identity, full, &config)?;
        }
        Commands::Inspect { descriptor } => {
            inspect_descriptor(&descriptor)?;
        }
        Commands::Loopback {
            latency_ms,
            duplicate_rate,
            messages,
        } => {
            run_loopback(latency_ms, duplicate_rate, messages, &config).await?;
        }
        Commands::Config { init, show } => {
            manage_config(init, show, &config, &config_path)?;
        }
    }

    Ok(())
}

/// Read a passphrase from the environment or the terminal.
fn read_passphrase(confirm: bool) -> anyhow::Result<Zeroizing<String>> {
    if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
        return Ok(Zeroizing::new(passphrase));
    }

    let passphrase = Zeroizing::new(rpassword::prompt_password("Passphrase: ")?);
    if passphrase.is_empty() {
        anyhow::bail!("Passphrase must not be empty");
    }
    if confirm {
        let again = Zeroizing::new(rpassword::prompt_password("Confirm passphrase: ")?);
        if *again != *passphrase {
            anyhow::bail!("Passphrases do not match");
        }
    }
    Ok(passphrase)
}

/// Generate and seal a new identity
async fn generate_identity(
    username: String,
    output: Option<PathBuf>,
    force: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let path = output.unwrap_or_else(|| config.identity.identity_file.clone());
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    let passphrase = read_passphrase(true)?;

    let spinner = progress::spinner("Generating RSA identity and P-256 messaging keys");
    let identity = tokio::task::spawn_blocking(move || Identity::generate(username)).await??;
    spinner.finish_with_message("Keys generated");

    let params = config.key_params();
    let save_path = path.clone();
    let identity = tokio::task::spawn_blocking(move || {
        identity
            .save(&save_path, passphrase.as_bytes(), params)
            .map(|()| identity)
    })
    .await??;

    println!();
    println!("{} {}", style("Username:").bold(), identity.username());
    println!(
        "{} {}",
        style("Address:").bold(),
        short_id(identity.address().id())
    );
    println!("{} {}", style("Saved to:").bold(), path.display());
    println!();
    println!("Share this descriptor with contacts:");
    println!("{}", identity.export_descriptor()?);
    println!(
        "\n{}",
        style("Keep the identity file and passphrase safe. They cannot be recovered.").yellow()
    );

    Ok(())
}

/// Print the address and descriptor of a sealed identity
fn show_identity(path: Option<PathBuf>, full: bool, config: &Config) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(|| config.identity.identity_file.clone());
    let passphrase = read_passphrase(false)?;
    let identity = Identity::load(&path, passphrase.as_bytes())
        .with_context(|| format!("opening {}", path.display()))?;

    let id = identity.address().id();
    println!("{} {}", style("Username:").bold(), identity.username());
    if full {
        println!("{} {}", style("Address:").bold(), id);
    } else {
        println!("{} {}", style("Address:").bold(), short_id(id));
    }
    println!("{} {}", style("Descriptor:").bold(), identity.export_descriptor()?);

    Ok(())
}

/// Parse a contact descriptor and print the address it derives
fn inspect_descriptor(descriptor: &str) -> anyhow::Result<()> {
    let contact = ContactDescriptor::parse(descriptor.trim())?;
    println!("{} {}", style("Username:").bold(), contact.username);
    println!("{} {}", style("Address:").bold(), contact.address.id());
    Ok(())
}

/// One loopback participant with its chat log
fn loopback_node(
    network: &MemoryNetwork,
    identity: Identity,
    config: &NodeConfig,
) -> anyhow::Result<(ConnectionManager, ChatLog)> {
    let log = ChatLog::new();
    let heartbeat = config.heartbeat.clone();
    let chat_log = log.clone();

    let mut programs = ProgramRegistry::new();
    programs
        .register_all(move |_| Box::new(HeartbeatProgram::new(heartbeat.clone())))
        .register_all(move |_| Box::new(ChatProgram::new(chat_log.clone())));

    let signaling = Arc::new(network.endpoint(identity.address().id()));
    let manager = ConnectionManager::new(
        Arc::new(identity),
        signaling,
        Arc::new(MemoryContactStore::new()),
        programs,
        config.clone(),
    )?;
    Ok((manager, log))
}

/// Negotiate two in-process peers and stream chat messages between them
async fn run_loopback(
    latency_ms: u64,
    duplicate_rate: f64,
    messages: usize,
    config: &Config,
) -> anyhow::Result<()> {
    if !(0.0..1.0).contains(&duplicate_rate) {
        anyhow::bail!("duplicate rate must be in [0, 1): {duplicate_rate}");
    }

    let spinner = progress::spinner("Generating identities for alice and bob");
    let (alice, bob) = tokio::task::spawn_blocking(|| -> peerlink_core::Result<_> {
        Ok((Identity::generate("alice")?, Identity::generate("bob")?))
    })
    .await??;
    spinner.finish_with_message("Identities ready");

    let network = MemoryNetwork::with_conditions(LinkConditions::new(
        Duration::from_millis(latency_ms),
        duplicate_rate,
    ));
    let node_config = config.node_config();
    let (alice_node, alice_log) = loopback_node(&network, alice, &node_config)?;
    let (bob_node, bob_log) = loopback_node(&network, bob, &node_config)?;

    println!("Link: {latency_ms} ms latency, {duplicate_rate} duplicate rate");

    let accept = {
        let bob_node = bob_node.clone();
        tokio::spawn(async move { bob_node.accept_next().await })
    };
    let started = Instant::now();
    let outbound = alice_node.connect(bob_node.local_id()).await?;
    let inbound = accept.await??;

    println!(
        "{} in {}",
        style("Negotiated").green().bold(),
        format_elapsed(started.elapsed())
    );
    println!(
        "  alice sees {} ({})",
        outbound.username,
        short_id(outbound.id())
    );
    println!("  bob sees {} ({})", inbound.username, short_id(inbound.id()));
    if outbound.session_fingerprint != inbound.session_fingerprint {
        anyhow::bail!("session key fingerprints differ");
    }
    println!(
        "  session fingerprint {}",
        hex::encode(&outbound.session_fingerprint[..8])
    );

    let bar = progress::message_bar(messages as u64);
    let started = Instant::now();
    for n in 1..=messages {
        send_message(&outbound.sender, &alice_log, &format!("message {n}")).await?;
    }
    let mut delivered = 0;
    while delivered < messages {
        tokio::time::timeout(DELIVERY_TIMEOUT, bob_log.wait_for_len(delivered + 1))
            .await
            .context("timed out waiting for delivery")?;
        delivered = bob_log.len();
        bar.set_position(delivered as u64);
    }
    bar.finish();

    let in_order = bob_log
        .messages()
        .iter()
        .enumerate()
        .all(|(i, message)| message.text == format!("message {}", i + 1));
    if !in_order {
        anyhow::bail!("messages were delivered out of order");
    }
    println!(
        "{} {} messages in order in {}",
        style("Delivered").green().bold(),
        delivered,
        format_elapsed(started.elapsed())
    );

    alice_node.disconnect(outbound.id()).await;
    if tokio::time::timeout(node_config.heartbeat.timeout, inbound.closed())
        .await
        .is_err()
    {
        tracing::warn!("bob did not observe the disconnect");
    }
    outbound.closed().await;

    Ok(())
}

/// Write or print the configuration
fn manage_config(init: bool, show: bool, config: &Config, path: &Path) -> anyhow::Result<()> {
    if init {
        Config::default().save(path)?;
        println!("Wrote default configuration to {}", path.display());
    }
    if show || !init {
        println!("# {}", path.display());
        print!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
