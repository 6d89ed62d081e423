//! Presencecast CLI
//!
//! Thin wrapper around presencecast-core for running a node by hand.
//!
//! ## Usage
//!
//! ```bash
//! # Join the presence channel on every interface and print discovery events
//! presencecast run --node-id 7
//!
//! # Same, with a config file and JSONL logs
//! presencecast --config node.json --log-dir ./logs run
//!
//! # Which port a channel name maps to
//! presencecast port room@conference.proxy
//!
//! # Print the default configuration
//! presencecast config
//! ```
//!
//! While `run` is active, commands are read from stdin:
//!
//! ```text
//! advertise user1@proxy [status...]
//! remove user1@proxy
//! room room@conference.proxy
//! join user1@proxy room@conference.proxy/nick
//! leave user1@proxy room@conference.proxy/nick
//! say user1@proxy user2@proxy hello there
//! peers
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use presencecast_core::logging::LoggingBuilder;
use presencecast_core::{
    DiscoveryEvent, DiscoveryManager, EventForwarder, Jid, PacketForwarder, ReceivedPacket,
    Stanza, StanzaKind, TransportConfig, TransportService, UdpEngine,
};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Presencecast - presence gossip over multicast
#[derive(Parser)]
#[command(name = "presencecast")]
#[command(version = "0.1.0")]
#[command(about = "Presencecast - presence gossip over multicast")]
#[command(
    long_about = "Joins chat proxies on a multicast network: gossips which clients and rooms each node hosts and carries chat between them."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// JSON configuration file (defaults apply to missing fields)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write JSONL logs under this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the network and print discovery events
    Run {
        /// Override the configured node id
        #[arg(short, long)]
        node_id: Option<u64>,

        /// Interface address to send and receive on (repeatable)
        #[arg(short, long)]
        iface: Vec<String>,

        /// Round-trip estimate reported by the UDP engine, in milliseconds
        #[arg(long, default_value = "1000")]
        grtt_ms: u64,
    },

    /// Print the port a channel name is allocated
    Port {
        /// Channel name, e.g. a room JID
        name: String,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn setup_logging(verbosity: u8) {
    let filter = verbosity_filter(verbosity);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn verbosity_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TransportConfig> {
    match path {
        Some(path) => TransportConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(TransportConfig::default()),
    }
}

fn parse_jid(s: &str) -> Result<Jid> {
    Jid::parse(s).map_err(|e| anyhow::anyhow!("Invalid JID '{}': {}", s, e))
}

// ============================================================================
// Interactive commands
// ============================================================================

/// One line typed while `run` is active
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Advertise { client: Jid, status: Option<String> },
    Remove { client: Jid },
    Room { room: Jid },
    Join { client: Jid, occupant: Jid },
    Leave { client: Jid, occupant: Jid },
    Say { from: Jid, to: Jid, text: String },
    Peers,
    Help,
}

impl Command {
    fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default();
        let mut arg = |what: &str| next_jid(&mut words, verb, what);

        let command = match verb {
            "advertise" => {
                let client = arg("client")?;
                Command::Advertise {
                    client,
                    status: rest(&mut words),
                }
            }
            "remove" => Command::Remove {
                client: arg("client")?,
            },
            "room" => Command::Room { room: arg("room")? },
            "join" => Command::Join {
                client: arg("client")?,
                occupant: arg("room/nick")?,
            },
            "leave" => Command::Leave {
                client: arg("client")?,
                occupant: arg("room/nick")?,
            },
            "say" => {
                let from = arg("sender")?;
                let to = arg("recipient")?;
                let text = rest(&mut words).ok_or_else(|| anyhow::anyhow!("say: missing text"))?;
                Command::Say { from, to, text }
            }
            "peers" => Command::Peers,
            "help" | "?" => Command::Help,
            other => anyhow::bail!("Unknown command '{}'. Type 'help' for a list.", other),
        };
        if let Command::Join { occupant, .. } | Command::Leave { occupant, .. } = &command {
            if occupant.is_bare() {
                anyhow::bail!("Occupant '{}' needs a nickname: room@domain/nick", occupant);
            }
        }
        Ok(command)
    }
}

fn next_jid<'a>(words: &mut impl Iterator<Item = &'a str>, verb: &str, what: &str) -> Result<Jid> {
    let raw = words
        .next()
        .ok_or_else(|| anyhow::anyhow!("{}: missing {}", verb, what))?;
    parse_jid(raw)
}

fn rest<'a>(words: &mut impl Iterator<Item = &'a str>) -> Option<String> {
    let text = words.collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn print_help() {
    println!("Commands:");
    println!("  advertise <client> [status...]   announce a local client");
    println!("  remove <client>                  withdraw a local client");
    println!("  room <room>                      advertise a room and open its channel");
    println!("  join <client> <room/nick>        enter a room");
    println!("  leave <client> <room/nick>       leave a room");
    println!("  say <from> <to> <text...>        chat, or groupchat when <to> is a room");
    println!("  peers                            list known nodes");
}

/// The running node plus what it has announced for its own clients
struct Node {
    service: TransportService,
    local_clients: BTreeMap<Jid, Stanza>,
}

impl Node {
    fn execute(&mut self, command: Command) -> Result<()> {
        let presence = self.service.presence().clone();
        match command {
            Command::Advertise { client, status } => {
                let mut stanza = Stanza::presence().with_from(client.clone());
                stanza.status = status;
                presence.advertise_client(&stanza)?;
                self.local_clients.insert(client.clone(), stanza);
                println!("Advertised {}", client);
            }
            Command::Remove { client } => {
                let stanza = self
                    .local_clients
                    .remove(&client)
                    .unwrap_or_else(|| Stanza::presence().with_from(client.clone()));
                presence.remove_client(&stanza)?;
                println!("Removed {}", client);
            }
            Command::Room { room } => {
                self.service.create_room_transport(&room)?;
                presence.advertise_muc_room(&room)?;
                println!("Advertised room {}", room.bare());
            }
            Command::Join { client, occupant } => {
                self.service.create_room_transport(&occupant.bare())?;
                let mut stanza = Stanza::presence()
                    .with_from(client.clone())
                    .with_to(occupant.clone());
                stanza.add_muc_marker();
                presence.advertise_muc_occupant(&stanza)?;
                println!("{} joined as {}", client, occupant);
            }
            Command::Leave { client, occupant } => {
                let stanza = Stanza::presence()
                    .with_from(client.clone())
                    .with_to(occupant.clone());
                presence.remove_muc_occupant(&stanza)?;
                println!("{} left {}", client, occupant.bare());
            }
            Command::Say { from, to, text } => {
                let message = Stanza::new(StanzaKind::Message)
                    .with_from(from)
                    .with_to(to.clone())
                    .with_body(text);
                match self.service.room_transport(&to) {
                    Some(room) => room.send_packet(&message.with_type("groupchat"))?,
                    None => self
                        .service
                        .create_one_to_one_transport()?
                        .send_packet(&message.with_type("chat"))?,
                }
            }
            Command::Peers => {
                let peers = presence.peers();
                if peers.is_empty() {
                    println!("No peers yet.");
                }
                for peer in peers {
                    let state = if peer.connected { "connected" } else { "disconnected" };
                    println!(
                        "  node {} (seq {}, {}): {} client(s), {} room(s)",
                        peer.node_id,
                        peer.seq,
                        state,
                        peer.identity_hashes.len(),
                        peer.known_rooms.len()
                    );
                }
            }
            Command::Help => print_help(),
        }
        Ok(())
    }

    /// Print an event and answer probes for our own clients.
    fn on_event(&self, event: &DiscoveryEvent) {
        println!("[event] {}", event);
        let DiscoveryEvent::ClientUpdated(probe) = event else {
            return;
        };
        if !probe.is_probe() {
            return;
        }
        let Some(stanza) = probe.to.as_ref().and_then(|to| self.local_clients.get(to)) else {
            return;
        };
        if let Err(e) = self.service.presence().update_client_status(stanza) {
            eprintln!("Failed to answer probe: {}", e);
        }
    }
}

fn print_packet(received: &ReceivedPacket) {
    let from = received
        .from
        .as_ref()
        .map(Jid::to_string)
        .unwrap_or_else(|| "?".to_string());
    let body = received.packet.body.as_deref().unwrap_or("");
    if received.packet.is_groupchat() {
        let room = received
            .packet
            .to
            .as_ref()
            .map(Jid::to_string)
            .unwrap_or_default();
        println!("[{}] {}: {}", room, from, body);
    } else {
        println!("{}: {}", from, body);
    }
}

async fn run(mut config: TransportConfig, grtt: Duration) -> Result<()> {
    config.validate()?;
    let engine = Arc::new(UdpEngine::new(grtt));
    let events = EventForwarder::new();
    let packets = PacketForwarder::new();
    let mut event_rx = events.subscribe();
    let mut packet_rx = packets.subscribe();

    let service = TransportService::new(
        config.clone(),
        engine,
        Arc::new(events),
        Arc::new(packets),
    )
    .context("Failed to open transport")?;
    let mut event_loop = service.start()?;
    service.create_one_to_one_transport()?;
    info!(node_id = %service.local_node(), ports = %service.ports(), "Node running");

    println!("Presencecast node {}", service.local_node());
    println!();
    println!("Network:");
    println!("  Group: {}", config.multicast_group);
    println!("  Ports: {}", service.ports());
    println!("  Send: {}", config.send_interfaces.join(", "));
    println!("  Receive: {}", config.recv_interfaces.join(", "));
    println!();
    println!("Type 'help' for commands. Press Ctrl+C to stop.");
    println!();

    let mut node = Node {
        service,
        local_clients: BTreeMap::new(),
    };
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdin_open = true;

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Received shutdown signal...");
                break Ok(());
            }
            result = &mut event_loop => {
                break match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(anyhow::Error::new(e).context("Transport stopped")),
                    Err(e) => Err(anyhow::anyhow!("Event loop panicked: {}", e)),
                };
            }
            event = event_rx.recv() => match event {
                Ok(event) => node.on_event(&event),
                Err(RecvError::Lagged(n)) => eprintln!("Missed {} events", n),
                Err(RecvError::Closed) => break Ok(()),
            },
            packet = packet_rx.recv() => match packet {
                Ok(packet) => print_packet(&packet),
                Err(RecvError::Lagged(n)) => eprintln!("Missed {} packets", n),
                Err(RecvError::Closed) => break Ok(()),
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let result = Command::parse(line).and_then(|command| node.execute(command));
                    if let Err(e) = result {
                        eprintln!("{}", e);
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    eprintln!("Read error: {}", e);
                    stdin_open = false;
                }
            },
        }
    };

    println!("Shutting down...");
    for client in node.local_clients.values() {
        if let Err(e) = node.service.presence().remove_client(client) {
            warn!(client = ?client.from, error = %e, "Failed to withdraw client");
        }
    }
    node.service.close();
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            node_id,
            iface,
            grtt_ms,
        } => {
            if let Some(node_id) = node_id {
                config.node_id = node_id;
            }
            if !iface.is_empty() {
                config.send_interfaces = iface.clone();
                config.recv_interfaces = iface;
            }
            match &cli.log_dir {
                Some(dir) => {
                    let path = LoggingBuilder::new(dir, format!("node-{}", config.node_id))
                        .with_filter(verbosity_filter(cli.verbose))
                        .init()?;
                    eprintln!("Logging to {}", path.display());
                }
                None => setup_logging(cli.verbose),
            }
            run(config, Duration::from_millis(grtt_ms)).await?;
        }

        Commands::Port { name } => {
            let ports = config.ports()?;
            println!("{}", ports.port_for(&name));
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
