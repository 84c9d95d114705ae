use std::{net::SocketAddr, path::PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::config::{RelayConfig, SlowConsumerPolicy};

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting WebSocket connections.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
    /// Open many concurrent clients against a relay and report throughput.
    Load(LoadArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// JSON file with relay settings; flags given here override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Maximum number of simultaneously connected clients.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Frames that may wait for one client before it counts as slow.
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Do not echo a message back to the client that sent it.
    #[arg(long)]
    pub exclude_originator: bool,

    /// What to do with a client whose queue is full.
    #[arg(long, value_enum)]
    pub slow_consumer: Option<SlowConsumerPolicy>,

    /// Text put in front of every relayed text message.
    #[arg(long)]
    pub prefix: Option<String>,

    /// Log relay stats every N seconds (0 disables).
    #[arg(long)]
    pub stats_interval: Option<u64>,

    /// Seconds a new connection gets to finish the WebSocket upgrade.
    #[arg(long)]
    pub handshake_timeout: Option<u64>,
}

impl ServeArgs {
    /// Defaults, then the config file, then flags.
    pub fn into_config(self) -> Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::from_file(path)?,
            None => RelayConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
        if let Some(capacity) = self.queue_capacity {
            config.outbound_queue_capacity = capacity;
        }
        if self.exclude_originator {
            config.exclude_originator = true;
        }
        if let Some(policy) = self.slow_consumer {
            config.slow_consumer = policy;
        }
        if let Some(prefix) = self.prefix {
            config.broadcast_prefix = prefix;
        }
        if let Some(secs) = self.stats_interval {
            config.stats_interval_secs = secs;
        }
        if let Some(secs) = self.handshake_timeout {
            config.handshake_timeout_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// WebSocket URL of the relay.
    #[arg(long, default_value = DEFAULT_SERVER_URL)]
    pub server: String,
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// WebSocket URL of the relay.
    #[arg(long, default_value = DEFAULT_SERVER_URL)]
    pub server: String,

    /// Number of concurrent clients.
    #[arg(long, default_value_t = 50)]
    pub clients: usize,

    /// Messages each client sends.
    #[arg(long, default_value_t = 10)]
    pub messages: usize,

    /// Pause between two messages of one client, in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub delay_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "broadcast-relay",
            "serve",
            "--listen",
            "127.0.0.1:0",
            "--max-connections",
            "3",
            "--exclude-originator",
            "--slow-consumer",
            "disconnect",
            "--handshake-timeout",
            "3",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };

        let config = args.into_config().expect("valid config");
        assert_eq!(config.listen.port(), 0);
        assert_eq!(config.max_connections, 3);
        assert!(config.exclude_originator);
        assert_eq!(config.slow_consumer, SlowConsumerPolicy::Disconnect);
        assert_eq!(config.broadcast_prefix, "Server broadcast: ");
        assert_eq!(config.handshake_timeout_secs, 3);
    }

    #[test]
    fn zero_max_connections_is_rejected() {
        let args = ServeArgs {
            max_connections: Some(0),
            ..ServeArgs::default()
        };
        assert!(args.into_config().is_err());
    }

    #[test]
    fn load_defaults_mirror_the_classic_test() {
        let cli = Cli::parse_from(["broadcast-relay", "load"]);
        let Command::Load(args) = cli.command else {
            panic!("expected load command");
        };
        assert_eq!(args.clients, 50);
        assert_eq!(args.messages, 10);
        assert_eq!(args.server, DEFAULT_SERVER_URL);
    }
}
