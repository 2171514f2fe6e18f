//! Command-line configuration.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

/// Command-line arguments for the relay server.
#[derive(Debug, Clone, Parser)]
#[command(name = "duel-relay")]
#[command(about = "Pairs two game clients under a session token and relays their moves")]
pub struct Args {
    /// Address to accept WebSocket connections on.
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Seconds a client may go without sending anything before it is dropped.
    /// Payloads relayed to it do not count as activity.
    #[arg(long, default_value = "300")]
    pub idle_timeout: u64,

    /// Seconds allowed for writing one message to a peer.
    #[arg(long, default_value = "5")]
    pub write_timeout: u64,

    /// Largest accepted message in bytes.
    #[arg(long, default_value = "65536")]
    pub max_message_size: usize,

    /// Interval in seconds for logging relay statistics. 0 disables it.
    #[arg(long, default_value = "60")]
    pub stats_interval: u64,
}

impl Args {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout),
            write_timeout: Duration::from_secs(self.write_timeout),
            max_message_size: self.max_message_size,
        }
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval > 0).then_some(Duration::from_secs(self.stats_interval))
    }
}

/// Per-connection settings used by the relay handler and transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(5),
            max_message_size: 64 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_relay_config() {
        let args = Args::try_parse_from(["duel-relay"]).unwrap();
        assert_eq!(args.listen, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(args.relay_config(), RelayConfig::default());
        assert_eq!(args.stats_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_overrides() {
        let args = Args::try_parse_from([
            "duel-relay",
            "--listen",
            "127.0.0.1:9000",
            "--idle-timeout",
            "30",
            "--write-timeout",
            "2",
            "--stats-interval",
            "0",
        ])
        .unwrap();
        let config = args.relay_config();
        assert_eq!(args.listen.port(), 9000);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.write_timeout, Duration::from_secs(2));
        assert_eq!(args.stats_interval(), None);
    }
}
