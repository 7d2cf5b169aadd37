use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use kromi_common::{Error, IceServer, Result, RtcConfig};

const MIN_NEGOTIATION_TIMEOUT_SECS: u64 = 5;

#[derive(Parser, Debug, Clone)]
#[command(name = "kromi-signal")]
#[command(about = "Kromi live-stream signaling relay - presence, stream commands and WebRTC negotiation")]
pub struct Args {
    /// HTTP/WebSocket listen address
    #[arg(long, env = "KROMI_SIGNAL_BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Allow binding to a non-loopback address
    #[arg(long, env = "KROMI_ALLOW_PUBLIC_BIND", default_value_t = false)]
    pub allow_public_bind: bool,

    /// Seconds a pair may spend negotiating before it is force-closed
    #[arg(long, env = "KROMI_NEGOTIATION_TIMEOUT_SECS", default_value_t = 60)]
    pub negotiation_timeout_secs: u64,

    /// Interval of the stalled-negotiation sweep
    #[arg(long, env = "KROMI_SWEEP_INTERVAL_SECS", default_value_t = 10)]
    pub sweep_interval_secs: u64,

    /// Maximum concurrent signaling connections
    #[arg(long, env = "KROMI_WS_MAX_CONNECTIONS", default_value_t = 4096)]
    pub max_connections: usize,

    /// Maximum concurrent signaling connections per client IP
    #[arg(long, env = "KROMI_WS_MAX_PER_IP", default_value_t = 16)]
    pub max_per_ip: usize,

    /// Messages a single connection may send per minute
    #[arg(long, env = "KROMI_WS_MAX_MESSAGES_PER_MINUTE", default_value_t = 600)]
    pub max_messages_per_minute: u32,

    /// TURN fallback URL handed to clients (replaces the built-in one)
    #[arg(long, env = "KROMI_TURN_URL")]
    pub turn_url: Option<String>,

    #[arg(long, env = "KROMI_TURN_USERNAME")]
    pub turn_username: Option<String>,

    #[arg(long, env = "KROMI_TURN_CREDENTIAL")]
    pub turn_credential: Option<String>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "kromi_signal=info,tower_http=info")]
    pub log_level: String,
}

/// Per-connection limits enforced by the WebSocket handler.
#[derive(Debug, Clone)]
pub struct SignalLimits {
    pub max_connections: usize,
    pub max_per_ip: usize,
    pub max_messages_per_minute: u32,
    pub register_timeout: Duration,
}

impl Default for SignalLimits {
    fn default() -> Self {
        Self {
            max_connections: 4096,
            max_per_ip: 16,
            max_messages_per_minute: 600,
            register_timeout: Duration::from_secs(10),
        }
    }
}

impl Args {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs.max(MIN_NEGOTIATION_TIMEOUT_SECS))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn signal_limits(&self) -> SignalLimits {
        SignalLimits {
            max_connections: self.max_connections,
            max_per_ip: self.max_per_ip,
            max_messages_per_minute: self.max_messages_per_minute,
            ..SignalLimits::default()
        }
    }

    /// Connectivity configuration served at `/webrtc/config`.
    pub fn rtc_config(&self) -> Result<RtcConfig> {
        let config = RtcConfig::default();
        let Some(url) = self.turn_url.as_deref() else {
            return Ok(config);
        };
        match (self.turn_username.as_deref(), self.turn_credential.as_deref()) {
            (Some(username), Some(credential)) => {
                Ok(config.with_relay(IceServer::turn(url, username, credential)))
            }
            _ => Err(Error::config(
                "KROMI_TURN_URL requires KROMI_TURN_USERNAME and KROMI_TURN_CREDENTIAL",
            )),
        }
    }

    pub fn check_public_bind_allowed(&self) -> anyhow::Result<()> {
        if self.listen.ip().is_loopback() || self.allow_public_bind {
            return Ok(());
        }
        Err(anyhow::anyhow!(
            "refusing non-loopback bind without KROMI_ALLOW_PUBLIC_BIND=1"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let args = Args::try_parse_from(["kromi-signal"]).expect("parse");
        assert!(args.listen.ip().is_loopback());
        assert!(args.check_public_bind_allowed().is_ok());
        assert_eq!(args.signal_limits().register_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_public_bind_requires_opt_in() {
        let args = Args::try_parse_from(["kromi-signal", "--listen", "0.0.0.0:3000"]).expect("parse");
        assert!(args.check_public_bind_allowed().is_err());

        let args = Args::try_parse_from([
            "kromi-signal",
            "--listen",
            "0.0.0.0:3000",
            "--allow-public-bind",
        ])
        .expect("parse");
        assert!(args.check_public_bind_allowed().is_ok());
    }

    #[test]
    fn test_negotiation_timeout_has_floor() {
        let args =
            Args::try_parse_from(["kromi-signal", "--negotiation-timeout-secs", "1"]).expect("parse");
        assert_eq!(args.negotiation_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_turn_override_requires_credentials() {
        let args = Args::try_parse_from([
            "kromi-signal",
            "--turn-url",
            "turn:turn.kromi.online:3478",
        ])
        .expect("parse");
        assert!(args.rtc_config().is_err());

        let args = Args::try_parse_from([
            "kromi-signal",
            "--turn-url",
            "turn:turn.kromi.online:3478",
            "--turn-username",
            "kromi",
            "--turn-credential",
            "secret",
        ])
        .expect("parse");
        let config = args.rtc_config().expect("config");
        assert!(config
            .ice_servers
            .iter()
            .any(|s| s.urls[0] == "turn:turn.kromi.online:3478"));
        assert!(config.has_relay_fallback());
    }
}
