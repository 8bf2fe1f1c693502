use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use drift::relay::{DEFAULT_DROP_AFTER, DEFAULT_PING_AFTER};
use drift::{DEFAULT_PORT, LivenessPolicy, RelayConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub transport: TransportKind,
    pub relay: RelayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            transport: TransportKind::Udp,
            relay: RelayConfig::default(),
        }
    }
}

impl ServerConfig {
    /// UDP always probes silent sessions. TCP relies on the socket closing
    /// unless a probe interval is given.
    pub fn liveness_for(
        transport: TransportKind,
        ping_after: Option<Duration>,
        drop_after: Option<Duration>,
    ) -> LivenessPolicy {
        match (transport, ping_after, drop_after) {
            (TransportKind::Tcp, None, None) => LivenessPolicy::TransportDisconnect,
            (_, ping, drop) => {
                let ping_after = ping.unwrap_or(DEFAULT_PING_AFTER);
                let drop_after = drop.unwrap_or(DEFAULT_DROP_AFTER).max(ping_after);
                LivenessPolicy::Ping {
                    ping_after,
                    drop_after,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_always_pings() {
        assert_eq!(
            ServerConfig::liveness_for(TransportKind::Udp, None, None),
            LivenessPolicy::default()
        );
    }

    #[test]
    fn test_tcp_defaults_to_transport_disconnect() {
        assert_eq!(
            ServerConfig::liveness_for(TransportKind::Tcp, None, None),
            LivenessPolicy::TransportDisconnect
        );
    }

    #[test]
    fn test_drop_after_never_below_ping_after() {
        let policy = ServerConfig::liveness_for(
            TransportKind::Tcp,
            Some(Duration::from_secs(30)),
            Some(Duration::from_secs(5)),
        );
        assert_eq!(
            policy,
            LivenessPolicy::Ping {
                ping_after: Duration::from_secs(30),
                drop_after: Duration::from_secs(30),
            }
        );
    }
}
