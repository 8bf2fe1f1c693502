use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use drift::{NetworkEndpoint, NetworkStats, Outbound, Position, RelayConfig, RelayEngine};

use crate::events::ServerEvent;

/// UDP relay: one loop owns the socket and the relay engine.
pub struct DatagramServer {
    endpoint: NetworkEndpoint,
    relay: RelayEngine,
    running: Arc<AtomicBool>,
    start_time: Instant,
    pending_events: VecDeque<ServerEvent>,
}

impl DatagramServer {
    pub fn new(bind_addr: SocketAddr, config: RelayConfig) -> io::Result<Self> {
        let endpoint = NetworkEndpoint::bind(bind_addr)?;

        let mut pending_events = VecDeque::new();
        pending_events.push_back(ServerEvent::Started {
            description: format!("UDP relay listening on {}", endpoint.local_addr()),
        });

        Ok(Self {
            endpoint,
            relay: RelayEngine::new(config),
            running: Arc::new(AtomicBool::new(true)),
            start_time: Instant::now(),
            pending_events,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    /// Headless loop. Events were already logged where they happened.
    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            self.pending_events.clear();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();

        match self.endpoint.receive() {
            Ok(messages) => {
                for (message, from) in messages {
                    let outbound = self.relay.handle_message(from, message, now);
                    self.deliver(outbound);
                }
            }
            Err(e) => {
                log::error!("Receive failed: {}", e);
                self.pending_events.push_back(ServerEvent::Error {
                    message: format!("Network error: {}", e),
                });
            }
        }

        let outbound = self.relay.sweep(now);
        self.deliver(outbound);

        self.pending_events
            .extend(self.relay.drain_events().map(ServerEvent::from));
    }

    fn deliver(&mut self, outbound: Vec<Outbound>) {
        for out in outbound {
            if let Err(e) = self.endpoint.send_to(&out.message, out.to) {
                log::warn!("Failed to send {} to {}: {}", out.message.kind(), out.to, e);
                self.pending_events.push_back(ServerEvent::Error {
                    message: format!("Failed to send to {}: {}", out.to, e),
                });
            }
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats::collect(
            &self.relay,
            self.endpoint.stats().clone(),
            self.start_time,
            "udp",
            self.local_addr(),
        )
    }
}

/// Clears `running` once `signal` fires. A failed signal leaves it set.
pub async fn stop_when<F>(running: Arc<AtomicBool>, signal: F)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => running.store(false, Ordering::SeqCst),
        Err(e) => log::error!("Failed to listen for shutdown signal: {}", e),
    }
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub identifier: String,
    pub endpoint: SocketAddr,
    pub position: Position,
    pub connected_secs: u64,
    pub silent_secs: u64,
    pub pinged: bool,
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub transport: &'static str,
    pub local_addr: SocketAddr,
    pub uptime_secs: u64,
    pub session_count: usize,
    pub max_sessions: usize,
    pub sessions: Vec<SessionInfo>,
    pub network_stats: NetworkStats,
}

impl ServerStats {
    pub fn collect(
        relay: &RelayEngine,
        network_stats: NetworkStats,
        start_time: Instant,
        transport: &'static str,
        local_addr: SocketAddr,
    ) -> Self {
        let now = Instant::now();
        let registry = relay.sessions();
        let sessions = registry
            .iter()
            .map(|s| SessionInfo {
                identifier: s.identifier.to_string(),
                endpoint: s.endpoint,
                position: s.position,
                connected_secs: now.saturating_duration_since(s.joined_at).as_secs(),
                silent_secs: s.silent_for(now).as_secs(),
                pinged: s.pinged,
            })
            .collect();

        Self {
            transport,
            local_addr,
            uptime_secs: start_time.elapsed().as_secs(),
            session_count: registry.len(),
            max_sessions: registry.max_sessions(),
            sessions,
            network_stats,
        }
    }
}
