mod arena;
mod bot;
mod input;

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;

use drift::{
    DatagramLink, DisconnectReason, EntityId, StreamLink, SyncClient, SyncConfig, SyncState,
    Transport,
};

use arena::Status;
use bot::Wanderer;
use input::{HeldKeys, MoveKeys};

const FRAME_TIME: Duration = Duration::from_millis(16);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    Udp,
    Tcp,
}

impl TransportKind {
    fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
        }
    }
}

#[derive(Parser)]
#[command(name = "drift-client")]
#[command(about = "Drift position sync client")]
struct Args {
    #[arg(help = "Player name, a random one is picked when omitted")]
    name: Option<String>,

    #[arg(short, long, default_value = "127.0.0.1:19501")]
    server: String,

    #[arg(short, long, value_enum, default_value_t = TransportKind::Udp)]
    transport: TransportKind,

    #[arg(long, default_value_t = 20.0, help = "Movement speed in units per second")]
    speed: f32,

    #[arg(long, help = "Milliseconds between position updates")]
    update_ms: Option<u64>,

    #[arg(long, help = "Wander around without a terminal UI")]
    headless: bool,

    #[arg(long, help = "Leave after this many seconds (headless only)")]
    duration: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let server = resolve(&args.server)?;
    let seed = generate_seed();
    let identifier = match &args.name {
        Some(name) => EntityId::new(format!("player-{}", name))?,
        None => EntityId::new(format!("player-{:04x}", seed & 0xffff))?,
    };

    let mut config = SyncConfig::default();
    if let Some(ms) = args.update_ms {
        config.update_interval = Duration::from_millis(ms);
    }

    match args.transport {
        TransportKind::Udp => {
            let mut client = SyncClient::new(identifier, config);
            client.connect(|| DatagramLink::connect(server), Instant::now())?;
            run(client, &args, seed)
        }
        TransportKind::Tcp => {
            let mut client = SyncClient::new(identifier, config);
            client.connect(
                || StreamLink::connect(server, CONNECT_TIMEOUT),
                Instant::now(),
            )?;
            run(client, &args, seed)
        }
    }
}

fn resolve(server: &str) -> Result<SocketAddr> {
    server
        .to_socket_addrs()
        .with_context(|| format!("Invalid server address `{}`", server))?
        .next()
        .ok_or_else(|| anyhow!("`{}` did not resolve to an address", server))
}

fn generate_seed() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default(),
    );
    hasher.finish()
}

fn run<T: Transport>(mut client: SyncClient<T>, args: &Args, seed: u64) -> Result<()> {
    if args.headless {
        let duration = args.duration.map(Duration::from_secs);
        return run_headless(&mut client, Wanderer::new(seed, args.speed), duration);
    }

    run_arena(&mut client, args.transport, args.speed)?;

    match client.disconnect_reason() {
        Some(DisconnectReason::Left) | None => {}
        Some(reason) => eprintln!("Disconnected: {}", reason),
    }
    Ok(())
}

fn run_headless<T: Transport>(
    client: &mut SyncClient<T>,
    mut bot: Wanderer,
    duration: Option<Duration>,
) -> Result<()> {
    let start = Instant::now();
    let mut last = start;
    let mut last_report = start;

    loop {
        let now = Instant::now();
        let dt = now.saturating_duration_since(last);
        last = now;

        if duration.is_some_and(|d| now.saturating_duration_since(start) >= d) {
            client.leave()?;
            log::info!("Left after {:?}", now.saturating_duration_since(start));
            return Ok(());
        }

        let movement = bot.step(client.position(), dt);
        client.update(now, movement)?;

        if now.saturating_duration_since(last_report) >= REPORT_INTERVAL {
            last_report = now;
            let position = client.position();
            log::info!(
                "{} at ({:.1}, {:.1}), {} remote player(s), rtt {:?}",
                client.state().as_str(),
                position.x,
                position.y,
                client.remotes().len(),
                client.rtt()
            );
            for entity in client.entities(now).iter().filter(|e| !e.local) {
                log::debug!(
                    "  {} at ({:.1}, {:.1})",
                    entity.identifier,
                    entity.position.x,
                    entity.position.y
                );
            }
        }

        thread::sleep(FRAME_TIME);
    }
}

fn run_arena<T: Transport>(
    client: &mut SyncClient<T>,
    transport: TransportKind,
    speed: f32,
) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut held = HeldKeys::new();
    let identifier = client.identifier().to_string();

    let result = (|| -> io::Result<()> {
        let mut last = Instant::now();
        loop {
            if event::poll(FRAME_TIME)? {
                if let Event::Key(key) = event::read()? {
                    let now = Instant::now();
                    match (key.kind, key.code) {
                        (KeyEventKind::Release, code) => {
                            if let Some(k) = MoveKeys::from_key(code) {
                                held.release(k);
                            }
                        }
                        (_, KeyCode::Char('q') | KeyCode::Esc) => {
                            if client.state() != SyncState::Disconnected {
                                if let Err(e) = client.leave() {
                                    log::warn!("Leave failed: {}", e);
                                }
                            }
                            break;
                        }
                        (_, code) => {
                            if let Some(k) = MoveKeys::from_key(code) {
                                held.press(k, now);
                            }
                        }
                    }
                }
            }

            let now = Instant::now();
            let dt = now.saturating_duration_since(last);
            last = now;

            if client.state() != SyncState::Disconnected {
                let movement = held.movement(now, speed, dt);
                if let Err(e) = client.update(now, movement) {
                    log::debug!("Sync stopped: {}", e);
                }
            }

            let entities = client.entities(now);
            let status = Status {
                identifier: &identifier,
                transport: transport.as_str(),
                state: client.state(),
                position: client.position(),
                rtt: client.rtt(),
                disconnect_reason: client.disconnect_reason(),
            };
            terminal.draw(|frame| {
                arena::render(frame, &entities, &status);
            })?;
        }
        Ok(())
    })();

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    result
}
