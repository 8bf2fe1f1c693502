mod config;
mod events;
mod server;
mod stream;
mod tui;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tokio::sync::{mpsc, watch};

use config::{ServerConfig, TransportKind};
use drift::{NetworkStats, RelayConfig, RelayEngine};
use server::{DatagramServer, ServerStats};
use stream::StreamServer;
use tui::TuiState;

#[derive(Parser)]
#[command(name = "drift-server")]
#[command(about = "Drift position relay server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short, long, default_value_t = drift::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, value_enum, default_value_t = TransportKind::Udp)]
    transport: TransportKind,

    #[arg(short, long, default_value_t = drift::registry::DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,

    #[arg(long, help = "Seconds of silence before a session is pinged")]
    ping_after: Option<u64>,

    #[arg(long, help = "Seconds of silence before a session is dropped")]
    drop_after: Option<u64>,

    #[arg(long)]
    headless: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let liveness = ServerConfig::liveness_for(
        args.transport,
        args.ping_after.map(Duration::from_secs),
        args.drop_after.map(Duration::from_secs),
    );
    let config = ServerConfig {
        bind_addr: SocketAddr::new(args.bind, args.port),
        transport: args.transport,
        relay: RelayConfig {
            max_sessions: args.max_sessions,
            liveness,
        },
    };

    if args.headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        log::info!(
            "Transport {}, liveness policy {:?}",
            config.transport.as_str(),
            config.relay.liveness
        );
    }

    match config.transport {
        TransportKind::Udp => run_datagram(config, args.headless),
        TransportKind::Tcp => run_stream(config, args.headless),
    }
}

fn run_datagram(config: ServerConfig, headless: bool) -> Result<()> {
    let mut server = DatagramServer::new(config.bind_addr, config.relay)?;

    if headless {
        log::info!("Server started on {}", server.local_addr());
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.spawn(server::stop_when(server.running(), tokio::signal::ctrl_c()));
        server.run();
        log::info!("Server shutting down");
        return Ok(());
    }

    let running = server.running();
    run_dashboard(|tui_state| {
        server.tick_once();
        for event in server.drain_events() {
            tui_state.push_event(&event);
        }
        let keep_going = running.load(Ordering::SeqCst);
        Ok((keep_going, server.stats()))
    })?;
    Ok(())
}

fn run_stream(config: ServerConfig, headless: bool) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    let server = runtime.block_on(StreamServer::bind(config.bind_addr, config.relay))?;
    let local_addr = server.local_addr();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (stats_tx, stats_rx) = watch::channel(empty_stats(local_addr));

    let handle = runtime.spawn(server.run(shutdown_rx, events_tx, stats_tx));

    if headless {
        log::info!("Server started on {}", local_addr);
        runtime.block_on(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {}", e);
            }
        });
        log::info!("Server shutting down");
    } else {
        run_dashboard(|tui_state| {
            while let Ok(event) = events_rx.try_recv() {
                tui_state.push_event(&event);
            }
            Ok((!handle.is_finished(), stats_rx.borrow().clone()))
        })?;
    }

    let _ = shutdown_tx.send(true);
    runtime.block_on(handle)??;
    Ok(())
}

fn empty_stats(local_addr: SocketAddr) -> ServerStats {
    ServerStats::collect(
        &RelayEngine::new(RelayConfig::default()),
        NetworkStats::default(),
        Instant::now(),
        "tcp",
        local_addr,
    )
}

/// Drives the dashboard until the user quits or `step` reports the server
/// stopped. `step` advances the server and returns fresh stats.
fn run_dashboard<F>(mut step: F) -> io::Result<()>
where
    F: FnMut(&mut TuiState) -> io::Result<(bool, ServerStats)>,
{
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut tui_state = TuiState::new();

    let result = (|| -> io::Result<()> {
        loop {
            let (keep_going, stats) = step(&mut tui_state)?;
            if !keep_going {
                break;
            }

            if event::poll(Duration::from_millis(1))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        match key.code {
                            KeyCode::Char('q') | KeyCode::Esc => break,
                            KeyCode::PageUp => tui_state.scroll_up(),
                            KeyCode::PageDown => tui_state.scroll_down(),
                            KeyCode::End => tui_state.scroll_to_bottom(),
                            _ => {}
                        }
                    }
                }
            }

            terminal.draw(|frame| {
                tui::render(frame, &tui_state, &stats);
            })?;
        }
        Ok(())
    })();

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    result
}
