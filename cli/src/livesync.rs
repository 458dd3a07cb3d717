//! # `livesync`: a terminal client for live game chat rooms
//!
//! Joins one room, prints it as it changes and sends whatever is typed on
//! stdin.
//!
//! ## Usage
//!
//! ```bash
//! # List the rooms the server knows about
//! livesync --list
//!
//! # Join the general room
//! livesync --room 1 --nickname Kim
//!
//! # Join an event room and cheer for the away side
//! livesync --room 42 --game g-7 --side away
//! ```
//!
//! Lines starting with `/` are commands: `/home <text>` and `/away <text>`
//! send to one side, `/refresh` re-pulls the counters, `/bets` re-pulls the
//! betting stats, `/reconnect` forces a new connection and `/quit` leaves.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use lib_livesync::loggers::init_logging;
use lib_livesync::{
    CallerIdentity, ConfigOverlay, ConnectionSettings, Delivery, DomainMessage, HttpBackend, LiveSync, MessageScope,
    RoomDescriptor, Side, SyncConfig, SyncEvent, WsTransport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

type Session = LiveSync<HttpBackend, WsTransport>;

#[derive(Parser, Debug)]
#[command(name = "livesync", about = "Live game chat in the terminal", version)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, env = "LIVESYNC_CONFIG_PATH")]
    config_path: Option<PathBuf>,

    /// Base URL of the REST API.
    #[arg(long, env = "LIVESYNC_API_BASE_URL")]
    api_base_url: Option<String>,

    /// STOMP endpoint, e.g. wss://host/chat-socket.
    #[arg(long, env = "LIVESYNC_SOCKET_URL")]
    socket_url: Option<String>,

    /// Bearer token sent on CONNECT and with every REST call.
    #[arg(long, env = "LIVESYNC_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    #[arg(long, env = "LIVESYNC_RECONNECT_DELAY_MS")]
    reconnect_delay_ms: Option<u64>,

    /// Directory for log files.
    #[arg(long, env = "LIVESYNC_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// trace, debug, info, warn, error.
    #[arg(long, env = "LIVESYNC_LOG_LEVEL")]
    log_level: Option<String>,

    /// Print the room directory and exit.
    #[arg(long)]
    list: bool,

    /// Room to join. Defaults to the first general room in the directory.
    #[arg(long)]
    room: Option<String>,

    /// Game id, when joining an event room that is not in the directory.
    #[arg(long, requires = "room")]
    game: Option<String>,

    /// Side to send to in event rooms.
    #[arg(long, default_value = "home")]
    side: Side,

    /// Category to send with in the general room.
    #[arg(long, default_value_t = 0)]
    category: i64,

    #[arg(long)]
    user_id: Option<String>,

    #[arg(long)]
    nickname: Option<String>,
}

impl Args {
    fn overlay(&self) -> ConfigOverlay {
        ConfigOverlay {
            api_base_url: self.api_base_url.clone(),
            socket_url: self.socket_url.clone(),
            auth_token: self.auth_token.clone(),
            reconnect_delay_ms: self.reconnect_delay_ms,
            log_dir: self.log_dir.clone(),
            log_level: self.log_level.clone(),
            config_path: self.config_path.clone(),
            ..Default::default()
        }
    }

    fn caller(&self) -> CallerIdentity {
        CallerIdentity {
            user_id: self.user_id.clone(),
            display_name: self.nickname.clone(),
        }
    }

    fn default_scope(&self, room: &RoomDescriptor) -> MessageScope {
        match room.game_id() {
            Some(_) => MessageScope::Side(self.side),
            None => MessageScope::Category(self.category),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    let config = SyncConfig::load(args.overlay()).context("loading configuration")?;
    let _log_guard = init_logging("livesync", Some(&config.log_dir), &config.log_level)?;
    tracing::debug!("{}", config);

    let backend = Arc::new(HttpBackend::new(&config.api_base_url, config.auth_token.clone())?);
    let sync: Session = LiveSync::new(backend, Arc::new(WsTransport), ConnectionSettings::from_config(&config));

    if args.list {
        for room in sync.directory().await? {
            println!(
                "{:>6}  {:<30} {}",
                room.room_id,
                room.display_name,
                room.game_id().map(|g| format!("game {}", g)).unwrap_or_else(|| "general".into())
            );
        }
        return Ok(());
    }

    let room = pick_room(&sync, &args, config.default_room_capacity).await?;
    println!("Joining {} ({})", room.display_name, room.room_id);
    sync.set_caller(args.caller());

    let mut events = sync.events();
    sync.join_room(room.clone()).await;
    sync.connect().await;

    let mut printed = HashSet::new();
    print_new(&sync, &mut printed);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, leaving.");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => show(&sync, event, &mut printed),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged; redrawing");
                    print_new(&sync, &mut printed);
                }
                Err(RecvError::Closed) => break,
            },
            line = stdin.next_line() => match line? {
                None => break,
                Some(line) => {
                    if !handle_line(&sync, &args, &room, line.trim()).await {
                        break;
                    }
                }
            },
        }
    }

    sync.disconnect().await;
    tracing::info!("Session closed.");
    Ok(())
}

async fn pick_room(sync: &Session, args: &Args, capacity: usize) -> Result<RoomDescriptor> {
    let listed = match sync.directory().await {
        Ok(rooms) => rooms,
        Err(e) => {
            tracing::warn!(error = %e, "Room directory unavailable");
            Vec::new()
        }
    };

    match &args.room {
        Some(id) => Ok(listed
            .into_iter()
            .find(|r| &r.room_id == id)
            .unwrap_or_else(|| RoomDescriptor::new(id.clone(), args.game.clone(), format!("room {}", id), capacity))),
        None => match listed.into_iter().find(|r| r.scope_id.is_none()) {
            Some(room) => Ok(room),
            None => bail!("no general room listed; pass --room"),
        },
    }
}

/// Returns `false` when the user asked to quit.
async fn handle_line(sync: &Session, args: &Args, room: &RoomDescriptor, line: &str) -> bool {
    let (scope, body) = match line.split_once(' ').unwrap_or((line, "")) {
        ("", _) => return true,
        ("/quit", _) => return false,
        ("/refresh", _) => {
            if let Some(counts) = sync.refresh_counts().await {
                println!("-- counts home={} away={}", counts.home, counts.away);
            }
            return true;
        }
        ("/bets", _) => {
            match room.game_id() {
                Some(game_id) => {
                    if sync.refresh_betting(game_id).await.is_none() {
                        println!("-- no betting for this room");
                    }
                }
                None => println!("-- not an event room"),
            }
            return true;
        }
        ("/reconnect", _) => {
            sync.reconnect().await;
            return true;
        }
        ("/home", rest) => (MessageScope::Side(Side::Home), rest),
        ("/away", rest) => (MessageScope::Side(Side::Away), rest),
        _ => (args.default_scope(room), line),
    };
    if body.trim().is_empty() {
        return true;
    }

    match sync.send(body, scope).await {
        Ok(Delivery::Sent) => {}
        Ok(Delivery::LocalFallback(reason)) => println!("-- not delivered ({}); shown locally", reason),
        Err(e) => println!("-- {}", e),
    }
    true
}

fn show(sync: &Session, event: SyncEvent, printed: &mut HashSet<String>) {
    match event {
        SyncEvent::ConnectionChanged { group, state } => println!("-- {} {}", group, state),
        SyncEvent::MessagesChanged { .. } => print_new(sync, printed),
        SyncEvent::CountersChanged { counters, .. } => {
            println!("-- counts home={} away={}", counters.home, counters.away)
        }
        SyncEvent::StatsChanged { .. } => {
            if let Some(stats) = sync.stats() {
                println!(
                    "-- bets {} {} pts @ {:.2} | {} {} pts @ {:.2}",
                    stats.home_team_name,
                    stats.home_team_bet_points,
                    stats.home_team_odds,
                    stats.away_team_name,
                    stats.away_team_bet_points,
                    stats.away_team_odds
                );
            }
            if let Some(mine) = sync.user_bet_status() {
                println!(
                    "-- my bets: {} pts over {} bets, {} pts left{}",
                    mine.total_bet_points,
                    mine.bet_count,
                    mine.remaining_points,
                    if mine.can_bet { "" } else { " (closed)" }
                );
            }
        }
    }
}

fn print_new(sync: &Session, printed: &mut HashSet<String>) {
    for message in sync.messages() {
        if printed.insert(message.id.clone()) {
            println!("{}", line_for(&message));
        }
    }
}

fn line_for(message: &DomainMessage) -> String {
    let at = message.created_at.with_timezone(&chrono::Local).format("%H:%M:%S");
    let scope = match message.scope {
        MessageScope::Side(side) => format!(" [{}]", side),
        MessageScope::Category(0) => String::new(),
        MessageScope::Category(c) => format!(" [#{}]", c),
    };
    let local = if message.local_only { " (local)" } else { "" };
    format!("{}{} {}: {}{}", at, scope, message.author_display_name, message.body, local)
}
