use crate::bass::BassBackend;
use crate::cache::AudioCache;
use crate::downloads::HttpDownloader;
use crate::paths::PathConfig;
use crate::playback::{PlaybackSession, SessionError, SessionOptions, SessionSnapshot, SessionState};
use crate::server;
use crate::settings::PlayerSettings;
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Everything a subcommand needs, resolved once at startup.
pub struct AppContext {
    pub paths: PathConfig,
    pub settings: PlayerSettings,
}

impl AppContext {
    fn cache(&self) -> anyhow::Result<AudioCache> {
        AudioCache::new(&self.paths.audio_cache_dir).context("Failed to open audio cache")
    }
}

/// A line typed into the terminal front end.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    Pause,
    Resume,
    Stop,
    Forward,
    Rewind,
    Open(String),
    Quit,
}

pub fn parse_command(line: &str) -> Option<TransportCommand> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let command = match word.to_ascii_lowercase().as_str() {
        "p" | "pause" => TransportCommand::Pause,
        "r" | "resume" | "play" => TransportCommand::Resume,
        "s" | "stop" => TransportCommand::Stop,
        "f" | "ff" => TransportCommand::Forward,
        "b" | "rw" => TransportCommand::Rewind,
        "q" | "quit" => TransportCommand::Quit,
        "open" if !rest.is_empty() => TransportCommand::Open(rest.to_string()),
        _ => return None,
    };
    Some(command)
}

pub fn render_snapshot(snapshot: &SessionSnapshot) -> String {
    let mut parts = vec![format!("[{:?}]", snapshot.state)];
    for part in [
        snapshot.status_message(),
        snapshot.position_label(),
        snapshot.percent_label(),
    ] {
        if !part.is_empty() {
            parts.push(part);
        }
    }
    parts.join("  ")
}

/// Start `url` in the background; `done` fires once the request resolves.
fn spawn_play(session: &PlaybackSession, url: String, done: &mpsc::UnboundedSender<()>) {
    let session = session.clone();
    let done = done.clone();
    tokio::spawn(async move {
        match session.play(Some(&url)).await {
            Ok(()) | Err(SessionError::Superseded) => {}
            // Failures already reach the terminal through the snapshot
            Err(e) => warn!("[commands] Could not play {}: {}", url, e),
        }
        let _ = done.send(());
    });
}

/// The front end exits once stdin is closed and nothing is left to play: no
/// `play` request still resolving and the session no longer active.
pub fn front_end_finished(stdin_open: bool, plays_in_flight: usize, state: SessionState) -> bool {
    !stdin_open && plays_in_flight == 0 && !state.is_active()
}

/// Terminal front end: play `url`, print progress and read transport
/// commands from stdin until playback ends with stdin closed, or `q`.
pub async fn run_play(ctx: &AppContext, url: &str) -> anyhow::Result<()> {
    let backend = BassBackend::new(&ctx.settings).context("Failed to initialise BASS")?;
    let downloader = HttpDownloader::new(ctx.settings.connect_timeout())?;
    let session = PlaybackSession::new(
        Arc::new(backend),
        Arc::new(downloader),
        ctx.cache()?,
        SessionOptions::from(&ctx.settings),
    );

    let mut updates = session.subscribe_channel();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut last_line = String::new();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut in_flight = 0usize;

    println!("Commands: p(ause) r(esume) s(top) f(orward) b(ack) open <url> q(uit)");
    spawn_play(&session, url.to_string(), &done_tx);
    in_flight += 1;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("[commands] Interrupted");
                break;
            }
            Some(snapshot) = updates.recv() => {
                let line = render_snapshot(&snapshot);
                if line != last_line {
                    println!("{}", line);
                    last_line = line;
                }
                if front_end_finished(stdin_open, in_flight, snapshot.state) {
                    break;
                }
            }
            Some(()) = done_rx.recv() => {
                in_flight = in_flight.saturating_sub(1);
                if front_end_finished(stdin_open, in_flight, session.state()) {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        stdin_open = false;
                        if front_end_finished(stdin_open, in_flight, session.state()) {
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!("[commands] Failed to read stdin: {}", e);
                        stdin_open = false;
                        if front_end_finished(stdin_open, in_flight, session.state()) {
                            break;
                        }
                        continue;
                    }
                };
                match parse_command(&line) {
                    Some(TransportCommand::Pause) => session.pause(),
                    Some(TransportCommand::Resume) => {
                        if session.state() == SessionState::Paused {
                            session.resume();
                        } else if in_flight == 0 && !session.state().is_active() {
                            if let Some(url) = session.snapshot().source_url {
                                spawn_play(&session, url, &done_tx);
                                in_flight += 1;
                            }
                        }
                    }
                    Some(TransportCommand::Stop) => session.stop(),
                    Some(TransportCommand::Forward) => {
                        if !session.forward() {
                            println!("Cannot seek forward");
                        }
                    }
                    Some(TransportCommand::Rewind) => {
                        session.rewind();
                    }
                    Some(TransportCommand::Open(url)) => {
                        spawn_play(&session, url, &done_tx);
                        in_flight += 1;
                    }
                    Some(TransportCommand::Quit) => break,
                    None if line.trim().is_empty() => {}
                    None => println!("Unknown command: {}", line.trim()),
                }
            }
        }
    }

    session.stop();
    Ok(())
}

/// Serve files from `root` (or the configured / current directory) until
/// Ctrl-C.
pub async fn run_serve(ctx: &AppContext, bind: Option<String>, root: Option<PathBuf>) -> anyhow::Result<()> {
    let bind = bind.unwrap_or_else(|| ctx.settings.server_bind.clone());
    let root = match root.or_else(|| ctx.settings.server_root.clone()) {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to resolve working directory")?,
    };
    if !root.is_dir() {
        anyhow::bail!("{} is not a directory", root.display());
    }

    server::serve(&bind, root, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("[server] Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }
    info!("[server] Shutdown signal received");
}

pub fn cache_stats(ctx: &AppContext) -> anyhow::Result<()> {
    let cache = ctx.cache()?;
    let stats = cache.stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

pub fn cache_clear(ctx: &AppContext) -> anyhow::Result<()> {
    let removed = ctx.cache()?.clear()?;
    println!("Removed {} file(s)", removed);
    Ok(())
}

pub fn cache_path(ctx: &AppContext, url: &str) -> anyhow::Result<()> {
    let cache = ctx.cache()?;
    let path = cache.local_path_for(url)?;
    let status = if cache.is_cached(url) { "cached" } else { "not cached" };
    println!("{} ({})", path.display(), status);
    Ok(())
}

pub fn print_paths(ctx: &AppContext) -> anyhow::Result<()> {
    println!("{}", ctx.paths.to_json()?);
    Ok(())
}
