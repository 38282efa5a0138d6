//! Download-cache-and-play session.
//!
//! One [`PlaybackSession`] drives a single audio URL at a time through
//! `Idle → Downloading → Starting → Playing ⇄ Paused → Stopped`, with `Failed`
//! reachable from the download and decode steps. Every field lives behind one
//! lock; transport commands, download completions and timer ticks all take it,
//! so a tick can never observe a half torn-down session.
//!
//! Each attempt gets a generation number. Teardown bumps it, and any pending
//! work (a download finishing late, a tick already queued on the lock)
//! compares generations before touching anything.

use crate::cache::{AudioCache, CacheError};
use crate::downloads::{DownloadError, Downloader};
use crate::player::{AudioBackend, PlayerHandle};
use crate::settings::PlayerSettings;
use crate::utils::{format_clock, sanitize_position};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Downloading,
    Starting,
    Playing,
    Paused,
    Stopped,
    Failed,
}

impl SessionState {
    /// States in which the session may own a decoder handle.
    pub fn holds_decoder(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Playing | SessionState::Paused)
    }

    /// States with work in flight that `stop()` has to tear down.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Downloading | SessionState::Starting | SessionState::Playing | SessionState::Paused
        )
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("could not decode audio: {0}")]
    DecodeFailed(String),
    /// The request was cancelled by `stop()` or replaced by a newer `play()`.
    /// Never stored as `last_error`.
    #[error("playback request was superseded")]
    Superseded,
}

impl From<CacheError> for SessionError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::InvalidUrl(msg) => SessionError::InvalidUrl(msg),
            other => SessionError::DownloadFailed(other.to_string()),
        }
    }
}

/// What observers see after every transition and tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub source_url: Option<String>,
    pub position_seconds: f64,
    pub duration_seconds: Option<f64>,
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    fn shows_progress(&self) -> bool {
        matches!(self.state, SessionState::Playing | SessionState::Paused)
    }

    pub fn percent(&self) -> Option<f64> {
        if !self.shows_progress() {
            return None;
        }
        match self.duration_seconds {
            Some(d) if d > 0.0 => Some((self.position_seconds * 100.0 / d).clamp(0.0, 100.0)),
            _ => None,
        }
    }

    /// e.g. `"42.17%"`, empty when nothing is playing.
    pub fn percent_label(&self) -> String {
        self.percent().map(|p| format!("{:.2}%", p)).unwrap_or_default()
    }

    /// e.g. `"01:05 / 03:30"`, empty when nothing is playing.
    pub fn position_label(&self) -> String {
        match (self.shows_progress(), self.duration_seconds) {
            (true, Some(d)) => format!("{} / {}", format_clock(self.position_seconds), format_clock(d)),
            _ => String::new(),
        }
    }

    pub fn status_message(&self) -> String {
        match self.state {
            SessionState::Downloading => "Downloading...".to_string(),
            SessionState::Starting | SessionState::Playing => "Playing".to_string(),
            SessionState::Paused => "Paused".to_string(),
            SessionState::Failed => self.last_error.clone().unwrap_or_default(),
            SessionState::Idle | SessionState::Stopped => String::new(),
        }
    }

    /// Pause / stop / forward / rewind.
    pub fn controls_enabled(&self) -> bool {
        self.state == SessionState::Playing
    }

    pub fn play_enabled(&self) -> bool {
        !matches!(
            self.state,
            SessionState::Playing | SessionState::Downloading | SessionState::Starting
        )
    }
}

/// Receives every published snapshot. Called with the session lock held, so
/// implementations must hand the snapshot off and never call back into the
/// session.
pub trait SessionObserver: Send + Sync {
    fn on_update(&self, snapshot: &SessionSnapshot);
}

impl SessionObserver for mpsc::UnboundedSender<SessionSnapshot> {
    fn on_update(&self, snapshot: &SessionSnapshot) {
        let _ = self.send(snapshot.clone());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub tick_interval: Duration,
    pub seek_step_seconds: f64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            seek_step_seconds: 10.0,
        }
    }
}

impl From<&PlayerSettings> for SessionOptions {
    fn from(settings: &PlayerSettings) -> Self {
        Self {
            tick_interval: settings.tick_interval(),
            seek_step_seconds: settings.seek_step_seconds,
        }
    }
}

struct SessionInner {
    state: SessionState,
    source_url: Option<String>,
    local_path: Option<PathBuf>,
    position: f64,
    duration: Option<f64>,
    last_error: Option<String>,
    player: Option<Box<dyn PlayerHandle>>,
    file: Option<File>,
    timer: Option<JoinHandle<()>>,
    download_cancel: Option<CancellationToken>,
    generation: u64,
    observers: Vec<Arc<dyn SessionObserver>>,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            source_url: None,
            local_path: None,
            position: 0.0,
            duration: None,
            last_error: None,
            player: None,
            file: None,
            timer: None,
            download_cancel: None,
            generation: 0,
            observers: Vec::new(),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            source_url: self.source_url.clone(),
            position_seconds: self.position,
            duration_seconds: self.duration,
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        for observer in &self.observers {
            observer.on_update(&snapshot);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("[playback] {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.publish();
    }

    /// Release everything the current attempt owns and invalidate pending
    /// work. Safe to call repeatedly; handles are only released once.
    fn release(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(cancel) = self.download_cancel.take() {
            cancel.cancel();
        }
        if let Some(mut player) = self.player.take() {
            if let Err(e) = player.stop() {
                warn!("[playback] Decoder stop failed during release: {}", e);
            }
            drop(player);
            debug!("[playback] Decoder handle released");
        }
        if self.file.take().is_some() {
            debug!("[playback] File handle closed");
        }
        self.position = 0.0;
        self.duration = None;
    }

    /// Tear down whatever is running and point the session at a new source.
    /// Returns the new generation.
    fn begin(&mut self, url: &str, local_path: &Path) -> u64 {
        if self.state.is_active() {
            info!("[playback] Replacing current session for {:?}", self.source_url);
        }
        self.release();
        self.source_url = Some(url.to_string());
        self.local_path = Some(local_path.to_path_buf());
        self.last_error = None;
        self.generation
    }

    /// Invalidate pending work without touching what is currently playing.
    /// Returns the generation the caller now owns.
    fn claim(&mut self) -> u64 {
        self.generation += 1;
        if let Some(cancel) = self.download_cancel.take() {
            cancel.cancel();
        }
        self.generation
    }

    fn fail(&mut self, err: &SessionError) {
        self.release();
        warn!("[playback] Session failed: {}", err);
        self.last_error = Some(err.to_string());
        self.set_state(SessionState::Failed);
    }

    fn pause(&mut self) {
        if self.state != SessionState::Playing {
            debug!("[playback] pause ignored in {:?}", self.state);
            return;
        }
        let Some(player) = self.player.as_mut() else { return };
        if let Err(e) = player.pause() {
            warn!("[playback] Pause failed: {}", e);
            return;
        }
        self.set_state(SessionState::Paused);
    }

    fn resume(&mut self) {
        if self.state != SessionState::Paused {
            debug!("[playback] resume ignored in {:?}", self.state);
            return;
        }
        let Some(player) = self.player.as_mut() else { return };
        if let Err(e) = player.play() {
            warn!("[playback] Resume failed: {}", e);
            return;
        }
        self.set_state(SessionState::Playing);
    }
}

struct Shared {
    inner: Mutex<SessionInner>,
    backend: Arc<dyn AudioBackend>,
    downloader: Arc<dyn Downloader>,
    cache: AudioCache,
    options: SessionOptions,
}

impl Shared {
    /// One progress tick. Returns false once the timer for `generation`
    /// should stop.
    fn tick(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        match inner.state {
            SessionState::Playing => {}
            SessionState::Paused => return true,
            _ => return false,
        }

        let duration = inner.duration.unwrap_or(0.0);
        let (ended, position) = match inner.player.as_ref() {
            Some(player) => (player.has_ended(), sanitize_position(player.position())),
            None => return false,
        };

        if ended {
            info!("[playback] Playback reached the end");
            inner.release();
            inner.last_error = None;
            inner.set_state(SessionState::Stopped);
            return false;
        }

        inner.position = position.min(duration);
        inner.publish();
        true
    }

    /// Install a freshly created decoder and start playback.
    ///
    /// `claimed` is the generation taken before the decoder was built. If
    /// anything replaced or stopped the session since, the new decoder is
    /// dropped and `Superseded` returned. On a cache hit the previous session
    /// is torn down here, right before the handles go in.
    fn install(
        self: &Arc<Self>,
        url: &str,
        local_path: &Path,
        claimed: u64,
        cache_hit: bool,
        created: Result<(File, Box<dyn PlayerHandle>), SessionError>,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if inner.generation != claimed {
            if let Ok((_file, mut player)) = created {
                let _ = player.stop();
            }
            return Err(SessionError::Superseded);
        }
        let generation = if cache_hit { inner.begin(url, local_path) } else { claimed };

        let (file, mut player) = match created {
            Ok(pair) => pair,
            Err(err) => {
                inner.fail(&err);
                return Err(err);
            }
        };

        let duration = sanitize_position(player.duration());
        if let Err(e) = player.play() {
            drop(player);
            drop(file);
            let err = SessionError::DecodeFailed(e.to_string());
            inner.fail(&err);
            return Err(err);
        }

        inner.player = Some(player);
        inner.file = Some(file);
        inner.duration = Some(duration);
        inner.position = 0.0;
        inner.set_state(SessionState::Starting);

        inner.timer = Some(self.spawn_timer(generation));
        info!("[playback] Playing {} ({:.2}s)", local_path.display(), duration);
        inner.set_state(SessionState::Playing);
        Ok(())
    }

    fn spawn_timer(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(self);
        let period = self.options.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                if !shared.tick(generation) {
                    break;
                }
            }
        })
    }
}

/// Open `path` and build a decoder over it. Runs on the blocking pool.
fn open_decoder(
    backend: &dyn AudioBackend,
    path: &Path,
) -> Result<(File, Box<dyn PlayerHandle>), SessionError> {
    let mut file = File::open(path)
        .map_err(|e| SessionError::DecodeFailed(format!("could not open {}: {}", path.display(), e)))?;
    let player = backend
        .create_player(&mut file)
        .map_err(|e| SessionError::DecodeFailed(e.to_string()))?;
    Ok((file, player))
}

/// Cloneable handle to the playback session.
#[derive(Clone)]
pub struct PlaybackSession {
    shared: Arc<Shared>,
}

impl PlaybackSession {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        downloader: Arc<dyn Downloader>,
        cache: AudioCache,
        options: SessionOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(SessionInner::new()),
                backend,
                downloader,
                cache,
                options,
            }),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) {
        self.shared.inner.lock().observers.push(observer);
    }

    /// Convenience observer that forwards snapshots over a channel.
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<SessionSnapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(tx));
        rx
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.inner.lock().snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    pub fn has_decoder(&self) -> bool {
        self.shared.inner.lock().player.is_some()
    }

    pub fn has_file_handle(&self) -> bool {
        self.shared.inner.lock().file.is_some()
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        self.shared.inner.lock().local_path.clone()
    }

    /// Start playing `url`, or resume a paused session when `url` is `None`.
    ///
    /// Resolves once playback has started, failed, or been superseded. Callers
    /// on a UI task should spawn this so `stop()` stays responsive during the
    /// download.
    pub async fn play(&self, url: Option<&str>) -> Result<(), SessionError> {
        let Some(url) = url else {
            self.shared.inner.lock().resume();
            return Ok(());
        };
        let url = url.trim();

        {
            let mut inner = self.shared.inner.lock();
            if inner.state == SessionState::Paused && inner.source_url.as_deref() == Some(url) {
                inner.resume();
                return Ok(());
            }
        }

        let local_path = self.shared.cache.local_path_for(url)?;

        let (claimed, cache_hit) = if self.shared.cache.is_cached(url) {
            info!("[playback] Cache hit for {}, skipping download", local_path.display());
            let claimed = self.shared.inner.lock().claim();
            (claimed, true)
        } else {
            (self.download(url, &local_path).await?, false)
        };

        // Decoder creation may read and scan the whole file; no lock is held
        let backend = Arc::clone(&self.shared.backend);
        let path = local_path.clone();
        let created = tokio::task::spawn_blocking(move || open_decoder(backend.as_ref(), &path))
            .await
            .unwrap_or_else(|e| Err(SessionError::DecodeFailed(e.to_string())));

        self.shared.install(url, &local_path, claimed, cache_hit, created)
    }

    /// Enter `Downloading` and fetch `url` to `local_path`. Returns the
    /// generation the download belongs to.
    async fn download(&self, url: &str, local_path: &Path) -> Result<u64, SessionError> {
        let cancel = CancellationToken::new();
        let generation = {
            let mut inner = self.shared.inner.lock();
            inner.begin(url, local_path);
            inner.download_cancel = Some(cancel.clone());
            inner.set_state(SessionState::Downloading);
            inner.generation
        };

        let result = self
            .shared
            .downloader
            .download_to_file(url, local_path, cancel)
            .await;

        let mut inner = self.shared.inner.lock();
        if inner.generation != generation {
            return Err(SessionError::Superseded);
        }
        match result {
            Ok(_) => {
                inner.download_cancel = None;
                Ok(generation)
            }
            Err(DownloadError::Cancelled) => Err(SessionError::Superseded),
            Err(e) => {
                let err = SessionError::DownloadFailed(e.to_string());
                inner.fail(&err);
                Err(err)
            }
        }
    }

    pub fn pause(&self) {
        self.shared.inner.lock().pause();
    }

    pub fn resume(&self) {
        self.shared.inner.lock().resume();
    }

    /// Stop playback and release the decoder and file handles. Also aborts a
    /// download in progress. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.shared.inner.lock();
        if !inner.state.is_active() {
            // Nothing visible to stop, but a start may be building its decoder
            inner.claim();
            debug!("[playback] stop in {:?}, nothing to release", inner.state);
            return;
        }
        info!("[playback] Stopping from {:?}", inner.state);
        inner.release();
        inner.set_state(SessionState::Stopped);
    }

    /// Move the play position by `delta_seconds`.
    ///
    /// Rewinding past the start lands on 0. Moving forward to or beyond the end
    /// is rejected outright rather than clamped. Returns whether a seek
    /// happened.
    pub fn seek(&self, delta_seconds: f64) -> bool {
        let mut inner = self.shared.inner.lock();
        if !matches!(inner.state, SessionState::Playing | SessionState::Paused) {
            return false;
        }
        let duration = inner.duration.unwrap_or(0.0);
        let Some(player) = inner.player.as_mut() else { return false };

        let target = (sanitize_position(player.position()) + delta_seconds).max(0.0);
        if target >= duration {
            debug!("[playback] Seek to {:.2}s rejected (duration {:.2}s)", target, duration);
            return false;
        }
        if let Err(e) = player.seek(target) {
            warn!("[playback] Seek to {:.2}s failed: {}", target, e);
            return false;
        }

        inner.position = target;
        inner.publish();
        true
    }

    pub fn forward(&self) -> bool {
        self.seek(self.shared.options.seek_step_seconds)
    }

    pub fn rewind(&self) -> bool {
        self.seek(-self.shared.options.seek_step_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::PlayerError;
    use crate::test_support::TempDir;
    use futures_util::future::BoxFuture;
    use std::io::Read;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const BAD_AUDIO: &[u8] = b"not audio";

    #[derive(Default)]
    struct PlayerProbe {
        created: AtomicUsize,
        released: AtomicUsize,
        stops: AtomicUsize,
        seeks: Mutex<Vec<f64>>,
        position: Mutex<f64>,
        ended: AtomicBool,
    }

    struct MockBackend {
        probe: Arc<PlayerProbe>,
        duration: f64,
        decode_delay: Duration,
    }

    struct MockPlayer {
        probe: Arc<PlayerProbe>,
        duration: f64,
    }

    impl AudioBackend for MockBackend {
        fn create_player(&self, source: &mut File) -> Result<Box<dyn PlayerHandle>, PlayerError> {
            let mut bytes = Vec::new();
            source.read_to_end(&mut bytes)?;
            if bytes == BAD_AUDIO {
                return Err(PlayerError::Unsupported("unknown format".to_string()));
            }
            std::thread::sleep(self.decode_delay);
            self.probe.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockPlayer {
                probe: Arc::clone(&self.probe),
                duration: self.duration,
            }))
        }
    }

    impl PlayerHandle for MockPlayer {
        fn play(&mut self) -> Result<(), PlayerError> {
            Ok(())
        }
        fn pause(&mut self) -> Result<(), PlayerError> {
            Ok(())
        }
        fn stop(&mut self) -> Result<(), PlayerError> {
            self.probe.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn seek(&mut self, seconds: f64) -> Result<(), PlayerError> {
            self.probe.seeks.lock().push(seconds);
            *self.probe.position.lock() = seconds;
            Ok(())
        }
        fn position(&self) -> f64 {
            *self.probe.position.lock()
        }
        fn duration(&self) -> f64 {
            self.duration
        }
        fn has_ended(&self) -> bool {
            self.probe.ended.load(Ordering::SeqCst)
        }
    }

    impl Drop for MockPlayer {
        fn drop(&mut self) {
            self.probe.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    enum Mode {
        Serve(Vec<u8>),
        Fail,
        Hang,
    }

    struct MockDownloader {
        mode: Mode,
        calls: AtomicUsize,
    }

    impl MockDownloader {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                mode,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Downloader for MockDownloader {
        fn download_to_file<'a>(
            &'a self,
            _url: &'a str,
            dest: &'a Path,
            cancel: CancellationToken,
        ) -> BoxFuture<'a, Result<u64, DownloadError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                match &self.mode {
                    Mode::Serve(bytes) => {
                        std::fs::write(dest, bytes).map_err(|source| DownloadError::Io {
                            path: dest.to_path_buf(),
                            source,
                        })?;
                        Ok(bytes.len() as u64)
                    }
                    Mode::Fail => Err(DownloadError::Status(reqwest::StatusCode::NOT_FOUND)),
                    Mode::Hang => {
                        cancel.cancelled().await;
                        Err(DownloadError::Cancelled)
                    }
                }
            })
        }
    }

    struct Fixture {
        session: PlaybackSession,
        probe: Arc<PlayerProbe>,
        downloader: Arc<MockDownloader>,
        dir: TempDir,
    }

    fn fixture(mode: Mode) -> Fixture {
        fixture_with_decode_delay(mode, Duration::ZERO)
    }

    fn fixture_with_decode_delay(mode: Mode, decode_delay: Duration) -> Fixture {
        let dir = TempDir::new("playback");
        let probe = Arc::new(PlayerProbe::default());
        let downloader = MockDownloader::new(mode);
        let backend = Arc::new(MockBackend {
            probe: Arc::clone(&probe),
            duration: 100.0,
            decode_delay,
        });
        let cache = AudioCache::new(dir.path()).unwrap();
        let options = SessionOptions {
            tick_interval: Duration::from_millis(5),
            seek_step_seconds: 10.0,
        };
        let session = PlaybackSession::new(backend, downloader.clone(), cache, options);
        Fixture {
            session,
            probe,
            downloader,
            dir,
        }
    }

    fn assert_handle_invariant(session: &PlaybackSession) {
        let state = session.state();
        assert_eq!(state.holds_decoder(), session.has_decoder(), "decoder handle in {state:?}");
        assert_eq!(state.holds_decoder(), session.has_file_handle(), "file handle in {state:?}");
    }

    fn states(rx: &mut mpsc::UnboundedReceiver<SessionSnapshot>) -> Vec<SessionState> {
        let mut seen = Vec::new();
        while let Ok(snapshot) = rx.try_recv() {
            if seen.last() != Some(&snapshot.state) {
                seen.push(snapshot.state);
            }
        }
        seen
    }

    #[tokio::test]
    async fn empty_or_missing_url_leaves_idle() {
        let fx = fixture(Mode::Serve(b"audio".to_vec()));
        let mut rx = fx.session.subscribe_channel();

        assert!(matches!(fx.session.play(Some("")).await, Err(SessionError::InvalidUrl(_))));
        assert!(matches!(fx.session.play(Some("   ")).await, Err(SessionError::InvalidUrl(_))));
        assert!(matches!(fx.session.play(Some("no scheme")).await, Err(SessionError::InvalidUrl(_))));
        assert_eq!(fx.session.play(None).await, Ok(()));

        assert_eq!(fx.session.state(), SessionState::Idle);
        assert!(rx.try_recv().is_err(), "no snapshot should be published");
        assert_eq!(fx.downloader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn downloads_then_plays() {
        let fx = fixture(Mode::Serve(b"audio".to_vec()));
        let mut rx = fx.session.subscribe_channel();

        fx.session.play(Some("http://x/a.mp3")).await.unwrap();

        assert_eq!(fx.downloader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.session.state(), SessionState::Playing);
        assert_eq!(fx.session.local_path(), Some(fx.dir.path().join("a.mp3")));
        assert!(fx.dir.path().join("a.mp3").exists());
        assert_eq!(
            states(&mut rx),
            vec![SessionState::Downloading, SessionState::Starting, SessionState::Playing]
        );
        let snapshot = fx.session.snapshot();
        assert_eq!(snapshot.duration_seconds, Some(100.0));
        assert_eq!(snapshot.status_message(), "Playing");
        assert!(snapshot.controls_enabled());
        assert!(!snapshot.play_enabled());
        assert_handle_invariant(&fx.session);
    }

    #[tokio::test]
    async fn cached_file_skips_download() {
        let fx = fixture(Mode::Fail);
        std::fs::write(fx.dir.path().join("a.mp3"), b"audio").unwrap();
        let mut rx = fx.session.subscribe_channel();

        fx.session.play(Some("http://x/a.mp3")).await.unwrap();

        assert_eq!(fx.downloader.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.session.state(), SessionState::Playing);
        assert_eq!(states(&mut rx), vec![SessionState::Starting, SessionState::Playing]);
    }

    #[tokio::test]
    async fn download_failure_never_creates_decoder() {
        let fx = fixture(Mode::Fail);

        let err = fx.session.play(Some("http://bad/x.mp3")).await.unwrap_err();

        assert!(matches!(err, SessionError::DownloadFailed(_)));
        let snapshot = fx.session.snapshot();
        assert_eq!(snapshot.state, SessionState::Failed);
        assert!(snapshot.last_error.as_deref().is_some_and(|e| !e.is_empty()));
        assert_eq!(snapshot.status_message(), snapshot.last_error.clone().unwrap());
        assert_eq!(fx.probe.created.load(Ordering::SeqCst), 0);
        assert_handle_invariant(&fx.session);
    }

    #[tokio::test]
    async fn undecodable_file_fails_with_decode_error() {
        let fx = fixture(Mode::Serve(BAD_AUDIO.to_vec()));

        let err = fx.session.play(Some("http://x/a.mp3")).await.unwrap_err();

        assert!(matches!(err, SessionError::DecodeFailed(_)));
        assert_eq!(fx.session.state(), SessionState::Failed);
        assert!(!fx.session.has_file_handle());
        assert_handle_invariant(&fx.session);
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let fx = fixture(Mode::Serve(b"audio".to_vec()));
        fx.session.play(Some("http://x/a.mp3")).await.unwrap();

        fx.session.pause();
        assert_eq!(fx.session.state(), SessionState::Paused);
        assert_eq!(fx.session.snapshot().status_message(), "Paused");
        fx.session.pause();
        assert_eq!(fx.session.state(), SessionState::Paused);

        fx.session.play(None).await.unwrap();
        assert_eq!(fx.session.state(), SessionState::Playing);

        fx.session.pause();
        // same URL while paused resumes instead of restarting
        fx.session.play(Some("http://x/a.mp3")).await.unwrap();
        assert_eq!(fx.session.state(), SessionState::Playing);
        assert_eq!(fx.probe.created.load(Ordering::SeqCst), 1);
        assert_handle_invariant(&fx.session);
    }

    #[tokio::test]
    async fn transport_commands_are_no_ops_when_idle() {
        let fx = fixture(Mode::Serve(b"audio".to_vec()));
        fx.session.pause();
        fx.session.resume();
        fx.session.stop();
        assert!(!fx.session.forward());
        assert!(!fx.session.rewind());
        assert_eq!(fx.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn stop_twice_releases_once() {
        let fx = fixture(Mode::Serve(b"audio".to_vec()));
        fx.session.play(Some("http://x/a.mp3")).await.unwrap();
        *fx.probe.position.lock() = 42.0;

        fx.session.stop();
        fx.session.stop();

        let snapshot = fx.session.snapshot();
        assert_eq!(snapshot.state, SessionState::Stopped);
        assert_eq!(snapshot.position_seconds, 0.0);
        assert_eq!(snapshot.percent_label(), "");
        assert_eq!(fx.probe.stops.load(Ordering::SeqCst), 1);
        assert_eq!(fx.probe.released.load(Ordering::SeqCst), 1);
        assert_handle_invariant(&fx.session);
    }

    #[tokio::test]
    async fn forward_past_end_is_rejected_and_rewind_clamps() {
        let fx = fixture(Mode::Serve(b"audio".to_vec()));
        fx.session.play(Some("http://x/a.mp3")).await.unwrap();

        *fx.probe.position.lock() = 95.0;
        assert!(!fx.session.forward());
        assert_eq!(*fx.probe.position.lock(), 95.0);
        assert!(fx.probe.seeks.lock().is_empty());

        // exactly reaching the end is rejected too
        *fx.probe.position.lock() = 90.0;
        assert!(!fx.session.forward());

        *fx.probe.position.lock() = 50.0;
        assert!(fx.session.forward());
        assert_eq!(*fx.probe.position.lock(), 60.0);

        *fx.probe.position.lock() = 4.0;
        assert!(fx.session.rewind());
        assert_eq!(*fx.probe.position.lock(), 0.0);
        assert_eq!(fx.session.snapshot().position_seconds, 0.0);
    }

    #[tokio::test]
    async fn seek_works_while_paused() {
        let fx = fixture(Mode::Serve(b"audio".to_vec()));
        fx.session.play(Some("http://x/a.mp3")).await.unwrap();
        fx.session.pause();

        assert!(fx.session.seek(30.0));
        assert_eq!(fx.session.snapshot().position_seconds, 30.0);
        assert_eq!(fx.session.state(), SessionState::Paused);
    }

    #[tokio::test]
    async fn ticks_report_clamped_progress() {
        let fx = fixture(Mode::Serve(b"audio".to_vec()));
        let mut rx = fx.session.subscribe_channel();
        fx.session.play(Some("http://x/a.mp3")).await.unwrap();

        *fx.probe.position.lock() = 25.0;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let snapshot = fx.session.snapshot();
        assert_eq!(snapshot.position_seconds, 25.0);
        assert_eq!(snapshot.percent_label(), "25.00%");
        assert_eq!(snapshot.position_label(), "00:25 / 01:40");

        // decoder overshoot never leaks past the duration
        *fx.probe.position.lock() = 500.0;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fx.session.snapshot().position_seconds, 100.0);

        let mut ticks = 0;
        while let Ok(snapshot) = rx.try_recv() {
            if let Some(duration) = snapshot.duration_seconds {
                assert!(snapshot.position_seconds <= duration);
            }
            ticks += 1;
        }
        assert!(ticks > 3, "expected several ticks, got {ticks}");
    }

    #[tokio::test]
    async fn ticks_are_inert_while_paused() {
        let fx = fixture(Mode::Serve(b"audio".to_vec()));
        fx.session.play(Some("http://x/a.mp3")).await.unwrap();
        fx.session.pause();
        let mut rx = fx.session.subscribe_channel();

        *fx.probe.position.lock() = 70.0;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(fx.session.snapshot().position_seconds, 0.0);
    }

    #[tokio::test]
    async fn end_of_playback_stops_and_releases_once() {
        let fx = fixture(Mode::Serve(b"audio".to_vec()));
        fx.session.play(Some("http://x/a.mp3")).await.unwrap();
        *fx.probe.position.lock() = 99.5;

        fx.probe.ended.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let snapshot = fx.session.snapshot();
        assert_eq!(snapshot.state, SessionState::Stopped);
        assert_eq!(snapshot.position_seconds, 0.0);
        assert_eq!(snapshot.position_label(), "");
        assert_eq!(snapshot.status_message(), "");
        assert_eq!(fx.probe.released.load(Ordering::SeqCst), 1);

        fx.session.stop();
        assert_eq!(fx.probe.released.load(Ordering::SeqCst), 1);
        assert_handle_invariant(&fx.session);
    }

    #[tokio::test]
    async fn stop_during_download_cancels_transfer() {
        let fx = fixture(Mode::Hang);
        let session = fx.session.clone();
        let pending = tokio::spawn(async move { session.play(Some("http://x/slow.mp3")).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.session.state(), SessionState::Downloading);
        fx.session.stop();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("download should be cancelled promptly")
            .unwrap();
        assert_eq!(result, Err(SessionError::Superseded));
        assert_eq!(fx.session.state(), SessionState::Stopped);
        assert_eq!(fx.probe.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn new_url_replaces_running_session() {
        let fx = fixture(Mode::Serve(b"audio".to_vec()));
        fx.session.play(Some("http://x/a.mp3")).await.unwrap();
        fx.session.pause();

        fx.session.play(Some("http://x/b.mp3")).await.unwrap();

        assert_eq!(fx.session.state(), SessionState::Playing);
        assert_eq!(fx.session.snapshot().source_url.as_deref(), Some("http://x/b.mp3"));
        assert_eq!(fx.probe.created.load(Ordering::SeqCst), 2);
        assert_eq!(fx.probe.released.load(Ordering::SeqCst), 1);
        assert_handle_invariant(&fx.session);
    }

    #[tokio::test]
    async fn new_url_cancels_in_flight_download() {
        let fx = fixture(Mode::Hang);
        std::fs::write(fx.dir.path().join("b.mp3"), b"audio").unwrap();
        let session = fx.session.clone();
        let pending = tokio::spawn(async move { session.play(Some("http://x/slow.mp3")).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.session.state(), SessionState::Downloading);

        fx.session.play(Some("http://x/b.mp3")).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("first download should be cancelled")
            .unwrap();
        assert_eq!(first, Err(SessionError::Superseded));
        let snapshot = fx.session.snapshot();
        assert_eq!(snapshot.state, SessionState::Playing);
        assert_eq!(snapshot.source_url.as_deref(), Some("http://x/b.mp3"));
        assert_eq!(fx.probe.created.load(Ordering::SeqCst), 1);
        assert!(!fx.dir.path().join("slow.mp3").exists());
        assert_handle_invariant(&fx.session);
    }

    #[tokio::test]
    async fn stop_stays_responsive_while_decoder_is_built() {
        let fx = fixture_with_decode_delay(Mode::Fail, Duration::from_millis(300));
        std::fs::write(fx.dir.path().join("a.mp3"), b"audio").unwrap();
        let session = fx.session.clone();
        let pending = tokio::spawn(async move { session.play(Some("http://x/a.mp3")).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = std::time::Instant::now();
        fx.session.stop();
        let state = fx.session.state();
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "stop()/state() waited {:?} on decoder creation",
            started.elapsed()
        );
        assert_eq!(state, SessionState::Idle);

        let result = pending.await.unwrap();
        assert_eq!(result, Err(SessionError::Superseded));
        assert!(!fx.session.has_decoder());
        // the decoder built for the stopped start is dropped, never installed
        assert_eq!(fx.probe.created.load(Ordering::SeqCst), 1);
        assert_eq!(fx.probe.released.load(Ordering::SeqCst), 1);
        assert_handle_invariant(&fx.session);
    }

    #[tokio::test]
    async fn directory_named_like_track_is_not_a_cache_hit() {
        let fx = fixture(Mode::Fail);
        std::fs::create_dir(fx.dir.path().join("a.mp3")).unwrap();

        let err = fx.session.play(Some("http://x/a.mp3")).await.unwrap_err();

        assert_eq!(fx.downloader.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, SessionError::DownloadFailed(_)));
        assert_eq!(fx.probe.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn play_again_after_failure() {
        let fx = fixture(Mode::Fail);
        assert!(fx.session.play(Some("http://bad/x.mp3")).await.is_err());

        std::fs::write(fx.dir.path().join("good.mp3"), b"audio").unwrap();
        fx.session.play(Some("http://x/good.mp3")).await.unwrap();

        let snapshot = fx.session.snapshot();
        assert_eq!(snapshot.state, SessionState::Playing);
        assert_eq!(snapshot.last_error, None);
    }

    #[test]
    fn snapshot_presentation_is_derived_from_state() {
        let mut snapshot = SessionSnapshot {
            state: SessionState::Paused,
            source_url: Some("http://x/a.mp3".to_string()),
            position_seconds: 65.0,
            duration_seconds: Some(210.0),
            last_error: None,
        };
        assert_eq!(snapshot.position_label(), "01:05 / 03:30");
        assert_eq!(snapshot.percent_label(), "30.95%");
        assert!(!snapshot.controls_enabled());
        assert!(snapshot.play_enabled());

        snapshot.state = SessionState::Downloading;
        assert_eq!(snapshot.status_message(), "Downloading...");
        assert_eq!(snapshot.percent(), None);
        assert!(!snapshot.play_enabled());
    }
}
