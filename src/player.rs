//! Decoder/output seam used by the playback session.
//!
//! A backend turns an open audio file into a [`PlayerHandle`]; the session owns
//! the handle for as long as it is in `Starting`, `Playing` or `Paused`.

use std::fs::File;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("audio library not found: {0}")]
    LibraryNotFound(String),
    #[error("audio library is missing symbol {0}")]
    MissingSymbol(&'static str),
    #[error("audio device initialisation failed: {0}")]
    DeviceInit(String),
    #[error("could not read audio source: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoder rejected the stream: {0}")]
    Unsupported(String),
    #[error("playback command failed: {0}")]
    Command(String),
}

/// An open, seekable audio stream ready for transport commands.
pub trait PlayerHandle: Send {
    fn play(&mut self) -> Result<(), PlayerError>;
    fn pause(&mut self) -> Result<(), PlayerError>;
    fn stop(&mut self) -> Result<(), PlayerError>;
    fn seek(&mut self, seconds: f64) -> Result<(), PlayerError>;
    /// Current playback position in seconds.
    fn position(&self) -> f64;
    /// Total length in seconds. Known as soon as the handle exists.
    fn duration(&self) -> f64;
    /// True once the stream has played through to its end.
    fn has_ended(&self) -> bool;
}

pub trait AudioBackend: Send + Sync {
    /// Build a player from the byte stream behind `source`.
    ///
    /// The caller keeps ownership of the file handle and closes it when the
    /// player is released.
    fn create_player(&self, source: &mut File) -> Result<Box<dyn PlayerHandle>, PlayerError>;
}
