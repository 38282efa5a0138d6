//! Fetch an audio file over HTTP into a local cache, play it through BASS, and
//! serve files from a directory over a small HTTP endpoint.

pub mod bass;
pub mod cache;
pub mod commands;
pub mod downloads;
pub mod logging;
pub mod paths;
pub mod playback;
pub mod player;
pub mod server;
pub mod settings;
pub mod utils;
