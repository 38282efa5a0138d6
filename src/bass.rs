use crate::player::{AudioBackend, PlayerError, PlayerHandle};
use crate::settings::PlayerSettings;
use crate::utils::sanitize_position;
use libloading::{Library, Symbol};
use std::ffi::c_void;
use std::fs::File;
use std::io::Read;
use std::os::raw::{c_int, c_uint};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

type Bool = c_int;
type Dword = c_uint;
type Qword = u64;
type HStream = Dword;

// BASS function type definitions
pub type BassInit = unsafe extern "system" fn(device: c_int, freq: Dword, flags: Dword, win: *mut c_void, dsguid: *const c_void) -> Bool;
pub type BassFree = unsafe extern "system" fn() -> Bool;
pub type BassSetConfig = unsafe extern "system" fn(option: Dword, value: Dword) -> Dword;
pub type BassErrorGetCode = unsafe extern "system" fn() -> c_int;
pub type BassStreamCreateFile = unsafe extern "system" fn(mem: Bool, file: *const c_void, offset: Qword, length: Qword, flags: Dword) -> HStream;
pub type BassStreamFree = unsafe extern "system" fn(handle: HStream) -> Bool;
pub type BassChannelPlay = unsafe extern "system" fn(handle: Dword, restart: Bool) -> Bool;
pub type BassChannelPause = unsafe extern "system" fn(handle: Dword) -> Bool;
pub type BassChannelStop = unsafe extern "system" fn(handle: Dword) -> Bool;
pub type BassChannelIsActive = unsafe extern "system" fn(handle: Dword) -> Dword;
pub type BassChannelGetLength = unsafe extern "system" fn(handle: Dword, mode: Dword) -> Qword;
pub type BassChannelGetPosition = unsafe extern "system" fn(handle: Dword, mode: Dword) -> Qword;
pub type BassChannelSetPosition = unsafe extern "system" fn(handle: Dword, pos: Qword, mode: Dword) -> Bool;
pub type BassChannelBytes2Seconds = unsafe extern "system" fn(handle: Dword, pos: Qword) -> f64;
pub type BassChannelSeconds2Bytes = unsafe extern "system" fn(handle: Dword, sec: f64) -> Qword;

// BASS constants
pub const BASS_DEVICE_DEFAULT: c_int = -1;
pub const BASS_CONFIG_BUFFER: Dword = 0;
pub const BASS_STREAM_PRESCAN: Dword = 0x20000;
pub const BASS_POS_BYTE: Dword = 0;
pub const BASS_ACTIVE_STOPPED: Dword = 0;
pub const BASS_ERROR_ALREADY: c_int = 14;

// QWORD functions report failure as -1
const QWORD_ERROR: Qword = u64::MAX;

/// Candidate locations for the BASS shared library, most specific first.
fn library_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let file_name = PathBuf::from(libloading::library_filename("bass"));
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    candidates.push(file_name.clone());
    candidates.push(Path::new(".").join(&file_name));
    candidates.push(Path::new("bin").join(&file_name));
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join(&file_name));
        }
    }
    candidates
}

/// Dynamically loaded BASS library with its output device.
pub struct BassLibrary {
    lib: Library,
    initialized: bool,
}

impl BassLibrary {
    pub fn load(explicit: Option<&Path>) -> Result<Self, PlayerError> {
        let candidates = library_candidates(explicit);
        for path in &candidates {
            match unsafe { Library::new(path) } {
                Ok(lib) => {
                    info!("[bass] Loaded BASS library from: {}", path.display());
                    let bass = Self { lib, initialized: false };
                    // Make sure this is really BASS before handing it out
                    bass.symbol::<BassFree>("BASS_Free")?;
                    return Ok(bass);
                }
                Err(e) => debug!("[bass] Could not load {}: {}", path.display(), e),
            }
        }

        let tried: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
        Err(PlayerError::LibraryNotFound(format!("tried {}", tried.join(", "))))
    }

    fn symbol<T>(&self, name: &'static str) -> Result<Symbol<'_, T>, PlayerError> {
        unsafe { self.lib.get::<T>(name.as_bytes()) }.map_err(|_| PlayerError::MissingSymbol(name))
    }

    /// Initialise the output device. Calling this on an already initialised
    /// device is not an error.
    pub fn init_device(&mut self, device: c_int, sample_rate: u32, buffer_ms: u32) -> Result<(), PlayerError> {
        {
            let set_config: Symbol<BassSetConfig> = self.symbol("BASS_SetConfig")?;
            unsafe { set_config(BASS_CONFIG_BUFFER, buffer_ms) };

            let init: Symbol<BassInit> = self.symbol("BASS_Init")?;
            let ok = unsafe { init(device, sample_rate, 0, std::ptr::null_mut(), std::ptr::null()) };
            if ok == 0 {
                let code = self.error_code();
                if code != BASS_ERROR_ALREADY {
                    return Err(PlayerError::DeviceInit(error_message(code)));
                }
            }
        }
        self.initialized = true;
        info!("[bass] Output device {} initialised at {} Hz", device, sample_rate);
        Ok(())
    }

    pub fn error_code(&self) -> c_int {
        match self.symbol::<BassErrorGetCode>("BASS_ErrorGetCode") {
            Ok(f) => unsafe { f() },
            Err(_) => -1,
        }
    }

    fn last_error(&self) -> String {
        error_message(self.error_code())
    }

    fn check(&self, ok: Bool, what: &str) -> Result<(), PlayerError> {
        if ok == 0 {
            Err(PlayerError::Command(format!("{} failed: {}", what, self.last_error())))
        } else {
            Ok(())
        }
    }

    /// Create a stream over an in-memory file. `data` must outlive the stream.
    pub fn stream_create_memory(&self, data: &[u8], flags: Dword) -> Result<HStream, PlayerError> {
        let create: Symbol<BassStreamCreateFile> = self.symbol("BASS_StreamCreateFile")?;
        let handle = unsafe { create(1, data.as_ptr() as *const c_void, 0, data.len() as Qword, flags) };
        if handle == 0 {
            return Err(PlayerError::Unsupported(self.last_error()));
        }
        Ok(handle)
    }

    pub fn stream_free(&self, handle: HStream) {
        if let Ok(free) = self.symbol::<BassStreamFree>("BASS_StreamFree") {
            unsafe { free(handle) };
        }
    }

    pub fn channel_play(&self, handle: HStream, restart: bool) -> Result<(), PlayerError> {
        let play: Symbol<BassChannelPlay> = self.symbol("BASS_ChannelPlay")?;
        let ok = unsafe { play(handle, restart as Bool) };
        self.check(ok, "BASS_ChannelPlay")
    }

    pub fn channel_pause(&self, handle: HStream) -> Result<(), PlayerError> {
        let pause: Symbol<BassChannelPause> = self.symbol("BASS_ChannelPause")?;
        let ok = unsafe { pause(handle) };
        self.check(ok, "BASS_ChannelPause")
    }

    pub fn channel_stop(&self, handle: HStream) -> Result<(), PlayerError> {
        let stop: Symbol<BassChannelStop> = self.symbol("BASS_ChannelStop")?;
        let ok = unsafe { stop(handle) };
        self.check(ok, "BASS_ChannelStop")
    }

    pub fn channel_is_active(&self, handle: HStream) -> Dword {
        match self.symbol::<BassChannelIsActive>("BASS_ChannelIsActive") {
            Ok(f) => unsafe { f(handle) },
            Err(_) => BASS_ACTIVE_STOPPED,
        }
    }

    fn bytes_to_seconds(&self, handle: HStream, bytes: Qword) -> Option<f64> {
        if bytes == QWORD_ERROR {
            return None;
        }
        let convert: Symbol<BassChannelBytes2Seconds> = self.symbol("BASS_ChannelBytes2Seconds").ok()?;
        let secs = unsafe { convert(handle, bytes) };
        if secs.is_finite() && secs >= 0.0 {
            Some(secs)
        } else {
            None
        }
    }

    pub fn duration_seconds(&self, handle: HStream) -> Option<f64> {
        let get_length: Symbol<BassChannelGetLength> = self.symbol("BASS_ChannelGetLength").ok()?;
        let len_bytes = unsafe { get_length(handle, BASS_POS_BYTE) };
        if len_bytes == 0 {
            return None;
        }
        self.bytes_to_seconds(handle, len_bytes).filter(|secs| *secs > 0.0)
    }

    pub fn position_seconds(&self, handle: HStream) -> Option<f64> {
        let get_position: Symbol<BassChannelGetPosition> = self.symbol("BASS_ChannelGetPosition").ok()?;
        let pos_bytes = unsafe { get_position(handle, BASS_POS_BYTE) };
        self.bytes_to_seconds(handle, pos_bytes)
    }

    pub fn set_position_seconds(&self, handle: HStream, seconds: f64) -> Result<(), PlayerError> {
        let to_bytes: Symbol<BassChannelSeconds2Bytes> = self.symbol("BASS_ChannelSeconds2Bytes")?;
        let bytes = unsafe { to_bytes(handle, seconds) };
        if bytes == QWORD_ERROR {
            return Err(PlayerError::Command(format!(
                "cannot convert {:.2}s to a byte offset: {}",
                seconds,
                self.last_error()
            )));
        }
        let set_position: Symbol<BassChannelSetPosition> = self.symbol("BASS_ChannelSetPosition")?;
        let ok = unsafe { set_position(handle, bytes, BASS_POS_BYTE) };
        self.check(ok, "BASS_ChannelSetPosition")
    }
}

impl Drop for BassLibrary {
    fn drop(&mut self) {
        if self.initialized {
            if let Ok(free) = self.symbol::<BassFree>("BASS_Free") {
                unsafe { free() };
            }
            debug!("[bass] Output device released");
        }
    }
}

pub fn error_message(code: c_int) -> String {
    match code {
        0 => "BASS_OK: No error".to_string(),
        1 => "BASS_ERROR_MEM: Memory error".to_string(),
        2 => "BASS_ERROR_FILEOPEN: Can't open the file".to_string(),
        3 => "BASS_ERROR_DRIVER: Can't find a free/valid driver".to_string(),
        5 => "BASS_ERROR_HANDLE: Invalid handle".to_string(),
        6 => "BASS_ERROR_FORMAT: Unsupported sample format".to_string(),
        7 => "BASS_ERROR_POSITION: Invalid position".to_string(),
        8 => "BASS_ERROR_INIT: BASS_Init has not been successfully called".to_string(),
        14 => "BASS_ERROR_ALREADY: Already initialized/paused/whatever".to_string(),
        20 => "BASS_ERROR_ILLPARAM: An illegal parameter was specified".to_string(),
        23 => "BASS_ERROR_DEVICE: Illegal device number".to_string(),
        24 => "BASS_ERROR_NOPLAY: Not playing".to_string(),
        25 => "BASS_ERROR_FREQ: Illegal sample rate".to_string(),
        27 => "BASS_ERROR_NOTFILE: The stream is not a file stream".to_string(),
        37 => "BASS_ERROR_NOTAVAIL: Requested data is not available".to_string(),
        41 => "BASS_ERROR_FILEFORM: Unsupported file format".to_string(),
        44 => "BASS_ERROR_CODEC: Codec is not available/supported".to_string(),
        45 => "BASS_ERROR_ENDED: The channel/file has ended".to_string(),
        46 => "BASS_ERROR_BUSY: The device is busy".to_string(),
        _ => format!("BASS unknown error {}", code),
    }
}

/// [`AudioBackend`] that decodes through BASS.
pub struct BassBackend {
    bass: Arc<BassLibrary>,
}

impl BassBackend {
    pub fn new(settings: &PlayerSettings) -> Result<Self, PlayerError> {
        let mut bass = BassLibrary::load(settings.bass_library.as_deref())?;
        bass.init_device(settings.device_id, settings.sample_rate, settings.buffer_size_ms)?;
        Ok(Self { bass: Arc::new(bass) })
    }
}

impl AudioBackend for BassBackend {
    fn create_player(&self, source: &mut File) -> Result<Box<dyn PlayerHandle>, PlayerError> {
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;
        if data.is_empty() {
            return Err(PlayerError::Unsupported("file is empty".to_string()));
        }

        let handle = self.bass.stream_create_memory(&data, BASS_STREAM_PRESCAN)?;
        let Some(duration) = self.bass.duration_seconds(handle) else {
            self.bass.stream_free(handle);
            return Err(PlayerError::Unsupported("stream length is unknown".to_string()));
        };
        debug!("[bass] Created stream {} ({} bytes, {:.2}s)", handle, data.len(), duration);

        Ok(Box::new(BassPlayer {
            bass: Arc::clone(&self.bass),
            handle,
            duration,
            started: false,
            stopped: false,
            _data: data,
        }))
    }
}

struct BassPlayer {
    bass: Arc<BassLibrary>,
    handle: HStream,
    duration: f64,
    started: bool,
    stopped: bool,
    // Backing memory for the stream, freed after the stream in Drop
    _data: Vec<u8>,
}

impl PlayerHandle for BassPlayer {
    fn play(&mut self) -> Result<(), PlayerError> {
        self.bass.channel_play(self.handle, false)?;
        self.started = true;
        self.stopped = false;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PlayerError> {
        self.bass.channel_pause(self.handle)
    }

    fn stop(&mut self) -> Result<(), PlayerError> {
        self.stopped = true;
        self.bass.channel_stop(self.handle)
    }

    fn seek(&mut self, seconds: f64) -> Result<(), PlayerError> {
        self.bass.set_position_seconds(self.handle, seconds)
    }

    fn position(&self) -> f64 {
        self.bass
            .position_seconds(self.handle)
            .map(sanitize_position)
            .unwrap_or(0.0)
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn has_ended(&self) -> bool {
        if !self.started || self.stopped {
            return false;
        }
        self.bass.channel_is_active(self.handle) == BASS_ACTIVE_STOPPED
    }
}

impl Drop for BassPlayer {
    fn drop(&mut self) {
        self.bass.stream_free(self.handle);
        debug!("[bass] Freed stream {}", self.handle);
    }
}
