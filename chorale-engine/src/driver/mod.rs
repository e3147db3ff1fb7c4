//! Backend boundary
//!
//! The engine is backend-agnostic: everything it needs from a concrete
//! audio library is expressed by the [`Driver`] trait. Driver threads talk
//! back over an unbounded channel of [`DriverEvent`]s which the engine's
//! bridge task consumes on the owning thread.
//!
//! The shipped backend is [`native::NativeDriver`] (symphonia + cpal);
//! tests script their own driver against the same trait.

pub mod native;

use crate::error::Result;
use crate::scope::ScopeBuffer;
use chorale_common::MetaBundle;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Playback speed: normal or paused-at-zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Normal,
    Pause,
}

/// Numeric facts about the open stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamInfoKey {
    /// 1 when the stream carries an audio channel
    HasAudio,
    /// 1 when a decoder accepted the audio channel
    AudioHandled,
    SampleRate,
    BitDepth,
    Channels,
    /// kbit/s as reported by the backend (0 when unknown)
    Bitrate,
}

/// Textual metadata keys for the open stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKey {
    Title,
    Artist,
    Album,
    Comment,
    Genre,
    Year,
    TrackNumber,
    /// Container / system layer name ("WAV", "CDDA", ...)
    SystemLayer,
}

/// Classified backend messages, both stream errors and advisories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Scheme or protocol unsupported
    NoInputPlugin,
    /// Container unsupported
    NoDemuxPlugin,
    DemuxFailed,
    /// Resource cannot be opened
    InputFailed,
    MalformedUrl,
    /// Container handled but no codec available
    NoAudioHandler,
    /// Media has no audio channel
    NoAudioStream,
    UnknownHost,
    UnknownDevice,
    NetworkUnreachable,
    ConnectionRefused,
    PermissionError,
    ReadError,
    FileNotFound,
    /// Output device busy; the engine resets to Empty
    AudioOutUnavailable,
    /// Decoder or library load failure
    LibraryLoadError,
    GeneralWarning,
    Security,
    Unknown,
}

/// Asynchronous notifications produced on driver threads
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// The stream played to its end
    PlaybackFinished,
    /// Stream metadata changed; the bridge refetches and deduplicates
    MetaInfoChanged,
    /// Title change reported separately by some backends
    SetTitle,
    /// Buffering/connection progress
    Progress { description: String, percent: u32 },
    /// The opened location referenced another one to play instead
    Redirect { mrl: String },
    /// Classified user-facing message
    Message {
        kind: MessageKind,
        explanation: Option<String>,
        parameters: Option<String>,
    },
}

/// Output plugin enumeration entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginDetails {
    pub name: String,
    pub description: String,
}

/// Position/length snapshot: stream fraction (permille), elapsed time,
/// total length
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PosLength {
    pub pos_permille: u32,
    pub time_ms: u64,
    pub length_ms: u64,
}

/// Result of probing a location without playing it
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    /// Container / system layer name ("WAV", "CDDA", ...)
    pub system_layer: String,
    pub meta: MetaBundle,
    pub sample_rate: u32,
    pub bit_depth: u32,
    pub channels: u32,
    /// kbit/s, 0 when the backend does not report it
    pub bitrate: u32,
    pub length_ms: u64,
}

/// Capability contract every concrete backend implements
///
/// Methods are synchronous; anything long-running happens on threads the
/// driver owns. At most one stream is open per driver. Implementations
/// report stream errors through [`Driver::take_error`] and everything
/// asynchronous through the installed event sender.
pub trait Driver: Send {
    /// Open `mrl`, closing any current stream first
    fn open(&mut self, mrl: &str) -> Result<()>;

    /// Close the current stream, stopping playback
    fn close(&mut self);

    /// True when a stream is open
    fn is_open(&self) -> bool;

    /// Begin playback at `offset_ms` into the stream
    fn play(&mut self, offset_ms: u64) -> Result<()>;

    /// Stop playback, keeping the stream open
    fn stop(&mut self);

    fn set_speed(&mut self, speed: Speed);

    fn speed(&self) -> Speed;

    /// Hand the output device back to the system without closing the stream
    fn release_device(&mut self);

    /// Position/length snapshot for the open stream
    fn pos_length(&self) -> PosLength;

    /// Library playback clock in vpts ticks (90 kHz)
    fn clock_vpts(&self) -> i64;

    fn stream_info(&self, key: StreamInfoKey) -> u32;

    fn meta_info(&self, key: MetaKey) -> Option<String>;

    /// Take the last stream error recorded by open/play, if any
    fn take_error(&mut self) -> Option<MessageKind>;

    /// Apply one equalizer band; `value` is the backend range 0..=200
    /// with 100 flat and 0 off
    fn set_eq_band(&mut self, band: usize, value: i32);

    /// Software amplification, 0..=200 with 100 unity
    fn set_amp_level(&mut self, level: u32);

    /// Decodable file extensions, lowercase, no dots
    fn file_extensions(&self) -> Vec<String>;

    /// Available output plugins, without the synthetic "auto" entry
    fn output_plugins(&self) -> Vec<PluginDetails>;

    /// Register or update a backend configuration key
    fn register_config(&mut self, key: &str, value: &str);

    /// Probe a location without disturbing the open stream
    fn probe(&mut self, mrl: &str) -> Result<ProbeResult>;

    /// Enumerate autoplay locations for a media kind ("CD")
    fn autoplay_mrls(&mut self, kind: &str) -> Option<Vec<String>>;

    /// Mirror decoded PCM into `sink` from now on
    fn attach_scope(&mut self, sink: Arc<ScopeBuffer>);

    /// Install the channel driver threads report events on
    fn set_event_sender(&mut self, tx: UnboundedSender<DriverEvent>);
}
