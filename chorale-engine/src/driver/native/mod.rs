//! Native playback backend
//!
//! symphonia decodes on a worker thread into a lock-free ring; cpal drains
//! the ring from the device callback. The callback's frame counter is the
//! playback clock everything else reads: position, the presentation
//! timestamps of scope fragments, and end-of-stream detection.

mod decoder;
mod equalizer;
mod output;

pub use equalizer::BAND_FREQUENCIES;

use crate::driver::{
    Driver, DriverEvent, MessageKind, MetaKey, PluginDetails, PosLength, ProbeResult, Speed,
    StreamInfoKey,
};
use crate::error::{Error, Result};
use crate::scope::{frames_to_vpts, pts_per_sample, ScopeBuffer, ScopeNode};
use chorale_common::MetaBundle;
use decoder::{DecodeSource, StreamFacts};
use equalizer::Equalizer;
use output::{OutputHandle, PlayClock};
use ringbuf::{traits::*, HeapRb};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Backend configuration key for the preferred ALSA device
pub const ALSA_DEVICE_KEY: &str = "audio.device.alsa_front_device";

/// Extensions the decode stack accepts, lowercase without dots
const EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "oga", "aac", "m4a", "mp4", "wav", "wave", "aiff", "aif", "caf", "mkv",
];

/// How long the decode thread naps when the ring is full
const BACKPRESSURE_NAP: Duration = Duration::from_millis(5);

/// Running decode/output pipeline for one play() call
struct Session {
    stop: Arc<AtomicBool>,
    clock: Arc<PlayClock>,
    decode: Option<thread::JoinHandle<()>>,
    output: Option<OutputHandle>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Output first so the ring stops draining
        self.output.take();
        if let Some(join) = self.decode.take() {
            let _ = join.join();
        }
    }
}

struct OpenStream {
    path: PathBuf,
    facts: StreamFacts,
    tags: HashMap<MetaKey, String>,
    session: Option<Session>,
    /// Stream time at frame zero of the current session
    base_ms: u64,
    speed: Speed,
}

pub struct NativeDriver {
    /// Output plugin preference; `None` selects the platform default host
    plugin: Option<String>,
    config: HashMap<String, String>,
    amp: Arc<AtomicU32>,
    eq: Arc<Mutex<Equalizer>>,
    scope: Option<Arc<ScopeBuffer>>,
    events: Option<UnboundedSender<DriverEvent>>,
    last_error: Option<MessageKind>,
    stream: Option<OpenStream>,
}

impl NativeDriver {
    /// `output_plugin` of "auto" or "" selects the platform default host
    pub fn new(output_plugin: &str) -> Self {
        let plugin = match output_plugin {
            "" | "auto" => None,
            other => Some(other.to_string()),
        };
        info!(plugin = ?plugin, "native driver created");
        Self {
            plugin,
            config: HashMap::new(),
            amp: Arc::new(AtomicU32::new(100)),
            eq: Arc::new(Mutex::new(Equalizer::new(44100))),
            scope: None,
            events: None,
            last_error: None,
            stream: None,
        }
    }

    fn send(&self, event: DriverEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event);
        }
    }

    fn resolve_path(&mut self, mrl: &str) -> Result<PathBuf> {
        match mrl_to_path(mrl) {
            Ok(path) => Ok(path),
            Err(kind) => {
                self.last_error = Some(kind);
                Err(Error::Open(format!("cannot open location: {}", mrl)))
            }
        }
    }

    fn spawn_session(&mut self, offset_ms: u64) -> Result<Session> {
        let (path, rate) = {
            let stream = self
                .stream
                .as_ref()
                .ok_or_else(|| Error::InvalidState("play without an open stream".into()))?;
            (stream.path.clone(), stream.facts.sample_rate)
        };

        let mut source = match DecodeSource::open(&path) {
            Ok(s) => s,
            Err((kind, e)) => {
                self.last_error = Some(kind);
                return Err(e);
            }
        };
        if offset_ms > 0 {
            source.seek_ms(offset_ms)?;
        }

        {
            let mut eq = self.eq.lock().unwrap();
            eq.set_sample_rate(rate);
            eq.reset();
        }
        if let Some(ref scope) = self.scope {
            scope.set_pts_per_sample(pts_per_sample(rate));
        }

        // About half a second of interleaved stereo
        let ring = HeapRb::<f32>::new((rate as usize).max(8192));
        let (mut producer, consumer) = ring.split();

        let stop = Arc::new(AtomicBool::new(false));
        let clock = Arc::new(PlayClock::new());

        let decode_stop = Arc::clone(&stop);
        let decode_clock = Arc::clone(&clock);
        let decode_eq = Arc::clone(&self.eq);
        let decode_scope = self.scope.clone();
        let decode_events = self.events.clone();
        let decode = thread::Builder::new()
            .name("audio-decode".into())
            .spawn(move || {
                let mut frames_decoded = offset_ms * rate as u64 / 1000;
                loop {
                    if decode_stop.load(Ordering::SeqCst) {
                        return;
                    }
                    let chunk = match source.next_chunk() {
                        Ok(Some(c)) => c,
                        Ok(None) => break,
                        Err(e) => {
                            warn!("decode aborted: {}", e);
                            if let Some(ref tx) = decode_events {
                                let _ = tx.send(DriverEvent::Message {
                                    kind: MessageKind::ReadError,
                                    explanation: Some(e.to_string()),
                                    parameters: None,
                                });
                            }
                            break;
                        }
                    };

                    let mut samples = chunk.samples;
                    decode_eq.lock().unwrap().process(&mut samples);

                    if let Some(ref scope) = decode_scope {
                        scope.push(ScopeNode {
                            vpts: frames_to_vpts(frames_decoded, rate),
                            vpts_end: frames_to_vpts(
                                frames_decoded + chunk.frames as u64,
                                rate,
                            ),
                            frames: chunk.frames,
                            channels: 2,
                            pcm: samples
                                .iter()
                                .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                                .collect(),
                        });
                    }
                    frames_decoded += chunk.frames as u64;

                    let mut written = 0;
                    while written < samples.len() {
                        if decode_stop.load(Ordering::SeqCst) {
                            return;
                        }
                        written += producer.push_slice(&samples[written..]);
                        if written < samples.len() {
                            thread::sleep(BACKPRESSURE_NAP);
                        }
                    }
                }
                decode_clock.eof.store(true, Ordering::SeqCst);
            })
            .map_err(|e| Error::Playback(format!("failed to spawn decode thread: {}", e)))?;

        let device = self.config.get(ALSA_DEVICE_KEY).cloned();
        let out = output::start(
            self.plugin.clone(),
            device,
            rate,
            consumer,
            Arc::clone(&clock),
            Arc::clone(&self.amp),
            self.events.clone(),
        );
        let output = match out {
            Ok(handle) => handle,
            Err(e) => {
                stop.store(true, Ordering::SeqCst);
                let _ = decode.join();
                self.last_error = Some(MessageKind::AudioOutUnavailable);
                return Err(e);
            }
        };

        Ok(Session {
            stop,
            clock,
            decode: Some(decode),
            output: Some(output),
        })
    }
}

impl Driver for NativeDriver {
    fn open(&mut self, mrl: &str) -> Result<()> {
        self.close();
        self.last_error = None;

        let path = self.resolve_path(mrl)?;
        let source = match DecodeSource::open(&path) {
            Ok(s) => s,
            Err((kind, e)) => {
                self.last_error = Some(kind);
                return Err(e);
            }
        };

        debug!(mrl, "stream opened");
        self.stream = Some(OpenStream {
            path,
            facts: source.facts().clone(),
            tags: source.tags().clone(),
            session: None,
            base_ms: 0,
            speed: Speed::Normal,
        });
        self.send(DriverEvent::MetaInfoChanged);
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("stream closed");
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn play(&mut self, offset_ms: u64) -> Result<()> {
        if let Some(ref mut stream) = self.stream {
            stream.session = None;
        }
        let session = self.spawn_session(offset_ms)?;
        let stream = self.stream.as_mut().unwrap();
        stream.session = Some(session);
        stream.base_ms = offset_ms;
        stream.speed = Speed::Normal;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(ref mut stream) = self.stream {
            stream.session = None;
            stream.base_ms = 0;
            stream.speed = Speed::Normal;
        }
    }

    fn set_speed(&mut self, speed: Speed) {
        let Some(ref stream) = self.stream else { return };
        if stream.speed == speed {
            return;
        }
        if stream.session.is_none() {
            // Device was released while paused; rebuild from the saved position
            if speed == Speed::Normal {
                let resume_ms = stream.base_ms;
                match self.spawn_session(resume_ms) {
                    Ok(session) => {
                        let stream = self.stream.as_mut().unwrap();
                        stream.session = Some(session);
                        stream.speed = Speed::Normal;
                    }
                    Err(e) => {
                        warn!("failed to re-acquire audio device: {}", e);
                        self.send(DriverEvent::Message {
                            kind: MessageKind::AudioOutUnavailable,
                            explanation: Some(e.to_string()),
                            parameters: None,
                        });
                    }
                }
            } else if let Some(ref mut stream) = self.stream {
                stream.speed = speed;
            }
            return;
        }
        let stream = self.stream.as_mut().unwrap();
        if let Some(ref session) = stream.session {
            if let Some(ref output) = session.output {
                match speed {
                    Speed::Pause => output.pause(),
                    Speed::Normal => output.resume(),
                }
            }
        }
        stream.speed = speed;
    }

    fn speed(&self) -> Speed {
        self.stream.as_ref().map(|s| s.speed).unwrap_or(Speed::Normal)
    }

    fn release_device(&mut self) {
        if let Some(ref mut stream) = self.stream {
            if let Some(session) = stream.session.take() {
                // Fold elapsed time into the base so a later resume or
                // position query keeps reading the right spot
                let played = session.clock.frames_played.load(Ordering::Relaxed);
                stream.base_ms += played * 1000 / stream.facts.sample_rate.max(1) as u64;
                debug!(resume_ms = stream.base_ms, "audio device released");
            }
        }
    }

    fn pos_length(&self) -> PosLength {
        let Some(ref stream) = self.stream else {
            return PosLength::default();
        };
        let played = stream
            .session
            .as_ref()
            .map(|s| s.clock.frames_played.load(Ordering::Relaxed))
            .unwrap_or(0);
        let time_ms = stream.base_ms + played * 1000 / stream.facts.sample_rate.max(1) as u64;
        let length_ms = stream.facts.length_ms;
        let pos_permille = if length_ms > 0 {
            ((time_ms * 1000 / length_ms) as u32).min(1000)
        } else {
            0
        };
        PosLength { pos_permille, time_ms, length_ms }
    }

    fn clock_vpts(&self) -> i64 {
        let Some(ref stream) = self.stream else {
            return 0;
        };
        let played = stream
            .session
            .as_ref()
            .map(|s| s.clock.frames_played.load(Ordering::Relaxed))
            .unwrap_or(0);
        stream.base_ms as i64 * 90 + frames_to_vpts(played, stream.facts.sample_rate)
    }

    fn stream_info(&self, key: StreamInfoKey) -> u32 {
        let Some(ref stream) = self.stream else {
            return 0;
        };
        match key {
            StreamInfoKey::HasAudio | StreamInfoKey::AudioHandled => 1,
            StreamInfoKey::SampleRate => stream.facts.sample_rate,
            StreamInfoKey::BitDepth => stream.facts.bit_depth,
            StreamInfoKey::Channels => stream.facts.channels,
            StreamInfoKey::Bitrate => stream.facts.bitrate,
        }
    }

    fn meta_info(&self, key: MetaKey) -> Option<String> {
        let stream = self.stream.as_ref()?;
        if key == MetaKey::SystemLayer {
            if stream.facts.system_layer.is_empty() {
                return None;
            }
            return Some(stream.facts.system_layer.clone());
        }
        stream.tags.get(&key).cloned()
    }

    fn take_error(&mut self) -> Option<MessageKind> {
        self.last_error.take()
    }

    fn set_eq_band(&mut self, band: usize, value: i32) {
        self.eq.lock().unwrap().set_band(band, value);
    }

    fn set_amp_level(&mut self, level: u32) {
        self.amp.store(level.min(200), Ordering::Relaxed);
    }

    fn file_extensions(&self) -> Vec<String> {
        EXTENSIONS.iter().map(|e| e.to_string()).collect()
    }

    fn output_plugins(&self) -> Vec<PluginDetails> {
        output::list_plugins()
    }

    fn register_config(&mut self, key: &str, value: &str) {
        debug!(key, value, "backend config updated");
        self.config.insert(key.to_string(), value.to_string());
    }

    fn probe(&mut self, mrl: &str) -> Result<ProbeResult> {
        let path = self.resolve_path(mrl)?;
        let source = match DecodeSource::open(&path) {
            Ok(s) => s,
            Err((kind, e)) => {
                self.last_error = Some(kind);
                return Err(e);
            }
        };
        let facts = source.facts();
        let tags = source.tags();

        let meta = MetaBundle {
            url: mrl.to_string(),
            title: tags.get(&MetaKey::Title).cloned().unwrap_or_default(),
            artist: tags.get(&MetaKey::Artist).cloned().unwrap_or_default(),
            album: tags.get(&MetaKey::Album).cloned().unwrap_or_default(),
            comment: tags.get(&MetaKey::Comment).cloned().unwrap_or_default(),
            genre: tags.get(&MetaKey::Genre).cloned().unwrap_or_default(),
            year: tags.get(&MetaKey::Year).cloned().unwrap_or_default(),
            track: tags.get(&MetaKey::TrackNumber).cloned().unwrap_or_default(),
            samplerate: facts.sample_rate,
            bitdepth: facts.bit_depth,
            bitrate: facts.bitrate,
            length_sec: facts.length_ms / 1000,
        };

        Ok(ProbeResult {
            system_layer: facts.system_layer.clone(),
            meta,
            sample_rate: facts.sample_rate,
            bit_depth: facts.bit_depth,
            channels: facts.channels,
            bitrate: facts.bitrate,
            length_ms: facts.length_ms,
        })
    }

    fn autoplay_mrls(&mut self, kind: &str) -> Option<Vec<String>> {
        debug!(kind, "autoplay enumeration not supported by this backend");
        None
    }

    fn attach_scope(&mut self, sink: Arc<ScopeBuffer>) {
        self.scope = Some(sink);
    }

    fn set_event_sender(&mut self, tx: UnboundedSender<DriverEvent>) {
        self.events = Some(tx);
    }
}

/// Resolve an MRL to a local path, classifying unsupported forms
fn mrl_to_path(mrl: &str) -> std::result::Result<PathBuf, MessageKind> {
    if let Some(rest) = mrl.strip_prefix("file://") {
        let url = url::Url::parse(mrl).map_err(|_| MessageKind::MalformedUrl)?;
        return Ok(url.to_file_path().unwrap_or_else(|_| PathBuf::from(rest)));
    }
    if let Some((scheme, _)) = mrl.split_once("://") {
        if scheme.len() > 1 {
            return Err(MessageKind::NoInputPlugin);
        }
    }
    if mrl.starts_with("cdda:") {
        return Err(MessageKind::NoInputPlugin);
    }
    if mrl.is_empty() {
        return Err(MessageKind::MalformedUrl);
    }
    Ok(PathBuf::from(mrl))
}
