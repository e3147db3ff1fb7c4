//! Shared test helpers
//!
//! `ScriptedDriver` stands in for a real backend: it records every call the
//! engine makes and lets a test inject driver events as if decode threads
//! had produced them.

// Not every test binary uses every helper
#![allow(dead_code)]

use chorale_engine::driver::{
    Driver, DriverEvent, MessageKind, MetaKey, PluginDetails, PosLength, ProbeResult, Speed,
    StreamInfoKey,
};
use chorale_engine::error::{Error, Result};
use chorale_engine::scope::ScopeBuffer;
use chorale_common::{EngineEvent, MetaBundle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedSender;

/// Everything the engine asked the driver to do
#[derive(Default)]
pub struct DriverLog {
    pub opened: Vec<String>,
    pub played_ms: Vec<u64>,
    pub stops: u32,
    pub closes: u32,
    pub releases: u32,
    pub speeds: Vec<Speed>,
    pub eq_bands: Vec<(usize, i32)>,
    pub amp_levels: Vec<u32>,
    pub config: Vec<(String, String)>,
}

/// Knobs a test can turn before (or while) driving the engine
pub struct Script {
    pub fail_open: Option<MessageKind>,
    pub fail_play: Option<MessageKind>,
    pub has_audio: bool,
    pub audio_handled: bool,
    pub tags: HashMap<MetaKey, String>,
    pub system_layer: Option<String>,
    pub sample_rate: u32,
    pub bit_depth: u32,
    pub channels: u32,
    pub time_ms: u64,
    pub length_ms: u64,
    pub extensions: Vec<String>,
    /// Announce MetaInfoChanged from inside open, like the native backend
    pub announce_meta_on_open: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            fail_open: None,
            fail_play: None,
            has_audio: true,
            audio_handled: true,
            tags: HashMap::new(),
            system_layer: None,
            sample_rate: 44100,
            bit_depth: 16,
            channels: 2,
            time_ms: 1500,
            length_ms: 180_000,
            extensions: vec![
                "mp3".into(),
                "flac".into(),
                "ogg".into(),
                "wav".into(),
                // The engine must strip these two
                "png".into(),
                "txt".into(),
            ],
            announce_meta_on_open: false,
        }
    }
}

pub struct ScriptedDriver {
    pub log: Arc<Mutex<DriverLog>>,
    pub script: Arc<Mutex<Script>>,
    /// Captured event sender, for injecting driver events from tests
    pub events: Arc<Mutex<Option<UnboundedSender<DriverEvent>>>>,
    open_url: Option<String>,
    speed: Speed,
    last_error: Option<MessageKind>,
}

impl ScriptedDriver {
    pub fn new() -> (Self, Handles) {
        let log = Arc::new(Mutex::new(DriverLog::default()));
        let script = Arc::new(Mutex::new(Script::default()));
        let events = Arc::new(Mutex::new(None));
        let handles = Handles {
            log: Arc::clone(&log),
            script: Arc::clone(&script),
            events: Arc::clone(&events),
        };
        let driver = Self {
            log,
            script,
            events,
            open_url: None,
            speed: Speed::Normal,
            last_error: None,
        };
        (driver, handles)
    }
}

/// Test-side handles to the driver's shared state
#[derive(Clone)]
pub struct Handles {
    pub log: Arc<Mutex<DriverLog>>,
    pub script: Arc<Mutex<Script>>,
    pub events: Arc<Mutex<Option<UnboundedSender<DriverEvent>>>>,
}

impl Handles {
    /// Inject a driver event as if a backend thread had produced it
    pub fn send(&self, event: DriverEvent) {
        let guard = self.events.lock().unwrap();
        guard
            .as_ref()
            .expect("engine must install an event sender")
            .send(event)
            .expect("bridge must be alive");
    }
}

impl Driver for ScriptedDriver {
    fn open(&mut self, mrl: &str) -> Result<()> {
        self.log.lock().unwrap().opened.push(mrl.to_string());
        let announce = {
            let script = self.script.lock().unwrap();
            if let Some(kind) = script.fail_open {
                self.last_error = Some(kind);
                return Err(Error::Open(format!("scripted open failure for {}", mrl)));
            }
            script.announce_meta_on_open
        };
        self.open_url = Some(mrl.to_string());
        if announce {
            if let Some(tx) = self.events.lock().unwrap().as_ref() {
                let _ = tx.send(DriverEvent::MetaInfoChanged);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closes += 1;
        self.open_url = None;
    }

    fn is_open(&self) -> bool {
        self.open_url.is_some()
    }

    fn play(&mut self, offset_ms: u64) -> Result<()> {
        self.log.lock().unwrap().played_ms.push(offset_ms);
        let mut script = self.script.lock().unwrap();
        if let Some(kind) = script.fail_play {
            self.last_error = Some(kind);
            return Err(Error::Playback("scripted play failure".into()));
        }
        // Model the position jumping to wherever playback starts
        script.time_ms = offset_ms;
        self.speed = Speed::Normal;
        Ok(())
    }

    fn stop(&mut self) {
        self.log.lock().unwrap().stops += 1;
    }

    fn set_speed(&mut self, speed: Speed) {
        self.log.lock().unwrap().speeds.push(speed);
        self.speed = speed;
    }

    fn speed(&self) -> Speed {
        self.speed
    }

    fn release_device(&mut self) {
        self.log.lock().unwrap().releases += 1;
    }

    fn pos_length(&self) -> PosLength {
        let script = self.script.lock().unwrap();
        let time_ms = script.time_ms;
        let length_ms = script.length_ms;
        let pos_permille = if length_ms > 0 {
            ((time_ms * 1000 / length_ms) as u32).min(1000)
        } else {
            0
        };
        PosLength { pos_permille, time_ms, length_ms }
    }

    fn clock_vpts(&self) -> i64 {
        self.script.lock().unwrap().time_ms as i64 * 90
    }

    fn stream_info(&self, key: StreamInfoKey) -> u32 {
        let script = self.script.lock().unwrap();
        match key {
            StreamInfoKey::HasAudio => script.has_audio as u32,
            StreamInfoKey::AudioHandled => script.audio_handled as u32,
            StreamInfoKey::SampleRate => script.sample_rate,
            StreamInfoKey::BitDepth => script.bit_depth,
            StreamInfoKey::Channels => script.channels,
            StreamInfoKey::Bitrate => 0,
        }
    }

    fn meta_info(&self, key: MetaKey) -> Option<String> {
        let script = self.script.lock().unwrap();
        if key == MetaKey::SystemLayer {
            return script.system_layer.clone();
        }
        script.tags.get(&key).cloned()
    }

    fn take_error(&mut self) -> Option<MessageKind> {
        self.last_error.take()
    }

    fn set_eq_band(&mut self, band: usize, value: i32) {
        self.log.lock().unwrap().eq_bands.push((band, value));
    }

    fn set_amp_level(&mut self, level: u32) {
        self.log.lock().unwrap().amp_levels.push(level);
    }

    fn file_extensions(&self) -> Vec<String> {
        self.script.lock().unwrap().extensions.clone()
    }

    fn output_plugins(&self) -> Vec<PluginDetails> {
        vec![
            PluginDetails { name: "alsa".into(), description: "ALSA output".into() },
            PluginDetails { name: "pulseaudio".into(), description: "PulseAudio output".into() },
        ]
    }

    fn register_config(&mut self, key: &str, value: &str) {
        self.log.lock().unwrap().config.push((key.to_string(), value.to_string()));
    }

    fn probe(&mut self, mrl: &str) -> Result<ProbeResult> {
        let script = self.script.lock().unwrap();
        let meta = MetaBundle {
            url: mrl.to_string(),
            title: script.tags.get(&MetaKey::Title).cloned().unwrap_or_default(),
            artist: script.tags.get(&MetaKey::Artist).cloned().unwrap_or_default(),
            samplerate: script.sample_rate,
            bitdepth: script.bit_depth,
            length_sec: script.length_ms / 1000,
            ..Default::default()
        };
        Ok(ProbeResult {
            system_layer: script.system_layer.clone().unwrap_or_default(),
            meta,
            sample_rate: script.sample_rate,
            bit_depth: script.bit_depth,
            channels: script.channels,
            bitrate: 0,
            length_ms: script.length_ms,
        })
    }

    fn autoplay_mrls(&mut self, _kind: &str) -> Option<Vec<String>> {
        Some(vec!["cdda:/1".into(), "cdda:/2".into(), "cdda:/3".into()])
    }

    fn attach_scope(&mut self, _sink: Arc<ScopeBuffer>) {}

    fn set_event_sender(&mut self, tx: UnboundedSender<DriverEvent>) {
        *self.events.lock().unwrap() = Some(tx);
    }
}

/// Install a log subscriber once per test binary; respects RUST_LOG
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Wait for the next engine notification, failing after two seconds
pub async fn next_event(rx: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an engine event")
        .expect("event bus closed")
}

/// Wait for an event matching `pred`, discarding everything before it
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<EngineEvent>, mut pred: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}
