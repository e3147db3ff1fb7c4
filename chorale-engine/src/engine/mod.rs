//! Engine state machine
//!
//! Translates playback commands into driver calls while tracking the
//! logical state {Empty, Idle, Playing, Paused} and emitting notifications
//! over the event bus. Driver threads report back through a channel that a
//! spawned bridge task drains; a second task prunes the scope buffer
//! against the playback clock once per second.

pub mod bridge;
pub mod output;

use crate::config::{EngineSettings, EQ_BANDS};
use crate::driver::native::NativeDriver;
use crate::driver::{Driver, DriverEvent, MessageKind, MetaKey, StreamInfoKey};
use crate::error::{Error, Result};
use crate::scope::{ScopeBuffer, SCOPE_SIZE};
use bridge::RateLimiter;
use chorale_common::time::NSEC_PER_MSEC;
use chorale_common::{EngineEvent, EngineState, EventBus, MetaBundle};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, info, trace, warn};

/// Some formats report nonsense positions transiently after a seek;
/// sample up to this many times 100 ms apart until the reading settles
const POSITION_ATTEMPTS: usize = 4;
const POSITION_RETRY: Duration = Duration::from_millis(100);

const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_BUS_CAPACITY: usize = 256;

/// Extensions that name images, never audio
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "ilbm", "iff"];
/// Extensions that name subtitle or text files
const SUBTITLE_EXTENSIONS: &[&str] = &["asc", "txt", "sub", "srt", "smi", "ssa"];

/// How the track came to change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackChange {
    #[default]
    Auto,
    Manual,
}

/// One playback request with optional timing bounds
#[derive(Debug, Clone, Default)]
pub struct MediaRequest {
    /// Resolved media location handed to the driver
    pub url: String,
    /// Location as the caller referred to it, before any resolution
    pub original_url: String,
    pub change: TrackChange,
    /// Stop at the end bound instead of crossfading past it
    pub force_end: bool,
    pub begin_ns: u64,
    pub end_ns: u64,
}

impl MediaRequest {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self { original_url: url.clone(), url, ..Default::default() }
    }

    fn validate(&self) -> Result<()> {
        if self.end_ns != 0 && self.end_ns <= self.begin_ns {
            return Err(Error::InvalidTiming(format!(
                "end bound {} ns does not follow begin bound {} ns",
                self.end_ns, self.begin_ns
            )));
        }
        Ok(())
    }
}

pub struct Engine {
    driver: Arc<Mutex<Box<dyn Driver>>>,
    bus: EventBus,
    state: Arc<RwLock<EngineState>>,
    settings: Arc<RwLock<EngineSettings>>,
    scope_buffer: Arc<ScopeBuffer>,
    request: Arc<RwLock<Option<MediaRequest>>>,
    /// Last metadata bundle sent, for title/artist dedup
    last_bundle: Arc<RwLock<Option<MetaBundle>>>,
    /// Software postamp multiplier derived from the equalizer preamp
    preamp: Arc<RwLock<f64>>,
    limiter: Arc<Mutex<RateLimiter>>,
    /// Decodable extension cache, computed on first CanDecode
    extensions: Arc<RwLock<Option<Vec<String>>>>,
    /// Taken by init() when the bridge task starts
    event_rx: Arc<Mutex<Option<UnboundedReceiver<DriverEvent>>>>,
    running: Arc<RwLock<bool>>,
}

impl Engine {
    /// Create an engine over the native backend
    pub fn new(settings: EngineSettings) -> Self {
        let driver = Box::new(NativeDriver::new(settings.effective_output()));
        Self::with_driver(settings, driver)
    }

    /// Create an engine over a caller-supplied backend
    pub fn with_driver(settings: EngineSettings, mut driver: Box<dyn Driver>) -> Self {
        let scope_buffer = Arc::new(ScopeBuffer::new());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        driver.attach_scope(Arc::clone(&scope_buffer));
        driver.set_event_sender(event_tx);

        Self {
            driver: Arc::new(Mutex::new(driver)),
            bus: EventBus::new(EVENT_BUS_CAPACITY),
            state: Arc::new(RwLock::new(EngineState::Empty)),
            settings: Arc::new(RwLock::new(settings)),
            scope_buffer,
            request: Arc::new(RwLock::new(None)),
            last_bundle: Arc::new(RwLock::new(None)),
            preamp: Arc::new(RwLock::new(1.0)),
            limiter: Arc::new(Mutex::new(RateLimiter::default())),
            extensions: Arc::new(RwLock::new(None)),
            event_rx: Arc::new(Mutex::new(Some(event_rx))),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Subscribe to engine notifications
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Validate the configured output, push device and equalizer settings
    /// down to the backend, and start the bridge and pruner tasks
    pub async fn init(&self) -> Result<()> {
        *self.running.write().await = true;

        let settings = self.settings.read().await.clone();
        settings.validate()?;
        {
            let mut driver = self.driver.lock().await;
            let wanted = settings.effective_output();
            if wanted != crate::config::AUTO_OUTPUT
                && !output::valid_output(driver.as_ref(), wanted)
            {
                // Invalid output plugin is recoverable: the backend falls
                // back to automatic detection
                warn!(output = wanted, "output plugin not found, using automatic detection");
            }
            output::apply_device(driver.as_mut(), &settings.device);
        }
        self.apply_audio_settings(&settings).await;

        if let Some(rx) = self.event_rx.lock().await.take() {
            let engine = self.clone_handles();
            tokio::spawn(async move {
                engine.bridge_loop(rx).await;
            });
        }

        let engine = self.clone_handles();
        tokio::spawn(async move {
            engine.prune_loop().await;
        });

        info!("engine initialised");
        Ok(())
    }

    /// Close the current stream and open `request` in its place
    ///
    /// On success the engine is Idle; on failure an `Error` notification
    /// goes out and the engine falls back to Empty.
    pub async fn load(&self, request: MediaRequest) -> Result<()> {
        request.validate()?;
        debug!(url = %request.url, "loading stream");

        let mut driver = self.driver.lock().await;
        if let Err(e) = driver.open(&request.url) {
            let kind = driver.take_error();
            drop(driver);
            self.fail_load(kind, &request.url).await;
            return Err(e);
        }

        let has_audio = driver.stream_info(StreamInfoKey::HasAudio) != 0;
        let handled = driver.stream_info(StreamInfoKey::AudioHandled) != 0;
        if !has_audio || !handled {
            driver.close();
            drop(driver);
            let kind = if has_audio {
                MessageKind::NoAudioHandler
            } else {
                MessageKind::NoAudioStream
            };
            self.fail_load(Some(kind), &request.url).await;
            return Err(Error::Open(format!("no usable audio in {}", request.url)));
        }
        // The backend may announce metadata during open. Publish the new
        // request and the Idle transition before releasing the driver lock:
        // the bridge needs that lock to build a bundle, so MetaData cannot
        // overtake StateChanged or carry the previous URL.
        *self.request.write().await = Some(request);
        *self.last_bundle.write().await = None;
        self.set_state(EngineState::Idle).await;
        drop(driver);

        // The backend loses filter state across open; push it back down
        let settings = self.settings.read().await.clone();
        self.apply_audio_settings(&settings).await;
        Ok(())
    }

    async fn fail_load(&self, kind: Option<MessageKind>, url: &str) {
        let message = bridge::load_error_message(kind, url);
        self.bus.emit_lossy(EngineEvent::error(message));
        self.set_state(EngineState::Empty).await;
    }

    /// Start playback `offset_ns` into the loaded stream
    pub async fn play(&self, offset_ns: u64) -> Result<()> {
        let (begin_ns, url) = {
            let request = self.request.read().await;
            match request.as_ref() {
                Some(r) => (r.begin_ns, r.url.clone()),
                None => (0, String::new()),
            }
        };
        let offset_ms = (begin_ns + offset_ns) / NSEC_PER_MSEC;

        let mut driver = self.driver.lock().await;
        if !driver.is_open() {
            return Err(Error::InvalidState("play without a loaded stream".into()));
        }
        if let Err(e) = driver.play(offset_ms) {
            let kind = driver.take_error();
            drop(driver);
            warn!("play failed: {}", e);
            self.fail_load(kind, &url).await;
            return Err(e);
        }
        drop(driver);
        self.set_state(EngineState::Playing).await;
        Ok(())
    }

    /// No-op unless currently playing
    pub async fn pause(&self) {
        if *self.state.read().await != EngineState::Playing {
            return;
        }
        {
            let mut driver = self.driver.lock().await;
            driver.set_speed(crate::driver::Speed::Pause);
            driver.release_device();
        }
        self.set_state(EngineState::Paused).await;
    }

    /// No-op unless currently paused
    pub async fn unpause(&self) {
        if *self.state.read().await != EngineState::Paused {
            return;
        }
        self.driver.lock().await.set_speed(crate::driver::Speed::Normal);
        self.set_state(EngineState::Playing).await;
    }

    /// Jump to `offset_ns`; keeps the paused speed when paused.
    /// Silently ignored when no stream is loaded.
    pub async fn seek(&self, offset_ns: u64) -> Result<()> {
        let state = *self.state.read().await;
        if state == EngineState::Empty {
            return Ok(());
        }
        let begin_ns = self
            .request
            .read()
            .await
            .as_ref()
            .map(|r| r.begin_ns)
            .unwrap_or(0);
        let offset_ms = (begin_ns + offset_ns) / NSEC_PER_MSEC;

        let mut driver = self.driver.lock().await;
        driver.play(offset_ms)?;
        if state == EngineState::Paused {
            driver.set_speed(crate::driver::Speed::Pause);
        }
        drop(driver);
        if state != EngineState::Paused {
            self.set_state(EngineState::Playing).await;
        }
        Ok(())
    }

    /// Stop and close the stream, returning to Empty
    ///
    /// `stop_after` is carried in the command contract for callers that
    /// distinguish stop-after-current from immediate stop; the engine
    /// itself treats both the same.
    pub async fn stop(&self, stop_after: bool) {
        trace!(stop_after, "stop requested");
        {
            let mut driver = self.driver.lock().await;
            driver.stop();
            driver.release_device();
            driver.close();
        }
        *self.request.write().await = None;
        self.set_state(EngineState::Empty).await;
    }

    /// Set software volume 0..=100; the equalizer preamp rides on top
    pub async fn set_volume(&self, volume: u32) {
        let volume = volume.min(100);
        self.settings.write().await.volume = volume;
        let preamp = *self.preamp.read().await;
        let amp = (volume as f64 * preamp).round() as u32;
        self.driver.lock().await.set_amp_level(amp);
        debug!(volume, amp, "volume applied");
    }

    /// Remap preamp and band gains (-100..=100) into the backend range
    /// and apply them
    pub async fn set_equalizer_parameters(&self, preamp: i32, gains: &[i32]) {
        {
            let mut driver = self.driver.lock().await;
            for (band, &gain) in gains.iter().take(EQ_BANDS).enumerate() {
                // Half-up rounding keeps the usable range at 1..=200 and
                // reserves 0 for the disable sentinel gain of -101
                let param = (gain as f64 * 0.995 + 100.5).floor() as i32;
                driver.set_eq_band(band, param);
            }
        }
        let p = preamp as f64;
        *self.preamp.write().await = (p - 0.1 * p + 100.0) / 100.0;
        let volume = self.settings.read().await.volume;
        self.set_volume(volume).await;
    }

    /// Toggle the equalizer; disabling pushes every band out of range so
    /// the backend bypasses them, and resets the preamp
    pub async fn set_equalizer_enabled(&self, enabled: bool) {
        self.settings.write().await.equalizer_enabled = enabled;
        if enabled {
            let settings = self.settings.read().await.clone();
            self.set_equalizer_parameters(settings.equalizer_preamp, &settings.equalizer_gains)
                .await;
        } else {
            self.set_equalizer_parameters(0, &[-101; EQ_BANDS]).await;
        }
    }

    /// Time-aligned playback scope, 512 interleaved samples
    pub async fn scope(&self) -> [i16; SCOPE_SIZE] {
        let playing = *self.state.read().await == EngineState::Playing;
        self.scope_buffer.sample(playing)
    }

    /// Current playback position in nanoseconds
    ///
    /// May block for up to ~300 ms right after a seek while the reading
    /// settles. A settled sample also refreshes metadata opportunistically.
    pub async fn position_ns(&self) -> u64 {
        if *self.state.read().await == EngineState::Empty {
            return 0;
        }
        let mut time_ms = 0;
        for attempt in 0..POSITION_ATTEMPTS {
            time_ms = self.driver.lock().await.pos_length().time_ms;
            if time_ms > 0 {
                self.refresh_metadata().await;
                break;
            }
            if attempt + 1 < POSITION_ATTEMPTS {
                sleep(POSITION_RETRY).await;
            }
        }
        time_ms * NSEC_PER_MSEC
    }

    /// Known bounded length in nanoseconds; 0 when the caller should fall
    /// back to container-declared metadata
    pub async fn length_ns(&self) -> u64 {
        let request = self.request.read().await.clone();
        let Some(request) = request else { return 0 };
        if request.end_ns > request.begin_ns {
            return request.end_ns - request.begin_ns;
        }
        // Local VBR streams report unreliable lengths
        if is_local_url(&request.url) {
            return 0;
        }
        self.driver.lock().await.pos_length().length_ms * NSEC_PER_MSEC
    }

    /// Whether the engine expects to decode `url`, judged by extension
    pub async fn can_decode(&self, url: &str) -> bool {
        if url_scheme(url) == Some("cdda") {
            return true;
        }
        let extensions = self.valid_extensions().await;

        let name = url.rsplit('/').next().unwrap_or(url);
        let name = name.split(['?', '#']).next().unwrap_or(name).to_ascii_lowercase();
        // Partial-download artefact
        let name = name.strip_suffix(".part").unwrap_or(&name);
        match name.rsplit_once('.') {
            Some((_, ext)) => extensions.iter().any(|e| e == ext),
            None => false,
        }
    }

    async fn valid_extensions(&self) -> Vec<String> {
        if let Some(ref cached) = *self.extensions.read().await {
            return cached.clone();
        }
        let mut extensions: Vec<String> = self
            .driver
            .lock()
            .await
            .file_extensions()
            .into_iter()
            .filter(|e| {
                !IMAGE_EXTENSIONS.contains(&e.as_str())
                    && !SUBTITLE_EXTENSIONS.contains(&e.as_str())
            })
            .collect();
        if !extensions.iter().any(|e| e == "m4a") {
            extensions.push("m4a".to_string());
        }
        *self.extensions.write().await = Some(extensions.clone());
        extensions
    }

    /// Probe a location for metadata without disturbing playback
    pub async fn metadata_for_url(&self, url: &str) -> Result<MetaBundle> {
        let probe = self.driver.lock().await.probe(url)?;
        let mut bundle = probe.meta;
        fixup_disc_metadata(&mut bundle, &probe.system_layer, url, probe.channels);
        Ok(bundle)
    }

    /// Enumerate the playable tracks of an audio CD
    pub async fn audio_cd_contents(&self, device: Option<&str>) -> Vec<String> {
        let mut driver = self.driver.lock().await;
        if let Some(device) = device {
            driver.register_config("media.audio_cd.device", device);
        }
        driver.autoplay_mrls("CD").unwrap_or_default()
    }

    /// Selectable output plugins, automatic entry first
    pub async fn outputs_list(&self) -> Vec<output::OutputDetails> {
        let driver = self.driver.lock().await;
        output::outputs_list(driver.as_ref())
    }

    /// Re-read settings after the surrounding application changed them
    ///
    /// Output plugin changes take effect on the next engine init; device,
    /// equalizer, and volume apply immediately.
    pub async fn reload_settings(&self, settings: EngineSettings) -> Result<()> {
        settings.validate()?;
        let previous = self.settings.read().await.output.clone();
        if previous != settings.output {
            warn!(
                from = %previous,
                to = %settings.output,
                "output plugin change requires engine re-init"
            );
        }
        {
            let mut driver = self.driver.lock().await;
            output::apply_device(driver.as_mut(), &settings.device);
        }
        *self.settings.write().await = settings.clone();
        self.apply_audio_settings(&settings).await;
        Ok(())
    }

    /// Stop playback and wind down the background tasks
    pub async fn shutdown(&self) {
        *self.running.write().await = false;
        self.stop(false).await;
        info!("engine shut down");
    }

    async fn apply_audio_settings(&self, settings: &EngineSettings) {
        if settings.equalizer_enabled {
            self.set_equalizer_parameters(settings.equalizer_preamp, &settings.equalizer_gains)
                .await;
        } else {
            self.set_equalizer_parameters(0, &[-101; EQ_BANDS]).await;
        }
        self.set_volume(settings.volume).await;
    }

    async fn set_state(&self, new: EngineState) {
        let mut state = self.state.write().await;
        if *state != new {
            debug!(from = ?*state, to = ?new, "state transition");
            *state = new;
            drop(state);
            self.bus.emit_lossy(EngineEvent::state_changed(new));
        }
    }

    /// Fetch the current bundle and emit MetaData when title or artist
    /// changed since the last emission
    async fn refresh_metadata(&self) {
        let bundle = {
            let driver = self.driver.lock().await;
            if !driver.is_open() {
                return;
            }
            let url = self
                .request
                .read()
                .await
                .as_ref()
                .map(|r| r.url.clone())
                .unwrap_or_default();
            let meta = |key| driver.meta_info(key).unwrap_or_default();
            let mut bundle = MetaBundle {
                url: url.clone(),
                title: meta(MetaKey::Title),
                artist: meta(MetaKey::Artist),
                album: meta(MetaKey::Album),
                comment: meta(MetaKey::Comment),
                genre: meta(MetaKey::Genre),
                year: meta(MetaKey::Year),
                track: meta(MetaKey::TrackNumber),
                samplerate: driver.stream_info(StreamInfoKey::SampleRate),
                bitdepth: driver.stream_info(StreamInfoKey::BitDepth),
                bitrate: driver.stream_info(StreamInfoKey::Bitrate),
                length_sec: driver.pos_length().length_ms / 1000,
            };
            let layer = driver.meta_info(MetaKey::SystemLayer).unwrap_or_default();
            let channels = driver.stream_info(StreamInfoKey::Channels);
            fixup_disc_metadata(&mut bundle, &layer, &url, channels);
            bundle
        };

        let mut last = self.last_bundle.write().await;
        let changed = last.as_ref().map(|l| !l.same_identity(&bundle)).unwrap_or(true);
        if changed {
            *last = Some(bundle.clone());
            drop(last);
            self.bus.emit_lossy(EngineEvent::metadata(bundle));
        }
    }

    /// Drain driver events until the channel closes
    async fn bridge_loop(&self, mut rx: UnboundedReceiver<DriverEvent>) {
        debug!("event bridge started");
        while let Some(event) = rx.recv().await {
            if !*self.running.read().await {
                break;
            }
            match event {
                DriverEvent::PlaybackFinished => {
                    debug!("stream played to its end");
                    self.bus.emit_lossy(EngineEvent::track_ended());
                }
                DriverEvent::MetaInfoChanged | DriverEvent::SetTitle => {
                    self.refresh_metadata().await;
                }
                DriverEvent::Progress { description, percent } => {
                    self.bus
                        .emit_lossy(EngineEvent::status_text(format!("{} {}%", description, percent)));
                }
                DriverEvent::Redirect { mrl } => {
                    self.bus
                        .emit_lossy(EngineEvent::status_text(format!("Redirecting to: {}", mrl)));
                    let original = self
                        .request
                        .read()
                        .await
                        .as_ref()
                        .map(|r| r.original_url.clone())
                        .unwrap_or_else(|| mrl.clone());
                    let request = MediaRequest {
                        url: mrl,
                        original_url: original,
                        change: TrackChange::Auto,
                        force_end: false,
                        begin_ns: 0,
                        end_ns: 0,
                    };
                    if self.load(request).await.is_ok() {
                        if let Err(e) = self.play(0).await {
                            warn!("redirected play failed: {}", e);
                        }
                    }
                }
                DriverEvent::Message { kind, explanation, parameters } => {
                    if kind == MessageKind::AudioOutUnavailable {
                        self.set_state(EngineState::Empty).await;
                    }
                    let params = parameters.clone().unwrap_or_default();
                    if let Some(body) =
                        bridge::user_message(kind, explanation.as_deref(), parameters.as_deref())
                    {
                        let admitted =
                            self.limiter.lock().await.admit(kind, &params, Instant::now());
                        if admitted {
                            self.bus.emit_lossy(EngineEvent::info_message(body));
                        } else {
                            trace!(?kind, "suppressed repeated backend message");
                        }
                    }
                }
            }
        }
        debug!("event bridge stopped");
    }

    /// Once per second, drop scope fragments the clock has passed
    async fn prune_loop(&self) {
        let mut tick = interval(PRUNE_INTERVAL);
        loop {
            tick.tick().await;
            if !*self.running.read().await {
                break;
            }
            let state = *self.state.read().await;
            let cutoff = if matches!(state, EngineState::Playing | EngineState::Paused) {
                self.driver.lock().await.clock_vpts()
            } else {
                // Nothing is playing: drain the queue
                i64::MAX
            };
            self.scope_buffer.prune(cutoff);
        }
        debug!("pruner stopped");
    }

    /// Clone handles for spawned tasks
    fn clone_handles(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            bus: self.bus.clone(),
            state: Arc::clone(&self.state),
            settings: Arc::clone(&self.settings),
            scope_buffer: Arc::clone(&self.scope_buffer),
            request: Arc::clone(&self.request),
            last_bundle: Arc::clone(&self.last_bundle),
            preamp: Arc::clone(&self.preamp),
            limiter: Arc::clone(&self.limiter),
            extensions: Arc::clone(&self.extensions),
            event_rx: Arc::clone(&self.event_rx),
            running: Arc::clone(&self.running),
        }
    }
}

/// Synthesize the fields disc formats leave blank
///
/// CDDA and WAV containers rarely declare a bitrate; derive it from the
/// stream facts. CDDA tracks without a title get a synthetic one.
fn fixup_disc_metadata(bundle: &mut MetaBundle, system_layer: &str, url: &str, channels: u32) {
    if system_layer != "CDDA" && system_layer != "WAV" {
        return;
    }
    if bundle.bitrate == 0 {
        bundle.bitrate = bundle.samplerate * bundle.bitdepth * channels / 1000;
    }
    if system_layer == "CDDA" && bundle.title.is_empty() {
        let file_name = url.rsplit('/').next().unwrap_or(url);
        bundle.title = format!("Track {}", file_name);
        bundle.album = "AudioCD".to_string();
    }
}

fn url_scheme(url: &str) -> Option<&str> {
    let (scheme, _) = url.split_once(':')?;
    if scheme.len() > 1 && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-')
    {
        Some(scheme)
    } else {
        None
    }
}

fn is_local_url(url: &str) -> bool {
    matches!(url_scheme(url), None | Some("file"))
}
