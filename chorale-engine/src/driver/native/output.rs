//! Audio device output
//!
//! cpal streams are not `Send`, so the stream lives on a dedicated thread
//! commanded over a channel. The audio callback drains a lock-free ring
//! the decode thread fills; it never blocks or allocates.

use crate::driver::{DriverEvent, MessageKind};
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleFormat, StreamConfig};
use ringbuf::{traits::*, HeapCons};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// State the audio callback shares with the driver
pub struct PlayClock {
    /// Frames actually delivered to the device; freezes on underrun
    pub frames_played: AtomicU64,
    /// Decode thread raises this once the stream is fully decoded
    pub eof: AtomicBool,
    finished_sent: AtomicBool,
}

impl PlayClock {
    pub fn new() -> Self {
        Self {
            frames_played: AtomicU64::new(0),
            eof: AtomicBool::new(false),
            finished_sent: AtomicBool::new(false),
        }
    }
}

enum OutputCmd {
    Pause,
    Resume,
    Shutdown,
}

/// Handle to the output thread; dropping it tears the stream down
pub struct OutputHandle {
    cmd_tx: mpsc::Sender<OutputCmd>,
    join: Option<thread::JoinHandle<()>>,
}

impl OutputHandle {
    pub fn pause(&self) {
        let _ = self.cmd_tx.send(OutputCmd::Pause);
    }

    pub fn resume(&self) {
        let _ = self.cmd_tx.send(OutputCmd::Resume);
    }
}

impl Drop for OutputHandle {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(OutputCmd::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Pick the cpal host matching an output plugin name; `None` means default
fn host_for(plugin: Option<&str>) -> Host {
    if let Some(name) = plugin {
        for id in cpal::available_hosts() {
            if id.name().eq_ignore_ascii_case(name) {
                if let Ok(host) = cpal::host_from_id(id) {
                    return host;
                }
            }
        }
        warn!("output plugin '{}' unavailable, using default host", name);
    }
    cpal::default_host()
}

fn pick_device(host: &Host, device_name: Option<&str>) -> Result<Device> {
    if let Some(name) = device_name {
        let mut devices = host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("failed to enumerate devices: {}", e)))?;
        if let Some(dev) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            info!("using requested audio device: {}", name);
            return Ok(dev);
        }
        warn!("device '{}' not found, falling back to default", name);
    }
    host.default_output_device()
        .ok_or_else(|| Error::AudioOutput("no output device available".into()))
}

/// Find a stereo f32 config, preferring the source sample rate
fn pick_config(device: &Device, sample_rate: u32) -> Result<StreamConfig> {
    let mut configs = device
        .supported_output_configs()
        .map_err(|e| Error::AudioOutput(format!("failed to get device configs: {}", e)))?;

    let exact = configs.find(|c| {
        c.channels() == 2
            && c.sample_format() == SampleFormat::F32
            && c.min_sample_rate().0 <= sample_rate
            && c.max_sample_rate().0 >= sample_rate
    });
    if let Some(c) = exact {
        return Ok(c.with_sample_rate(cpal::SampleRate(sample_rate)).config());
    }

    let fallback = device
        .default_output_config()
        .map_err(|e| Error::AudioOutput(format!("failed to get default config: {}", e)))?;
    warn!(
        "device does not support {} Hz, using {} Hz",
        sample_rate,
        fallback.sample_rate().0
    );
    Ok(fallback.config())
}

/// Spawn the output thread and start playback
///
/// Blocks until the stream is up or failed so open errors surface
/// synchronously. Samples are interleaved stereo f32; `amp` is the
/// software amplification level, 100 = unity.
pub fn start(
    plugin: Option<String>,
    device_name: Option<String>,
    sample_rate: u32,
    mut consumer: HeapCons<f32>,
    clock: Arc<PlayClock>,
    amp: Arc<AtomicU32>,
    events: Option<UnboundedSender<DriverEvent>>,
) -> Result<OutputHandle> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<OutputCmd>();
    let (init_tx, init_rx) = mpsc::channel::<Result<()>>();

    let err_events = events.clone();
    let join = thread::Builder::new()
        .name("audio-output".into())
        .spawn(move || {
            let host = host_for(plugin.as_deref());
            let device = match pick_device(&host, device_name.as_deref()) {
                Ok(d) => d,
                Err(e) => {
                    let _ = init_tx.send(Err(e));
                    return;
                }
            };
            let config = match pick_config(&device, sample_rate) {
                Ok(c) => c,
                Err(e) => {
                    let _ = init_tx.send(Err(e));
                    return;
                }
            };
            let channels = config.channels as usize;
            debug!(
                rate = config.sample_rate.0,
                channels, "opening output stream"
            );

            let stream = device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let gain = amp.load(Ordering::Relaxed) as f32 / 100.0;
                    let mut played = 0u64;
                    for frame in data.chunks_mut(channels) {
                        let mut pair = [0.0f32; 2];
                        if consumer.pop_slice(&mut pair) == 2 {
                            played += 1;
                            frame[0] = (pair[0] * gain).clamp(-1.0, 1.0);
                            if channels > 1 {
                                frame[1] = (pair[1] * gain).clamp(-1.0, 1.0);
                            }
                        } else {
                            // Underrun or drained: emit silence
                            for s in frame.iter_mut() {
                                *s = 0.0;
                            }
                        }
                    }
                    if played > 0 {
                        clock.frames_played.fetch_add(played, Ordering::Relaxed);
                    } else if clock.eof.load(Ordering::Relaxed)
                        && consumer.is_empty()
                        && !clock.finished_sent.swap(true, Ordering::SeqCst)
                    {
                        if let Some(ref tx) = events {
                            let _ = tx.send(DriverEvent::PlaybackFinished);
                        }
                    }
                },
                move |err| {
                    warn!("audio stream error: {}", err);
                    if let Some(ref tx) = err_events {
                        let _ = tx.send(DriverEvent::Message {
                            kind: MessageKind::AudioOutUnavailable,
                            explanation: Some(err.to_string()),
                            parameters: None,
                        });
                    }
                },
                None,
            );

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = init_tx
                        .send(Err(Error::AudioOutput(format!("failed to build stream: {}", e))));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = init_tx
                    .send(Err(Error::AudioOutput(format!("failed to start stream: {}", e))));
                return;
            }
            let _ = init_tx.send(Ok(()));

            // Owns the stream until shutdown
            loop {
                match cmd_rx.recv() {
                    Ok(OutputCmd::Pause) => {
                        if let Err(e) = stream.pause() {
                            warn!("failed to pause stream: {}", e);
                        }
                    }
                    Ok(OutputCmd::Resume) => {
                        if let Err(e) = stream.play() {
                            warn!("failed to resume stream: {}", e);
                        }
                    }
                    Ok(OutputCmd::Shutdown) | Err(_) => break,
                }
            }
        })
        .map_err(|e| Error::AudioOutput(format!("failed to spawn output thread: {}", e)))?;

    match init_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(Ok(())) => Ok(OutputHandle { cmd_tx, join: Some(join) }),
        Ok(Err(e)) => {
            let _ = join.join();
            Err(e)
        }
        Err(_) => Err(Error::AudioOutput("output thread did not start in time".into())),
    }
}

/// Enumerate output hosts as plugin entries
pub fn list_plugins() -> Vec<crate::driver::PluginDetails> {
    cpal::available_hosts()
        .into_iter()
        .map(|id| crate::driver::PluginDetails {
            name: id.name().to_ascii_lowercase(),
            description: format!("{} audio output", id.name()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_host_is_used_for_unknown_plugin() {
        // Must not panic, whatever hosts the platform has
        let _ = host_for(Some("no-such-plugin"));
        let _ = host_for(None);
    }

    #[test]
    fn plugin_list_names_are_lowercase() {
        for plugin in list_plugins() {
            assert_eq!(plugin.name, plugin.name.to_ascii_lowercase());
            assert!(!plugin.description.is_empty());
        }
    }

    #[test]
    fn play_clock_reports_finished_once() {
        let clock = PlayClock::new();
        clock.eof.store(true, Ordering::Relaxed);
        assert!(!clock.finished_sent.swap(true, Ordering::SeqCst));
        assert!(clock.finished_sent.swap(true, Ordering::SeqCst));
    }
}
