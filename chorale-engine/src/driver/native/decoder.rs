//! Symphonia decode source
//!
//! Wraps symphonia probing and decoding behind a pull interface the decode
//! thread drives. Samples come out as interleaved stereo f32 regardless of
//! the source layout: mono is duplicated, wider layouts are averaged down.

use crate::driver::{MessageKind, MetaKey};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo, Track};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, warn};

/// One decoded packet, interleaved stereo f32
pub struct DecodedChunk {
    pub samples: Vec<f32>,
    pub frames: usize,
}

/// Static facts about an opened stream
#[derive(Debug, Clone, Default)]
pub struct StreamFacts {
    pub sample_rate: u32,
    pub channels: u32,
    pub bit_depth: u32,
    /// kbit/s, 0 when the container does not declare one
    pub bitrate: u32,
    pub length_ms: u64,
    /// Container name, uppercased ("WAV", "FLAC", ...)
    pub system_layer: String,
}

pub struct DecodeSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    facts: StreamFacts,
    tags: HashMap<MetaKey, String>,
    sample_buf: Option<SampleBuffer<f32>>,
    src_channels: usize,
}

impl DecodeSource {
    /// Open and probe `path`, classifying failures for the message layer
    pub fn open(path: &Path) -> std::result::Result<Self, (MessageKind, Error)> {
        let file = File::open(path).map_err(|e| {
            let kind = classify_io(&e);
            (kind, Error::Open(format!("{}: {}", path.display(), e)))
        })?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if let Some(ref ext) = ext {
            hint.with_extension(ext);
        }

        let mut probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| {
                (
                    MessageKind::NoDemuxPlugin,
                    Error::Open(format!("unrecognized container: {}", e)),
                )
            })?;

        let mut tags = HashMap::new();
        if let Some(rev) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            collect_tags(rev, &mut tags);
        }

        let mut format = probed.format;
        if let Some(rev) = format.metadata().current() {
            collect_tags(rev, &mut tags);
        }

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.sample_rate.is_some())
            .cloned()
            .ok_or_else(|| {
                (
                    MessageKind::NoAudioStream,
                    Error::Open("no audio track in container".into()),
                )
            })?;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| {
                (
                    MessageKind::NoAudioHandler,
                    Error::Open(format!("no decoder for codec: {}", e)),
                )
            })?;

        let facts = facts_for(&track, ext.as_deref());
        debug!(
            rate = facts.sample_rate,
            channels = facts.channels,
            length_ms = facts.length_ms,
            layer = %facts.system_layer,
            "opened stream"
        );

        let src_channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(2);

        Ok(Self {
            format,
            decoder,
            track_id: track.id,
            facts,
            tags,
            sample_buf: None,
            src_channels,
        })
    }

    pub fn facts(&self) -> &StreamFacts {
        &self.facts
    }

    pub fn tags(&self) -> &HashMap<MetaKey, String> {
        &self.tags
    }

    /// Seek to an absolute position; resets decoder state
    pub fn seek_ms(&mut self, ms: u64) -> Result<()> {
        let time = Time::from(ms as f64 / 1000.0);
        self.format
            .seek(SeekMode::Coarse, SeekTo::Time { time, track_id: Some(self.track_id) })
            .map_err(|e| Error::Playback(format!("seek failed: {}", e)))?;
        self.decoder.reset();
        Ok(())
    }

    /// Decode the next packet; `None` at end of stream
    pub fn next_chunk(&mut self) -> Result<Option<DecodedChunk>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(Error::Decode(format!("{}", e))),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // Recoverable per symphonia contract: skip the packet
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("dropping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => return Err(Error::Decode(format!("{}", e))),
            };

            let spec = *decoded.spec();
            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }

            let buf = match self.sample_buf {
                Some(ref mut b) if b.capacity() >= frames * spec.channels.count() => b,
                _ => {
                    self.sample_buf =
                        Some(SampleBuffer::new(decoded.capacity() as u64, spec));
                    self.sample_buf.as_mut().unwrap()
                }
            };
            buf.copy_interleaved_ref(decoded);

            let samples = to_stereo(buf.samples(), self.src_channels);
            return Ok(Some(DecodedChunk { samples, frames }));
        }
    }
}

/// Map interleaved samples of any width to interleaved stereo
fn to_stereo(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        1 => {
            let mut out = Vec::with_capacity(samples.len() * 2);
            for &s in samples {
                out.push(s);
                out.push(s);
            }
            out
        }
        2 => samples.to_vec(),
        n => {
            let frames = samples.len() / n;
            let mut out = Vec::with_capacity(frames * 2);
            for frame in samples.chunks_exact(n) {
                let mut left = 0.0f32;
                let mut right = 0.0f32;
                for (i, &s) in frame.iter().enumerate() {
                    if i % 2 == 0 {
                        left += s;
                    } else {
                        right += s;
                    }
                }
                let half = n as f32 / 2.0;
                out.push(left / half);
                out.push(right / half);
            }
            out
        }
    }
}

fn facts_for(track: &Track, ext: Option<&str>) -> StreamFacts {
    let params = &track.codec_params;
    let sample_rate = params.sample_rate.unwrap_or(44100);
    let channels = params.channels.map(|c| c.count() as u32).unwrap_or(2);
    let bit_depth = params.bits_per_sample.unwrap_or(16);

    let length_ms = match (params.n_frames, params.time_base) {
        (Some(frames), Some(tb)) => {
            let t = tb.calc_time(frames);
            t.seconds * 1000 + (t.frac * 1000.0) as u64
        }
        (Some(frames), None) => frames * 1000 / sample_rate as u64,
        _ => 0,
    };

    StreamFacts {
        sample_rate,
        channels,
        bit_depth,
        bitrate: 0,
        length_ms,
        system_layer: ext.map(|e| e.to_ascii_uppercase()).unwrap_or_default(),
    }
}

fn collect_tags(rev: &MetadataRevision, out: &mut HashMap<MetaKey, String>) {
    for tag in rev.tags() {
        let key = match tag.std_key {
            Some(StandardTagKey::TrackTitle) => MetaKey::Title,
            Some(StandardTagKey::Artist) => MetaKey::Artist,
            Some(StandardTagKey::Album) => MetaKey::Album,
            Some(StandardTagKey::Comment) => MetaKey::Comment,
            Some(StandardTagKey::Genre) => MetaKey::Genre,
            Some(StandardTagKey::Date) => MetaKey::Year,
            Some(StandardTagKey::TrackNumber) => MetaKey::TrackNumber,
            _ => continue,
        };
        let value = tag.value.to_string();
        if !value.is_empty() {
            out.insert(key, value);
        }
    }
}

fn classify_io(e: &std::io::Error) -> MessageKind {
    match e.kind() {
        std::io::ErrorKind::NotFound => MessageKind::FileNotFound,
        std::io::ErrorKind::PermissionDenied => MessageKind::PermissionError,
        _ => MessageKind::InputFailed,
    }
}
