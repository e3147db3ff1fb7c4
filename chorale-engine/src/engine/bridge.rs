//! Backend message translation
//!
//! Turns classified backend messages into user-facing text and keeps noisy
//! backends from flooding the notification stream: within a 10 second
//! window at most one message goes out per (kind, parameters) pair.

use crate::driver::MessageKind;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Suppression window for repeated identical messages
pub const MESSAGE_WINDOW: Duration = Duration::from_secs(10);

/// Per-engine message rate limiter
///
/// A suppressed repeat does not refresh the window, so a steady stream of
/// identical messages still surfaces once per window instead of being
/// silenced forever.
pub struct RateLimiter {
    window: Duration,
    seen: HashMap<(MessageKind, String), Instant>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self { window, seen: HashMap::new() }
    }

    /// True when the message may go out; records the emission time
    pub fn admit(&mut self, kind: MessageKind, parameters: &str, now: Instant) -> bool {
        let key = (kind, parameters.to_string());
        if let Some(&last) = self.seen.get(&key) {
            if now.duration_since(last) < self.window {
                return false;
            }
        }
        self.seen.insert(key, now);
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(MESSAGE_WINDOW)
    }
}

/// Render a backend message for the user
///
/// Returns `None` for advisory kinds that carry no explanation; those are
/// noise. Text is lightly HTML-formatted the way the notification surface
/// expects.
pub fn user_message(
    kind: MessageKind,
    explanation: Option<&str>,
    parameters: Option<&str>,
) -> Option<String> {
    let p = parameters.unwrap_or("");
    let mut body = match kind {
        MessageKind::GeneralWarning | MessageKind::Security | MessageKind::Unknown => {
            // Advisory: only worth showing when the backend explains itself
            let explanation = explanation?;
            let mut text = format!("<b>{}</b>", explanation);
            if !p.is_empty() {
                text.push_str("<br>");
                text.push_str(p);
            }
            return Some(text);
        }
        MessageKind::NoInputPlugin => {
            "No input plugin can handle this location. The protocol may be unsupported."
                .to_string()
        }
        MessageKind::NoDemuxPlugin => {
            "There is no demuxer plugin available for this media format.".to_string()
        }
        MessageKind::DemuxFailed => "Demuxing of the media failed.".to_string(),
        MessageKind::InputFailed => "The media could not be opened.".to_string(),
        MessageKind::MalformedUrl => format!("The location is malformed: <i>{}</i>", p),
        MessageKind::NoAudioHandler => {
            "No decoder is available for this audio format. Installing additional codecs may help."
                .to_string()
        }
        MessageKind::NoAudioStream => "The media contains no audio stream.".to_string(),
        MessageKind::UnknownHost => format!("The host is unknown for the url: <i>{}</i>", p),
        MessageKind::UnknownDevice => "The device name you specified seems invalid.".to_string(),
        MessageKind::NetworkUnreachable => "The network appears unreachable.".to_string(),
        MessageKind::ConnectionRefused => {
            format!("The connection was refused for the url: <i>{}</i>", p)
        }
        MessageKind::PermissionError => format!("Access was denied for the url: <i>{}</i>", p),
        MessageKind::ReadError => format!("The source cannot be read for the url: <i>{}</i>", p),
        MessageKind::FileNotFound => format!("Could not find the url: <i>{}</i>", p),
        MessageKind::AudioOutUnavailable => {
            "Audio output unavailable; the device is busy.".to_string()
        }
        MessageKind::LibraryLoadError => {
            "A problem occurred while loading a library or decoder.".to_string()
        }
    };
    if let Some(explanation) = explanation {
        if !explanation.is_empty() {
            body.push_str("<br>");
            body.push_str(explanation);
        }
    }
    Some(body)
}

/// User-facing text for a failed load
pub fn load_error_message(kind: Option<MessageKind>, url: &str) -> String {
    match kind {
        Some(kind) => user_message(kind, None, Some(url))
            .unwrap_or_else(|| format!("Could not open the media: <i>{}</i>", url)),
        None => format!("Could not open the media: <i>{}</i>", url),
    }
}
