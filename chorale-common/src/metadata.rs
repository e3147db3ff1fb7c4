//! Track metadata bundles.
//!
//! A `MetaBundle` carries everything the engine knows about the stream it is
//! playing. Bundles are emitted through the `MetaData` notification only when
//! the title or artist actually changed, so collaborators can treat every
//! emission as news.

use serde::{Deserialize, Serialize};

/// Metadata snapshot for the current stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaBundle {
    /// Original URL the metadata belongs to
    pub url: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub comment: String,
    pub genre: String,
    /// Release year or date as tagged (empty when unknown)
    pub year: String,
    /// Track number as tagged, possibly "n/total" (empty when unknown)
    pub track: String,
    /// Sample rate in Hz
    pub samplerate: u32,
    /// Bits per sample
    pub bitdepth: u32,
    /// Bitrate in kbit/s
    pub bitrate: u32,
    /// Stream length in seconds (0 when unknown)
    pub length_sec: u64,
}

impl MetaBundle {
    /// True when `other` describes the same track identity.
    ///
    /// Title and artist are the deduplication key: everything else
    /// (bitrate, sample rate) can legitimately fluctuate mid-stream.
    pub fn same_identity(&self, other: &MetaBundle) -> bool {
        self.title == other.title && self.artist == other.artist
    }
}
