//! Scope buffer: time-aligned PCM capture for visualisation
//!
//! Decode threads mirror every PCM fragment they produce into this buffer,
//! tagged with presentation timestamps (`vpts`, a 90 kHz clock). Sampling
//! walks the fragments against the engine's playback clock so the scope
//! shows what the listener is hearing *now*, not the latest decoded data.
//!
//! The buffer is a bounded queue behind a mutex: decode threads append,
//! the pruner task drops fragments whose end lies in the playback past,
//! and the owning thread samples. Only the pruner discards nodes (beyond
//! the hard capacity bound protecting against a stalled pruner).

pub mod spectrum;

use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::trace;

/// Samples in a scope block (interleaved stereo, so 256 frames)
pub const SCOPE_SIZE: usize = 512;

/// vpts ticks per second (presentation clock rate)
pub const VPTS_RATE: i64 = 90_000;

/// Hard bound on queued fragments; appenders drop the oldest beyond this
const MAX_NODES: usize = 128;

/// One decoded PCM fragment tagged with its presentation interval
#[derive(Debug, Clone)]
pub struct ScopeNode {
    /// Presentation timestamp of the first frame
    pub vpts: i64,
    /// Presentation timestamp just past the last frame
    pub vpts_end: i64,
    /// Frame count
    pub frames: usize,
    /// Channel count (1 or 2; anything else is never sampled)
    pub channels: usize,
    /// Interleaved PCM
    pub pcm: Vec<i16>,
}

struct Inner {
    nodes: VecDeque<ScopeNode>,
    /// Engine's best estimate of the playback clock, in vpts ticks
    current_vpts: i64,
    /// Fixed-point (<<16) vpts ticks per PCM sample
    pts_per_sample: i64,
    last_scope: [i16; SCOPE_SIZE],
}

/// Time-indexed queue of decoded PCM fragments
pub struct ScopeBuffer {
    inner: Mutex<Inner>,
}

impl ScopeBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: VecDeque::new(),
                current_vpts: 0,
                pts_per_sample: 0,
                last_scope: [0; SCOPE_SIZE],
            }),
        }
    }

    /// Fixed-point (<<16) vpts ticks per sample for the current stream
    pub fn set_pts_per_sample(&self, pts_per_sample: i64) {
        self.inner.lock().unwrap().pts_per_sample = pts_per_sample;
    }

    /// Append a fragment (decode-thread side)
    pub fn push(&self, node: ScopeNode) {
        let mut inner = self.inner.lock().unwrap();
        if inner.nodes.len() >= MAX_NODES {
            // Pruner has fallen behind; shed the oldest fragment
            inner.nodes.pop_front();
            trace!("scope buffer at capacity, dropped oldest fragment");
        }
        inner.nodes.push_back(node);
    }

    /// Queued fragment count
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every fragment that ended before `cutoff`
    ///
    /// The pruner passes the playback clock while playing or paused and
    /// `i64::MAX` otherwise, which drains the queue. The cutoff also
    /// re-anchors the sampling clock, correcting any drift the sampler
    /// accumulated by advancing fragment-by-fragment.
    pub fn prune(&self, cutoff: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.current_vpts = cutoff;
        let before = inner.nodes.len();
        inner.nodes.retain(|n| n.vpts_end >= cutoff);
        let dropped = before - inner.nodes.len();
        if dropped > 0 {
            trace!(dropped, remaining = inner.nodes.len(), "pruned scope fragments");
        }
    }

    /// Sample a 512-entry interleaved scope aligned to the playback clock
    ///
    /// When `playing` is false, no fragment covers the clock, or the stream
    /// has more than two channels, the previous scope is returned unchanged.
    /// Mono input is duplicated across both interleaved slots.
    pub fn sample(&self, playing: bool) -> [i16; SCOPE_SIZE] {
        let mut inner = self.inner.lock().unwrap();
        if !playing || inner.pts_per_sample <= 0 {
            return inner.last_scope;
        }
        if let Some(newest) = inner.nodes.back() {
            if newest.channels == 0 || newest.channels > 2 {
                return inner.last_scope;
            }
        }

        let mut out = inner.last_scope;
        let mut filled = 0usize;

        while filled < SCOPE_SIZE {
            // The fragment with the greatest vpts not after the clock
            let mut best: Option<usize> = None;
            for (i, node) in inner.nodes.iter().enumerate() {
                if node.vpts <= inner.current_vpts
                    && best.map_or(true, |b| node.vpts > inner.nodes[b].vpts)
                {
                    best = Some(i);
                }
            }
            let Some(best) = best else { break };
            let node = &inner.nodes[best];
            if node.vpts_end < inner.current_vpts {
                break;
            }

            // Offset of the clock within this fragment, on a channel boundary
            let diff = inner.current_vpts - node.vpts;
            let mut off = ((diff << 16) / inner.pts_per_sample) as usize;
            off -= off % node.channels;
            let mut frame = off / node.channels;
            let next_vpts = node.vpts_end + 1;

            while frame < node.frames && filled < SCOPE_SIZE {
                for c in 0..node.channels {
                    let s = node.pcm[frame * node.channels + c];
                    out[filled] = s;
                    filled += 1;
                    if node.channels == 1 && filled < SCOPE_SIZE {
                        out[filled] = s;
                        filled += 1;
                    }
                    if filled >= SCOPE_SIZE {
                        break;
                    }
                }
                frame += 1;
            }

            // Step just past this fragment so it is never picked twice
            inner.current_vpts = next_vpts;
        }

        if filled > 0 {
            inner.last_scope = out;
        }
        inner.last_scope
    }

    /// Current estimate of the playback clock, in vpts ticks
    pub fn current_vpts(&self) -> i64 {
        self.inner.lock().unwrap().current_vpts
    }
}

impl Default for ScopeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-point (<<16) vpts ticks per sample for a sample rate
pub fn pts_per_sample(sample_rate: u32) -> i64 {
    if sample_rate == 0 {
        return 0;
    }
    (VPTS_RATE << 16) / sample_rate as i64
}

/// vpts tick for an absolute frame position at a sample rate
pub fn frames_to_vpts(frames: u64, sample_rate: u32) -> i64 {
    if sample_rate == 0 {
        return 0;
    }
    (frames as i128 * VPTS_RATE as i128 / sample_rate as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_node(vpts: i64, vpts_end: i64, frames: usize, value: i16) -> ScopeNode {
        ScopeNode {
            vpts,
            vpts_end,
            frames,
            channels: 2,
            pcm: vec![value; frames * 2],
        }
    }

    #[test]
    fn test_pts_per_sample_44100() {
        // 90000/44100 samples per tick, <<16
        let pps = pts_per_sample(44_100);
        assert_eq!(pps, (90_000i64 << 16) / 44_100);
        // Round-tripping one second of frames lands on one second of ticks
        assert_eq!(frames_to_vpts(44_100, 44_100), VPTS_RATE);
    }

    #[test]
    fn test_sample_returns_exactly_512() {
        let buf = ScopeBuffer::new();
        buf.set_pts_per_sample(pts_per_sample(44_100));
        buf.push(stereo_node(0, frames_to_vpts(512, 44_100), 512, 99));
        let scope = buf.sample(true);
        assert_eq!(scope.len(), SCOPE_SIZE);
        assert!(scope.iter().all(|&s| s == 99));
    }

    #[test]
    fn test_mono_is_duplicated() {
        let buf = ScopeBuffer::new();
        buf.set_pts_per_sample(pts_per_sample(44_100));
        let frames = 512;
        buf.push(ScopeNode {
            vpts: 0,
            vpts_end: frames_to_vpts(frames as u64, 44_100),
            frames,
            channels: 1,
            pcm: (0..frames as i16).collect(),
        });
        let scope = buf.sample(true);
        for pair in scope.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }

    #[test]
    fn test_not_playing_returns_previous_scope() {
        let buf = ScopeBuffer::new();
        buf.set_pts_per_sample(pts_per_sample(44_100));
        buf.push(stereo_node(0, frames_to_vpts(512, 44_100), 512, 7));
        let first = buf.sample(true);
        assert!(first.iter().all(|&s| s == 7));
        // Paused: previous scope unchanged even though data exists
        buf.push(stereo_node(
            frames_to_vpts(512, 44_100) + 1,
            frames_to_vpts(1024, 44_100),
            512,
            -7,
        ));
        let second = buf.sample(false);
        assert_eq!(first, second);
    }

    #[test]
    fn test_multichannel_returns_previous_scope() {
        let buf = ScopeBuffer::new();
        buf.set_pts_per_sample(pts_per_sample(44_100));
        buf.push(ScopeNode {
            vpts: 0,
            vpts_end: 1000,
            frames: 64,
            channels: 6,
            pcm: vec![1; 64 * 6],
        });
        let scope = buf.sample(true);
        assert!(scope.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_sample_stitches_consecutive_fragments() {
        let buf = ScopeBuffer::new();
        buf.set_pts_per_sample(pts_per_sample(44_100));
        let mid = frames_to_vpts(128, 44_100);
        let end = frames_to_vpts(512, 44_100);
        buf.push(stereo_node(0, mid, 128, 5));
        buf.push(stereo_node(mid + 1, end, 384, 9));
        let scope = buf.sample(true);
        assert!(scope[..256].iter().all(|&s| s == 5));
        assert!(scope[256..].iter().all(|&s| s == 9));
        // Both fragments consumed in one pass
        assert_eq!(buf.current_vpts(), end + 1);
    }

    #[test]
    fn test_sampling_advances_clock_past_fragment() {
        let buf = ScopeBuffer::new();
        buf.set_pts_per_sample(pts_per_sample(44_100));
        let end = frames_to_vpts(256, 44_100);
        buf.push(stereo_node(0, end, 256, 1));
        buf.sample(true);
        assert_eq!(buf.current_vpts(), end + 1);
    }

    #[test]
    fn test_prune_drops_past_fragments_only() {
        let buf = ScopeBuffer::new();
        buf.push(stereo_node(0, 999, 16, 0));
        buf.push(stereo_node(1000, 1999, 16, 0));
        buf.push(stereo_node(2000, 2999, 16, 0));
        buf.prune(1500);
        assert_eq!(buf.len(), 2);
        buf.prune(i64::MAX);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_capacity_bound_sheds_oldest() {
        let buf = ScopeBuffer::new();
        for i in 0..(MAX_NODES + 10) as i64 {
            buf.push(stereo_node(i * 100, i * 100 + 99, 4, 0));
        }
        assert_eq!(buf.len(), MAX_NODES);
    }

    #[test]
    fn test_sampling_spans_fragments() {
        let buf = ScopeBuffer::new();
        buf.set_pts_per_sample(pts_per_sample(44_100));
        let half = frames_to_vpts(128, 44_100);
        let full = frames_to_vpts(256, 44_100);
        buf.push(stereo_node(0, half, 128, 1));
        buf.push(stereo_node(half + 1, full, 128, 2));
        let scope = buf.sample(true);
        assert_eq!(scope[0], 1);
        assert_eq!(scope[SCOPE_SIZE - 1], 2);
    }
}
