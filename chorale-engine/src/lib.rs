//! # Chorale playback engine core (chorale-engine)
//!
//! Translates playback requests (a media location plus timing bounds) into
//! an active audio stream with observable state, position, volume,
//! equalization and a time-aligned sample scope for visualisation.
//!
//! **Architecture:** a backend-agnostic [`engine::Engine`] drives a concrete
//! [`driver::Driver`] (the shipped one decodes with symphonia and plays
//! through cpal). Driver threads report back over a channel consumed by the
//! engine's event bridge; decoded PCM is mirrored into the
//! [`scope::ScopeBuffer`] for the visualiser.

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod scope;

pub use config::EngineSettings;
pub use engine::{Engine, MediaRequest, TrackChange};
pub use error::{Error, Result};
