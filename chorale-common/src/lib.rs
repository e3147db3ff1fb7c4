//! # Chorale shared types (chorale-common)
//!
//! Contract types shared between the playback engine core and its
//! collaborators: the engine state enum, the notification event set, the
//! broadcast `EventBus`, track metadata bundles and time-unit helpers.
//!
//! Nothing in this crate touches an audio library; it is the surface the
//! rest of the application programs against.

pub mod error;
pub mod events;
pub mod metadata;
pub mod time;

pub use error::{Error, Result};
pub use events::{EngineEvent, EngineState, EventBus};
pub use metadata::MetaBundle;
