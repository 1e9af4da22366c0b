//! Local durable persistence for the weekly schedule.
//!
//! One JSON document holds the whole schedule under a versioned file name.
//! `LocalStore` is the authoritative client-side state; `DebouncedSaver`
//! wraps it with a coalescing write strategy for bursts.

mod debounce;
mod local;

pub use debounce::DebouncedSaver;
pub use local::{LocalStore, SCHEMA_VERSION};
