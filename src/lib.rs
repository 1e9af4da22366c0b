//! shiftsync - offline-first schedule sync engine.
//!
//! Client-side data layer for field-service scheduling: a durable local
//! store holds the full weekly schedule, a memory cache fronts it for
//! reads, and mutations apply locally first before a background sync
//! client pushes them to the remote system of record with retry and
//! backoff. A realtime pipeline ingests remote changes without creating
//! feedback loops, and a pure stats module derives weekly pay and hours
//! aggregates.
//!
//! The remote is abstracted behind [`remote::RemoteBackend`]; the crate
//! ships an HTTP implementation and an in-memory one for tests and
//! offline development. [`engine::ScheduleEngine`] is the single entry
//! point tying the layers together.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod realtime;
pub mod remote;
pub mod stats;
pub mod store;

pub use config::EngineConfig;
pub use engine::{EngineStatus, ScheduleEngine};
pub use error::EngineError;
pub use models::{
    EntryPatch, EntryStatus, PaymentType, ScheduleEntry, ScheduleStats, WeeklySchedule,
};
pub use realtime::ChannelState;
pub use remote::{HttpBackend, HttpBackendConfig, MemoryBackend, RemoteBackend};
