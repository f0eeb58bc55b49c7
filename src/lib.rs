//! Slot conflict and tenant quota engine for multi-tenant restaurant reservations.
//!
//! The [`engine::Engine`] books tables without double-booking, derives live table
//! status, searches for alternative slots and enforces per-tenant plan ceilings
//! through [`quota::QuotaManager`]. Storage sits behind the [`store::Store`] seam;
//! [`store::MemoryStore`] is the bundled implementation, optionally backed by a
//! write-ahead log.

pub mod audit;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod quota;
pub mod store;
pub mod tz;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{AvailabilityQuery, BookingRequest, Engine, EngineError};
