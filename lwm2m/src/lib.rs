//! LwM2M endpoint engine
//!
//! Device-management engine for constrained endpoints: an object registry,
//! an operation dispatcher, per-server registration state machines and a
//! notification batcher, behind one lock-guarded context.
//!
//! # Architecture
//!
//! This library is organized as a workspace with multiple crates:
//!
//! - `lwm2m-core`: errors, status codes, paths, values, events and clocks
//! - `lwm2m-registration`: per-server registration state machine and retry policy
//! - `lwm2m-interface`: object callback contract and the Device, Server and
//!   Generic Sensor objects
//! - `lwm2m-engine`: registry, dispatcher, batcher, observations and the
//!   async engine handle
//!
//! Wire encoding and sockets stay outside: the engine hands every exchange
//! to a `Transport` implementation and accepts decoded requests through
//! `Engine::dispatch`.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use lwm2m::engine::{Engine, EngineConfig, Transport};
//! use lwm2m::MonotonicClock;
//!
//! # async fn start(transport: Arc<dyn Transport>) -> lwm2m::Lwm2mResult<()> {
//! let engine = Engine::new(transport, Arc::new(MonotonicClock::new()));
//! engine.configure(EngineConfig::new("node-1"), None, None).await?;
//! # Ok(())
//! # }
//! ```

// Re-export core types
pub use lwm2m_core::{
    CallbackEventListener, Clock, Event, EventListener, Lwm2mError, Lwm2mResult, ManualClock,
    MonotonicClock, Operation, Status, Timestamp,
};
pub use lwm2m_core::datatypes::*;
pub use lwm2m_core::uri::*;

// Re-export engine API
pub mod engine {
    pub use lwm2m_engine::*;
}

// Re-export object interface
pub mod interface {
    pub use lwm2m_interface::*;
}

// Re-export registration state machine
pub mod registration {
    pub use lwm2m_registration::*;
}
