//! Engine module for the LwM2M endpoint engine
//!
//! This crate ties the layers together: it owns the registered objects,
//! routes management operations to them, batches change notifications and
//! drives one registration machine per configured server.
//!
//! # Layout
//!
//! - `registry`: object definitions, handlers and instance sets
//! - `dispatcher`: validation and grouping of management operations
//! - `batcher`: depth-counted notification lock with marker deduplication
//! - `observe`: observations and their notification attributes
//! - `state`: the guarded `EngineState` every entry point works on
//! - `engine`: the shareable async `Engine` handle and its step loop
//! - `transport`: the outbound `Transport` seam
//!
//! # Example
//!
//! ```rust
//! use lwm2m_engine::{EngineConfig, EngineState, OutboundMessage, Request};
//! use lwm2m_interface::DeviceConfig;
//! use lwm2m_registration::{ExchangeOutcome, ServerSettings};
//! use lwm2m_core::Uri;
//!
//! let mut state = EngineState::new();
//! state
//!     .configure(EngineConfig::new("node-1"), Some(DeviceConfig::new()), None)
//!     .unwrap();
//! state.add_server(ServerSettings::new(1, "coap://server")).unwrap();
//!
//! let actions = state.tick(0);
//! assert!(matches!(actions[0].message, OutboundMessage::Register { ssid: 1, .. }));
//! state.complete(&actions[0], ExchangeOutcome::Success, 0);
//!
//! let lifetime = state.dispatch(Some(1), &Request::read(Uri::resource(1, 0, 1)), 1);
//! assert_eq!(lifetime.value(1).and_then(|v| v.as_u64()), Some(86400));
//! ```

pub mod batcher;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod observe;
pub mod registry;
pub mod state;
pub mod transport;

pub use batcher::NotificationBatcher;
pub use config::EngineConfig;
pub use dispatcher::{dispatch, Request, Response};
pub use engine::Engine;
pub use observe::{NotificationAttributes, Observation, ObservationTable};
pub use registry::{ObjectEntry, ObjectRegistry};
pub use state::{EngineState, ServerAccount};
pub use transport::{OutboundAction, OutboundMessage, Transport};
