//! Registration module for the LwM2M endpoint engine
//!
//! One `RegistrationMachine` drives one server account through bootstrap,
//! registration, update and deregistration.
//!
//! # Registration Lifecycle
//!
//! ```text
//! Initial -> BootstrapRequired -> Bootstrapping -> BootstrapFinished --+
//!                                      |                               |
//!                                      v                               |
//!                               BootstrapFailed                        |
//!                                                                      v
//! Unregistered -> RegisterRequired -> Registering -> Registered -> Ready
//!                        ^                 |              ^          |
//!                        |                 v              |          v
//!                        +------ (retry) RegisterFailed   +------ Updating
//! ```
//!
//! # Example
//!
//! ```rust
//! use lwm2m_registration::{ActionKind, RegistrationMachine, RegistrationState, ServerSettings};
//!
//! let settings = ServerSettings::new(1, "coap://server.example:5683");
//! let mut machine = RegistrationMachine::new(settings.short_server_id);
//! let mut events = Vec::new();
//! let action = machine.poll(0, &settings, &mut events);
//! assert_eq!(action, Some(ActionKind::Register));
//! assert_eq!(machine.state(), RegistrationState::Registering);
//! ```

pub mod state;
pub mod policy;
pub mod account;
pub mod machine;

pub use state::RegistrationState;
pub use policy::{backoff, RetryCounters, RetryDecision, RetryPolicy, MAX_BACKOFF_EXPONENT};
pub use account::{SecurityMode, ServerSettings};
pub use machine::{ActionKind, ExchangeOutcome, RegistrationMachine, Tuning};
