//! Engine events
//!
//! Events are notifications about registration state transitions,
//! observation lifecycle and object model changes. One event is emitted
//! per transition.

use crate::uri::{InstanceId, ObjectId, ShortServerId, Uri};

/// An event emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Bootstrap exchange started on behalf of a server account
    BootstrapStarted { server: ShortServerId },

    /// Bootstrap finished; the account will register again
    BootstrapFinished { server: ShortServerId },

    /// Bootstrap failed
    BootstrapFailed { server: ShortServerId },

    /// Registration exchange started
    Registering { server: ShortServerId },

    /// Registration (or update) acknowledged by the server
    Registered { server: ShortServerId },

    /// Update exchange started
    Updating { server: ShortServerId },

    /// Update retries exhausted; the account falls back to registering again
    UpdateFailed { server: ShortServerId },

    /// Attempt and sequence budgets exhausted
    RegistrationFailed { server: ShortServerId },

    /// Registration removed (deregistration, connection loss, lifetime expiry)
    Deregistered { server: ShortServerId },

    /// Remote server started observing a path
    ObservationStarted { server: ShortServerId, uri: Uri },

    /// Observation canceled by the server or by instance removal
    ObservationCanceled { server: ShortServerId, uri: Uri },

    /// Object instance created
    InstanceCreated { object: ObjectId, instance: InstanceId },

    /// Object instance deleted
    InstanceDeleted { object: ObjectId, instance: InstanceId },

    /// Notification attributes (pmin/pmax) changed for an observed path
    EvaluationPeriodChanged {
        server: ShortServerId,
        uri: Uri,
        pmin: Option<u64>,
        pmax: Option<u64>,
    },

    /// Reboot requested through the Device object
    RebootRequested,

    /// Factory reset requested through the Device object
    FactoryResetRequested,
}

impl Event {
    /// Short server id the event concerns, if any
    pub fn server(&self) -> Option<ShortServerId> {
        match self {
            Self::BootstrapStarted { server }
            | Self::BootstrapFinished { server }
            | Self::BootstrapFailed { server }
            | Self::Registering { server }
            | Self::Registered { server }
            | Self::Updating { server }
            | Self::UpdateFailed { server }
            | Self::RegistrationFailed { server }
            | Self::Deregistered { server }
            | Self::ObservationStarted { server, .. }
            | Self::ObservationCanceled { server, .. }
            | Self::EvaluationPeriodChanged { server, .. } => Some(*server),
            Self::InstanceCreated { .. }
            | Self::InstanceDeleted { .. }
            | Self::RebootRequested
            | Self::FactoryResetRequested => None,
        }
    }

    /// Check if the event reports a registration failure
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::BootstrapFailed { .. } | Self::UpdateFailed { .. } | Self::RegistrationFailed { .. }
        )
    }

    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            Self::BootstrapStarted { server } => format!("Bootstrap started for server {}", server),
            Self::BootstrapFinished { server } => format!("Bootstrap finished for server {}", server),
            Self::BootstrapFailed { server } => format!("Bootstrap failed for server {}", server),
            Self::Registering { server } => format!("Registering with server {}", server),
            Self::Registered { server } => format!("Registered with server {}", server),
            Self::Updating { server } => format!("Updating registration with server {}", server),
            Self::UpdateFailed { server } => format!("Registration update failed for server {}", server),
            Self::RegistrationFailed { server } => format!("Registration failed for server {}", server),
            Self::Deregistered { server } => format!("Deregistered from server {}", server),
            Self::ObservationStarted { server, uri } => {
                format!("Server {} started observing {}", server, uri)
            }
            Self::ObservationCanceled { server, uri } => {
                format!("Observation of {} by server {} canceled", uri, server)
            }
            Self::InstanceCreated { object, instance } => {
                format!("Instance /{}/{} created", object, instance)
            }
            Self::InstanceDeleted { object, instance } => {
                format!("Instance /{}/{} deleted", object, instance)
            }
            Self::EvaluationPeriodChanged { server, uri, pmin, pmax } => format!(
                "Evaluation period of {} for server {} changed (pmin={:?}, pmax={:?})",
                uri, server, pmin, pmax
            ),
            Self::RebootRequested => "Reboot requested".to_string(),
            Self::FactoryResetRequested => "Factory reset requested".to_string(),
        }
    }
}

/// Event listener for engine events
///
/// Listeners run while the engine lock is held and must not call back
/// into the engine.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Callback-based event listener
pub struct CallbackEventListener<F>
where
    F: Fn(&Event) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackEventListener<F>
where
    F: Fn(&Event) + Send + Sync,
{
    #[must_use]
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> EventListener for CallbackEventListener<F>
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        (self.callback)(event);
    }
}
