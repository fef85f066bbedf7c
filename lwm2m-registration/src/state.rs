//! Registration states of a server account

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Registration state of one server account
///
/// `Registered` and `Ready` are the steady states. `Registered` is entered
/// whenever the server acknowledges a Register or Update; the next poll
/// settles it into `Ready` once the following update deadline is armed.
///
/// # State Descriptions
///
/// - **Initial**: account just added, nothing scheduled yet
/// - **BootstrapRequired**: waiting for the bootstrap deadline
/// - **Bootstrapping**: bootstrap exchange in flight
/// - **BootstrapFailed**: bootstrap budget exhausted (terminal until restarted)
/// - **BootstrapFinished**: provisioning complete, registration follows
/// - **Unregistered**: no registration; re-registration is scheduled on poll
/// - **RegisterRequired**: waiting for the next registration attempt deadline
/// - **Registering**: Register exchange in flight
/// - **RegisterFailed**: attempt and sequence budgets exhausted (terminal until restarted)
/// - **Registered**: registration acknowledged
/// - **Updating**: Update exchange in flight
/// - **Ready**: registered and idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RegistrationState {
    #[default]
    Initial,
    BootstrapRequired,
    Bootstrapping,
    BootstrapFailed,
    BootstrapFinished,
    Unregistered,
    RegisterRequired,
    Registering,
    RegisterFailed,
    Registered,
    Updating,
    Ready,
}

impl RegistrationState {
    /// Check if a registration currently exists at the server
    ///
    /// An in-flight update keeps the registration alive.
    #[must_use]
    pub const fn is_registered(&self) -> bool {
        matches!(self, Self::Registered | Self::Updating | Self::Ready)
    }

    /// Check if the account is in a steady state
    #[must_use]
    pub const fn is_steady(&self) -> bool {
        matches!(self, Self::Registered | Self::Ready)
    }

    /// Check if an exchange is in flight
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Bootstrapping | Self::Registering | Self::Updating)
    }

    /// Check if the account gave up and waits for an explicit restart
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::BootstrapFailed | Self::RegisterFailed)
    }

    /// Check if the account is in the bootstrap phase
    #[must_use]
    pub const fn is_bootstrap(&self) -> bool {
        matches!(
            self,
            Self::BootstrapRequired | Self::Bootstrapping | Self::BootstrapFinished
        )
    }
}

impl Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "Initial",
            Self::BootstrapRequired => "BootstrapRequired",
            Self::Bootstrapping => "Bootstrapping",
            Self::BootstrapFailed => "BootstrapFailed",
            Self::BootstrapFinished => "BootstrapFinished",
            Self::Unregistered => "Unregistered",
            Self::RegisterRequired => "RegisterRequired",
            Self::Registering => "Registering",
            Self::RegisterFailed => "RegisterFailed",
            Self::Registered => "Registered",
            Self::Updating => "Updating",
            Self::Ready => "Ready",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(!RegistrationState::Initial.is_registered());
        assert!(RegistrationState::Updating.is_registered());
        assert!(!RegistrationState::Updating.is_steady());
        assert!(RegistrationState::Ready.is_steady());
        assert!(RegistrationState::Registering.is_pending());
        assert!(RegistrationState::RegisterFailed.is_failed());
        assert!(RegistrationState::Bootstrapping.is_bootstrap());
    }

    #[test]
    fn test_display_state() {
        assert_eq!(RegistrationState::Initial.to_string(), "Initial");
        assert_eq!(RegistrationState::RegisterRequired.to_string(), "RegisterRequired");
        assert_eq!(RegistrationState::Ready.to_string(), "Ready");
    }
}
