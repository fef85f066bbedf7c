//! Server account settings
//!
//! `ServerSettings` is the configuration half of a server account: what the
//! Server object exposes as resources plus the connection parameters the
//! transport needs (URI, security mode). The runtime half is the
//! `RegistrationMachine`.

use lwm2m_core::{Lwm2mError, Lwm2mResult, ShortServerId, ID_INVALID};
use serde::{Deserialize, Serialize};

use crate::policy::RetryPolicy;

/// Default registration lifetime, in seconds
pub const DEFAULT_LIFETIME: u64 = 86400;

/// Default disable timeout, in seconds
pub const DEFAULT_DISABLE_TIMEOUT: u64 = 86400;

/// Security mode of the connection to a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SecurityMode {
    PreSharedKey = 0,
    RawPublicKey = 1,
    Certificate = 2,
    #[default]
    NoSec = 3,
    CertificateWithEst = 4,
}

impl SecurityMode {
    pub fn from_value(value: u8) -> Lwm2mResult<Self> {
        match value {
            0 => Ok(Self::PreSharedKey),
            1 => Ok(Self::RawPublicKey),
            2 => Ok(Self::Certificate),
            3 => Ok(Self::NoSec),
            4 => Ok(Self::CertificateWithEst),
            _ => Err(Lwm2mError::BadRequest(format!("Invalid security mode: {}", value))),
        }
    }

    pub fn value(&self) -> u8 {
        *self as u8
    }
}

/// Configuration of one server account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub short_server_id: ShortServerId,
    pub uri: String,
    pub security_mode: SecurityMode,
    /// Registration lifetime in seconds
    pub lifetime: u64,
    pub default_min_period: Option<u64>,
    pub default_max_period: Option<u64>,
    pub disable_timeout: u64,
    pub notification_storing: bool,
    /// Binding mode letters, e.g. "U" or "UQ"
    pub binding: String,
    /// Lower values register first; `None` registers after all ordered servers
    pub priority_order: Option<u32>,
    /// Delay before the first registration attempt, in seconds
    pub initial_delay: u64,
    /// Whether a final failure halts registration with lower-priority servers
    pub block_on_failure: bool,
    /// Whether a final failure falls back to bootstrapping
    pub bootstrap_on_failure: bool,
    /// Bootstrap before the first registration attempt
    #[serde(default)]
    pub bootstrap_first: bool,
    pub retry: RetryPolicy,
}

impl ServerSettings {
    /// Create settings with LwM2M defaults for the given short server id and URI
    pub fn new(short_server_id: ShortServerId, uri: impl Into<String>) -> Self {
        Self {
            short_server_id,
            uri: uri.into(),
            security_mode: SecurityMode::default(),
            lifetime: DEFAULT_LIFETIME,
            default_min_period: None,
            default_max_period: None,
            disable_timeout: DEFAULT_DISABLE_TIMEOUT,
            notification_storing: true,
            binding: "U".to_string(),
            priority_order: None,
            initial_delay: 0,
            block_on_failure: false,
            bootstrap_on_failure: false,
            bootstrap_first: false,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_lifetime(mut self, lifetime: u64) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_binding(mut self, binding: impl Into<String>) -> Self {
        self.binding = binding.into();
        self
    }

    pub fn with_security_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = mode;
        self
    }

    pub fn with_priority_order(mut self, order: u32) -> Self {
        self.priority_order = Some(order);
        self
    }

    pub fn with_initial_delay(mut self, delay: u64) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_block_on_failure(mut self, block: bool) -> Self {
        self.block_on_failure = block;
        self
    }

    pub fn with_bootstrap_on_failure(mut self, bootstrap: bool) -> Self {
        self.bootstrap_on_failure = bootstrap;
        self
    }

    pub fn with_bootstrap_first(mut self, bootstrap: bool) -> Self {
        self.bootstrap_first = bootstrap;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Whether the binding requests queue mode
    pub fn queue_mode(&self) -> bool {
        self.binding.contains('Q')
    }

    /// Check the settings before they are stored
    pub fn validate(&self) -> Lwm2mResult<()> {
        if self.short_server_id == 0 || self.short_server_id == ID_INVALID {
            return Err(Lwm2mError::BadRequest(format!(
                "Short server id must be between 1 and 65534, got {}",
                self.short_server_id
            )));
        }
        if self.lifetime == 0 {
            return Err(Lwm2mError::bad_request("Lifetime must be positive"));
        }
        validate_binding(&self.binding)?;
        if let (Some(pmin), Some(pmax)) = (self.default_min_period, self.default_max_period) {
            if pmax < pmin {
                return Err(Lwm2mError::BadRequest(format!(
                    "Default max period {} is below default min period {}",
                    pmax, pmin
                )));
            }
        }
        Ok(())
    }
}

/// Check that a binding string only uses known transport letters
pub fn validate_binding(binding: &str) -> Lwm2mResult<()> {
    if binding.is_empty() || !binding.chars().all(|c| "UQSNT".contains(c)) {
        return Err(Lwm2mError::BadRequest(format!("Invalid binding: {:?}", binding)));
    }
    Ok(())
}
